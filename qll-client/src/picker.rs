use std::sync::atomic::{AtomicU64, Ordering};

use qll_core::{QuillError, Result};

/// Partitions calls by full method name: anything containing `Produce`
/// goes to the unique leader, everything else round-robins across
/// followers. With no followers, reads round-robin across every ready
/// connection instead.
pub struct Picker<T> {
    leader: Option<T>,
    followers: Vec<T>,
    all: Vec<T>,
    current: AtomicU64,
}

impl<T: Clone> Picker<T> {
    /// Build from `(connection, is_leader)` pairs in server order.
    pub fn new(conns: impl IntoIterator<Item = (T, bool)>) -> Self {
        let mut leader = None;
        let mut followers = Vec::new();
        let mut all = Vec::new();

        for (conn, is_leader) in conns {
            all.push(conn.clone());
            if is_leader {
                leader = Some(conn);
            } else {
                followers.push(conn);
            }
        }

        Self {
            leader,
            followers,
            all,
            current: AtomicU64::new(0),
        }
    }

    pub fn empty() -> Self {
        Self::new(std::iter::empty())
    }

    /// The substring test is deliberate: method names look like
    /// `/log.v1.Log/Produce`, and streaming variants share the stem.
    pub fn pick(&self, method: &str) -> Result<T> {
        if method.contains("Produce") {
            return self.leader.clone().ok_or(QuillError::NoServerAvailable);
        }

        let pool = if self.followers.is_empty() {
            &self.all
        } else {
            &self.followers
        };
        if pool.is_empty() {
            return Err(QuillError::NoServerAvailable);
        }

        // The counter wraps via modulo.
        let next = self.current.fetch_add(1, Ordering::Relaxed);
        Ok(pool[(next % pool.len() as u64) as usize].clone())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn picker() -> Picker<usize> {
        // Sub-connection 0 is the leader.
        Picker::new((0..3).map(|i| (i, i == 0)))
    }

    #[test]
    fn test_produce_pins_to_leader() {
        let picker = picker();
        for _ in 0..5 {
            assert_eq!(picker.pick("/log.v1.Log/Produce").unwrap(), 0);
        }
        // Streaming produce matches the same substring.
        assert_eq!(picker.pick("/log.v1.Log/ProduceStream").unwrap(), 0);
    }

    #[test]
    fn test_consume_round_robins_followers() {
        let picker = picker();
        let picks: Vec<usize> = (0..5)
            .map(|_| picker.pick("/log.v1.Log/Consume").unwrap())
            .collect();
        assert_eq!(picks, vec![1, 2, 1, 2, 1]);
    }

    #[test]
    fn test_no_subconn_available() {
        let picker = Picker::<usize>::empty();
        for method in ["/log.v1.Log/Produce", "/log.v1.Log/Consume"] {
            assert!(matches!(
                picker.pick(method),
                Err(QuillError::NoServerAvailable)
            ));
        }
    }

    #[test]
    fn test_no_followers_falls_back_to_all() {
        let picker = Picker::new([(7usize, true)]);
        assert_eq!(picker.pick("/log.v1.Log/Consume").unwrap(), 7);
        assert_eq!(picker.pick("/log.v1.Log/GetServers").unwrap(), 7);
    }

    #[test]
    fn test_counter_wraps_by_modulo() {
        let picker = picker();
        picker.current.store(u64::MAX - 1, Ordering::Relaxed);
        // (u64::MAX - 1) % 2 == 0 -> follower index 0, then wrap continues
        // cleanly.
        assert_eq!(picker.pick("/log.v1.Log/Consume").unwrap(), 1);
        assert_eq!(picker.pick("/log.v1.Log/Consume").unwrap(), 2);
        assert_eq!(picker.pick("/log.v1.Log/Consume").unwrap(), 1);
    }
}
