//! Gossip packet types.
//!
//! A packet is the sender's whole member table. Receivers merge it entry by
//! entry: higher incarnations win, and at equal incarnation a terminal
//! status (left, failed) beats alive, so a node's own refutation must bump
//! its incarnation.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Alive,
    Left,
    Failed,
}

impl MemberStatus {
    /// Precedence at equal incarnation.
    pub(crate) fn rank(self) -> u8 {
        match self {
            MemberStatus::Alive => 0,
            MemberStatus::Failed => 1,
            MemberStatus::Left => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberInfo {
    pub name: String,
    /// UDP gossip address.
    pub bind_addr: String,
    /// Advertised RPC address, handed to the join handler.
    pub rpc_addr: String,
    pub incarnation: u64,
    pub status: MemberStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipPacket {
    pub from: String,
    pub members: Vec<MemberInfo>,
}

impl GossipPacket {
    pub fn encode(&self) -> Option<Vec<u8>> {
        serde_json::to_vec(self).ok()
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }
}

/// Whether `incoming` should replace `current` for the same member.
pub(crate) fn supersedes(incoming: &MemberInfo, current: &MemberInfo) -> bool {
    incoming.incarnation > current.incarnation
        || (incoming.incarnation == current.incarnation
            && incoming.status.rank() > current.status.rank())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn info(incarnation: u64, status: MemberStatus) -> MemberInfo {
        MemberInfo {
            name: "node-1".into(),
            bind_addr: "127.0.0.1:8400".into(),
            rpc_addr: "127.0.0.1:8401".into(),
            incarnation,
            status,
        }
    }

    #[test]
    fn test_higher_incarnation_wins() {
        assert!(supersedes(
            &info(2, MemberStatus::Alive),
            &info(1, MemberStatus::Left)
        ));
        assert!(!supersedes(
            &info(1, MemberStatus::Left),
            &info(2, MemberStatus::Alive)
        ));
    }

    #[test]
    fn test_terminal_status_wins_at_equal_incarnation() {
        assert!(supersedes(
            &info(1, MemberStatus::Failed),
            &info(1, MemberStatus::Alive)
        ));
        assert!(supersedes(
            &info(1, MemberStatus::Left),
            &info(1, MemberStatus::Failed)
        ));
        assert!(!supersedes(
            &info(1, MemberStatus::Alive),
            &info(1, MemberStatus::Alive)
        ));
    }

    #[test]
    fn test_packet_roundtrip() {
        let packet = GossipPacket {
            from: "node-0".into(),
            members: vec![info(3, MemberStatus::Alive)],
        };
        let encoded = packet.encode().unwrap();
        let decoded = GossipPacket::decode(&encoded).unwrap();
        assert_eq!(decoded.from, "node-0");
        assert_eq!(decoded.members.len(), 1);
        assert_eq!(decoded.members[0].incarnation, 3);
    }
}
