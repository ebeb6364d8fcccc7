use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use qll_core::{QuillError, Result};
use qll_transport::TlsFiles;
use serde::{Deserialize, Serialize};

/// Everything one node needs to run, loadable from a TOML file or built
/// from command-line flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Unique node name; doubles as the Raft server id.
    pub node_name: String,
    /// UDP address the gossip layer binds to.
    pub bind_addr: SocketAddr,
    /// TCP port shared by client RPCs and Raft traffic.
    pub rpc_port: u16,
    /// Gossip addresses of existing members to join through.
    #[serde(default)]
    pub start_point_addrs: Vec<String>,
    /// Seed a fresh single-node cluster. Only the first node sets this.
    #[serde(default)]
    pub bootstrap: bool,
    #[serde(default)]
    pub server_tls: TlsSettings,
    #[serde(default)]
    pub peer_tls: TlsSettings,
    /// Segment store bound; 0 means the storage default.
    #[serde(default)]
    pub max_store_bytes: u64,
    /// Segment index bound; 0 means the storage default.
    #[serde(default)]
    pub max_index_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsSettings {
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    pub server_name: Option<String>,
}

impl TlsSettings {
    pub fn to_files(&self) -> Option<TlsFiles> {
        if self.cert_file.is_none() && self.ca_file.is_none() {
            return None;
        }
        Some(TlsFiles {
            cert_file: self.cert_file.clone(),
            key_file: self.key_file.clone(),
            ca_file: self.ca_file.clone(),
            server_name: self.server_name.clone(),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            node_name: String::from("quill-0"),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8401)),
            rpc_port: 8400,
            start_point_addrs: Vec::new(),
            bootstrap: false,
            server_tls: TlsSettings::default(),
            peer_tls: TlsSettings::default(),
            max_store_bytes: 0,
            max_index_bytes: 0,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| QuillError::Config(format!("parse {}: {e}", path.display())))
    }

    /// The advertised client/Raft address on the shared port.
    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.bind_addr.ip(), self.rpc_port)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_config_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quill.toml");

        let config = Config {
            node_name: "quill-3".into(),
            bootstrap: true,
            start_point_addrs: vec!["10.0.0.1:8401".into()],
            ..Default::default()
        };
        std::fs::write(&path, toml::to_string(&config).unwrap()).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.node_name, "quill-3");
        assert!(loaded.bootstrap);
        assert_eq!(loaded.start_point_addrs, vec!["10.0.0.1:8401".to_string()]);
        assert_eq!(loaded.rpc_addr(), "127.0.0.1:8400");
    }
}
