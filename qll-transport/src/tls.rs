//! TLS configuration loading from PEM files.
//!
//! Two independent configs exist per node: server TLS wraps connections the
//! node accepts, peer TLS wraps Raft connections the node dials.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use qll_core::{QuillError, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::RootCertStore;
use tokio::net::TcpStream;

use crate::stream::NodeStream;

/// Certificate material on disk, PEM encoded.
#[derive(Debug, Clone, Default)]
pub struct TlsFiles {
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    /// SNI name used when dialing. Defaults to the host part of the dialed
    /// address.
    pub server_name: Option<String>,
}

impl TlsFiles {
    pub fn is_configured(&self) -> bool {
        self.cert_file.is_some() || self.ca_file.is_some()
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| QuillError::Config(format!("open cert file {}: {e}", path.display())))?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::io::Result<_>>()
        .map_err(|e| QuillError::Config(format!("parse certs in {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(QuillError::Config(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| QuillError::Config(format!("open key file {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| QuillError::Config(format!("parse key in {}: {e}", path.display())))?
        .ok_or_else(|| QuillError::Config(format!("no private key found in {}", path.display())))
}

/// Server-side TLS: wraps accepted connections.
#[derive(Clone)]
pub struct ServerTls {
    acceptor: tokio_rustls::TlsAcceptor,
}

impl ServerTls {
    pub fn from_files(files: &TlsFiles) -> Result<Self> {
        let cert_file = files
            .cert_file
            .as_ref()
            .ok_or_else(|| QuillError::Config("server TLS requires a certificate file".into()))?;
        let key_file = files
            .key_file
            .as_ref()
            .ok_or_else(|| QuillError::Config("server TLS requires a key file".into()))?;

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(load_certs(cert_file)?, load_key(key_file)?)
            .map_err(|e| QuillError::Config(format!("build server TLS config: {e}")))?;

        Ok(Self {
            acceptor: tokio_rustls::TlsAcceptor::from(Arc::new(config)),
        })
    }

    pub async fn accept(&self, stream: TcpStream) -> Result<NodeStream> {
        let tls = self
            .acceptor
            .accept(stream)
            .await
            .map_err(|e| QuillError::Protocol(format!("TLS accept: {e}")))?;
        Ok(NodeStream::TlsServer(Box::new(tls)))
    }
}

/// Peer-side TLS: wraps dialed Raft connections.
#[derive(Clone)]
pub struct PeerTls {
    connector: tokio_rustls::TlsConnector,
    server_name: Option<String>,
}

impl PeerTls {
    pub fn from_files(files: &TlsFiles) -> Result<Self> {
        let ca_file = files
            .ca_file
            .as_ref()
            .ok_or_else(|| QuillError::Config("peer TLS requires a CA file".into()))?;

        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_file)? {
            roots
                .add(cert)
                .map_err(|e| QuillError::Config(format!("add CA cert: {e}")))?;
        }

        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            connector: tokio_rustls::TlsConnector::from(Arc::new(config)),
            server_name: files.server_name.clone(),
        })
    }

    pub async fn connect(&self, host: &str, stream: TcpStream) -> Result<NodeStream> {
        let name = self.server_name.as_deref().unwrap_or(host);
        let server_name = ServerName::try_from(name.to_string())
            .map_err(|e| QuillError::Config(format!("invalid TLS server name {name}: {e}")))?;

        let tls = self
            .connector
            .connect(server_name, stream)
            .await
            .map_err(|e| QuillError::Protocol(format!("TLS connect: {e}")))?;
        Ok(NodeStream::TlsClient(Box::new(tls)))
    }
}
