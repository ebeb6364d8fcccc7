//! Node transport: one TCP listener per node, multiplexing Raft peer
//! traffic and client RPC traffic by a one-byte connection prefix, with
//! optional TLS per direction.

mod mux;
mod stream;
mod tls;

pub use mux::{StreamTransport, RAFT_MARKER};
pub use stream::NodeStream;
pub use tls::{PeerTls, ServerTls, TlsFiles};
