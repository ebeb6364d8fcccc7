//! Quill node: agent wiring, RPC serving and configuration for the
//! distributed commit log.

pub mod agent;
pub mod config;
pub mod server;

pub use agent::Agent;
pub use config::Config;
