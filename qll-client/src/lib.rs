//! Client-side service discovery and request routing.
//!
//! A client boots from a single address: the resolver calls `GetServers`
//! there and learns every member plus who leads. The picker then pins
//! produce calls to the leader and round-robins consume calls across
//! followers.

mod client;
mod picker;
mod resolver;

pub use client::{ConsumeStream, LogClient};
pub use picker::Picker;
pub use resolver::{Resolver, ServerInfo};

/// Full method names, in the service/method form the picker partitions on.
pub mod methods {
    pub const PRODUCE: &str = "/log.v1.Log/Produce";
    pub const CONSUME: &str = "/log.v1.Log/Consume";
    pub const CONSUME_STREAM: &str = "/log.v1.Log/ConsumeStream";
    pub const GET_SERVERS: &str = "/log.v1.Log/GetServers";
}
