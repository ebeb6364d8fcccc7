//! Gossip-based peer discovery.
//!
//! Every node publishes `{node_name, bind_addr, tags{rpc_addr}}` and learns
//! about the rest of the cluster by periodically exchanging its member
//! table with a few random peers over UDP. Join, leave and failure events
//! are delivered on a single channel; one consumer task drives the
//! registered handler (the replicated log) with them.

mod gossip;
mod membership;

pub use gossip::{MemberInfo, MemberStatus};
pub use membership::{Member, MemberEvent, Membership, MembershipConfig, MembershipHandler};
