//! Cluster membership and peer transport core for a Raft-replicated
//! key-value store.
//!
//! The crate covers three concerns:
//! - the in-memory model of cluster membership (members, removal
//!   tombstones, derived identifiers) and its persistence hook,
//! - bootstrap resolution from a static member list, DNS-SRV records or a
//!   discovery-URL rendezvous,
//! - the peer-to-peer HTTP transport carrying raft messages between
//!   members, with per-peer pipelining, URL failover and send statistics.
//!
//! The Raft state machine and the durable store are external
//! collaborators, reached through the [`transport::Raft`] and
//! [`cluster::Store`] traits.

pub mod bootstrap;
pub mod cluster;
pub mod config;
pub mod stats;
pub mod transport;
pub mod types;

pub use bootstrap::{BootstrapError, BootstrapResolver};
pub use cluster::{Cluster, ClusterError, MemStore, Member, Store};
pub use config::{BootstrapConfig, TransportConfig};
pub use stats::{LeaderStats, ServerStats};
pub use transport::{ProcessError, Raft, Transport, TransportError};
pub use types::{Id, Urls};
