//! Cluster membership: members, removal tombstones, identity derivation and
//! the persistence hook that keeps the durable store in step.

pub mod cluster;
pub mod member;
pub mod store;

pub use cluster::{Cluster, ClusterError};
pub use member::{Attributes, Member, RaftAttributes};
pub use store::{MemStore, Store, StoreError, STORE_VERSION};
