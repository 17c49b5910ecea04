//! Error types for the peer transport.

use crate::types::Id;
use thiserror::Error;

/// Errors raised while posting to a peer.
///
/// Most are transient: counted, reported to Raft as unreachable, and never
/// propagated past the sender. `ClusterIdMismatch` and `MemberRemoved` are
/// fatal for this transport and travel over the hub's error channel so the
/// owning server can shut down.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("cluster ID mismatch posting to {url} (local cluster id {local})")]
    ClusterIdMismatch { local: Id, url: String },

    #[error("this member has been permanently removed from the cluster")]
    MemberRemoved,

    #[error("failed to post to {url}: {reason}")]
    PostFailed { url: String, reason: String },

    #[error("unexpected http status {status} on post to {url}")]
    UnexpectedStatus { status: u16, url: String },

    #[error("redirect from {url} carried no usable Location header")]
    BadRedirect { url: String },
}

impl TransportError {
    /// Whether this error must stop the whole transport.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::ClusterIdMismatch { .. } | TransportError::MemberRemoved
        )
    }
}
