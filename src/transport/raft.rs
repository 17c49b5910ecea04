//! Seam between the transport and the local Raft state machine.

use async_trait::async_trait;
use raft::eraftpb::Message;
use raft::SnapshotStatus;
use thiserror::Error;

/// Errors a [`Raft`] implementation may surface from message processing.
/// The receive handler maps these onto HTTP status codes.
#[derive(Debug, Clone, Error)]
pub enum ProcessError {
    /// The referenced log entries were already compacted away.
    #[error("raft log is already compacted")]
    Compacted,

    /// The offered snapshot is older than the applied state.
    #[error("snapshot is out of date")]
    SnapOutOfDate,

    /// The raft node has been stopped.
    #[error("raft node is stopped")]
    Stopped,

    #[error("{0}")]
    Other(String),
}

/// Capability the owning server hands to the transport.
///
/// Message dispatch plus peer-health feedback; deliberately no back-pointer
/// to the server, so the transport can be owned exclusively by it.
#[async_trait]
pub trait Raft: Send + Sync {
    /// Steps a message received from a peer into the state machine. May
    /// block on Raft's own scheduling queue; callers must not hold
    /// transport locks across it.
    async fn process(&self, msg: Message) -> Result<(), ProcessError>;

    /// Signals that the next message to `id` is unlikely to get through.
    fn report_unreachable(&self, id: u64);

    /// Reports the outcome of a snapshot transfer to `id`.
    fn report_snapshot(&self, id: u64, status: SnapshotStatus);
}
