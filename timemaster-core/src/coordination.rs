use async_trait::async_trait;
use bytes::Bytes;

/// Result of one coordination operation.
///
/// Every variant is an ordinary protocol input: losing a creation race, a
/// rejected versioned write and a timeout are all expected during failover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpOutcome {
    /// Node created by this session
    Created,
    /// Node already present; creation lost the race
    AlreadyExists,
    /// Node removed
    Deleted,
    /// Node does not exist
    NoNode,
    /// Node content together with its version
    Data { payload: Bytes, version: u64 },
    /// Write accepted; carries the new version
    Written { version: u64 },
    /// Conditional write rejected because the node changed since it was read
    BadVersion,
    /// Existence watch registered; carries whether the node exists right now
    Exists(bool),
    /// Session lost; fatal for this participant
    ConnectionLost,
    Timeout,
    AuthFailed,
}

impl OpOutcome {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConnectionLost)
    }

    /// Failures that are retried with the same intent.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::AuthFailed)
    }
}

/// Session and watch notifications delivered by the coordination service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinationEvent {
    Connected,
    Disconnected { reason: String },
    NodeCreated { path: String },
    NodeDeleted { path: String },
    NodeDataChanged { path: String },
}

/// Client side of a consistent, hierarchical store with ephemeral nodes,
/// versioned writes and one-shot change notifications.
///
/// Implementations deliver [`CoordinationEvent`]s on a channel handed out when
/// the session is opened; the operations here only report their own outcome.
#[async_trait]
pub trait CoordinationService: Send + Sync + 'static {
    /// Creates an ephemeral node owned by this session.
    async fn create_ephemeral(&self, path: &str, payload: Bytes) -> OpOutcome;

    async fn delete(&self, path: &str) -> OpOutcome;

    async fn read(&self, path: &str) -> OpOutcome;

    /// Replaces the payload. With `expected_version`, the write is rejected
    /// with [`OpOutcome::BadVersion`] if the node moved on.
    async fn write(&self, path: &str, payload: Bytes, expected_version: Option<u64>) -> OpOutcome;

    /// Registers a one-shot watch fired on the next create, delete or data
    /// change of `path`.
    async fn watch_existence(&self, path: &str) -> OpOutcome;

    /// Ends the session; ephemeral nodes it owns are reclaimed.
    async fn close(&self);
}
