//! Inputs of the election event loop and the request contexts of issued
//! coordination operations.

use std::fmt;
use timemaster_core::{ActiveRecord, NodeKind, OpId, OpOutcome};

/// Everything the orchestrator reacts to, funnelled through one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionEvent {
    /// Session with the coordination service established
    Connected,
    /// Session lost; fatal
    Disconnected { reason: String },
    NodeCreated(NodeKind),
    NodeDeleted(NodeKind),
    NodeDataChanged(NodeKind),
    /// Completion of an operation issued through the channel
    OpResult { op_id: OpId, outcome: OpOutcome },
    /// A timer armed by the orchestrator fired
    Timer { kind: TimerKind, generation: u64 },
    /// Stop participating and release held nodes
    Shutdown,
}

/// Timers the orchestrator arms. At most one of each kind is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Pause between control-loop cycles
    Cycle,
    /// Bounded wait behind a flag held by someone else
    BlockedWait,
    /// Randomized delay before contending for the flag
    Settle,
    /// Flag winner's pause before replacing the active node
    Grace,
    /// Flag loser's bounded wait for the flag to go away
    ContenderWait,
}

/// Why [`ElectionOrchestrator::run`](crate::ElectionOrchestrator::run) returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Requested through the handle
    Shutdown,
    /// The coordination session is gone
    ConnectionLost { reason: String },
    /// The active could not keep its heartbeat or lost its node; a fresh
    /// process has to re-enter the election
    Demoted { reason: String },
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Shutdown => f.write_str("shutdown requested"),
            StopReason::ConnectionLost { reason } => write!(f, "connection lost: {reason}"),
            StopReason::Demoted { reason } => write!(f, "demoted: {reason}"),
        }
    }
}

/// Why the active-heartbeat node is being created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreatePurpose {
    /// First attempt right after connecting
    Bootstrap,
    /// Replacement during failover
    Recreate,
}

/// Why the active-heartbeat node is being read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveRead {
    /// The active checks it still owns the node before writing
    Verify,
    /// A standby learns which participant it is bound to
    BindOwner,
    /// The flag winner checks the node is stale before removing it
    Inspect,
}

/// Why the listeners node is being read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenersRead {
    /// A standby picks up the timestamp the active just echoed
    Refresh,
    /// A standby confirms the active is late before accusing it
    CrossCheck,
}

/// Why a record is being echoed to the listeners node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoPurpose {
    /// Regular per-cycle heartbeat
    Heartbeat,
    /// First record of a failover winner, before it releases the flag
    Announce,
}

/// Context of one in-flight coordination operation, keyed by [`OpId`].
///
/// A transient failure re-issues the same context unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingOp {
    CreateActive {
        purpose: CreatePurpose,
        record: ActiveRecord,
    },
    ReadActive(ActiveRead),
    WriteActive {
        record: ActiveRecord,
        expected_version: Option<u64>,
    },
    DeleteActive,
    WriteListeners {
        record: ActiveRecord,
        purpose: EchoPurpose,
    },
    ReadListeners(ListenersRead),
    CreateFlag,
    DeleteFlag,
    /// Existence watch on one of the shared nodes
    Bind(NodeKind),
}

impl PendingOp {
    /// Node the operation targets.
    pub fn node(&self) -> NodeKind {
        match self {
            PendingOp::CreateActive { .. }
            | PendingOp::ReadActive(_)
            | PendingOp::WriteActive { .. }
            | PendingOp::DeleteActive => NodeKind::ActiveHeartbeat,
            PendingOp::WriteListeners { .. } | PendingOp::ReadListeners(_) => NodeKind::Listeners,
            PendingOp::CreateFlag | PendingOp::DeleteFlag => NodeKind::NotificationFlag,
            PendingOp::Bind(kind) => *kind,
        }
    }
}
