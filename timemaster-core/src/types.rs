//! # Core Types
//!
//! Fundamental types shared by every participant of a timemaster fleet.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque identity of a participant.
///
/// Stable for the lifetime of the participant process and unique across the
/// fleet. The identity is written into the active-heartbeat record, so it must
/// not contain the payload delimiter (see [`crate::codec`]).
///
/// # Examples
///
/// ```rust
/// use timemaster_core::MasterId;
///
/// let id = MasterId::new("tm-1");
/// assert_eq!(id.as_str(), "tm-1");
/// assert_ne!(MasterId::generate(), MasterId::generate());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MasterId(String);

impl MasterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates a new random identity.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MasterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MasterId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for MasterId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Payload of the active-heartbeat and listeners nodes.
///
/// While one `master_id` owns the active-heartbeat node, the timestamps it
/// writes are non-decreasing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveRecord {
    pub master_id: MasterId,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl ActiveRecord {
    pub fn new(master_id: MasterId, timestamp: i64) -> Self {
        Self {
            master_id,
            timestamp,
        }
    }

    pub fn is_owned_by(&self, id: &MasterId) -> bool {
        self.master_id == *id
    }
}

impl fmt::Display for ActiveRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.master_id, self.timestamp)
    }
}

/// Role held by a participant.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ElectionRole {
    /// Not yet part of the election
    #[default]
    Unbound,

    /// This participant owns the active-heartbeat node
    Active,

    /// Another participant owns the active-heartbeat node
    Standby {
        /// Owner observed in the record, when known
        active: Option<MasterId>,
    },
}

impl ElectionRole {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    pub fn is_standby(&self) -> bool {
        matches!(self, Self::Standby { .. })
    }
}

/// Externally visible lifecycle phase of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElectionPhase {
    Unbound,
    Competing,
    Active,
    Standby,
    Stopped,
}

impl fmt::Display for ElectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElectionPhase::Unbound => "UNBOUND",
            ElectionPhase::Competing => "COMPETING",
            ElectionPhase::Active => "ACTIVE",
            ElectionPhase::Standby => "STANDBY",
            ElectionPhase::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// The three shared coordination nodes the protocol touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    ActiveHeartbeat,
    Listeners,
    NotificationFlag,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeKind::ActiveHeartbeat => "active-heartbeat",
            NodeKind::Listeners => "listeners",
            NodeKind::NotificationFlag => "notification-flag",
        };
        f.write_str(name)
    }
}

/// Correlates an issued coordination operation with its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId(pub u64);

impl OpId {
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_ownership() {
        let record = ActiveRecord::new(MasterId::new("m1"), 1000);
        assert!(record.is_owned_by(&MasterId::new("m1")));
        assert!(!record.is_owned_by(&MasterId::new("m2")));
        assert_eq!(record.to_string(), "(m1, 1000)");
    }

    #[test]
    fn test_role_predicates() {
        assert!(ElectionRole::Active.is_active());
        assert!(ElectionRole::Standby { active: None }.is_standby());
        assert!(!ElectionRole::default().is_active());
        assert!(!ElectionRole::default().is_standby());
    }

    #[test]
    fn test_op_id_sequence() {
        let first = OpId(1);
        assert_eq!(first.next().value(), 2);
        assert!(first.next() > first);
    }
}
