//! # Timemaster Election
//!
//! Elects one active participant among several over a coordination service,
//! keeps its heartbeat flowing and replaces it when it stops.
//!
//! This crate provides:
//! - The election event loop (`ElectionOrchestrator`) and its handle
//! - Heartbeat pushing by the active and drift detection by standbys
//! - Failover through the notification flag, with a bounded time budget
//! - Role change notifications for observers
//!
//! Storage and time are pluggable through the `CoordinationService` and
//! `TimeSource` traits of `timemaster-core`.

pub mod channel;
pub mod config;
pub mod events;
pub mod notifications;
pub mod orchestrator;
pub mod state;
pub mod stats;

pub use config::{ElectionConfig, NodePaths, TimingConfig, DEFAULT_NOTIFICATION_FLAG_PATH};
pub use events::{ElectionEvent, StopReason, TimerKind};
pub use notifications::{
    NotificationFilter, NotificationStats, RoleChange, RoleNotification, RoleNotificationBus,
};
pub use orchestrator::{ElectionHandle, ElectionOrchestrator};
pub use stats::ElectionStats;
