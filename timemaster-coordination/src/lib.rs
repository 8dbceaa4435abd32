//! # Timemaster Coordination
//!
//! In-memory implementation of the coordination service the election runs
//! on: a consistent node tree with ephemeral nodes, versioned writes and
//! one-shot existence watches, plus per-session fault injection.
//!
//! ## Features
//!
//! - **Ephemeral Nodes**: reclaimed when the creating session ends
//! - **Versioned Writes**: conditional writes rejected with `BadVersion`
//! - **One-shot Watches**: fired on the next create, delete or data change
//! - **Session Expiry**: simulates a lost session, as seen by everyone
//! - **Fault Injection**: queued `Timeout`/`AuthFailed` outcomes and latency
//!
//! ## Example
//!
//! ```rust
//! use bytes::Bytes;
//! use timemaster_coordination::MemoryCoordinator;
//! use timemaster_core::{CoordinationService, OpOutcome};
//!
//! # tokio_test::block_on(async {
//! let coordinator = MemoryCoordinator::new();
//! let (first, _events) = coordinator.connect("m1");
//! let (second, _events) = coordinator.connect("m2");
//!
//! let payload = Bytes::from("m1;1000");
//! assert_eq!(first.create_ephemeral("/active", payload.clone()).await, OpOutcome::Created);
//! assert_eq!(second.create_ephemeral("/active", payload).await, OpOutcome::AlreadyExists);
//!
//! // Ending the owner's session reclaims its ephemeral node.
//! coordinator.expire_session(first.id());
//! assert_eq!(second.read("/active").await, OpOutcome::NoNode);
//! # });
//! ```

pub mod session;
pub mod store;
mod watches;

pub use session::MemorySession;
pub use store::{CoordinatorConfig, CoordinatorStats, MemoryCoordinator, NodeEntry, SessionId};
