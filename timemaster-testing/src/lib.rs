//! # Timemaster Testing
//!
//! Simulation tools for exercising elections end to end: a fleet of
//! participants over the in-memory coordinator, a simulated time source with
//! injectable skew, delay and outage, and crash/stall fault injection.
//!
//! Everything runs on tokio time, so tests use `#[tokio::test(start_paused = true)]`
//! and cover minutes of protocol time in milliseconds.

pub mod clock;
pub mod fleet;

pub use clock::SimClock;
pub use fleet::{FleetHarness, Participant};
