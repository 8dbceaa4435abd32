//! Time sources.
//!
//! The orchestrator asks an authoritative [`TimeSource`] for "now" on every
//! decision and falls back to a local one when the authoritative source is
//! unavailable.

use crate::{Result, TimeMasterError};
use async_trait::async_trait;
use std::time::{SystemTime, UNIX_EPOCH};

/// A best-effort source of milliseconds since the Unix epoch.
#[async_trait]
pub trait TimeSource: Send + Sync + 'static {
    async fn now_millis(&self) -> Result<i64>;
}

/// Host wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl TimeSource for SystemClock {
    async fn now_millis(&self) -> Result<i64> {
        unix_millis()
    }
}

/// Reads the host wall clock.
pub fn unix_millis() -> Result<i64> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| TimeMasterError::time_source(format!("clock before epoch: {e}")))?;
    i64::try_from(elapsed.as_millis())
        .map_err(|_| TimeMasterError::time_source("clock out of range"))
}
