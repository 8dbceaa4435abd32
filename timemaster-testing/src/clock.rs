//! Simulated authoritative time.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use timemaster_core::{Result, TimeMasterError, TimeSource};
use tokio::time::{sleep, Instant};

#[derive(Debug, Default, Clone, Copy)]
struct ClockFaults {
    skew_ms: i64,
    delay: Duration,
    outage: bool,
}

/// Epoch milliseconds derived from tokio's clock, so paused tests advance it
/// deterministically.
///
/// Clocks forked from one another share the timeline but carry their own
/// faults: a skew added to every reading, a delay before the reading is
/// delivered, and a full outage.
#[derive(Debug, Clone)]
pub struct SimClock {
    epoch: Instant,
    base_millis: i64,
    faults: Arc<RwLock<ClockFaults>>,
}

impl SimClock {
    /// Starts a timeline reading `base_millis` now.
    pub fn new(base_millis: i64) -> Self {
        Self {
            epoch: Instant::now(),
            base_millis,
            faults: Arc::new(RwLock::new(ClockFaults::default())),
        }
    }

    /// Same timeline, independent faults.
    pub fn fork(&self) -> Self {
        Self {
            epoch: self.epoch,
            base_millis: self.base_millis,
            faults: Arc::new(RwLock::new(ClockFaults::default())),
        }
    }

    /// Fault-free reading of the timeline.
    pub fn now(&self) -> i64 {
        let elapsed = i64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.base_millis.saturating_add(elapsed)
    }

    pub fn set_skew(&self, skew_ms: i64) {
        self.faults.write().skew_ms = skew_ms;
    }

    /// Readings are taken on request but delivered `delay` later.
    pub fn set_delay(&self, delay: Duration) {
        self.faults.write().delay = delay;
    }

    pub fn set_outage(&self, outage: bool) {
        self.faults.write().outage = outage;
    }

    pub fn clear_faults(&self) {
        *self.faults.write() = ClockFaults::default();
    }
}

#[async_trait]
impl TimeSource for SimClock {
    async fn now_millis(&self) -> Result<i64> {
        let faults = *self.faults.read();
        if faults.outage {
            return Err(TimeMasterError::time_source("simulated time source outage"));
        }

        let reading = self.now() + faults.skew_ms;
        if !faults.delay.is_zero() {
            sleep(faults.delay).await;
        }
        Ok(reading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_clock_follows_tokio_time() {
        let clock = SimClock::new(1000);
        assert_eq!(clock.now_millis().await.unwrap(), 1000);

        sleep(Duration::from_millis(500)).await;
        assert_eq!(clock.now_millis().await.unwrap(), 1500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_faults_are_per_fork() {
        let timeline = SimClock::new(1000);
        let lagging = timeline.fork();
        lagging.set_skew(-300);
        lagging.set_delay(Duration::from_millis(200));

        let started = Instant::now();
        assert_eq!(lagging.now_millis().await.unwrap(), 700);
        assert_eq!(started.elapsed(), Duration::from_millis(200));
        assert_eq!(timeline.now_millis().await.unwrap(), 1200);

        lagging.set_outage(true);
        assert!(lagging.now_millis().await.is_err());
        lagging.clear_faults();
        assert_eq!(lagging.now_millis().await.unwrap(), 1200);
    }
}
