//! State owned by the election event loop.
//!
//! Nothing here is shared: the orchestrator holds the only [`ElectionState`]
//! and mutates it from its single task. The helpers encode the timing rules so
//! they can be checked without a running fleet.

use crate::events::TimerKind;
use std::collections::HashMap;
use std::time::Duration;
use timemaster_core::{ElectionPhase, ElectionRole, MasterId};
use tokio::time::Instant;

/// Time accumulated since the last verified heartbeat.
///
/// `Blocked` replaces the negative sentinel: the participant lost the right to
/// contend and waits for the notification flag to go away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CumulativeWait {
    Accumulating(u64),
    Blocked,
}

impl Default for CumulativeWait {
    fn default() -> Self {
        CumulativeWait::Accumulating(0)
    }
}

impl CumulativeWait {
    pub fn reset(&mut self) {
        *self = CumulativeWait::Accumulating(0);
    }

    pub fn accumulate(&mut self, millis: u64) {
        if let CumulativeWait::Accumulating(total) = self {
            *total = total.saturating_add(millis);
        }
    }

    pub fn block(&mut self) {
        *self = CumulativeWait::Blocked;
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, CumulativeWait::Blocked)
    }

    /// Accumulated milliseconds; zero while blocked.
    pub fn elapsed_ms(&self) -> i64 {
        match self {
            CumulativeWait::Accumulating(total) => i64::try_from(*total).unwrap_or(i64::MAX),
            CumulativeWait::Blocked => 0,
        }
    }
}

/// Where the control loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CycleStep {
    /// Not bootstrapped yet, or the listeners node is absent
    #[default]
    Suspended,
    Sleeping,
    /// Waiting behind a flag held by someone else
    Blocked,
    /// Standby that has not seen any heartbeat yet
    AwaitingFirstUpdate,
    VerifyingActive,
    PushingHeartbeat,
    EchoingListeners,
    CrossChecking,
    Stopped,
}

/// Progress of a failover attempt started by a standby.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverStage {
    /// Randomized delay before contending
    Settling,
    /// Flag creation in flight
    Contending,
    /// Flag lost; waiting for the holder to release it
    AwaitingRelease,
    /// Flag won; pausing before touching the active node
    Grace,
    /// Checking the active node is stale, then removing it
    ClearingActive,
    /// Active node creation in flight
    Recreating,
    /// Winner writing its first record to the listeners node
    Announcing,
    /// Winner deleting the flag
    ReleasingFlag,
}

#[derive(Debug, Clone, Default)]
pub struct ElectionState {
    pub role: ElectionRole,
    /// Last heartbeat timestamp verified by this participant
    pub last_update: Option<i64>,
    /// Value of `last_update` at the previous standby check
    pub prev_update: Option<i64>,
    pub cumulative: CumulativeWait,
    /// Skip standby checks; set while a failover round is in progress
    pub ignore_updates: bool,
    /// Set while contending; deletions of the active node are expected
    pub running_election: bool,
    /// The listeners node exists
    pub clock_ticking: bool,
    /// The coordination session is up
    pub connected: bool,
    /// The first creation attempt has completed
    pub bootstrapped: bool,
    pub cycle: CycleStep,
    pub failover: Option<FailoverStage>,
    /// This participant holds the notification flag
    pub flag_held: bool,
    /// Version of the active node seen by the last verifying read
    pub active_version: Option<u64>,
    /// When the active last confirmed a write, on the monotonic clock
    pub confirmed_at: Option<Instant>,
}

impl ElectionState {
    pub fn phase(&self) -> ElectionPhase {
        if self.cycle == CycleStep::Stopped {
            return ElectionPhase::Stopped;
        }
        if self.failover.is_some() {
            return ElectionPhase::Competing;
        }
        match self.role {
            ElectionRole::Unbound if self.connected => ElectionPhase::Competing,
            ElectionRole::Unbound => ElectionPhase::Unbound,
            ElectionRole::Active => ElectionPhase::Active,
            ElectionRole::Standby { .. } => ElectionPhase::Standby,
        }
    }

    pub fn bound_active(&self) -> Option<&MasterId> {
        match &self.role {
            ElectionRole::Standby { active } => active.as_ref(),
            _ => None,
        }
    }

    /// Time since the last known-good heartbeat, as a standby judges it.
    ///
    /// Local deltas win when the timestamp moved since the previous check;
    /// otherwise authoritative time is compared to the last timestamp, falling
    /// back to the (zero) local delta when no authoritative time is at hand.
    pub fn drift(&self, authoritative_now: Option<i64>) -> Option<i64> {
        let last = self.last_update?;
        let prev = self.prev_update.unwrap_or(last);
        if last > prev {
            return Some(last - prev);
        }
        Some(match authoritative_now {
            Some(now) => now - last,
            None => last - prev,
        })
    }

    /// Whether there is still time to contend for the flag.
    ///
    /// `(now - cumulative) - (last + window) < 0`; a participant that has
    /// never seen a heartbeat may always contend.
    pub fn has_failover_budget(&self, now: i64, notification_window_ms: i64) -> bool {
        match self.last_update {
            Some(last) => {
                (now - self.cumulative.elapsed_ms()) - last.saturating_add(notification_window_ms)
                    < 0
            }
            None => true,
        }
    }

    /// Clears a block on the flag and nudges the local clock so the next
    /// comparison does not read the unchanged timestamp as staleness.
    pub fn release_block(&mut self) {
        self.cumulative.reset();
        self.ignore_updates = false;
        self.prev_update = self.last_update;
        self.last_update = self.last_update.map(|last| last + 1);
    }

    /// Bookkeeping shared by every completed creation of the active node,
    /// whatever its outcome.
    pub fn prepare_role_derivation(&mut self) {
        self.prev_update = self.last_update;
        if self.ignore_updates {
            self.last_update = self.last_update.map(|last| last + 1);
            self.cumulative.reset();
        }
        self.ignore_updates = false;
        self.running_election = false;
    }

    /// Marks a write of the active node as confirmed at `at`.
    pub fn confirm_write(&mut self, timestamp: i64, at: Instant) {
        self.record_heartbeat(timestamp);
        self.confirmed_at = Some(at);
    }

    /// Time since the active's last confirmed write. Record timestamps do not
    /// enter into it: they are clamped and may come from different clocks.
    pub fn active_lag(&self, now: Instant) -> Duration {
        self.confirmed_at
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or_default()
    }

    /// A heartbeat confirmed by this participant.
    pub fn record_heartbeat(&mut self, timestamp: i64) {
        self.cumulative.reset();
        self.last_update = Some(timestamp);
        if self.prev_update.is_none() {
            self.prev_update = Some(timestamp);
        }
    }
}

/// Generation counters for the timers; a fired timer whose generation is not
/// the armed one is stale and ignored.
#[derive(Debug, Default)]
pub struct TimerGenerations {
    next: u64,
    armed: HashMap<TimerKind, u64>,
}

impl TimerGenerations {
    pub fn arm(&mut self, kind: TimerKind) -> u64 {
        self.next += 1;
        self.armed.insert(kind, self.next);
        self.next
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        self.armed.remove(&kind);
    }

    pub fn cancel_all(&mut self) {
        self.armed.clear();
    }

    /// Consumes the timer if `generation` is the armed one.
    pub fn fire(&mut self, kind: TimerKind, generation: u64) -> bool {
        if self.armed.get(&kind) == Some(&generation) {
            self.armed.remove(&kind);
            true
        } else {
            false
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }
}
