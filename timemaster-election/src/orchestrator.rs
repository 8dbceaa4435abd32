//! The election event loop.
//!
//! One task owns the [`ElectionState`] and consumes a single stream of
//! [`ElectionEvent`]s: session notifications, results of operations issued
//! through the [`CoordinationChannel`], and timers it armed itself. Nothing
//! else touches the state, so every decision is taken on a consistent view.

use crate::channel::CoordinationChannel;
use crate::config::ElectionConfig;
use crate::events::{
    ActiveRead, CreatePurpose, EchoPurpose, ElectionEvent, ListenersRead, PendingOp, StopReason,
    TimerKind,
};
use crate::notifications::{RoleChange, RoleNotificationBus};
use crate::state::{CycleStep, ElectionState, FailoverStage, TimerGenerations};
use crate::stats::ElectionStats;
use bytes::Bytes;
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use timemaster_core::codec::{self, FLAG_SENTINEL};
use timemaster_core::{
    ActiveRecord, CoordinationEvent, CoordinationService, ElectionPhase, ElectionRole, MasterId,
    NodeKind, OpId, OpOutcome, Result, SystemClock, TimeMasterError, TimeSource,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Drives one participant through election, heartbeat and failover.
pub struct ElectionOrchestrator {
    config: ElectionConfig,
    state: ElectionState,
    channel: CoordinationChannel,
    session_events: Option<mpsc::UnboundedReceiver<CoordinationEvent>>,
    events_tx: mpsc::UnboundedSender<ElectionEvent>,
    events_rx: mpsc::UnboundedReceiver<ElectionEvent>,
    pending: HashMap<OpId, PendingOp>,
    timers: TimerGenerations,
    time_source: Arc<dyn TimeSource>,
    local_clock: Arc<dyn TimeSource>,
    notifications: Arc<RoleNotificationBus>,
    stats: Arc<RwLock<ElectionStats>>,
    phase_tx: watch::Sender<ElectionPhase>,
    rng: StdRng,
    stop_reason: Option<StopReason>,
}

impl ElectionOrchestrator {
    /// Prepares a participant on an open coordination session.
    ///
    /// `session_events` is the notification stream of that session; its first
    /// `Connected` event starts the election.
    pub fn new(
        config: ElectionConfig,
        service: Arc<dyn CoordinationService>,
        session_events: mpsc::UnboundedReceiver<CoordinationEvent>,
    ) -> Result<Self> {
        config.validate()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let channel = CoordinationChannel::new(service, config.paths.clone(), events_tx.clone());
        let rng = match config.randomization_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let (phase_tx, _) = watch::channel(ElectionPhase::Unbound);

        Ok(Self {
            config,
            state: ElectionState::default(),
            channel,
            session_events: Some(session_events),
            events_tx,
            events_rx,
            pending: HashMap::new(),
            timers: TimerGenerations::default(),
            time_source: Arc::new(SystemClock),
            local_clock: Arc::new(SystemClock),
            notifications: Arc::new(RoleNotificationBus::new()),
            stats: Arc::new(RwLock::new(ElectionStats::default())),
            phase_tx,
            rng,
            stop_reason: None,
        })
    }

    /// Authoritative time source, the local wall clock by default.
    pub fn with_time_source(mut self, time_source: Arc<dyn TimeSource>) -> Self {
        self.time_source = time_source;
        self
    }

    /// Clock used when the authoritative source is unavailable.
    pub fn with_local_clock(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.local_clock = clock;
        self
    }

    /// Publishes role changes on a shared bus instead of a private one.
    pub fn with_notifications(mut self, bus: Arc<RoleNotificationBus>) -> Self {
        self.notifications = bus;
        self
    }

    pub fn master_id(&self) -> &MasterId {
        &self.config.master_id
    }

    pub fn handle(&self) -> ElectionHandle {
        ElectionHandle {
            master_id: self.config.master_id.clone(),
            events: self.events_tx.clone(),
            phase: self.phase_tx.subscribe(),
            stats: Arc::clone(&self.stats),
            notifications: Arc::clone(&self.notifications),
        }
    }

    /// Runs the loop on a new task.
    pub fn spawn(self) -> (ElectionHandle, JoinHandle<Result<StopReason>>) {
        let handle = self.handle();
        (handle, tokio::spawn(self.run()))
    }

    /// Runs until shutdown, loss of the session or self-demotion.
    pub async fn run(mut self) -> Result<StopReason> {
        let session_events = self
            .session_events
            .take()
            .ok_or_else(|| TimeMasterError::internal("election loop already started"))?;
        info!("Starting election participant {}", self.config.master_id);
        let forwarder = self.channel.forward_events(session_events);

        let result = loop {
            let Some(event) = self.events_rx.recv().await else {
                break Err(TimeMasterError::channel_closed("election event channel closed"));
            };
            self.handle_event(event).await;
            self.publish_phase();

            if let Some(reason) = self.stop_reason.take() {
                info!(
                    "Election participant {} stopped: {}",
                    self.config.master_id, reason
                );
                break Ok(reason);
            }
        };

        forwarder.abort();
        result
    }

    /// Single entry point for every input of the loop.
    async fn handle_event(&mut self, event: ElectionEvent) {
        if self.state.cycle == CycleStep::Stopped {
            return;
        }

        match event {
            ElectionEvent::Connected => self.on_connected().await,
            ElectionEvent::Disconnected { reason } => {
                self.stop(StopReason::ConnectionLost { reason }).await
            }
            ElectionEvent::NodeCreated(kind) => self.on_node_created(kind),
            ElectionEvent::NodeDeleted(kind) => self.on_node_deleted(kind).await,
            ElectionEvent::NodeDataChanged(kind) => self.on_node_changed(kind),
            ElectionEvent::OpResult { op_id, outcome } => self.on_op_result(op_id, outcome).await,
            ElectionEvent::Timer { kind, generation } => {
                if self.timers.fire(kind, generation) {
                    self.on_timer(kind).await;
                }
            }
            ElectionEvent::Shutdown => self.stop(StopReason::Shutdown).await,
        }
    }

    // Session and node notifications

    async fn on_connected(&mut self) {
        if self.state.connected {
            debug!("{} reconnected, nothing to do", self.config.master_id);
            return;
        }
        self.state.connected = true;
        info!(
            "{} connected to the coordination service, competing for the active role",
            self.config.master_id
        );

        self.issue(PendingOp::Bind(NodeKind::Listeners));
        let now = self.now_or_local().await;
        let record = ActiveRecord::new(self.config.master_id.clone(), now);
        self.issue(PendingOp::CreateActive {
            purpose: CreatePurpose::Bootstrap,
            record,
        });
    }

    fn on_node_created(&mut self, kind: NodeKind) {
        self.issue(PendingOp::Bind(kind));
        if kind == NodeKind::Listeners {
            self.start_ticking();
        }
    }

    async fn on_node_deleted(&mut self, kind: NodeKind) {
        match kind {
            NodeKind::Listeners => {
                self.issue(PendingOp::Bind(kind));
                self.stop_ticking();
            }
            NodeKind::ActiveHeartbeat => {
                self.issue(PendingOp::Bind(kind));
                if self.state.running_election {
                    debug!(
                        "{} ignoring deletion of the active-heartbeat node during its own election",
                        self.config.master_id
                    );
                    return;
                }
                match self.state.role {
                    ElectionRole::Active => {
                        // A late notification of our own replacement is
                        // harmless: confirm on the node before giving up.
                        if matches!(self.state.cycle, CycleStep::Sleeping | CycleStep::Suspended) {
                            self.timers.cancel(TimerKind::Cycle);
                            self.state.cycle = CycleStep::VerifyingActive;
                            self.issue(PendingOp::ReadActive(ActiveRead::Verify));
                        }
                    }
                    ElectionRole::Standby { .. } => {
                        self.no_longer_master("active-heartbeat node was deleted")
                            .await
                    }
                    ElectionRole::Unbound => {}
                }
            }
            NodeKind::NotificationFlag => {
                if self.state.cumulative.is_blocked() {
                    info!(
                        "{} sees the notification flag released, resuming",
                        self.config.master_id
                    );
                    self.state.release_block();
                    if self.state.cycle == CycleStep::Blocked {
                        self.timers.cancel(TimerKind::BlockedWait);
                        self.run_cycle().await;
                    }
                }
                if self.state.failover == Some(FailoverStage::AwaitingRelease) {
                    self.timers.cancel(TimerKind::ContenderWait);
                    self.recreate_active().await;
                }
            }
        }
    }

    fn on_node_changed(&mut self, kind: NodeKind) {
        match kind {
            NodeKind::Listeners => {
                self.issue(PendingOp::Bind(kind));
                if self.state.role.is_standby() {
                    self.issue(PendingOp::ReadListeners(ListenersRead::Refresh));
                }
            }
            NodeKind::ActiveHeartbeat => self.issue(PendingOp::Bind(kind)),
            NodeKind::NotificationFlag => {}
        }
    }

    // Operation results

    async fn on_op_result(&mut self, op_id: OpId, outcome: OpOutcome) {
        let Some(op) = self.pending.remove(&op_id) else {
            debug!("Dropping result of unknown {}", op_id);
            return;
        };

        if outcome.is_fatal() {
            let reason = format!("{} on the {} node lost the session", op_id, op.node());
            self.stop(StopReason::ConnectionLost { reason }).await;
            return;
        }
        if outcome.is_transient() {
            warn!(
                "{}: {:?} failed with {:?}, retrying",
                self.config.master_id, op, outcome
            );
            self.stats.write().retried_operations += 1;
            self.issue(op);
            return;
        }

        match op {
            PendingOp::CreateActive { purpose, record } => {
                self.on_active_created(purpose, record, outcome).await
            }
            PendingOp::ReadActive(ActiveRead::Verify) => self.on_verify_read(outcome).await,
            PendingOp::ReadActive(ActiveRead::BindOwner) => self.on_owner_read(outcome).await,
            PendingOp::ReadActive(ActiveRead::Inspect) => self.on_inspect_read(outcome).await,
            PendingOp::WriteActive { record, .. } => {
                self.on_heartbeat_written(record, outcome).await
            }
            PendingOp::DeleteActive => self.on_active_cleared(outcome).await,
            PendingOp::WriteListeners { record, purpose } => {
                self.on_listeners_written(record, purpose, outcome)
            }
            PendingOp::ReadListeners(ListenersRead::Refresh) => {
                self.on_refresh_read(outcome).await
            }
            PendingOp::ReadListeners(ListenersRead::CrossCheck) => {
                self.on_cross_check_read(outcome).await
            }
            PendingOp::CreateFlag => self.on_flag_created(outcome).await,
            PendingOp::DeleteFlag => self.on_flag_released(outcome).await,
            PendingOp::Bind(kind) => self.on_bound(kind, outcome).await,
        }
    }

    async fn on_active_created(
        &mut self,
        purpose: CreatePurpose,
        record: ActiveRecord,
        outcome: OpOutcome,
    ) {
        self.state.prepare_role_derivation();
        self.state.bootstrapped = true;

        match outcome {
            OpOutcome::Created => {
                info!(
                    "{} created the active-heartbeat node with {}, now ACTIVE",
                    self.config.master_id, record
                );
                self.state.role = ElectionRole::Active;
                self.state.confirm_write(record.timestamp, Instant::now());
                self.state.prev_update = Some(record.timestamp);
                self.state.active_version = None;
                self.stats.write().elections_won += 1;
                self.publish(RoleChange::Elected).await;

                if self.state.flag_held {
                    self.state.failover = Some(FailoverStage::Announcing);
                    self.issue(PendingOp::WriteListeners {
                        record,
                        purpose: EchoPurpose::Announce,
                    });
                } else {
                    self.state.failover = None;
                }
            }
            OpOutcome::AlreadyExists => {
                info!(
                    "{} found the active-heartbeat node taken, now STANDBY",
                    self.config.master_id
                );
                self.state.role = ElectionRole::Standby { active: None };
                self.issue(PendingOp::ReadActive(ActiveRead::BindOwner));
                self.publish(RoleChange::Standby { active: None }).await;

                if self.state.flag_held {
                    self.state.failover = Some(FailoverStage::ReleasingFlag);
                    self.issue(PendingOp::DeleteFlag);
                } else {
                    self.state.failover = None;
                }
            }
            other => {
                warn!(
                    "{}: unexpected outcome {:?} creating the active-heartbeat node, retrying",
                    self.config.master_id, other
                );
                self.issue(PendingOp::CreateActive { purpose, record });
                return;
            }
        }

        self.issue(PendingOp::Bind(NodeKind::ActiveHeartbeat));
        self.schedule_cycle();
    }

    async fn on_verify_read(&mut self, outcome: OpOutcome) {
        if !self.state.role.is_active() {
            self.schedule_cycle();
            return;
        }

        let (payload, version) = match outcome {
            OpOutcome::Data { payload, version } => (payload, version),
            OpOutcome::NoNode => {
                self.no_longer_master("active-heartbeat node is gone").await;
                return;
            }
            other => {
                warn!(
                    "{}: unexpected outcome {:?} reading the active-heartbeat node",
                    self.config.master_id, other
                );
                self.schedule_cycle();
                return;
            }
        };

        let record = match codec::decode(&payload) {
            Ok(record) => record,
            Err(e) => {
                warn!(
                    "{}: malformed active-heartbeat record, treating it as absent: {}",
                    self.config.master_id, e
                );
                self.stats.write().malformed_payloads += 1;
                self.no_longer_master("active-heartbeat record is malformed").await;
                return;
            }
        };

        if !record.is_owned_by(&self.config.master_id) {
            info!(
                "{} found {} in the active-heartbeat node, it is no longer active",
                self.config.master_id, record
            );
            self.state.role = ElectionRole::Standby {
                active: Some(record.master_id),
            };
            self.state.active_version = None;
            self.publish(RoleChange::Demoted {
                reason: "active-heartbeat node taken over".to_string(),
            })
            .await;
            self.no_longer_master("another participant owns the active-heartbeat node").await;
            self.schedule_cycle();
            return;
        }

        self.state.active_version = Some(version);
        let lag = self.state.active_lag(Instant::now());
        if lag >= self.config.timing.max_update_miss {
            warn!(
                "{} could not push a heartbeat within {:?} (last confirmed {:?} ago)",
                self.config.master_id, self.config.timing.max_update_miss, lag
            );
            self.no_longer_master("heartbeat could not be pushed in time").await;
            return;
        }

        let now = self.now_or_local().await;
        let last = self.state.last_update.unwrap_or(now);
        let record = ActiveRecord::new(self.config.master_id.clone(), now.max(last));
        debug!("{} pushing heartbeat {}", self.config.master_id, record);
        self.state.cycle = CycleStep::PushingHeartbeat;
        self.issue(PendingOp::WriteActive {
            record,
            expected_version: Some(version),
        });
    }

    async fn on_heartbeat_written(&mut self, record: ActiveRecord, outcome: OpOutcome) {
        match outcome {
            OpOutcome::Written { version } => {
                self.state.active_version = Some(version);
                self.state.confirm_write(record.timestamp, Instant::now());
                self.stats.write().heartbeats_pushed += 1;

                if self.state.role.is_active() {
                    self.state.cycle = CycleStep::EchoingListeners;
                    self.issue(PendingOp::WriteListeners {
                        record,
                        purpose: EchoPurpose::Heartbeat,
                    });
                } else {
                    self.schedule_cycle();
                }
            }
            OpOutcome::BadVersion => {
                warn!(
                    "{}: active-heartbeat node changed since it was read, re-reading next cycle",
                    self.config.master_id
                );
                self.stats.write().rejected_writes += 1;
                self.state.active_version = None;
                self.schedule_cycle();
            }
            OpOutcome::NoNode => {
                self.no_longer_master("active-heartbeat node is gone").await;
            }
            other => {
                warn!(
                    "{}: unexpected outcome {:?} writing the active-heartbeat node",
                    self.config.master_id, other
                );
                self.schedule_cycle();
            }
        }
    }

    fn on_listeners_written(
        &mut self,
        record: ActiveRecord,
        purpose: EchoPurpose,
        outcome: OpOutcome,
    ) {
        match outcome {
            OpOutcome::Written { .. } => {
                debug!(
                    "{} echoed {} to the listeners node",
                    self.config.master_id, record
                );
                if self.state.role.is_active() {
                    self.state.record_heartbeat(record.timestamp);
                }
            }
            OpOutcome::NoNode => {
                debug!(
                    "{}: listeners node absent, echo of {} skipped",
                    self.config.master_id, record
                );
            }
            other => {
                warn!(
                    "{}: unexpected outcome {:?} writing the listeners node",
                    self.config.master_id, other
                );
            }
        }

        match purpose {
            EchoPurpose::Heartbeat => self.schedule_cycle(),
            EchoPurpose::Announce => {
                info!(
                    "{} announced {}, releasing the notification flag",
                    self.config.master_id, record
                );
                self.state.failover = Some(FailoverStage::ReleasingFlag);
                self.issue(PendingOp::DeleteFlag);
            }
        }
    }

    async fn on_owner_read(&mut self, outcome: OpOutcome) {
        if !self.state.role.is_standby() {
            return;
        }
        match outcome {
            OpOutcome::Data { payload, .. } => match codec::decode(&payload) {
                Ok(record) => self.bind_owner(record.master_id).await,
                Err(e) => {
                    warn!(
                        "{}: malformed active-heartbeat record: {}",
                        self.config.master_id, e
                    );
                    self.stats.write().malformed_payloads += 1;
                }
            },
            OpOutcome::NoNode => debug!(
                "{}: active-heartbeat node vanished before its owner could be read",
                self.config.master_id
            ),
            other => warn!(
                "{}: unexpected outcome {:?} reading the active owner",
                self.config.master_id, other
            ),
        }
    }

    async fn on_refresh_read(&mut self, outcome: OpOutcome) {
        if !self.state.role.is_standby() {
            return;
        }
        let OpOutcome::Data { payload, .. } = outcome else {
            debug!(
                "{}: listeners refresh returned {:?}",
                self.config.master_id, outcome
            );
            return;
        };

        let record = match codec::decode(&payload) {
            Ok(record) => record,
            Err(e) => {
                warn!(
                    "{}: malformed listeners record ignored: {}",
                    self.config.master_id, e
                );
                self.stats.write().malformed_payloads += 1;
                return;
            }
        };

        if !self.state.cumulative.is_blocked() {
            self.state.cumulative.reset();
        }
        if !self.state.ignore_updates {
            self.state.last_update = Some(record.timestamp);
        }
        self.stats.write().heartbeats_observed += 1;
        debug!("{} observed heartbeat {}", self.config.master_id, record);
        self.bind_owner(record.master_id).await;

        if self.state.cycle == CycleStep::AwaitingFirstUpdate && self.state.last_update.is_some() {
            self.state.prev_update = self.state.last_update;
            self.run_cycle().await;
        }
    }

    async fn on_cross_check_read(&mut self, outcome: OpOutcome) {
        if self.state.role.is_standby() {
            match outcome {
                OpOutcome::Data { payload, .. } => {
                    let overdue = match codec::decode(&payload) {
                        Ok(record) => {
                            let now = self.now_or_local().await;
                            let age = now - record.timestamp;
                            debug!(
                                "{}: listeners holds {}, {} ms old",
                                self.config.master_id, record, age
                            );
                            age > self.config.timing.max_update_miss_ms()
                        }
                        Err(e) => {
                            warn!(
                                "{}: malformed listeners record, treating it as stale: {}",
                                self.config.master_id, e
                            );
                            self.stats.write().malformed_payloads += 1;
                            true
                        }
                    };

                    if overdue {
                        info!(
                            "{}: the active missed its heartbeats, competing for the active role",
                            self.config.master_id
                        );
                        self.state.ignore_updates = true;
                        self.no_longer_master("heartbeat overdue on the listeners node").await;
                    } else {
                        debug!(
                            "{}: the active is alive, the lag was local",
                            self.config.master_id
                        );
                    }
                }
                OpOutcome::NoNode => {
                    debug!("{}: listeners node is gone", self.config.master_id)
                }
                other => warn!(
                    "{}: unexpected outcome {:?} cross-checking the listeners node",
                    self.config.master_id, other
                ),
            }
        }

        self.state.prev_update = self.state.last_update;
        self.schedule_cycle();
    }

    async fn on_flag_created(&mut self, outcome: OpOutcome) {
        if self.state.failover != Some(FailoverStage::Contending) {
            return;
        }
        match outcome {
            OpOutcome::Created => {
                info!(
                    "{} won the notification flag, replacing the active in {:?}",
                    self.config.master_id, self.config.timing.grace_period
                );
                self.state.flag_held = true;
                self.state.failover = Some(FailoverStage::Grace);
                self.stats.write().failovers_won += 1;
                self.publish(RoleChange::FailoverWon).await;
                self.arm(TimerKind::Grace, self.config.timing.grace_period);
            }
            OpOutcome::AlreadyExists => {
                info!(
                    "{} lost the notification flag, waiting for its release",
                    self.config.master_id
                );
                self.state.failover = Some(FailoverStage::AwaitingRelease);
                self.stats.write().failovers_lost += 1;
                self.publish(RoleChange::FailoverLost).await;
                self.issue(PendingOp::Bind(NodeKind::NotificationFlag));
                self.arm(TimerKind::ContenderWait, self.config.timing.very_long_wait);
            }
            other => {
                warn!(
                    "{}: unexpected outcome {:?} creating the notification flag, retrying",
                    self.config.master_id, other
                );
                self.issue(PendingOp::CreateFlag);
            }
        }
    }

    async fn on_inspect_read(&mut self, outcome: OpOutcome) {
        if self.state.failover != Some(FailoverStage::ClearingActive) {
            return;
        }
        if let OpOutcome::Data { payload, .. } = &outcome {
            if let Ok(record) = codec::decode(payload) {
                let now = self.now_or_local().await;
                if !record.is_owned_by(&self.config.master_id)
                    && now - record.timestamp <= self.config.timing.max_update_miss_ms()
                {
                    info!(
                        "{}: {} is fresh, leaving the active-heartbeat node in place",
                        self.config.master_id, record
                    );
                    self.recreate_active().await;
                    return;
                }
                info!(
                    "{} removing the stale active-heartbeat record {}",
                    self.config.master_id, record
                );
            }
        }

        match outcome {
            OpOutcome::NoNode => self.recreate_active().await,
            _ => self.issue(PendingOp::DeleteActive),
        }
    }

    async fn on_active_cleared(&mut self, outcome: OpOutcome) {
        match outcome {
            OpOutcome::Deleted | OpOutcome::NoNode => self.recreate_active().await,
            other => {
                warn!(
                    "{}: unexpected outcome {:?} deleting the active-heartbeat node, retrying",
                    self.config.master_id, other
                );
                self.issue(PendingOp::DeleteActive);
            }
        }
    }

    async fn on_flag_released(&mut self, outcome: OpOutcome) {
        match outcome {
            OpOutcome::Deleted | OpOutcome::NoNode => {
                info!("{} released the notification flag", self.config.master_id);
                self.state.flag_held = false;
                self.state.failover = None;
                self.publish(RoleChange::FlagReleased).await;
                self.schedule_cycle();
            }
            other => {
                warn!(
                    "{}: unexpected outcome {:?} deleting the notification flag, retrying",
                    self.config.master_id, other
                );
                self.issue(PendingOp::DeleteFlag);
            }
        }
    }

    async fn on_bound(&mut self, kind: NodeKind, outcome: OpOutcome) {
        let OpOutcome::Exists(exists) = outcome else {
            warn!(
                "{}: unexpected outcome {:?} watching the {} node",
                self.config.master_id, outcome, kind
            );
            return;
        };

        match kind {
            NodeKind::Listeners if exists => self.start_ticking(),
            NodeKind::NotificationFlag
                if !exists && self.state.failover == Some(FailoverStage::AwaitingRelease) =>
            {
                info!(
                    "{}: notification flag already released",
                    self.config.master_id
                );
                self.timers.cancel(TimerKind::ContenderWait);
                self.recreate_active().await;
            }
            NodeKind::NotificationFlag
                if !exists
                    && self.state.cumulative.is_blocked()
                    && self.state.failover.is_none() =>
            {
                // Nobody holds the flag: either the winner is done or nobody
                // contended. Creation settles which.
                info!(
                    "{}: no notification flag to wait for, attempting creation",
                    self.config.master_id
                );
                self.timers.cancel(TimerKind::BlockedWait);
                self.state.release_block();
                self.recreate_active().await;
            }
            _ => {}
        }
    }

    // Timers

    async fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Cycle => {
                if self.state.cycle != CycleStep::Sleeping {
                    return;
                }
                if self.state.cumulative.is_blocked() {
                    debug!(
                        "{} blocked behind the notification flag, waiting up to {:?}",
                        self.config.master_id, self.config.timing.very_long_wait
                    );
                    self.state.cycle = CycleStep::Blocked;
                    self.arm(TimerKind::BlockedWait, self.config.timing.very_long_wait);
                    return;
                }
                self.run_cycle().await;
            }
            TimerKind::BlockedWait => {
                if self.state.cycle != CycleStep::Blocked {
                    return;
                }
                if !self.state.cumulative.is_blocked() {
                    self.run_cycle().await;
                    return;
                }
                warn!(
                    "{}: notification flag not released within {:?}, treating it as abandoned",
                    self.config.master_id, self.config.timing.very_long_wait
                );
                self.stats.write().forced_flag_clears += 1;
                self.state.release_block();
                // Re-enter through creation: the node may be gone with nobody
                // left to recreate it.
                self.recreate_active().await;
            }
            TimerKind::Settle => {
                if self.state.failover == Some(FailoverStage::Settling) {
                    self.on_settled().await;
                }
            }
            TimerKind::Grace => {
                if self.state.failover == Some(FailoverStage::Grace) {
                    self.state.failover = Some(FailoverStage::ClearingActive);
                    self.issue(PendingOp::ReadActive(ActiveRead::Inspect));
                }
            }
            TimerKind::ContenderWait => {
                if self.state.failover == Some(FailoverStage::AwaitingRelease) {
                    info!(
                        "{}: notification flag still held after {:?}, attempting creation anyway",
                        self.config.master_id, self.config.timing.very_long_wait
                    );
                    self.recreate_active().await;
                }
            }
        }
    }

    async fn on_settled(&mut self) {
        let now = self.now_or_local().await;
        let window = self.config.timing.notification_window_ms();

        if self.state.has_failover_budget(now, window) {
            info!(
                "{} still within the notification window, contending for the flag",
                self.config.master_id
            );
            self.state.running_election = true;
            self.state.failover = Some(FailoverStage::Contending);
            self.issue(PendingOp::CreateFlag);
        } else {
            info!(
                "{}: notification window exhausted (last heartbeat {:?}), waiting for the flag",
                self.config.master_id, self.state.last_update
            );
            self.state.failover = None;
            self.state.cumulative.block();
            self.stats.write().failovers_lost += 1;
            self.publish(RoleChange::FailoverLost).await;
            self.issue(PendingOp::Bind(NodeKind::NotificationFlag));
        }
    }

    // Control loop

    fn schedule_cycle(&mut self) {
        if self.state.cycle == CycleStep::Stopped {
            return;
        }
        if !self.state.bootstrapped || !self.state.clock_ticking {
            self.timers.cancel(TimerKind::Cycle);
            self.state.cycle = CycleStep::Suspended;
            return;
        }
        self.state.cycle = CycleStep::Sleeping;
        self.arm(TimerKind::Cycle, self.config.timing.interval);
    }

    async fn run_cycle(&mut self) {
        if self.state.ignore_updates {
            debug!("{} ignoring updates this cycle", self.config.master_id);
            self.schedule_cycle();
            return;
        }

        let interval = u64::try_from(self.config.timing.interval_ms()).unwrap_or(u64::MAX);
        match self.state.role {
            ElectionRole::Active => {
                self.state.cumulative.accumulate(interval);
                self.state.cycle = CycleStep::VerifyingActive;
                self.issue(PendingOp::ReadActive(ActiveRead::Verify));
            }
            ElectionRole::Standby { .. } => {
                if self.state.last_update.is_none() {
                    debug!("{} waiting for the first heartbeat", self.config.master_id);
                    self.state.cycle = CycleStep::AwaitingFirstUpdate;
                    return;
                }
                self.state.cumulative.accumulate(interval);
                self.standby_check().await;
            }
            ElectionRole::Unbound => self.schedule_cycle(),
        }
    }

    async fn standby_check(&mut self) {
        let needs_time = match (self.state.last_update, self.state.prev_update) {
            (Some(last), Some(prev)) => last <= prev,
            _ => true,
        };
        let authoritative = if needs_time {
            self.authoritative_now().await
        } else {
            None
        };

        match self.state.drift(authoritative) {
            Some(drift) if drift > self.config.timing.max_update_miss_ms() => {
                info!(
                    "{}: heartbeat drift {} ms exceeds {:?}, cross-checking the listeners node",
                    self.config.master_id, drift, self.config.timing.max_update_miss
                );
                self.stats.write().cross_checks += 1;
                self.state.cycle = CycleStep::CrossChecking;
                self.issue(PendingOp::ReadListeners(ListenersRead::CrossCheck));
            }
            drift => {
                debug!(
                    "{}: heartbeat drift {:?} ms within bounds",
                    self.config.master_id, drift
                );
                self.state.prev_update = self.state.last_update;
                self.schedule_cycle();
            }
        }
    }

    fn start_ticking(&mut self) {
        if !self.state.clock_ticking {
            info!(
                "{}: listeners node present, clock ticking",
                self.config.master_id
            );
        }
        self.state.clock_ticking = true;
        if self.state.cycle == CycleStep::Suspended {
            // No heartbeat is owed while suspended; lag counts from here.
            if self.state.role.is_active() {
                self.state.confirmed_at = Some(Instant::now());
            }
            self.schedule_cycle();
        }
    }

    fn stop_ticking(&mut self) {
        info!(
            "{}: listeners node removed, clock stopped",
            self.config.master_id
        );
        self.state.clock_ticking = false;
        if matches!(self.state.cycle, CycleStep::Sleeping | CycleStep::Blocked) {
            self.timers.cancel(TimerKind::Cycle);
            self.timers.cancel(TimerKind::BlockedWait);
            self.state.cycle = CycleStep::Suspended;
        }
    }

    // Demotion and failover

    /// Reacts to evidence that the current active is gone or late.
    async fn no_longer_master(&mut self, reason: &str) {
        if self.state.role.is_active() {
            info!(
                "{} is no longer active ({}), leaving the election",
                self.config.master_id, reason
            );
            self.publish(RoleChange::Demoted {
                reason: reason.to_string(),
            })
            .await;
            self.stop(StopReason::Demoted {
                reason: reason.to_string(),
            })
            .await;
            return;
        }

        if self.state.failover.is_some() || self.state.running_election {
            debug!(
                "{} already competing, ignoring: {}",
                self.config.master_id, reason
            );
            return;
        }

        let jitter = self.config.timing.settle_jitter;
        let settle = if jitter.is_zero() {
            self.config.timing.interval
        } else {
            self.config.timing.interval + self.rng.gen_range(Duration::ZERO..=jitter)
        };
        info!(
            "{} suspects the active ({}), contending in {:?}",
            self.config.master_id, reason, settle
        );

        self.state.ignore_updates = true;
        self.state.failover = Some(FailoverStage::Settling);
        self.stats.write().failovers_started += 1;
        self.publish(RoleChange::FailoverStarted).await;
        self.arm(TimerKind::Settle, settle);
    }

    async fn recreate_active(&mut self) {
        self.state.failover = Some(FailoverStage::Recreating);
        let now = self.now_or_local().await;
        let record = ActiveRecord::new(self.config.master_id.clone(), now);
        debug!(
            "{} creating the active-heartbeat node with {}",
            self.config.master_id, record
        );
        self.issue(PendingOp::CreateActive {
            purpose: CreatePurpose::Recreate,
            record,
        });
    }

    async fn bind_owner(&mut self, owner: MasterId) {
        if self.state.bound_active() == Some(&owner) {
            return;
        }
        info!("{} is standby for active {}", self.config.master_id, owner);
        self.state.role = ElectionRole::Standby {
            active: Some(owner.clone()),
        };
        self.publish(RoleChange::Standby {
            active: Some(owner),
        })
        .await;
    }

    async fn stop(&mut self, reason: StopReason) {
        if self.state.cycle == CycleStep::Stopped {
            return;
        }
        match &reason {
            StopReason::Shutdown => info!("{} shutting down", self.config.master_id),
            StopReason::ConnectionLost { reason } => error!(
                "{} lost its coordination session: {}",
                self.config.master_id, reason
            ),
            StopReason::Demoted { reason } => warn!(
                "{} stopping after demotion: {}",
                self.config.master_id, reason
            ),
        }

        self.state.cycle = CycleStep::Stopped;
        self.state.failover = None;
        self.timers.cancel_all();
        self.pending.clear();
        self.channel.close().await;

        self.publish(RoleChange::Stopped {
            reason: reason.to_string(),
        })
        .await;
        self.stop_reason = Some(reason);
    }

    // Plumbing

    fn issue(&mut self, op: PendingOp) {
        let kind = op.node();
        let op_id = match &op {
            PendingOp::CreateActive { record, .. } => match self.encode(record) {
                Some(payload) => self.channel.create(kind, payload),
                None => return,
            },
            PendingOp::WriteActive {
                record,
                expected_version,
            } => match self.encode(record) {
                Some(payload) => self.channel.write(kind, payload, *expected_version),
                None => return,
            },
            PendingOp::WriteListeners { record, .. } => match self.encode(record) {
                Some(payload) => self.channel.write(kind, payload, None),
                None => return,
            },
            PendingOp::ReadActive(_) | PendingOp::ReadListeners(_) => self.channel.read(kind),
            PendingOp::DeleteActive | PendingOp::DeleteFlag => self.channel.delete(kind),
            PendingOp::CreateFlag => self.channel.create(kind, Bytes::from_static(FLAG_SENTINEL)),
            PendingOp::Bind(_) => self.channel.watch(kind),
        };
        self.pending.insert(op_id, op);
    }

    fn encode(&self, record: &ActiveRecord) -> Option<Bytes> {
        match codec::encode(record) {
            Ok(payload) => Some(payload),
            Err(e) => {
                error!("{}: cannot encode {}: {}", self.config.master_id, record, e);
                None
            }
        }
    }

    fn arm(&mut self, kind: TimerKind, after: Duration) {
        let generation = self.timers.arm(kind);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events.send(ElectionEvent::Timer { kind, generation });
        });
    }

    async fn authoritative_now(&mut self) -> Option<i64> {
        match self.time_source.now_millis().await {
            Ok(now) => Some(now),
            Err(e) => {
                warn!(
                    "{}: authoritative time unavailable, deciding with reduced confidence: {}",
                    self.config.master_id, e
                );
                self.stats.write().time_source_fallbacks += 1;
                None
            }
        }
    }

    /// Authoritative time, else the local clock.
    async fn now_or_local(&mut self) -> i64 {
        if let Some(now) = self.authoritative_now().await {
            return now;
        }
        match self.local_clock.now_millis().await {
            Ok(now) => now,
            Err(e) => {
                error!("{}: local clock unavailable: {}", self.config.master_id, e);
                self.state.last_update.unwrap_or_default()
            }
        }
    }

    async fn publish(&self, change: RoleChange) {
        self.notifications
            .publish(&self.config.master_id, change)
            .await;
    }

    fn publish_phase(&self) {
        let phase = self.state.phase();
        self.phase_tx.send_if_modified(|current| {
            if *current == phase {
                false
            } else {
                *current = phase;
                true
            }
        });
    }
}

/// Cloneable view of a running orchestrator.
#[derive(Clone)]
pub struct ElectionHandle {
    master_id: MasterId,
    events: mpsc::UnboundedSender<ElectionEvent>,
    phase: watch::Receiver<ElectionPhase>,
    stats: Arc<RwLock<ElectionStats>>,
    notifications: Arc<RoleNotificationBus>,
}

impl ElectionHandle {
    pub fn master_id(&self) -> &MasterId {
        &self.master_id
    }

    pub fn phase(&self) -> ElectionPhase {
        *self.phase.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.phase() == ElectionPhase::Active
    }

    /// Resolves once the participant reaches `target`.
    pub async fn wait_for_phase(&self, target: ElectionPhase) -> Result<()> {
        let mut phase = self.phase.clone();
        phase
            .wait_for(|current| *current == target)
            .await
            .map(|_| ())
            .map_err(|_| TimeMasterError::channel_closed("election loop is gone"))
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<ElectionPhase> {
        self.phase.clone()
    }

    pub fn stats(&self) -> ElectionStats {
        self.stats.read().clone()
    }

    pub fn notifications(&self) -> Arc<RoleNotificationBus> {
        Arc::clone(&self.notifications)
    }

    /// Asks the participant to leave the election and release its nodes.
    pub fn shutdown(&self) -> Result<()> {
        self.events
            .send(ElectionEvent::Shutdown)
            .map_err(|_| TimeMasterError::channel_closed("election loop already stopped"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodePaths, TimingConfig};
    use async_trait::async_trait;
    use timemaster_coordination::{MemoryCoordinator, MemorySession};
    use tokio::time::{sleep, Instant};

    /// Wall clock driven by tokio time, so paused tests stay deterministic.
    struct TestClock {
        start: Instant,
        base: i64,
    }

    impl TestClock {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                start: Instant::now(),
                base: 1_000,
            })
        }
    }

    #[async_trait]
    impl TimeSource for TestClock {
        async fn now_millis(&self) -> Result<i64> {
            Ok(self.base + self.start.elapsed().as_millis() as i64)
        }
    }

    fn config(id: &str) -> ElectionConfig {
        ElectionConfig::new(id)
            .with_timing(
                TimingConfig::new(Duration::from_millis(100))
                    .with_notification_window(Duration::from_secs(2))
                    .with_grace_period(Duration::from_millis(300)),
            )
            .with_randomization_seed(42)
    }

    fn participant(
        coordinator: &MemoryCoordinator,
        id: &str,
        clock: &Arc<TestClock>,
    ) -> (Arc<MemorySession>, ElectionHandle, JoinHandle<Result<StopReason>>) {
        let (session, events) = coordinator.connect(id);
        let session = Arc::new(session);
        let service: Arc<dyn CoordinationService> = session.clone();
        let orchestrator = ElectionOrchestrator::new(config(id), service, events)
            .unwrap()
            .with_time_source(clock.clone())
            .with_local_clock(clock.clone());
        let (handle, task) = orchestrator.spawn();
        (session, handle, task)
    }

    async fn create_listeners(coordinator: &MemoryCoordinator) -> MemorySession {
        let (ticker, _events) = coordinator.connect("ticker");
        let outcome = ticker
            .create_ephemeral(&NodePaths::default().listeners, Bytes::from("ticker;0"))
            .await;
        assert_eq!(outcome, OpOutcome::Created);
        ticker
    }

    fn active_record(coordinator: &MemoryCoordinator) -> Option<ActiveRecord> {
        coordinator
            .node(&NodePaths::default().active_heartbeat)
            .and_then(|node| codec::decode(&node.payload).ok())
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_participant_becomes_active() {
        let _ = tracing_subscriber::fmt::try_init();
        let coordinator = MemoryCoordinator::new();
        let _ticker = create_listeners(&coordinator).await;
        let clock = TestClock::new();

        let (_session, handle, _task) = participant(&coordinator, "m1", &clock);
        handle.wait_for_phase(ElectionPhase::Active).await.unwrap();

        let first = active_record(&coordinator).unwrap();
        assert_eq!(first.master_id, MasterId::new("m1"));

        sleep(Duration::from_millis(550)).await;
        let later = active_record(&coordinator).unwrap();
        assert!(later.timestamp > first.timestamp);
        assert!(handle.stats().heartbeats_pushed >= 4);
        assert_eq!(handle.stats().elections_won, 1);

        let listeners = coordinator.node(&NodePaths::default().listeners).unwrap();
        assert_eq!(
            codec::decode(&listeners.payload).unwrap().master_id,
            MasterId::new("m1")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_participant_is_standby() {
        let coordinator = MemoryCoordinator::new();
        let _ticker = create_listeners(&coordinator).await;
        let clock = TestClock::new();

        let (_s1, m1, _t1) = participant(&coordinator, "m1", &clock);
        m1.wait_for_phase(ElectionPhase::Active).await.unwrap();
        let (_s2, m2, _t2) = participant(&coordinator, "m2", &clock);
        m2.wait_for_phase(ElectionPhase::Standby).await.unwrap();

        sleep(Duration::from_secs(2)).await;
        assert!(m1.is_active());
        assert_eq!(m2.phase(), ElectionPhase::Standby);
        assert!(m2.stats().heartbeats_observed > 0);
        assert_eq!(m2.stats().failovers_started, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_heartbeat_without_listeners_node() {
        let coordinator = MemoryCoordinator::new();
        let clock = TestClock::new();

        let (_session, handle, _task) = participant(&coordinator, "m1", &clock);
        handle.wait_for_phase(ElectionPhase::Active).await.unwrap();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(handle.stats().heartbeats_pushed, 0);

        // The wait for the listeners node is not lag.
        let _ticker = create_listeners(&coordinator).await;
        sleep(Duration::from_millis(350)).await;
        assert!(handle.stats().heartbeats_pushed > 0);
        assert!(handle.is_active());

        sleep(Duration::from_secs(1)).await;
        assert!(handle.is_active());
        assert!(handle.stats().heartbeats_pushed >= 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_active_node() {
        let coordinator = MemoryCoordinator::new();
        let _ticker = create_listeners(&coordinator).await;
        let clock = TestClock::new();

        let (_session, handle, task) = participant(&coordinator, "m1", &clock);
        handle.wait_for_phase(ElectionPhase::Active).await.unwrap();

        handle.shutdown().unwrap();
        assert_eq!(task.await.unwrap().unwrap(), StopReason::Shutdown);
        assert_eq!(handle.phase(), ElectionPhase::Stopped);
        assert!(active_record(&coordinator).is_none());
        assert!(handle.shutdown().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_expiry_stops_participant() {
        let coordinator = MemoryCoordinator::new();
        let _ticker = create_listeners(&coordinator).await;
        let clock = TestClock::new();

        let (session, handle, task) = participant(&coordinator, "m1", &clock);
        handle.wait_for_phase(ElectionPhase::Active).await.unwrap();

        coordinator.expire_session(session.id());
        assert!(matches!(
            task.await.unwrap().unwrap(),
            StopReason::ConnectionLost { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let coordinator = MemoryCoordinator::new();
        let _ticker = create_listeners(&coordinator).await;
        let clock = TestClock::new();

        let (session, handle, _task) = participant(&coordinator, "m1", &clock);
        handle.wait_for_phase(ElectionPhase::Active).await.unwrap();

        session.fail_next(OpOutcome::Timeout, 2);
        session.fail_next(OpOutcome::AuthFailed, 1);
        let pushed = handle.stats().heartbeats_pushed;
        sleep(Duration::from_millis(450)).await;

        let stats = handle.stats();
        assert_eq!(stats.retried_operations, 3);
        assert!(stats.heartbeats_pushed > pushed);
        assert!(handle.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleted_node_demotes_active() {
        let coordinator = MemoryCoordinator::new();
        let _ticker = create_listeners(&coordinator).await;
        let clock = TestClock::new();

        let (_session, handle, task) = participant(&coordinator, "m1", &clock);
        handle.wait_for_phase(ElectionPhase::Active).await.unwrap();

        let (intruder, _events) = coordinator.connect("intruder");
        assert_eq!(
            intruder.delete(&NodePaths::default().active_heartbeat).await,
            OpOutcome::Deleted
        );

        assert!(matches!(
            task.await.unwrap().unwrap(),
            StopReason::Demoted { .. }
        ));
    }
}
