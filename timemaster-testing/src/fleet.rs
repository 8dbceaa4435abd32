//! A fleet of participants over one in-memory coordinator.

use crate::clock::SimClock;
use anyhow::{bail, ensure, Context};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use timemaster_coordination::{MemoryCoordinator, MemorySession};
use timemaster_core::codec::{self, FLAG_SENTINEL};
use timemaster_core::{ActiveRecord, CoordinationService, ElectionPhase, MasterId, OpOutcome};
use timemaster_election::{
    ElectionConfig, ElectionHandle, ElectionOrchestrator, NodePaths, NotificationFilter,
    RoleChange, RoleNotification, RoleNotificationBus, StopReason, TimingConfig,
};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// One spawned participant.
pub struct Participant {
    handle: ElectionHandle,
    session: Arc<MemorySession>,
    clock: SimClock,
    task: Option<JoinHandle<timemaster_core::Result<StopReason>>>,
}

impl Participant {
    pub fn handle(&self) -> &ElectionHandle {
        &self.handle
    }

    pub fn session(&self) -> &MemorySession {
        &self.session
    }

    /// The participant's authoritative time source.
    pub fn clock(&self) -> &SimClock {
        &self.clock
    }
}

pub struct FleetHarness {
    coordinator: MemoryCoordinator,
    timeline: SimClock,
    timing: TimingConfig,
    paths: NodePaths,
    notifications: Arc<RoleNotificationBus>,
    history: Arc<Mutex<Vec<RoleNotification>>>,
    participants: BTreeMap<MasterId, Participant>,
    listeners: Option<MemorySession>,
    /// Sessions that hold nodes on behalf of no participant
    abandoned: Vec<MemorySession>,
    next_seed: u64,
}

impl FleetHarness {
    pub async fn new(timing: TimingConfig) -> Self {
        Self::with_base_millis(timing, 1_000).await
    }

    /// A fleet whose timeline reads `base_millis` at construction.
    pub async fn with_base_millis(timing: TimingConfig, base_millis: i64) -> Self {
        let notifications = Arc::new(RoleNotificationBus::new());
        let (_, mut rx) = notifications.subscribe(NotificationFilter::All).await;
        let history = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&history);
        tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                sink.lock().push(notification);
            }
        });

        Self {
            coordinator: MemoryCoordinator::new(),
            timeline: SimClock::new(base_millis),
            timing,
            paths: NodePaths::default(),
            notifications,
            history,
            participants: BTreeMap::new(),
            listeners: None,
            abandoned: Vec::new(),
            next_seed: 0,
        }
    }

    pub fn coordinator(&self) -> &MemoryCoordinator {
        &self.coordinator
    }

    pub fn timeline(&self) -> &SimClock {
        &self.timeline
    }

    pub fn paths(&self) -> &NodePaths {
        &self.paths
    }

    /// Creates the listeners node from a session of its own, which starts the
    /// heartbeat of every participant.
    pub async fn open_listeners(&mut self) -> anyhow::Result<()> {
        ensure!(self.listeners.is_none(), "listeners node already open");

        let (session, _events) = self.coordinator.connect("listeners");
        let record = ActiveRecord::new(MasterId::new("listeners"), self.timeline.now());
        let payload = codec::encode(&record)?;
        match session.create_ephemeral(&self.paths.listeners, payload).await {
            OpOutcome::Created => {
                info!("Listeners node opened");
                self.listeners = Some(session);
                Ok(())
            }
            other => bail!("listeners node not created: {:?}", other),
        }
    }

    pub async fn close_listeners(&mut self) {
        if let Some(session) = self.listeners.take() {
            session.close().await;
            info!("Listeners node closed");
        }
    }

    /// Takes the notification flag from a session that never releases it, as
    /// a contender that hung mid-failover would.
    pub async fn abandon_flag(&mut self) -> anyhow::Result<()> {
        let (session, _events) = self.coordinator.connect("abandoned");
        match session
            .create_ephemeral(&self.paths.notification_flag, FLAG_SENTINEL.into())
            .await
        {
            OpOutcome::Created => {
                info!("Notification flag taken by an abandoned session");
                self.abandoned.push(session);
                Ok(())
            }
            other => bail!("notification flag not created: {:?}", other),
        }
    }

    /// Connects a new participant and starts its election loop.
    pub fn spawn(&mut self, id: &str) -> anyhow::Result<ElectionHandle> {
        let master_id = MasterId::new(id);
        ensure!(
            !self.participants.contains_key(&master_id),
            "participant {} already spawned",
            id
        );

        self.next_seed += 1;
        let config = ElectionConfig::new(master_id.clone())
            .with_timing(self.timing.clone())
            .with_paths(self.paths.clone())
            .with_randomization_seed(self.next_seed);

        let (session, events) = self.coordinator.connect(id);
        let session = Arc::new(session);
        let clock = self.timeline.fork();
        let orchestrator = ElectionOrchestrator::new(config, session.clone(), events)?
            .with_time_source(Arc::new(clock.clone()))
            .with_local_clock(Arc::new(self.timeline.fork()))
            .with_notifications(Arc::clone(&self.notifications));

        let (handle, task) = orchestrator.spawn();
        debug!("Spawned participant {}", id);
        self.participants.insert(
            master_id,
            Participant {
                handle: handle.clone(),
                session,
                clock,
                task: Some(task),
            },
        );
        Ok(handle)
    }

    pub fn participant(&self, id: &str) -> Option<&Participant> {
        self.participants.get(&MasterId::new(id))
    }

    pub fn handle(&self, id: &str) -> Option<ElectionHandle> {
        self.participant(id).map(|participant| participant.handle.clone())
    }

    pub fn phase(&self, id: &str) -> Option<ElectionPhase> {
        self.participant(id).map(|participant| participant.handle.phase())
    }

    /// Kills a participant the way a crashed process looks to the fleet: its
    /// session expires and its ephemeral nodes disappear.
    pub fn crash(&self, id: &str) -> anyhow::Result<()> {
        let participant = self
            .participant(id)
            .with_context(|| format!("unknown participant {id}"))?;
        info!("Crashing participant {}", id);
        self.coordinator.expire_session(participant.session.id());
        Ok(())
    }

    /// Freezes a participant without ending its session: every operation it
    /// issues from now on takes `latency`.
    pub fn stall(&self, id: &str, latency: Duration) -> anyhow::Result<()> {
        let participant = self
            .participant(id)
            .with_context(|| format!("unknown participant {id}"))?;
        info!("Stalling participant {} for {:?} per operation", id, latency);
        participant.session.set_latency(latency);
        Ok(())
    }

    pub fn recover(&self, id: &str) -> anyhow::Result<()> {
        self.stall(id, Duration::ZERO)
    }

    /// Participants currently reporting the active phase.
    pub fn active_ids(&self) -> Vec<MasterId> {
        self.participants
            .iter()
            .filter(|(_, participant)| participant.handle.phase() == ElectionPhase::Active)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Decoded content of the active-heartbeat node.
    pub fn active_record(&self) -> Option<ActiveRecord> {
        self.coordinator
            .node(&self.paths.active_heartbeat)
            .and_then(|node| codec::decode(&node.payload).ok())
    }

    pub fn listeners_record(&self) -> Option<ActiveRecord> {
        self.coordinator
            .node(&self.paths.listeners)
            .and_then(|node| codec::decode(&node.payload).ok())
    }

    /// Participant whose session owns the notification flag.
    pub fn flag_holder(&self) -> Option<MasterId> {
        let owner = self.coordinator.node(&self.paths.notification_flag)?.owner;
        self.participants
            .iter()
            .find(|(_, participant)| participant.session.id() == owner)
            .map(|(id, _)| id.clone())
    }

    /// Every notification published so far.
    pub fn history(&self) -> Vec<RoleNotification> {
        self.history.lock().clone()
    }

    pub fn count_changes(&self, matches: impl Fn(&RoleChange) -> bool) -> usize {
        self.history
            .lock()
            .iter()
            .filter(|notification| matches(&notification.change))
            .count()
    }

    /// Polls `condition` until it holds or `limit` elapses.
    pub async fn wait_until(
        &self,
        limit: Duration,
        mut condition: impl FnMut(&Self) -> bool,
    ) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if condition(self) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Calls `check` on every poll for `duration`.
    pub async fn observe(&self, duration: Duration, mut check: impl FnMut(&Self)) {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            check(self);
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Waits for a participant's loop to return.
    pub async fn join(&mut self, id: &str) -> anyhow::Result<StopReason> {
        let task = self
            .participants
            .get_mut(&MasterId::new(id))
            .and_then(|participant| participant.task.take())
            .with_context(|| format!("no running participant {id}"))?;
        Ok(task.await??)
    }

    pub async fn shutdown(&mut self) {
        for participant in self.participants.values() {
            let _ = participant.handle.shutdown();
        }
        for (id, participant) in self.participants.iter_mut() {
            if let Some(task) = participant.task.take() {
                match task.await {
                    Ok(Ok(reason)) => debug!("Participant {} stopped: {}", id, reason),
                    Ok(Err(e)) => debug!("Participant {} failed: {}", id, e),
                    Err(e) => debug!("Participant {} task panicked: {}", id, e),
                }
            }
        }
        for session in self.abandoned.drain(..) {
            session.close().await;
        }
        self.close_listeners().await;
    }
}
