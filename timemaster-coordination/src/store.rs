//! # Coordination Store
//!
//! In-memory node tree shared by every session of one coordinator. All node
//! mutations and watch registrations happen under a single lock so that a
//! watch is either registered before a change (and fires) or observes the
//! changed state.

use crate::session::MemorySession;
use crate::watches::WatchRegistry;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use timemaster_core::{CoordinationEvent, OpOutcome};
use tokio::sync::mpsc;
use tracing::{debug, info};

pub type SessionId = u64;

/// Configuration for the in-memory coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Maximum number of nodes in the tree
    pub max_nodes: usize,
    /// Latency applied to every operation of every session
    pub op_latency: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_nodes: 10_000,
            op_latency: Duration::ZERO,
        }
    }
}

/// A node with its metadata
#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub payload: Bytes,
    /// Drawn from a store-wide counter on creation and on every accepted
    /// write, so a recreated node never repeats an earlier version
    pub version: u64,
    /// Session that created the node; the node dies with it
    pub owner: SessionId,
}

/// Coordinator statistics
#[derive(Debug, Clone, Default)]
pub struct CoordinatorStats {
    pub total_operations: u64,
    pub nodes_created: u64,
    pub nodes_deleted: u64,
    pub writes: u64,
    pub rejected_writes: u64,
    pub watches_fired: u64,
    pub sessions_opened: u64,
    pub sessions_expired: u64,
    pub injected_failures: u64,
}

#[derive(Debug, Default)]
pub(crate) struct SessionFaults {
    pub(crate) queued: VecDeque<OpOutcome>,
    pub(crate) latency: Duration,
}

pub(crate) struct SessionEntry {
    pub(crate) name: String,
    pub(crate) events: mpsc::UnboundedSender<CoordinationEvent>,
    pub(crate) faults: SessionFaults,
}

#[derive(Default)]
struct Tree {
    nodes: HashMap<String, NodeEntry>,
    watches: WatchRegistry,
    versions: u64,
}

impl Tree {
    fn next_version(&mut self) -> u64 {
        let version = self.versions;
        self.versions += 1;
        version
    }
}

pub(crate) struct Shared {
    config: CoordinatorConfig,
    tree: Mutex<Tree>,
    sessions: DashMap<SessionId, SessionEntry>,
    next_session: AtomicU64,
    stats: RwLock<CoordinatorStats>,
}

/// In-memory coordination service.
///
/// Cloning yields another handle to the same tree.
#[derive(Clone)]
pub struct MemoryCoordinator {
    shared: Arc<Shared>,
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::with_config(CoordinatorConfig::default())
    }

    pub fn with_config(config: CoordinatorConfig) -> Self {
        info!("In-memory coordinator initialized with config: {:?}", config);
        Self {
            shared: Arc::new(Shared {
                config,
                tree: Mutex::new(Tree::default()),
                sessions: DashMap::new(),
                next_session: AtomicU64::new(1),
                stats: RwLock::new(CoordinatorStats::default()),
            }),
        }
    }

    /// Opens a session. `Connected` is the first event on the returned
    /// receiver.
    pub fn connect(
        &self,
        name: &str,
    ) -> (MemorySession, mpsc::UnboundedReceiver<CoordinationEvent>) {
        let id = self.shared.next_session.fetch_add(1, Ordering::AcqRel);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let _ = events_tx.send(CoordinationEvent::Connected);

        self.shared.sessions.insert(
            id,
            SessionEntry {
                name: name.to_string(),
                events: events_tx,
                faults: SessionFaults::default(),
            },
        );
        self.shared.stats.write().sessions_opened += 1;
        debug!("Session {} opened for {}", id, name);

        (
            MemorySession::new(id, name.to_string(), Arc::clone(&self.shared)),
            events_rx,
        )
    }

    /// Expires a session as the service would after a lost heartbeat: its
    /// ephemeral nodes are removed, watchers of those nodes are notified and
    /// the session itself receives `Disconnected`.
    pub fn expire_session(&self, session: SessionId) {
        self.shared.end_session(session, Some("session expired"));
    }

    pub fn node(&self, path: &str) -> Option<NodeEntry> {
        self.shared.tree.lock().nodes.get(path).cloned()
    }

    pub fn exists(&self, path: &str) -> bool {
        self.shared.tree.lock().nodes.contains_key(path)
    }

    pub fn watcher_count(&self, path: &str) -> usize {
        self.shared.tree.lock().watches.watcher_count(path)
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }

    pub fn get_stats(&self) -> CoordinatorStats {
        self.shared.stats.read().clone()
    }
}

impl Shared {
    /// Admits one operation of `session`: returns the latency to apply, or
    /// the outcome the operation must fail with.
    pub(crate) fn admit(&self, session: SessionId) -> Result<Duration, OpOutcome> {
        self.stats.write().total_operations += 1;

        let mut entry = match self.sessions.get_mut(&session) {
            Some(entry) => entry,
            None => return Err(OpOutcome::ConnectionLost),
        };

        if let Some(outcome) = entry.faults.queued.pop_front() {
            debug!(
                "Injected {:?} into operation of session {} ({})",
                outcome, session, entry.name
            );
            drop(entry);
            self.stats.write().injected_failures += 1;
            return Err(outcome);
        }

        Ok(self.config.op_latency + entry.faults.latency)
    }

    pub(crate) fn queue_failures(&self, session: SessionId, outcome: OpOutcome, count: usize) {
        if let Some(mut entry) = self.sessions.get_mut(&session) {
            entry
                .faults
                .queued
                .extend(std::iter::repeat(outcome).take(count));
        }
    }

    pub(crate) fn set_latency(&self, session: SessionId, latency: Duration) {
        if let Some(mut entry) = self.sessions.get_mut(&session) {
            entry.faults.latency = latency;
        }
    }

    pub(crate) fn is_alive(&self, session: SessionId) -> bool {
        self.sessions.contains_key(&session)
    }

    pub(crate) fn create(&self, session: SessionId, path: &str, payload: Bytes) -> OpOutcome {
        let mut tree = self.tree.lock();
        if !self.is_alive(session) {
            return OpOutcome::ConnectionLost;
        }
        if tree.nodes.contains_key(path) {
            return OpOutcome::AlreadyExists;
        }
        if tree.nodes.len() >= self.config.max_nodes {
            return OpOutcome::Timeout;
        }

        let version = tree.next_version();
        tree.nodes.insert(
            path.to_string(),
            NodeEntry {
                payload,
                version,
                owner: session,
            },
        );
        self.stats.write().nodes_created += 1;
        self.fire(&mut tree, path, |path| CoordinationEvent::NodeCreated { path });

        debug!("CREATE {} by session {}", path, session);
        OpOutcome::Created
    }

    pub(crate) fn delete(&self, session: SessionId, path: &str) -> OpOutcome {
        let mut tree = self.tree.lock();
        if !self.is_alive(session) {
            return OpOutcome::ConnectionLost;
        }
        if tree.nodes.remove(path).is_none() {
            return OpOutcome::NoNode;
        }

        self.stats.write().nodes_deleted += 1;
        self.fire(&mut tree, path, |path| CoordinationEvent::NodeDeleted { path });

        debug!("DELETE {} by session {}", path, session);
        OpOutcome::Deleted
    }

    pub(crate) fn read(&self, session: SessionId, path: &str) -> OpOutcome {
        let tree = self.tree.lock();
        if !self.is_alive(session) {
            return OpOutcome::ConnectionLost;
        }
        match tree.nodes.get(path) {
            Some(node) => OpOutcome::Data {
                payload: node.payload.clone(),
                version: node.version,
            },
            None => OpOutcome::NoNode,
        }
    }

    pub(crate) fn write(
        &self,
        session: SessionId,
        path: &str,
        payload: Bytes,
        expected_version: Option<u64>,
    ) -> OpOutcome {
        let mut tree = self.tree.lock();
        if !self.is_alive(session) {
            return OpOutcome::ConnectionLost;
        }

        let current = match tree.nodes.get(path) {
            None => return OpOutcome::NoNode,
            Some(node) => node.version,
        };
        let accepted = match expected_version {
            Some(expected) if expected != current => None,
            _ => {
                let version = tree.next_version();
                if let Some(node) = tree.nodes.get_mut(path) {
                    node.payload = payload;
                    node.version = version;
                }
                Some(version)
            }
        };

        let Some(version) = accepted else {
            drop(tree);
            self.stats.write().rejected_writes += 1;
            debug!(
                "WRITE {} rejected: expected version {:?} is stale",
                path, expected_version
            );
            return OpOutcome::BadVersion;
        };

        self.stats.write().writes += 1;
        self.fire(&mut tree, path, |path| CoordinationEvent::NodeDataChanged {
            path,
        });

        OpOutcome::Written { version }
    }

    pub(crate) fn watch(&self, session: SessionId, path: &str) -> OpOutcome {
        let mut tree = self.tree.lock();
        if !self.is_alive(session) {
            return OpOutcome::ConnectionLost;
        }
        tree.watches.register(path, session);
        OpOutcome::Exists(tree.nodes.contains_key(path))
    }

    /// Removes a session. With a reason the session is told it was
    /// disconnected; a voluntary close is silent.
    pub(crate) fn end_session(&self, session: SessionId, reason: Option<&str>) {
        let entry = match self.sessions.remove(&session) {
            Some((_, entry)) => entry,
            None => return,
        };

        let mut tree = self.tree.lock();
        tree.watches.drop_session(session);

        let owned: Vec<String> = tree
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == session)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &owned {
            tree.nodes.remove(path);
            self.fire(&mut tree, path, |path| CoordinationEvent::NodeDeleted { path });
        }
        drop(tree);

        {
            let mut stats = self.stats.write();
            stats.nodes_deleted += owned.len() as u64;
            if reason.is_some() {
                stats.sessions_expired += 1;
            }
        }

        if let Some(reason) = reason {
            let _ = entry.events.send(CoordinationEvent::Disconnected {
                reason: reason.to_string(),
            });
        }

        info!(
            "Session {} ({}) ended, reclaimed {} ephemeral node(s)",
            session,
            entry.name,
            owned.len()
        );
    }

    fn fire(&self, tree: &mut Tree, path: &str, event: impl Fn(String) -> CoordinationEvent) {
        let watchers = tree.watches.take(path);
        let mut fired = 0;
        for watcher in watchers {
            if let Some(entry) = self.sessions.get(&watcher) {
                if entry.events.send(event(path.to_string())).is_ok() {
                    fired += 1;
                }
            }
        }
        if fired > 0 {
            self.stats.write().watches_fired += fired;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use timemaster_core::CoordinationService;

    fn drain(rx: &mut mpsc::UnboundedReceiver<CoordinationEvent>) -> Vec<CoordinationEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_create_and_race() {
        let coordinator = MemoryCoordinator::new();
        let (first, mut first_rx) = coordinator.connect("m1");
        let (second, _second_rx) = coordinator.connect("m2");

        assert_eq!(drain(&mut first_rx), vec![CoordinationEvent::Connected]);

        let outcome = first.create_ephemeral("/tm", Bytes::from("m1;1000")).await;
        assert_eq!(outcome, OpOutcome::Created);

        let outcome = second.create_ephemeral("/tm", Bytes::from("m2;1000")).await;
        assert_eq!(outcome, OpOutcome::AlreadyExists);

        let node = coordinator.node("/tm").unwrap();
        assert_eq!(node.payload, Bytes::from("m1;1000"));
        assert_eq!(node.owner, first.id());
    }

    #[tokio::test]
    async fn test_versioned_write() {
        let coordinator = MemoryCoordinator::new();
        let (session, _rx) = coordinator.connect("m1");

        session.create_ephemeral("/tm", Bytes::from("a")).await;
        let outcome = session.write("/tm", Bytes::from("b"), Some(0)).await;
        assert_eq!(outcome, OpOutcome::Written { version: 1 });

        let outcome = session.write("/tm", Bytes::from("c"), Some(0)).await;
        assert_eq!(outcome, OpOutcome::BadVersion);

        let outcome = session.write("/tm", Bytes::from("c"), None).await;
        assert_eq!(outcome, OpOutcome::Written { version: 2 });

        let outcome = session.write("/missing", Bytes::from("c"), None).await;
        assert_eq!(outcome, OpOutcome::NoNode);
        assert_eq!(coordinator.get_stats().rejected_writes, 1);
    }

    #[tokio::test]
    async fn test_recreated_node_never_repeats_a_version() {
        let coordinator = MemoryCoordinator::new();
        let (session, _rx) = coordinator.connect("m1");

        session.create_ephemeral("/tm", Bytes::from("a")).await;
        session.write("/tm", Bytes::from("b"), None).await;
        session.delete("/tm").await;
        session.create_ephemeral("/tm", Bytes::from("c")).await;

        // A writer still holding version 1 from the old incarnation is refused.
        assert_eq!(coordinator.node("/tm").unwrap().version, 2);
        let outcome = session.write("/tm", Bytes::from("stale"), Some(1)).await;
        assert_eq!(outcome, OpOutcome::BadVersion);
    }

    #[tokio::test]
    async fn test_watch_is_one_shot() {
        let coordinator = MemoryCoordinator::new();
        let (writer, _writer_rx) = coordinator.connect("writer");
        let (watcher, mut watcher_rx) = coordinator.connect("watcher");
        drain(&mut watcher_rx);

        assert_eq!(watcher.watch_existence("/tm").await, OpOutcome::Exists(false));
        writer.create_ephemeral("/tm", Bytes::from("x")).await;
        writer.write("/tm", Bytes::from("y"), None).await;

        assert_eq!(
            drain(&mut watcher_rx),
            vec![CoordinationEvent::NodeCreated {
                path: "/tm".to_string()
            }]
        );

        assert_eq!(watcher.watch_existence("/tm").await, OpOutcome::Exists(true));
        writer.write("/tm", Bytes::from("z"), None).await;
        assert_eq!(
            drain(&mut watcher_rx),
            vec![CoordinationEvent::NodeDataChanged {
                path: "/tm".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_expiry_reclaims_ephemeral_nodes() {
        let coordinator = MemoryCoordinator::new();
        let (owner, mut owner_rx) = coordinator.connect("owner");
        let (watcher, mut watcher_rx) = coordinator.connect("watcher");
        drain(&mut owner_rx);
        drain(&mut watcher_rx);

        owner.create_ephemeral("/tm", Bytes::from("x")).await;
        watcher.watch_existence("/tm").await;

        coordinator.expire_session(owner.id());

        assert!(!coordinator.exists("/tm"));
        assert_eq!(
            drain(&mut watcher_rx),
            vec![CoordinationEvent::NodeDeleted {
                path: "/tm".to_string()
            }]
        );
        assert!(matches!(
            drain(&mut owner_rx).as_slice(),
            [CoordinationEvent::Disconnected { .. }]
        ));
        assert_eq!(owner.read("/tm").await, OpOutcome::ConnectionLost);
        assert_eq!(coordinator.get_stats().sessions_expired, 1);
    }

    #[tokio::test]
    async fn test_close_is_silent() {
        let coordinator = MemoryCoordinator::new();
        let (session, mut rx) = coordinator.connect("m1");
        drain(&mut rx);

        session.create_ephemeral("/flag", Bytes::from_static(b"0")).await;
        session.close().await;

        assert!(!coordinator.exists("/flag"));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(coordinator.session_count(), 0);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let coordinator = MemoryCoordinator::new();
        let (session, _rx) = coordinator.connect("m1");

        session.fail_next(OpOutcome::Timeout, 2);
        assert_eq!(session.read("/tm").await, OpOutcome::Timeout);
        assert_eq!(
            session.create_ephemeral("/tm", Bytes::from("x")).await,
            OpOutcome::Timeout
        );
        assert_eq!(
            session.create_ephemeral("/tm", Bytes::from("x")).await,
            OpOutcome::Created
        );
        assert_eq!(coordinator.get_stats().injected_failures, 2);
    }
}
