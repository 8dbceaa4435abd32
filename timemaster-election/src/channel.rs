//! Adaptation layer between a [`CoordinationService`] session and the
//! election event loop.
//!
//! Every operation runs on its own task and reports back as an
//! [`ElectionEvent::OpResult`] tagged with the [`OpId`] returned when it was
//! issued. Session notifications are translated from paths to [`NodeKind`]s and
//! fed into the same channel, so the orchestrator sees one ordered stream.

use crate::config::NodePaths;
use crate::events::ElectionEvent;
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use timemaster_core::{CoordinationEvent, CoordinationService, NodeKind, OpId, OpOutcome};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

pub struct CoordinationChannel {
    service: Arc<dyn CoordinationService>,
    paths: NodePaths,
    events: mpsc::UnboundedSender<ElectionEvent>,
    last_op: OpId,
}

impl CoordinationChannel {
    pub fn new(
        service: Arc<dyn CoordinationService>,
        paths: NodePaths,
        events: mpsc::UnboundedSender<ElectionEvent>,
    ) -> Self {
        Self {
            service,
            paths,
            events,
            last_op: OpId(0),
        }
    }

    pub fn paths(&self) -> &NodePaths {
        &self.paths
    }

    /// Forwards session notifications until the session's event stream ends,
    /// which is reported as a disconnection.
    pub fn forward_events(
        &self,
        mut session_events: mpsc::UnboundedReceiver<CoordinationEvent>,
    ) -> JoinHandle<()> {
        let paths = self.paths.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            while let Some(event) = session_events.recv().await {
                let Some(translated) = translate(&paths, event) else {
                    continue;
                };
                if events.send(translated).is_err() {
                    return;
                }
            }
            let _ = events.send(ElectionEvent::Disconnected {
                reason: "coordination event stream closed".to_string(),
            });
        })
    }

    pub fn create(&mut self, kind: NodeKind, payload: Bytes) -> OpId {
        self.issue(kind, move |service, path| async move {
            service.create_ephemeral(&path, payload).await
        })
    }

    pub fn delete(&mut self, kind: NodeKind) -> OpId {
        self.issue(kind, |service, path| async move { service.delete(&path).await })
    }

    pub fn read(&mut self, kind: NodeKind) -> OpId {
        self.issue(kind, |service, path| async move { service.read(&path).await })
    }

    pub fn write(&mut self, kind: NodeKind, payload: Bytes, expected_version: Option<u64>) -> OpId {
        self.issue(kind, move |service, path| async move {
            service.write(&path, payload, expected_version).await
        })
    }

    pub fn watch(&mut self, kind: NodeKind) -> OpId {
        self.issue(kind, |service, path| async move {
            service.watch_existence(&path).await
        })
    }

    /// Ends the session; ephemeral nodes it holds are released.
    pub async fn close(&self) {
        self.service.close().await;
    }

    fn issue<F, Fut>(&mut self, kind: NodeKind, op: F) -> OpId
    where
        F: FnOnce(Arc<dyn CoordinationService>, String) -> Fut,
        Fut: Future<Output = OpOutcome> + Send + 'static,
    {
        self.last_op = self.last_op.next();
        let op_id = self.last_op;
        let path = self.paths.path(kind).to_string();
        trace!("Issuing {} on {}", op_id, path);

        let pending = op(Arc::clone(&self.service), path);
        let events = self.events.clone();
        tokio::spawn(async move {
            let outcome = pending.await;
            if events.send(ElectionEvent::OpResult { op_id, outcome }).is_err() {
                debug!("Result of {} dropped, election loop is gone", op_id);
            }
        });

        op_id
    }
}

fn translate(paths: &NodePaths, event: CoordinationEvent) -> Option<ElectionEvent> {
    let kind_of = |path: &str| {
        let kind = paths.kind_of(path);
        if kind.is_none() {
            trace!("Ignoring notification for unrelated path {}", path);
        }
        kind
    };

    match event {
        CoordinationEvent::Connected => Some(ElectionEvent::Connected),
        CoordinationEvent::Disconnected { reason } => Some(ElectionEvent::Disconnected { reason }),
        CoordinationEvent::NodeCreated { path } => kind_of(&path).map(ElectionEvent::NodeCreated),
        CoordinationEvent::NodeDeleted { path } => kind_of(&path).map(ElectionEvent::NodeDeleted),
        CoordinationEvent::NodeDataChanged { path } => {
            kind_of(&path).map(ElectionEvent::NodeDataChanged)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use timemaster_coordination::MemoryCoordinator;

    fn channel(
        coordinator: &MemoryCoordinator,
        name: &str,
    ) -> (
        CoordinationChannel,
        mpsc::UnboundedReceiver<CoordinationEvent>,
        mpsc::UnboundedReceiver<ElectionEvent>,
    ) {
        let (session, session_events) = coordinator.connect(name);
        let (tx, rx) = mpsc::unbounded_channel();
        (
            CoordinationChannel::new(Arc::new(session), NodePaths::default(), tx),
            session_events,
            rx,
        )
    }

    #[tokio::test]
    async fn test_results_carry_op_ids() {
        let coordinator = MemoryCoordinator::new();
        let (mut channel, _session_events, mut rx) = channel(&coordinator, "m1");

        let create = channel.create(NodeKind::ActiveHeartbeat, Bytes::from("m1;1"));
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            ElectionEvent::OpResult {
                op_id: create,
                outcome: OpOutcome::Created
            }
        );

        let read = channel.read(NodeKind::NotificationFlag);
        assert!(read > create);
        assert_eq!(
            rx.recv().await.unwrap(),
            ElectionEvent::OpResult {
                op_id: read,
                outcome: OpOutcome::NoNode
            }
        );
    }

    #[tokio::test]
    async fn test_notifications_are_translated() {
        let coordinator = MemoryCoordinator::new();
        let (mut watcher, session_events, mut rx) = channel(&coordinator, "m1");
        let _forwarder = watcher.forward_events(session_events);

        assert_eq!(rx.recv().await.unwrap(), ElectionEvent::Connected);

        let watch = watcher.watch(NodeKind::Listeners);
        assert_eq!(
            rx.recv().await.unwrap(),
            ElectionEvent::OpResult {
                op_id: watch,
                outcome: OpOutcome::Exists(false)
            }
        );

        let (other, _other_events) = coordinator.connect("ticker");
        let path = NodePaths::default().listeners;
        other.create_ephemeral(&path, Bytes::from("x;1")).await;

        assert_eq!(
            rx.recv().await.unwrap(),
            ElectionEvent::NodeCreated(NodeKind::Listeners)
        );
    }

    #[tokio::test]
    async fn test_expiry_reported_as_disconnection() {
        let coordinator = MemoryCoordinator::new();
        let (watcher, session_events, mut rx) = channel(&coordinator, "m1");
        let _forwarder = watcher.forward_events(session_events);
        assert_eq!(rx.recv().await.unwrap(), ElectionEvent::Connected);

        coordinator.expire_session(1);
        assert!(matches!(
            rx.recv().await.unwrap(),
            ElectionEvent::Disconnected { .. }
        ));
    }

    #[test]
    fn test_unrelated_paths_are_dropped() {
        let paths = NodePaths::default();
        assert_eq!(
            translate(
                &paths,
                CoordinationEvent::NodeDeleted {
                    path: "/other".to_string()
                }
            ),
            None
        );
        assert_eq!(
            translate(
                &paths,
                CoordinationEvent::NodeDeleted {
                    path: paths.active_heartbeat.clone()
                }
            ),
            Some(ElectionEvent::NodeDeleted(NodeKind::ActiveHeartbeat))
        );
    }
}
