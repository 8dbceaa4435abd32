use crate::store::{SessionId, Shared};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use timemaster_core::{CoordinationService, OpOutcome};

/// One client session of a [`MemoryCoordinator`](crate::MemoryCoordinator).
pub struct MemorySession {
    id: SessionId,
    name: String,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for MemorySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySession")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl MemorySession {
    pub(crate) fn new(id: SessionId, name: String, shared: Arc<Shared>) -> Self {
        Self { id, name, shared }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_alive(&self) -> bool {
        self.shared.is_alive(self.id)
    }

    /// Makes the next `count` operations of this session fail with `outcome`.
    pub fn fail_next(&self, outcome: OpOutcome, count: usize) {
        self.shared.queue_failures(self.id, outcome, count);
    }

    /// Delays every later operation of this session. A large value freezes a
    /// participant without ending its session.
    pub fn set_latency(&self, latency: Duration) {
        self.shared.set_latency(self.id, latency);
    }

    async fn admit(&self) -> Result<(), OpOutcome> {
        let latency = self.shared.admit(self.id)?;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationService for MemorySession {
    async fn create_ephemeral(&self, path: &str, payload: Bytes) -> OpOutcome {
        if let Err(outcome) = self.admit().await {
            return outcome;
        }
        self.shared.create(self.id, path, payload)
    }

    async fn delete(&self, path: &str) -> OpOutcome {
        if let Err(outcome) = self.admit().await {
            return outcome;
        }
        self.shared.delete(self.id, path)
    }

    async fn read(&self, path: &str) -> OpOutcome {
        if let Err(outcome) = self.admit().await {
            return outcome;
        }
        self.shared.read(self.id, path)
    }

    async fn write(&self, path: &str, payload: Bytes, expected_version: Option<u64>) -> OpOutcome {
        if let Err(outcome) = self.admit().await {
            return outcome;
        }
        self.shared.write(self.id, path, payload, expected_version)
    }

    async fn watch_existence(&self, path: &str) -> OpOutcome {
        if let Err(outcome) = self.admit().await {
            return outcome;
        }
        self.shared.watch(self.id, path)
    }

    async fn close(&self) {
        self.shared.end_session(self.id, None);
    }
}

#[cfg(test)]
mod tests {
    use crate::MemoryCoordinator;
    use std::time::Duration;
    use timemaster_core::{CoordinationService, OpOutcome};

    #[tokio::test(start_paused = true)]
    async fn test_latency_delays_operations() {
        let coordinator = MemoryCoordinator::new();
        let (session, _rx) = coordinator.connect("slow");
        session.set_latency(Duration::from_millis(250));

        let started = tokio::time::Instant::now();
        assert_eq!(session.read("/tm").await, OpOutcome::NoNode);
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_closed_session_reports_connection_lost() {
        let coordinator = MemoryCoordinator::new();
        let (session, _rx) = coordinator.connect("m1");
        session.close().await;

        assert!(!session.is_alive());
        assert_eq!(session.watch_existence("/tm").await, OpOutcome::ConnectionLost);
    }
}
