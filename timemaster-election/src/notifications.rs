//! Notification bus for role changes.

use std::collections::HashMap;
use std::sync::Arc;
use timemaster_core::time::unix_millis;
use timemaster_core::MasterId;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

/// What happened to a participant's role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleChange {
    /// The participant created the active-heartbeat node
    Elected,
    /// The participant is bound to another active
    Standby { active: Option<MasterId> },
    /// The participant lost the active role
    Demoted { reason: String },
    /// A standby started contending after suspecting the active
    FailoverStarted,
    /// The notification flag was won
    FailoverWon,
    /// The flag was lost, or there was no time left to contend
    FailoverLost,
    /// The flag winner released the flag
    FlagReleased,
    /// The participant left the election
    Stopped { reason: String },
}

impl RoleChange {
    fn is_failover(&self) -> bool {
        matches!(
            self,
            RoleChange::FailoverStarted
                | RoleChange::FailoverWon
                | RoleChange::FailoverLost
                | RoleChange::FlagReleased
        )
    }
}

/// A role change together with who it happened to and when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleNotification {
    pub master_id: MasterId,
    pub change: RoleChange,
    /// Wall-clock milliseconds at publication
    pub timestamp: i64,
}

/// Subscription filter for notifications
#[derive(Clone)]
pub enum NotificationFilter {
    All,
    /// Failover milestones only
    Failover,
    /// Changes of one participant
    Participant(MasterId),
    Custom(Arc<dyn Fn(&RoleNotification) -> bool + Send + Sync>),
}

impl NotificationFilter {
    fn matches(&self, notification: &RoleNotification) -> bool {
        match self {
            NotificationFilter::All => true,
            NotificationFilter::Failover => notification.change.is_failover(),
            NotificationFilter::Participant(id) => notification.master_id == *id,
            NotificationFilter::Custom(func) => func(notification),
        }
    }
}

pub type SubscriptionId = Uuid;

/// Statistics about notification delivery
#[derive(Debug, Default, Clone)]
pub struct NotificationStats {
    pub notifications_sent: u64,
    pub notifications_delivered: u64,
    pub notifications_dropped: u64,
    pub active_subscriptions: usize,
    pub total_subscriptions: u64,
}

type SubscriberMap =
    HashMap<SubscriptionId, (NotificationFilter, mpsc::UnboundedSender<RoleNotification>)>;

/// Fan-out of role changes. Several orchestrators may publish to one bus.
pub struct RoleNotificationBus {
    broadcast_tx: broadcast::Sender<RoleNotification>,
    subscribers: Arc<RwLock<SubscriberMap>>,
    stats: Arc<RwLock<NotificationStats>>,
}

impl Default for RoleNotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl RoleNotificationBus {
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(capacity);

        Self {
            broadcast_tx,
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(NotificationStats::default())),
        }
    }

    /// Subscribe to notifications with a filter
    pub async fn subscribe(
        &self,
        filter: NotificationFilter,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<RoleNotification>) {
        let subscription_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut subscribers = self.subscribers.write().await;
            subscribers.insert(subscription_id, (filter, tx));

            let mut stats = self.stats.write().await;
            stats.active_subscriptions = subscribers.len();
            stats.total_subscriptions += 1;
        }

        debug!("Created subscription {}", subscription_id);
        (subscription_id, rx)
    }

    /// Unfiltered, lossy view of every notification published from now on.
    pub fn subscribe_all(&self) -> broadcast::Receiver<RoleNotification> {
        self.broadcast_tx.subscribe()
    }

    pub async fn unsubscribe(&self, subscription_id: SubscriptionId) {
        let mut subscribers = self.subscribers.write().await;

        if subscribers.remove(&subscription_id).is_some() {
            debug!("Removed subscription {}", subscription_id);

            let mut stats = self.stats.write().await;
            stats.active_subscriptions = subscribers.len();
        }
    }

    pub async fn publish(&self, master_id: &MasterId, change: RoleChange) {
        let notification = RoleNotification {
            master_id: master_id.clone(),
            change,
            timestamp: unix_millis().unwrap_or_default(),
        };

        // No broadcast receivers is not an error.
        let _ = self.broadcast_tx.send(notification.clone());

        let mut delivered = 0;
        let mut dropped = 0;
        {
            let subscribers = self.subscribers.read().await;
            for (filter, tx) in subscribers.values() {
                if filter.matches(&notification) {
                    match tx.send(notification.clone()) {
                        Ok(_) => delivered += 1,
                        Err(_) => {
                            dropped += 1;
                            warn!("Failed to deliver notification to subscriber");
                        }
                    }
                }
            }
        }

        let mut stats = self.stats.write().await;
        stats.notifications_sent += 1;
        stats.notifications_delivered += delivered;
        stats.notifications_dropped += dropped;
    }

    pub async fn get_stats(&self) -> NotificationStats {
        self.stats.read().await.clone()
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}
