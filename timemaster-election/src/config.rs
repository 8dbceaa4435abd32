use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use timemaster_core::codec::FIELD_DELIMITER;
use timemaster_core::{MasterId, NodeKind, Result, TimeMasterError};

/// Default path of the notification flag node.
pub const DEFAULT_NOTIFICATION_FLAG_PATH: &str = "/dpw0001241564/tm_tzrzn";

/// Timing parameters of the protocol.
///
/// Every participant of a fleet must use the same values: standbys judge the
/// active against `max_update_miss` and contend for the flag within
/// `notification_window` of the last heartbeat they saw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TimingSettings", into = "TimingSettings")]
pub struct TimingConfig {
    /// Pause between two control-loop cycles
    pub interval: Duration,
    /// Heartbeat age after which the active is considered failed
    pub max_update_miss: Duration,
    /// How long after the last heartbeat a standby may still contend
    pub notification_window: Duration,
    /// Upper bound on waiting behind a flag held by someone else
    pub very_long_wait: Duration,
    /// Pause of the flag winner before it touches the active node
    pub grace_period: Duration,
    /// Upper bound of the random part of the settling delay
    pub settle_jitter: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000))
    }
}

impl TimingConfig {
    /// Derives every other parameter from the cycle interval.
    pub fn new(interval: Duration) -> Self {
        let notification_window = Duration::from_secs(30);
        Self {
            interval,
            max_update_miss: interval * 2,
            notification_window,
            very_long_wait: notification_window * 15,
            grace_period: Duration::from_secs(5),
            settle_jitter: interval / 2,
        }
    }

    /// Sets the interval and re-derives `max_update_miss` and `settle_jitter`.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self.max_update_miss = interval * 2;
        self.settle_jitter = interval / 2;
        self
    }

    pub fn with_max_update_miss(mut self, max_update_miss: Duration) -> Self {
        self.max_update_miss = max_update_miss;
        self
    }

    /// Sets the window and re-derives `very_long_wait`.
    pub fn with_notification_window(mut self, window: Duration) -> Self {
        self.notification_window = window;
        self.very_long_wait = window * 15;
        self
    }

    pub fn with_very_long_wait(mut self, wait: Duration) -> Self {
        self.very_long_wait = wait;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn with_settle_jitter(mut self, jitter: Duration) -> Self {
        self.settle_jitter = jitter;
        self
    }

    pub fn interval_ms(&self) -> i64 {
        millis(self.interval)
    }

    pub fn max_update_miss_ms(&self) -> i64 {
        millis(self.max_update_miss)
    }

    pub fn notification_window_ms(&self) -> i64 {
        millis(self.notification_window)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(TimeMasterError::config("interval must be positive"));
        }
        if self.max_update_miss < self.interval {
            return Err(TimeMasterError::config(format!(
                "max_update_miss ({:?}) must not be shorter than interval ({:?})",
                self.max_update_miss, self.interval
            )));
        }
        if self.notification_window.is_zero() {
            return Err(TimeMasterError::config("notification_window must be positive"));
        }
        if self.very_long_wait.is_zero() {
            return Err(TimeMasterError::config("very_long_wait must be positive"));
        }
        Ok(())
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// On-disk shape of [`TimingConfig`]: milliseconds, derived values optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct TimingSettings {
    interval_ms: u64,
    #[serde(default)]
    max_update_miss_ms: Option<u64>,
    #[serde(default)]
    notification_window_ms: Option<u64>,
    #[serde(default)]
    very_long_wait_ms: Option<u64>,
    #[serde(default)]
    grace_period_ms: Option<u64>,
    #[serde(default)]
    settle_jitter_ms: Option<u64>,
}

impl TryFrom<TimingSettings> for TimingConfig {
    type Error = TimeMasterError;

    fn try_from(settings: TimingSettings) -> Result<Self> {
        let mut timing = TimingConfig::new(Duration::from_millis(settings.interval_ms));
        if let Some(ms) = settings.max_update_miss_ms {
            timing = timing.with_max_update_miss(Duration::from_millis(ms));
        }
        if let Some(ms) = settings.notification_window_ms {
            timing = timing.with_notification_window(Duration::from_millis(ms));
        }
        if let Some(ms) = settings.very_long_wait_ms {
            timing = timing.with_very_long_wait(Duration::from_millis(ms));
        }
        if let Some(ms) = settings.grace_period_ms {
            timing = timing.with_grace_period(Duration::from_millis(ms));
        }
        if let Some(ms) = settings.settle_jitter_ms {
            timing = timing.with_settle_jitter(Duration::from_millis(ms));
        }
        timing.validate()?;
        Ok(timing)
    }
}

impl From<TimingConfig> for TimingSettings {
    fn from(timing: TimingConfig) -> Self {
        let ms = |d: Duration| u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
        Self {
            interval_ms: ms(timing.interval),
            max_update_miss_ms: Some(ms(timing.max_update_miss)),
            notification_window_ms: Some(ms(timing.notification_window)),
            very_long_wait_ms: Some(ms(timing.very_long_wait)),
            grace_period_ms: Some(ms(timing.grace_period)),
            settle_jitter_ms: Some(ms(timing.settle_jitter)),
        }
    }
}

/// Coordination paths of the three shared nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodePaths {
    pub active_heartbeat: String,
    pub listeners: String,
    pub notification_flag: String,
}

impl Default for NodePaths {
    fn default() -> Self {
        Self {
            active_heartbeat: "/timemaster/active".to_string(),
            listeners: "/timemaster/listeners".to_string(),
            notification_flag: DEFAULT_NOTIFICATION_FLAG_PATH.to_string(),
        }
    }
}

impl NodePaths {
    pub fn new(active_heartbeat: impl Into<String>, listeners: impl Into<String>) -> Self {
        Self {
            active_heartbeat: active_heartbeat.into(),
            listeners: listeners.into(),
            ..Self::default()
        }
    }

    pub fn with_notification_flag(mut self, path: impl Into<String>) -> Self {
        self.notification_flag = path.into();
        self
    }

    pub fn path(&self, kind: NodeKind) -> &str {
        match kind {
            NodeKind::ActiveHeartbeat => &self.active_heartbeat,
            NodeKind::Listeners => &self.listeners,
            NodeKind::NotificationFlag => &self.notification_flag,
        }
    }

    /// Maps a notification path back to the node it names.
    pub fn kind_of(&self, path: &str) -> Option<NodeKind> {
        [
            NodeKind::ActiveHeartbeat,
            NodeKind::Listeners,
            NodeKind::NotificationFlag,
        ]
        .into_iter()
        .find(|kind| self.path(*kind) == path)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, path) in [
            ("active_heartbeat", &self.active_heartbeat),
            ("listeners", &self.listeners),
            ("notification_flag", &self.notification_flag),
        ] {
            if !path.starts_with('/') || path.len() < 2 {
                return Err(TimeMasterError::config(format!(
                    "{name} path {path:?} must be absolute"
                )));
            }
        }
        if self.active_heartbeat == self.listeners
            || self.active_heartbeat == self.notification_flag
            || self.listeners == self.notification_flag
        {
            return Err(TimeMasterError::config("node paths must be distinct"));
        }
        Ok(())
    }
}

/// Everything one participant needs to join the election.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionConfig {
    pub master_id: MasterId,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub paths: NodePaths,
    /// Seed for the settling jitter; random when absent
    #[serde(default)]
    pub randomization_seed: Option<u64>,
}

impl ElectionConfig {
    pub fn new(master_id: impl Into<MasterId>) -> Self {
        Self {
            master_id: master_id.into(),
            timing: TimingConfig::default(),
            paths: NodePaths::default(),
            randomization_seed: None,
        }
    }

    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_paths(mut self, paths: NodePaths) -> Self {
        self.paths = paths;
        self
    }

    pub fn with_randomization_seed(mut self, seed: u64) -> Self {
        self.randomization_seed = Some(seed);
        self
    }

    /// Parses and validates a JSON document.
    ///
    /// ```rust
    /// use timemaster_election::ElectionConfig;
    ///
    /// let config = ElectionConfig::from_json_str(
    ///     r#"{ "master_id": "tm-1", "timing": { "interval_ms": 500 } }"#,
    /// ).unwrap();
    /// assert_eq!(config.timing.max_update_miss_ms(), 1000);
    /// ```
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: ElectionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        let id = self.master_id.as_str();
        if id.is_empty() {
            return Err(TimeMasterError::config("master_id must not be empty"));
        }
        if id.contains(FIELD_DELIMITER) {
            return Err(TimeMasterError::config(format!(
                "master_id {id:?} must not contain {FIELD_DELIMITER:?}"
            )));
        }
        self.timing.validate()?;
        self.paths.validate()
    }
}
