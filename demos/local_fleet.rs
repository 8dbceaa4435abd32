//! Runs a small fleet on one host and kills its active participant.
//!
//! Three participants share an in-memory coordinator. Once one of them is
//! active and heart-beating, its session is expired as if the process had
//! died, and a standby takes over.
//!
//! Authoritative time comes from the host clock unless
//! `TIMEMASTER_NTP_SERVERS` lists SNTP servers (comma separated). An optional
//! first argument points to a JSON timing file, e.g. `{ "interval_ms": 500 }`.
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use anyhow::{bail, Context};
use std::sync::Arc;
use std::time::Duration;
use timemaster_coordination::MemoryCoordinator;
use timemaster_core::{
    codec, ActiveRecord, CoordinationService, ElectionPhase, MasterId, OpOutcome, SystemClock,
    TimeSource,
};
use timemaster_election::{
    ElectionConfig, ElectionHandle, ElectionOrchestrator, NotificationFilter, RoleNotificationBus,
    TimingConfig,
};
use timemaster_ntp::{SntpConfig, SntpTimeSource};
use tokio::time::{sleep, timeout};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const FLEET: [&str; 3] = ["tm-1", "tm-2", "tm-3"];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let timing = load_timing()?;
    let time_source = time_source()?;
    info!("Starting local fleet with {:?}", timing);

    let coordinator = MemoryCoordinator::new();
    let bus = Arc::new(RoleNotificationBus::new());
    let (_, mut notifications) = bus.subscribe(NotificationFilter::All).await;
    tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            info!("[{}] {:?}", notification.master_id, notification.change);
        }
    });

    let (listeners, _listener_events) = coordinator.connect("listeners");
    let first = ActiveRecord::new(MasterId::new("listeners"), time_source.now_millis().await?);
    let paths = ElectionConfig::new("listeners").paths;
    match listeners
        .create_ephemeral(&paths.listeners, codec::encode(&first)?)
        .await
    {
        OpOutcome::Created => info!("Listeners node {} created", paths.listeners),
        other => bail!("could not create the listeners node: {:?}", other),
    }

    let mut handles = Vec::new();
    let mut sessions = Vec::new();
    for id in FLEET {
        let config = ElectionConfig::new(id).with_timing(timing.clone());
        let (session, events) = coordinator.connect(id);
        let session = Arc::new(session);
        let orchestrator = ElectionOrchestrator::new(config, session.clone(), events)?
            .with_time_source(Arc::clone(&time_source))
            .with_notifications(Arc::clone(&bus));
        let (handle, _task) = orchestrator.spawn();
        handles.push(handle);
        sessions.push(session);
    }

    let active = wait_for_active(&handles, None, timing.interval * 10).await?;
    info!("{} is active", handles[active].master_id());
    sleep(timing.interval * 6).await;

    warn!("Killing {}", handles[active].master_id());
    coordinator.expire_session(sessions[active].id());

    let bound = timing.max_update_miss + timing.notification_window + timing.grace_period;
    let successor = wait_for_active(&handles, Some(active), bound).await?;
    info!(
        "{} took over from {}",
        handles[successor].master_id(),
        handles[active].master_id()
    );
    sleep(timing.interval * 4).await;

    for handle in &handles {
        info!(
            "{} ended in {}: {:?}",
            handle.master_id(),
            handle.phase(),
            handle.stats()
        );
        let _ = handle.shutdown();
    }
    listeners.close().await;
    Ok(())
}

fn load_timing() -> anyhow::Result<TimingConfig> {
    let Some(path) = std::env::args().nth(1) else {
        return Ok(TimingConfig::new(Duration::from_millis(500))
            .with_notification_window(Duration::from_secs(5))
            .with_grace_period(Duration::from_secs(1)));
    };
    let json = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    let timing: TimingConfig =
        serde_json::from_str(&json).with_context(|| format!("parsing {path}"))?;
    timing.validate()?;
    Ok(timing)
}

fn time_source() -> anyhow::Result<Arc<dyn TimeSource>> {
    match std::env::var("TIMEMASTER_NTP_SERVERS") {
        Ok(servers) => {
            let config = SntpConfig {
                servers: servers.split(',').map(|s| s.trim().to_string()).collect(),
                ..SntpConfig::default()
            };
            info!("Using SNTP servers {:?}", config.servers);
            Ok(Arc::new(SntpTimeSource::new(config)?))
        }
        Err(_) => Ok(Arc::new(SystemClock)),
    }
}

async fn wait_for_active(
    handles: &[ElectionHandle],
    excluded: Option<usize>,
    limit: Duration,
) -> anyhow::Result<usize> {
    let search = async {
        loop {
            if let Some(index) = handles.iter().enumerate().position(|(index, handle)| {
                Some(index) != excluded && handle.phase() == ElectionPhase::Active
            }) {
                return index;
            }
            sleep(Duration::from_millis(50)).await;
        }
    };
    timeout(limit, search)
        .await
        .context("no participant became active in time")
}
