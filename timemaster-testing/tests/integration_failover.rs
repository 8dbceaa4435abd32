//! Failover under crashes, stalls, lagging clocks and flaky operations.

use std::collections::HashSet;
use std::time::Duration;

use timemaster_core::{ElectionPhase, OpOutcome};
use timemaster_election::{RoleChange, TimingConfig};
use timemaster_testing::FleetHarness;
use tokio::time::Instant;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

fn fast_timing() -> TimingConfig {
    TimingConfig::new(Duration::from_millis(100))
        .with_notification_window(Duration::from_secs(2))
        .with_grace_period(Duration::from_millis(300))
}

async fn settled_fleet(timing: TimingConfig, ids: &[&str]) -> FleetHarness {
    let mut fleet = FleetHarness::new(timing).await;
    fleet.open_listeners().await.unwrap();
    fleet.spawn(ids[0]).unwrap();
    assert!(
        fleet
            .wait_until(Duration::from_secs(1), |f| f.phase(ids[0])
                == Some(ElectionPhase::Active))
            .await
    );
    for id in &ids[1..] {
        fleet.spawn(id).unwrap();
    }
    assert!(
        fleet
            .wait_until(Duration::from_secs(1), |f| ids[1..]
                .iter()
                .all(|id| f.phase(id) == Some(ElectionPhase::Standby)))
            .await
    );
    fleet
}

#[tokio::test(start_paused = true)]
async fn test_failover_within_detection_bound() {
    init_tracing();
    let timing = fast_timing();
    let bound = timing.max_update_miss + timing.notification_window + timing.grace_period;
    let mut fleet = settled_fleet(timing, &["m1", "m2", "m3"]).await;
    fleet.observe(Duration::from_millis(500), |_| {}).await;

    let crashed_at = Instant::now();
    fleet.crash("m1").unwrap();
    assert!(
        fleet
            .wait_until(bound, |f| f
                .active_ids()
                .iter()
                .any(|id| id.as_str() != "m1"))
            .await,
        "no standby took over within {bound:?}"
    );
    assert!(crashed_at.elapsed() <= bound);

    let new_active = fleet.active_ids().remove(0);
    assert_eq!(fleet.active_record().unwrap().master_id, new_active);
    assert_eq!(fleet.phase("m1"), Some(ElectionPhase::Stopped));

    // The new active keeps the heartbeat going.
    let before = fleet.active_record().unwrap().timestamp;
    fleet.observe(Duration::from_millis(500), |_| {}).await;
    assert!(fleet.active_record().unwrap().timestamp > before);

    fleet.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_one_flag_holder_among_contenders() {
    init_tracing();
    let mut fleet = settled_fleet(fast_timing(), &["m1", "m2", "m3", "m4"]).await;
    fleet.observe(Duration::from_millis(500), |_| {}).await;

    fleet.crash("m1").unwrap();

    let mut holders = HashSet::new();
    fleet
        .observe(Duration::from_secs(3), |f| {
            if let Some(holder) = f.flag_holder() {
                holders.insert(holder);
            }
        })
        .await;

    assert!(holders.len() <= 1);
    assert_eq!(
        fleet.count_changes(|change| *change == RoleChange::FailoverStarted),
        3
    );
    assert_eq!(
        fleet.count_changes(|change| *change == RoleChange::FailoverWon),
        1
    );
    assert_eq!(
        fleet.count_changes(|change| *change == RoleChange::FailoverLost),
        2
    );
    assert_eq!(
        fleet.count_changes(|change| *change == RoleChange::FlagReleased),
        1
    );

    let active = fleet.active_ids();
    assert_eq!(active.len(), 1);
    if let Some(holder) = holders.into_iter().next() {
        assert_eq!(active[0], holder);
    }
    assert!(fleet.flag_holder().is_none());

    fleet.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_lagging_standby_does_not_accuse_the_active() {
    init_tracing();
    let mut fleet = settled_fleet(fast_timing(), &["m1", "m2"]).await;

    let standby = fleet.participant("m2").unwrap();
    standby.session().set_latency(Duration::from_millis(400));
    standby.clock().set_delay(Duration::from_millis(150));

    let mut always_active = true;
    fleet
        .observe(Duration::from_secs(5), |f| {
            always_active &= f.phase("m1") == Some(ElectionPhase::Active);
        })
        .await;

    assert!(always_active);
    let stats = fleet.handle("m2").unwrap().stats();
    assert!(stats.cross_checks > 0, "the lag never triggered a cross-check");
    assert_eq!(stats.failovers_started, 0);
    assert_eq!(fleet.phase("m2"), Some(ElectionPhase::Standby));

    fleet.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failover_without_authoritative_time() {
    init_tracing();
    let mut fleet = settled_fleet(fast_timing(), &["m1", "m2"]).await;
    for id in ["m1", "m2"] {
        fleet.participant(id).unwrap().clock().set_outage(true);
    }
    fleet.observe(Duration::from_millis(500), |_| {}).await;
    assert_eq!(fleet.phase("m1"), Some(ElectionPhase::Active));

    fleet.crash("m1").unwrap();
    assert!(
        fleet
            .wait_until(Duration::from_secs(3), |f| f.phase("m2")
                == Some(ElectionPhase::Active))
            .await
    );
    assert!(fleet.handle("m2").unwrap().stats().time_source_fallbacks > 0);

    fleet.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stalled_active_is_replaced() {
    init_tracing();
    let mut fleet = settled_fleet(fast_timing(), &["m1", "m2", "m3"]).await;
    fleet.observe(Duration::from_millis(500), |_| {}).await;

    fleet.stall("m1", Duration::from_secs(5)).unwrap();
    assert!(
        fleet
            .wait_until(Duration::from_secs(5), |f| f
                .active_ids()
                .iter()
                .any(|id| id.as_str() != "m1"))
            .await
    );
    assert_ne!(fleet.active_record().unwrap().master_id.as_str(), "m1");

    // Once its operations complete the stalled active notices and leaves.
    assert!(
        fleet
            .wait_until(Duration::from_secs(20), |f| f.phase("m1")
                != Some(ElectionPhase::Active))
            .await
    );
    assert_eq!(fleet.active_ids().len(), 1);

    fleet.shutdown().await;
}

/// Timing with a short notification window, so a standby whose clock runs
/// ahead has no failover budget left when it comes to contend.
fn short_window_timing() -> TimingConfig {
    TimingConfig::new(Duration::from_millis(100))
        .with_notification_window(Duration::from_millis(200))
        .with_grace_period(Duration::from_millis(300))
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_block_is_cleared() {
    init_tracing();
    let timing = short_window_timing();
    let very_long_wait = timing.very_long_wait;
    assert_eq!(very_long_wait, Duration::from_secs(3));
    let mut fleet = settled_fleet(timing, &["m1", "m2"]).await;
    fleet.observe(Duration::from_millis(500), |_| {}).await;

    // The flag is held by a session nobody will ever close.
    fleet.abandon_flag().await.unwrap();
    let crashed_at = Instant::now();
    fleet.crash("m1").unwrap();
    fleet.participant("m2").unwrap().clock().set_skew(5_000);

    assert!(
        fleet
            .wait_until(Duration::from_secs(10), |f| f.phase("m2")
                == Some(ElectionPhase::Active))
            .await
    );
    assert!(crashed_at.elapsed() >= very_long_wait);

    let stats = fleet.handle("m2").unwrap().stats();
    assert_eq!(stats.forced_flag_clears, 1);
    assert_eq!(stats.failovers_lost, 1);
    assert_eq!(stats.failovers_won, 0);
    assert_eq!(fleet.active_record().unwrap().master_id.as_str(), "m2");
    assert_eq!(fleet.phase("m1"), Some(ElectionPhase::Stopped));

    fleet.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_blocked_standby_does_not_wait_for_an_absent_flag() {
    init_tracing();
    let timing = short_window_timing();
    let very_long_wait = timing.very_long_wait;
    let mut fleet = settled_fleet(timing, &["m1", "m2"]).await;
    fleet.observe(Duration::from_millis(500), |_| {}).await;

    let crashed_at = Instant::now();
    fleet.crash("m1").unwrap();
    fleet.participant("m2").unwrap().clock().set_skew(5_000);

    assert!(
        fleet
            .wait_until(Duration::from_secs(1), |f| f.phase("m2")
                == Some(ElectionPhase::Active))
            .await
    );
    assert!(crashed_at.elapsed() < very_long_wait);

    let stats = fleet.handle("m2").unwrap().stats();
    assert_eq!(stats.failovers_lost, 1);
    assert_eq!(stats.forced_flag_clears, 0);
    assert_eq!(stats.failovers_won, 0);
    assert!(fleet.flag_holder().is_none());

    fleet.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_transient_errors_are_absorbed() {
    init_tracing();
    let mut fleet = settled_fleet(fast_timing(), &["m1", "m2"]).await;

    for round in 0..5 {
        let outcome = if round % 2 == 0 {
            OpOutcome::Timeout
        } else {
            OpOutcome::AuthFailed
        };
        for id in ["m1", "m2"] {
            fleet
                .participant(id)
                .unwrap()
                .session()
                .fail_next(outcome.clone(), 2);
        }
        fleet.observe(Duration::from_millis(300), |_| {}).await;
    }
    fleet.observe(Duration::from_millis(500), |_| {}).await;

    assert_eq!(fleet.phase("m1"), Some(ElectionPhase::Active));
    assert_eq!(fleet.phase("m2"), Some(ElectionPhase::Standby));
    for id in ["m1", "m2"] {
        let stats = fleet.handle(id).unwrap().stats();
        assert_eq!(stats.retried_operations, 10, "{id}");
        assert_eq!(stats.failovers_started, 0, "{id}");
    }
    assert!(fleet.handle("m1").unwrap().stats().heartbeats_pushed > 10);

    fleet.shutdown().await;
}
