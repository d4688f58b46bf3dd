use chrono::Utc;
use inline_sync::connection::{Backoff, SnapshotHub, TRANSITION_LOG_CAPACITY};
use inline_sync::{
    ConnectionConfig, ConnectionSnapshot, ConnectionState, DisconnectReason, RealtimeConfig,
    SyncConfig,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::time::Duration;

fn snapshot(state: ConnectionState, attempt_number: u32) -> ConnectionSnapshot {
    ConnectionSnapshot {
        state,
        attempt_number,
        last_error: None,
        connected_since: None,
        changed_at: Utc::now(),
    }
}

// ── Backoff ──────────────────────────────────────────────────────

#[test]
fn nominal_delay_doubles_up_to_cap() {
    let backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(30), 0.0);
    let delays: Vec<u64> = (1..=9)
        .map(|attempt| backoff.nominal_delay(attempt).as_millis() as u64)
        .collect();
    assert_eq!(
        delays,
        vec![500, 1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000, 30_000]
    );
    assert_eq!(backoff.delay(3), Duration::from_secs(2));
}

#[test]
fn huge_attempt_numbers_stay_capped() {
    let backoff = Backoff::from_config(&ConnectionConfig::default());
    assert_eq!(backoff.nominal_delay(u32::MAX), Duration::from_secs(30));
    assert!(backoff.delay(1_000) <= Duration::from_secs(30));
}

proptest! {
    #[test]
    fn jittered_delay_stays_within_bounds(attempt in 1u32..40, jitter in 0.0f64..=1.0) {
        let backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(30), jitter);
        let nominal = backoff.nominal_delay(attempt).as_secs_f64();
        let delay = backoff.delay(attempt).as_secs_f64();

        prop_assert!(delay <= 30.0 + 1e-6);
        prop_assert!(delay >= nominal * (1.0 - jitter) - 1e-6);
        prop_assert!(delay <= nominal * (1.0 + jitter) + 1e-6);
    }
}

// ── Snapshots ────────────────────────────────────────────────────

#[test]
fn subscribers_start_from_current_snapshot() {
    let hub = SnapshotHub::new();
    hub.publish(snapshot(ConnectionState::Connecting, 0));

    let mut stream = hub.subscribe();
    assert_eq!(
        stream.try_recv().map(|s| s.state),
        Some(ConnectionState::Connecting)
    );
    assert!(stream.try_recv().is_none());
}

#[test]
fn subscribers_are_independent() {
    let hub = SnapshotHub::new();
    let mut fast = hub.subscribe();
    let mut slow = hub.subscribe();

    hub.publish(snapshot(ConnectionState::Connecting, 0));
    hub.publish(snapshot(ConnectionState::Handshaking, 0));
    hub.publish(snapshot(ConnectionState::Open, 0));

    let mut seen = Vec::new();
    while let Some(s) = fast.try_recv() {
        seen.push(s.state.name());
    }
    assert_eq!(seen, vec!["disconnected", "connecting", "handshaking", "open"]);

    assert_eq!(slow.latest().map(|s| s.state), Some(ConnectionState::Open));
    assert!(slow.try_recv().is_none());
}

#[test]
fn dropped_subscribers_are_pruned() {
    let hub = SnapshotHub::new();
    let kept = hub.subscribe();
    drop(hub.subscribe());

    hub.publish(snapshot(ConnectionState::Connecting, 0));
    assert_eq!(hub.subscriber_count(), 1);
    drop(kept);
    assert_eq!(hub.subscriber_count(), 0);
}

#[test]
fn transition_log_is_bounded() {
    let hub = SnapshotHub::new();
    for attempt in 0..100u32 {
        let state = if attempt % 2 == 0 {
            ConnectionState::Connecting
        } else {
            ConnectionState::Disconnected(DisconnectReason::NetworkUnreachable)
        };
        hub.publish(snapshot(state, attempt));
    }

    let log = hub.transitions();
    assert_eq!(log.len(), TRANSITION_LOG_CAPACITY);
    assert_eq!(log.last().map(|t| t.attempt_number), Some(99));
    assert_eq!(log.first().map(|t| t.attempt_number), Some(100 - TRANSITION_LOG_CAPACITY as u32));
}

#[test]
fn republishing_the_same_state_is_not_a_transition() {
    let hub = SnapshotHub::new();
    hub.publish(snapshot(ConnectionState::Connecting, 1));
    hub.publish(snapshot(ConnectionState::Connecting, 2));

    assert_eq!(hub.transitions().len(), 1);
    assert_eq!(hub.current().attempt_number, 2);
}

#[test]
fn state_names_and_display() {
    assert_eq!(ConnectionState::BackgroundSuspended.name(), "background_suspended");
    assert_eq!(
        ConnectionState::Disconnected(DisconnectReason::MissingCredentials).to_string(),
        "disconnected(MissingCredentials)"
    );
    assert!(ConnectionState::Handshaking.is_active());
    assert!(!ConnectionState::BackgroundSuspended.is_active());
}

// ── Config ───────────────────────────────────────────────────────

#[test]
fn config_defaults() {
    let config = RealtimeConfig::default();
    assert_eq!(config.connection.backoff_base(), Duration::from_millis(500));
    assert_eq!(config.connection.ping_interval(), Duration::from_secs(15));
    assert_eq!(config.connection.max_missed_pongs, 2);
    assert_eq!(config.sync.max_total_gap, 1_000);
    assert_eq!(config.sync.last_sync_safety_gap(), Duration::from_secs(15));
}

#[test]
fn partial_json_config_keeps_defaults() {
    let config = RealtimeConfig::from_json_str(
        r#"{ "connection": { "ping_interval_ms": 5000 }, "sync": { "get_updates_limit": 20 } }"#,
    )
    .unwrap();

    assert_eq!(config.connection.ping_interval(), Duration::from_secs(5));
    assert_eq!(config.connection.backoff_max(), Duration::from_secs(30));
    assert_eq!(config.sync.get_updates_limit, 20);
    assert_eq!(config.sync.max_immediate_refetches, SyncConfig::default().max_immediate_refetches);
}

#[test]
fn config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("realtime.json");
    std::fs::write(&path, r#"{ "sync": { "refetch_delay_ms": 250 } }"#).unwrap();

    let config = RealtimeConfig::from_json_file(&path).unwrap();
    assert_eq!(config.sync.refetch_delay(), Duration::from_millis(250));

    assert!(RealtimeConfig::from_json_file(dir.path().join("missing.json")).is_err());
}
