//! Circuit breaker state machine and the persisted engine.

use assetgen::Error;
use assetgen::breaker::BreakerEngine;
use assetgen::events::EventLog;
use assetgen::model::breaker::{
    BreakerConfig, BreakerState, BreakerType, CircuitBreaker, Verdict,
};
use assetgen::model::event::EventType;
use assetgen::model::project::Project;
use assetgen::store::Store;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

fn secs(n: i64) -> DateTime<Utc> {
    t0() + Duration::seconds(n)
}

fn velocity(config: BreakerConfig) -> CircuitBreaker {
    CircuitBreaker::new("p1", "rule_a", BreakerType::Velocity, config, t0())
}

/// Eleven triggers one second apart; the last one trips.
fn burst(cb: &mut CircuitBreaker) {
    for i in 0..10 {
        assert_eq!(cb.check_velocity(secs(i)), Verdict::Allow, "trigger {i}");
    }
    let verdict = cb.check_velocity(secs(10));
    assert_eq!(
        verdict,
        Verdict::Block {
            reason: "Velocity exceeded: 11 triggers/min > max 10".into()
        }
    );
    assert_eq!(cb.state, BreakerState::Open);
    assert_eq!(cb.tripped_at, Some(secs(10)));
}

#[test]
fn open_half_open_closed() {
    let mut cb = velocity(BreakerConfig::default());
    burst(&mut cb);

    // Still cooling down.
    assert!(!cb.check_velocity(secs(30)).is_allowed());
    assert_eq!(cb.state, BreakerState::Open);
    assert_eq!(cb.stats.blocked_triggers, 2);

    // Cooldown over: three test triggers pass in half-open.
    for _ in 0..3 {
        assert!(cb.check_velocity(secs(70)).is_allowed());
        assert_eq!(cb.state, BreakerState::HalfOpen);
    }
    assert_eq!(cb.half_open_tests_remaining, Some(0));

    // Velocity back to normal: the next trigger closes it.
    assert!(cb.check_velocity(secs(71)).is_allowed());
    assert_eq!(cb.state, BreakerState::Closed);
    assert_eq!(cb.stats.total_trips, 1);
    assert_eq!(cb.stats.total_resets, 1);
    assert!(cb.tripped_reason.is_none());
}

#[test]
fn half_open_retrips_while_velocity_elevated() {
    let mut cb = velocity(BreakerConfig {
        cooldown_ms: 5_000,
        ..BreakerConfig::default()
    });
    burst(&mut cb);

    for _ in 0..3 {
        assert!(cb.check_velocity(secs(15)).is_allowed());
    }
    let verdict = cb.check_velocity(secs(16));
    assert_eq!(
        verdict,
        Verdict::Block {
            reason: "Half-open test failed: velocity still elevated".into()
        }
    );
    assert_eq!(cb.state, BreakerState::Open);
    assert_eq!(cb.tripped_at, Some(secs(16)));
    assert_eq!(cb.stats.total_trips, 2);
}

#[test]
fn old_triggers_fall_out_of_the_window() {
    let mut cb = velocity(BreakerConfig::default());
    for i in 0..10 {
        assert!(cb.check_velocity(secs(i)).is_allowed());
    }
    // A minute later the earlier ten no longer count.
    for i in 0..10 {
        assert!(cb.check_velocity(secs(61 + i)).is_allowed());
    }
    assert_eq!(cb.state, BreakerState::Closed);
    assert!(cb.trigger_log.len() <= 20);
}

#[test]
fn queue_depth_trips_and_recovers_after_cooldown() {
    let mut cb = CircuitBreaker::new(
        "p1",
        "rule_a",
        BreakerType::QueueDepth,
        BreakerConfig::default(),
        t0(),
    );
    let verdict = cb.check_queue_depth(60, 10.0, secs(0));
    assert_eq!(
        verdict,
        Verdict::Block {
            reason: "Queue depth ratio 6.0 exceeds max 5".into()
        }
    );

    // Drained, but still within cooldown.
    assert!(cb.check_queue_depth(10, 10.0, secs(30)).is_allowed());
    assert_eq!(cb.state, BreakerState::Open);

    assert!(cb.check_queue_depth(10, 10.0, secs(61)).is_allowed());
    assert_eq!(cb.state, BreakerState::Closed);

    // No throughput data counts as ratio zero.
    assert!(cb.check_queue_depth(1_000, 0.0, secs(62)).is_allowed());
}

fn project(policy: serde_json::Value) -> Project {
    serde_json::from_value(json!({"id": "p1", "policies": {"circuitBreakerPolicy": policy}})).unwrap()
}

#[tokio::test]
async fn engine_persists_trips_and_resets() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path());
    let events = EventLog::new(store.clone());
    let engine = BreakerEngine::new(store, events.clone());
    let project = project(json!({"maxTriggersPerMinute": 2}));

    assert!(engine.check_velocity(&project, "rule_a").await.unwrap().is_allowed());
    assert!(engine.check_velocity(&project, "rule_a").await.unwrap().is_allowed());
    assert!(!engine.check_velocity(&project, "rule_a").await.unwrap().is_allowed());
    assert!(engine.check_velocity(&project, "rule_b").await.unwrap().is_allowed());

    let breakers = engine.list("p1").await.unwrap();
    assert_eq!(breakers.len(), 2);
    let id = CircuitBreaker::breaker_id("rule_a", BreakerType::Velocity);
    let tripped = engine.get("p1", &id).await.unwrap().unwrap();
    assert_eq!(tripped.state, BreakerState::Open);
    assert_eq!(tripped.config.max_triggers_per_minute, 2);

    let reset = engine.reset("p1", &id).await.unwrap();
    assert_eq!(reset.state, BreakerState::Closed);
    assert!(reset.trigger_log.is_empty());
    assert!(engine.check_velocity(&project, "rule_a").await.unwrap().is_allowed());

    let reset_events: Vec<_> = events
        .list("p1", 0, 100)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == EventType::CircuitBreakerReset)
        .collect();
    assert_eq!(reset_events.len(), 1);
    assert_eq!(reset_events[0].payload.get("breakerId"), Some(&json!(id)));

    assert!(matches!(
        engine.reset("p1", "cb_missing_velocity").await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn disabled_policy_never_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path());
    let engine = BreakerEngine::new(store.clone(), EventLog::new(store));
    let project = project(json!({"enabled": false, "maxTriggersPerMinute": 1}));
    for _ in 0..5 {
        assert!(engine.check_velocity(&project, "rule_a").await.unwrap().is_allowed());
    }
    assert!(engine.list("p1").await.unwrap().is_empty());
}

#[tokio::test]
async fn default_prefixed_policy_keys_are_read() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path());
    let engine = BreakerEngine::new(store.clone(), EventLog::new(store));
    let project = project(json!({
        "defaultMaxTriggersPerMinute": 1,
        "defaultCooldownMs": 5_000,
        "defaultHalfOpenTestCount": 1,
        "defaultMaxQueueDepthRatio": 2.5
    }));

    assert!(engine.check_velocity(&project, "rule_a").await.unwrap().is_allowed());
    assert!(!engine.check_velocity(&project, "rule_a").await.unwrap().is_allowed());

    let id = CircuitBreaker::breaker_id("rule_a", BreakerType::Velocity);
    let breaker = engine.get("p1", &id).await.unwrap().unwrap();
    assert_eq!(
        breaker.config,
        BreakerConfig {
            enabled: true,
            max_triggers_per_minute: 1,
            cooldown_ms: 5_000,
            half_open_test_count: 1,
            max_queue_depth_ratio: 2.5,
        }
    );
}
