//! Circuit breakers guarding automation rules.
//!
//! The state machine lives here as pure methods taking an explicit `now`;
//! [`crate::breaker::BreakerEngine`] loads, locks, and persists.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::Record;
use crate::store::schema::{require, require_non_empty};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreaker {
    pub id: String,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    #[serde(rename = "type")]
    pub breaker_type: BreakerType,
    pub state: BreakerState,
    #[serde(default)]
    pub config: BreakerConfig,
    /// Trigger timestamps, pruned to the last two minutes.
    #[serde(default)]
    pub trigger_log: Vec<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tripped_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tripped_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub half_open_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub half_open_tests_remaining: Option<u32>,
    #[serde(default)]
    pub stats: BreakerStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of a breaker check.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Allow,
    Block { reason: String },
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow)
    }
}

const LOG_WINDOW_SECS: i64 = 120;

impl CircuitBreaker {
    pub fn breaker_id(rule_id: &str, breaker_type: BreakerType) -> String {
        format!("cb_{rule_id}_{}", breaker_type.as_str())
    }

    pub fn new(
        project_id: &str,
        rule_id: &str,
        breaker_type: BreakerType,
        config: BreakerConfig,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Self::breaker_id(rule_id, breaker_type),
            project_id: project_id.to_string(),
            rule_id: Some(rule_id.to_string()),
            breaker_type,
            state: BreakerState::Closed,
            config,
            trigger_log: Vec::new(),
            tripped_at: None,
            tripped_reason: None,
            half_open_at: None,
            half_open_tests_remaining: None,
            stats: BreakerStats::default(),
            created_at: now,
            updated_at: now,
        }
    }

    fn recent_count(&self, now: DateTime<Utc>) -> u32 {
        let cutoff = now - Duration::seconds(60);
        self.trigger_log.iter().filter(|ts| **ts >= cutoff).count() as u32
    }

    fn cooldown_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.tripped_at.is_some_and(|at| {
            (now - at).num_milliseconds() >= self.config.cooldown_ms as i64
        })
    }

    fn trip(&mut self, reason: String, now: DateTime<Utc>) -> Verdict {
        self.state = BreakerState::Open;
        self.tripped_at = Some(now);
        self.tripped_reason = Some(reason.clone());
        self.half_open_at = None;
        self.half_open_tests_remaining = None;
        self.stats.total_trips += 1;
        self.stats.blocked_triggers += 1;
        self.stats.last_trip_at = Some(now);
        Verdict::Block { reason }
    }

    fn close(&mut self) {
        self.state = BreakerState::Closed;
        self.tripped_at = None;
        self.tripped_reason = None;
        self.half_open_at = None;
        self.half_open_tests_remaining = None;
    }

    /// Record one rule trigger at `now` and decide whether it may proceed.
    pub fn check_velocity(&mut self, now: DateTime<Utc>) -> Verdict {
        self.updated_at = now;
        if !self.config.enabled {
            return Verdict::Allow;
        }
        let cutoff = now - Duration::seconds(LOG_WINDOW_SECS);
        self.trigger_log.retain(|ts| *ts >= cutoff);
        let max = self.config.max_triggers_per_minute;

        if self.state == BreakerState::Open {
            if self.cooldown_elapsed(now) {
                self.state = BreakerState::HalfOpen;
                self.half_open_at = Some(now);
                self.half_open_tests_remaining = Some(self.config.half_open_test_count);
            } else {
                self.stats.blocked_triggers += 1;
                return Verdict::Block {
                    reason: self
                        .tripped_reason
                        .clone()
                        .unwrap_or_else(|| format!("Velocity breaker open ({})", self.id)),
                };
            }
        }

        if self.state == BreakerState::HalfOpen {
            let remaining = self.half_open_tests_remaining.unwrap_or(0);
            if remaining > 0 {
                self.half_open_tests_remaining = Some(remaining - 1);
                self.trigger_log.push(now);
                return Verdict::Allow;
            }
            if self.recent_count(now) <= max {
                self.close();
                self.stats.total_resets += 1;
                self.stats.last_reset_at = Some(now);
                self.trigger_log.push(now);
                return Verdict::Allow;
            }
            return self.trip(
                "Half-open test failed: velocity still elevated".to_string(),
                now,
            );
        }

        self.trigger_log.push(now);
        let count = self.recent_count(now);
        if count > max {
            return self.trip(
                format!("Velocity exceeded: {count} triggers/min > max {max}"),
                now,
            );
        }
        Verdict::Allow
    }

    /// Compare backlog against throughput.
    pub fn check_queue_depth(
        &mut self,
        depth: u64,
        throughput_per_min: f64,
        now: DateTime<Utc>,
    ) -> Verdict {
        self.updated_at = now;
        if !self.config.enabled {
            return Verdict::Allow;
        }
        let ratio = if throughput_per_min > 0.0 {
            depth as f64 / throughput_per_min
        } else {
            0.0
        };
        let max = self.config.max_queue_depth_ratio;
        if ratio <= max {
            if self.state == BreakerState::Open && self.cooldown_elapsed(now) {
                self.close();
                self.stats.total_resets += 1;
                self.stats.last_reset_at = Some(now);
            }
            return Verdict::Allow;
        }
        self.trip(
            format!("Queue depth ratio {ratio:.1} exceeds max {max}"),
            now,
        )
    }

    /// Operator reset: closed, empty log.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.close();
        self.trigger_log.clear();
        self.stats.total_resets += 1;
        self.stats.last_reset_at = Some(now);
        self.updated_at = now;
    }
}

impl Record for CircuitBreaker {
    const SCHEMA: &'static str = "circuit-breaker.schema.json";

    fn validate(&self) -> Result<()> {
        require_non_empty(&self.id, Self::SCHEMA, "id")?;
        require_non_empty(&self.project_id, Self::SCHEMA, "projectId")?;
        if self.state == BreakerState::Open {
            require(
                self.tripped_at.is_some(),
                Self::SCHEMA,
                "open breaker must record trippedAt",
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerType {
    Velocity,
    QueueDepth,
}

impl BreakerType {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerType::Velocity => "velocity",
            BreakerType::QueueDepth => "queue_depth",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerConfig {
    pub enabled: bool,
    pub max_triggers_per_minute: u32,
    pub cooldown_ms: u64,
    pub half_open_test_count: u32,
    pub max_queue_depth_ratio: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_triggers_per_minute: 10,
            cooldown_ms: 60_000,
            half_open_test_count: 3,
            max_queue_depth_ratio: 5.0,
        }
    }
}

impl BreakerConfig {
    pub fn merged(mut self, patch: &BreakerConfigPatch) -> Self {
        if let Some(v) = patch.enabled {
            self.enabled = v;
        }
        if let Some(v) = patch.max_triggers_per_minute {
            self.max_triggers_per_minute = v;
        }
        if let Some(v) = patch.cooldown_ms {
            self.cooldown_ms = v;
        }
        if let Some(v) = patch.half_open_test_count {
            self.half_open_test_count = v;
        }
        if let Some(v) = patch.max_queue_depth_ratio {
            self.max_queue_depth_ratio = v;
        }
        self
    }
}

/// `policies.circuitBreakerPolicy` in project.json. Older files spell the
/// keys with a `default` prefix.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerConfigPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(
        default,
        alias = "defaultMaxTriggersPerMinute",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_triggers_per_minute: Option<u32>,
    #[serde(default, alias = "defaultCooldownMs", skip_serializing_if = "Option::is_none")]
    pub cooldown_ms: Option<u64>,
    #[serde(
        default,
        alias = "defaultHalfOpenTestCount",
        skip_serializing_if = "Option::is_none"
    )]
    pub half_open_test_count: Option<u32>,
    #[serde(
        default,
        alias = "defaultMaxQueueDepthRatio",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_queue_depth_ratio: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStats {
    #[serde(default)]
    pub total_trips: u64,
    #[serde(default)]
    pub total_resets: u64,
    #[serde(default)]
    pub blocked_triggers: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_trip_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reset_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(now: DateTime<Utc>) -> CircuitBreaker {
        let config = BreakerConfig {
            max_triggers_per_minute: 2,
            cooldown_ms: 1_000,
            half_open_test_count: 1,
            ..Default::default()
        };
        CircuitBreaker::new("p1", "r1", BreakerType::Velocity, config, now)
    }

    #[test]
    fn id_is_derived_from_rule_and_type() {
        assert_eq!(
            CircuitBreaker::breaker_id("r9", BreakerType::QueueDepth),
            "cb_r9_queue_depth"
        );
    }

    #[test]
    fn velocity_trips_then_blocks_until_cooldown() {
        let t0 = Utc::now();
        let mut cb = breaker(t0);
        assert!(cb.check_velocity(t0).is_allowed());
        assert!(cb.check_velocity(t0).is_allowed());
        let verdict = cb.check_velocity(t0);
        assert_eq!(
            verdict,
            Verdict::Block {
                reason: "Velocity exceeded: 3 triggers/min > max 2".into()
            }
        );
        assert_eq!(cb.state, BreakerState::Open);
        assert!(!cb.check_velocity(t0 + Duration::milliseconds(500)).is_allowed());
        assert_eq!(cb.stats.blocked_triggers, 2);
    }

    #[test]
    fn disabled_breaker_always_allows() {
        let t0 = Utc::now();
        let mut cb = breaker(t0);
        cb.config.enabled = false;
        for _ in 0..10 {
            assert!(cb.check_velocity(t0).is_allowed());
        }
        assert_eq!(cb.state, BreakerState::Closed);
    }

    #[test]
    fn queue_depth_zero_throughput_is_ratio_zero() {
        let t0 = Utc::now();
        let mut cb = CircuitBreaker::new(
            "p1",
            "r1",
            BreakerType::QueueDepth,
            BreakerConfig::default(),
            t0,
        );
        assert!(cb.check_queue_depth(1_000, 0.0, t0).is_allowed());
        let verdict = cb.check_queue_depth(60, 10.0, t0);
        assert_eq!(
            verdict,
            Verdict::Block {
                reason: "Queue depth ratio 6.0 exceeds max 5".into()
            }
        );
    }
}
