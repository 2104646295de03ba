//! Circuit breaker engine.
//!
//! Loads and persists [`CircuitBreaker`] records under
//! `projects/<pid>/circuit-breakers/`. Each check is a read-modify-write
//! under a per-breaker [`FileLock`], so concurrent triggers for the same
//! rule consume half-open test slots one at a time.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde_json::json;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::events::EventLog;
use crate::model::breaker::{BreakerConfig, BreakerType, CircuitBreaker, Verdict};
use crate::model::event::{EventType, NewEvent};
use crate::model::project::Project;
use crate::store::{FileLock, LockOptions, Store};
use crate::telemetry::metrics;

const COLLECTION: &str = "circuit-breakers";

#[derive(Debug, Clone)]
pub struct BreakerEngine {
    store: Store,
    events: EventLog,
}

impl BreakerEngine {
    pub fn new(store: Store, events: EventLog) -> Self {
        Self { store, events }
    }

    fn path(&self, project_id: &str, breaker_id: &str) -> PathBuf {
        self.store.record_path(project_id, COLLECTION, breaker_id)
    }

    pub async fn list(&self, project_id: &str) -> Result<Vec<CircuitBreaker>> {
        let mut breakers: Vec<CircuitBreaker> = self
            .store
            .list(&self.store.collection_dir(project_id, COLLECTION))
            .await?;
        breakers.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(breakers)
    }

    pub async fn get(&self, project_id: &str, breaker_id: &str) -> Result<Option<CircuitBreaker>> {
        self.store.read(&self.path(project_id, breaker_id)).await
    }

    /// Record a trigger of `rule_id` against its velocity breaker.
    pub async fn check_velocity(&self, project: &Project, rule_id: &str) -> Result<Verdict> {
        self.check_at(project, rule_id, BreakerType::Velocity, Utc::now(), |cb, now| {
            cb.check_velocity(now)
        })
        .await
    }

    /// Compare the current backlog for `rule_id` against throughput.
    pub async fn check_queue_depth(
        &self,
        project: &Project,
        rule_id: &str,
        depth: u64,
        throughput_per_min: f64,
    ) -> Result<Verdict> {
        self.check_at(project, rule_id, BreakerType::QueueDepth, Utc::now(), |cb, now| {
            cb.check_queue_depth(depth, throughput_per_min, now)
        })
        .await
    }

    async fn check_at<F>(
        &self,
        project: &Project,
        rule_id: &str,
        breaker_type: BreakerType,
        now: DateTime<Utc>,
        check: F,
    ) -> Result<Verdict>
    where
        F: FnOnce(&mut CircuitBreaker, DateTime<Utc>) -> Verdict,
    {
        let policy = &project.policies.circuit_breaker_policy;
        if policy.enabled == Some(false) {
            return Ok(Verdict::Allow);
        }

        let breaker_id = CircuitBreaker::breaker_id(rule_id, breaker_type);
        let path = self.path(&project.id, &breaker_id);
        let lock = FileLock::acquire(path.with_extension("lock"), LockOptions::default()).await?;

        let result = async {
            let mut breaker = match self.store.read::<CircuitBreaker>(&path).await? {
                Some(existing) => existing,
                None => CircuitBreaker::new(
                    &project.id,
                    rule_id,
                    breaker_type,
                    BreakerConfig::default().merged(policy),
                    now,
                ),
            };
            let trips_before = breaker.stats.total_trips;
            let verdict = check(&mut breaker, now);
            self.store.write(&path, &breaker).await?;

            let labels = [KeyValue::new("breaker_type", breaker_type.as_str())];
            if breaker.stats.total_trips > trips_before {
                warn!(
                    project_id = %project.id,
                    rule_id,
                    breaker_id = %breaker.id,
                    reason = breaker.tripped_reason.as_deref().unwrap_or_default(),
                    "circuit breaker tripped"
                );
                metrics::breaker_trips().add(1, &labels);
            }
            if !verdict.is_allowed() {
                metrics::breaker_blocks().add(1, &labels);
            }
            Ok::<_, Error>(verdict)
        }
        .await;

        lock.release().await?;
        result
    }

    /// Force a breaker closed and clear its trigger log.
    pub async fn reset(&self, project_id: &str, breaker_id: &str) -> Result<CircuitBreaker> {
        let path = self.path(project_id, breaker_id);
        let lock = FileLock::acquire(path.with_extension("lock"), LockOptions::default()).await?;
        let result = async {
            let mut breaker: CircuitBreaker = self
                .store
                .read(&path)
                .await?
                .ok_or_else(|| Error::NotFound(format!("circuit breaker {breaker_id}")))?;
            breaker.reset(Utc::now());
            self.store.write(&path, &breaker).await?;
            Ok::<_, Error>(breaker)
        }
        .await;
        lock.release().await?;
        let breaker = result?;

        info!(project_id, breaker_id, "circuit breaker reset");
        self.events
            .append(
                project_id,
                NewEvent::new(EventType::CircuitBreakerReset, "circuit_breaker", breaker_id)
                    .idempotency_key(format!(
                        "circuit_breaker:{breaker_id}:reset:{}",
                        breaker.stats.total_resets
                    ))
                    .payload(json!({
                        "breakerId": breaker_id,
                        "ruleId": breaker.rule_id,
                        "type": breaker.breaker_type.as_str(),
                    })),
            )
            .await?;
        Ok(breaker)
    }
}
