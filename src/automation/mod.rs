//! Automation engine.
//!
//! Rules listen for event types. [`AutomationEngine::trigger_event`]
//! turns a matching event into queued [`AutomationRun`]s; the worker later
//! calls [`AutomationEngine::execute_run`], which performs the rule's
//! actions in order and stops at the first failure.
//!
//! Every run carries the triggering event in `meta.event`, with
//! `causalDepth` incremented and the rule appended to `visitedRuleIds`.
//! Jobs created by the run copy those fields, so the events they produce
//! continue the same cascade. A cascade deeper than [`MAX_CAUSAL_DEPTH`]
//! is cut off.

pub mod actions;
pub mod conditions;

use chrono::Utc;
use opentelemetry::KeyValue;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{Instrument, debug, info, warn};
use uuid::Uuid;

use crate::breaker::BreakerEngine;
use crate::error::{Error, Result};
use crate::events::EventLog;
use crate::jobs::JobQueue;
use crate::model::JsonMap;
use crate::model::automation::{
    Action, AutomationRule, AutomationRun, Conditions, RuleTrigger, RunStatus, RunStep,
};
use crate::model::breaker::{BreakerType, CircuitBreaker, Verdict};
use crate::model::event::{Event, EventType, NewEvent};
use crate::profiles;
use crate::store::Store;
use crate::telemetry::{job as job_span, metrics};

pub use actions::{ActionContext, StepMeta};
pub use conditions::{lookup, matches, matches_condition};

const RULES: &str = "automation-rules";
const RUNS: &str = "automation-runs";

/// Deepest cascade allowed; an event at depth 9 or more triggers nothing.
pub const MAX_CAUSAL_DEPTH: u64 = 8;

/// Input to [`AutomationEngine::create_rule`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDraft {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    pub trigger: RuleTrigger,
    #[serde(default)]
    pub conditions: Option<Conditions>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RulePatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub enabled: Option<bool>,
    pub trigger: Option<RuleTrigger>,
    pub conditions: Option<Conditions>,
    pub actions: Option<Vec<Action>>,
}

/// Cascade position read from an event payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cascade {
    pub depth: u64,
    pub visited: Vec<String>,
}

impl Cascade {
    pub fn from_payload(payload: &JsonMap) -> Self {
        Self {
            depth: payload
                .get("causalDepth")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            visited: payload
                .get("visitedRuleIds")
                .and_then(Value::as_array)
                .map(|ids| {
                    ids.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    /// Position of a run started by `rule_id` from this event.
    pub fn next(&self, rule_id: &str) -> Self {
        let mut visited = self.visited.clone();
        visited.push(rule_id.to_string());
        Self {
            depth: self.depth + 1,
            visited,
        }
    }

    fn stamp(&self, payload: &mut JsonMap) {
        payload.insert("causalDepth".into(), self.depth.into());
        payload.insert("visitedRuleIds".into(), json!(self.visited));
    }
}

#[derive(Debug, Clone)]
pub struct AutomationEngine {
    store: Store,
    events: EventLog,
    jobs: JobQueue,
    breakers: BreakerEngine,
}

impl AutomationEngine {
    pub fn new(store: Store, events: EventLog, jobs: JobQueue, breakers: BreakerEngine) -> Self {
        Self {
            store,
            events,
            jobs,
            breakers,
        }
    }

    // -----------------------------------------------------------------------
    // Rules
    // -----------------------------------------------------------------------

    pub async fn list_rules(&self, project_id: &str) -> Result<Vec<AutomationRule>> {
        let mut rules: Vec<AutomationRule> = self
            .store
            .list(&self.store.collection_dir(project_id, RULES))
            .await?;
        rules.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rules)
    }

    pub async fn get_rule(&self, project_id: &str, rule_id: &str) -> Result<Option<AutomationRule>> {
        self.store
            .read(&self.store.record_path(project_id, RULES, rule_id))
            .await
    }

    pub async fn create_rule(&self, project_id: &str, draft: RuleDraft) -> Result<AutomationRule> {
        let now = Utc::now();
        let rule = AutomationRule {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            name: draft.name,
            description: draft.description,
            enabled: draft.enabled.unwrap_or(true),
            trigger: draft.trigger,
            conditions: draft.conditions,
            actions: draft.actions,
            created_at: now,
            updated_at: now,
            last_run_at: None,
        };
        self.save_rule(&rule).await?;
        info!(project_id, rule_id = %rule.id, name = %rule.name, "automation rule created");
        Ok(rule)
    }

    pub async fn update_rule(
        &self,
        project_id: &str,
        rule_id: &str,
        patch: RulePatch,
    ) -> Result<AutomationRule> {
        let mut rule = self
            .get_rule(project_id, rule_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("automation rule {rule_id}")))?;
        if let Some(v) = patch.name {
            rule.name = v;
        }
        if patch.description.is_some() {
            rule.description = patch.description;
        }
        if let Some(v) = patch.enabled {
            rule.enabled = v;
        }
        if let Some(v) = patch.trigger {
            rule.trigger = v;
        }
        if patch.conditions.is_some() {
            rule.conditions = patch.conditions;
        }
        if let Some(v) = patch.actions {
            rule.actions = v;
        }
        rule.updated_at = Utc::now();
        self.save_rule(&rule).await?;
        Ok(rule)
    }

    pub async fn delete_rule(&self, project_id: &str, rule_id: &str) -> Result<bool> {
        self.store
            .remove(&self.store.record_path(project_id, RULES, rule_id))
            .await
    }

    async fn save_rule(&self, rule: &AutomationRule) -> Result<()> {
        self.store
            .write(
                &self.store.record_path(&rule.project_id, RULES, &rule.id),
                rule,
            )
            .await
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Newest first.
    pub async fn list_runs(&self, project_id: &str) -> Result<Vec<AutomationRun>> {
        let mut runs: Vec<AutomationRun> = self
            .store
            .list(&self.store.collection_dir(project_id, RUNS))
            .await?;
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }

    /// Runs waiting for the worker, oldest first.
    pub async fn queued_runs(&self, project_id: &str) -> Result<Vec<AutomationRun>> {
        let mut runs: Vec<AutomationRun> = self
            .list_runs(project_id)
            .await?
            .into_iter()
            .filter(|r| r.status == RunStatus::Queued)
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(runs)
    }

    pub async fn get_run(&self, project_id: &str, run_id: &str) -> Result<Option<AutomationRun>> {
        self.store
            .read(&self.store.record_path(project_id, RUNS, run_id))
            .await
    }

    async fn save_run(&self, run: &AutomationRun) -> Result<()> {
        self.store
            .write(&self.store.record_path(&run.project_id, RUNS, &run.id), run)
            .await
    }

    // -----------------------------------------------------------------------
    // Triggering
    // -----------------------------------------------------------------------

    /// Queue a run for every enabled rule the event matches.
    pub async fn trigger_event(&self, event: &Event) -> Result<Vec<AutomationRun>> {
        let project_id = event.project_id.as_str();
        let cascade = Cascade::from_payload(&event.payload);

        if cascade.depth > MAX_CAUSAL_DEPTH {
            warn!(
                project_id,
                event_id = %event.id,
                event_type = %event.event_type,
                depth = cascade.depth,
                "automation cascade cut off"
            );
            self.events
                .append(
                    project_id,
                    NewEvent::new(
                        EventType::AutomationLoopGuardTriggered,
                        "automation",
                        event.id.clone(),
                    )
                    .payload(json!({
                        "sourceEventId": event.id,
                        "sourceEventType": event.event_type,
                        "causalDepth": cascade.depth,
                        "visitedRuleIds": cascade.visited,
                        "maxDepth": MAX_CAUSAL_DEPTH,
                    }))
                    .idempotency_key(format!("automation:loop_guard:{}", event.id))
                    .causal_chain(event.causal_chain_id.clone()),
                )
                .await?;
            return Ok(Vec::new());
        }

        let candidates: Vec<AutomationRule> = self
            .list_rules(project_id)
            .await?
            .into_iter()
            .filter(|r| r.enabled)
            .filter(|r| r.trigger.trigger_type.event_type().as_ref() == Some(&event.event_type))
            .filter(|r| matches(r.conditions.as_ref(), &event.payload))
            .collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let project = profiles::load_project(&self.store, project_id).await?;
        let load = self.jobs.load(project_id, Utc::now()).await?;
        let mut runs = Vec::new();
        for rule in candidates {
            if cascade.visited.contains(&rule.id) {
                debug!(project_id, rule_id = %rule.id, "rule already visited in this cascade");
                continue;
            }

            let blocked = match self.breakers.check_velocity(&project, &rule.id).await? {
                Verdict::Block { reason } => Some((BreakerType::Velocity, reason)),
                Verdict::Allow => match self
                    .breakers
                    .check_queue_depth(&project, &rule.id, load.depth, load.throughput_per_min)
                    .await?
                {
                    Verdict::Block { reason } => Some((BreakerType::QueueDepth, reason)),
                    Verdict::Allow => None,
                },
            };
            if let Some((breaker_type, reason)) = blocked {
                let breaker_id = CircuitBreaker::breaker_id(&rule.id, breaker_type);
                warn!(project_id, rule_id = %rule.id, %reason, "automation trigger blocked");
                let mut payload = JsonMap::new();
                payload.insert("breakerId".into(), json!(breaker_id));
                payload.insert("ruleId".into(), json!(rule.id));
                payload.insert("type".into(), json!(breaker_type.as_str()));
                payload.insert("reason".into(), json!(reason));
                payload.insert("sourceEventId".into(), json!(event.id));
                cascade.stamp(&mut payload);
                self.events
                    .append(
                        project_id,
                        NewEvent::new(EventType::CircuitBreakerBlocked, "circuit_breaker", breaker_id)
                            .payload(Value::Object(payload))
                            .idempotency_key(format!(
                                "circuit_breaker:{}:blocked:{}",
                                rule.id, event.id
                            ))
                            .causal_chain(event.causal_chain_id.clone()),
                    )
                    .await?;
                continue;
            }

            let mut carried = event.clone();
            cascade.next(&rule.id).stamp(&mut carried.payload);
            let mut meta = JsonMap::new();
            meta.insert("trigger".into(), json!(event.event_type));
            meta.insert("event".into(), serde_json::to_value(&carried)?);
            let run = self.queue_run(&rule, false, meta).await?;
            runs.push(run);
        }
        Ok(runs)
    }

    /// Queue a run of `rule_id` outside any event cascade.
    pub async fn trigger_manual(
        &self,
        project_id: &str,
        rule_id: &str,
        dry_run: bool,
    ) -> Result<AutomationRun> {
        let rule = self
            .get_rule(project_id, rule_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("automation rule {rule_id}")))?;
        let mut meta = JsonMap::new();
        meta.insert("trigger".into(), json!("manual"));
        self.queue_run(&rule, dry_run, meta).await
    }

    async fn queue_run(
        &self,
        rule: &AutomationRule,
        dry_run: bool,
        meta: JsonMap,
    ) -> Result<AutomationRun> {
        let now = Utc::now();
        let run = AutomationRun {
            id: Uuid::new_v4().to_string(),
            project_id: rule.project_id.clone(),
            rule_id: rule.id.clone(),
            status: RunStatus::Queued,
            dry_run,
            created_at: now,
            updated_at: now,
            started_at: None,
            ended_at: None,
            error: None,
            steps: Vec::new(),
            meta,
        };
        self.save_run(&run).await?;
        info!(project_id = %run.project_id, rule_id = %rule.id, run_id = %run.id, dry_run, "automation run queued");
        metrics::automation_runs().add(1, &[KeyValue::new("status", "queued")]);
        self.emit_run(&run, EventType::AutomationRunQueued).await?;
        Ok(run)
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Execute a queued run. Runs in any other state come back unchanged.
    pub async fn execute_run(&self, project_id: &str, run_id: &str) -> Result<AutomationRun> {
        let mut run = self
            .get_run(project_id, run_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("automation run {run_id}")))?;
        if run.status != RunStatus::Queued {
            return Ok(run);
        }
        let span = job_span::start_run_span(project_id, &run.rule_id, &run.id);
        async move {
            let now = Utc::now();
            let Some(mut rule) = self.get_rule(project_id, &run.rule_id).await? else {
                run.status = RunStatus::Failed;
                run.error = Some("Rule not found".into());
                run.ended_at = Some(now);
                run.updated_at = now;
                self.finish(&run).await?;
                return Ok(run);
            };

            run.status = RunStatus::Running;
            run.started_at = Some(now);
            run.updated_at = now;
            self.save_run(&run).await?;

            for action in &rule.actions {
                let mut step = RunStep {
                    id: Uuid::new_v4().to_string(),
                    step_type: action.kind().to_string(),
                    status: RunStatus::Running,
                    started_at: Utc::now(),
                    ended_at: None,
                    meta: None,
                    error: None,
                };
                let outcome = if run.dry_run {
                    let mut meta = StepMeta::new();
                    meta.insert("dryRun".into(), Value::Bool(true));
                    Ok(meta)
                } else {
                    let ctx = ActionContext {
                        store: &self.store,
                        jobs: &self.jobs,
                        run: &run,
                    };
                    action.execute(&ctx).await
                };
                step.ended_at = Some(Utc::now());
                match outcome {
                    Ok(meta) => {
                        step.status = RunStatus::Succeeded;
                        step.meta = Some(meta);
                        run.steps.push(step);
                    }
                    Err(e) => {
                        let message = e.to_string();
                        warn!(run_id = %run.id, step = action.kind(), error = %message, "automation step failed");
                        step.status = RunStatus::Failed;
                        step.error = Some(message.clone());
                        run.steps.push(step);
                        run.status = RunStatus::Failed;
                        run.error = Some(message);
                        break;
                    }
                }
            }

            let now = Utc::now();
            if run.status == RunStatus::Running {
                run.status = RunStatus::Succeeded;
            }
            run.ended_at = Some(now);
            run.updated_at = now;
            rule.last_run_at = Some(now);
            self.save_rule(&rule).await?;
            self.finish(&run).await?;
            Ok::<_, Error>(run)
        }
        .instrument(span)
        .await
    }

    async fn finish(&self, run: &AutomationRun) -> Result<()> {
        self.save_run(run).await?;
        info!(run_id = %run.id, status = %run.status, steps = run.steps.len(), "automation run finished");
        metrics::automation_runs().add(1, &[KeyValue::new("status", run.status.to_string())]);
        let event_type = if run.status == RunStatus::Succeeded {
            EventType::AutomationRunSucceeded
        } else {
            EventType::AutomationRunFailed
        };
        self.emit_run(run, event_type).await
    }

    async fn emit_run(&self, run: &AutomationRun, event_type: EventType) -> Result<()> {
        let mut payload = JsonMap::new();
        payload.insert("runId".into(), json!(run.id));
        payload.insert("ruleId".into(), json!(run.rule_id));
        payload.insert("status".into(), json!(run.status));
        payload.insert("dryRun".into(), json!(run.dry_run));
        if !run.steps.is_empty() {
            payload.insert("steps".into(), json!(run.steps.len()));
        }
        if let Some(ref error) = run.error {
            payload.insert("error".into(), json!(error));
        }
        if let Some(event_payload) = run.event_payload() {
            Cascade::from_payload(event_payload).stamp(&mut payload);
        }

        let mut new = NewEvent::new(event_type.clone(), "automation_run", run.id.clone())
            .payload(Value::Object(payload))
            .idempotency_key(format!("automation_run:{}:{}", run.id, event_type));
        if let Some(chain) = run
            .meta
            .get("event")
            .and_then(|e| e.get("causalChainId"))
            .and_then(Value::as_str)
        {
            new = new.causal_chain(chain);
        }
        self.events.append(&run.project_id, new).await?;
        Ok(())
    }
}
