//! Jobs: units of pipeline work with a retry/escalation lifecycle.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::JsonMap;
use crate::error::{Error, Result};
use crate::store::Record;
use crate::store::schema::{require, require_non_empty};

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A unit of work tracked by the execution core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub project_id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Processor parameters. Opaque to the state machine apart from
    /// `nextJobs`, which declares follow-on work.
    #[serde(default)]
    pub input: JsonMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<JsonMap>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,

    /// Failed attempts so far. Unset until the first failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Not eligible for pickup before this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_history: Vec<RetryHistoryEntry>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_target: Option<EscalationTarget>,

    /// Execution log, relative to the data root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
}

impl Job {
    /// Queued and past any scheduled retry time.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued && self.next_retry_at.is_none_or(|at| at <= now)
    }

    /// Move to `to`, refusing transitions the lifecycle does not allow.
    pub fn transition(&mut self, to: JobStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    /// Merge processor output into whatever is already recorded.
    pub fn merge_output(&mut self, patch: JsonMap) {
        self.output.get_or_insert_with(JsonMap::new).extend(patch);
    }
}

impl Record for Job {
    const SCHEMA: &'static str = "job.schema.json";

    fn validate(&self) -> Result<()> {
        require_non_empty(&self.project_id, Self::SCHEMA, "projectId")?;
        if let Some(max) = self.max_attempts {
            require(max >= 1, Self::SCHEMA, "maxAttempts must be >= 1")?;
        }
        if self.status == JobStatus::Failed {
            require(
                self.error.is_some(),
                Self::SCHEMA,
                "failed job must carry an error",
            )?;
        }
        Ok(())
    }
}

/// Newtype for job IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 chars, for tables and log lines.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::Other(format!("invalid job id {s}: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Type & Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Generate,
    BgRemove,
    AtlasPack,
    Export,
}

impl JobType {
    pub const ALL: [JobType; 4] = [
        JobType::Generate,
        JobType::BgRemove,
        JobType::AtlasPack,
        JobType::Export,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobType::Generate => "generate",
            JobType::BgRemove => "bg_remove",
            JobType::AtlasPack => "atlas_pack",
            JobType::Export => "export",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::Other(format!("unknown job type: {s}")))
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker (possibly until `nextRetryAt`).
    Queued,
    /// A worker is executing it.
    Running,
    Succeeded,
    /// Permanently failed and escalated. Can be retried by an operator.
    Failed,
    /// Stopped by an operator. Can be retried.
    Canceled,
}

impl JobStatus {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Queued, Running)
                | (Queued, Canceled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Canceled)
                | (Running, Queued)     // scheduled retry or stuck sweep
                | (Failed, Queued)      // operator retry
                | (Canceled, Queued) // operator retry
        )
    }

    /// No further automatic progress.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        use JobStatus::*;
        [Queued, Running, Succeeded, Failed, Canceled]
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| Error::Other(format!("unknown job status: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Failure taxonomy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Bad input, schema violations, logic errors. The default.
    NonRetryable,
    Timeout,
    UpstreamUnavailable,
    /// Contention: locks, busy resources, rate limits.
    Retryable,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::NonRetryable => "non_retryable",
            ErrorClass::Timeout => "timeout",
            ErrorClass::UpstreamUnavailable => "upstream_unavailable",
            ErrorClass::Retryable => "retryable",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a permanently failed job is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationTarget {
    ExceptionInbox,
    DecisionSprint,
    Reject,
}

impl EscalationTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            EscalationTarget::ExceptionInbox => "exception_inbox",
            EscalationTarget::DecisionSprint => "decision_sprint",
            EscalationTarget::Reject => "reject",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryHistoryEntry {
    pub attempt: u32,
    pub at: DateTime<Utc>,
    pub error: String,
    pub error_class: ErrorClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffMode {
    Exponential,
    Fixed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_mode: BackoffMode,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_pct: f64,
    pub retry_on: Vec<ErrorClass>,
    pub escalate_to: EscalationTarget,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_mode: BackoffMode::Exponential,
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
            jitter_pct: 0.2,
            retry_on: vec![
                ErrorClass::Retryable,
                ErrorClass::Timeout,
                ErrorClass::UpstreamUnavailable,
            ],
            escalate_to: EscalationTarget::ExceptionInbox,
        }
    }
}

impl RetryPolicy {
    /// Overlay the fields set in `patch`.
    pub fn merged(mut self, patch: &RetryPolicyPatch) -> Self {
        if let Some(v) = patch.max_attempts {
            self.max_attempts = v.max(1);
        }
        if let Some(v) = patch.backoff_mode {
            self.backoff_mode = v;
        }
        if let Some(v) = patch.base_delay_ms {
            self.base_delay_ms = v;
        }
        if let Some(v) = patch.max_delay_ms {
            self.max_delay_ms = v;
        }
        if let Some(v) = patch.jitter_pct {
            self.jitter_pct = v.clamp(0.0, 1.0);
        }
        if let Some(ref v) = patch.retry_on {
            self.retry_on = v.clone();
        }
        if let Some(v) = patch.escalate_to {
            self.escalate_to = v;
        }
        self
    }
}

/// Partial retry policy as written in project policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicyPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_mode: Option<BackoffMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_on: Option<Vec<ErrorClass>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalate_to: Option<EscalationTarget>,
}

/// `policies.retry` in project.json.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicies {
    #[serde(default)]
    pub default: RetryPolicyPatch,
    /// Keyed by job type name.
    #[serde(default)]
    pub per_job_type: BTreeMap<String, RetryPolicyPatch>,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for new jobs. The execution core's public API for submitting work.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub(crate) job_type: JobType,
    pub(crate) input: JsonMap,
    pub(crate) max_attempts: Option<u32>,
}

impl NewJob {
    pub fn new(job_type: JobType) -> Self {
        Self {
            job_type,
            input: JsonMap::new(),
            max_attempts: None,
        }
    }

    /// Replace the input. Non-object values are ignored.
    pub fn input(mut self, input: serde_json::Value) -> Self {
        if let serde_json::Value::Object(map) = input {
            self.input = map;
        }
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.input.insert(key.into(), value.into());
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    pub fn job_type(&self) -> JobType {
        self.job_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        use JobStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Queued));
        assert!(Failed.can_transition_to(Queued));
        assert!(Canceled.can_transition_to(Queued));
        assert!(!Succeeded.can_transition_to(Queued));
        assert!(!Queued.can_transition_to(Succeeded));
        assert!(!Failed.can_transition_to(Running));
    }

    #[test]
    fn policy_patch_overlays_only_set_fields() {
        let patch = RetryPolicyPatch {
            max_attempts: Some(5),
            jitter_pct: Some(0.15),
            ..Default::default()
        };
        let merged = RetryPolicy::default().merged(&patch);
        assert_eq!(merged.max_attempts, 5);
        assert_eq!(merged.jitter_pct, 0.15);
        assert_eq!(merged.base_delay_ms, 2_000);
        assert_eq!(merged.escalate_to, EscalationTarget::ExceptionInbox);
    }

    #[test]
    fn job_type_round_trips_through_str() {
        for t in JobType::ALL {
            assert_eq!(t.as_str().parse::<JobType>().unwrap(), t);
        }
        assert!("render".parse::<JobType>().is_err());
    }
}
