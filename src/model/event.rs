//! Domain events.
//!
//! Every component records what happened by appending an [`Event`] to
//! the project's log. Automation rules match on [`EventType`]; consumers
//! tail the log by sequence number.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::JsonMap;
use crate::error::Result;
use crate::store::Record;
use crate::store::schema::{require, require_non_empty};

/// An immutable entry in a project's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub project_id: String,
    /// Gapless per-project sequence, starting at 1.
    pub seq: u64,
    pub ts: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub entity_type: String,
    pub entity_id: String,
    pub causal_chain_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub payload: JsonMap,
}

impl Record for Event {
    const SCHEMA: &'static str = "event.schema.json";

    fn validate(&self) -> Result<()> {
        require_non_empty(&self.project_id, Self::SCHEMA, "projectId")?;
        require_non_empty(&self.entity_type, Self::SCHEMA, "entityType")?;
        require_non_empty(&self.entity_id, Self::SCHEMA, "entityId")?;
        require_non_empty(self.event_type.as_str(), Self::SCHEMA, "type")?;
        require(self.seq >= 1, Self::SCHEMA, "seq must be >= 1")
    }
}

/// Input to `EventLog::append`.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_type: EventType,
    pub entity_type: String,
    pub entity_id: String,
    pub causal_chain_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub payload: JsonMap,
}

impl NewEvent {
    pub fn new(
        event_type: EventType,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            causal_chain_id: None,
            idempotency_key: None,
            payload: JsonMap::new(),
        }
    }

    /// Set the payload. Objects are used as-is; `null` is empty; any
    /// other value lands under `"value"`.
    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = match payload {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => JsonMap::new(),
            other => {
                let mut map = JsonMap::new();
                map.insert("value".into(), other);
                map
            }
        };
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn causal_chain(mut self, id: impl Into<String>) -> Self {
        self.causal_chain_id = Some(id.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Event type
// ---------------------------------------------------------------------------

/// What happened. Known types get variants; anything else written by
/// outer layers round-trips through `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    SpecRefined,
    AssetGenerated,
    AssetApproved,
    AtlasReady,
    LoraActivated,
    JobQueued,
    JobRunning,
    JobProgress,
    JobRetrying,
    JobSucceeded,
    JobFailed,
    JobEscalated,
    JobCanceled,
    JobRetried,
    JobRequeuedStuck,
    AutomationRunQueued,
    AutomationRunSucceeded,
    AutomationRunFailed,
    AutomationLoopGuardTriggered,
    CircuitBreakerBlocked,
    CircuitBreakerReset,
    ImprovementRunPromoted,
    ImprovementRunRolledBack,
    Other(String),
}

static KNOWN: &[(EventType, &str)] = &[
    (EventType::SpecRefined, "spec_refined"),
    (EventType::AssetGenerated, "asset_generated"),
    (EventType::AssetApproved, "asset_approved"),
    (EventType::AtlasReady, "atlas_ready"),
    (EventType::LoraActivated, "lora_activated"),
    (EventType::JobQueued, "job_queued"),
    (EventType::JobRunning, "job_running"),
    (EventType::JobProgress, "job_progress"),
    (EventType::JobRetrying, "job_retrying"),
    (EventType::JobSucceeded, "job_succeeded"),
    (EventType::JobFailed, "job_failed"),
    (EventType::JobEscalated, "job_escalated"),
    (EventType::JobCanceled, "job_canceled"),
    (EventType::JobRetried, "job_retried"),
    (EventType::JobRequeuedStuck, "job_requeued_stuck"),
    (EventType::AutomationRunQueued, "automation_run_queued"),
    (EventType::AutomationRunSucceeded, "automation_run_succeeded"),
    (EventType::AutomationRunFailed, "automation_run_failed"),
    (
        EventType::AutomationLoopGuardTriggered,
        "automation_loop_guard_triggered",
    ),
    (EventType::CircuitBreakerBlocked, "circuit_breaker_blocked"),
    (EventType::CircuitBreakerReset, "circuit_breaker_reset"),
    (EventType::ImprovementRunPromoted, "improvement_run_promoted"),
    (
        EventType::ImprovementRunRolledBack,
        "improvement_run_rolled_back",
    ),
];

impl EventType {
    pub fn as_str(&self) -> &str {
        if let EventType::Other(s) = self {
            return s;
        }
        KNOWN
            .iter()
            .find(|(t, _)| t == self)
            .map(|(_, s)| *s)
            .unwrap_or_default()
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        KNOWN
            .iter()
            .find(|(_, name)| *name == s)
            .map(|(t, _)| t.clone())
            .unwrap_or(EventType::Other(s))
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        EventType::from(s.to_string())
    }
}

impl From<EventType> for String {
    fn from(t: EventType) -> Self {
        t.as_str().to_string()
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_and_custom_types_serialize_as_plain_strings() {
        let known = serde_json::to_value(EventType::JobRetrying).unwrap();
        assert_eq!(known, serde_json::json!("job_retrying"));

        let parsed: EventType = serde_json::from_value(serde_json::json!("asset_approved")).unwrap();
        assert_eq!(parsed, EventType::AssetApproved);

        let custom: EventType = serde_json::from_value(serde_json::json!("palette_swapped")).unwrap();
        assert_eq!(custom, EventType::Other("palette_swapped".into()));
        assert_eq!(custom.to_string(), "palette_swapped");
    }

    #[test]
    fn scalar_payload_is_wrapped() {
        let e = NewEvent::new(EventType::JobQueued, "job", "j1").payload(serde_json::json!(3));
        assert_eq!(e.payload.get("value"), Some(&serde_json::json!(3)));
    }
}
