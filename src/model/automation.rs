//! Automation rules, their actions, and the runs they produce.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::JsonMap;
use super::event::EventType;
use super::job::JobType;
use crate::error::Result;
use crate::store::Record;
use crate::store::schema::{require, require_non_empty};

// ---------------------------------------------------------------------------
// Rule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationRule {
    pub id: String,
    pub project_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub enabled: bool,
    pub trigger: RuleTrigger,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Conditions>,
    #[serde(default)]
    pub actions: Vec<Action>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
}

impl Record for AutomationRule {
    const SCHEMA: &'static str = "automation-rule.schema.json";

    fn validate(&self) -> Result<()> {
        require_non_empty(&self.id, Self::SCHEMA, "id")?;
        require_non_empty(&self.project_id, Self::SCHEMA, "projectId")?;
        require_non_empty(&self.name, Self::SCHEMA, "name")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleTrigger {
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    SpecRefined,
    AssetApproved,
    AtlasReady,
    LoraActivated,
    Schedule,
    Manual,
}

impl TriggerType {
    /// Event type this trigger listens for. Schedule and manual triggers
    /// never match log events.
    pub fn event_type(self) -> Option<EventType> {
        match self {
            TriggerType::SpecRefined => Some(EventType::SpecRefined),
            TriggerType::AssetApproved => Some(EventType::AssetApproved),
            TriggerType::AtlasReady => Some(EventType::AtlasReady),
            TriggerType::LoraActivated => Some(EventType::LoraActivated),
            TriggerType::Schedule | TriggerType::Manual => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

/// Predicate over an event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Conditions {
    /// `{ all: [...], any: [...] }`; an empty list is vacuously true.
    Grouped(ConditionGroup),
    /// `{ field: value, ... }`; every field must equal its value.
    Fields(BTreeMap<String, serde_json::Value>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionGroup {
    #[serde(default)]
    pub all: Vec<Condition>,
    #[serde(default)]
    pub any: Vec<Condition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    /// Payload field, dotted for nested lookups.
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equals: Option<serde_json::Value>,
    #[serde(rename = "in", default, skip_serializing_if = "Option::is_none")]
    pub one_of: Option<Vec<serde_json::Value>>,
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// A step a rule performs when it fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "snake_case")]
pub enum Action {
    EnqueueJob(EnqueueJobConfig),
    Export(ExportConfig),
    RunEvalGrid(RunEvalGridConfig),
    EnqueueLoraRenders(EnqueueLoraRendersConfig),
    ApplyTags(ApplyTagsConfig),
    SetStatus(SetStatusConfig),
    AutoAtlasPack(AutoAtlasPackConfig),
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::EnqueueJob(_) => "enqueue_job",
            Action::Export(_) => "export",
            Action::RunEvalGrid(_) => "run_eval_grid",
            Action::EnqueueLoraRenders(_) => "enqueue_lora_renders",
            Action::ApplyTags(_) => "apply_tags",
            Action::SetStatus(_) => "set_status",
            Action::AutoAtlasPack(_) => "auto_atlas_pack",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueJobConfig {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub job_type: Option<JobType>,
    #[serde(default)]
    pub input: JsonMap,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportConfig {
    #[serde(default)]
    pub asset_ids: Vec<String>,
    #[serde(default)]
    pub atlas_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_snapshot: Option<JsonMap>,
    #[serde(default)]
    pub animations: Vec<serde_json::Value>,
    #[serde(default)]
    pub ui: Vec<serde_json::Value>,
}

/// Prompts are either a list or one `|`-separated string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptList {
    List(Vec<String>),
    Joined(String),
}

impl PromptList {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            PromptList::List(items) => items.clone(),
            PromptList::Joined(joined) => joined
                .split('|')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvalGridConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lora_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<PromptList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variants: Option<u32>,
    #[serde(default)]
    pub auto_cleanup: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueLoraRendersConfig {
    /// Falls back to the triggering event's `loraId`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lora_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strength: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyTagsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set: Option<Vec<String>>,
    #[serde(default)]
    pub add: Vec<String>,
    #[serde(default)]
    pub remove: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetStatusConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoAtlasPackConfig {
    /// Falls back to the triggering event's `specId`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub padding: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<u32>,
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationRun {
    pub id: String,
    pub project_id: String,
    pub rule_id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub dry_run: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub steps: Vec<RunStep>,
    /// Carries the triggering event under `event`.
    #[serde(default)]
    pub meta: JsonMap,
}

impl AutomationRun {
    /// The triggering event's payload, if the run was event-driven.
    pub fn event_payload(&self) -> Option<&JsonMap> {
        self.meta
            .get("event")
            .and_then(|e| e.get("payload"))
            .and_then(|p| p.as_object())
    }
}

impl Record for AutomationRun {
    const SCHEMA: &'static str = "automation-run.schema.json";

    fn validate(&self) -> Result<()> {
        require_non_empty(&self.project_id, Self::SCHEMA, "projectId")?;
        require_non_empty(&self.rule_id, Self::SCHEMA, "ruleId")?;
        if self.status == RunStatus::Failed {
            require(
                self.error.is_some() || self.steps.iter().any(|s| s.error.is_some()),
                Self::SCHEMA,
                "failed run must record an error",
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStep {
    pub id: String,
    #[serde(rename = "type")]
    pub step_type: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flat_and_grouped_conditions_parse_distinctly() {
        let grouped: Conditions =
            serde_json::from_value(json!({"all": [{"field": "status", "equals": "ready"}]})).unwrap();
        assert!(matches!(grouped, Conditions::Grouped(ref g) if g.all.len() == 1));

        let flat: Conditions = serde_json::from_value(json!({"assetType": "sprite"})).unwrap();
        assert!(matches!(flat, Conditions::Fields(ref m) if m.contains_key("assetType")));
    }

    #[test]
    fn actions_use_type_and_config_keys() {
        let action: Action = serde_json::from_value(json!({
            "type": "enqueue_job",
            "config": {"type": "generate", "input": {"specId": "s1"}}
        }))
        .unwrap();
        match action {
            Action::EnqueueJob(cfg) => {
                assert_eq!(cfg.job_type, Some(JobType::Generate));
                assert_eq!(cfg.input.get("specId"), Some(&json!("s1")));
            }
            other => panic!("unexpected action {}", other.kind()),
        }
    }

    #[test]
    fn joined_prompts_split_on_pipe() {
        let p = PromptList::Joined(" a knight | | a mage ".into());
        assert_eq!(p.to_vec(), vec!["a knight", "a mage"]);
    }
}
