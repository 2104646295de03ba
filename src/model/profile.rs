//! Checkpoints, checkpoint profiles, and baseline profiles.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::JsonMap;
use super::spec::{PromptPair, TagOrderMode};
use crate::error::Result;
use crate::store::Record;
use crate::store::schema::require_non_empty;

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// A model checkpoint and its legacy prompt templates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub prompt_templates: PromptTemplates,
    #[serde(default)]
    pub default_generation_params: JsonMap,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptTemplates {
    #[serde(default)]
    pub base_positive: String,
    #[serde(default)]
    pub base_negative: String,
    #[serde(default)]
    pub per_asset_type: BTreeMap<String, PromptPair>,
}

// ---------------------------------------------------------------------------
// Checkpoint profile
// ---------------------------------------------------------------------------

/// Versioned prompt defaults bound to a checkpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointProfile {
    pub profile_id: String,
    #[serde(default = "one")]
    pub version: u32,
    pub checkpoint_id: String,
    #[serde(default)]
    pub base_positive: String,
    #[serde(default)]
    pub base_negative: String,
    #[serde(default)]
    pub per_asset_type: BTreeMap<String, PromptPair>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_order_policy: Option<TagOrderMode>,
    #[serde(default)]
    pub tag_order: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_safety: Option<RuntimeSafety>,
}

fn one() -> u32 {
    1
}

/// Fragments appended last to every compiled prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSafety {
    #[serde(default = "enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub positive: Vec<String>,
    #[serde(default)]
    pub negative: Vec<String>,
}

fn enabled() -> bool {
    true
}

/// A tag's contribution to the `tag_prompt_map` layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagFragment {
    #[serde(default)]
    pub positive: String,
    #[serde(default)]
    pub negative: String,
    #[serde(default)]
    pub weight: f64,
}

// ---------------------------------------------------------------------------
// Baseline profile
// ---------------------------------------------------------------------------

/// House style and validation/routing policy, bound to one checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaselineProfile {
    pub id: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_profile_id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default = "one")]
    pub version: u32,
    #[serde(default)]
    pub global: JsonMap,
    #[serde(default)]
    pub asset_type_profiles: BTreeMap<String, AssetTypeProfile>,
    #[serde(default)]
    pub validator_policy: JsonMap,
    #[serde(default)]
    pub routing_policy: RoutingPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Record for BaselineProfile {
    const SCHEMA: &'static str = "baseline-profile.schema.json";

    fn validate(&self) -> Result<()> {
        require_non_empty(&self.id, Self::SCHEMA, "id")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetTypeProfile {
    #[serde(default)]
    pub prompt_hints: Vec<String>,
    #[serde(default)]
    pub negative_prompt_hints: Vec<String>,
    #[serde(default)]
    pub required_states: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_alignment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub padding_px: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingPolicy {
    pub on_pass: RouteDecision,
    pub on_fail: RouteDecision,
    pub on_uncertain: RouteDecision,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            on_pass: RouteDecision::AutoAdvance,
            on_fail: RouteDecision::ManualReview,
            on_uncertain: RouteDecision::QueueDecisionSprint,
        }
    }
}

/// What happens to a scored variant set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteDecision {
    AutoAdvance,
    AutoRegenerate,
    QueueDecisionSprint,
    ManualReview,
    Reject,
}

impl std::fmt::Display for RouteDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RouteDecision::AutoAdvance => "auto_advance",
            RouteDecision::AutoRegenerate => "auto_regenerate",
            RouteDecision::QueueDecisionSprint => "queue_decision_sprint",
            RouteDecision::ManualReview => "manual_review",
            RouteDecision::Reject => "reject",
        };
        write!(f, "{s}")
    }
}
