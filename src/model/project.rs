//! Project record and the policies it carries.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::breaker::BreakerConfigPatch;
use super::job::RetryPolicies;
use super::lora::LoraSelectionPolicy;
use super::profile::{CheckpointProfile, RuntimeSafety, TagFragment};
use crate::error::Result;
use crate::store::Record;
use crate::store::schema::require_non_empty;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub policies: ProjectPolicies,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectPolicies {
    #[serde(default)]
    pub retry: RetryPolicies,
    #[serde(default)]
    pub circuit_breaker_policy: BreakerConfigPatch,
    /// Keyed by checkpoint id.
    #[serde(default)]
    pub checkpoint_profiles: BTreeMap<String, CheckpointProfile>,
    /// checkpoint id -> tag -> fragment.
    #[serde(default)]
    pub tag_prompt_map: BTreeMap<String, BTreeMap<String, TagFragment>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_safety: Option<RuntimeSafety>,
    /// checkpoint id -> baseline allow-list.
    #[serde(default)]
    pub checkpoint_baseline_map: BTreeMap<String, CheckpointBaselineBinding>,
    #[serde(default)]
    pub lora_selection: LoraSelectionPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_review_enabled: Option<bool>,
}

impl Record for Project {
    const SCHEMA: &'static str = "project.schema.json";

    fn validate(&self) -> Result<()> {
        require_non_empty(&self.id, Self::SCHEMA, "id")
    }
}

impl ProjectPolicies {
    pub fn manual_review_enabled(&self) -> bool {
        self.manual_review_enabled.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointBaselineBinding {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_baseline_profile_ids: Option<Vec<String>>,
    /// Older spelling of the allow-list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_profile_ids: Option<Vec<String>>,
}

impl CheckpointBaselineBinding {
    pub fn allowed(&self) -> &[String] {
        self.allowed_baseline_profile_ids
            .as_deref()
            .or(self.allowed_profile_ids.as_deref())
            .unwrap_or(&[])
    }
}
