//! LoRA records and the project's selection policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::JsonMap;
use crate::error::Result;
use crate::store::Record;
use crate::store::schema::{require, require_non_empty};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoraRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub scope: LoraScope,
    #[serde(default)]
    pub checkpoint_id: String,
    #[serde(default)]
    pub asset_types: Vec<String>,
    #[serde(default)]
    pub recommended: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_release_id: Option<String>,
    #[serde(default)]
    pub releases: Vec<LoraRelease>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl LoraRecord {
    pub fn release(&self, release_id: &str) -> Option<&LoraRelease> {
        self.releases.iter().find(|r| r.id == release_id)
    }

    /// Usable for a checkpoint/asset-type pair. Empty fields match anything.
    pub fn is_compatible(&self, checkpoint_id: &str, asset_type: &str) -> bool {
        if !checkpoint_id.is_empty()
            && !self.checkpoint_id.is_empty()
            && self.checkpoint_id != checkpoint_id
        {
            return false;
        }
        if !self.asset_types.is_empty() && !asset_type.is_empty() {
            return self.asset_types.iter().any(|t| t == asset_type);
        }
        true
    }

    pub fn default_strength(&self) -> f64 {
        self.scope.default_strength()
    }
}

impl Record for LoraRecord {
    const SCHEMA: &'static str = "lora.schema.json";

    fn validate(&self) -> Result<()> {
        require_non_empty(&self.id, Self::SCHEMA, "id")?;
        if let Some(ref active) = self.active_release_id {
            require(
                self.release(active).is_some(),
                Self::SCHEMA,
                format!("activeReleaseId {active} is not a release of {}", self.id),
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoraScope {
    Baseline,
    Project,
}

impl LoraScope {
    /// Strength used when a request names no weight.
    pub fn default_strength(self) -> f64 {
        match self {
            LoraScope::Baseline => 0.6,
            LoraScope::Project => 0.9,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoraRelease {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    pub status: ReleaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
}

impl LoraRelease {
    /// Weight file name as the backend expects it, forward slashes.
    pub fn weight_path(&self) -> Option<String> {
        self.weights
            .as_ref()
            .and_then(|w| w.get("path"))
            .and_then(|p| p.as_str())
            .or(self.local_path.as_deref())
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| p.replace('\\', "/"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    Candidate,
    Approved,
    Deprecated,
}

// ---------------------------------------------------------------------------
// Selection policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoraSelectionPolicy {
    #[serde(default)]
    pub mode: LoraSelectionMode,
    #[serde(default = "yes")]
    pub prefer_recommended: bool,
    #[serde(default = "two")]
    pub max_active_loras: usize,
    #[serde(default)]
    pub release_policy: ReleasePolicy,
}

fn yes() -> bool {
    true
}

fn two() -> usize {
    2
}

impl Default for LoraSelectionPolicy {
    fn default() -> Self {
        Self {
            mode: LoraSelectionMode::default(),
            prefer_recommended: true,
            max_active_loras: 2,
            release_policy: ReleasePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoraSelectionMode {
    Manual,
    ProjectThenBaseline,
    BaselineOnly,
    ProjectOnly,
    #[default]
    #[serde(other)]
    BaselineThenProject,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleasePolicy {
    ActiveOnly,
    #[default]
    #[serde(other)]
    ActiveOrLatestApproved,
}

/// A LoRA bound into a generate job's input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedLora {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lora_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_id: Option<String>,
    pub lora_name: String,
    pub strength_model: f64,
    pub strength_clip: f64,
}
