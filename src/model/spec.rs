//! Asset specs: the declarative input to generation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::JsonMap;
use crate::error::Result;
use crate::store::Record;
use crate::store::schema::{require, require_non_empty};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetSpec {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub asset_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_profile_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_profile_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_profile_id: Option<String>,
    #[serde(default)]
    pub lora_ids: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<String>,
    #[serde(default)]
    pub prompt: PromptPair,
    #[serde(default)]
    pub generation_params: JsonMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_policy: Option<PromptPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_policy: Option<SeedPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_contract: Option<QualityContract>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_link: Option<EntityLink>,
    #[serde(default)]
    pub status: SpecStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AssetSpec {
    /// Frame count of a multi-frame spec; 1 otherwise.
    pub fn frame_count(&self) -> usize {
        self.output
            .as_ref()
            .and_then(|o| o.animation.as_ref())
            .map(|a| {
                a.frame_count
                    .map(|n| n as usize)
                    .unwrap_or(a.frame_names.len())
            })
            .filter(|n| *n > 0)
            .unwrap_or(1)
    }

    pub fn wants_transparent_background(&self) -> bool {
        self.output
            .as_ref()
            .and_then(|o| o.background.as_deref())
            == Some("transparent_required")
    }
}

impl Record for AssetSpec {
    const SCHEMA: &'static str = "asset-spec.schema.json";

    fn validate(&self) -> Result<()> {
        require_non_empty(&self.id, Self::SCHEMA, "id")?;
        require_non_empty(&self.project_id, Self::SCHEMA, "projectId")?;
        require_non_empty(&self.asset_type, Self::SCHEMA, "assetType")?;
        if self.status == SpecStatus::Ready {
            require(
                self.checkpoint_id.is_some(),
                Self::SCHEMA,
                "checkpointId is required when status=ready",
            )?;
        }
        if let Some(ref qc) = self.quality_contract {
            if let Some(tol) = qc.silhouette_drift_tolerance {
                require(
                    (0.0..=1.0).contains(&tol),
                    Self::SCHEMA,
                    "qualityContract.silhouetteDriftTolerance must be between 0 and 1",
                )?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecStatus {
    #[default]
    Draft,
    Ready,
    Deprecated,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptPair {
    #[serde(default)]
    pub positive: String,
    #[serde(default)]
    pub negative: String,
}

impl PromptPair {
    pub fn new(positive: impl Into<String>, negative: impl Into<String>) -> Self {
        Self {
            positive: positive.into(),
            negative: negative.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputSpec {
    #[serde(default)]
    pub kind: OutputKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub animation: Option<AnimationSpec>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    #[default]
    SingleImage,
    Animation,
    UiStates,
    LogoSet,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnimationSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#loop: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_count: Option<u32>,
    #[serde(default)]
    pub frame_names: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptPolicy {
    #[serde(default)]
    pub compile_mode: CompileMode,
    #[serde(default)]
    pub tag_order_mode: TagOrderMode,
    #[serde(default)]
    pub tag_order: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompileMode {
    SpecOverride,
    #[default]
    #[serde(other)]
    CheckpointProfileDefault,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagOrderMode {
    Explicit,
    /// Weight descending, then tag name.
    #[default]
    #[serde(other)]
    CheckpointDefault,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedPolicy {
    #[serde(default)]
    pub mode: SeedMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_seed: Option<u64>,
    #[serde(default)]
    pub derive_from: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedMode {
    Fixed,
    Derived,
    #[default]
    #[serde(other)]
    RandomRecorded,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityContract {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_policy: Option<BackgroundPolicy>,
    #[serde(default)]
    pub required_states: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alignment_tolerance_px: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perspective_mode: Option<PerspectiveMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub silhouette_drift_tolerance: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundPolicy {
    WhiteOrTransparent,
    TransparentOnly,
    WhiteOnly,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerspectiveMode {
    Strict,
    AllowMinor,
    Any,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityLink {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}
