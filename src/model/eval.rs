//! LoRA eval grids and improvement runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::Record;
use crate::store::schema::{require, require_non_empty, require_unit_interval};

// ---------------------------------------------------------------------------
// Eval
// ---------------------------------------------------------------------------

/// One prompt grid rendered against a LoRA release.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalRecord {
    pub id: String,
    pub lora_id: String,
    pub release_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: EvalStatus,
    #[serde(default)]
    pub prompts: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<EvalOutput>,
    /// Delete the generated `eval_<id>_*` specs once complete.
    #[serde(default)]
    pub auto_cleanup: bool,
}

impl EvalRecord {
    pub fn is_complete(&self) -> bool {
        self.outputs.len() >= self.prompts.len()
    }

    pub fn spec_id(&self, index: usize) -> String {
        format!("eval_{}_{}", self.id, index + 1)
    }

    pub fn spec_prefix(&self) -> String {
        format!("eval_{}_", self.id)
    }
}

impl Record for EvalRecord {
    const SCHEMA: &'static str = "eval.schema.json";

    fn validate(&self) -> Result<()> {
        require_non_empty(&self.id, Self::SCHEMA, "id")?;
        require_non_empty(&self.lora_id, Self::SCHEMA, "loraId")?;
        require_non_empty(&self.release_id, Self::SCHEMA, "releaseId")?;
        require(
            !self.prompts.is_empty(),
            Self::SCHEMA,
            "prompts must not be empty",
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalStatus {
    Running,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalOutput {
    pub prompt: String,
    #[serde(default)]
    pub images: Vec<String>,
    pub asset_id: String,
    pub asset_version_id: String,
}

// ---------------------------------------------------------------------------
// Improvement run
// ---------------------------------------------------------------------------

/// An intervention measured on a cohort, gated before promotion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImprovementRun {
    pub id: String,
    pub project_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: ImprovementStatus,
    /// Specs whose assets are measured. Empty means the whole project.
    #[serde(default)]
    pub cohort_spec_ids: Vec<String>,
    #[serde(default)]
    pub promotion: Promotion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<MetricSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<MetricSnapshot>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record for ImprovementRun {
    const SCHEMA: &'static str = "improvement-run.schema.json";

    fn validate(&self) -> Result<()> {
        require_non_empty(&self.id, Self::SCHEMA, "id")?;
        require_non_empty(&self.project_id, Self::SCHEMA, "projectId")?;
        for snapshot in [&self.before, &self.after].into_iter().flatten() {
            require_unit_interval(
                snapshot.first_pass_approval_rate,
                Self::SCHEMA,
                "firstPassApprovalRate",
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImprovementStatus {
    Draft,
    Running,
    Completed,
    Failed,
    RolledBack,
}

impl ImprovementStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ImprovementStatus::Draft => "draft",
            ImprovementStatus::Running => "running",
            ImprovementStatus::Completed => "completed",
            ImprovementStatus::Failed => "failed",
            ImprovementStatus::RolledBack => "rolled_back",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Promotion {
    pub status: PromotionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionStatus {
    #[default]
    Pending,
    Deferred,
    Promoted,
    RolledBack,
}

impl PromotionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PromotionStatus::Pending => "pending",
            PromotionStatus::Deferred => "deferred",
            PromotionStatus::Promoted => "promoted",
            PromotionStatus::RolledBack => "rolled_back",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSnapshot {
    #[serde(default)]
    pub total_assets: u64,
    #[serde(default)]
    pub approved_count: u64,
    #[serde(default)]
    pub rejected_count: u64,
    #[serde(default)]
    pub first_pass_approval_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator_pass_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_validator_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampled_at: Option<DateTime<Utc>>,
}
