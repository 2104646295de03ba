//! Generated assets: versions of rendered variants for a spec.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::JsonMap;
use crate::error::Result;
use crate::store::Record;
use crate::store::schema::{require, require_non_empty};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub id: String,
    pub project_id: String,
    pub spec_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub versions: Vec<AssetVersion>,
}

impl Asset {
    pub fn version(&self, version_id: &str) -> Option<&AssetVersion> {
        self.versions.iter().find(|v| v.id == version_id)
    }

    pub fn version_mut(&mut self, version_id: &str) -> Option<&mut AssetVersion> {
        self.versions.iter_mut().find(|v| v.id == version_id)
    }

    /// Most recent approved version.
    pub fn latest_approved(&self) -> Option<&AssetVersion> {
        self.versions
            .iter()
            .rev()
            .find(|v| v.status == VersionStatus::Approved)
    }
}

impl Record for Asset {
    const SCHEMA: &'static str = "asset.schema.json";

    fn validate(&self) -> Result<()> {
        require_non_empty(&self.id, Self::SCHEMA, "id")?;
        require_non_empty(&self.project_id, Self::SCHEMA, "projectId")?;
        require_non_empty(&self.spec_id, Self::SCHEMA, "specId")?;
        for version in &self.versions {
            if let Some(ref primary) = version.primary_variant_id {
                require(
                    version.variants.iter().any(|v| &v.id == primary),
                    Self::SCHEMA,
                    format!("primaryVariantId {primary} is not a variant of version {}", version.id),
                )?;
            }
            for variant in &version.variants {
                if let Some(rating) = variant.rating {
                    require(
                        (0..=5).contains(&rating),
                        Self::SCHEMA,
                        "variant rating must be between 0 and 5",
                    )?;
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetVersion {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub status: VersionStatus,
    /// Provenance of the render: prompt package, seed, LoRAs, validator
    /// result, frame info.
    #[serde(default)]
    pub generation: JsonMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_variant_id: Option<String>,
    #[serde(default)]
    pub variants: Vec<Variant>,
}

impl AssetVersion {
    pub fn variant_mut(&mut self, variant_id: &str) -> Option<&mut Variant> {
        self.variants.iter_mut().find(|v| v.id == variant_id)
    }

    /// Image to use downstream: primary variant, preferring its alpha cut.
    pub fn primary_image(&self) -> Option<&str> {
        let variant = match self.primary_variant_id {
            Some(ref id) => self.variants.iter().find(|v| &v.id == id),
            None => self.variants.first(),
        }?;
        Some(variant.alpha_path.as_deref().unwrap_or(&variant.original_path))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    Draft,
    Review,
    Approved,
    Rejected,
    Deprecated,
}

impl std::str::FromStr for VersionStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| crate::error::Error::Other(format!("unknown version status: {s}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variant {
    pub id: String,
    /// Relative to the data root.
    pub original_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alpha_path: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<u8>,
    pub status: VariantStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantStatus {
    Candidate,
    Selected,
    Rejected,
}

impl std::str::FromStr for VariantStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| crate::error::Error::Other(format!("unknown variant status: {s}")))
    }
}
