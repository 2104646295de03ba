//! Asset spec CRUD.
//!
//! Creating a spec as `ready`, or moving one to `ready`, emits
//! `spec_refined`; the caller hands that event to the automation engine.

use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::events::EventLog;
use crate::model::JsonMap;
use crate::model::event::{Event, EventType, NewEvent};
use crate::model::spec::{
    AssetSpec, EntityLink, OutputSpec, PromptPair, PromptPolicy, QualityContract, SeedPolicy,
    SpecStatus,
};
use crate::profiles;
use crate::store::Store;

const COLLECTION: &str = "specs";

/// Fields accepted by create and update. Unset fields keep their
/// current value (update) or take the defaults (create).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecDraft {
    pub id: Option<String>,
    pub title: Option<String>,
    pub asset_type: Option<String>,
    pub checkpoint_id: Option<String>,
    pub checkpoint_profile_id: Option<String>,
    pub checkpoint_profile_version: Option<u32>,
    pub baseline_profile_id: Option<String>,
    pub lora_ids: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
    pub style: Option<String>,
    pub scenario: Option<String>,
    pub prompt: Option<PromptPatch>,
    pub generation_params: Option<JsonMap>,
    pub output: Option<OutputSpec>,
    pub prompt_policy: Option<PromptPolicy>,
    pub seed_policy: Option<SeedPolicy>,
    pub quality_contract: Option<QualityContract>,
    pub entity_link: Option<EntityLink>,
    pub status: Option<SpecStatus>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PromptPatch {
    pub positive: Option<String>,
    pub negative: Option<String>,
}

/// A persisted spec and the `spec_refined` event it produced, if any.
#[derive(Debug, Clone)]
pub struct SpecChange {
    pub spec: AssetSpec,
    pub refined: Option<Event>,
}

#[derive(Debug, Clone)]
pub struct SpecService {
    store: Store,
    events: EventLog,
}

impl SpecService {
    pub fn new(store: Store, events: EventLog) -> Self {
        Self { store, events }
    }

    pub async fn get(&self, project_id: &str, spec_id: &str) -> Result<Option<AssetSpec>> {
        self.store
            .read(&self.store.record_path(project_id, COLLECTION, spec_id))
            .await
    }

    /// Newest first.
    pub async fn list(&self, project_id: &str) -> Result<Vec<AssetSpec>> {
        let mut specs: Vec<AssetSpec> = self
            .store
            .list(&self.store.collection_dir(project_id, COLLECTION))
            .await?;
        specs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(specs)
    }

    pub async fn create(&self, project_id: &str, draft: SpecDraft) -> Result<SpecChange> {
        let project = profiles::load_project(&self.store, project_id).await?;
        profiles::enforce_checkpoint_compatibility(
            &self.store,
            &project,
            draft.checkpoint_id.as_deref(),
            draft.baseline_profile_id.as_deref(),
        )
        .await?;

        let now = Utc::now();
        let id = draft.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let prompt = draft.prompt.unwrap_or_default();
        let mut spec = AssetSpec {
            title: draft.title.unwrap_or_else(|| format!("Spec {id}")),
            id,
            project_id: project_id.to_string(),
            asset_type: draft.asset_type.unwrap_or_else(|| "ui_icon".into()),
            checkpoint_id: draft.checkpoint_id,
            checkpoint_profile_id: draft.checkpoint_profile_id,
            checkpoint_profile_version: draft.checkpoint_profile_version,
            baseline_profile_id: draft.baseline_profile_id,
            lora_ids: draft.lora_ids.unwrap_or_default(),
            tags: draft.tags.unwrap_or_default(),
            style: Some(draft.style.unwrap_or_else(|| "cartoon".into())),
            scenario: Some(draft.scenario.unwrap_or_else(|| "fantasy".into())),
            prompt: PromptPair::new(
                prompt.positive.unwrap_or_default(),
                prompt.negative.unwrap_or_default(),
            ),
            generation_params: draft.generation_params.unwrap_or_default(),
            output: draft.output,
            prompt_policy: draft.prompt_policy,
            seed_policy: draft.seed_policy,
            quality_contract: draft.quality_contract,
            entity_link: draft.entity_link,
            status: draft.status.unwrap_or_default(),
            created_at: now,
            updated_at: now,
        };
        if spec.checkpoint_profile_id.is_none() {
            if let Some(checkpoint) = spec.checkpoint_id.as_deref() {
                if let Some((profile_id, version)) =
                    profiles::derive_checkpoint_profile(&project, checkpoint)
                {
                    spec.checkpoint_profile_id = Some(profile_id);
                    spec.checkpoint_profile_version =
                        spec.checkpoint_profile_version.or(Some(version));
                }
            }
        }
        require_ready_profile(&mut spec)?;

        self.store
            .write(&self.store.record_path(project_id, COLLECTION, &spec.id), &spec)
            .await?;
        info!(project_id, spec_id = %spec.id, status = ?spec.status, "spec created");

        let refined = if spec.status == SpecStatus::Ready {
            Some(self.emit_refined(&spec).await?)
        } else {
            None
        };
        Ok(SpecChange { spec, refined })
    }

    pub async fn update(&self, project_id: &str, spec_id: &str, patch: SpecDraft) -> Result<SpecChange> {
        let mut spec = self
            .get(project_id, spec_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("spec {spec_id}")))?;
        let was_ready = spec.status == SpecStatus::Ready;
        let project = profiles::load_project(&self.store, project_id).await?;

        if let Some(v) = patch.title {
            spec.title = v;
        }
        if let Some(v) = patch.asset_type {
            spec.asset_type = v;
        }
        if let Some(v) = patch.checkpoint_id {
            spec.checkpoint_id = Some(v);
        }
        if let Some(v) = patch.checkpoint_profile_id {
            spec.checkpoint_profile_id = Some(v);
        }
        if let Some(v) = patch.checkpoint_profile_version {
            spec.checkpoint_profile_version = Some(v);
        }
        if let Some(v) = patch.baseline_profile_id {
            spec.baseline_profile_id = Some(v);
        }
        if let Some(v) = patch.lora_ids {
            spec.lora_ids = v;
        }
        if let Some(v) = patch.tags {
            spec.tags = v;
        }
        if let Some(v) = patch.style {
            spec.style = Some(v);
        }
        if let Some(v) = patch.scenario {
            spec.scenario = Some(v);
        }
        if let Some(p) = patch.prompt {
            if let Some(v) = p.positive {
                spec.prompt.positive = v;
            }
            if let Some(v) = p.negative {
                spec.prompt.negative = v;
            }
        }
        if let Some(v) = patch.generation_params {
            spec.generation_params = v;
        }
        if patch.output.is_some() {
            spec.output = patch.output;
        }
        if patch.prompt_policy.is_some() {
            spec.prompt_policy = patch.prompt_policy;
        }
        if patch.seed_policy.is_some() {
            spec.seed_policy = patch.seed_policy;
        }
        if patch.quality_contract.is_some() {
            spec.quality_contract = patch.quality_contract;
        }
        if patch.entity_link.is_some() {
            spec.entity_link = patch.entity_link;
        }
        if let Some(v) = patch.status {
            spec.status = v;
        }

        profiles::enforce_checkpoint_compatibility(
            &self.store,
            &project,
            spec.checkpoint_id.as_deref(),
            spec.baseline_profile_id.as_deref(),
        )
        .await?;
        if spec.status == SpecStatus::Ready && spec.checkpoint_profile_id.is_none() {
            if let Some((profile_id, version)) = spec
                .checkpoint_id
                .as_deref()
                .and_then(|c| profiles::derive_checkpoint_profile(&project, c))
            {
                spec.checkpoint_profile_id = Some(profile_id);
                spec.checkpoint_profile_version = Some(version);
            }
        }
        require_ready_profile(&mut spec)?;

        spec.updated_at = Utc::now();
        self.store
            .write(&self.store.record_path(project_id, COLLECTION, &spec.id), &spec)
            .await?;

        let refined = if !was_ready && spec.status == SpecStatus::Ready {
            Some(self.emit_refined(&spec).await?)
        } else {
            None
        };
        Ok(SpecChange { spec, refined })
    }

    pub async fn delete(&self, project_id: &str, spec_id: &str) -> Result<bool> {
        self.store
            .remove(&self.store.record_path(project_id, COLLECTION, spec_id))
            .await
    }

    async fn emit_refined(&self, spec: &AssetSpec) -> Result<Event> {
        let new = NewEvent::new(EventType::SpecRefined, "spec", spec.id.clone())
            .payload(json!({
                "specId": spec.id,
                "assetType": spec.asset_type,
                "status": spec.status,
            }))
            .idempotency_key(format!(
                "spec:{}:refined:{}",
                spec.id,
                spec.updated_at.timestamp_micros()
            ));
        self.events.append(&spec.project_id, new).await
    }
}

fn require_ready_profile(spec: &mut AssetSpec) -> Result<()> {
    if spec.status != SpecStatus::Ready {
        return Ok(());
    }
    if spec.checkpoint_id.is_none() {
        return Err(Error::Schema {
            schema: "asset-spec.schema.json",
            message: "checkpointId is required when status=ready".into(),
        });
    }
    if spec.checkpoint_profile_id.is_none() {
        return Err(Error::Schema {
            schema: "asset-spec.schema.json",
            message: "checkpointProfileId could not be resolved for ready spec".into(),
        });
    }
    spec.checkpoint_profile_version.get_or_insert(1);
    Ok(())
}
