//! What each rule action does when a run executes it.

use chrono::Utc;
use serde_json::{Value, json};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::jobs::JobQueue;
use crate::lora::find_lora;
use crate::model::JsonMap;
use crate::model::asset::{Asset, VariantStatus, VersionStatus};
use crate::model::automation::{
    Action, ApplyTagsConfig, AutoAtlasPackConfig, AutomationRun, EnqueueJobConfig,
    EnqueueLoraRendersConfig, ExportConfig, RunEvalGridConfig, SetStatusConfig,
};
use crate::model::eval::{EvalRecord, EvalStatus};
use crate::model::job::{JobType, NewJob};
use crate::model::spec::{AssetSpec, PromptPair, SpecStatus};
use crate::profiles;
use crate::store::Store;

/// Recorded on the step that ran the action.
pub type StepMeta = JsonMap;

const DEFAULT_RENDER_LIMIT: usize = 10;
const DEFAULT_TEMPLATE: &str = "txt2img";

/// Everything an action may touch.
pub struct ActionContext<'a> {
    pub store: &'a Store,
    pub jobs: &'a JobQueue,
    pub run: &'a AutomationRun,
}

impl ActionContext<'_> {
    fn project_id(&self) -> &str {
        &self.run.project_id
    }

    fn event(&self) -> Option<&JsonMap> {
        self.run.meta.get("event").and_then(Value::as_object)
    }

    fn event_str(&self, key: &str) -> Option<String> {
        self.run
            .event_payload()
            .and_then(|p| p.get(key))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    /// Carry the triggering event's cascade state into a job input so the
    /// events it produces stay on the same chain.
    fn stamp(&self, job: NewJob) -> NewJob {
        let Some(event) = self.event() else {
            return job;
        };
        let mut job = job;
        if let Some(chain) = event.get("causalChainId").and_then(Value::as_str) {
            job = job.with("causalChainId", chain);
        }
        if let Some(payload) = self.run.event_payload() {
            for key in ["causalDepth", "visitedRuleIds"] {
                if let Some(v) = payload.get(key) {
                    job = job.with(key, v.clone());
                }
            }
        }
        job
    }

    async fn enqueue(&self, job: NewJob) -> Result<String> {
        let job = self.jobs.create(self.project_id(), self.stamp(job)).await?;
        Ok(job.id.to_string())
    }

    async fn load_asset(&self, asset_id: &str) -> Result<Asset> {
        self.store
            .read(&self.store.record_path(self.project_id(), "assets", asset_id))
            .await?
            .ok_or_else(|| Error::Other("Asset not found".into()))
    }

    async fn save_asset(&self, asset: &Asset) -> Result<()> {
        self.store
            .write(
                &self.store.record_path(self.project_id(), "assets", &asset.id),
                asset,
            )
            .await
    }
}

fn fail(message: &str) -> Error {
    Error::Other(message.to_string())
}

fn meta(value: Value) -> StepMeta {
    match value {
        Value::Object(map) => map,
        _ => StepMeta::new(),
    }
}

impl Action {
    pub async fn execute(&self, ctx: &ActionContext<'_>) -> Result<StepMeta> {
        match self {
            Action::EnqueueJob(cfg) => enqueue_job(cfg, ctx).await,
            Action::Export(cfg) => export(cfg, ctx).await,
            Action::RunEvalGrid(cfg) => run_eval_grid(cfg, ctx).await,
            Action::EnqueueLoraRenders(cfg) => enqueue_lora_renders(cfg, ctx).await,
            Action::ApplyTags(cfg) => apply_tags(cfg, ctx).await,
            Action::SetStatus(cfg) => set_status(cfg, ctx).await,
            Action::AutoAtlasPack(cfg) => auto_atlas_pack(cfg, ctx).await,
        }
    }
}

async fn enqueue_job(cfg: &EnqueueJobConfig, ctx: &ActionContext<'_>) -> Result<StepMeta> {
    let job_type = cfg.job_type.ok_or_else(|| fail("Missing job type"))?;
    let job_id = ctx
        .enqueue(NewJob::new(job_type).input(Value::Object(cfg.input.clone())))
        .await?;
    Ok(meta(json!({ "jobId": job_id })))
}

async fn export(cfg: &ExportConfig, ctx: &ActionContext<'_>) -> Result<StepMeta> {
    let input = json!({
        "assetIds": cfg.asset_ids,
        "atlasIds": cfg.atlas_ids,
        "profileId": cfg.profile_id,
        "profileSnapshot": cfg.profile_snapshot,
        "animations": cfg.animations,
        "ui": cfg.ui,
    });
    let job_id = ctx.enqueue(NewJob::new(JobType::Export).input(input)).await?;
    Ok(meta(json!({ "jobId": job_id })))
}

async fn run_eval_grid(cfg: &RunEvalGridConfig, ctx: &ActionContext<'_>) -> Result<StepMeta> {
    let (Some(lora_id), Some(release_id)) = (cfg.lora_id.as_deref(), cfg.release_id.as_deref())
    else {
        return Err(fail("Missing loraId/releaseId"));
    };
    let project_id = ctx.project_id();
    let lora = find_lora(ctx.store, project_id, lora_id)
        .await?
        .ok_or_else(|| fail("LoRA not found"))?;
    if lora.release(release_id).is_none() {
        return Err(fail("Release not found"));
    }
    let prompts = cfg.prompts.as_ref().map(|p| p.to_vec()).unwrap_or_default();
    if prompts.is_empty() {
        return Err(fail("No prompts provided"));
    }

    let now = Utc::now();
    let eval = EvalRecord {
        id: cfg
            .eval_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string()),
        lora_id: lora_id.to_string(),
        release_id: release_id.to_string(),
        created_at: now,
        updated_at: now,
        status: EvalStatus::Running,
        prompts: prompts.clone(),
        outputs: Vec::new(),
        auto_cleanup: cfg.auto_cleanup,
    };
    ctx.store
        .write(&ctx.store.record_path(project_id, "evals", &eval.id), &eval)
        .await?;

    let checkpoint_id = cfg
        .checkpoint_id
        .clone()
        .filter(|c| !c.is_empty())
        .or_else(|| Some(lora.checkpoint_id.clone()).filter(|c| !c.is_empty()))
        .ok_or_else(|| fail("Missing checkpointId"))?;
    let asset_type = cfg
        .asset_type
        .clone()
        .or_else(|| lora.asset_types.first().cloned())
        .unwrap_or_else(|| "ui_icon".into());
    let template_id = cfg.template_id.as_deref().unwrap_or(DEFAULT_TEMPLATE);
    let project = profiles::load_project(ctx.store, project_id).await?;
    let derived = profiles::derive_checkpoint_profile(&project, &checkpoint_id);

    let mut generation_params = JsonMap::new();
    for (key, value) in [
        ("width", cfg.width),
        ("height", cfg.height),
        ("variants", cfg.variants),
    ] {
        if let Some(v) = value {
            generation_params.insert(key.into(), v.into());
        }
    }

    let mut job_ids = Vec::with_capacity(prompts.len());
    for (i, prompt) in prompts.iter().enumerate() {
        let spec = AssetSpec {
            id: eval.spec_id(i),
            project_id: project_id.to_string(),
            title: format!("Eval: {lora_id} ({})", i + 1),
            asset_type: asset_type.clone(),
            checkpoint_id: Some(checkpoint_id.clone()),
            checkpoint_profile_id: derived.as_ref().map(|(id, _)| id.clone()),
            checkpoint_profile_version: derived.as_ref().map(|(_, v)| *v),
            baseline_profile_id: None,
            lora_ids: Vec::new(),
            tags: Vec::new(),
            style: Some("default".into()),
            scenario: Some("default".into()),
            prompt: PromptPair::new(prompt.clone(), ""),
            generation_params: generation_params.clone(),
            output: None,
            prompt_policy: None,
            seed_policy: None,
            quality_contract: None,
            entity_link: None,
            status: SpecStatus::Ready,
            created_at: now,
            updated_at: now,
        };
        ctx.store
            .write(&ctx.store.record_path(project_id, "specs", &spec.id), &spec)
            .await?;

        let job = NewJob::new(JobType::Generate).input(json!({
            "specId": spec.id,
            "templateId": template_id,
            "checkpointName": checkpoint_id,
            "loras": [{ "loraId": lora_id, "releaseId": release_id }],
            "eval": { "evalId": eval.id, "prompt": prompt },
        }));
        job_ids.push(ctx.enqueue(job).await?);
    }

    info!(project_id, eval_id = %eval.id, jobs = job_ids.len(), "eval grid enqueued");
    Ok(meta(json!({ "evalId": eval.id, "jobs": job_ids.len() })))
}

async fn enqueue_lora_renders(
    cfg: &EnqueueLoraRendersConfig,
    ctx: &ActionContext<'_>,
) -> Result<StepMeta> {
    let lora_id = cfg
        .lora_id
        .clone()
        .or_else(|| ctx.event_str("loraId"))
        .ok_or_else(|| fail("Missing loraId"))?;
    let project_id = ctx.project_id();
    let lora = find_lora(ctx.store, project_id, &lora_id)
        .await?
        .ok_or_else(|| fail("LoRA not found"))?;
    let release_id = cfg
        .release_id
        .clone()
        .or_else(|| ctx.event_str("releaseId"))
        .or_else(|| lora.active_release_id.clone())
        .ok_or_else(|| fail("Missing releaseId"))?;
    if lora.release(&release_id).is_none() {
        return Err(fail("Release not found"));
    }

    let mut specs: Vec<AssetSpec> = ctx
        .store
        .list(&ctx.store.collection_dir(project_id, "specs"))
        .await?;
    specs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    let limit = cfg.limit.unwrap_or(DEFAULT_RENDER_LIMIT);
    let template_id = cfg.template_id.as_deref().unwrap_or(DEFAULT_TEMPLATE);
    let strength = cfg.strength.unwrap_or_else(|| lora.default_strength());

    let targets: Vec<&AssetSpec> = specs
        .iter()
        .filter(|s| s.status == SpecStatus::Ready && !s.id.starts_with("eval_"))
        .filter(|s| lora.is_compatible(s.checkpoint_id.as_deref().unwrap_or(""), &s.asset_type))
        .take(limit)
        .collect();

    let mut job_ids = Vec::with_capacity(targets.len());
    for spec in targets {
        let mut input = json!({
            "specId": spec.id,
            "templateId": template_id,
            "loras": [{
                "loraId": lora_id,
                "releaseId": release_id,
                "strengthModel": strength,
            }],
        });
        if let Some(ref checkpoint) = spec.checkpoint_id {
            input["checkpointName"] = Value::String(checkpoint.clone());
        }
        job_ids.push(ctx.enqueue(NewJob::new(JobType::Generate).input(input)).await?);
    }

    debug!(project_id, lora_id = %lora_id, release_id = %release_id, jobs = job_ids.len(), "lora renders enqueued");
    Ok(meta(json!({
        "loraId": lora_id,
        "releaseId": release_id,
        "jobIds": job_ids,
        "jobs": job_ids.len(),
    })))
}

async fn apply_tags(cfg: &ApplyTagsConfig, ctx: &ActionContext<'_>) -> Result<StepMeta> {
    let (Some(asset_id), Some(version_id), Some(variant_id)) = (
        cfg.asset_id.as_deref(),
        cfg.version_id.as_deref(),
        cfg.variant_id.as_deref(),
    ) else {
        return Err(fail("Missing assetId/versionId/variantId"));
    };
    let mut asset = ctx.load_asset(asset_id).await?;
    let variant = asset
        .version_mut(version_id)
        .ok_or_else(|| fail("Version not found"))?
        .variant_mut(variant_id)
        .ok_or_else(|| fail("Variant not found"))?;

    if let Some(ref set) = cfg.set {
        variant.tags = set.clone();
    }
    for tag in &cfg.add {
        if !variant.tags.contains(tag) {
            variant.tags.push(tag.clone());
        }
    }
    variant.tags.retain(|t| !cfg.remove.contains(t));
    let tag_count = variant.tags.len();

    asset.updated_at = Utc::now();
    ctx.save_asset(&asset).await?;
    Ok(meta(json!({ "tagCount": tag_count })))
}

async fn set_status(cfg: &SetStatusConfig, ctx: &ActionContext<'_>) -> Result<StepMeta> {
    let (Some(asset_id), Some(version_id), Some(status)) = (
        cfg.asset_id.as_deref(),
        cfg.version_id.as_deref(),
        cfg.status.as_deref(),
    ) else {
        return Err(fail("Missing assetId/versionId/status"));
    };
    let mut asset = ctx.load_asset(asset_id).await?;
    let version = asset
        .version_mut(version_id)
        .ok_or_else(|| fail("Version not found"))?;

    match cfg.variant_id.as_deref() {
        Some(variant_id) => {
            let parsed: VariantStatus = status.parse()?;
            version
                .variant_mut(variant_id)
                .ok_or_else(|| fail("Variant not found"))?
                .status = parsed;
        }
        None => version.status = status.parse::<VersionStatus>()?,
    }

    asset.updated_at = Utc::now();
    ctx.save_asset(&asset).await?;
    Ok(meta(json!({ "status": status })))
}

/// Enqueue `atlas_pack` once every frame of a multi-frame spec has an
/// approved version. Frames are matched by `generation.frameIndex`; a
/// single-frame asset counts as frame 0.
async fn auto_atlas_pack(cfg: &AutoAtlasPackConfig, ctx: &ActionContext<'_>) -> Result<StepMeta> {
    let spec_id = cfg
        .spec_id
        .clone()
        .or_else(|| ctx.event_str("specId"))
        .ok_or_else(|| fail("Missing specId"))?;
    let project_id = ctx.project_id();
    let spec: AssetSpec = ctx
        .store
        .read(&ctx.store.record_path(project_id, "specs", &spec_id))
        .await?
        .ok_or_else(|| fail("Spec not found"))?;

    let frame_count = spec.frame_count();
    if frame_count < 2 {
        return Ok(meta(json!({ "skipped": "single_frame", "specId": spec_id })));
    }

    let assets: Vec<Asset> = ctx
        .store
        .list(&ctx.store.collection_dir(project_id, "assets"))
        .await?;
    let mut frames: Vec<Option<String>> = vec![None; frame_count];
    for asset in assets.iter().filter(|a| a.spec_id == spec_id) {
        let Some(version) = asset.latest_approved() else {
            continue;
        };
        let index = version
            .generation
            .get("frameIndex")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;
        if let (Some(slot), Some(image)) = (frames.get_mut(index), version.primary_image()) {
            *slot = Some(image.to_string());
        }
    }

    let approved = frames.iter().filter(|f| f.is_some()).count();
    if approved < frame_count {
        debug!(project_id, spec_id = %spec_id, approved, frame_count, "atlas pack waiting on frames");
        return Ok(meta(json!({
            "skipped": "incomplete",
            "specId": spec_id,
            "approvedFrames": approved,
            "frameCount": frame_count,
        })));
    }

    let frame_paths: Vec<String> = frames.into_iter().flatten().collect();
    let frame_names = spec
        .output
        .as_ref()
        .and_then(|o| o.animation.as_ref())
        .map(|a| a.frame_names.clone())
        .unwrap_or_default();
    let mut input = json!({
        "specId": spec_id,
        "framePaths": frame_paths,
        "frameNames": frame_names,
    });
    if let Some(padding) = cfg.padding {
        input["padding"] = padding.into();
    }
    if let Some(max_size) = cfg.max_size {
        input["maxSize"] = max_size.into();
    }
    let job_id = ctx.enqueue(NewJob::new(JobType::AtlasPack).input(input)).await?;
    info!(project_id, spec_id = %spec_id, job_id = %job_id, "atlas pack enqueued");
    Ok(meta(json!({ "jobId": job_id, "specId": spec_id, "frameCount": frame_count })))
}
