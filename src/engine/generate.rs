//! The `generate` processor: bind a workflow, render it on the backend,
//! store the variants as a new asset version, and score them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use super::processor::{Outcome, Processor, input_f64, input_str, new_version, push_version};
use super::workflow::Workflow;
use crate::backend::{GenerationBackend, extract_images, extract_progress};
use crate::error::{Error, Result};
use crate::jobs::{JobLog, JobQueue, Level, causal_chain};
use crate::model::JsonMap;
use crate::model::asset::{Asset, Variant, VariantStatus};
use crate::model::eval::{EvalOutput, EvalRecord, EvalStatus};
use crate::model::event::{EventType, NewEvent};
use crate::model::job::{Job, JobType, NewJob};
use crate::model::lora::ResolvedLora;
use crate::model::profile::{Checkpoint, RoutingPolicy};
use crate::model::spec::AssetSpec;
use crate::profiles;
use crate::prompt::{PromptContext, PromptPackage, compile_prompt_package, resolve_seed};
use crate::store::Store;
use crate::validator::{self, Sibling, VariantScan};

const DEFAULT_TEMPLATE: &str = "txt2img";

#[derive(Debug, Clone)]
pub struct GenerateSettings {
    pub workflows_dir: PathBuf,
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for GenerateSettings {
    fn default() -> Self {
        Self {
            workflows_dir: PathBuf::from("pipeline/comfyui/workflows"),
            poll_interval: Duration::from_millis(750),
            timeout: Duration::from_secs(600),
        }
    }
}

pub struct GenerateProcessor {
    store: Store,
    jobs: JobQueue,
    backend: Arc<dyn GenerationBackend>,
    settings: GenerateSettings,
}

/// Sampler parameters after input, spec and checkpoint defaults are merged.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub width: u64,
    pub height: u64,
    pub variants: u64,
    pub steps: u64,
    pub cfg: f64,
    pub sampler: String,
    pub scheduler: String,
    pub vae: Option<String>,
    pub clip_skip: Option<i64>,
}

impl GenerationParams {
    /// Job input first, then the spec's `generationParams`, then the
    /// checkpoint's `defaultGenerationParams`.
    pub fn resolve(input: &JsonMap, spec: &AssetSpec, checkpoint: Option<&Checkpoint>) -> Self {
        let empty = JsonMap::new();
        let sp = &spec.generation_params;
        let cp = checkpoint.map(|c| &c.default_generation_params).unwrap_or(&empty);
        let num = |v: Option<Value>| v.and_then(|v| v.as_f64().or_else(|| v.as_str()?.parse().ok()));
        let text = |v: Option<Value>| v.and_then(|v| v.as_str().map(str::to_string));
        let same = |key: &str| {
            field(input, &[key])
                .or_else(|| field(sp, &[key]))
                .or_else(|| field(cp, &[key]))
        };

        Self {
            width: num(field(input, &["width"])
                .or_else(|| field(sp, &["width", "w"]))
                .or_else(|| field(cp, &["width"])))
            .map(|n| n as u64)
            .unwrap_or(512),
            height: num(field(input, &["height"])
                .or_else(|| field(sp, &["height", "h"]))
                .or_else(|| field(cp, &["height"])))
            .map(|n| n as u64)
            .unwrap_or(512),
            variants: num(same("variants")).map(|n| n as u64).unwrap_or(4),
            steps: num(same("steps")).map(|n| n as u64).unwrap_or(20),
            cfg: num(same("cfg")).unwrap_or(7.0),
            sampler: text(field(input, &["sampler_name", "sampler"]).or_else(|| field(cp, &["sampler"])))
                .unwrap_or_else(|| "euler".into()),
            scheduler: text(field(input, &["scheduler"]).or_else(|| field(cp, &["scheduler"])))
                .unwrap_or_else(|| "normal".into()),
            vae: text(same("vae")),
            clip_skip: num(field(input, &["clip_skip", "clipSkip"])
                .or_else(|| field(sp, &["clip_skip", "clipSkip"]))
                .or_else(|| field(cp, &["clip_skip", "clipSkip"])))
            .filter(|n| n.is_finite())
            .map(|n| -(n.abs() as i64)),
        }
    }

    fn to_json(&self) -> Value {
        json!({
            "width": self.width,
            "height": self.height,
            "variants": self.variants,
            "steps": self.steps,
            "cfg": self.cfg,
            "sampler": self.sampler,
            "scheduler": self.scheduler,
            "vae": self.vae,
            "clipSkip": self.clip_skip,
        })
    }
}

/// First non-null, non-empty value under any of `keys`.
fn field(map: &JsonMap, keys: &[&str]) -> Option<Value> {
    keys.iter()
        .find_map(|k| map.get(*k).filter(|v| !v.is_null() && v.as_str() != Some("")))
        .cloned()
}

/// `input.loras` entries, accepting the older `weightPath`/`localPath`
/// spellings for the loader file name.
pub fn job_loras(input: &JsonMap) -> Vec<ResolvedLora> {
    let Some(entries) = input.get("loras").and_then(Value::as_array) else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(Value::as_object)
        .filter_map(|entry| {
            let name = ["loraName", "weightPath", "localPath", "loraId"]
                .iter()
                .find_map(|k| input_str(entry, k))?;
            let strength_model = input_f64(entry, "strengthModel")
                .or_else(|| input_f64(entry, "weight"))
                .unwrap_or(1.0);
            Some(ResolvedLora {
                lora_id: input_str(entry, "loraId").map(str::to_string),
                release_id: input_str(entry, "releaseId").map(str::to_string),
                lora_name: name.replace('\\', "/"),
                strength_model,
                strength_clip: input_f64(entry, "strengthClip").unwrap_or(strength_model),
            })
        })
        .collect()
}

/// Frame fields copied from the job input into the version provenance.
fn frame_fields(input: &JsonMap) -> JsonMap {
    let mut out = JsonMap::new();
    if let Some(id) = input_str(input, "sequenceId") {
        out.insert("sequenceId".into(), json!(id));
    }
    if let Some(index) = input
        .get("frameIndex")
        .or_else(|| input.get("frame"))
        .and_then(Value::as_u64)
    {
        out.insert("frameIndex".into(), json!(index));
    }
    if let Some(count) = input.get("frameCount").and_then(Value::as_u64) {
        out.insert("frameCount".into(), json!(count));
    }
    for key in ["frameName", "framePrompt"] {
        if let Some(v) = input_str(input, key) {
            out.insert(key.into(), json!(v));
        }
    }
    out
}

/// Bound workflow plus the provenance recorded with it.
struct Prepared {
    workflow: Value,
    template_id: Option<String>,
    checkpoint_name: Option<String>,
    seed: Option<u64>,
    params: Option<GenerationParams>,
    package: Option<PromptPackage>,
}

impl GenerateProcessor {
    pub fn new(
        store: Store,
        jobs: JobQueue,
        backend: Arc<dyn GenerationBackend>,
        settings: GenerateSettings,
    ) -> Self {
        Self {
            store,
            jobs,
            backend,
            settings,
        }
    }

    async fn prepare(&self, job: &Job, spec: &AssetSpec, loras: &[ResolvedLora], log: &JobLog) -> Result<Prepared> {
        if let Some(inline) = job.input.get("workflow").filter(|v| v.is_object()) {
            return Ok(Prepared {
                workflow: Workflow::inline(inline.clone())?.into_value(),
                template_id: None,
                checkpoint_name: input_str(&job.input, "checkpointName").map(str::to_string),
                seed: job.input.get("seed").and_then(Value::as_u64),
                params: None,
                package: None,
            });
        }

        let template_id = input_str(&job.input, "templateId")
            .or_else(|| input_str(&job.input, "template"))
            .unwrap_or(DEFAULT_TEMPLATE)
            .to_string();
        let mut workflow = Workflow::load(&self.settings.workflows_dir, &template_id).await?;

        let checkpoint_name = input_str(&job.input, "checkpointName")
            .map(str::to_string)
            .or_else(|| spec.checkpoint_id.clone())
            .ok_or_else(|| {
                Error::Other("generate job missing input.checkpointName (ComfyUI ckpt_name)".into())
            })?;
        let project = profiles::load_project(&self.store, &job.project_id).await?;
        let checkpoint = profiles::get_checkpoint(&self.store, &job.project_id, &checkpoint_name).await?;
        let checkpoint_profile = profiles::get_checkpoint_profile(&self.store, &project, spec).await?;
        let baseline = match spec.baseline_profile_id.as_deref() {
            Some(id) => profiles::get_baseline(&self.store, &job.project_id, id).await?,
            None => None,
        };

        let ctx = PromptContext {
            policies: &project.policies,
            checkpoint_profile: checkpoint_profile.as_ref(),
            baseline: baseline.as_ref(),
        };
        let fallback_positive = input_str(&job.input, "positive").unwrap_or(spec.prompt.positive.as_str());
        let fallback_negative = input_str(&job.input, "negative").unwrap_or(spec.prompt.negative.as_str());
        let package = compile_prompt_package(
            &ctx,
            spec,
            checkpoint.as_ref(),
            fallback_positive,
            fallback_negative,
        )?;

        let params = GenerationParams::resolve(&job.input, spec, checkpoint.as_ref());
        let seed = job
            .input
            .get("seed")
            .and_then(Value::as_u64)
            .unwrap_or_else(|| resolve_seed(spec, rand::random::<u64>() % 1_000_000_000));
        let filename_prefix = input_str(&job.input, "filenamePrefix")
            .map(str::to_string)
            .unwrap_or_else(|| format!("assetgen/{}/{}", job.project_id, spec.id));

        workflow.apply("checkpoint", checkpoint_name.as_str());
        if let Some(ref vae) = params.vae {
            workflow.apply("vae", vae.as_str());
            if let Some(node) = workflow.binding("vae").map(|b| b.node.clone()) {
                workflow.apply("vae_target", json!([node, 0]));
            }
        }
        if let Some(stop_at) = params.clip_skip {
            workflow.apply("clip_skip", stop_at);
        }
        if let Some(primary) = loras.first() {
            workflow.apply("lora_name", primary.lora_name.as_str());
            workflow.apply("lora_strength_model", primary.strength_model);
            workflow.apply("lora_strength_clip", primary.strength_clip);
            match workflow.chain_loras(loras) {
                Some(chain) => {
                    log.info(
                        "lora_chain_applied",
                        Some(json!({ "applied": chain.applied, "addedNodes": chain.added_nodes })),
                    )
                    .await;
                }
                None => {
                    warn!(job_id = %job.id, template_id = %template_id, "lora_name binding missing; LoRAs not applied");
                    log.write(
                        Level::Warn,
                        "lora_binding_missing",
                        Some(json!({
                            "templateId": template_id,
                            "reason": "bindings.lora_name is not defined",
                            "loras": loras,
                        })),
                    )
                    .await;
                }
            }
        }
        workflow.apply("positive", package.compiled.positive.as_str());
        workflow.apply("negative", package.compiled.negative.as_str());
        workflow.apply("width", params.width);
        workflow.apply("height", params.height);
        workflow.apply("batch_size", params.variants);
        workflow.apply("seed", seed);
        workflow.apply("steps", params.steps);
        workflow.apply("cfg", params.cfg);
        workflow.apply("sampler_name", params.sampler.as_str());
        workflow.apply("scheduler", params.scheduler.as_str());
        workflow.apply("filename_prefix", filename_prefix);

        Ok(Prepared {
            workflow: workflow.into_value(),
            template_id: Some(template_id),
            checkpoint_name: Some(checkpoint_name),
            seed: Some(seed),
            params: Some(params),
            package: Some(package),
        })
    }

    /// Poll history until images appear, recording progress whenever the
    /// percentage moves.
    async fn wait_for_images(&self, job: &Job, prompt_id: &str) -> Result<Vec<crate::backend::ImageRef>> {
        let timeout = job
            .input
            .get("timeoutMs")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
            .unwrap_or(self.settings.timeout);
        let start = Instant::now();
        let mut last_percent = None;
        loop {
            let history = self.backend.history(prompt_id).await?;
            if let Some(progress) = extract_progress(&history, prompt_id) {
                if last_percent != Some(progress.percent) {
                    let mut patch = JsonMap::new();
                    patch.insert("promptId".into(), json!(prompt_id));
                    patch.insert(
                        "progress".into(),
                        json!({ "value": progress.value, "max": progress.max, "percent": progress.percent }),
                    );
                    self.jobs.record_progress(&job.project_id, &job.id, patch).await?;
                    last_percent = Some(progress.percent);
                }
            }
            let images = extract_images(&history, prompt_id);
            if !images.is_empty() {
                return Ok(images);
            }
            if start.elapsed() >= timeout {
                return Err(Error::Timeout(format!(
                    "Timed out waiting for ComfyUI outputs (promptId={prompt_id})."
                )));
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    async fn siblings(&self, spec: &AssetSpec) -> Result<Vec<Sibling>> {
        let Some(entity) = spec.entity_link.as_ref().and_then(|l| l.entity_id.as_deref()) else {
            return Ok(Vec::new());
        };
        let specs: Vec<AssetSpec> = self
            .store
            .list(&self.store.collection_dir(&spec.project_id, "specs"))
            .await?;
        Ok(specs
            .into_iter()
            .filter(|s| s.id != spec.id)
            .filter(|s| s.entity_link.as_ref().and_then(|l| l.entity_id.as_deref()) == Some(entity))
            .map(|s| Sibling {
                spec_id: s.id,
                positive_prompt: s.prompt.positive,
            })
            .collect())
    }

    async fn scan(&self, variants: &[Variant]) -> Vec<VariantScan> {
        let mut scans = Vec::with_capacity(variants.len());
        for variant in variants {
            let id = variant.id.clone();
            let path = self.store.resolve(&variant.original_path);
            let scan = tokio::task::spawn_blocking(move || VariantScan::from_path(id, &path)).await;
            match scan {
                Ok(Ok(scan)) => scans.push(scan),
                Ok(Err(e)) => warn!(variant_id = %variant.id, error = %e, "variant scan failed"),
                Err(e) => warn!(variant_id = %variant.id, error = %e, "variant scan panicked"),
            }
        }
        scans
    }

    async fn queue_bg_removal(
        &self,
        job: &Job,
        asset_id: &str,
        version_id: &str,
        variants: &[Variant],
        log: &JobLog,
    ) -> Result<Vec<String>> {
        let mut queued = Vec::new();
        for variant in variants {
            let next = NewJob::new(JobType::BgRemove)
                .input(json!({
                    "originalPath": variant.original_path,
                    "assetId": asset_id,
                    "versionId": version_id,
                    "variantId": variant.id,
                }))
                .with("causalChainId", causal_chain(job));
            queued.push(self.jobs.create(&job.project_id, next).await?.id.to_string());
        }
        log.info("auto_bg_remove_queued", Some(json!({ "count": queued.len() })))
            .await;
        Ok(queued)
    }

    async fn update_eval(&self, job: &Job, output: EvalOutput) -> Result<()> {
        let Some(eval_id) = job
            .input
            .get("eval")
            .and_then(Value::as_object)
            .and_then(|e| input_str(e, "evalId"))
        else {
            return Ok(());
        };
        let path = self.store.record_path(&job.project_id, "evals", eval_id);
        let Some(mut eval) = self.store.read::<EvalRecord>(&path).await? else {
            warn!(eval_id, "eval record missing; output not recorded");
            return Ok(());
        };
        eval.outputs.push(output);
        eval.updated_at = chrono::Utc::now();
        if eval.is_complete() {
            eval.status = EvalStatus::Complete;
            if eval.auto_cleanup {
                let prefix = eval.spec_prefix();
                let specs: Vec<AssetSpec> = self
                    .store
                    .list(&self.store.collection_dir(&job.project_id, "specs"))
                    .await?;
                for spec in specs.iter().filter(|s| s.id.starts_with(&prefix)) {
                    self.store
                        .remove(&self.store.record_path(&job.project_id, "specs", &spec.id))
                        .await?;
                }
            }
        }
        self.store.write(&path, &eval).await
    }
}

#[async_trait]
impl Processor for GenerateProcessor {
    async fn process(&self, job: &Job, log: &JobLog) -> Result<Outcome> {
        let spec_id = input_str(&job.input, "specId")
            .ok_or_else(|| Error::Other("generate job missing input.specId".into()))?;
        let spec: AssetSpec = self
            .store
            .read(&self.store.record_path(&job.project_id, "specs", spec_id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("spec {spec_id}")))?;
        let loras = job_loras(&job.input);
        let prepared = self.prepare(job, &spec, &loras, log).await?;

        let asset_id = input_str(&job.input, "assetId")
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let version_id = Uuid::new_v4().to_string();

        log.info("backend_submit", Some(json!({ "templateId": prepared.template_id })))
            .await;
        let prompt_id = self.backend.submit(&prepared.workflow).await?;
        log.info("backend_submitted", Some(json!({ "promptId": prompt_id })))
            .await;
        let mut patch = JsonMap::new();
        patch.insert("promptId".into(), json!(prompt_id));
        self.jobs.record_progress(&job.project_id, &job.id, patch).await?;

        let images = self.wait_for_images(job, &prompt_id).await?;

        let originals_dir = self
            .store
            .project_dir(&job.project_id)
            .join("files/images")
            .join(&asset_id)
            .join("original");
        tokio::fs::create_dir_all(&originals_dir).await?;
        let mut variants = Vec::with_capacity(images.len());
        for image in &images {
            let variant_id = Uuid::new_v4().to_string();
            let bytes = self.backend.download(image).await?;
            let path = originals_dir.join(format!("{variant_id}.png"));
            tokio::fs::write(&path, bytes).await?;
            variants.push(Variant {
                id: variant_id,
                original_path: self.store.relativize(&path),
                alpha_path: None,
                tags: Vec::new(),
                rating: None,
                status: VariantStatus::Candidate,
            });
        }

        // Score the set.
        let scans = self.scan(&variants).await;
        let siblings = self.siblings(&spec).await?;
        let validation = validator::validate(&spec, &scans, &siblings);
        let project = profiles::load_project(&self.store, &job.project_id).await?;
        let routing = match spec.baseline_profile_id.as_deref() {
            Some(id) => profiles::get_baseline(&self.store, &job.project_id, id)
                .await?
                .map(|b| b.routing_policy)
                .unwrap_or_default(),
            None => RoutingPolicy::default(),
        };
        let route = validator::decide_route(
            validation.status,
            &routing,
            project.policies.manual_review_enabled(),
        );

        let mut generation = JsonMap::new();
        generation.insert("promptId".into(), json!(prompt_id));
        generation.insert("templateId".into(), json!(prepared.template_id));
        generation.insert("checkpointName".into(), json!(prepared.checkpoint_name));
        generation.insert("seed".into(), json!(prepared.seed));
        if let Some(ref params) = prepared.params {
            generation.insert("params".into(), params.to_json());
        }
        if let Some(ref package) = prepared.package {
            generation.insert("promptPackage".into(), serde_json::to_value(package)?);
        }
        generation.insert(
            "spec".into(),
            json!({ "id": spec.id, "title": spec.title, "assetType": spec.asset_type }),
        );
        generation.insert("loras".into(), serde_json::to_value(&loras)?);
        if let Some(selection) = job.input.get("loraSelection").filter(|v| v.is_object()) {
            generation.insert("loraSelection".into(), selection.clone());
        }
        generation.extend(frame_fields(&job.input));
        let mut validation_json = serde_json::to_value(&validation)?;
        if let Some(obj) = validation_json.as_object_mut() {
            obj.insert("route".into(), json!(route));
        }
        generation.insert("validation".into(), validation_json);

        let variant_ids: Vec<String> = variants.iter().map(|v| v.id.clone()).collect();
        let existing: Option<Asset> = self
            .store
            .read(&self.store.record_path(&job.project_id, "assets", &asset_id))
            .await?;
        let asset = push_version(
            existing,
            &job.project_id,
            &spec.id,
            &asset_id,
            new_version(version_id.clone(), generation, variants.clone()),
        );
        self.store
            .write(
                &self.store.record_path(&job.project_id, "assets", &asset_id),
                &asset,
            )
            .await?;
        info!(
            project_id = %job.project_id,
            job_id = %job.id,
            asset_id = %asset_id,
            variants = variant_ids.len(),
            score = validation.score,
            route = %route,
            "asset version written"
        );

        let auto_bg_remove = spec
            .generation_params
            .get("autoBgRemove")
            .and_then(Value::as_bool)
            .unwrap_or_else(|| spec.wants_transparent_background());
        let bg_jobs = if auto_bg_remove {
            self.queue_bg_removal(job, &asset_id, &version_id, &variants, log)
                .await?
        } else {
            Vec::new()
        };

        if let Some(prompt) = job
            .input
            .get("eval")
            .and_then(|e| e.get("prompt"))
            .and_then(Value::as_str)
        {
            self.update_eval(
                job,
                EvalOutput {
                    prompt: prompt.to_string(),
                    images: variants.iter().map(|v| v.original_path.clone()).collect(),
                    asset_id: asset_id.clone(),
                    asset_version_id: version_id.clone(),
                },
            )
            .await?;
        }

        let event = NewEvent::new(EventType::AssetGenerated, "asset", asset_id.clone())
            .payload(json!({
                "assetId": asset_id,
                "assetVersionId": version_id,
                "specId": spec.id,
                "assetType": spec.asset_type,
                "variantIds": variant_ids,
                "validatorStatus": validation.status,
                "validatorScore": validation.score,
                "route": route,
            }))
            .idempotency_key(format!("asset:{asset_id}:{version_id}:asset_generated"));

        let mut output = json!({
            "promptId": prompt_id,
            "assetId": asset_id,
            "assetVersionId": version_id,
            "variantIds": variant_ids,
            "originalsDir": self.store.relativize(&originals_dir),
        });
        if !bg_jobs.is_empty() {
            output["bgRemoveJobIds"] = json!(bg_jobs);
        }
        Ok(Outcome::new(output).event(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn spec(params: Value) -> AssetSpec {
        serde_json::from_value(json!({
            "id": "s1",
            "projectId": "p1",
            "title": "Ship",
            "assetType": "sprite",
            "generationParams": params,
            "createdAt": Utc::now(),
            "updatedAt": Utc::now(),
        }))
        .unwrap()
    }

    #[test]
    fn params_merge_input_spec_checkpoint() {
        let input = json!({"width": 768, "sampler": "dpmpp_2m"}).as_object().cloned().unwrap();
        let checkpoint = Checkpoint {
            id: "ckpt".into(),
            default_generation_params: json!({"steps": 30, "height": 1024, "clipSkip": 2})
                .as_object()
                .cloned()
                .unwrap(),
            ..Default::default()
        };
        let p = GenerationParams::resolve(&input, &spec(json!({"h": 640})), Some(&checkpoint));
        assert_eq!((p.width, p.height, p.steps, p.variants), (768, 640, 30, 4));
        assert_eq!(p.sampler, "dpmpp_2m");
        assert_eq!(p.scheduler, "normal");
        assert_eq!(p.clip_skip, Some(-2));
        assert_eq!(p.vae, None);
    }

    #[test]
    fn loras_accept_legacy_names() {
        let input = json!({"loras": [
            {"loraId": "l1", "loraName": "a\\b.safetensors", "weight": 0.5},
            {"weightPath": "c.safetensors", "strengthClip": 0.3},
            {"strengthModel": 1.0}
        ]})
        .as_object()
        .cloned()
        .unwrap();
        let loras = job_loras(&input);
        assert_eq!(loras.len(), 2);
        assert_eq!(loras[0].lora_name, "a/b.safetensors");
        assert_eq!((loras[0].strength_model, loras[0].strength_clip), (0.5, 0.5));
        assert_eq!((loras[1].strength_model, loras[1].strength_clip), (1.0, 0.3));
    }

    #[test]
    fn frame_fields_accept_frame_alias() {
        let input = json!({"frame": 2, "frameCount": 4, "frameName": "walk_2", "sequenceId": ""})
            .as_object()
            .cloned()
            .unwrap();
        let fields = frame_fields(&input);
        assert_eq!(fields.get("frameIndex"), Some(&json!(2)));
        assert_eq!(fields.get("frameCount"), Some(&json!(4)));
        assert!(!fields.contains_key("sequenceId"));
    }
}
