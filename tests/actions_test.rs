//! Rule actions executed through manual runs.

use assetgen::Pipeline;
use assetgen::automation::RuleDraft;
use assetgen::model::asset::{Asset, VariantStatus, VersionStatus};
use assetgen::model::automation::{AutomationRun, RunStatus};
use assetgen::model::eval::{EvalRecord, EvalStatus};
use assetgen::model::job::{Job, JobType};
use assetgen::model::lora::LoraRecord;
use assetgen::model::project::Project;
use assetgen::model::spec::AssetSpec;
use assetgen::specs::SpecDraft;
use chrono::Utc;
use serde_json::{Value, json};

struct Fixture {
    _dir: tempfile::TempDir,
    pipeline: Pipeline,
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::new(assetgen::store::Store::new(dir.path()));
    let project: Project = serde_json::from_value(json!({
        "id": "p1",
        "name": "Demo",
        "policies": {
            "checkpointProfiles": {
                "ckpt_a": {"profileId": "cp_a", "checkpointId": "ckpt_a"}
            }
        }
    }))
    .unwrap();
    let store = &pipeline.store;
    store
        .write(&store.project_dir("p1").join("project.json"), &project)
        .await
        .unwrap();
    let lora: LoraRecord = serde_json::from_value(json!({
        "id": "style",
        "name": "House style",
        "scope": "project",
        "checkpointId": "ckpt_a",
        "assetTypes": ["character"],
        "activeReleaseId": "r1",
        "releases": [{"id": "r1", "status": "approved", "weights": {"path": "loras\\style.safetensors"}}]
    }))
    .unwrap();
    store
        .write(&store.record_path("p1", "loras", "style"), &lora)
        .await
        .unwrap();
    Fixture {
        _dir: dir,
        pipeline,
    }
}

/// Create a manual rule with `actions`, trigger it, and execute the run.
async fn run_actions(pipeline: &Pipeline, actions: Value) -> AutomationRun {
    let draft: RuleDraft = serde_json::from_value(json!({
        "name": "manual",
        "trigger": {"type": "manual"},
        "actions": actions,
    }))
    .unwrap();
    let rule = pipeline.automation.create_rule("p1", draft).await.unwrap();
    let run = pipeline
        .automation
        .trigger_manual("p1", &rule.id, false)
        .await
        .unwrap();
    pipeline.automation.execute_run("p1", &run.id).await.unwrap()
}

async fn spec(pipeline: &Pipeline, draft: Value) -> AssetSpec {
    let draft: SpecDraft = serde_json::from_value(draft).unwrap();
    pipeline.create_spec("p1", draft).await.unwrap().0
}

async fn put_asset(pipeline: &Pipeline, id: &str, spec_id: &str, status: &str, generation: Value) {
    let asset: Asset = serde_json::from_value(json!({
        "id": id,
        "projectId": "p1",
        "specId": spec_id,
        "createdAt": Utc::now(),
        "updatedAt": Utc::now(),
        "versions": [{
            "id": "v1",
            "createdAt": Utc::now(),
            "status": status,
            "generation": generation,
            "variants": [
                {"id": "va", "originalPath": format!("files/{id}/va.png"), "status": "candidate"},
                {"id": "vb", "originalPath": format!("files/{id}/vb.png"), "tags": ["keep"], "status": "candidate"}
            ]
        }]
    }))
    .unwrap();
    let store = &pipeline.store;
    store
        .write(&store.record_path("p1", "assets", id), &asset)
        .await
        .unwrap();
}

async fn asset(pipeline: &Pipeline, id: &str) -> Asset {
    let store = &pipeline.store;
    store
        .read(&store.record_path("p1", "assets", id))
        .await
        .unwrap()
        .unwrap()
}

async fn jobs_of(pipeline: &Pipeline, job_type: JobType) -> Vec<Job> {
    let mut jobs: Vec<Job> = pipeline
        .jobs
        .list("p1")
        .await
        .unwrap()
        .into_iter()
        .filter(|j| j.job_type == job_type)
        .collect();
    jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    jobs
}

#[tokio::test]
async fn tags_and_status_update_the_asset() {
    let f = fixture().await;
    put_asset(&f.pipeline, "a1", "hero", "review", json!({})).await;

    let run = run_actions(
        &f.pipeline,
        json!([
            {"type": "apply_tags", "config": {
                "assetId": "a1", "versionId": "v1", "variantId": "va",
                "set": ["idle", "front"], "add": ["hero", "idle"], "remove": ["front"]
            }},
            {"type": "set_status", "config": {"assetId": "a1", "versionId": "v1", "variantId": "va", "status": "selected"}},
            {"type": "set_status", "config": {"assetId": "a1", "versionId": "v1", "status": "approved"}}
        ]),
    )
    .await;
    assert_eq!(run.status, RunStatus::Succeeded, "{:?}", run.error);
    assert_eq!(run.steps.len(), 3);
    assert_eq!(
        run.steps[0].meta.as_ref().and_then(|m| m.get("tagCount")),
        Some(&json!(2))
    );

    let stored = asset(&f.pipeline, "a1").await;
    let version = &stored.versions[0];
    assert_eq!(version.status, VersionStatus::Approved);
    assert_eq!(version.variants[0].tags, vec!["idle", "hero"]);
    assert_eq!(version.variants[0].status, VariantStatus::Selected);
    assert_eq!(version.variants[1].tags, vec!["keep"]);
    assert_eq!(version.variants[1].status, VariantStatus::Candidate);
}

#[tokio::test]
async fn missing_variant_fails_the_step() {
    let f = fixture().await;
    put_asset(&f.pipeline, "a1", "hero", "review", json!({})).await;

    let run = run_actions(
        &f.pipeline,
        json!([
            {"type": "apply_tags", "config": {"assetId": "a1", "versionId": "v1", "variantId": "nope", "add": ["x"]}},
            {"type": "set_status", "config": {"assetId": "a1", "versionId": "v1", "status": "approved"}}
        ]),
    )
    .await;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_deref(), Some("Variant not found"));
    assert_eq!(asset(&f.pipeline, "a1").await.versions[0].status, VersionStatus::Review);
}

#[tokio::test]
async fn atlas_pack_waits_for_every_frame() {
    let f = fixture().await;
    spec(
        &f.pipeline,
        json!({
            "id": "walk",
            "title": "Walk cycle",
            "assetType": "character",
            "output": {"kind": "animation", "animation": {"frameCount": 2, "frameNames": ["walk_0", "walk_1"]}}
        }),
    )
    .await;
    put_asset(&f.pipeline, "f1", "walk", "approved", json!({"frameIndex": 1})).await;
    put_asset(&f.pipeline, "f0", "walk", "review", json!({"frameIndex": 0})).await;

    let action = json!([{"type": "auto_atlas_pack", "config": {"specId": "walk", "padding": 4}}]);
    let run = run_actions(&f.pipeline, action.clone()).await;
    assert_eq!(run.status, RunStatus::Succeeded);
    let meta = run.steps[0].meta.clone().unwrap();
    assert_eq!(meta.get("skipped"), Some(&json!("incomplete")));
    assert_eq!(meta.get("approvedFrames"), Some(&json!(1)));
    assert!(jobs_of(&f.pipeline, JobType::AtlasPack).await.is_empty());

    put_asset(&f.pipeline, "f0", "walk", "approved", json!({"frameIndex": 0})).await;
    let run = run_actions(&f.pipeline, action).await;
    assert_eq!(run.status, RunStatus::Succeeded);
    let jobs = jobs_of(&f.pipeline, JobType::AtlasPack).await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(
        jobs[0].input.get("framePaths"),
        Some(&json!(["files/f0/va.png", "files/f1/va.png"]))
    );
    assert_eq!(jobs[0].input.get("frameNames"), Some(&json!(["walk_0", "walk_1"])));
    assert_eq!(jobs[0].input.get("padding"), Some(&json!(4)));
}

#[tokio::test]
async fn eval_grid_writes_specs_and_jobs() {
    let f = fixture().await;
    let run = run_actions(
        &f.pipeline,
        json!([{"type": "run_eval_grid", "config": {
            "loraId": "style", "releaseId": "r1", "evalId": "e1",
            "prompts": "knight | archer | ",
            "assetType": "character"
        }}]),
    )
    .await;
    assert_eq!(run.status, RunStatus::Succeeded, "{:?}", run.error);
    assert_eq!(
        run.steps[0].meta.as_ref().and_then(|m| m.get("jobs")),
        Some(&json!(2))
    );

    let store = &f.pipeline.store;
    let eval: EvalRecord = store
        .read(&store.record_path("p1", "evals", "e1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(eval.status, EvalStatus::Running);
    assert_eq!(eval.prompts, vec!["knight", "archer"]);

    let first: AssetSpec = store
        .read(&store.record_path("p1", "specs", "eval_e1_1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.prompt.positive, "knight");
    assert_eq!(first.checkpoint_id.as_deref(), Some("ckpt_a"));
    assert_eq!(first.checkpoint_profile_id.as_deref(), Some("cp_a"));

    let jobs = jobs_of(&f.pipeline, JobType::Generate).await;
    assert_eq!(jobs.len(), 2);
    let input = &jobs[0].input;
    assert_eq!(input.get("eval"), Some(&json!({"evalId": "e1", "prompt": "knight"})));
    assert_eq!(input["loras"][0]["loraName"], json!("loras/style.safetensors"));
}

#[tokio::test]
async fn eval_grid_rejects_unknown_release() {
    let f = fixture().await;
    let run = run_actions(
        &f.pipeline,
        json!([{"type": "run_eval_grid", "config": {"loraId": "style", "releaseId": "r9", "prompts": ["a"]}}]),
    )
    .await;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_deref(), Some("Release not found"));
}

#[tokio::test]
async fn lora_renders_target_compatible_ready_specs() {
    let f = fixture().await;
    for (id, asset_type) in [("hero", "character"), ("villain", "character"), ("crate", "prop")] {
        spec(
            &f.pipeline,
            json!({
                "id": id,
                "title": id,
                "assetType": asset_type,
                "checkpointId": "ckpt_a",
                "prompt": {"positive": id},
                "status": "ready"
            }),
        )
        .await;
    }
    spec(
        &f.pipeline,
        json!({"id": "sidekick", "title": "Sidekick", "assetType": "character", "checkpointId": "ckpt_a"}),
    )
    .await;

    let run = run_actions(
        &f.pipeline,
        json!([{"type": "enqueue_lora_renders", "config": {"loraId": "style", "limit": 5}}]),
    )
    .await;
    assert_eq!(run.status, RunStatus::Succeeded, "{:?}", run.error);
    let meta = run.steps[0].meta.clone().unwrap();
    assert_eq!(meta.get("releaseId"), Some(&json!("r1")));
    assert_eq!(meta.get("jobs"), Some(&json!(2)));

    let mut spec_ids: Vec<String> = jobs_of(&f.pipeline, JobType::Generate)
        .await
        .iter()
        .filter_map(|j| j.input.get("specId").and_then(Value::as_str).map(str::to_string))
        .collect();
    spec_ids.sort();
    assert_eq!(spec_ids, vec!["hero", "villain"]);
}

#[tokio::test]
async fn export_action_queues_export_job() {
    let f = fixture().await;
    let run = run_actions(
        &f.pipeline,
        json!([{"type": "export", "config": {"assetIds": ["a1", "a2"], "profileId": "web"}}]),
    )
    .await;
    assert_eq!(run.status, RunStatus::Succeeded);
    let jobs = jobs_of(&f.pipeline, JobType::Export).await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].input.get("assetIds"), Some(&json!(["a1", "a2"])));
    assert_eq!(jobs[0].input.get("profileId"), Some(&json!("web")));
}
