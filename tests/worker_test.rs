//! One worker cycle end to end against in-memory backend and adapters.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use assetgen::Pipeline;
use assetgen::adapters::{AtlasFrame, AtlasOptions, AtlasOutput, BgRemoveOptions, ImageAdapter};
use assetgen::backend::{GenerationBackend, ImageRef};
use assetgen::config::WorkerSettings;
use assetgen::engine::{CycleReport, Heartbeat, Outcome, Processor, ProcessorRegistry};
use assetgen::jobs::{JobLog, JobQueue};
use assetgen::model::asset::Asset;
use assetgen::model::event::{EventType, NewEvent};
use assetgen::model::job::{Job, JobStatus, JobType, NewJob};
use assetgen::model::project::Project;
use assetgen::specs::SpecDraft;
use assetgen::store::{Lease, Store};
use assetgen::{Error, Result};
use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use serde_json::{Value, json};
use tokio::sync::Mutex;

/// Completes every prompt immediately with two images.
#[derive(Default)]
struct FakeBackend {
    submitted: Mutex<Vec<Value>>,
    failing: bool,
    downloads: AtomicUsize,
}

#[async_trait]
impl GenerationBackend for FakeBackend {
    async fn submit(&self, workflow: &Value) -> Result<String> {
        if self.failing {
            return Err(Error::Backend {
                status: Some(503),
                message: "queue full".into(),
            });
        }
        self.submitted.lock().await.push(workflow.clone());
        Ok("prompt-1".into())
    }

    async fn history(&self, prompt_id: &str) -> Result<Value> {
        Ok(json!({
            prompt_id: {
                "status": {"completed": true},
                "outputs": {
                    "9": {"images": [
                        {"filename": "a.png", "subfolder": "", "type": "output"},
                        {"filename": "b.png", "subfolder": "", "type": "output"}
                    ]}
                }
            }
        }))
    }

    async fn download(&self, _image: &ImageRef) -> Result<Vec<u8>> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let mut img = RgbaImage::from_pixel(32, 32, Rgba([0, 0, 0, 0]));
        for x in 8..24 {
            for y in 8..24 {
                img.put_pixel(x, y, Rgba([40, 90, 200, 255]));
            }
        }
        let mut bytes = Vec::new();
        DynamicImage::ImageRgba8(img).write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
        Ok(bytes)
    }
}

struct NoAdapter;

#[async_trait]
impl ImageAdapter for NoAdapter {
    async fn remove_background(&self, _input: &Path, _opts: &BgRemoveOptions) -> Result<PathBuf> {
        Err(Error::Adapter("not configured".into()))
    }

    async fn pack_atlas(&self, _frames: &[AtlasFrame], _opts: &AtlasOptions) -> Result<AtlasOutput> {
        Err(Error::Adapter("not configured".into()))
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    pipeline: Pipeline,
    settings: WorkerSettings,
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::new(Store::new(dir.path().join("data")));

    let workflows = dir.path().join("workflows");
    tokio::fs::create_dir_all(&workflows).await.unwrap();
    let graph = json!({
        "1": {"class_type": "CheckpointLoaderSimple", "inputs": {"ckpt_name": ""}},
        "2": {"class_type": "CLIPTextEncode", "inputs": {"text": "", "clip": ["1", 1]}},
        "3": {"class_type": "CLIPTextEncode", "inputs": {"text": "", "clip": ["1", 1]}},
        "4": {"class_type": "KSampler", "inputs": {"seed": 0, "steps": 1}},
        "9": {"class_type": "SaveImage", "inputs": {"filename_prefix": ""}}
    });
    let bindings = json!({
        "checkpoint": {"node": "1", "input": "ckpt_name"},
        "positive": {"node": "2", "input": "text"},
        "negative": {"node": "3", "input": "text"},
        "seed": {"node": "4", "input": "seed"},
        "steps": {"node": "4", "input": "steps"},
        "filename_prefix": {"node": "9", "input": "filename_prefix"}
    });
    tokio::fs::write(workflows.join("txt2img.json"), graph.to_string())
        .await
        .unwrap();
    tokio::fs::write(workflows.join("txt2img.bindings.json"), bindings.to_string())
        .await
        .unwrap();

    let project: Project = serde_json::from_value(json!({
        "id": "p1",
        "name": "Demo",
        "policies": {
            "checkpointProfiles": {
                "ckpt_a": {"profileId": "cp_a", "checkpointId": "ckpt_a", "basePositive": "pixel art"}
            }
        }
    }))
    .unwrap();
    let store = &pipeline.store;
    store
        .write(&store.project_dir("p1").join("project.json"), &project)
        .await
        .unwrap();

    let draft: SpecDraft = serde_json::from_value(json!({
        "id": "hero",
        "title": "Hero",
        "assetType": "character",
        "checkpointId": "ckpt_a",
        "prompt": {"positive": "a hero", "negative": "blurry"},
        "seedPolicy": {"mode": "fixed", "baseSeed": 1234},
        "status": "ready"
    }))
    .unwrap();
    pipeline.create_spec("p1", draft).await.unwrap();

    let settings = WorkerSettings {
        workflows_dir: workflows,
        generate_poll_ms: 10,
        generate_timeout_ms: 2_000,
        ..WorkerSettings::default()
    };
    Fixture {
        _dir: dir,
        pipeline,
        settings,
    }
}

#[tokio::test]
async fn generate_job_writes_asset_version() {
    let f = fixture().await;
    let backend = Arc::new(FakeBackend::default());
    let registry = f
        .pipeline
        .registry(&f.settings, backend.clone(), Arc::new(NoAdapter));
    let worker = f.pipeline.worker(f.settings.clone(), registry);

    let job = f
        .pipeline
        .jobs
        .create("p1", NewJob::new(JobType::Generate).input(json!({"specId": "hero"})))
        .await
        .unwrap();

    let report = worker.run_once().await.unwrap();
    assert_eq!(
        report,
        CycleReport {
            projects: 1,
            jobs_run: 1,
            ..CycleReport::default()
        }
    );

    // The bound workflow reached the backend.
    let submitted = backend.submitted.lock().await;
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0]["1"]["inputs"]["ckpt_name"], json!("ckpt_a"));
    assert_eq!(submitted[0]["4"]["inputs"]["seed"], json!(1234));
    let positive = submitted[0]["2"]["inputs"]["text"].as_str().unwrap();
    assert!(positive.starts_with("pixel art"), "{positive}");
    assert!(positive.contains("a hero"));
    assert_eq!(backend.downloads.load(Ordering::SeqCst), 2);

    let job = f.pipeline.jobs.get("p1", &job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    let output = job.output.unwrap();
    let asset_id = output["assetId"].as_str().unwrap().to_string();

    let store = &f.pipeline.store;
    let asset: Asset = store
        .read(&store.record_path("p1", "assets", &asset_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(asset.spec_id, "hero");
    assert_eq!(asset.versions.len(), 1);
    let version = &asset.versions[0];
    assert_eq!(version.variants.len(), 2);
    assert_eq!(version.generation.get("seed"), Some(&json!(1234)));
    assert!(version.generation.contains_key("promptPackage"));
    assert!(version.generation.contains_key("validation"));
    for variant in &version.variants {
        assert!(store.resolve(&variant.original_path).exists());
    }

    let generated: Vec<_> = f
        .pipeline
        .events
        .list("p1", 0, 500)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == EventType::AssetGenerated)
        .collect();
    assert_eq!(generated.len(), 1);
    assert_eq!(generated[0].entity_id, asset_id);
    assert_eq!(generated[0].payload.get("specId"), Some(&json!("hero")));

    let heartbeat: Heartbeat = store
        .read(&store.runtime_dir().join("worker-heartbeat.json"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(heartbeat.pid, std::process::id());
}

#[tokio::test]
async fn backend_failure_schedules_retry() {
    let f = fixture().await;
    let backend = Arc::new(FakeBackend {
        failing: true,
        ..FakeBackend::default()
    });
    let registry = f.pipeline.registry(&f.settings, backend, Arc::new(NoAdapter));
    let worker = f.pipeline.worker(f.settings.clone(), registry);

    let job = f
        .pipeline
        .jobs
        .create("p1", NewJob::new(JobType::Generate).input(json!({"specId": "hero"})))
        .await
        .unwrap();

    let report = worker.run_once().await.unwrap();
    assert_eq!(report.jobs_failed, 1);

    let job = f.pipeline.jobs.get("p1", &job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempt, Some(1));
    assert!(job.next_retry_at.is_some());

    // Backoff keeps it out of the next cycle.
    let report = worker.run_once().await.unwrap();
    assert_eq!(report.jobs_run + report.jobs_failed, 0);
}

#[tokio::test]
async fn leased_project_is_skipped() {
    let f = fixture().await;
    let registry = f
        .pipeline
        .registry(&f.settings, Arc::new(FakeBackend::default()), Arc::new(NoAdapter));
    let worker = f.pipeline.worker(f.settings.clone(), registry);

    let lease_path = f
        .pipeline
        .store
        .runtime_dir()
        .join("worker-locks")
        .join("p1.json");
    let lease = Lease::try_acquire(lease_path, Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();

    let report = worker.run_once().await.unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(report.projects, 0);

    lease.release().await.unwrap();
    let report = worker.run_once().await.unwrap();
    assert_eq!(report.projects, 1);
}

/// Cancels its own job mid-run, then reports success with a domain event.
struct CancelsItself {
    jobs: JobQueue,
}

#[async_trait]
impl Processor for CancelsItself {
    async fn process(&self, job: &Job, _log: &JobLog) -> Result<Outcome> {
        self.jobs.cancel(&job.project_id, &job.id).await?;
        Ok(Outcome::new(json!({"exportPath": "out.zip"})).event(
            NewEvent::new(EventType::AssetApproved, "asset", "a1").payload(json!({"specId": "hero"})),
        ))
    }
}

/// Sleeps while tracking how many calls overlap.
#[derive(Default)]
struct Slow {
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl Processor for Slow {
    async fn process(&self, _job: &Job, _log: &JobLog) -> Result<Outcome> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(Outcome::default())
    }
}

#[tokio::test]
async fn canceled_mid_run_publishes_nothing() {
    let f = fixture().await;
    let registry = ProcessorRegistry::empty().register(
        JobType::Export,
        Arc::new(CancelsItself {
            jobs: f.pipeline.jobs.clone(),
        }),
    );
    let worker = f.pipeline.worker(f.settings.clone(), registry);

    let job = f
        .pipeline
        .jobs
        .create(
            "p1",
            NewJob::new(JobType::Export).input(json!({
                "nextJobs": [{"type": "export", "input": {"from": "$output.exportPath"}}]
            })),
        )
        .await
        .unwrap();

    worker.run_once().await.unwrap();

    let job = f.pipeline.jobs.get("p1", &job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Canceled);
    assert_eq!(job.output.unwrap().get("exportPath"), Some(&json!("out.zip")));
    assert_eq!(f.pipeline.jobs.list("p1").await.unwrap().len(), 1);

    let types: Vec<EventType> = f
        .pipeline
        .events
        .list("p1", 0, 500)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert!(!types.contains(&EventType::AssetApproved), "{types:?}");
    assert!(!types.contains(&EventType::JobSucceeded), "{types:?}");
    assert!(!types.contains(&EventType::AutomationRunQueued), "{types:?}");
}

#[tokio::test]
async fn project_concurrency_runs_jobs_together() {
    let f = fixture().await;
    let slow = Arc::new(Slow {
        delay: Duration::from_millis(150),
        ..Slow::default()
    });
    let registry = ProcessorRegistry::empty().register(JobType::Export, slow.clone());
    let settings = WorkerSettings {
        project_concurrency: 2,
        ..f.settings.clone()
    };
    let worker = f.pipeline.worker(settings, registry);

    for _ in 0..3 {
        f.pipeline
            .jobs
            .create("p1", NewJob::new(JobType::Export))
            .await
            .unwrap();
    }

    let report = worker.run_once().await.unwrap();
    assert_eq!(report.jobs_run, 2);
    assert_eq!(slow.peak.load(Ordering::SeqCst), 2);

    let report = worker.run_once().await.unwrap();
    assert_eq!(report.jobs_run, 1);
}

#[tokio::test]
async fn lease_is_renewed_while_jobs_run() {
    let f = fixture().await;
    let slow = Arc::new(Slow {
        delay: Duration::from_millis(400),
        ..Slow::default()
    });
    let registry = ProcessorRegistry::empty().register(JobType::Export, slow);
    let settings = WorkerSettings {
        lease_ttl_ms: 90,
        ..f.settings.clone()
    };
    let worker = f.pipeline.worker(settings, registry);
    f.pipeline
        .jobs
        .create("p1", NewJob::new(JobType::Export))
        .await
        .unwrap();

    let running = tokio::spawn(async move { worker.run_once().await });
    tokio::time::sleep(Duration::from_millis(250)).await;

    // Well past the original TTL, the lease is still live.
    let lease_path = f
        .pipeline
        .store
        .runtime_dir()
        .join("worker-locks")
        .join("p1.json");
    let stolen = Lease::try_acquire(&lease_path, Duration::from_secs(30))
        .await
        .unwrap();
    assert!(stolen.is_none());

    let report = running.await.unwrap().unwrap();
    assert_eq!(report.jobs_run, 1);
    assert!(!lease_path.exists());
}
