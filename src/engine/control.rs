//! Control plane: polls projects, runs eligible jobs through their
//! processors, and drains queued automation runs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinSet;
use tracing::{Instrument, error, info, warn};

use super::processor::{Outcome, ProcessorRegistry};
use crate::automation::AutomationEngine;
use crate::config::WorkerSettings;
use crate::error::{Error, Result};
use crate::events::EventLog;
use crate::jobs::{JobQueue, causal_chain};
use crate::model::job::{Job, JobStatus};
use crate::store::{Lease, Store, write_json_atomic};
use crate::telemetry::job::{record_state_transition, start_job_span};

/// Liveness record at `runtime/worker-heartbeat.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub ts: DateTime<Utc>,
    pub pid: u32,
    pub poll_interval_ms: u64,
}

/// Counts from one pass over all projects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub projects: usize,
    pub skipped: usize,
    pub jobs_run: usize,
    pub jobs_failed: usize,
    pub swept: usize,
    pub runs_executed: usize,
}

/// The worker loop.
#[derive(Clone)]
pub struct ControlPlane {
    store: Store,
    events: EventLog,
    jobs: JobQueue,
    automation: AutomationEngine,
    registry: ProcessorRegistry,
    settings: WorkerSettings,
    shutdown: Arc<Notify>,
    last_heartbeat: Arc<Mutex<Option<tokio::time::Instant>>>,
}

impl ControlPlane {
    pub fn new(
        store: Store,
        events: EventLog,
        jobs: JobQueue,
        automation: AutomationEngine,
        registry: ProcessorRegistry,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            events,
            jobs,
            automation,
            registry,
            settings,
            shutdown: Arc::new(Notify::new()),
            last_heartbeat: Arc::new(Mutex::new(None)),
        }
    }

    /// Signal the loop to stop after the current cycle.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run cycles until shutdown.
    pub async fn run(&self) -> Result<()> {
        info!(
            poll_interval_ms = self.settings.poll_interval_ms,
            project_concurrency = self.settings.project_concurrency,
            "worker started"
        );
        loop {
            if let Err(e) = self.run_once().await {
                error!("worker cycle error: {e}");
            }
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("worker shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.settings.poll_interval()) => {}
            }
        }
    }

    /// One pass: heartbeat, then every project under its lease.
    pub async fn run_once(&self) -> Result<CycleReport> {
        if let Err(e) = self.heartbeat().await {
            warn!("heartbeat write failed: {e}");
        }
        let mut report = CycleReport::default();
        for project_id in self.store.list_project_ids().await? {
            let lease_path = self
                .store
                .runtime_dir()
                .join("worker-locks")
                .join(format!("{project_id}.json"));
            let ttl = self.settings.lease_ttl();
            let Some(mut lease) = Lease::try_acquire(lease_path, ttl).await? else {
                report.skipped += 1;
                continue;
            };
            report.projects += 1;

            let result = {
                let work = self.run_project(&project_id, &mut report);
                tokio::pin!(work);
                let mut renew = tokio::time::interval(self.settings.lease_renew_interval());
                renew.tick().await;
                loop {
                    tokio::select! {
                        result = &mut work => break result,
                        _ = renew.tick() => {
                            if let Err(e) = lease.renew(ttl).await {
                                warn!(project_id = %project_id, "lease renew failed: {e}");
                            }
                        }
                    }
                }
            };
            if let Err(e) = result {
                error!(project_id = %project_id, "project cycle error: {e}");
            }
            if let Err(e) = lease.release().await {
                warn!(project_id = %project_id, "lease release failed: {e}");
            }
        }
        Ok(report)
    }

    async fn heartbeat(&self) -> Result<()> {
        let mut last = self.last_heartbeat.lock().await;
        if last.is_some_and(|t| t.elapsed() < self.settings.heartbeat_interval()) {
            return Ok(());
        }
        let beat = Heartbeat {
            ts: Utc::now(),
            pid: std::process::id(),
            poll_interval_ms: self.settings.poll_interval_ms,
        };
        write_json_atomic(&self.store.runtime_dir().join("worker-heartbeat.json"), &beat).await?;
        *last = Some(tokio::time::Instant::now());
        Ok(())
    }

    async fn run_project(&self, project_id: &str, report: &mut CycleReport) -> Result<()> {
        let swept = self
            .jobs
            .sweep_stuck(project_id, self.settings.stuck_threshold())
            .await?;
        if !swept.is_empty() {
            warn!(project_id, count = swept.len(), "requeued stuck jobs");
        }
        report.swept += swept.len();

        let eligible = self.jobs.eligible(project_id, Utc::now()).await?;
        let mut batch = JoinSet::new();
        for job in eligible.into_iter().take(self.settings.project_concurrency.max(1)) {
            let plane = self.clone();
            batch.spawn(async move { plane.execute_job(job).await });
        }
        while let Some(joined) = batch.join_next().await {
            match joined {
                Ok(Ok(true)) => report.jobs_run += 1,
                Ok(Ok(false)) => report.jobs_failed += 1,
                Ok(Err(e)) => error!(project_id, "job execution error: {e}"),
                Err(e) => error!(project_id, "job task failed: {e}"),
            }
        }

        for run in self.automation.queued_runs(project_id).await? {
            match self.automation.execute_run(project_id, &run.id).await {
                Ok(_) => report.runs_executed += 1,
                Err(e) => error!(project_id, run_id = %run.id, "automation run error: {e}"),
            }
        }
        Ok(())
    }

    /// Start, process, and settle one job. `Ok(false)` when the processor
    /// failed and the failure was recorded.
    async fn execute_job(&self, job: Job) -> Result<bool> {
        let span = start_job_span(&job.project_id, job.job_type, &job.id);
        async {
            let job = self.jobs.start(&job.project_id, &job.id).await?;
            record_state_transition(&span, "queued", "running");
            let log = self.jobs.log(&job);

            let result = match self.registry.get(job.job_type) {
                Some(processor) => processor.process(&job, &log).await,
                None => Err(Error::Other(format!(
                    "no processor registered for job type {}",
                    job.job_type
                ))),
            };

            match result {
                Ok(outcome) => {
                    let status = self.settle(&job, outcome).await?;
                    record_state_transition(&span, "running", &status.to_string());
                    Ok(true)
                }
                Err(e) => {
                    log.error("processor failed", Some(serde_json::json!({ "error": e.to_string() })))
                        .await;
                    let failed = self.jobs.fail(&job.project_id, &job.id, &e).await?;
                    record_state_transition(&span, "running", &failed.status.to_string());
                    warn!(job_id = %job.id, status = %failed.status, "job failed: {e}");
                    Ok(false)
                }
            }
        }
        .instrument(span.clone())
        .await
    }

    /// Record the output, then append the processor's domain events and
    /// hand each one to automation. A job canceled mid-run publishes nothing.
    async fn settle(&self, job: &Job, outcome: Outcome) -> Result<JobStatus> {
        let Outcome { output, events } = outcome;
        let completed = self.jobs.complete(&job.project_id, &job.id, output).await?;
        if completed.job.status == JobStatus::Canceled {
            info!(job_id = %job.id, dropped = events.len(), "canceled job settled without events");
            return Ok(JobStatus::Canceled);
        }
        for mut new in events {
            if new.causal_chain_id.is_none() {
                new.causal_chain_id = Some(causal_chain(job));
            }
            for key in ["causalDepth", "visitedRuleIds"] {
                if let Some(v) = job.input.get(key).filter(|v| !v.is_null()) {
                    new.payload.entry(key).or_insert_with(|| v.clone());
                }
            }
            let event = self.events.append(&job.project_id, new).await?;
            let runs = self.automation.trigger_event(&event).await?;
            if !runs.is_empty() {
                info!(
                    event_type = %event.event_type,
                    runs = runs.len(),
                    "automation runs created"
                );
            }
        }
        Ok(completed.job.status)
    }
}
