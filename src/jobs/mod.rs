//! Job execution core.
//!
//! [`JobQueue`] owns every job status change. Records live at
//! `projects/<pid>/jobs/<id>.json`; each transition rewrites the whole
//! record and appends the matching event to the project's log.
//!
//! ```text
//! queued ──start──▶ running ──complete──▶ succeeded
//!   ▲                  │ └────fail─────▶ failed ──retry──┐
//!   ├──────retry──────-┘ (retryable, attempts left)      │
//!   ├──────sweep─────── (running too long)               │
//!   └────────────────────────── canceled ◀──cancel───────┘
//! ```

pub mod classify;
pub mod log;
pub mod retry;
pub mod template;

use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use opentelemetry::KeyValue;
use serde_json::{Value, json};
use tracing::{Span, info, warn};

use crate::error::{Error, Result};
use crate::events::EventLog;
use crate::lora::resolve_loras;
use crate::model::JsonMap;
use crate::model::event::{EventType, NewEvent};
use crate::model::job::{
    ErrorClass, EscalationTarget, Job, JobId, JobStatus, JobType, NewJob, RetryHistoryEntry,
};
use crate::model::spec::AssetSpec;
use crate::profiles;
use crate::store::Store;
use crate::telemetry::{job as job_span, metrics};

pub use classify::{Classify, classify_error};
pub use log::{JobLog, Level};
pub use retry::{compute_backoff_ms, compute_backoff_ms_with, effective_policy};
pub use template::{TemplateContext, expand_next_jobs, summarize_input};

const COLLECTION: &str = "jobs";

const STUCK_THRESHOLD_MINUTES: i64 = 15;

pub const STUCK_ERROR: &str = "Job exceeded running threshold; requeued by sweep";

/// Default age after which a running job is presumed orphaned.
pub fn stuck_threshold() -> Duration {
    Duration::minutes(STUCK_THRESHOLD_MINUTES)
}

/// Outcome of [`JobQueue::complete`].
#[derive(Debug)]
pub struct Completed {
    pub job: Job,
    /// Jobs enqueued from the finished job's `nextJobs`.
    pub follow_ons: Vec<Job>,
}

/// Trailing window for [`JobQueue::load`] throughput.
pub const THROUGHPUT_WINDOW_MINUTES: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueLoad {
    /// Queued plus running jobs.
    pub depth: u64,
    pub throughput_per_min: f64,
}

#[derive(Debug, Clone)]
pub struct JobQueue {
    store: Store,
    events: EventLog,
}

impl JobQueue {
    pub fn new(store: Store, events: EventLog) -> Self {
        Self { store, events }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    fn path(&self, project_id: &str, job_id: &JobId) -> PathBuf {
        self.store
            .record_path(project_id, COLLECTION, &job_id.to_string())
    }

    /// Execution log for a job, resolved against its project directory.
    pub fn log(&self, job: &Job) -> JobLog {
        let relative = job
            .log_path
            .clone()
            .unwrap_or_else(|| log_path_for(&job.id));
        JobLog::new(self.store.project_dir(&job.project_id).join(relative))
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn get(&self, project_id: &str, job_id: &JobId) -> Result<Option<Job>> {
        self.store.read(&self.path(project_id, job_id)).await
    }

    async fn require(&self, project_id: &str, job_id: &JobId) -> Result<Job> {
        self.get(project_id, job_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job {job_id}")))
    }

    /// Every job in the project, newest first.
    pub async fn list(&self, project_id: &str) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .store
            .list(&self.store.collection_dir(project_id, COLLECTION))
            .await?;
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    /// Queued jobs past their retry time, oldest first.
    pub async fn eligible(&self, project_id: &str, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .list(project_id)
            .await?
            .into_iter()
            .filter(|j| j.is_eligible(now))
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    /// Backlog and recent throughput, for queue-depth breaker checks.
    ///
    /// Throughput counts jobs that succeeded within the trailing
    /// [`THROUGHPUT_WINDOW_MINUTES`], floored at one per minute so an idle
    /// project still has a finite ratio.
    pub async fn load(&self, project_id: &str, now: DateTime<Utc>) -> Result<QueueLoad> {
        let jobs = self.list(project_id).await?;
        let depth = jobs
            .iter()
            .filter(|j| matches!(j.status, JobStatus::Queued | JobStatus::Running))
            .count() as u64;
        let since = now - Duration::minutes(THROUGHPUT_WINDOW_MINUTES);
        let finished = jobs
            .iter()
            .filter(|j| j.status == JobStatus::Succeeded && j.updated_at > since)
            .count();
        let throughput_per_min = (finished as f64 / THROUGHPUT_WINDOW_MINUTES as f64).max(1.0);
        Ok(QueueLoad {
            depth,
            throughput_per_min,
        })
    }

    // -----------------------------------------------------------------------
    // Create
    // -----------------------------------------------------------------------

    /// Persist a new job and emit `job_queued`.
    ///
    /// Generate jobs are checked for checkpoint/baseline compatibility and
    /// get their LoRAs resolved first. A job whose explicit LoRAs cannot
    /// be satisfied is written straight to `failed` and escalated.
    pub async fn create(&self, project_id: &str, new: NewJob) -> Result<Job> {
        let NewJob {
            job_type,
            mut input,
            max_attempts,
        } = new;

        let mut unsatisfied = Vec::new();
        if job_type == JobType::Generate {
            let project = profiles::load_project(&self.store, project_id).await?;
            if let Some(spec) = self.spec_for(project_id, &input).await? {
                let checkpoint = input
                    .get("checkpointName")
                    .and_then(Value::as_str)
                    .or(spec.checkpoint_id.as_deref());
                profiles::enforce_checkpoint_compatibility(
                    &self.store,
                    &project,
                    checkpoint,
                    spec.baseline_profile_id.as_deref(),
                )
                .await?;
                let resolution = resolve_loras(&self.store, &project, &spec, &input).await?;
                resolution.apply_to(&mut input)?;
                unsatisfied = resolution.unsatisfied;
            }
        }

        let now = Utc::now();
        let id = JobId::new();
        let mut job = Job {
            id,
            project_id: project_id.to_string(),
            job_type,
            status: JobStatus::Queued,
            created_at: now,
            updated_at: now,
            input,
            output: None,
            error: None,
            error_class: None,
            attempt: None,
            max_attempts,
            next_retry_at: None,
            retry_history: Vec::new(),
            escalated_at: None,
            escalation_target: None,
            log_path: Some(log_path_for(&id)),
        };

        if !unsatisfied.is_empty() {
            let message = format!(
                "Requested LoRAs could not be resolved: {}",
                unsatisfied.join(", ")
            );
            job.status = JobStatus::Failed;
            job.error = Some(message.clone());
            job.error_class = Some(ErrorClass::NonRetryable);
            job.escalated_at = Some(now);
            job.escalation_target = Some(EscalationTarget::ExceptionInbox);
            self.store.write(&self.path(project_id, &id), &job).await?;

            warn!(project_id, job_id = %id, loras = ?unsatisfied, "generate job failed at creation");
            self.log(&job)
                .error(&message, Some(json!({ "unsatisfiedLoraIds": unsatisfied })))
                .await;
            metrics::jobs_created().add(
                1,
                &[
                    KeyValue::new("job_type", job_type.as_str()),
                    KeyValue::new("result", "failed"),
                ],
            );
            self.emit(
                &job,
                EventType::JobFailed,
                json!({
                    "type": job_type.as_str(),
                    "error": message,
                    "errorClass": ErrorClass::NonRetryable,
                    "escalationTarget": EscalationTarget::ExceptionInbox,
                    "unsatisfiedLoraIds": unsatisfied,
                }),
            )
            .await?;
            return Ok(job);
        }

        self.store.write(&self.path(project_id, &id), &job).await?;
        info!(project_id, job_id = %id, job_type = %job_type, "job queued");
        self.log(&job).info("queued", None).await;
        metrics::jobs_created().add(
            1,
            &[
                KeyValue::new("job_type", job_type.as_str()),
                KeyValue::new("result", "queued"),
            ],
        );
        self.emit(
            &job,
            EventType::JobQueued,
            json!({
                "type": job_type.as_str(),
                "input": summarize_input(&job.input),
            }),
        )
        .await?;
        Ok(job)
    }

    async fn spec_for(&self, project_id: &str, input: &JsonMap) -> Result<Option<AssetSpec>> {
        let Some(spec_id) = input.get("specId").and_then(Value::as_str) else {
            return Ok(None);
        };
        self.store
            .read(&self.store.record_path(project_id, "specs", spec_id))
            .await
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// queued → running.
    pub async fn start(&self, project_id: &str, job_id: &JobId) -> Result<Job> {
        let mut job = self.require(project_id, job_id).await?;
        let from = job.status;
        job.transition(JobStatus::Running, Utc::now())?;
        job.next_retry_at = None;
        self.save_transition(&job, from).await?;
        self.log(&job)
            .info("running", Some(json!({ "attempt": job.attempt.unwrap_or(0) + 1 })))
            .await;
        self.emit(&job, EventType::JobRunning, json!({ "type": job.job_type.as_str() }))
            .await?;
        Ok(job)
    }

    /// Merge a progress patch into the output of a running job.
    pub async fn record_progress(
        &self,
        project_id: &str,
        job_id: &JobId,
        patch: JsonMap,
    ) -> Result<Job> {
        let mut job = self.require(project_id, job_id).await?;
        job.merge_output(patch.clone());
        job.updated_at = Utc::now();
        self.store.write(&self.path(project_id, job_id), &job).await?;
        self.emit(&job, EventType::JobProgress, Value::Object(patch))
            .await?;
        Ok(job)
    }

    /// running → succeeded, then enqueue `nextJobs`. A job canceled while
    /// running keeps its status and records the output, but nothing
    /// downstream of it is enqueued.
    pub async fn complete(
        &self,
        project_id: &str,
        job_id: &JobId,
        output: JsonMap,
    ) -> Result<Completed> {
        let mut job = self.require(project_id, job_id).await?;
        let now = Utc::now();
        job.merge_output(output);

        if job.status == JobStatus::Canceled {
            job.updated_at = now;
            self.store.write(&self.path(project_id, job_id), &job).await?;
            info!(project_id, job_id = %job_id, "job canceled while running; output kept");
            return Ok(Completed {
                job,
                follow_ons: Vec::new(),
            });
        }
        let from = job.status;
        job.transition(JobStatus::Succeeded, now)?;
        job.error = None;
        job.error_class = None;
        self.save_transition(&job, from).await?;
        metrics::job_duration_ms().record(
            (now - job.created_at).num_milliseconds() as f64,
            &[KeyValue::new("job_type", job.job_type.as_str())],
        );
        self.log(&job).info("succeeded", None).await;
        self.emit(
            &job,
            EventType::JobSucceeded,
            json!({
                "type": job.job_type.as_str(),
                "output": job.output.clone().map(|o| summarize_input(&o)),
            }),
        )
        .await?;

        let empty = JsonMap::new();
        let id = job.id.to_string();
        let ctx = TemplateContext {
            project_id,
            job_id: &id,
            input: &job.input,
            output: job.output.as_ref().unwrap_or(&empty),
        };
        let mut follow_ons = Vec::new();
        for next in expand_next_jobs(job.input.get("nextJobs"), &ctx) {
            let next = next.with("causalChainId", causal_chain(&job));
            follow_ons.push(self.create(project_id, next).await?);
        }
        if !follow_ons.is_empty() {
            self.log(&job)
                .info(
                    "enqueued follow-on jobs",
                    Some(json!({
                        "jobIds": follow_ons.iter().map(|j| j.id.to_string()).collect::<Vec<_>>()
                    })),
                )
                .await;
        }
        Ok(Completed { job, follow_ons })
    }

    /// Record a failed attempt: reschedule when the class is retryable and
    /// attempts remain, otherwise fail and escalate.
    pub async fn fail(&self, project_id: &str, job_id: &JobId, error: &Error) -> Result<Job> {
        self.fail_classified(project_id, job_id, &error.to_string(), error.classify())
            .await
    }

    pub async fn fail_classified(
        &self,
        project_id: &str,
        job_id: &JobId,
        message: &str,
        class: ErrorClass,
    ) -> Result<Job> {
        let mut job = self.require(project_id, job_id).await?;
        let now = Utc::now();

        if job.status == JobStatus::Canceled {
            job.error = Some(message.to_string());
            job.error_class = Some(class);
            job.updated_at = now;
            self.store.write(&self.path(project_id, job_id), &job).await?;
            return Ok(job);
        }

        let project = profiles::load_project(&self.store, project_id).await?;
        let mut policy = effective_policy(&project.policies, job.job_type);
        if let Some(max) = job.max_attempts {
            policy.max_attempts = max.max(1);
        }

        let attempt = job.attempt.unwrap_or(0) + 1;
        job.attempt = Some(attempt);
        job.error = Some(message.to_string());
        job.error_class = Some(class);
        let from = job.status;

        if policy.retry_on.contains(&class) && attempt < policy.max_attempts {
            let delay_ms = compute_backoff_ms(&policy, attempt);
            let next_retry_at = now + Duration::milliseconds(delay_ms as i64);
            job.transition(JobStatus::Queued, now)?;
            job.next_retry_at = Some(next_retry_at);
            job.retry_history.push(RetryHistoryEntry {
                attempt,
                at: now,
                error: message.to_string(),
                error_class: class,
                next_retry_at: Some(next_retry_at),
                delay_ms: Some(delay_ms),
            });
            self.save_transition(&job, from).await?;

            warn!(project_id, job_id = %job_id, attempt, delay_ms, error_class = %class, "job failed; retry scheduled");
            metrics::job_retries().add(
                1,
                &[
                    KeyValue::new("job_type", job.job_type.as_str()),
                    KeyValue::new("error_class", class.as_str()),
                ],
            );
            self.log(&job)
                .write(
                    Level::Warn,
                    "attempt failed; retry scheduled",
                    Some(json!({
                        "attempt": attempt,
                        "error": message,
                        "errorClass": class,
                        "delayMs": delay_ms,
                        "nextRetryAt": next_retry_at,
                    })),
                )
                .await;
            self.emit(
                &job,
                EventType::JobRetrying,
                json!({
                    "type": job.job_type.as_str(),
                    "attempt": attempt,
                    "maxAttempts": policy.max_attempts,
                    "errorClass": class,
                    "error": message,
                    "delayMs": delay_ms,
                    "nextRetryAt": next_retry_at,
                }),
            )
            .await?;
            return Ok(job);
        }

        let reason_code = if policy.retry_on.contains(&class) {
            "retries_exhausted".to_string()
        } else {
            format!("non_retryable:{class}")
        };
        job.transition(JobStatus::Failed, now)?;
        job.next_retry_at = None;
        job.escalated_at = Some(now);
        job.escalation_target = Some(policy.escalate_to);
        job.retry_history.push(RetryHistoryEntry {
            attempt,
            at: now,
            error: message.to_string(),
            error_class: class,
            next_retry_at: None,
            delay_ms: None,
        });
        self.save_transition(&job, from).await?;

        warn!(project_id, job_id = %job_id, attempt, reason = %reason_code, "job failed and escalated");
        metrics::job_escalations().add(
            1,
            &[
                KeyValue::new("job_type", job.job_type.as_str()),
                KeyValue::new("target", policy.escalate_to.as_str()),
            ],
        );
        metrics::job_duration_ms().record(
            (now - job.created_at).num_milliseconds() as f64,
            &[KeyValue::new("job_type", job.job_type.as_str())],
        );
        self.log(&job)
            .error(
                message,
                Some(json!({ "attempt": attempt, "errorClass": class, "reasonCode": reason_code })),
            )
            .await;
        self.emit(
            &job,
            EventType::JobFailed,
            json!({
                "type": job.job_type.as_str(),
                "attempt": attempt,
                "errorClass": class,
                "error": message,
            }),
        )
        .await?;
        self.emit(
            &job,
            EventType::JobEscalated,
            json!({
                "type": job.job_type.as_str(),
                "escalationTarget": policy.escalate_to,
                "reasonCode": reason_code,
                "attempt": attempt,
            }),
        )
        .await?;
        Ok(job)
    }

    /// Stop a queued or running job. Terminal jobs come back unchanged.
    pub async fn cancel(&self, project_id: &str, job_id: &JobId) -> Result<Job> {
        let mut job = self.require(project_id, job_id).await?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        let from = job.status;
        job.transition(JobStatus::Canceled, Utc::now())?;
        job.next_retry_at = None;
        self.save_transition(&job, from).await?;
        self.log(&job).info("canceled", None).await;
        self.emit(&job, EventType::JobCanceled, json!({ "type": job.job_type.as_str() }))
            .await?;
        Ok(job)
    }

    /// Operator retry of a failed or canceled job. Clears the error and
    /// escalation state; the retry history stays.
    pub async fn retry(&self, project_id: &str, job_id: &JobId) -> Result<Job> {
        let mut job = self.require(project_id, job_id).await?;
        if !matches!(job.status, JobStatus::Failed | JobStatus::Canceled) {
            return Ok(job);
        }
        let from = job.status;
        job.transition(JobStatus::Queued, Utc::now())?;
        job.error = None;
        job.error_class = None;
        job.output = None;
        job.attempt = None;
        job.next_retry_at = None;
        job.escalated_at = None;
        job.escalation_target = None;
        self.save_transition(&job, from).await?;
        self.log(&job).info("retried by operator", None).await;
        self.emit(
            &job,
            EventType::JobRetried,
            json!({ "type": job.job_type.as_str(), "from": from }),
        )
        .await?;
        Ok(job)
    }

    /// Requeue running jobs not updated within `threshold`.
    pub async fn sweep_stuck(&self, project_id: &str, threshold: Duration) -> Result<Vec<Job>> {
        let now = Utc::now();
        let cutoff = now - threshold;
        let mut requeued = Vec::new();
        for mut job in self.list(project_id).await? {
            if job.status != JobStatus::Running || job.updated_at >= cutoff {
                continue;
            }
            let stale_since = job.updated_at;
            job.transition(JobStatus::Queued, now)?;
            job.error = Some(STUCK_ERROR.to_string());
            job.error_class = Some(ErrorClass::Retryable);
            job.next_retry_at = None;
            job.retry_history.push(RetryHistoryEntry {
                attempt: job.attempt.unwrap_or(0),
                at: now,
                error: STUCK_ERROR.to_string(),
                error_class: ErrorClass::Retryable,
                next_retry_at: None,
                delay_ms: None,
            });
            self.save_transition(&job, JobStatus::Running).await?;

            warn!(project_id, job_id = %job.id, %stale_since, "requeued stuck job");
            self.log(&job).write(Level::Warn, STUCK_ERROR, None).await;
            self.emit(
                &job,
                EventType::JobRequeuedStuck,
                json!({
                    "type": job.job_type.as_str(),
                    "staleSince": stale_since,
                    "thresholdMs": threshold.num_milliseconds(),
                }),
            )
            .await?;
            requeued.push(job);
        }
        Ok(requeued)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn save_transition(&self, job: &Job, from: JobStatus) -> Result<()> {
        self.store
            .write(&self.path(&job.project_id, &job.id), job)
            .await?;
        job_span::record_state_transition(&Span::current(), from.as_str(), job.status.as_str());
        metrics::job_transitions().add(
            1,
            &[
                KeyValue::new("from", from.as_str()),
                KeyValue::new("to", job.status.as_str()),
            ],
        );
        Ok(())
    }

    async fn emit(&self, job: &Job, event_type: EventType, payload: Value) -> Result<()> {
        let mut payload = match payload {
            Value::Object(map) => map,
            _ => JsonMap::new(),
        };
        payload.insert("jobId".into(), Value::String(job.id.to_string()));
        payload.insert("status".into(), Value::String(job.status.to_string()));
        let key = format!(
            "job:{}:{}:{}",
            job.id,
            event_type,
            job.updated_at.timestamp_micros()
        );
        let new = NewEvent::new(event_type, "job", job.id.to_string())
            .payload(Value::Object(payload))
            .idempotency_key(key)
            .causal_chain(causal_chain(job));
        self.events.append(&job.project_id, new).await?;
        Ok(())
    }
}

/// `files/logs/jobs/<id>.jsonl`, relative to the project directory.
pub fn log_path_for(job_id: &JobId) -> String {
    format!("files/logs/jobs/{job_id}.jsonl")
}

/// Causal chain carried in the input by automation, else the job id.
pub fn causal_chain(job: &Job) -> String {
    job.input
        .get("causalChainId")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| job.id.to_string())
}
