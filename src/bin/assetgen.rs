//! assetgen CLI: operator interface to the asset pipeline data root.

use assetgen::Pipeline;
use assetgen::config::{Config, WorkerSettings};
use assetgen::events::clamp_route_limit;
use assetgen::model::job::{JobId, JobStatus, JobType, NewJob};
use assetgen::store::Store;
use assetgen::telemetry::{TelemetryConfig, init_telemetry};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "assetgen", about = "Asset generation pipeline manager")]
struct Cli {
    /// Data root (overrides ASSETGEN_DATA_ROOT)
    #[arg(long, global = true)]
    data_root: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker loop
    Serve {
        /// Worker TOML settings (overrides ASSETGEN_WORKER_CONFIG)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },
    /// Job operations
    Job {
        #[command(subcommand)]
        action: JobAction,
    },
    /// Event log operations
    Events {
        #[command(subcommand)]
        action: EventsAction,
    },
    /// Automation rules
    Rule {
        #[command(subcommand)]
        action: RuleAction,
    },
    /// Circuit breakers
    Breaker {
        #[command(subcommand)]
        action: BreakerAction,
    },
}

#[derive(Subcommand)]
enum JobAction {
    /// Queue a new job
    Create {
        project: String,
        /// generate | bg_remove | atlas_pack | export
        job_type: String,
        /// JSON input object
        #[arg(long)]
        input: Option<String>,
        #[arg(long)]
        max_attempts: Option<u32>,
    },
    /// List jobs, newest first
    List {
        project: String,
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show a job
    Show {
        project: String,
        /// Job ID (full UUID or prefix)
        id: String,
    },
    Cancel {
        project: String,
        id: String,
    },
    Retry {
        project: String,
        id: String,
    },
}

#[derive(Subcommand)]
enum EventsAction {
    /// Print events after a sequence number
    List {
        project: String,
        #[arg(long, default_value_t = 0)]
        since: u64,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Print the last sequence number
    Cursor { project: String },
    /// Follow the log as SSE frames until interrupted
    Tail {
        project: String,
        #[arg(long, default_value_t = 0)]
        since: u64,
        #[arg(long)]
        heartbeat_ms: Option<u64>,
    },
}

#[derive(Subcommand)]
enum RuleAction {
    List { project: String },
    /// Queue a manual run of a rule
    Trigger {
        project: String,
        rule_id: String,
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum BreakerAction {
    List { project: String },
    /// Force a breaker closed
    Reset { project: String, breaker_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, once } => cmd_serve(cli.data_root, config, once).await,
        Command::Job { action } => cmd_job(&open(cli.data_root)?, action).await,
        Command::Events { action } => cmd_events(&open(cli.data_root)?, action).await,
        Command::Rule { action } => cmd_rule(&open(cli.data_root)?, action).await,
        Command::Breaker { action } => cmd_breaker(&open(cli.data_root)?, action).await,
    }
}

/// Pipeline over `--data-root`, else `ASSETGEN_DATA_ROOT`.
fn open(flag: Option<PathBuf>) -> anyhow::Result<Pipeline> {
    Ok(Pipeline::new(Store::new(data_root(flag)?)))
}

fn data_root(flag: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match flag {
        Some(root) => Ok(root),
        None => Ok(Config::from_env()?.data_root),
    }
}

async fn cmd_serve(
    data_root: Option<PathBuf>,
    settings_path: Option<PathBuf>,
    once: bool,
) -> anyhow::Result<()> {
    let mut config = Config::from_env()?;
    if let Some(root) = data_root {
        config.data_root = root;
    }

    let guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "assetgen".to_string(),
        log_level: config.log_level.clone(),
    })?;
    tracing::info!(
        data_root = %config.data_root.display(),
        otlp = guard.is_exporting(),
        "assetgen worker starting"
    );

    let settings = WorkerSettings::load(settings_path.or(config.worker_config.clone()).as_deref())?;
    let pipeline = Pipeline::new(Store::new(config.data_root.clone()));
    let worker = pipeline.worker_from_config(&config, settings);

    if once {
        let report = worker.run_once().await?;
        println!(
            "projects: {}  skipped: {}  jobs: {} ok / {} failed  swept: {}  runs: {}",
            report.projects,
            report.skipped,
            report.jobs_run,
            report.jobs_failed,
            report.swept,
            report.runs_executed
        );
        return Ok(());
    }

    let ctrl = worker.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        ctrl.shutdown();
    });

    worker.run().await?;
    guard.force_flush();
    Ok(())
}

async fn cmd_job(pipeline: &Pipeline, action: JobAction) -> anyhow::Result<()> {
    match action {
        JobAction::Create {
            project,
            job_type,
            input,
            max_attempts,
        } => {
            let job_type: JobType = job_type.parse()?;
            let input: serde_json::Value = match input {
                Some(json) => serde_json::from_str(&json)?,
                None => serde_json::json!({}),
            };
            let mut new = NewJob::new(job_type).input(input);
            if let Some(n) = max_attempts {
                new = new.max_attempts(n);
            }
            let job = pipeline.jobs.create(&project, new).await?;
            println!("Created: {} (status: {})", job.id, job.status);
        }
        JobAction::List {
            project,
            status,
            limit,
        } => {
            let status_filter: Option<JobStatus> = match status {
                Some(s) => Some(s.parse()?),
                None => None,
            };
            let jobs: Vec<_> = pipeline
                .jobs
                .list(&project)
                .await?
                .into_iter()
                .filter(|j| status_filter.is_none_or(|s| j.status == s))
                .take(limit)
                .collect();

            if jobs.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }

            println!(
                "{:<8}  {:<10}  {:<12}  {:<7}  CREATED",
                "ID", "TYPE", "STATUS", "ATTEMPT"
            );
            println!("{}", "-".repeat(64));
            for job in &jobs {
                let id = job.id.to_string();
                println!(
                    "{:<8}  {:<10}  {:<12}  {:<7}  {}",
                    &id[..8],
                    job.job_type,
                    job.status,
                    job.attempt.map(|n| n.to_string()).unwrap_or("-".into()),
                    job.created_at.format("%Y-%m-%d %H:%M")
                );
            }
            println!("\n{} job(s)", jobs.len());
        }
        JobAction::Show { project, id } => {
            let id = resolve_job_id(pipeline, &project, &id).await?;
            let job = pipeline
                .jobs
                .get(&project, &id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("job {id} not found"))?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        JobAction::Cancel { project, id } => {
            let id = resolve_job_id(pipeline, &project, &id).await?;
            let job = pipeline.jobs.cancel(&project, &id).await?;
            println!("{}: {}", job.id, job.status);
        }
        JobAction::Retry { project, id } => {
            let id = resolve_job_id(pipeline, &project, &id).await?;
            let job = pipeline.jobs.retry(&project, &id).await?;
            println!("{}: {}", job.id, job.status);
        }
    }
    Ok(())
}

/// Accept a full id or a unique prefix.
async fn resolve_job_id(pipeline: &Pipeline, project: &str, id: &str) -> anyhow::Result<JobId> {
    if id.len() >= 36 {
        return Ok(id.parse()?);
    }
    let jobs = pipeline.jobs.list(project).await?;
    let matches: Vec<_> = jobs
        .iter()
        .filter(|job| job.id.to_string().starts_with(id))
        .collect();
    match matches.len() {
        0 => anyhow::bail!("no job matching prefix '{id}'"),
        1 => Ok(matches[0].id),
        n => anyhow::bail!("{n} jobs match prefix '{id}', be more specific"),
    }
}

async fn cmd_events(pipeline: &Pipeline, action: EventsAction) -> anyhow::Result<()> {
    match action {
        EventsAction::List {
            project,
            since,
            limit,
        } => {
            let events = pipeline
                .events
                .list(&project, since, clamp_route_limit(limit))
                .await?;
            for event in &events {
                println!("{}", serde_json::to_string(event)?);
            }
        }
        EventsAction::Cursor { project } => {
            let cursor = pipeline.events.cursor(&project).await?;
            println!("{}", cursor.last_seq);
        }
        EventsAction::Tail {
            project,
            since,
            heartbeat_ms,
        } => {
            let mut rx = pipeline.events.stream(&project, since, heartbeat_ms);
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    msg = rx.recv() => match msg {
                        Some(msg) => print!("{}", msg.to_sse()),
                        None => break,
                    },
                }
            }
        }
    }
    Ok(())
}

async fn cmd_rule(pipeline: &Pipeline, action: RuleAction) -> anyhow::Result<()> {
    match action {
        RuleAction::List { project } => {
            let rules = pipeline.automation.list_rules(&project).await?;
            if rules.is_empty() {
                println!("No rules found.");
                return Ok(());
            }
            for rule in &rules {
                println!(
                    "{:<36}  {:<7}  {:<24}  {}",
                    rule.id,
                    if rule.enabled { "on" } else { "off" },
                    serde_json::to_value(&rule.trigger.trigger_type)?
                        .as_str()
                        .unwrap_or("-"),
                    rule.name
                );
            }
        }
        RuleAction::Trigger {
            project,
            rule_id,
            dry_run,
        } => {
            let run = pipeline
                .automation
                .trigger_manual(&project, &rule_id, dry_run)
                .await?;
            println!("Queued run {} (status: {})", run.id, run.status);
        }
    }
    Ok(())
}

async fn cmd_breaker(pipeline: &Pipeline, action: BreakerAction) -> anyhow::Result<()> {
    match action {
        BreakerAction::List { project } => {
            for breaker in pipeline.breakers.list(&project).await? {
                println!(
                    "{:<36}  {:<12}  {:<10}  {}",
                    breaker.id,
                    breaker.breaker_type.as_str(),
                    breaker.state,
                    breaker.rule_id.as_deref().unwrap_or("-")
                );
            }
        }
        BreakerAction::Reset {
            project,
            breaker_id,
        } => {
            let breaker = pipeline.breakers.reset(&project, &breaker_id).await?;
            println!("{}: {}", breaker.id, breaker.state);
        }
    }
    Ok(())
}
