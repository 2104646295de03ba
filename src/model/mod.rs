//! Persisted domain records.
//!
//! Everything here is plain serde data stored as camelCase JSON. Behaviour
//! that only depends on a record's own fields (lifecycle transitions,
//! breaker state) lives next to the type; anything touching the store
//! lives in the service modules.

pub mod asset;
pub mod automation;
pub mod breaker;
pub mod eval;
pub mod event;
pub mod job;
pub mod lora;
pub mod profile;
pub mod project;
pub mod spec;

/// Free-form JSON object used for inputs, outputs and payloads.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

pub use asset::{Asset, AssetVersion, Variant, VariantStatus, VersionStatus};
pub use automation::{Action, AutomationRule, AutomationRun, RunStatus, RunStep, TriggerType};
pub use breaker::{BreakerConfig, BreakerState, BreakerType, CircuitBreaker, Verdict};
pub use eval::{EvalRecord, ImprovementRun};
pub use event::{Event, EventType, NewEvent};
pub use job::{ErrorClass, Job, JobId, JobStatus, JobType, NewJob, RetryPolicy};
pub use lora::{LoraRecord, ResolvedLora};
pub use profile::{BaselineProfile, Checkpoint, CheckpointProfile, RouteDecision};
pub use project::Project;
pub use spec::AssetSpec;
