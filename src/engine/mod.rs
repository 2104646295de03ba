//! Worker engine: the polling control plane and the per-job-type processors.

pub mod control;
pub mod generate;
pub mod processor;
pub mod workflow;

pub use control::{ControlPlane, CycleReport, Heartbeat};
pub use generate::{GenerateProcessor, GenerateSettings};
pub use processor::{
    AtlasPackProcessor, BgRemoveProcessor, ExportProcessor, Outcome, Processor, ProcessorRegistry,
};
pub use workflow::{Binding, Workflow};
