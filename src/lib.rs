//! # assetgen
//!
//! File-backed pipeline manager for generated game assets.
//!
//! Provides an append-only per-project event log, a job queue with retry
//! and escalation, circuit breakers, event-driven automation rules, a
//! layered prompt compiler, variant validation and routing, and a polling
//! worker that drives a ComfyUI-style generation backend.

pub mod adapters;
pub mod automation;
pub mod backend;
pub mod breaker;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod improvement;
pub mod jobs;
pub mod lora;
pub mod model;
pub mod pipeline;
pub mod profiles;
pub mod prompt;
pub mod specs;
pub mod store;
pub mod telemetry;
pub mod validator;

pub use error::{Error, Result};
pub use pipeline::Pipeline;
