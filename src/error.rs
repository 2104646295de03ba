//! Error types for assetgen.

use std::path::PathBuf;

use thiserror::Error;

use crate::model::job::JobStatus;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid job transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    /// A record failed its schema check before being persisted.
    #[error("schema validation failed for {schema}: {message}")]
    Schema {
        schema: &'static str,
        message: String,
    },

    #[error("{0}")]
    Compatibility(String),

    /// A promotion or state change refused by a quality gate.
    #[error("{0}")]
    Gate(String),

    #[error("could not acquire lock {} after {attempts} attempts", path.display())]
    LockTimeout { path: PathBuf, attempts: u32 },

    #[error("generation backend error{}: {message}", status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Backend { status: Option<u16>, message: String },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("adapter failed: {0}")]
    Adapter(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// A short machine code in the style of OS error names, used by
    /// error classification.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Error::LockTimeout { .. } => Some("ELOCKED"),
            Error::Timeout(_) => Some("ETIMEDOUT"),
            Error::Io(e) => io_code(e.kind()),
            Error::Http(e) if e.is_timeout() => Some("ETIMEDOUT"),
            Error::Http(e) if e.is_connect() => Some("ECONNREFUSED"),
            _ => None,
        }
    }

    /// HTTP status carried by the error, if any.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Error::Backend { status, .. } => *status,
            Error::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

fn io_code(kind: std::io::ErrorKind) -> Option<&'static str> {
    use std::io::ErrorKind::*;
    match kind {
        PermissionDenied => Some("EACCES"),
        TimedOut => Some("ETIMEDOUT"),
        ConnectionRefused => Some("ECONNREFUSED"),
        ConnectionReset | ConnectionAborted => Some("ECONNRESET"),
        WouldBlock | ResourceBusy => Some("EBUSY"),
        NotFound => Some("ENOENT"),
        _ => None,
    }
}

pub type Result<T> = std::result::Result<T, Error>;
