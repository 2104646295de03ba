//! Per-job JSONL execution log.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::error::Result;

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Serialize)]
struct Line<'a> {
    ts: DateTime<Utc>,
    level: Level,
    msg: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a Value>,
}

/// Appends `{ts, level, msg, data?}` lines to `files/logs/jobs/<id>.jsonl`.
#[derive(Debug, Clone)]
pub struct JobLog {
    path: PathBuf,
}

impl JobLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub async fn append(&self, level: Level, msg: &str, data: Option<&Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_vec(&Line {
            ts: Utc::now(),
            level,
            msg,
            data,
        })?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        Ok(())
    }

    /// Like [`JobLog::append`], but a failing log never fails the job.
    pub async fn write(&self, level: Level, msg: &str, data: Option<Value>) {
        if let Err(e) = self.append(level, msg, data.as_ref()).await {
            warn!(path = %self.path.display(), error = %e, "job log write failed");
        }
    }

    pub async fn info(&self, msg: &str, data: Option<Value>) {
        self.write(Level::Info, msg, data).await;
    }

    pub async fn error(&self, msg: &str, data: Option<Value>) {
        self.write(Level::Error, msg, data).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn lines_are_json_objects() {
        let dir = tempfile::tempdir().unwrap();
        let log = JobLog::new(dir.path().join("logs/j1.jsonl"));
        log.info("started", None).await;
        log.error("boom", Some(json!({"attempt": 1}))).await;

        let body = tokio::fs::read_to_string(log.path()).await.unwrap();
        let lines: Vec<Value> = body
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["level"], "info");
        assert!(lines[0].get("data").is_none());
        assert_eq!(lines[1]["data"]["attempt"], 1);
    }
}
