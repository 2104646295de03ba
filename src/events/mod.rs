//! Per-project append-only event log.
//!
//! ```text
//! projects/<pid>/events/events.jsonl           one Event per line
//! projects/<pid>/events/seq.json               {projectId, lastSeq, updatedAt}
//! projects/<pid>/events/idempotency-index.json {projectId, updatedAt, items[]}
//! projects/<pid>/events/writer.lock            exclusive-create writer lock
//! ```
//!
//! Appends hold the writer lock for the whole read-check-append-update
//! sequence, so `seq` stays gapless and the index agrees with the log.

pub mod stream;

use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::model::event::{Event, NewEvent};
use crate::store::{FileLock, LockOptions, Record, Store, write_json_atomic};
use crate::telemetry::metrics;

pub use stream::{StreamMessage, clamp_heartbeat};

const DEDUPE_WINDOW_DAYS: i64 = 30;
const MAX_LIST_LIMIT: usize = 5_000;
const DEFAULT_ROUTE_LIMIT: usize = 200;
const MAX_ROUTE_LIMIT: usize = 2_000;

/// Cursor returned by [`EventLog::cursor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    pub project_id: String,
    pub last_seq: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeqState {
    project_id: String,
    last_seq: u64,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdempotencyIndex {
    #[serde(default)]
    items: Vec<IdempotencyEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdempotencyEntry {
    #[serde(rename = "type")]
    event_type: String,
    entity_id: String,
    idempotency_key: String,
    event_seq: u64,
    ts: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IndexFile<'a> {
    project_id: &'a str,
    updated_at: DateTime<Utc>,
    items: &'a [IdempotencyEntry],
}

/// Handle to the event logs under a data root.
#[derive(Debug, Clone)]
pub struct EventLog {
    store: Store,
    lock: LockOptions,
}

impl EventLog {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            lock: LockOptions::default(),
        }
    }

    pub fn with_lock_options(mut self, lock: LockOptions) -> Self {
        self.lock = lock;
        self
    }

    fn dir(&self, project_id: &str) -> PathBuf {
        self.store.collection_dir(project_id, "events")
    }

    fn log_path(&self, project_id: &str) -> PathBuf {
        self.dir(project_id).join("events.jsonl")
    }

    /// Append an event, or return the prior one for a repeated
    /// `(type, entityId, idempotencyKey)` within the dedupe window.
    pub async fn append(&self, project_id: &str, new: NewEvent) -> Result<Event> {
        let dir = self.dir(project_id);
        tokio::fs::create_dir_all(&dir).await?;
        let lock = FileLock::acquire(dir.join("writer.lock"), self.lock).await?;
        let result = self.append_locked(project_id, new).await;
        lock.release().await?;
        result
    }

    async fn append_locked(&self, project_id: &str, new: NewEvent) -> Result<Event> {
        let dir = self.dir(project_id);
        let index_path = dir.join("idempotency-index.json");
        let seq_path = dir.join("seq.json");
        let now = Utc::now();

        let cutoff = now - Duration::days(DEDUPE_WINDOW_DAYS);
        let mut items = self
            .store
            .read::<IdempotencyIndex>(&index_path)
            .await?
            .unwrap_or_default()
            .items;
        items.retain(|item| item.ts >= cutoff);

        if let Some(ref key) = new.idempotency_key {
            let existing = items.iter().find(|item| {
                item.event_type == new.event_type.as_str()
                    && item.entity_id == new.entity_id
                    && &item.idempotency_key == key
            });
            if let Some(entry) = existing {
                if let Some(prior) = self.get_by_seq(project_id, entry.event_seq).await? {
                    debug!(project_id, seq = prior.seq, key = %key, "duplicate event append");
                    metrics::events_appended().add(
                        1,
                        &[
                            KeyValue::new("event_type", prior.event_type.to_string()),
                            KeyValue::new("result", "duplicate"),
                        ],
                    );
                    return Ok(prior);
                }
            }
        }

        let last_seq = match self.store.read::<SeqState>(&seq_path).await? {
            Some(state) => state.last_seq,
            None => self.tail_seq(project_id).await?,
        };
        let event = Event {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            seq: last_seq + 1,
            ts: now,
            event_type: new.event_type,
            entity_type: new.entity_type,
            entity_id: new.entity_id,
            causal_chain_id: new
                .causal_chain_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            idempotency_key: new.idempotency_key,
            payload: new.payload,
        };
        event.validate()?;

        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(project_id))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;

        write_json_atomic(
            &seq_path,
            &SeqState {
                project_id: project_id.to_string(),
                last_seq: event.seq,
                updated_at: now,
            },
        )
        .await?;

        if let Some(ref key) = event.idempotency_key {
            items.push(IdempotencyEntry {
                event_type: event.event_type.to_string(),
                entity_id: event.entity_id.clone(),
                idempotency_key: key.clone(),
                event_seq: event.seq,
                ts: event.ts,
            });
        }
        write_json_atomic(
            &index_path,
            &IndexFile {
                project_id,
                updated_at: now,
                items: &items,
            },
        )
        .await?;

        metrics::events_appended().add(
            1,
            &[
                KeyValue::new("event_type", event.event_type.to_string()),
                KeyValue::new("result", "ok"),
            ],
        );
        Ok(event)
    }

    /// Events with `seq > since`, oldest first, at most `limit` of the
    /// newest. Malformed lines are skipped.
    pub async fn list(&self, project_id: &str, since: u64, limit: usize) -> Result<Vec<Event>> {
        let limit = limit.clamp(1, MAX_LIST_LIMIT);
        let lines = self.read_lines(project_id).await?;
        let mut events = Vec::new();
        for line in lines.iter().rev() {
            let Ok(event) = serde_json::from_str::<Event>(line) else {
                continue;
            };
            if event.seq <= since {
                break;
            }
            events.push(event);
            if events.len() >= limit {
                break;
            }
        }
        events.reverse();
        Ok(events)
    }

    pub async fn cursor(&self, project_id: &str) -> Result<Cursor> {
        let seq_path = self.dir(project_id).join("seq.json");
        let last_seq = match self.store.read::<SeqState>(&seq_path).await? {
            Some(state) => state.last_seq,
            None => 0,
        };
        Ok(Cursor {
            project_id: project_id.to_string(),
            last_seq,
        })
    }

    async fn get_by_seq(&self, project_id: &str, seq: u64) -> Result<Option<Event>> {
        let lines = self.read_lines(project_id).await?;
        for line in lines.iter().rev() {
            let Ok(event) = serde_json::from_str::<Event>(line) else {
                continue;
            };
            if event.seq == seq {
                return Ok(Some(event));
            }
            if event.seq < seq {
                break;
            }
        }
        Ok(None)
    }

    /// Highest seq present in the log; used when `seq.json` is missing.
    async fn tail_seq(&self, project_id: &str) -> Result<u64> {
        let lines = self.read_lines(project_id).await?;
        Ok(lines
            .iter()
            .rev()
            .find_map(|line| serde_json::from_str::<Event>(line).ok())
            .map(|e| e.seq)
            .unwrap_or(0))
    }

    async fn read_lines(&self, project_id: &str) -> Result<Vec<String>> {
        match tokio::fs::read_to_string(self.log_path(project_id)).await {
            Ok(raw) => Ok(raw
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Limit used by list routes: 200 when unset, at most 2000.
pub fn clamp_route_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_ROUTE_LIMIT).clamp(1, MAX_ROUTE_LIMIT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_limit_defaults_and_caps() {
        assert_eq!(clamp_route_limit(None), 200);
        assert_eq!(clamp_route_limit(Some(0)), 1);
        assert_eq!(clamp_route_limit(Some(10_000)), 2_000);
    }
}
