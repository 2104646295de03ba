//! Live tailing of a project's event log as SSE-style messages.

use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tracing::warn;

use super::EventLog;
use crate::model::event::Event;

const DEFAULT_HEARTBEAT_MS: u64 = 3_000;
const MIN_HEARTBEAT_MS: u64 = 1_000;
const MAX_HEARTBEAT_MS: u64 = 30_000;
const POLL_BATCH: usize = 500;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Ready { project_id: String, since: u64 },
    Event(Box<Event>),
    Heartbeat { project_id: String, last_seq: u64 },
}

impl StreamMessage {
    pub fn name(&self) -> &'static str {
        match self {
            StreamMessage::Ready { .. } => "ready",
            StreamMessage::Event(_) => "event",
            StreamMessage::Heartbeat { .. } => "heartbeat",
        }
    }

    /// `event: <name>\ndata: <json>\n\n`
    pub fn to_sse(&self) -> String {
        let data = match self {
            StreamMessage::Ready { project_id, since } => {
                json!({"projectId": project_id, "since": since})
            }
            StreamMessage::Event(event) => serde_json::to_value(event).unwrap_or_default(),
            StreamMessage::Heartbeat {
                project_id,
                last_seq,
            } => json!({"projectId": project_id, "lastSeq": last_seq}),
        };
        format!("event: {}\ndata: {}\n\n", self.name(), data)
    }
}

/// Heartbeat interval: 3s by default, kept within 1s..=30s.
pub fn clamp_heartbeat(ms: Option<u64>) -> Duration {
    Duration::from_millis(
        ms.unwrap_or(DEFAULT_HEARTBEAT_MS)
            .clamp(MIN_HEARTBEAT_MS, MAX_HEARTBEAT_MS),
    )
}

impl EventLog {
    /// Tail `project_id` from `since`. The polling task stops once the
    /// receiver is dropped.
    pub fn stream(
        &self,
        project_id: &str,
        since: u64,
        heartbeat_ms: Option<u64>,
    ) -> mpsc::Receiver<StreamMessage> {
        let (tx, rx) = mpsc::channel(POLL_BATCH);
        let log = self.clone();
        let project_id = project_id.to_string();
        let interval = clamp_heartbeat(heartbeat_ms);

        tokio::spawn(async move {
            let ready = StreamMessage::Ready {
                project_id: project_id.clone(),
                since,
            };
            if tx.send(ready).await.is_err() {
                return;
            }
            let mut last_seq = since;
            loop {
                match log.list(&project_id, last_seq, POLL_BATCH).await {
                    Ok(events) => {
                        for event in events {
                            last_seq = last_seq.max(event.seq);
                            if tx.send(StreamMessage::Event(Box::new(event))).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => warn!(project_id = %project_id, error = %e, "event stream poll failed"),
                }
                let beat = StreamMessage::Heartbeat {
                    project_id: project_id.clone(),
                    last_seq,
                };
                if tx.send(beat).await.is_err() {
                    return;
                }
                tokio::select! {
                    _ = tx.closed() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_is_clamped() {
        assert_eq!(clamp_heartbeat(None), Duration::from_secs(3));
        assert_eq!(clamp_heartbeat(Some(10)), Duration::from_secs(1));
        assert_eq!(clamp_heartbeat(Some(120_000)), Duration::from_secs(30));
    }

    #[test]
    fn sse_frames_carry_name_and_json() {
        let msg = StreamMessage::Heartbeat {
            project_id: "p1".into(),
            last_seq: 7,
        };
        assert_eq!(
            msg.to_sse(),
            "event: heartbeat\ndata: {\"lastSeq\":7,\"projectId\":\"p1\"}\n\n"
        );
    }
}
