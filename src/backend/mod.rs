//! Generation backend: a ComfyUI-compatible HTTP API.
//!
//! The worker only talks to [`GenerationBackend`]; [`ComfyClient`] is the
//! reqwest implementation. Tests substitute an in-memory backend.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8188";

/// An output image as reported by `/history`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "output_kind")]
    pub kind: String,
}

fn output_kind() -> String {
    "output".into()
}

/// Sampler progress for a queued prompt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub value: f64,
    pub max: f64,
    pub percent: u8,
}

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Queue a workflow graph; returns the backend's prompt id.
    async fn submit(&self, workflow: &Value) -> Result<String>;

    /// History document for a prompt (keyed by prompt id).
    async fn history(&self, prompt_id: &str) -> Result<Value>;

    async fn download(&self, image: &ImageRef) -> Result<Vec<u8>>;
}

/// Prefix `http://` when the URL has no scheme and drop trailing slashes.
pub fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return DEFAULT_BASE_URL.to_string();
    }
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

/// Images listed under `history[promptId].outputs.*.images`.
pub fn extract_images(history: &Value, prompt_id: &str) -> Vec<ImageRef> {
    let Some(outputs) = history
        .get(prompt_id)
        .and_then(|e| e.get("outputs"))
        .and_then(Value::as_object)
    else {
        return Vec::new();
    };
    outputs
        .values()
        .filter_map(|o| o.get("images").and_then(Value::as_array))
        .flatten()
        .filter_map(|img| {
            let filename = img.get("filename").and_then(Value::as_str)?;
            if filename.is_empty() {
                return None;
            }
            Some(ImageRef {
                filename: filename.to_string(),
                subfolder: img
                    .get("subfolder")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                kind: img
                    .get("type")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .unwrap_or("output")
                    .to_string(),
            })
        })
        .collect()
}

/// 100% once the prompt completed; otherwise the last `progress` status
/// message. `None` when nothing usable was reported.
pub fn extract_progress(history: &Value, prompt_id: &str) -> Option<Progress> {
    let status = history.get(prompt_id)?.get("status")?;
    if status.get("completed").and_then(Value::as_bool) == Some(true) {
        return Some(Progress {
            value: 1.0,
            max: 1.0,
            percent: 100,
        });
    }
    let last = status
        .get("messages")
        .and_then(Value::as_array)?
        .iter()
        .filter_map(Value::as_array)
        .filter(|m| m.len() >= 2 && m[0].as_str() == Some("progress"))
        .filter_map(|m| m[1].as_object())
        .last()?;
    let number = |keys: [&str; 2]| {
        keys.iter()
            .find_map(|k| last.get(*k).and_then(Value::as_f64))
            .unwrap_or(0.0)
    };
    let value = number(["value", "step"]);
    let max = number(["max", "total"]);
    if !value.is_finite() || !max.is_finite() || max <= 0.0 {
        return None;
    }
    let percent = (value / max * 100.0).round().clamp(0.0, 100.0) as u8;
    Some(Progress {
        value,
        max,
        percent,
    })
}

/// HTTP client for a ComfyUI server.
#[derive(Debug, Clone)]
pub struct ComfyClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<SecretString>,
}

impl ComfyClient {
    pub fn new(base_url: &str, token: Option<SecretString>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: normalize_base_url(base_url),
            token,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let request = self
            .client
            .request(method, format!("{}{path}", self.base_url));
        match self.token {
            Some(ref token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }

    async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(Error::Backend {
            status: Some(status),
            message: format!("ComfyUI {what} failed: {body}"),
        })
    }
}

#[async_trait]
impl GenerationBackend for ComfyClient {
    async fn submit(&self, workflow: &Value) -> Result<String> {
        let client_id = Uuid::new_v4().to_string();
        let response = self
            .request(reqwest::Method::POST, "/prompt")
            .json(&json!({ "prompt": workflow, "client_id": client_id }))
            .send()
            .await?;
        let body: Value = Self::check(response, "/prompt").await?.json().await?;
        let prompt_id = ["prompt_id", "promptId", "id"]
            .iter()
            .find_map(|k| body.get(*k).and_then(Value::as_str))
            .ok_or_else(|| Error::Backend {
                status: None,
                message: format!("ComfyUI /prompt response missing prompt_id: {body}"),
            })?;
        debug!(prompt_id, "workflow submitted");
        Ok(prompt_id.to_string())
    }

    async fn history(&self, prompt_id: &str) -> Result<Value> {
        let response = self
            .request(reqwest::Method::GET, &format!("/history/{prompt_id}"))
            .send()
            .await?;
        Ok(Self::check(response, "/history").await?.json().await?)
    }

    async fn download(&self, image: &ImageRef) -> Result<Vec<u8>> {
        let response = self
            .request(reqwest::Method::GET, "/view")
            .query(&[
                ("filename", image.filename.as_str()),
                ("subfolder", image.subfolder.as_str()),
                ("type", image.kind.as_str()),
            ])
            .send()
            .await?;
        let bytes = Self::check(response, "/view").await?.bytes().await?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_gets_scheme() {
        assert_eq!(normalize_base_url("127.0.0.1:8188/"), "http://127.0.0.1:8188");
        assert_eq!(normalize_base_url("https://gpu.local"), "https://gpu.local");
        assert_eq!(normalize_base_url("  "), DEFAULT_BASE_URL);
    }

    #[test]
    fn images_from_history() {
        let history = json!({
            "p1": {"outputs": {
                "9": {"images": [{"filename": "a.png", "subfolder": "assetgen", "type": "output"}]},
                "12": {"images": [{"filename": "b.png"}, {"subfolder": "x"}]},
                "13": {"text": ["ignored"]}
            }}
        });
        let images = extract_images(&history, "p1");
        assert_eq!(images.len(), 2);
        assert!(images.iter().any(|i| i.filename == "b.png" && i.kind == "output"));
        assert!(extract_images(&history, "missing").is_empty());
    }

    #[test]
    fn progress_from_status_messages() {
        let history = json!({
            "p1": {"status": {"messages": [
                ["execution_start", {}],
                ["progress", {"value": 2, "max": 20}],
                ["progress", {"step": 5, "total": 20}]
            ]}}
        });
        assert_eq!(extract_progress(&history, "p1").map(|p| p.percent), Some(25));

        let done = json!({"p1": {"status": {"completed": true}}});
        assert_eq!(extract_progress(&done, "p1").map(|p| p.percent), Some(100));

        let zero = json!({"p1": {"status": {"messages": [["progress", {"value": 1, "max": 0}]]}}});
        assert!(extract_progress(&zero, "p1").is_none());
    }
}
