//! Image post-processing adapters.
//!
//! Background removal and atlas packing run as external executables.
//! [`CommandAdapter`] spawns them with `tokio::process`; the worker only
//! sees the [`ImageAdapter`] trait.
//!
//! Command contracts:
//!
//! ```text
//! bg remove:  <cmd> --in <input.png> --out <alpha.png> [--threshold N] [--feather N] [--erode N]
//! atlas pack: <cmd> --request <dir>/atlas-request.json
//!             writes <dir>/atlas.png and <dir>/atlas.json
//! ```

use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::store::write_json_atomic;

const STDERR_TAIL: usize = 4_000;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BgRemoveOptions {
    pub output: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feather: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub erode: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtlasFrame {
    pub key: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AtlasOptions {
    /// Directory receiving `atlas.png` and `atlas.json`.
    pub out_dir: PathBuf,
    pub padding: u32,
    pub max_size: u32,
    pub power_of_two: bool,
    pub trim: bool,
    pub extrude: u32,
    pub sort: String,
}

impl AtlasOptions {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            padding: 2,
            max_size: 2048,
            power_of_two: false,
            trim: false,
            extrude: 0,
            sort: "area".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackedFrame {
    pub key: String,
    pub rect: Rect,
}

#[derive(Debug, Clone)]
pub struct AtlasOutput {
    pub image_path: PathBuf,
    pub data_path: PathBuf,
    pub frames: Vec<PackedFrame>,
}

#[async_trait]
pub trait ImageAdapter: Send + Sync {
    /// Write an alpha cut of `input` to `opts.output` and return its path.
    async fn remove_background(&self, input: &Path, opts: &BgRemoveOptions) -> Result<PathBuf>;

    async fn pack_atlas(&self, frames: &[AtlasFrame], opts: &AtlasOptions) -> Result<AtlasOutput>;
}

/// Adapter that shells out to configured executables.
#[derive(Debug, Clone)]
pub struct CommandAdapter {
    bg_remove: Option<PathBuf>,
    atlas_pack: Option<PathBuf>,
}

impl CommandAdapter {
    pub fn new(bg_remove: Option<PathBuf>, atlas_pack: Option<PathBuf>) -> Self {
        Self {
            bg_remove,
            atlas_pack,
        }
    }

    async fn run(&self, label: &str, command: &Path, args: &[String]) -> Result<()> {
        let command = if command.is_relative() && command.components().count() > 1 {
            std::env::current_dir()?.join(command)
        } else {
            command.to_path_buf()
        };
        debug!(label, command = %command.display(), ?args, "running adapter");
        let start = Instant::now();
        let output = Command::new(&command).args(args).output().await?;
        let duration_ms = start.elapsed().as_millis() as u64;

        if output.status.success() {
            info!(label, duration_ms, "adapter completed");
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail = tail(&stderr, STDERR_TAIL);
        warn!(label, duration_ms, code = ?output.status.code(), stderr = %tail, "adapter failed");
        Err(Error::Adapter(format!(
            "{label} exited with status {}: {tail}",
            output.status.code().unwrap_or(-1)
        )))
    }
}

fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s.trim();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].trim()
}

#[async_trait]
impl ImageAdapter for CommandAdapter {
    async fn remove_background(&self, input: &Path, opts: &BgRemoveOptions) -> Result<PathBuf> {
        let command = self
            .bg_remove
            .as_deref()
            .ok_or_else(|| Error::Config("no background removal command configured".into()))?;
        if let Some(parent) = opts.output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut args = vec![
            "--in".to_string(),
            input.display().to_string(),
            "--out".to_string(),
            opts.output.display().to_string(),
        ];
        if let Some(t) = opts.threshold {
            args.extend(["--threshold".into(), t.to_string()]);
        }
        for (flag, value) in [("--feather", opts.feather), ("--erode", opts.erode)] {
            if let Some(v) = value.filter(|v| *v > 0.0) {
                args.extend([flag.to_string(), v.to_string()]);
            }
        }
        self.run("bg_remove", command, &args).await?;
        if !tokio::fs::try_exists(&opts.output).await? {
            return Err(Error::Adapter(format!(
                "bg_remove produced no output at {}",
                opts.output.display()
            )));
        }
        Ok(opts.output.clone())
    }

    async fn pack_atlas(&self, frames: &[AtlasFrame], opts: &AtlasOptions) -> Result<AtlasOutput> {
        let command = self
            .atlas_pack
            .as_deref()
            .ok_or_else(|| Error::Config("no atlas pack command configured".into()))?;
        tokio::fs::create_dir_all(&opts.out_dir).await?;

        let image_path = opts.out_dir.join("atlas.png");
        let data_path = opts.out_dir.join("atlas.json");
        let request_path = opts.out_dir.join("atlas-request.json");
        write_json_atomic(
            &request_path,
            &serde_json::json!({
                "frames": frames,
                "options": opts,
                "imagePath": image_path,
                "dataPath": data_path,
            }),
        )
        .await?;

        self.run(
            "atlas_pack",
            command,
            &["--request".to_string(), request_path.display().to_string()],
        )
        .await?;

        let data: Value = serde_json::from_slice(&tokio::fs::read(&data_path).await?)?;
        Ok(AtlasOutput {
            frames: packed_frames(&data),
            image_path,
            data_path,
        })
    }
}

/// Frame rects from an atlas data file (`frames.<key>.frame`).
pub fn packed_frames(data: &Value) -> Vec<PackedFrame> {
    let Some(frames) = data.get("frames").and_then(Value::as_object) else {
        return Vec::new();
    };
    frames
        .iter()
        .filter_map(|(key, entry)| {
            let rect = serde_json::from_value(entry.get("frame")?.clone()).ok()?;
            Some(PackedFrame {
                key: key.clone(),
                rect,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frames_from_atlas_data() {
        let data = json!({
            "frames": {
                "idle_0": {"frame": {"x": 0, "y": 0, "w": 32, "h": 32}, "rotated": false},
                "broken": {"rotated": false}
            },
            "meta": {"image": "atlas.png"}
        });
        let frames = packed_frames(&data);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].rect, Rect { x: 0, y: 0, w: 32, h: 32 });
    }

    #[test]
    fn tail_keeps_the_end() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail(" ok ", 10), "ok");
    }

    #[tokio::test]
    async fn unconfigured_command_is_a_config_error() {
        let adapter = CommandAdapter::new(None, None);
        let err = adapter
            .remove_background(Path::new("a.png"), &BgRemoveOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
