//! Job processors and the registry the control plane dispatches through.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImage, RgbaImage};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::adapters::{AtlasFrame, AtlasOptions, BgRemoveOptions, ImageAdapter};
use crate::error::{Error, Result};
use crate::jobs::JobLog;
use crate::model::JsonMap;
use crate::model::asset::{Asset, AssetVersion, Variant, VariantStatus, VersionStatus};
use crate::model::event::{EventType, NewEvent};
use crate::model::job::{Job, JobType};
use crate::store::schema::require_non_empty;
use crate::store::{Record, Store};

/// What a processor produced: the job output, plus domain events to
/// append (and feed to automation) once the job has succeeded.
#[derive(Debug, Default)]
pub struct Outcome {
    pub output: JsonMap,
    pub events: Vec<NewEvent>,
}

impl Outcome {
    pub fn new(output: Value) -> Self {
        Self {
            output: match output {
                Value::Object(map) => map,
                _ => JsonMap::new(),
            },
            events: Vec::new(),
        }
    }

    pub fn event(mut self, event: NewEvent) -> Self {
        self.events.push(event);
        self
    }
}

#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, job: &Job, log: &JobLog) -> Result<Outcome>;
}

/// Processors indexed by job type.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<JobType, Arc<dyn Processor>>,
}

impl ProcessorRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn register(mut self, job_type: JobType, processor: Arc<dyn Processor>) -> Self {
        self.processors.insert(job_type, processor);
        self
    }

    pub fn get(&self, job_type: JobType) -> Option<&Arc<dyn Processor>> {
        self.processors.get(&job_type)
    }
}

// ---------------------------------------------------------------------------
// Input helpers
// ---------------------------------------------------------------------------

pub(crate) fn input_str<'a>(input: &'a JsonMap, key: &str) -> Option<&'a str> {
    input
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

pub(crate) fn input_f64(input: &JsonMap, key: &str) -> Option<f64> {
    input.get(key).and_then(Value::as_f64)
}

fn input_u32(input: &JsonMap, key: &str, default: u32) -> u32 {
    input
        .get(key)
        .and_then(Value::as_u64)
        .map(|n| n as u32)
        .unwrap_or(default)
}

fn input_bool(input: &JsonMap, key: &str) -> bool {
    input.get(key).and_then(Value::as_bool).unwrap_or(false)
}

async fn load_asset(store: &Store, project_id: &str, asset_id: &str) -> Result<Option<Asset>> {
    store
        .read(&store.record_path(project_id, "assets", asset_id))
        .await
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Other(format!("image task panicked: {e}")))?
}

// ---------------------------------------------------------------------------
// bg_remove
// ---------------------------------------------------------------------------

pub struct BgRemoveProcessor {
    store: Store,
    adapter: Arc<dyn ImageAdapter>,
}

impl BgRemoveProcessor {
    pub fn new(store: Store, adapter: Arc<dyn ImageAdapter>) -> Self {
        Self { store, adapter }
    }
}

/// `.../original/<file>` becomes `.../alpha/<file>`.
pub fn alpha_path_for(original: &str) -> String {
    original.replace("/original/", "/alpha/")
}

#[async_trait]
impl Processor for BgRemoveProcessor {
    async fn process(&self, job: &Job, log: &JobLog) -> Result<Outcome> {
        let original = input_str(&job.input, "originalPath").ok_or_else(|| {
            Error::Other("bg_remove job missing input.originalPath (data-relative path)".into())
        })?;
        let original_abs = self.store.resolve(original);
        if !tokio::fs::try_exists(&original_abs).await? {
            return Err(Error::Other(format!(
                "Original image not found: {}",
                original_abs.display()
            )));
        }
        let alpha_rel = input_str(&job.input, "alphaPath")
            .map(str::to_string)
            .unwrap_or_else(|| alpha_path_for(original));
        let opts = BgRemoveOptions {
            output: self.store.resolve(&alpha_rel),
            threshold: input_f64(&job.input, "threshold"),
            feather: input_f64(&job.input, "feather"),
            erode: input_f64(&job.input, "erode"),
        };
        let params = json!({ "threshold": opts.threshold, "feather": opts.feather, "erode": opts.erode });
        log.info(
            "bg_remove_start",
            Some(json!({ "originalPath": original, "alphaPath": alpha_rel, "params": params })),
        )
        .await;

        let written = self.adapter.remove_background(&original_abs, &opts).await?;
        let alpha_rel = self.store.relativize(&written);
        log.info("bg_remove_done", Some(json!({ "alphaPath": alpha_rel })))
            .await;

        if let (Some(asset_id), Some(version_id), Some(variant_id)) = (
            input_str(&job.input, "assetId"),
            input_str(&job.input, "versionId"),
            input_str(&job.input, "variantId"),
        ) {
            if let Some(mut asset) = load_asset(&self.store, &job.project_id, asset_id).await? {
                let updated = asset
                    .version_mut(version_id)
                    .and_then(|v| v.variant_mut(variant_id))
                    .map(|variant| variant.alpha_path = Some(alpha_rel.clone()))
                    .is_some();
                if updated {
                    asset.updated_at = Utc::now();
                    self.store
                        .write(
                            &self.store.record_path(&job.project_id, "assets", asset_id),
                            &asset,
                        )
                        .await?;
                }
            }
        }

        Ok(Outcome::new(json!({ "alphaPath": alpha_rel, "params": params })))
    }
}

// ---------------------------------------------------------------------------
// atlas_pack
// ---------------------------------------------------------------------------

/// Engine-agnostic atlas record at `projects/<pid>/atlases/<id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AtlasRecord {
    pub id: String,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub image_path: String,
    pub data_path: String,
    pub pack_settings: Value,
    pub frames: Vec<Value>,
}

impl Record for AtlasRecord {
    const SCHEMA: &'static str = "atlas.schema.json";

    fn validate(&self) -> Result<()> {
        require_non_empty(&self.id, Self::SCHEMA, "id")?;
        require_non_empty(&self.image_path, Self::SCHEMA, "imagePath")
    }
}

pub struct AtlasPackProcessor {
    store: Store,
    adapter: Arc<dyn ImageAdapter>,
}

impl AtlasPackProcessor {
    pub fn new(store: Store, adapter: Arc<dyn ImageAdapter>) -> Self {
        Self { store, adapter }
    }

    /// Frames from `framePaths` (strings or `{key, path}`), keyed by
    /// `frameNames[i]` when given.
    fn frames(&self, input: &JsonMap) -> Result<Vec<AtlasFrame>> {
        let paths = input
            .get("framePaths")
            .and_then(Value::as_array)
            .filter(|a| !a.is_empty())
            .ok_or_else(|| {
                Error::Other("atlas_pack job missing input.framePaths[] (data-relative)".into())
            })?;
        let names = input.get("frameNames").and_then(Value::as_array);
        let mut frames = Vec::with_capacity(paths.len());
        for (idx, entry) in paths.iter().enumerate() {
            let (key, path) = match entry {
                Value::String(path) => (None, path.as_str()),
                Value::Object(obj) => (
                    obj.get("key").and_then(Value::as_str),
                    obj.get("path").and_then(Value::as_str).unwrap_or_default(),
                ),
                _ => (None, ""),
            };
            if path.is_empty() {
                return Err(Error::Other(format!(
                    "atlas_pack framePaths[{idx}] has no path"
                )));
            }
            let key = names
                .and_then(|n| n.get(idx))
                .and_then(Value::as_str)
                .or(key)
                .map(str::to_string)
                .unwrap_or_else(|| format!("frame_{idx}"));
            frames.push(AtlasFrame {
                key,
                path: self.store.resolve(path),
            });
        }
        Ok(frames)
    }
}

#[async_trait]
impl Processor for AtlasPackProcessor {
    async fn process(&self, job: &Job, log: &JobLog) -> Result<Outcome> {
        let frames = self.frames(&job.input)?;
        let atlas_id = input_str(&job.input, "atlasId")
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let out_dir = self
            .store
            .project_dir(&job.project_id)
            .join("files/atlases")
            .join(&atlas_id);

        let mut opts = AtlasOptions::new(out_dir);
        opts.padding = input_u32(&job.input, "padding", opts.padding);
        opts.max_size = input_u32(&job.input, "maxSize", opts.max_size);
        opts.extrude = input_u32(&job.input, "extrude", opts.extrude);
        opts.power_of_two = input_bool(&job.input, "powerOfTwo");
        opts.trim = input_bool(&job.input, "trim");
        if let Some(sort) = input_str(&job.input, "sort") {
            opts.sort = sort.to_string();
        }

        log.info(
            "atlas_pack_start",
            Some(json!({ "atlasId": atlas_id, "frames": frames.len(), "settings": opts })),
        )
        .await;
        let packed = self.adapter.pack_atlas(&frames, &opts).await?;
        let image_path = self.store.relativize(&packed.image_path);
        let data_path = self.store.relativize(&packed.data_path);
        log.info(
            "atlas_pack_done",
            Some(json!({ "atlasId": atlas_id, "frames": packed.frames.len(), "atlasImagePath": image_path })),
        )
        .await;

        let sources: HashMap<&str, &Path> = frames
            .iter()
            .map(|f| (f.key.as_str(), f.path.as_path()))
            .collect();
        let now = Utc::now();
        let spec_id = input_str(&job.input, "specId").map(str::to_string);
        let record = AtlasRecord {
            id: atlas_id.clone(),
            project_id: job.project_id.clone(),
            spec_id: spec_id.clone(),
            created_at: now,
            updated_at: now,
            image_path: image_path.clone(),
            data_path: data_path.clone(),
            pack_settings: serde_json::to_value(&opts)?,
            frames: packed
                .frames
                .iter()
                .map(|f| {
                    json!({
                        "id": f.key,
                        "sourcePath": sources.get(f.key.as_str()).map(|p| self.store.relativize(p)),
                        "rect": f.rect,
                        "sourceSize": { "w": f.rect.w, "h": f.rect.h },
                    })
                })
                .collect(),
        };
        self.store
            .write(
                &self.store.record_path(&job.project_id, "atlases", &atlas_id),
                &record,
            )
            .await?;

        let event = NewEvent::new(EventType::AtlasReady, "atlas", atlas_id.clone())
            .payload(json!({
                "atlasId": atlas_id,
                "specId": spec_id,
                "imagePath": image_path,
                "frameCount": packed.frames.len(),
            }))
            .idempotency_key(format!("atlas:{atlas_id}:atlas_ready"));
        Ok(Outcome::new(json!({
            "atlasId": atlas_id,
            "atlasImagePath": image_path,
            "atlasDataPath": data_path,
        }))
        .event(event))
    }
}

// ---------------------------------------------------------------------------
// export
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportProfile {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub options: ExportOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub padding: Option<u32>,
    #[serde(default)]
    pub name_prefix: String,
    #[serde(default)]
    pub name_suffix: String,
}

impl ExportOptions {
    fn scale(&self) -> f64 {
        self.scale.filter(|s| *s > 0.0).unwrap_or(1.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRecord {
    pub id: String,
    pub project_id: String,
    pub created_at: DateTime<Utc>,
    pub input: Value,
    pub output: Value,
}

impl Record for ExportRecord {
    const SCHEMA: &'static str = "export.schema.json";

    fn validate(&self) -> Result<()> {
        require_non_empty(&self.id, Self::SCHEMA, "id")
    }
}

/// Lowercase `[a-z0-9_]`, at most 48 chars, never empty.
pub fn slugify(s: &str) -> String {
    let mut out = String::new();
    for c in s.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    let out: String = out.trim_matches('_').chars().take(48).collect();
    if out.is_empty() { "asset".into() } else { out }
}

/// Hands out unique slugs: `name`, `name_2`, `name_3`, ...
#[derive(Debug, Default)]
struct Names {
    used: HashMap<String, usize>,
}

impl Names {
    fn unique(&mut self, base: &str, opts: &ExportOptions) -> String {
        let key = slugify(&format!("{}{base}{}", opts.name_prefix, opts.name_suffix));
        let n = self.used.entry(key.clone()).or_insert(0);
        *n += 1;
        if *n == 1 { key } else { format!("{key}_{n}") }
    }
}

/// Latest approved version (else the latest), then its primary, selected
/// or first variant.
pub fn pick_export_variant(asset: &Asset) -> Option<(&AssetVersion, &Variant)> {
    let version = asset
        .latest_approved()
        .or_else(|| asset.versions.last())?;
    let variant = version
        .primary_variant_id
        .as_ref()
        .and_then(|id| version.variants.iter().find(|v| &v.id == id))
        .or_else(|| {
            version
                .variants
                .iter()
                .find(|v| v.status == VariantStatus::Selected)
        })
        .or_else(|| version.variants.first())?;
    Some((version, variant))
}

/// Scale and pad an image into `dest`; a plain copy when neither applies.
fn export_image(source: &Path, dest: &Path, scale: f64, padding: u32) -> Result<()> {
    if scale == 1.0 && padding == 0 {
        std::fs::copy(source, dest)?;
        return Ok(());
    }
    let mut img = image::open(source)?;
    if scale != 1.0 {
        let w = ((img.width() as f64 * scale).round() as u32).max(1);
        let h = ((img.height() as f64 * scale).round() as u32).max(1);
        img = img.resize_exact(w, h, FilterType::Lanczos3);
    }
    if padding > 0 {
        let mut canvas = RgbaImage::new(img.width() + padding * 2, img.height() + padding * 2);
        canvas.copy_from(&img.to_rgba8(), padding, padding)?;
        img = DynamicImage::ImageRgba8(canvas);
    }
    img.save(dest)?;
    Ok(())
}

pub struct ExportProcessor {
    store: Store,
}

impl ExportProcessor {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    async fn profile(&self, job: &Job) -> Result<Option<ExportProfile>> {
        if let Some(snapshot) = job.input.get("profileSnapshot").filter(|v| v.is_object()) {
            return Ok(Some(serde_json::from_value(snapshot.clone())?));
        }
        let Some(profile_id) = input_str(&job.input, "profileId") else {
            return Ok(None);
        };
        let path = self
            .store
            .record_path(&job.project_id, "export-profiles", profile_id);
        match self.store.read(&path).await? {
            Some(profile) => Ok(Some(profile)),
            None => Err(Error::NotFound(format!("export profile {profile_id}"))),
        }
    }
}

fn string_list(input: &JsonMap, key: &str) -> Vec<String> {
    input
        .get(key)
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl Processor for ExportProcessor {
    async fn process(&self, job: &Job, log: &JobLog) -> Result<Outcome> {
        let export_id = input_str(&job.input, "exportId")
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let root = self
            .store
            .project_dir(&job.project_id)
            .join("files/exports")
            .join(&export_id);
        let images_dir = root.join("assets/images");
        let atlases_dir = root.join("assets/atlases");
        tokio::fs::create_dir_all(&images_dir).await?;
        tokio::fs::create_dir_all(&atlases_dir).await?;

        let asset_ids = string_list(&job.input, "assetIds");
        let atlas_ids = string_list(&job.input, "atlasIds");
        let profile = self.profile(job).await?;
        let opts = profile.as_ref().map(|p| p.options.clone()).unwrap_or_default();
        let scale = opts.scale();
        let padding = opts.padding.unwrap_or(0);
        log.info(
            "export_start",
            Some(json!({ "exportId": export_id, "assets": asset_ids.len(), "atlases": atlas_ids.len() })),
        )
        .await;

        let mut names = Names::default();
        let mut images = Vec::new();
        for asset_id in &asset_ids {
            let Some(asset) = load_asset(&self.store, &job.project_id, asset_id).await? else {
                continue;
            };
            let Some((_, variant)) = pick_export_variant(&asset) else {
                continue;
            };
            let source = self
                .store
                .resolve(variant.alpha_path.as_deref().unwrap_or(&variant.original_path));
            if !tokio::fs::try_exists(&source).await? {
                continue;
            }
            let name = names.unique(asset_id, &opts);
            let dest = images_dir.join(format!("{name}.png"));
            blocking(move || export_image(&source, &dest, scale, padding)).await?;
            images.push(json!({
                "name": name,
                "assetId": asset_id,
                "path": format!("assets/images/{name}.png"),
                "tags": variant.tags,
            }));
        }

        let mut atlases = Vec::new();
        for atlas_id in &atlas_ids {
            let src: PathBuf = self
                .store
                .project_dir(&job.project_id)
                .join("files/atlases")
                .join(atlas_id);
            let (src_png, src_json) = (src.join("atlas.png"), src.join("atlas.json"));
            if !tokio::fs::try_exists(&src_png).await? || !tokio::fs::try_exists(&src_json).await? {
                continue;
            }
            let name = names.unique(atlas_id, &opts);
            let dest_png = atlases_dir.join(format!("{name}.png"));
            blocking(move || export_image(&src_png, &dest_png, scale, 0)).await?;

            let mut data: Value = serde_json::from_slice(&tokio::fs::read(&src_json).await?)?;
            if let Some(obj) = data.as_object_mut() {
                let meta = obj.entry("meta").or_insert_with(|| json!({}));
                if let Some(meta) = meta.as_object_mut() {
                    meta.insert("image".into(), json!(format!("{name}.png")));
                }
            }
            if scale != 1.0 {
                scale_frames(&mut data, scale);
            }
            crate::store::write_json_atomic(&atlases_dir.join(format!("{name}.json")), &data).await?;
            atlases.push(json!({
                "id": atlas_id,
                "imagePath": format!("assets/atlases/{name}.png"),
                "dataPath": format!("assets/atlases/{name}.json"),
            }));
        }

        let now = Utc::now();
        let manifest_path = root.join("manifest.json");
        crate::store::write_json_atomic(
            &manifest_path,
            &json!({
                "id": export_id,
                "projectId": job.project_id,
                "createdAt": now,
                "version": "0.2",
                "atlases": atlases,
                "images": images,
                "animations": job.input.get("animations").filter(|v| v.is_array()).cloned().unwrap_or(json!([])),
                "ui": job.input.get("ui").filter(|v| v.is_array()).cloned().unwrap_or(json!([])),
            }),
        )
        .await?;

        let output = json!({
            "exportPath": self.store.relativize(&root),
            "manifestPath": self.store.relativize(&manifest_path),
        });
        let record = ExportRecord {
            id: export_id.clone(),
            project_id: job.project_id.clone(),
            created_at: now,
            input: json!({
                "assetIds": asset_ids,
                "atlasIds": atlas_ids,
                "profileId": profile.as_ref().map(|p| p.id.clone()).filter(|id| !id.is_empty()),
            }),
            output: output.clone(),
        };
        self.store
            .write(
                &self.store.record_path(&job.project_id, "exports", &export_id),
                &record,
            )
            .await?;
        log.info("export_done", Some(json!({ "exportId": export_id, "images": images.len() })))
            .await;
        Ok(Outcome::new(output))
    }
}

fn scale_frames(data: &mut Value, scale: f64) {
    let Some(frames) = data.get_mut("frames").and_then(Value::as_object_mut) else {
        return;
    };
    let s = |v: &Value, min: f64| ((v.as_f64().unwrap_or(0.0) * scale).round()).max(min);
    for frame in frames.values_mut() {
        for key in ["frame", "spriteSourceSize"] {
            if let Some(rect) = frame.get_mut(key).and_then(Value::as_object_mut) {
                for (field, min) in [("x", 0.0), ("y", 0.0), ("w", 1.0), ("h", 1.0)] {
                    if let Some(v) = rect.get(field).map(|v| s(v, min)) {
                        rect.insert(field.into(), json!(v as u64));
                    }
                }
            }
        }
        if let Some(size) = frame.get_mut("sourceSize").and_then(Value::as_object_mut) {
            for field in ["w", "h"] {
                if let Some(v) = size.get(field).map(|v| s(v, 1.0)) {
                    size.insert(field.into(), json!(v as u64));
                }
            }
        }
    }
}

/// New version of `asset` (created when missing) holding `variants`.
pub(crate) fn push_version(
    asset: Option<Asset>,
    project_id: &str,
    spec_id: &str,
    asset_id: &str,
    version: AssetVersion,
) -> Asset {
    let now = Utc::now();
    let mut asset = asset.unwrap_or_else(|| Asset {
        id: asset_id.to_string(),
        project_id: project_id.to_string(),
        spec_id: spec_id.to_string(),
        created_at: now,
        updated_at: now,
        versions: Vec::new(),
    });
    asset.updated_at = now;
    asset.versions.push(version);
    asset
}

pub(crate) fn new_version(id: String, generation: JsonMap, variants: Vec<Variant>) -> AssetVersion {
    AssetVersion {
        id,
        created_at: Utc::now(),
        status: VersionStatus::Review,
        generation,
        primary_variant_id: None,
        variants,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugs_are_unique_and_clean() {
        assert_eq!(slugify("Hero Ship!!"), "hero_ship");
        assert_eq!(slugify("***"), "asset");
        let mut names = Names::default();
        let opts = ExportOptions::default();
        assert_eq!(names.unique("ship", &opts), "ship");
        assert_eq!(names.unique("ship", &opts), "ship_2");
    }

    #[test]
    fn alpha_path_mirrors_original() {
        assert_eq!(
            alpha_path_for("projects/p/files/images/a1/original/v1.png"),
            "projects/p/files/images/a1/alpha/v1.png"
        );
    }

    #[test]
    fn frame_rects_scale() {
        let mut data = json!({"frames": {"f": {"frame": {"x": 10, "y": 4, "w": 32, "h": 1}, "sourceSize": {"w": 32, "h": 32}}}});
        scale_frames(&mut data, 0.5);
        assert_eq!(data["frames"]["f"]["frame"], json!({"x": 5, "y": 2, "w": 16, "h": 1}));
        assert_eq!(data["frames"]["f"]["sourceSize"], json!({"w": 16, "h": 16}));
    }
}
