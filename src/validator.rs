//! Variant validation against a spec's quality contract.
//!
//! Each rendered variant is reduced to a [`VariantScan`]; checks compare
//! scans against the contract and against each other. The score is the
//! fraction of checks passed and maps to a [`ValidatorStatus`], which the
//! baseline's [`RoutingPolicy`] turns into a [`RouteDecision`].

use std::collections::BTreeSet;
use std::path::Path;

use image::{DynamicImage, GenericImageView, Rgba};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::profile::{RouteDecision, RoutingPolicy};
use crate::model::spec::{AssetSpec, BackgroundPolicy, OutputKind, PerspectiveMode};

pub const PASS_THRESHOLD: f64 = 0.85;
pub const WARN_THRESHOLD: f64 = 0.65;

/// Alpha at or below this counts as transparent.
const ALPHA_CUTOFF: u8 = 16;
/// Channel value at or above this counts as white.
const WHITE_CUTOFF: u8 = 245;
const CONTINUITY_MIN_OVERLAP: f64 = 0.3;

/// Foreground bounding box in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BBox {
    pub fn center(&self) -> (f64, f64) {
        (
            self.x as f64 + self.width as f64 / 2.0,
            self.y as f64 + self.height as f64 / 2.0,
        )
    }

    pub fn aspect(&self) -> f64 {
        if self.height == 0 {
            return 0.0;
        }
        self.width as f64 / self.height as f64
    }
}

/// What the checks need to know about one rendered image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantScan {
    pub variant_id: String,
    pub width: u32,
    pub height: u32,
    pub corners_transparent: bool,
    pub corners_white: bool,
    pub bbox: Option<BBox>,
    /// Foreground pixels as a fraction of the canvas.
    pub alpha_area: f64,
}

fn is_transparent(px: &Rgba<u8>) -> bool {
    px[3] <= ALPHA_CUTOFF
}

fn is_white(px: &Rgba<u8>) -> bool {
    px[3] > ALPHA_CUTOFF && px[0] >= WHITE_CUTOFF && px[1] >= WHITE_CUTOFF && px[2] >= WHITE_CUTOFF
}

impl VariantScan {
    pub fn from_image(variant_id: impl Into<String>, img: &DynamicImage) -> Self {
        let (width, height) = img.dimensions();
        let rgba = img.to_rgba8();
        let corners = if width == 0 || height == 0 {
            Vec::new()
        } else {
            vec![
                *rgba.get_pixel(0, 0),
                *rgba.get_pixel(width - 1, 0),
                *rgba.get_pixel(0, height - 1),
                *rgba.get_pixel(width - 1, height - 1),
            ]
        };
        let corners_transparent = !corners.is_empty() && corners.iter().all(is_transparent);
        let corners_white = !corners.is_empty() && corners.iter().all(is_white);

        // Foreground is whatever differs from the background the corners show.
        let mut min = (u32::MAX, u32::MAX);
        let mut max = (0u32, 0u32);
        let mut count = 0u64;
        for (x, y, px) in rgba.enumerate_pixels() {
            let background = is_transparent(px) || (corners_white && is_white(px));
            if background {
                continue;
            }
            count += 1;
            min = (min.0.min(x), min.1.min(y));
            max = (max.0.max(x), max.1.max(y));
        }
        let bbox = (count > 0).then(|| BBox {
            x: min.0,
            y: min.1,
            width: max.0 - min.0 + 1,
            height: max.1 - min.1 + 1,
        });
        let total = (width as u64 * height as u64).max(1);

        Self {
            variant_id: variant_id.into(),
            width,
            height,
            corners_transparent,
            corners_white,
            bbox,
            alpha_area: count as f64 / total as f64,
        }
    }

    pub fn from_path(variant_id: impl Into<String>, path: &Path) -> Result<Self> {
        let img = image::open(path)?;
        Ok(Self::from_image(variant_id, &img))
    }
}

/// Another spec sharing the same entity.
#[derive(Debug, Clone)]
pub struct Sibling {
    pub spec_id: String,
    pub positive_prompt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Check {
    pub id: String,
    pub passed: bool,
    pub confidence: f64,
    pub reason: String,
}

impl Check {
    fn new(id: &str, passed: bool, confidence: f64, reason: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            passed,
            confidence: confidence.clamp(0.0, 1.0),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidatorStatus {
    Pass,
    Warn,
    Fail,
}

impl ValidatorStatus {
    pub fn from_score(score: f64) -> Self {
        if score >= PASS_THRESHOLD {
            ValidatorStatus::Pass
        } else if score >= WARN_THRESHOLD {
            ValidatorStatus::Warn
        } else {
            ValidatorStatus::Fail
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub checks: Vec<Check>,
    pub score: f64,
    pub status: ValidatorStatus,
}

impl ValidationResult {
    pub fn from_checks(checks: Vec<Check>) -> Self {
        let score = if checks.is_empty() {
            1.0
        } else {
            checks.iter().filter(|c| c.passed).count() as f64 / checks.len() as f64
        };
        Self {
            status: ValidatorStatus::from_score(score),
            checks,
            score,
        }
    }
}

/// Run every check the spec's contract asks for.
pub fn validate(spec: &AssetSpec, scans: &[VariantScan], siblings: &[Sibling]) -> ValidationResult {
    let mut checks = Vec::new();
    if let Some(ref contract) = spec.quality_contract {
        if let Some(policy) = contract.background_policy {
            if policy != BackgroundPolicy::Any && !scans.is_empty() {
                checks.push(background_policy(policy, scans));
            }
        }
        if let Some(tolerance) = contract.alignment_tolerance_px {
            if let Some(check) = state_alignment(tolerance, scans) {
                checks.push(check);
            }
        }
        if let Some(tolerance) = contract.silhouette_drift_tolerance {
            if let Some(check) = silhouette_drift(tolerance, scans) {
                checks.push(check);
            }
        }
        if let Some(mode) = contract.perspective_mode {
            if let Some(check) = perspective_consistency(mode, scans) {
                checks.push(check);
            }
        }
        if !contract.required_states.is_empty() {
            checks.push(required_states(spec, &contract.required_states));
        }
    }
    let has_entity = spec
        .entity_link
        .as_ref()
        .and_then(|l| l.entity_id.as_deref())
        .is_some_and(|id| !id.is_empty());
    if has_entity && !siblings.is_empty() {
        checks.push(entity_continuity(&spec.prompt.positive, siblings));
    }
    ValidationResult::from_checks(checks)
}

fn background_policy(policy: BackgroundPolicy, scans: &[VariantScan]) -> Check {
    let ok = |p: &VariantScan| match policy {
        BackgroundPolicy::TransparentOnly => p.corners_transparent,
        BackgroundPolicy::WhiteOnly => p.corners_white,
        BackgroundPolicy::WhiteOrTransparent => p.corners_transparent || p.corners_white,
        BackgroundPolicy::Any => true,
    };
    let failing: Vec<&str> = scans
        .iter()
        .filter(|p| !ok(p))
        .map(|p| p.variant_id.as_str())
        .collect();
    let confidence = 1.0 - failing.len() as f64 / scans.len() as f64;
    let reason = if failing.is_empty() {
        format!("all {} variants satisfy {policy:?}", scans.len())
    } else {
        format!("variants {} violate {policy:?}", failing.join(", "))
    };
    Check::new("background_policy", failing.is_empty(), confidence, reason)
}

fn spread(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::MIN, f64::max);
    let min = values.iter().copied().fold(f64::MAX, f64::min);
    if max <= 0.0 { 0.0 } else { (max - min) / max }
}

fn state_alignment(tolerance_px: f64, scans: &[VariantScan]) -> Option<Check> {
    let centers: Vec<(f64, f64)> = scans.iter().filter_map(|p| p.bbox).map(|b| b.center()).collect();
    if centers.len() < 2 {
        return None;
    }
    let n = centers.len() as f64;
    let mean = (
        centers.iter().map(|c| c.0).sum::<f64>() / n,
        centers.iter().map(|c| c.1).sum::<f64>() / n,
    );
    let drift = centers
        .iter()
        .map(|c| ((c.0 - mean.0).powi(2) + (c.1 - mean.1).powi(2)).sqrt())
        .fold(0.0, f64::max);
    let passed = drift <= tolerance_px;
    let confidence = if tolerance_px > 0.0 {
        1.0 - drift / (tolerance_px * 2.0)
    } else if passed {
        1.0
    } else {
        0.0
    };
    Some(Check::new(
        "state_alignment",
        passed,
        confidence,
        format!("max centre drift {drift:.1}px (tolerance {tolerance_px}px)"),
    ))
}

fn silhouette_drift(tolerance: f64, scans: &[VariantScan]) -> Option<Check> {
    if scans.len() < 2 {
        return None;
    }
    let areas: Vec<f64> = scans.iter().map(|p| p.alpha_area).collect();
    let drift = spread(&areas);
    Some(Check::new(
        "silhouette_drift",
        drift <= tolerance,
        1.0 - drift,
        format!("silhouette area spread {:.1}% (tolerance {:.1}%)", drift * 100.0, tolerance * 100.0),
    ))
}

fn perspective_consistency(mode: PerspectiveMode, scans: &[VariantScan]) -> Option<Check> {
    let tolerance = match mode {
        PerspectiveMode::Strict => 0.1,
        PerspectiveMode::AllowMinor => 0.25,
        PerspectiveMode::Any => return None,
    };
    let aspects: Vec<f64> = scans.iter().filter_map(|p| p.bbox).map(|b| b.aspect()).collect();
    if aspects.len() < 2 {
        return None;
    }
    let drift = spread(&aspects);
    Some(Check::new(
        "perspective_consistency",
        drift <= tolerance,
        1.0 - drift,
        format!("aspect ratio spread {:.1}% ({mode:?})", drift * 100.0),
    ))
}

fn required_states(spec: &AssetSpec, states: &[String]) -> Check {
    let kind = spec.output.as_ref().map(|o| o.kind).unwrap_or_default();
    let passed = match kind {
        OutputKind::SingleImage => states.len() <= 1,
        OutputKind::Animation => spec.frame_count() >= states.len(),
        OutputKind::UiStates | OutputKind::LogoSet => true,
    };
    let reason = if passed {
        format!("{} required states fit output kind {kind:?}", states.len())
    } else {
        format!("output kind {kind:?} cannot represent states {}", states.join(", "))
    };
    Check::new("required_states", passed, if passed { 1.0 } else { 0.0 }, reason)
}

fn words(prompt: &str) -> BTreeSet<String> {
    prompt
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(str::to_lowercase)
        .collect()
}

fn entity_continuity(prompt: &str, siblings: &[Sibling]) -> Check {
    let mine = words(prompt);
    let overlaps: Vec<(String, f64)> = siblings
        .iter()
        .map(|s| {
            let theirs = words(&s.positive_prompt);
            let union = mine.union(&theirs).count();
            let shared = mine.intersection(&theirs).count();
            let overlap = if union == 0 { 0.0 } else { shared as f64 / union as f64 };
            (s.spec_id.clone(), overlap)
        })
        .collect();
    let weak: Vec<&str> = overlaps
        .iter()
        .filter(|(_, o)| *o < CONTINUITY_MIN_OVERLAP)
        .map(|(id, _)| id.as_str())
        .collect();
    let mean = overlaps.iter().map(|(_, o)| o).sum::<f64>() / overlaps.len() as f64;
    let reason = if weak.is_empty() {
        format!("prompt overlaps {} sibling specs", overlaps.len())
    } else {
        format!("prompt diverges from siblings {}", weak.join(", "))
    };
    Check::new("entity_continuity", weak.is_empty(), mean, reason)
}

/// Route a scored variant set. Manual review falls back to the decision
/// sprint queue when the project has it turned off.
pub fn decide_route(
    status: ValidatorStatus,
    policy: &RoutingPolicy,
    manual_review_enabled: bool,
) -> RouteDecision {
    let decision = match status {
        ValidatorStatus::Pass => policy.on_pass,
        ValidatorStatus::Warn => policy.on_uncertain,
        ValidatorStatus::Fail => policy.on_fail,
    };
    if decision == RouteDecision::ManualReview && !manual_review_enabled {
        return RouteDecision::QueueDecisionSprint;
    }
    decision
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbaImage;

    fn square(size: u32, offset: u32, side: u32, bg: Rgba<u8>) -> DynamicImage {
        let mut img = RgbaImage::from_pixel(size, size, bg);
        for y in offset..offset + side {
            for x in offset..offset + side {
                img.put_pixel(x, y, Rgba([200, 30, 30, 255]));
            }
        }
        DynamicImage::ImageRgba8(img)
    }

    #[test]
    fn scan_reads_corners_and_bbox() {
        let scan = VariantScan::from_image("v1", &square(16, 4, 8, Rgba([0, 0, 0, 0])));
        assert!(scan.corners_transparent);
        assert!(!scan.corners_white);
        assert_eq!(
            scan.bbox,
            Some(BBox {
                x: 4,
                y: 4,
                width: 8,
                height: 8
            })
        );
        assert!((scan.alpha_area - 0.25).abs() < 1e-9);

        let white = VariantScan::from_image("v2", &square(16, 4, 8, Rgba([255, 255, 255, 255])));
        assert!(white.corners_white);
        assert_eq!(white.bbox.map(|b| b.width), Some(8));
    }

    #[test]
    fn status_thresholds() {
        assert_eq!(ValidatorStatus::from_score(0.85), ValidatorStatus::Pass);
        assert_eq!(ValidatorStatus::from_score(0.84), ValidatorStatus::Warn);
        assert_eq!(ValidatorStatus::from_score(0.65), ValidatorStatus::Warn);
        assert_eq!(ValidatorStatus::from_score(0.5), ValidatorStatus::Fail);
        assert_eq!(ValidationResult::from_checks(Vec::new()).score, 1.0);
    }

    #[test]
    fn manual_review_falls_back_when_disabled() {
        let policy = RoutingPolicy::default();
        assert_eq!(
            decide_route(ValidatorStatus::Fail, &policy, true),
            RouteDecision::ManualReview
        );
        assert_eq!(
            decide_route(ValidatorStatus::Fail, &policy, false),
            RouteDecision::QueueDecisionSprint
        );
        assert_eq!(
            decide_route(ValidatorStatus::Pass, &policy, false),
            RouteDecision::AutoAdvance
        );
    }
}
