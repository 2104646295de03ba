//! Variant scans, contract checks, and routing.

use assetgen::model::profile::{RouteDecision, RoutingPolicy};
use assetgen::model::spec::AssetSpec;
use assetgen::validator::{
    BBox, Sibling, ValidatorStatus, VariantScan, decide_route, validate,
};
use chrono::Utc;
use image::{DynamicImage, Rgba, RgbaImage};
use serde_json::{Value, json};

const RED: Rgba<u8> = Rgba([200, 30, 30, 255]);

/// 64x64 canvas filled with `background`, with a `size` square at `(x, y)`.
fn canvas(background: Rgba<u8>, x: u32, y: u32, w: u32, h: u32) -> DynamicImage {
    let mut img = RgbaImage::from_pixel(64, 64, background);
    for px in x..x + w {
        for py in y..y + h {
            img.put_pixel(px, py, RED);
        }
    }
    DynamicImage::ImageRgba8(img)
}

fn transparent(x: u32, y: u32) -> DynamicImage {
    canvas(Rgba([0, 0, 0, 0]), x, y, 16, 16)
}

fn white(x: u32, y: u32) -> DynamicImage {
    canvas(Rgba([255, 255, 255, 255]), x, y, 16, 16)
}

fn spec(extra: Value) -> AssetSpec {
    let mut base = json!({
        "id": "knight",
        "projectId": "p1",
        "title": "Knight",
        "assetType": "character",
        "createdAt": Utc::now(),
        "updatedAt": Utc::now(),
    });
    if let (Some(base), Some(extra)) = (base.as_object_mut(), extra.as_object()) {
        base.extend(extra.clone());
    }
    serde_json::from_value(base).unwrap()
}

#[test]
fn scan_finds_foreground_on_either_background() {
    let scan = VariantScan::from_image("v1", &transparent(8, 8));
    assert!(scan.corners_transparent);
    assert!(!scan.corners_white);
    assert_eq!(
        scan.bbox,
        Some(BBox {
            x: 8,
            y: 8,
            width: 16,
            height: 16
        })
    );
    assert!((scan.alpha_area - 256.0 / 4096.0).abs() < 1e-9);

    let scan = VariantScan::from_image("v2", &white(40, 0));
    assert!(scan.corners_white);
    assert_eq!(scan.bbox.map(|b| (b.x, b.y)), Some((40, 0)));
}

#[test]
fn scan_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("v1.png");
    transparent(0, 0).save(&path).unwrap();
    let scan = VariantScan::from_path("v1", &path).unwrap();
    assert_eq!((scan.width, scan.height), (64, 64));
    assert!(!scan.corners_transparent); // top-left corner is foreground
}

#[test]
fn spec_without_contract_passes() {
    let result = validate(&spec(json!({})), &[], &[]);
    assert!(result.checks.is_empty());
    assert_eq!(result.score, 1.0);
    assert_eq!(result.status, ValidatorStatus::Pass);
}

#[test]
fn consistent_set_passes_every_check() {
    let spec = spec(json!({"qualityContract": {
        "backgroundPolicy": "white_or_transparent",
        "alignmentTolerancePx": 4.0,
        "silhouetteDriftTolerance": 0.2,
        "perspectiveMode": "strict",
        "requiredStates": ["idle"]
    }}));
    let scans = vec![
        VariantScan::from_image("v1", &transparent(24, 24)),
        VariantScan::from_image("v2", &white(25, 24)),
    ];
    let result = validate(&spec, &scans, &[]);
    let ids: Vec<&str> = result.checks.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(
        ids,
        vec![
            "background_policy",
            "state_alignment",
            "silhouette_drift",
            "perspective_consistency",
            "required_states"
        ]
    );
    assert!(result.checks.iter().all(|c| c.passed), "{:?}", result.checks);
    assert_eq!(result.status, ValidatorStatus::Pass);
}

#[test]
fn misaligned_variant_warns() {
    let spec = spec(json!({"qualityContract": {
        "backgroundPolicy": "transparent_only",
        "alignmentTolerancePx": 4.0,
        "silhouetteDriftTolerance": 0.2,
        "perspectiveMode": "allow_minor",
        "requiredStates": ["idle"]
    }}));
    let scans = vec![
        VariantScan::from_image("v1", &transparent(8, 8)),
        VariantScan::from_image("v2", &transparent(40, 40)),
    ];
    let result = validate(&spec, &scans, &[]);
    let failed: Vec<&str> = result
        .checks
        .iter()
        .filter(|c| !c.passed)
        .map(|c| c.id.as_str())
        .collect();
    assert_eq!(failed, vec!["state_alignment"]);
    assert!((result.score - 0.8).abs() < 1e-9);
    assert_eq!(result.status, ValidatorStatus::Warn);
}

#[test]
fn wrong_background_fails() {
    let spec = spec(json!({"qualityContract": {"backgroundPolicy": "transparent_only"}}));
    let scans = vec![
        VariantScan::from_image("v1", &transparent(8, 8)),
        VariantScan::from_image("v2", &white(8, 8)),
    ];
    let result = validate(&spec, &scans, &[]);
    assert_eq!(result.checks.len(), 1);
    assert!(!result.checks[0].passed);
    assert!(result.checks[0].reason.contains("v2"));
    assert!((result.checks[0].confidence - 0.5).abs() < 1e-9);
    assert_eq!(result.status, ValidatorStatus::Fail);
}

#[test]
fn animation_needs_a_frame_per_state() {
    let spec = spec(json!({
        "output": {"kind": "animation", "animation": {"frameCount": 2}},
        "qualityContract": {"requiredStates": ["idle", "walk", "attack"]}
    }));
    let result = validate(&spec, &[], &[]);
    assert_eq!(result.checks[0].id, "required_states");
    assert!(!result.checks[0].passed);
}

#[test]
fn entity_continuity_compares_sibling_prompts() {
    let spec = spec(json!({
        "entityLink": {"entityId": "hero"},
        "prompt": {"positive": "brave knight, silver armor"}
    }));
    let close = Sibling {
        spec_id: "knight_run".into(),
        positive_prompt: "brave knight in silver armor running".into(),
    };
    let far = Sibling {
        spec_id: "slime".into(),
        positive_prompt: "tiny blue slime monster".into(),
    };

    let result = validate(&spec, &[], std::slice::from_ref(&close));
    assert!(result.checks[0].passed);

    let result = validate(&spec, &[], &[close, far]);
    let check = &result.checks[0];
    assert_eq!(check.id, "entity_continuity");
    assert!(!check.passed);
    assert!(check.reason.contains("slime"));
}

#[test]
fn routing_follows_policy() {
    let policy = RoutingPolicy::default();
    assert_eq!(
        decide_route(ValidatorStatus::Pass, &policy, true),
        RouteDecision::AutoAdvance
    );
    assert_eq!(
        decide_route(ValidatorStatus::Warn, &policy, true),
        RouteDecision::QueueDecisionSprint
    );
    assert_eq!(
        decide_route(ValidatorStatus::Fail, &policy, true),
        RouteDecision::ManualReview
    );
    assert_eq!(
        decide_route(ValidatorStatus::Fail, &policy, false),
        RouteDecision::QueueDecisionSprint
    );

    let strict = RoutingPolicy {
        on_fail: RouteDecision::Reject,
        ..RoutingPolicy::default()
    };
    assert_eq!(
        decide_route(ValidatorStatus::Fail, &strict, false),
        RouteDecision::Reject
    );
}
