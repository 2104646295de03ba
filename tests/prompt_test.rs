//! Seven-layer prompt compilation, seeds, and the checkpoint/baseline gate.

use assetgen::model::lora::{LoraSelectionMode, LoraSelectionPolicy, ReleasePolicy};
use assetgen::model::profile::{BaselineProfile, Checkpoint};
use assetgen::model::project::Project;
use assetgen::model::spec::{AssetSpec, CompileMode, SeedMode, TagOrderMode};
use assetgen::profiles::enforce_checkpoint_compatibility;
use assetgen::prompt::{
    PromptContext, PromptLayer, PromptPackage, compile_prompt_package, fnv1a32, render_template,
    resolve_seed,
};
use assetgen::store::Store;
use assetgen::Error;
use chrono::{TimeZone, Utc};
use serde_json::{Value, json};

fn spec(extra: Value) -> AssetSpec {
    let at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    let mut base = json!({
        "id": "knight",
        "projectId": "p1",
        "title": "Knight",
        "assetType": "character",
        "checkpointId": "ckpt_a",
        "tags": ["armor", "cape", "sword"],
        "prompt": {"positive": "a knight in silver armor", "negative": "modern clothes"},
        "createdAt": at,
        "updatedAt": at,
    });
    if let (Some(base), Some(extra)) = (base.as_object_mut(), extra.as_object()) {
        base.extend(extra.clone());
    }
    serde_json::from_value(base).unwrap()
}

fn project() -> Project {
    serde_json::from_value(json!({
        "id": "p1",
        "policies": {
            "checkpointProfiles": {
                "ckpt_a": {
                    "profileId": "cp_a",
                    "version": 2,
                    "checkpointId": "ckpt_a",
                    "basePositive": "masterpiece, best quality",
                    "baseNegative": "lowres, blurry",
                    "perAssetType": {"character": {"positive": "full body", "negative": "cropped"}},
                    "tagOrder": ["sword", "armor"]
                }
            },
            "tagPromptMap": {
                "ckpt_a": {
                    "armor": {"positive": "plate armor", "weight": 0.5},
                    "cape": {"positive": "red cape", "negative": "torn cape", "weight": 0.9},
                    "sword": {"positive": "longsword", "weight": 0.5}
                }
            },
            "runtimeSafety": {"positive": ["sfw"], "negative": ["nsfw", "gore"]}
        }
    }))
    .unwrap()
}

fn baseline() -> BaselineProfile {
    serde_json::from_value(json!({
        "id": "house",
        "checkpointId": "ckpt_a",
        "assetTypeProfiles": {
            "character": {"promptHints": ["centered", "plain background"], "negativePromptHints": ["text"]}
        }
    }))
    .unwrap()
}

#[test]
fn all_layers_in_order() {
    let project = project();
    let baseline = baseline();
    let spec = spec(json!({"promptPolicy": {"compileMode": "spec_override"}}));
    let ctx = PromptContext {
        baseline: Some(&baseline),
        ..PromptContext::new(&project.policies)
    };

    let package = compile_prompt_package(&ctx, &spec, None, "knight sprite", "").unwrap();
    let layers: Vec<PromptLayer> = package.trace.iter().map(|t| t.layer).collect();
    assert_eq!(
        layers,
        vec![
            PromptLayer::CheckpointBase,
            PromptLayer::CheckpointAssetType,
            PromptLayer::BaselineHints,
            PromptLayer::TagPromptMap,
            PromptLayer::TagPromptMap,
            PromptLayer::TagPromptMap,
            PromptLayer::SpecPrompt,
            PromptLayer::SpecOverride,
            PromptLayer::RuntimeSafety,
        ]
    );
    let orders: Vec<u32> = package.trace.iter().map(|t| t.order).collect();
    assert!(orders.windows(2).all(|w| w[0] <= w[1]));

    // Weight descending, ties by tag name.
    let tags: Vec<&str> = package
        .trace
        .iter()
        .filter(|t| t.layer == PromptLayer::TagPromptMap)
        .map(|t| t.source_id.as_str())
        .collect();
    assert_eq!(tags, vec!["cape", "armor", "sword"]);

    assert_eq!(
        package.compiled.positive,
        "masterpiece, best quality, full body, centered, plain background, red cape, \
         plate armor, longsword, knight sprite, a knight in silver armor, sfw"
    );
    assert_eq!(
        package.compiled.negative,
        "lowres, blurry, cropped, text, torn cape, modern clothes, nsfw, gore"
    );
    assert!(package.compiled.positive.ends_with("sfw"));
    assert_eq!(package.trace.last().unwrap().source_id, "cp_a");
}

#[test]
fn default_mode_skips_override_and_empty_layers() {
    let project = project();
    let spec = spec(json!({}));
    let package = compile_prompt_package(
        &PromptContext::new(&project.policies),
        &spec,
        None,
        "",
        "",
    )
    .unwrap();
    assert!(
        package
            .trace
            .iter()
            .all(|t| !matches!(t.layer, PromptLayer::SpecOverride | PromptLayer::SpecPrompt))
    );
    assert!(!package.trace.iter().any(|t| t.layer == PromptLayer::BaselineHints));
}

#[test]
fn explicit_tag_order_uses_profile_order() {
    let project = project();
    let spec = spec(json!({"promptPolicy": {"tagOrderMode": "explicit"}}));
    let package = compile_prompt_package(
        &PromptContext::new(&project.policies),
        &spec,
        None,
        "",
        "",
    )
    .unwrap();
    let tags: Vec<&str> = package
        .trace
        .iter()
        .filter(|t| t.layer == PromptLayer::TagPromptMap)
        .map(|t| t.source_id.as_str())
        .collect();
    // Listed tags first in list order, the rest in spec order.
    assert_eq!(tags, vec!["sword", "armor", "cape"]);
}

fn tag_layer_sources(package: &PromptPackage) -> Vec<&str> {
    package
        .trace
        .iter()
        .filter(|t| t.layer == PromptLayer::TagPromptMap)
        .map(|t| t.source_id.as_str())
        .collect()
}

#[test]
fn profile_tag_order_policy_applies_without_spec_policy() {
    let mut project = project();
    if let Some(profile) = project.policies.checkpoint_profiles.get_mut("ckpt_a") {
        profile.tag_order_policy = Some(TagOrderMode::Explicit);
    }
    let ctx = PromptContext::new(&project.policies);

    let package = compile_prompt_package(&ctx, &spec(json!({})), None, "", "").unwrap();
    assert_eq!(tag_layer_sources(&package), vec!["sword", "armor", "cape"]);

    // A spec policy still wins over the profile.
    let spec = spec(json!({"promptPolicy": {"tagOrderMode": "checkpoint_default"}}));
    let package = compile_prompt_package(&ctx, &spec, None, "", "").unwrap();
    assert_eq!(tag_layer_sources(&package), vec!["cape", "armor", "sword"]);
}

#[test]
fn unknown_policy_modes_fall_back_to_defaults() {
    let spec = spec(json!({
        "promptPolicy": {"compileMode": "whatever", "tagOrderMode": "weight"},
        "seedPolicy": {"mode": "lucky"}
    }));
    let policy = spec.prompt_policy.as_ref().unwrap();
    assert_eq!(policy.compile_mode, CompileMode::CheckpointProfileDefault);
    assert_eq!(policy.tag_order_mode, TagOrderMode::CheckpointDefault);
    assert_eq!(spec.seed_policy.as_ref().unwrap().mode, SeedMode::RandomRecorded);

    let lora: LoraSelectionPolicy =
        serde_json::from_value(json!({"mode": "sideways", "releasePolicy": "newest"})).unwrap();
    assert_eq!(lora.mode, LoraSelectionMode::BaselineThenProject);
    assert_eq!(lora.release_policy, ReleasePolicy::ActiveOrLatestApproved);

    let explicit: TagOrderMode = serde_json::from_value(json!("explicit")).unwrap();
    assert_eq!(explicit, TagOrderMode::Explicit);
}

#[test]
fn legacy_checkpoint_templates_drop_spec_prompt_slot() {
    let project = Project {
        id: "p1".into(),
        ..Default::default()
    };
    let checkpoint: Checkpoint = serde_json::from_value(json!({
        "id": "ckpt_a",
        "promptTemplates": {
            "basePositive": "pixel art, {specPrompt}",
            "perAssetType": {"character": {"positive": "{specPrompt}, idle pose"}}
        }
    }))
    .unwrap();
    let spec = spec(json!({}));
    let package = compile_prompt_package(
        &PromptContext::new(&project.policies),
        &spec,
        Some(&checkpoint),
        "knight",
        "",
    )
    .unwrap();
    assert_eq!(package.compiled.positive, "pixel art, idle pose, knight");
    assert_eq!(package.trace[0].source_id, "ckpt_a");
}

#[test]
fn compilation_is_deterministic() {
    let project = project();
    let baseline = baseline();
    let spec = spec(json!({"promptPolicy": {"compileMode": "spec_override"}}));
    let ctx = PromptContext {
        baseline: Some(&baseline),
        ..PromptContext::new(&project.policies)
    };
    let first = compile_prompt_package(&ctx, &spec, None, "knight", "bad").unwrap();
    assert_eq!(first.package_hash.len(), 64);
    for _ in 0..100 {
        let again = compile_prompt_package(&ctx, &spec, None, "knight", "bad").unwrap();
        assert_eq!(again, first);
    }

    let other = compile_prompt_package(&ctx, &spec, None, "knight", "worse").unwrap();
    assert_ne!(other.package_hash, first.package_hash);
}

#[test]
fn template_rendering() {
    assert_eq!(render_template("{specPrompt}, crisp", "hero"), "hero, crisp");
    assert_eq!(render_template("", "hero"), "hero");
}

#[test]
fn seeds_follow_policy() {
    let random = spec(json!({}));
    assert_eq!(resolve_seed(&random, 42), 42);

    let fixed = spec(json!({"seedPolicy": {"mode": "fixed", "baseSeed": 7}}));
    assert_eq!(resolve_seed(&fixed, 42), 7);

    let derived = spec(json!({"seedPolicy": {"mode": "derived"}}));
    let expected = u64::from(fnv1a32("knight|character|ckpt_a"));
    assert_eq!(resolve_seed(&derived, 1), expected);
    assert_eq!(resolve_seed(&derived, 2), expected);
}

#[tokio::test]
async fn compatibility_gate_is_stable() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path());
    let house = baseline();
    store
        .write(&store.record_path("p1", "baseline-profiles", "house"), &house)
        .await
        .unwrap();
    let mut project = project();
    project.policies.checkpoint_baseline_map = serde_json::from_value(json!({
        "ckpt_a": {"allowedBaselineProfileIds": ["house"]},
        "ckpt_b": {"allowedBaselineProfileIds": ["other"]}
    }))
    .unwrap();

    for _ in 0..100 {
        enforce_checkpoint_compatibility(&store, &project, Some("ckpt_a"), Some("house"))
            .await
            .unwrap();
        let bound = enforce_checkpoint_compatibility(&store, &project, Some("ckpt_b"), Some("house"))
            .await
            .unwrap_err();
        assert!(matches!(bound, Error::Compatibility(ref m) if m.contains("bound to checkpoint ckpt_a")));
    }

    let missing = enforce_checkpoint_compatibility(&store, &project, Some("ckpt_a"), Some("ghost"))
        .await
        .unwrap_err();
    assert!(matches!(missing, Error::Compatibility(_)));
    enforce_checkpoint_compatibility(&store, &project, None, Some("ghost"))
        .await
        .unwrap();
}
