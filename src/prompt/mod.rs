//! Layered prompt compilation.
//!
//! A prompt package is assembled from seven ordered layers:
//!
//! 1. `checkpoint_base`: profile base prompts (or legacy checkpoint templates)
//! 2. `checkpoint_asset_type`: per-asset-type additions from the same source
//! 3. `baseline_hints`: baseline profile hints for the asset type
//! 4. `tag_prompt_map`: fragments for the spec's tags, one trace entry per tag
//! 5. `spec_prompt`: the rendered fallback prompt
//! 6. `spec_override`: the spec's own prompt, in `spec_override` mode only
//! 7. `runtime_safety`: safety fragments, always last
//!
//! Compilation is pure. Identical inputs yield a byte-identical package and
//! therefore the same `packageHash`.

pub mod canonical;
pub mod seed;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::profile::{BaselineProfile, Checkpoint, CheckpointProfile, RuntimeSafety};
use crate::model::project::ProjectPolicies;
use crate::model::spec::{AssetSpec, CompileMode, PromptPair, TagOrderMode};

pub use canonical::{canonical_json, sha256_canonical};
pub use seed::{fnv1a32, resolve_seed};

const SPEC_PROMPT_TOKEN: &str = "{specPrompt}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptLayer {
    CheckpointBase,
    CheckpointAssetType,
    BaselineHints,
    TagPromptMap,
    SpecPrompt,
    SpecOverride,
    RuntimeSafety,
}

impl PromptLayer {
    pub fn order(self) -> u32 {
        match self {
            PromptLayer::CheckpointBase => 1,
            PromptLayer::CheckpointAssetType => 2,
            PromptLayer::BaselineHints => 3,
            PromptLayer::TagPromptMap => 4,
            PromptLayer::SpecPrompt => 5,
            PromptLayer::SpecOverride => 6,
            PromptLayer::RuntimeSafety => 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptTraceEntry {
    pub layer: PromptLayer,
    pub source_id: String,
    pub order: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub positive: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptPackage {
    pub compiled: PromptPair,
    pub trace: Vec<PromptTraceEntry>,
    pub package_hash: String,
}

/// Pre-loaded inputs the compiler reads besides the spec.
#[derive(Debug, Clone, Copy)]
pub struct PromptContext<'a> {
    pub policies: &'a ProjectPolicies,
    /// Overrides `policies.checkpointProfiles[checkpointId]` when set.
    pub checkpoint_profile: Option<&'a CheckpointProfile>,
    pub baseline: Option<&'a BaselineProfile>,
}

impl<'a> PromptContext<'a> {
    pub fn new(policies: &'a ProjectPolicies) -> Self {
        Self {
            policies,
            checkpoint_profile: None,
            baseline: None,
        }
    }

    fn profile_for(&self, spec: &AssetSpec) -> Option<&'a CheckpointProfile> {
        self.checkpoint_profile.or_else(|| {
            spec.checkpoint_id
                .as_deref()
                .and_then(|id| self.policies.checkpoint_profiles.get(id))
        })
    }
}

/// Substitute `fallback` into `template`.
///
/// Empty template: the fallback. Template with `{specPrompt}`: the first
/// occurrence is replaced. Otherwise both are joined with `", "`.
pub fn render_template(template: &str, fallback: &str) -> String {
    if template.is_empty() {
        return fallback.to_string();
    }
    if template.contains(SPEC_PROMPT_TOKEN) {
        return template.replacen(SPEC_PROMPT_TOKEN, fallback, 1);
    }
    join_non_empty([template, fallback])
}

fn join_non_empty<'s>(parts: impl IntoIterator<Item = &'s str>) -> String {
    parts
        .into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Legacy template with the `{specPrompt}` slot removed.
fn strip_spec_prompt(template: &str) -> String {
    join_non_empty(
        template
            .replace(SPEC_PROMPT_TOKEN, "")
            .split(',')
            .map(str::trim)
            .collect::<Vec<_>>(),
    )
}

fn entry(
    layer: PromptLayer,
    source_id: &str,
    positive: String,
    negative: String,
) -> Option<PromptTraceEntry> {
    let positive = Some(positive.trim().to_string()).filter(|s| !s.is_empty());
    let negative = Some(negative.trim().to_string()).filter(|s| !s.is_empty());
    if positive.is_none() && negative.is_none() {
        return None;
    }
    Some(PromptTraceEntry {
        layer,
        source_id: source_id.to_string(),
        order: layer.order(),
        positive,
        negative,
    })
}

pub fn compile_prompt_package(
    ctx: &PromptContext<'_>,
    spec: &AssetSpec,
    checkpoint: Option<&Checkpoint>,
    fallback_positive: &str,
    fallback_negative: &str,
) -> Result<PromptPackage> {
    let profile = ctx.profile_for(spec);
    let checkpoint_id = spec
        .checkpoint_id
        .as_deref()
        .or(checkpoint.map(|c| c.id.as_str()))
        .unwrap_or_default();
    let mut trace = Vec::new();

    // 1 + 2: checkpoint layers.
    match (profile, checkpoint) {
        (Some(p), _) => {
            trace.extend(entry(
                PromptLayer::CheckpointBase,
                &p.profile_id,
                p.base_positive.clone(),
                p.base_negative.clone(),
            ));
            if let Some(pair) = p.per_asset_type.get(&spec.asset_type) {
                trace.extend(entry(
                    PromptLayer::CheckpointAssetType,
                    &p.profile_id,
                    pair.positive.clone(),
                    pair.negative.clone(),
                ));
            }
        }
        (None, Some(c)) => {
            let templates = &c.prompt_templates;
            trace.extend(entry(
                PromptLayer::CheckpointBase,
                &c.id,
                strip_spec_prompt(&templates.base_positive),
                strip_spec_prompt(&templates.base_negative),
            ));
            if let Some(pair) = templates.per_asset_type.get(&spec.asset_type) {
                trace.extend(entry(
                    PromptLayer::CheckpointAssetType,
                    &c.id,
                    strip_spec_prompt(&pair.positive),
                    strip_spec_prompt(&pair.negative),
                ));
            }
        }
        (None, None) => {}
    }

    // 3: baseline hints.
    if let Some(baseline) = ctx.baseline {
        if let Some(hints) = baseline.asset_type_profiles.get(&spec.asset_type) {
            trace.extend(entry(
                PromptLayer::BaselineHints,
                &baseline.id,
                join_non_empty(hints.prompt_hints.iter().map(String::as_str)),
                join_non_empty(hints.negative_prompt_hints.iter().map(String::as_str)),
            ));
        }
    }

    // 4: tag fragments.
    if let Some(map) = ctx.policies.tag_prompt_map.get(checkpoint_id) {
        let mut tagged: Vec<(usize, &String, &crate::model::profile::TagFragment)> = spec
            .tags
            .iter()
            .enumerate()
            .filter_map(|(i, tag)| map.get(tag).map(|frag| (i, tag, frag)))
            .collect();

        // A spec without a prompt policy inherits the profile's ordering.
        let spec_policy = spec.prompt_policy.as_ref();
        let mode = spec_policy
            .map(|p| p.tag_order_mode)
            .or_else(|| profile.and_then(|p| p.tag_order_policy))
            .unwrap_or_default();
        match mode {
            TagOrderMode::Explicit => {
                let explicit: &[String] = match spec_policy {
                    Some(p) if !p.tag_order.is_empty() => p.tag_order.as_slice(),
                    _ => profile.map(|p| p.tag_order.as_slice()).unwrap_or_default(),
                };
                tagged.sort_by_key(|(i, tag, _)| {
                    match explicit.iter().position(|t| t == *tag) {
                        Some(pos) => (0, pos),
                        None => (1, *i),
                    }
                });
            }
            TagOrderMode::CheckpointDefault => {
                tagged.sort_by(|a, b| {
                    b.2.weight
                        .total_cmp(&a.2.weight)
                        .then_with(|| a.1.as_bytes().cmp(b.1.as_bytes()))
                });
            }
        }
        for (_, tag, frag) in tagged {
            trace.extend(entry(
                PromptLayer::TagPromptMap,
                tag,
                frag.positive.clone(),
                frag.negative.clone(),
            ));
        }
    }

    // 5: rendered fallback.
    trace.extend(entry(
        PromptLayer::SpecPrompt,
        &spec.id,
        fallback_positive.to_string(),
        fallback_negative.to_string(),
    ));

    // 6: spec override.
    let compile_mode = spec
        .prompt_policy
        .as_ref()
        .map(|p| p.compile_mode)
        .unwrap_or_default();
    if compile_mode == CompileMode::SpecOverride {
        trace.extend(entry(
            PromptLayer::SpecOverride,
            &spec.id,
            spec.prompt.positive.clone(),
            spec.prompt.negative.clone(),
        ));
    }

    // 7: runtime safety.
    let safety: Option<&RuntimeSafety> = profile
        .and_then(|p| p.runtime_safety.as_ref())
        .or(ctx.policies.runtime_safety.as_ref());
    if let Some(safety) = safety.filter(|s| s.enabled) {
        let source = profile
            .map(|p| p.profile_id.as_str())
            .unwrap_or("project");
        trace.extend(entry(
            PromptLayer::RuntimeSafety,
            source,
            join_non_empty(safety.positive.iter().map(String::as_str)),
            join_non_empty(safety.negative.iter().map(String::as_str)),
        ));
    }

    let compiled = PromptPair::new(
        join_non_empty(trace.iter().filter_map(|t| t.positive.as_deref())),
        join_non_empty(trace.iter().filter_map(|t| t.negative.as_deref())),
    );

    #[derive(Serialize)]
    struct Hashed<'a> {
        compiled: &'a PromptPair,
        trace: &'a [PromptTraceEntry],
    }
    let package_hash = sha256_canonical(&Hashed {
        compiled: &compiled,
        trace: &trace,
    })?;

    Ok(PromptPackage {
        compiled,
        trace,
        package_hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_template_variants() {
        assert_eq!(render_template("", "a ship"), "a ship");
        assert_eq!(
            render_template("masterpiece, {specPrompt}", "a ship"),
            "masterpiece, a ship"
        );
        assert_eq!(render_template("masterpiece", "a ship"), "masterpiece, a ship");
        assert_eq!(render_template("masterpiece", ""), "masterpiece");
    }

    #[test]
    fn strip_removes_slot_and_dangling_commas() {
        assert_eq!(
            strip_spec_prompt("masterpiece, best quality, {specPrompt}"),
            "masterpiece, best quality"
        );
        assert_eq!(strip_spec_prompt("{specPrompt}"), "");
    }
}
