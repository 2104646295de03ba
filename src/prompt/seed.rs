//! Seed resolution.

use crate::model::spec::{AssetSpec, SeedMode};

const FNV_OFFSET: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

const DEFAULT_FIELDS: [&str; 3] = ["specId", "assetType", "checkpointId"];

/// 32-bit FNV-1a.
pub fn fnv1a32(input: &str) -> u32 {
    input.bytes().fold(FNV_OFFSET, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Seed for a render of `spec`. `fallback` is used for random modes and
/// for a fixed policy without a base seed.
pub fn resolve_seed(spec: &AssetSpec, fallback: u64) -> u64 {
    let Some(ref policy) = spec.seed_policy else {
        return fallback;
    };
    match policy.mode {
        SeedMode::Fixed => policy.base_seed.unwrap_or(fallback),
        SeedMode::Derived => {
            let fields: Vec<&str> = if policy.derive_from.is_empty() {
                DEFAULT_FIELDS.to_vec()
            } else {
                policy.derive_from.iter().map(String::as_str).collect()
            };
            let joined = fields
                .iter()
                .map(|f| field_value(spec, f))
                .collect::<Vec<_>>()
                .join("|");
            u64::from(fnv1a32(&joined))
        }
        SeedMode::RandomRecorded => fallback,
    }
}

fn field_value<'a>(spec: &'a AssetSpec, field: &str) -> &'a str {
    match field {
        "specId" => &spec.id,
        "assetType" => &spec.asset_type,
        "title" => &spec.title,
        "checkpointId" => spec.checkpoint_id.as_deref().unwrap_or_default(),
        "baselineProfileId" => spec.baseline_profile_id.as_deref().unwrap_or_default(),
        "entityId" => spec
            .entity_link
            .as_ref()
            .and_then(|l| l.entity_id.as_deref())
            .unwrap_or_default(),
        _ => "",
    }
}
