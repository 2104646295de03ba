//! LoRA selection for generate jobs.
//!
//! Explicit picks (the spec's and the job input's `loraIds`, plus entries
//! in `input.loras`) always win. Remaining slots up to
//! `maxActiveLoras` are filled from the project and shared pools in the
//! order the selection mode dictates.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::model::JsonMap;
use crate::model::lora::{
    LoraRecord, LoraRelease, LoraScope, LoraSelectionMode, LoraSelectionPolicy, ReleasePolicy,
    ReleaseStatus, ResolvedLora,
};
use crate::model::project::Project;
use crate::model::spec::AssetSpec;
use crate::store::Store;

/// Summary merged into the job input as `loraSelection`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoraSelection {
    pub mode: LoraSelectionMode,
    pub release_policy: ReleasePolicy,
    pub prefer_recommended: bool,
    pub max_active_loras: usize,
    pub checkpoint_name: Option<String>,
    pub asset_type: Option<String>,
    pub explicit_count: usize,
    pub resolved_count: usize,
    pub resolved_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LoraResolution {
    pub loras: Vec<ResolvedLora>,
    pub selection: LoraSelection,
    /// Explicitly requested ids that could not be bound to a release.
    pub unsatisfied: Vec<String>,
}

impl LoraResolution {
    /// Merge `loras` (when any) and `loraSelection` into a job input.
    pub fn apply_to(&self, input: &mut JsonMap) -> Result<()> {
        if !self.loras.is_empty() {
            input.insert("loras".into(), serde_json::to_value(&self.loras)?);
        }
        let mut selection = input
            .get("loraSelection")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        if let Value::Object(resolved) = serde_json::to_value(&self.selection)? {
            selection.extend(resolved);
        }
        input.insert("loraSelection".into(), Value::Object(selection));
        Ok(())
    }
}

pub async fn list_project_loras(store: &Store, project_id: &str) -> Result<Vec<LoraRecord>> {
    store.list(&store.collection_dir(project_id, "loras")).await
}

pub async fn list_shared_loras(store: &Store) -> Result<Vec<LoraRecord>> {
    store.list(&store.shared_dir("loras")).await
}

/// Project LoRA first, then shared.
pub async fn find_lora(store: &Store, project_id: &str, lora_id: &str) -> Result<Option<LoraRecord>> {
    if let Some(record) = store
        .read(&store.record_path(project_id, "loras", lora_id))
        .await?
    {
        return Ok(Some(record));
    }
    store
        .read(&store.shared_dir("loras").join(format!("{lora_id}.json")))
        .await
}

/// Hinted release, then the active one, then (unless `active_only`) the
/// newest approved.
pub fn pick_release<'a>(
    record: &'a LoraRecord,
    policy: &LoraSelectionPolicy,
    hint: Option<&str>,
) -> Option<&'a LoraRelease> {
    if let Some(hinted) = hint.and_then(|id| record.release(id)) {
        return Some(hinted);
    }
    if let Some(active) = record.active_release_id.as_deref().and_then(|id| record.release(id)) {
        return Some(active);
    }
    if policy.release_policy == ReleasePolicy::ActiveOnly {
        return None;
    }
    record
        .releases
        .iter()
        .filter(|r| r.status == ReleaseStatus::Approved)
        .max_by(|a, b| a.created_at.cmp(&b.created_at))
}

fn sort_pool(mut pool: Vec<LoraRecord>, prefer_recommended: bool) -> Vec<LoraRecord> {
    pool.sort_by(|a, b| {
        let by_recommended = if prefer_recommended {
            b.recommended.cmp(&a.recommended)
        } else {
            std::cmp::Ordering::Equal
        };
        by_recommended.then_with(|| b.updated_at.cmp(&a.updated_at))
    });
    pool
}

fn from_release(record: &LoraRecord, release: &LoraRelease) -> ResolvedLora {
    let strength = record.default_strength();
    ResolvedLora {
        lora_id: Some(record.id.clone()),
        release_id: Some(release.id.clone()),
        lora_name: release.weight_path().unwrap_or_else(|| record.id.clone()),
        strength_model: strength,
        strength_clip: strength,
    }
}

fn non_empty_str<'v>(map: &'v JsonMap, key: &str) -> Option<&'v str> {
    map.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn number(map: &JsonMap, keys: &[&str]) -> Option<f64> {
    keys.iter()
        .find_map(|k| map.get(*k).filter(|v| !v.is_null()))
        .and_then(Value::as_f64)
}

/// Resolve the LoRA set for a generate job on `spec`.
pub async fn resolve_loras(
    store: &Store,
    project: &Project,
    spec: &AssetSpec,
    input: &JsonMap,
) -> Result<LoraResolution> {
    let policy = &project.policies.lora_selection;
    let checkpoint_id = non_empty_str(input, "checkpointName")
        .map(str::to_string)
        .or_else(|| spec.checkpoint_id.clone())
        .unwrap_or_default();
    let asset_type = spec.asset_type.clone();

    let project_pool = list_project_loras(store, &project.id).await?;
    let shared_pool = list_shared_loras(store).await?;
    let by_id: HashMap<&str, &LoraRecord> = project_pool
        .iter()
        .chain(shared_pool.iter())
        .rev()
        .map(|r| (r.id.as_str(), r))
        .collect();

    let mut explicit_ids: BTreeSet<String> = spec.lora_ids.iter().cloned().collect();
    explicit_ids.extend(string_list(input.get("loraIds")));

    let mut explicit: Vec<ResolvedLora> = Vec::new();
    let entries = input
        .get("loras")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_object).collect::<Vec<_>>())
        .unwrap_or_default();

    for entry in entries {
        if let Some(lora_id) = non_empty_str(entry, "loraId") {
            explicit_ids.insert(lora_id.to_string());
            let hint = non_empty_str(entry, "releaseId");
            let record = by_id.get(lora_id).copied();
            let release = record.and_then(|r| pick_release(r, policy, hint));
            let default_strength = record
                .map(LoraRecord::default_strength)
                .unwrap_or(LoraScope::Project.default_strength());
            let lora_name = non_empty_str(entry, "loraName")
                .map(|n| n.replace('\\', "/"))
                .or_else(|| release.and_then(LoraRelease::weight_path))
                .unwrap_or_else(|| lora_id.to_string());
            let strength_model =
                number(entry, &["strengthModel", "weight"]).unwrap_or(default_strength);
            explicit.push(ResolvedLora {
                lora_id: Some(lora_id.to_string()),
                release_id: release
                    .map(|r| r.id.clone())
                    .or_else(|| hint.map(str::to_string)),
                lora_name,
                strength_model,
                strength_clip: number(entry, &["strengthClip"]).unwrap_or(strength_model),
            });
            continue;
        }
        let Some(lora_name) = non_empty_str(entry, "loraName") else {
            continue;
        };
        let strength_model = number(entry, &["strengthModel", "weight"]).unwrap_or(1.0);
        explicit.push(ResolvedLora {
            lora_id: None,
            release_id: None,
            lora_name: lora_name.replace('\\', "/"),
            strength_model,
            strength_clip: number(entry, &["strengthClip"]).unwrap_or(strength_model),
        });
    }

    let mut unsatisfied = Vec::new();
    for id in &explicit_ids {
        let already = explicit
            .iter()
            .any(|item| item.lora_id.as_deref() == Some(id.as_str()));
        let record = by_id.get(id.as_str()).copied();
        if already {
            if record.is_none() {
                unsatisfied.push(id.clone());
            }
            continue;
        }
        let release = record
            .filter(|r| r.is_compatible(&checkpoint_id, &asset_type))
            .and_then(|r| pick_release(r, policy, None).map(|rel| (r, rel)));
        match release {
            Some((record, release)) => explicit.push(from_release(record, release)),
            None => unsatisfied.push(id.clone()),
        }
    }

    let compatible = |pool: Vec<LoraRecord>| -> Vec<LoraRecord> {
        sort_pool(pool, policy.prefer_recommended)
            .into_iter()
            .filter(|r| r.is_compatible(&checkpoint_id, &asset_type))
            .collect()
    };
    let project_candidates = compatible(project_pool.clone());
    let baseline_candidates = compatible(shared_pool.clone());
    let ordered: Vec<LoraRecord> = match policy.mode {
        LoraSelectionMode::BaselineThenProject => {
            [baseline_candidates, project_candidates].concat()
        }
        LoraSelectionMode::ProjectThenBaseline => {
            [project_candidates, baseline_candidates].concat()
        }
        LoraSelectionMode::BaselineOnly => baseline_candidates,
        LoraSelectionMode::ProjectOnly => project_candidates,
        LoraSelectionMode::Manual => Vec::new(),
    };

    let explicit_resolved: HashSet<&str> = explicit
        .iter()
        .filter_map(|item| item.lora_id.as_deref())
        .collect();
    let from_policy: Vec<ResolvedLora> = ordered
        .iter()
        .filter(|r| !explicit_resolved.contains(r.id.as_str()))
        .filter_map(|r| pick_release(r, policy, None).map(|rel| from_release(r, rel)))
        .collect();

    let allowed = policy.max_active_loras.saturating_sub(explicit.len());
    let explicit_count = explicit.len();
    let mut seen = HashSet::new();
    let loras: Vec<ResolvedLora> = explicit
        .into_iter()
        .chain(from_policy.into_iter().take(allowed))
        .filter(|item| {
            seen.insert(format!(
                "{}|{}|{}",
                item.lora_id.as_deref().unwrap_or_default(),
                item.release_id.as_deref().unwrap_or_default(),
                item.lora_name
            ))
        })
        .collect();

    let selection = LoraSelection {
        mode: policy.mode,
        release_policy: policy.release_policy,
        prefer_recommended: policy.prefer_recommended,
        max_active_loras: policy.max_active_loras,
        checkpoint_name: Some(checkpoint_id).filter(|s| !s.is_empty()),
        asset_type: Some(asset_type).filter(|s| !s.is_empty()),
        explicit_count,
        resolved_count: loras.len(),
        resolved_at: Utc::now(),
    };

    Ok(LoraResolution {
        loras,
        selection,
        unsatisfied,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> LoraRecord {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn release_pick_order() {
        let lora = record(json!({
            "id": "l1",
            "scope": "project",
            "releases": [
                {"id": "r1", "status": "approved", "createdAt": "2025-01-01T00:00:00Z"},
                {"id": "r2", "status": "approved", "createdAt": "2025-03-01T00:00:00Z"},
                {"id": "r3", "status": "candidate", "createdAt": "2025-04-01T00:00:00Z"}
            ]
        }));
        let policy = LoraSelectionPolicy::default();
        assert_eq!(pick_release(&lora, &policy, Some("r3")).unwrap().id, "r3");
        assert_eq!(pick_release(&lora, &policy, Some("nope")).unwrap().id, "r2");

        let active_only = LoraSelectionPolicy {
            release_policy: ReleasePolicy::ActiveOnly,
            ..Default::default()
        };
        assert!(pick_release(&lora, &active_only, None).is_none());
    }

    #[test]
    fn recommended_sorts_first() {
        let pool = vec![
            record(json!({"id": "a", "scope": "project", "updatedAt": "2025-05-01T00:00:00Z"})),
            record(json!({"id": "b", "scope": "project", "recommended": true, "updatedAt": "2025-01-01T00:00:00Z"})),
        ];
        let sorted = sort_pool(pool.clone(), true);
        assert_eq!(sorted[0].id, "b");
        let sorted = sort_pool(pool, false);
        assert_eq!(sorted[0].id, "a");
    }
}
