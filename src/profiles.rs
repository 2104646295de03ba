//! Project, checkpoint and baseline profile lookups, plus the
//! checkpoint/baseline compatibility gate applied to specs and generate
//! jobs.

use crate::error::{Error, Result};
use crate::model::profile::{BaselineProfile, Checkpoint, CheckpointProfile};
use crate::model::project::Project;
use crate::model::spec::AssetSpec;
use crate::store::Store;

/// `project.json`, or an empty-policy project when none was written.
pub async fn load_project(store: &Store, project_id: &str) -> Result<Project> {
    let path = store.project_dir(project_id).join("project.json");
    Ok(store.read(&path).await?.unwrap_or_else(|| Project {
        id: project_id.to_string(),
        ..Default::default()
    }))
}

/// `baseline-profiles/<id>.json`, falling back to a single legacy
/// `baseline-profile.json` whose id matches.
pub async fn get_baseline(
    store: &Store,
    project_id: &str,
    baseline_id: &str,
) -> Result<Option<BaselineProfile>> {
    let scoped = store.record_path(project_id, "baseline-profiles", baseline_id);
    if let Some(profile) = store.read::<BaselineProfile>(&scoped).await? {
        return Ok(Some(profile));
    }
    let legacy = store.project_dir(project_id).join("baseline-profile.json");
    Ok(store
        .read::<BaselineProfile>(&legacy)
        .await?
        .filter(|p| p.id == baseline_id))
}

pub async fn get_checkpoint(
    store: &Store,
    project_id: &str,
    checkpoint_id: &str,
) -> Result<Option<Checkpoint>> {
    store
        .read(&store.record_path(project_id, "checkpoints", checkpoint_id))
        .await
}

/// Checkpoint profile for a spec: inlined project policy first, then a
/// stored `checkpoint-profiles/<profileId>.json` bound to the same
/// checkpoint.
pub async fn get_checkpoint_profile(
    store: &Store,
    project: &Project,
    spec: &AssetSpec,
) -> Result<Option<CheckpointProfile>> {
    let Some(checkpoint_id) = spec.checkpoint_id.as_deref() else {
        return Ok(None);
    };
    if let Some(inline) = project.policies.checkpoint_profiles.get(checkpoint_id) {
        return Ok(Some(inline.clone()));
    }
    let Some(profile_id) = spec.checkpoint_profile_id.as_deref() else {
        return Ok(None);
    };
    let path = store.record_path(&project.id, "checkpoint-profiles", profile_id);
    Ok(store
        .read::<CheckpointProfile>(&path)
        .await?
        .filter(|p| p.checkpoint_id == checkpoint_id))
}

/// `(profileId, version)` from `policies.checkpointProfiles[checkpoint]`.
pub fn derive_checkpoint_profile(project: &Project, checkpoint_id: &str) -> Option<(String, u32)> {
    let profile = project.policies.checkpoint_profiles.get(checkpoint_id)?;
    if profile.profile_id.trim().is_empty() {
        return None;
    }
    Some((profile.profile_id.clone(), profile.version.max(1)))
}

/// Refuse a checkpoint/baseline pairing that the baseline or project
/// policy forbids. A no-op unless both ids are present.
pub async fn enforce_checkpoint_compatibility(
    store: &Store,
    project: &Project,
    checkpoint_id: Option<&str>,
    baseline_id: Option<&str>,
) -> Result<()> {
    let (Some(checkpoint_id), Some(baseline_id)) = (
        checkpoint_id.filter(|s| !s.is_empty()),
        baseline_id.filter(|s| !s.is_empty()),
    ) else {
        return Ok(());
    };

    let baseline = get_baseline(store, &project.id, baseline_id)
        .await?
        .ok_or_else(|| {
            Error::Compatibility(format!("Baseline profile not found: {baseline_id}"))
        })?;

    if let Some(bound) = baseline.checkpoint_id.as_deref().filter(|s| !s.is_empty()) {
        if bound != checkpoint_id {
            return Err(Error::Compatibility(format!(
                "Baseline profile {baseline_id} is bound to checkpoint {bound}, not {checkpoint_id}"
            )));
        }
    }

    if let Some(binding) = project.policies.checkpoint_baseline_map.get(checkpoint_id) {
        let allowed = binding.allowed();
        if !allowed.is_empty() && !allowed.iter().any(|id| id == baseline_id) {
            return Err(Error::Compatibility(format!(
                "Baseline profile {baseline_id} is not allowed for checkpoint {checkpoint_id} by project policy"
            )));
        }
    }
    Ok(())
}
