//! Improvement runs: measure an intervention on a cohort of specs, then
//! promote it only if quality did not regress.

use chrono::Utc;
use serde_json::{Value, json};
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::events::EventLog;
use crate::model::asset::{Asset, VersionStatus};
use crate::model::eval::{
    ImprovementRun, ImprovementStatus, MetricSnapshot, Promotion, PromotionStatus,
};
use crate::model::event::{EventType, NewEvent};
use crate::store::Store;

const COLLECTION: &str = "improvement-runs";

/// Largest first-pass approval drop a promotion tolerates.
pub const MAX_APPROVAL_DROP: f64 = 0.05;

/// Relative change in first-pass approval, in percent. Zero when there is
/// no baseline to compare against.
pub fn quality_lift_pct(before: f64, after: f64) -> f64 {
    if before > 0.0 {
        (after - before) / before * 100.0
    } else {
        0.0
    }
}

/// Refuse promotion when the run regressed.
pub fn check_promotion_gate(run: &ImprovementRun) -> Result<()> {
    if run.status != ImprovementStatus::Completed {
        return Err(Error::Gate(format!(
            "Cannot promote run in '{}' status; must be 'completed'",
            run.status.as_str()
        )));
    }
    if !matches!(
        run.promotion.status,
        PromotionStatus::Pending | PromotionStatus::Deferred
    ) {
        return Err(Error::Gate(format!(
            "Run already has promotion decision '{}'",
            run.promotion.status.as_str()
        )));
    }
    let (Some(before), Some(after)) = (&run.before, &run.after) else {
        return Ok(());
    };
    let lift = quality_lift_pct(before.first_pass_approval_rate, after.first_pass_approval_rate);
    if lift < 0.0 {
        return Err(Error::Gate(format!(
            "Quality gate failed: qualityLiftPct is {lift:.1}% (must be >= 0 to promote). \
             Consider rolling back instead."
        )));
    }
    let delta = after.first_pass_approval_rate - before.first_pass_approval_rate;
    if delta < -MAX_APPROVAL_DROP {
        return Err(Error::Gate(format!(
            "Quality gate failed: first-pass approval rate dropped by {:.1}%. \
             Promotion blocked; consider rolling back.",
            delta * 100.0
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ImprovementService {
    store: Store,
    events: EventLog,
}

impl ImprovementService {
    pub fn new(store: Store, events: EventLog) -> Self {
        Self { store, events }
    }

    pub async fn get(&self, project_id: &str, run_id: &str) -> Result<Option<ImprovementRun>> {
        self.store
            .read(&self.store.record_path(project_id, COLLECTION, run_id))
            .await
    }

    async fn require(&self, project_id: &str, run_id: &str) -> Result<ImprovementRun> {
        self.get(project_id, run_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("improvement run {run_id}")))
    }

    pub async fn list(&self, project_id: &str) -> Result<Vec<ImprovementRun>> {
        let mut runs: Vec<ImprovementRun> = self
            .store
            .list(&self.store.collection_dir(project_id, COLLECTION))
            .await?;
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }

    async fn save(&self, run: &ImprovementRun) -> Result<()> {
        self.store
            .write(
                &self.store.record_path(&run.project_id, COLLECTION, &run.id),
                run,
            )
            .await
    }

    pub async fn create(
        &self,
        project_id: &str,
        name: &str,
        cohort_spec_ids: Vec<String>,
    ) -> Result<ImprovementRun> {
        let now = Utc::now();
        let run = ImprovementRun {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            name: name.to_string(),
            description: None,
            status: ImprovementStatus::Draft,
            cohort_spec_ids,
            promotion: Promotion::default(),
            before: None,
            after: None,
            created_at: now,
            updated_at: now,
        };
        self.save(&run).await?;
        Ok(run)
    }

    /// Sample the cohort and move the run to `running`.
    pub async fn start(&self, project_id: &str, run_id: &str) -> Result<ImprovementRun> {
        let mut run = self.require(project_id, run_id).await?;
        if run.status != ImprovementStatus::Draft {
            return Err(Error::Gate(format!(
                "Cannot start run in '{}' status",
                run.status.as_str()
            )));
        }
        run.before = Some(self.sample(project_id, &run.cohort_spec_ids).await?);
        run.status = ImprovementStatus::Running;
        run.updated_at = Utc::now();
        self.save(&run).await?;
        Ok(run)
    }

    /// Sample the cohort again and move the run to `completed`.
    pub async fn complete(&self, project_id: &str, run_id: &str) -> Result<ImprovementRun> {
        let mut run = self.require(project_id, run_id).await?;
        if run.status != ImprovementStatus::Running {
            return Err(Error::Gate(format!(
                "Cannot complete run in '{}' status",
                run.status.as_str()
            )));
        }
        run.after = Some(self.sample(project_id, &run.cohort_spec_ids).await?);
        run.status = ImprovementStatus::Completed;
        run.updated_at = Utc::now();
        self.save(&run).await?;
        Ok(run)
    }

    pub async fn promote(&self, project_id: &str, run_id: &str) -> Result<ImprovementRun> {
        let mut run = self.require(project_id, run_id).await?;
        check_promotion_gate(&run)?;

        let now = Utc::now();
        run.promotion = Promotion {
            status: PromotionStatus::Promoted,
            decided_at: Some(now),
        };
        run.updated_at = now;
        self.save(&run).await?;

        let lift = match (&run.before, &run.after) {
            (Some(b), Some(a)) => Some(quality_lift_pct(
                b.first_pass_approval_rate,
                a.first_pass_approval_rate,
            )),
            _ => None,
        };
        info!(project_id, run_id, ?lift, "improvement run promoted");
        self.emit(
            &run,
            EventType::ImprovementRunPromoted,
            json!({ "promotionDecision": "promoted", "qualityLiftPct": lift }),
        )
        .await?;
        Ok(run)
    }

    pub async fn rollback(&self, project_id: &str, run_id: &str) -> Result<ImprovementRun> {
        let mut run = self.require(project_id, run_id).await?;
        match run.status {
            ImprovementStatus::Draft => {
                return Err(Error::Gate(
                    "Cannot rollback a draft run that was never started".into(),
                ));
            }
            ImprovementStatus::RolledBack => {
                return Err(Error::Gate("Run is already rolled back".into()));
            }
            _ => {}
        }
        let now = Utc::now();
        run.status = ImprovementStatus::RolledBack;
        run.promotion = Promotion {
            status: PromotionStatus::RolledBack,
            decided_at: Some(now),
        };
        run.updated_at = now;
        self.save(&run).await?;
        self.emit(
            &run,
            EventType::ImprovementRunRolledBack,
            json!({ "promotionDecision": "rolled_back" }),
        )
        .await?;
        Ok(run)
    }

    async fn emit(&self, run: &ImprovementRun, event_type: EventType, payload: Value) -> Result<()> {
        let key = format!("improvement_run:{}:{}", run.id, event_type);
        self.events
            .append(
                &run.project_id,
                NewEvent::new(event_type, "improvement_run", run.id.clone())
                    .payload(payload)
                    .idempotency_key(key),
            )
            .await?;
        Ok(())
    }

    /// Approval and validator rates over the latest version of each
    /// cohort asset.
    pub async fn sample(&self, project_id: &str, spec_ids: &[String]) -> Result<MetricSnapshot> {
        let assets: Vec<Asset> = self
            .store
            .list(&self.store.collection_dir(project_id, "assets"))
            .await?;
        let mut snapshot = MetricSnapshot::default();
        let mut validated = 0u64;
        let mut passed = 0u64;
        let mut score_sum = 0.0;

        for asset in assets
            .iter()
            .filter(|a| spec_ids.is_empty() || spec_ids.contains(&a.spec_id))
        {
            snapshot.total_assets += 1;
            let Some(latest) = asset.versions.last() else {
                continue;
            };
            match latest.status {
                VersionStatus::Approved => snapshot.approved_count += 1,
                VersionStatus::Rejected => snapshot.rejected_count += 1,
                _ => {}
            }
            if let Some(validation) = latest.generation.get("validation") {
                validated += 1;
                if validation.get("status").and_then(Value::as_str) == Some("pass") {
                    passed += 1;
                }
                score_sum += validation.get("score").and_then(Value::as_f64).unwrap_or(0.0);
            }
        }

        if snapshot.total_assets > 0 {
            snapshot.first_pass_approval_rate =
                snapshot.approved_count as f64 / snapshot.total_assets as f64;
        }
        if validated > 0 {
            snapshot.validator_pass_rate = Some(passed as f64 / validated as f64);
            snapshot.avg_validator_score = Some(score_sum / validated as f64);
        }
        snapshot.sampled_at = Some(Utc::now());
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lift_is_zero_without_baseline() {
        assert_eq!(quality_lift_pct(0.0, 0.7), 0.0);
        assert!((quality_lift_pct(0.5, 0.6) - 20.0).abs() < 1e-9);
        assert!(quality_lift_pct(0.5, 0.4) < 0.0);
    }
}
