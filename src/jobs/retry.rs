//! Effective retry policy and backoff.

use rand::Rng;

use crate::model::job::{BackoffMode, JobType, RetryPolicy};
use crate::model::project::ProjectPolicies;

const MIN_DELAY_MS: f64 = 100.0;

/// Built-in default, then `retry.default`, then `retry.perJobType.<type>`.
pub fn effective_policy(policies: &ProjectPolicies, job_type: JobType) -> RetryPolicy {
    let mut policy = RetryPolicy::default().merged(&policies.retry.default);
    if let Some(patch) = policies.retry.per_job_type.get(job_type.as_str()) {
        policy = policy.merged(patch);
    }
    policy
}

/// Delay before retry number `attempt` (1-based), with jitter.
pub fn compute_backoff_ms(policy: &RetryPolicy, attempt: u32) -> u64 {
    compute_backoff_ms_with(policy, attempt, &mut rand::thread_rng())
}

pub fn compute_backoff_ms_with<R: Rng + ?Sized>(
    policy: &RetryPolicy,
    attempt: u32,
    rng: &mut R,
) -> u64 {
    let base = policy.base_delay_ms as f64;
    let raw = match policy.backoff_mode {
        BackoffMode::Exponential => {
            let exp = attempt.saturating_sub(1).min(52) as i32;
            base * 2f64.powi(exp)
        }
        BackoffMode::Fixed => base,
    };
    let capped = raw.min(policy.max_delay_ms as f64);

    let spread = capped * policy.jitter_pct.clamp(0.0, 1.0);
    let jitter = if spread > 0.0 {
        rng.gen_range(-spread..=spread)
    } else {
        0.0
    };

    (capped + jitter).max(MIN_DELAY_MS).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::job::RetryPolicyPatch;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn exponential_without_jitter_doubles_until_capped() {
        let policy = RetryPolicy {
            base_delay_ms: 1_000,
            max_delay_ms: 5_000,
            jitter_pct: 0.0,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(7);
        let delays: Vec<u64> = (1..=5)
            .map(|a| compute_backoff_ms_with(&policy, a, &mut rng))
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 5_000, 5_000]);
    }

    #[test]
    fn per_type_override_beats_project_default() {
        let mut policies = ProjectPolicies::default();
        policies.retry.default = RetryPolicyPatch {
            max_attempts: Some(4),
            base_delay_ms: Some(500),
            ..Default::default()
        };
        policies.retry.per_job_type.insert(
            "generate".into(),
            RetryPolicyPatch {
                max_attempts: Some(6),
                ..Default::default()
            },
        );

        let generate = effective_policy(&policies, JobType::Generate);
        assert_eq!(generate.max_attempts, 6);
        assert_eq!(generate.base_delay_ms, 500);

        let export = effective_policy(&policies, JobType::Export);
        assert_eq!(export.max_attempts, 4);
    }
}
