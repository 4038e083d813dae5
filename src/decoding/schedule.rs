//! Timestep schedule and per-step transfer counts

use crate::TIMESTEP_FLOOR;

use super::transfer::TransferAlgorithm;

/// `steps + 1` timesteps, linearly spaced from 1 down to [`TIMESTEP_FLOOR`]
#[derive(Debug, Clone)]
pub struct Timesteps {
    values: Vec<f64>,
}

impl Timesteps {
    pub fn linear(steps: usize) -> Self {
        let values = (0..=steps)
            .map(|j| {
                if j == 0 {
                    1.0
                } else if j == steps {
                    TIMESTEP_FLOOR
                } else {
                    1.0 + (TIMESTEP_FLOOR - 1.0) * j as f64 / steps as f64
                }
            })
            .collect();
        Self { values }
    }

    /// Number of denoising steps covered by the schedule
    pub fn steps(&self) -> usize {
        self.values.len() - 1
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// (t, s): the current and next timestep of `step`
    pub fn interval(&self, step: usize) -> (f64, f64) {
        (self.values[step], self.values[step + 1])
    }

    /// Probability that a masked position is resolved at `step` (origin policy)
    ///
    /// The last step always resolves everything that is left.
    pub fn transfer_probability(&self, step: usize) -> f64 {
        if step + 1 >= self.steps() {
            return 1.0;
        }
        let (t, s) = self.interval(step);
        1.0 - s / t
    }
}

/// Scheduled number of positions for `transition_K` at `step`
///
/// One position per step before the threshold; afterwards the cumulative
/// resolved count follows the line through (K, K) and (steps, masked_seq_len).
/// The result may be zero or negative when the schedule is already ahead.
pub fn transition_transfer_count(
    step: usize,
    steps: usize,
    threshold: usize,
    masked_seq_len: usize,
    currently_masked: usize,
) -> i64 {
    if step < threshold || steps <= threshold {
        return 1;
    }
    let (i, steps, k, total) = (
        step as i64,
        steps as i64,
        threshold as i64,
        masked_seq_len as i64,
    );
    let denoised = (((total - k) * (i + 1) + k * (steps - total)) as f64 / (steps - k) as f64) as i64;
    let already_denoised = total - currently_masked as i64;
    denoised - already_denoised
}

/// One row of a [`TransferPlan`]
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedStep {
    pub step: usize,
    pub t: f64,
    pub s: f64,
    /// Per-position transfer probability (origin only)
    pub transfer_probability: Option<f64>,
    /// Positions resolved this step; an expectation for origin
    pub transfers: f64,
    /// Masks left after this step
    pub remaining: f64,
}

/// The step-by-step schedule an algorithm follows when no eos shortcut fires
#[derive(Debug, Clone)]
pub struct TransferPlan {
    pub algorithm: TransferAlgorithm,
    pub masked_seq_len: usize,
    pub steps: Vec<PlannedStep>,
}

impl TransferPlan {
    pub fn new(algorithm: TransferAlgorithm, steps: usize, masked_seq_len: usize) -> Self {
        let timesteps = Timesteps::linear(steps);
        let mut remaining = masked_seq_len as f64;
        let mut planned = Vec::with_capacity(steps);

        for step in 0..steps {
            let (t, s) = timesteps.interval(step);
            let (transfer_probability, transfers) = match algorithm {
                TransferAlgorithm::Origin => {
                    let p = timesteps.transfer_probability(step);
                    (Some(p), remaining * p)
                }
                _ => {
                    let currently_masked = remaining as usize;
                    let count = algorithm
                        .transfer_count(step, steps, masked_seq_len, currently_masked)
                        .unwrap_or(0);
                    (None, count as f64)
                }
            };
            remaining -= transfers;
            planned.push(PlannedStep {
                step,
                t,
                s,
                transfer_probability,
                transfers,
                remaining,
            });
        }

        Self {
            algorithm,
            masked_seq_len,
            steps: planned,
        }
    }

    /// Masks expected to remain once the step budget is spent
    pub fn remaining(&self) -> f64 {
        self.steps
            .last()
            .map(|s| s.remaining)
            .unwrap_or(self.masked_seq_len as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timesteps_are_monotonic() {
        let timesteps = Timesteps::linear(8);
        let values = timesteps.values();
        assert_eq!(values.len(), 9);
        assert_eq!(values[0], 1.0);
        assert_eq!(values[8], TIMESTEP_FLOOR);
        assert!(values.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn test_transfer_probability() {
        let timesteps = Timesteps::linear(4);
        // t = 1.0, s ~ 0.75
        assert!((timesteps.transfer_probability(0) - 0.25).abs() < 1e-9);
        // t ~ 0.5, s ~ 0.25
        assert!((timesteps.transfer_probability(2) - 0.5).abs() < 1e-9);
        assert_eq!(timesteps.transfer_probability(3), 1.0);

        // A single step resolves everything at once.
        assert_eq!(Timesteps::linear(1).transfer_probability(0), 1.0);
    }

    #[test]
    fn test_transition_count_before_threshold() {
        for step in 0..4 {
            assert_eq!(transition_transfer_count(step, 16, 4, 32, 32 - step), 1);
        }
    }

    #[test]
    fn test_transition_count_after_threshold() {
        // steps = 10, K = 2, 20 masks: the line passes (2, 2) and (10, 20)
        // denoised(i) = (18 * (i + 1) + 2 * (10 - 20)) / 8
        // i = 2: (54 - 20) / 8 = 4.25 -> 4, two already resolved -> 2 more
        assert_eq!(transition_transfer_count(2, 10, 2, 20, 18), 2);
        // i = 9: (180 - 20) / 8 = 20 -> everything left
        assert_eq!(transition_transfer_count(9, 10, 2, 20, 5), 5);
    }

    #[test]
    fn test_transition_count_truncates_toward_zero() {
        // (0 * 4 + 3 * (4 - 3)) / 1 = 3 with K = 3, steps = 4, 3 masks
        assert_eq!(transition_transfer_count(3, 4, 3, 3, 1), 1);
        // (-2 * 5 + 4 * (8 - 2)) / 4 = 3.5 -> 3
        assert_eq!(transition_transfer_count(4, 8, 4, 2, 2), 3);
    }

    #[test]
    fn test_plan_resolves_everything() {
        let plan = TransferPlan::new(TransferAlgorithm::Transition { threshold: 2 }, 10, 20);
        assert_eq!(plan.steps.len(), 10);
        assert_eq!(plan.steps[0].transfers, 1.0);
        assert_eq!(plan.steps[1].transfers, 1.0);
        assert_eq!(plan.remaining(), 0.0);

        let origin = TransferPlan::new(TransferAlgorithm::Origin, 5, 10);
        assert_eq!(origin.steps[4].transfer_probability, Some(1.0));
        assert!(origin.remaining().abs() < 1e-9);
    }

    #[test]
    fn test_maskgit_plan_is_one_per_step() {
        let plan = TransferPlan::new(TransferAlgorithm::MaskGitPlus, 6, 4);
        let transfers: Vec<f64> = plan.steps.iter().map(|s| s.transfers).collect();
        assert_eq!(transfers, vec![1.0, 1.0, 1.0, 1.0, 0.0, 0.0]);
    }
}
