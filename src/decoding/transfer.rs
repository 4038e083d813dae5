//! Transfer policies
//!
//! A transfer policy decides which masked positions receive a concrete token
//! on the current step. `origin` resolves every position independently with
//! the schedule's transfer probability; `transition_K` and `maskgit_plus`
//! resolve a scheduled number of positions, picked by confidence.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;
use rand::Rng;

use crate::error::{GenerationError, Result};

use super::sampler::{sample_tokens, SamplingParams};
use super::schedule::{transition_transfer_count, Timesteps};

/// The three transfer algorithms, parsed from the `alg` config string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferAlgorithm {
    /// Per-position Bernoulli transfer with probability `1 - s/t`
    Origin,
    /// One position per step until `threshold`, then a linear ramp
    Transition { threshold: usize },
    /// Exactly one position per step
    MaskGitPlus,
}

impl FromStr for TransferAlgorithm {
    type Err = GenerationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "origin" => Ok(Self::Origin),
            "maskgit_plus" => Ok(Self::MaskGitPlus),
            _ => s
                .strip_prefix("transition_")
                .and_then(|k| k.parse().ok())
                .map(|threshold| Self::Transition { threshold })
                .ok_or_else(|| GenerationError::UnknownAlgorithm(s.to_string())),
        }
    }
}

impl fmt::Display for TransferAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Origin => write!(f, "origin"),
            Self::Transition { threshold } => write!(f, "transition_{}", threshold),
            Self::MaskGitPlus => write!(f, "maskgit_plus"),
        }
    }
}

impl TransferAlgorithm {
    /// Positions to resolve at `step`, clamped to what is still masked
    ///
    /// `None` for `origin`, whose count is decided per position.
    pub fn transfer_count(
        &self,
        step: usize,
        steps: usize,
        masked_seq_len: usize,
        currently_masked: usize,
    ) -> Option<usize> {
        let count = match *self {
            Self::Origin => return None,
            Self::Transition { threshold } => transition_transfer_count(
                step,
                steps,
                threshold,
                masked_seq_len,
                currently_masked,
            ),
            Self::MaskGitPlus => 1,
        };
        Some(count.clamp(0, currently_masked as i64) as usize)
    }
}

/// A masked position receiving a concrete token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub position: usize,
    pub token: u32,
}

/// Inputs shared by every policy for one denoising step
pub struct TransferStep<'a> {
    pub step: usize,
    pub timesteps: &'a Timesteps,
    /// Masks present when decoding started
    pub masked_seq_len: usize,
    /// Positions currently holding the mask token
    pub mask_positions: &'a [usize],
    /// Logits for `mask_positions`, `[mask_positions.len(), vocab]`
    pub mask_logits: &'a Tensor,
}

/// A transfer algorithm plus its selection temperature
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferPolicy {
    pub algorithm: TransferAlgorithm,
    /// Unset or 0 selects the top-N by confidence; otherwise positions are
    /// drawn from `softmax(confidence / alg_temp)` without replacement
    pub alg_temp: Option<f32>,
}

impl TransferPolicy {
    pub fn new(algorithm: TransferAlgorithm) -> Self {
        Self {
            algorithm,
            alg_temp: None,
        }
    }

    /// Choose the positions resolved this step and their tokens
    pub fn select_transfers<R: Rng + ?Sized>(
        &self,
        ctx: &TransferStep<'_>,
        sampling: &SamplingParams,
        rng: &mut R,
    ) -> Result<Vec<Transfer>> {
        if ctx.mask_positions.is_empty() {
            return Ok(Vec::new());
        }

        match self.algorithm {
            TransferAlgorithm::Origin => self.select_origin(ctx, sampling, rng),
            _ => {
                let (confidence, candidates) = sample_tokens(ctx.mask_logits, sampling, rng)?;
                let count = self
                    .algorithm
                    .transfer_count(
                        ctx.step,
                        ctx.timesteps.steps(),
                        ctx.masked_seq_len,
                        ctx.mask_positions.len(),
                    )
                    .unwrap_or(0);

                let chosen = match self.alg_temp {
                    Some(alg_temp) if alg_temp > 0.0 => {
                        sample_by_confidence(&confidence, alg_temp, count, rng)
                    }
                    _ => top_n_by_confidence(&confidence, count),
                };

                Ok(chosen
                    .into_iter()
                    .map(|idx| Transfer {
                        position: ctx.mask_positions[idx],
                        token: candidates[idx],
                    })
                    .collect())
            }
        }
    }

    fn select_origin<R: Rng + ?Sized>(
        &self,
        ctx: &TransferStep<'_>,
        sampling: &SamplingParams,
        rng: &mut R,
    ) -> Result<Vec<Transfer>> {
        let p_transfer = ctx.timesteps.transfer_probability(ctx.step);
        let chosen: Vec<u32> = (0..ctx.mask_positions.len() as u32)
            .filter(|_| rng.gen::<f64>() < p_transfer)
            .collect();
        if chosen.is_empty() {
            return Ok(Vec::new());
        }

        // Only the rows that transfer are sampled.
        let rows = Tensor::from_vec(chosen.clone(), (chosen.len(),), ctx.mask_logits.device())?;
        let chosen_logits = ctx.mask_logits.index_select(&rows, 0)?;
        let (_, tokens) = sample_tokens(&chosen_logits, sampling, rng)?;

        Ok(chosen
            .iter()
            .zip(tokens)
            .map(|(&idx, token)| Transfer {
                position: ctx.mask_positions[idx as usize],
                token,
            })
            .collect())
    }
}

/// Indices of the `n` highest confidences (earlier index wins ties)
pub fn top_n_by_confidence(confidence: &[f32], n: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..confidence.len()).collect();
    order.sort_by(|&a, &b| {
        confidence[b]
            .partial_cmp(&confidence[a])
            .unwrap_or(Ordering::Equal)
    });
    order.truncate(n);
    order
}

/// Draw `n` distinct indices with probability `softmax(confidence / alg_temp)`
///
/// Gumbel-top-k: perturbing each scaled confidence with Gumbel noise and
/// keeping the `n` largest keys is sampling without replacement from the
/// softmax distribution.
pub fn sample_by_confidence<R: Rng + ?Sized>(
    confidence: &[f32],
    alg_temp: f32,
    n: usize,
    rng: &mut R,
) -> Vec<usize> {
    let keys: Vec<f32> = confidence
        .iter()
        .map(|&c| {
            let u = rng.gen::<f64>().max(f64::MIN_POSITIVE);
            let gumbel = -(-u.ln()).ln();
            (c as f64 / alg_temp as f64 + gumbel) as f32
        })
        .collect();
    top_n_by_confidence(&keys, n)
}
