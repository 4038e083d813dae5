//! Token sampling for diffusion decoding
//!
//! Turns per-position logits into a candidate token and a confidence score.
//! Filtering (top-p, top-k) runs on CPU rows; softmax, max and argmax use
//! Candle ops.

use std::cmp::Ordering;

use candle_core::{DType, Tensor, D};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

use crate::error::Result;

/// Sampling parameters for the token sampler
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SamplingParams {
    /// Temperature for softmax (0 = arg-max)
    pub temperature: f32,
    /// Top-p (nucleus) threshold, ignored when unset or >= 1
    pub top_p: Option<f32>,
    /// Keep only the k highest logits
    pub top_k: Option<usize>,
}

impl SamplingParams {
    pub fn greedy() -> Self {
        Self::default()
    }

    pub fn is_stochastic(&self) -> bool {
        self.temperature > 0.0
    }
}

/// Indices of `row` ordered by value, highest first (stable on ties)
fn descending_order(row: &[f32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..row.len()).collect();
    order.sort_by(|&a, &b| row[b].partial_cmp(&row[a]).unwrap_or(Ordering::Equal));
    order
}

fn softmax_row(row: &[f32]) -> Vec<f32> {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = row.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

fn argmax_row(row: &[f32]) -> (f32, u32) {
    row.iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(Ordering::Equal))
        .map(|(i, &p)| (p, i as u32))
        .unwrap_or((0.0, 0))
}

/// Nucleus filtering on a single row of logits
///
/// A token is removed once the cumulative probability of the tokens ranked
/// above it exceeds `top_p`, so the token crossing the threshold is kept and
/// the top-1 token always survives.
pub fn filter_top_p(row: &mut [f32], top_p: f32) {
    let order = descending_order(row);
    let sorted: Vec<f32> = order.iter().map(|&i| row[i]).collect();
    let probs = softmax_row(&sorted);

    let mut cumulative = 0.0f32;
    for (rank, &idx) in order.iter().enumerate() {
        if rank > 0 && cumulative > top_p {
            row[idx] = f32::MIN;
        }
        cumulative += probs[rank];
    }
}

/// Keep only the `top_k` highest logits of a single row
pub fn filter_top_k(row: &mut [f32], top_k: usize) {
    let top_k = top_k.min(row.len());
    for &idx in descending_order(row).iter().skip(top_k) {
        row[idx] = f32::MIN;
    }
}

fn filter_rows(logits: &Tensor, filter: impl Fn(&mut [f32])) -> Result<Tensor> {
    let mut rows: Vec<Vec<f32>> = logits.to_dtype(DType::F32)?.to_vec2()?;
    for row in rows.iter_mut() {
        filter(row.as_mut_slice());
    }
    let shape = logits.shape().clone();
    let flat: Vec<f32> = rows.into_iter().flatten().collect();
    Ok(Tensor::from_vec(flat, shape, logits.device())?)
}

/// Apply top-p filtering to `[rows, vocab]` logits
pub fn top_p_logits(logits: &Tensor, top_p: f32) -> Result<Tensor> {
    filter_rows(logits, |row| filter_top_p(row, top_p))
}

/// Apply top-k filtering to `[rows, vocab]` logits
pub fn top_k_logits(logits: &Tensor, top_k: usize) -> Result<Tensor> {
    filter_rows(logits, |row| filter_top_k(row, top_k))
}

/// Sample one token per row of `[rows, vocab]` logits
///
/// # Returns
/// (confidences, tokens) where the confidence is the probability of the
/// chosen token
pub fn sample_tokens<R: Rng + ?Sized>(
    logits: &Tensor,
    params: &SamplingParams,
    rng: &mut R,
) -> Result<(Vec<f32>, Vec<u32>)> {
    let (rows, _vocab) = logits.dims2()?;
    if rows == 0 {
        return Ok((Vec::new(), Vec::new()));
    }

    let mut logits = logits.to_dtype(DType::F32)?;
    if params.is_stochastic() {
        logits = (logits / params.temperature as f64)?;
    }
    if let Some(top_p) = params.top_p {
        if top_p < 1.0 {
            logits = top_p_logits(&logits, top_p)?;
        }
    }
    if let Some(top_k) = params.top_k {
        logits = top_k_logits(&logits, top_k)?;
    }

    let probs = candle_nn::ops::softmax(&logits, D::Minus1)?;

    if params.is_stochastic() {
        let probs: Vec<Vec<f32>> = probs.to_vec2()?;
        let mut confidences = Vec::with_capacity(rows);
        let mut tokens = Vec::with_capacity(rows);
        for row in &probs {
            let (confidence, token) = match WeightedIndex::new(row) {
                Ok(dist) => {
                    let idx = dist.sample(rng);
                    (row[idx], idx as u32)
                }
                // Degenerate distribution: fall back to the most likely token
                Err(_) => argmax_row(row),
            };
            confidences.push(confidence);
            tokens.push(token);
        }
        Ok((confidences, tokens))
    } else {
        let confidences: Vec<f32> = probs.max(D::Minus1)?.to_vec1()?;
        let tokens: Vec<u32> = probs.argmax(D::Minus1)?.to_vec1()?;
        Ok((confidences, tokens))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn kept(row: &[f32]) -> Vec<usize> {
        row.iter()
            .enumerate()
            .filter(|(_, &x)| x > f32::MIN)
            .map(|(i, _)| i)
            .collect()
    }

    #[test]
    fn test_top_p_keeps_minimal_prefix() {
        // probs ~ [0.5, 0.25, 0.125, 0.125] after softmax of log-probs
        let base = [0.5f32.ln(), 0.25f32.ln(), 0.125f32.ln(), 0.125f32.ln()];

        let mut row = base;
        filter_top_p(&mut row, 0.6);
        assert_eq!(kept(&row), vec![0, 1]);

        let mut row = base;
        filter_top_p(&mut row, 0.8);
        assert_eq!(kept(&row), vec![0, 1, 2]);

        // Threshold below the top-1 mass still keeps the top token.
        let mut row = base;
        filter_top_p(&mut row, 0.1);
        assert_eq!(kept(&row), vec![0]);
    }

    #[test]
    fn test_top_p_unsorted_input() {
        let mut row = [0.125f32.ln(), 0.5f32.ln(), 0.125f32.ln(), 0.25f32.ln()];
        filter_top_p(&mut row, 0.6);
        assert_eq!(kept(&row), vec![1, 3]);
    }

    #[test]
    fn test_top_k_keeps_exactly_k() {
        let base = [0.3f32, 2.0, -1.0, 1.5, 0.9];

        let mut row = base;
        filter_top_k(&mut row, 2);
        assert_eq!(kept(&row), vec![1, 3]);

        // k larger than the vocabulary keeps everything
        let mut row = base;
        filter_top_k(&mut row, 50);
        assert_eq!(kept(&row).len(), base.len());

        // ties do not let extra tokens through
        let mut row = [1.0f32, 1.0, 1.0, 0.0];
        filter_top_k(&mut row, 2);
        assert_eq!(kept(&row).len(), 2);
    }

    #[test]
    fn test_greedy_sampling() -> Result<()> {
        let logits = Tensor::from_vec(
            vec![0.0f32, 3.0, 1.0, 5.0, 0.0, 0.0],
            (2, 3),
            &Device::Cpu,
        )?;
        let mut rng = StdRng::seed_from_u64(0);
        let (confidences, tokens) = sample_tokens(&logits, &SamplingParams::greedy(), &mut rng)?;

        assert_eq!(tokens, vec![1, 0]);
        let e = std::f32::consts::E;
        let expected = e.powi(3) / (1.0 + e.powi(3) + e);
        assert!((confidences[0] - expected).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_stochastic_sampling_respects_top_k() -> Result<()> {
        let logits = Tensor::from_vec(vec![1.0f32, 0.9, 0.8, 5.0], (1, 4), &Device::Cpu)?;
        let params = SamplingParams {
            temperature: 1.0,
            top_p: None,
            top_k: Some(1),
        };
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let (confidences, tokens) = sample_tokens(&logits, &params, &mut rng)?;
            assert_eq!(tokens, vec![3]);
            assert!((confidences[0] - 1.0).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_stochastic_sampling_is_reproducible() -> Result<()> {
        let logits = Tensor::from_vec(
            vec![0.1f32, 0.2, 0.3, 0.4, 0.4, 0.3, 0.2, 0.1],
            (2, 4),
            &Device::Cpu,
        )?;
        let params = SamplingParams {
            temperature: 0.7,
            top_p: Some(0.95),
            top_k: None,
        };
        let a = sample_tokens(&logits, &params, &mut StdRng::seed_from_u64(42))?;
        let b = sample_tokens(&logits, &params, &mut StdRng::seed_from_u64(42))?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn test_nan_logits_fall_back_to_argmax() -> Result<()> {
        let logits = Tensor::from_vec(vec![f32::NAN, 1.0, 2.0], (1, 3), &Device::Cpu)?;
        let params = SamplingParams {
            temperature: 1.0,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(1);
        let (confidences, tokens) = sample_tokens(&logits, &params, &mut rng)?;
        assert_eq!(confidences.len(), 1);
        assert_eq!(tokens.len(), 1);
        Ok(())
    }

    #[test]
    fn test_empty_rows() -> Result<()> {
        let logits = Tensor::zeros((0, 5), DType::F32, &Device::Cpu)?;
        let (confidences, tokens) =
            sample_tokens(&logits, &SamplingParams::greedy(), &mut StdRng::seed_from_u64(0))?;
        assert!(confidences.is_empty());
        assert!(tokens.is_empty());
        Ok(())
    }
}
