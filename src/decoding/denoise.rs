//! Diffusion decode loop
//!
//! Runs a fixed budget of denoising steps over a single sequence. Each step
//! calls the model once on the full buffer, samples candidates for the masked
//! positions and lets the transfer policy commit some of them.
//!
//! ## Logit alignment
//!
//! The model's row `j` predicts the token after position `j`. Logits are
//! shifted right by one before sampling so that row `j` scores position `j`:
//! - Model rows:   [r0, r1, r2, r3]
//! - Shifted rows: [r0, r0, r1, r2]
//!
//! ## Early advance
//!
//! Once an eos token appears, every later position is forced to eos. Masks
//! settled that way need no model call, so the step counter advances by one
//! extra step per settled mask. This only holds for a single sequence.
//! The skip can use up the budget while masks remain before the eos; those
//! positions are returned as mask tokens.

use candle_core::{DType, Tensor};
use rand::Rng;

use crate::attention::{padding_row, AttentionLayout};
use crate::config::DecodePlan;
use crate::error::{GenerationError, Result};
use crate::model::DenoisingModel;

use super::schedule::Timesteps;
use super::state::SequenceState;
use super::transfer::TransferStep;

/// Per-step callbacks for steering or inspecting a decode
pub trait StepHooks {
    /// Rewrite the aligned logits `[1, seq_len, vocab]` before sampling
    fn on_logits(&mut self, _step: usize, _tokens: &[u32], logits: Tensor) -> Result<Tensor> {
        Ok(logits)
    }

    /// Inspect or edit the buffer after a step's transfers
    ///
    /// Also called once before the first step with `step = None`.
    fn on_tokens(
        &mut self,
        _step: Option<usize>,
        _tokens: &mut [u32],
        _logits: Option<&Tensor>,
    ) -> Result<()> {
        Ok(())
    }
}

/// Hooks that change nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl StepHooks for NoopHooks {}

/// Result of decoding one sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedSequence {
    /// Final buffer, `max_length` tokens, prompt included
    pub tokens: Vec<u32>,
    /// Buffer after every executed step, when requested
    pub history: Option<Vec<Vec<u32>>>,
    /// Value of the step counter when the loop ended
    pub num_steps: usize,
}

impl DecodedSequence {
    /// Tokens after the prompt
    pub fn generated(&self, prompt_len: usize) -> &[u32] {
        &self.tokens[prompt_len.min(self.tokens.len())..]
    }
}

/// Align logits with the positions they fill: `[r0, r0, r1, ..., r(n-2)]`
pub fn shift_logits_right(logits: &Tensor) -> Result<Tensor> {
    let seq_len = logits.dim(1)?;
    if seq_len < 2 {
        return Ok(logits.clone());
    }
    let first = logits.narrow(1, 0, 1)?;
    let previous = logits.narrow(1, 0, seq_len - 1)?;
    Ok(Tensor::cat(&[&first, &previous], 1)?)
}

/// Single-sequence diffusion decoder
pub struct DiffusionDecoder<'a, M: ?Sized> {
    model: &'a M,
    plan: &'a DecodePlan,
}

impl<'a, M: DenoisingModel + ?Sized> DiffusionDecoder<'a, M> {
    pub fn new(model: &'a M, plan: &'a DecodePlan) -> Self {
        Self { model, plan }
    }

    pub fn plan(&self) -> &DecodePlan {
        self.plan
    }

    /// Decode one prompt
    ///
    /// # Arguments
    /// * `input_ids` - Prompt `[1, prompt_len]`
    /// * `attention_mask` - Optional padding mask `[1, prompt_len]`
    /// * `rng` - Random source for every stochastic choice
    /// * `hooks` - Per-step callbacks
    pub fn denoise<R, H>(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        rng: &mut R,
        hooks: &mut H,
    ) -> Result<DecodedSequence>
    where
        R: Rng + ?Sized,
        H: StepHooks + ?Sized,
    {
        let plan = self.plan;
        let (batch_size, _prompt_len) = input_ids.dims2()?;
        if batch_size != 1 {
            return Err(GenerationError::BatchSize(batch_size));
        }

        // Prompt padding, if any
        let valid = match attention_mask {
            Some(mask) => {
                if mask.dims() != input_ids.dims() {
                    return Err(GenerationError::AttentionMaskShape {
                        mask: mask.dims().to_vec(),
                        input: input_ids.dims().to_vec(),
                    });
                }
                Some(padding_row(mask)?)
            }
            None => None,
        };

        // Build the buffer: prompt followed by masks
        let device = self.model.device();
        let prompt: Vec<u32> = input_ids.squeeze(0)?.to_dtype(DType::U32)?.to_vec1()?;
        let mut state = SequenceState::new(&prompt, plan.max_length, plan.tokens.mask_token_id)?;
        let layout = AttentionLayout::for_sequence(valid.as_deref(), plan.max_length, device)?;
        let timesteps = Timesteps::linear(plan.steps);

        let masked_seq_len = state.masked_count();
        hooks.on_tokens(None, state.tokens_mut(), None)?;

        tracing::debug!(
            "Denoising {} masks over {} steps with {} (max_length={})",
            masked_seq_len,
            plan.steps,
            plan.policy.algorithm,
            plan.max_length
        );

        let mut history = plan.output_history.then(Vec::new);
        let mut step = 0;

        while step < plan.steps {
            // Stop once nothing is left to resolve
            let mask_positions = state.mask_positions();
            if mask_positions.is_empty() {
                tracing::debug!("All positions resolved after {} steps", step);
                break;
            }

            // Forward pass
            let input = state.to_tensor(device)?;
            let logits = self
                .model
                .forward(&input, &layout.mask, layout.position_ids.as_ref())?;
            let logits = shift_logits_right(&logits)?;
            let logits = hooks.on_logits(step, state.tokens(), logits)?;

            // Gather logits of masked positions
            let rows = Tensor::from_vec(
                mask_positions.iter().map(|&p| p as u32).collect::<Vec<_>>(),
                (mask_positions.len(),),
                logits.device(),
            )?;
            let mask_logits = logits.squeeze(0)?.index_select(&rows, 0)?;

            // Commit transfers
            let ctx = TransferStep {
                step,
                timesteps: &timesteps,
                masked_seq_len,
                mask_positions: &mask_positions,
                mask_logits: &mask_logits,
            };
            let transfers = plan.policy.select_transfers(&ctx, &plan.sampling, rng)?;
            let resolved = state.apply(&transfers);

            hooks.on_tokens(Some(step), state.tokens_mut(), Some(&logits))?;

            // Everything after the first eos becomes eos
            let settled = state.fill_after_eos(plan.tokens.eos_token_id);
            tracing::trace!(
                "step {}: resolved {}, settled {} by eos, {} masks left",
                step,
                resolved,
                settled,
                state.masked_count()
            );
            if settled > 0 {
                tracing::debug!("eos at step {} settles {} masks, skipping ahead", step, settled);
            }
            step += 1 + settled;

            if let Some(history) = history.as_mut() {
                history.push(state.tokens().to_vec());
            }
        }

        Ok(DecodedSequence {
            tokens: state.into_tokens(),
            history,
            num_steps: step,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_shift_logits_right() -> Result<()> {
        // [1, 4, 2]: row j holds [j, 10 + j]
        let data: Vec<f32> = (0..4).flat_map(|j| [j as f32, 10.0 + j as f32]).collect();
        let logits = Tensor::from_vec(data, (1, 4, 2), &Device::Cpu)?;
        let shifted = shift_logits_right(&logits)?;
        assert_eq!(shifted.dims(), &[1, 4, 2]);
        let rows: Vec<Vec<f32>> = shifted.squeeze(0)?.to_vec2()?;
        assert_eq!(
            rows,
            vec![
                vec![0.0, 10.0],
                vec![0.0, 10.0],
                vec![1.0, 11.0],
                vec![2.0, 12.0]
            ]
        );
        Ok(())
    }

    #[test]
    fn test_shift_single_position() -> Result<()> {
        let logits = Tensor::from_vec(vec![1.0f32, 2.0], (1, 1, 2), &Device::Cpu)?;
        let shifted = shift_logits_right(&logits)?;
        assert_eq!(shifted.dims(), &[1, 1, 2]);
        Ok(())
    }

    #[test]
    fn test_generated_slice() {
        let decoded = DecodedSequence {
            tokens: vec![1, 2, 3, 4],
            history: None,
            num_steps: 2,
        };
        assert_eq!(decoded.generated(2), &[3, 4]);
        assert!(decoded.generated(10).is_empty());
    }
}
