//! High-level diffusion generation engine

use candle_core::{DType, Tensor};
use rand::Rng;

use crate::config::GenerationConfig;
use crate::decoding::{DecodedSequence, DiffusionDecoder, NoopHooks, StepHooks};
use crate::error::{GenerationError, Result};
use crate::model::DenoisingModel;

/// High-level generation engine around a denoising model
pub struct DiffusionEngine<M> {
    model: M,
    /// Defaults used when the caller passes no config, and for special tokens
    /// the caller's config leaves unset
    generation_config: GenerationConfig,
}

impl<M: DenoisingModel> DiffusionEngine<M> {
    pub fn new(model: M) -> Self {
        let generation_config = model.generation_config();
        Self {
            model,
            generation_config,
        }
    }

    pub fn with_generation_config(mut self, generation_config: GenerationConfig) -> Self {
        self.generation_config = generation_config;
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Get the default generation configuration
    pub fn generation_config(&self) -> &GenerationConfig {
        &self.generation_config
    }

    /// Copy the config for one call, filling special tokens from the defaults
    pub fn prepare_generation_config(&self, config: Option<&GenerationConfig>) -> GenerationConfig {
        match config {
            None => self.generation_config.clone(),
            Some(config) => {
                let mut config = config.clone();
                config.fill_special_tokens_from(&self.generation_config);
                config
            }
        }
    }

    /// Generate with diffusion decoding
    ///
    /// # Arguments
    /// * `input_ids` - Prompts `[batch, prompt_len]`
    /// * `attention_mask` - Optional padding mask `[batch, prompt_len]`
    /// * `config` - Per-call config; the engine defaults when `None`
    /// * `rng` - Random source for sampling and position selection
    ///
    /// # Returns
    /// One decoded sequence per prompt row and replica, rows in input order
    /// with each row's `num_return_sequences` replicas adjacent
    pub fn diffusion_generate<R: Rng + ?Sized>(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        config: Option<&GenerationConfig>,
        rng: &mut R,
    ) -> Result<Vec<DecodedSequence>> {
        self.diffusion_generate_with_hooks(input_ids, attention_mask, config, rng, &mut NoopHooks)
    }

    /// Like [`Self::diffusion_generate`], with per-step hooks
    pub fn diffusion_generate_with_hooks<R, H>(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        config: Option<&GenerationConfig>,
        rng: &mut R,
        hooks: &mut H,
    ) -> Result<Vec<DecodedSequence>>
    where
        R: Rng + ?Sized,
        H: StepHooks + ?Sized,
    {
        // Resolve config against the prompt
        let config = self.prepare_generation_config(config);
        let (batch_size, input_len) = input_ids.dims2()?;
        let plan = config.resolve(input_len, self.model.max_position_embeddings())?;

        // Check padding
        match attention_mask {
            Some(mask) if mask.dims() != input_ids.dims() => {
                return Err(GenerationError::AttentionMaskShape {
                    mask: mask.dims().to_vec(),
                    input: input_ids.dims().to_vec(),
                });
            }
            Some(_) => {}
            None => {
                let ids: Vec<Vec<u32>> = input_ids.to_dtype(DType::U32)?.to_vec2()?;
                if ids.iter().flatten().any(|&t| t == plan.tokens.pad_token_id) {
                    tracing::warn!(
                        "Padding was detected but no attention mask is passed. \
                         For correct results, set `attention_mask` when batch-padding inputs."
                    );
                }
            }
        }

        tracing::info!(
            "Generating {} sequence(s): prompt_len={}, max_length={}, steps={}, alg={}",
            batch_size * plan.num_return_sequences,
            input_len,
            plan.max_length,
            plan.steps,
            plan.policy.algorithm
        );

        // Decode each row and replica on its own
        let decoder = DiffusionDecoder::new(&self.model, &plan);
        let mut outputs = Vec::with_capacity(batch_size * plan.num_return_sequences);
        for row in 0..batch_size {
            let row_ids = input_ids.narrow(0, row, 1)?;
            let row_mask = attention_mask
                .map(|mask| mask.narrow(0, row, 1))
                .transpose()?;
            for _ in 0..plan.num_return_sequences {
                let decoded = decoder.denoise(&row_ids, row_mask.as_ref(), &mut *rng, &mut *hooks)?;
                tracing::debug!("Row {} finished after {} steps", row, decoded.num_steps);
                outputs.push(decoded);
            }
        }

        Ok(outputs)
    }
}
