//! The denoising model seam
//!
//! The engine treats the network as a black box: token ids in, per-position
//! logits out. Implementations wrap a Candle model (or a stub in tests).

use candle_core::{Device, Result, Tensor};

use crate::attention::AttentionMask;
use crate::config::GenerationConfig;

/// A masked-diffusion token classifier
pub trait DenoisingModel {
    fn device(&self) -> &Device;

    /// Forward pass returning logits
    ///
    /// # Arguments
    /// * `input_ids` - Token IDs `[batch, seq_len]` (U32); MASK is a regular id
    /// * `attention_mask` - Full attention or a pairwise `[batch, 1, N, N]` mask
    /// * `position_ids` - Explicit positions `[batch, seq_len]` when padded
    ///
    /// # Returns
    /// Logits `[batch, seq_len, vocab_size]`, where row `j` predicts the token
    /// following position `j`
    fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: &AttentionMask,
        position_ids: Option<&Tensor>,
    ) -> Result<Tensor>;

    /// Maximum sequence length the model can position-encode, if bounded
    fn max_position_embeddings(&self) -> Option<usize> {
        None
    }

    /// The model's own generation defaults (special tokens in particular)
    fn generation_config(&self) -> GenerationConfig {
        GenerationConfig::default()
    }
}

impl<M: DenoisingModel + ?Sized> DenoisingModel for &M {
    fn device(&self) -> &Device {
        (**self).device()
    }

    fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: &AttentionMask,
        position_ids: Option<&Tensor>,
    ) -> Result<Tensor> {
        (**self).forward(input_ids, attention_mask, position_ids)
    }

    fn max_position_embeddings(&self) -> Option<usize> {
        (**self).max_position_embeddings()
    }

    fn generation_config(&self) -> GenerationConfig {
        (**self).generation_config()
    }
}
