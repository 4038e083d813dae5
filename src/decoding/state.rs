//! Decode buffer threaded through the denoising steps
//!
//! Bookkeeping stays on CPU; the buffer is uploaded once per step.

use candle_core::{Device, Tensor};

use crate::error::{GenerationError, Result};

use super::transfer::Transfer;

/// Token buffer of a single sequence, fixed length, MASK placeholders included
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceState {
    tokens: Vec<u32>,
    mask_token_id: u32,
}

impl SequenceState {
    /// Pad `prefix` on the right with MASK tokens up to `max_length`
    pub fn new(prefix: &[u32], max_length: usize, mask_token_id: u32) -> Result<Self> {
        if prefix.len() >= max_length {
            return Err(GenerationError::InputTooLong {
                input_len: prefix.len(),
                max_length,
            });
        }
        let mut tokens = Vec::with_capacity(max_length);
        tokens.extend_from_slice(prefix);
        tokens.resize(max_length, mask_token_id);
        Ok(Self {
            tokens,
            mask_token_id,
        })
    }

    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    /// Mutable view for step hooks; the length cannot change
    pub fn tokens_mut(&mut self) -> &mut [u32] {
        &mut self.tokens
    }

    pub fn into_tokens(self) -> Vec<u32> {
        self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn mask_token_id(&self) -> u32 {
        self.mask_token_id
    }

    /// Positions currently holding the MASK token, ascending
    pub fn mask_positions(&self) -> Vec<usize> {
        self.tokens
            .iter()
            .enumerate()
            .filter(|(_, &t)| t == self.mask_token_id)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn masked_count(&self) -> usize {
        self.tokens
            .iter()
            .filter(|&&t| t == self.mask_token_id)
            .count()
    }

    /// Write transfers into the buffer
    ///
    /// Transfers aimed at positions that are no longer masked are ignored, so
    /// a resolved position is never overwritten here.
    pub fn apply(&mut self, transfers: &[Transfer]) -> usize {
        let mut applied = 0;
        for transfer in transfers {
            let slot = &mut self.tokens[transfer.position];
            if *slot == self.mask_token_id {
                *slot = transfer.token;
                applied += 1;
            }
        }
        applied
    }

    /// Overwrite everything from the first `eos_token_id` onward with eos
    ///
    /// Returns how many of the overwritten positions were still masked.
    pub fn fill_after_eos(&mut self, eos_token_id: u32) -> usize {
        let Some(first_eos) = self.tokens.iter().position(|&t| t == eos_token_id) else {
            return 0;
        };
        let mut settled = 0;
        for token in &mut self.tokens[first_eos..] {
            if *token == self.mask_token_id {
                settled += 1;
            }
            *token = eos_token_id;
        }
        settled
    }

    /// Upload as a `[1, len]` U32 tensor
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_vec(self.tokens.clone(), (1, self.tokens.len()), device)?)
    }
}
