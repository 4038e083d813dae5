//! Attention structure handed to the denoising model
//!
//! Without padding the model attends bidirectionally over the whole buffer.
//! With left padding, the padding mask is expanded to a pairwise
//! `[batch, 1, N, N]` visibility matrix and position ids skip the pads.

use candle_core::{DType, Device, Tensor};

use crate::error::{GenerationError, Result};

/// Attention mask passed to [`crate::DenoisingModel::forward`]
#[derive(Debug, Clone)]
pub enum AttentionMask {
    /// Every position attends to every position
    Full,
    /// `[batch, 1, N, N]` U8 tensor, 1 where query and key are both valid
    Pairwise(Tensor),
}

impl AttentionMask {
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full)
    }
}

/// Attention mask plus the position ids that go with it
#[derive(Debug, Clone)]
pub struct AttentionLayout {
    pub mask: AttentionMask,
    /// `[batch, N]` I64 position ids, only present with padding
    pub position_ids: Option<Tensor>,
}

impl AttentionLayout {
    pub fn full() -> Self {
        Self {
            mask: AttentionMask::Full,
            position_ids: None,
        }
    }

    /// Build the layout for one sequence of `max_length` tokens
    ///
    /// `valid` is the caller's padding mask over the prompt (1 = real token).
    /// Generated positions are always valid. A mask without zeros is the
    /// same as no mask.
    pub fn for_sequence(valid: Option<&[u8]>, max_length: usize, device: &Device) -> Result<Self> {
        let valid = match valid {
            Some(valid) if valid.iter().any(|&v| v == 0) => valid,
            _ => return Ok(Self::full()),
        };
        if valid.len() > max_length {
            return Err(GenerationError::AttentionMaskShape {
                mask: vec![1, valid.len()],
                input: vec![1, max_length],
            });
        }

        let mut padded = valid.to_vec();
        padded.resize(max_length, 1);

        let mut running = 0i64;
        let position_ids: Vec<i64> = padded
            .iter()
            .map(|&v| {
                running += v as i64;
                if v == 0 {
                    1
                } else {
                    running - 1
                }
            })
            .collect();

        let mut pairwise = Vec::with_capacity(max_length * max_length);
        for &query in &padded {
            for &key in &padded {
                pairwise.push(u8::from(query != 0 && key != 0));
            }
        }

        Ok(Self {
            mask: AttentionMask::Pairwise(Tensor::from_vec(
                pairwise,
                (1, 1, max_length, max_length),
                device,
            )?),
            position_ids: Some(Tensor::from_vec(position_ids, (1, max_length), device)?),
        })
    }
}

/// Read a `[1, N]` padding mask of any integer or float dtype into bytes
pub fn padding_row(attention_mask: &Tensor) -> Result<Vec<u8>> {
    let row = attention_mask.squeeze(0)?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    Ok(row.into_iter().map(|v| u8::from(v != 0.0)).collect())
}
