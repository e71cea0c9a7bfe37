//! Attention masks.
//!
//! Query `i` of a step that starts after `past_len` cached positions sits at
//! absolute index `past_len + i` and may attend key `j` iff
//! `j <= past_len + i`, `j > past_len + i - window` when a window is set, and
//! key `j` is a real token in the padding mask.
//!
//! Disallowed entries hold `f32::MIN` rather than `-inf` so rows of padding
//! queries with no visible key stay finite through the softmax.

use crate::error::{Phi3Error, Result};
use candle_core::{DType, Device, Tensor};

/// Create a causal (optionally windowed) mask of 1.0 (attend) / 0.0.
///
/// Returns [1, 1, q_len, past_len + q_len].
pub fn causal_mask(
    q_len: usize,
    past_len: usize,
    sliding_window: Option<usize>,
    device: &Device,
) -> Result<Tensor> {
    let kv_len = past_len + q_len;
    let mut mask_data = vec![0.0f32; q_len * kv_len];

    for i in 0..q_len {
        let query = past_len + i;
        for j in 0..=query {
            let in_window = sliding_window.map_or(true, |w| j + w > query);
            if in_window {
                mask_data[i * kv_len + j] = 1.0;
            }
        }
    }

    let mask = Tensor::from_slice(&mask_data, (q_len, kv_len), device)?;

    // Add batch and head dimensions: [1, 1, q_len, kv_len]
    Ok(mask.unsqueeze(0)?.unsqueeze(0)?)
}

/// Combine padding, causal order and window into an additive bias.
///
/// # Arguments
///
/// * `padding` - [batch, past_len + q_len], 1 for real tokens, 0 for padding
/// * `q_len` - Number of new positions in this step
/// * `past_len` - Positions already in the cache
/// * `sliding_window` - Optional look-back limit
///
/// Returns an F32 tensor [batch, 1, q_len, past_len + q_len] holding 0.0
/// where attention is allowed and `f32::MIN` elsewhere.
pub fn attention_bias(
    padding: &Tensor,
    q_len: usize,
    past_len: usize,
    sliding_window: Option<usize>,
) -> Result<Tensor> {
    let (batch, kv_len) = padding.dims2()?;
    if kv_len != past_len + q_len {
        return Err(Phi3Error::ShapeMismatch(format!(
            "padding mask covers {kv_len} positions, expected {}",
            past_len + q_len
        )));
    }

    let causal = causal_mask(q_len, past_len, sliding_window, padding.device())?;
    let padding = padding.to_dtype(DType::F32)?.reshape((batch, 1, 1, kv_len))?;
    let allowed = padding.broadcast_mul(&causal)?;

    // allowed * |min| + min -> 0.0 or f32::MIN
    let min = f32::MIN as f64;
    Ok(allowed.affine(-min, min)?)
}
