//! Grouped-query self-attention.
//!
//! Query heads are split into `num_attention_heads / num_key_value_heads`
//! groups sharing one key/value head. Scores are computed and normalized in
//! F32 whatever the parameter dtype.

use super::{linear_no_bias, KvCache, ModelConfig, RotaryEmbedding};
use crate::error::{Phi3Error, Result};
use candle_core::{DType, Module, Tensor};
use candle_nn::{Linear, VarBuilder};

/// Self-attention for one decoder block.
#[derive(Debug, Clone)]
pub struct Attention {
    /// Query projection: hidden -> num_heads * head_dim
    q_proj: Linear,
    /// Key projection: hidden -> num_kv_heads * head_dim
    k_proj: Linear,
    /// Value projection: hidden -> num_kv_heads * head_dim
    v_proj: Linear,
    /// Output projection: num_heads * head_dim -> hidden
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    hidden_size: usize,
    /// Index of the owning block, used as the cache slot.
    layer_idx: usize,
}

impl Attention {
    /// Load `q_proj`, `k_proj`, `v_proj` and `o_proj` under `vb`.
    pub fn new(config: &ModelConfig, layer_idx: usize, vb: VarBuilder) -> Result<Self> {
        let hidden_size = config.hidden_size;
        let num_heads = config.num_attention_heads;
        let num_kv_heads = config.num_kv_heads();
        let head_dim = config.head_dim();
        let std = config.initializer_range;

        Ok(Self {
            q_proj: linear_no_bias(hidden_size, num_heads * head_dim, std, vb.pp("q_proj"))?,
            k_proj: linear_no_bias(hidden_size, num_kv_heads * head_dim, std, vb.pp("k_proj"))?,
            v_proj: linear_no_bias(hidden_size, num_kv_heads * head_dim, std, vb.pp("v_proj"))?,
            o_proj: linear_no_bias(num_heads * head_dim, hidden_size, std, vb.pp("o_proj"))?,
            num_heads,
            num_kv_heads,
            head_dim,
            hidden_size,
            layer_idx,
        })
    }

    /// Project `x` to heads.
    ///
    /// Returns (query, key, value):
    /// - query: [batch, num_heads, seq_len, head_dim]
    /// - key: [batch, num_kv_heads, seq_len, head_dim]
    /// - value: [batch, num_kv_heads, seq_len, head_dim]
    pub fn project(&self, x: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let (batch, seq_len, hidden) = x.dims3()?;
        if hidden != self.hidden_size {
            return Err(Phi3Error::ShapeMismatch(format!(
                "attention expects hidden size {}, got {hidden}",
                self.hidden_size
            )));
        }

        let split = |t: Tensor, heads: usize| -> Result<Tensor> {
            Ok(t.reshape((batch, seq_len, heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };

        let q = split(self.q_proj.forward(x)?, self.num_heads)?;
        let k = split(self.k_proj.forward(x)?, self.num_kv_heads)?;
        let v = split(self.v_proj.forward(x)?, self.num_kv_heads)?;
        Ok((q, k, v))
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `hidden_states` - Normalized input [batch, seq_len, hidden_size]
    /// * `bias` - Additive mask [batch, 1, seq_len, kv_len] from
    ///   [`attention_bias`](super::mask::attention_bias)
    /// * `cos`, `sin` - Rotary tables for this step's positions
    /// * `head_mask` - Optional per-head multiplier [num_heads]
    /// * `cache` - KV cache; new keys/values are appended at this block's slot
    ///
    /// Returns the projected output [batch, seq_len, hidden_size] and the
    /// attention weights [batch, num_heads, seq_len, kv_len].
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        bias: &Tensor,
        rope: &RotaryEmbedding,
        cos: &Tensor,
        sin: &Tensor,
        head_mask: Option<&Tensor>,
        cache: Option<&mut KvCache>,
    ) -> Result<(Tensor, Tensor)> {
        let (batch, seq_len, _) = hidden_states.dims3()?;
        let (q, k, v) = self.project(hidden_states)?;
        let (q, k) = rope.apply(&q, &k, cos, sin)?;

        let (k, v) = match cache {
            Some(cache) => {
                // Cache layout is [batch, seq, kv_heads, head_dim]
                let (k, v) = cache.append(
                    self.layer_idx,
                    &k.transpose(1, 2)?,
                    &v.transpose(1, 2)?,
                )?;
                (
                    k.transpose(1, 2)?.contiguous()?,
                    v.transpose(1, 2)?.contiguous()?,
                )
            }
            None => (k, v),
        };

        let repeat = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(&k, repeat)?;
        let v = repeat_kv(&v, repeat)?;

        // Q @ K^T / sqrt(d) in F32
        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = q
            .to_dtype(DType::F32)?
            .matmul(&k.to_dtype(DType::F32)?.t()?)?;
        let scores = (scores * scale)?.broadcast_add(bias)?;
        let mut weights = candle_nn::ops::softmax_last_dim(&scores)?;

        if let Some(head_mask) = head_mask {
            let head_mask = head_mask
                .to_dtype(DType::F32)?
                .reshape((1, self.num_heads, 1, 1))?;
            weights = weights.broadcast_mul(&head_mask)?;
        }

        let weights = weights.to_dtype(v.dtype())?;
        let output = weights.matmul(&v)?;

        // [batch, heads, seq, dim] -> [batch, seq, heads * dim]
        let output = output.transpose(1, 2)?.reshape((
            batch,
            seq_len,
            self.num_heads * self.head_dim,
        ))?;
        let output = self.o_proj.forward(&output)?;

        tracing::trace!(
            layer = self.layer_idx,
            kv_len = k.dim(2)?,
            "attention step"
        );

        Ok((output, weights))
    }

    /// Get the number of heads.
    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Get the number of KV heads.
    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    /// Get the head dimension.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }
}

/// Repeat each KV head `repeat` times along the head axis.
///
/// [batch, num_kv_heads, seq, head_dim] -> [batch, num_kv_heads * repeat, seq, head_dim]
pub(crate) fn repeat_kv(x: &Tensor, repeat: usize) -> Result<Tensor> {
    if repeat == 1 {
        return Ok(x.clone());
    }

    let (batch, num_kv_heads, seq_len, head_dim) = x.dims4()?;
    let x = x
        .unsqueeze(2)?
        .expand((batch, num_kv_heads, repeat, seq_len, head_dim))?
        .reshape((batch, num_kv_heads * repeat, seq_len, head_dim))?;
    Ok(x)
}
