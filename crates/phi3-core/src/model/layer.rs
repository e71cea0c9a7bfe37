//! Decoder block.
//!
//! A single pre-norm decoder block combining:
//! - Pre-attention RMSNorm
//! - Grouped-query attention
//! - Post-attention RMSNorm
//! - Gated MLP

use super::{Attention, GatedMlp, KvCache, ModelConfig, RmsNorm, RotaryEmbedding};
use crate::error::Result;
use candle_core::Tensor;
use candle_nn::VarBuilder;

/// A single transformer decoder block.
#[derive(Debug, Clone)]
pub struct DecoderLayer {
    /// Pre-attention layer norm.
    input_layernorm: RmsNorm,
    /// Self-attention.
    self_attn: Attention,
    /// Post-attention layer norm.
    post_attention_layernorm: RmsNorm,
    /// MLP.
    mlp: GatedMlp,
    /// Layer index (cache slot and logging).
    layer_idx: usize,
}

impl DecoderLayer {
    /// Load block `layer_idx` from `input_layernorm`, `self_attn`,
    /// `post_attention_layernorm` and `mlp` under `vb`.
    pub fn new(config: &ModelConfig, layer_idx: usize, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        let eps = config.rms_norm_eps;

        Ok(Self {
            input_layernorm: RmsNorm::new(hidden, eps, vb.pp("input_layernorm"))?,
            self_attn: Attention::new(config, layer_idx, vb.pp("self_attn"))?,
            post_attention_layernorm: RmsNorm::new(
                hidden,
                eps,
                vb.pp("post_attention_layernorm"),
            )?,
            mlp: GatedMlp::new(config, vb.pp("mlp"))?,
            layer_idx,
        })
    }

    /// Forward pass.
    ///
    /// `h = h + Attn(RMSNorm(h)); h = h + MLP(RMSNorm(h))`
    ///
    /// # Arguments
    ///
    /// * `hidden_states` - Input tensor [batch, seq_len, hidden_size]
    /// * `bias` - Additive attention mask shared by all blocks
    /// * `rope`, `cos`, `sin` - Rotary embedding and this step's tables
    /// * `head_mask` - Optional per-head multiplier [num_heads]
    /// * `cache` - KV cache to read from and extend
    ///
    /// Returns the block output and its attention weights.
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
        let normed = self.input_layernorm.forward(hidden_states)?;
        let (attn_output, weights) =
            self.self_attn
                .forward(&normed, bias, rope, cos, sin, head_mask, cache)?;
        let hidden_states = (hidden_states + attn_output)?;

        let normed = self.post_attention_layernorm.forward(&hidden_states)?;
        let mlp_output = self.mlp.forward(&normed)?;
        let output = (hidden_states + mlp_output)?;

        tracing::trace!(layer = self.layer_idx, "decoder block done");
        Ok((output, weights))
    }

    /// Get the layer index.
    pub fn layer_idx(&self) -> usize {
        self.layer_idx
    }

    /// Get the attention module.
    pub fn attention(&self) -> &Attention {
        &self.self_attn
    }

    /// Get the MLP module.
    pub fn mlp(&self) -> &GatedMlp {
        &self.mlp
    }
}
