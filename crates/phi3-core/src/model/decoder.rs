//! Decoder stack: all blocks plus the final norm.

use super::mask::attention_bias;
use super::{DecoderLayer, KvCache, ModelConfig, RmsNorm, RotaryEmbedding};
use crate::error::{Phi3Error, Result};
use candle_core::Tensor;
use candle_nn::VarBuilder;

/// Output of a decoder pass.
#[derive(Debug, Clone)]
pub struct DecoderOutput {
    /// Normalized final hidden state [batch, seq_len, hidden_size].
    pub last_hidden_state: Tensor,
    /// Input to every block, then the normalized output.
    pub hidden_states: Option<Vec<Tensor>>,
    /// Attention weights per block [batch, num_heads, seq_len, kv_len].
    pub attentions: Option<Vec<Tensor>>,
}

/// Stack of decoder blocks sharing one rotary embedding.
#[derive(Debug, Clone)]
pub struct Decoder {
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    rope: RotaryEmbedding,
    sliding_window: Option<usize>,
}

impl Decoder {
    /// Load `layers.{i}` and `norm` under `vb`.
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let rope = RotaryEmbedding::new(config, vb.device())?;
        let layers = (0..config.num_hidden_layers)
            .map(|i| DecoderLayer::new(config, i, vb.pp(format!("layers.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let norm = RmsNorm::new(config.hidden_size, config.rms_norm_eps, vb.pp("norm"))?;

        Ok(Self {
            layers,
            norm,
            rope,
            sliding_window: config.sliding_window,
        })
    }

    /// Run every block over one step.
    ///
    /// # Arguments
    ///
    /// * `inputs_embeds` - [batch, seq_len, hidden_size]
    /// * `padding_mask` - [batch, past_len + seq_len], 1 for real tokens
    /// * `position_ids` - [batch, seq_len]
    /// * `head_mask` - Optional [num_blocks, num_heads] multiplier
    /// * `cache` - Extended in place; `past_len` is its cursor
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        inputs_embeds: &Tensor,
        padding_mask: &Tensor,
        position_ids: &Tensor,
        head_mask: Option<&Tensor>,
        mut cache: Option<&mut KvCache>,
        output_hidden_states: bool,
        output_attentions: bool,
    ) -> Result<DecoderOutput> {
        let (_, seq_len, _) = inputs_embeds.dims3()?;
        let past_len = cache.as_ref().map_or(0, |c| c.seq_len());
        if let Some(cache) = cache.as_ref() {
            if cache.num_blocks() != self.layers.len() {
                return Err(Phi3Error::CacheError(format!(
                    "cache holds {} blocks, model has {}",
                    cache.num_blocks(),
                    self.layers.len()
                )));
            }
        }

        let bias = attention_bias(padding_mask, seq_len, past_len, self.sliding_window)?;
        let (cos, sin) = self.rope.cos_sin(position_ids)?;

        let blocks = self.run_blocks(
            inputs_embeds,
            &bias,
            &cos,
            &sin,
            head_mask,
            cache.as_deref_mut(),
            output_hidden_states,
            output_attentions,
        );
        let (hidden_states, mut all_hidden, all_attn) = match blocks {
            Ok(blocks) => blocks,
            Err(err) => {
                if let Some(cache) = cache {
                    cache.abort_step();
                }
                return Err(err);
            }
        };

        let last_hidden_state = self.norm.forward(&hidden_states)?;
        if let Some(all_hidden) = all_hidden.as_mut() {
            all_hidden.push(last_hidden_state.clone());
        }

        tracing::trace!(
            blocks = self.layers.len(),
            seq_len,
            past_len,
            "decoder pass done"
        );

        Ok(DecoderOutput {
            last_hidden_state,
            hidden_states: all_hidden,
            attentions: all_attn,
        })
    }

    /// Blocks in order. A failure leaves the cache mid-step.
    #[allow(clippy::too_many_arguments, clippy::type_complexity)]
    fn run_blocks(
        &self,
        inputs_embeds: &Tensor,
        bias: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        head_mask: Option<&Tensor>,
        mut cache: Option<&mut KvCache>,
        output_hidden_states: bool,
        output_attentions: bool,
    ) -> Result<(Tensor, Option<Vec<Tensor>>, Option<Vec<Tensor>>)> {
        let mut all_hidden = output_hidden_states.then(Vec::new);
        let mut all_attn = output_attentions.then(Vec::new);
        let mut hidden_states = inputs_embeds.clone();

        for (i, layer) in self.layers.iter().enumerate() {
            if let Some(all_hidden) = all_hidden.as_mut() {
                all_hidden.push(hidden_states.clone());
            }
            let block_mask = head_mask.map(|m| m.get(i)).transpose()?;
            let (output, weights) = layer.forward(
                &hidden_states,
                bias,
                &self.rope,
                cos,
                sin,
                block_mask.as_ref(),
                cache.as_deref_mut(),
            )?;
            hidden_states = output;
            if let Some(all_attn) = all_attn.as_mut() {
                all_attn.push(weights);
            }
        }

        Ok((hidden_states, all_hidden, all_attn))
    }

    /// Number of blocks.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// The shared rotary embedding.
    pub fn rope(&self) -> &RotaryEmbedding {
        &self.rope
    }
}
