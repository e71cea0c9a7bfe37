//! Phi-3 model: embedder, decoder stack and output head.

use super::{Architecture, Decoder, Embedder, Head, KvCache, ModelConfig};
use crate::error::{Phi3Error, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

/// Inputs of one forward pass.
///
/// Everything but one of `input_ids` / `inputs_embeds` is optional; missing
/// values are filled in by [`Phi3Model::forward`] from the cache state.
#[derive(Debug, Clone, Default)]
pub struct ForwardInputs {
    /// Token ids [batch, seq_len].
    pub input_ids: Option<Tensor>,
    /// Precomputed embeddings [batch, seq_len, hidden_size]; win over ids.
    pub inputs_embeds: Option<Tensor>,
    /// 1 for real tokens, 0 for padding, over [batch, past_len + seq_len]
    /// or longer.
    pub attention_mask: Option<Tensor>,
    /// Absolute positions [batch, seq_len].
    pub position_ids: Option<Tensor>,
    /// Per-head multiplier: [num_heads] for every block, or
    /// [num_blocks, num_heads].
    pub head_mask: Option<Tensor>,
    /// Collect the hidden state entering every block.
    pub output_hidden_states: bool,
    /// Collect attention weights per block.
    pub output_attentions: bool,
    /// Enable training-only layers (dropout).
    pub train: bool,
}

impl ForwardInputs {
    /// Inputs from token ids.
    pub fn from_ids(input_ids: Tensor) -> Self {
        Self {
            input_ids: Some(input_ids),
            ..Self::default()
        }
    }

    /// Inputs from precomputed embeddings.
    pub fn from_embeds(inputs_embeds: Tensor) -> Self {
        Self {
            inputs_embeds: Some(inputs_embeds),
            ..Self::default()
        }
    }

    /// Input-shape template: ones ids, ones mask, `0..seq_len` positions.
    pub fn template(batch: usize, seq_len: usize, device: &Device) -> Result<Self> {
        let positions = Tensor::arange(0u32, seq_len as u32, device)?
            .unsqueeze(0)?
            .repeat((batch, 1))?;
        Ok(Self {
            input_ids: Some(Tensor::ones((batch, seq_len), DType::U32, device)?),
            attention_mask: Some(Tensor::ones((batch, seq_len), DType::U32, device)?),
            position_ids: Some(positions),
            ..Self::default()
        })
    }

    /// Set token ids.
    pub fn with_input_ids(mut self, input_ids: Tensor) -> Self {
        self.input_ids = Some(input_ids);
        self
    }

    /// Set precomputed embeddings.
    pub fn with_inputs_embeds(mut self, inputs_embeds: Tensor) -> Self {
        self.inputs_embeds = Some(inputs_embeds);
        self
    }

    /// Set the padding mask.
    pub fn with_attention_mask(mut self, attention_mask: Tensor) -> Self {
        self.attention_mask = Some(attention_mask);
        self
    }

    /// Set explicit positions.
    pub fn with_position_ids(mut self, position_ids: Tensor) -> Self {
        self.position_ids = Some(position_ids);
        self
    }

    /// Set the head mask.
    pub fn with_head_mask(mut self, head_mask: Tensor) -> Self {
        self.head_mask = Some(head_mask);
        self
    }

    /// Return the hidden state entering every block.
    pub fn with_hidden_states(mut self) -> Self {
        self.output_hidden_states = true;
        self
    }

    /// Return attention weights.
    pub fn with_attentions(mut self) -> Self {
        self.output_attentions = true;
        self
    }

    /// Toggle training-only layers.
    pub fn with_train(mut self, train: bool) -> Self {
        self.train = train;
        self
    }
}

/// Result of a forward pass.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// Head output; the normalized hidden state for the base head.
    pub logits: Tensor,
    /// `num_hidden_layers + 1` entries when requested.
    pub hidden_states: Option<Vec<Tensor>>,
    /// One entry per block when requested.
    pub attentions: Option<Vec<Tensor>>,
}

/// Defaults substituted for one pass.
struct Resolved {
    embeds: Tensor,
    padding_mask: Tensor,
    position_ids: Tensor,
    head_mask: Option<Tensor>,
}

/// Phi-3 decoder with one output head.
#[derive(Debug, Clone)]
pub struct Phi3Model {
    config: ModelConfig,
    embedder: Embedder,
    decoder: Decoder,
    head: Head,
    dtype: DType,
    device: Device,
}

impl Phi3Model {
    /// Build the model from `vb`.
    ///
    /// Slots: `model.embed_tokens`, `model.layers.{i}.*`, `model.norm`, plus
    /// `lm_head`, `score` or `classifier` depending on the architecture.
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let model_vb = vb.pp("model");
        let embedder = Embedder::new(config, model_vb.clone())?;
        let decoder = Decoder::new(config, model_vb)?;
        let head = Head::new(config, embedder.table(), vb.clone())?;

        tracing::debug!(
            architecture = ?config.architecture,
            layers = config.num_hidden_layers,
            hidden = config.hidden_size,
            heads = config.num_attention_heads,
            kv_heads = config.num_kv_heads(),
            sliding_window = ?config.sliding_window,
            longrope = config.rope_scaling.is_some(),
            "phi3 model built"
        );

        Ok(Self {
            config: config.clone(),
            embedder,
            decoder,
            head,
            dtype: vb.dtype(),
            device: vb.device().clone(),
        })
    }

    /// Allocate a cache in the model's dtype and device.
    pub fn init_cache(&self, batch_size: usize, max_length: usize) -> Result<KvCache> {
        if max_length > self.config.max_position_embeddings {
            tracing::warn!(
                max_length,
                max_position_embeddings = self.config.max_position_embeddings,
                "cache is longer than the trained context"
            );
        }
        KvCache::new(&self.config, batch_size, max_length, self.dtype, &self.device)
    }

    /// Run one step.
    ///
    /// Without a cache the inputs are the whole sequence. With a cache the
    /// inputs are the new positions only; their keys and values are
    /// appended and the cursor advances by `seq_len`.
    pub fn forward(
        &self,
        inputs: &ForwardInputs,
        cache: Option<&mut KvCache>,
    ) -> Result<ModelOutput> {
        let past_len = cache.as_ref().map_or(0, |c| c.seq_len());
        if let Some(cache) = cache.as_ref() {
            let batch = batch_of(inputs)?;
            if cache.batch_size() != batch {
                return Err(Phi3Error::ShapeMismatch(format!(
                    "cache batch {} does not match input batch {batch}",
                    cache.batch_size()
                )));
            }
        }
        let resolved = self.resolve(inputs, past_len)?;

        tracing::trace!(
            seq_len = resolved.embeds.dim(1)?,
            past_len,
            "forward pass"
        );

        let decoded = self.decoder.forward(
            &resolved.embeds,
            &resolved.padding_mask,
            &resolved.position_ids,
            resolved.head_mask.as_ref(),
            cache,
            inputs.output_hidden_states,
            inputs.output_attentions,
        )?;
        let logits = self.head.forward(
            &decoded.last_hidden_state,
            inputs.input_ids.as_ref(),
            inputs.train,
        )?;

        Ok(ModelOutput {
            logits,
            hidden_states: decoded.hidden_states,
            attentions: decoded.attentions,
        })
    }

    /// Substitute defaults for every optional input.
    fn resolve(&self, inputs: &ForwardInputs, past_len: usize) -> Result<Resolved> {
        let embeds = self
            .embedder
            .forward(inputs.input_ids.as_ref(), inputs.inputs_embeds.as_ref())?
            .to_dtype(self.dtype)?;
        let (batch, seq_len, _) = embeds.dims3()?;
        if seq_len == 0 {
            return Err(Phi3Error::ShapeMismatch("empty input sequence".to_string()));
        }
        let total = past_len + seq_len;

        let padding_mask = match &inputs.attention_mask {
            None => Tensor::ones((batch, total), DType::U32, &self.device)?,
            Some(mask) => {
                let (mask_batch, mask_len) = mask.dims2()?;
                if mask_batch != batch || mask_len < total {
                    return Err(Phi3Error::ShapeMismatch(format!(
                        "attention_mask [{mask_batch}, {mask_len}] must cover [{batch}, {total}]"
                    )));
                }
                mask.narrow(1, 0, total)?
            }
        };

        let position_ids = match &inputs.position_ids {
            None => Tensor::arange(past_len as u32, total as u32, &self.device)?
                .unsqueeze(0)?
                .repeat((batch, 1))?,
            Some(positions) => {
                if positions.dims() != [batch, seq_len] {
                    return Err(Phi3Error::ShapeMismatch(format!(
                        "position_ids {:?}, expected [{batch}, {seq_len}]",
                        positions.dims()
                    )));
                }
                positions.clone()
            }
        };

        let head_mask = inputs
            .head_mask
            .as_ref()
            .map(|mask| self.expand_head_mask(mask))
            .transpose()?;

        Ok(Resolved {
            embeds,
            padding_mask,
            position_ids,
            head_mask,
        })
    }

    /// [heads] or [blocks, heads] -> [blocks, heads].
    fn expand_head_mask(&self, mask: &Tensor) -> Result<Tensor> {
        let blocks = self.config.num_hidden_layers;
        let heads = self.config.num_attention_heads;
        match mask.dims() {
            [h] if *h == heads => Ok(mask.unsqueeze(0)?.repeat((blocks, 1))?),
            [b, h] if *b == blocks && *h == heads => Ok(mask.clone()),
            dims => Err(Phi3Error::ShapeMismatch(format!(
                "head_mask {dims:?}, expected [{heads}] or [{blocks}, {heads}]"
            ))),
        }
    }

    /// Get model configuration.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Output head variant.
    pub fn architecture(&self) -> Architecture {
        self.head.architecture()
    }

    /// The token embedder.
    pub fn embedder(&self) -> &Embedder {
        &self.embedder
    }

    /// Parameter dtype.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Get device.
    pub fn device(&self) -> &Device {
        &self.device
    }
}

fn batch_of(inputs: &ForwardInputs) -> Result<usize> {
    match (&inputs.inputs_embeds, &inputs.input_ids) {
        (Some(embeds), _) => Ok(embeds.dim(0)?),
        (None, Some(ids)) => Ok(ids.dim(0)?),
        (None, None) => Err(Phi3Error::MissingInput(
            "either input_ids or inputs_embeds must be supplied".to_string(),
        )),
    }
}
