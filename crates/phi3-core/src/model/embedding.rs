//! Token embedding lookup.

use super::ModelConfig;
use crate::error::{Phi3Error, Result};
use candle_core::{Module, Tensor};
use candle_nn::{Embedding, Init, VarBuilder};

/// Maps token ids to hidden vectors, or passes supplied embeddings through.
#[derive(Debug, Clone)]
pub struct Embedder {
    embed_tokens: Embedding,
    vocab_size: usize,
    hidden_size: usize,
}

impl Embedder {
    /// Load the `embed_tokens` table [vocab_size, hidden_size] under `vb`.
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let init = Init::Randn {
            mean: 0.0,
            stdev: config.initializer_range,
        };
        let table = vb.pp("embed_tokens").get_with_hints(
            (config.vocab_size, config.hidden_size),
            "weight",
            init,
        )?;
        Ok(Self {
            embed_tokens: Embedding::new(table, config.hidden_size),
            vocab_size: config.vocab_size,
            hidden_size: config.hidden_size,
        })
    }

    /// Embed a step.
    ///
    /// `inputs_embeds` [batch, seq, hidden_size] take precedence over
    /// `input_ids` [batch, seq]. Fails with `MissingInput` when neither is
    /// present.
    pub fn forward(
        &self,
        input_ids: Option<&Tensor>,
        inputs_embeds: Option<&Tensor>,
    ) -> Result<Tensor> {
        match (inputs_embeds, input_ids) {
            (Some(embeds), _) => {
                let (_, _, hidden) = embeds.dims3()?;
                if hidden != self.hidden_size {
                    return Err(Phi3Error::ShapeMismatch(format!(
                        "inputs_embeds last dim {hidden}, expected {}",
                        self.hidden_size
                    )));
                }
                Ok(embeds.clone())
            }
            (None, Some(ids)) => {
                ids.dims2()?;
                Ok(self.embed_tokens.forward(ids)?)
            }
            (None, None) => Err(Phi3Error::MissingInput(
                "either input_ids or inputs_embeds must be supplied".to_string(),
            )),
        }
    }

    /// The embedding table [vocab_size, hidden_size].
    pub fn table(&self) -> &Tensor {
        self.embed_tokens.embeddings()
    }

    /// Vocabulary size.
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Get the hidden size.
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }
}
