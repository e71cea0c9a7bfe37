//! Output heads on top of the decoder.

use super::{linear, linear_no_bias, Architecture, ModelConfig};
use crate::error::{Phi3Error, Result};
use candle_core::{DType, Module, Tensor};
use candle_nn::{Dropout, Linear, VarBuilder};

const DEFAULT_CLASSIFIER_DROPOUT: f32 = 0.1;

/// Output head, fixed at construction from [`Architecture`].
#[derive(Debug, Clone)]
pub enum Head {
    /// Normalized hidden states are returned as-is.
    Base,
    /// Vocabulary logits per position.
    CausalLm {
        /// [vocab_size, hidden_size]
        lm_head: Linear,
    },
    /// One label distribution per sequence.
    SequenceClassification {
        /// [num_labels, hidden_size], no bias
        score: Linear,
        /// Padding id used to find each sequence's last token.
        pad_token_id: Option<u32>,
    },
    /// One label distribution per position.
    TokenClassification {
        /// Training-only dropout.
        dropout: Dropout,
        /// [num_labels, hidden_size] with bias
        classifier: Linear,
    },
}

impl Head {
    /// Load the head slot under the model root `vb`.
    ///
    /// `embed_table` backs the LM head when `tie_word_embeddings` is set.
    pub fn new(config: &ModelConfig, embed_table: &Tensor, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        let std = config.initializer_range;

        let head = match config.architecture {
            Architecture::Base => Self::Base,
            Architecture::CausalLm if config.tie_word_embeddings => Self::CausalLm {
                lm_head: Linear::new(embed_table.clone(), None),
            },
            Architecture::CausalLm => Self::CausalLm {
                lm_head: linear_no_bias(hidden, config.vocab_size, std, vb.pp("lm_head"))?,
            },
            Architecture::SequenceClassification => Self::SequenceClassification {
                score: linear_no_bias(hidden, config.num_labels(), std, vb.pp("score"))?,
                pad_token_id: config.pad_token_id,
            },
            Architecture::TokenClassification => Self::TokenClassification {
                dropout: Dropout::new(
                    config
                        .classifier_dropout
                        .unwrap_or(DEFAULT_CLASSIFIER_DROPOUT),
                ),
                classifier: linear(hidden, config.num_labels(), std, vb.pp("classifier"))?,
            },
        };
        Ok(head)
    }

    /// Map the normalized hidden state [batch, seq_len, hidden] to logits.
    ///
    /// Shapes: base [batch, seq, hidden], causal-lm [batch, seq, vocab],
    /// sequence classification [batch, num_labels], token classification
    /// [batch, seq, num_labels].
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        input_ids: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        match self {
            Self::Base => Ok(hidden_states.clone()),
            Self::CausalLm { lm_head } => Ok(lm_head.forward(hidden_states)?),
            Self::SequenceClassification {
                score,
                pad_token_id,
            } => {
                let logits = score.forward(hidden_states)?;
                let (batch, seq_len, _) = logits.dims3()?;
                let indices = pooled_positions(input_ids, *pad_token_id, batch, seq_len)?;
                let pooled = indices
                    .iter()
                    .enumerate()
                    .map(|(b, &i)| logits.get(b)?.get(i))
                    .collect::<candle_core::Result<Vec<_>>>()?;
                Ok(Tensor::stack(&pooled, 0)?)
            }
            Self::TokenClassification {
                dropout,
                classifier,
            } => {
                let hidden_states = dropout.forward(hidden_states, train)?;
                Ok(classifier.forward(&hidden_states)?)
            }
        }
    }

    /// Variant tag.
    pub fn architecture(&self) -> Architecture {
        match self {
            Self::Base => Architecture::Base,
            Self::CausalLm { .. } => Architecture::CausalLm,
            Self::SequenceClassification { .. } => Architecture::SequenceClassification,
            Self::TokenClassification { .. } => Architecture::TokenClassification,
        }
    }
}

/// Position pooled for each sequence: `count(ids != pad) - 1`, or the last
/// position without ids, without a pad id, or for an all-padding row.
fn pooled_positions(
    input_ids: Option<&Tensor>,
    pad_token_id: Option<u32>,
    batch: usize,
    seq_len: usize,
) -> Result<Vec<usize>> {
    if seq_len == 0 {
        return Err(Phi3Error::ShapeMismatch(
            "cannot pool an empty sequence".to_string(),
        ));
    }
    let last = seq_len - 1;
    let (ids, pad) = match (input_ids, pad_token_id) {
        (Some(ids), Some(pad)) => (ids, pad),
        _ => return Ok(vec![last; batch]),
    };
    if ids.dims() != [batch, seq_len] {
        return Err(Phi3Error::ShapeMismatch(format!(
            "input_ids {:?} do not match logits [{batch}, {seq_len}]",
            ids.dims()
        )));
    }

    let rows: Vec<Vec<u32>> = ids.to_dtype(DType::U32)?.to_vec2()?;
    Ok(rows
        .iter()
        .map(|row| match row.iter().filter(|&&id| id != pad).count() {
            0 => last,
            n => n - 1,
        })
        .collect())
}
