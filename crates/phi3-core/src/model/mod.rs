//! Model construction and inference.
//!
//! Provides the Phi-3 decoder:
//! - Model configuration
//! - Rotary embeddings, attention masks and the KV cache
//! - Decoder blocks and output heads
//! - Forward pass

mod attention;
mod config;
mod decoder;
mod embedding;
mod head;
mod kv_cache;
mod layer;
pub mod mask;
mod mlp;
mod rmsnorm;
mod rope;
mod transformer;

pub use attention::Attention;
pub use config::{Architecture, ModelConfig, RopeScaling};
pub use decoder::{Decoder, DecoderOutput};
pub use embedding::Embedder;
pub use head::Head;
pub use kv_cache::KvCache;
pub use layer::DecoderLayer;
pub use mlp::GatedMlp;
pub use rmsnorm::RmsNorm;
pub use rope::RotaryEmbedding;
pub use transformer::{ForwardInputs, ModelOutput, Phi3Model};

use crate::error::Result;
use candle_nn::{Init, Linear, VarBuilder};

/// `Linear` without bias from the `weight` slot under `vb`.
///
/// Fresh weights are drawn from N(0, std).
pub(crate) fn linear_no_bias(
    in_dim: usize,
    out_dim: usize,
    std: f64,
    vb: VarBuilder,
) -> Result<Linear> {
    let init = Init::Randn { mean: 0.0, stdev: std };
    let weight = vb.get_with_hints((out_dim, in_dim), "weight", init)?;
    Ok(Linear::new(weight, None))
}

/// `Linear` with a zero-initialized `bias` slot.
pub(crate) fn linear(in_dim: usize, out_dim: usize, std: f64, vb: VarBuilder) -> Result<Linear> {
    let init = Init::Randn { mean: 0.0, stdev: std };
    let weight = vb.get_with_hints((out_dim, in_dim), "weight", init)?;
    let bias = vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?;
    Ok(Linear::new(weight, Some(bias)))
}
