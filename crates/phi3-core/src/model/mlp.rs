//! Gated feed-forward block.
//!
//! Two parallel projections lift the hidden state to the intermediate size;
//! the activated gate multiplies the "up" signal elementwise before the down
//! projection. With SiLU this is SwiGLU.
//!
//! # Formula
//!
//! `GatedMlp(x) = (up(x) * act(gate(x))) @ down`
//!
//! # Reference
//!
//! [GLU Variants Improve Transformer](https://arxiv.org/abs/2002.05202)

use super::{linear_no_bias, ModelConfig};
use crate::error::Result;
use candle_core::{Module, Tensor};
use candle_nn::{Activation, Linear, VarBuilder};

/// Gated MLP block.
#[derive(Debug, Clone)]
pub struct GatedMlp {
    /// Gate projection: hidden -> intermediate
    gate_proj: Linear,
    /// Up projection: hidden -> intermediate
    up_proj: Linear,
    /// Down projection: intermediate -> hidden
    down_proj: Linear,
    /// Gate activation.
    activation: Activation,
}

impl GatedMlp {
    /// Load `gate_proj`, `up_proj` and `down_proj` under `vb`.
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        let intermediate = config.intermediate_size;
        let std = config.initializer_range;

        Ok(Self {
            gate_proj: linear_no_bias(hidden, intermediate, std, vb.pp("gate_proj"))?,
            up_proj: linear_no_bias(hidden, intermediate, std, vb.pp("up_proj"))?,
            down_proj: linear_no_bias(intermediate, hidden, std, vb.pp("down_proj"))?,
            activation: config.hidden_act,
        })
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [batch, seq, hidden_size]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = self.activation.forward(&self.gate_proj.forward(x)?)?;
        let up = self.up_proj.forward(x)?;
        Ok(self.down_proj.forward(&(up * gate)?)?)
    }

    /// Get the hidden size.
    pub fn hidden_size(&self) -> usize {
        self.down_proj.weight().dims()[0]
    }

    /// Get the intermediate size.
    pub fn intermediate_size(&self) -> usize {
        self.up_proj.weight().dims()[0]
    }
}
