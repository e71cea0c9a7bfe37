//! Rotary Position Embeddings (RoPE).
//!
//! RoPE encodes position information by rotating query and key vectors
//! in the complex plane. Only the first `rotary_dim` dimensions of every
//! head are rotated; the rest pass through unchanged.
//!
//! With a LongRoPE scaling strategy the base frequencies are divided by a
//! per-dimension factor: the short set while the sequence fits the original
//! context, the long set beyond it. Cos and sin are then multiplied by the
//! attention factor `sqrt(1 + ln(s) / ln(original))`, `s` being the context
//! extension ratio.
//!
//! # Reference
//!
//! [RoFormer: Enhanced Transformer with Rotary Position Embedding](https://arxiv.org/abs/2104.09864),
//! [LongRoPE: Extending LLM Context Window Beyond 2 Million Tokens](https://arxiv.org/abs/2402.13753)

use super::{ModelConfig, RopeScaling};
use crate::error::Result;
use candle_core::{DType, Device, Tensor};

/// Per-dimension frequency schedule and its device copy.
#[derive(Debug, Clone)]
struct Schedule {
    values: Vec<f32>,
    tensor: Tensor,
}

impl Schedule {
    fn new(values: Vec<f32>, device: &Device) -> Result<Self> {
        let tensor = Tensor::from_slice(&values, (1, 1, values.len()), device)?;
        Ok(Self { values, tensor })
    }
}

/// Rotary Position Embedding implementation.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    /// Schedule for unscaled rope, or the short factors under LongRoPE.
    short: Schedule,
    /// Long-factor schedule, present only under LongRoPE.
    long: Option<Schedule>,
    /// Sequence length up to which the short schedule applies.
    original_max_positions: Option<usize>,
    /// Multiplier applied to cos and sin.
    attention_factor: f64,
    /// Rotated dimensions per head.
    rotary_dim: usize,
    /// Head dimension.
    head_dim: usize,
}

impl RotaryEmbedding {
    /// Create the rotary embedding for a validated config.
    pub fn new(config: &ModelConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let rotary_dim = config.rotary_dim();
        let head_dim = config.head_dim();

        // Inverse frequencies: 1 / (theta^(2i/d)) for i in [0, d/2)
        let base: Vec<f64> = (0..rotary_dim / 2)
            .map(|i| 1.0 / config.rope_theta.powf(2.0 * i as f64 / rotary_dim as f64))
            .collect();
        let scaled = |factors: &[f64]| -> Vec<f32> {
            base.iter()
                .zip(factors)
                .map(|(freq, factor)| (freq / factor) as f32)
                .collect()
        };

        let (short, long, attention_factor) = match &config.rope_scaling {
            None => {
                let plain = base.iter().map(|&f| f as f32).collect();
                (Schedule::new(plain, device)?, None, 1.0)
            }
            Some(RopeScaling::LongRope {
                short_factor,
                long_factor,
                ..
            }) => {
                let original = config.original_max_positions().unwrap_or(1) as f64;
                let extension = config.max_position_embeddings as f64 / original;
                let attention_factor = if extension <= 1.0 {
                    1.0
                } else {
                    (1.0 + extension.ln() / original.ln()).sqrt()
                };
                (
                    Schedule::new(scaled(short_factor), device)?,
                    Some(Schedule::new(scaled(long_factor), device)?),
                    attention_factor,
                )
            }
        };

        tracing::debug!(
            rotary_dim,
            head_dim,
            longrope = long.is_some(),
            attention_factor,
            "rotary embedding ready"
        );

        Ok(Self {
            short,
            long,
            original_max_positions: config.original_max_positions(),
            attention_factor,
            rotary_dim,
            head_dim,
        })
    }

    fn schedule(&self, seq_len: usize) -> &Schedule {
        match (&self.long, self.original_max_positions) {
            (Some(long), Some(original)) if seq_len > original => long,
            _ => &self.short,
        }
    }

    /// Inverse frequencies used for a sequence of `seq_len` positions.
    pub fn inverse_frequencies(&self, seq_len: usize) -> &[f32] {
        &self.schedule(seq_len).values
    }

    /// Cos/sin tables for `position_ids` of shape [batch, seq_len].
    ///
    /// Returns two tensors of shape [batch, seq_len, rotary_dim / 2]. The
    /// schedule is chosen from the largest position in the batch.
    pub fn cos_sin(&self, position_ids: &Tensor) -> Result<(Tensor, Tensor)> {
        let positions = position_ids.to_dtype(DType::F32)?;
        let max_position = positions.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        let seq_len = max_position.max(0.0) as usize + 1;

        // freqs = positions * inv_freq -> [batch, seq_len, half_dim]
        let inv_freq = &self.schedule(seq_len).tensor;
        let freqs = positions.unsqueeze(2)?.broadcast_mul(inv_freq)?;

        let cos = freqs.cos()?;
        let sin = freqs.sin()?;
        if self.attention_factor == 1.0 {
            Ok((cos, sin))
        } else {
            Ok(((cos * self.attention_factor)?, (sin * self.attention_factor)?))
        }
    }

    /// Apply rotary embeddings to query and key tensors.
    ///
    /// # Arguments
    ///
    /// * `query` - Query tensor [batch, num_heads, seq_len, head_dim]
    /// * `key` - Key tensor [batch, num_kv_heads, seq_len, head_dim]
    /// * `cos`, `sin` - Tables from [`RotaryEmbedding::cos_sin`]
    pub fn apply(
        &self,
        query: &Tensor,
        key: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let query_rot = self.rotate(query, cos, sin)?;
        let key_rot = self.rotate(key, cos, sin)?;
        Ok((query_rot, key_rot))
    }

    /// Rotate the leading `rotary_dim` dims of `x` using cos/sin embeddings.
    fn rotate(&self, x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let half_dim = self.rotary_dim / 2;
        let head_dim = x.dim(3)?;

        // [batch, seq_len, half_dim] -> [batch, 1, seq_len, half_dim]
        let cos = cos.unsqueeze(1)?.to_dtype(x.dtype())?;
        let sin = sin.unsqueeze(1)?.to_dtype(x.dtype())?;

        let x1 = x.narrow(3, 0, half_dim)?;
        let x2 = x.narrow(3, half_dim, half_dim)?;

        // Apply rotation: [x1, x2] -> [x1*cos - x2*sin, x2*cos + x1*sin]
        let out1 = (x1.broadcast_mul(&cos)? - x2.broadcast_mul(&sin)?)?;
        let out2 = (x2.broadcast_mul(&cos)? + x1.broadcast_mul(&sin)?)?;

        if self.rotary_dim == head_dim {
            Ok(Tensor::cat(&[out1, out2], 3)?)
        } else {
            let pass = x.narrow(3, self.rotary_dim, head_dim - self.rotary_dim)?;
            Ok(Tensor::cat(&[out1, out2, pass], 3)?)
        }
    }

    /// Rotated dimensions per head.
    pub fn rotary_dim(&self) -> usize {
        self.rotary_dim
    }

    /// Get the head dimension.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Multiplier applied to cos and sin.
    pub fn attention_factor(&self) -> f64 {
        self.attention_factor
    }
}
