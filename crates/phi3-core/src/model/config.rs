//! Model configuration.
//!
//! Field names follow the Hugging Face `config.json` convention so real
//! checkpoint configs deserialize directly. Unknown keys are ignored.

use crate::error::{Phi3Error, Result};
use candle_nn::Activation;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;

/// Output head selected at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Architecture {
    /// Normalized hidden states, no projection.
    #[serde(alias = "Phi3Model")]
    Base,
    /// Per-position logits over the vocabulary.
    #[default]
    #[serde(alias = "Phi3ForCausalLM")]
    CausalLm,
    /// One row of label logits per sequence.
    #[serde(alias = "Phi3ForSequenceClassification")]
    SequenceClassification,
    /// Label logits per position.
    #[serde(alias = "Phi3ForTokenClassification")]
    TokenClassification,
}

/// Either a bare tag or a Hugging Face `architectures` list.
#[derive(Deserialize)]
#[serde(untagged)]
enum ArchitectureField {
    One(Architecture),
    List(Vec<Architecture>),
}

fn deserialize_architecture<'de, D>(deserializer: D) -> std::result::Result<Architecture, D::Error>
where
    D: Deserializer<'de>,
{
    match ArchitectureField::deserialize(deserializer)? {
        ArchitectureField::One(architecture) => Ok(architecture),
        ArchitectureField::List(list) => list
            .first()
            .copied()
            .ok_or_else(|| serde::de::Error::custom("`architectures` is empty")),
    }
}

/// Rotary frequency scaling strategy.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RopeScalingPayload")]
pub enum RopeScaling {
    /// LongRoPE: per-dimension frequency divisors, short set up to
    /// `original_max_position_embeddings`, long set beyond it.
    LongRope {
        /// Divisors used while the sequence fits the original context.
        short_factor: Vec<f64>,
        /// Divisors used past the original context.
        long_factor: Vec<f64>,
        /// Context length the short factors were tuned for.
        original_max_position_embeddings: Option<usize>,
    },
}

#[derive(Deserialize)]
struct RopeScalingPayload {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    rope_type: Option<String>,
    #[serde(default)]
    short_factor: Option<Vec<f64>>,
    #[serde(default)]
    long_factor: Option<Vec<f64>>,
    #[serde(default)]
    original_max_position_embeddings: Option<usize>,
}

impl TryFrom<RopeScalingPayload> for RopeScaling {
    type Error = Phi3Error;

    fn try_from(payload: RopeScalingPayload) -> Result<Self> {
        let kind = payload
            .kind
            .or(payload.rope_type)
            .ok_or_else(|| Phi3Error::config("rope_scaling", "missing `type`"))?;
        match kind.as_str() {
            "longrope" | "su" => {
                let short_factor = payload
                    .short_factor
                    .ok_or_else(|| Phi3Error::config("rope_scaling", "missing `short_factor`"))?;
                let long_factor = payload
                    .long_factor
                    .ok_or_else(|| Phi3Error::config("rope_scaling", "missing `long_factor`"))?;
                Ok(Self::LongRope {
                    short_factor,
                    long_factor,
                    original_max_position_embeddings: payload.original_max_position_embeddings,
                })
            }
            other => Err(Phi3Error::config(
                "rope_scaling",
                format!("unsupported scaling type `{other}`"),
            )),
        }
    }
}

fn default_activation() -> Activation {
    Activation::Silu
}

fn default_partial_rotary_factor() -> f64 {
    1.0
}

fn default_rope_theta() -> f64 {
    10000.0
}

fn default_rms_norm_eps() -> f64 {
    1e-5
}

fn default_initializer_range() -> f64 {
    0.02
}

/// Configuration for a Phi-3 model.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelConfig {
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Hidden dimension.
    pub hidden_size: usize,
    /// Intermediate dimension (FFN).
    pub intermediate_size: usize,
    /// Number of decoder blocks.
    pub num_hidden_layers: usize,
    /// Number of attention heads.
    pub num_attention_heads: usize,
    /// Number of KV heads; `None` means one per attention head.
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    /// Maximum sequence length.
    pub max_position_embeddings: usize,
    /// Attention looks back at most this many positions.
    #[serde(default)]
    pub sliding_window: Option<usize>,
    /// FFN gate activation.
    #[serde(default = "default_activation")]
    pub hidden_act: Activation,
    /// Fraction of each head rotated by RoPE.
    #[serde(default = "default_partial_rotary_factor")]
    pub partial_rotary_factor: f64,
    /// Rope theta.
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    /// Optional long-context scaling.
    #[serde(default)]
    pub rope_scaling: Option<RopeScaling>,
    /// Fallback for the longrope `original_max_position_embeddings`.
    #[serde(default)]
    pub original_max_position_embeddings: Option<usize>,
    /// RMS norm epsilon.
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    /// Std of the normal init used for freshly created weights.
    #[serde(default = "default_initializer_range")]
    pub initializer_range: f64,
    /// Padding token id.
    #[serde(default)]
    pub pad_token_id: Option<u32>,
    /// Beginning-of-sequence token id.
    #[serde(default)]
    pub bos_token_id: Option<u32>,
    /// End-of-sequence token id.
    #[serde(default)]
    pub eos_token_id: Option<u32>,
    /// Number of classification labels.
    #[serde(default)]
    pub num_labels: Option<usize>,
    /// Label names by index.
    #[serde(default)]
    pub id2label: Option<BTreeMap<String, String>>,
    /// Dropout before the token classifier; 0.1 when unset.
    #[serde(default)]
    pub classifier_dropout: Option<f32>,
    /// Reuse the embedding table as the LM head.
    #[serde(default)]
    pub tie_word_embeddings: bool,
    /// Output head. Read from `architecture` or the first entry of
    /// `architectures`.
    #[serde(
        default,
        alias = "architectures",
        deserialize_with = "deserialize_architecture"
    )]
    pub architecture: Architecture,
}

impl ModelConfig {
    /// Calculate head dimension.
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Number of KV heads.
    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    /// Get GQA ratio.
    pub fn gqa_ratio(&self) -> usize {
        self.num_attention_heads / self.num_kv_heads()
    }

    /// Number of rotated dimensions per head.
    pub fn rotary_dim(&self) -> usize {
        (self.head_dim() as f64 * self.partial_rotary_factor).round() as usize
    }

    /// Number of classification labels.
    pub fn num_labels(&self) -> usize {
        match (&self.id2label, self.num_labels) {
            (Some(labels), _) => labels.len(),
            (None, Some(n)) => n,
            (None, None) => 2,
        }
    }

    /// Context length the longrope short factors apply to.
    pub fn original_max_positions(&self) -> Option<usize> {
        match &self.rope_scaling {
            Some(RopeScaling::LongRope {
                original_max_position_embeddings,
                ..
            }) => original_max_position_embeddings.or(self.original_max_position_embeddings),
            None => None,
        }
    }

    /// Load from JSON file.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Parse and validate a JSON config.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every hyperparameter constraint.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("vocab_size", self.vocab_size),
            ("hidden_size", self.hidden_size),
            ("intermediate_size", self.intermediate_size),
            ("num_hidden_layers", self.num_hidden_layers),
            ("num_attention_heads", self.num_attention_heads),
            ("num_key_value_heads", self.num_kv_heads()),
            ("max_position_embeddings", self.max_position_embeddings),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(Phi3Error::config(field, "must be greater than zero"));
            }
        }

        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(Phi3Error::config(
                "hidden_size",
                format!(
                    "{} is not divisible by num_attention_heads {}",
                    self.hidden_size, self.num_attention_heads
                ),
            ));
        }
        let kv_heads = self.num_kv_heads();
        if kv_heads > self.num_attention_heads || self.num_attention_heads % kv_heads != 0 {
            return Err(Phi3Error::config(
                "num_key_value_heads",
                format!(
                    "{kv_heads} must divide num_attention_heads {}",
                    self.num_attention_heads
                ),
            ));
        }

        if !(self.partial_rotary_factor > 0.0 && self.partial_rotary_factor <= 1.0) {
            return Err(Phi3Error::config(
                "partial_rotary_factor",
                format!("{} is outside (0, 1]", self.partial_rotary_factor),
            ));
        }
        let rotary_dim = self.rotary_dim();
        if rotary_dim < 2 || rotary_dim % 2 != 0 {
            return Err(Phi3Error::config(
                "partial_rotary_factor",
                format!(
                    "rotates {rotary_dim} of {} head dims; needs an even count of at least 2",
                    self.head_dim()
                ),
            ));
        }
        if !(self.rope_theta.is_finite() && self.rope_theta > 0.0) {
            return Err(Phi3Error::config("rope_theta", "must be finite and positive"));
        }
        if !(self.rms_norm_eps >= 0.0) {
            return Err(Phi3Error::config("rms_norm_eps", "must be non-negative"));
        }
        if let Some(p) = self.classifier_dropout {
            if !(0.0..1.0).contains(&p) {
                return Err(Phi3Error::config(
                    "classifier_dropout",
                    format!("{p} is outside [0, 1)"),
                ));
            }
        }
        if self.sliding_window == Some(0) {
            return Err(Phi3Error::config("sliding_window", "must be greater than zero"));
        }
        if let (Some(labels), Some(n)) = (&self.id2label, self.num_labels) {
            if labels.len() != n {
                return Err(Phi3Error::config(
                    "num_labels",
                    format!("{n} disagrees with {} id2label entries", labels.len()),
                ));
            }
        }
        if self.num_labels() == 0
            && matches!(
                self.architecture,
                Architecture::SequenceClassification | Architecture::TokenClassification
            )
        {
            return Err(Phi3Error::config("num_labels", "classification needs labels"));
        }

        if let Some(RopeScaling::LongRope {
            short_factor,
            long_factor,
            ..
        }) = &self.rope_scaling
        {
            let expected = rotary_dim / 2;
            for (name, factors) in [("short_factor", short_factor), ("long_factor", long_factor)] {
                if factors.len() != expected {
                    return Err(Phi3Error::config(
                        "rope_scaling",
                        format!("{name} has {} entries, expected {expected}", factors.len()),
                    ));
                }
                if let Some(bad) = factors.iter().find(|f| !(f.is_finite() && **f > 0.0)) {
                    return Err(Phi3Error::config(
                        "rope_scaling",
                        format!("{name} contains non-positive factor {bad}"),
                    ));
                }
            }
            match self.original_max_positions() {
                Some(n) if n > 0 => {}
                _ => {
                    return Err(Phi3Error::config(
                        "rope_scaling",
                        "longrope needs original_max_position_embeddings",
                    ))
                }
            }
        }

        Ok(())
    }

    /// Small configuration for tests, benches and demos.
    pub fn tiny() -> Self {
        Self {
            vocab_size: 64,
            hidden_size: 32,
            intermediate_size: 64,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            num_key_value_heads: Some(2),
            max_position_embeddings: 128,
            sliding_window: None,
            pad_token_id: Some(0),
            bos_token_id: Some(1),
            eos_token_id: Some(2),
            ..Self::default()
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        // Phi-3-mini-4k-like defaults
        Self {
            vocab_size: 32064,
            hidden_size: 3072,
            intermediate_size: 8192,
            num_hidden_layers: 32,
            num_attention_heads: 32,
            num_key_value_heads: Some(32),
            max_position_embeddings: 4096,
            sliding_window: Some(2047),
            hidden_act: Activation::Silu,
            partial_rotary_factor: 1.0,
            rope_theta: 10000.0,
            rope_scaling: None,
            original_max_position_embeddings: None,
            rms_norm_eps: 1e-5,
            initializer_range: 0.02,
            pad_token_id: Some(32000),
            bos_token_id: Some(1),
            eos_token_id: Some(32000),
            num_labels: None,
            id2label: None,
            classifier_dropout: None,
            tie_word_embeddings: false,
            architecture: Architecture::CausalLm,
        }
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    prop_compose! {
        fn arb_config()(
            num_kv_heads in prop::sample::select(vec![1usize, 2, 4, 8]),
            group in prop::sample::select(vec![1usize, 2, 4]),
            head_dim in prop::sample::select(vec![4usize, 8, 16, 64]),
        ) -> ModelConfig {
            let num_attention_heads = num_kv_heads * group;
            ModelConfig {
                hidden_size: num_attention_heads * head_dim,
                num_attention_heads,
                num_key_value_heads: Some(num_kv_heads),
                ..ModelConfig::tiny()
            }
        }
    }

    proptest! {
        /// Invariant: hidden_size == heads * head_dim and kv heads divide heads
        #[test]
        fn invariant_head_arithmetic(config in arb_config()) {
            prop_assert!(config.validate().is_ok());
            prop_assert_eq!(config.hidden_size, config.num_attention_heads * config.head_dim());
            prop_assert_eq!(config.num_attention_heads % config.num_kv_heads(), 0);
        }

        /// Invariant: any config that validates satisfies the head arithmetic
        #[test]
        fn invariant_validated_configs_divide(
            hidden_size in 1usize..256,
            heads in 1usize..16,
            kv_heads in 1usize..16,
        ) {
            let config = ModelConfig {
                hidden_size,
                num_attention_heads: heads,
                num_key_value_heads: Some(kv_heads),
                ..ModelConfig::tiny()
            };
            if config.validate().is_ok() {
                prop_assert_eq!(config.hidden_size, config.num_attention_heads * config.head_dim());
                prop_assert_eq!(config.num_attention_heads % config.num_kv_heads(), 0);
            }
        }
    }
}
