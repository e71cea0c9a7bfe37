//! # Phi-3 Core
//!
//! Computational core of a Phi-3 decoder-only language model on candle.
//!
//! This crate provides:
//! - **Model graph** built from named parameter slots through a `VarBuilder`
//! - **Rotary embeddings** with partial rotation and LongRoPE scaling
//! - **Grouped-query attention** with causal order and an optional sliding window
//! - **Incremental KV cache** shared by all blocks of a decoding session
//! - **Output heads** for language modeling and sequence/token classification

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod error;
pub mod model;

pub use error::{Phi3Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{Phi3Error, Result};
    pub use crate::model::{
        Architecture, ForwardInputs, KvCache, ModelConfig, ModelOutput, Phi3Model, RopeScaling,
    };
    pub use tracing;
}
