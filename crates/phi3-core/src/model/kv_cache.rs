//! KV cache for incremental decoding.
//!
//! One fixed-length key buffer and one value buffer per decoder block, each
//! shaped [batch, max_length, num_kv_heads, head_dim] and zero-filled at
//! creation. All blocks share a single write cursor: during a step every
//! block writes its new positions at the cursor, and the cursor advances
//! once the last block has appended.
//!
//! Buffers are written in place, so the cache is not `Clone`: a second
//! session branching off this one must use [`KvCache::fork`].

use super::ModelConfig;
use crate::error::{Phi3Error, Result};
use candle_core::{DType, Device, Tensor};

/// KV buffers for a single block.
#[derive(Debug)]
struct LayerCache {
    /// Keys: [batch, max_length, num_kv_heads, head_dim]
    key: Tensor,
    /// Values: [batch, max_length, num_kv_heads, head_dim]
    value: Tensor,
    /// Whether this block already wrote during the current step.
    appended: bool,
}

/// Per-session KV cache for all blocks.
pub struct KvCache {
    /// Per-block buffers.
    layers: Vec<LayerCache>,
    /// Number of valid positions, shared by every block.
    cursor: usize,
    /// Width of the step in progress, fixed by its first append.
    step_width: Option<usize>,
    batch_size: usize,
    max_length: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl KvCache {
    /// Allocate zero-filled buffers for `batch_size` sequences of up to
    /// `max_length` positions.
    pub fn new(
        config: &ModelConfig,
        batch_size: usize,
        max_length: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        if batch_size == 0 || max_length == 0 {
            return Err(Phi3Error::ShapeMismatch(format!(
                "cache needs a non-empty shape, got batch {batch_size} x length {max_length}"
            )));
        }
        let num_kv_heads = config.num_kv_heads();
        let head_dim = config.head_dim();
        let shape = (batch_size, max_length, num_kv_heads, head_dim);

        let layers = (0..config.num_hidden_layers)
            .map(|_| {
                Ok(LayerCache {
                    key: Tensor::zeros(shape, dtype, device)?,
                    value: Tensor::zeros(shape, dtype, device)?,
                    appended: false,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(
            num_blocks = layers.len(),
            batch_size,
            max_length,
            num_kv_heads,
            head_dim,
            "kv cache allocated"
        );

        Ok(Self {
            layers,
            cursor: 0,
            step_width: None,
            batch_size,
            max_length,
            num_kv_heads,
            head_dim,
        })
    }

    /// Write new keys/values for `block_id` at the cursor.
    ///
    /// `keys` and `values` are [batch, n, num_kv_heads, head_dim]. Returns
    /// the valid range `[0, cursor + n)` of this block's buffers. The shared
    /// cursor moves forward by `n` once every block has appended.
    pub fn append(
        &mut self,
        block_id: usize,
        keys: &Tensor,
        values: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let num_blocks = self.layers.len();
        let expected = (self.batch_size, self.num_kv_heads, self.head_dim);
        let (batch, new_len, heads, dim) = keys.dims4()?;
        if (batch, heads, dim) != expected || values.dims() != keys.dims() {
            return Err(Phi3Error::ShapeMismatch(format!(
                "cache expects [{}, n, {}, {}], got keys {:?} and values {:?}",
                self.batch_size,
                self.num_kv_heads,
                self.head_dim,
                keys.dims(),
                values.dims()
            )));
        }
        if new_len == 0 {
            return Err(Phi3Error::ShapeMismatch(
                "append needs at least one position".to_string(),
            ));
        }
        if let Some(width) = self.step_width {
            if width != new_len {
                return Err(Phi3Error::CacheError(format!(
                    "block {block_id} appends {new_len} positions, step started with {width}"
                )));
            }
        }
        let end = self.cursor + new_len;
        if end > self.max_length {
            return Err(Phi3Error::CacheOverflow {
                requested: end,
                max_length: self.max_length,
            });
        }

        let cursor = self.cursor;
        let layer = self.layers.get_mut(block_id).ok_or_else(|| {
            Phi3Error::CacheError(format!("block {block_id} out of range (0..{num_blocks})"))
        })?;
        if layer.appended {
            return Err(Phi3Error::CacheError(format!(
                "block {block_id} already appended at cursor {cursor}"
            )));
        }

        let keys = keys.to_dtype(layer.key.dtype())?.contiguous()?;
        let values = values.to_dtype(layer.value.dtype())?.contiguous()?;
        layer.key.slice_set(&keys, 1, cursor)?;
        layer.value.slice_set(&values, 1, cursor)?;
        layer.appended = true;

        let valid = (layer.key.narrow(1, 0, end)?, layer.value.narrow(1, 0, end)?);

        self.step_width = Some(new_len);
        if self.layers.iter().all(|l| l.appended) {
            self.commit(end);
        }

        Ok(valid)
    }

    fn commit(&mut self, end: usize) {
        tracing::trace!(from = self.cursor, to = end, "kv cache step committed");
        self.cursor = end;
        self.step_width = None;
        for layer in &mut self.layers {
            layer.appended = false;
        }
    }

    /// Drop the partial writes of a step that did not reach every block.
    ///
    /// The cursor stays where the last committed step left it; positions
    /// written past it are overwritten by the next step.
    pub fn abort_step(&mut self) {
        if self.step_width.is_some() {
            tracing::debug!(cursor = self.cursor, "kv cache step aborted");
        }
        self.step_width = None;
        for layer in &mut self.layers {
            layer.appended = false;
        }
    }

    /// Deep copy with its own buffers, for branching a session.
    pub fn fork(&self) -> Result<Self> {
        self.traverse(|t| t.copy())
    }

    /// Apply `f` to every stored buffer (keys then values, block order) and
    /// build an equivalent cache from the results.
    ///
    /// `f` must keep each buffer's shape. The rebuilt cache owns whatever
    /// `f` returns; return `Tensor::copy` results when both caches stay in
    /// use, since plain clones share storage.
    pub fn traverse<F>(&self, mut f: F) -> Result<Self>
    where
        F: FnMut(&Tensor) -> candle_core::Result<Tensor>,
    {
        let mut layers = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let key = f(&layer.key)?;
            let value = f(&layer.value)?;
            if key.dims() != layer.key.dims() || value.dims() != layer.value.dims() {
                return Err(Phi3Error::ShapeMismatch(format!(
                    "traverse changed buffer shape {:?} to {:?}",
                    layer.key.dims(),
                    key.dims()
                )));
            }
            layers.push(LayerCache {
                key,
                value,
                appended: layer.appended,
            });
        }

        Ok(Self {
            layers,
            cursor: self.cursor,
            step_width: self.step_width,
            batch_size: self.batch_size,
            max_length: self.max_length,
            num_kv_heads: self.num_kv_heads,
            head_dim: self.head_dim,
        })
    }

    /// Forget every stored position and zero the buffers.
    pub fn reset(&mut self) -> Result<()> {
        for layer in &mut self.layers {
            layer.key = layer.key.zeros_like()?;
            layer.value = layer.value.zeros_like()?;
            layer.appended = false;
        }
        self.cursor = 0;
        self.step_width = None;
        Ok(())
    }

    /// Number of valid positions (the shared write cursor).
    pub fn seq_len(&self) -> usize {
        self.cursor
    }

    /// Check if cache is empty.
    pub fn is_empty(&self) -> bool {
        self.cursor == 0
    }

    /// Allocated length.
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Positions left before the cache overflows.
    pub fn remaining(&self) -> usize {
        self.max_length - self.cursor
    }

    /// Batch size the cache was created for.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Get number of blocks.
    pub fn num_blocks(&self) -> usize {
        self.layers.len()
    }
}

impl std::fmt::Debug for KvCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvCache")
            .field("num_blocks", &self.layers.len())
            .field("batch_size", &self.batch_size)
            .field("max_length", &self.max_length)
            .field("cursor", &self.cursor)
            .finish()
    }
}
