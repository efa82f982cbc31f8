//! Incremental key/value cache shared by every attention module of a model.

use crate::error::{Result, XlmError};
use ndarray::{Array4, Axis};
use rayon::prelude::*;

/// Cached keys and values of one attention module.
#[derive(Debug, Clone)]
pub struct LayerCache {
    /// Keys `[batch, n_heads, cached_len, head_size]`
    pub k: Array4<f32>,
    /// Values `[batch, n_heads, cached_len, head_size]`
    pub v: Array4<f32>,
}

impl LayerCache {
    #[inline]
    pub fn batch_size(&self) -> usize {
        self.k.dim().0
    }

    /// Number of cached time steps (source length for source attention).
    #[inline]
    pub fn seq_len(&self) -> usize {
        self.k.dim().2
    }
}

/// Per-call decoding state, one slot per attention module.
///
/// Attention modules address their slot with the layer id they were built
/// with. `slen` counts the time steps folded into every self-attention slot
/// and only moves through [`AttentionCache::advance`].
#[derive(Debug, Clone)]
pub struct AttentionCache {
    slen: usize,
    layers: Vec<Option<LayerCache>>,
}

impl AttentionCache {
    /// An empty cache with `n_slots` attention slots.
    pub fn new(n_slots: usize) -> Self {
        AttentionCache {
            slen: 0,
            layers: vec![None; n_slots],
        }
    }

    /// Number of time steps already processed.
    #[inline]
    pub fn slen(&self) -> usize {
        self.slen
    }

    #[inline]
    pub fn n_slots(&self) -> usize {
        self.layers.len()
    }

    /// Batch size of the cached tensors, if anything is cached yet.
    pub fn batch_size(&self) -> Option<usize> {
        self.layers.iter().flatten().map(LayerCache::batch_size).next()
    }

    pub fn get(&self, layer_id: usize) -> Result<Option<&LayerCache>> {
        self.layers
            .get(layer_id)
            .map(Option::as_ref)
            .ok_or_else(|| missing_slot(layer_id, self.layers.len()))
    }

    pub fn insert(&mut self, layer_id: usize, k: Array4<f32>, v: Array4<f32>) -> Result<()> {
        let n_slots = self.layers.len();
        let slot = self
            .layers
            .get_mut(layer_id)
            .ok_or_else(|| missing_slot(layer_id, n_slots))?;
        *slot = Some(LayerCache { k, v });
        Ok(())
    }

    /// Record `n` newly processed time steps.
    pub fn advance(&mut self, n: usize) {
        self.slen += n;
    }

    /// Rebuild every cached tensor along the batch axis: row `i` of the result
    /// is row `indices[i]` of the current cache. Rows may repeat or vanish.
    ///
    /// Used both for beam reordering and for shrinking the active batch, so
    /// the caller must apply the same `indices` to any tensor it keeps
    /// aligned with the cache.
    pub fn reindex(&mut self, indices: &[usize]) -> Result<()> {
        for (layer_id, entry) in self.layers.iter().enumerate() {
            let Some(entry) = entry else { continue };
            let batch = entry.batch_size();
            if let Some(&bad) = indices.iter().find(|&&i| i >= batch) {
                return Err(XlmError::State(format!(
                    "reindex of layer {layer_id}: index {bad} out of range for a cached batch of {batch}"
                )));
            }
        }
        self.layers
            .par_iter_mut()
            .filter_map(Option::as_mut)
            .for_each(|entry| {
                entry.k = entry.k.select(Axis(0), indices);
                entry.v = entry.v.select(Axis(0), indices);
            });
        Ok(())
    }
}

fn missing_slot(layer_id: usize, n_slots: usize) -> XlmError {
    XlmError::State(format!(
        "attention layer {layer_id} has no slot in a cache of {n_slots} slots; \
         the cache was created for a different model"
    ))
}
