//! Multi-head scaled dot-product attention with incremental caching.

use crate::cache::AttentionCache;
use crate::error::{Result, XlmError};
use crate::mask::AttentionMask;
use crate::ops::{dropout, softmax_rows};
use crate::weights::AttentionWeights;
use ndarray::{Array2, Array3, Array4, Axis, s};
use rand::RngCore;
use rayon::prelude::*;

/// One attention module. Self-attention when called without a key/value
/// source, attention over a source sentence otherwise.
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    /// Slot of this module in an [`AttentionCache`]
    pub layer_id: usize,
    pub dim: usize,
    pub dim_kv: usize,
    pub n_heads: usize,
    pub dropout: f32,
    pub weights: AttentionWeights,
}

impl MultiHeadAttention {
    pub fn new(
        layer_id: usize,
        n_heads: usize,
        dim: usize,
        dim_kv: usize,
        dropout: f32,
        weights: AttentionWeights,
    ) -> Result<Self> {
        if n_heads == 0 || dim % n_heads != 0 {
            return Err(XlmError::Config(format!(
                "attention dim {dim} must be a multiple of n_heads {n_heads}"
            )));
        }
        let shapes = [
            ("q_lin", &weights.q_lin, (dim, dim)),
            ("k_lin", &weights.k_lin, (dim, dim_kv)),
            ("v_lin", &weights.v_lin, (dim, dim_kv)),
            ("out_lin", &weights.out_lin, (dim, dim)),
        ];
        for (name, lin, expected) in shapes {
            if lin.weight.dim() != expected || lin.bias.len() != expected.0 {
                return Err(XlmError::ShapeViolation(format!(
                    "layer {layer_id} {name}: expected weight {expected:?}, got {:?}",
                    lin.weight.dim()
                )));
            }
        }
        Ok(MultiHeadAttention {
            layer_id,
            dim,
            dim_kv,
            n_heads,
            dropout,
            weights,
        })
    }

    #[inline]
    pub fn head_size(&self) -> usize {
        self.dim / self.n_heads
    }

    /// Attention for `input` `[batch, q_len, dim]`.
    ///
    /// `kv` is the `[batch, src_len, dim_kv]` source for source attention.
    /// With a cache, self-attention appends the new keys/values to this
    /// layer's slot; source attention projects the source once and reuses
    /// the cached projection on later calls.
    pub fn forward(
        &self,
        input: &Array3<f32>,
        mask: &AttentionMask,
        kv: Option<&Array3<f32>>,
        cache: Option<&mut AttentionCache>,
        train_rng: Option<&mut dyn RngCore>,
    ) -> Result<Array3<f32>> {
        let (bs, _, dim) = input.dim();
        if dim != self.dim {
            return Err(XlmError::ShapeViolation(format!(
                "dimensions do not match: {dim} input vs {} configured",
                self.dim
            )));
        }

        let q = self.shape(self.weights.q_lin.forward_3d(input)?)?;

        match kv {
            None => {
                let k = self.shape(self.weights.k_lin.forward_3d(input)?)?;
                let v = self.shape(self.weights.v_lin.forward_3d(input)?)?;
                let Some(cache) = cache else {
                    return self.attend(&q, &k, &v, mask, train_rng);
                };
                let (k, v) = match cache.get(self.layer_id)? {
                    Some(prev) => {
                        if prev.batch_size() != bs || prev.seq_len() != cache.slen() {
                            return Err(XlmError::State(format!(
                                "layer {}: cached keys cover batch {} x {} steps, \
                                 call has batch {bs} after {} steps",
                                self.layer_id,
                                prev.batch_size(),
                                prev.seq_len(),
                                cache.slen()
                            )));
                        }
                        (
                            ndarray::concatenate(Axis(2), &[prev.k.view(), k.view()])?,
                            ndarray::concatenate(Axis(2), &[prev.v.view(), v.view()])?,
                        )
                    }
                    None => (k, v),
                };
                let context = self.attend(&q, &k, &v, mask, train_rng)?;
                cache.insert(self.layer_id, k, v)?;
                Ok(context)
            }
            Some(src) => match cache {
                Some(cache) => {
                    if cache.get(self.layer_id)?.is_none() {
                        let (k, v) = self.project_source(src)?;
                        cache.insert(self.layer_id, k, v)?;
                    }
                    let entry = cache.get(self.layer_id)?.ok_or_else(|| {
                        XlmError::State(format!("layer {}: source keys missing", self.layer_id))
                    })?;
                    if entry.batch_size() != bs {
                        return Err(XlmError::State(format!(
                            "layer {}: cached source keys cover batch {}, call has batch {bs}",
                            self.layer_id,
                            entry.batch_size()
                        )));
                    }
                    self.attend(&q, &entry.k, &entry.v, mask, train_rng)
                }
                None => {
                    let (k, v) = self.project_source(src)?;
                    self.attend(&q, &k, &v, mask, train_rng)
                }
            },
        }
    }

    fn project_source(&self, src: &Array3<f32>) -> Result<(Array4<f32>, Array4<f32>)> {
        let k = self.shape(self.weights.k_lin.forward_3d(src)?)?;
        let v = self.shape(self.weights.v_lin.forward_3d(src)?)?;
        Ok((k, v))
    }

    /// `[batch, len, dim]` -> `[batch, n_heads, len, head_size]`
    fn shape(&self, x: Array3<f32>) -> Result<Array4<f32>> {
        let (bs, len, _) = x.dim();
        let heads = x
            .into_shape_with_order((bs, len, self.n_heads, self.head_size()))?
            .permuted_axes([0, 2, 1, 3]);
        Ok(heads.as_standard_layout().into_owned())
    }

    fn attend(
        &self,
        q: &Array4<f32>,
        k: &Array4<f32>,
        v: &Array4<f32>,
        mask: &AttentionMask,
        train_rng: Option<&mut dyn RngCore>,
    ) -> Result<Array3<f32>> {
        let (bs, n_heads, q_len, head_size) = q.dim();
        let k_len = k.dim().2;
        mask.check(bs, q_len, k_len)?;
        let scale = (head_size as f32).sqrt();

        let mut weights: Vec<Array2<f32>> = (0..bs * n_heads)
            .into_par_iter()
            .map(|i| {
                let (b, h) = (i / n_heads, i % n_heads);
                let q_bh = q.slice(s![b, h, .., ..]).mapv(|x| x / scale);
                let mut scores = q_bh.dot(&k.slice(s![b, h, .., ..]).t());
                for ((qi, ki), score) in scores.indexed_iter_mut() {
                    if !mask.allows(b, qi, ki) {
                        *score = f32::NEG_INFINITY;
                    }
                }
                softmax_rows(&mut scores);
                scores
            })
            .collect();

        if let Some(rng) = train_rng {
            for w in weights.iter_mut() {
                dropout(w, self.dropout, rng);
            }
        }

        let heads: Vec<Array2<f32>> = weights
            .par_iter()
            .enumerate()
            .map(|(i, w)| w.dot(&v.slice(s![i / n_heads, i % n_heads, .., ..])))
            .collect();

        let mut context = Array3::zeros((bs, q_len, n_heads * head_size));
        for (i, out) in heads.into_iter().enumerate() {
            let (b, h) = (i / n_heads, i % n_heads);
            context
                .slice_mut(s![b, .., h * head_size..(h + 1) * head_size])
                .assign(&out);
        }

        self.weights.out_lin.forward_3d(&context)
    }
}
