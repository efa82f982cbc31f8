//! Core tensor operations for XLM inference.

use ndarray::{Array, Array1, Array2, Array3, ArrayView2, Axis, Dimension, Zip};
use rand::{Rng, RngCore};
use std::f32::consts::FRAC_1_SQRT_2;

/// LayerNorm epsilon used by every normalization in the model.
pub const LAYER_NORM_EPS: f32 = 1e-12;

/// FFN activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activation {
    /// Exact GELU, `0.5 * x * (1 + erf(x / sqrt(2)))`
    #[default]
    Gelu,
    Relu,
}

impl Activation {
    pub fn apply<D: Dimension>(self, x: &mut Array<f32, D>) {
        match self {
            Activation::Gelu => x.par_mapv_inplace(gelu),
            Activation::Relu => x.par_mapv_inplace(relu),
        }
    }
}

#[inline]
pub fn gelu(x: f32) -> f32 {
    0.5 * x * (1.0 + libm::erff(x * FRAC_1_SQRT_2))
}

#[inline]
pub fn relu(x: f32) -> f32 {
    x.max(0.0)
}

/// Layer normalization over the last axis.
pub fn layer_norm(x: &Array3<f32>, weight: &Array1<f32>, bias: &Array1<f32>) -> Array3<f32> {
    let mut out = x.clone();
    for mut row in out.lanes_mut(Axis(2)) {
        let n = row.len() as f32;
        let mean = row.sum() / n;
        let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
        let inv = 1.0 / (var + LAYER_NORM_EPS).sqrt();
        for ((v, w), b) in row.iter_mut().zip(weight.iter()).zip(bias.iter()) {
            *v = w * ((*v - mean) * inv) + b;
        }
    }
    out
}

/// Affine projection: x @ w.T + b (w is [out, in]).
#[inline]
pub fn linear(x: &ArrayView2<f32>, weight: &Array2<f32>, bias: &Array1<f32>) -> Array2<f32> {
    let mut out = x.dot(&weight.t());
    out += bias;
    out
}

/// Softmax in-place. A slice that is entirely `-inf` becomes all zeros.
#[inline]
pub fn softmax(x: &mut [f32]) {
    if x.is_empty() {
        return;
    }
    let max_val = x.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if max_val == f32::NEG_INFINITY {
        x.fill(0.0);
        return;
    }
    let mut sum = 0.0f32;
    for xi in x.iter_mut() {
        *xi = (*xi - max_val).exp();
        sum += *xi;
    }
    for xi in x.iter_mut() {
        *xi /= sum;
    }
}

/// Row-wise softmax with the same fully-masked-row rule as [`softmax`].
pub fn softmax_rows(scores: &mut Array2<f32>) {
    for mut row in scores.rows_mut() {
        let max_val = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        if max_val == f32::NEG_INFINITY {
            row.fill(0.0);
            continue;
        }
        row.mapv_inplace(|v| (v - max_val).exp());
        let sum = row.sum();
        row /= sum;
    }
}

/// Row-wise log-softmax.
pub fn log_softmax_rows(logits: &Array2<f32>) -> Array2<f32> {
    let mut out = logits.clone();
    for mut row in out.rows_mut() {
        let max_val = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        let log_sum = row.iter().map(|&v| (v - max_val).exp()).sum::<f32>().ln() + max_val;
        row.mapv_inplace(|v| v - log_sum);
    }
    out
}

/// Inverted dropout: zero with probability `p`, scale survivors by `1 / (1 - p)`.
pub fn dropout<D: Dimension>(x: &mut Array<f32, D>, p: f32, rng: &mut dyn RngCore) {
    if p <= 0.0 {
        return;
    }
    let scale = 1.0 / (1.0 - p);
    for v in x.iter_mut() {
        if rng.random::<f32>() < p {
            *v = 0.0;
        } else {
            *v *= scale;
        }
    }
}

/// Zero every (batch, time) row whose mask entry is false.
pub fn apply_mask(tensor: &mut Array3<f32>, mask: &Array2<bool>) {
    Zip::from(tensor.lanes_mut(Axis(2)))
        .and(mask)
        .for_each(|mut row, &keep| {
            if !keep {
                row.fill(0.0);
            }
        });
}

/// Returns the index of the maximum element (first one on ties).
#[inline]
pub fn argmax(x: &[f32]) -> usize {
    let mut max_idx = 0;
    let mut max_val = x[0];
    for (i, &v) in x.iter().enumerate().skip(1) {
        if v > max_val {
            max_val = v;
            max_idx = i;
        }
    }
    max_idx
}

/// The `k` largest values with their indices, sorted descending.
/// Ties keep the lower index first.
pub fn top_k(values: &[f32], k: usize) -> Vec<(usize, f32)> {
    let k = k.min(values.len());
    if k == 0 {
        return Vec::new();
    }
    let cmp = |a: &usize, b: &usize| values[*b].total_cmp(&values[*a]).then(a.cmp(b));
    let mut idx: Vec<usize> = (0..values.len()).collect();
    if k < idx.len() {
        idx.select_nth_unstable_by(k - 1, cmp);
        idx.truncate(k);
    }
    idx.sort_unstable_by(cmp);
    idx.into_iter().map(|i| (i, values[i])).collect()
}
