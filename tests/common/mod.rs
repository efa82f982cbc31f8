#![allow(dead_code)]

use ndarray::Array3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use xlm_rs::{TransformerConfig, TransformerModel, TransformerWeights};

pub const DIM: usize = 16;
pub const DIM_ENCODER: usize = 8;
pub const N_WORDS: usize = 12;

pub fn decoder_config() -> TransformerConfig {
    TransformerConfig::decoder(DIM, DIM_ENCODER, 2, 2, N_WORDS)
}

/// Small decoder with seeded random weights.
pub fn decoder(seed: u64) -> TransformerModel {
    let config = decoder_config();
    let mut rng = StdRng::seed_from_u64(seed);
    let weights = TransformerWeights::random(&config, &mut rng).unwrap();
    TransformerModel::new(config, weights).unwrap()
}

/// A decoder whose prediction layer always prefers the end marker.
pub fn eager_decoder(seed: u64) -> TransformerModel {
    let mut model = decoder(seed);
    let eos = model.config.eos_index as usize;
    model.pred_layer.as_mut().unwrap().bias[eos] = 1e4;
    model
}

/// Random source encodings `[batch, max(lengths), DIM_ENCODER]`, zero past each length.
pub fn source(lengths: &[usize], seed: u64) -> Array3<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let slen = lengths.iter().copied().max().unwrap_or(0);
    Array3::from_shape_fn((lengths.len(), slen, DIM_ENCODER), |(b, t, _)| {
        let v: f32 = rng.random_range(-1.0..1.0);
        if t < lengths[b] { v } else { 0.0 }
    })
}
