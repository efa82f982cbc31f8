//! Model weights for the XLM transformer.

use crate::config::{N_MAX_POSITIONS, TransformerConfig};
use crate::error::{Result, XlmError};
use crate::ops::{layer_norm, linear};
use ndarray::{Array1, Array2, Array3, ArrayView2};
use rand::Rng;
use rand_distr::{Distribution, Normal};

/// Affine projection parameters.
#[derive(Debug, Clone)]
pub struct LinearWeights {
    /// `[out_features, in_features]`
    pub weight: Array2<f32>,
    /// `[out_features]`
    pub bias: Array1<f32>,
}

impl LinearWeights {
    /// Uniform initialization in `±1 / sqrt(in_features)`.
    pub fn random<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        let bound = 1.0 / (in_features.max(1) as f32).sqrt();
        LinearWeights {
            weight: Array2::from_shape_simple_fn((out_features, in_features), || {
                rng.random_range(-bound..=bound)
            }),
            bias: Array1::from_shape_simple_fn(out_features, || rng.random_range(-bound..=bound)),
        }
    }

    #[inline]
    pub fn in_features(&self) -> usize {
        self.weight.dim().1
    }

    #[inline]
    pub fn out_features(&self) -> usize {
        self.weight.dim().0
    }

    pub fn forward(&self, x: &ArrayView2<f32>) -> Array2<f32> {
        linear(x, &self.weight, &self.bias)
    }

    /// Apply to the last axis of a `[batch, len, in_features]` tensor.
    pub fn forward_3d(&self, x: &Array3<f32>) -> Result<Array3<f32>> {
        let (bs, len, dim) = x.dim();
        if dim != self.in_features() {
            return Err(XlmError::ShapeViolation(format!(
                "linear layer expects {} input features, got {dim}",
                self.in_features()
            )));
        }
        let flat = x.to_shape((bs * len, dim))?;
        let out = self.forward(&flat.view());
        Ok(out.into_shape_with_order((bs, len, self.out_features()))?)
    }
}

/// LayerNorm parameters.
#[derive(Debug, Clone)]
pub struct LayerNormWeights {
    pub weight: Array1<f32>,
    pub bias: Array1<f32>,
}

impl LayerNormWeights {
    pub fn new(dim: usize) -> Self {
        LayerNormWeights {
            weight: Array1::ones(dim),
            bias: Array1::zeros(dim),
        }
    }

    pub fn forward(&self, x: &Array3<f32>) -> Array3<f32> {
        layer_norm(x, &self.weight, &self.bias)
    }
}

/// Query/key/value/output projections of one attention module.
#[derive(Debug, Clone)]
pub struct AttentionWeights {
    pub q_lin: LinearWeights,
    pub k_lin: LinearWeights,
    pub v_lin: LinearWeights,
    pub out_lin: LinearWeights,
}

impl AttentionWeights {
    /// Keys and values are projected from `dim_kv`-wide inputs.
    pub fn random<R: Rng + ?Sized>(dim: usize, dim_kv: usize, rng: &mut R) -> Self {
        AttentionWeights {
            q_lin: LinearWeights::random(dim, dim, rng),
            k_lin: LinearWeights::random(dim_kv, dim, rng),
            v_lin: LinearWeights::random(dim_kv, dim, rng),
            out_lin: LinearWeights::random(dim, dim, rng),
        }
    }
}

/// Position-wise feed-forward parameters.
#[derive(Debug, Clone)]
pub struct FfnWeights {
    pub lin1: LinearWeights,
    pub lin2: LinearWeights,
}

/// Source attention of a decoder layer and the norm that follows it.
#[derive(Debug, Clone)]
pub struct CrossAttentionWeights {
    pub attention: AttentionWeights,
    pub layer_norm: LayerNormWeights,
}

/// Weights for a single transformer layer.
#[derive(Debug, Clone)]
pub struct LayerWeights {
    pub attention: AttentionWeights,
    pub layer_norm1: LayerNormWeights,
    /// Decoder only
    pub encoder_attn: Option<CrossAttentionWeights>,
    pub ffn: FfnWeights,
    pub layer_norm2: LayerNormWeights,
}

/// All model parameters.
#[derive(Debug, Clone)]
pub struct TransformerWeights {
    /// `[n_words, dim]`
    pub embeddings: Array2<f32>,
    /// `[N_MAX_POSITIONS, dim]`
    pub position_embeddings: Array2<f32>,
    /// `[n_langs, dim]`, present when language embeddings are used
    pub lang_embeddings: Option<Array2<f32>>,
    pub layer_norm_emb: LayerNormWeights,
    pub layers: Vec<LayerWeights>,
    /// `dim -> n_words` prediction layer
    pub pred_layer: Option<LinearWeights>,
}

impl TransformerWeights {
    /// Seeded random initialization.
    ///
    /// Embeddings are drawn from `N(0, dim^-0.5)` with the padding row zeroed;
    /// linear layers are uniform, norms start as the identity.
    pub fn random<R: Rng + ?Sized>(config: &TransformerConfig, rng: &mut R) -> Result<Self> {
        config.validate()?;
        let dim = config.dim;

        let mut embeddings = embedding(config.n_words, dim, rng)?;
        embeddings.row_mut(config.pad_index as usize).fill(0.0);

        let position_embeddings = if config.sinusoidal_embeddings {
            sinusoidal_embeddings(N_MAX_POSITIONS, dim)
        } else {
            embedding(N_MAX_POSITIONS, dim, rng)?
        };

        let lang_embeddings = if config.uses_lang_embeddings() {
            Some(embedding(config.n_langs, dim, rng)?)
        } else {
            None
        };

        let layers = (0..config.n_layers)
            .map(|_| LayerWeights {
                attention: AttentionWeights::random(dim, dim, rng),
                layer_norm1: LayerNormWeights::new(dim),
                encoder_attn: config.is_decoder().then(|| CrossAttentionWeights {
                    attention: AttentionWeights::random(dim, config.dim_encoder, rng),
                    layer_norm: LayerNormWeights::new(dim),
                }),
                ffn: FfnWeights {
                    lin1: LinearWeights::random(dim, config.hidden_dim, rng),
                    lin2: LinearWeights::random(config.hidden_dim, dim, rng),
                },
                layer_norm2: LayerNormWeights::new(dim),
            })
            .collect();

        let pred_layer = config.with_output.then(|| {
            let mut proj = LinearWeights::random(dim, config.n_words, rng);
            if config.share_inout_emb {
                proj.weight = embeddings.clone();
            }
            proj
        });

        Ok(TransformerWeights {
            embeddings,
            position_embeddings,
            lang_embeddings,
            layer_norm_emb: LayerNormWeights::new(dim),
            layers,
            pred_layer,
        })
    }

    /// Checks the weight shapes against `config`.
    pub fn check(&self, config: &TransformerConfig) -> Result<()> {
        let dim = config.dim;
        let expect = |name: &str, actual: (usize, usize), expected: (usize, usize)| {
            if actual == expected {
                Ok(())
            } else {
                Err(XlmError::ShapeViolation(format!(
                    "{name}: expected {expected:?}, got {actual:?}"
                )))
            }
        };
        expect("embeddings", self.embeddings.dim(), (config.n_words, dim))?;
        expect(
            "position_embeddings",
            self.position_embeddings.dim(),
            (N_MAX_POSITIONS, dim),
        )?;
        match (&self.lang_embeddings, config.uses_lang_embeddings()) {
            (Some(lang), true) => expect("lang_embeddings", lang.dim(), (config.n_langs, dim))?,
            (None, false) => {}
            _ => {
                return Err(XlmError::ShapeViolation(
                    "language embeddings do not match n_langs/use_lang_emb".into(),
                ));
            }
        }
        if self.layers.len() != config.n_layers {
            return Err(XlmError::ShapeViolation(format!(
                "expected {} layers, got {}",
                config.n_layers,
                self.layers.len()
            )));
        }
        for (i, layer) in self.layers.iter().enumerate() {
            let a = &layer.attention;
            expect(&format!("layer {i} attention"), a.k_lin.weight.dim(), (dim, dim))?;
            match (&layer.encoder_attn, config.is_decoder()) {
                (Some(cross), true) => expect(
                    &format!("layer {i} encoder_attn"),
                    cross.attention.k_lin.weight.dim(),
                    (dim, config.dim_encoder),
                )?,
                (None, false) => {}
                _ => {
                    return Err(XlmError::ShapeViolation(format!(
                        "layer {i}: source attention present only in decoders"
                    )));
                }
            }
            expect(
                &format!("layer {i} ffn"),
                layer.ffn.lin1.weight.dim(),
                (config.hidden_dim, dim),
            )?;
        }
        if let Some(pred) = &self.pred_layer {
            expect("pred_layer", pred.weight.dim(), (config.n_words, dim))?;
        }
        Ok(())
    }
}

fn embedding<R: Rng + ?Sized>(n: usize, dim: usize, rng: &mut R) -> Result<Array2<f32>> {
    let normal = Normal::new(0.0, (dim as f32).powf(-0.5))
        .map_err(|e| XlmError::Config(format!("embedding init: {e}")))?;
    Ok(Array2::from_shape_simple_fn((n, dim), || normal.sample(rng)))
}

/// Fixed sinusoidal table: `sin` on even columns, `cos` on odd ones.
pub fn sinusoidal_embeddings(n_pos: usize, dim: usize) -> Array2<f32> {
    Array2::from_shape_fn((n_pos, dim), |(pos, j)| {
        let angle = pos as f64 / 10000f64.powf((2 * (j / 2)) as f64 / dim as f64);
        if j % 2 == 0 {
            angle.sin() as f32
        } else {
            angle.cos() as f32
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_random_weights_match_config() {
        let mut rng = StdRng::seed_from_u64(7);
        let config = TransformerConfig {
            n_langs: 3,
            ..TransformerConfig::decoder(16, 24, 2, 4, 11)
        };
        let weights = TransformerWeights::random(&config, &mut rng).unwrap();
        weights.check(&config).unwrap();
        assert_eq!(weights.lang_embeddings.as_ref().unwrap().dim(), (3, 16));
        assert!(weights.embeddings.row(config.pad_index as usize).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_shared_output_projection() {
        let mut rng = StdRng::seed_from_u64(1);
        let config = TransformerConfig {
            share_inout_emb: true,
            ..TransformerConfig::decoder(8, 8, 1, 2, 10)
        };
        let weights = TransformerWeights::random(&config, &mut rng).unwrap();
        assert_eq!(weights.pred_layer.unwrap().weight, weights.embeddings);
    }

    #[test]
    fn test_check_rejects_missing_source_attention() {
        let mut rng = StdRng::seed_from_u64(2);
        let config = TransformerConfig::encoder(8, 1, 2, 10);
        let weights = TransformerWeights::random(&config, &mut rng).unwrap();
        let decoder = TransformerConfig {
            with_output: false,
            ..TransformerConfig::decoder(8, 8, 1, 2, 10)
        };
        assert!(matches!(weights.check(&decoder), Err(XlmError::ShapeViolation(_))));
    }

    #[test]
    fn test_sinusoidal_table() {
        let table = sinusoidal_embeddings(4, 6);
        assert_eq!(table[[0, 0]], 0.0);
        assert_eq!(table[[0, 1]], 1.0);
        assert!((table[[1, 0]] - 1f32.sin()).abs() < 1e-6);
    }

    #[test]
    fn test_linear_forward_3d() {
        let mut rng = StdRng::seed_from_u64(3);
        let lin = LinearWeights::random(4, 3, &mut rng);
        let x = Array3::from_shape_fn((2, 5, 4), |(b, t, d)| (b + t + d) as f32);
        let out = lin.forward_3d(&x).unwrap();
        assert_eq!(out.dim(), (2, 5, 3));
        let row = lin.forward(&x.slice(ndarray::s![1, 2..3, ..]));
        assert!((out[[1, 2, 0]] - row[[0, 0]]).abs() < 1e-5);
    }
}
