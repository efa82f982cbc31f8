//! XLM transformer forward pass.

use crate::attention::MultiHeadAttention;
use crate::cache::AttentionCache;
use crate::config::{N_MAX_POSITIONS, TransformerConfig};
use crate::error::{Result, XlmError};
use crate::mask::{AttentionMask, get_masks, lengths_mask};
use crate::ops::{apply_mask, dropout};
use crate::weights::{FfnWeights, LayerNormWeights, LinearWeights, TransformerWeights};
use ndarray::{Array2, Array3, ArrayView2, s};
use rand::RngCore;

/// One transformer layer (post-norm, GPT-1 layout).
#[derive(Debug, Clone)]
pub struct TransformerLayer {
    pub attention: MultiHeadAttention,
    pub layer_norm1: LayerNormWeights,
    /// Source attention and its norm, decoder only
    pub encoder_attn: Option<(MultiHeadAttention, LayerNormWeights)>,
    pub ffn: FfnWeights,
    pub layer_norm2: LayerNormWeights,
}

/// Encoder or decoder stack with its embeddings and prediction layer.
#[derive(Debug, Clone)]
pub struct TransformerModel {
    pub config: TransformerConfig,
    pub embeddings: Array2<f32>,
    pub position_embeddings: Array2<f32>,
    pub lang_embeddings: Option<Array2<f32>>,
    pub layer_norm_emb: LayerNormWeights,
    pub layers: Vec<TransformerLayer>,
    pub pred_layer: Option<LinearWeights>,
}

/// Inputs of one forward pass.
///
/// With a cache, `x` holds only the time steps not yet folded into it;
/// `lengths` are always full sequence lengths.
#[derive(Debug, Clone)]
pub struct FwdInput<'a> {
    /// Token ids `[new_len, batch]`
    pub x: ArrayView2<'a, u32>,
    /// Valid length of each sequence, counting cached steps
    pub lengths: &'a [usize],
    /// Restrict attention to previous positions
    pub causal: bool,
    /// Source encodings `[batch, src_len, dim_encoder]` and their lengths
    pub src: Option<(&'a Array3<f32>, &'a [usize])>,
    /// Positions `[new_len, batch]`; defaults to consecutive positions after the cache
    pub positions: Option<ArrayView2<'a, usize>>,
    /// Language ids `[new_len, batch]`
    pub langs: Option<ArrayView2<'a, usize>>,
}

impl<'a> FwdInput<'a> {
    pub fn new(x: ArrayView2<'a, u32>, lengths: &'a [usize], causal: bool) -> Self {
        FwdInput {
            x,
            lengths,
            causal,
            src: None,
            positions: None,
            langs: None,
        }
    }

    pub fn with_src(mut self, src_enc: &'a Array3<f32>, src_len: &'a [usize]) -> Self {
        self.src = Some((src_enc, src_len));
        self
    }

    pub fn with_positions(mut self, positions: ArrayView2<'a, usize>) -> Self {
        self.positions = Some(positions);
        self
    }

    pub fn with_langs(mut self, langs: ArrayView2<'a, usize>) -> Self {
        self.langs = Some(langs);
        self
    }
}

impl TransformerModel {
    /// Build the model. Attention modules get consecutive cache slots:
    /// self-attention of layer `i` first, then its source attention.
    pub fn new(config: TransformerConfig, weights: TransformerWeights) -> Result<Self> {
        config.validate()?;
        weights.check(&config)?;

        let mut next_id = 0;
        let mut layer_id = || {
            next_id += 1;
            next_id - 1
        };
        let layers = weights
            .layers
            .into_iter()
            .map(|layer| {
                let attention = MultiHeadAttention::new(
                    layer_id(),
                    config.n_heads,
                    config.dim,
                    config.dim,
                    config.attention_dropout,
                    layer.attention,
                )?;
                let encoder_attn = match layer.encoder_attn {
                    Some(cross) => Some((
                        MultiHeadAttention::new(
                            layer_id(),
                            config.n_heads,
                            config.dim,
                            config.dim_encoder,
                            config.attention_dropout,
                            cross.attention,
                        )?,
                        cross.layer_norm,
                    )),
                    None => None,
                };
                Ok(TransformerLayer {
                    attention,
                    layer_norm1: layer.layer_norm1,
                    encoder_attn,
                    ffn: layer.ffn,
                    layer_norm2: layer.layer_norm2,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(TransformerModel {
            config,
            embeddings: weights.embeddings,
            position_embeddings: weights.position_embeddings,
            lang_embeddings: weights.lang_embeddings,
            layer_norm_emb: weights.layer_norm_emb,
            layers,
            pred_layer: weights.pred_layer,
        })
    }

    /// A fresh cache with one slot per attention module of this model.
    pub fn new_cache(&self) -> AttentionCache {
        AttentionCache::new(self.config.n_cache_slots())
    }

    /// Forward pass over the new time steps of `input`.
    ///
    /// Returns hidden states `[new_len, batch, dim]`. With a cache, every
    /// layer extends its slot and the cache length grows by `new_len` once
    /// all layers are done. `train_rng` enables dropout.
    pub fn fwd(
        &self,
        input: FwdInput<'_>,
        mut cache: Option<&mut AttentionCache>,
        mut train_rng: Option<&mut dyn RngCore>,
    ) -> Result<Array3<f32>> {
        let (new_len, bs) = input.x.dim();
        if input.lengths.len() != bs {
            return Err(XlmError::ShapeViolation(format!(
                "{} lengths for a batch of {bs}",
                input.lengths.len()
            )));
        }
        if let Some((src_enc, src_len)) = input.src {
            if !self.config.is_decoder() {
                return Err(XlmError::ShapeViolation(
                    "only a decoder can attend to source encodings".into(),
                ));
            }
            let (src_bs, _, src_dim) = src_enc.dim();
            if src_bs != bs || src_len.len() != bs || src_dim != self.config.dim_encoder {
                return Err(XlmError::ShapeViolation(format!(
                    "source encodings {:?} with {} lengths do not fit batch {bs} / dim {}",
                    src_enc.dim(),
                    src_len.len(),
                    self.config.dim_encoder
                )));
            }
        }
        for (name, extra) in [("positions", &input.positions), ("langs", &input.langs)] {
            if let Some(extra) = extra {
                if extra.dim() != (new_len, bs) {
                    return Err(XlmError::ShapeViolation(format!(
                        "{name} {:?} do not match tokens {:?}",
                        extra.dim(),
                        (new_len, bs)
                    )));
                }
            }
        }

        // masks over the full sequence, restricted to the new steps
        let offset = cache.as_ref().map_or(0, |c| c.slen());
        let slen = offset + new_len;
        let (mask, attn_mask) = get_masks(slen, input.lengths, input.causal)?;
        let mask = mask.slice(s![.., offset..]).to_owned();
        let attn_mask = attn_mask.last_rows(new_len);
        let src_mask = match input.src {
            Some((src_enc, src_len)) => Some(AttentionMask::Padding(lengths_mask(
                src_enc.dim().1,
                src_len,
            )?)),
            None => None,
        };

        let mut tensor = self.embed(&input, offset)?;
        tensor = self.layer_norm_emb.forward(&tensor);
        if let Some(rng) = reborrow(&mut train_rng) {
            dropout(&mut tensor, self.config.dropout, rng);
        }
        apply_mask(&mut tensor, &mask);

        for layer in &self.layers {
            let mut attn = layer.attention.forward(
                &tensor,
                &attn_mask,
                None,
                cache.as_deref_mut(),
                reborrow(&mut train_rng),
            )?;
            if let Some(rng) = reborrow(&mut train_rng) {
                dropout(&mut attn, self.config.dropout, rng);
            }
            tensor = layer.layer_norm1.forward(&(tensor + attn));

            if let (Some((encoder_attn, layer_norm15)), Some((src_enc, _)), Some(src_mask)) =
                (&layer.encoder_attn, input.src, &src_mask)
            {
                let mut attn = encoder_attn.forward(
                    &tensor,
                    src_mask,
                    Some(src_enc),
                    cache.as_deref_mut(),
                    reborrow(&mut train_rng),
                )?;
                if let Some(rng) = reborrow(&mut train_rng) {
                    dropout(&mut attn, self.config.dropout, rng);
                }
                tensor = layer_norm15.forward(&(tensor + attn));
            }

            let mut ffn = self.feed_forward(&layer.ffn, &tensor)?;
            if let Some(rng) = reborrow(&mut train_rng) {
                dropout(&mut ffn, self.config.dropout, rng);
            }
            tensor = layer.layer_norm2.forward(&(tensor + ffn));
            apply_mask(&mut tensor, &mask);
        }

        if let Some(cache) = cache {
            cache.advance(new_len);
        }

        Ok(tensor.permuted_axes([1, 0, 2]).as_standard_layout().into_owned())
    }

    /// Word scores `[batch, n_words]` for hidden states `[batch, dim]`.
    pub fn get_scores(&self, hidden: &ArrayView2<f32>) -> Result<Array2<f32>> {
        let pred = self.pred_layer.as_ref().ok_or_else(|| {
            XlmError::Config("model was built without a prediction layer".into())
        })?;
        if hidden.dim().1 != self.config.dim {
            return Err(XlmError::ShapeViolation(format!(
                "hidden states of width {} for a model of dim {}",
                hidden.dim().1,
                self.config.dim
            )));
        }
        Ok(pred.forward(hidden))
    }

    /// Token + position (+ language) embeddings, `[batch, new_len, dim]`.
    fn embed(&self, input: &FwdInput<'_>, offset: usize) -> Result<Array3<f32>> {
        let (new_len, bs) = input.x.dim();
        let mut tensor = Array3::zeros((bs, new_len, self.config.dim));
        for t in 0..new_len {
            for b in 0..bs {
                let token = input.x[[t, b]] as usize;
                if token >= self.config.n_words {
                    return Err(XlmError::ShapeViolation(format!(
                        "token {token} outside a vocabulary of {}",
                        self.config.n_words
                    )));
                }
                let pos = input.positions.as_ref().map_or(offset + t, |p| p[[t, b]]);
                if pos >= N_MAX_POSITIONS {
                    return Err(XlmError::ShapeViolation(format!(
                        "position {pos} exceeds the {N_MAX_POSITIONS} position embeddings"
                    )));
                }
                let mut row = tensor.slice_mut(s![b, t, ..]);
                row.assign(&self.embeddings.row(token));
                row += &self.position_embeddings.row(pos);
                if let (Some(lang_emb), Some(langs)) = (&self.lang_embeddings, &input.langs) {
                    let lang = langs[[t, b]];
                    if lang >= self.config.n_langs {
                        return Err(XlmError::ShapeViolation(format!(
                            "language {lang} outside {} languages",
                            self.config.n_langs
                        )));
                    }
                    row += &lang_emb.row(lang);
                }
            }
        }
        Ok(tensor)
    }

    fn feed_forward(&self, ffn: &FfnWeights, x: &Array3<f32>) -> Result<Array3<f32>> {
        let mut hidden = ffn.lin1.forward_3d(x)?;
        self.config.activation.apply(&mut hidden);
        ffn.lin2.forward_3d(&hidden)
    }
}

/// Short-lived reborrow of an optional rng, so it can be handed out once per sublayer.
fn reborrow<'a>(rng: &'a mut Option<&mut dyn RngCore>) -> Option<&'a mut dyn RngCore> {
    rng.as_mut().map(|r| &mut **r as &mut dyn RngCore)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn decoder(seed: u64) -> TransformerModel {
        let mut rng = StdRng::seed_from_u64(seed);
        let config = TransformerConfig {
            n_langs: 2,
            ..TransformerConfig::decoder(8, 12, 2, 2, 10)
        };
        let weights = TransformerWeights::random(&config, &mut rng).unwrap();
        TransformerModel::new(config, weights).unwrap()
    }

    #[test]
    fn test_layer_ids_index_distinct_cache_slots() {
        let model = decoder(0);
        let ids: Vec<usize> = model
            .layers
            .iter()
            .flat_map(|l| [l.attention.layer_id, l.encoder_attn.as_ref().unwrap().0.layer_id])
            .collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert_eq!(model.new_cache().n_slots(), 4);
    }

    #[test]
    fn test_output_covers_only_new_steps() {
        let model = decoder(1);
        let src = Array3::<f32>::ones((3, 5, 12));
        let src_len = [5, 4, 2];
        let x = Array2::<u32>::from_elem((2, 3), 4);
        let mut cache = model.new_cache();
        let out = model
            .fwd(
                FwdInput::new(x.view(), &[2, 2, 2], true).with_src(&src, &src_len),
                Some(&mut cache),
                None,
            )
            .unwrap();
        assert_eq!(out.dim(), (2, 3, 8));
        assert_eq!(cache.slen(), 2);

        let step = Array2::<u32>::from_elem((1, 3), 5);
        let out = model
            .fwd(
                FwdInput::new(step.view(), &[3, 3, 3], true).with_src(&src, &src_len),
                Some(&mut cache),
                None,
            )
            .unwrap();
        assert_eq!(out.dim(), (1, 3, 8));
        assert_eq!(cache.slen(), 3);
    }

    #[test]
    fn test_padding_rows_are_zero() {
        let model = decoder(2);
        let src = Array3::<f32>::ones((2, 3, 12));
        let x = Array2::<u32>::from_elem((3, 2), 4);
        let out = model
            .fwd(
                FwdInput::new(x.view(), &[3, 1], true).with_src(&src, &[3, 3]),
                None,
                None,
            )
            .unwrap();
        assert!(out.slice(s![1.., 1, ..]).iter().all(|&v| v == 0.0));
        assert!(out.slice(s![.., 0, ..]).iter().any(|&v| v != 0.0));
    }

    #[test]
    fn test_rejects_out_of_range_inputs() {
        let model = decoder(3);
        let src = Array3::<f32>::ones((1, 2, 12));
        let bad_token = Array2::<u32>::from_elem((1, 1), 10);
        assert!(matches!(
            model.fwd(FwdInput::new(bad_token.view(), &[1], true).with_src(&src, &[2]), None, None),
            Err(XlmError::ShapeViolation(_))
        ));
        let x = Array2::<u32>::from_elem((1, 1), 3);
        let langs = Array2::<usize>::from_elem((1, 1), 2);
        assert!(matches!(
            model.fwd(
                FwdInput::new(x.view(), &[1], true)
                    .with_src(&src, &[2])
                    .with_langs(langs.view()),
                None,
                None
            ),
            Err(XlmError::ShapeViolation(_))
        ));
        assert!(matches!(
            model.fwd(FwdInput::new(x.view(), &[2], true), None, None),
            Err(XlmError::ShapeViolation(_))
        ));
    }

    #[test]
    fn test_dropout_only_with_training_rng() {
        let mut rng = StdRng::seed_from_u64(4);
        let config = TransformerConfig {
            dropout: 0.5,
            ..TransformerConfig::encoder(8, 1, 2, 10)
        };
        let weights = TransformerWeights::random(&config, &mut rng).unwrap();
        let model = TransformerModel::new(config, weights).unwrap();
        let x = Array2::<u32>::from_elem((3, 1), 5);
        let eval_a = model.fwd(FwdInput::new(x.view(), &[3], false), None, None).unwrap();
        let eval_b = model.fwd(FwdInput::new(x.view(), &[3], false), None, None).unwrap();
        assert_eq!(eval_a, eval_b);
        let train = model
            .fwd(FwdInput::new(x.view(), &[3], false), None, Some(&mut rng))
            .unwrap();
        assert_ne!(eval_a, train);
    }

    #[test]
    fn test_explicit_positions_match_default() {
        let model = decoder(6);
        let src = Array3::<f32>::ones((2, 3, 12));
        let src_len = [3, 2];
        let x = Array2::from_shape_fn((3, 2), |(t, b)| (3 + t + b) as u32);

        let mut default_cache = model.new_cache();
        let mut explicit_cache = model.new_cache();
        for t in 0..3 {
            let step = x.slice(s![t..t + 1, ..]);
            let lens = [t + 1, t + 1];
            let default = model
                .fwd(
                    FwdInput::new(step, &lens, true).with_src(&src, &src_len),
                    Some(&mut default_cache),
                    None,
                )
                .unwrap();
            let positions = Array2::from_elem((1, 2), explicit_cache.slen());
            let explicit = model
                .fwd(
                    FwdInput::new(step, &lens, true)
                        .with_src(&src, &src_len)
                        .with_positions(positions.view()),
                    Some(&mut explicit_cache),
                    None,
                )
                .unwrap();
            assert_eq!(default, explicit);
        }

        // shifted positions change the output
        let shifted = Array2::from_shape_fn((3, 2), |(t, _)| t + 5);
        let full = model
            .fwd(FwdInput::new(x.view(), &[3, 3], true).with_src(&src, &src_len), None, None)
            .unwrap();
        let moved = model
            .fwd(
                FwdInput::new(x.view(), &[3, 3], true)
                    .with_src(&src, &src_len)
                    .with_positions(shifted.view()),
                None,
                None,
            )
            .unwrap();
        assert_ne!(full, moved);
    }

    #[test]
    fn test_positions_must_fit_the_table() {
        let model = decoder(8);
        let src = Array3::<f32>::ones((1, 2, 12));
        let x = Array2::<u32>::from_elem((1, 1), 4);
        let positions = Array2::from_elem((1, 1), N_MAX_POSITIONS);
        assert!(matches!(
            model.fwd(
                FwdInput::new(x.view(), &[1], true)
                    .with_src(&src, &[2])
                    .with_positions(positions.view()),
                None,
                None
            ),
            Err(XlmError::ShapeViolation(_))
        ));
    }

    #[test]
    fn test_dropout_reaches_every_sublayer_of_a_decoder() {
        let mut rng = StdRng::seed_from_u64(9);
        let config = TransformerConfig {
            dropout: 0.3,
            attention_dropout: 0.3,
            ..TransformerConfig::decoder(8, 12, 2, 2, 10)
        };
        let weights = TransformerWeights::random(&config, &mut rng).unwrap();
        let model = TransformerModel::new(config, weights).unwrap();
        let src = Array3::<f32>::ones((1, 3, 12));
        let x = Array2::<u32>::from_elem((2, 1), 5);
        let mut cache = model.new_cache();
        let out = model
            .fwd(
                FwdInput::new(x.view(), &[2], true).with_src(&src, &[3]),
                Some(&mut cache),
                Some(&mut rng),
            )
            .unwrap();
        assert_eq!(out.dim(), (2, 1, 8));
        assert_eq!(cache.slen(), 2);
    }

    #[test]
    fn test_encoder_cannot_take_source() {
        let mut rng = StdRng::seed_from_u64(5);
        let config = TransformerConfig::encoder(8, 1, 2, 10);
        let weights = TransformerWeights::random(&config, &mut rng).unwrap();
        let model = TransformerModel::new(config, weights).unwrap();
        let x = Array2::<u32>::from_elem((1, 1), 5);
        let src = Array3::<f32>::ones((1, 2, 8));
        assert!(model
            .fwd(FwdInput::new(x.view(), &[1], true).with_src(&src, &[2]), None, None)
            .is_err());
        assert!(model.get_scores(&Array2::zeros((1, 8)).view()).is_err());
    }
}
