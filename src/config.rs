//! XLM model configuration.

use crate::error::{Result, XlmError};
use crate::ops::Activation;

/// Number of rows in the position embedding table.
pub const N_MAX_POSITIONS: usize = 1024;

/// Transformer hyperparameters for one side (encoder or decoder) of the model.
#[derive(Debug, Clone)]
pub struct TransformerConfig {
    /// Encoder (bidirectional, no source attention) or decoder
    pub is_encoder: bool,
    /// Embedding dimension of this module
    pub dim: usize,
    /// Dimension of the encoder output attended to by the decoder
    pub dim_encoder: usize,
    /// FFN intermediate dimension
    pub hidden_dim: usize,
    /// Number of transformer layers
    pub n_layers: usize,
    /// Number of attention heads
    pub n_heads: usize,
    /// Vocabulary size
    pub n_words: usize,
    /// Number of languages
    pub n_langs: usize,
    /// Add language embeddings when more than one language is configured
    pub use_lang_emb: bool,
    /// End-of-sentence token, also used as the start token
    pub eos_index: u32,
    /// Padding token
    pub pad_index: u32,
    /// Dropout on embeddings and sublayer outputs (training only)
    pub dropout: f32,
    /// Dropout on attention weights (training only)
    pub attention_dropout: f32,
    /// FFN activation
    pub activation: Activation,
    /// Initialize position embeddings with fixed sinusoids
    pub sinusoidal_embeddings: bool,
    /// Tie the prediction layer to the token embeddings
    pub share_inout_emb: bool,
    /// Build a prediction layer
    pub with_output: bool,
}

impl TransformerConfig {
    /// Encoder defaults: GELU, one language, no dropout.
    pub fn encoder(dim: usize, n_layers: usize, n_heads: usize, n_words: usize) -> Self {
        TransformerConfig {
            is_encoder: true,
            dim,
            dim_encoder: dim,
            hidden_dim: dim * 4,
            n_layers,
            n_heads,
            n_words,
            n_langs: 1,
            use_lang_emb: true,
            eos_index: 1,
            pad_index: 2,
            dropout: 0.0,
            attention_dropout: 0.0,
            activation: Activation::Gelu,
            sinusoidal_embeddings: false,
            share_inout_emb: false,
            with_output: false,
        }
    }

    /// Decoder defaults, attending to an encoder of width `dim_encoder`.
    pub fn decoder(
        dim: usize,
        dim_encoder: usize,
        n_layers: usize,
        n_heads: usize,
        n_words: usize,
    ) -> Self {
        TransformerConfig {
            is_encoder: false,
            dim_encoder,
            with_output: true,
            ..Self::encoder(dim, n_layers, n_heads, n_words)
        }
    }

    #[inline]
    pub fn is_decoder(&self) -> bool {
        !self.is_encoder
    }

    /// Returns the head size.
    #[inline]
    pub fn head_size(&self) -> usize {
        self.dim / self.n_heads
    }

    #[inline]
    pub fn uses_lang_embeddings(&self) -> bool {
        self.n_langs > 1 && self.use_lang_emb
    }

    /// Number of attention modules, i.e. slots an [`AttentionCache`](crate::AttentionCache) needs.
    #[inline]
    pub fn n_cache_slots(&self) -> usize {
        if self.is_decoder() {
            2 * self.n_layers
        } else {
            self.n_layers
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_heads == 0 || self.dim % self.n_heads != 0 {
            return Err(XlmError::Config(format!(
                "transformer dim {} must be a multiple of n_heads {}",
                self.dim, self.n_heads
            )));
        }
        if self.n_words == 0 || self.n_langs == 0 {
            return Err(XlmError::Config(
                "vocabulary and language count must be positive".into(),
            ));
        }
        for (name, id) in [("eos_index", self.eos_index), ("pad_index", self.pad_index)] {
            if id as usize >= self.n_words {
                return Err(XlmError::Config(format!(
                    "{name} {id} is outside a vocabulary of {}",
                    self.n_words
                )));
            }
        }
        for (name, p) in [("dropout", self.dropout), ("attention_dropout", self.attention_dropout)] {
            if !(0.0..1.0).contains(&p) {
                return Err(XlmError::Config(format!("{name} must be in [0, 1), got {p}")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heads_must_divide_dim() {
        let config = TransformerConfig::encoder(30, 2, 4, 16);
        assert!(matches!(config.validate(), Err(XlmError::Config(_))));
        assert!(TransformerConfig::encoder(32, 2, 4, 16).validate().is_ok());
    }

    #[test]
    fn test_special_tokens_inside_vocabulary() {
        let config = TransformerConfig {
            pad_index: 16,
            ..TransformerConfig::decoder(32, 32, 2, 4, 16)
        };
        assert!(matches!(config.validate(), Err(XlmError::Config(_))));
    }

    #[test]
    fn test_decoder_has_twice_the_cache_slots() {
        assert_eq!(TransformerConfig::encoder(32, 3, 4, 16).n_cache_slots(), 3);
        assert_eq!(TransformerConfig::decoder(32, 32, 3, 4, 16).n_cache_slots(), 6);
    }
}
