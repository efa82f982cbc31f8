//! XLM transformer inference in Rust
//!
//! Encoder/decoder transformer with an incremental key/value cache and
//! greedy, sampling and beam-search decoding.

pub mod attention;
pub mod beam;
pub mod cache;
pub mod config;
pub mod error;
pub mod generate;
pub mod mask;
pub mod model;
pub mod ops;
pub mod sample;
pub mod weights;

pub use attention::MultiHeadAttention;
pub use beam::{BeamHypotheses, BeamOutput, BeamSearchParams};
pub use cache::{AttentionCache, LayerCache};
pub use config::{N_MAX_POSITIONS, TransformerConfig};
pub use error::{Result, XlmError};
pub use generate::MaxLen;
pub use mask::{AttentionMask, get_masks};
pub use model::{FwdInput, TransformerModel};
pub use ops::Activation;
pub use sample::sample;
pub use weights::{LayerWeights, TransformerWeights};
