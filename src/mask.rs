//! Validity and causal masks derived from sequence lengths.

use crate::error::{Result, XlmError};
use ndarray::{s, Array2, Array3};

/// Attention mask, either over keys only or over (query, key) pairs.
#[derive(Debug, Clone, PartialEq)]
pub enum AttentionMask {
    /// `[batch, key_len]`, shared by every query.
    Padding(Array2<bool>),
    /// `[batch, query_len, key_len]`.
    Causal(Array3<bool>),
}

impl AttentionMask {
    /// Whether query `q` of batch element `b` may attend to key `k`.
    #[inline]
    pub fn allows(&self, b: usize, q: usize, k: usize) -> bool {
        match self {
            AttentionMask::Padding(m) => m[[b, k]],
            AttentionMask::Causal(m) => m[[b, q, k]],
        }
    }

    pub fn key_len(&self) -> usize {
        match self {
            AttentionMask::Padding(m) => m.dim().1,
            AttentionMask::Causal(m) => m.dim().2,
        }
    }

    /// Keep only the last `n` query rows. Padding masks have no query axis
    /// and are returned unchanged.
    pub fn last_rows(self, n: usize) -> Self {
        match self {
            AttentionMask::Padding(m) => AttentionMask::Padding(m),
            AttentionMask::Causal(m) => {
                let q_len = m.dim().1;
                let start = q_len.saturating_sub(n);
                AttentionMask::Causal(m.slice(s![.., start.., ..]).to_owned())
            }
        }
    }

    /// Checks the mask against attention over `[batch, q_len, k_len]` scores.
    pub fn check(&self, batch: usize, q_len: usize, k_len: usize) -> Result<()> {
        let ok = self.key_len() == k_len
            && match self {
                AttentionMask::Padding(m) => m.nrows() == batch,
                AttentionMask::Causal(m) => m.dim().0 == batch && m.dim().1 == q_len,
            };
        if ok {
            Ok(())
        } else {
            Err(XlmError::ShapeViolation(format!(
                "attention mask {:?} does not fit scores ({batch}, {q_len}, {k_len})",
                self.shape()
            )))
        }
    }

    fn shape(&self) -> Vec<usize> {
        match self {
            AttentionMask::Padding(m) => m.shape().to_vec(),
            AttentionMask::Causal(m) => m.shape().to_vec(),
        }
    }
}

/// `[batch, slen]` mask, true where `t < lengths[b]`.
pub fn lengths_mask(slen: usize, lengths: &[usize]) -> Result<Array2<bool>> {
    if let Some(&max) = lengths.iter().max() {
        if max > slen {
            return Err(XlmError::ShapeViolation(format!(
                "length {max} exceeds sequence length {slen}"
            )));
        }
    }
    Ok(Array2::from_shape_fn((lengths.len(), slen), |(b, t)| {
        t < lengths[b]
    }))
}

/// Hidden-state mask and attention mask for a batch of right-padded sequences.
///
/// With `causal`, the attention mask is `[batch, slen, slen]` lower-triangular;
/// otherwise it is the hidden-state mask itself.
pub fn get_masks(slen: usize, lengths: &[usize], causal: bool) -> Result<(Array2<bool>, AttentionMask)> {
    let mask = lengths_mask(slen, lengths)?;
    let attn_mask = if causal {
        AttentionMask::Causal(Array3::from_shape_fn(
            (lengths.len(), slen, slen),
            |(_, q, k)| k <= q,
        ))
    } else {
        AttentionMask::Padding(mask.clone())
    };
    Ok((mask, attn_mask))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;
    use proptest::prelude::*;

    #[test]
    fn test_validity_mask() {
        let (mask, attn) = get_masks(4, &[2, 4], false).unwrap();
        assert_eq!(
            mask,
            arr2(&[[true, true, false, false], [true, true, true, true]])
        );
        assert_eq!(attn, AttentionMask::Padding(mask));
    }

    #[test]
    fn test_causal_mask_is_lower_triangular() {
        let (_, attn) = get_masks(3, &[3], true).unwrap();
        assert!(attn.allows(0, 2, 0));
        assert!(attn.allows(0, 1, 1));
        assert!(!attn.allows(0, 0, 1));
        assert_eq!(attn.key_len(), 3);
    }

    #[test]
    fn test_length_over_max_is_shape_violation() {
        assert!(matches!(
            get_masks(3, &[1, 4], true),
            Err(XlmError::ShapeViolation(_))
        ));
    }

    #[test]
    fn test_last_rows_keeps_all_keys() {
        let (_, attn) = get_masks(5, &[5, 3], true).unwrap();
        let tail = attn.last_rows(1);
        assert!(tail.check(2, 1, 5).is_ok());
        assert!((0..5).all(|k| tail.allows(0, 0, k)));
    }

    proptest! {
        #[test]
        fn masks_follow_lengths(lengths in prop::collection::vec(0usize..8, 1..6), causal in any::<bool>()) {
            let slen = 8;
            let (mask, attn) = get_masks(slen, &lengths, causal).unwrap();
            prop_assert_eq!(mask.dim(), (lengths.len(), slen));
            for (b, &len) in lengths.iter().enumerate() {
                for t in 0..slen {
                    prop_assert_eq!(mask[[b, t]], t < len);
                }
                for q in 0..slen {
                    for k in 0..slen {
                        let expected = if causal { k <= q } else { k < len };
                        prop_assert_eq!(attn.allows(b, q, k), expected);
                    }
                }
            }
        }
    }
}
