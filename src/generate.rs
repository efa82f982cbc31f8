//! Greedy and sampling decoding over a shrinking set of active sentences.

use crate::cache::AttentionCache;
use crate::config::N_MAX_POSITIONS;
use crate::error::{Result, XlmError};
use crate::model::{FwdInput, TransformerModel};
use crate::sample::sample;
use log::{debug, info};
use ndarray::{Array2, Array3, Axis, s};
use rand::Rng;

/// Maximum output length, start marker included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaxLen {
    /// Same limit for every sentence
    Global(usize),
    /// One limit per sentence
    PerSentence(Vec<usize>),
}

impl From<usize> for MaxLen {
    fn from(len: usize) -> Self {
        MaxLen::Global(len)
    }
}

impl From<Vec<usize>> for MaxLen {
    fn from(lens: Vec<usize>) -> Self {
        MaxLen::PerSentence(lens)
    }
}

impl From<&[usize]> for MaxLen {
    fn from(lens: &[usize]) -> Self {
        MaxLen::PerSentence(lens.to_vec())
    }
}

impl MaxLen {
    /// Expand to one limit per sentence of a batch of `bs`.
    pub fn per_sentence(&self, bs: usize) -> Result<Vec<usize>> {
        let lens = match self {
            MaxLen::Global(len) => vec![*len; bs],
            MaxLen::PerSentence(lens) if lens.len() == bs => lens.clone(),
            MaxLen::PerSentence(lens) => {
                return Err(XlmError::ShapeViolation(format!(
                    "{} maximum lengths for a batch of {bs}",
                    lens.len()
                )));
            }
        };
        check_max_len(lens.iter().copied())?;
        Ok(lens)
    }
}

/// Every limit must leave room for the start and end markers and fit the
/// position table.
pub(crate) fn check_max_len(lens: impl IntoIterator<Item = usize>) -> Result<()> {
    for len in lens {
        if len < 2 {
            return Err(XlmError::ShapeViolation(format!(
                "maximum length {len} leaves no room for the start and end markers"
            )));
        }
        if len > N_MAX_POSITIONS {
            return Err(XlmError::ShapeViolation(format!(
                "maximum length {len} exceeds {N_MAX_POSITIONS} positions"
            )));
        }
    }
    Ok(())
}

/// Positions of `next` inside `prev`, both sorted sentence ids with `next`
/// a subset of `prev`.
fn restriction(prev: &[usize], next: &[usize]) -> Result<Vec<usize>> {
    next.iter()
        .map(|sent| {
            prev.binary_search(sent).map_err(|_| {
                XlmError::State(format!("sentence {sent} was not active in the previous step"))
            })
        })
        .collect()
}

impl TransformerModel {
    /// Checks that this model can decode against `src_enc`.
    pub(crate) fn check_decoding(
        &self,
        src_enc: &Array3<f32>,
        src_len: &[usize],
        tgt_lang_id: usize,
    ) -> Result<()> {
        if !self.config.is_decoder() || self.pred_layer.is_none() {
            return Err(XlmError::Config(
                "generation needs a decoder with a prediction layer".into(),
            ));
        }
        if src_len.is_empty() || src_enc.dim().0 != src_len.len() {
            return Err(XlmError::ShapeViolation(format!(
                "source encodings {:?} do not match {} source lengths",
                src_enc.dim(),
                src_len.len()
            )));
        }
        if tgt_lang_id >= self.config.n_langs {
            return Err(XlmError::ShapeViolation(format!(
                "target language {tgt_lang_id} outside {} languages",
                self.config.n_langs
            )));
        }
        Ok(())
    }

    /// Runs one cached decoding step and returns word scores `[batch, n_words]`
    /// for the new position.
    pub(crate) fn decode_step(
        &self,
        tokens: &[u32],
        lengths: &[usize],
        src: (&Array3<f32>, &[usize]),
        tgt_lang_id: usize,
        cache: &mut AttentionCache,
    ) -> Result<Array2<f32>> {
        let n = tokens.len();
        let x = Array2::from_shape_vec((1, n), tokens.to_vec())?;
        let langs = Array2::from_elem((1, n), tgt_lang_id);
        let input = FwdInput::new(x.view(), lengths, true)
            .with_src(src.0, src.1)
            .with_langs(langs.view());
        let hidden = self.fwd(input, Some(cache), None)?;
        self.get_scores(&hidden.index_axis(Axis(0), 0))
    }

    /// Decode a batch one token at a time.
    ///
    /// Returns the tokens `[len, batch]` and each sentence's length. Every
    /// column starts with the end marker used as a start marker, ends with
    /// the real end marker at `lengths[i] - 1` and is padded after that.
    /// `sample_temperature` of `None` decodes greedily.
    pub fn generate<R: Rng + ?Sized>(
        &self,
        src_enc: &Array3<f32>,
        src_len: &[usize],
        tgt_lang_id: usize,
        max_len: impl Into<MaxLen>,
        sample_temperature: Option<f32>,
        rng: &mut R,
    ) -> Result<(Array2<u32>, Vec<usize>)> {
        self.check_decoding(src_enc, src_len, tgt_lang_id)?;
        let bs = src_len.len();
        let max_lengths = max_len.into().per_sentence(bs)?;
        let global_max_len = max_lengths.iter().copied().max().unwrap_or(2);
        let eos = self.config.eos_index;

        let mut generated = Array2::from_elem((global_max_len, bs), self.config.pad_index);
        generated.row_mut(0).fill(eos);
        let mut gen_len = vec![1usize; bs];
        let mut unfinished = vec![true; bs];

        let mut cache = self.new_cache();
        let mut active: Vec<usize> = (0..bs).collect();
        // source rows of the active sentences, once the set has shrunk
        let mut restricted: Option<(Array3<f32>, Vec<usize>)> = None;

        let mut cur_len = 1;
        while cur_len < global_max_len {
            let still_active: Vec<usize> = (0..bs).filter(|&i| unfinished[i]).collect();
            if still_active.len() != active.len() {
                let keep = restriction(&active, &still_active)?;
                cache.reindex(&keep)?;
                restricted = Some((
                    src_enc.select(Axis(0), &still_active),
                    still_active.iter().map(|&i| src_len[i]).collect(),
                ));
                debug!(
                    "step {cur_len}: cache restricted from {} to {} sentences",
                    active.len(),
                    still_active.len()
                );
                active = still_active;
            }

            let src = match &restricted {
                Some((enc, len)) => (enc, len.as_slice()),
                None => (src_enc, src_len),
            };
            let tokens: Vec<u32> = active.iter().map(|&i| generated[[cur_len - 1, i]]).collect();
            let lengths: Vec<usize> = active.iter().map(|&i| gen_len[i]).collect();
            let scores = self.decode_step(&tokens, &lengths, src, tgt_lang_id, &mut cache)?;

            for (row, &i) in scores.rows().into_iter().zip(&active) {
                let mut logits = row.to_vec();
                let mut word = sample(&mut logits, sample_temperature, rng);
                if max_lengths[i] == cur_len + 1 {
                    word = eos;
                }
                generated[[cur_len, i]] = word;
                gen_len[i] += 1;
                if word == eos {
                    unfinished[i] = false;
                }
            }

            cur_len += 1;
            let n_done = unfinished.iter().filter(|&&u| !u).count();
            debug!("step {}: {} active, {n_done}/{bs} done", cur_len - 1, active.len());
            if n_done == bs {
                break;
            }
        }

        info!(
            "generated {bs} sentences in {} steps (max length {global_max_len})",
            cur_len - 1
        );
        Ok((generated.slice(s![..cur_len, ..]).to_owned(), gen_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_len_expansion() {
        assert_eq!(MaxLen::from(5).per_sentence(3).unwrap(), vec![5, 5, 5]);
        assert_eq!(
            MaxLen::from(vec![2, 7]).per_sentence(2).unwrap(),
            vec![2, 7]
        );
        assert!(matches!(
            MaxLen::from(vec![4]).per_sentence(2),
            Err(XlmError::ShapeViolation(_))
        ));
        assert!(matches!(
            MaxLen::Global(1).per_sentence(1),
            Err(XlmError::ShapeViolation(_))
        ));
        assert!(MaxLen::Global(N_MAX_POSITIONS + 1).per_sentence(1).is_err());
    }

    #[test]
    fn test_restriction_locates_survivors() {
        assert_eq!(restriction(&[0, 2, 3, 5], &[2, 5]).unwrap(), vec![1, 3]);
        assert_eq!(restriction(&[1, 4], &[]).unwrap(), Vec::<usize>::new());
        assert!(matches!(
            restriction(&[1, 4], &[2]),
            Err(XlmError::State(_))
        ));
    }
}
