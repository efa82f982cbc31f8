//! Beam search decoding.

use crate::error::{Result, XlmError};
use crate::generate::check_max_len;
use crate::model::TransformerModel;
use crate::ops::{log_softmax_rows, top_k};
use log::{debug, info};
use ndarray::{Array2, Array3, Axis, s};

/// Running score of the beams that must not win the first expansion.
const INACTIVE_BEAM_SCORE: f32 = -1e9;

/// Beam search parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BeamSearchParams {
    /// Beams kept per sentence, also the size of each hypothesis pool
    pub beam_size: usize,
    /// Exponent of the length normalizer, `score = sum_logprobs / len^length_penalty`
    pub length_penalty: f32,
    /// Stop a sentence as soon as its pool is full
    pub early_stopping: bool,
}

impl Default for BeamSearchParams {
    fn default() -> Self {
        BeamSearchParams {
            beam_size: 5,
            length_penalty: 1.0,
            early_stopping: false,
        }
    }
}

/// Finished hypotheses of one sentence, at most `n_hyp` of them.
#[derive(Debug, Clone)]
pub struct BeamHypotheses {
    n_hyp: usize,
    /// Longest possible hypothesis, start marker excluded
    max_len: usize,
    length_penalty: f32,
    early_stopping: bool,
    hyps: Vec<(f32, Vec<u32>)>,
    worst_score: f32,
}

impl BeamHypotheses {
    pub fn new(n_hyp: usize, max_len: usize, length_penalty: f32, early_stopping: bool) -> Self {
        BeamHypotheses {
            n_hyp,
            max_len: max_len.saturating_sub(1),
            length_penalty,
            early_stopping,
            hyps: Vec::with_capacity(n_hyp + 1),
            worst_score: 1e9,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.hyps.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.hyps.is_empty()
    }

    /// Lowest retained score.
    #[inline]
    pub fn worst_score(&self) -> f32 {
        self.worst_score
    }

    /// Offer a finished hypothesis with raw log-probability sum `sum_logprobs`.
    pub fn add(&mut self, hyp: Vec<u32>, sum_logprobs: f32) {
        let score = sum_logprobs / (hyp.len() as f32).powf(self.length_penalty);
        if self.len() < self.n_hyp || score > self.worst_score {
            self.hyps.push((score, hyp));
            if self.len() > self.n_hyp {
                let mut ranked: Vec<(f32, usize)> =
                    self.hyps.iter().enumerate().map(|(i, (s, _))| (*s, i)).collect();
                ranked.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
                self.hyps.remove(ranked[0].1);
                self.worst_score = ranked[1].0;
            } else {
                self.worst_score = self.worst_score.min(score);
            }
        }
    }

    /// Whether no in-flight beam, whose best raw score is `best_sum_logprobs`,
    /// can still improve this pool.
    pub fn is_done(&self, best_sum_logprobs: f32) -> bool {
        if self.len() < self.n_hyp {
            false
        } else if self.early_stopping {
            true
        } else {
            self.worst_score
                >= best_sum_logprobs / (self.max_len as f32).powf(self.length_penalty)
        }
    }

    /// Hypotheses from best to worst.
    pub fn ranked(&self) -> Vec<&(f32, Vec<u32>)> {
        let mut ranked: Vec<_> = self.hyps.iter().collect();
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0));
        ranked
    }
}

/// Ranked beam search results.
#[derive(Debug, Clone)]
pub struct BeamOutput {
    /// `[len, batch, beam_size]`; column `[.., i, r]` is the `r`-th best
    /// hypothesis of sentence `i`, end marker included, padded after it
    pub tokens: Array3<u32>,
    /// Length of the best hypothesis of each sentence, end marker included
    pub lengths: Vec<usize>,
    /// Length of every ranked hypothesis, end marker included
    pub hyp_lengths: Vec<Vec<usize>>,
    /// Normalized score of every ranked hypothesis
    pub scores: Vec<Vec<f32>>,
}

impl BeamOutput {
    /// Best hypothesis per sentence as `[len, batch]` tokens and lengths.
    pub fn best(&self) -> (Array2<u32>, Vec<usize>) {
        let len = self.lengths.iter().copied().max().unwrap_or(0);
        let best = self.tokens.slice(s![..len, .., 0]).to_owned();
        (best, self.lengths.clone())
    }
}

struct Candidate {
    score: f32,
    word: u32,
    source: usize,
}

impl TransformerModel {
    /// Beam search decoding with one global `max_len`.
    pub fn generate_beam(
        &self,
        src_enc: &Array3<f32>,
        src_len: &[usize],
        tgt_lang_id: usize,
        params: &BeamSearchParams,
        max_len: usize,
    ) -> Result<BeamOutput> {
        self.check_decoding(src_enc, src_len, tgt_lang_id)?;
        check_max_len([max_len])?;
        let beam = params.beam_size;
        let n_words = self.config.n_words;
        if beam == 0 {
            return Err(XlmError::Config("beam size must be at least 1".into()));
        }
        if n_words < 2 {
            return Err(XlmError::Config(format!(
                "beam search needs at least 2 words, vocabulary has {n_words}"
            )));
        }
        let bs = src_len.len();
        let eos = self.config.eos_index;
        let pad = self.config.pad_index;

        // every sentence repeated once per beam
        let expand: Vec<usize> = (0..bs * beam).map(|i| i / beam).collect();
        let src_enc = src_enc.select(Axis(0), &expand);
        let src_len: Vec<usize> = expand.iter().map(|&i| src_len[i]).collect();

        let mut generated = Array2::from_elem((max_len, bs * beam), pad);
        generated.row_mut(0).fill(eos);
        let mut pools: Vec<BeamHypotheses> = (0..bs)
            .map(|_| {
                BeamHypotheses::new(beam, max_len, params.length_penalty, params.early_stopping)
            })
            .collect();
        let mut beam_scores: Vec<f32> = (0..bs * beam)
            .map(|i| if i % beam == 0 { 0.0 } else { INACTIVE_BEAM_SCORE })
            .collect();
        let mut done = vec![false; bs];
        let mut cache = self.new_cache();

        let mut cur_len = 1;
        while cur_len < max_len {
            let tokens: Vec<u32> = generated.row(cur_len - 1).to_vec();
            let lengths = vec![cur_len; bs * beam];
            let scores = self.decode_step(
                &tokens,
                &lengths,
                (&src_enc, src_len.as_slice()),
                tgt_lang_id,
                &mut cache,
            )?;
            let mut scores = log_softmax_rows(&scores);
            for (mut row, &running) in scores.rows_mut().into_iter().zip(&beam_scores) {
                row += running;
            }
            // [bs, beam * n_words]
            let scores = scores.into_shape_with_order((bs, beam * n_words))?;

            let last_step = cur_len + 1 == max_len;
            let mut next_beams: Vec<Candidate> = Vec::with_capacity(bs * beam);
            for sent in 0..bs {
                let row = scores.row(sent);
                let row = row.as_slice().ok_or_else(|| {
                    XlmError::State("beam scores are not contiguous".into())
                })?;
                let candidates = top_k(row, 2 * beam);
                let best = candidates.first().map_or(f32::NEG_INFINITY, |c| c.1);
                done[sent] = done[sent] || pools[sent].is_done(best);
                if done[sent] {
                    next_beams.extend(placeholders(sent, beam, pad));
                    continue;
                }

                let mut sent_beams = Vec::with_capacity(beam);
                for (idx, score) in candidates {
                    let source = sent * beam + idx / n_words;
                    let word = (idx % n_words) as u32;
                    if word == eos || last_step {
                        let hyp = generated.column(source).iter().take(cur_len).copied().collect();
                        pools[sent].add(hyp, score);
                    } else {
                        sent_beams.push(Candidate { score, word, source });
                    }
                    if sent_beams.len() == beam {
                        break;
                    }
                }

                if sent_beams.is_empty() && last_step {
                    next_beams.extend(placeholders(sent, beam, pad));
                } else if sent_beams.len() != beam {
                    return Err(XlmError::State(format!(
                        "sentence {sent}: only {} of {beam} beams could continue at step {cur_len}",
                        sent_beams.len()
                    )));
                } else {
                    next_beams.extend(sent_beams);
                }
            }

            let beam_idx: Vec<usize> = next_beams.iter().map(|c| c.source).collect();
            beam_scores = next_beams.iter().map(|c| c.score).collect();
            generated = generated.select(Axis(1), &beam_idx);
            for (slot, c) in generated.row_mut(cur_len).iter_mut().zip(&next_beams) {
                *slot = c.word;
            }
            cache.reindex(&beam_idx)?;

            cur_len += 1;
            let n_done = done.iter().filter(|&&d| d).count();
            debug!("beam step {}: {n_done}/{bs} sentences done", cur_len - 1);
            if n_done == bs {
                break;
            }
        }

        let output = finalize(&pools, beam, eos, pad);
        info!(
            "beam search over {bs} sentences finished after {} steps, best lengths {:?}",
            cur_len - 1,
            output.lengths
        );
        Ok(output)
    }
}

/// Neutral beams for a sentence that no longer competes. They stay on the
/// sentence's own rows so the source attention cache keeps its alignment.
fn placeholders(sent: usize, beam: usize, pad: u32) -> impl Iterator<Item = Candidate> {
    (0..beam).map(move |_| Candidate {
        score: 0.0,
        word: pad,
        source: sent * beam,
    })
}

fn finalize(pools: &[BeamHypotheses], beam: usize, eos: u32, pad: u32) -> BeamOutput {
    let ranked: Vec<Vec<&(f32, Vec<u32>)>> = pools.iter().map(BeamHypotheses::ranked).collect();
    let hyp_lengths: Vec<Vec<usize>> = ranked
        .iter()
        .map(|hyps| hyps.iter().map(|(_, h)| h.len() + 1).collect())
        .collect();
    let scores = ranked
        .iter()
        .map(|hyps| hyps.iter().map(|(s, _)| *s).collect())
        .collect();
    let lengths: Vec<usize> = hyp_lengths
        .iter()
        .map(|lens| lens.first().copied().unwrap_or(0))
        .collect();
    let tgt_len = hyp_lengths.iter().flatten().copied().max().unwrap_or(0);

    let mut tokens = Array3::from_elem((tgt_len, pools.len(), beam), pad);
    for (sent, hyps) in ranked.iter().enumerate() {
        for (r, (_, hyp)) in hyps.iter().enumerate() {
            for (t, &word) in hyp.iter().enumerate() {
                tokens[[t, sent, r]] = word;
            }
            tokens[[hyp.len(), sent, r]] = eos;
        }
    }

    BeamOutput {
        tokens,
        lengths,
        hyp_lengths,
        scores,
    }
}
