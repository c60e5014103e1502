//! Converts raw model logits into masked, penalized, accumulated
//! log-probabilities.

use ndarray::parallel::prelude::*;
use ndarray::{Array2, ArrayBase, ArrayView2, Axis, DataMut, Ix1};

use crate::beam::BeamGroup;
use crate::config::SearchConfig;
use crate::error::{SearchError, SearchResult};

/// Read-only view of the search state a logits pass needs.
pub struct StepState<'a> {
    /// Zero-based step index (step 0 scores the first generated token).
    pub step: usize,
    pub groups: &'a [BeamGroup],
    /// Per batch item: length of the prompt / decoder-start prefix.
    pub prefix_lens: &'a [usize],
    /// Per batch item prompt tokens to include in the repetition-penalty
    /// history (decoder-only models penalize the prompt too; for
    /// encoder-decoder models the source text is not part of the output
    /// vocabulary history and this is `None`).
    pub prompt_histories: Option<&'a [Vec<u32>]>,
}

/// Numerically stable in-place log-softmax over one logits row.
pub fn log_softmax_inplace<S>(row: &mut ArrayBase<S, Ix1>)
where
    S: DataMut<Elem = f32>,
{
    let max = row.fold(f32::NEG_INFINITY, |acc, &x| acc.max(x));
    row.mapv_inplace(|x| x - max);
    let log_sum = row.iter().map(|x| x.exp()).sum::<f32>().ln();
    row.mapv_inplace(|x| x - log_sum);
}

/// Reduces the log-probability of every token already present in `history`.
/// Values here are post-softmax (<= 0), so the penalty multiplies.
pub fn apply_repetition_penalty_inplace<S>(
    log_probs: &mut ArrayBase<S, Ix1>,
    history: impl Iterator<Item = u32>,
    penalty: f32,
) where
    S: DataMut<Elem = f32>,
{
    if penalty == 1.0 {
        return;
    }
    for token in history {
        let idx = token as usize;
        if idx < log_probs.len() {
            let score = log_probs[idx];
            log_probs[idx] = if score < 0.0 {
                score * penalty
            } else {
                score / penalty
            };
        }
    }
}

/// The deterministic transform pipeline of one decode step:
/// log-softmax, vocabulary masking, minimum-length enforcement, repetition
/// penalty, then accumulation onto each hypothesis's cumulative score.
///
/// Rows belonging to finished hypotheses are excluded from re-scoring and
/// come out as all negative infinity; the selector re-proposes those
/// hypotheses with their frozen scores instead.
pub struct LogitsProcessor<'a> {
    config: &'a SearchConfig,
}

impl<'a> LogitsProcessor<'a> {
    pub fn new(config: &'a SearchConfig) -> Self {
        Self { config }
    }

    /// Transforms `raw_logits` (`[batch * num_beams, vocab]`) into
    /// accumulated candidate scores of the same shape.
    pub fn process(
        &self,
        raw_logits: ArrayView2<f32>,
        state: &StepState<'_>,
    ) -> SearchResult<Array2<f32>> {
        if raw_logits.iter().any(|v| !v.is_finite()) {
            return Err(SearchError::NumericAnomaly { step: state.step });
        }

        let num_beams = self.config.num_beams;
        debug_assert_eq!(raw_logits.nrows(), state.groups.len() * num_beams);
        debug_assert_eq!(raw_logits.ncols(), self.config.vocab_size);

        let config = self.config;
        let mut scores = raw_logits.to_owned();
        scores
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(row_idx, mut row)| {
                let batch_idx = row_idx / num_beams;
                let slot = row_idx % num_beams;
                let hyp = state.groups[batch_idx].slot(slot);

                if hyp.finished {
                    row.fill(f32::NEG_INFINITY);
                    return;
                }

                log_softmax_inplace(&mut row);

                if state.step == 0 {
                    if let Some(forced_bos) = config.forced_bos_token_id {
                        row.fill(f32::NEG_INFINITY);
                        row[forced_bos as usize] = hyp.score;
                        return;
                    }
                }

                if let Some(mask) = &config.vocab_mask {
                    for (token, value) in row.iter_mut().enumerate() {
                        if !mask.permits(token as u32) {
                            *value = f32::NEG_INFINITY;
                        }
                    }
                }

                // Total sequence length if this row's candidate is appended.
                let next_len = state.prefix_lens[batch_idx] + hyp.len() + 1;

                if next_len < config.min_length {
                    for &eos in &config.eos_token_ids {
                        row[eos as usize] = f32::NEG_INFINITY;
                    }
                }

                if next_len == config.max_length {
                    if let Some(forced_eos) = config.forced_eos_token_id {
                        row.fill(f32::NEG_INFINITY);
                        row[forced_eos as usize] = hyp.score;
                        return;
                    }
                }

                if config.repetition_penalty != 1.0 {
                    let prompt = state
                        .prompt_histories
                        .map(|p| p[batch_idx].as_slice())
                        .unwrap_or(&[]);
                    apply_repetition_penalty_inplace(
                        &mut row,
                        prompt.iter().chain(hyp.tokens.iter()).copied(),
                        config.repetition_penalty,
                    );
                }

                row.mapv_inplace(|lp| lp + hyp.score);
            });

        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use approx::assert_relative_eq;
    use ndarray::{array, Array1, Array2};

    use super::*;
    use crate::beam::Hypothesis;
    use crate::config::VocabMask;

    fn config(vocab: usize) -> SearchConfig {
        SearchConfig {
            num_beams: 1,
            vocab_size: vocab,
            max_length: 16,
            eos_token_ids: HashSet::from([(vocab - 1) as u32]),
            ..Default::default()
        }
    }

    fn single_group() -> Vec<BeamGroup> {
        vec![BeamGroup::new(1)]
    }

    #[test]
    fn test_log_softmax_matches_softmax_log() {
        let logits = array![1.0_f32, 2.0, 3.0];
        let mut log_probs = logits.clone();
        log_softmax_inplace(&mut log_probs);

        let max = 3.0_f32;
        let sum: f32 = logits.iter().map(|x| (x - max).exp()).sum();
        for i in 0..3 {
            let expected = (logits[i] - max).exp() / sum;
            assert_relative_eq!(log_probs[i], expected.ln(), epsilon = 1e-5);
        }
    }

    #[test]
    fn test_log_softmax_large_values_stay_finite() {
        let mut row = array![1000.0_f32, 1001.0, 1002.0];
        log_softmax_inplace(&mut row);
        assert!(row.iter().all(|x| x.is_finite()));
        assert!(row.iter().all(|&x| x <= 0.0));
    }

    #[test]
    fn test_repetition_penalty_multiplies_negative_log_probs() {
        let mut row = Array1::from_vec(vec![-1.0_f32, -2.0, -0.5]);
        apply_repetition_penalty_inplace(&mut row, [1u32].into_iter(), 2.0);
        assert_relative_eq!(row[0], -1.0);
        assert_relative_eq!(row[1], -4.0);
        assert_relative_eq!(row[2], -0.5);
    }

    #[test]
    fn test_repetition_penalty_ignores_out_of_range_tokens() {
        let mut row = Array1::from_vec(vec![-1.0_f32, -2.0]);
        apply_repetition_penalty_inplace(&mut row, [100u32].into_iter(), 2.0);
        assert_relative_eq!(row[0], -1.0);
        assert_relative_eq!(row[1], -2.0);
    }

    #[test]
    fn test_non_finite_logits_rejected() {
        let cfg = config(3);
        let groups = single_group();
        let raw = array![[0.0_f32, f32::NAN, 1.0]];
        let state = StepState {
            step: 7,
            groups: &groups,
            prefix_lens: &[1],
            prompt_histories: None,
        };
        match LogitsProcessor::new(&cfg).process(raw.view(), &state) {
            Err(SearchError::NumericAnomaly { step }) => assert_eq!(step, 7),
            other => panic!("expected NumericAnomaly, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_min_length_bans_eos() {
        let mut cfg = config(4);
        cfg.min_length = 4;
        let groups = single_group();
        let raw = Array2::zeros((1, 4));
        let state = StepState {
            step: 0,
            groups: &groups,
            prefix_lens: &[1],
            prompt_histories: None,
        };
        // next_len = 1 + 0 + 1 = 2 < 4, so EOS (token 3) must be banned.
        let scores = LogitsProcessor::new(&cfg).process(raw.view(), &state).unwrap();
        assert_eq!(scores[[0, 3]], f32::NEG_INFINITY);
        assert!(scores[[0, 0]].is_finite());
    }

    #[test]
    fn test_min_length_boundary_allows_eos() {
        let mut cfg = config(4);
        cfg.min_length = 2;
        let groups = single_group();
        let raw = Array2::zeros((1, 4));
        let state = StepState {
            step: 0,
            groups: &groups,
            prefix_lens: &[1],
            prompt_histories: None,
        };
        // next_len = 2 == min_length: EOS may now be selected.
        let scores = LogitsProcessor::new(&cfg).process(raw.view(), &state).unwrap();
        assert!(scores[[0, 3]].is_finite());
    }

    #[test]
    fn test_deny_mask_forces_negative_infinity() {
        let mut cfg = config(4);
        cfg.vocab_mask = Some(VocabMask::Deny(HashSet::from([1])));
        let groups = single_group();
        let raw = Array2::zeros((1, 4));
        let state = StepState {
            step: 0,
            groups: &groups,
            prefix_lens: &[1],
            prompt_histories: None,
        };
        let scores = LogitsProcessor::new(&cfg).process(raw.view(), &state).unwrap();
        assert_eq!(scores[[0, 1]], f32::NEG_INFINITY);
        assert!(scores[[0, 0]].is_finite());
    }

    #[test]
    fn test_allow_mask_bans_everything_else() {
        let mut cfg = config(4);
        cfg.vocab_mask = Some(VocabMask::Allow(HashSet::from([2, 3])));
        let groups = single_group();
        let raw = Array2::zeros((1, 4));
        let state = StepState {
            step: 0,
            groups: &groups,
            prefix_lens: &[1],
            prompt_histories: None,
        };
        let scores = LogitsProcessor::new(&cfg).process(raw.view(), &state).unwrap();
        assert_eq!(scores[[0, 0]], f32::NEG_INFINITY);
        assert_eq!(scores[[0, 1]], f32::NEG_INFINITY);
        assert!(scores[[0, 2]].is_finite());
    }

    #[test]
    fn test_scores_accumulate_onto_hypothesis() {
        let cfg = config(3);
        let mut hyp = Hypothesis::root(0.0).extended(0, -1.5);
        hyp.score = -1.5;
        let groups = vec![BeamGroup::from_hypotheses(vec![hyp])];
        let raw = Array2::zeros((1, 3));
        let state = StepState {
            step: 1,
            groups: &groups,
            prefix_lens: &[1],
            prompt_histories: None,
        };
        let scores = LogitsProcessor::new(&cfg).process(raw.view(), &state).unwrap();
        // Uniform logits over 3 tokens: log(1/3) per token, plus -1.5.
        let expected = (1.0_f32 / 3.0).ln() - 1.5;
        assert_relative_eq!(scores[[0, 0]], expected, epsilon = 1e-5);
    }

    #[test]
    fn test_finished_rows_are_excluded() {
        let cfg = config(3);
        let mut hyp = Hypothesis::root(0.0).extended(2, -0.5);
        hyp.finish(0);
        let groups = vec![BeamGroup::from_hypotheses(vec![hyp])];
        let raw = Array2::zeros((1, 3));
        let state = StepState {
            step: 1,
            groups: &groups,
            prefix_lens: &[1],
            prompt_histories: None,
        };
        let scores = LogitsProcessor::new(&cfg).process(raw.view(), &state).unwrap();
        assert!(scores.iter().all(|&v| v == f32::NEG_INFINITY));
    }

    #[test]
    fn test_forced_bos_pins_first_token() {
        let mut cfg = config(4);
        cfg.forced_bos_token_id = Some(2);
        let groups = single_group();
        let raw = Array2::zeros((1, 4));
        let state = StepState {
            step: 0,
            groups: &groups,
            prefix_lens: &[1],
            prompt_histories: None,
        };
        let scores = LogitsProcessor::new(&cfg).process(raw.view(), &state).unwrap();
        assert_eq!(scores[[0, 0]], f32::NEG_INFINITY);
        assert_relative_eq!(scores[[0, 2]], 0.0);
    }

    #[test]
    fn test_prompt_history_feeds_repetition_penalty() {
        let mut cfg = config(4);
        cfg.repetition_penalty = 2.0;
        let groups = single_group();
        let raw = Array2::zeros((1, 4));
        let prompts = vec![vec![1u32]];
        let state = StepState {
            step: 0,
            groups: &groups,
            prefix_lens: &[1],
            prompt_histories: Some(&prompts),
        };
        let scores = LogitsProcessor::new(&cfg).process(raw.view(), &state).unwrap();
        // Token 1 appears in the prompt and is penalized relative to token 0.
        assert!(scores[[0, 1]] < scores[[0, 0]]);
    }
}
