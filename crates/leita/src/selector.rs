//! Per-step survivor selection over the candidate pool.

use std::collections::HashSet;

use ndarray::Array2;

use crate::beam::BeamGroup;
use crate::config::{EarlyStopping, SearchConfig};
use crate::device::DeviceCapabilities;
use crate::error::{SearchError, SearchResult};

/// Outcome of one selection round, consumed by the feeds updater.
///
/// `parents`, `next_tokens` and `live` are row-indexed like the feeds
/// (`row = batch_index * num_beams + slot`). A row is live when it carries
/// a token emitted this step; rows of finished hypotheses and finished
/// batch items are refilled with the pad token and masked out, so the
/// batch-aligned tensor shapes stay constant.
pub struct StepSelection {
    pub groups: Vec<BeamGroup>,
    pub parents: Vec<usize>,
    pub next_tokens: Vec<u32>,
    pub live: Vec<bool>,
}

struct Candidate {
    score: f32,
    parent: usize,
    token: u32,
    /// `parent * vocab_size + token`: the deterministic tie-break key.
    index: usize,
}

/// Chooses the surviving and finished hypotheses of each step.
///
/// For every batch item the previous `num_beams` hypotheses propose
/// continuations (finished ones propose exactly themselves); the top
/// `2 * num_beams` candidates by accumulated score form the pool, ties
/// broken by the lower candidate index, duplicates discarded by
/// (parent, token); the first `num_beams` distinct survivors become the
/// next group.
pub struct CandidateSelector<'a> {
    config: &'a SearchConfig,
}

impl<'a> CandidateSelector<'a> {
    pub fn new(config: &'a SearchConfig) -> Self {
        Self { config }
    }

    pub fn select(
        &self,
        step: usize,
        scores: &Array2<f32>,
        groups: &[BeamGroup],
        prefix_lens: &[usize],
        caps: &dyn DeviceCapabilities,
    ) -> SearchResult<StepSelection> {
        let num_beams = self.config.num_beams;
        let pool_size = 2 * num_beams;
        let pad = self.config.pad_token_id;

        let mut selection = StepSelection {
            groups: Vec::with_capacity(groups.len()),
            parents: Vec::with_capacity(groups.len() * num_beams),
            next_tokens: Vec::with_capacity(groups.len() * num_beams),
            live: Vec::with_capacity(groups.len() * num_beams),
        };

        for (batch_idx, group) in groups.iter().enumerate() {
            let base = batch_idx * num_beams;

            if group.is_done() {
                // Slots stay present so tensor shapes stay constant, but
                // nothing is extended and nothing is re-fed.
                for slot in 0..num_beams {
                    selection.parents.push(base + slot);
                    selection.next_tokens.push(pad);
                    selection.live.push(false);
                }
                selection.groups.push(group.clone());
                continue;
            }

            let mut candidates: Vec<Candidate> = Vec::with_capacity(pool_size * num_beams);
            for slot in 0..num_beams {
                let hyp = group.slot(slot);
                if hyp.finished {
                    // A dead-ended slot competes with its frozen score but
                    // is never extended.
                    candidates.push(Candidate {
                        score: hyp.score,
                        parent: slot,
                        token: pad,
                        index: slot * self.config.vocab_size + pad as usize,
                    });
                    continue;
                }
                let row = scores.row(base + slot);
                let top = caps
                    .top_k(row, pool_size)
                    .map_err(|e| SearchError::Resource { step, source: e })?;
                for (value, token) in top.values.into_iter().zip(top.indices) {
                    candidates.push(Candidate {
                        score: value,
                        parent: slot,
                        token: token as u32,
                        index: slot * self.config.vocab_size + token,
                    });
                }
            }

            candidates.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.index.cmp(&b.index)));
            candidates.truncate(pool_size);

            let mut seen: HashSet<(usize, u32)> = HashSet::with_capacity(pool_size);
            let mut survivors = Vec::with_capacity(num_beams);
            for cand in candidates {
                if survivors.len() == num_beams {
                    break;
                }
                if !seen.insert((cand.parent, cand.token)) {
                    continue;
                }
                let parent_hyp = group.slot(cand.parent);
                if parent_hyp.finished {
                    selection.parents.push(base + cand.parent);
                    selection.next_tokens.push(pad);
                    selection.live.push(false);
                    survivors.push(parent_hyp.clone());
                } else {
                    let mut hyp = parent_hyp.extended(cand.token, cand.score);
                    if self.config.is_eos(cand.token) {
                        hyp.finish(step);
                    }
                    selection.parents.push(base + cand.parent);
                    selection.next_tokens.push(cand.token);
                    selection.live.push(true);
                    survivors.push(hyp);
                }
            }

            // A vocabulary smaller than the pool can starve the group; keep
            // the slot count exact with dead copies.
            if survivors.len() < num_beams {
                log::warn!(
                    "batch item {}: only {} distinct candidates for {} beam slots",
                    batch_idx,
                    survivors.len(),
                    num_beams
                );
            }
            while survivors.len() < num_beams {
                let mut filler = survivors
                    .last()
                    .cloned()
                    .unwrap_or_else(|| group.slot(0).clone());
                filler.score = f32::NEG_INFINITY;
                survivors.push(filler);
                let parent = selection.parents.last().copied().unwrap_or(base);
                selection.parents.push(parent);
                selection.next_tokens.push(pad);
                selection.live.push(false);
            }

            // Force-finish anything that has reached the length ceiling;
            // nothing further may be appended.
            let prefix = prefix_lens[batch_idx];
            for hyp in survivors.iter_mut() {
                if !hyp.finished && prefix + hyp.len() >= self.config.max_length {
                    hyp.finish(step);
                }
            }

            let mut next_group = BeamGroup::from_hypotheses(survivors);
            let stop = next_group.is_fully_finished()
                || (self.config.early_stopping == EarlyStopping::Heuristic
                    && next_group.early_stop_reached(
                        self.config.length_penalty,
                        self.config.num_return_sequences,
                    ));
            if stop {
                next_group.mark_done();
            }
            selection.groups.push(next_group);
        }

        Ok(selection)
    }
}
