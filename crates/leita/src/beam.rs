//! Beam state: hypotheses and per-batch-item beam groups.

/// One candidate output sequence with its cumulative log-probability.
///
/// `tokens` holds only the tokens emitted during search; the prompt (or
/// decoder-start) prefix lives with the request. Once `finished` is set the
/// hypothesis is frozen: it is never extended or rescored again, except for
/// the final length-penalty normalization.
#[derive(Clone, Debug)]
pub struct Hypothesis {
    pub tokens: Vec<u32>,
    pub score: f32,
    pub finished: bool,
    pub finished_at: Option<usize>,
}

impl Hypothesis {
    /// An empty hypothesis with the given starting score.
    pub fn root(score: f32) -> Self {
        Self {
            tokens: Vec::new(),
            score,
            finished: false,
            finished_at: None,
        }
    }

    /// Number of emitted tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// A copy of this hypothesis extended by one token with the new
    /// accumulated score.
    pub fn extended(&self, token: u32, score: f32) -> Self {
        debug_assert!(!self.finished, "finished hypotheses are frozen");
        let mut tokens = Vec::with_capacity(self.tokens.len() + 1);
        tokens.extend_from_slice(&self.tokens);
        tokens.push(token);
        Self {
            tokens,
            score,
            finished: false,
            finished_at: None,
        }
    }

    pub fn finish(&mut self, step: usize) {
        self.finished = true;
        self.finished_at = Some(step);
    }

    /// Length-penalty-adjusted score: `score / len^penalty`. With exponent
    /// 0 this is the raw cumulative score.
    pub fn normalized_score(&self, length_penalty: f32) -> f32 {
        let len = self.tokens.len().max(1) as f32;
        self.score / len.powf(length_penalty)
    }
}

/// The set of exactly `num_beams` hypotheses owned by one batch item.
///
/// Finished hypotheses stay in their slots as dead ends, so the group
/// always contributes `num_beams` candidates to the next selection round.
/// Slot 0 starts with score 0 and the rest at negative infinity so that
/// identical first-step rows do not flood selection with duplicates.
#[derive(Clone, Debug)]
pub struct BeamGroup {
    hypotheses: Vec<Hypothesis>,
    done: bool,
}

impl BeamGroup {
    pub fn new(num_beams: usize) -> Self {
        let hypotheses = (0..num_beams)
            .map(|i| Hypothesis::root(if i == 0 { 0.0 } else { f32::NEG_INFINITY }))
            .collect();
        Self {
            hypotheses,
            done: false,
        }
    }

    /// Rebuilds the group from the survivors of one selection round.
    pub fn from_hypotheses(hypotheses: Vec<Hypothesis>) -> Self {
        debug_assert!(!hypotheses.is_empty());
        Self {
            hypotheses,
            done: false,
        }
    }

    pub fn num_beams(&self) -> usize {
        self.hypotheses.len()
    }

    pub fn slots(&self) -> &[Hypothesis] {
        &self.hypotheses
    }

    pub fn slots_mut(&mut self) -> &mut [Hypothesis] {
        &mut self.hypotheses
    }

    pub fn slot(&self, index: usize) -> &Hypothesis {
        &self.hypotheses[index]
    }

    pub fn finished_count(&self) -> usize {
        self.hypotheses.iter().filter(|h| h.finished).count()
    }

    pub fn is_fully_finished(&self) -> bool {
        self.hypotheses.iter().all(|h| h.finished)
    }

    /// Whether this batch item has stopped stepping.
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn mark_done(&mut self) {
        self.done = true;
    }

    /// The early-stopping cutoff: true once at least `min_finished`
    /// hypotheses are finished and the best active hypothesis's highest
    /// attainable normalized score (scores are non-increasing) cannot beat
    /// the worst finished one.
    pub fn early_stop_reached(&self, length_penalty: f32, min_finished: usize) -> bool {
        let finished = self.finished_count();
        if finished < min_finished || finished == 0 {
            return false;
        }
        let worst_finished = self
            .hypotheses
            .iter()
            .filter(|h| h.finished)
            .map(|h| h.normalized_score(length_penalty))
            .fold(f32::INFINITY, f32::min);
        let best_attainable = self
            .hypotheses
            .iter()
            .filter(|h| !h.finished)
            .map(|h| {
                let len = (h.len() + 1).max(1) as f32;
                h.score / len.powf(length_penalty)
            })
            .fold(f32::NEG_INFINITY, f32::max);
        worst_finished >= best_attainable
    }

    /// Slot indices ranked by descending length-penalty-adjusted score,
    /// ties broken by the lower slot index.
    pub fn ranked(&self, length_penalty: f32) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.hypotheses.len()).collect();
        order.sort_by(|&a, &b| {
            self.hypotheses[b]
                .normalized_score(length_penalty)
                .total_cmp(&self.hypotheses[a].normalized_score(length_penalty))
                .then(a.cmp(&b))
        });
        order
    }
}
