//! The beam-search orchestrator.

use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use log::{debug, info, warn};
use ndarray::{Array2, Array3};

use crate::beam::BeamGroup;
use crate::cancel::CancellationToken;
use crate::config::SearchConfig;
use crate::device::DeviceCapabilities;
use crate::error::{SearchError, SearchResult};
use crate::logits::StepState;
use crate::selector::CandidateSelector;
use crate::state::{GenerationState, SearchPhase};
use crate::subgraph::{AnySubgraph, Subgraph, SubgraphKind};

/// Final result of one generation request.
///
/// `sequences` is rectangular, `[batch, num_return_sequences, max_length]`,
/// right-padded with the pad token past each sequence's actual length.
/// `scores` holds the matching length-penalty-adjusted scores.
pub struct SearchOutput {
    pub sequences: Array3<u32>,
    pub scores: Array2<f32>,
}

/// Drives `Initializing -> Stepping -> Finalizing -> Done` for one request,
/// with `Aborted` as the terminal state of any fatal error.
///
/// Built once per model load (or per request); `run` may be called
/// concurrently from multiple requests since each call owns its state
/// exclusively. Within a call the step loop is strictly sequential: each
/// step's feeds depend on the previous step's selection, and the loop
/// suspends exactly once per step, on the model execution.
pub struct BeamSearch {
    pub(crate) config: SearchConfig,
    pub(crate) subgraph: AnySubgraph,
    pub(crate) caps: Arc<dyn DeviceCapabilities>,
}

impl BeamSearch {
    pub fn new(
        config: SearchConfig,
        subgraph: AnySubgraph,
        caps: Arc<dyn DeviceCapabilities>,
    ) -> SearchResult<Self> {
        config.validate()?;
        if subgraph.kind() == SubgraphKind::Seq2Seq && config.decoder_start_token_id.is_none() {
            return Err(SearchError::InvalidConfig(
                "encoder-decoder models require decoder_start_token_id".into(),
            ));
        }
        Ok(Self {
            config,
            subgraph,
            caps,
        })
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Runs the full search for one batch of prompts.
    pub async fn run(
        &self,
        prompts: &[Vec<u32>],
        cancel: &CancellationToken,
    ) -> SearchResult<SearchOutput> {
        let mut ctx = SearchContext::initialize(
            &self.config,
            &self.subgraph,
            self.caps.as_ref(),
            prompts.to_vec(),
        )
        .await?;

        while !ctx.state.all_done() {
            ctx.step(cancel).await?;
        }
        Ok(ctx.finalize())
    }
}

/// One in-flight request: the state machine the public entry points drive.
pub(crate) struct SearchContext<'a> {
    pub(crate) config: &'a SearchConfig,
    subgraph: &'a AnySubgraph,
    caps: &'a dyn DeviceCapabilities,
    pub(crate) state: GenerationState,
    prompts: Vec<Vec<u32>>,
    pub(crate) phase: SearchPhase,
    started: Instant,
}

impl<'a> SearchContext<'a> {
    pub(crate) async fn initialize(
        config: &'a SearchConfig,
        subgraph: &'a AnySubgraph,
        caps: &'a dyn DeviceCapabilities,
        prompts: Vec<Vec<u32>>,
    ) -> SearchResult<Self> {
        if prompts.is_empty() {
            return Err(SearchError::InvalidConfig(
                "at least one prompt is required".into(),
            ));
        }
        for (b, prompt) in prompts.iter().enumerate() {
            if let Some(&tok) = prompt.iter().find(|&&t| t as usize >= config.vocab_size) {
                return Err(SearchError::InvalidConfig(format!(
                    "prompt {} contains token {} outside the vocabulary (size {})",
                    b, tok, config.vocab_size
                )));
            }
        }

        let init = subgraph
            .build_initial_feeds(&prompts, config, caps)
            .await
            .map_err(|e| SearchError::Execution { step: 0, source: e })?;

        for (b, &prefix) in init.prefix_lens.iter().enumerate() {
            if prefix >= config.max_length {
                return Err(SearchError::InvalidConfig(format!(
                    "prompt {} occupies {} of max_length {}, leaving no room to generate",
                    b, prefix, config.max_length
                )));
            }
        }

        debug!(
            "beam search initialized: batch={}, beams={}, max_length={}",
            prompts.len(),
            config.num_beams,
            config.max_length
        );

        let groups = (0..prompts.len())
            .map(|_| BeamGroup::new(config.num_beams))
            .collect();
        Ok(Self {
            config,
            subgraph,
            caps,
            state: GenerationState {
                groups,
                step: 0,
                feeds: init.feeds,
                prefix_lens: init.prefix_lens,
            },
            prompts,
            phase: SearchPhase::Stepping,
            started: Instant::now(),
        })
    }

    /// One full iteration: model execution, scoring, selection, feed
    /// update. Returns after mutating the beam groups; callers loop until
    /// [`GenerationState::all_done`].
    pub(crate) async fn step(&mut self, cancel: &CancellationToken) -> SearchResult<()> {
        let step = self.state.step;

        // Cancellation is tested only here, at the step boundary.
        if cancel.is_cancelled() {
            self.phase = SearchPhase::Aborted;
            return Err(SearchError::Cancelled { step });
        }
        if step >= self.config.max_length {
            // The force-finish in selection makes this unreachable; bail
            // out rather than loop forever if a subgraph misbehaves.
            warn!("step {} exceeded max_length, forcing completion", step);
            for group in &mut self.state.groups {
                group.mark_done();
            }
            return Ok(());
        }

        let raw = self
            .subgraph
            .run(&mut self.state.feeds)
            .await
            .map_err(|e| {
                self.phase = SearchPhase::Aborted;
                SearchError::Execution { step, source: e }
            })?;

        let rows = self.state.batch_size() * self.config.num_beams;
        if raw.shape()[0] != rows || raw.shape()[1] == 0 || raw.shape()[2] != self.config.vocab_size
        {
            self.phase = SearchPhase::Aborted;
            return Err(SearchError::Execution {
                step,
                source: anyhow!(
                    "subgraph produced logits shaped {:?}, expected [{}, >=1, {}]",
                    raw.shape(),
                    rows,
                    self.config.vocab_size
                ),
            });
        }

        let last = self.subgraph.extract_logits(&raw);
        let logits = self.caps.copy_to_host(last.view()).map_err(|e| {
            self.phase = SearchPhase::Aborted;
            SearchError::Resource { step, source: e }
        })?;

        let prompt_histories = match self.subgraph.kind() {
            SubgraphKind::Gpt => Some(self.prompts.as_slice()),
            SubgraphKind::Seq2Seq => None,
        };
        let step_state = StepState {
            step,
            groups: &self.state.groups,
            prefix_lens: &self.state.prefix_lens,
            prompt_histories,
        };
        let scores = self
            .caps
            .process_logits(logits.view(), &step_state, self.config)
            .map_err(|e| {
                self.phase = SearchPhase::Aborted;
                e
            })?;

        let mut selection = CandidateSelector::new(self.config)
            .select(
                step,
                &scores,
                &self.state.groups,
                &self.state.prefix_lens,
                self.caps,
            )
            .map_err(|e| {
                self.phase = SearchPhase::Aborted;
                e
            })?;

        self.state.groups = std::mem::take(&mut selection.groups);
        self.state.step = step + 1;

        if self.state.all_done() {
            debug!("all batch items finished at step {}", step);
            return Ok(());
        }

        self.subgraph
            .update_feeds(&mut self.state.feeds, &selection, self.caps)
            .map_err(|e| {
                self.phase = SearchPhase::Aborted;
                SearchError::Resource { step, source: e }
            })?;

        debug!(
            "step {} complete: {}/{} batch items still active",
            step,
            self.state.groups.iter().filter(|g| !g.is_done()).count(),
            self.state.batch_size()
        );
        Ok(())
    }

    /// Ranks, pads and assembles the rectangular output.
    pub(crate) fn finalize(mut self) -> SearchOutput {
        self.phase = SearchPhase::Finalizing;
        let config = self.config;
        let batch = self.state.batch_size();
        let returns = config.num_return_sequences;

        let mut sequences =
            Array3::from_elem((batch, returns, config.max_length), config.pad_token_id);
        let mut scores = Array2::zeros((batch, returns));

        for (b, group) in self.state.groups.iter().enumerate() {
            let prefix: &[u32] = match self.subgraph.kind() {
                SubgraphKind::Gpt => &self.prompts[b],
                // Validated at construction time.
                SubgraphKind::Seq2Seq => {
                    std::slice::from_ref(config.decoder_start_token_id.as_ref().unwrap())
                }
            };
            let ranked = group.ranked(config.length_penalty);
            for (r, &slot) in ranked.iter().take(returns).enumerate() {
                let hyp = group.slot(slot);
                for (pos, &tok) in prefix
                    .iter()
                    .chain(hyp.tokens.iter())
                    .take(config.max_length)
                    .enumerate()
                {
                    sequences[[b, r, pos]] = tok;
                }
                scores[[b, r]] = hyp.normalized_score(config.length_penalty);
            }
        }

        info!(
            "beam search done: batch={}, steps={}, elapsed={:.2}ms",
            batch,
            self.state.step,
            self.started.elapsed().as_secs_f64() * 1000.0
        );
        self.phase = SearchPhase::Done;
        SearchOutput { sequences, scores }
    }
}
