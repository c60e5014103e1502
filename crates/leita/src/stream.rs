//! Streaming observation of an in-flight search.

use async_stream::try_stream;
use futures_core::stream::Stream;

use crate::cancel::CancellationToken;
use crate::error::SearchResult;
use crate::search::{BeamSearch, SearchContext};

/// One token surfaced from the stream: the newest token of the current
/// best beam of one batch item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamedToken {
    pub batch_index: usize,
    pub id: u32,
    pub step: usize,
}

impl BeamSearch {
    /// Streams the best beam's newest token after every step.
    ///
    /// With more than one beam the leading hypothesis can change while the
    /// search runs, so streamed tokens may not prefix the final result;
    /// [`BeamSearch::run`] is the stable interface. The stream ends once
    /// every batch item has finished and does not replay the final
    /// ranking.
    pub fn run_stream(
        &self,
        prompts: Vec<Vec<u32>>,
        cancel: CancellationToken,
    ) -> impl Stream<Item = SearchResult<StreamedToken>> + '_ {
        try_stream! {
            if self.config.num_beams > 1 {
                log::warn!(
                    "streaming beam search is unstable; tokens may differ from the final ranking"
                );
            }

            let mut ctx = SearchContext::initialize(
                &self.config,
                &self.subgraph,
                self.caps.as_ref(),
                prompts,
            )
            .await?;

            while !ctx.state.all_done() {
                let pre_done: Vec<bool> =
                    ctx.state.groups.iter().map(|g| g.is_done()).collect();
                ctx.step(&cancel).await?;
                let step = ctx.state.step - 1;

                for (b, group) in ctx.state.groups.iter().enumerate() {
                    if pre_done[b] {
                        continue;
                    }
                    // Slot 0 holds the best survivor. Skip hypotheses that
                    // finished on an earlier step; their newest token was
                    // already reported.
                    let best = group.slot(0);
                    if best.finished_at.map_or(false, |s| s != step) {
                        continue;
                    }
                    if let Some(&token) = best.tokens.last() {
                        yield StreamedToken {
                            batch_index: b,
                            id: token,
                            step,
                        };
                    }
                }
            }
        }
    }
}
