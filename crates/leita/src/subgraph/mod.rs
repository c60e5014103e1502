//! Model-shape drivers: one search loop, two subgraph layouts.
//!
//! The loop is written once against [`Subgraph`] and is oblivious to which
//! variant is bound. [`GptSubgraph`] re-enters the same decoder-only model
//! every step; [`Seq2SeqSubgraph`] runs its encoder exactly once up front
//! and then iterates the cross-attending decoder. Binding happens at
//! request setup from static model metadata and never changes during the
//! request.

mod gpt;
mod seq2seq;

pub use gpt::GptSubgraph;
pub use seq2seq::Seq2SeqSubgraph;

use anyhow::Result;
use async_trait::async_trait;
use ndarray::{s, Array2, Array3, ArrayView2};

use crate::cache::Cache;
use crate::config::SearchConfig;
use crate::device::DeviceCapabilities;
use crate::feeds::DecoderFeeds;
use crate::selector::StepSelection;

/// Which model shape a request is bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubgraphKind {
    /// Decoder-only, autoregressive re-entry.
    Gpt,
    /// Encoder + decoder pair; the encoder runs once per request.
    Seq2Seq,
}

/// The external model-execution collaborator for iterative subgraphs.
///
/// `run` may dispatch work to an accelerator internally, but the loop
/// observes it synchronously: it awaits completion before scoring. A
/// failure is fatal to the whole request.
#[async_trait]
pub trait ModelExecutor: Send + Sync {
    /// Executes the subgraph on the current feeds and returns logits of
    /// shape `[rows, input_len, vocab]`.
    ///
    /// Implementations write new recurrent entries at the cache's current
    /// length and leave it there; the engine advances and reorders the
    /// cache between steps.
    async fn run(&self, feeds: &mut DecoderFeeds) -> Result<Array3<f32>>;

    /// Allocates the recurrent cache this executor wants carried across
    /// steps, or `None` for stateless execution (the full context is then
    /// re-fed every step).
    fn new_cache(&self, _rows: usize, _capacity: usize) -> Result<Option<Box<dyn Cache>>> {
        Ok(None)
    }
}

/// The external encoder collaborator of an encoder-decoder model.
#[async_trait]
pub trait EncoderExecutor: Send + Sync {
    /// Encodes the source tokens into a fixed context of shape
    /// `[batch, src_len, hidden]`.
    async fn run(
        &self,
        input_ids: ArrayView2<'_, u32>,
        attention_mask: ArrayView2<'_, f32>,
    ) -> Result<Array3<f32>>;
}

/// Feeds for step 0 plus the per-item prefix lengths the scorer needs.
pub struct InitialFeeds {
    pub feeds: DecoderFeeds,
    /// Per batch item: tokens already occupying the output sequence before
    /// the first generated token (prompt length, or 1 for decoder-start).
    pub prefix_lens: Vec<usize>,
}

/// Uniform contract between the search loop and a bound model shape.
#[async_trait]
pub trait Subgraph: Send + Sync {
    fn kind(&self) -> SubgraphKind;

    /// Builds the feeds for the first step, running the encoder for
    /// encoder-decoder models.
    async fn build_initial_feeds(
        &self,
        prompts: &[Vec<u32>],
        config: &SearchConfig,
        caps: &dyn DeviceCapabilities,
    ) -> Result<InitialFeeds>;

    /// One model execution over the current feeds.
    async fn run(&self, feeds: &mut DecoderFeeds) -> Result<Array3<f32>>;

    /// Slices the raw output down to the last position:
    /// `[rows, input_len, vocab] -> [rows, vocab]`.
    fn extract_logits(&self, raw: &Array3<f32>) -> Array2<f32> {
        let last = raw.shape()[1] - 1;
        raw.slice(s![.., last, ..]).to_owned()
    }

    /// Rewrites the feeds for the next step from the selection: a gather
    /// keyed by parent beam index over every per-beam buffer, then an
    /// append of the newly chosen tokens.
    fn update_feeds(
        &self,
        feeds: &mut DecoderFeeds,
        selection: &StepSelection,
        caps: &dyn DeviceCapabilities,
    ) -> Result<()>;
}

/// The subgraph variant bound to one request.
pub enum AnySubgraph {
    Gpt(GptSubgraph),
    Seq2Seq(Seq2SeqSubgraph),
}

#[async_trait]
impl Subgraph for AnySubgraph {
    fn kind(&self) -> SubgraphKind {
        match self {
            AnySubgraph::Gpt(s) => s.kind(),
            AnySubgraph::Seq2Seq(s) => s.kind(),
        }
    }

    async fn build_initial_feeds(
        &self,
        prompts: &[Vec<u32>],
        config: &SearchConfig,
        caps: &dyn DeviceCapabilities,
    ) -> Result<InitialFeeds> {
        match self {
            AnySubgraph::Gpt(s) => s.build_initial_feeds(prompts, config, caps).await,
            AnySubgraph::Seq2Seq(s) => s.build_initial_feeds(prompts, config, caps).await,
        }
    }

    async fn run(&self, feeds: &mut DecoderFeeds) -> Result<Array3<f32>> {
        match self {
            AnySubgraph::Gpt(s) => s.run(feeds).await,
            AnySubgraph::Seq2Seq(s) => s.run(feeds).await,
        }
    }

    fn extract_logits(&self, raw: &Array3<f32>) -> Array2<f32> {
        match self {
            AnySubgraph::Gpt(s) => s.extract_logits(raw),
            AnySubgraph::Seq2Seq(s) => s.extract_logits(raw),
        }
    }

    fn update_feeds(
        &self,
        feeds: &mut DecoderFeeds,
        selection: &StepSelection,
        caps: &dyn DeviceCapabilities,
    ) -> Result<()> {
        match self {
            AnySubgraph::Gpt(s) => s.update_feeds(feeds, selection, caps),
            AnySubgraph::Seq2Seq(s) => s.update_feeds(feeds, selection, caps),
        }
    }
}

/// Shared feed-update path for iterative decoding: advance and permute the
/// cache (or re-gather the running context when stateless), gather the
/// attention mask by parent, and append the new token column.
pub(crate) fn advance_decoder_feeds(
    feeds: &mut DecoderFeeds,
    selection: &StepSelection,
    caps: &dyn DeviceCapabilities,
) -> Result<()> {
    let rows = feeds.rows();
    let prev_width = feeds.input_ids.ncols();
    let parents = &selection.parents;

    let gathered_mask = caps.gather_rows_f32(feeds.attention_mask.view(), parents)?;
    let mut mask = Array2::zeros((rows, gathered_mask.ncols() + 1));
    mask.slice_mut(s![.., ..gathered_mask.ncols()])
        .assign(&gathered_mask);
    for (row, &live) in selection.live.iter().enumerate() {
        mask[[row, gathered_mask.ncols()]] = if live { 1.0 } else { 0.0 };
    }
    feeds.attention_mask = mask;

    let token_column =
        Array2::from_shape_fn((rows, 1), |(row, _)| selection.next_tokens[row]);

    match feeds.cache.as_mut() {
        Some(cache) => {
            // The executor wrote `prev_width` new positions during the step
            // that just ran; account for them before permuting rows.
            cache.increment_len(prev_width);
            cache.reorder(parents)?;
            feeds.position_offset += prev_width;
            feeds.input_ids = token_column;
        }
        None => {
            // Stateless execution: the running context itself is the state,
            // so gather it by parent and grow it by one column.
            let gathered = caps.gather_rows_u32(feeds.input_ids.view(), parents)?;
            let mut grown = Array2::zeros((rows, prev_width + 1));
            grown.slice_mut(s![.., ..prev_width]).assign(&gathered);
            grown.slice_mut(s![.., prev_width..]).assign(&token_column);
            feeds.input_ids = grown;
        }
    }
    Ok(())
}
