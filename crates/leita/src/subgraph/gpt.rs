//! Decoder-only subgraph: the same model is re-entered every step.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use ndarray::{Array2, Array3};

use crate::config::SearchConfig;
use crate::device::DeviceCapabilities;
use crate::feeds::DecoderFeeds;
use crate::selector::StepSelection;
use crate::subgraph::{
    advance_decoder_feeds, InitialFeeds, ModelExecutor, Subgraph, SubgraphKind,
};

/// Drives a decoder-only ("GPT-style") model.
///
/// The first step feeds the full prompt, left-padded to a rectangle across
/// the batch; afterwards, with a recurrent cache, only the newly chosen
/// token per beam is fed and the cache rows are permuted to follow beam
/// reordering. Without a cache the whole running context is re-fed.
pub struct GptSubgraph {
    executor: Arc<dyn ModelExecutor>,
}

impl GptSubgraph {
    pub fn new(executor: Arc<dyn ModelExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Subgraph for GptSubgraph {
    fn kind(&self) -> SubgraphKind {
        SubgraphKind::Gpt
    }

    async fn build_initial_feeds(
        &self,
        prompts: &[Vec<u32>],
        config: &SearchConfig,
        caps: &dyn DeviceCapabilities,
    ) -> Result<InitialFeeds> {
        let batch = prompts.len();
        let width = prompts.iter().map(Vec::len).max().unwrap_or(0);
        if width == 0 {
            anyhow::bail!("decoder-only generation requires a non-empty prompt");
        }

        // Left-pad so the newest token is always the last column.
        let mut tokens = Array2::from_elem((batch, width), config.pad_token_id);
        let mut mask = Array2::zeros((batch, width));
        for (b, prompt) in prompts.iter().enumerate() {
            let offset = width - prompt.len();
            for (i, &tok) in prompt.iter().enumerate() {
                tokens[[b, offset + i]] = tok;
                mask[[b, offset + i]] = 1.0;
            }
        }

        let rows = batch * config.num_beams;
        let feeds = DecoderFeeds {
            input_ids: caps.expand_tokens(tokens.view(), config.num_beams)?,
            attention_mask: caps.expand_mask(mask.view(), config.num_beams)?,
            position_offset: 0,
            encoder_state: None,
            encoder_attention_mask: None,
            cache: self.executor.new_cache(rows, config.max_length)?,
        };

        Ok(InitialFeeds {
            feeds,
            prefix_lens: prompts.iter().map(Vec::len).collect(),
        })
    }

    async fn run(&self, feeds: &mut DecoderFeeds) -> Result<Array3<f32>> {
        self.executor.run(feeds).await
    }

    fn update_feeds(
        &self,
        feeds: &mut DecoderFeeds,
        selection: &StepSelection,
        caps: &dyn DeviceCapabilities,
    ) -> Result<()> {
        advance_decoder_feeds(feeds, selection, caps)
    }
}
