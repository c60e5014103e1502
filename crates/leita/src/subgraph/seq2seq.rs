//! Encoder-decoder subgraph: one encoder pass, then an iterative decoder.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ndarray::{Array2, Array3};

use crate::config::SearchConfig;
use crate::device::DeviceCapabilities;
use crate::feeds::DecoderFeeds;
use crate::selector::StepSelection;
use crate::subgraph::{
    advance_decoder_feeds, EncoderExecutor, InitialFeeds, ModelExecutor, Subgraph, SubgraphKind,
};

/// Drives an encoder-decoder ("T5-style") model pair.
///
/// The encoder is invoked exactly once per request, before the loop, and
/// its output is replicated across beams into a fixed context that every
/// decoder step cross-attends to. Only decoder-side recurrent state is
/// carried forward and reordered.
pub struct Seq2SeqSubgraph {
    encoder: Arc<dyn EncoderExecutor>,
    decoder: Arc<dyn ModelExecutor>,
}

impl Seq2SeqSubgraph {
    pub fn new(encoder: Arc<dyn EncoderExecutor>, decoder: Arc<dyn ModelExecutor>) -> Self {
        Self { encoder, decoder }
    }
}

#[async_trait]
impl Subgraph for Seq2SeqSubgraph {
    fn kind(&self) -> SubgraphKind {
        SubgraphKind::Seq2Seq
    }

    async fn build_initial_feeds(
        &self,
        prompts: &[Vec<u32>],
        config: &SearchConfig,
        caps: &dyn DeviceCapabilities,
    ) -> Result<InitialFeeds> {
        let decoder_start = config
            .decoder_start_token_id
            .ok_or_else(|| anyhow!("encoder-decoder models require decoder_start_token_id"))?;

        let batch = prompts.len();
        let src_len = prompts.iter().map(Vec::len).max().unwrap_or(0);
        if src_len == 0 {
            anyhow::bail!("encoder input must not be empty");
        }

        let mut source = Array2::from_elem((batch, src_len), config.pad_token_id);
        let mut source_mask = Array2::zeros((batch, src_len));
        for (b, prompt) in prompts.iter().enumerate() {
            for (i, &tok) in prompt.iter().enumerate() {
                source[[b, i]] = tok;
                source_mask[[b, i]] = 1.0;
            }
        }

        let encoder_state = self.encoder.run(source.view(), source_mask.view()).await?;

        let rows = batch * config.num_beams;
        let feeds = DecoderFeeds {
            input_ids: Array2::from_elem((rows, 1), decoder_start),
            attention_mask: Array2::ones((rows, 1)),
            position_offset: 0,
            encoder_state: Some(caps.expand_hidden(encoder_state.view(), config.num_beams)?),
            encoder_attention_mask: Some(caps.expand_mask(source_mask.view(), config.num_beams)?),
            cache: self.decoder.new_cache(rows, config.max_length)?,
        };

        Ok(InitialFeeds {
            feeds,
            // The decoder-start token is the whole output prefix.
            prefix_lens: vec![1; batch],
        })
    }

    async fn run(&self, feeds: &mut DecoderFeeds) -> Result<Array3<f32>> {
        self.decoder.run(feeds).await
    }

    fn update_feeds(
        &self,
        feeds: &mut DecoderFeeds,
        selection: &StepSelection,
        caps: &dyn DeviceCapabilities,
    ) -> Result<()> {
        // The encoder context and its mask are fixed for the whole request;
        // beam rows within a batch item are identical copies, so the parent
        // gather would be the identity on them.
        advance_decoder_feeds(feeds, selection, caps)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use ndarray::ArrayView2;

    use super::*;
    use crate::device::CpuCapabilities;

    struct CountingEncoder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EncoderExecutor for CountingEncoder {
        async fn run(
            &self,
            input_ids: ArrayView2<'_, u32>,
            _attention_mask: ArrayView2<'_, f32>,
        ) -> Result<Array3<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let (batch, src) = input_ids.dim();
            let mut out = Array3::zeros((batch, src, 4));
            for b in 0..batch {
                out[[b, 0, 0]] = b as f32 + 1.0;
            }
            Ok(out)
        }
    }

    struct DummyDecoder;

    #[async_trait]
    impl ModelExecutor for DummyDecoder {
        async fn run(&self, feeds: &mut DecoderFeeds) -> Result<Array3<f32>> {
            Ok(Array3::zeros((feeds.rows(), feeds.input_ids.ncols(), 8)))
        }
    }

    fn config(num_beams: usize) -> SearchConfig {
        SearchConfig {
            num_beams,
            vocab_size: 8,
            max_length: 16,
            decoder_start_token_id: Some(6),
            eos_token_ids: HashSet::from([7]),
            ..Default::default()
        }
    }

    fn subgraph() -> (Arc<CountingEncoder>, Seq2SeqSubgraph) {
        let encoder = Arc::new(CountingEncoder {
            calls: AtomicUsize::new(0),
        });
        let sg = Seq2SeqSubgraph::new(encoder.clone(), Arc::new(DummyDecoder));
        (encoder, sg)
    }

    #[tokio::test]
    async fn test_encoder_runs_exactly_once() {
        let (encoder, sg) = subgraph();
        let cfg = config(2);
        let init = sg
            .build_initial_feeds(&[vec![1, 2, 3]], &cfg, &CpuCapabilities)
            .await
            .unwrap();
        let mut feeds = init.feeds;

        for _ in 0..3 {
            sg.run(&mut feeds).await.unwrap();
        }
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_encoder_state_expanded_across_beams() {
        let (_, sg) = subgraph();
        let cfg = config(3);
        let init = sg
            .build_initial_feeds(&[vec![1, 2], vec![3, 4]], &cfg, &CpuCapabilities)
            .await
            .unwrap();

        let state = init.feeds.encoder_state.as_ref().unwrap();
        assert_eq!(state.dim(), (6, 2, 4));
        // All three beams of item 1 share its encoding.
        assert_eq!(state[[3, 0, 0]], 2.0);
        assert_eq!(state[[4, 0, 0]], 2.0);
        assert_eq!(state[[5, 0, 0]], 2.0);
    }

    #[tokio::test]
    async fn test_decoder_starts_from_start_token() {
        let (_, sg) = subgraph();
        let cfg = config(2);
        let init = sg
            .build_initial_feeds(&[vec![1, 2]], &cfg, &CpuCapabilities)
            .await
            .unwrap();
        assert_eq!(init.prefix_lens, vec![1]);
        assert!(init.feeds.input_ids.iter().all(|&t| t == 6));
        assert_eq!(init.feeds.input_ids.dim(), (2, 1));
    }

    #[tokio::test]
    async fn test_missing_decoder_start_rejected() {
        let (_, sg) = subgraph();
        let mut cfg = config(2);
        cfg.decoder_start_token_id = None;
        assert!(sg
            .build_initial_feeds(&[vec![1]], &cfg, &CpuCapabilities)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_update_preserves_encoder_context() {
        let (_, sg) = subgraph();
        let cfg = config(2);
        let init = sg
            .build_initial_feeds(&[vec![1, 2]], &cfg, &CpuCapabilities)
            .await
            .unwrap();
        let mut feeds = init.feeds;
        let before = feeds.encoder_state.clone().unwrap();

        let sel = StepSelection {
            groups: Vec::new(),
            parents: vec![1, 0],
            next_tokens: vec![2, 3],
            live: vec![true, true],
        };
        sg.update_feeds(&mut feeds, &sel, &CpuCapabilities).unwrap();

        assert_eq!(feeds.encoder_state.unwrap(), before);
        assert_eq!(feeds.input_ids.dim(), (2, 2));
        assert_eq!(feeds.input_ids.row(0).to_vec(), vec![6, 2]);
    }
}
