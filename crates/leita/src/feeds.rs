//! The live model-input tensors for one generation request.

use ndarray::{Array2, Array3};

use crate::cache::Cache;

/// Named inputs supplied to one model-execution call and rewritten between
/// steps. All row-indexed buffers are laid out batch-major:
/// `row = batch_index * num_beams + beam_slot`.
pub struct DecoderFeeds {
    /// Tokens fed this step. The full (left-padded) prompt on the first
    /// step; a single column of freshly selected tokens afterwards when a
    /// recurrent cache carries the history.
    pub input_ids: Array2<u32>,
    /// `[rows, total_len]`, 1.0 over real tokens and 0.0 over padding and
    /// dead rows. Grows by one column per step.
    pub attention_mask: Array2<f32>,
    /// Number of positions already consumed by earlier steps.
    pub position_offset: usize,
    /// Fixed encoder context, present for encoder-decoder models only.
    /// Produced once before the loop and never rewritten.
    pub encoder_state: Option<Array3<f32>>,
    /// Cross-attention mask over the encoder context.
    pub encoder_attention_mask: Option<Array2<f32>>,
    /// Recurrent per-beam state, reordered on every selection.
    pub cache: Option<Box<dyn Cache>>,
}

impl DecoderFeeds {
    pub fn rows(&self) -> usize {
        self.input_ids.nrows()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_follow_input_ids() {
        let feeds = DecoderFeeds {
            input_ids: Array2::zeros((6, 3)),
            attention_mask: Array2::ones((6, 3)),
            position_offset: 0,
            encoder_state: None,
            encoder_attention_mask: None,
            cache: None,
        };
        assert_eq!(feeds.rows(), 6);
    }
}
