//! Per-request mutable search state.

use crate::beam::BeamGroup;
use crate::feeds::DecoderFeeds;

/// Lifecycle of one generation request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchPhase {
    Initializing,
    Stepping,
    Finalizing,
    Done,
    Aborted,
}

/// Everything one request mutates while it runs: the beam groups, the step
/// counter and the live model feeds. Created at request start, owned
/// exclusively by that request, consumed by finalization and dropped on
/// every exit path. Nothing here is ever shared between requests.
pub struct GenerationState {
    pub groups: Vec<BeamGroup>,
    pub step: usize,
    pub feeds: DecoderFeeds,
    /// Per batch item: output-sequence tokens that precede the first
    /// generated one (prompt, or the decoder-start token).
    pub prefix_lens: Vec<usize>,
}

impl GenerationState {
    pub fn batch_size(&self) -> usize {
        self.groups.len()
    }

    pub fn all_done(&self) -> bool {
        self.groups.iter().all(|g| g.is_done())
    }
}
