//! Beam-search decoding engine for transformer inference.
//!
//! This crate is the control-flow core of an inference runtime: it drives
//! iterative, multi-hypothesis generation of token sequences without
//! knowing anything about how the model body executes. The model forward
//! pass arrives through [`subgraph::ModelExecutor`], device-tuned
//! primitives through [`device::DeviceCapabilities`], and the same loop
//! serves decoder-only and encoder-decoder models through the
//! [`subgraph::Subgraph`] binding.
//!
//! ```ignore
//! let engine = BeamSearch::new(
//!     config,
//!     AnySubgraph::Gpt(GptSubgraph::new(executor)),
//!     Arc::new(CpuCapabilities),
//! )?;
//! let output = engine.run(&prompts, &CancellationToken::never()).await?;
//! // output.sequences: [batch, num_return_sequences, max_length]
//! ```

pub mod beam;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod device;
pub mod error;
pub mod feeds;
pub mod logits;
pub mod search;
pub mod selector;
pub mod state;
pub mod stream;
pub mod subgraph;

pub use beam::{BeamGroup, Hypothesis};
pub use cancel::{CancellationHandle, CancellationToken};
pub use config::{EarlyStopping, SearchConfig, VocabMask};
pub use device::{CpuCapabilities, DeviceCapabilities, TopK};
pub use error::{SearchError, SearchResult};
pub use search::{BeamSearch, SearchOutput};
pub use stream::StreamedToken;
pub use subgraph::{
    AnySubgraph, EncoderExecutor, GptSubgraph, ModelExecutor, Seq2SeqSubgraph, Subgraph,
    SubgraphKind,
};

pub mod prelude {
    pub use crate::cancel::CancellationToken;
    pub use crate::config::SearchConfig;
    pub use crate::device::{CpuCapabilities, DeviceCapabilities};
    pub use crate::error::{SearchError, SearchResult};
    pub use crate::search::{BeamSearch, SearchOutput};
    pub use crate::subgraph::{AnySubgraph, GptSubgraph, Seq2SeqSubgraph};
}
