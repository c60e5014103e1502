//! Error types for the decoding engine.

use thiserror::Error;

/// Errors that can abort a generation request.
///
/// Every variant is fatal to the request that raised it: no partial output
/// is returned and the request's state is dropped before the error
/// propagates. Retry policy, if any, belongs to the caller.
///
/// Collaborators (model executors, device backends) report failures as
/// `anyhow::Error`; the engine wraps them here together with the step index
/// at which they occurred.
#[derive(Debug, Error)]
pub enum SearchError {
    /// Invalid parameter combination, detected before any model execution.
    #[error("invalid search configuration: {0}")]
    InvalidConfig(String),

    /// The model-execution collaborator failed (shape mismatch, runtime
    /// fault, accelerator error).
    #[error("model execution failed at step {step}: {source}")]
    Execution {
        step: usize,
        #[source]
        source: anyhow::Error,
    },

    /// Non-finite values appeared in the model's logits. Treated as fatal
    /// rather than silently masked, since it indicates an upstream fault.
    #[error("non-finite logits at step {step}")]
    NumericAnomaly { step: usize },

    /// A scoped buffer acquisition or cross-device copy failed.
    #[error("device resource failure at step {step}: {source}")]
    Resource {
        step: usize,
        #[source]
        source: anyhow::Error,
    },

    /// Cancellation was requested between steps.
    #[error("generation cancelled at step {step}")]
    Cancelled { step: usize },
}

/// Result type for engine operations.
pub type SearchResult<T> = Result<T, SearchError>;
