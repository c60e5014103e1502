//! Immutable per-request search configuration.

use std::collections::HashSet;

use crate::error::{SearchError, SearchResult};

/// Controls when a batch item stops stepping before `max_length`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EarlyStopping {
    /// Keep stepping until every beam slot has finished (or `max_length`).
    Never,
    /// Additionally stop a batch item once enough hypotheses have finished
    /// and no active beam can still beat the worst finished one after
    /// length-penalty normalization.
    Heuristic,
}

/// Restricts the selectable vocabulary. Tokens outside an allow-list or
/// inside a deny-list are forced to negative infinity before selection.
#[derive(Clone, Debug)]
pub enum VocabMask {
    Allow(HashSet<u32>),
    Deny(HashSet<u32>),
}

impl VocabMask {
    /// Whether `token` may be emitted under this mask.
    pub fn permits(&self, token: u32) -> bool {
        match self {
            VocabMask::Allow(allowed) => allowed.contains(&token),
            VocabMask::Deny(banned) => !banned.contains(&token),
        }
    }
}

/// Decoding parameters for one generation request.
///
/// Built once per request, validated before any model execution, and read
/// by every other component. Never mutated after construction.
#[derive(Clone, Debug)]
pub struct SearchConfig {
    /// Number of hypotheses maintained per batch item.
    pub num_beams: usize,
    /// Number of sequences returned per batch item. Must be <= `num_beams`.
    pub num_return_sequences: usize,
    /// Size of the model's output vocabulary.
    pub vocab_size: usize,
    /// Minimum total sequence length (prefix included). The end-of-sequence
    /// token cannot appear before this position.
    pub min_length: usize,
    /// Maximum total sequence length. Sequences are force-finished here.
    pub max_length: usize,
    /// Exponent applied to sequence length when ranking final hypotheses
    /// (< 1 favors shorter output, > 1 favors longer).
    pub length_penalty: f32,
    /// Penalty factor applied to tokens already present in a hypothesis's
    /// history. 1.0 disables the penalty.
    pub repetition_penalty: f32,
    pub early_stopping: EarlyStopping,
    /// Token id(s) that mark a hypothesis as finished.
    pub eos_token_ids: HashSet<u32>,
    /// Token used to right-pad output sequences and dead feed rows.
    pub pad_token_id: u32,
    /// First decoder token for encoder-decoder models.
    pub decoder_start_token_id: Option<u32>,
    /// If set, the first generated token is pinned to this id.
    pub forced_bos_token_id: Option<u32>,
    /// If set, the token at the last possible position is pinned to this id.
    pub forced_eos_token_id: Option<u32>,
    pub vocab_mask: Option<VocabMask>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            num_beams: 4,
            num_return_sequences: 1,
            vocab_size: 0,
            min_length: 0,
            max_length: 128,
            length_penalty: 1.0,
            repetition_penalty: 1.0,
            early_stopping: EarlyStopping::Heuristic,
            eos_token_ids: HashSet::new(),
            pad_token_id: 0,
            decoder_start_token_id: None,
            forced_bos_token_id: None,
            forced_eos_token_id: None,
            vocab_mask: None,
        }
    }
}

impl SearchConfig {
    /// Checks every parameter invariant. Called by the orchestrator before
    /// any model execution; a failure here means generation never starts.
    pub fn validate(&self) -> SearchResult<()> {
        if self.num_beams < 1 {
            return Err(SearchError::InvalidConfig("num_beams must be >= 1".into()));
        }
        if self.num_return_sequences < 1 {
            return Err(SearchError::InvalidConfig(
                "num_return_sequences must be >= 1".into(),
            ));
        }
        if self.num_return_sequences > self.num_beams {
            return Err(SearchError::InvalidConfig(format!(
                "num_return_sequences ({}) must not exceed num_beams ({})",
                self.num_return_sequences, self.num_beams
            )));
        }
        if self.vocab_size == 0 {
            return Err(SearchError::InvalidConfig("vocab_size must be > 0".into()));
        }
        if self.min_length > self.max_length {
            return Err(SearchError::InvalidConfig(format!(
                "min_length ({}) must not exceed max_length ({})",
                self.min_length, self.max_length
            )));
        }
        if self.max_length == 0 {
            return Err(SearchError::InvalidConfig("max_length must be > 0".into()));
        }
        if self.eos_token_ids.is_empty() {
            return Err(SearchError::InvalidConfig(
                "at least one eos_token_id is required".into(),
            ));
        }
        for &tok in &self.eos_token_ids {
            if tok as usize >= self.vocab_size {
                return Err(SearchError::InvalidConfig(format!(
                    "eos_token_id {} is outside the vocabulary (size {})",
                    tok, self.vocab_size
                )));
            }
        }
        if self.pad_token_id as usize >= self.vocab_size {
            return Err(SearchError::InvalidConfig(format!(
                "pad_token_id {} is outside the vocabulary (size {})",
                self.pad_token_id, self.vocab_size
            )));
        }
        if self.repetition_penalty <= 0.0 {
            return Err(SearchError::InvalidConfig(
                "repetition_penalty must be > 0".into(),
            ));
        }
        if let Some(VocabMask::Allow(allowed)) = &self.vocab_mask {
            if allowed.is_empty() {
                return Err(SearchError::InvalidConfig(
                    "vocabulary allow-list must not be empty".into(),
                ));
            }
        }
        Ok(())
    }

    #[inline]
    pub fn is_eos(&self, token: u32) -> bool {
        self.eos_token_ids.contains(&token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> SearchConfig {
        SearchConfig {
            num_beams: 4,
            num_return_sequences: 2,
            vocab_size: 100,
            max_length: 32,
            eos_token_ids: HashSet::from([2]),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_zero_beams_rejected() {
        let config = SearchConfig {
            num_beams: 0,
            ..valid_config()
        };
        assert!(matches!(
            config.validate(),
            Err(SearchError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_return_sequences_exceeding_beams_rejected() {
        let config = SearchConfig {
            num_return_sequences: 5,
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_min_length_above_max_rejected() {
        let config = SearchConfig {
            min_length: 64,
            max_length: 32,
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_eos_outside_vocab_rejected() {
        let config = SearchConfig {
            eos_token_ids: HashSet::from([100]),
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_eos_rejected() {
        let config = SearchConfig {
            eos_token_ids: HashSet::new(),
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_allow_list_rejected() {
        let config = SearchConfig {
            vocab_mask: Some(VocabMask::Allow(HashSet::new())),
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_vocab_mask_permits() {
        let allow = VocabMask::Allow(HashSet::from([1, 2]));
        assert!(allow.permits(1));
        assert!(!allow.permits(3));

        let deny = VocabMask::Deny(HashSet::from([1]));
        assert!(!deny.permits(1));
        assert!(deny.permits(3));
    }
}
