//! Error types for diffusion decoding.

use thiserror::Error;

/// Result type alias for decoding operations.
pub type Result<T> = std::result::Result<T, GenerationError>;

/// Errors that can occur while preparing or running a diffusion decode.
#[derive(Error, Debug)]
pub enum GenerationError {
    /// The prompt leaves no room for new tokens.
    #[error("input length is {input_len}, but `max_length` is set to {max_length}; increase `max_length` or set `max_new_tokens`")]
    InputTooLong { input_len: usize, max_length: usize },

    /// `alg` is not one of `origin`, `transition_<K>` or `maskgit_plus`.
    #[error("unknown alg: {0}")]
    UnknownAlgorithm(String),

    /// The per-sequence decode loop only runs a single sequence.
    #[error("batch size must be 1, got {0}")]
    BatchSize(usize),

    /// A special token id could not be resolved from the config or the model.
    #[error("`{0}` is not set and the model provides no default")]
    MissingSpecialToken(&'static str),

    /// A configuration value is outside its valid range.
    #[error("invalid generation config: {0}")]
    InvalidConfig(String),

    /// The attention mask does not line up with the input ids.
    #[error("attention mask shape {mask:?} does not match input shape {input:?}")]
    AttentionMaskShape { mask: Vec<usize>, input: Vec<usize> },

    /// Candle tensor error, including failures inside the model.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// I/O error while reading a config file.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Config deserialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
