//! Error types for speaker embedding extraction.

use thiserror::Error;

/// Error type for model construction, parameter loading and inference.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid construction parameter (encoder mode, stage layout, sizes).
    #[error("Config error: {0}")]
    Config(String),

    /// Waveform batch rejected at call entry.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A parameter named in the manifest is absent from the checkpoint.
    #[error("Missing parameter: {0}")]
    MissingParameter(String),

    /// A checkpoint tensor does not have the shape the manifest expects.
    #[error("Parameter {name} has shape {actual:?}, expected {expected:?}")]
    ParameterShape {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Audio decoding or resampling failed.
    #[error("Audio error: {0}")]
    Audio(String),

    /// Candle tensor operation failed.
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// IO operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Safetensors (de)serialization failed.
    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),
}

/// Result type for speaker embedding operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the error is a configuration problem detected before any tensor work.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}
