//! File-level I/O shared by the CLI: batch lists, output paths, saved
//! embeddings and model resolution.

use std::path::PathBuf;

pub mod batch_items;
pub mod embedding_file;
#[cfg(feature = "hub")]
pub mod model_path;
pub mod output_path;

/// File paths and I/O configuration.
#[derive(Debug, Clone, Default)]
pub struct IoArgs {
    /// Audio files given on the command line
    pub audio: Vec<PathBuf>,

    /// Output embedding file (single input mode)
    pub output: PathBuf,

    /// Input list for batch processing (format detected from extension: .json or .txt)
    pub file: Option<PathBuf>,

    /// Output directory for batch mode (files named after each audio file)
    pub output_dir: Option<PathBuf>,
}

/// Model loading configuration.
#[derive(Debug, Clone, Default)]
pub struct ModelArgs {
    /// HuggingFace model ID
    pub model: Option<String>,

    /// Path to a local model directory (overrides model ID)
    pub model_path: Option<PathBuf>,

    /// Device to use (cpu, cuda, metal)
    pub device: String,

    /// Data type (f32, f16, bf16)
    pub dtype: String,

    /// Key prefix stripped from checkpoint tensor names
    pub key_prefix: Option<String>,

    /// Skip manifest validation of the checkpoint
    pub no_strict: bool,
}
