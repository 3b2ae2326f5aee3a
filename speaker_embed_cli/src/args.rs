use clap::{Parser, Subcommand};
use speaker_embed::io::{IoArgs, ModelArgs};
use speaker_embed::model::scoring::DEFAULT_THRESHOLD;
use std::path::PathBuf;

fn default_device() -> String {
    if cfg!(target_os = "macos") {
        "metal".to_string()
    } else {
        "cuda".to_string()
    }
}

/// Speaker embedding command line interface
///
/// Extract ResNet-SE speaker embeddings from audio and compare them.
#[derive(Parser, Debug)]
#[command(name = "speaker-embed")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// HuggingFace model ID (requires the hub feature)
    #[arg(short = 'M', long, global = true)]
    pub model: Option<String>,

    /// Path to a local model directory (overrides --model)
    #[arg(short = 'p', long, global = true)]
    pub model_path: Option<PathBuf>,

    /// Device to use (cpu, cuda, metal).
    #[arg(long, global = true, default_value_t = default_device())]
    pub device: String,

    /// Data type (f32, f16, bf16)
    #[arg(long, global = true, default_value = "f32")]
    pub dtype: String,

    /// Prefix stripped from checkpoint tensor names (defaults to "__S__.")
    #[arg(long, global = true)]
    pub key_prefix: Option<String>,

    /// Load the checkpoint without checking it against the parameter manifest
    #[arg(long, global = true)]
    pub no_strict: bool,

    /// Enable tracing output (debug logs). Use RUST_LOG env var to filter levels.
    #[arg(long, global = true)]
    pub tracing: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Extract embeddings from audio files
    Embed {
        /// Audio files (wav, flac, mp3...)
        #[arg(required_unless_present = "file")]
        audio: Vec<PathBuf>,

        /// Output embedding file (single input mode)
        #[arg(short, long, default_value = "embedding.json")]
        output: PathBuf,

        /// Input list for batch processing (format detected from extension: .json or .txt)
        #[arg(short, long, conflicts_with = "audio")]
        file: Option<PathBuf>,

        /// Output directory for batch mode
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Write every embedding into the single --output file
        #[arg(long)]
        merge: bool,
    },
    /// Score two recordings or embedding files against each other
    Verify {
        /// Enrollment audio or embedding file (.json)
        enroll: PathBuf,

        /// Test audio or embedding file (.json)
        test: PathBuf,

        /// Cosine score at or above which both are the same speaker
        #[arg(short, long, default_value_t = DEFAULT_THRESHOLD)]
        threshold: f32,
    },
    /// Print the parameter names and shapes a checkpoint must provide
    Manifest {
        /// Model configuration JSON (defaults used when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

impl Cli {
    pub fn to_io_args(&self) -> IoArgs {
        match &self.command {
            Command::Embed {
                audio,
                output,
                file,
                output_dir,
                ..
            } => IoArgs {
                audio: audio.clone(),
                output: output.clone(),
                file: file.clone(),
                output_dir: output_dir.clone(),
            },
            _ => IoArgs::default(),
        }
    }

    pub fn to_model_args(&self) -> ModelArgs {
        ModelArgs {
            model: self.model.clone(),
            model_path: self.model_path.clone(),
            device: self.device.clone(),
            dtype: self.dtype.clone(),
            key_prefix: self.key_prefix.clone(),
            no_strict: self.no_strict,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embed_args() {
        let cli = Cli::parse_from([
            "speaker-embed",
            "--device",
            "cpu",
            "embed",
            "a.wav",
            "b.wav",
            "--output-dir",
            "out",
        ]);
        let io_args = cli.to_io_args();
        assert_eq!(io_args.audio.len(), 2);
        assert_eq!(io_args.output_dir, Some(PathBuf::from("out")));
        assert_eq!(cli.to_model_args().device, "cpu");
    }

    #[test]
    fn test_verify_default_threshold() {
        let cli = Cli::parse_from(["speaker-embed", "verify", "a.wav", "b.json"]);
        match cli.command {
            Command::Verify { threshold, .. } => assert_eq!(threshold, DEFAULT_THRESHOLD),
            other => panic!("unexpected command {:?}", other),
        }
    }
}
