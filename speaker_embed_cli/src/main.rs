//! Command-line interface for ResNet-SE speaker embeddings.
//!
//! # Usage
//!
//! ```bash
//! # Build the CLI (audio-loading is on by default)
//! cargo build --release -p speaker_embed_cli
//!
//! # Embed one recording with a local checkpoint
//! speaker-embed --model-path /path/to/model --device cpu \
//!     embed alice.wav --output alice.json
//!
//! # Embed several recordings, one file each
//! speaker-embed --model-path /path/to/model \
//!     embed a.wav b.flac c.mp3 --output-dir ./embeddings/
//!
//! # Enrollment: all utterances of a speaker in one file
//! speaker-embed --model-path /path/to/model \
//!     embed --file alice.txt --merge --output alice.json
//!
//! # Verification trial (audio or saved embeddings on either side)
//! speaker-embed --model-path /path/to/model verify alice.json trial.wav
//!
//! # Parameter names and shapes a checkpoint must provide
//! speaker-embed manifest --config config.json
//! ```
//!
//! # Batch Input JSON Format
//!
//! ```json
//! {
//!   "items": [
//!     {"audio": "data/alice_01.wav"},
//!     {"audio": "data/bob_03.flac", "label": "bob", "output": "bob.json"}
//!   ]
//! }
//! ```

mod args;

use anyhow::{Context, Result, bail};
use candle_core::{DType, Device};
use clap::Parser;
use speaker_embed::audio::load_audio;
use speaker_embed::io::batch_items::load_batch_items;
use speaker_embed::io::embedding_file::{EmbeddingSet, load_embeddings, save_embeddings};
use speaker_embed::io::output_path::get_output_path;
use speaker_embed::io::{IoArgs, ModelArgs};
use speaker_embed::model::loader::{LoaderConfig, ModelLoader};
use speaker_embed::model::manifest::ParameterManifest;
use speaker_embed::model::scoring::verify;
use speaker_embed::{ResNetSeConfig, SpeakerModel};
use std::fs;
use std::path::{Path, PathBuf};

use args::{Cli, Command};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing subscriber if --tracing flag is passed
    if cli.tracing {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
            )
            .init();
    }

    let io_args = cli.to_io_args();
    let model_args = cli.to_model_args();

    // The manifest needs neither weights nor a device
    if let Command::Manifest { config } = &cli.command {
        return print_manifest(config.as_deref());
    }

    let device = parse_device(&model_args.device)?;
    let dtype = parse_dtype(&model_args.dtype, &device)?;

    let model_path = resolve_model_path(&model_args)?;
    tracing::info!(
        model = %model_path.display(),
        device = ?device,
        dtype = ?dtype,
        "Model configuration"
    );

    println!("Loading model...");
    let loader_config = LoaderConfig {
        dtype,
        key_prefix: model_args.key_prefix.clone(),
        strict: !model_args.no_strict,
    };
    let loader = ModelLoader::from_local_dir(&model_path)
        .map_err(|e| anyhow::anyhow!("Failed to create model loader: {}", e))?;
    let model = loader
        .load_model(&device, &loader_config)
        .map_err(|e| anyhow::anyhow!("Failed to load model: {}", e))?;
    println!("Model loaded!");
    tracing::info!(
        encoder_type = model.config().encoder_type.as_str(),
        embedding_dim = model.embedding_dim(),
        min_samples = model.min_samples(),
        "Model details"
    );

    match cli.command {
        Command::Embed { merge, .. } => run_embed(&model, &io_args, merge)?,
        Command::Verify {
            enroll,
            test,
            threshold,
        } => {
            let enroll = embedding_for(&model, &enroll)?;
            let test = embedding_for(&model, &test)?;
            let result = verify(&enroll, &test, threshold)?;
            println!("score: {:.4}", result.score);
            println!(
                "decision: {} (threshold {:.3})",
                if result.same_speaker {
                    "same speaker"
                } else {
                    "different speakers"
                },
                result.threshold
            );
        }
        Command::Manifest { .. } => unreachable!("handled before model loading"),
    }

    #[cfg(feature = "timing")]
    speaker_embed::nn::timing::print_timings();

    Ok(())
}

fn parse_device(name: &str) -> Result<Device> {
    Ok(match name {
        "cpu" => Device::Cpu,
        "cuda" | "cuda:0" => {
            #[cfg(feature = "cuda")]
            {
                Device::new_cuda(0)?
            }
            #[cfg(not(feature = "cuda"))]
            {
                bail!("CUDA support not compiled. Rebuild with --features cuda")
            }
        }
        "metal" => {
            #[cfg(feature = "metal")]
            {
                Device::new_metal(0)?
            }
            #[cfg(not(feature = "metal"))]
            {
                bail!("Metal support not compiled. Rebuild with --features metal")
            }
        }
        other => bail!("Unknown device: {}. Use cpu, cuda, or metal", other),
    })
}

fn parse_dtype(name: &str, device: &Device) -> Result<DType> {
    let dtype = match name {
        "f32" | "float32" => DType::F32,
        "f16" | "float16" | "half" => DType::F16,
        "bf16" | "bfloat16" => DType::BF16,
        other => bail!("Unknown dtype: {}. Use f32, f16, or bf16", other),
    };

    // CPU doesn't support BF16 or F16 convolutions in Candle, fall back to F32
    if matches!(device, Device::Cpu) && matches!(dtype, DType::BF16 | DType::F16) {
        tracing::warn!(
            requested_dtype = %name,
            "CPU does not support requested dtype, using F32 instead"
        );
        return Ok(DType::F32);
    }
    Ok(dtype)
}

#[cfg(feature = "hub")]
fn resolve_model_path(model_args: &ModelArgs) -> Result<PathBuf> {
    speaker_embed::io::model_path::get_model_path(model_args)
}

#[cfg(not(feature = "hub"))]
fn resolve_model_path(model_args: &ModelArgs) -> Result<PathBuf> {
    if model_args.model.is_some() && model_args.model_path.is_none() {
        bail!("Downloading by model ID requires the hub feature. Use --model-path");
    }
    let path = model_args
        .model_path
        .clone()
        .context("No model specified. Use --model-path")?;
    if !path.exists() {
        bail!("Model path does not exist: {:?}", path);
    }
    Ok(path)
}

fn print_manifest(config_path: Option<&Path>) -> Result<()> {
    let config = match config_path {
        Some(path) => {
            let json = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config: {:?}", path))?;
            ResNetSeConfig::from_json(&json)?
        }
        None => ResNetSeConfig::default(),
    };
    config.validate()?;

    let manifest = ParameterManifest::from_config(&config);
    for (name, shape) in manifest.entries() {
        println!("{}\t{:?}", name, shape);
    }
    println!(
        "{} tensors, {} elements",
        manifest.len(),
        manifest.num_elements()
    );
    Ok(())
}

fn embed_file(model: &SpeakerModel, path: &str) -> Result<Vec<f32>> {
    let audio = load_audio(path, model.sample_rate() as u32)
        .with_context(|| format!("Failed to load audio: {}", path))?;
    tracing::debug!(
        path,
        duration_secs = audio.duration_secs(),
        "Loaded audio"
    );
    Ok(model.embed_audio(&audio)?)
}

/// Saved embedding files contribute their mean; anything else is treated as audio.
fn embedding_for(model: &SpeakerModel, path: &Path) -> Result<Vec<f32>> {
    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if is_json {
        let set = load_embeddings(path)?;
        return set
            .mean()
            .with_context(|| format!("{:?} holds no embeddings", path));
    }
    embed_file(model, &path.to_string_lossy())
}

fn run_embed(model: &SpeakerModel, io_args: &IoArgs, merge: bool) -> Result<()> {
    let batch_items = load_batch_items(io_args)?;
    let is_batch_mode = batch_items.len() > 1 && !merge;

    if is_batch_mode {
        let default_dir = PathBuf::from(".");
        let output_dir = io_args.output_dir.as_ref().unwrap_or(&default_dir);
        if !output_dir.exists() {
            fs::create_dir_all(output_dir).context("Failed to create output directory")?;
        }
        tracing::info!(
            batch_items = batch_items.len(),
            output_dir = ?io_args.output_dir,
            "Batch mode"
        );
    }

    let mut merged = EmbeddingSet::new(Vec::new(), Vec::new());
    for (i, item) in batch_items.iter().enumerate() {
        if batch_items.len() > 1 {
            tracing::info!(
                progress = format!("[{}/{}]", i + 1, batch_items.len()),
                audio = %item.audio,
                "Processing batch item"
            );
        }
        let embedding = embed_file(model, &item.audio)?;

        if merge {
            merged.labels.push(item.label());
            merged.embeddings.push(embedding);
            continue;
        }
        let output_path = get_output_path(io_args, item, is_batch_mode);
        save_embeddings(&EmbeddingSet::single(item.label(), embedding), &output_path)?;
        println!("Saved {}", output_path.display());
    }

    if merge {
        save_embeddings(&merged, &io_args.output)?;
        println!(
            "Saved {} embeddings to {}",
            merged.len(),
            io_args.output.display()
        );
    }
    Ok(())
}
