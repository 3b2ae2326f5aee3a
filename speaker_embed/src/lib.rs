//! # speaker_embed
//!
//! ResNet-SE speaker embeddings for the Candle ML framework.
//!
//! This crate provides:
//! - High-level embedding API (`model::SpeakerModel`)
//! - Log-mel front end and audio loading (`audio`)
//! - The ResNet-SE network with dual-context attentive statistics pooling (`nn`)
//! - Checkpoint loading with parameter manifest validation (`model::loader`)
//! - Embedding files and cosine scoring for verification
//!
//! ## Architecture Overview
//!
//! 1. A 16 kHz waveform becomes a 40-band log-mel spectrogram, instance
//!    normalized per band
//! 2. A 7x7 stem and four residual squeeze-excitation stages produce a
//!    (B, 128, F', T') feature map, averaged over frequency
//! 3. Two attention stacks read channel-wise and time-wise context and
//!    weight the frames for mean / standard deviation pooling
//! 4. BatchNorm, a linear projection and an optional BatchNorm give the
//!    embedding (256-d by default)
//!
//! ## Example
//!
//! ```no_run
//! use speaker_embed::model::loader::{LoaderConfig, ModelLoader};
//! use candle_core::Device;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let loader = ModelLoader::from_local_dir("/path/to/model")?;
//! let model = loader.load_model(&Device::Cpu, &LoaderConfig::default())?;
//! let embedding = model.embed(&vec![0.0f32; 32000])?;
//! assert_eq!(embedding.len(), model.embedding_dim());
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod io;
pub mod model;
pub mod nn;

pub use config::{BlockKind, EncoderType, PoolingStrategy, ResNetSeConfig};
pub use error::{Error, Result};
pub use model::SpeakerModel;
