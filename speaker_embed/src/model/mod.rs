//! High-level speaker embedding API.
//!
//! [`SpeakerModel`] validates waveform batches, moves them to the model
//! device and returns plain `Vec<f32>` embeddings.
//!
//! # Example
//!
//! ```no_run
//! use speaker_embed::model::loader::{LoaderConfig, ModelLoader};
//! use speaker_embed::model::scoring::cosine_similarity;
//! use candle_core::Device;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let loader = ModelLoader::from_local_dir("/path/to/model")?;
//! let model = loader.load_model(&Device::Cpu, &LoaderConfig::default())?;
//!
//! let enrollment = vec![0.0f32; 48000];
//! let trial = vec![0.0f32; 32000];
//! let a = model.embed(&enrollment)?;
//! let b = model.embed(&trial)?;
//! println!("score = {:.3}", cosine_similarity(&a, &b)?);
//! # Ok(())
//! # }
//! ```

pub mod loader;
pub mod manifest;
pub mod scoring;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

use crate::audio::AudioData;
use crate::config::ResNetSeConfig;
use crate::error::{Error, Result};
use crate::nn::speaker_encoder::{ResNetSe, min_samples};

// =========================================================================
// Validation helpers (testable without model loading)
// =========================================================================

/// Check a waveform batch: non-empty, equal lengths, at least `min_len`
/// samples, finite values. Returns the common length.
pub fn validate_batch(waveforms: &[&[f32]], min_len: usize) -> Result<usize> {
    let first = waveforms
        .first()
        .ok_or_else(|| Error::InvalidInput("waveform batch is empty".to_string()))?;
    let len = first.len();

    if let Some((i, w)) = waveforms.iter().enumerate().find(|(_, w)| w.len() != len) {
        return Err(Error::InvalidInput(format!(
            "waveforms must have equal length: item 0 has {} samples, item {} has {}",
            len,
            i,
            w.len()
        )));
    }
    if len < min_len {
        return Err(Error::InvalidInput(format!(
            "waveform of {} samples is too short, need at least {}",
            len, min_len
        )));
    }
    if let Some(i) = waveforms
        .iter()
        .position(|w| w.iter().any(|x| !x.is_finite()))
    {
        return Err(Error::InvalidInput(format!(
            "waveform {} contains non-finite samples",
            i
        )));
    }
    Ok(len)
}

/// ResNet-SE speaker embedding model.
#[derive(Debug)]
pub struct SpeakerModel {
    encoder: ResNetSe,
}

impl SpeakerModel {
    /// Validate `config` and build the encoder from `vb`.
    pub fn new(config: &ResNetSeConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let encoder = ResNetSe::new(config, vb)?;
        Ok(Self { encoder })
    }

    pub fn config(&self) -> &ResNetSeConfig {
        self.encoder.config()
    }

    pub fn device(&self) -> &Device {
        self.encoder.device()
    }

    pub fn dtype(&self) -> DType {
        self.encoder.dtype()
    }

    /// Width of every embedding.
    pub fn embedding_dim(&self) -> usize {
        self.encoder.embedding_dim()
    }

    /// Expected waveform sample rate.
    pub fn sample_rate(&self) -> usize {
        self.config().sample_rate
    }

    /// Shortest accepted waveform in samples.
    pub fn min_samples(&self) -> usize {
        min_samples(self.config())
    }

    pub fn encoder(&self) -> &ResNetSe {
        &self.encoder
    }

    /// Embed a (B, L) waveform tensor into an F32 (B, n_out) tensor.
    pub fn embed_tensor(&self, waveforms: &Tensor) -> Result<Tensor> {
        let (_, len) = waveforms.dims2()?;
        if len < self.min_samples() {
            return Err(Error::InvalidInput(format!(
                "waveform of {} samples is too short, need at least {}",
                len,
                self.min_samples()
            )));
        }
        let waveforms = waveforms
            .to_device(self.device())?
            .to_dtype(DType::F32)?;
        Ok(self.encoder.forward(&waveforms)?.to_dtype(DType::F32)?)
    }

    /// Embed a batch of equal-length waveforms.
    pub fn embed_batch(&self, waveforms: &[&[f32]]) -> Result<Vec<Vec<f32>>> {
        let len = validate_batch(waveforms, self.min_samples())?;
        let data: Vec<f32> = waveforms.iter().flat_map(|w| w.iter().copied()).collect();
        let batch = Tensor::from_vec(data, (waveforms.len(), len), self.device())?;
        tracing::debug!(batch = waveforms.len(), samples = len, "Embedding waveform batch");
        Ok(self.embed_tensor(&batch)?.to_vec2::<f32>()?)
    }

    /// Embed a single waveform.
    pub fn embed(&self, waveform: &[f32]) -> Result<Vec<f32>> {
        self.embed_batch(&[waveform])?
            .pop()
            .ok_or_else(|| Error::InvalidInput("no embedding produced".to_string()))
    }

    /// Embed decoded audio, which must already be at the model sample rate.
    pub fn embed_audio(&self, audio: &AudioData) -> Result<Vec<f32>> {
        if audio.sample_rate as usize != self.sample_rate() {
            return Err(Error::InvalidInput(format!(
                "audio is {} Hz, model expects {} Hz",
                audio.sample_rate,
                self.sample_rate()
            )));
        }
        let mono = audio.to_mono();
        self.embed(&mono.samples)
    }
}
