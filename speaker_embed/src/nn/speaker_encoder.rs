//! ResNet-SE speaker encoder.
//!
//! Maps a batch of 16 kHz waveforms to fixed-size speaker embeddings.
//!
//! Architecture:
//! 1. Log-mel spectrogram + per-band instance normalization
//! 2. 7x7 stem and four residual SE stages
//! 3. Frequency collapse to a (B, 128, T') sequence
//! 4. Attention pooling (dual-branch by default)
//! 5. BatchNorm / Linear / BatchNorm embedding head

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder, linear};

use crate::audio::mel::MelSpectrogram;
use crate::config::{PoolingStrategy, ResNetSeConfig};
use crate::nn::backbone::{ResNetSeBackbone, collapse_frequency, log_stats, output_extent};
use crate::nn::norm::{FrozenBatchNorm, instance_norm};
use crate::nn::pooling::Pooling;
#[cfg(feature = "timing")]
use crate::nn::timing::{
    BACKBONE_TIME_US, FORWARD_CALLS, HEAD_TIME_US, POOLING_TIME_US, SPECTROGRAM_TIME_US,
};
use crate::{increment_counter, timed};

/// Projection from pooled statistics to the embedding.
#[derive(Debug, Clone)]
pub enum EmbeddingHead {
    /// `bn5` -> `fc6` -> optional `bn6`
    Normalized {
        bn5: FrozenBatchNorm,
        fc6: Linear,
        bn6: Option<FrozenBatchNorm>,
    },
    /// Single linear layer `fc`, used with single-branch pooling.
    Plain { fc: Linear },
}

impl EmbeddingHead {
    pub fn new(config: &ResNetSeConfig, vb: VarBuilder) -> Result<Self> {
        let in_dim = config.pooled_channels();
        Ok(match config.pooling {
            PoolingStrategy::DualBranch => {
                let bn5 = FrozenBatchNorm::new(in_dim, vb.pp("bn5"))?;
                let fc6 = linear(in_dim, config.n_out, vb.pp("fc6"))?;
                let bn6 = if config.out_bn {
                    Some(FrozenBatchNorm::new(config.n_out, vb.pp("bn6"))?)
                } else {
                    None
                };
                Self::Normalized { bn5, fc6, bn6 }
            }
            PoolingStrategy::SingleBranch => Self::Plain {
                fc: linear(in_dim, config.n_out, vb.pp("fc"))?,
            },
        })
    }
}

impl Module for EmbeddingHead {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Normalized { bn5, fc6, bn6 } => {
                let hidden = fc6.forward(&bn5.forward(xs)?)?;
                match bn6 {
                    Some(bn6) => bn6.forward(&hidden),
                    None => Ok(hidden),
                }
            }
            Self::Plain { fc } => fc.forward(xs),
        }
    }
}

/// ResNet-SE speaker encoder.
#[derive(Debug)]
pub struct ResNetSe {
    config: ResNetSeConfig,
    mel: MelSpectrogram,
    backbone: ResNetSeBackbone,
    pooling: Pooling,
    head: EmbeddingHead,
    dtype: DType,
    device: Device,
}

impl ResNetSe {
    /// Build the encoder. The configuration is expected to be validated.
    pub fn new(config: &ResNetSeConfig, vb: VarBuilder) -> Result<Self> {
        let mel = MelSpectrogram::new(config.mel_config(), vb.device())?;
        let backbone = ResNetSeBackbone::new(config, vb.clone())?;
        let pooling = Pooling::new(config, vb.clone())?;
        let head = EmbeddingHead::new(config, vb.clone())?;

        Ok(Self {
            config: config.clone(),
            mel,
            backbone,
            pooling,
            head,
            dtype: vb.dtype(),
            device: vb.device().clone(),
        })
    }

    pub fn config(&self) -> &ResNetSeConfig {
        &self.config
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Embedding width.
    pub fn embedding_dim(&self) -> usize {
        self.config.n_out
    }

    /// Shortest waveform (in samples) that yields at least two pooled frames.
    pub fn min_samples(&self) -> usize {
        min_samples(&self.config)
    }

    /// Normalized log-mel features as the backbone input (B, 1, n_mels, T).
    pub fn features(&self, waveforms: &Tensor) -> Result<Tensor> {
        let mel = self.mel.log_energies(waveforms, self.config.log_input)?;
        instance_norm(&mel)?.unsqueeze(1)?.to_dtype(self.dtype)
    }

    /// Backbone output collapsed over frequency: (B, 128, T').
    pub fn sequence(&self, waveforms: &Tensor) -> Result<Tensor> {
        let features = timed!(SPECTROGRAM_TIME_US, self.features(waveforms))?;
        tracing::debug!(shape = ?features.shape(), "speaker encoder features");
        let hidden = timed!(BACKBONE_TIME_US, self.backbone.forward(&features))?;
        collapse_frequency(&hidden)
    }

    /// Embed a (B, L) waveform batch into (B, n_out).
    pub fn forward(&self, waveforms: &Tensor) -> Result<Tensor> {
        increment_counter!(FORWARD_CALLS);
        let sequence = self.sequence(waveforms)?;
        let pooled = timed!(POOLING_TIME_US, self.pooling.forward(&sequence))?;
        log_stats("pooling", &pooled);
        let embedding = timed!(HEAD_TIME_US, self.head.forward(&pooled))?;
        log_stats("embedding head", &embedding);
        Ok(embedding)
    }

    pub fn pooling(&self) -> &Pooling {
        &self.pooling
    }
}

/// Shortest waveform (in samples) that `config` turns into at least two
/// pooled frames and that can be reflect-padded for centered framing.
pub fn min_samples(config: &ResNetSeConfig) -> usize {
    let mut frames = 1;
    while output_extent(config.n_mels, frames).1 < 2 {
        frames += 1;
    }
    let by_frames = (frames - 1) * config.hop_length;
    by_frames.max(config.n_fft / 2 + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncoderType;
    use candle_nn::VarMap;

    fn small_config() -> ResNetSeConfig {
        ResNetSeConfig {
            layers: vec![1, 1, 1, 1],
            ..Default::default()
        }
    }

    fn waveform(batch: usize, samples: usize) -> Tensor {
        Tensor::randn(0f32, 0.1f32, (batch, samples), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_min_samples_default() {
        assert_eq!(min_samples(&ResNetSeConfig::default()), 640);
    }

    #[test]
    fn test_forward_shapes() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = ResNetSe::new(&small_config(), vb).unwrap();

        let xs = waveform(2, 3200);
        assert_eq!(model.features(&xs).unwrap().dims(), &[2, 1, 40, 21]);
        assert_eq!(model.sequence(&xs).unwrap().dims(), &[2, 128, 6]);
        assert_eq!(model.forward(&xs).unwrap().dims(), &[2, 256]);
    }

    #[test]
    fn test_head_without_output_bn() {
        let config = ResNetSeConfig {
            out_bn: false,
            n_out: 64,
            encoder_type: EncoderType::Asp,
            ..small_config()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = ResNetSe::new(&config, vb).unwrap();
        assert_eq!(model.forward(&waveform(1, 1600)).unwrap().dims(), &[1, 64]);

        let data = varmap.data().lock().unwrap();
        assert!(data.contains_key("bn5.running_mean"));
        assert_eq!(data["fc6.weight"].dims(), &[64, 256]);
        assert!(!data.keys().any(|k| k.starts_with("bn6")));
    }

    #[test]
    fn test_single_branch_head() {
        let config = ResNetSeConfig {
            pooling: PoolingStrategy::SingleBranch,
            ..small_config()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = ResNetSe::new(&config, vb).unwrap();
        assert_eq!(model.forward(&waveform(2, 1600)).unwrap().dims(), &[2, 256]);

        let data = varmap.data().lock().unwrap();
        assert_eq!(data["fc.weight"].dims(), &[256, 128]);
        assert!(!data.contains_key("bn5.weight"));
    }
}
