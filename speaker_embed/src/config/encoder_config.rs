//! ResNet-SE speaker encoder configuration.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::audio::mel::MelSpectrogramConfig;
use crate::error::{Error, Result};

/// Channel width of the collapsed backbone output consumed by pooling.
pub const SEQUENCE_CHANNELS: usize = 128;

/// Number of residual stages in the backbone.
pub const STAGE_COUNT: usize = 4;

/// Attention output mode.
///
/// `Sap` produces one weight per (channel, frame); `Asp` produces a single
/// weight per frame shared across channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EncoderType {
    Sap,
    Asp,
}

impl EncoderType {
    /// Output width of each attention stack.
    pub fn attention_channels(self) -> usize {
        match self {
            Self::Sap => SEQUENCE_CHANNELS,
            Self::Asp => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sap => "SAP",
            Self::Asp => "ASP",
        }
    }
}

impl FromStr for EncoderType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "SAP" => Ok(Self::Sap),
            "ASP" => Ok(Self::Asp),
            other => Err(Error::Config(format!(
                "Undefined encoder '{}', expected SAP or ASP",
                other
            ))),
        }
    }
}

impl TryFrom<String> for EncoderType {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<EncoderType> for String {
    fn from(value: EncoderType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for EncoderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Residual block flavor used by every backbone stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    /// Two 3x3 convolutions, expansion 1.
    #[default]
    Basic,
    /// 1x1 → 3x3 → 1x1 convolutions, expansion 4.
    Bottleneck,
}

impl BlockKind {
    /// Output channel multiplier relative to the stage width.
    pub fn expansion(self) -> usize {
        match self {
            Self::Basic => 1,
            Self::Bottleneck => 4,
        }
    }
}

/// Temporal pooling scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolingStrategy {
    /// Two attention stacks over channel-wise and time-wise contexts.
    #[default]
    DualBranch,
    /// Legacy tanh-projection attention with a learned context vector.
    SingleBranch,
}

/// Configuration for the ResNet-SE speaker encoder.
///
/// Defaults reproduce the 34-layer half-width model: blocks `[3, 4, 6, 3]`,
/// widths `[16, 32, 64, 128]`, 40 mel bands and a 256-d embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResNetSeConfig {
    /// Attention output mode ("SAP" or "ASP")
    #[serde(default = "default_encoder_type")]
    pub encoder_type: EncoderType,

    /// Number of mel bands
    #[serde(default = "default_n_mels")]
    pub n_mels: usize,

    /// Apply natural-log compression to mel energies
    #[serde(default = "default_true")]
    pub log_input: bool,

    /// Augment attention input with global mean/std contexts
    #[serde(default = "default_true")]
    pub context: bool,

    /// Apply batch normalization after the final projection
    #[serde(default = "default_true")]
    pub out_bn: bool,

    /// Output embedding dimension
    #[serde(default = "default_n_out", alias = "nOut")]
    pub n_out: usize,

    /// Residual blocks per stage
    #[serde(default = "default_layers")]
    pub layers: Vec<usize>,

    /// Channel width per stage
    #[serde(default = "default_num_filters")]
    pub num_filters: Vec<usize>,

    /// Residual block flavor
    #[serde(default)]
    pub block: BlockKind,

    /// Squeeze-excitation channel reduction factor
    #[serde(default = "default_se_reduction")]
    pub se_reduction: usize,

    /// Temporal pooling scheme
    #[serde(default)]
    pub pooling: PoolingStrategy,

    /// Audio sample rate
    #[serde(default = "default_sample_rate")]
    pub sample_rate: usize,

    /// FFT size
    #[serde(default = "default_n_fft")]
    pub n_fft: usize,

    /// STFT window length
    #[serde(default = "default_win_length")]
    pub win_length: usize,

    /// STFT hop length
    #[serde(default = "default_hop_length")]
    pub hop_length: usize,
}

fn default_encoder_type() -> EncoderType {
    EncoderType::Sap
}
fn default_n_mels() -> usize {
    40
}
fn default_true() -> bool {
    true
}
fn default_n_out() -> usize {
    256
}
fn default_layers() -> Vec<usize> {
    vec![3, 4, 6, 3]
}
fn default_num_filters() -> Vec<usize> {
    vec![16, 32, 64, 128]
}
fn default_se_reduction() -> usize {
    8
}
fn default_sample_rate() -> usize {
    16000
}
fn default_n_fft() -> usize {
    512
}
fn default_win_length() -> usize {
    400
}
fn default_hop_length() -> usize {
    160
}

impl Default for ResNetSeConfig {
    fn default() -> Self {
        Self {
            encoder_type: default_encoder_type(),
            n_mels: default_n_mels(),
            log_input: true,
            context: true,
            out_bn: true,
            n_out: default_n_out(),
            layers: default_layers(),
            num_filters: default_num_filters(),
            block: BlockKind::default(),
            se_reduction: default_se_reduction(),
            pooling: PoolingStrategy::default(),
            sample_rate: default_sample_rate(),
            n_fft: default_n_fft(),
            win_length: default_win_length(),
            hop_length: default_hop_length(),
        }
    }
}

impl ResNetSeConfig {
    /// Parse and validate a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| {
            if e.is_data() {
                Error::Config(e.to_string())
            } else {
                Error::Json(e)
            }
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Set the encoder mode from its string name.
    pub fn with_encoder_type(mut self, encoder_type: &str) -> Result<Self> {
        self.encoder_type = encoder_type.parse()?;
        Ok(self)
    }

    /// Check every construction parameter.
    pub fn validate(&self) -> Result<()> {
        if self.layers.len() != STAGE_COUNT {
            return Err(Error::Config(format!(
                "layers must list {} stages, got {}",
                STAGE_COUNT,
                self.layers.len()
            )));
        }
        if self.num_filters.len() != STAGE_COUNT {
            return Err(Error::Config(format!(
                "num_filters must list {} stages, got {}",
                STAGE_COUNT,
                self.num_filters.len()
            )));
        }
        if let Some(i) = self.layers.iter().position(|&n| n == 0) {
            return Err(Error::Config(format!("stage {} has zero blocks", i + 1)));
        }
        if let Some(i) = self.num_filters.iter().position(|&n| n == 0) {
            return Err(Error::Config(format!("stage {} has zero width", i + 1)));
        }
        if self.n_mels == 0 || self.n_out == 0 || self.se_reduction == 0 {
            return Err(Error::Config(
                "n_mels, n_out and se_reduction must be positive".to_string(),
            ));
        }

        let expansion = self.block.expansion();
        if let Some(&planes) = self
            .num_filters
            .iter()
            .find(|&&planes| planes * expansion < self.se_reduction)
        {
            return Err(Error::Config(format!(
                "stage width {} is too narrow for squeeze-excitation reduction {}",
                planes * expansion,
                self.se_reduction
            )));
        }

        let final_channels = self.final_channels();
        if final_channels != SEQUENCE_CHANNELS {
            return Err(Error::Config(format!(
                "last stage produces {} channels, pooling requires {}",
                final_channels, SEQUENCE_CHANNELS
            )));
        }

        if self.sample_rate == 0 || self.hop_length == 0 || self.n_fft == 0 {
            return Err(Error::Config(
                "sample_rate, n_fft and hop_length must be positive".to_string(),
            ));
        }
        if self.win_length == 0 || self.win_length > self.n_fft {
            return Err(Error::Config(format!(
                "win_length {} must be in 1..={}",
                self.win_length, self.n_fft
            )));
        }
        Ok(())
    }

    /// Channels produced by the last backbone stage.
    pub fn final_channels(&self) -> usize {
        self.num_filters.last().copied().unwrap_or(0) * self.block.expansion()
    }

    /// Width of each attention stack input.
    pub fn attention_input_channels(&self) -> usize {
        if self.context {
            SEQUENCE_CHANNELS * 3
        } else {
            SEQUENCE_CHANNELS
        }
    }

    /// Width of the pooled statistics vector fed to the embedding head.
    pub fn pooled_channels(&self) -> usize {
        match (self.pooling, self.encoder_type) {
            (PoolingStrategy::SingleBranch, EncoderType::Sap) => SEQUENCE_CHANNELS,
            _ => SEQUENCE_CHANNELS * 2,
        }
    }

    /// Spectrogram settings derived from this configuration.
    pub fn mel_config(&self) -> MelSpectrogramConfig {
        MelSpectrogramConfig {
            n_fft: self.n_fft,
            num_mels: self.n_mels,
            sample_rate: self.sample_rate,
            hop_size: self.hop_length,
            win_size: self.win_length,
            fmin: 0.0,
            fmax: None,
        }
    }
}
