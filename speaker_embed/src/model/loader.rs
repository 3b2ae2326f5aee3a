//! Model loading from a local directory.
//!
//! A model directory holds:
//! - `config.json`: [`ResNetSeConfig`] (every field optional)
//! - `model.safetensors`: the parameters, named after the PyTorch state dict
//!
//! # Example
//!
//! ```no_run
//! use speaker_embed::model::loader::{LoaderConfig, ModelLoader};
//! use candle_core::Device;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let loader = ModelLoader::from_local_dir("/path/to/model")?;
//! let model = loader.load_model(&Device::Cpu, &LoaderConfig::default())?;
//! let embedding = model.embed(&vec![0.0f32; 32000])?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

use crate::config::ResNetSeConfig;
use crate::error::{Error, Result};
use crate::model::SpeakerModel;
use crate::model::manifest::{ParameterManifest, is_ignored_buffer};

/// Key prefix used by checkpoints saved from a training wrapper.
pub const WRAPPER_PREFIX: &str = "__S__.";

/// Configuration for model loading.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Data type for model weights (default: F32)
    pub dtype: DType,
    /// Prefix stripped from every checkpoint key. `None` strips
    /// [`WRAPPER_PREFIX`] when every learned key carries it.
    pub key_prefix: Option<String>,
    /// Validate the checkpoint against the parameter manifest before
    /// building the network (default: true)
    pub strict: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            dtype: DType::F32,
            key_prefix: None,
            strict: true,
        }
    }
}

/// Loader for a ResNet-SE model directory.
#[derive(Debug, Clone)]
pub struct ModelLoader {
    model_dir: PathBuf,
    config: ResNetSeConfig,
}

impl ModelLoader {
    /// Create a loader from a local model directory.
    ///
    /// A missing `config.json` falls back to the default configuration.
    pub fn from_local_dir(model_dir: impl AsRef<Path>) -> Result<Self> {
        let model_dir = model_dir.as_ref().to_path_buf();
        if !model_dir.is_dir() {
            return Err(Error::Config(format!(
                "Model directory does not exist: {}",
                model_dir.display()
            )));
        }

        let config_path = model_dir.join("config.json");
        let config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config = ResNetSeConfig::from_json(&content)?;
            tracing::debug!(path = %config_path.display(), "Loaded model config");
            config
        } else {
            tracing::warn!(
                "No config.json in {}, using default configuration",
                model_dir.display()
            );
            ResNetSeConfig::default()
        };

        Ok(Self { model_dir, config })
    }

    /// Create a loader with an explicit configuration.
    pub fn with_config(model_dir: impl AsRef<Path>, config: ResNetSeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            model_dir: model_dir.as_ref().to_path_buf(),
            config,
        })
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    pub fn config(&self) -> &ResNetSeConfig {
        &self.config
    }

    /// Find the weights file: `model.safetensors`, else the first
    /// `*.safetensors` in the directory.
    fn find_weights_file(&self) -> Option<PathBuf> {
        let default = self.model_dir.join("model.safetensors");
        if default.exists() {
            return Some(default);
        }

        let mut candidates: Vec<PathBuf> = std::fs::read_dir(&self.model_dir)
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|e| e == "safetensors"))
            .collect();
        candidates.sort();
        candidates.into_iter().next()
    }

    /// Read and normalize the checkpoint tensors (host memory, F32 as stored).
    pub fn load_tensors(&self, config: &LoaderConfig) -> Result<HashMap<String, Tensor>> {
        let weights_path = self.find_weights_file().ok_or_else(|| {
            Error::Config(format!(
                "No model weights found in {}",
                self.model_dir.display()
            ))
        })?;
        tracing::info!("Loading model weights from {}", weights_path.display());

        let raw = candle_core::safetensors::load(&weights_path, &Device::Cpu)?;
        Ok(normalize_keys(raw, config.key_prefix.as_deref()))
    }

    /// Load the model onto `device`.
    pub fn load_model(&self, device: &Device, config: &LoaderConfig) -> Result<SpeakerModel> {
        let tensors = self.load_tensors(config)?;

        let manifest = ParameterManifest::from_config(&self.config);
        let report = manifest.check(&tensors);
        if !report.unexpected.is_empty() {
            tracing::warn!(
                count = report.unexpected.len(),
                keys = ?report.unexpected,
                "Checkpoint has keys the model does not use"
            );
        }
        if config.strict {
            report.into_result()?;
        }

        tracing::info!(
            parameters = manifest.num_elements(),
            dtype = ?config.dtype,
            "Building ResNet-SE speaker encoder"
        );
        let vb = VarBuilder::from_tensors(tensors, config.dtype, device);
        SpeakerModel::new(&self.config, vb)
    }
}

/// Strip the key prefix and drop buffers inference never reads.
pub fn normalize_keys(
    tensors: HashMap<String, Tensor>,
    prefix: Option<&str>,
) -> HashMap<String, Tensor> {
    let prefix = match prefix {
        Some(p) => Some(p),
        None => {
            let mut learned = tensors
                .keys()
                .filter(|k| !is_ignored_buffer(k) && !k.starts_with("__S__.torchfb."));
            let all_wrapped = learned.all(|k| k.starts_with(WRAPPER_PREFIX));
            (all_wrapped && !tensors.is_empty()).then_some(WRAPPER_PREFIX)
        }
    };

    let mut ignored = 0usize;
    let normalized: HashMap<String, Tensor> = tensors
        .into_iter()
        .filter_map(|(name, tensor)| {
            let name = match prefix {
                Some(p) => name.strip_prefix(p).map(str::to_string).unwrap_or(name),
                None => name,
            };
            if is_ignored_buffer(&name) {
                ignored += 1;
                None
            } else {
                Some((name, tensor))
            }
        })
        .collect();

    if ignored > 0 {
        tracing::warn!(count = ignored, "Ignoring non-learned checkpoint buffers");
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(names: &[&str]) -> HashMap<String, Tensor> {
        names
            .iter()
            .map(|n| {
                (
                    n.to_string(),
                    Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap(),
                )
            })
            .collect()
    }

    fn sorted_keys(m: &HashMap<String, Tensor>) -> Vec<String> {
        let mut keys: Vec<String> = m.keys().cloned().collect();
        keys.sort();
        keys
    }

    #[test]
    fn test_normalize_detects_wrapper_prefix() {
        let tensors = map(&[
            "__S__.conv1.weight",
            "__S__.bn1.num_batches_tracked",
            "__S__.torchfb.1.mel_scale.fb",
            "__S__.fc6.bias",
        ]);
        let normalized = normalize_keys(tensors, None);
        assert_eq!(sorted_keys(&normalized), vec!["conv1.weight", "fc6.bias"]);
    }

    #[test]
    fn test_normalize_keeps_plain_keys() {
        let tensors = map(&["conv1.weight", "bn1.num_batches_tracked", "bn1.weight"]);
        let normalized = normalize_keys(tensors, None);
        assert_eq!(sorted_keys(&normalized), vec!["bn1.weight", "conv1.weight"]);
    }

    #[test]
    fn test_normalize_explicit_prefix() {
        let tensors = map(&["encoder.conv1.weight", "encoder.fc6.weight"]);
        let normalized = normalize_keys(tensors, Some("encoder."));
        assert_eq!(sorted_keys(&normalized), vec!["conv1.weight", "fc6.weight"]);
    }

    #[test]
    fn test_missing_directory_is_config_error() {
        let err = ModelLoader::from_local_dir("/definitely/not/a/model/dir").unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_missing_weights_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ModelLoader::from_local_dir(dir.path()).unwrap();
        assert_eq!(loader.config(), &ResNetSeConfig::default());
        let err = loader.load_tensors(&LoaderConfig::default()).unwrap_err();
        assert!(err.is_config());
    }
}
