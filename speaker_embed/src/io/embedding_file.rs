//! Saved speaker embeddings.
//!
//! Files are JSON wrapping a base64-encoded safetensors buffer, so one file
//! can hold several embeddings (e.g. all enrollment utterances of a speaker)
//! next to readable metadata.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use candle_core::{DType, Device, Tensor};
use safetensors::serialize;
use safetensors::tensor::TensorView;
use serde::{Deserialize, Serialize};

const EMBEDDING_FILE_VERSION: u32 = 1;

/// Name of the tensor holding the embeddings.
const EMBEDDINGS_KEY: &str = "embeddings";

/// On-disk layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EmbeddingFile {
    /// File format version
    version: u32,
    /// Embedding width
    dim: usize,
    /// Label per row (source file names, speaker ids...)
    labels: Vec<String>,
    /// Serialized tensor data (base64-encoded safetensors)
    data: String,
}

/// Embeddings with one label per row.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingSet {
    pub labels: Vec<String>,
    pub embeddings: Vec<Vec<f32>>,
}

impl EmbeddingSet {
    pub fn new(labels: Vec<String>, embeddings: Vec<Vec<f32>>) -> Self {
        Self { labels, embeddings }
    }

    pub fn single(label: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self::new(vec![label.into()], vec![embedding])
    }

    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }

    /// Embedding width, 0 when empty.
    pub fn dim(&self) -> usize {
        self.embeddings.first().map(Vec::len).unwrap_or(0)
    }

    /// Element-wise mean of every row (enrollment centroid).
    pub fn mean(&self) -> Option<Vec<f32>> {
        let first = self.embeddings.first()?;
        let mut acc = vec![0.0f32; first.len()];
        for row in &self.embeddings {
            for (a, x) in acc.iter_mut().zip(row) {
                *a += x;
            }
        }
        let n = self.embeddings.len() as f32;
        Some(acc.into_iter().map(|a| a / n).collect())
    }

    /// Rows as a (N, dim) tensor.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let data: Vec<f32> = self.embeddings.iter().flatten().copied().collect();
        Ok(Tensor::from_vec(data, (self.len(), self.dim()), device)?)
    }
}

/// Save embeddings to a file.
pub fn save_embeddings(set: &EmbeddingSet, path: &Path) -> Result<()> {
    if set.is_empty() {
        bail!("No embeddings to save");
    }
    if set.labels.len() != set.len() {
        bail!(
            "{} labels for {} embeddings",
            set.labels.len(),
            set.len()
        );
    }
    let dim = set.dim();
    if set.embeddings.iter().any(|e| e.len() != dim) {
        bail!("Embeddings must all have width {}", dim);
    }

    let data: Vec<f32> = set.embeddings.iter().flatten().copied().collect();
    let mut views: HashMap<String, TensorView<'_>> = HashMap::new();
    views.insert(
        EMBEDDINGS_KEY.to_string(),
        TensorView::new(
            safetensors::Dtype::F32,
            vec![set.len(), dim],
            bytemuck::cast_slice(&data),
        )?,
    );
    let buffer = serialize(&views, None)?;

    let file = EmbeddingFile {
        version: EMBEDDING_FILE_VERSION,
        dim,
        labels: set.labels.clone(),
        data: BASE64.encode(&buffer),
    };
    let json = serde_json::to_string_pretty(&file)?;
    fs::write(path, json).with_context(|| format!("Failed to write {:?}", path))?;

    tracing::debug!(path = ?path, count = set.len(), dim, "Saved embeddings");
    Ok(())
}

/// Load embeddings from a file.
pub fn load_embeddings(path: &Path) -> Result<EmbeddingSet> {
    use candle_core::safetensors::load_buffer;

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read embedding file: {:?}", path))?;
    let file: EmbeddingFile = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse embedding file: {:?}", path))?;

    if file.version != EMBEDDING_FILE_VERSION {
        bail!(
            "Embedding file version mismatch: expected {}, got {}",
            EMBEDDING_FILE_VERSION,
            file.version
        );
    }

    let buffer = BASE64
        .decode(&file.data)
        .context("Failed to decode embedding data")?;
    let tensors = load_buffer(&buffer, &Device::Cpu)?;
    let embeddings = tensors
        .get(EMBEDDINGS_KEY)
        .context("Embedding file missing embeddings tensor")?
        .to_dtype(DType::F32)?;

    let (rows, dim) = embeddings.dims2()?;
    if dim != file.dim || rows != file.labels.len() {
        bail!(
            "Embedding file is inconsistent: tensor is {}x{}, header says {} labels of width {}",
            rows,
            dim,
            file.labels.len(),
            file.dim
        );
    }

    Ok(EmbeddingSet {
        labels: file.labels,
        embeddings: embeddings.to_vec2::<f32>()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spk.json");
        let set = EmbeddingSet::new(
            vec!["a.wav".to_string(), "b.wav".to_string()],
            vec![vec![0.5, -1.0, 2.0], vec![0.0, 0.25, -0.75]],
        );
        save_embeddings(&set, &path).unwrap();

        let loaded = load_embeddings(&path).unwrap();
        assert_eq!(loaded, set);
    }

    #[test]
    fn test_rejects_ragged_rows() {
        let dir = tempfile::tempdir().unwrap();
        let set = EmbeddingSet::new(
            vec!["a".to_string(), "b".to_string()],
            vec![vec![1.0, 2.0], vec![1.0]],
        );
        assert!(save_embeddings(&set, &dir.path().join("x.json")).is_err());
    }

    #[test]
    fn test_version_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.json");
        fs::write(
            &path,
            r#"{"version": 99, "dim": 1, "labels": ["a"], "data": ""}"#,
        )
        .unwrap();
        let err = load_embeddings(&path).unwrap_err();
        assert!(err.to_string().contains("version mismatch"));
    }

    #[test]
    fn test_mean() {
        let set = EmbeddingSet::new(
            vec!["a".to_string(), "b".to_string()],
            vec![vec![1.0, 3.0], vec![3.0, 5.0]],
        );
        assert_eq!(set.mean(), Some(vec![2.0, 4.0]));
        assert_eq!(set.to_tensor(&Device::Cpu).unwrap().dims(), &[2, 2]);
        assert_eq!(EmbeddingSet::new(vec![], vec![]).mean(), None);
    }
}
