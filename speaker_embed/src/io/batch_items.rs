use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::io::IoArgs;

/// Single audio file in a batch input file
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BatchItem {
    /// Path to the audio file
    pub audio: String,
    /// Label stored with the embedding (defaults to the file stem)
    #[serde(default)]
    pub label: Option<String>,
    /// Output filename (optional, auto-generated if not specified)
    #[serde(default)]
    pub output: Option<String>,
}

impl BatchItem {
    pub fn from_path(audio: impl Into<String>) -> Self {
        Self {
            audio: audio.into(),
            label: None,
            output: None,
        }
    }

    /// Label for this item: explicit label, else the audio file stem.
    pub fn label(&self) -> String {
        self.label.clone().unwrap_or_else(|| {
            Path::new(&self.audio)
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or(&self.audio)
                .to_string()
        })
    }
}

/// Batch input file format
#[derive(Debug, Clone, Deserialize)]
pub struct BatchInput {
    /// List of items to process
    pub items: Vec<BatchItem>,
}

/// Load batch items from `--file` or the positional audio paths
pub fn load_batch_items(io_args: &IoArgs) -> Result<Vec<BatchItem>> {
    if let Some(ref input_file) = io_args.file {
        let is_json = input_file
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let items: Vec<BatchItem> = if is_json {
            let content = fs::read_to_string(input_file)
                .with_context(|| format!("Failed to read file: {:?}", input_file))?;
            let batch: BatchInput = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON file: {:?}", input_file))?;
            batch.items
        } else {
            // One audio path per line
            let file = fs::File::open(input_file)
                .with_context(|| format!("Failed to open file: {:?}", input_file))?;
            let lines = BufReader::new(file)
                .lines()
                .collect::<std::io::Result<Vec<_>>>()
                .with_context(|| format!("Failed to read file: {:?}", input_file))?;
            lines
                .iter()
                .map(|line| line.trim().to_string())
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(BatchItem::from_path)
                .collect()
        };

        if items.is_empty() {
            bail!("{:?} lists no audio files", input_file);
        }
        return Ok(items);
    }

    if !io_args.audio.is_empty() {
        return Ok(io_args
            .audio
            .iter()
            .map(|p| BatchItem::from_path(p.to_string_lossy()))
            .collect());
    }

    bail!("No audio input specified. Pass audio files or use --file")
}
