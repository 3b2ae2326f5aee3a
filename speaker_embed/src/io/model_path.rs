use anyhow::{Context, Result, bail};
use hf_hub::api::sync::Api;
use hf_hub::{Repo, RepoType};
use std::path::PathBuf;

use crate::io::ModelArgs;

/// Get the model directory, downloading from HuggingFace if needed.
pub fn get_model_path(model_args: &ModelArgs) -> Result<PathBuf> {
    // A local path wins over a model ID
    if let Some(ref path) = model_args.model_path {
        if !path.exists() {
            bail!("Model path does not exist: {:?}", path);
        }
        return Ok(path.clone());
    }

    let Some(ref model_id) = model_args.model else {
        bail!("No model specified. Use --model-path or --model");
    };

    tracing::info!(model_id = %model_id, "Downloading model from HuggingFace");

    let api = Api::new().context("Failed to create HuggingFace API")?;
    let repo = api.repo(Repo::new(model_id.clone(), RepoType::Model));

    let weights = repo
        .get("model.safetensors")
        .with_context(|| format!("Failed to download model.safetensors from {}", model_id))?;
    tracing::debug!(file = "model.safetensors", "Downloaded");

    match repo.get("config.json") {
        Ok(_) => tracing::debug!(file = "config.json", "Downloaded"),
        Err(e) => tracing::debug!(error = %e, "No config.json, using defaults"),
    }

    weights
        .parent()
        .map(|p| p.to_path_buf())
        .ok_or_else(|| anyhow::anyhow!("Failed to determine model directory"))
}
