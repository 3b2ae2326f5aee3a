//! Embedding comparison helpers.

use crate::error::{Error, Result};

/// Default cosine threshold for a same-speaker decision.
pub const DEFAULT_THRESHOLD: f32 = 0.5;

fn check_dims(a: &[f32], b: &[f32]) -> Result<()> {
    if a.len() != b.len() {
        return Err(Error::InvalidInput(format!(
            "embedding dimensions differ: {} vs {}",
            a.len(),
            b.len()
        )));
    }
    if a.is_empty() {
        return Err(Error::InvalidInput("embeddings are empty".to_string()));
    }
    Ok(())
}

/// Scale to unit Euclidean norm. A zero vector is returned unchanged.
pub fn l2_normalize(embedding: &[f32]) -> Vec<f32> {
    let norm = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        return embedding.to_vec();
    }
    embedding.iter().map(|x| x / norm).collect()
}

/// Cosine similarity in [-1, 1]; 0 when either vector is all zeros.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    check_dims(a, b)?;
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return Ok(0.0);
    }
    Ok((dot / (na * nb)).clamp(-1.0, 1.0))
}

/// Euclidean distance between the L2-normalized embeddings.
pub fn normalized_distance(a: &[f32], b: &[f32]) -> Result<f32> {
    check_dims(a, b)?;
    let (a, b) = (l2_normalize(a), l2_normalize(b));
    Ok(a.iter()
        .zip(&b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt())
}

/// Outcome of a verification trial.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verification {
    pub score: f32,
    pub threshold: f32,
    pub same_speaker: bool,
}

/// Decide whether two embeddings belong to the same speaker.
pub fn verify(a: &[f32], b: &[f32], threshold: f32) -> Result<Verification> {
    let score = cosine_similarity(a, b)?;
    Ok(Verification {
        score,
        threshold,
        same_speaker: score >= threshold,
    })
}
