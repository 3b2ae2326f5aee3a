//! Normalization layers.
//!
//! Batch normalization always runs in inference mode: running statistics are
//! loaded constants and are never updated.

use candle_core::{Result, Tensor};
use candle_nn::{BatchNormConfig, ModuleT, VarBuilder};

#[cfg(feature = "timing")]
use crate::nn::timing::{BATCHNORM_CALLS, BATCHNORM_TIME_US};

/// Epsilon shared by every batch and instance normalization.
pub const NORM_EPS: f64 = 1e-5;

/// Batch normalization frozen to its running statistics.
///
/// Works on any tensor with channels on dim 1: (B, C), (B, C, T) or
/// (B, C, H, W). Parameter names are `weight`, `bias`, `running_mean` and
/// `running_var`; fresh parameters start at 1, 0, 0 and 1.
pub struct FrozenBatchNorm(candle_nn::BatchNorm);

impl FrozenBatchNorm {
    pub fn new(num_features: usize, vb: VarBuilder) -> Result<Self> {
        let config = BatchNormConfig {
            eps: NORM_EPS,
            remove_mean: true,
            affine: true,
            momentum: 0.1,
        };
        Ok(Self(candle_nn::batch_norm(num_features, config, vb)?))
    }
}

impl candle_nn::Module for FrozenBatchNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        #[cfg(feature = "timing")]
        let start = std::time::Instant::now();
        #[cfg(feature = "timing")]
        BATCHNORM_CALLS.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let result = self.0.forward_t(xs, false);

        #[cfg(feature = "timing")]
        BATCHNORM_TIME_US.fetch_add(
            start.elapsed().as_micros() as u64,
            std::sync::atomic::Ordering::Relaxed,
        );

        result
    }
}

impl Clone for FrozenBatchNorm {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl std::fmt::Debug for FrozenBatchNorm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrozenBatchNorm").finish()
    }
}

/// Instance normalization over the last axis without affine parameters.
///
/// Each (example, channel) row of a (B, C, T) tensor is shifted to zero mean
/// and scaled by `1 / sqrt(var + 1e-5)`, using the biased variance.
pub fn instance_norm(xs: &Tensor) -> Result<Tensor> {
    let mean = xs.mean_keepdim(2)?;
    let centered = xs.broadcast_sub(&mean)?;
    let var = centered.sqr()?.mean_keepdim(2)?;
    centered.broadcast_div(&(var + NORM_EPS)?.sqrt()?)
}
