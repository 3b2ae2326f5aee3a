//! Neural network components of the ResNet-SE speaker encoder.
//!
//! - Normalization (frozen batch norm, instance norm)
//! - Strided convolution
//! - Residual squeeze-excitation blocks
//! - Backbone (stem + four stages)
//! - Attention pooling (dual- and single-branch)
//! - Top-level encoder with embedding head

pub mod backbone;
pub mod conv;
pub mod norm;
pub mod pooling;
pub mod residual_block;
pub mod speaker_encoder;
pub mod timing;
