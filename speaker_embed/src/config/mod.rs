//! Model configuration.

pub mod encoder_config;

pub use encoder_config::{BlockKind, EncoderType, PoolingStrategy, ResNetSeConfig};
