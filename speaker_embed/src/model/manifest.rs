//! Expected checkpoint layout for a configuration.
//!
//! Names follow the PyTorch state-dict convention of the reference network
//! (`layer3.2.se.fc.0.weight`, `attention2.2.running_var`, `fc6.bias`, ...).

use std::collections::{HashMap, HashSet};

use candle_core::Tensor;

use crate::config::{
    BlockKind, PoolingStrategy, ResNetSeConfig, encoder_config::SEQUENCE_CHANNELS,
};
use crate::error::{Error, Result};
use crate::nn::backbone::{STAGE_FORCED_PROJECTION, STAGE_STRIDES};
use crate::nn::residual_block::needs_projection;

/// Buffers stored in checkpoints that inference never reads.
pub fn is_ignored_buffer(name: &str) -> bool {
    name.starts_with("torchfb.") || name.ends_with("num_batches_tracked")
}

/// Ordered list of parameter names with their expected shapes.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterManifest {
    entries: Vec<(String, Vec<usize>)>,
}

/// Result of checking a tensor map against a manifest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManifestReport {
    pub missing: Vec<String>,
    /// (name, expected, actual)
    pub mismatched: Vec<(String, Vec<usize>, Vec<usize>)>,
    /// Keys present in the checkpoint but not in the manifest.
    pub unexpected: Vec<String>,
}

impl ManifestReport {
    pub fn is_ok(&self) -> bool {
        self.missing.is_empty() && self.mismatched.is_empty()
    }

    /// Convert into an error naming every missing parameter, or the first
    /// shape mismatch (all of them are logged).
    pub fn into_result(self) -> Result<()> {
        if !self.missing.is_empty() {
            return Err(Error::MissingParameter(self.missing.join(", ")));
        }
        for (name, expected, actual) in &self.mismatched {
            tracing::error!(name = %name, ?expected, ?actual, "parameter shape mismatch");
        }
        match self.mismatched.into_iter().next() {
            Some((name, expected, actual)) => Err(Error::ParameterShape {
                name,
                expected,
                actual,
            }),
            None => Ok(()),
        }
    }
}

impl ParameterManifest {
    /// Manifest of every learned tensor and running statistic of `config`.
    pub fn from_config(config: &ResNetSeConfig) -> Self {
        let mut m = Self {
            entries: Vec::new(),
        };

        let stem = config.num_filters[0];
        m.push("conv1.weight", &[stem, 1, 7, 7]);
        m.batch_norm("bn1", stem);

        let expansion = config.block.expansion();
        let mut in_channels = stem;
        for (i, (((&blocks, &planes), &stride), &forced)) in config
            .layers
            .iter()
            .zip(&config.num_filters)
            .zip(&STAGE_STRIDES)
            .zip(&STAGE_FORCED_PROJECTION)
            .enumerate()
        {
            let out_channels = planes * expansion;
            for j in 0..blocks {
                let prefix = format!("layer{}.{}", i + 1, j);
                let (block_in, block_stride, project) = if j == 0 {
                    (in_channels, stride, forced)
                } else {
                    (out_channels, (1, 1), false)
                };
                m.block(&prefix, config, block_in, planes, block_stride, project);
            }
            in_channels = out_channels;
        }

        let pooled = config.pooled_channels();
        match config.pooling {
            PoolingStrategy::DualBranch => {
                let in_dim = config.attention_input_channels();
                let out_dim = config.encoder_type.attention_channels();
                for name in ["attention", "attention2"] {
                    m.push(&format!("{}.0.weight", name), &[SEQUENCE_CHANNELS, in_dim, 1]);
                    m.push(&format!("{}.0.bias", name), &[SEQUENCE_CHANNELS]);
                    m.batch_norm(&format!("{}.2", name), SEQUENCE_CHANNELS);
                    m.push(&format!("{}.3.weight", name), &[out_dim, SEQUENCE_CHANNELS, 1]);
                    m.push(&format!("{}.3.bias", name), &[out_dim]);
                }
                m.batch_norm("bn5", pooled);
                m.push("fc6.weight", &[config.n_out, pooled]);
                m.push("fc6.bias", &[config.n_out]);
                if config.out_bn {
                    m.batch_norm("bn6", config.n_out);
                }
            }
            PoolingStrategy::SingleBranch => {
                m.push("sap_linear.weight", &[SEQUENCE_CHANNELS, SEQUENCE_CHANNELS]);
                m.push("sap_linear.bias", &[SEQUENCE_CHANNELS]);
                m.push("attention", &[SEQUENCE_CHANNELS, 1]);
                m.push("fc.weight", &[config.n_out, pooled]);
                m.push("fc.bias", &[config.n_out]);
            }
        }
        m
    }

    fn push(&mut self, name: &str, shape: &[usize]) {
        self.entries.push((name.to_string(), shape.to_vec()));
    }

    fn batch_norm(&mut self, prefix: &str, channels: usize) {
        for suffix in ["weight", "bias", "running_mean", "running_var"] {
            self.push(&format!("{}.{}", prefix, suffix), &[channels]);
        }
    }

    fn block(
        &mut self,
        prefix: &str,
        config: &ResNetSeConfig,
        in_channels: usize,
        planes: usize,
        stride: (usize, usize),
        force_projection: bool,
    ) {
        let out_channels = planes * config.block.expansion();
        match config.block {
            BlockKind::Basic => {
                self.push(&format!("{}.conv1.weight", prefix), &[planes, in_channels, 3, 3]);
                self.batch_norm(&format!("{}.bn1", prefix), planes);
                self.push(&format!("{}.conv2.weight", prefix), &[planes, planes, 3, 3]);
                self.batch_norm(&format!("{}.bn2", prefix), planes);
            }
            BlockKind::Bottleneck => {
                self.push(&format!("{}.conv1.weight", prefix), &[planes, in_channels, 1, 1]);
                self.batch_norm(&format!("{}.bn1", prefix), planes);
                self.push(&format!("{}.conv2.weight", prefix), &[planes, planes, 3, 3]);
                self.batch_norm(&format!("{}.bn2", prefix), planes);
                self.push(&format!("{}.conv3.weight", prefix), &[out_channels, planes, 1, 1]);
                self.batch_norm(&format!("{}.bn3", prefix), out_channels);
            }
        }

        let hidden = out_channels / config.se_reduction;
        self.push(&format!("{}.se.fc.0.weight", prefix), &[hidden, out_channels]);
        self.push(&format!("{}.se.fc.0.bias", prefix), &[hidden]);
        self.push(&format!("{}.se.fc.2.weight", prefix), &[out_channels, hidden]);
        self.push(&format!("{}.se.fc.2.bias", prefix), &[out_channels]);

        if force_projection || needs_projection(in_channels, out_channels, stride) {
            self.push(
                &format!("{}.downsample.0.weight", prefix),
                &[out_channels, in_channels, 1, 1],
            );
            self.batch_norm(&format!("{}.downsample.1", prefix), out_channels);
        }
    }

    pub fn entries(&self) -> &[(String, Vec<usize>)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Expected shape of `name`, if it is part of the manifest.
    pub fn shape_of(&self, name: &str) -> Option<&[usize]> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s.as_slice())
    }

    /// Total number of scalar parameters.
    pub fn num_elements(&self) -> usize {
        self.entries
            .iter()
            .map(|(_, s)| s.iter().product::<usize>())
            .sum()
    }

    /// Compare a tensor map against the manifest.
    pub fn check(&self, tensors: &HashMap<String, Tensor>) -> ManifestReport {
        let mut report = ManifestReport::default();
        let mut known = HashSet::with_capacity(self.entries.len());

        for (name, expected) in &self.entries {
            known.insert(name.as_str());
            match tensors.get(name) {
                None => report.missing.push(name.clone()),
                Some(t) if t.dims() != expected.as_slice() => {
                    report
                        .mismatched
                        .push((name.clone(), expected.clone(), t.dims().to_vec()))
                }
                Some(_) => {}
            }
        }

        report.unexpected = tensors
            .keys()
            .filter(|k| !known.contains(k.as_str()))
            .cloned()
            .collect();
        report.unexpected.sort();
        report
    }

    /// Fail on the first class of problem found by [`Self::check`].
    pub fn validate(&self, tensors: &HashMap<String, Tensor>) -> Result<()> {
        self.check(tensors).into_result()
    }
}
