//! ResNet-SE feature extractor: 7x7 stem followed by four residual stages.

use candle_core::{D, DType, Module, Result, Tensor};
use candle_nn::VarBuilder;

use crate::config::{BlockKind, ResNetSeConfig};
use crate::nn::conv::{StridedConv2d, conv_output_len};
use crate::nn::norm::FrozenBatchNorm;
use crate::nn::residual_block::{ResidualBlock, build_block};

/// Stem stride as (frequency, time).
pub const STEM_STRIDE: (usize, usize) = (2, 1);
const STEM_KERNEL: usize = 7;
const STEM_PADDING: usize = 3;

/// Stride of the first block of each stage, as (frequency, time).
pub const STAGE_STRIDES: [(usize, usize); 4] = [(1, 1), (2, 2), (2, 2), (1, 1)];

/// Stages whose first block always has a projection shortcut. Only `layer1`
/// falls back to an identity shortcut when its widths match.
pub const STAGE_FORCED_PROJECTION: [bool; 4] = [false, true, true, true];

/// Spatial extent (frequency, time) of the backbone output for an input of
/// `n_mels` bands and `frames` frames.
pub fn output_extent(n_mels: usize, frames: usize) -> (usize, usize) {
    let mut f = conv_output_len(n_mels, STEM_KERNEL, STEM_STRIDE.0, STEM_PADDING);
    let mut t = conv_output_len(frames, STEM_KERNEL, STEM_STRIDE.1, STEM_PADDING);
    for (sf, st) in STAGE_STRIDES {
        f = conv_output_len(f, 3, sf, 1);
        t = conv_output_len(t, 3, st, 1);
    }
    (f, t)
}

/// Stem convolution plus residual stages `layer1..layer4`.
#[derive(Debug)]
pub struct ResNetSeBackbone {
    conv1: StridedConv2d,
    bn1: FrozenBatchNorm,
    stages: Vec<Vec<Box<dyn ResidualBlock>>>,
    out_channels: usize,
}

impl ResNetSeBackbone {
    pub fn new(config: &ResNetSeConfig, vb: VarBuilder) -> Result<Self> {
        let mut in_channels = config.num_filters[0];
        let conv1 = StridedConv2d::new(
            1,
            in_channels,
            STEM_KERNEL,
            STEM_STRIDE,
            STEM_PADDING,
            vb.pp("conv1"),
        )?;
        let bn1 = FrozenBatchNorm::new(in_channels, vb.pp("bn1"))?;

        let mut stages = Vec::with_capacity(config.layers.len());
        for (i, (((&blocks, &planes), &stride), &forced)) in config
            .layers
            .iter()
            .zip(&config.num_filters)
            .zip(&STAGE_STRIDES)
            .zip(&STAGE_FORCED_PROJECTION)
            .enumerate()
        {
            let (stage, out_channels) = make_stage(
                config.block,
                in_channels,
                planes,
                blocks,
                stride,
                forced,
                config.se_reduction,
                vb.pp(format!("layer{}", i + 1)),
            )?;
            in_channels = out_channels;
            stages.push(stage);
        }

        Ok(Self {
            conv1,
            bn1,
            stages,
            out_channels: in_channels,
        })
    }

    /// Channels of the final feature map.
    pub fn out_channels(&self) -> usize {
        self.out_channels
    }
}

/// One stage: the first block carries the stride (and projection when
/// needed), the rest run at stride 1 on the expanded width.
fn make_stage(
    kind: BlockKind,
    in_channels: usize,
    planes: usize,
    blocks: usize,
    stride: (usize, usize),
    force_projection: bool,
    reduction: usize,
    vb: VarBuilder,
) -> Result<(Vec<Box<dyn ResidualBlock>>, usize)> {
    let mut stage = Vec::with_capacity(blocks);
    stage.push(build_block(
        kind,
        in_channels,
        planes,
        stride,
        reduction,
        force_projection,
        vb.pp("0"),
    )?);
    let out_channels = planes * kind.expansion();
    for j in 1..blocks {
        stage.push(build_block(
            kind,
            out_channels,
            planes,
            (1, 1),
            reduction,
            false,
            vb.pp(j.to_string()),
        )?);
    }
    Ok((stage, out_channels))
}

impl Module for ResNetSeBackbone {
    /// (B, 1, n_mels, T) -> (B, C, F', T')
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut hidden = self.conv1.forward(xs)?;
        hidden = self.bn1.forward(&hidden)?.relu()?;
        log_stats("stem", &hidden);

        for (i, stage) in self.stages.iter().enumerate() {
            for block in stage {
                hidden = block.forward(&hidden)?;
            }
            log_stats(&format!("layer{}", i + 1), &hidden);
        }
        Ok(hidden)
    }
}

/// Debug-level summary of an intermediate feature map.
pub(crate) fn log_stats(stage: &str, hidden: &Tensor) {
    if tracing::enabled!(tracing::Level::DEBUG)
        && let Ok(h) = hidden.to_dtype(DType::F32)
        && let (Ok(min), Ok(max), Ok(mean)) = (
            h.min_all().and_then(|t| t.to_scalar::<f32>()),
            h.max_all().and_then(|t| t.to_scalar::<f32>()),
            h.mean_all().and_then(|t| t.to_scalar::<f32>()),
        )
    {
        tracing::debug!(
            shape = ?hidden.shape(),
            min = format!("{:.4}", min),
            max = format!("{:.4}", max),
            mean_val = format!("{:.6}", mean),
            "After {}",
            stage
        );
    }
}

/// Average the frequency axis: (B, C, F, T) -> (B, C, T).
pub fn collapse_frequency(xs: &Tensor) -> Result<Tensor> {
    xs.mean(D::Minus2)
}
