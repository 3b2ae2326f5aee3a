//! Residual squeeze-excitation blocks of the ResNet-SE backbone.
//!
//! Parameter names follow the PyTorch module layout, e.g.
//! `layer2.0.conv1.weight`, `layer2.0.se.fc.0.bias`,
//! `layer2.0.downsample.1.running_var`.

use candle_core::{D, Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder, linear};

use crate::config::BlockKind;
use crate::nn::conv::StridedConv2d;
use crate::nn::norm::FrozenBatchNorm;

/// A residual block of the backbone.
///
/// Implementations map (B, C_in, F, T) to (B, C_out, F', T').
pub trait ResidualBlock: Module + std::fmt::Debug + Send + Sync {
    /// Channels produced by this block.
    fn out_channels(&self) -> usize;
}

/// Squeeze-and-excitation channel gating.
#[derive(Debug, Clone)]
pub struct SqueezeExcitation {
    fc1: Linear,
    fc2: Linear,
}

impl SqueezeExcitation {
    pub fn new(channels: usize, reduction: usize, vb: VarBuilder) -> Result<Self> {
        let hidden = channels / reduction;
        let fc1 = linear(channels, hidden, vb.pp("fc.0"))?;
        let fc2 = linear(hidden, channels, vb.pp("fc.2"))?;
        Ok(Self { fc1, fc2 })
    }
}

impl Module for SqueezeExcitation {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, c, _, _) = xs.dims4()?;
        // Global average pool over (F, T)
        let pooled = xs.mean(D::Minus1)?.mean(D::Minus1)?;
        let scale = self.fc1.forward(&pooled)?.relu()?;
        let scale = candle_nn::ops::sigmoid(&self.fc2.forward(&scale)?)?;
        xs.broadcast_mul(&scale.reshape((b, c, 1, 1))?)
    }
}

/// Projection shortcut: 1x1 strided conv followed by batch norm.
#[derive(Debug, Clone)]
pub struct Downsample {
    conv: StridedConv2d,
    bn: FrozenBatchNorm,
}

impl Downsample {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        stride: (usize, usize),
        vb: VarBuilder,
    ) -> Result<Self> {
        let conv = StridedConv2d::new(in_channels, out_channels, 1, stride, 0, vb.pp("0"))?;
        let bn = FrozenBatchNorm::new(out_channels, vb.pp("1"))?;
        Ok(Self { conv, bn })
    }
}

impl Module for Downsample {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.bn.forward(&self.conv.forward(xs)?)
    }
}

/// Add the (optionally projected) identity and apply ReLU.
fn add_shortcut(out: &Tensor, xs: &Tensor, downsample: Option<&Downsample>) -> Result<Tensor> {
    let residual = match downsample {
        Some(ds) => ds.forward(xs)?,
        None => xs.clone(),
    };
    (out + residual)?.relu()
}

/// Two 3x3 convolutions with SE gating; expansion 1.
///
/// Ordering is conv, ReLU, BN for the first convolution.
#[derive(Debug, Clone)]
pub struct SeBasicBlock {
    conv1: StridedConv2d,
    bn1: FrozenBatchNorm,
    conv2: StridedConv2d,
    bn2: FrozenBatchNorm,
    se: SqueezeExcitation,
    downsample: Option<Downsample>,
    out_channels: usize,
}

impl SeBasicBlock {
    pub const EXPANSION: usize = 1;

    pub fn new(
        in_channels: usize,
        planes: usize,
        stride: (usize, usize),
        reduction: usize,
        force_projection: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let out_channels = planes * Self::EXPANSION;
        let conv1 = StridedConv2d::new(in_channels, planes, 3, stride, 1, vb.pp("conv1"))?;
        let bn1 = FrozenBatchNorm::new(planes, vb.pp("bn1"))?;
        let conv2 = StridedConv2d::new(planes, planes, 3, (1, 1), 1, vb.pp("conv2"))?;
        let bn2 = FrozenBatchNorm::new(planes, vb.pp("bn2"))?;
        let se = SqueezeExcitation::new(out_channels, reduction, vb.pp("se"))?;
        let downsample = (force_projection || needs_projection(in_channels, out_channels, stride))
            .then(|| Downsample::new(in_channels, out_channels, stride, vb.pp("downsample")))
            .transpose()?;

        Ok(Self {
            conv1,
            bn1,
            conv2,
            bn2,
            se,
            downsample,
            out_channels,
        })
    }
}

impl Module for SeBasicBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let out = self.conv1.forward(xs)?.relu()?;
        let out = self.bn1.forward(&out)?;
        let out = self.bn2.forward(&self.conv2.forward(&out)?)?;
        let out = self.se.forward(&out)?;
        add_shortcut(&out, xs, self.downsample.as_ref())
    }
}

impl ResidualBlock for SeBasicBlock {
    fn out_channels(&self) -> usize {
        self.out_channels
    }
}

/// 1x1 / 3x3 / 1x1 bottleneck with SE gating; expansion 4.
#[derive(Debug, Clone)]
pub struct SeBottleneck {
    conv1: StridedConv2d,
    bn1: FrozenBatchNorm,
    conv2: StridedConv2d,
    bn2: FrozenBatchNorm,
    conv3: StridedConv2d,
    bn3: FrozenBatchNorm,
    se: SqueezeExcitation,
    downsample: Option<Downsample>,
    out_channels: usize,
}

impl SeBottleneck {
    pub const EXPANSION: usize = 4;

    pub fn new(
        in_channels: usize,
        planes: usize,
        stride: (usize, usize),
        reduction: usize,
        force_projection: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let out_channels = planes * Self::EXPANSION;
        let conv1 = StridedConv2d::new(in_channels, planes, 1, (1, 1), 0, vb.pp("conv1"))?;
        let bn1 = FrozenBatchNorm::new(planes, vb.pp("bn1"))?;
        let conv2 = StridedConv2d::new(planes, planes, 3, stride, 1, vb.pp("conv2"))?;
        let bn2 = FrozenBatchNorm::new(planes, vb.pp("bn2"))?;
        let conv3 = StridedConv2d::new(planes, out_channels, 1, (1, 1), 0, vb.pp("conv3"))?;
        let bn3 = FrozenBatchNorm::new(out_channels, vb.pp("bn3"))?;
        let se = SqueezeExcitation::new(out_channels, reduction, vb.pp("se"))?;
        let downsample = (force_projection || needs_projection(in_channels, out_channels, stride))
            .then(|| Downsample::new(in_channels, out_channels, stride, vb.pp("downsample")))
            .transpose()?;

        Ok(Self {
            conv1,
            bn1,
            conv2,
            bn2,
            conv3,
            bn3,
            se,
            downsample,
            out_channels,
        })
    }
}

impl Module for SeBottleneck {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let out = self.bn1.forward(&self.conv1.forward(xs)?)?.relu()?;
        let out = self.bn2.forward(&self.conv2.forward(&out)?)?.relu()?;
        let out = self.bn3.forward(&self.conv3.forward(&out)?)?;
        let out = self.se.forward(&out)?;
        add_shortcut(&out, xs, self.downsample.as_ref())
    }
}

impl ResidualBlock for SeBottleneck {
    fn out_channels(&self) -> usize {
        self.out_channels
    }
}

/// Whether a block needs a projection shortcut.
pub fn needs_projection(in_channels: usize, out_channels: usize, stride: (usize, usize)) -> bool {
    stride != (1, 1) || in_channels != out_channels
}

/// Build one block of the requested flavor.
///
/// `force_projection` adds the projection shortcut even when widths and
/// stride would allow an identity shortcut.
pub fn build_block(
    kind: BlockKind,
    in_channels: usize,
    planes: usize,
    stride: (usize, usize),
    reduction: usize,
    force_projection: bool,
    vb: VarBuilder,
) -> Result<Box<dyn ResidualBlock>> {
    Ok(match kind {
        BlockKind::Basic => Box::new(SeBasicBlock::new(
            in_channels,
            planes,
            stride,
            reduction,
            force_projection,
            vb,
        )?),
        BlockKind::Bottleneck => Box::new(SeBottleneck::new(
            in_channels,
            planes,
            stride,
            reduction,
            force_projection,
            vb,
        )?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn input(shape: (usize, usize, usize, usize)) -> Tensor {
        let n = shape.0 * shape.1 * shape.2 * shape.3;
        let data: Vec<f32> = (0..n).map(|i| (i as f32 * 0.13).cos()).collect();
        Tensor::from_vec(data, shape, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_se_gating_is_bounded() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let se = SqueezeExcitation::new(16, 8, vb.pp("se")).unwrap();

        let xs = Tensor::ones((2, 16, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let ys = se.forward(&xs).unwrap();
        assert_eq!(ys.dims(), xs.dims());
        for v in ys.flatten_all().unwrap().to_vec1::<f32>().unwrap() {
            assert!(v > 0.0 && v < 1.0);
        }
    }

    #[test]
    fn test_basic_block_identity_shortcut() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let block =
            build_block(BlockKind::Basic, 16, 16, (1, 1), 8, false, vb.pp("layer1.0")).unwrap();
        assert_eq!(block.out_channels(), 16);

        let ys = block.forward(&input((1, 16, 20, 9))).unwrap();
        assert_eq!(ys.dims(), &[1, 16, 20, 9]);
        let min = ys.min_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(min >= 0.0, "block output must be post-ReLU");

        let data = varmap.data().lock().unwrap();
        assert!(data.contains_key("layer1.0.se.fc.0.weight"));
        assert!(data.contains_key("layer1.0.se.fc.2.bias"));
        assert!(!data.keys().any(|k| k.contains("downsample")));
    }

    #[test]
    fn test_basic_block_projection_when_strided() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let block =
            build_block(BlockKind::Basic, 16, 32, (2, 2), 8, false, vb.pp("layer2.0")).unwrap();

        let ys = block.forward(&input((2, 16, 20, 9))).unwrap();
        assert_eq!(ys.dims(), &[2, 32, 10, 5]);

        let data = varmap.data().lock().unwrap();
        assert_eq!(data["layer2.0.downsample.0.weight"].dims(), &[32, 16, 1, 1]);
        assert!(data.contains_key("layer2.0.downsample.1.running_var"));
    }

    #[test]
    fn test_bottleneck_expands_channels() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let block =
            build_block(BlockKind::Bottleneck, 16, 8, (1, 1), 8, false, vb.pp("layer1.0")).unwrap();
        assert_eq!(block.out_channels(), 32);

        let ys = block.forward(&input((1, 16, 6, 7))).unwrap();
        assert_eq!(ys.dims(), &[1, 32, 6, 7]);

        let data = varmap.data().lock().unwrap();
        assert_eq!(data["layer1.0.conv3.weight"].dims(), &[32, 8, 1, 1]);
        assert_eq!(data["layer1.0.se.fc.0.weight"].dims(), &[4, 32]);
    }

    #[test]
    fn test_forced_projection_at_equal_width() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let block =
            build_block(BlockKind::Basic, 32, 32, (1, 1), 8, true, vb.pp("layer4.0")).unwrap();

        let ys = block.forward(&input((1, 32, 5, 6))).unwrap();
        assert_eq!(ys.dims(), &[1, 32, 5, 6]);

        let data = varmap.data().lock().unwrap();
        assert_eq!(data["layer4.0.downsample.0.weight"].dims(), &[32, 32, 1, 1]);
        assert!(data.contains_key("layer4.0.downsample.1.running_mean"));
    }

    #[test]
    fn test_needs_projection() {
        assert!(!needs_projection(16, 16, (1, 1)));
        assert!(needs_projection(16, 32, (1, 1)));
        assert!(needs_projection(32, 32, (2, 2)));
    }
}
