//! Bias-free 2D convolution with per-axis stride.

use candle_core::{Module, Result, Tensor};
use candle_nn::init::{FanInOut, NonLinearity, NormalOrUniform};
use candle_nn::{Conv2d, Conv2dConfig, Init, VarBuilder};

/// Kaiming-normal initialization with fan-out scaling and ReLU gain.
pub const CONV_INIT: Init = Init::Kaiming {
    dist: NormalOrUniform::Normal,
    fan: FanInOut::FanOut,
    non_linearity: NonLinearity::ReLU,
};

/// Square-kernel Conv2d without bias whose stride may differ between the
/// frequency (height) and time (width) axes.
///
/// Candle convolutions take one scalar stride, so an anisotropic stride runs
/// the convolution at stride 1 and keeps every `stride.0`-th row and
/// `stride.1`-th column. Output sizes match a strided convolution:
/// `(n + 2p - k) / s + 1` per axis.
#[derive(Debug, Clone)]
pub struct StridedConv2d {
    conv: Conv2d,
    stride: (usize, usize),
}

impl StridedConv2d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: (usize, usize),
        padding: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight = vb.get_with_hints(
            (out_channels, in_channels, kernel_size, kernel_size),
            "weight",
            CONV_INIT,
        )?;
        let native_stride = if stride.0 == stride.1 { stride.0 } else { 1 };
        let config = Conv2dConfig {
            padding,
            stride: native_stride,
            ..Default::default()
        };
        Ok(Self {
            conv: Conv2d::new(weight, None, config),
            stride,
        })
    }
}

/// Keep every `step`-th index along `dim`, starting at 0.
fn subsample(xs: &Tensor, dim: usize, step: usize) -> Result<Tensor> {
    if step == 1 {
        return Ok(xs.clone());
    }
    let len = xs.dim(dim)?;
    let indices: Vec<u32> = (0..len).step_by(step).map(|i| i as u32).collect();
    let n = indices.len();
    let indices = Tensor::from_vec(indices, n, xs.device())?;
    xs.index_select(&indices, dim)
}

impl Module for StridedConv2d {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let ys = self.conv.forward(xs)?;
        if self.stride.0 == self.stride.1 {
            return Ok(ys);
        }
        let ys = subsample(&ys, 2, self.stride.0)?;
        subsample(&ys, 3, self.stride.1)
    }
}

/// Output length of a strided convolution along one axis.
pub fn conv_output_len(len: usize, kernel_size: usize, stride: usize, padding: usize) -> usize {
    (len + 2 * padding - kernel_size) / stride + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn conv(stride: (usize, usize), kernel: usize, padding: usize, varmap: &VarMap) -> StridedConv2d {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        StridedConv2d::new(2, 4, kernel, stride, padding, vb.pp("conv")).unwrap()
    }

    #[test]
    fn test_anisotropic_stride_output_shape() {
        let varmap = VarMap::new();
        let stem = conv((2, 1), 7, 3, &varmap);
        for (h, w) in [(40, 101), (41, 7), (8, 5)] {
            let xs = Tensor::zeros((1, 2, h, w), DType::F32, &Device::Cpu).unwrap();
            let ys = stem.forward(&xs).unwrap();
            assert_eq!(
                ys.dims(),
                &[1, 4, conv_output_len(h, 7, 2, 3), conv_output_len(w, 7, 1, 3)]
            );
        }
    }

    #[test]
    fn test_subsampled_matches_native_stride() {
        let varmap = VarMap::new();
        let native = conv((2, 2), 3, 1, &varmap);
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let dense = StridedConv2d::new(2, 4, 3, (1, 1), 1, vb.pp("conv")).unwrap();

        let data: Vec<f32> = (0..2 * 9 * 11).map(|i| (i as f32 * 0.37).sin()).collect();
        let xs = Tensor::from_vec(data, (1, 2, 9, 11), &Device::Cpu).unwrap();

        let expected = native.forward(&xs).unwrap();
        let dense = dense.forward(&xs).unwrap();
        let got = subsample(&subsample(&dense, 2, 2).unwrap(), 3, 2).unwrap();
        assert_eq!(expected.dims(), got.dims());

        let diff = (expected - got)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-5);
    }

    #[test]
    fn test_weight_has_no_bias() {
        let varmap = VarMap::new();
        let _ = conv((1, 1), 3, 1, &varmap);
        let data = varmap.data().lock().unwrap();
        assert!(data.contains_key("conv.weight"));
        assert!(!data.contains_key("conv.bias"));
        assert_eq!(data["conv.weight"].dims(), &[4, 2, 3, 3]);
    }
}
