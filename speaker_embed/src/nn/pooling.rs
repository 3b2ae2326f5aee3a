//! Attention-based temporal pooling.
//!
//! The dual-branch pooler builds two augmented contexts from the collapsed
//! sequence (B, 128, T'), runs one [`AttentionStack`] on each and pools the
//! sequence with the summed attention weights into mean and standard
//! deviation statistics. The single-branch pooler is the older scheme with a
//! tanh projection and one learned attention vector.

use candle_core::{D, Module, Result, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, Init, Linear, VarBuilder, conv1d, linear};

use crate::config::{EncoderType, PoolingStrategy, ResNetSeConfig, encoder_config::SEQUENCE_CHANNELS};
use crate::nn::norm::FrozenBatchNorm;

/// Lower clamp applied to every variance before a square root.
pub const VAR_MIN: f64 = 1e-4;
/// Upper clamp applied to every variance before a square root.
pub const VAR_MAX: f64 = 1e4;
/// Variance floor of the single-branch ASP statistics.
const SINGLE_BRANCH_VAR_MIN: f64 = 1e-5;

/// Standard deviation along `dim` from the unbiased variance, clamped to
/// `[VAR_MIN, VAR_MAX]`, keeping the reduced axis.
fn clamped_std_keepdim(xs: &Tensor, dim: usize) -> Result<Tensor> {
    xs.var_keepdim(dim)?.clamp(VAR_MIN, VAR_MAX)?.sqrt()
}

/// Augment `xs` (B, C, T) with statistics taken along `dim` and broadcast
/// back over it: cat[x, mean, std] -> (B, 3C, T).
fn augment(xs: &Tensor, dim: usize) -> Result<Tensor> {
    let shape = xs.shape();
    let mean = xs.mean_keepdim(dim)?.broadcast_as(shape)?;
    let std = clamped_std_keepdim(xs, dim)?.broadcast_as(shape)?;
    Tensor::cat(&[xs, &mean, &std], 1)
}

/// Build the two attention contexts of a (B, C, T) sequence.
///
/// Returns `(context_by_time, context_by_channel)`. The first carries, for
/// every frame, the mean and std across channels; the second carries, for
/// every channel, the mean and std across time. Both are (B, 3C, T), or plain
/// copies of `xs` when `context` is false.
pub fn build_contexts(xs: &Tensor, context: bool) -> Result<(Tensor, Tensor)> {
    if !context {
        return Ok((xs.clone(), xs.clone()));
    }
    Ok((augment(xs, 1)?, augment(xs, 2)?))
}

/// Weighted first and second moments over time.
///
/// `weights` is (B, C, T) or (B, 1, T). Returns `mu` (B, C) and
/// `sqrt(clamp(sum(x^2 w) - mu^2))` (B, C).
pub fn weighted_statistics(
    xs: &Tensor,
    weights: &Tensor,
    var_min: f64,
    var_max: f64,
) -> Result<(Tensor, Tensor)> {
    let mu = xs.broadcast_mul(weights)?.sum(D::Minus1)?;
    let second = xs.sqr()?.broadcast_mul(weights)?.sum(D::Minus1)?;
    let sg = (second - mu.sqr()?)?.clamp(var_min, var_max)?.sqrt()?;
    Ok((mu, sg))
}

/// Conv1d(k=1) -> ReLU -> BatchNorm1d -> Conv1d(k=1) -> softmax over time.
///
/// Parameters live under `0`, `2` and `3` (the positions in the original
/// sequential container).
#[derive(Debug, Clone)]
pub struct AttentionStack {
    conv1: Conv1d,
    bn: FrozenBatchNorm,
    conv2: Conv1d,
}

impl AttentionStack {
    pub fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        let config = Conv1dConfig::default();
        let conv1 = conv1d(in_channels, SEQUENCE_CHANNELS, 1, config, vb.pp("0"))?;
        let bn = FrozenBatchNorm::new(SEQUENCE_CHANNELS, vb.pp("2"))?;
        let conv2 = conv1d(SEQUENCE_CHANNELS, out_channels, 1, config, vb.pp("3"))?;
        Ok(Self { conv1, bn, conv2 })
    }
}

impl Module for AttentionStack {
    /// (B, C_in, T) -> (B, C_out, T), each row summing to 1 over T.
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let hidden = self.conv1.forward(xs)?.relu()?;
        let hidden = self.bn.forward(&hidden)?;
        let logits = self.conv2.forward(&hidden)?.contiguous()?;
        candle_nn::ops::softmax_last_dim(&logits)
    }
}

/// Two attention stacks over complementary contexts, pooled into (B, 256).
#[derive(Debug, Clone)]
pub struct DualBranchPooling {
    attention: AttentionStack,
    attention2: AttentionStack,
    context: bool,
}

impl DualBranchPooling {
    pub fn new(config: &ResNetSeConfig, vb: VarBuilder) -> Result<Self> {
        let in_channels = config.attention_input_channels();
        let out_channels = config.encoder_type.attention_channels();
        let attention = AttentionStack::new(in_channels, out_channels, vb.pp("attention"))?;
        let attention2 = AttentionStack::new(in_channels, out_channels, vb.pp("attention2"))?;
        Ok(Self {
            attention,
            attention2,
            context: config.context,
        })
    }

    /// Individual attention maps `(w1, w2)` of a (B, 128, T) sequence.
    pub fn attention_maps(&self, xs: &Tensor) -> Result<(Tensor, Tensor)> {
        let (by_time, by_channel) = build_contexts(xs, self.context)?;
        let w1 = self.attention.forward(&by_time)?;
        let w2 = self.attention2.forward(&by_channel)?;
        Ok((w1, w2))
    }
}

impl Module for DualBranchPooling {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (w1, w2) = self.attention_maps(xs)?;
        // (B, 1, T) maps broadcast across channels
        let w = (w1 + w2)?;
        let (mu, sg) = weighted_statistics(xs, &w, VAR_MIN, VAR_MAX)?;
        Tensor::cat(&[&mu, &sg], 1)
    }
}

/// tanh projection scored against a learned attention vector.
#[derive(Debug, Clone)]
pub struct SingleBranchPooling {
    sap_linear: Linear,
    /// (128, 1)
    attention: Tensor,
    encoder_type: EncoderType,
}

impl SingleBranchPooling {
    pub fn new(config: &ResNetSeConfig, vb: VarBuilder) -> Result<Self> {
        let sap_linear = linear(SEQUENCE_CHANNELS, SEQUENCE_CHANNELS, vb.pp("sap_linear"))?;
        let attention = vb.get_with_hints(
            (SEQUENCE_CHANNELS, 1),
            "attention",
            Init::Randn {
                mean: 0.0,
                stdev: (2.0 / (SEQUENCE_CHANNELS as f64 + 1.0)).sqrt(),
            },
        )?;
        Ok(Self {
            sap_linear,
            attention,
            encoder_type: config.encoder_type,
        })
    }

    /// Attention weights (B, 1, T) of a (B, 128, T) sequence.
    pub fn attention_map(&self, xs: &Tensor) -> Result<Tensor> {
        let frames = xs.transpose(1, 2)?.contiguous()?;
        let h = self.sap_linear.forward(&frames)?.tanh()?;
        let scores = h.broadcast_matmul(&self.attention)?.squeeze(2)?;
        candle_nn::ops::softmax_last_dim(&scores)?.unsqueeze(1)
    }
}

impl Module for SingleBranchPooling {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let w = self.attention_map(xs)?;
        match self.encoder_type {
            EncoderType::Sap => xs.broadcast_mul(&w)?.sum(D::Minus1),
            EncoderType::Asp => {
                let (mu, sg) = weighted_statistics(xs, &w, SINGLE_BRANCH_VAR_MIN, f64::MAX)?;
                Tensor::cat(&[&mu, &sg], 1)
            }
        }
    }
}

/// Temporal pooling selected by [`PoolingStrategy`].
#[derive(Debug, Clone)]
pub enum Pooling {
    DualBranch(DualBranchPooling),
    SingleBranch(SingleBranchPooling),
}

impl Pooling {
    pub fn new(config: &ResNetSeConfig, vb: VarBuilder) -> Result<Self> {
        Ok(match config.pooling {
            PoolingStrategy::DualBranch => Self::DualBranch(DualBranchPooling::new(config, vb)?),
            PoolingStrategy::SingleBranch => {
                Self::SingleBranch(SingleBranchPooling::new(config, vb)?)
            }
        })
    }
}

impl Module for Pooling {
    /// (B, 128, T) -> (B, pooled_channels)
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::DualBranch(p) => p.forward(xs),
            Self::SingleBranch(p) => p.forward(xs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn sequence(batch: usize, frames: usize) -> Tensor {
        Tensor::randn(0f32, 1f32, (batch, SEQUENCE_CHANNELS, frames), &Device::Cpu).unwrap()
    }

    fn row_sums(w: &Tensor) -> Vec<f32> {
        w.sum(D::Minus1).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn test_context_shapes() {
        let xs = sequence(2, 7);
        let (by_time, by_channel) = build_contexts(&xs, true).unwrap();
        assert_eq!(by_time.dims(), &[2, 384, 7]);
        assert_eq!(by_channel.dims(), &[2, 384, 7]);

        let (a, b) = build_contexts(&xs, false).unwrap();
        assert_eq!(a.dims(), &[2, 128, 7]);
        assert_eq!(b.dims(), &[2, 128, 7]);
    }

    #[test]
    fn test_context_statistics_axes() {
        let xs = sequence(1, 5);
        let (by_time, by_channel) = build_contexts(&xs, true).unwrap();

        // by_time: channel-mean of frame 3 repeated down every channel
        let expected = xs.mean_keepdim(1).unwrap().get(0).unwrap().get(0).unwrap();
        let got = by_time.narrow(1, 128, 128).unwrap().get(0).unwrap();
        let expected = expected.to_vec1::<f32>().unwrap();
        let got = got.to_vec2::<f32>().unwrap();
        for row in [0, 64, 127] {
            assert!((got[row][3] - expected[3]).abs() < 1e-6);
        }

        // by_channel: time-mean of channel 10 repeated across frames
        let expected = xs.mean(2).unwrap().get(0).unwrap().to_vec1::<f32>().unwrap();
        let got = by_channel.narrow(1, 128, 128).unwrap().get(0).unwrap();
        let got = got.to_vec2::<f32>().unwrap();
        for t in 0..5 {
            assert!((got[10][t] - expected[10]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_constant_sequence_std_is_clamped() {
        let xs = Tensor::full(2.0f32, (1, SEQUENCE_CHANNELS, 4), &Device::Cpu).unwrap();
        let (by_time, _) = build_contexts(&xs, true).unwrap();
        let std = by_time.narrow(1, 256, 128).unwrap().flatten_all().unwrap();
        for v in std.to_vec1::<f32>().unwrap() {
            assert!((v - 1e-2).abs() < 1e-6);
        }
    }

    #[test]
    fn test_attention_maps_sum_to_one() {
        for encoder_type in [EncoderType::Sap, EncoderType::Asp] {
            let config = ResNetSeConfig {
                encoder_type,
                ..Default::default()
            };
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
            let pooling = DualBranchPooling::new(&config, vb).unwrap();

            let (w1, w2) = pooling.attention_maps(&sequence(3, 9)).unwrap();
            let channels = encoder_type.attention_channels();
            assert_eq!(w1.dims(), &[3, channels, 9]);
            assert_eq!(w2.dims(), &[3, channels, 9]);
            for s in row_sums(&w1).into_iter().chain(row_sums(&w2)) {
                assert!((s - 1.0).abs() < 1e-5, "row sum {}", s);
            }
        }
    }

    #[test]
    fn test_dual_branch_output_width_and_names() {
        let config = ResNetSeConfig {
            encoder_type: EncoderType::Asp,
            context: false,
            ..Default::default()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let pooling = Pooling::new(&config, vb).unwrap();
        let ys = pooling.forward(&sequence(2, 6)).unwrap();
        assert_eq!(ys.dims(), &[2, 256]);

        let data = varmap.data().lock().unwrap();
        assert_eq!(data["attention.0.weight"].dims(), &[128, 128, 1]);
        assert_eq!(data["attention2.3.weight"].dims(), &[1, 128, 1]);
        assert!(data.contains_key("attention2.2.running_var"));
    }

    #[test]
    fn test_weighted_statistics_uniform_weights() {
        let device = Device::Cpu;
        let xs = Tensor::new(&[[[1.0f32, 3.0], [2.0, 2.0]]], &device).unwrap();
        let w = Tensor::new(&[[[0.5f32, 0.5]]], &device).unwrap();
        let (mu, sg) = weighted_statistics(&xs, &w, VAR_MIN, VAR_MAX).unwrap();
        assert_eq!(mu.to_vec2::<f32>().unwrap(), vec![vec![2.0, 2.0]]);
        let sg = sg.to_vec2::<f32>().unwrap();
        assert!((sg[0][0] - 1.0).abs() < 1e-6);
        // zero variance is floored at 1e-4
        assert!((sg[0][1] - 1e-2).abs() < 1e-6);
    }

    #[test]
    fn test_single_branch_widths() {
        for (encoder_type, width) in [(EncoderType::Sap, 128), (EncoderType::Asp, 256)] {
            let config = ResNetSeConfig {
                encoder_type,
                pooling: PoolingStrategy::SingleBranch,
                ..Default::default()
            };
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
            let pooling = Pooling::new(&config, vb).unwrap();
            let xs = sequence(2, 5);
            assert_eq!(pooling.forward(&xs).unwrap().dims(), &[2, width]);

            if let Pooling::SingleBranch(p) = &pooling {
                let w = p.attention_map(&xs).unwrap();
                assert_eq!(w.dims(), &[2, 1, 5]);
                for s in row_sums(&w) {
                    assert!((s - 1.0).abs() < 1e-5);
                }
            }
            let data = varmap.data().lock().unwrap();
            assert_eq!(data["attention"].dims(), &[128, 1]);
            assert!(data.contains_key("sap_linear.weight"));
        }
    }
}
