//! Log-mel spectrogram extraction.
//!
//! Frames are centered: the waveform is reflect-padded by `n_fft / 2` on both
//! sides, the window is zero-padded to `n_fft`, and the power spectrum is
//! projected through an HTK-scale triangular filterbank. A waveform of `L`
//! samples yields `L / hop_size + 1` frames.

use std::sync::Arc;

use candle_core::{DType, Device, Result, Tensor};
use rustfft::{Fft, FftPlanner, num_complex::Complex};

/// Energy floor added before (and again inside) log compression.
pub const ENERGY_FLOOR: f64 = 1e-6;

/// Configuration for mel spectrogram computation.
#[derive(Debug, Clone, PartialEq)]
pub struct MelSpectrogramConfig {
    /// FFT size
    pub n_fft: usize,
    /// Number of mel bins
    pub num_mels: usize,
    /// Audio sample rate
    pub sample_rate: usize,
    /// Hop size between frames
    pub hop_size: usize,
    /// Window size for STFT
    pub win_size: usize,
    /// Minimum frequency for mel filterbank
    pub fmin: f64,
    /// Maximum frequency for mel filterbank (None = sample_rate / 2)
    pub fmax: Option<f64>,
}

impl Default for MelSpectrogramConfig {
    fn default() -> Self {
        Self {
            n_fft: 512,
            num_mels: 40,
            sample_rate: 16000,
            hop_size: 160,
            win_size: 400,
            fmin: 0.0,
            fmax: None,
        }
    }
}

impl MelSpectrogramConfig {
    /// Number of frames produced for a waveform of `num_samples` samples.
    pub fn num_frames(&self, num_samples: usize) -> usize {
        num_samples / self.hop_size + 1
    }

    /// Reflect padding applied on each side of the waveform.
    pub fn center_padding(&self) -> usize {
        self.n_fft / 2
    }
}

/// Precomputed STFT window, FFT plan and mel filterbank.
#[derive(Clone)]
pub struct MelSpectrogram {
    config: MelSpectrogramConfig,
    window: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
    /// (num_mels, n_fft / 2 + 1), always F32
    mel_basis: Tensor,
}

impl std::fmt::Debug for MelSpectrogram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MelSpectrogram")
            .field("config", &self.config)
            .finish()
    }
}

impl MelSpectrogram {
    pub fn new(config: MelSpectrogramConfig, device: &Device) -> Result<Self> {
        let n_freqs = config.n_fft / 2 + 1;
        let filterbank = create_mel_filterbank(
            config.n_fft,
            config.num_mels,
            config.sample_rate,
            config.fmin,
            config.fmax,
        );
        let mel_basis_data: Vec<f32> = filterbank.into_iter().flatten().collect();
        let mel_basis = Tensor::from_vec(mel_basis_data, (config.num_mels, n_freqs), device)?;

        let window = create_hamming_window(config.win_size);
        let fft = FftPlanner::<f32>::new().plan_fft_forward(config.n_fft);

        Ok(Self {
            config,
            window,
            fft,
            mel_basis,
        })
    }

    pub fn config(&self) -> &MelSpectrogramConfig {
        &self.config
    }

    /// Mel power spectrogram.
    ///
    /// Args:
    ///   audio: waveform of shape (batch, samples) or (samples,)
    ///
    /// Returns:
    ///   F32 tensor of shape (batch, num_mels, frames)
    pub fn forward(&self, audio: &Tensor) -> Result<Tensor> {
        let audio = if audio.rank() == 1 {
            audio.unsqueeze(0)?
        } else {
            audio.clone()
        };
        let audio = audio.to_dtype(DType::F32)?;
        let (batch_size, num_samples) = audio.dims2()?;

        let padding = self.config.center_padding();
        if num_samples <= padding {
            candle_core::bail!(
                "waveform of {} samples is too short for centered framing (needs > {})",
                num_samples,
                padding
            );
        }

        let n_freqs = self.config.n_fft / 2 + 1;
        let mut mel_specs = Vec::with_capacity(batch_size);

        for b in 0..batch_size {
            let sample = audio.get(b)?.to_vec1::<f32>()?;
            let padded = reflect_pad(&sample, padding, padding);
            let power = self.power_spectrum(&padded);

            let n_frames = power.len();
            let mut power_data = vec![0.0f32; n_freqs * n_frames];
            for (frame_idx, frame) in power.iter().enumerate() {
                for (freq_idx, &p) in frame.iter().enumerate() {
                    power_data[freq_idx * n_frames + frame_idx] = p;
                }
            }

            let power = Tensor::from_vec(power_data, (n_freqs, n_frames), audio.device())?;
            // (num_mels, n_freqs) @ (n_freqs, n_frames)
            mel_specs.push(self.mel_basis.matmul(&power)?);
        }

        Tensor::stack(&mel_specs.iter().collect::<Vec<_>>(), 0)
    }

    /// Floored (and optionally log-compressed) mel energies.
    ///
    /// Computes `mel + 1e-6`, then `ln(x + 1e-6)` when `log_input` is set, so
    /// silent frames stay finite.
    pub fn log_energies(&self, audio: &Tensor, log_input: bool) -> Result<Tensor> {
        let energies = (self.forward(audio)? + ENERGY_FLOOR)?;
        if log_input {
            (energies + ENERGY_FLOOR)?.log()
        } else {
            Ok(energies)
        }
    }

    /// Power spectrum `|X|^2` of every centered frame.
    fn power_spectrum(&self, signal: &[f32]) -> Vec<Vec<f32>> {
        let n_fft = self.config.n_fft;
        let hop_size = self.config.hop_size;
        let win_size = self.config.win_size;
        let n_freqs = n_fft / 2 + 1;
        let num_frames = (signal.len() - n_fft) / hop_size + 1;
        let offset = (n_fft - win_size) / 2;

        let mut result = Vec::with_capacity(num_frames);
        let mut buffer: Vec<Complex<f32>> = vec![Complex::new(0.0, 0.0); n_fft];

        for frame_idx in 0..num_frames {
            let start = frame_idx * hop_size;

            buffer.fill(Complex::new(0.0, 0.0));
            for i in 0..win_size {
                buffer[offset + i] = Complex::new(signal[start + offset + i] * self.window[i], 0.0);
            }

            self.fft.process(&mut buffer);

            result.push(buffer[..n_freqs].iter().map(|c| c.norm_sqr()).collect());
        }

        result
    }
}

/// Periodic Hamming window: `0.54 - 0.46 * cos(2*pi*n/N)`.
fn create_hamming_window(size: usize) -> Vec<f32> {
    (0..size)
        .map(|n| {
            let x = 2.0 * std::f64::consts::PI * n as f64 / size as f64;
            (0.54 - 0.46 * x.cos()) as f32
        })
        .collect()
}

/// Apply reflection padding to a 1D signal.
fn reflect_pad(signal: &[f32], pad_left: usize, pad_right: usize) -> Vec<f32> {
    let n = signal.len();
    let mut padded = Vec::with_capacity(n + pad_left + pad_right);

    for i in (1..=pad_left).rev() {
        let idx = if i < n { i } else { n - 1 };
        padded.push(signal[idx]);
    }

    padded.extend_from_slice(signal);

    for i in 0..pad_right {
        let idx = if n >= 2 + i { n - 2 - i } else { 0 };
        padded.push(signal[idx]);
    }

    padded
}

fn hz_to_mel(hz: f64) -> f64 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f64) -> f64 {
    700.0 * (10f64.powf(mel / 2595.0) - 1.0)
}

/// Create an HTK-scale triangular mel filterbank without area normalization.
///
/// Returns `num_mels` rows of `n_fft / 2 + 1` weights.
pub fn create_mel_filterbank(
    n_fft: usize,
    num_mels: usize,
    sample_rate: usize,
    fmin: f64,
    fmax: Option<f64>,
) -> Vec<Vec<f32>> {
    let fmax = fmax.unwrap_or(sample_rate as f64 / 2.0);
    let n_freqs = n_fft / 2 + 1;

    let mel_min = hz_to_mel(fmin);
    let mel_max = hz_to_mel(fmax);

    let hz_points: Vec<f64> = (0..=num_mels + 1)
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f64 / (num_mels + 1) as f64))
        .collect();

    let fft_freqs: Vec<f64> = (0..n_freqs)
        .map(|i| i as f64 * (sample_rate as f64 / 2.0) / (n_freqs - 1) as f64)
        .collect();

    let mut filterbank = vec![vec![0.0f32; n_freqs]; num_mels];

    for (m, row) in filterbank.iter_mut().enumerate() {
        let f_left = hz_points[m];
        let f_center = hz_points[m + 1];
        let f_right = hz_points[m + 2];
        let lower_diff = f_center - f_left;
        let upper_diff = f_right - f_center;

        for (weight, &freq) in row.iter_mut().zip(fft_freqs.iter()) {
            let lower = if lower_diff > 0.0 {
                (freq - f_left) / lower_diff
            } else {
                0.0
            };
            let upper = if upper_diff > 0.0 {
                (f_right - freq) / upper_diff
            } else {
                0.0
            };
            *weight = lower.min(upper).max(0.0) as f32;
        }
    }

    filterbank
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hamming_window() {
        let window = create_hamming_window(4);
        assert_eq!(window.len(), 4);
        // Periodic Hamming: [0.08, 0.54, 1.0, 0.54]
        assert!((window[0] - 0.08).abs() < 1e-6);
        assert!((window[1] - 0.54).abs() < 1e-6);
        assert!((window[2] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_reflect_pad() {
        let signal = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let padded = reflect_pad(&signal, 2, 2);
        assert_eq!(padded, vec![3.0, 2.0, 1.0, 2.0, 3.0, 4.0, 5.0, 4.0, 3.0]);
    }

    #[test]
    fn test_htk_mel_scale() {
        assert!((hz_to_mel(700.0) - 2595.0 * 2f64.log10()).abs() < 1e-9);
        assert!((mel_to_hz(hz_to_mel(4321.0)) - 4321.0).abs() < 1e-6);
    }

    #[test]
    fn test_mel_filterbank_shape() {
        let filterbank = create_mel_filterbank(512, 40, 16000, 0.0, None);
        assert_eq!(filterbank.len(), 40);
        assert_eq!(filterbank[0].len(), 257);
        for row in &filterbank {
            assert!(row.iter().all(|&w| (0.0..=1.0).contains(&w)));
            assert!(row.iter().any(|&w| w > 0.0), "every band covers some bin");
        }
        // DC and Nyquist sit on the outer filter edges
        assert!(filterbank.iter().all(|row| row[0] == 0.0));
        assert!(filterbank.iter().all(|row| row[256] == 0.0));
    }

    #[test]
    fn test_frame_count() -> Result<()> {
        let device = Device::Cpu;
        let mel = MelSpectrogram::new(MelSpectrogramConfig::default(), &device)?;

        for &len in &[400usize, 16000, 16159, 32000, 32240] {
            let audio = Tensor::zeros((2, len), DType::F32, &device)?;
            let spec = mel.forward(&audio)?;
            assert_eq!(spec.dims(), &[2, 40, len / 160 + 1], "length {}", len);
            assert_eq!(mel.config().num_frames(len), len / 160 + 1);
        }
        Ok(())
    }

    #[test]
    fn test_short_waveform_rejected() -> Result<()> {
        let device = Device::Cpu;
        let mel = MelSpectrogram::new(MelSpectrogramConfig::default(), &device)?;
        let audio = Tensor::zeros(256, DType::F32, &device)?;
        assert!(mel.forward(&audio).is_err());
        Ok(())
    }

    #[test]
    fn test_silence_log_energies_are_finite() -> Result<()> {
        let device = Device::Cpu;
        let mel = MelSpectrogram::new(MelSpectrogramConfig::default(), &device)?;
        let audio = Tensor::zeros(32000, DType::F32, &device)?;

        let energies = mel.log_energies(&audio, true)?;
        let values = energies.flatten_all()?.to_vec1::<f32>()?;
        let expected = (2.0 * ENERGY_FLOOR).ln() as f32;
        assert!(values.iter().all(|v| (v - expected).abs() < 1e-4));

        let linear = mel.log_energies(&audio, false)?;
        let values = linear.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|&v| v > 0.0));
        Ok(())
    }

    #[test]
    fn test_sine_energy_lands_in_matching_band() -> Result<()> {
        let device = Device::Cpu;
        let mel = MelSpectrogram::new(MelSpectrogramConfig::default(), &device)?;
        let audio: Vec<f32> = (0..16000)
            .map(|i| (2.0 * std::f32::consts::PI * 1000.0 * i as f32 / 16000.0).sin())
            .collect();
        let audio = Tensor::from_vec(audio, 16000, &device)?;

        let spec = mel.forward(&audio)?;
        // Middle frame, away from the reflected edges
        let frame = spec.get(0)?.narrow(1, 50, 1)?.flatten_all()?.to_vec1::<f32>()?;
        let (peak, _) = frame
            .iter()
            .enumerate()
            .fold((0, f32::MIN), |(bi, bv), (i, &v)| if v > bv { (i, v) } else { (bi, bv) });
        assert!((12..=15).contains(&peak), "1 kHz peaked in band {}", peak);
        Ok(())
    }

    #[test]
    fn test_log_energies_match_reference_values() -> Result<()> {
        // 440 Hz + 3 kHz mixture, 1600 samples -> 11 frames. Expected values
        // follow torchaudio MelSpectrogram(16000, n_fft=512, win_length=400,
        // hop_length=160, hamming_window, n_mels=40) then ln(x + 1e-6 + 1e-6).
        let device = Device::Cpu;
        let mel = MelSpectrogram::new(MelSpectrogramConfig::default(), &device)?;
        let audio: Vec<f32> = (0..1600)
            .map(|n| {
                let t = n as f32 / 16000.0;
                0.5 * (2.0 * std::f32::consts::PI * 440.0 * t).sin()
                    + 0.25 * (2.0 * std::f32::consts::PI * 3000.0 * t).sin()
            })
            .collect();
        let audio = Tensor::from_vec(audio, 1600, &device)?;

        let spec = mel.log_energies(&audio, true)?.get(0)?;
        assert_eq!(spec.dims(), &[40, 11]);
        let spec = spec.to_vec2::<f32>()?;

        // (band, frame, value); frames 0 and 10 overlap the reflected edges
        let expected = [
            (0, 0, 3.89353),
            (6, 0, 7.39598),
            (26, 0, 6.73460),
            (39, 0, -0.30468),
            (7, 5, 8.24999),
            (25, 5, 2.67085),
            (26, 5, 7.03246),
            (0, 10, 3.78764),
            (26, 10, 7.01430),
            (30, 10, -0.03407),
        ];
        for (band, frame, value) in expected {
            let got = spec[band][frame];
            assert!(
                (got - value).abs() < 1e-2,
                "band {} frame {}: got {}, expected {}",
                band,
                frame,
                got,
                value
            );
        }
        Ok(())
    }
}
