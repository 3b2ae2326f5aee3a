//! Reading recordings into model-ready waveforms.
//!
//! WAV is always available through `hound`. Compressed formats (flac, mp3,
//! ogg, ...) and sample-rate conversion need the `audio-loading` feature.

use std::path::Path;

use candle_core::{Device, Tensor};

use crate::error::{Error, Result};

/// Decoded PCM.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioData {
    /// Interleaved samples in [-1, 1]
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: usize,
}

impl AudioData {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: usize) -> Self {
        Self {
            samples,
            sample_rate,
            channels: channels.max(1),
        }
    }

    /// Average the channels of every frame.
    pub fn to_mono(&self) -> Self {
        if self.channels == 1 {
            return self.clone();
        }
        let scale = 1.0 / self.channels as f32;
        let samples = self
            .samples
            .chunks_exact(self.channels)
            .map(|frame| frame.iter().sum::<f32>() * scale)
            .collect();
        Self::new(samples, self.sample_rate, 1)
    }

    /// Mono waveform as a `(samples,)` tensor.
    pub fn to_tensor(&self, device: &Device) -> candle_core::Result<Tensor> {
        let mono = self.to_mono();
        let len = mono.samples.len();
        Tensor::from_vec(mono.samples, len, device)
    }

    /// Samples per channel.
    pub fn num_frames(&self) -> usize {
        self.samples.len() / self.channels
    }

    pub fn duration_secs(&self) -> f32 {
        self.num_frames() as f32 / self.sample_rate as f32
    }
}

fn is_wav(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("wav"))
}

/// Read a WAV file, scaling integer PCM to [-1, 1].
pub fn read_wav(path: impl AsRef<Path>) -> Result<AudioData> {
    let path = path.as_ref();
    let audio_err = |e: hound::Error| Error::Audio(format!("{}: {}", path.display(), e));

    let mut reader = hound::WavReader::open(path).map_err(audio_err)?;
    let header = reader.spec();
    let samples = match header.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<std::result::Result<Vec<_>, _>>(),
        hound::SampleFormat::Int => {
            let full_scale = (1i64 << (header.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / full_scale))
                .collect()
        }
    }
    .map_err(audio_err)?;

    Ok(AudioData::new(
        samples,
        header.sample_rate,
        header.channels as usize,
    ))
}

/// Decode any container/codec symphonia knows about.
#[cfg(feature = "audio-loading")]
pub fn decode_file(path: impl AsRef<Path>) -> Result<AudioData> {
    use symphonia::core::audio::SampleBuffer;
    use symphonia::core::codecs::DecoderOptions;
    use symphonia::core::errors::Error as SymphoniaError;
    use symphonia::core::formats::FormatOptions;
    use symphonia::core::io::MediaSourceStream;
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;

    let path = path.as_ref();
    let audio_err = |e: SymphoniaError| Error::Audio(format!("{}: {}", path.display(), e));

    let source = MediaSourceStream::new(Box::new(std::fs::File::open(path)?), Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }
    let mut format = symphonia::default::get_probe()
        .format(
            &hint,
            source,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(audio_err)?
        .format;

    let track = format
        .default_track()
        .ok_or_else(|| Error::Audio(format!("{}: no audio track", path.display())))?;
    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| Error::Audio(format!("{}: unknown sample rate", path.display())))?;
    let channels = track.codec_params.channels.map_or(1, |c| c.count());
    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(audio_err)?;

    let mut samples = Vec::new();
    let mut buffer: Option<SampleBuffer<f32>> = None;
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) => return Err(audio_err(e)),
        };
        if packet.track_id() != track_id {
            continue;
        }
        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            // Corrupt packets are skipped
            Err(SymphoniaError::DecodeError(msg)) => {
                tracing::warn!(path = %path.display(), msg, "Skipping undecodable packet");
                continue;
            }
            Err(e) => return Err(audio_err(e)),
        };

        let needed = decoded.capacity();
        if buffer.as_ref().is_none_or(|b| b.capacity() < needed * channels) {
            buffer = Some(SampleBuffer::new(needed as u64, *decoded.spec()));
        }
        if let Some(buf) = buffer.as_mut() {
            buf.copy_interleaved_ref(decoded);
            samples.extend_from_slice(buf.samples());
        }
    }

    Ok(AudioData::new(samples, sample_rate, channels))
}

/// Convert mono or multi-channel audio to mono at `target_rate`.
#[cfg(feature = "audio-loading")]
pub fn resample(audio: &AudioData, target_rate: u32) -> Result<AudioData> {
    use rubato::{
        Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
    };

    let mono = audio.to_mono();
    if mono.sample_rate == target_rate || mono.samples.is_empty() {
        return Ok(AudioData::new(mono.samples, target_rate, 1));
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let ratio = target_rate as f64 / mono.sample_rate as f64;
    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, mono.samples.len(), 1)
        .map_err(|e| Error::Audio(format!("resampler setup failed: {}", e)))?;
    let mut output = resampler
        .process(&[mono.samples], None)
        .map_err(|e| Error::Audio(format!("resampling failed: {}", e)))?;

    tracing::debug!(
        from = audio.sample_rate,
        to = target_rate,
        "Resampled audio"
    );
    Ok(AudioData::new(output.pop().unwrap_or_default(), target_rate, 1))
}

/// Load a recording as mono audio at `target_rate`.
#[cfg(feature = "audio-loading")]
pub fn load_audio(path: impl AsRef<Path>, target_rate: u32) -> Result<AudioData> {
    let path = path.as_ref();
    let audio = if is_wav(path) {
        read_wav(path)?
    } else {
        decode_file(path)?
    };
    resample(&audio, target_rate)
}

/// Load a WAV recording as mono audio; its rate must already be `target_rate`.
#[cfg(not(feature = "audio-loading"))]
pub fn load_audio(path: impl AsRef<Path>, target_rate: u32) -> Result<AudioData> {
    let path = path.as_ref();
    if !is_wav(path) {
        return Err(Error::Audio(format!(
            "{}: only WAV is supported without the 'audio-loading' feature",
            path.display()
        )));
    }
    let audio = read_wav(path)?;
    if audio.sample_rate != target_rate {
        return Err(Error::Audio(format!(
            "{} is {} Hz, expected {} Hz; resampling needs the 'audio-loading' feature",
            path.display(),
            audio.sample_rate,
            target_rate
        )));
    }
    Ok(audio.to_mono())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(path: &Path, sample_rate: u32, channels: u16, samples: &[i16]) {
        let header = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, header).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_to_mono_averages_frames() {
        let stereo = AudioData::new(vec![0.5, -0.5, 0.8, -0.4, 0.3, -0.3], 16000, 2);
        let mono = stereo.to_mono();
        assert_eq!(mono.channels, 1);
        assert_eq!(mono.samples.len(), 3);
        assert!(mono.samples[0].abs() < 1e-6);
        assert!((mono.samples[1] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_duration_counts_frames() {
        assert!((AudioData::new(vec![0.0; 32000], 16000, 1).duration_secs() - 2.0).abs() < 1e-6);
        assert!((AudioData::new(vec![0.0; 32000], 16000, 2).duration_secs() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_to_tensor_is_mono() {
        let stereo = AudioData::new(vec![1.0, 0.0, 0.0, 1.0], 16000, 2);
        let t = stereo.to_tensor(&Device::Cpu).unwrap();
        assert_eq!(t.to_vec1::<f32>().unwrap(), vec![0.5, 0.5]);
    }

    #[test]
    fn test_read_wav_scales_int16() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_wav(&path, 16000, 1, &[0, 16384, -16384, 32767]);

        let audio = read_wav(&path).unwrap();
        assert_eq!(audio.sample_rate, 16000);
        assert_eq!(audio.samples.len(), 4);
        assert!((audio.samples[1] - 0.5).abs() < 1e-6);
        assert!((audio.samples[2] + 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_load_audio_downmixes_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        write_wav(&path, 16000, 2, &[16384, 0, 0, -16384]);

        let audio = load_audio(&path, 16000).unwrap();
        assert_eq!(audio.channels, 1);
        assert_eq!(audio.samples.len(), 2);
        assert!((audio.samples[0] - 0.25).abs() < 1e-6);
        assert!((audio.samples[1] + 0.25).abs() < 1e-6);
    }

    #[cfg(not(feature = "audio-loading"))]
    #[test]
    fn test_rate_mismatch_needs_resampling() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("8k.wav");
        write_wav(&path, 8000, 1, &[0; 80]);
        assert!(matches!(load_audio(&path, 16000), Err(Error::Audio(_))));
    }

    #[cfg(feature = "audio-loading")]
    #[test]
    fn test_resample_changes_length() {
        let audio = AudioData::new(vec![0.0; 8000], 8000, 1);
        let out = resample(&audio, 16000).unwrap();
        assert_eq!(out.sample_rate, 16000);
        assert!(!out.samples.is_empty());
    }
}
