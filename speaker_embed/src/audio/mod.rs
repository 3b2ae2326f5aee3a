//! Audio input: decoding, resampling and log-mel features.

pub mod mel;
pub mod utils;

pub use mel::{MelSpectrogram, MelSpectrogramConfig};
pub use utils::{AudioData, load_audio, read_wav};
