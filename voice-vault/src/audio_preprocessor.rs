//! Audio preprocessing module
//!
//! Decodes recordings into mono waveforms, resamples them to the feature
//! extraction rate and normalizes them to unit peak.

use dasp::Sample;
use std::io::Read;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Sample rate used for feature extraction (22.05kHz)
pub const FEATURE_SAMPLE_RATE: u32 = 22_050;

/// Audio sample format (f32 normalized to -1.0 to 1.0)
pub type AudioSample = f32;

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Audio decode failed: {0}")]
    AudioDecode(String),

    #[error("Audio is empty or silent")]
    EmptyAudio,

    #[error("Invalid sample rate: {0} Hz (must be > 0)")]
    InvalidSampleRate(u32),

    #[error("Invalid channel count: {0} (must be > 0)")]
    InvalidChannelCount(u16),

    #[error("Resampling failed: {0}")]
    Resampling(String),
}

/// Single-channel waveform with its sample rate
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    samples: Vec<AudioSample>,
    sample_rate: u32,
}

impl Waveform {
    /// Create a mono waveform
    pub fn new(samples: Vec<AudioSample>, sample_rate: u32) -> Result<Self, AudioError> {
        if sample_rate == 0 {
            return Err(AudioError::InvalidSampleRate(sample_rate));
        }

        Ok(Self {
            samples,
            sample_rate,
        })
    }

    /// Create a mono waveform from interleaved multi-channel samples
    ///
    /// Channels are averaged frame by frame. A trailing partial frame is dropped.
    pub fn from_interleaved(
        samples: &[AudioSample],
        channels: u16,
        sample_rate: u32,
    ) -> Result<Self, AudioError> {
        if channels == 0 {
            return Err(AudioError::InvalidChannelCount(channels));
        }

        if channels == 1 {
            return Self::new(samples.to_vec(), sample_rate);
        }

        let width = channels as usize;
        if samples.len() % width != 0 {
            warn!(
                "Interleaved buffer length {} is not a multiple of {} channels, truncating",
                samples.len(),
                channels
            );
        }

        let mono = samples
            .chunks_exact(width)
            .map(|frame| frame.iter().sum::<f32>() / width as f32)
            .collect();

        Self::new(mono, sample_rate)
    }

    /// Decode a WAV file
    pub fn from_wav_file(path: impl AsRef<Path>) -> Result<Self, AudioError> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .map_err(|e| AudioError::AudioDecode(format!("{}: {}", path.display(), e)))?;

        debug!("Decoding WAV file {}", path.display());
        Self::from_wav_reader(std::io::BufReader::new(file))
    }

    /// Decode WAV data from any reader
    ///
    /// Supports 8/16/24/32-bit integer PCM and 32-bit float PCM.
    pub fn from_wav_reader<R: Read>(reader: R) -> Result<Self, AudioError> {
        let mut reader =
            hound::WavReader::new(reader).map_err(|e| AudioError::AudioDecode(e.to_string()))?;
        let spec = reader.spec();

        trace!(
            "WAV spec: {}Hz, {} channels, {} bits, {:?}",
            spec.sample_rate,
            spec.channels,
            spec.bits_per_sample,
            spec.sample_format
        );

        let interleaved: Vec<AudioSample> = match (spec.sample_format, spec.bits_per_sample) {
            (hound::SampleFormat::Float, 32) => reader
                .samples::<f32>()
                .collect::<Result<_, _>>()
                .map_err(|e| AudioError::AudioDecode(e.to_string()))?,
            (hound::SampleFormat::Int, 8) => reader
                .samples::<i8>()
                .map(|s| s.map(|v| v.to_sample::<f32>()))
                .collect::<Result<_, _>>()
                .map_err(|e| AudioError::AudioDecode(e.to_string()))?,
            (hound::SampleFormat::Int, 16) => reader
                .samples::<i16>()
                .map(|s| s.map(|v| v.to_sample::<f32>()))
                .collect::<Result<_, _>>()
                .map_err(|e| AudioError::AudioDecode(e.to_string()))?,
            (hound::SampleFormat::Int, bits @ (24 | 32)) => {
                let scale = (1u64 << (bits - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<_, _>>()
                    .map_err(|e| AudioError::AudioDecode(e.to_string()))?
            }
            (format, bits) => {
                return Err(AudioError::AudioDecode(format!(
                    "unsupported sample format {:?} with {} bits",
                    format, bits
                )))
            }
        };

        if interleaved.is_empty() {
            return Err(AudioError::EmptyAudio);
        }

        Self::from_interleaved(&interleaved, spec.channels, spec.sample_rate)
    }

    /// Write the waveform as 16-bit mono PCM
    pub fn to_wav_file(&self, path: impl AsRef<Path>) -> Result<(), AudioError> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut writer = hound::WavWriter::create(path.as_ref(), spec)
            .map_err(|e| AudioError::AudioDecode(e.to_string()))?;

        for sample in AudioPreprocessor::f32_to_i16(&self.samples) {
            writer
                .write_sample(sample)
                .map_err(|e| AudioError::AudioDecode(e.to_string()))?;
        }

        writer
            .finalize()
            .map_err(|e| AudioError::AudioDecode(e.to_string()))
    }

    pub fn samples(&self) -> &[AudioSample] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration in seconds
    pub fn duration_secs(&self) -> f32 {
        self.samples.len() as f32 / self.sample_rate as f32
    }
}

/// Audio preprocessor for feature extraction
#[derive(Debug, Clone)]
pub struct AudioPreprocessor {
    target_rate: u32,
}

impl AudioPreprocessor {
    /// Create a new preprocessor
    pub fn new(target_rate: u32) -> Result<Self, AudioError> {
        if target_rate == 0 {
            return Err(AudioError::InvalidSampleRate(target_rate));
        }

        Ok(Self { target_rate })
    }

    /// Process a waveform (full pipeline)
    ///
    /// Returns samples at the target rate scaled to unit peak. Fails with
    /// [`AudioError::EmptyAudio`] for zero-length or silent input.
    pub fn process(&self, waveform: &Waveform) -> Result<Vec<AudioSample>, AudioError> {
        if waveform.is_empty() {
            return Err(AudioError::EmptyAudio);
        }

        trace!("Processing {} input samples", waveform.len());

        let resampled = if waveform.sample_rate() != self.target_rate {
            self.resample(waveform.samples(), waveform.sample_rate())?
        } else {
            waveform.samples().to_vec()
        };

        let normalized = Self::normalize(&resampled)?;

        debug!(
            "Preprocessed {} samples @ {}Hz -> {} samples @ {}Hz",
            waveform.len(),
            waveform.sample_rate(),
            normalized.len(),
            self.target_rate
        );

        Ok(normalized)
    }

    /// Resample audio to the target sample rate
    fn resample(
        &self,
        samples: &[AudioSample],
        input_rate: u32,
    ) -> Result<Vec<AudioSample>, AudioError> {
        use rubato::{
            Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType,
            WindowFunction,
        };

        debug!("Resampling: {} Hz -> {} Hz", input_rate, self.target_rate);

        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };

        let mut resampler = SincFixedIn::<f32>::new(
            self.target_rate as f64 / input_rate as f64,
            2.0,
            params,
            samples.len(),
            1, // mono
        )
        .map_err(|e| AudioError::Resampling(e.to_string()))?;

        let input_waves = vec![samples.to_vec()];

        let mut output_waves = resampler
            .process(&input_waves, None)
            .map_err(|e| AudioError::Resampling(e.to_string()))?;

        Ok(output_waves.swap_remove(0))
    }

    /// Scale samples so the peak amplitude is exactly 1.0
    fn normalize(samples: &[AudioSample]) -> Result<Vec<AudioSample>, AudioError> {
        let peak = samples
            .iter()
            .map(|&s| s.abs())
            .fold(0.0f32, f32::max);

        if peak == 0.0 || !peak.is_finite() {
            debug!("Silent or non-finite audio detected (peak={})", peak);
            return Err(AudioError::EmptyAudio);
        }

        let scale = 1.0 / peak;
        trace!("Normalizing audio: peak={:.4}, scale={:.4}", peak, scale);

        Ok(samples.iter().map(|&s| s * scale).collect())
    }

    /// Convert f32 samples to i16 PCM
    pub fn f32_to_i16(samples: &[AudioSample]) -> Vec<i16> {
        samples
            .iter()
            .map(|&s| {
                let clamped = s.clamp(-1.0, 1.0);
                (clamped * i16::MAX as f32) as i16
            })
            .collect()
    }

    /// Get the target sample rate
    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn tone(frequency: f32, sample_rate: u32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| {
                let t = i as f32 / sample_rate as f32;
                0.4 * (2.0 * std::f32::consts::PI * frequency * t).sin()
            })
            .collect()
    }

    #[test]
    fn test_waveform_rejects_zero_rate() {
        assert!(matches!(
            Waveform::new(vec![0.1], 0),
            Err(AudioError::InvalidSampleRate(0))
        ));
    }

    #[test]
    fn test_stereo_downmix() {
        let stereo = vec![0.5, 0.3, 0.2, 0.4];
        let wave = Waveform::from_interleaved(&stereo, 2, 16000).unwrap();

        assert_eq!(wave.len(), 2);
        assert_relative_eq!(wave.samples()[0], 0.4, epsilon = 0.001);
        assert_relative_eq!(wave.samples()[1], 0.3, epsilon = 0.001);
    }

    #[test]
    fn test_downmix_zero_channels() {
        assert!(Waveform::from_interleaved(&[0.1, 0.2], 0, 16000).is_err());
    }

    #[test]
    fn test_normalize_to_unit_peak() {
        let normalized = AudioPreprocessor::normalize(&[0.25, -0.5, 0.1]).unwrap();

        let peak = normalized.iter().map(|s| s.abs()).fold(0.0f32, f32::max);
        assert_relative_eq!(peak, 1.0, epsilon = 1e-6);
        assert_relative_eq!(normalized[0], 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_silent_audio_is_empty() {
        let preprocessor = AudioPreprocessor::new(FEATURE_SAMPLE_RATE).unwrap();
        let silent = Waveform::new(vec![0.0; 1000], FEATURE_SAMPLE_RATE).unwrap();

        assert!(matches!(
            preprocessor.process(&silent),
            Err(AudioError::EmptyAudio)
        ));
    }

    #[test]
    fn test_zero_length_is_empty() {
        let preprocessor = AudioPreprocessor::new(FEATURE_SAMPLE_RATE).unwrap();
        let empty = Waveform::new(Vec::new(), FEATURE_SAMPLE_RATE).unwrap();

        assert!(matches!(
            preprocessor.process(&empty),
            Err(AudioError::EmptyAudio)
        ));
    }

    #[test]
    fn test_process_no_resampling_needed() {
        let preprocessor = AudioPreprocessor::new(FEATURE_SAMPLE_RATE).unwrap();
        let wave = Waveform::new(tone(440.0, FEATURE_SAMPLE_RATE, 4000), FEATURE_SAMPLE_RATE)
            .unwrap();

        let processed = preprocessor.process(&wave).unwrap();
        assert_eq!(processed.len(), 4000);
    }

    #[test]
    fn test_resample_downsampling() {
        // 44.1kHz -> 22.05kHz
        let preprocessor = AudioPreprocessor::new(FEATURE_SAMPLE_RATE).unwrap();
        let wave = Waveform::new(tone(440.0, 44_100, 44_100), 44_100).unwrap();

        let processed = preprocessor.process(&wave).unwrap();

        // Rubato's SincFixedIn may produce slightly different lengths
        let expected = 22_050i64;
        assert!(
            (processed.len() as i64 - expected).abs() < 500,
            "Expected ~{} samples, got {}",
            expected,
            processed.len()
        );
    }

    #[test]
    fn test_wav_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");

        let wave = Waveform::new(tone(440.0, 16000, 1600), 16000).unwrap();
        wave.to_wav_file(&path).unwrap();

        let decoded = Waveform::from_wav_file(&path).unwrap();
        assert_eq!(decoded.sample_rate(), 16000);
        assert_eq!(decoded.len(), 1600);
        for (a, b) in wave.samples().iter().zip(decoded.samples()) {
            assert_relative_eq!(*a, *b, epsilon = 0.001);
        }
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let garbage = b"definitely not a RIFF header".to_vec();
        let result = Waveform::from_wav_reader(std::io::Cursor::new(garbage));

        assert!(matches!(result, Err(AudioError::AudioDecode(_))));
    }

    #[test]
    fn test_f32_to_i16_clamping() {
        let i16_samples = AudioPreprocessor::f32_to_i16(&[1.5, -2.0, 0.0]);

        assert_eq!(i16_samples[0], i16::MAX);
        assert_eq!(i16_samples[1], -i16::MAX);
        assert_eq!(i16_samples[2], 0);
    }}
