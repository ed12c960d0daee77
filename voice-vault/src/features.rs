//! Voice feature extraction
//!
//! Turns a waveform into a fixed-shape [`FeatureVector`] so recordings of
//! different lengths can be compared directly:
//!
//! * `spectral_profile`: mean magnitude spectrum averaged into equal-width
//!   buckets across the voice band, scaled to a peak of 1.0.
//! * `cepstral_profile`: frame-averaged DCT of log mel-band energies (c0 dropped).
//! * `centroid`: spectral centroid of the voice band in Hz.
//! * `zero_crossing_rate`: sign changes per sample of the normalized waveform.

use crate::audio_preprocessor::{AudioError, AudioPreprocessor, Waveform, FEATURE_SAMPLE_RATE};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// Floor for mel-band energies before taking the log
const ENERGY_FLOOR: f64 = 1e-10;

#[derive(Error, Debug)]
pub enum FeatureError {
    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error("Invalid extractor configuration: {0}")]
    InvalidConfig(String),
}

/// Named feature field
///
/// Declaration order is the canonical order used whenever a feature vector
/// is flattened (serialization, key derivation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    SpectralProfile,
    CepstralProfile,
    Centroid,
    ZeroCrossingRate,
}

impl FeatureKind {
    pub const ALL: [FeatureKind; 4] = [
        FeatureKind::SpectralProfile,
        FeatureKind::CepstralProfile,
        FeatureKind::Centroid,
        FeatureKind::ZeroCrossingRate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureKind::SpectralProfile => "spectral_profile",
            FeatureKind::CepstralProfile => "cepstral_profile",
            FeatureKind::Centroid => "centroid",
            FeatureKind::ZeroCrossingRate => "zero_crossing_rate",
        }
    }
}

impl fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A feature field: either a fixed-length vector or a scalar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Vector(Vec<f64>),
    Scalar(f64),
}

impl FeatureValue {
    /// View the value as a slice (a scalar is a one-element slice)
    pub fn as_slice(&self) -> &[f64] {
        match self {
            FeatureValue::Vector(values) => values,
            FeatureValue::Scalar(value) => std::slice::from_ref(value),
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }
}

/// Immutable mapping from feature kind to value
///
/// Serializes as a field-named JSON object, e.g.
/// `{"spectral_profile": [...], "centroid": 812.4}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector {
    fields: BTreeMap<FeatureKind, FeatureValue>,
}

impl FeatureVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a vector field
    pub fn with_vector(mut self, kind: FeatureKind, values: Vec<f64>) -> Self {
        self.fields.insert(kind, FeatureValue::Vector(values));
        self
    }

    /// Add (or replace) a scalar field
    pub fn with_scalar(mut self, kind: FeatureKind, value: f64) -> Self {
        self.fields.insert(kind, FeatureValue::Scalar(value));
        self
    }

    pub fn get(&self, kind: FeatureKind) -> Option<&FeatureValue> {
        self.fields.get(&kind)
    }

    pub fn vector(&self, kind: FeatureKind) -> Option<&[f64]> {
        match self.fields.get(&kind) {
            Some(FeatureValue::Vector(values)) => Some(values),
            _ => None,
        }
    }

    pub fn scalar(&self, kind: FeatureKind) -> Option<f64> {
        match self.fields.get(&kind) {
            Some(FeatureValue::Scalar(value)) => Some(*value),
            _ => None,
        }
    }

    /// Fields in canonical order
    pub fn iter(&self) -> impl Iterator<Item = (FeatureKind, &FeatureValue)> + '_ {
        self.fields.iter().map(|(kind, value)| (*kind, value))
    }

    /// Number of named fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Total count of numeric values across all fields
    pub fn dimension(&self) -> usize {
        self.fields.values().map(FeatureValue::len).sum()
    }

    pub fn is_finite(&self) -> bool {
        self.fields
            .values()
            .all(|value| value.as_slice().iter().all(|v| v.is_finite()))
    }
}

/// Feature extractor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    /// Rate every waveform is resampled to before analysis
    pub target_sample_rate: u32,

    /// Analysis window length in samples
    pub frame_size: usize,

    /// Hop between analysis windows in samples
    pub hop_size: usize,

    /// Lower edge of the voice band (Hz)
    pub band_low_hz: f64,

    /// Upper edge of the voice band (Hz)
    pub band_high_hz: f64,

    /// Number of buckets in the spectral profile
    pub spectral_buckets: usize,

    /// Number of triangular mel filters across the voice band
    pub mel_filters: usize,

    /// Number of cepstral coefficients kept (c1..=cN)
    pub cepstral_coefficients: usize,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: FEATURE_SAMPLE_RATE,
            frame_size: 2048,         // ~93ms at 22.05kHz
            hop_size: 512,            // ~23ms at 22.05kHz
            band_low_hz: 300.0,
            band_high_hz: 3400.0,
            spectral_buckets: 24,
            mel_filters: 20,
            cepstral_coefficients: 13,
        }
    }
}

impl ExtractorConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), FeatureError> {
        if self.target_sample_rate == 0 {
            return Err(FeatureError::InvalidConfig(
                "target_sample_rate must be greater than 0".to_string(),
            ));
        }

        if self.frame_size < 2 || self.hop_size == 0 {
            return Err(FeatureError::InvalidConfig(
                "frame_size must be >= 2 and hop_size > 0".to_string(),
            ));
        }

        let nyquist = self.target_sample_rate as f64 / 2.0;
        if !(self.band_low_hz >= 0.0
            && self.band_low_hz < self.band_high_hz
            && self.band_high_hz <= nyquist)
        {
            return Err(FeatureError::InvalidConfig(format!(
                "voice band {}-{} Hz must be increasing and below Nyquist ({} Hz)",
                self.band_low_hz, self.band_high_hz, nyquist
            )));
        }

        if self.spectral_buckets == 0 {
            return Err(FeatureError::InvalidConfig(
                "spectral_buckets must be greater than 0".to_string(),
            ));
        }

        if self.cepstral_coefficients == 0 || self.cepstral_coefficients >= self.mel_filters {
            return Err(FeatureError::InvalidConfig(
                "cepstral_coefficients must be in 1..mel_filters".to_string(),
            ));
        }

        Ok(())
    }

    fn bin_hz(&self) -> f64 {
        self.target_sample_rate as f64 / self.frame_size as f64
    }
}

/// Extracts [`FeatureVector`]s from waveforms
///
/// Cheap to clone; the FFT plan is shared.
#[derive(Clone)]
pub struct FeatureExtractor {
    config: ExtractorConfig,
    preprocessor: AudioPreprocessor,
    fft: Arc<dyn Fft<f64>>,
    window: Vec<f64>,
    band_bins: Range<usize>,
    buckets: Vec<Range<usize>>,
    mel_bank: Vec<Vec<(usize, f64)>>,
}

impl fmt::Debug for FeatureExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureExtractor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl FeatureExtractor {
    /// Create a new extractor
    pub fn new(config: ExtractorConfig) -> Result<Self, FeatureError> {
        config.validate()?;

        debug!(
            "Creating feature extractor: {}Hz, frame={}, hop={}, band={}-{}Hz",
            config.target_sample_rate,
            config.frame_size,
            config.hop_size,
            config.band_low_hz,
            config.band_high_hz
        );

        let preprocessor = AudioPreprocessor::new(config.target_sample_rate)?;
        let fft = FftPlanner::<f64>::new().plan_fft_forward(config.frame_size);
        let window = hann_window(config.frame_size);

        let half = config.frame_size / 2 + 1;
        let bin_hz = config.bin_hz();
        let band_start = ((config.band_low_hz / bin_hz).ceil() as usize).min(half - 1);
        let band_end = ((config.band_high_hz / bin_hz).floor() as usize + 1).clamp(band_start + 1, half);

        let buckets = bucket_ranges(&config, half);
        let mel_bank = mel_filterbank(&config, half);

        Ok(Self {
            config,
            preprocessor,
            fft,
            window,
            band_bins: band_start..band_end,
            buckets,
            mel_bank,
        })
    }

    /// Extract features from a waveform
    ///
    /// Fails with [`AudioError::EmptyAudio`] (wrapped) for zero-length or
    /// silent input.
    pub fn extract(&self, waveform: &Waveform) -> Result<FeatureVector, FeatureError> {
        let samples = self.preprocessor.process(waveform)?;

        let frame_size = self.config.frame_size;
        let hop = self.config.hop_size;
        let half = frame_size / 2 + 1;
        let frame_count = if samples.len() <= frame_size {
            1
        } else {
            (samples.len() - frame_size) / hop + 1
        };

        trace!("Analysing {} frames of {} samples", frame_count, frame_size);

        let mut mean_magnitude = vec![0.0f64; half];
        let mut mean_cepstrum = vec![0.0f64; self.config.cepstral_coefficients];
        let mut log_mel = vec![0.0f64; self.mel_bank.len()];
        let mut buffer = vec![Complex::new(0.0f64, 0.0); frame_size];

        for frame in 0..frame_count {
            let offset = frame * hop;

            // Window, zero-padding past the end of the recording
            for (i, slot) in buffer.iter_mut().enumerate() {
                let sample = samples.get(offset + i).copied().unwrap_or(0.0) as f64;
                *slot = Complex::new(sample * self.window[i], 0.0);
            }

            self.fft.process(&mut buffer);

            for (acc, bin) in mean_magnitude.iter_mut().zip(&buffer) {
                *acc += bin.norm();
            }

            for (energy_log, filter) in log_mel.iter_mut().zip(&self.mel_bank) {
                let energy: f64 = filter
                    .iter()
                    .map(|&(bin, weight)| weight * buffer[bin].norm_sqr())
                    .sum();
                *energy_log = energy.max(ENERGY_FLOOR).ln();
            }

            for (c, acc) in mean_cepstrum.iter_mut().enumerate() {
                *acc += dct_coefficient(&log_mel, c + 1);
            }
        }

        let scale = 1.0 / frame_count as f64;
        mean_magnitude.iter_mut().for_each(|v| *v *= scale);
        mean_cepstrum.iter_mut().for_each(|v| *v *= scale);

        let spectral_profile = self.spectral_profile(&mean_magnitude);
        let centroid = self.centroid(&mean_magnitude);
        let zcr = zero_crossing_rate(&samples);

        debug!(
            "Extracted features: {} frames, centroid={:.1}Hz, zcr={:.4}",
            frame_count, centroid, zcr
        );

        Ok(FeatureVector::new()
            .with_vector(FeatureKind::SpectralProfile, spectral_profile)
            .with_vector(FeatureKind::CepstralProfile, mean_cepstrum)
            .with_scalar(FeatureKind::Centroid, centroid)
            .with_scalar(FeatureKind::ZeroCrossingRate, zcr))
    }

    /// Get extractor configuration
    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// Band-average the magnitude spectrum and scale it to a peak of 1.0
    fn spectral_profile(&self, magnitude: &[f64]) -> Vec<f64> {
        let mut profile: Vec<f64> = self
            .buckets
            .iter()
            .map(|range| {
                let bins = &magnitude[range.clone()];
                bins.iter().sum::<f64>() / bins.len() as f64
            })
            .collect();

        let peak = profile.iter().copied().fold(0.0f64, f64::max);
        if peak > 0.0 {
            profile.iter_mut().for_each(|v| *v /= peak);
        }

        profile
    }

    /// Magnitude-weighted mean frequency of the voice band
    fn centroid(&self, magnitude: &[f64]) -> f64 {
        let bin_hz = self.config.bin_hz();
        let (weighted, total) = self
            .band_bins
            .clone()
            .map(|k| (k as f64 * bin_hz * magnitude[k], magnitude[k]))
            .fold((0.0, 0.0), |(w, t), (wk, mk)| (w + wk, t + mk));

        if total > 0.0 {
            weighted / total
        } else {
            0.0
        }
    }
}

/// Calculate zero-crossing rate (ZCR)
///
/// Fraction of adjacent sample pairs whose signs differ.
fn zero_crossing_rate(samples: &[f32]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }

    let crossings = samples
        .windows(2)
        .filter(|pair| (pair[0] >= 0.0 && pair[1] < 0.0) || (pair[0] < 0.0 && pair[1] >= 0.0))
        .count();

    crossings as f64 / (samples.len() - 1) as f64
}

fn hann_window(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f64 / n as f64).cos()))
        .collect()
}

/// DCT-II coefficient `k` of `values`
fn dct_coefficient(values: &[f64], k: usize) -> f64 {
    let n = values.len() as f64;
    values
        .iter()
        .enumerate()
        .map(|(m, &v)| v * (PI * k as f64 * (m as f64 + 0.5) / n).cos())
        .sum()
}

/// FFT bin ranges for each spectral bucket; every bucket holds at least one bin
fn bucket_ranges(config: &ExtractorConfig, half: usize) -> Vec<Range<usize>> {
    let bin_hz = config.bin_hz();
    let width = (config.band_high_hz - config.band_low_hz) / config.spectral_buckets as f64;

    (0..config.spectral_buckets)
        .map(|b| {
            let low = config.band_low_hz + b as f64 * width;
            let start = ((low / bin_hz).ceil() as usize).min(half - 1);
            let end = (((low + width) / bin_hz).ceil() as usize).clamp(start + 1, half);
            start..end
        })
        .collect()
}

fn hz_to_mel(hz: f64) -> f64 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f64) -> f64 {
    700.0 * (10.0_f64.powf(mel / 2595.0) - 1.0)
}

/// Sparse triangular mel filterbank over the voice band
fn mel_filterbank(config: &ExtractorConfig, half: usize) -> Vec<Vec<(usize, f64)>> {
    let bin_hz = config.bin_hz();
    let mel_low = hz_to_mel(config.band_low_hz);
    let mel_high = hz_to_mel(config.band_high_hz);
    let count = config.mel_filters;

    let bins: Vec<usize> = (0..count + 2)
        .map(|i| {
            let mel = mel_low + i as f64 * (mel_high - mel_low) / (count + 1) as f64;
            ((mel_to_hz(mel) / bin_hz).floor() as usize).min(half - 1)
        })
        .collect();

    (0..count)
        .map(|m| {
            let (left, center, right) = (bins[m], bins[m + 1], bins[m + 2]);
            let mut filter = Vec::new();

            if center > left {
                for k in left..center {
                    filter.push((k, (k - left) as f64 / (center - left) as f64));
                }
            }
            filter.push((center, 1.0));
            if right > center {
                for k in center + 1..=right {
                    filter.push((k, (right - k) as f64 / (right - center) as f64));
                }
            }

            filter
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn harmonic_tone(fundamental: f32, seconds: f32) -> Waveform {
        let rate = FEATURE_SAMPLE_RATE;
        let samples = (0..(rate as f32 * seconds) as usize)
            .map(|i| {
                let t = i as f32 / rate as f32;
                [1.0f32, 0.5, 0.3]
                    .iter()
                    .enumerate()
                    .map(|(h, amp)| {
                        amp * (2.0 * std::f32::consts::PI * fundamental * (h + 1) as f32 * t).sin()
                    })
                    .sum::<f32>()
            })
            .collect();
        Waveform::new(samples, rate).unwrap()
    }

    #[test]
    fn test_config_default_is_valid() {
        let config = ExtractorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.spectral_buckets, 24);
    }

    #[test]
    fn test_config_validation() {
        let mut config = ExtractorConfig::default();
        config.band_high_hz = 20_000.0;
        assert!(config.validate().is_err());

        let mut config = ExtractorConfig::default();
        config.cepstral_coefficients = config.mel_filters;
        assert!(config.validate().is_err());

        let mut config = ExtractorConfig::default();
        config.hop_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_feature_shape_is_fixed() {
        let extractor = FeatureExtractor::new(ExtractorConfig::default()).unwrap();

        let short = extractor.extract(&harmonic_tone(440.0, 0.5)).unwrap();
        let long = extractor.extract(&harmonic_tone(440.0, 2.0)).unwrap();

        for features in [&short, &long] {
            assert_eq!(features.vector(FeatureKind::SpectralProfile).unwrap().len(), 24);
            assert_eq!(features.vector(FeatureKind::CepstralProfile).unwrap().len(), 13);
            assert!(features.scalar(FeatureKind::Centroid).is_some());
            assert!(features.scalar(FeatureKind::ZeroCrossingRate).is_some());
            assert!(features.is_finite());
        }
        assert_eq!(short.dimension(), long.dimension());
    }

    #[test]
    fn test_recording_shorter_than_frame() {
        let extractor = FeatureExtractor::new(ExtractorConfig::default()).unwrap();
        let features = extractor.extract(&harmonic_tone(440.0, 0.05)).unwrap();

        assert_eq!(features.dimension(), 24 + 13 + 2);
    }

    #[test]
    fn test_spectral_profile_peaks_at_fundamental() {
        let extractor = FeatureExtractor::new(ExtractorConfig::default()).unwrap();
        let features = extractor.extract(&harmonic_tone(440.0, 1.0)).unwrap();
        let profile = features.vector(FeatureKind::SpectralProfile).unwrap();

        // 440Hz falls in the second 129Hz-wide bucket above 300Hz
        let peak_bucket = profile
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak_bucket, 1);
        assert_relative_eq!(profile[1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_centroid_tracks_pitch() {
        let extractor = FeatureExtractor::new(ExtractorConfig::default()).unwrap();

        let low = extractor.extract(&harmonic_tone(400.0, 1.0)).unwrap();
        let high = extractor.extract(&harmonic_tone(900.0, 1.0)).unwrap();

        assert!(
            low.scalar(FeatureKind::Centroid).unwrap()
                < high.scalar(FeatureKind::Centroid).unwrap()
        );
    }

    #[test]
    fn test_silent_waveform_fails() {
        let extractor = FeatureExtractor::new(ExtractorConfig::default()).unwrap();
        let silent = Waveform::new(vec![0.0; 4096], FEATURE_SAMPLE_RATE).unwrap();

        assert!(matches!(
            extractor.extract(&silent),
            Err(FeatureError::Audio(AudioError::EmptyAudio))
        ));
    }

    #[test]
    fn test_zero_crossing_rate() {
        assert_relative_eq!(zero_crossing_rate(&[0.0; 10]), 0.0);
        assert_relative_eq!(zero_crossing_rate(&[1.0, -1.0, 1.0, -1.0, 1.0]), 1.0);
        assert_relative_eq!(zero_crossing_rate(&[1.0]), 0.0);
    }

    #[test]
    fn test_feature_vector_json_shape() {
        let features = FeatureVector::new()
            .with_vector(FeatureKind::SpectralProfile, vec![0.5, 1.0])
            .with_scalar(FeatureKind::Centroid, 812.5);

        let json = serde_json::to_value(&features).unwrap();
        assert_eq!(json["spectral_profile"], serde_json::json!([0.5, 1.0]));
        assert_eq!(json["centroid"], serde_json::json!(812.5));

        let back: FeatureVector = serde_json::from_value(json).unwrap();
        assert_eq!(back, features);
    }

    #[test]
    fn test_dct_of_constant_has_no_ac_energy() {
        let flat = vec![3.0; 20];
        for k in 1..13 {
            assert!(dct_coefficient(&flat, k).abs() < 1e-9);
        }
    }

    #[test]
    fn test_mel_filters_cover_band() {
        let config = ExtractorConfig::default();
        let bank = mel_filterbank(&config, config.frame_size / 2 + 1);

        assert_eq!(bank.len(), config.mel_filters);
        assert!(bank.iter().all(|filter| !filter.is_empty()));
    }
}
