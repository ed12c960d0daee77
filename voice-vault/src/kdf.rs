//! Key derivation from accepted voice features
//!
//! Feature values are quantized coarsely into bytes, folded into an N-byte
//! accumulator by a bespoke mixing step, and (by default) passed through
//! HKDF-SHA256. The fold is NOT a cryptographic hash; the HKDF finalizer is
//! what gives the output key its strength.

use crate::features::{FeatureKind, FeatureVector};
use chrono::{DateTime, Utc};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

/// Added to a byte equal to its left neighbour during the collision pass
const COLLISION_STEP: u8 = 73;

/// Accumulator lanes each quantized value is folded into
const FOLD_LANES: usize = 3;

/// Distance between lanes in the accumulator
const LANE_STRIDE: usize = 7;

#[derive(Error, Debug)]
pub enum KdfError {
    #[error("Feature vector has no values to derive a key from")]
    EmptyFeatures,

    #[error("Invalid KDF configuration: {0}")]
    InvalidConfig(String),

    #[error("Key expansion failed: {0}")]
    Expand(String),
}

/// Derived key length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyLength {
    Bits128,
    Bits256,
}

impl KeyLength {
    pub fn bytes(&self) -> usize {
        match self {
            KeyLength::Bits128 => 16,
            KeyLength::Bits256 => 32,
        }
    }
}

/// Final step applied to the folded bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KeyFinalizer {
    /// Use the bespoke fold as the key
    None,
    /// HKDF-SHA256 expand of the fold with the given info string
    HkdfSha256 { info: String },
}

impl Default for KeyFinalizer {
    fn default() -> Self {
        KeyFinalizer::HkdfSha256 {
            info: "voice-vault/key/v1".to_string(),
        }
    }
}

/// KDF configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfConfig {
    pub key_length: KeyLength,

    /// Quantization levels per feature value; fewer levels tolerate more variance
    pub levels: u16,

    /// Cepstral coefficients are mapped from [-bound, bound]
    pub cepstral_bound: f64,

    /// Centroids are mapped from [0, centroid_max_hz]
    pub centroid_max_hz: f64,

    pub finalizer: KeyFinalizer,
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            key_length: KeyLength::Bits128,
            levels: 8,
            cepstral_bound: 64.0,
            centroid_max_hz: 4000.0,
            finalizer: KeyFinalizer::default(),
        }
    }
}

impl KdfConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), KdfError> {
        if !(2..=256).contains(&self.levels) {
            return Err(KdfError::InvalidConfig(format!(
                "levels {} must be in 2..=256",
                self.levels
            )));
        }

        if !(self.cepstral_bound > 0.0 && self.centroid_max_hz > 0.0) {
            return Err(KdfError::InvalidConfig(
                "cepstral_bound and centroid_max_hz must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

/// Symmetric key derived from voice features
///
/// The bytes are zeroized on drop and never printed by `Debug`.
#[derive(Clone)]
pub struct DerivedKey {
    bytes: Zeroizing<Vec<u8>>,
    derived_at: DateTime<Utc>,
    feature_hash: Option<String>,
    enrollment_fingerprint: Option<String>,
}

impl DerivedKey {
    /// Wrap raw key bytes, stamped with the current time
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self::from_parts(bytes, Utc::now(), None, None)
    }

    pub fn from_parts(
        bytes: Vec<u8>,
        derived_at: DateTime<Utc>,
        feature_hash: Option<String>,
        enrollment_fingerprint: Option<String>,
    ) -> Self {
        Self {
            bytes: Zeroizing::new(bytes),
            derived_at,
            feature_hash,
            enrollment_fingerprint,
        }
    }

    /// Tag the key with the enrollment it was derived under
    pub fn with_enrollment_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.enrollment_fingerprint = Some(fingerprint.into());
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Integer array form used in the key sidecar
    pub fn key_array(&self) -> Vec<u8> {
        self.bytes.to_vec()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn derived_at(&self) -> DateTime<Utc> {
        self.derived_at
    }

    pub fn feature_hash(&self) -> Option<&str> {
        self.feature_hash.as_deref()
    }

    pub fn enrollment_fingerprint(&self) -> Option<&str> {
        self.enrollment_fingerprint.as_deref()
    }

    /// Constant-time comparison of the key bytes only
    pub fn same_bytes(&self, other: &DerivedKey) -> bool {
        self.bytes.len() == other.bytes.len() && bool::from(self.bytes.ct_eq(&other.bytes))
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hash_prefix = self.feature_hash.as_deref().map(|h| h.get(..12).unwrap_or(h));
        f.debug_struct("DerivedKey")
            .field("len", &self.bytes.len())
            .field("bytes", &"<redacted>")
            .field("derived_at", &self.derived_at)
            .field("feature_hash", &hash_prefix)
            .finish()
    }
}

/// Deterministic feature-to-key derivation
#[derive(Debug, Clone)]
pub struct KeyDerivationFunction {
    config: KdfConfig,
}

impl KeyDerivationFunction {
    pub fn new(config: KdfConfig) -> Result<Self, KdfError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Derive a key from an accepted feature vector
    ///
    /// The key bytes depend only on the features and the configuration.
    pub fn derive(&self, features: &FeatureVector) -> Result<DerivedKey, KdfError> {
        let quantized = Zeroizing::new(self.quantize(features)?);
        let length = self.config.key_length.bytes();
        let folded = Zeroizing::new(fold(&quantized, length));

        let bytes = match &self.config.finalizer {
            KeyFinalizer::None => folded.to_vec(),
            KeyFinalizer::HkdfSha256 { info } => {
                let hk = Hkdf::<Sha256>::new(None, &folded);
                let mut okm = vec![0u8; length];
                hk.expand(info.as_bytes(), &mut okm)
                    .map_err(|e| KdfError::Expand(e.to_string()))?;
                okm
            }
        };

        let feature_hash = hex::encode(Sha256::digest(quantized.as_slice()));

        debug!(
            "Derived {}-byte key from {} quantized values (features {})",
            length,
            quantized.len(),
            &feature_hash[..12]
        );

        Ok(DerivedKey::from_parts(
            bytes,
            Utc::now(),
            Some(feature_hash),
            None,
        ))
    }

    /// Quantize every feature value into one byte, in canonical field order
    pub fn quantize(&self, features: &FeatureVector) -> Result<Vec<u8>, KdfError> {
        let steps = f64::from(self.config.levels - 1);

        let quantized: Vec<u8> = features
            .iter()
            .flat_map(|(kind, value)| value.as_slice().iter().map(move |&v| (kind, v)))
            .map(|(kind, v)| {
                let unit = self.unit_value(kind, v);
                let level = (unit * steps).round();
                (level * 255.0 / steps).round() as u8
            })
            .collect();

        if quantized.is_empty() {
            return Err(KdfError::EmptyFeatures);
        }

        Ok(quantized)
    }

    pub fn config(&self) -> &KdfConfig {
        &self.config
    }

    /// Map a feature value onto [0, 1]
    fn unit_value(&self, kind: FeatureKind, value: f64) -> f64 {
        let unit = match kind {
            FeatureKind::SpectralProfile | FeatureKind::ZeroCrossingRate => value,
            FeatureKind::CepstralProfile => {
                (value + self.config.cepstral_bound) / (2.0 * self.config.cepstral_bound)
            }
            FeatureKind::Centroid => value / self.config.centroid_max_hz,
        };

        if unit.is_finite() {
            unit.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

/// Fold `values` into `length` bytes
///
/// Each value is index-weighted and XORed, bit-rotated by a position-dependent
/// offset, into several lanes of the accumulator. Adjacent equal bytes are
/// then perturbed.
fn fold(values: &[u8], length: usize) -> Vec<u8> {
    let mut acc = vec![0u8; length];

    for (i, &value) in values.iter().enumerate() {
        let weighted = ((usize::from(value) * 1000 + i) % 256) as u8;
        for lane in 0..FOLD_LANES {
            let pos = (i + lane * LANE_STRIDE) % length;
            let rotation = ((i + lane * 3) % 8) as u32;
            acc[pos] ^= weighted.rotate_left(rotation);
        }
    }

    for j in 1..acc.len() {
        if acc[j] == acc[j - 1] {
            acc[j] = acc[j].wrapping_add(COLLISION_STEP);
        }
    }

    acc
}
