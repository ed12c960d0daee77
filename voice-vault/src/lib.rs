//! Voice Vault - voice-authenticated key derivation and file encryption
//!
//! A voice sample is checked against an identity's enrolled templates; only
//! an accepted sample yields a key, and the key store decides which key
//! actually encrypts or decrypts:
//! - Feature extraction (spectral, cepstral, centroid, zero-crossing rate)
//! - Template enrollment and weighted similarity verification
//! - Deterministic key derivation with an HKDF finalizer
//! - Active key reconciliation across sessions
//! - AES-CFB8 artifacts with optional HMAC authentication

mod atomic;

pub mod audio_preprocessor;
pub mod cipher;
pub mod features;
pub mod kdf;
pub mod key_store;
pub mod templates;
pub mod vault;
pub mod verification;

pub use audio_preprocessor::{AudioError, AudioPreprocessor, AudioSample, Waveform, FEATURE_SAMPLE_RATE};
pub use cipher::{CipherConfig, CipherEngine, CipherError, CipherKind, EncryptedArtifact, IV_SIZE, TAG_SIZE};
pub use features::{ExtractorConfig, FeatureError, FeatureExtractor, FeatureKind, FeatureValue, FeatureVector};
pub use kdf::{DerivedKey, KdfConfig, KdfError, KeyDerivationFunction, KeyFinalizer, KeyLength};
pub use key_store::{
    ActiveKeyRecord, EqualityPolicy, FileKeyBackend, KeyConsistencyStore, KeyOperation,
    KeyRecordBackend, KeyStoreError, MemoryKeyBackend,
};
pub use templates::{Enrollment, ReferenceTemplate, TemplateError, TemplateStore};
pub use vault::{
    ArtifactDisposition, DecryptOutcome, EncryptOutcome, RejectionReason, VaultConfig, VaultError,
    VoiceVault,
};
pub use verification::{
    SimilarityResult, SimilarityWeights, VerificationConfig, VerificationEngine, VerificationError,
};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_vault=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        let _vault = VaultConfig::default();
        let _extractor = ExtractorConfig::default();
        let _cipher = CipherConfig::default();
        assert!(!VERSION.is_empty());
    }
}
