//! Voice vault facade
//!
//! Wires the pipeline together: audio -> features -> verification against the
//! enrolled templates -> key derivation -> key reconciliation -> cipher.
//! Each operation returns a tagged outcome; a rejected voice is an outcome,
//! not an error.

use crate::audio_preprocessor::{AudioError, Waveform};
use crate::cipher::{CipherConfig, CipherEngine, CipherError, CipherKind};
use crate::features::{ExtractorConfig, FeatureError, FeatureExtractor};
use crate::kdf::{DerivedKey, KdfConfig, KdfError, KeyDerivationFunction};
use crate::key_store::{
    EqualityPolicy, KeyConsistencyStore, KeyOperation, KeyRecordBackend, KeyStoreError,
};
use crate::templates::{ReferenceTemplate, TemplateError, TemplateStore};
use crate::verification::{
    SimilarityResult, VerificationConfig, VerificationEngine, VerificationError,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

const ARTIFACT_EXTENSION: &str = "enc";
const DECRYPTED_EXTENSION: &str = "dec";

#[derive(Error, Debug)]
pub enum VaultError {
    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error(transparent)]
    Feature(#[from] FeatureError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error(transparent)]
    Kdf(#[from] KdfError),

    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    #[error(transparent)]
    Cipher(#[from] CipherError),

    #[error("Invalid vault configuration: {0}")]
    Config(String),

    #[error("Decrypt output {0} is the artifact itself")]
    OutputIsArtifact(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Config file error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl VaultError {
    /// The voice was accepted but its key is not the active key
    pub fn is_key_mismatch(&self) -> bool {
        matches!(self, VaultError::KeyStore(KeyStoreError::KeyMismatch(_)))
    }
}

/// Complete vault configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Holds `templates/` and `keys/`
    pub data_dir: PathBuf,
    pub extractor: ExtractorConfig,
    pub verification: VerificationConfig,
    pub kdf: KdfConfig,
    pub cipher: CipherConfig,
    pub key_equality: EqualityPolicy,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("voice-vault-data"),
            extractor: ExtractorConfig::default(),
            verification: VerificationConfig::default(),
            kdf: KdfConfig::default(),
            cipher: CipherConfig::default(),
            key_equality: EqualityPolicy::default(),
        }
    }
}

impl VaultConfig {
    /// Defaults overridden by `VOICE_VAULT_*` environment variables
    pub fn from_env() -> Result<Self, VaultError> {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("VOICE_VAULT_DATA_DIR") {
            config.data_dir = dir.into();
        }

        if let Ok(threshold) = std::env::var("VOICE_VAULT_THRESHOLD") {
            config.verification.threshold = threshold.parse().map_err(|_| {
                VaultError::Config(format!("VOICE_VAULT_THRESHOLD '{}' is not a number", threshold))
            })?;
        }

        if let Ok(cipher) = std::env::var("VOICE_VAULT_CIPHER") {
            config.set_cipher_kind(cipher.parse()?);
        }

        if let Ok(authenticate) = std::env::var("VOICE_VAULT_AUTHENTICATE") {
            config.cipher.authenticate = authenticate.parse().map_err(|_| {
                VaultError::Config(format!(
                    "VOICE_VAULT_AUTHENTICATE '{}' must be true or false",
                    authenticate
                ))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, VaultError> {
        let config: Self = serde_json::from_slice(&fs::read(path)?)?;
        config.validate()?;
        Ok(config)
    }

    /// Select a cipher and the matching key length
    pub fn set_cipher_kind(&mut self, kind: CipherKind) {
        self.cipher.kind = kind;
        self.kdf.key_length = kind.key_length();
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), VaultError> {
        self.extractor.validate()?;
        self.verification.validate()?;
        self.kdf.validate()?;

        if self.kdf.key_length != self.cipher.kind.key_length() {
            return Err(VaultError::Config(format!(
                "KDF key length {:?} does not fit cipher {:?}",
                self.kdf.key_length, self.cipher.kind
            )));
        }

        Ok(())
    }
}

/// Why a voice sample was not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    /// No template scored above the threshold
    BestScoreBelowThreshold,
    /// The best score passed but the mean across templates did not
    MeanScoreBelowThreshold,
}

impl RejectionReason {
    fn from_result(result: &SimilarityResult) -> Self {
        if result.max_similarity > result.threshold {
            RejectionReason::MeanScoreBelowThreshold
        } else {
            RejectionReason::BestScoreBelowThreshold
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EncryptOutcome {
    Accepted {
        similarity: SimilarityResult,
        artifact: PathBuf,
    },
    Rejected {
        similarity: SimilarityResult,
        reason: RejectionReason,
    },
}

impl EncryptOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, EncryptOutcome::Accepted { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecryptOutcome {
    Accepted {
        similarity: SimilarityResult,
        output: PathBuf,
    },
    Rejected {
        similarity: SimilarityResult,
        reason: RejectionReason,
    },
}

impl DecryptOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, DecryptOutcome::Accepted { .. })
    }
}

/// What to do with an artifact after a successful decrypt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArtifactDisposition {
    #[default]
    Keep,
    Remove,
}

enum Authorization {
    Granted {
        similarity: SimilarityResult,
        key: DerivedKey,
    },
    Denied {
        similarity: SimilarityResult,
        reason: RejectionReason,
    },
}

/// Voice-authenticated file encryption
#[derive(Debug)]
pub struct VoiceVault {
    config: VaultConfig,
    templates: TemplateStore,
    verifier: VerificationEngine,
    kdf: KeyDerivationFunction,
    keys: KeyConsistencyStore,
    cipher: CipherEngine,
}

impl VoiceVault {
    /// Open a vault with file-backed templates and keys under `config.data_dir`
    pub fn new(config: VaultConfig) -> Result<Self, VaultError> {
        let keys = KeyConsistencyStore::file(
            config.data_dir.join("keys"),
            config.key_equality.clone(),
        );
        Self::with_key_store(config, keys)
    }

    /// Open a vault whose active keys live in a custom backend
    pub fn with_key_backend(
        config: VaultConfig,
        backend: impl KeyRecordBackend + 'static,
    ) -> Result<Self, VaultError> {
        let keys = KeyConsistencyStore::new(backend, config.key_equality.clone());
        Self::with_key_store(config, keys)
    }

    fn with_key_store(config: VaultConfig, keys: KeyConsistencyStore) -> Result<Self, VaultError> {
        config.validate()?;

        let extractor = FeatureExtractor::new(config.extractor.clone())?;
        let templates = TemplateStore::new(config.data_dir.join("templates"), extractor);
        let verifier = VerificationEngine::new(config.verification.clone())?;
        let kdf = KeyDerivationFunction::new(config.kdf.clone())?;
        let cipher = CipherEngine::new(config.cipher.clone());

        info!(
            "Voice vault opened at {} ({:?}, threshold {})",
            config.data_dir.display(),
            config.cipher.kind,
            config.verification.threshold
        );

        Ok(Self {
            config,
            templates,
            verifier,
            kdf,
            keys,
            cipher,
        })
    }

    /// Replace the identity's enrollment with templates from `samples`
    pub fn enroll(
        &self,
        identity: &str,
        samples: &[Waveform],
    ) -> Result<Vec<ReferenceTemplate>, VaultError> {
        Ok(self.templates.enroll(identity, samples)?)
    }

    /// Enroll from WAV recordings, taken in path order
    pub fn enroll_wav_files<P: AsRef<Path>>(
        &self,
        identity: &str,
        paths: &[P],
    ) -> Result<Vec<ReferenceTemplate>, VaultError> {
        let mut paths: Vec<&Path> = paths.iter().map(|p| p.as_ref()).collect();
        paths.sort();

        let samples = paths
            .iter()
            .map(Waveform::from_wav_file)
            .collect::<Result<Vec<_>, _>>()?;

        self.enroll(identity, &samples)
    }

    /// Score a voice sample against the identity's enrollment
    pub fn verify(&self, identity: &str, voice: &Waveform) -> Result<SimilarityResult, VaultError> {
        let candidate = self.templates.extractor().extract(voice)?;
        Ok(self
            .verifier
            .verify_enrolled(&self.templates, identity, &candidate)?)
    }

    /// Encrypt `input` into `output` if `voice` is accepted
    ///
    /// The derived key is reconciled against the active key first, so an
    /// accepted voice from the same enrollment keeps encrypting under one key.
    pub fn encrypt_file(
        &self,
        identity: &str,
        voice: &Waveform,
        input: impl AsRef<Path>,
        output: impl AsRef<Path>,
    ) -> Result<EncryptOutcome, VaultError> {
        let (similarity, candidate) = match self.authorize(identity, voice)? {
            Authorization::Granted { similarity, key } => (similarity, key),
            Authorization::Denied { similarity, reason } => {
                return Ok(EncryptOutcome::Rejected { similarity, reason })
            }
        };

        let key = self
            .keys
            .reconcile(identity, candidate, KeyOperation::Encrypt)?;
        self.cipher
            .encrypt_file(input.as_ref(), output.as_ref(), key.as_bytes())?;

        Ok(EncryptOutcome::Accepted {
            similarity,
            artifact: output.as_ref().to_path_buf(),
        })
    }

    /// Decrypt `artifact` into `output` if `voice` is accepted
    ///
    /// Decryption uses the stored active key; a derived key that is not equal
    /// to it fails with a key mismatch and leaves the artifact untouched.
    pub fn decrypt_file(
        &self,
        identity: &str,
        voice: &Waveform,
        artifact: impl AsRef<Path>,
        output: impl AsRef<Path>,
        disposition: ArtifactDisposition,
    ) -> Result<DecryptOutcome, VaultError> {
        let artifact = artifact.as_ref();
        let output = output.as_ref();
        if same_file(artifact, output)? {
            return Err(VaultError::OutputIsArtifact(output.to_path_buf()));
        }

        let (similarity, candidate) = match self.authorize(identity, voice)? {
            Authorization::Granted { similarity, key } => (similarity, key),
            Authorization::Denied { similarity, reason } => {
                return Ok(DecryptOutcome::Rejected { similarity, reason })
            }
        };

        let key = self.keys.check_for_decrypt(identity, &candidate)?;
        self.cipher.decrypt_file(artifact, output, key.as_bytes())?;

        if disposition == ArtifactDisposition::Remove {
            fs::remove_file(artifact)?;
            debug!("Removed artifact {}", artifact.display());
        }

        Ok(DecryptOutcome::Accepted {
            similarity,
            output: output.to_path_buf(),
        })
    }

    /// Encrypted artifacts (`*.enc`) in `dir`, sorted by path
    pub fn list_artifacts(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>, VaultError> {
        let mut artifacts: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file()
                    && path.extension().and_then(|e| e.to_str()) == Some(ARTIFACT_EXTENSION)
            })
            .collect();
        artifacts.sort();

        Ok(artifacts)
    }

    /// `notes.txt` -> `notes.txt.enc`
    pub fn default_artifact_path(input: impl AsRef<Path>) -> PathBuf {
        let mut name = input.as_ref().as_os_str().to_owned();
        name.push(".");
        name.push(ARTIFACT_EXTENSION);
        PathBuf::from(name)
    }

    /// `notes.txt.enc` -> `notes.txt.dec`
    pub fn default_decrypted_path(artifact: impl AsRef<Path>) -> PathBuf {
        let artifact = artifact.as_ref();
        if artifact.extension().and_then(|e| e.to_str()) == Some(ARTIFACT_EXTENSION) {
            artifact.with_extension(DECRYPTED_EXTENSION)
        } else {
            let mut name = artifact.as_os_str().to_owned();
            name.push(".");
            name.push(DECRYPTED_EXTENSION);
            PathBuf::from(name)
        }
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn templates(&self) -> &TemplateStore {
        &self.templates
    }

    pub fn keys(&self) -> &KeyConsistencyStore {
        &self.keys
    }

    pub fn cipher(&self) -> &CipherEngine {
        &self.cipher
    }

    /// Verify the voice and, if accepted, derive its key tagged with the enrollment
    fn authorize(&self, identity: &str, voice: &Waveform) -> Result<Authorization, VaultError> {
        let enrollment = match self.templates.load_enrollment(identity) {
            Ok(enrollment) => enrollment,
            Err(TemplateError::NoEnrollment(id)) => {
                return Err(VerificationError::NoReferences(id).into())
            }
            Err(e) => return Err(e.into()),
        };

        let candidate = self.templates.extractor().extract(voice)?;
        let similarity = self
            .verifier
            .verify(identity, &enrollment.templates, &candidate)?;

        if !similarity.matches {
            let reason = RejectionReason::from_result(&similarity);
            warn!("Access denied for '{}': {:?}", identity, reason);
            return Ok(Authorization::Denied { similarity, reason });
        }

        let key = self
            .kdf
            .derive(&candidate)?
            .with_enrollment_fingerprint(enrollment.fingerprint);

        Ok(Authorization::Granted { similarity, key })
    }
}

/// Whether both paths resolve to one existing file
fn same_file(a: &Path, b: &Path) -> Result<bool, VaultError> {
    if !a.exists() || !b.exists() {
        return Ok(false);
    }
    Ok(fs::canonicalize(a)? == fs::canonicalize(b)?)
}
