//! Reference template storage
//!
//! Each identity owns a directory of `reference_NNN.json` records, one per
//! enrollment sample. Enrollment always replaces the whole set.

use crate::audio_preprocessor::Waveform;
use crate::features::{FeatureError, FeatureExtractor, FeatureVector};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("No enrollment found for identity '{0}'")]
    NoEnrollment(String),

    #[error("Invalid identity '{0}' (allowed: A-Z, a-z, 0-9, '_', '-')")]
    InvalidIdentity(String),

    #[error("Enrollment requires at least one sample")]
    EmptyEnrollment,

    #[error("Feature extraction failed: {0}")]
    Feature(#[from] FeatureError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Template serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One stored enrollment sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceTemplate {
    pub identity: String,
    /// 1-based ordinal within the enrollment
    pub index: usize,
    pub features: FeatureVector,
}

/// The full template set of an identity plus a fingerprint of its stored bytes
#[derive(Debug, Clone)]
pub struct Enrollment {
    pub templates: Vec<ReferenceTemplate>,
    /// Hex SHA-256 over the template files in ordinal order
    pub fingerprint: String,
}

/// Identity labels double as directory names
pub fn is_valid_identity(identity: &str) -> bool {
    !identity.is_empty()
        && identity
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn template_file_name(index: usize) -> String {
    format!("reference_{:03}.json", index)
}

fn is_template_file(name: &str) -> bool {
    name.starts_with("reference_") && name.ends_with(".json")
}

/// JSON-on-disk template store
#[derive(Debug, Clone)]
pub struct TemplateStore {
    root: PathBuf,
    extractor: FeatureExtractor,
}

impl TemplateStore {
    /// Create a store rooted at `root` (one subdirectory per identity)
    pub fn new(root: impl Into<PathBuf>, extractor: FeatureExtractor) -> Self {
        Self {
            root: root.into(),
            extractor,
        }
    }

    /// Extract features from every sample and replace the identity's templates
    ///
    /// All samples are extracted before anything is written, so a bad
    /// recording leaves the previous enrollment in place.
    pub fn enroll(
        &self,
        identity: &str,
        waveforms: &[Waveform],
    ) -> Result<Vec<ReferenceTemplate>, TemplateError> {
        self.check_identity(identity)?;
        if waveforms.is_empty() {
            return Err(TemplateError::EmptyEnrollment);
        }

        let features = waveforms
            .iter()
            .map(|w| self.extractor.extract(w))
            .collect::<Result<Vec<_>, _>>()?;

        self.save(identity, features)
    }

    /// Replace the identity's templates with the given feature vectors
    pub fn save(
        &self,
        identity: &str,
        features: Vec<FeatureVector>,
    ) -> Result<Vec<ReferenceTemplate>, TemplateError> {
        self.check_identity(identity)?;
        if features.is_empty() {
            return Err(TemplateError::EmptyEnrollment);
        }

        fs::create_dir_all(&self.root)?;

        let staging = self.root.join(format!(".{}.staging", identity));
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        let templates: Vec<ReferenceTemplate> = features
            .into_iter()
            .enumerate()
            .map(|(i, features)| ReferenceTemplate {
                identity: identity.to_string(),
                index: i + 1,
                features,
            })
            .collect();

        for template in &templates {
            let json = serde_json::to_vec_pretty(template)?;
            fs::write(staging.join(template_file_name(template.index)), json)?;
        }

        let live = self.identity_dir(identity);
        let retired = self.root.join(format!(".{}.retired", identity));
        if retired.exists() {
            fs::remove_dir_all(&retired)?;
        }
        if live.exists() {
            fs::rename(&live, &retired)?;
        }
        fs::rename(&staging, &live)?;
        if retired.exists() {
            fs::remove_dir_all(&retired)?;
        }

        info!(
            "Enrolled identity '{}' with {} reference templates",
            identity,
            templates.len()
        );

        Ok(templates)
    }

    /// Load the identity's templates in ordinal order
    pub fn load(&self, identity: &str) -> Result<Vec<ReferenceTemplate>, TemplateError> {
        Ok(self.load_enrollment(identity)?.templates)
    }

    /// Load templates together with the fingerprint of their stored bytes
    pub fn load_enrollment(&self, identity: &str) -> Result<Enrollment, TemplateError> {
        self.check_identity(identity)?;

        let dir = self.identity_dir(identity);
        let mut files = match fs::read_dir(&dir) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| {
                    path.file_name()
                        .and_then(|n| n.to_str())
                        .map(is_template_file)
                        .unwrap_or(false)
                })
                .collect::<Vec<_>>(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        if files.is_empty() {
            return Err(TemplateError::NoEnrollment(identity.to_string()));
        }

        // Zero-padded names sort in ordinal order
        files.sort();

        let mut hasher = Sha256::new();
        let mut templates = Vec::with_capacity(files.len());
        for path in &files {
            let bytes = fs::read(path)?;
            hasher.update(&bytes);
            templates.push(serde_json::from_slice::<ReferenceTemplate>(&bytes)?);
        }
        templates.sort_by_key(|t| t.index);

        debug!("Loaded {} templates for '{}'", templates.len(), identity);

        Ok(Enrollment {
            templates,
            fingerprint: hex::encode(hasher.finalize()),
        })
    }

    pub fn is_enrolled(&self, identity: &str) -> bool {
        self.load_enrollment(identity).is_ok()
    }

    /// Delete the identity's templates; returns whether any existed
    pub fn remove(&self, identity: &str) -> Result<bool, TemplateError> {
        self.check_identity(identity)?;

        let dir = self.identity_dir(identity);
        if !dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&dir)?;
        info!("Removed enrollment for '{}'", identity);
        Ok(true)
    }

    /// Enrolled identities, sorted
    pub fn identities(&self) -> Result<Vec<String>, TemplateError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut identities: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| is_valid_identity(name))
            .collect();
        identities.sort();

        Ok(identities)
    }

    pub fn extractor(&self) -> &FeatureExtractor {
        &self.extractor
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn identity_dir(&self, identity: &str) -> PathBuf {
        self.root.join(identity)
    }

    fn check_identity(&self, identity: &str) -> Result<(), TemplateError> {
        if is_valid_identity(identity) {
            Ok(())
        } else {
            Err(TemplateError::InvalidIdentity(identity.to_string()))
        }
    }
}
