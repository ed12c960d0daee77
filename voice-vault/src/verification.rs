//! Voice verification against enrolled templates
//!
//! Each template is scored with a weighted blend of per-feature sub-scores;
//! the identity matches only when both the best and the mean score clear
//! the threshold.

use crate::features::{FeatureKind, FeatureValue, FeatureVector};
use crate::templates::{ReferenceTemplate, TemplateError, TemplateStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("No reference templates for identity '{0}'")]
    NoReferences(String),

    #[error("Invalid verification configuration: {0}")]
    InvalidConfig(String),

    #[error("Template store error: {0}")]
    Template(#[from] TemplateError),
}

/// Relative weight of each feature kind in the blended score
///
/// Weights are renormalised over the kinds present in both vectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityWeights {
    pub spectral_profile: f64,
    pub cepstral_profile: f64,
    pub centroid: f64,
    pub zero_crossing_rate: f64,
}

impl Default for SimilarityWeights {
    fn default() -> Self {
        Self {
            spectral_profile: 0.5,
            cepstral_profile: 0.3,
            centroid: 0.1,
            zero_crossing_rate: 0.1,
        }
    }
}

impl SimilarityWeights {
    pub fn weight(&self, kind: FeatureKind) -> f64 {
        match kind {
            FeatureKind::SpectralProfile => self.spectral_profile,
            FeatureKind::CepstralProfile => self.cepstral_profile,
            FeatureKind::Centroid => self.centroid,
            FeatureKind::ZeroCrossingRate => self.zero_crossing_rate,
        }
    }

    fn validate(&self) -> Result<(), VerificationError> {
        let weights = FeatureKind::ALL.map(|k| self.weight(k));

        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(VerificationError::InvalidConfig(
                "similarity weights must be finite and non-negative".to_string(),
            ));
        }
        if weights.iter().sum::<f64>() <= 0.0 {
            return Err(VerificationError::InvalidConfig(
                "at least one similarity weight must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

/// Verification configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// The best score must be strictly greater than this
    pub threshold: f64,

    /// The mean score must be strictly greater than `mean_factor * threshold`
    pub mean_factor: f64,

    pub weights: SimilarityWeights,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            threshold: 0.85,
            mean_factor: 0.9,
            weights: SimilarityWeights::default(),
        }
    }
}

impl VerificationConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), VerificationError> {
        if !(self.threshold > 0.0 && self.threshold <= 1.0) {
            return Err(VerificationError::InvalidConfig(format!(
                "threshold {} must be in (0, 1]",
                self.threshold
            )));
        }

        if !(self.mean_factor > 0.0 && self.mean_factor <= 1.0) {
            return Err(VerificationError::InvalidConfig(format!(
                "mean_factor {} must be in (0, 1]",
                self.mean_factor
            )));
        }

        self.weights.validate()
    }
}

/// Scores of a candidate against every template of an identity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarityResult {
    /// One score per template, in template order
    pub scores: Vec<f64>,
    pub max_similarity: f64,
    pub mean_similarity: f64,
    pub threshold: f64,
    pub matches: bool,
}

/// Compares candidate feature vectors against reference templates
#[derive(Debug, Clone)]
pub struct VerificationEngine {
    config: VerificationConfig,
}

impl VerificationEngine {
    pub fn new(config: VerificationConfig) -> Result<Self, VerificationError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Verify `candidate` against an explicit template set
    pub fn verify(
        &self,
        identity: &str,
        templates: &[ReferenceTemplate],
        candidate: &FeatureVector,
    ) -> Result<SimilarityResult, VerificationError> {
        if templates.is_empty() {
            return Err(VerificationError::NoReferences(identity.to_string()));
        }

        let scores = templates
            .iter()
            .map(|t| self.similarity(&t.features, candidate))
            .collect();
        let result = self.decide(scores);

        if result.matches {
            info!(
                "Voice verified for '{}': max={:.4}, mean={:.4}",
                identity, result.max_similarity, result.mean_similarity
            );
        } else {
            warn!(
                "Voice rejected for '{}': max={:.4}, mean={:.4}, threshold={:.4}",
                identity, result.max_similarity, result.mean_similarity, result.threshold
            );
        }

        Ok(result)
    }

    /// Verify `candidate` against the identity's enrolled templates
    pub fn verify_enrolled(
        &self,
        store: &TemplateStore,
        identity: &str,
        candidate: &FeatureVector,
    ) -> Result<SimilarityResult, VerificationError> {
        let templates = match store.load(identity) {
            Ok(templates) => templates,
            Err(TemplateError::NoEnrollment(id)) => return Err(VerificationError::NoReferences(id)),
            Err(e) => return Err(e.into()),
        };

        self.verify(identity, &templates, candidate)
    }

    /// Aggregate per-template scores into a decision
    ///
    /// A score exactly equal to the threshold is rejected.
    pub fn decide(&self, scores: Vec<f64>) -> SimilarityResult {
        let threshold = self.config.threshold;
        let max_similarity = scores.iter().copied().fold(0.0f64, f64::max);
        let mean_similarity = if scores.is_empty() {
            0.0
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        };

        let matches = !scores.is_empty()
            && max_similarity > threshold
            && mean_similarity > self.config.mean_factor * threshold;

        SimilarityResult {
            scores,
            max_similarity,
            mean_similarity,
            threshold,
            matches,
        }
    }

    /// Weighted similarity of two feature vectors in [0, 1]
    pub fn similarity(&self, reference: &FeatureVector, candidate: &FeatureVector) -> f64 {
        let mut weighted = 0.0;
        let mut total_weight = 0.0;

        for kind in FeatureKind::ALL {
            let (Some(a), Some(b)) = (reference.get(kind), candidate.get(kind)) else {
                continue;
            };

            let weight = self.config.weights.weight(kind);
            if weight == 0.0 {
                continue;
            }

            let score = match (a, b) {
                (FeatureValue::Vector(a), FeatureValue::Vector(b)) => correlation(a, b),
                (FeatureValue::Scalar(a), FeatureValue::Scalar(b)) => closeness(*a, *b),
                _ => {
                    warn!("Feature '{}' has mismatched shapes, scoring 0", kind);
                    0.0
                }
            };

            debug!("{} similarity: {:.4} (weight {})", kind, score, weight);

            weighted += weight * score;
            total_weight += weight;
        }

        if total_weight > 0.0 {
            (weighted / total_weight).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    pub fn config(&self) -> &VerificationConfig {
        &self.config
    }
}

/// Pearson correlation clamped to [0, 1]
///
/// Constant vectors have no defined correlation: they score 1 only when both
/// are constant and equal.
fn correlation(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        warn!(
            "Cannot correlate vectors of length {} and {}",
            a.len(),
            b.len()
        );
        return 0.0;
    }

    let n = a.len() as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;

    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for (x, y) in a.iter().zip(b) {
        let dx = x - mean_a;
        let dy = y - mean_b;
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }

    if var_a == 0.0 || var_b == 0.0 {
        let equal = var_a == 0.0 && var_b == 0.0 && a == b;
        return if equal { 1.0 } else { 0.0 };
    }

    let r = cov / (var_a * var_b).sqrt();
    if r.is_finite() {
        r.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// `1 - |a - b| / max(|a|, |b|)`, 1 when both are zero
fn closeness(a: f64, b: f64) -> f64 {
    let scale = a.abs().max(b.abs());
    if scale == 0.0 {
        return 1.0;
    }

    let score = 1.0 - (a - b).abs() / scale;
    if score.is_finite() {
        score.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
