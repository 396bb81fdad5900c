//! RAG validator facade: retrieval metadata and post-generation validation.

use crate::config::ValidationConfig;
use crate::detector::HallucinationDetector;
use crate::groundedness::GroundednessCalculator;
use crate::sources::SourceTracker;
use crate::types::{
    Groundedness, Hallucination, RagMetadata, RawResult, Source, ValidationResult,
    ValidationStatus, total_severity,
};
use chrono::Utc;

/// Hallucinations at or above this severity make an answer ungrounded.
pub const HIGH_SEVERITY: f64 = 0.7;
/// Confidence (0-100) below which retrieval metadata carries a warning.
pub const LOW_CONFIDENCE_WARNING: u32 = 30;

const FORCE_UNGROUNDED_TOTAL: f64 = 1.5;
const FORCE_LOW_TOTAL: f64 = 0.8;

#[derive(Debug, Clone)]
pub struct RagValidator {
    config: ValidationConfig,
    calculator: GroundednessCalculator,
}

impl Default for RagValidator {
    fn default() -> Self {
        Self::new(ValidationConfig::default())
    }
}

impl RagValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self {
            calculator: GroundednessCalculator::new(&config),
            config,
        }
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    /// Build retrieval metadata for a set of raw hits.
    pub fn process_results(&self, results: &[RawResult]) -> RagMetadata {
        let tracker = SourceTracker::track(results, &self.config);
        let total_considered = tracker.total_considered();
        let has_sources = tracker.has_sufficient_sources();
        let sources = tracker.into_sources();
        let score = self.calculator.calculate(&sources);

        let mut warnings = Vec::new();
        if !has_sources {
            warnings.push("No relevant sources found; the answer cannot be verified".to_string());
        } else {
            if sources.len() == 1 {
                warnings.push("Answer is based on a single source".to_string());
            }
            if score.confidence < LOW_CONFIDENCE_WARNING {
                warnings.push(format!(
                    "Low retrieval confidence ({}%)",
                    score.confidence
                ));
            }
        }

        let status = if !has_sources {
            ValidationStatus::Unverifiable
        } else if score.level == Groundedness::Ungrounded {
            ValidationStatus::Invalid
        } else if warnings.is_empty() {
            ValidationStatus::Valid
        } else {
            ValidationStatus::Warning
        };

        RagMetadata {
            avg_score: (score.avg_score * 1000.0).round() / 10.0,
            confidence: score.confidence,
            groundedness: score.level,
            validation_result: ValidationResult::pending(
                has_sources && score.level != Groundedness::Ungrounded,
                warnings,
                status,
            ),
            sources,
            retrieved_at: Utc::now(),
            total_sources_considered: total_considered,
        }
    }

    /// Run the pattern detector over `answer` and classify the outcome.
    pub fn validate_response(&self, answer: &str, results: &[RawResult]) -> ValidationResult {
        let hallucinations = HallucinationDetector::new(results).detect(answer);
        let sources = SourceTracker::track(results, &self.config).into_sources();
        let level = self.calculator.calculate(&sources).level;
        self.classify(hallucinations, !sources.is_empty(), level, Vec::new())
    }

    /// Classify an already-collected hallucination set.
    pub fn classify(
        &self,
        hallucinations: Vec<Hallucination>,
        has_sources: bool,
        level: Groundedness,
        mut warnings: Vec<String>,
    ) -> ValidationResult {
        let high_severity = hallucinations
            .iter()
            .any(|h| h.effective_severity() >= HIGH_SEVERITY);
        let is_grounded = !high_severity;

        for h in &hallucinations {
            warnings.push(format!("Unsupported {}: {}", h.kind, h.detected));
        }

        let status = if !has_sources {
            ValidationStatus::Unverifiable
        } else if level == Groundedness::Ungrounded || (self.config.strict_mode && high_severity)
        {
            ValidationStatus::Invalid
        } else if !hallucinations.is_empty() {
            ValidationStatus::Warning
        } else {
            ValidationStatus::Valid
        };

        ValidationResult {
            is_grounded,
            warnings,
            detected_hallucinations: hallucinations,
            status,
        }
    }

    /// Metadata plus pattern validation, with groundedness downgraded by findings.
    pub fn full_validation(&self, results: &[RawResult], answer: &str) -> RagMetadata {
        let mut metadata = self.process_results(results);
        let hallucinations = HallucinationDetector::new(results).detect(answer);
        self.apply_hallucinations(&mut metadata, hallucinations);
        metadata
    }

    /// Fold a hallucination set into metadata built by
    /// [`process_results`](Self::process_results).
    pub fn apply_hallucinations(
        &self,
        metadata: &mut RagMetadata,
        hallucinations: Vec<Hallucination>,
    ) {
        let before = metadata.groundedness;
        let after = downgrade(before, &hallucinations);
        let mut warnings = std::mem::take(&mut metadata.validation_result.warnings);
        if after < before {
            tracing::debug!(%before, %after, "Groundedness downgraded by hallucinations");
            warnings.push(format!(
                "Groundedness downgraded from {before} to {after} due to detected hallucinations"
            ));
        }
        metadata.groundedness = after;
        metadata.validation_result = self.classify(
            hallucinations,
            !metadata.sources.is_empty(),
            after,
            warnings,
        );
    }
}

/// Lower `level` according to the summed severity of `hallucinations`.
/// Never raises it.
pub fn downgrade(level: Groundedness, hallucinations: &[Hallucination]) -> Groundedness {
    let total = total_severity(hallucinations);
    let forced = if total >= FORCE_UNGROUNDED_TOTAL {
        Groundedness::Ungrounded
    } else if total >= FORCE_LOW_TOTAL {
        Groundedness::Low
    } else if level == Groundedness::High && total > 0.0 {
        Groundedness::Medium
    } else {
        level
    };
    level.min(forced)
}

/// Convenience for callers holding plain sources instead of raw hits.
pub fn raw_results(sources: &[Source]) -> Vec<RawResult> {
    sources.iter().cloned().map(RawResult::from_chunk).collect()
}
