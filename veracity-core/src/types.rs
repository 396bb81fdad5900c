//! Fundamental types shared across the validation pipeline.
//!
//! The wire shapes (`Source`, `RagMetadata`, `ValidationResult`) serialize in
//! camelCase because they are handed back to the chat front end verbatim.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One retrieved reference passage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub source_path: String,
    /// Relevance score in `[0, 1]`.
    #[serde(default)]
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Source {
    /// Create a source with just a title, body and score.
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
        score: f64,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            content: content.into(),
            score,
            ..Default::default()
        }
    }
}

/// A scored hit as returned by the external retriever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawResult {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub score: f64,
    pub chunk: Source,
}

impl RawResult {
    /// Wrap a chunk, copying its id and score to the hit.
    pub fn from_chunk(chunk: Source) -> Self {
        Self {
            id: chunk.id.clone(),
            score: chunk.score,
            chunk,
        }
    }
}

/// How well the retrieved passages support an answer.
///
/// Variants are ordered from weakest to strongest so that downgrades can be
/// expressed with `min`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Groundedness {
    Ungrounded,
    Low,
    Medium,
    High,
}

impl fmt::Display for Groundedness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Groundedness::Ungrounded => write!(f, "ungrounded"),
            Groundedness::Low => write!(f, "low"),
            Groundedness::Medium => write!(f, "medium"),
            Groundedness::High => write!(f, "high"),
        }
    }
}

/// Kind of fabricated or unsupported claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HallucinationType {
    FabricatedEndpoint,
    FabricatedPrice,
    FabricatedParameter,
    UnsupportedCountry,
    IncorrectMethod,
    FabricatedFeature,
    ConflictingInfo,
}

impl HallucinationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HallucinationType::FabricatedEndpoint => "fabricated_endpoint",
            HallucinationType::FabricatedPrice => "fabricated_price",
            HallucinationType::FabricatedParameter => "fabricated_parameter",
            HallucinationType::UnsupportedCountry => "unsupported_country",
            HallucinationType::IncorrectMethod => "incorrect_method",
            HallucinationType::FabricatedFeature => "fabricated_feature",
            HallucinationType::ConflictingInfo => "conflicting_info",
        }
    }
}

impl fmt::Display for HallucinationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which layer flagged a hallucination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionSource {
    PatternDetector,
    SemanticVerifier,
}

/// A claim in the generated answer that the sources do not support.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hallucination {
    #[serde(rename = "type")]
    pub kind: HallucinationType,
    /// The fabricated text fragment as it appears in the answer.
    pub detected: String,
    /// Surrounding answer text.
    #[serde(default)]
    pub context: String,
    /// Missing severities deserialize as 0 and never escalate an action.
    #[serde(default)]
    pub severity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<DetectionSource>,
}

impl Hallucination {
    pub fn new(
        kind: HallucinationType,
        detected: impl Into<String>,
        context: impl Into<String>,
        severity: f64,
    ) -> Self {
        Self {
            kind,
            detected: detected.into(),
            context: context.into(),
            severity,
            source: None,
        }
    }

    pub fn with_source(mut self, source: DetectionSource) -> Self {
        self.source = Some(source);
        self
    }

    /// Severity clamped to `[0, 1]`, with NaN treated as 0.
    pub fn effective_severity(&self) -> f64 {
        if self.severity.is_nan() {
            0.0
        } else {
            self.severity.clamp(0.0, 1.0)
        }
    }
}

/// Highest effective severity in a set, 0 when empty.
pub fn max_severity(hallucinations: &[Hallucination]) -> f64 {
    hallucinations
        .iter()
        .map(Hallucination::effective_severity)
        .fold(0.0, f64::max)
}

/// Sum of effective severities.
pub fn total_severity(hallucinations: &[Hallucination]) -> f64 {
    hallucinations
        .iter()
        .map(Hallucination::effective_severity)
        .sum()
}

/// Outcome of checking an answer against its sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Valid,
    Warning,
    Invalid,
    Unverifiable,
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationStatus::Valid => write!(f, "valid"),
            ValidationStatus::Warning => write!(f, "warning"),
            ValidationStatus::Invalid => write!(f, "invalid"),
            ValidationStatus::Unverifiable => write!(f, "unverifiable"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub is_grounded: bool,
    pub warnings: Vec<String>,
    pub detected_hallucinations: Vec<Hallucination>,
    pub status: ValidationStatus,
}

impl ValidationResult {
    /// Result for a turn that has not been checked against an answer yet.
    pub fn pending(is_grounded: bool, warnings: Vec<String>, status: ValidationStatus) -> Self {
        Self {
            is_grounded,
            warnings,
            detected_hallucinations: Vec::new(),
            status,
        }
    }
}

/// Retrieval transparency metadata attached to every chat turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RagMetadata {
    /// Deduplicated, sorted by score descending.
    pub sources: Vec<Source>,
    pub groundedness: Groundedness,
    /// Weighted average score as a percentage (0-100).
    pub avg_score: f64,
    /// 0-100.
    pub confidence: u32,
    pub validation_result: ValidationResult,
    pub retrieved_at: DateTime<Utc>,
    /// Number of hits before threshold filtering and deduplication.
    pub total_sources_considered: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_groundedness_ordering() {
        assert!(Groundedness::Ungrounded < Groundedness::Low);
        assert!(Groundedness::Low < Groundedness::Medium);
        assert!(Groundedness::Medium < Groundedness::High);
        assert_eq!(
            Groundedness::High.min(Groundedness::Low),
            Groundedness::Low
        );
    }

    #[test]
    fn test_groundedness_serde() {
        let json = serde_json::to_string(&Groundedness::Ungrounded).unwrap();
        assert_eq!(json, "\"ungrounded\"");
        let level: Groundedness = serde_json::from_str("\"high\"").unwrap();
        assert_eq!(level, Groundedness::High);
    }

    #[test]
    fn test_hallucination_missing_severity_defaults_to_zero() {
        let h: Hallucination =
            serde_json::from_str(r#"{"type":"fabricated_price","detected":"$5"}"#).unwrap();
        assert_eq!(h.kind, HallucinationType::FabricatedPrice);
        assert_eq!(h.severity, 0.0);
        assert!(h.source.is_none());
    }

    #[test]
    fn test_effective_severity_clamps() {
        let mut h = Hallucination::new(HallucinationType::ConflictingInfo, "x", "", f64::NAN);
        assert_eq!(h.effective_severity(), 0.0);
        h.severity = -0.4;
        assert_eq!(h.effective_severity(), 0.0);
        h.severity = 3.0;
        assert_eq!(h.effective_severity(), 1.0);
    }

    #[test]
    fn test_max_and_total_severity() {
        let hs = vec![
            Hallucination::new(HallucinationType::FabricatedPrice, "$1", "", 0.8),
            Hallucination::new(HallucinationType::UnsupportedCountry, "Peru", "", 0.9),
        ];
        assert!((max_severity(&hs) - 0.9).abs() < f64::EPSILON);
        assert!((total_severity(&hs) - 1.7).abs() < 1e-9);
        assert_eq!(max_severity(&[]), 0.0);
    }

    #[test]
    fn test_hallucination_serializes_type_tag() {
        let h = Hallucination::new(HallucinationType::FabricatedEndpoint, "/v9/x", "ctx", 1.0)
            .with_source(DetectionSource::PatternDetector);
        let value = serde_json::to_value(&h).unwrap();
        assert_eq!(value["type"], "fabricated_endpoint");
        assert_eq!(value["source"], "pattern_detector");
    }

    #[test]
    fn test_source_camel_case_roundtrip() {
        let json = r#"{"id":"a","title":"T","content":"c","sourcePath":"docs/a.md","score":0.5}"#;
        let source: Source = serde_json::from_str(json).unwrap();
        assert_eq!(source.source_path, "docs/a.md");
        assert!(source.parameters.is_empty());
        let back = serde_json::to_value(&source).unwrap();
        assert_eq!(back["sourcePath"], "docs/a.md");
        assert!(back.get("endpoint").is_none());
    }

    #[test]
    fn test_raw_result_from_chunk() {
        let raw = RawResult::from_chunk(Source::new("c1", "Title", "body", 0.7));
        assert_eq!(raw.id, "c1");
        assert!((raw.score - 0.7).abs() < f64::EPSILON);
    }
}
