//! Claim extraction for the semantic verification layer.
//!
//! Seven regex families pull typed factual assertions out of a generated
//! answer. Each claim carries its surrounding context and a risk level that
//! weights it during verification.

use crate::detector::{
    COUNTRY_RE, METHOD_ENDPOINT_RE, PRICE_RE, endpoint_matches, normalize_endpoint,
};
use crate::text::surrounding_context;
use crate::types::HallucinationType;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;

const CONTEXT_RADIUS: usize = 100;
pub const DEFAULT_MAX_CLAIMS: usize = 10;

/// `parameter \`document_id\``, `field country`.
pub(crate) static PARAMETER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:parameter|param|field|argument)s?\s+[`'"]?([A-Za-z_]\w*)"#)
        .expect("valid pattern")
});

static FEATURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:supports?|allows?|enables?|provides?|offers?)\s+([^.;:\n]{3,80})")
        .expect("valid pattern")
});

static RESPONSE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:returns?|responds?\s+with)\s+([^.;:\n]{3,80})").expect("valid pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimType {
    Endpoint,
    Price,
    Method,
    Parameter,
    Country,
    Feature,
    Response,
}

impl ClaimType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimType::Endpoint => "ENDPOINT",
            ClaimType::Price => "PRICE",
            ClaimType::Method => "METHOD",
            ClaimType::Parameter => "PARAMETER",
            ClaimType::Country => "COUNTRY",
            ClaimType::Feature => "FEATURE",
            ClaimType::Response => "RESPONSE",
        }
    }

    /// Hallucination kind reported when a claim of this type fails verification.
    pub fn hallucination_type(&self) -> HallucinationType {
        match self {
            ClaimType::Endpoint => HallucinationType::FabricatedEndpoint,
            ClaimType::Price => HallucinationType::FabricatedPrice,
            ClaimType::Method => HallucinationType::IncorrectMethod,
            ClaimType::Parameter => HallucinationType::FabricatedParameter,
            ClaimType::Country => HallucinationType::UnsupportedCountry,
            ClaimType::Feature => HallucinationType::FabricatedFeature,
            ClaimType::Response => HallucinationType::ConflictingInfo,
        }
    }
}

impl fmt::Display for ClaimType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Weight in the risk-weighted confidence average.
    pub fn weight(&self) -> f64 {
        match self {
            RiskLevel::Critical => 3.0,
            RiskLevel::High => 2.0,
            RiskLevel::Medium => 1.0,
            RiskLevel::Low => 0.5,
        }
    }

    /// Severity of an unverified claim at zero confidence.
    pub fn severity_base(&self) -> f64 {
        match self {
            RiskLevel::Critical => 0.9,
            RiskLevel::High => 0.7,
            RiskLevel::Medium => 0.5,
            RiskLevel::Low => 0.3,
        }
    }
}

pub fn categorize_risk(kind: ClaimType) -> RiskLevel {
    match kind {
        ClaimType::Endpoint | ClaimType::Price => RiskLevel::Critical,
        ClaimType::Method | ClaimType::Parameter => RiskLevel::High,
        ClaimType::Country | ClaimType::Feature => RiskLevel::Medium,
        ClaimType::Response => RiskLevel::Low,
    }
}

/// A typed factual assertion found in generated text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claim {
    #[serde(rename = "type")]
    pub kind: ClaimType,
    pub value: String,
    pub context: String,
    pub risk_level: RiskLevel,
}

impl Claim {
    pub fn new(kind: ClaimType, value: impl Into<String>, context: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
            context: context.into(),
            risk_level: categorize_risk(kind),
        }
    }

    /// Text sent to the embedding provider.
    pub fn embedding_text(&self) -> String {
        format!("{}: {}. Context: {}", self.kind, self.value, self.context)
    }
}

#[derive(Debug, Clone)]
pub struct ClaimExtractor {
    max_claims: usize,
}

impl Default for ClaimExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CLAIMS)
    }
}

impl ClaimExtractor {
    pub fn new(max_claims: usize) -> Self {
        Self { max_claims }
    }

    /// Extract up to `max_claims` distinct claims, families in declaration order.
    pub fn extract_claims(&self, text: &str) -> Vec<Claim> {
        let mut claims = Vec::new();
        let mut seen = HashSet::new();
        let mut push = |kind: ClaimType, value: &str, start: usize, end: usize| {
            let value = value.trim().trim_end_matches([',', '.', ';', ':', '!']);
            if value.is_empty() || claims.len() >= self.max_claims {
                return;
            }
            if seen.insert(format!("{}:{}", kind, value.to_lowercase())) {
                claims.push(Claim::new(
                    kind,
                    value,
                    surrounding_context(text, start, end, CONTEXT_RADIUS),
                ));
            }
        };

        for m in endpoint_matches(text) {
            if normalize_endpoint(m.as_str()).len() > 5 {
                push(ClaimType::Endpoint, m.as_str(), m.start(), m.end());
            }
        }
        for m in PRICE_RE.find_iter(text) {
            push(ClaimType::Price, m.as_str(), m.start(), m.end());
        }
        for m in METHOD_ENDPOINT_RE.find_iter(text) {
            push(ClaimType::Method, m.as_str(), m.start(), m.end());
        }
        for caps in PARAMETER_RE.captures_iter(text) {
            let m = &caps[1];
            if let Some(whole) = caps.get(0) {
                push(ClaimType::Parameter, m, whole.start(), whole.end());
            }
        }
        for m in COUNTRY_RE.find_iter(text) {
            push(ClaimType::Country, m.as_str(), m.start(), m.end());
        }
        for caps in FEATURE_RE.captures_iter(text) {
            if let Some(value) = caps.get(1) {
                push(ClaimType::Feature, value.as_str(), value.start(), value.end());
            }
        }
        for caps in RESPONSE_RE.captures_iter(text) {
            if let Some(value) = caps.get(1) {
                push(ClaimType::Response, value.as_str(), value.start(), value.end());
            }
        }

        claims
    }
}
