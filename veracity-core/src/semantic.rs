//! Embedding-based claim verification.
//!
//! Every extracted claim is embedded and compared against the prefix of each
//! source by cosine similarity. A literal occurrence of the claim value in the
//! source text dominates the semantic score. Embedding calls go through the
//! shared [`EmbeddingCache`] and are bounded by a per-call timeout; a failed
//! call degrades only the claim it belongs to.

use crate::cache::EmbeddingCache;
use crate::claims::{Claim, ClaimExtractor, ClaimType};
use crate::detector::{KnowledgeBase, METHOD_ENDPOINT_RE, normalize_endpoint, parse_price};
use crate::config::SemanticConfig;
use crate::embeddings::{SharedEmbedder, cosine_similarity};
use crate::error::EmbeddingError;
use crate::text::truncate_chars;
use crate::types::{DetectionSource, Hallucination, Source};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Minimum score granted to a claim whose value appears verbatim in a source.
pub const LITERAL_MATCH_SCORE: f64 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMethod {
    LiteralMatch,
    /// A structured fact (price, endpoint, method, parameter, country) the
    /// sources state in a different surface form.
    KnowledgeMatch,
    /// Keyword stems of a feature or response claim found in the sources.
    KeywordOverlap,
    SemanticSimilarity,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimVerification {
    pub claim: Claim,
    pub is_verified: bool,
    pub confidence_score: f64,
    /// Title of the best-matching source.
    pub matched_source: Option<String>,
    pub verification_method: VerificationMethod,
}

impl ClaimVerification {
    fn failed(claim: Claim) -> Self {
        Self {
            claim,
            is_verified: false,
            confidence_score: 0.0,
            matched_source: None,
            verification_method: VerificationMethod::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SemanticReport {
    pub verified_claims: Vec<ClaimVerification>,
    pub unverified_claims: Vec<ClaimVerification>,
    /// Risk-weighted average of claim confidences.
    pub overall_confidence: f64,
    pub passes_threshold: bool,
    pub summary: String,
}

impl SemanticReport {
    /// Report for an answer with nothing to verify.
    pub fn vacuous() -> Self {
        Self {
            verified_claims: Vec::new(),
            unverified_claims: Vec::new(),
            overall_confidence: 1.0,
            passes_threshold: true,
            summary: "No verifiable claims found".into(),
        }
    }

    pub fn total_claims(&self) -> usize {
        self.verified_claims.len() + self.unverified_claims.len()
    }

    /// Claims whose verification failed on an embedding error.
    pub fn errored_claims(&self) -> usize {
        self.unverified_claims
            .iter()
            .filter(|v| v.verification_method == VerificationMethod::Error)
            .count()
    }

    /// Unverified claims as hallucinations, severity scaled by risk and doubt.
    ///
    /// Claims that failed on an embedding error are excluded: the layer could
    /// not judge them.
    pub fn to_hallucinations(&self) -> Vec<Hallucination> {
        self.unverified_claims
            .iter()
            .filter(|v| v.verification_method != VerificationMethod::Error)
            .filter_map(|v| {
                let doubt = 1.0 - v.confidence_score.clamp(0.0, 1.0);
                let severity = v.claim.risk_level.severity_base() * doubt;
                (severity > 0.0).then(|| {
                    Hallucination::new(
                        v.claim.kind.hallucination_type(),
                        v.claim.value.clone(),
                        v.claim.context.clone(),
                        severity,
                    )
                    .with_source(DetectionSource::SemanticVerifier)
                })
            })
            .collect()
    }
}

/// Everything a claim is checked against, computed once per answer.
struct Evidence<'a> {
    sources: &'a [Source],
    vectors: &'a [Option<Vec<f32>>],
    /// Lowercased source content, index-aligned with `sources`.
    corpus: Vec<String>,
    facts: KnowledgeBase,
    terms: HashSet<String>,
}

impl Evidence<'_> {
    /// Structured facts the sources state, compared after normalization so
    /// that `0.25 USD` matches a documented `$0.25`.
    fn states_fact(&self, claim: &Claim) -> bool {
        match claim.kind {
            ClaimType::Price => {
                parse_price(&claim.value).is_some_and(|value| self.facts.knows_price(value))
            }
            ClaimType::Endpoint => self.facts.knows_endpoint(&normalize_endpoint(&claim.value)),
            ClaimType::Method => METHOD_ENDPOINT_RE.captures(&claim.value).is_some_and(|caps| {
                let endpoint = normalize_endpoint(&caps[2]);
                self.facts.knows_endpoint(&endpoint)
                    && self
                        .facts
                        .documented_methods(&endpoint)
                        .is_none_or(|methods| methods.contains(&caps[1]))
            }),
            ClaimType::Parameter => self.facts.knows_parameter(&claim.value),
            ClaimType::Country => self.facts.knows_country(&claim.value),
            ClaimType::Feature | ClaimType::Response => false,
        }
    }
}

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "with", "are", "was", "were", "been", "has", "have", "had", "does",
    "did", "will", "would", "should", "may", "might", "must", "can", "could", "from", "about",
    "into", "this", "that", "these", "those", "its", "but", "not", "any", "all", "your", "you",
];

/// Lowercased keyword stems: stop words and short tokens dropped, long
/// tokens cut to five characters so `lookups` meets `lookup`.
fn keywords(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|w| w.chars().count() > 2 && !STOP_WORDS.contains(&w.as_str()))
        .map(|w| w.chars().take(5).collect())
}

/// Share of the claim's keywords that the sources also use; `None` when
/// the claim has no keywords.
fn keyword_coverage(value: &str, terms: &HashSet<String>) -> Option<f64> {
    let wanted: HashSet<String> = keywords(value).collect();
    if wanted.is_empty() {
        return None;
    }
    let found = wanted.iter().filter(|w| terms.contains(*w)).count();
    Some(found as f64 / wanted.len() as f64)
}

pub struct SemanticVerifier {
    provider: SharedEmbedder,
    cache: Arc<EmbeddingCache>,
    extractor: ClaimExtractor,
    config: SemanticConfig,
}

impl SemanticVerifier {
    pub fn new(
        provider: SharedEmbedder,
        cache: Arc<EmbeddingCache>,
        config: SemanticConfig,
    ) -> Self {
        Self {
            provider,
            cache,
            extractor: ClaimExtractor::new(config.max_claims),
            config,
        }
    }

    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    /// Verify every claim in `answer` against `sources`.
    #[tracing::instrument(skip_all, fields(provider = self.provider.provider_name()))]
    pub async fn verify_response(&self, answer: &str, sources: &[Source]) -> SemanticReport {
        let claims = self.extractor.extract_claims(answer);
        if claims.is_empty() {
            return SemanticReport::vacuous();
        }

        let prefixes: Vec<&str> = sources
            .iter()
            .map(|s| truncate_chars(&s.content, self.config.source_prefix_chars))
            .collect();
        let source_vectors: Vec<Option<Vec<f32>>> =
            join_all(prefixes.iter().map(|prefix| async move {
                match self.cached_embed(prefix).await {
                    Ok(vector) => Some(vector),
                    Err(e) => {
                        tracing::warn!(error = %e, "Source embedding failed; skipping source");
                        None
                    }
                }
            }))
            .await;

        let evidence = Evidence {
            sources,
            vectors: &source_vectors,
            corpus: sources.iter().map(|s| s.content.to_lowercase()).collect(),
            facts: KnowledgeBase::from_sources(sources),
            terms: sources.iter().flat_map(|s| keywords(&s.content)).collect(),
        };

        let verifications = join_all(
            claims
                .into_iter()
                .map(|claim| self.verify_claim(claim, &evidence)),
        )
        .await;

        self.build_report(verifications)
    }

    /// Like [`verify_response`](Self::verify_response), abandoning in-flight
    /// embedding calls when `cancel` fires.
    pub async fn verify_with_cancel(
        &self,
        answer: &str,
        sources: &[Source],
        cancel: &CancellationToken,
    ) -> Result<SemanticReport, EmbeddingError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EmbeddingError::Cancelled),
            report = self.verify_response(answer, sources) => Ok(report),
        }
    }

    async fn verify_claim(&self, claim: Claim, evidence: &Evidence<'_>) -> ClaimVerification {
        let claim_vector = match self.cached_embed(&claim.embedding_text()).await {
            Ok(vector) => vector,
            Err(e) => {
                tracing::warn!(claim = %claim.value, error = %e, "Claim embedding failed");
                return ClaimVerification::failed(claim);
            }
        };

        let mut best: Option<(f64, usize)> = None;
        for (idx, vector) in evidence.vectors.iter().enumerate() {
            let Some(vector) = vector else { continue };
            let score = cosine_similarity(&claim_vector, vector);
            if best.is_none_or(|(top, _)| score > top) {
                best = Some((score, idx));
            }
        }
        if best.is_none() && evidence.vectors.iter().any(Option::is_none) {
            return ClaimVerification::failed(claim);
        }

        let (mut score, mut matched) = best.map_or((0.0, None), |(s, i)| (s.max(0.0), Some(i)));
        let mut method = VerificationMethod::SemanticSimilarity;

        let needle = claim.value.to_lowercase();
        if let Some(idx) = evidence.corpus.iter().position(|text| text.contains(&needle)) {
            score = score.max(LITERAL_MATCH_SCORE);
            matched = Some(idx);
            method = VerificationMethod::LiteralMatch;
        } else if evidence.states_fact(&claim) {
            score = score.max(LITERAL_MATCH_SCORE);
            method = VerificationMethod::KnowledgeMatch;
        } else if matches!(claim.kind, ClaimType::Feature | ClaimType::Response)
            && let Some(coverage) = keyword_coverage(&claim.value, &evidence.terms)
            && coverage > score
        {
            score = coverage;
            method = VerificationMethod::KeywordOverlap;
        }

        ClaimVerification {
            is_verified: score >= self.config.verification_threshold,
            confidence_score: score.min(1.0),
            matched_source: matched
                .and_then(|i| evidence.sources.get(i))
                .map(|s| s.title.clone()),
            verification_method: method,
            claim,
        }
    }

    async fn cached_embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if let Some(vector) = self.cache.get(text) {
            return Ok(vector);
        }
        let timeout_ms = self.config.embed_timeout_ms;
        let call = self.provider.embed(text);
        let vector = tokio::time::timeout(Duration::from_millis(timeout_ms), call)
            .await
            .map_err(|_| EmbeddingError::Timeout { timeout_ms })??;
        self.cache.set(text, vector.clone());
        Ok(vector)
    }

    fn build_report(&self, verifications: Vec<ClaimVerification>) -> SemanticReport {
        let (weighted, weights) = verifications.iter().fold((0.0, 0.0), |(sum, w), v| {
            let weight = v.claim.risk_level.weight();
            (sum + v.confidence_score * weight, w + weight)
        });
        let overall_confidence = if weights > 0.0 { weighted / weights } else { 1.0 };

        let total = verifications.len();
        let (verified_claims, unverified_claims): (Vec<_>, Vec<_>) =
            verifications.into_iter().partition(|v| v.is_verified);
        let errored = unverified_claims
            .iter()
            .filter(|v| v.verification_method == VerificationMethod::Error)
            .count();

        let mut summary = format!(
            "{}/{} claims verified (confidence {:.0}%)",
            verified_claims.len(),
            total,
            overall_confidence * 100.0
        );
        if errored > 0 {
            summary.push_str(&format!(", {errored} could not be checked"));
        }

        SemanticReport {
            verified_claims,
            unverified_claims,
            passes_threshold: overall_confidence >= self.config.verification_threshold,
            overall_confidence,
            summary,
        }
    }
}
