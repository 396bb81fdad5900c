//! Per-turn orchestration: retrieve, validate, verify, sanitize, audit.

use crate::audit::{AuditRecord, AuditSystem};
use crate::cache::EmbeddingCache;
use crate::config::VeracityConfig;
use crate::detector::HallucinationDetector;
use crate::embeddings::{SharedEmbedder, create_embedder};
use crate::error::RetrievalError;
use crate::retriever::SharedRetriever;
use crate::sanitizer::{ResponseSanitizer, SanitizationResult};
use crate::semantic::{SemanticReport, SemanticVerifier};
use crate::types::{Hallucination, RagMetadata, RawResult};
use crate::validator::RagValidator;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One chat turn to validate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    #[serde(default = "default_session")]
    pub session_id: String,
    pub query: String,
    pub answer: String,
    /// Pre-fetched retrieval results. When absent the pipeline's retriever is asked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<RawResult>>,
}

fn default_session() -> String {
    "anonymous".into()
}

impl TurnRequest {
    pub fn new(query: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            session_id: default_session(),
            query: query.into(),
            answer: answer.into(),
            results: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_results(mut self, results: Vec<RawResult>) -> Self {
        self.results = Some(results);
        self
    }
}

/// Everything the caller needs to answer the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnOutcome {
    pub metadata: RagMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic: Option<SemanticReport>,
    pub sanitization: SanitizationResult,
    pub audit_entry_id: Uuid,
    pub elapsed_ms: u64,
}

impl TurnOutcome {
    /// The text to show the user.
    pub fn content(&self) -> &str {
        &self.sanitization.content
    }

    pub fn hallucinations(&self) -> &[Hallucination] {
        &self.metadata.validation_result.detected_hallucinations
    }
}

pub struct ValidationPipeline {
    config: VeracityConfig,
    validator: RagValidator,
    sanitizer: ResponseSanitizer,
    verifier: SemanticVerifier,
    audit: Arc<AuditSystem>,
    retriever: Option<SharedRetriever>,
}

impl ValidationPipeline {
    pub fn new(config: VeracityConfig, embedder: SharedEmbedder, audit: Arc<AuditSystem>) -> Self {
        let cache = Arc::new(EmbeddingCache::from_config(&config.embedding));
        Self {
            validator: RagValidator::new(config.validation.clone()),
            sanitizer: ResponseSanitizer::new(config.sanitizer.clone()),
            verifier: SemanticVerifier::new(embedder, cache, config.semantic.clone()),
            audit,
            retriever: None,
            config,
        }
    }

    /// Build with the embedding provider named in the config, refusing a
    /// config that fails [`VeracityConfig::validate`].
    pub fn from_config(config: VeracityConfig, audit: Arc<AuditSystem>) -> crate::Result<Self> {
        config.ensure_valid()?;
        let embedder = create_embedder(&config.embedding)?;
        Ok(Self::new(config, embedder, audit))
    }

    pub fn with_retriever(mut self, retriever: SharedRetriever) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn config(&self) -> &VeracityConfig {
        &self.config
    }

    pub fn audit(&self) -> &Arc<AuditSystem> {
        &self.audit
    }

    pub fn sanitizer(&self) -> &ResponseSanitizer {
        &self.sanitizer
    }

    pub fn verifier(&self) -> &SemanticVerifier {
        &self.verifier
    }

    /// Ask the retriever, bounded by `retrieval.timeout_ms`. Failures and
    /// timeouts yield an empty list.
    pub async fn retrieve(&self, query: &str) -> Vec<RawResult> {
        let Some(retriever) = &self.retriever else {
            return Vec::new();
        };
        let timeout_ms = self.config.retrieval.timeout_ms;
        let outcome = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            retriever.search(query, self.config.retrieval.top_k),
        )
        .await
        .unwrap_or(Err(RetrievalError::Timeout { timeout_ms }));

        match outcome {
            Ok(mut results) => {
                results.sort_by(|a, b| b.score.total_cmp(&a.score));
                results
            }
            Err(e) => {
                tracing::warn!(
                    retriever = retriever.name(),
                    error = %e,
                    "Retrieval failed; treating query as ungrounded"
                );
                Vec::new()
            }
        }
    }

    /// Validate one turn end to end. Never fails: degraded layers add
    /// warnings to the metadata instead.
    #[tracing::instrument(skip_all, fields(session = %request.session_id))]
    pub async fn validate_turn(
        &self,
        request: TurnRequest,
        cancel: &CancellationToken,
    ) -> TurnOutcome {
        let started = Instant::now();
        let TurnRequest {
            session_id,
            query,
            answer,
            results,
        } = request;

        let results = match results {
            Some(results) => results,
            None => self.retrieve(&query).await,
        };

        let mut metadata = self.validator.process_results(&results);
        let mut hallucinations = HallucinationDetector::new(&results).detect(&answer);

        let semantic = if self.config.semantic.enabled {
            match self
                .verifier
                .verify_with_cancel(&answer, &metadata.sources, cancel)
                .await
            {
                Ok(report) => {
                    let errored = report.errored_claims();
                    if errored > 0 {
                        metadata.validation_result.warnings.push(format!(
                            "Semantic verification degraded: {errored} of {} claim(s) could not be checked",
                            report.total_claims()
                        ));
                    }
                    hallucinations =
                        merge_hallucinations(hallucinations, report.to_hallucinations());
                    Some(report)
                }
                Err(e) => {
                    tracing::info!(error = %e, "Semantic verification abandoned");
                    metadata.validation_result.warnings.push(
                        "Semantic verification was cancelled; answer checked by patterns only"
                            .into(),
                    );
                    None
                }
            }
        } else {
            None
        };

        self.validator.apply_hallucinations(&mut metadata, hallucinations);

        let sanitization = self.sanitizer.sanitize(
            &answer,
            &metadata.validation_result.detected_hallucinations,
            metadata.groundedness,
            &metadata.sources,
        );

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let entry = self.audit.record(AuditRecord {
            session_id,
            query,
            response: answer,
            hallucinations: metadata.validation_result.detected_hallucinations.clone(),
            action: sanitization.action,
            confidence: metadata.confidence,
            response_time_ms: elapsed_ms,
            sources: metadata.sources.clone(),
        });

        tracing::debug!(
            groundedness = %metadata.groundedness,
            action = %sanitization.action,
            hallucinations = metadata.validation_result.detected_hallucinations.len(),
            elapsed_ms,
            "Turn validated"
        );

        TurnOutcome {
            metadata,
            semantic,
            sanitization,
            audit_entry_id: entry.id,
            elapsed_ms,
        }
    }
}

/// Union of two hallucination sets, one per `(type, lowercased fragment)`,
/// keeping the higher severity. First-seen order is preserved.
pub fn merge_hallucinations(
    primary: Vec<Hallucination>,
    secondary: Vec<Hallucination>,
) -> Vec<Hallucination> {
    let mut merged: Vec<Hallucination> = Vec::with_capacity(primary.len() + secondary.len());
    let mut index: HashMap<(crate::types::HallucinationType, String), usize> = HashMap::new();
    for h in primary.into_iter().chain(secondary) {
        let key = (h.kind, h.detected.trim().to_lowercase());
        match index.get(&key) {
            Some(&i) => {
                if h.effective_severity() > merged[i].effective_severity() {
                    merged[i] = h;
                }
            }
            None => {
                index.insert(key, merged.len());
                merged.push(h);
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VeracityError;
    use crate::config::{AuditConfig, PrivacyConfig};
    use crate::error::{ConfigError, EmbeddingError};
    use crate::embeddings::{EmbeddingProvider, LocalEmbedder};
    use crate::retriever::{Retriever, StaticRetriever};
    use crate::sanitizer::SanitizationAction;
    use crate::types::{DetectionSource, Groundedness, HallucinationType, Source};
    use async_trait::async_trait;

    fn hits() -> Vec<RawResult> {
        let mut a = Source::new(
            "a",
            "Colombian Citizens API",
            "GET /v2/colombian-citizens returns citizen data for Colombia. \
             Each lookup costs $0.25.",
            0.9,
        );
        a.source_path = "citizens.md".into();
        let mut b = Source::new(
            "b",
            "Pricing",
            "Lookups on /v2/colombian-citizens are billed at $0.25 each.",
            0.85,
        );
        b.source_path = "pricing.md".into();
        vec![RawResult::from_chunk(a), RawResult::from_chunk(b)]
    }

    fn pipeline(semantic: bool) -> ValidationPipeline {
        let mut config = VeracityConfig::default();
        config.semantic.enabled = semantic;
        let audit = Arc::new(AuditSystem::new(AuditConfig::default(), PrivacyConfig::default()));
        ValidationPipeline::new(config, Arc::new(LocalEmbedder::new(256)), audit)
    }

    struct FailingEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FailingEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            Err(EmbeddingError::Request {
                provider: "failing".into(),
                message: "connection refused".into(),
            })
        }
        fn dimensions(&self) -> usize {
            8
        }
        fn provider_name(&self) -> &str {
            "failing"
        }
    }

    struct HangingEmbedder;

    #[async_trait]
    impl EmbeddingProvider for HangingEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            std::future::pending().await
        }
        fn dimensions(&self) -> usize {
            8
        }
        fn provider_name(&self) -> &str {
            "hanging"
        }
    }

    struct DownRetriever;

    #[async_trait]
    impl Retriever for DownRetriever {
        async fn search(&self, _q: &str, _k: usize) -> Result<Vec<RawResult>, RetrievalError> {
            Err(RetrievalError::Unavailable {
                message: "503".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_clean_turn_passes_with_citations() {
        let p = pipeline(false);
        let request = TurnRequest::new("price?", "Use /v2/colombian-citizens; it costs $0.25.")
            .with_results(hits());
        let outcome = p.validate_turn(request, &CancellationToken::new()).await;

        assert_eq!(outcome.metadata.groundedness, Groundedness::High);
        assert!(outcome.hallucinations().is_empty());
        assert_eq!(outcome.sanitization.action, SanitizationAction::Passed);
        assert!(outcome.content().contains("**Sources:**"));
        assert!(outcome.semantic.is_none());
        assert_eq!(p.audit().metrics().total_queries, 1);
    }

    #[tokio::test]
    async fn test_reworded_correct_answers_pass_with_semantic_layer() {
        let answers = [
            "Each lookup costs 0.25 USD.",
            "Each lookup costs $0.250.",
            "Call /V2/Colombian-Citizens/ to fetch a record.",
            "It supports citizen lookups for Colombia.",
        ];
        for answer in answers {
            let p = pipeline(true);
            let request = TurnRequest::new("q", answer).with_results(hits());
            let outcome = p.validate_turn(request, &CancellationToken::new()).await;

            let report = outcome.semantic.as_ref().unwrap();
            assert!(report.total_claims() > 0, "{answer}");
            assert!(report.unverified_claims.is_empty(), "{answer}: {report:?}");
            assert!(outcome.hallucinations().is_empty(), "{answer}");
            assert_eq!(outcome.metadata.groundedness, Groundedness::High, "{answer}");
            assert_eq!(outcome.sanitization.action, SanitizationAction::Passed, "{answer}");
            assert_eq!(p.audit().recent_incidents(10).len(), 0);
        }
    }

    #[tokio::test]
    async fn test_semantic_layer_still_flags_wrong_price() {
        let p = pipeline(true);
        let request = TurnRequest::new("q", "Each lookup costs 4.00 USD.").with_results(hits());
        let outcome = p.validate_turn(request, &CancellationToken::new()).await;

        assert!(
            outcome
                .hallucinations()
                .iter()
                .any(|h| h.kind == HallucinationType::FabricatedPrice)
        );
        assert_eq!(outcome.sanitization.action, SanitizationAction::Blocked);
    }

    #[test]
    fn test_from_config_rejects_invalid_config() {
        let mut config = VeracityConfig::default();
        config.sanitizer.warn_threshold = 0.95;
        let audit = Arc::new(AuditSystem::new(AuditConfig::default(), PrivacyConfig::default()));
        let err = ValidationPipeline::from_config(config, audit).err().unwrap();
        assert!(matches!(err, VeracityError::Config(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_from_config_surfaces_embedding_setup_error() {
        let mut config = VeracityConfig::default();
        config.embedding.provider = "openai".into();
        config.embedding.api_key_env = "VERACITY_PIPELINE_KEY_NEVER_SET".into();
        let audit = Arc::new(AuditSystem::new(AuditConfig::default(), PrivacyConfig::default()));
        let err = ValidationPipeline::from_config(config, audit).err().unwrap();
        assert!(matches!(
            err,
            VeracityError::Embedding(EmbeddingError::NotConfigured { .. })
        ));
    }

    #[tokio::test]
    async fn test_fabricated_endpoint_blocked_and_audited() {
        let p = pipeline(false);
        let request =
            TurnRequest::new("how?", "Use endpoint /v99/fake-endpoint").with_results(hits());
        let outcome = p.validate_turn(request, &CancellationToken::new()).await;

        assert_eq!(outcome.sanitization.action, SanitizationAction::Blocked);
        assert!(!outcome.content().contains("/v99/fake-endpoint"));
        assert_eq!(outcome.hallucinations().len(), 1);
        assert_eq!(p.audit().recent_incidents(1)[0].entry_id, outcome.audit_entry_id);
    }

    #[tokio::test]
    async fn test_retriever_failure_degrades_to_ungrounded() {
        let p = pipeline(false).with_retriever(Arc::new(DownRetriever));
        let outcome = p
            .validate_turn(
                TurnRequest::new("anything", "Plain answer."),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(outcome.metadata.groundedness, Groundedness::Ungrounded);
        assert_eq!(outcome.metadata.confidence, 0);
        assert!(outcome.metadata.sources.is_empty());
    }

    #[tokio::test]
    async fn test_retrieve_uses_static_retriever() {
        let p = pipeline(false).with_retriever(Arc::new(StaticRetriever::new(hits())));
        let results = p.retrieve("q").await;
        assert_eq!(results.len(), 2);
        assert!(results[0].score >= results[1].score);
    }

    #[tokio::test]
    async fn test_embedding_failure_adds_warning_not_hallucinations() {
        let audit = Arc::new(AuditSystem::new(AuditConfig::default(), PrivacyConfig::default()));
        let p =
            ValidationPipeline::new(VeracityConfig::default(), Arc::new(FailingEmbedder), audit);
        let request = TurnRequest::new("q", "Use /v2/colombian-citizens; it costs $0.25.")
            .with_results(hits());
        let outcome = p.validate_turn(request, &CancellationToken::new()).await;

        let report = outcome.semantic.as_ref().unwrap();
        assert!(report.errored_claims() > 0);
        assert!(outcome.hallucinations().is_empty());
        assert!(
            outcome
                .metadata
                .validation_result
                .warnings
                .iter()
                .any(|w| w.contains("Semantic verification degraded"))
        );
        assert_eq!(outcome.sanitization.action, SanitizationAction::Passed);
    }

    #[tokio::test]
    async fn test_cancellation_returns_pattern_only_outcome() {
        let audit = Arc::new(AuditSystem::new(AuditConfig::default(), PrivacyConfig::default()));
        let p =
            ValidationPipeline::new(VeracityConfig::default(), Arc::new(HangingEmbedder), audit);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let request =
            TurnRequest::new("q", "Use endpoint /v99/fake-endpoint").with_results(hits());
        let outcome = p.validate_turn(request, &cancel).await;

        assert!(outcome.semantic.is_none());
        assert_eq!(outcome.sanitization.action, SanitizationAction::Blocked);
        assert!(
            outcome
                .metadata
                .validation_result
                .warnings
                .iter()
                .any(|w| w.contains("cancelled"))
        );
        assert_eq!(p.audit().metrics().total_queries, 1);
    }

    #[test]
    fn test_merge_keeps_higher_severity() {
        let pattern = Hallucination::new(HallucinationType::FabricatedPrice, "$9.99", "", 0.8)
            .with_source(DetectionSource::PatternDetector);
        let semantic = Hallucination::new(HallucinationType::FabricatedPrice, "$9.99", "", 0.6)
            .with_source(DetectionSource::SemanticVerifier);
        let other = Hallucination::new(HallucinationType::FabricatedFeature, "webhooks", "", 0.4);

        let merged = merge_hallucinations(vec![semantic.clone()], vec![pattern.clone(), other]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0], pattern);
        assert_eq!(merged[1].kind, HallucinationType::FabricatedFeature);
    }

    #[test]
    fn test_turn_request_json() {
        let request: TurnRequest = serde_json::from_str(
            r#"{"query": "q", "answer": "a",
                "results": [{"id": "x", "score": 0.5, "chunk": {"title": "X"}}]}"#,
        )
        .unwrap();
        assert_eq!(request.session_id, "anonymous");
        assert_eq!(request.results.unwrap()[0].chunk.title, "X");
    }
}
