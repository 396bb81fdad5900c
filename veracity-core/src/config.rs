//! Configuration system for veracity.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! explicit config file -> environment -> explicit overrides. The user config
//! lives at `~/.config/veracity/config.toml`; environment variables use the
//! `VERACITY_` prefix with `__` separating sections
//! (`VERACITY_SANITIZER__BLOCK_THRESHOLD=0.9`).

use crate::error::ConfigError;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration for the validation pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VeracityConfig {
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub sanitizer: SanitizerConfig,
    #[serde(default)]
    pub semantic: SemanticConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub privacy: PrivacyConfig,
}

impl VeracityConfig {
    /// Collect every configuration problem across sections.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = self.validation.validate();
        problems.extend(self.sanitizer.validate());
        problems.extend(self.semantic.validate());
        problems.extend(self.embedding.validate());
        problems.extend(self.audit.validate());
        problems
    }

    /// Fail with every problem [`validate`](Self::validate) finds.
    pub fn ensure_valid(&self) -> Result<(), ConfigError> {
        let problems = self.validate();
        if problems.is_empty() {
            return Ok(());
        }
        Err(ConfigError::Invalid {
            message: problems.join("; "),
        })
    }
}

/// Retrieval filtering and groundedness scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Hits scoring below this are discarded before deduplication.
    pub min_score_threshold: f64,
    /// Treat any high-severity hallucination as an invalid answer.
    pub strict_mode: bool,
    /// Subtracted from the weighted score when fewer than two sources survive.
    pub low_source_penalty: f64,
    pub high_threshold: f64,
    pub medium_threshold: f64,
    pub low_threshold: f64,
    /// Base URL used to build display links from `sourcePath`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docs_base_url: Option<String>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_score_threshold: 0.25,
            strict_mode: false,
            low_source_penalty: 0.10,
            high_threshold: 0.45,
            medium_threshold: 0.30,
            low_threshold: 0.15,
            docs_base_url: None,
        }
    }
}

impl ValidationConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if !unit_range(self.min_score_threshold) {
            problems.push("validation.min_score_threshold must be within [0, 1]".to_string());
        }
        if !unit_range(self.low_source_penalty) {
            problems.push("validation.low_source_penalty must be within [0, 1]".to_string());
        }
        if !(self.high_threshold > self.medium_threshold
            && self.medium_threshold > self.low_threshold
            && self.low_threshold >= 0.0
            && self.high_threshold <= 1.0)
        {
            problems.push(
                "validation thresholds must satisfy 1 >= high > medium > low >= 0".to_string(),
            );
        }
        problems
    }
}

/// Response sanitizer policy ladder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SanitizerConfig {
    /// When false the answer is passed through untouched.
    pub enabled: bool,
    pub block_threshold: f64,
    pub redact_threshold: f64,
    pub warn_threshold: f64,
    pub append_citations: bool,
    /// Only sources at or above this score are cited.
    pub min_citation_score: f64,
    pub max_citations: usize,
    /// Source titles suggested alongside the fallback message.
    pub max_related_sources: usize,
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            block_threshold: 0.80,
            redact_threshold: 0.50,
            warn_threshold: 0.30,
            append_citations: true,
            min_citation_score: 0.5,
            max_citations: 5,
            max_related_sources: 3,
        }
    }
}

impl SanitizerConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if !(self.block_threshold > self.redact_threshold
            && self.redact_threshold > self.warn_threshold
            && self.warn_threshold >= 0.0
            && self.block_threshold <= 1.0)
        {
            problems.push(
                "sanitizer thresholds must satisfy 1 >= block > redact > warn >= 0".to_string(),
            );
        }
        problems
    }
}

/// Embedding-based claim verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SemanticConfig {
    pub enabled: bool,
    /// A claim is verified when its best similarity reaches this value.
    pub verification_threshold: f64,
    pub max_claims: usize,
    /// Characters of each source embedded for comparison.
    pub source_prefix_chars: usize,
    /// Per-call timeout for the embedding provider.
    pub embed_timeout_ms: u64,
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            verification_threshold: 0.70,
            max_claims: 10,
            source_prefix_chars: 500,
            embed_timeout_ms: 5000,
        }
    }
}

impl SemanticConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if !unit_range(self.verification_threshold) {
            problems.push("semantic.verification_threshold must be within [0, 1]".to_string());
        }
        if self.max_claims == 0 {
            problems.push("semantic.max_claims must be at least 1".to_string());
        }
        if self.embed_timeout_ms == 0 {
            problems.push("semantic.embed_timeout_ms must be positive".to_string());
        }
        problems
    }
}

/// Embedding provider selection and cache sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Provider name: "local" (default), "openai" or "ollama".
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Environment variable holding the provider API key.
    pub api_key_env: String,
    /// Dimensionality of the local embedder.
    pub dimensions: usize,
    pub cache_size: usize,
    pub cache_ttl_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "local".into(),
            model: None,
            base_url: None,
            api_key_env: "OPENAI_API_KEY".into(),
            dimensions: 256,
            cache_size: 100,
            cache_ttl_secs: 300,
        }
    }
}

impl EmbeddingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if !matches!(self.provider.as_str(), "local" | "openai" | "ollama") {
            problems.push(format!(
                "embedding.provider '{}' is not supported (expected local, openai or ollama)",
                self.provider
            ));
        }
        if self.provider == "local" && self.dimensions == 0 {
            problems.push("embedding.dimensions must be positive".to_string());
        }
        if self.cache_size == 0 {
            problems.push("embedding.cache_size must be at least 1".to_string());
        }
        problems
    }
}

/// External search provider call settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub timeout_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            timeout_ms: 5000,
        }
    }
}

/// Audit log, incident tracking and alert thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Durable JSON log. When unset the audit trail stays in memory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
    pub max_memory_entries: usize,
    pub flush_interval_secs: u64,
    pub max_incidents: usize,
    /// Occurrences after which an incident pattern counts as recurring.
    pub recurring_threshold: u64,
    pub hallucination_rate_alert: f64,
    pub block_rate_alert: f64,
    pub avg_severity_alert: f64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_path: None,
            max_memory_entries: 1000,
            flush_interval_secs: 60,
            max_incidents: 500,
            recurring_threshold: 3,
            hallucination_rate_alert: 0.20,
            block_rate_alert: 0.10,
            avg_severity_alert: 0.60,
        }
    }
}

impl AuditConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.max_memory_entries == 0 {
            problems.push("audit.max_memory_entries must be at least 1".to_string());
        }
        if self.flush_interval_secs == 0 {
            problems.push("audit.flush_interval_secs must be positive".to_string());
        }
        if self.recurring_threshold == 0 {
            problems.push("audit.recurring_threshold must be at least 1".to_string());
        }
        problems
    }
}

/// What the audit trail is allowed to keep about users.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    pub hash_queries: bool,
    pub hash_responses: bool,
    pub redact_pii: bool,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            hash_queries: false,
            hash_responses: true,
            redact_pii: true,
        }
    }
}

fn unit_range(value: f64) -> bool {
    (0.0..=1.0).contains(&value)
}

/// Resolve the effective configuration. Later layers win:
/// built-in defaults, the user config (`~/.config/veracity/config.toml`),
/// `config_file`, `VERACITY_*` environment variables, then `overrides`.
pub fn load_config(
    config_file: Option<&Path>,
    overrides: Option<&VeracityConfig>,
) -> Result<VeracityConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(VeracityConfig::default()));

    if let Some(user_config) = user_config_path()
        && user_config.exists()
    {
        figment = figment.merge(Toml::file(&user_config));
    }

    if let Some(path) = config_file {
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("VERACITY_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(|e| ConfigError::Load {
        message: e.to_string(),
    })
}

/// Location of the user-level config file, if the platform has one.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "veracity", "veracity")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}
