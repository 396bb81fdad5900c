//! # Veracity Core
//!
//! Hallucination prevention for retrieval-augmented chat answers.
//! Scores how well retrieved sources ground an answer, detects fabricated
//! endpoints, prices and countries, verifies extracted claims by embedding
//! similarity, sanitizes the answer by severity, and keeps a privacy-filtered
//! audit trail with metrics, incidents and alerts.

pub mod audit;
pub mod cache;
pub mod claims;
pub mod config;
pub mod detector;
pub mod embeddings;
pub mod error;
pub mod groundedness;
pub mod metrics;
pub mod persistence;
pub mod pipeline;
pub mod redact;
pub mod retriever;
pub mod sanitizer;
pub mod semantic;
pub mod sources;
pub mod text;
pub mod types;
pub mod validator;

// Re-export commonly used types at the crate root.
pub use audit::{AuditEntry, AuditQuery, AuditRecord, AuditReport, AuditSystem};
pub use cache::{CacheStats, EmbeddingCache};
pub use claims::{Claim, ClaimExtractor, ClaimType, RiskLevel};
pub use config::{VeracityConfig, load_config};
pub use detector::{HallucinationDetector, KnowledgeBase};
pub use embeddings::{EmbeddingProvider, LocalEmbedder, SharedEmbedder, create_embedder};
pub use error::{Result, VeracityError};
pub use groundedness::{GroundednessCalculator, GroundednessScore};
pub use metrics::MetricsSnapshot;
pub use pipeline::{TurnOutcome, TurnRequest, ValidationPipeline};
pub use retriever::{Retriever, StaticRetriever};
pub use sanitizer::{ResponseSanitizer, SanitizationAction, SanitizationResult};
pub use semantic::{SemanticReport, SemanticVerifier};
pub use sources::SourceTracker;
pub use types::{
    Groundedness, Hallucination, HallucinationType, RagMetadata, RawResult, Source,
    ValidationResult, ValidationStatus,
};
pub use validator::RagValidator;
