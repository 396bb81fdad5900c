//! Error types for the veracity core library.
//!
//! Uses `thiserror` for public API error types. Nothing in the validation path
//! is fatal: callers of the pipeline always get a best-effort outcome, and these
//! errors surface only from the seams that talk to the outside world
//! (retriever, embedding provider, durable audit storage, configuration).

/// Top-level error type for the veracity core library.
#[derive(Debug, thiserror::Error)]
pub enum VeracityError {
    #[error("Retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Audit error: {0}")]
    Audit(#[from] AuditError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the external search provider.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RetrievalError {
    #[error("Search provider unavailable: {message}")]
    Unavailable { message: String },

    #[error("Search timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

/// Errors from the external embedding provider.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Embedding request to {provider} failed: {message}")]
    Request { provider: String, message: String },

    #[error("Invalid embedding response from {provider}: {message}")]
    InvalidResponse { provider: String, message: String },

    #[error("Embedding call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Embedding provider '{provider}' is not configured: {reason}")]
    NotConfigured { provider: String, reason: String },

    #[error("Embedding call was cancelled")]
    Cancelled,
}

/// Errors from durable audit storage.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuditError {
    #[error("io error: {0}")]
    Io(String),
    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// Errors from the configuration system.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Failed to load configuration: {message}")]
    Load { message: String },
}

/// A type alias for results using the top-level `VeracityError`.
pub type Result<T> = std::result::Result<T, VeracityError>;
