//! Retrieval seam. The pipeline consumes any [`Retriever`]; transport to a
//! real vector store lives outside this crate.

use crate::error::RetrievalError;
use crate::types::RawResult;
use async_trait::async_trait;
use std::sync::Arc;

/// A search backend returning scored chunks, best first.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<RawResult>, RetrievalError>;

    fn name(&self) -> &str {
        "retriever"
    }
}

pub type SharedRetriever = Arc<dyn Retriever>;

/// Serves a fixed result set regardless of the query. Used by the CLI when a
/// turn file carries its own results, and by tests.
#[derive(Debug, Clone, Default)]
pub struct StaticRetriever {
    results: Vec<RawResult>,
}

impl StaticRetriever {
    pub fn new(mut results: Vec<RawResult>) -> Self {
        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        Self { results }
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

#[async_trait]
impl Retriever for StaticRetriever {
    async fn search(&self, _query: &str, top_k: usize) -> Result<Vec<RawResult>, RetrievalError> {
        Ok(self.results.iter().take(top_k).cloned().collect())
    }

    fn name(&self) -> &str {
        "static"
    }
}
