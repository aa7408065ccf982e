//! Embedding strategies behind a single `embed` capability
//!
//! The backend is chosen from configuration; the sync engine and search
//! only see `dyn Embedder`.

pub mod hashing;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::adapters::ollama::OllamaEmbedder;
use crate::config::{EmbeddingBackend, EmbeddingConfig};
use crate::error::MailsiftError;
pub use hashing::HashingEmbedder;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Length of every vector this embedder returns.
    fn dimension(&self) -> usize;

    /// Model or strategy name, for logs and status output.
    fn describe(&self) -> String;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, MailsiftError>;

    /// Embed several texts, preserving order. Backends with batched
    /// inference override this.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MailsiftError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }
}

/// Check a batch of vectors against the declared dimension.
pub fn validate_vectors(
    vectors: &[Vec<f32>],
    expected_len: usize,
    dimension: usize,
) -> Result<(), MailsiftError> {
    if vectors.len() != expected_len {
        return Err(MailsiftError::Embedding(format!(
            "expected {} vectors, got {}",
            expected_len,
            vectors.len()
        )));
    }
    for (i, v) in vectors.iter().enumerate() {
        if v.len() != dimension {
            return Err(MailsiftError::Embedding(format!(
                "vector {} has dimension {}, expected {}",
                i,
                v.len(),
                dimension
            )));
        }
        if v.iter().any(|x| !x.is_finite()) {
            return Err(MailsiftError::Embedding(format!("vector {} has non-finite values", i)));
        }
    }
    Ok(())
}

pub fn from_config(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>, MailsiftError> {
    if config.dimension == 0 {
        return Err(MailsiftError::Config("embedding dimension must be positive".into()));
    }
    let embedder: Arc<dyn Embedder> = match config.backend {
        EmbeddingBackend::Ollama => Arc::new(OllamaEmbedder::new(
            &config.url,
            &config.model,
            config.dimension,
            Duration::from_secs(config.timeout_secs),
        )?),
        EmbeddingBackend::Hashing => Arc::new(HashingEmbedder::new(config.dimension)),
    };
    Ok(embedder)
}
