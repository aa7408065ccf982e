use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::embedding::{validate_vectors, Embedder};
use crate::error::MailsiftError;

#[derive(serde::Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(serde::Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Embeddings from an Ollama server's `/api/embed` endpoint.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    dimension: usize,
}

impl OllamaEmbedder {
    pub fn new(url: &str, model: &str, dimension: usize, timeout: Duration) -> Result<Self, MailsiftError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MailsiftError::Config(format!("HTTP client error: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}/api/embed", url.trim_end_matches('/')),
            model: model.to_string(),
            dimension,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn describe(&self) -> String {
        format!("ollama:{} ({} dims)", self.model, self.dimension)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, MailsiftError> {
        let mut batch = self.embed_batch(&[text.to_string()]).await?;
        batch
            .pop()
            .ok_or_else(|| MailsiftError::Embedding("Ollama returned no embedding".into()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MailsiftError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!(count = texts.len(), model = %self.model, "Requesting embeddings from Ollama");

        let resp = self
            .client
            .post(&self.endpoint)
            .json(&EmbedRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    MailsiftError::Timeout(format!("Ollama request timed out: {}", e))
                } else {
                    MailsiftError::Embedding(format!("Ollama request failed: {}", e))
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(MailsiftError::Embedding(format!(
                "Ollama returned {}: {}",
                status, body
            )));
        }

        let parsed: EmbedResponse = resp
            .json()
            .await
            .map_err(|e| MailsiftError::Embedding(format!("Failed to parse Ollama response: {}", e)))?;

        validate_vectors(&parsed.embeddings, texts.len(), self.dimension)?;
        Ok(parsed.embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_strips_trailing_slash() {
        let e = OllamaEmbedder::new("http://localhost:11434/", "nomic-embed-text", 768, Duration::from_secs(5))
            .unwrap();
        assert_eq!(e.endpoint, "http://localhost:11434/api/embed");
        assert_eq!(e.describe(), "ollama:nomic-embed-text (768 dims)");
    }

    #[test]
    fn test_request_shape() {
        let input = vec!["hello".to_string()];
        let json = serde_json::to_value(EmbedRequest {
            model: "m",
            input: &input,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"model": "m", "input": ["hello"]}));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_embedding_failure() {
        let e = OllamaEmbedder::new("http://127.0.0.1:9", "m", 4, Duration::from_millis(500)).unwrap();
        let err = e.embed("hi").await.unwrap_err();
        assert!(matches!(err, MailsiftError::Embedding(_) | MailsiftError::Timeout(_)));
    }
}
