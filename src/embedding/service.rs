//! Remote embedding service client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{EmbeddingError, EmbeddingVector};

pub const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_DIMENSION: usize = 1536;

/// A service turning texts into vectors, one per input in input order.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    /// Model identifier recorded with the vectors.
    fn model(&self) -> &str;

    /// Length of every returned vector.
    fn dimension(&self) -> usize;

    /// Embeds a non-empty batch of texts.
    async fn embed(&self, texts: &[String]) -> Result<Vec<EmbeddingVector>, EmbeddingError>;
}

/// OpenAI-compatible `/embeddings` endpoint.
#[derive(Debug)]
pub struct OpenAiEmbeddings {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    dimension: usize,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequestBody<'a> {
    input: &'a [String],
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponseBody {
    data: Vec<EmbeddingData>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    total_tokens: u64,
}

impl OpenAiEmbeddings {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        dimension: usize,
        timeout: Duration,
    ) -> Result<Self, EmbeddingError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EmbeddingError::Connection(format!("build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: base_url.into(),
            model: model.into(),
            dimension,
            timeout,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Only the v3 models accept a requested output size.
    fn requested_dimensions(&self) -> Option<usize> {
        self.model
            .starts_with("text-embedding-3")
            .then_some(self.dimension)
    }

    async fn error_for(response: reqwest::Response) -> EmbeddingError {
        let status = response.status().as_u16();
        let retry_after_secs = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unable to read body>".to_string());

        match status {
            401 | 403 => EmbeddingError::Authentication(body),
            429 => EmbeddingError::RateLimited { retry_after_secs },
            _ => EmbeddingError::Api { status, body },
        }
    }
}

#[async_trait]
impl EmbeddingService for OpenAiEmbeddings {
    fn model(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<EmbeddingVector>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = EmbeddingRequestBody {
            input: texts,
            model: &self.model,
            dimensions: self.requested_dimensions(),
        };

        let response = self
            .client
            .post(self.endpoint("/embeddings"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EmbeddingError::Timeout(self.timeout)
                } else {
                    EmbeddingError::Connection(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        let mut parsed: EmbeddingResponseBody = response
            .json()
            .await
            .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;

        if parsed.data.len() != texts.len() {
            return Err(EmbeddingError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }
        parsed.data.sort_by_key(|d| d.index);

        if let Some(bad) = parsed
            .data
            .iter()
            .find(|d| d.embedding.len() != self.dimension)
        {
            return Err(EmbeddingError::InvalidResponse(format!(
                "expected dimension {}, got {}",
                self.dimension,
                bad.embedding.len()
            )));
        }

        if let Some(usage) = parsed.usage {
            tracing::debug!(
                model = %self.model,
                texts = texts.len(),
                tokens = usage.total_tokens,
                "Embedding request completed"
            );
        }

        Ok(parsed
            .data
            .into_iter()
            .map(|d| EmbeddingVector::new(d.embedding))
            .collect())
    }
}
