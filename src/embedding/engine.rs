//! Embedding engine: budgeted, batched, retried calls to an [`EmbeddingService`].

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::tokenizer::{truncate_to_budget, TextTokenizer};
use super::{rank_by_similarity, EmbeddingError, EmbeddingService, EmbeddingVector};
use crate::config::EmbeddingSettings;
use crate::domain::NormalizedMessage;
use crate::storage::MessageStore;

/// Characters of body kept by [`prepare_message_text`].
pub const MAX_CONTENT_CHARS: usize = 10_000;

/// Recipients listed by [`prepare_message_text`].
const MAX_LISTED_RECIPIENTS: usize = 5;

/// Labels that say nothing about content.
const SYSTEM_LABELS: [&str; 3] = ["INBOX", "SENT", "UNREAD"];

pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.7;
pub const DEFAULT_TOP_K: usize = 10;

/// Exponential backoff for transient service errors.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_secs(4),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (zero-based).
    pub fn delay(&self, retry: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(2_u32.saturating_pow(retry))
            .min(self.max_backoff)
    }

    /// Delay before retry number `retry` after `err`. A server wait hint
    /// is a floor under the backoff.
    pub fn delay_after(&self, retry: u32, err: &EmbeddingError) -> Duration {
        let backoff = self.delay(retry);
        match err {
            EmbeddingError::RateLimited {
                retry_after_secs: Some(secs),
            } => backoff.max(Duration::from_secs(*secs)),
            _ => backoff,
        }
    }
}

/// Offline cost projection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub texts: usize,
    pub tokens: u64,
    pub cost_usd: f64,
}

/// Outcome of one [`EmbeddingEngine::backfill`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillReport {
    /// Records found without a vector.
    pub candidates: usize,
    /// Records given a real vector.
    pub embedded: usize,
    /// Records given the zero sentinel.
    pub zero_filled: usize,
    /// Records left without a vector.
    pub failed: usize,
}

/// Turns text into vectors within a token budget.
pub struct EmbeddingEngine {
    service: Arc<dyn EmbeddingService>,
    tokenizer: Arc<dyn TextTokenizer>,
    max_tokens: usize,
    batch_size: usize,
    retry: RetryPolicy,
    call_timeout: Duration,
    price_per_million_tokens: f64,
}

impl EmbeddingEngine {
    pub fn new(service: Arc<dyn EmbeddingService>, tokenizer: Arc<dyn TextTokenizer>) -> Self {
        Self {
            service,
            tokenizer,
            max_tokens: 8191,
            batch_size: 100,
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(60),
            price_per_million_tokens: 0.02,
        }
    }

    /// Applies the tunables from configuration.
    pub fn from_settings(
        service: Arc<dyn EmbeddingService>,
        tokenizer: Arc<dyn TextTokenizer>,
        settings: &EmbeddingSettings,
    ) -> Self {
        Self::new(service, tokenizer)
            .with_max_tokens(settings.max_tokens)
            .with_batch_size(settings.batch_size)
            .with_retry(RetryPolicy {
                attempts: settings.retry_attempts,
                initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
                max_backoff: Duration::from_millis(settings.max_backoff_ms),
            })
            .with_call_timeout(Duration::from_secs(settings.request_timeout_secs))
            .with_price(settings.price_per_million_tokens)
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_price(mut self, price_per_million_tokens: f64) -> Self {
        self.price_per_million_tokens = price_per_million_tokens;
        self
    }

    pub fn dimension(&self) -> usize {
        self.service.dimension()
    }

    pub fn model(&self) -> &str {
        self.service.model()
    }

    /// Cuts `text` to the configured token budget.
    pub fn truncate(&self, text: &str) -> Result<String, EmbeddingError> {
        truncate_to_budget(self.tokenizer.as_ref(), text, self.max_tokens)
    }

    /// Embeds one text. Blank text yields the zero sentinel without a service call.
    pub async fn embed_text(&self, text: &str) -> Result<EmbeddingVector, EmbeddingError> {
        if text.trim().is_empty() {
            return Ok(EmbeddingVector::zeros(self.dimension()));
        }
        let truncated = self.truncate(text)?;
        let mut vectors = self.call_with_retry(&[truncated]).await?;
        vectors
            .pop()
            .ok_or_else(|| EmbeddingError::InvalidResponse("empty response".to_string()))
    }

    /// Embeds `texts` in order. Any item that cannot be embedded fails the call.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<EmbeddingVector>, EmbeddingError> {
        self.embed_batch_isolated(texts).await.into_iter().collect()
    }

    /// Embeds `texts` in order, reporting each item separately.
    ///
    /// Blank texts get the zero sentinel at their original position. When a
    /// chunk fails after retries its members are retried one at a time.
    pub async fn embed_batch_isolated(
        &self,
        texts: &[String],
    ) -> Vec<Result<EmbeddingVector, EmbeddingError>> {
        let dimension = self.dimension();
        let mut results: Vec<Option<Result<EmbeddingVector, EmbeddingError>>> =
            texts.iter().map(|_| None).collect();

        let mut pending: Vec<(usize, String)> = Vec::new();
        for (position, text) in texts.iter().enumerate() {
            if text.trim().is_empty() {
                results[position] = Some(Ok(EmbeddingVector::zeros(dimension)));
                continue;
            }
            match self.truncate(text) {
                Ok(truncated) => pending.push((position, truncated)),
                Err(e) => results[position] = Some(Err(e)),
            }
        }

        for chunk in pending.chunks(self.batch_size) {
            let inputs: Vec<String> = chunk.iter().map(|(_, t)| t.clone()).collect();
            match self.call_with_retry(&inputs).await {
                Ok(vectors) => {
                    for ((position, _), vector) in chunk.iter().zip(vectors) {
                        results[*position] = Some(Ok(vector));
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        size = chunk.len(),
                        error = %e,
                        "Batch embedding failed, falling back to single items"
                    );
                    for (position, text) in chunk {
                        let outcome = self
                            .call_with_retry(std::slice::from_ref(text))
                            .await
                            .and_then(|mut v| {
                                v.pop().ok_or_else(|| {
                                    EmbeddingError::InvalidResponse("empty response".to_string())
                                })
                            });
                        results[*position] = Some(outcome);
                    }
                }
            }
        }

        results
            .into_iter()
            .map(|r| {
                r.unwrap_or_else(|| Err(EmbeddingError::InvalidResponse("missing result".to_string())))
            })
            .collect()
    }

    /// One service call with timeout and backoff on transient errors.
    async fn call_with_retry(&self, texts: &[String]) -> Result<Vec<EmbeddingVector>, EmbeddingError> {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(self.call_timeout, self.service.embed(texts)).await {
                Ok(Ok(vectors)) if vectors.len() == texts.len() => Ok(vectors),
                Ok(Ok(vectors)) => Err(EmbeddingError::InvalidResponse(format!(
                    "expected {} embeddings, got {}",
                    texts.len(),
                    vectors.len()
                ))),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(EmbeddingError::Timeout(self.call_timeout)),
            };

            let err = match outcome {
                Ok(vectors) => return Ok(vectors),
                Err(e) => e,
            };

            if !err.is_transient() {
                return Err(err);
            }
            if attempt >= attempts {
                return Err(EmbeddingError::RetryExhausted {
                    attempts,
                    last_error: err.to_string(),
                });
            }

            let delay = self.retry.delay_after(attempt - 1, &err);
            tracing::warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Embedding call failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Projects token usage and price for `count` texts.
    pub fn estimate_cost(&self, count: usize, avg_tokens_per_text: usize) -> CostEstimate {
        estimate_cost(count, avg_tokens_per_text, self.price_per_million_tokens)
    }

    /// Embeds up to `limit` stored records that lack a vector, newest first.
    ///
    /// Each vector is written once. Items that still fail after the
    /// per-item fallback are counted and left for a later pass.
    pub async fn backfill(
        &self,
        store: &dyn MessageStore,
        limit: usize,
    ) -> Result<BackfillReport, EmbeddingError> {
        let candidates = store.list_without_vector(limit).await?;
        let mut report = BackfillReport {
            candidates: candidates.len(),
            ..Default::default()
        };
        if candidates.is_empty() {
            return Ok(report);
        }

        tracing::info!(candidates = candidates.len(), model = %self.model(), "Starting embedding backfill");

        for chunk in candidates.chunks(self.batch_size) {
            let texts: Vec<String> = chunk
                .iter()
                .map(|stored| prepare_message_text(&stored.message))
                .collect();
            let outcomes = self.embed_batch_isolated(&texts).await;

            for (stored, outcome) in chunk.iter().zip(outcomes) {
                let vector = match outcome {
                    Ok(vector) => vector,
                    Err(e) => {
                        tracing::warn!(message_id = %stored.message.id, error = %e, "Failed to embed message");
                        report.failed += 1;
                        continue;
                    }
                };
                if let Err(e) = store.update_vector(stored.id, &vector).await {
                    tracing::warn!(message_id = %stored.message.id, error = %e, "Failed to store vector");
                    report.failed += 1;
                    continue;
                }
                if vector.is_zero() {
                    report.zero_filled += 1;
                } else {
                    report.embedded += 1;
                }
            }
        }

        tracing::info!(
            embedded = report.embedded,
            zero_filled = report.zero_filled,
            failed = report.failed,
            "Embedding backfill finished"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for EmbeddingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingEngine")
            .field("model", &self.service.model())
            .field("dimension", &self.service.dimension())
            .field("max_tokens", &self.max_tokens)
            .field("batch_size", &self.batch_size)
            .field("retry", &self.retry)
            .finish()
    }
}

/// Projects token usage and price, rounding the cost to four decimals.
pub fn estimate_cost(count: usize, avg_tokens_per_text: usize, price_per_million_tokens: f64) -> CostEstimate {
    let tokens = (count as u64).saturating_mul(avg_tokens_per_text as u64);
    let cost = tokens as f64 / 1_000_000.0 * price_per_million_tokens;
    CostEstimate {
        texts: count,
        tokens,
        cost_usd: (cost * 10_000.0).round() / 10_000.0,
    }
}

/// Renders the text that represents `message` for embedding.
pub fn prepare_message_text(message: &NormalizedMessage) -> String {
    let mut parts = vec![
        format!("Subject: {}", message.subject),
        match &message.from.name {
            Some(name) => format!("From: {} ({})", name, message.from.email),
            None => format!("From: {}", message.from.email),
        },
    ];

    if !message.to.is_empty() {
        let recipients: Vec<String> = message
            .to
            .iter()
            .take(MAX_LISTED_RECIPIENTS)
            .map(|a| a.display())
            .collect();
        parts.push(format!("To: {}", recipients.join(", ")));
    }

    parts.push(format!("Date: {}", message.date.format("%Y-%m-%d")));

    if let Some(body) = message.body.preferred_text() {
        let mut content: String = body.chars().take(MAX_CONTENT_CHARS).collect();
        if body.chars().count() > MAX_CONTENT_CHARS {
            content.push_str("...");
        }
        parts.push(format!("\nContent:\n{}", content));
    }

    let labels: Vec<&str> = message
        .labels
        .iter()
        .map(String::as_str)
        .filter(|l| !SYSTEM_LABELS.contains(l))
        .collect();
    if !labels.is_empty() {
        parts.push(format!("Labels: {}", labels.join(", ")));
    }

    parts.join("\n")
}

/// Ranks `candidates` against `query`. Zero sentinels never match.
pub fn find_similar<'a, K>(
    query: &EmbeddingVector,
    candidates: impl IntoIterator<Item = (K, &'a EmbeddingVector)>,
    top_k: usize,
    threshold: f32,
) -> Vec<(K, f32)> {
    rank_by_similarity(query, candidates, top_k, threshold)
}
