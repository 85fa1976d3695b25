//! Vector embeddings for stored messages.
//!
//! # Architecture
//!
//! - [`EmbeddingService`] - remote model turning texts into vectors
//! - [`EmbeddingEngine`] - truncation, batching, retry and backfill over a service
//! - [`TextTokenizer`] - token counting for the per-text budget
//! - [`EmbeddingVector`] - a fixed-dimension vector, with the zero sentinel
//!
//! # Example
//!
//! ```ignore
//! use mailvault::embedding::{EmbeddingEngine, HeuristicTokenizer, OpenAiEmbeddings};
//!
//! let service = OpenAiEmbeddings::new(key, OPENAI_API_BASE, DEFAULT_MODEL, 1536, timeout)?;
//! let engine = EmbeddingEngine::new(Arc::new(service), Arc::new(HeuristicTokenizer));
//! let report = engine.backfill(&store, 1000).await?;
//! ```

use std::time::Duration;

use crate::storage::StorageError;

mod engine;
mod service;
mod tokenizer;
mod vector;

pub use engine::{
    estimate_cost, find_similar, prepare_message_text, BackfillReport, CostEstimate,
    EmbeddingEngine, RetryPolicy, DEFAULT_SIMILARITY_THRESHOLD, DEFAULT_TOP_K, MAX_CONTENT_CHARS,
};
pub use service::{
    EmbeddingService, OpenAiEmbeddings, DEFAULT_DIMENSION, DEFAULT_MODEL, OPENAI_API_BASE,
};
pub use tokenizer::{
    truncate_to_budget, HeuristicTokenizer, HfTokenizer, TextTokenizer, TiktokenTokenizer,
};
pub use vector::{rank_by_similarity, EmbeddingVector};

/// Errors from embedding operations.
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("embedding request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("rate limit exceeded, retry after {retry_after_secs:?} seconds")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("gave up after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl EmbeddingError {
    /// Whether the same call may succeed later.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Connection(_) | Self::RateLimited { .. } => true,
            Self::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
