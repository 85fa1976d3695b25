//! Import pipeline.
//!
//! The [`Pipeline`] drives one provider through listing, per-message
//! processing, and an optional embedding backfill. Runs return an
//! [`ImportReport`]; live progress is readable at any time and published
//! as [`PipelineEvent`]s.

mod orchestrator;

pub use orchestrator::{CancelHandle, Pipeline};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::embedding::{BackfillReport, EmbeddingError};
use crate::providers::{Capabilities, ProviderError, QuotaInfo, RegistryError};
use crate::storage::StorageError;

/// Audit action written for each imported message.
pub const IMPORTED_ACTION: &str = "imported";

/// Phase of the current or last run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    #[default]
    Idle,
    Listing,
    Processing,
    Embedding,
    Done,
    Failed,
}

/// Counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    /// References returned by listing.
    pub found: usize,
    /// Messages fetched and stored.
    pub processed: usize,
    /// Messages already in storage.
    pub skipped: usize,
    /// Messages that could not be handled.
    pub failed: usize,
    pub attachments_processed: usize,
    pub attachments_rejected: usize,
}

impl RunStats {
    /// Records the run has seen in storage, new or existing.
    pub fn touched(&self) -> usize {
        self.processed + self.skipped
    }
}

/// Parameters of a full import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRequest {
    /// Provider search expression.
    pub query: Option<String>,
    /// Cap on references collected across pages.
    pub max_results: Option<usize>,
    /// Inclusive lower bound on message dates.
    pub start_date: Option<DateTime<Utc>>,
    /// Exclusive upper bound on message dates.
    pub end_date: Option<DateTime<Utc>>,
    /// Run the embedding backfill after processing.
    pub generate_embeddings: bool,
}

impl Default for ImportRequest {
    fn default() -> Self {
        Self {
            query: None,
            max_results: None,
            start_date: None,
            end_date: None,
            generate_embeddings: true,
        }
    }
}

/// Result of a completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportReport {
    pub provider: String,
    pub total_found: usize,
    pub stats: RunStats,
    pub touched: usize,
    pub backfill: Option<BackfillReport>,
    /// The run stopped early at a batch boundary.
    pub cancelled: bool,
    pub duration_ms: u64,
}

/// Snapshot of the live run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub state: PipelineState,
    pub stats: RunStats,
}

/// Pipeline overview for operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub provider: String,
    pub capabilities: Capabilities,
    pub authenticated: bool,
    pub state: PipelineState,
    pub total_records: u64,
    pub records_with_vectors: u64,
    pub last_run: Option<RunStats>,
    pub quota: Option<QuotaInfo>,
}

/// Event published by the pipeline.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// A run started for a provider.
    Started { provider: String },
    /// The run entered a new phase.
    StateChanged(PipelineState),
    /// A batch of references finished.
    BatchCompleted {
        batch: usize,
        batches: usize,
        stats: RunStats,
    },
    /// The run completed.
    Completed(ImportReport),
    /// The run failed.
    Failed { provider: String, error: String },
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Run-level failures. Per-message errors are counted, not returned.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("an import is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),
}
