//! Application settings and configuration types.
//!
//! Settings are persisted as JSON in the user's config directory and
//! loaded at startup. Every section has defaults, so a partial file is valid.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::security::MimeDetection;

/// Top-level application settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Mail provider configuration.
    pub providers: ProviderSettings,
    /// Import pipeline tuning.
    pub pipeline: PipelineSettings,
    /// Attachment gate policy.
    pub attachments: AttachmentSettings,
    /// Optional malware scanner.
    pub scanner: ScannerSettings,
    /// Embedding service and backfill.
    pub embedding: EmbeddingSettings,
    /// Database location.
    pub storage: StorageSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

/// Mail provider configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// Provider used when none is named.
    pub default_provider: String,
    /// Providers registered at startup.
    pub enabled: Vec<String>,
    pub gmail: GmailSettings,
    pub local: LocalSettings,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            default_provider: "gmail".to_string(),
            enabled: vec!["gmail".to_string(), "local".to_string()],
            gmail: GmailSettings::default(),
            local: LocalSettings::default(),
        }
    }
}

/// Gmail REST API settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GmailSettings {
    /// OAuth bearer token obtained out of band.
    pub access_token: Option<String>,
    /// API root, overridable for testing.
    pub base_url: String,
}

impl Default for GmailSettings {
    fn default() -> Self {
        Self {
            access_token: None,
            base_url: "https://gmail.googleapis.com/gmail/v1/users/me".to_string(),
        }
    }
}

/// Directory-of-`.eml` provider settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSettings {
    /// Directory scanned for `.eml` files.
    pub directory: Option<PathBuf>,
    /// Account label recorded as provenance.
    pub account: Option<String>,
}

/// Import pipeline tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// References processed per batch. Cancellation is checked between batches.
    pub batch_size: usize,
    /// Page size requested from providers.
    pub max_results_per_page: u32,
    /// Upper bound on any single provider call.
    pub call_timeout_secs: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_results_per_page: 100,
            call_timeout_secs: 30,
        }
    }
}

/// Attachment gate policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachmentSettings {
    pub max_size_bytes: u64,
    pub allowed_mime_types: Vec<String>,
    pub mime_detection: MimeDetection,
}

impl Default for AttachmentSettings {
    fn default() -> Self {
        Self {
            max_size_bytes: 10 * 1024 * 1024,
            allowed_mime_types: [
                "application/pdf",
                "image/jpeg",
                "image/png",
                "image/gif",
                "text/plain",
                "application/msword",
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
                "application/vnd.ms-excel",
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            ]
            .iter()
            .map(|m| m.to_string())
            .collect(),
            mime_detection: MimeDetection::Content,
        }
    }
}

/// clamd connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub timeout_secs: u64,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".to_string(),
            port: 3310,
            timeout_secs: 30,
        }
    }
}

/// Embedding service and backfill settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    /// API key. Embedding is disabled without one.
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    /// Length of every vector.
    pub dimension: usize,
    /// Token budget per text.
    pub max_tokens: usize,
    /// Texts sent per service call.
    pub batch_size: usize,
    /// Records considered per backfill pass.
    pub backfill_limit: usize,
    /// Total attempts per call, including the first.
    pub retry_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub request_timeout_secs: u64,
    /// USD per million tokens.
    pub price_per_million_tokens: f64,
    /// HuggingFace `tokenizer.json`. `cl100k_base` is used without one.
    pub tokenizer_path: Option<PathBuf>,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "text-embedding-3-small".to_string(),
            dimension: 1536,
            max_tokens: 8191,
            batch_size: 100,
            backfill_limit: 1000,
            retry_attempts: 3,
            initial_backoff_ms: 4_000,
            max_backoff_ms: 60_000,
            request_timeout_secs: 60,
            price_per_million_tokens: 0.02,
            tokenizer_path: None,
        }
    }
}

/// Database location.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// SQLite file. Defaults to the user data directory.
    pub database_path: Option<PathBuf>,
}

/// Log output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
