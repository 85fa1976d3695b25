//! Mail provider trait definition.
//!
//! This module defines the [`MailProvider`] trait which abstracts over mail
//! sources (Gmail API, a local `.eml` archive). Every provider lists message
//! references page by page and returns fully normalized messages.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{NormalizedMessage, ProviderMessageId, ThreadId};

/// Result type alias for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Errors that can occur during provider operations.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Authentication failed or credentials expired.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Network or connection error.
    #[error("connection error: {0}")]
    Connection(String),

    /// The call did not finish in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Rate limit exceeded.
    #[error("rate limit exceeded, retry after {retry_after_secs:?} seconds")]
    RateLimited {
        /// Seconds to wait before retrying, if known.
        retry_after_secs: Option<u64>,
    },

    /// Requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid request or parameters.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Provider-specific error.
    #[error("provider error: {0}")]
    Provider(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProviderError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout(_) | Self::RateLimited { .. }
        )
    }
}

/// Credentials handed to [`MailProvider::authenticate`].
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credentials {
    /// The provider needs nothing beyond its configuration.
    #[default]
    None,
    /// An OAuth bearer token obtained out of band.
    BearerToken { access_token: String },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "Credentials::None"),
            Self::BearerToken { .. } => write!(f, "Credentials::BearerToken(<redacted>)"),
        }
    }
}

/// Features a provider advertises. Nothing enforces them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub labels: bool,
    pub threading: bool,
    pub search: bool,
}

/// Rate limits a provider publishes. Informational only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaInfo {
    /// Quota units per day, project wide.
    pub daily_limit: Option<u64>,
    /// Quota units per user per second.
    pub per_user_limit: Option<u64>,
    pub note: Option<String>,
}

/// Bounds on message dates. Either side may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl DateRange {
    /// Lower bound only.
    pub fn since(start: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: None,
        }
    }

    /// Whether `date` falls inside the range. The start is inclusive, the end exclusive.
    pub fn contains(&self, date: &DateTime<Utc>) -> bool {
        self.start.map_or(true, |start| *date >= start) && self.end.map_or(true, |end| *date < end)
    }
}

/// Parameters for one page of [`MailProvider::list_messages`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListQuery {
    /// Provider search expression.
    pub query: Option<String>,
    /// Page size.
    pub max_results: u32,
    /// Opaque cursor from the previous page.
    pub page_token: Option<String>,
    pub date_range: DateRange,
}

/// Reference to a message returned by listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    pub id: ProviderMessageId,
    pub thread_id: Option<ThreadId>,
}

/// One page of message references.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePage {
    pub refs: Vec<MessageRef>,
    /// Cursor for the next page. `None` on the last page.
    pub next_page_token: Option<String>,
    /// Provider's estimate of total matches.
    pub total_estimate: Option<u64>,
}

/// Trait for mail sources.
///
/// Pagination is resumable from the returned token alone, so implementations
/// keep no cursor state between calls.
///
/// # Example
///
/// ```ignore
/// async fn first_page(provider: &dyn MailProvider) -> Result<Vec<MessageRef>> {
///     let page = provider
///         .list_messages(&ListQuery { max_results: 50, ..Default::default() })
///         .await?;
///     Ok(page.refs)
/// }
/// ```
#[async_trait]
pub trait MailProvider: Send + Sync {
    /// Registry name of this provider.
    fn name(&self) -> &str;

    /// Advertised feature flags.
    fn capabilities(&self) -> Capabilities;

    /// Account the provider is bound to, once known.
    fn account(&self) -> Option<String>;

    /// Whether [`authenticate`](Self::authenticate) has succeeded.
    fn is_authenticated(&self) -> bool;

    /// Establishes a session.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Authentication`] if the credentials are rejected.
    async fn authenticate(&mut self, credentials: &Credentials) -> Result<()>;

    /// Published rate limits, if the source has any.
    fn quota_info(&self) -> Option<QuotaInfo> {
        None
    }

    /// Checks that the source is reachable with the current session.
    async fn test_connection(&self) -> bool;

    /// Lists one page of message references.
    async fn list_messages(&self, query: &ListQuery) -> Result<MessagePage>;

    /// Fetches and normalizes one message.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::NotFound`] if the message does not exist.
    async fn get_message(&self, id: &ProviderMessageId) -> Result<NormalizedMessage>;

    /// Downloads the raw bytes of one attachment.
    async fn get_attachment(
        &self,
        message_id: &ProviderMessageId,
        attachment_id: &str,
    ) -> Result<Vec<u8>>;
}
