//! Normalized message types.
//!
//! Every provider converts its native wire format into a [`NormalizedMessage`]
//! before anything downstream sees it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AttachmentRef, ProviderMessageId, ThreadId};

/// A message in the canonical schema shared by all providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedMessage {
    /// Provider-scoped identifier, unique across the store.
    pub id: ProviderMessageId,
    /// Conversation the message belongs to.
    pub thread_id: Option<ThreadId>,
    /// Subject line.
    pub subject: String,
    /// Sender address.
    pub from: Address,
    /// Primary recipients.
    pub to: Vec<Address>,
    /// Carbon copy recipients.
    pub cc: Vec<Address>,
    /// Blind carbon copy recipients.
    pub bcc: Vec<Address>,
    /// Date and time the message was sent.
    pub date: DateTime<Utc>,
    /// Body content in each available form.
    pub body: Body,
    /// Provider labels or folders.
    pub labels: Vec<String>,
    /// Attachments available for download from the provider.
    pub attachments: Vec<AttachmentRef>,
    /// Where the message came from.
    pub provenance: Provenance,
}

impl NormalizedMessage {
    /// Whether the manifest lists at least one attachment.
    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }

    /// All recipients, `to` first, then `cc` and `bcc`.
    pub fn recipients(&self) -> impl Iterator<Item = &Address> {
        self.to.iter().chain(self.cc.iter()).chain(self.bcc.iter())
    }
}

/// Body variants of a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Body {
    pub plain: Option<String>,
    pub html: Option<String>,
    pub markdown: Option<String>,
}

impl Body {
    /// Best text for indexing: markdown, then plain.
    pub fn preferred_text(&self) -> Option<&str> {
        [self.markdown.as_deref(), self.plain.as_deref()]
            .into_iter()
            .flatten()
            .find(|text| !text.trim().is_empty())
    }
}

/// Provider name and account a message was imported from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub provider: String,
    pub account: Option<String>,
}

impl Provenance {
    pub fn new(provider: impl Into<String>, account: Option<String>) -> Self {
        Self {
            provider: provider.into(),
            account,
        }
    }
}

/// An email address with optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// Email address.
    pub email: String,
    /// Display name (e.g., "John Doe").
    pub name: Option<String>,
}

impl Address {
    /// Creates a new address with just an email.
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: None,
        }
    }

    /// Creates a new address with email and display name.
    pub fn with_name(email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: Some(name.into()),
        }
    }

    /// Parses a single header value such as `"John Doe" <john@example.com>`.
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if let Some(start) = value.rfind('<') {
            if let Some(end) = value[start..].find('>') {
                let email = value[start + 1..start + end].trim().to_string();
                let name = value[..start].trim().trim_matches('"').trim();
                return if name.is_empty() {
                    Self::new(email)
                } else {
                    Self::with_name(email, name)
                };
            }
        }
        Self::new(value)
    }

    /// Parses a comma-separated header value into addresses.
    ///
    /// Commas inside quoted display names do not split.
    pub fn parse_list(value: &str) -> Vec<Self> {
        let mut out = Vec::new();
        let mut current = String::new();
        let mut quoted = false;
        for ch in value.chars() {
            match ch {
                '"' => {
                    quoted = !quoted;
                    current.push(ch);
                }
                ',' if !quoted => {
                    if !current.trim().is_empty() {
                        out.push(Self::parse(&current));
                    }
                    current.clear();
                }
                _ => current.push(ch),
            }
        }
        if !current.trim().is_empty() {
            out.push(Self::parse(&current));
        }
        out
    }

    /// Returns the display representation of this address.
    ///
    /// If a name is present, returns "Name <email>", otherwise just the email.
    pub fn display(&self) -> String {
        match &self.name {
            Some(name) => format!("{} <{}>", name, self.email),
            None => self.email.clone(),
        }
    }
}
