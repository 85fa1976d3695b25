//! Attachment types handed between providers, the gate, and storage.

use serde::{Deserialize, Serialize};

/// Manifest entry for an attachment the provider can serve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    /// Provider-side handle used to download the bytes.
    pub attachment_id: String,
    /// Original filename as sent.
    pub filename: String,
    /// MIME type claimed by the message.
    pub declared_mime: Option<String>,
    /// Size claimed by the provider, in bytes.
    pub size_bytes: u64,
}

/// Downloaded attachment awaiting validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentCandidate {
    pub filename: String,
    pub declared_mime: Option<String>,
    pub data: Vec<u8>,
}

impl AttachmentCandidate {
    pub fn new(filename: impl Into<String>, declared_mime: Option<String>, data: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            declared_mime,
            data,
        }
    }

    /// Size of the downloaded payload in bytes.
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}
