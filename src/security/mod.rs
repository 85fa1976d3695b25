//! Attachment security gate.
//!
//! Every attachment is validated here before it reaches storage:
//!
//! - [`AttachmentGate`] - ordered size, type, extension, and malware checks
//! - [`sanitize_filename`] - makes a name safe to write to disk
//! - [`MalwareScanner`] - optional scanning backend, [`ClamdScanner`] for clamd

mod filename;
mod gate;
pub mod mime;
mod scanner;

pub use filename::{dangerous_extension, extension, sanitize_filename, DANGEROUS_EXTENSIONS};
pub use gate::{
    content_hash, Admission, AttachmentGate, AttachmentVerdict, GatePolicy, Issue, IssueKind,
    ScanReport, Severity,
};
pub use mime::MimeDetection;
pub use scanner::{ClamdScanner, MalwareScanner, ScanError, ScanOutcome};

use base64::prelude::*;
use thiserror::Error;

/// Errors raised while preparing attachments for storage.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("Invalid attachment encoding: {0}")]
    InvalidEncoding(#[from] base64::DecodeError),

    #[error("Failed to serialize verdict: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Encodes attachment bytes for storage.
pub fn encode_safe(data: &[u8]) -> String {
    BASE64_STANDARD.encode(data)
}

/// Decodes attachment bytes read back from storage.
pub fn decode_safe(encoded: &str) -> Result<Vec<u8>, GateError> {
    Ok(BASE64_STANDARD.decode(encoded.trim())?)
}
