//! Attachment validation.
//!
//! Checks run in a fixed order: size, mime detection, declared/detected
//! mismatch, allow-list, dangerous extension, then malware scan. The scan
//! only runs when every earlier check passed.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};

use super::filename::{dangerous_extension, sanitize_filename};
use super::mime::{self, MimeDetection};
use super::scanner::{MalwareScanner, ScanOutcome};
use super::{encode_safe, GateError};
use crate::config::AttachmentSettings;
use crate::domain::AttachmentCandidate;
use crate::storage::NewAttachment;

/// Whether an issue rejects the attachment on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Gating,
    Informational,
}

/// What a check found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IssueKind {
    TooLarge { size: u64, max: u64 },
    MimeMismatch { declared: String, detected: String },
    MimeNotAllowed { mime: String },
    MimeUnknown,
    DangerousExtension { extension: String },
    MalwareDetected { label: String },
    ScanUnavailable { reason: String },
}

impl IssueKind {
    pub fn severity(&self) -> Severity {
        match self {
            Self::TooLarge { .. }
            | Self::MimeNotAllowed { .. }
            | Self::DangerousExtension { .. }
            | Self::MalwareDetected { .. } => Severity::Gating,
            Self::MimeMismatch { .. } | Self::MimeUnknown | Self::ScanUnavailable { .. } => {
                Severity::Informational
            }
        }
    }
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooLarge { size, max } => write!(f, "File too large: {size} bytes (max: {max})"),
            Self::MimeMismatch { declared, detected } => write!(
                f,
                "MIME type mismatch: declared={declared}, detected={detected}"
            ),
            Self::MimeNotAllowed { mime } => write!(f, "MIME type not allowed: {mime}"),
            Self::MimeUnknown => write!(f, "MIME type could not be determined"),
            Self::DangerousExtension { extension } => {
                write!(f, "Dangerous file extension: .{extension}")
            }
            Self::MalwareDetected { label } => write!(f, "Virus detected: {label}"),
            Self::ScanUnavailable { reason } => write!(f, "Virus scan failed: {reason}"),
        }
    }
}

/// One finding in a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    #[serde(flatten)]
    pub kind: IssueKind,
    pub severity: Severity,
    pub message: String,
}

impl From<IssueKind> for Issue {
    fn from(kind: IssueKind) -> Self {
        Self {
            severity: kind.severity(),
            message: kind.to_string(),
            kind,
        }
    }
}

/// What happened to the malware scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScanReport {
    /// No scanner is configured.
    NotConfigured,
    /// An earlier check already rejected the payload.
    NotRun,
    Clean,
    Infected { label: String },
    /// The scanner could not be reached or timed out.
    Unavailable { error: String },
}

/// The gate's decision about one attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachmentVerdict {
    pub filename: String,
    pub size_bytes: u64,
    pub declared_mime: Option<String>,
    pub detected_mime: Option<String>,
    /// Lowercase hex sha-256 of the payload.
    pub content_hash: String,
    /// False iff at least one gating issue fired.
    pub is_safe: bool,
    /// Findings in check order.
    pub issues: Vec<Issue>,
    pub scan: ScanReport,
}

impl AttachmentVerdict {
    /// Issues that rejected the attachment.
    pub fn gating_issues(&self) -> impl Iterator<Item = &Issue> {
        self.issues
            .iter()
            .filter(|issue| issue.severity == Severity::Gating)
    }

    /// Issue messages, for logging.
    pub fn issue_messages(&self) -> Vec<&str> {
        self.issues.iter().map(|issue| issue.message.as_str()).collect()
    }
}

/// Outcome of admitting an attachment for storage.
#[derive(Debug, Clone)]
pub enum Admission {
    Accepted {
        attachment: NewAttachment,
        verdict: AttachmentVerdict,
    },
    Rejected { verdict: AttachmentVerdict },
}

/// Size and type limits applied by the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatePolicy {
    pub max_size_bytes: u64,
    /// Normalized mime types accepted.
    pub allowed_mime_types: BTreeSet<String>,
    pub detection: MimeDetection,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self::from(&AttachmentSettings::default())
    }
}

impl From<&AttachmentSettings> for GatePolicy {
    fn from(settings: &AttachmentSettings) -> Self {
        Self {
            max_size_bytes: settings.max_size_bytes,
            allowed_mime_types: settings
                .allowed_mime_types
                .iter()
                .map(|m| mime::normalize(m))
                .collect(),
            detection: settings.mime_detection,
        }
    }
}

/// Validates untrusted attachment bytes before persistence.
#[derive(Clone)]
pub struct AttachmentGate {
    policy: GatePolicy,
    scanner: Option<Arc<dyn MalwareScanner>>,
    scan_timeout: Duration,
}

impl AttachmentGate {
    /// Creates a gate without a malware scanner.
    pub fn new(policy: GatePolicy) -> Self {
        Self {
            policy,
            scanner: None,
            scan_timeout: Duration::from_secs(30),
        }
    }

    /// Attaches a malware scanner bounded by `timeout`.
    pub fn with_scanner(mut self, scanner: Arc<dyn MalwareScanner>, timeout: Duration) -> Self {
        self.scanner = Some(scanner);
        self.scan_timeout = timeout;
        self
    }

    /// Returns the active policy.
    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    /// Runs every check against one payload.
    pub async fn validate(
        &self,
        filename: &str,
        data: &[u8],
        declared_mime: Option<&str>,
    ) -> AttachmentVerdict {
        let size = data.len() as u64;
        let declared = declared_mime
            .map(mime::normalize)
            .filter(|m| !m.is_empty());
        let mut issues: Vec<Issue> = Vec::new();

        if size > self.policy.max_size_bytes {
            issues.push(
                IssueKind::TooLarge {
                    size,
                    max: self.policy.max_size_bytes,
                }
                .into(),
            );
        }

        let detected = mime::detect(self.policy.detection, data, filename);

        if let (Some(declared), Some(detected)) = (&declared, &detected) {
            if declared != detected {
                issues.push(
                    IssueKind::MimeMismatch {
                        declared: declared.clone(),
                        detected: detected.clone(),
                    }
                    .into(),
                );
            }
        }

        match detected.as_ref().or(declared.as_ref()) {
            Some(mime) if !self.policy.allowed_mime_types.contains(mime) => {
                issues.push(IssueKind::MimeNotAllowed { mime: mime.clone() }.into());
            }
            Some(_) => {}
            None => issues.push(IssueKind::MimeUnknown.into()),
        }

        if let Some(extension) = dangerous_extension(filename) {
            issues.push(IssueKind::DangerousExtension { extension }.into());
        }

        let rejected = issues.iter().any(|i| i.severity == Severity::Gating);
        let scan = match (&self.scanner, rejected) {
            (None, _) => ScanReport::NotConfigured,
            (Some(_), true) => ScanReport::NotRun,
            (Some(scanner), false) => {
                match tokio::time::timeout(self.scan_timeout, scanner.scan(data)).await {
                    Ok(Ok(ScanOutcome::Clean)) => ScanReport::Clean,
                    Ok(Ok(ScanOutcome::Infected { label })) => {
                        issues.push(IssueKind::MalwareDetected { label: label.clone() }.into());
                        ScanReport::Infected { label }
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(filename, error = %e, "malware scan unavailable, continuing");
                        issues.push(IssueKind::ScanUnavailable { reason: e.to_string() }.into());
                        ScanReport::Unavailable {
                            error: e.to_string(),
                        }
                    }
                    Err(_) => {
                        let reason = format!("timed out after {:?}", self.scan_timeout);
                        tracing::warn!(filename, %reason, "malware scan unavailable, continuing");
                        issues.push(IssueKind::ScanUnavailable { reason: reason.clone() }.into());
                        ScanReport::Unavailable { error: reason }
                    }
                }
            }
        };

        let is_safe = !issues.iter().any(|i| i.severity == Severity::Gating);

        AttachmentVerdict {
            filename: filename.to_string(),
            size_bytes: size,
            declared_mime: declared,
            detected_mime: detected,
            content_hash: content_hash(data),
            is_safe,
            issues,
            scan,
        }
    }

    /// Validates a downloaded candidate.
    pub async fn validate_candidate(&self, candidate: &AttachmentCandidate) -> AttachmentVerdict {
        self.validate(
            &candidate.filename,
            &candidate.data,
            candidate.declared_mime.as_deref(),
        )
        .await
    }

    /// Validates a candidate and, when safe, prepares its storage row.
    pub async fn admit(&self, candidate: &AttachmentCandidate) -> Result<Admission, GateError> {
        let verdict = self.validate_candidate(candidate).await;
        if !verdict.is_safe {
            return Ok(Admission::Rejected { verdict });
        }

        let attachment = NewAttachment {
            filename: sanitize_filename(&candidate.filename),
            original_filename: candidate.filename.clone(),
            mime_type: verdict
                .detected_mime
                .clone()
                .or_else(|| verdict.declared_mime.clone()),
            size_bytes: verdict.size_bytes,
            content_hash: verdict.content_hash.clone(),
            data_base64: encode_safe(&candidate.data),
            is_safe: true,
            verdict: serde_json::to_value(&verdict)?,
        };
        Ok(Admission::Accepted {
            attachment,
            verdict,
        })
    }
}

impl fmt::Debug for AttachmentGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachmentGate")
            .field("policy", &self.policy)
            .field("scanner", &self.scanner.is_some())
            .field("scan_timeout", &self.scan_timeout)
            .finish()
    }
}

/// Lowercase hex sha-256 of `data`.
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
