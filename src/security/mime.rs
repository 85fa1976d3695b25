//! Content-type detection.

use serde::{Deserialize, Serialize};

/// How the detected mime type is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MimeDetection {
    /// Inspect byte signatures, falling back to the filename.
    #[default]
    Content,
    /// Guess from the filename extension only.
    Extension,
}

/// Results that carry no information about the payload.
const GENERIC_TYPES: &[&str] = &[
    "application/octet-stream",
    "all/all",
    "all/allfiles",
    "inode/x-empty",
    "application/x-zerosize",
];

/// Lowercases a mime type and drops any parameters.
pub fn normalize(mime: &str) -> String {
    mime.split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Detects the mime type of `data`.
///
/// Returns `None` when neither the bytes nor the filename identify it.
pub fn detect(detection: MimeDetection, data: &[u8], filename: &str) -> Option<String> {
    let sniffed = match detection {
        MimeDetection::Content => Some(normalize(tree_magic_mini::from_u8(data)))
            .filter(|mime| !mime.is_empty() && !GENERIC_TYPES.contains(&mime.as_str())),
        MimeDetection::Extension => None,
    };

    sniffed.or_else(|| guess_from_filename(filename))
}

fn guess_from_filename(filename: &str) -> Option<String> {
    mime_guess::from_path(filename)
        .first_raw()
        .map(normalize)
        .filter(|mime| !GENERIC_TYPES.contains(&mime.as_str()))
}
