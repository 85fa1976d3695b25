//! Filename inspection and sanitizing.

/// Extensions rejected regardless of declared or detected type.
pub const DANGEROUS_EXTENSIONS: &[&str] = &[
    "exe", "com", "bat", "cmd", "scr", "vbs", "vbe", "js", "jse", "wsf", "wsh", "msi", "jar",
    "app", "dmg", "pkg", "deb", "rpm", "sh", "bash", "ps1", "psm1", "reg", "dll", "so", "dylib",
];

const FALLBACK_EXTENSION: &str = "txt";
const FALLBACK_STEM: &str = "attachment";

/// Final path component, splitting on both `/` and `\`.
fn basename(filename: &str) -> &str {
    filename.rsplit(['/', '\\']).next().unwrap_or(filename)
}

/// Splits a basename into stem and extension. A leading dot does not start
/// an extension.
fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(idx) if idx > 0 && idx + 1 < name.len() => (&name[..idx], Some(&name[idx + 1..])),
        Some(idx) if idx > 0 => (&name[..idx], None),
        _ => (name, None),
    }
}

/// Lowercased extension of the final path component.
pub fn extension(filename: &str) -> Option<String> {
    split_extension(basename(filename))
        .1
        .map(|ext| ext.to_ascii_lowercase())
}

/// Returns the extension when it is on the deny-list.
pub fn dangerous_extension(filename: &str) -> Option<String> {
    extension(filename).filter(|ext| DANGEROUS_EXTENSIONS.contains(&ext.as_str()))
}

/// Makes a filename safe to write to disk.
///
/// Path components are dropped, characters outside `[A-Za-z0-9._-]` become
/// `_`, leading dots are removed, and a missing or dangerous extension is
/// replaced with `.txt`.
pub fn sanitize_filename(filename: &str) -> String {
    let cleaned: String = basename(filename)
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');

    let (stem, ext) = split_extension(cleaned);
    let stem = if stem.is_empty() { FALLBACK_STEM } else { stem };

    match ext {
        Some(ext) if !DANGEROUS_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) => {
            format!("{stem}.{ext}")
        }
        _ => format!("{stem}.{FALLBACK_EXTENSION}"),
    }
}
