//! SQL schema definitions as const strings.
//!
//! Dates are stored as RFC 3339 UTC strings with a fixed precision so that
//! lexical order matches chronological order.

/// SQL to create the messages table.
pub const CREATE_MESSAGES: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    provider_message_id TEXT NOT NULL UNIQUE,
    thread_id TEXT,
    subject TEXT NOT NULL,
    from_address TEXT NOT NULL,
    from_name TEXT,
    to_addresses TEXT NOT NULL,
    cc_addresses TEXT NOT NULL,
    bcc_addresses TEXT NOT NULL,
    date TEXT NOT NULL,
    body_plain TEXT,
    body_html TEXT,
    body_markdown TEXT,
    labels TEXT NOT NULL,
    attachment_manifest TEXT NOT NULL,
    has_attachments INTEGER NOT NULL DEFAULT 0,
    provider TEXT NOT NULL,
    provider_account TEXT,
    storage_path TEXT,
    embedding BLOB,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

/// SQL to create message indexes.
pub const CREATE_MESSAGE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(thread_id);
CREATE INDEX IF NOT EXISTS idx_messages_date ON messages(date DESC);
CREATE INDEX IF NOT EXISTS idx_messages_provider ON messages(provider, provider_account)
"#;

/// SQL to create the attachments table.
pub const CREATE_ATTACHMENTS: &str = r#"
CREATE TABLE IF NOT EXISTS attachments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    message_row_id INTEGER NOT NULL REFERENCES messages(id),
    filename TEXT NOT NULL,
    original_filename TEXT NOT NULL,
    mime_type TEXT,
    size_bytes INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    data_base64 TEXT NOT NULL,
    is_safe INTEGER NOT NULL,
    verdict TEXT NOT NULL,
    created_at TEXT NOT NULL
)
"#;

/// SQL to create attachment indexes.
pub const CREATE_ATTACHMENT_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_attachments_message ON attachments(message_row_id);
CREATE INDEX IF NOT EXISTS idx_attachments_hash ON attachments(content_hash)
"#;

/// SQL to create the audit_log table.
pub const CREATE_AUDIT_LOG: &str = r#"
CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    message_row_id INTEGER REFERENCES messages(id),
    action TEXT NOT NULL,
    details TEXT NOT NULL,
    provider TEXT,
    created_at TEXT NOT NULL
)
"#;

/// Returns all schema creation statements in order.
pub fn all_migrations() -> Vec<&'static str> {
    vec![
        CREATE_MESSAGES,
        CREATE_MESSAGE_INDEXES,
        CREATE_ATTACHMENTS,
        CREATE_ATTACHMENT_INDEXES,
        CREATE_AUDIT_LOG,
    ]
}
