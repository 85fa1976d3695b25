//! Append-only audit log.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection};

use crate::domain::RecordId;
use crate::storage::database::{Database, Result};
use crate::storage::AuditEntry;

/// Appends an audit entry.
pub async fn append(
    db: &Database,
    message_id: Option<RecordId>,
    action: &str,
    details: &serde_json::Value,
    provider: Option<&str>,
) -> Result<()> {
    let action = action.to_string();
    let details = details.clone();
    let provider = provider.map(str::to_string);

    db.with_conn(move |conn| append_row(conn, message_id, &action, &details, provider.as_deref()))
        .await
}

/// [`append`] on an open connection or transaction.
pub(crate) fn append_row(
    conn: &Connection,
    message_id: Option<RecordId>,
    action: &str,
    details: &serde_json::Value,
    provider: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO audit_log (message_row_id, action, details, provider, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            message_id.map(|id| id.0),
            action,
            serde_json::to_string(details)?,
            provider,
            Utc::now().to_rfc3339()
        ],
    )?;
    Ok(())
}

/// Lists audit entries for a message, oldest first.
pub async fn for_message(db: &Database, message_id: RecordId) -> Result<Vec<AuditEntry>> {
    db.with_conn(move |conn| {
        let mut stmt = conn.prepare(
            r#"
            SELECT message_row_id, action, details, provider, created_at
            FROM audit_log
            WHERE message_row_id = ?1
            ORDER BY id ASC
            "#,
        )?;
        let rows = stmt.query_map([message_id.0], |row| {
            let message_id: Option<i64> = row.get(0)?;
            let details: String = row.get(2)?;
            let created_at: String = row.get(4)?;
            Ok(AuditEntry {
                message_id: message_id.map(RecordId),
                action: row.get(1)?,
                details: serde_json::from_str(&details).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e))
                })?,
                provider: row.get(3)?,
                created_at: DateTime::parse_from_rfc3339(&created_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e))
                    })?,
            })
        })?;
        let entries: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(entries?)
    })
    .await
}
