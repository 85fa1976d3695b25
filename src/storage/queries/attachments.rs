//! Attachment persistence.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};

use crate::domain::RecordId;
use crate::storage::database::{Database, Result};
use crate::storage::{NewAttachment, StoredAttachment};

/// Inserts an attachment row for a stored message.
pub async fn insert(db: &Database, message_id: RecordId, attachment: &NewAttachment) -> Result<i64> {
    let attachment = attachment.clone();
    db.with_conn(move |conn| insert_row(conn, message_id, &attachment)).await
}

/// [`insert`] on an open connection or transaction.
pub(crate) fn insert_row(conn: &Connection, message_id: RecordId, attachment: &NewAttachment) -> Result<i64> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        r#"
        INSERT INTO attachments (
            message_row_id, filename, original_filename, mime_type, size_bytes,
            content_hash, data_base64, is_safe, verdict, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
        params![
            message_id.0,
            attachment.filename,
            attachment.original_filename,
            attachment.mime_type,
            attachment.size_bytes as i64,
            attachment.content_hash,
            attachment.data_base64,
            attachment.is_safe as i32,
            serde_json::to_string(&attachment.verdict)?,
            now,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Lists the attachments of a message in insertion order.
pub async fn for_message(db: &Database, message_id: RecordId) -> Result<Vec<StoredAttachment>> {
    db.with_conn(move |conn| {
        let mut stmt = conn.prepare(
            r#"
            SELECT id, message_row_id, filename, original_filename, mime_type, size_bytes,
                   content_hash, data_base64, is_safe, verdict, created_at
            FROM attachments
            WHERE message_row_id = ?1
            ORDER BY id ASC
            "#,
        )?;
        let rows = stmt.query_map([message_id.0], row_to_attachment)?;
        let attachments: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(attachments?)
    })
    .await
}

fn row_to_attachment(row: &Row<'_>) -> rusqlite::Result<StoredAttachment> {
    let verdict: String = row.get(9)?;
    let created_at: String = row.get(10)?;

    Ok(StoredAttachment {
        id: row.get(0)?,
        message_id: RecordId(row.get(1)?),
        attachment: NewAttachment {
            filename: row.get(2)?,
            original_filename: row.get(3)?,
            mime_type: row.get(4)?,
            size_bytes: row.get::<_, i64>(5)? as u64,
            content_hash: row.get(6)?,
            data_base64: row.get(7)?,
            is_safe: row.get::<_, i32>(8)? != 0,
            verdict: serde_json::from_str(&verdict).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(9, Type::Text, Box::new(e))
            })?,
        },
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(10, Type::Text, Box::new(e)))?,
    })
}
