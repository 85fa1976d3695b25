//! Message CRUD operations.
//!
//! Every write is an upsert keyed on `provider_message_id`.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;

use crate::domain::{
    Address, AttachmentRef, Body, NormalizedMessage, Provenance, ProviderMessageId, RecordId,
    ThreadId,
};
use crate::embedding::EmbeddingVector;
use crate::storage::database::{Database, Result, StorageError};
use crate::storage::{MessageRecord, ProviderCount, StoreCounts, StoredMessage};

const SELECT_COLUMNS: &str = r#"
    id, provider_message_id, thread_id, subject, from_address, from_name,
    to_addresses, cc_addresses, bcc_addresses, date,
    body_plain, body_html, body_markdown, labels, attachment_manifest,
    provider, provider_account, storage_path, embedding
"#;

/// Formats a timestamp the way the `date` column stores it.
pub(crate) fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Inserts a message, or merges onto the existing row with the same
/// provider message id.
///
/// On conflict only the vector, storage path, provider, and account are
/// updated. An absent vector or path keeps the stored value.
pub async fn upsert(db: &Database, record: &MessageRecord) -> Result<RecordId> {
    let record = record.clone();
    db.with_conn(move |conn| upsert_row(conn, &record)).await
}

/// [`upsert`] on an open connection or transaction.
pub(crate) fn upsert_row(conn: &Connection, record: &MessageRecord) -> Result<RecordId> {
    let now = Utc::now().to_rfc3339();
    let message = &record.message;
    let id: i64 = conn.query_row(
        r#"
        INSERT INTO messages (
            provider_message_id, thread_id, subject, from_address, from_name,
            to_addresses, cc_addresses, bcc_addresses, date,
            body_plain, body_html, body_markdown, labels, attachment_manifest,
            has_attachments, provider, provider_account, storage_path, embedding,
            created_at, updated_at
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5,
            ?6, ?7, ?8, ?9,
            ?10, ?11, ?12, ?13, ?14,
            ?15, ?16, ?17, ?18, ?19,
            ?20, ?21
        )
        ON CONFLICT(provider_message_id) DO UPDATE SET
            embedding = COALESCE(excluded.embedding, messages.embedding),
            storage_path = COALESCE(excluded.storage_path, messages.storage_path),
            provider = excluded.provider,
            provider_account = excluded.provider_account,
            updated_at = excluded.updated_at
        RETURNING id
        "#,
        params![
            message.id.0,
            message.thread_id.as_ref().map(|t| &t.0),
            message.subject,
            message.from.email,
            message.from.name,
            serde_json::to_string(&message.to)?,
            serde_json::to_string(&message.cc)?,
            serde_json::to_string(&message.bcc)?,
            format_date(&message.date),
            message.body.plain,
            message.body.html,
            message.body.markdown,
            serde_json::to_string(&message.labels)?,
            serde_json::to_string(&message.attachments)?,
            message.has_attachments() as i32,
            message.provenance.provider,
            message.provenance.account,
            record.storage_path,
            record.vector.as_ref().map(EmbeddingVector::to_bytes),
            now,
            now,
        ],
        |row| row.get(0),
    )?;

    Ok(RecordId(id))
}

/// Sets the embedding of a stored message.
pub async fn update_embedding(db: &Database, id: RecordId, vector: &EmbeddingVector) -> Result<()> {
    let bytes = vector.to_bytes();

    db.with_conn(move |conn| {
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE messages SET embedding = ?1, updated_at = ?2 WHERE id = ?3",
            params![bytes, now, id.0],
        )?;
        Ok(())
    })
    .await
}

/// Sets the on-disk location of a stored message's rendered form.
pub async fn update_storage_path(db: &Database, id: RecordId, path: &str) -> Result<()> {
    let path = path.to_string();

    db.with_conn(move |conn| {
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE messages SET storage_path = ?1, updated_at = ?2 WHERE id = ?3",
            params![path, now, id.0],
        )?;
        Ok(())
    })
    .await
}

/// Retrieves a message by its provider message id.
pub async fn get_by_provider_id(
    db: &Database,
    provider_id: &ProviderMessageId,
) -> Result<Option<StoredMessage>> {
    let provider_id = provider_id.clone();

    db.with_conn(move |conn| {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM messages WHERE provider_message_id = ?1");
        let result = conn
            .query_row(&sql, [&provider_id.0], row_to_stored)
            .optional()?;
        Ok(result)
    })
    .await
}

/// Retrieves a message by its row id.
pub async fn get_by_id(db: &Database, id: RecordId) -> Result<Option<StoredMessage>> {
    db.with_conn(move |conn| {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM messages WHERE id = ?1");
        let result = conn.query_row(&sql, [id.0], row_to_stored).optional()?;
        Ok(result)
    })
    .await
}

/// Lists messages that have no embedding yet, newest first.
pub async fn list_without_embedding(db: &Database, limit: usize) -> Result<Vec<StoredMessage>> {
    db.with_conn(move |conn| {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM messages WHERE embedding IS NULL ORDER BY date DESC LIMIT ?1"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([limit as i64], row_to_stored)?;
        let messages: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(messages?)
    })
    .await
}

/// Retrieves all messages in a thread, oldest first.
pub async fn get_by_thread(db: &Database, thread_id: &ThreadId) -> Result<Vec<StoredMessage>> {
    let thread_id = thread_id.clone();

    db.with_conn(move |conn| {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM messages WHERE thread_id = ?1 ORDER BY date ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([&thread_id.0], row_to_stored)?;
        let messages: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(messages?)
    })
    .await
}

/// Retrieves the most recent messages.
pub async fn recent(db: &Database, limit: usize) -> Result<Vec<StoredMessage>> {
    db.with_conn(move |conn| {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM messages ORDER BY date DESC LIMIT ?1");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([limit as i64], row_to_stored)?;
        let messages: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(messages?)
    })
    .await
}

/// Returns the date of the newest stored message.
pub async fn latest_date(db: &Database) -> Result<Option<DateTime<Utc>>> {
    db.with_conn(|conn| {
        let latest: Option<String> =
            conn.query_row("SELECT MAX(date) FROM messages", [], |row| row.get(0))?;
        latest
            .map(|value| {
                DateTime::parse_from_rfc3339(&value)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| {
                        StorageError::from(rusqlite::Error::FromSqlConversionFailure(
                            0,
                            Type::Text,
                            Box::new(e),
                        ))
                    })
            })
            .transpose()
    })
    .await
}

/// Counts all messages and those carrying an embedding.
pub async fn counts(db: &Database) -> Result<StoreCounts> {
    db.with_conn(|conn| {
        let (total, with_vectors): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COUNT(embedding) FROM messages",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(StoreCounts {
            total: total as u64,
            with_vectors: with_vectors as u64,
        })
    })
    .await
}

/// Groups message counts by provider and account.
pub async fn provider_counts(db: &Database) -> Result<Vec<ProviderCount>> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            r#"
            SELECT provider, provider_account, COUNT(*), COUNT(embedding), MAX(date)
            FROM messages
            GROUP BY provider, provider_account
            ORDER BY COUNT(*) DESC
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            let latest: Option<String> = row.get(4)?;
            Ok(ProviderCount {
                provider: row.get(0)?,
                account: row.get(1)?,
                messages: row.get::<_, i64>(2)? as u64,
                with_vectors: row.get::<_, i64>(3)? as u64,
                latest: latest
                    .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
                    .map(|dt| dt.with_timezone(&Utc)),
            })
        })?;
        let counts: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(counts?)
    })
    .await
}

/// Loads every stored embedding with its row id.
pub async fn all_embeddings(db: &Database) -> Result<Vec<(RecordId, EmbeddingVector)>> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT id, embedding FROM messages WHERE embedding IS NOT NULL")?;
        let rows = stmt.query_map([], |row| {
            let id: i64 = row.get(0)?;
            let bytes: Vec<u8> = row.get(1)?;
            Ok((RecordId(id), decode_embedding(1, &bytes)?))
        })?;
        let vectors: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(vectors?)
    })
    .await
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn decode_embedding(idx: usize, bytes: &[u8]) -> rusqlite::Result<EmbeddingVector> {
    EmbeddingVector::from_bytes(bytes).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Blob,
            format!("embedding blob of {} bytes is not f32-aligned", bytes.len()).into(),
        )
    })
}

fn row_to_stored(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    let date_str: String = row.get(9)?;
    let date = DateTime::parse_from_rfc3339(&date_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(9, Type::Text, Box::new(e)))?;

    let to: Vec<Address> = json_column(row, 6)?;
    let cc: Vec<Address> = json_column(row, 7)?;
    let bcc: Vec<Address> = json_column(row, 8)?;
    let labels: Vec<String> = json_column(row, 13)?;
    let attachments: Vec<AttachmentRef> = json_column(row, 14)?;
    let thread_id: Option<String> = row.get(2)?;
    let embedding: Option<Vec<u8>> = row.get(18)?;

    Ok(StoredMessage {
        id: RecordId(row.get(0)?),
        message: NormalizedMessage {
            id: ProviderMessageId(row.get(1)?),
            thread_id: thread_id.map(ThreadId),
            subject: row.get(3)?,
            from: Address {
                email: row.get(4)?,
                name: row.get(5)?,
            },
            to,
            cc,
            bcc,
            date,
            body: Body {
                plain: row.get(10)?,
                html: row.get(11)?,
                markdown: row.get(12)?,
            },
            labels,
            attachments,
            provenance: Provenance {
                provider: row.get(15)?,
                account: row.get(16)?,
            },
        },
        storage_path: row.get(17)?,
        vector: embedding
            .map(|bytes| decode_embedding(18, &bytes))
            .transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn make_message(id: &str, day: u32) -> NormalizedMessage {
        NormalizedMessage {
            id: ProviderMessageId::from(id),
            thread_id: Some(ThreadId::from("thread-1")),
            subject: format!("Subject {id}"),
            from: Address::with_name("sender@example.com", "Sender"),
            to: vec![Address::new("recipient@example.com")],
            cc: vec![],
            bcc: vec![],
            date: Utc.with_ymd_and_hms(2025, 3, day, 9, 30, 0).unwrap(),
            body: Body {
                plain: Some("Hello".to_string()),
                html: None,
                markdown: Some("Hello".to_string()),
            },
            labels: vec!["INBOX".to_string()],
            attachments: vec![],
            provenance: Provenance::new("gmail", Some("me@example.com".to_string())),
        }
    }

    #[tokio::test]
    async fn upsert_and_get_by_provider_id() {
        let db = Database::open_in_memory().await.unwrap();
        let message = make_message("m-1", 1);

        let id = upsert(&db, &MessageRecord::new(message.clone())).await.unwrap();
        let stored = get_by_provider_id(&db, &message.id).await.unwrap().unwrap();

        assert_eq!(stored.id, id);
        assert_eq!(stored.message, message);
        assert!(stored.vector.is_none());
    }

    #[tokio::test]
    async fn second_upsert_keeps_one_row_and_merges_provenance() {
        let db = Database::open_in_memory().await.unwrap();
        let first = make_message("m-1", 1);
        let id = upsert(&db, &MessageRecord::new(first.clone())).await.unwrap();

        let mut again = first.clone();
        again.subject = "Changed subject".to_string();
        again.provenance = Provenance::new("local", Some("archive".to_string()));
        let second_id = upsert(&db, &MessageRecord::new(again)).await.unwrap();

        assert_eq!(id, second_id);
        let stored = get_by_id(&db, id).await.unwrap().unwrap();
        assert_eq!(stored.message.subject, "Subject m-1");
        assert_eq!(stored.message.provenance.provider, "local");
        assert_eq!(counts(&db).await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn upsert_without_vector_keeps_existing_vector() {
        let db = Database::open_in_memory().await.unwrap();
        let message = make_message("m-1", 1);
        let id = upsert(&db, &MessageRecord::new(message.clone())).await.unwrap();
        let vector = EmbeddingVector::new(vec![0.5, 0.25]);
        update_embedding(&db, id, &vector).await.unwrap();

        upsert(&db, &MessageRecord::new(message.clone())).await.unwrap();

        let stored = get_by_id(&db, id).await.unwrap().unwrap();
        assert_eq!(stored.vector, Some(vector));
    }

    #[tokio::test]
    async fn list_without_embedding_is_newest_first() {
        let db = Database::open_in_memory().await.unwrap();
        let older = upsert(&db, &MessageRecord::new(make_message("old", 1))).await.unwrap();
        upsert(&db, &MessageRecord::new(make_message("new", 5))).await.unwrap();
        let done = upsert(&db, &MessageRecord::new(make_message("done", 9))).await.unwrap();
        update_embedding(&db, done, &EmbeddingVector::new(vec![1.0])).await.unwrap();

        let pending = list_without_embedding(&db, 10).await.unwrap();
        let ids: Vec<_> = pending.iter().map(|m| m.message.id.0.as_str()).collect();
        assert_eq!(ids, vec!["new", "old"]);

        let limited = list_without_embedding(&db, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_ne!(limited[0].id, older);
    }

    #[tokio::test]
    async fn latest_date_tracks_newest_message() {
        let db = Database::open_in_memory().await.unwrap();
        assert_eq!(latest_date(&db).await.unwrap(), None);

        upsert(&db, &MessageRecord::new(make_message("a", 3))).await.unwrap();
        upsert(&db, &MessageRecord::new(make_message("b", 12))).await.unwrap();

        assert_eq!(
            latest_date(&db).await.unwrap(),
            Some(Utc.with_ymd_and_hms(2025, 3, 12, 9, 30, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn counts_include_zero_vectors() {
        let db = Database::open_in_memory().await.unwrap();
        let id = upsert(&db, &MessageRecord::new(make_message("a", 1))).await.unwrap();
        upsert(&db, &MessageRecord::new(make_message("b", 2))).await.unwrap();
        update_embedding(&db, id, &EmbeddingVector::zeros(4)).await.unwrap();

        let counts = counts(&db).await.unwrap();
        assert_eq!(counts.total, 2);
        assert_eq!(counts.with_vectors, 1);
    }

    #[tokio::test]
    async fn thread_and_recent_ordering() {
        let db = Database::open_in_memory().await.unwrap();
        upsert(&db, &MessageRecord::new(make_message("later", 8))).await.unwrap();
        upsert(&db, &MessageRecord::new(make_message("earlier", 2))).await.unwrap();

        let thread = get_by_thread(&db, &ThreadId::from("thread-1")).await.unwrap();
        assert_eq!(thread[0].message.id.0, "earlier");

        let recent = recent(&db, 1).await.unwrap();
        assert_eq!(recent[0].message.id.0, "later");
    }

    #[tokio::test]
    async fn provider_counts_group_by_provider() {
        let db = Database::open_in_memory().await.unwrap();
        upsert(&db, &MessageRecord::new(make_message("a", 1))).await.unwrap();
        upsert(&db, &MessageRecord::new(make_message("b", 2))).await.unwrap();
        let mut local = make_message("c", 3);
        local.provenance = Provenance::new("local", None);
        upsert(&db, &MessageRecord::new(local)).await.unwrap();

        let counts = provider_counts(&db).await.unwrap();
        assert_eq!(counts.len(), 2);
        assert_eq!(counts[0].provider, "gmail");
        assert_eq!(counts[0].messages, 2);
        assert_eq!(counts[1].account, None);
    }
}
