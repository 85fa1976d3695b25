//! Durable message storage.
//!
//! This module provides the storage layer for imported mail:
//!
//! - SQLite database for messages, attachments, and the audit log
//! - The [`MessageStore`] trait the pipeline and backfill engine consume
//! - Async-safe database operations via tokio::task::spawn_blocking

mod database;
pub mod queries;
mod schema;

pub use database::{Database, Result, StorageError};

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{NormalizedMessage, ProviderMessageId, RecordId, ThreadId};
use crate::embedding::{rank_by_similarity, EmbeddingVector};

/// A message with the optional fields that merge on re-insert.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub message: NormalizedMessage,
    pub vector: Option<EmbeddingVector>,
    pub storage_path: Option<String>,
}

impl MessageRecord {
    /// A record with no vector and no storage path yet.
    pub fn new(message: NormalizedMessage) -> Self {
        Self {
            message,
            vector: None,
            storage_path: None,
        }
    }
}

/// A message as read back from storage.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub id: RecordId,
    pub message: NormalizedMessage,
    pub vector: Option<EmbeddingVector>,
    pub storage_path: Option<String>,
}

/// An attachment that passed the gate, ready to persist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAttachment {
    /// Sanitized filename.
    pub filename: String,
    /// Filename as sent.
    pub original_filename: String,
    pub mime_type: Option<String>,
    pub size_bytes: u64,
    /// Lowercase hex sha-256 of the raw bytes.
    pub content_hash: String,
    /// Standard base64 of the raw bytes.
    pub data_base64: String,
    pub is_safe: bool,
    /// Full gate report.
    pub verdict: serde_json::Value,
}

/// A persisted attachment row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredAttachment {
    pub id: i64,
    pub message_id: RecordId,
    pub attachment: NewAttachment,
    pub created_at: DateTime<Utc>,
}

/// One audit log row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub message_id: Option<RecordId>,
    pub action: String,
    pub details: serde_json::Value,
    pub provider: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Audit row written together with an imported record.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditEntry {
    pub action: String,
    pub details: serde_json::Value,
    pub provider: Option<String>,
}

/// Message totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCounts {
    pub total: u64,
    pub with_vectors: u64,
}

/// Message totals for one provider account.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderCount {
    pub provider: String,
    pub account: Option<String>,
    pub messages: u64,
    pub with_vectors: u64,
    pub latest: Option<DateTime<Utc>>,
}

/// A similarity search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarMessage {
    pub message: StoredMessage,
    pub similarity: f32,
}

/// Storage operations consumed by the pipeline and the backfill engine.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Upserts a record keyed on its provider message id.
    async fn insert(&self, record: &MessageRecord) -> Result<RecordId>;

    /// Sets the vector of a stored record.
    async fn update_vector(&self, id: RecordId, vector: &EmbeddingVector) -> Result<()>;

    /// Looks up a record by provider message id.
    async fn find_by_provider_id(&self, id: &ProviderMessageId) -> Result<Option<StoredMessage>>;

    /// Records with no vector, newest first.
    async fn list_without_vector(&self, limit: usize) -> Result<Vec<StoredMessage>>;

    /// Date of the newest stored record.
    async fn latest_timestamp(&self) -> Result<Option<DateTime<Utc>>>;

    /// Appends an audit entry for a record.
    async fn append_audit(
        &self,
        id: RecordId,
        action: &str,
        details: serde_json::Value,
        provider: Option<&str>,
    ) -> Result<()>;

    /// Persists an attachment of a stored record.
    async fn insert_attachment(&self, id: RecordId, attachment: &NewAttachment) -> Result<()>;

    /// Message totals.
    async fn counts(&self) -> Result<StoreCounts>;

    /// Upserts a record, its accepted attachments, and an audit entry as one
    /// unit. Nothing is kept if any write fails.
    async fn insert_import(
        &self,
        record: &MessageRecord,
        attachments: &[NewAttachment],
        audit: &NewAuditEntry,
    ) -> Result<RecordId>;
}

/// SQLite-backed [`MessageStore`].
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db: Database,
}

impl SqliteStore {
    /// Opens the store at the given database path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            db: Database::open(path).await?,
        })
    }

    /// Creates a store with an in-memory database for testing.
    pub async fn in_memory() -> Result<Self> {
        Ok(Self {
            db: Database::open_in_memory().await?,
        })
    }

    /// Returns a reference to the database.
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Looks up a record by row id.
    pub async fn get(&self, id: RecordId) -> Result<Option<StoredMessage>> {
        queries::messages::get_by_id(&self.db, id).await
    }

    /// Records in a thread, oldest first.
    pub async fn thread(&self, thread_id: &ThreadId) -> Result<Vec<StoredMessage>> {
        queries::messages::get_by_thread(&self.db, thread_id).await
    }

    /// Newest records.
    pub async fn recent(&self, limit: usize) -> Result<Vec<StoredMessage>> {
        queries::messages::recent(&self.db, limit).await
    }

    /// Per-provider totals.
    pub async fn provider_counts(&self) -> Result<Vec<ProviderCount>> {
        queries::messages::provider_counts(&self.db).await
    }

    /// Attachments of a record.
    pub async fn attachments_for(&self, id: RecordId) -> Result<Vec<StoredAttachment>> {
        queries::attachments::for_message(&self.db, id).await
    }

    /// Audit trail of a record.
    pub async fn audit_for(&self, id: RecordId) -> Result<Vec<AuditEntry>> {
        queries::audit::for_message(&self.db, id).await
    }

    /// Records the location of a message's rendered form.
    pub async fn set_storage_path(&self, id: RecordId, path: &str) -> Result<()> {
        queries::messages::update_storage_path(&self.db, id, path).await
    }

    /// Finds the records most similar to `query`.
    ///
    /// Zero-sentinel vectors never match.
    pub async fn search_similar(
        &self,
        query: &EmbeddingVector,
        limit: usize,
        min_similarity: f32,
    ) -> Result<Vec<SimilarMessage>> {
        let vectors = queries::messages::all_embeddings(&self.db).await?;
        let ranked = rank_by_similarity(
            query,
            vectors.iter().map(|(id, vector)| (*id, vector)),
            limit,
            min_similarity,
        );

        let mut hits = Vec::with_capacity(ranked.len());
        for (id, similarity) in ranked {
            if let Some(message) = self.get(id).await? {
                hits.push(SimilarMessage {
                    message,
                    similarity,
                });
            }
        }
        Ok(hits)
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn insert(&self, record: &MessageRecord) -> Result<RecordId> {
        queries::messages::upsert(&self.db, record).await
    }

    async fn update_vector(&self, id: RecordId, vector: &EmbeddingVector) -> Result<()> {
        queries::messages::update_embedding(&self.db, id, vector).await
    }

    async fn find_by_provider_id(&self, id: &ProviderMessageId) -> Result<Option<StoredMessage>> {
        queries::messages::get_by_provider_id(&self.db, id).await
    }

    async fn list_without_vector(&self, limit: usize) -> Result<Vec<StoredMessage>> {
        queries::messages::list_without_embedding(&self.db, limit).await
    }

    async fn latest_timestamp(&self) -> Result<Option<DateTime<Utc>>> {
        queries::messages::latest_date(&self.db).await
    }

    async fn append_audit(
        &self,
        id: RecordId,
        action: &str,
        details: serde_json::Value,
        provider: Option<&str>,
    ) -> Result<()> {
        queries::audit::append(&self.db, Some(id), action, &details, provider).await
    }

    async fn insert_attachment(&self, id: RecordId, attachment: &NewAttachment) -> Result<()> {
        queries::attachments::insert(&self.db, id, attachment).await?;
        Ok(())
    }

    async fn counts(&self) -> Result<StoreCounts> {
        queries::messages::counts(&self.db).await
    }

    async fn insert_import(
        &self,
        record: &MessageRecord,
        attachments: &[NewAttachment],
        audit: &NewAuditEntry,
    ) -> Result<RecordId> {
        let record = record.clone();
        let attachments = attachments.to_vec();
        let audit = audit.clone();

        self.db
            .transaction(move |tx| {
                let id = queries::messages::upsert_row(tx, &record)?;
                for attachment in &attachments {
                    queries::attachments::insert_row(tx, id, attachment)?;
                }
                queries::audit::append_row(
                    tx,
                    Some(id),
                    &audit.action,
                    &audit.details,
                    audit.provider.as_deref(),
                )?;
                Ok(id)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Address, Body, Provenance};

    fn make_message(id: &str) -> NormalizedMessage {
        NormalizedMessage {
            id: ProviderMessageId::from(id),
            thread_id: None,
            subject: id.to_string(),
            from: Address::new("a@example.com"),
            to: vec![],
            cc: vec![],
            bcc: vec![],
            date: Utc::now(),
            body: Body::default(),
            labels: vec![],
            attachments: vec![],
            provenance: Provenance::new("local", None),
        }
    }

    #[tokio::test]
    async fn store_through_trait_object() {
        let store: Box<dyn MessageStore> = Box::new(SqliteStore::in_memory().await.unwrap());
        let id = store.insert(&MessageRecord::new(make_message("m-1"))).await.unwrap();

        store
            .append_audit(id, "imported", serde_json::json!({ "attachments": 0 }), Some("local"))
            .await
            .unwrap();

        let found = store
            .find_by_provider_id(&ProviderMessageId::from("m-1"))
            .await
            .unwrap();
        assert_eq!(found.map(|m| m.id), Some(id));
        assert_eq!(store.counts().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn audit_entries_are_readable() {
        let store = SqliteStore::in_memory().await.unwrap();
        let id = store.insert(&MessageRecord::new(make_message("m-1"))).await.unwrap();
        store
            .append_audit(id, "imported", serde_json::json!({ "message_id": "m-1" }), None)
            .await
            .unwrap();

        let entries = store.audit_for(id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "imported");
        assert_eq!(entries[0].details["message_id"], "m-1");
    }

    #[tokio::test]
    async fn search_similar_skips_zero_vectors() {
        let store = SqliteStore::in_memory().await.unwrap();
        let close = store.insert(&MessageRecord::new(make_message("close"))).await.unwrap();
        let far = store.insert(&MessageRecord::new(make_message("far"))).await.unwrap();
        let empty = store.insert(&MessageRecord::new(make_message("empty"))).await.unwrap();
        store.update_vector(close, &EmbeddingVector::new(vec![1.0, 0.1])).await.unwrap();
        store.update_vector(far, &EmbeddingVector::new(vec![-1.0, 0.0])).await.unwrap();
        store.update_vector(empty, &EmbeddingVector::zeros(2)).await.unwrap();

        let hits = store
            .search_similar(&EmbeddingVector::new(vec![1.0, 0.0]), 10, -1.0)
            .await
            .unwrap();

        let ids: Vec<_> = hits.iter().map(|h| h.message.id).collect();
        assert_eq!(ids, vec![close, far]);
    }

    #[tokio::test]
    async fn storage_path_survives_reinsert_without_path() {
        let store = SqliteStore::in_memory().await.unwrap();
        let id = store.insert(&MessageRecord::new(make_message("m-1"))).await.unwrap();
        store.set_storage_path(id, "2025/03/m-1.md").await.unwrap();

        store.insert(&MessageRecord::new(make_message("m-1"))).await.unwrap();

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.storage_path.as_deref(), Some("2025/03/m-1.md"));
    }

    fn attachment(name: &str) -> NewAttachment {
        NewAttachment {
            filename: name.to_string(),
            original_filename: name.to_string(),
            mime_type: Some("text/plain".to_string()),
            size_bytes: 5,
            content_hash: "00".repeat(32),
            data_base64: "aGVsbG8=".to_string(),
            is_safe: true,
            verdict: serde_json::json!({ "is_safe": true }),
        }
    }

    fn imported() -> NewAuditEntry {
        NewAuditEntry {
            action: "imported".to_string(),
            details: serde_json::json!({ "attachments": 2 }),
            provider: Some("local".to_string()),
        }
    }

    #[tokio::test]
    async fn import_writes_record_attachments_and_audit() {
        let store = SqliteStore::in_memory().await.unwrap();

        let id = store
            .insert_import(
                &MessageRecord::new(make_message("m-1")),
                &[attachment("a.txt"), attachment("b.txt")],
                &imported(),
            )
            .await
            .unwrap();

        assert_eq!(store.attachments_for(id).await.unwrap().len(), 2);
        let audit = store.audit_for(id).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].provider.as_deref(), Some("local"));
    }

    #[tokio::test]
    async fn failed_import_leaves_nothing_behind() {
        let store = SqliteStore::in_memory().await.unwrap();
        store
            .db()
            .with_conn(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER reject_poison BEFORE INSERT ON attachments
                     WHEN NEW.original_filename = 'poison.txt'
                     BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let result = store
            .insert_import(
                &MessageRecord::new(make_message("m-1")),
                &[attachment("a.txt"), attachment("poison.txt")],
                &imported(),
            )
            .await;

        assert!(matches!(result, Err(StorageError::Sqlite(_))));
        assert!(store
            .find_by_provider_id(&ProviderMessageId::from("m-1"))
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.counts().await.unwrap().total, 0);
    }
}
