//! The import orchestrator.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::{broadcast, RwLock};

use super::{
    ImportReport, ImportRequest, PipelineError, PipelineEvent, PipelineState, PipelineStatus,
    Progress, Result, RunStats, IMPORTED_ACTION,
};
use crate::config::PipelineSettings;
use crate::domain::{AttachmentCandidate, NormalizedMessage};
use crate::embedding::EmbeddingEngine;
use crate::providers::{
    Credentials, DateRange, ListQuery, MessageRef, ProviderError, ProviderRegistry, SharedProvider,
};
use crate::security::{Admission, AttachmentGate};
use crate::storage::{MessageRecord, MessageStore, NewAttachment, NewAuditEntry};

/// Requests that a running import stop at its next batch boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Marks a pipeline busy for the lifetime of one run.
struct RunGuard<'a> {
    running: &'a AtomicBool,
}

impl<'a> RunGuard<'a> {
    fn acquire(running: &'a AtomicBool) -> Result<Self> {
        running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| PipelineError::AlreadyRunning)?;
        Ok(Self { running })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

enum Outcome {
    Processed,
    Skipped,
}

/// Attachments of one message after gating.
#[derive(Default)]
struct GatedAttachments {
    accepted: Vec<NewAttachment>,
    rejected: usize,
}

/// Imports messages from the active provider into a [`MessageStore`].
///
/// One run at a time per instance. Independent imports of different
/// providers use independent pipelines.
///
/// # Example
///
/// ```ignore
/// let pipeline = Pipeline::new(registry, store, gate, "gmail").with_embedder(engine);
/// let report = pipeline.run_full_import(ImportRequest::default()).await?;
/// println!("{} new, {} skipped", report.stats.processed, report.stats.skipped);
/// ```
pub struct Pipeline {
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn MessageStore>,
    gate: Arc<AttachmentGate>,
    embedder: Option<Arc<EmbeddingEngine>>,
    credentials: Credentials,
    batch_size: usize,
    max_results_per_page: u32,
    call_timeout: Duration,
    backfill_limit: usize,
    active_provider: RwLock<String>,
    progress: RwLock<Progress>,
    last_run: RwLock<Option<RunStats>>,
    running: AtomicBool,
    cancel: CancelHandle,
    event_sender: broadcast::Sender<PipelineEvent>,
}

impl Pipeline {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        store: Arc<dyn MessageStore>,
        gate: Arc<AttachmentGate>,
        provider: impl Into<String>,
    ) -> Self {
        let defaults = PipelineSettings::default();
        let (event_sender, _) = broadcast::channel(100);
        Self {
            registry,
            store,
            gate,
            embedder: None,
            credentials: Credentials::None,
            batch_size: defaults.batch_size,
            max_results_per_page: defaults.max_results_per_page,
            call_timeout: Duration::from_secs(defaults.call_timeout_secs),
            backfill_limit: 1000,
            active_provider: RwLock::new(provider.into()),
            progress: RwLock::new(Progress::default()),
            last_run: RwLock::new(None),
            running: AtomicBool::new(false),
            cancel: CancelHandle::default(),
            event_sender,
        }
    }

    /// Applies batch, page, and timeout settings.
    pub fn with_settings(mut self, settings: &PipelineSettings) -> Self {
        self.batch_size = settings.batch_size.max(1);
        self.max_results_per_page = settings.max_results_per_page.max(1);
        self.call_timeout = Duration::from_secs(settings.call_timeout_secs);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<EmbeddingEngine>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_backfill_limit(mut self, limit: usize) -> Self {
        self.backfill_limit = limit;
        self
    }

    /// Credentials passed to providers that are not yet authenticated.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Name of the active provider.
    pub async fn provider(&self) -> String {
        self.active_provider.read().await.clone()
    }

    /// Subscribes to pipeline events.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.event_sender.subscribe()
    }

    /// A handle that stops the current run at its next batch boundary.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn request_cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Live state and counters.
    pub async fn progress(&self) -> Progress {
        *self.progress.read().await
    }

    /// Counters of the last finished run on the active provider.
    pub async fn last_run(&self) -> Option<RunStats> {
        *self.last_run.read().await
    }

    /// Makes `name` the active provider and clears the last run.
    pub async fn switch_provider(&self, name: &str) -> Result<()> {
        if self.is_running() {
            return Err(PipelineError::AlreadyRunning);
        }
        // Validates the name and creates the instance.
        self.registry.get(name).await?;

        *self.active_provider.write().await = name.to_string();
        *self.last_run.write().await = None;
        *self.progress.write().await = Progress::default();
        tracing::info!(provider = %name, "Switched active provider");
        Ok(())
    }

    /// Provider, capability flags, state, and store totals.
    pub async fn get_status(&self) -> Result<PipelineStatus> {
        let name = self.provider().await;
        let provider = self.registry.get(&name).await?;
        let (capabilities, authenticated, quota) = {
            let guard = provider.read().await;
            (guard.capabilities(), guard.is_authenticated(), guard.quota_info())
        };
        let counts = self.store.counts().await?;

        Ok(PipelineStatus {
            provider: name,
            capabilities,
            authenticated,
            state: self.progress.read().await.state,
            total_records: counts.total,
            records_with_vectors: counts.with_vectors,
            last_run: self.last_run().await,
            quota,
        })
    }

    /// Imports everything newer than the newest stored record.
    ///
    /// With an empty store this is an unbounded full import. The boundary
    /// message is listed again and counted as skipped.
    pub async fn run_incremental_sync(&self, generate_embeddings: bool) -> Result<ImportReport> {
        let start_date = self.store.latest_timestamp().await?;
        tracing::info!(since = ?start_date, "Starting incremental sync");
        self.run_full_import(ImportRequest {
            start_date,
            generate_embeddings,
            ..Default::default()
        })
        .await
    }

    /// Lists, processes, and optionally embeds messages from the active provider.
    ///
    /// # Errors
    ///
    /// Fails on authentication or listing errors and when another run is
    /// active. Errors on individual messages are counted in the report.
    pub async fn run_full_import(&self, request: ImportRequest) -> Result<ImportReport> {
        let _guard = RunGuard::acquire(&self.running)?;
        self.cancel.reset();

        let provider_name = self.provider().await;
        let started = Instant::now();
        *self.progress.write().await = Progress::default();
        let _ = self.event_sender.send(PipelineEvent::Started {
            provider: provider_name.clone(),
        });
        tracing::info!(provider = %provider_name, query = ?request.query, "Starting import");

        let result = self.execute(&provider_name, &request).await;
        let stats = self.progress.read().await.stats;
        *self.last_run.write().await = Some(stats);

        match result {
            Ok((backfill, cancelled)) => {
                self.set_state(PipelineState::Done).await;
                let report = ImportReport {
                    provider: provider_name,
                    total_found: stats.found,
                    stats,
                    touched: stats.touched(),
                    backfill,
                    cancelled,
                    duration_ms: started.elapsed().as_millis() as u64,
                };
                tracing::info!(
                    provider = %report.provider,
                    found = stats.found,
                    processed = stats.processed,
                    skipped = stats.skipped,
                    failed = stats.failed,
                    cancelled,
                    "Import finished"
                );
                let _ = self
                    .event_sender
                    .send(PipelineEvent::Completed(report.clone()));
                Ok(report)
            }
            Err(e) => {
                self.set_state(PipelineState::Failed).await;
                tracing::error!(provider = %provider_name, error = %e, "Import failed");
                let _ = self.event_sender.send(PipelineEvent::Failed {
                    provider: provider_name,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        provider_name: &str,
        request: &ImportRequest,
    ) -> Result<(Option<crate::embedding::BackfillReport>, bool)> {
        let provider = self.registry.get(provider_name).await?;
        self.ensure_authenticated(&provider).await?;

        self.set_state(PipelineState::Listing).await;
        let refs = self.list_all(&provider, request).await?;
        self.update_stats(|s| s.found = refs.len()).await;
        tracing::info!(provider = %provider_name, found = refs.len(), "Listing complete");

        self.set_state(PipelineState::Processing).await;
        let batches = refs.len().div_ceil(self.batch_size);
        let mut cancelled = false;

        for (index, batch) in refs.chunks(self.batch_size).enumerate() {
            if self.cancel.is_cancelled() {
                tracing::info!(batch = index, "Import cancelled at batch boundary");
                cancelled = true;
                break;
            }

            for message_ref in batch {
                match self.process_one(&provider, provider_name, message_ref).await {
                    Ok(Outcome::Processed) => self.update_stats(|s| s.processed += 1).await,
                    Ok(Outcome::Skipped) => self.update_stats(|s| s.skipped += 1).await,
                    Err(e) => {
                        tracing::warn!(message_id = %message_ref.id, error = %e, "Failed to import message");
                        self.update_stats(|s| s.failed += 1).await;
                    }
                }
            }

            let stats = self.progress.read().await.stats;
            tracing::debug!(batch = index + 1, batches, processed = stats.processed, "Batch complete");
            let _ = self.event_sender.send(PipelineEvent::BatchCompleted {
                batch: index + 1,
                batches,
                stats,
            });
        }

        let backfill = match (&self.embedder, request.generate_embeddings && !cancelled) {
            (Some(embedder), true) => {
                self.set_state(PipelineState::Embedding).await;
                Some(embedder.backfill(self.store.as_ref(), self.backfill_limit).await?)
            }
            _ => None,
        };

        Ok((backfill, cancelled))
    }

    async fn ensure_authenticated(&self, provider: &SharedProvider) -> Result<()> {
        if provider.read().await.is_authenticated() {
            return Ok(());
        }
        let mut guard = provider.write().await;
        if !guard.is_authenticated() {
            let name = guard.name().to_string();
            self.bounded(guard.authenticate(&self.credentials)).await?;
            tracing::info!(provider = %name, account = ?guard.account(), "Provider authenticated");
        }
        Ok(())
    }

    /// Pages through the provider until the token runs out or the cap is met.
    async fn list_all(&self, provider: &SharedProvider, request: &ImportRequest) -> Result<Vec<MessageRef>> {
        let per_page = self.max_results_per_page as usize;
        let mut refs: Vec<MessageRef> = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let page_size = match request.max_results {
                Some(cap) if refs.len() >= cap => break,
                Some(cap) => (cap - refs.len()).min(per_page),
                None => per_page,
            };

            let query = ListQuery {
                query: request.query.clone(),
                max_results: page_size as u32,
                page_token: page_token.take(),
                date_range: DateRange {
                    start: request.start_date,
                    end: request.end_date,
                },
            };

            let page = {
                let guard = provider.read().await;
                self.bounded(guard.list_messages(&query)).await?
            };
            tracing::debug!(
                returned = page.refs.len(),
                collected = refs.len(),
                more = page.next_page_token.is_some(),
                "Listed page"
            );

            let empty = page.refs.is_empty();
            refs.extend(page.refs);
            if let Some(cap) = request.max_results {
                refs.truncate(cap);
            }

            match page.next_page_token {
                Some(token) if !empty => page_token = Some(token),
                _ => break,
            }
        }

        Ok(refs)
    }

    async fn process_one(
        &self,
        provider: &SharedProvider,
        provider_name: &str,
        message_ref: &MessageRef,
    ) -> Result<Outcome> {
        if self
            .store
            .find_by_provider_id(&message_ref.id)
            .await?
            .is_some()
        {
            tracing::debug!(message_id = %message_ref.id, "Already stored, skipping");
            return Ok(Outcome::Skipped);
        }

        let message = {
            let guard = provider.read().await;
            self.bounded(guard.get_message(&message_ref.id)).await?
        };

        let gated = self.gate_attachments(provider, &message).await;

        let message_id = message.id.clone();
        let audit = NewAuditEntry {
            action: IMPORTED_ACTION.to_string(),
            details: json!({
                "message_id": message_id.as_str(),
                "attachments": gated.accepted.len(),
            }),
            provider: Some(provider_name.to_string()),
        };
        let id = self
            .store
            .insert_import(&MessageRecord::new(message), &gated.accepted, &audit)
            .await?;

        self.update_stats(|s| {
            s.attachments_processed += gated.accepted.len();
            s.attachments_rejected += gated.rejected;
        })
        .await;

        tracing::debug!(message_id = %message_id, record = %id, "Imported message");
        Ok(Outcome::Processed)
    }

    /// Downloads and gates every manifest entry. Failures count as rejections.
    async fn gate_attachments(
        &self,
        provider: &SharedProvider,
        message: &NormalizedMessage,
    ) -> GatedAttachments {
        let mut gated = GatedAttachments::default();

        for entry in &message.attachments {
            let fetched = {
                let guard = provider.read().await;
                self.bounded(guard.get_attachment(&message.id, &entry.attachment_id))
                    .await
            };
            let data = match fetched {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!(
                        message_id = %message.id,
                        filename = %entry.filename,
                        error = %e,
                        "Attachment download failed"
                    );
                    gated.rejected += 1;
                    continue;
                }
            };

            let candidate =
                AttachmentCandidate::new(entry.filename.clone(), entry.declared_mime.clone(), data);
            match self.gate.admit(&candidate).await {
                Ok(Admission::Accepted { attachment, .. }) => gated.accepted.push(attachment),
                Ok(Admission::Rejected { verdict }) => {
                    tracing::warn!(
                        message_id = %message.id,
                        filename = %entry.filename,
                        issues = ?verdict.issue_messages(),
                        "Attachment rejected"
                    );
                    gated.rejected += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        message_id = %message.id,
                        filename = %entry.filename,
                        error = %e,
                        "Attachment could not be prepared"
                    );
                    gated.rejected += 1;
                }
            }
        }

        gated
    }

    /// Applies the per-call timeout to a provider future.
    async fn bounded<T>(
        &self,
        call: impl Future<Output = std::result::Result<T, ProviderError>>,
    ) -> std::result::Result<T, ProviderError> {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(self.call_timeout)),
        }
    }

    async fn set_state(&self, state: PipelineState) {
        self.progress.write().await.state = state;
        let _ = self.event_sender.send(PipelineEvent::StateChanged(state));
    }

    async fn update_stats(&self, update: impl FnOnce(&mut RunStats)) {
        update(&mut self.progress.write().await.stats);
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("registry", &self.registry)
            .field("batch_size", &self.batch_size)
            .field("max_results_per_page", &self.max_results_per_page)
            .field("call_timeout", &self.call_timeout)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Address, AttachmentRef, Body, Provenance, ProviderMessageId};
    use crate::providers::{Capabilities, MailProvider, MessagePage};
    use crate::security::GatePolicy;
    use crate::storage::SqliteStore;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Calls {
        lists: Vec<ListQuery>,
        fetches: Vec<String>,
    }

    struct FakeProvider {
        messages: Vec<NormalizedMessage>,
        broken: HashSet<String>,
        reject_auth: bool,
        authenticated: bool,
        cancel_on_fetch: Option<CancelHandle>,
        calls: Arc<Mutex<Calls>>,
    }

    impl FakeProvider {
        fn new(count: usize, calls: Arc<Mutex<Calls>>) -> Self {
            Self {
                messages: (0..count).map(sample).collect(),
                broken: HashSet::new(),
                reject_auth: false,
                authenticated: false,
                cancel_on_fetch: None,
                calls,
            }
        }
    }

    fn base_date() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 8, 0, 0).unwrap()
    }

    fn sample(index: usize) -> NormalizedMessage {
        NormalizedMessage {
            id: ProviderMessageId::from(format!("m{}", index)),
            thread_id: None,
            subject: format!("Message {}", index),
            from: Address::new("sender@example.com"),
            to: vec![Address::new("me@example.com")],
            cc: Vec::new(),
            bcc: Vec::new(),
            date: base_date() + ChronoDuration::hours(index as i64),
            body: Body {
                plain: Some(format!("Body {}", index)),
                html: None,
                markdown: None,
            },
            labels: Vec::new(),
            attachments: Vec::new(),
            provenance: Provenance::new("fake", None),
        }
    }

    #[async_trait]
    impl MailProvider for FakeProvider {
        fn name(&self) -> &str {
            "fake"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }

        fn account(&self) -> Option<String> {
            None
        }

        fn is_authenticated(&self) -> bool {
            self.authenticated
        }

        async fn authenticate(&mut self, _credentials: &Credentials) -> crate::providers::Result<()> {
            if self.reject_auth {
                return Err(ProviderError::Authentication("denied".to_string()));
            }
            self.authenticated = true;
            Ok(())
        }

        async fn test_connection(&self) -> bool {
            self.authenticated
        }

        async fn list_messages(&self, query: &ListQuery) -> crate::providers::Result<MessagePage> {
            self.calls.lock().unwrap().lists.push(query.clone());
            let matching: Vec<&NormalizedMessage> = self
                .messages
                .iter()
                .filter(|m| query.date_range.contains(&m.date))
                .collect();
            let offset: usize = query.page_token.as_deref().map_or(0, |t| t.parse().unwrap());
            let end = (offset + query.max_results as usize).min(matching.len());
            Ok(MessagePage {
                refs: matching[offset..end]
                    .iter()
                    .map(|m| MessageRef {
                        id: m.id.clone(),
                        thread_id: None,
                    })
                    .collect(),
                next_page_token: (end < matching.len()).then(|| end.to_string()),
                total_estimate: Some(matching.len() as u64),
            })
        }

        async fn get_message(&self, id: &ProviderMessageId) -> crate::providers::Result<NormalizedMessage> {
            self.calls.lock().unwrap().fetches.push(id.to_string());
            if let Some(handle) = &self.cancel_on_fetch {
                handle.cancel();
            }
            if self.broken.contains(id.as_str()) {
                return Err(ProviderError::Provider("corrupt message".to_string()));
            }
            self.messages
                .iter()
                .find(|m| &m.id == id)
                .cloned()
                .ok_or_else(|| ProviderError::NotFound(id.to_string()))
        }

        async fn get_attachment(
            &self,
            _message_id: &ProviderMessageId,
            attachment_id: &str,
        ) -> crate::providers::Result<Vec<u8>> {
            match attachment_id {
                "text" => Ok(b"meeting notes".to_vec()),
                _ => Err(ProviderError::NotFound(attachment_id.to_string())),
            }
        }
    }

    async fn pipeline_with(provider: FakeProvider) -> (Pipeline, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let slot = Arc::new(Mutex::new(Some(provider)));
        let mut registry = ProviderRegistry::new();
        registry.register("fake", move || {
            let provider = slot.lock().unwrap().take().expect("factory called once");
            Box::new(provider) as Box<dyn MailProvider>
        });
        let pipeline = Pipeline::new(
            Arc::new(registry),
            store.clone(),
            Arc::new(AttachmentGate::new(GatePolicy::default())),
            "fake",
        )
        .with_settings(&PipelineSettings {
            batch_size: 2,
            max_results_per_page: 3,
            call_timeout_secs: 5,
        });
        (pipeline, store)
    }

    #[tokio::test]
    async fn cap_shrinks_the_last_page() {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let (pipeline, _store) = pipeline_with(FakeProvider::new(10, calls.clone())).await;

        let report = pipeline
            .run_full_import(ImportRequest {
                max_results: Some(5),
                generate_embeddings: false,
                ..Default::default()
            })
            .await
            .unwrap();

        let sizes: Vec<u32> = calls.lock().unwrap().lists.iter().map(|q| q.max_results).collect();
        assert_eq!(sizes, vec![3, 2]);
        assert_eq!(report.total_found, 5);
        assert_eq!(report.stats.processed, 5);
        assert_eq!(calls.lock().unwrap().fetches.len(), 5);
    }

    #[tokio::test]
    async fn stored_messages_are_skipped_without_fetching() {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let (pipeline, store) = pipeline_with(FakeProvider::new(3, calls.clone())).await;
        store
            .insert(&MessageRecord::new(sample(1)))
            .await
            .unwrap();

        let report = pipeline
            .run_full_import(ImportRequest {
                generate_embeddings: false,
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(report.stats.processed, 2);
        assert_eq!(report.stats.skipped, 1);
        assert_eq!(report.touched, 3);
        assert!(!calls.lock().unwrap().fetches.contains(&"m1".to_string()));
    }

    #[tokio::test]
    async fn one_bad_message_does_not_stop_the_run() {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let mut provider = FakeProvider::new(4, calls);
        provider.broken.insert("m2".to_string());
        let (pipeline, store) = pipeline_with(provider).await;

        let report = pipeline
            .run_full_import(ImportRequest {
                generate_embeddings: false,
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(report.stats.processed, 3);
        assert_eq!(report.stats.failed, 1);
        assert_eq!(store.counts().await.unwrap().total, 3);
    }

    #[tokio::test]
    async fn failed_attachment_download_counts_as_rejected() {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let mut provider = FakeProvider::new(1, calls);
        provider.messages[0].attachments = vec![
            AttachmentRef {
                attachment_id: "text".to_string(),
                filename: "notes.txt".to_string(),
                declared_mime: Some("text/plain".to_string()),
                size_bytes: 13,
            },
            AttachmentRef {
                attachment_id: "gone".to_string(),
                filename: "lost.pdf".to_string(),
                declared_mime: Some("application/pdf".to_string()),
                size_bytes: 10,
            },
        ];
        let (pipeline, store) = pipeline_with(provider).await;

        let report = pipeline
            .run_full_import(ImportRequest {
                generate_embeddings: false,
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(report.stats.processed, 1);
        assert_eq!(report.stats.attachments_processed, 1);
        assert_eq!(report.stats.attachments_rejected, 1);

        let stored = store
            .find_by_provider_id(&ProviderMessageId::from("m0"))
            .await
            .unwrap()
            .unwrap();
        let audit = store.audit_for(stored.id).await.unwrap();
        assert_eq!(audit[0].action, IMPORTED_ACTION);
        assert_eq!(audit[0].details["attachments"], 1);
    }

    #[tokio::test]
    async fn rejected_authentication_fails_the_run() {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let mut provider = FakeProvider::new(2, calls.clone());
        provider.reject_auth = true;
        let (pipeline, _store) = pipeline_with(provider).await;

        let result = pipeline.run_full_import(ImportRequest::default()).await;

        assert!(matches!(
            result,
            Err(PipelineError::Provider(ProviderError::Authentication(_)))
        ));
        assert!(calls.lock().unwrap().lists.is_empty());
        assert_eq!(pipeline.progress().await.state, PipelineState::Failed);
        assert!(!pipeline.is_running());
    }

    #[tokio::test]
    async fn cancellation_stops_at_batch_boundary() {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let provider = FakeProvider::new(5, calls.clone());
        let (pipeline, _store) = pipeline_with_cancel(provider).await;

        let report = pipeline
            .run_full_import(ImportRequest {
                generate_embeddings: false,
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.stats.found, 5);
        assert_eq!(report.stats.processed, 2);
        assert_eq!(calls.lock().unwrap().fetches.len(), 2);
    }

    async fn pipeline_with_cancel(mut provider: FakeProvider) -> (Pipeline, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let registry = Arc::new(ProviderRegistry::new());
        let pipeline = Pipeline::new(
            registry,
            store.clone(),
            Arc::new(AttachmentGate::new(GatePolicy::default())),
            "fake",
        );
        provider.cancel_on_fetch = Some(pipeline.cancel_handle());

        let slot = Arc::new(Mutex::new(Some(provider)));
        let mut registry = ProviderRegistry::new();
        registry.register("fake", move || {
            let provider = slot.lock().unwrap().take().expect("factory called once");
            Box::new(provider) as Box<dyn MailProvider>
        });
        let pipeline = Pipeline {
            registry: Arc::new(registry),
            ..pipeline
        }
        .with_settings(&PipelineSettings {
            batch_size: 2,
            max_results_per_page: 10,
            call_timeout_secs: 5,
        });
        (pipeline, store)
    }

    #[tokio::test]
    async fn events_report_progress() {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let (pipeline, _store) = pipeline_with(FakeProvider::new(3, calls)).await;
        let mut events = pipeline.subscribe();

        pipeline
            .run_full_import(ImportRequest {
                generate_embeddings: false,
                ..Default::default()
            })
            .await
            .unwrap();

        let mut batches = 0;
        let mut completed = None;
        while let Ok(event) = events.try_recv() {
            match event {
                PipelineEvent::BatchCompleted { batches: total, .. } => {
                    batches += 1;
                    assert_eq!(total, 2);
                }
                PipelineEvent::Completed(report) => completed = Some(report),
                _ => {}
            }
        }
        assert_eq!(batches, 2);
        assert_eq!(completed.unwrap().stats.processed, 3);
    }

    #[tokio::test]
    async fn switching_provider_resets_last_run() {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let (pipeline, _store) = pipeline_with(FakeProvider::new(1, calls)).await;

        pipeline
            .run_full_import(ImportRequest {
                generate_embeddings: false,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(pipeline.last_run().await.is_some());

        pipeline.switch_provider("fake").await.unwrap();
        assert!(pipeline.last_run().await.is_none());
        assert_eq!(pipeline.progress().await, Progress::default());

        let unknown = pipeline.switch_provider("pop3").await;
        assert!(matches!(unknown, Err(PipelineError::Registry(_))));
    }

    #[tokio::test]
    async fn status_reports_counts() {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let (pipeline, _store) = pipeline_with(FakeProvider::new(2, calls)).await;

        pipeline
            .run_full_import(ImportRequest {
                generate_embeddings: false,
                ..Default::default()
            })
            .await
            .unwrap();

        let status = pipeline.get_status().await.unwrap();
        assert_eq!(status.provider, "fake");
        assert!(status.authenticated);
        assert_eq!(status.state, PipelineState::Done);
        assert_eq!(status.total_records, 2);
        assert_eq!(status.records_with_vectors, 0);
        assert_eq!(status.last_run.unwrap().processed, 2);
    }

    #[test]
    fn run_guard_admits_one_run() {
        let running = AtomicBool::new(false);
        let first = RunGuard::acquire(&running).unwrap();
        assert!(matches!(
            RunGuard::acquire(&running),
            Err(PipelineError::AlreadyRunning)
        ));
        drop(first);
        assert!(RunGuard::acquire(&running).is_ok());
    }
}
