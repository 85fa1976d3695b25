//! Application wiring.
//!
//! [`App`] builds the store, provider registry, attachment gate, and
//! embedding engine from [`Settings`] once at startup and hands out
//! pipelines bound to a provider.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::Settings;
use crate::embedding::{
    EmbeddingEngine, HeuristicTokenizer, HfTokenizer, OpenAiEmbeddings, TextTokenizer,
    TiktokenTokenizer,
};
use crate::pipeline::Pipeline;
use crate::providers::{
    GmailProvider, LocalProvider, MailProvider, ProviderRegistry, GMAIL_PROVIDER, LOCAL_PROVIDER,
};
use crate::security::{AttachmentGate, ClamdScanner, GatePolicy};
use crate::storage::SqliteStore;

/// Long-lived services shared by every pipeline.
pub struct App {
    settings: Settings,
    store: Arc<SqliteStore>,
    registry: Arc<ProviderRegistry>,
    gate: Arc<AttachmentGate>,
    embedder: Option<Arc<EmbeddingEngine>>,
}

impl App {
    /// Opens the database and builds services from `settings`.
    pub async fn build(settings: Settings) -> Result<Self> {
        let path = settings.database_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let store = SqliteStore::open(&path)
            .await
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        tracing::info!(path = %path.display(), "Database opened");

        Self::with_store(settings, store)
    }

    /// Builds services around an already opened store.
    pub fn with_store(settings: Settings, store: SqliteStore) -> Result<Self> {
        let registry = build_registry(&settings);
        let gate = build_gate(&settings);
        let embedder = build_embedder(&settings)?;

        if embedder.is_none() {
            tracing::info!("No embedding API key configured, embeddings disabled");
        }

        Ok(Self {
            settings,
            store: Arc::new(store),
            registry: Arc::new(registry),
            gate: Arc::new(gate),
            embedder,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn embedder(&self) -> Option<&Arc<EmbeddingEngine>> {
        self.embedder.as_ref()
    }

    /// A pipeline for `provider`, or the configured default.
    pub fn pipeline(&self, provider: Option<&str>) -> Pipeline {
        let name = provider.unwrap_or(&self.settings.providers.default_provider);
        let pipeline = Pipeline::new(
            self.registry.clone(),
            self.store.clone(),
            self.gate.clone(),
            name,
        )
        .with_settings(&self.settings.pipeline)
        .with_backfill_limit(self.settings.embedding.backfill_limit);

        match &self.embedder {
            Some(embedder) => pipeline.with_embedder(embedder.clone()),
            None => pipeline,
        }
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("registry", &self.registry)
            .field("embeddings", &self.embedder.is_some())
            .finish_non_exhaustive()
    }
}

/// Registers a factory for every enabled provider.
fn build_registry(settings: &Settings) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();

    for name in &settings.providers.enabled {
        match name.as_str() {
            GMAIL_PROVIDER => {
                let gmail = settings.providers.gmail.clone();
                registry.register(GMAIL_PROVIDER, move || {
                    let provider = GmailProvider::new(gmail.base_url.clone());
                    let provider = match &gmail.access_token {
                        Some(token) => provider.with_access_token(token.clone()),
                        None => provider,
                    };
                    Box::new(provider) as Box<dyn MailProvider>
                });
            }
            LOCAL_PROVIDER => match settings.providers.local.directory.clone() {
                Some(directory) => {
                    let account = settings.providers.local.account.clone();
                    registry.register(LOCAL_PROVIDER, move || {
                        Box::new(LocalProvider::new(directory.clone(), account.clone()))
                            as Box<dyn MailProvider>
                    });
                }
                None => {
                    tracing::warn!("Local provider enabled without a directory, skipping");
                }
            },
            other => tracing::warn!(provider = %other, "Unknown provider in settings, skipping"),
        }
    }

    registry
}

fn build_gate(settings: &Settings) -> AttachmentGate {
    let gate = AttachmentGate::new(GatePolicy::from(&settings.attachments));
    if !settings.scanner.enabled {
        return gate;
    }

    let timeout = Duration::from_secs(settings.scanner.timeout_secs);
    tracing::info!(
        host = %settings.scanner.host,
        port = settings.scanner.port,
        "Malware scanning enabled"
    );
    gate.with_scanner(
        Arc::new(ClamdScanner::new(
            &settings.scanner.host,
            settings.scanner.port,
            timeout,
        )),
        timeout,
    )
}

fn build_embedder(settings: &Settings) -> Result<Option<Arc<EmbeddingEngine>>> {
    let embedding = &settings.embedding;
    let Some(api_key) = embedding.api_key.as_deref().filter(|k| !k.is_empty()) else {
        return Ok(None);
    };

    let service = OpenAiEmbeddings::new(
        api_key,
        embedding.base_url.clone(),
        embedding.model.clone(),
        embedding.dimension,
        Duration::from_secs(embedding.request_timeout_secs),
    )
    .context("Failed to create embedding client")?;

    let tokenizer = build_tokenizer(embedding.tokenizer_path.as_deref())?;

    Ok(Some(Arc::new(EmbeddingEngine::from_settings(
        Arc::new(service),
        tokenizer,
        embedding,
    ))))
}

/// A configured `tokenizer.json`, else `cl100k_base`, else the estimate.
fn build_tokenizer(path: Option<&Path>) -> Result<Arc<dyn TextTokenizer>> {
    if let Some(path) = path {
        let tokenizer = HfTokenizer::from_file(path)
            .with_context(|| format!("Failed to load tokenizer {}", path.display()))?;
        return Ok(Arc::new(tokenizer));
    }
    match TiktokenTokenizer::cl100k() {
        Ok(tokenizer) => Ok(Arc::new(tokenizer)),
        Err(e) => {
            tracing::warn!(error = %e, "Falling back to estimated token counts");
            Ok(Arc::new(HeuristicTokenizer))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registers_only_enabled_providers() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.providers.enabled = vec!["local".to_string()];
        settings.providers.default_provider = "local".to_string();
        settings.providers.local.directory = Some(dir.path().to_path_buf());

        let app = App::with_store(settings, SqliteStore::in_memory().await.unwrap()).unwrap();

        assert_eq!(app.registry().names(), vec!["local".to_string()]);
        assert!(app.embedder().is_none());
        assert_eq!(app.pipeline(None).provider().await, "local");
    }

    #[tokio::test]
    async fn local_without_directory_is_skipped() {
        let settings = Settings::default();
        let app = App::with_store(settings, SqliteStore::in_memory().await.unwrap()).unwrap();
        assert_eq!(app.registry().names(), vec!["gmail".to_string()]);
    }

    #[tokio::test]
    async fn api_key_enables_embeddings() {
        let mut settings = Settings::default();
        settings.embedding.api_key = Some("sk-test".to_string());
        let app = App::with_store(settings, SqliteStore::in_memory().await.unwrap()).unwrap();

        let embedder = app.embedder().unwrap();
        assert_eq!(embedder.model(), "text-embedding-3-small");
        assert_eq!(embedder.dimension(), 1536);
    }

    #[test]
    fn default_tokenizer_counts_cl100k_tokens() {
        let tokenizer = build_tokenizer(None).unwrap();
        assert_eq!(tokenizer.count("hello world").unwrap(), 2);
    }

    #[test]
    fn missing_tokenizer_file_is_an_error() {
        let result = build_tokenizer(Some(Path::new("/nonexistent/tokenizer.json")));
        assert!(result.is_err());
    }
}
