//! Provider registration table.
//!
//! The application registers one factory per enabled provider at startup.
//! Instances are created on first use and cached, so each name maps to a
//! single provider and therefore a single session.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use super::MailProvider;

/// A cached provider instance. Writers hold the lock to authenticate.
pub type SharedProvider = Arc<RwLock<Box<dyn MailProvider>>>;

/// Builds a fresh, unauthenticated provider.
pub type ProviderFactory = Box<dyn Fn() -> Box<dyn MailProvider> + Send + Sync>;

/// Errors raised by [`ProviderRegistry`].
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
}

/// Maps provider names to factories and lazily created singletons.
#[derive(Default)]
pub struct ProviderRegistry {
    factories: BTreeMap<String, ProviderFactory>,
    instances: Mutex<HashMap<String, SharedProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under `name`, replacing any earlier registration.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn MailProvider> + Send + Sync + 'static,
    {
        let name = name.into();
        tracing::debug!(provider = %name, "Registered provider");
        self.factories.insert(name, Box::new(factory));
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Returns the instance for `name`, creating it on first call.
    pub async fn get(&self, name: &str) -> Result<SharedProvider, RegistryError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| RegistryError::UnknownProvider(name.to_string()))?;

        let mut instances = self.instances.lock().await;
        let provider = instances
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(provider = %name, "Creating provider instance");
                Arc::new(RwLock::new(factory()))
            })
            .clone();
        Ok(provider)
    }

    /// Drops every cached instance. The next [`get`](Self::get) builds a
    /// fresh, unauthenticated provider.
    pub async fn clear_instances(&self) {
        let mut instances = self.instances.lock().await;
        tracing::debug!(count = instances.len(), "Clearing provider instances");
        instances.clear();
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::LocalProvider;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_registry(created: Arc<AtomicUsize>) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        registry.register("local", move || {
            created.fetch_add(1, Ordering::SeqCst);
            Box::new(LocalProvider::new("/tmp", None)) as Box<dyn MailProvider>
        });
        registry
    }

    #[tokio::test]
    async fn get_caches_one_instance_per_name() {
        let created = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry(created.clone());

        let first = registry.get("local").await.unwrap();
        let second = registry.get("local").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(first.read().await.name(), "local");
    }

    #[tokio::test]
    async fn cleared_instances_are_rebuilt() {
        let created = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry(created.clone());

        let before = registry.get("local").await.unwrap();
        registry.clear_instances().await;
        let after = registry.get("local").await.unwrap();

        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert!(registry.get("local").await.is_ok());
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unknown_provider_is_an_error() {
        let registry = counting_registry(Arc::new(AtomicUsize::new(0)));
        let result = registry.get("exchange").await;
        assert!(matches!(result, Err(RegistryError::UnknownProvider(name)) if name == "exchange"));
    }

    #[test]
    fn names_are_sorted() {
        let mut registry = ProviderRegistry::new();
        registry.register("local", || {
            Box::new(LocalProvider::new("/tmp", None)) as Box<dyn MailProvider>
        });
        registry.register("gmail", || {
            Box::new(crate::providers::GmailProvider::new("http://localhost")) as Box<dyn MailProvider>
        });

        assert_eq!(registry.names(), vec!["gmail", "local"]);
        assert!(registry.contains("gmail"));
        assert!(!registry.contains("imap"));
    }
}
