//! Configuration and settings management.
//!
//! Settings are read from a JSON file, then environment variables override
//! individual fields. A `.env` file in the working directory is honoured.

mod settings;

pub use settings::{
    AttachmentSettings, EmbeddingSettings, GmailSettings, LocalSettings, LoggingSettings,
    PipelineSettings, ProviderSettings, ScannerSettings, Settings, StorageSettings,
};

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use thiserror::Error;

/// Errors loading or validating settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid settings file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },

    #[error("Invalid settings: {0}")]
    Invalid(String),

    #[error("Could not determine the user's home directory")]
    NoHomeDirectory,
}

fn project_dirs() -> Result<ProjectDirs, ConfigError> {
    ProjectDirs::from("dev", "mailvault", "mailvault").ok_or(ConfigError::NoHomeDirectory)
}

/// Default location of `settings.json`.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    Ok(project_dirs()?.config_dir().join("settings.json"))
}

/// Default location of the SQLite database.
pub fn default_database_path() -> Result<PathBuf, ConfigError> {
    Ok(project_dirs()?.data_dir().join("mailvault.db"))
}

impl Settings {
    /// Loads settings from `path`, or from the default location when `None`.
    ///
    /// A missing file yields defaults. Environment overrides are applied and
    /// the result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let path = match path {
            Some(path) => path.to_path_buf(),
            None => default_config_path()?,
        };
        let mut settings = Self::from_file(&path)?;
        settings.apply_env(|key| std::env::var(key).ok())?;
        settings.validate()?;

        tracing::debug!(path = %path.display(), "settings loaded");
        Ok(settings)
    }

    /// Reads a settings file. A missing file yields defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Applies environment overrides read through `lookup`.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv {
                    key: key.to_string(),
                    value,
                })
        }
        fn list(value: &str) -> Vec<String> {
            value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        }

        if let Some(v) = lookup("DATABASE_PATH") {
            self.storage.database_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("DEFAULT_PROVIDER") {
            self.providers.default_provider = v;
        }
        if let Some(v) = lookup("ENABLED_PROVIDERS") {
            self.providers.enabled = list(&v);
        }
        if let Some(v) = lookup("GMAIL_ACCESS_TOKEN") {
            self.providers.gmail.access_token = Some(v);
        }
        if let Some(v) = lookup("LOCAL_MAIL_DIR") {
            self.providers.local.directory = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("BATCH_SIZE") {
            self.pipeline.batch_size = parse("BATCH_SIZE", v)?;
        }
        if let Some(v) = lookup("MAX_RESULTS_PER_PAGE") {
            self.pipeline.max_results_per_page = parse("MAX_RESULTS_PER_PAGE", v)?;
        }
        if let Some(v) = lookup("MAX_ATTACHMENT_SIZE_MB") {
            let mb: u64 = parse("MAX_ATTACHMENT_SIZE_MB", v.clone())?;
            self.attachments.max_size_bytes =
                mb.checked_mul(1024 * 1024).ok_or_else(|| ConfigError::InvalidEnv {
                    key: "MAX_ATTACHMENT_SIZE_MB".to_string(),
                    value: v,
                })?;
        }
        if let Some(v) = lookup("ALLOWED_MIME_TYPES") {
            self.attachments.allowed_mime_types = list(&v);
        }
        if let Some(v) = lookup("ENABLE_CLAMAV") {
            self.scanner.enabled = matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(v) = lookup("CLAMAV_HOST") {
            self.scanner.host = v;
        }
        if let Some(v) = lookup("CLAMAV_PORT") {
            self.scanner.port = parse("CLAMAV_PORT", v)?;
        }
        if let Some(v) = lookup("OPENAI_API_KEY") {
            self.embedding.api_key = Some(v).filter(|k| !k.is_empty());
        }
        if let Some(v) = lookup("EMBEDDING_MODEL") {
            self.embedding.model = v;
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            self.logging.level = v.to_ascii_lowercase();
        }

        Ok(())
    }

    /// Rejects settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.batch_size == 0 {
            return Err(ConfigError::Invalid("pipeline.batch_size must be positive".into()));
        }
        if self.pipeline.max_results_per_page == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.max_results_per_page must be positive".into(),
            ));
        }
        if self.embedding.batch_size == 0 || self.embedding.dimension == 0 {
            return Err(ConfigError::Invalid(
                "embedding.batch_size and embedding.dimension must be positive".into(),
            ));
        }
        if self.embedding.max_tokens == 0 {
            return Err(ConfigError::Invalid("embedding.max_tokens must be positive".into()));
        }
        if self.embedding.retry_attempts == 0 {
            return Err(ConfigError::Invalid("embedding.retry_attempts must be positive".into()));
        }
        if self.attachments.allowed_mime_types.is_empty() {
            return Err(ConfigError::Invalid(
                "attachments.allowed_mime_types must not be empty".into(),
            ));
        }
        if !self.providers.enabled.contains(&self.providers.default_provider) {
            return Err(ConfigError::Invalid(format!(
                "default provider '{}' is not enabled",
                self.providers.default_provider
            )));
        }
        Ok(())
    }

    /// Database path, falling back to the user data directory.
    pub fn database_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.storage.database_path {
            Some(path) => Ok(path.clone()),
            None => default_database_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::from_file(&dir.path().join("absent.json")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(Settings::from_file(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn env_overrides_fields() {
        let mut settings = Settings::default();
        settings
            .apply_env(env(&[
                ("BATCH_SIZE", "25"),
                ("MAX_ATTACHMENT_SIZE_MB", "2"),
                ("ENABLE_CLAMAV", "true"),
                ("CLAMAV_PORT", "3311"),
                ("ALLOWED_MIME_TYPES", "application/pdf, text/plain"),
                ("ENABLED_PROVIDERS", "local"),
                ("DEFAULT_PROVIDER", "local"),
            ]))
            .unwrap();

        assert_eq!(settings.pipeline.batch_size, 25);
        assert_eq!(settings.attachments.max_size_bytes, 2 * 1024 * 1024);
        assert!(settings.scanner.enabled);
        assert_eq!(settings.scanner.port, 3311);
        assert_eq!(
            settings.attachments.allowed_mime_types,
            vec!["application/pdf".to_string(), "text/plain".to_string()]
        );
        assert_eq!(settings.providers.enabled, vec!["local".to_string()]);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn unparsable_env_value_is_rejected() {
        let mut settings = Settings::default();
        let err = settings.apply_env(env(&[("CLAMAV_PORT", "not-a-port")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { key, .. } if key == "CLAMAV_PORT"));
    }

    #[test]
    fn oversized_attachment_limit_is_rejected() {
        let mut settings = Settings::default();
        let huge = u64::MAX.to_string();
        let err = settings
            .apply_env(env(&[("MAX_ATTACHMENT_SIZE_MB", huge.as_str())]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { key, .. } if key == "MAX_ATTACHMENT_SIZE_MB"));

        settings.apply_env(env(&[("MAX_ATTACHMENT_SIZE_MB", "3")])).unwrap();
        assert_eq!(settings.attachments.max_size_bytes, 3 * 1024 * 1024);
    }

    #[test]
    fn validate_rejects_zero_token_budget() {
        let mut settings = Settings::default();
        settings.embedding.max_tokens = 0;
        let err = settings.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("max_tokens")));
    }

    #[test]
    fn validate_rejects_zero_batch_and_disabled_default() {
        let mut settings = Settings::default();
        settings.pipeline.batch_size = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.providers.default_provider = "imap".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn explicit_database_path_wins() {
        let mut settings = Settings::default();
        settings.storage.database_path = Some(PathBuf::from("/tmp/mv.db"));
        assert_eq!(settings.database_path().unwrap(), PathBuf::from("/tmp/mv.db"));
    }
}
