//! Configuration management for precis
//!
//! Handles loading, saving, and validating configuration from TOML files.

mod defaults;

pub use defaults::*;

use crate::cache::EvictionPolicy;
use crate::error::{Error, Result};
use crate::meta::TaskKind;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// SQLite connection settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Dispatcher behaviour
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Eviction policy for jobs and the pre-processing cache
    #[serde(default)]
    pub cache: EvictionConfig,

    /// Eviction policy for the file cache
    #[serde(default)]
    pub files: EvictionConfig,

    /// Reference data seeded on schema initialization
    #[serde(default)]
    pub reference: ReferenceConfig,

    /// Paths configuration (internal, not user-editable)
    #[serde(skip)]
    pub paths: PathsConfig,
}

/// SQLite connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// How long a writer waits on a locked database before failing
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Connections per database pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Time a job may spend in one stage before it is reported as stalled.
    /// Unset means stalls are never reported.
    #[serde(default)]
    pub stage_deadline_secs: Option<u64>,

    /// Poll timeout on the completions topic
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Interval between maintenance passes
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,

    /// Give up on a failing completion event after this many deliveries.
    /// Unset means the bus keeps redelivering.
    #[serde(default)]
    pub max_delivery_attempts: Option<u32>,

    /// Delay before a failed completion event is redelivered. Doubles on
    /// every further attempt. Zero redelivers at once.
    #[serde(default = "default_redelivery_delay_ms")]
    pub redelivery_delay_ms: u64,

    /// Upper bound on the redelivery delay
    #[serde(default = "default_max_redelivery_delay_ms")]
    pub max_redelivery_delay_ms: u64,
}

/// Eviction thresholds. Both unset means nothing is evicted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvictionConfig {
    /// Remove entries not flagged for caching once idle this long
    #[serde(default)]
    pub uncached_idle_secs: Option<u64>,

    /// Keep at most this many entries, dropping least recently accessed first
    #[serde(default)]
    pub max_entries: Option<usize>,
}

/// Reference data seeds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceConfig {
    #[serde(default = "default_languages")]
    pub languages: Vec<LanguageSeed>,

    #[serde(default = "default_models")]
    pub models: Vec<ModelSeed>,
}

/// A language to seed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageSeed {
    /// Unique tag, e.g. an ISO 639-1 code
    pub tag: String,
    pub name: String,
}

/// A model to seed, with its family and vendor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSeed {
    pub name: String,
    pub family: String,
    pub vendor: String,
    pub tasks: Vec<TaskKind>,
}

/// Internal paths configuration
#[derive(Debug, Clone, Default)]
pub struct PathsConfig {
    /// Base directory for precis data
    pub base_dir: PathBuf,

    /// Path to config file
    pub config_file: PathBuf,

    /// Path to the jobs/cache database
    pub jobs_db: PathBuf,

    /// Path to the file dedup database
    pub files_db: PathBuf,
}

impl PathsConfig {
    fn under(base: PathBuf, config_file: PathBuf) -> Self {
        Self {
            config_file,
            jobs_db: base.join("jobs.db"),
            files_db: base.join("files.db"),
            base_dir: base,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            dispatcher: DispatcherConfig::default(),
            cache: EvictionConfig::default(),
            files: EvictionConfig::default(),
            reference: ReferenceConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: default_busy_timeout_ms(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            stage_deadline_secs: None,
            poll_interval_ms: default_poll_interval_ms(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
            max_delivery_attempts: None,
            redelivery_delay_ms: default_redelivery_delay_ms(),
            max_redelivery_delay_ms: default_max_redelivery_delay_ms(),
        }
    }
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            languages: default_languages(),
            models: default_models(),
        }
    }
}

impl DispatcherConfig {
    pub fn stage_deadline(&self) -> Option<Duration> {
        self.stage_deadline_secs.map(Duration::from_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    /// Backoff before redelivering an event that failed on `attempt`
    pub fn redelivery_delay(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(16);
        let delay = self.redelivery_delay_ms.saturating_mul(1u64 << doublings);
        Duration::from_millis(delay.min(self.max_redelivery_delay_ms))
    }
}

impl EvictionConfig {
    /// Build the eviction policy these thresholds describe
    pub fn policy(&self) -> EvictionPolicy {
        EvictionPolicy {
            uncached_idle: self.uncached_idle_secs.map(Duration::from_secs),
            max_entries: self.max_entries,
        }
    }
}

impl Config {
    /// Get the default base directory for precis (~/.precis, or $PRECIS_HOME)
    pub fn default_base_dir() -> PathBuf {
        if let Ok(home) = std::env::var("PRECIS_HOME") {
            return PathBuf::from(home);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".precis")
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        Self::default_base_dir().join("config.toml")
    }

    /// Initialize paths configuration
    pub fn init_paths(&mut self, base_dir: Option<PathBuf>) {
        let base = base_dir.unwrap_or_else(Self::default_base_dir);
        let config_file = base.join("config.toml");
        self.paths = PathsConfig::under(base, config_file);
    }

    /// Load configuration from a specific file path
    pub fn load(config_path: &Path) -> Result<Self> {
        debug!("Loading config from {:?}", config_path);

        if !config_path.exists() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                config_path.display()
            )));
        }

        let content = std::fs::read_to_string(config_path)?;
        let mut config: Config = toml::from_str(&content)?;

        let base = config_path.parent().unwrap_or(Path::new(".")).to_path_buf();
        config.paths = PathsConfig::under(base, config_path.to_path_buf());

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific base directory, falling back to defaults
    pub fn load_from(base_dir: Option<PathBuf>) -> Result<Self> {
        let mut config = Config::default();
        config.init_paths(base_dir);

        if config.paths.config_file.exists() {
            debug!("Loading config from {:?}", config.paths.config_file);
            let content = std::fs::read_to_string(&config.paths.config_file)?;
            let mut loaded: Config = toml::from_str(&content)?;
            loaded.paths = config.paths;
            config = loaded;
        } else {
            debug!("No config file found, using defaults");
        }

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.paths.config_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&self.paths.config_file, content)?;
        info!("Saved config to {:?}", self.paths.config_file);
        Ok(())
    }

    /// Check if precis is initialized (config and both databases exist)
    pub fn is_initialized(&self) -> bool {
        self.paths.config_file.exists() && self.paths.jobs_db.exists() && self.paths.files_db.exists()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.storage.max_connections == 0 {
            return Err(Error::Config(
                "storage.max_connections must be positive".to_string(),
            ));
        }

        if self.dispatcher.poll_interval_ms == 0 {
            return Err(Error::Config(
                "dispatcher.poll_interval_ms must be positive".to_string(),
            ));
        }

        if self.dispatcher.maintenance_interval_secs == 0 {
            return Err(Error::Config(
                "dispatcher.maintenance_interval_secs must be positive".to_string(),
            ));
        }

        if self.dispatcher.stage_deadline_secs == Some(0) {
            return Err(Error::Config(
                "dispatcher.stage_deadline_secs must be positive when set".to_string(),
            ));
        }

        if self.dispatcher.max_delivery_attempts == Some(0) {
            return Err(Error::Config(
                "dispatcher.max_delivery_attempts must be positive when set".to_string(),
            ));
        }

        if self.dispatcher.max_redelivery_delay_ms < self.dispatcher.redelivery_delay_ms {
            return Err(Error::Config(
                "dispatcher.max_redelivery_delay_ms must not be below redelivery_delay_ms"
                    .to_string(),
            ));
        }

        let mut tags = HashSet::new();
        for language in &self.reference.languages {
            if language.tag.trim().is_empty() {
                return Err(Error::Config("language tags must not be empty".to_string()));
            }
            if !tags.insert(language.tag.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate language tag '{}'",
                    language.tag
                )));
            }
        }

        let mut names = HashSet::new();
        for model in &self.reference.models {
            if model.name.trim().is_empty() {
                return Err(Error::Config("model names must not be empty".to_string()));
            }
            if model.tasks.is_empty() {
                return Err(Error::Config(format!(
                    "model '{}' must declare at least one task",
                    model.name
                )));
            }
            if !names.insert(model.name.as_str()) {
                return Err(Error::Config(format!("duplicate model '{}'", model.name)));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.storage.max_connections, 5);
        assert!(config.dispatcher.stage_deadline_secs.is_none());
        assert!(config.cache.policy().is_noop());
        assert_eq!(config.reference.languages[0].tag, "en");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_save_load() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.init_paths(Some(tmp.path().to_path_buf()));
        config.dispatcher.stage_deadline_secs = Some(900);
        config.cache.uncached_idle_secs = Some(240);

        config.save().unwrap();
        assert!(config.paths.config_file.exists());

        let loaded = Config::load_from(Some(tmp.path().to_path_buf())).unwrap();
        assert_eq!(loaded.dispatcher.stage_deadline_secs, Some(900));
        assert_eq!(
            loaded.cache.policy().uncached_idle,
            Some(Duration::from_secs(240))
        );
        assert_eq!(loaded.paths.jobs_db, tmp.path().join("jobs.db"));
        assert_eq!(loaded.paths.files_db, tmp.path().join("files.db"));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [dispatcher]
            stage_deadline_secs = 60

            [[reference.models]]
            name = "bart-large-cnn"
            family = "BART"
            vendor = "Meta"
            tasks = ["summarization"]
            "#,
        )
        .unwrap();

        assert_eq!(config.dispatcher.poll_interval_ms, 1_000);
        assert_eq!(config.reference.models.len(), 1);
        assert_eq!(config.reference.languages, default_languages());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_redelivery_backoff() {
        let mut dispatcher = DispatcherConfig::default();
        assert_eq!(dispatcher.redelivery_delay(1), Duration::from_millis(500));
        assert_eq!(dispatcher.redelivery_delay(3), Duration::from_secs(2));
        assert_eq!(dispatcher.redelivery_delay(40), Duration::from_secs(30));

        dispatcher.redelivery_delay_ms = 0;
        assert_eq!(dispatcher.redelivery_delay(5), Duration::ZERO);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.dispatcher.poll_interval_ms = 0;
        assert!(config.validate().is_err());
        config.dispatcher.poll_interval_ms = 500;
        assert!(config.validate().is_ok());

        config.dispatcher.max_redelivery_delay_ms = 100;
        assert!(config.validate().is_err());
        config.dispatcher.max_redelivery_delay_ms = 30_000;

        config.reference.models[0].tasks.clear();
        assert!(config.validate().is_err());
        config.reference.models[0].tasks.push(TaskKind::Summarization);

        config.reference.languages.push(LanguageSeed {
            tag: "en".to_string(),
            name: "English (again)".to_string(),
        });
        assert!(config.validate().is_err());
    }
}
