use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{PipelineError, Result};

/// Process-wide configuration, built once in `main` and passed by reference.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub mirror: Option<MirrorConfig>,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub normalize: NormalizeConfig,
    pub pipeline: PipelineConfig,
    pub watch: WatchConfig,
    pub retry: RetryConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory; each namespace is a subdirectory (`raw/`, `validated/`, `classified/`).
    pub data_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data"),
        }
    }
}

/// S3-compatible object store used as a best-effort mirror of the local layers.
#[derive(Debug, Clone, Deserialize)]
pub struct MirrorConfig {
    pub endpoint: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_raw_bucket")]
    pub raw_bucket: String,
    #[serde(default = "default_validated_bucket")]
    pub validated_bucket: String,
    #[serde(default = "default_classified_bucket")]
    pub classified_bucket: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_raw_bucket() -> String {
    "raw".to_string()
}

fn default_validated_bucket() -> String {
    "validated".to_string()
}

fn default_classified_bucket() -> String {
    "classified".to_string()
}

fn default_timeout_seconds() -> u64 {
    30
}

impl MirrorConfig {
    pub fn from_endpoint(endpoint: String) -> Self {
        Self {
            endpoint,
            token: None,
            raw_bucket: default_raw_bucket(),
            validated_bucket: default_validated_bucket(),
            classified_bucket: default_classified_bucket(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    /// When false the database load is skipped.
    pub enabled: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/esteira_geo.db"),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: PathBuf,
    pub file_name: String,
    pub default_filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            file_name: "pipeline.log".to_string(),
            default_filter: "esteira_geo=info,warn".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NormalizeConfig {
    /// Score deducted per substitution/imputation.
    pub substitution_penalty: f64,
    /// Categorical strings at or above this length are left untouched.
    pub categorical_max_len: usize,
    /// Passthrough attributes that are case-folded like `severity`.
    pub extra_categorical_fields: Vec<String>,
    pub sentinel: String,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            substitution_penalty: 0.1,
            categorical_max_len: 100,
            extra_categorical_fields: Vec::new(),
            sentinel: "N/A".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub hazard_areas_file: String,
    pub individuals_file: String,
    /// Fail the run (non-zero exit) when the database load fails.
    pub fail_on_database_error: bool,
    /// A lock file older than this is considered abandoned.
    pub lock_stale_after_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            hazard_areas_file: "hazard_areas.geojson".to_string(),
            individuals_file: "individuals.geojson".to_string(),
            fail_on_database_error: false,
            lock_stale_after_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub poll_interval_secs: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
        }
    }
}

impl WatchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus exposition is written here after each run.
    pub textfile: Option<PathBuf>,
    /// Serve `/metrics` over HTTP while the process runs.
    pub listen_addr: Option<String>,
}

impl Config {
    /// Load configuration: optional TOML file, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let config_content = fs::read_to_string(path).map_err(|e| {
                    PipelineError::Config(format!(
                        "Failed to read config file '{}': {}",
                        path.display(),
                        e
                    ))
                })?;
                toml::from_str::<Config>(&config_content)?
            }
            None => Config::default(),
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `ESTEIRA_*` overrides using the given lookup.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup("ESTEIRA_DATA_ROOT") {
            self.storage.data_root = PathBuf::from(root);
        }
        if let Some(db) = lookup("ESTEIRA_DB_PATH") {
            self.database.path = PathBuf::from(db);
        }
        if let Some(dir) = lookup("ESTEIRA_LOG_DIR") {
            self.logging.dir = PathBuf::from(dir);
        }
        if let Some(endpoint) = lookup("ESTEIRA_MIRROR_ENDPOINT") {
            let mirror = self
                .mirror
                .get_or_insert_with(|| MirrorConfig::from_endpoint(endpoint.clone()));
            mirror.endpoint = endpoint;
        }
        if let Some(token) = lookup("ESTEIRA_MIRROR_TOKEN") {
            if let Some(mirror) = self.mirror.as_mut() {
                mirror.token = Some(token);
            }
        }
        if let Some(interval) = lookup("ESTEIRA_POLL_INTERVAL_SECS") {
            self.watch.poll_interval_secs = interval.trim().parse().map_err(|_| {
                PipelineError::Config(format!(
                    "ESTEIRA_POLL_INTERVAL_SECS must be an integer, got '{}'",
                    interval
                ))
            })?;
        }
        if let Some(textfile) = lookup("ESTEIRA_METRICS_TEXTFILE") {
            self.metrics.textfile = Some(PathBuf::from(textfile));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let penalty = self.normalize.substitution_penalty;
        if !(penalty > 0.0 && penalty <= 1.0) {
            return Err(PipelineError::Config(format!(
                "normalize.substitution_penalty must be in (0, 1], got {}",
                penalty
            )));
        }
        if self.watch.poll_interval_secs == 0 {
            return Err(PipelineError::Config(
                "watch.poll_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(PipelineError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.pipeline.hazard_areas_file.trim().is_empty()
            || self.pipeline.individuals_file.trim().is_empty()
        {
            return Err(PipelineError::Config(
                "pipeline input file names must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
