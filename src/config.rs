//! Coordinator configuration.
//!
//! Values are layered: defaults, then an optional YAML file, then `MLOPS_*`
//! environment variables, then command-line flags (applied by the CLI through
//! the `with_*` builders).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::graph::Stage;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Configuration for the run coordinator.
#[derive(Debug, Clone)]
pub struct ForgeConfig {
    // Sources
    /// Line-oriented list of pipeline locators.
    pub sources_file: PathBuf,
    /// Where remote pipelines are checked out.
    pub checkout_dir: PathBuf,
    /// Reset and pull existing checkouts before each cycle.
    pub refresh_sources: bool,

    // Storage
    pub datasets_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    /// SQLite file holding the history store.
    pub history_path: PathBuf,
    /// Namespace inside the history store.
    pub history_scope: String,
    pub tracking_dir: PathBuf,

    // Execution
    pub workers: usize,
    /// Stages scheduled for every component, in order.
    pub stages: Vec<Stage>,
    /// Per-task limit on a single stage call.
    pub task_timeout: Option<Duration>,

    // Loop
    /// Delay between successful cycles.
    pub idle_interval: Duration,
    /// Delay after a failed cycle.
    pub error_backoff: Duration,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            sources_file: PathBuf::from("pipelines.txt"),
            checkout_dir: PathBuf::from("./remote_pipelines"),
            refresh_sources: true,

            datasets_dir: PathBuf::from("./datasets"),
            artifacts_dir: PathBuf::from("./artifacts"),
            history_path: PathBuf::from("./history.db"),
            history_scope: "mlops-forge".to_string(),
            tracking_dir: PathBuf::from("./mlruns"),

            workers: 1,
            stages: vec![Stage::Train, Stage::Test],
            task_timeout: None,

            idle_interval: Duration::from_secs(5),
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// On-disk form of `ForgeConfig`; every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    sources_file: Option<PathBuf>,
    checkout_dir: Option<PathBuf>,
    refresh_sources: Option<bool>,
    datasets_dir: Option<PathBuf>,
    artifacts_dir: Option<PathBuf>,
    history_path: Option<PathBuf>,
    history_scope: Option<String>,
    tracking_dir: Option<PathBuf>,
    workers: Option<usize>,
    stages: Option<Vec<Stage>>,
    task_timeout_secs: Option<u64>,
    idle_interval_secs: Option<u64>,
    error_backoff_secs: Option<u64>,
}

impl ForgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from an optional YAML file and the environment.
    ///
    /// The result is not validated: callers apply their own overrides first
    /// and call `validate` once every layer is in place.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env()
    }

    /// Creates configuration from environment variables over the defaults.
    ///
    /// # Environment Variables
    ///
    /// - `MLOPS_SOURCES_FILE`: pipeline source list (default: pipelines.txt)
    /// - `MLOPS_CHECKOUT_DIR`: remote checkout directory (default: ./remote_pipelines)
    /// - `MLOPS_REFRESH_SOURCES`: refresh checkouts each cycle (default: true)
    /// - `MLOPS_DATASETS_DIR`: dataset root (default: ./datasets)
    /// - `MLOPS_ARTIFACTS_DIR`: artifact root (default: ./artifacts)
    /// - `MLOPS_HISTORY_PATH`: SQLite history file (default: ./history.db)
    /// - `MLOPS_HISTORY_SCOPE`: history namespace (default: mlops-forge)
    /// - `MLOPS_TRACKING_DIR`: run record directory (default: ./mlruns)
    /// - `MLOPS_WORKERS`: worker pool size (default: 1)
    /// - `MLOPS_STAGES`: comma-separated stages (default: train,test)
    /// - `MLOPS_TASK_TIMEOUT_SECS`: per-task timeout, 0 disables (default: none)
    /// - `MLOPS_IDLE_INTERVAL_SECS`: delay between cycles (default: 5)
    /// - `MLOPS_ERROR_BACKOFF_SECS`: delay after a failed cycle (default: 1)
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::default().apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Overrides fields from `MLOPS_*` environment variables.
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    /// Overrides fields from whatever `MLOPS_*` variables `var` resolves.
    fn apply_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(val) = var("MLOPS_SOURCES_FILE") {
            self.sources_file = PathBuf::from(val);
        }
        if let Some(val) = var("MLOPS_CHECKOUT_DIR") {
            self.checkout_dir = PathBuf::from(val);
        }
        if let Some(val) = var("MLOPS_REFRESH_SOURCES") {
            self.refresh_sources = parse_env_bool(&val, "MLOPS_REFRESH_SOURCES")?;
        }

        if let Some(val) = var("MLOPS_DATASETS_DIR") {
            self.datasets_dir = PathBuf::from(val);
        }
        if let Some(val) = var("MLOPS_ARTIFACTS_DIR") {
            self.artifacts_dir = PathBuf::from(val);
        }
        if let Some(val) = var("MLOPS_HISTORY_PATH") {
            self.history_path = PathBuf::from(val);
        }
        if let Some(val) = var("MLOPS_HISTORY_SCOPE") {
            self.history_scope = val;
        }
        if let Some(val) = var("MLOPS_TRACKING_DIR") {
            self.tracking_dir = PathBuf::from(val);
        }

        if let Some(val) = var("MLOPS_WORKERS") {
            self.workers = parse_env_value(&val, "MLOPS_WORKERS")?;
        }
        if let Some(val) = var("MLOPS_STAGES") {
            self.stages = parse_stages(&val, "MLOPS_STAGES")?;
        }
        if let Some(val) = var("MLOPS_TASK_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "MLOPS_TASK_TIMEOUT_SECS")?;
            self.task_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(val) = var("MLOPS_IDLE_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "MLOPS_IDLE_INTERVAL_SECS")?;
            self.idle_interval = Duration::from_secs(secs);
        }
        if let Some(val) = var("MLOPS_ERROR_BACKOFF_SECS") {
            let secs: u64 = parse_env_value(&val, "MLOPS_ERROR_BACKOFF_SECS")?;
            self.error_backoff = Duration::from_secs(secs);
        }

        Ok(self)
    }

    /// Reads a YAML config file over the defaults. Unknown keys are rejected.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn from_yaml_str(text: &str) -> Result<Self, serde_yaml::Error> {
        let file: ConfigFile = if text.trim().is_empty() {
            ConfigFile::default()
        } else {
            serde_yaml::from_str(text)?
        };

        let mut config = Self::default();
        if let Some(v) = file.sources_file {
            config.sources_file = v;
        }
        if let Some(v) = file.checkout_dir {
            config.checkout_dir = v;
        }
        if let Some(v) = file.refresh_sources {
            config.refresh_sources = v;
        }
        if let Some(v) = file.datasets_dir {
            config.datasets_dir = v;
        }
        if let Some(v) = file.artifacts_dir {
            config.artifacts_dir = v;
        }
        if let Some(v) = file.history_path {
            config.history_path = v;
        }
        if let Some(v) = file.history_scope {
            config.history_scope = v;
        }
        if let Some(v) = file.tracking_dir {
            config.tracking_dir = v;
        }
        if let Some(v) = file.workers {
            config.workers = v;
        }
        if let Some(v) = file.stages {
            config.stages = v;
        }
        if let Some(secs) = file.task_timeout_secs {
            config.task_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = file.idle_interval_secs {
            config.idle_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = file.error_backoff_secs {
            config.error_backoff = Duration::from_secs(secs);
        }
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "workers must be greater than 0".to_string(),
            ));
        }

        if self.stages.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "at least one stage must be enabled".to_string(),
            ));
        }

        let mut seen = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            if seen.contains(stage) {
                return Err(ConfigError::ValidationFailed(format!(
                    "stage '{}' listed more than once",
                    stage
                )));
            }
            seen.push(*stage);
        }

        if self.history_scope.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "history_scope cannot be empty".to_string(),
            ));
        }

        if self.task_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::ValidationFailed(
                "task_timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_sources_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.sources_file = path.into();
        self
    }

    pub fn with_checkout_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkout_dir = path.into();
        self
    }

    pub fn with_refresh_sources(mut self, refresh: bool) -> Self {
        self.refresh_sources = refresh;
        self
    }

    pub fn with_datasets_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.datasets_dir = path.into();
        self
    }

    pub fn with_artifacts_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.artifacts_dir = path.into();
        self
    }

    pub fn with_history_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.history_path = path.into();
        self
    }

    pub fn with_history_scope(mut self, scope: impl Into<String>) -> Self {
        self.history_scope = scope.into();
        self
    }

    pub fn with_tracking_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.tracking_dir = path.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_stages(mut self, stages: Vec<Stage>) -> Self {
        self.stages = stages;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }
}

/// Parses an environment variable value into the specified type.
fn parse_env_value<T: std::str::FromStr>(val: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    val.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Parses a boolean environment variable value.
fn parse_env_bool(val: &str, key: &str) -> Result<bool, ConfigError> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", val),
        }),
    }
}

/// Parses a comma-separated stage list such as `train,test`.
fn parse_stages(val: &str, key: &str) -> Result<Vec<Stage>, ConfigError> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse_env_value(s, key))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_is_valid() {
        let config = ForgeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.workers, 1);
        assert_eq!(config.stages, vec![Stage::Train, Stage::Test]);
        assert_eq!(config.idle_interval, Duration::from_secs(5));
        assert_eq!(config.error_backoff, Duration::from_secs(1));
        assert!(config.task_timeout.is_none());
    }

    #[test]
    fn test_builder_methods() {
        let config = ForgeConfig::new()
            .with_workers(4)
            .with_datasets_dir("/data")
            .with_stages(vec![Stage::Train])
            .with_task_timeout(Some(Duration::from_secs(600)));

        assert_eq!(config.workers, 4);
        assert_eq!(config.datasets_dir, PathBuf::from("/data"));
        assert_eq!(config.stages, vec![Stage::Train]);
        assert_eq!(config.task_timeout, Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_validation_zero_workers() {
        let config = ForgeConfig::new().with_workers(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationFailed(_))
        ));
    }

    #[test]
    fn test_validation_stages() {
        assert!(ForgeConfig::new().with_stages(Vec::new()).validate().is_err());
        assert!(ForgeConfig::new()
            .with_stages(vec![Stage::Train, Stage::Train])
            .validate()
            .is_err());
    }

    #[test]
    fn test_yaml_overrides_defaults() {
        let yaml = "workers: 3\nstages: [train]\nartifacts_dir: /srv/artifacts\ntask_timeout_secs: 90\n";
        let config = ForgeConfig::from_yaml_str(yaml).unwrap();

        assert_eq!(config.workers, 3);
        assert_eq!(config.stages, vec![Stage::Train]);
        assert_eq!(config.artifacts_dir, PathBuf::from("/srv/artifacts"));
        assert_eq!(config.task_timeout, Some(Duration::from_secs(90)));
        assert_eq!(config.sources_file, PathBuf::from("pipelines.txt"));
    }

    #[test]
    fn test_yaml_rejects_unknown_keys() {
        assert!(ForgeConfig::from_yaml_str("wrkers: 3\n").is_err());
    }

    #[test]
    fn test_yaml_file_errors_carry_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forge.yaml");
        std::fs::write(&path, "workers: [nope]\n").unwrap();

        let err = ForgeConfig::from_yaml_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("forge.yaml"));
    }

    #[test]
    fn test_env_layer_is_validated_after_later_overrides() {
        let vars: HashMap<&str, &str> = [("MLOPS_WORKERS", "0"), ("MLOPS_STAGES", "test")]
            .into_iter()
            .collect();
        let config = ForgeConfig::new()
            .apply_vars(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.workers, 0);
        assert_eq!(config.stages, vec![Stage::Test]);
        assert!(config.validate().is_err());

        let config = config.with_workers(4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_values_must_parse() {
        let err = ForgeConfig::new()
            .apply_vars(|key| (key == "MLOPS_TASK_TIMEOUT_SECS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("MLOPS_TASK_TIMEOUT_SECS"));

        let config = ForgeConfig::new()
            .apply_vars(|key| (key == "MLOPS_TASK_TIMEOUT_SECS").then(|| "0".to_string()))
            .unwrap();
        assert_eq!(config.task_timeout, None);
    }

    #[test]
    fn test_parse_env_helpers() {
        assert_eq!(parse_env_value::<usize>(" 8 ", "K").unwrap(), 8);
        assert!(parse_env_value::<usize>("eight", "K").is_err());
        assert!(parse_env_bool("Yes", "K").unwrap());
        assert!(!parse_env_bool("off", "K").unwrap());
        assert!(parse_env_bool("maybe", "K").is_err());
        assert_eq!(
            parse_stages("train, test", "K").unwrap(),
            vec![Stage::Train, Stage::Test]
        );
        assert!(parse_stages("fit", "K").is_err());
    }
}
