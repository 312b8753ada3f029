//! Pipeline configuration.
//!
//! Process-wide settings for an orchestrator instance: where the workspace
//! lives, how batches fan out, how existing datasets are handled, and how
//! the external training process is launched. Constructed once, read-only
//! during execution.

use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::dataset::WorkspaceLayout;

/// Default training command. The generated config path is appended as
/// `--config_file <path>`.
pub const DEFAULT_TRAINING_COMMAND: &str = "accelerate launch train_network.py";

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Maps a path before it is embedded in a generated document.
///
/// Used when the training process sees the workspace under a different
/// root than the orchestrator (containers, mounted shares).
pub trait PathResolver: Debug + Send + Sync {
    fn resolve(&self, path: &Path) -> PathBuf;
}

/// Rewrites paths under one prefix to another prefix.
#[derive(Debug, Clone)]
pub struct PrefixPathResolver {
    from: PathBuf,
    to: PathBuf,
}

impl PrefixPathResolver {
    pub fn new(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

impl PathResolver for PrefixPathResolver {
    fn resolve(&self, path: &Path) -> PathBuf {
        match path.strip_prefix(&self.from) {
            Ok(rest) => self.to.join(rest),
            Err(_) => path.to_path_buf(),
        }
    }
}

/// Configuration for the pipeline executors.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Workspace root; every generated path is made absolute against it.
    pub base_path: PathBuf,
    /// Whether batches fan out over a worker pool.
    pub parallel: bool,
    /// Size of the batch worker pool.
    pub max_workers: usize,
    /// Delete prior artifacts of an existing dataset without asking.
    pub auto_clean: bool,
    /// Per-dataset console reporting.
    pub verbose: bool,
    /// Optional rewrite applied to every embedded path.
    pub path_resolver: Option<Arc<dyn PathResolver>>,
    /// Command line used to launch training.
    pub training_command: String,
    /// Job tracker database URL; the in-memory tracker is used when unset.
    pub database_url: Option<String>,
    /// Directory holding preset files; defaults to `<base_path>/presets`.
    pub presets_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("./workspace"),
            parallel: false,
            max_workers: 4,
            auto_clean: false,
            verbose: false,
            path_resolver: None,
            training_command: DEFAULT_TRAINING_COMMAND.to_string(),
            database_url: None,
            presets_dir: None,
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `LORA_FORGE_BASE_PATH`: Workspace root (default: ./workspace)
    /// - `LORA_FORGE_PARALLEL`: Run batches in parallel (default: false)
    /// - `LORA_FORGE_MAX_WORKERS`: Batch worker pool size (default: 4)
    /// - `LORA_FORGE_AUTO_CLEAN`: Clean existing datasets without asking (default: false)
    /// - `LORA_FORGE_VERBOSE`: Per-dataset reporting (default: false)
    /// - `LORA_FORGE_TRAINING_COMMAND`: Training launcher command line
    /// - `LORA_FORGE_DATABASE_URL`: SQLite URL for the job tracker
    /// - `LORA_FORGE_PRESETS_DIR`: Preset directory
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("LORA_FORGE_BASE_PATH") {
            config.base_path = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("LORA_FORGE_PARALLEL") {
            config.parallel = parse_env_bool(&val, "LORA_FORGE_PARALLEL")?;
        }

        if let Ok(val) = std::env::var("LORA_FORGE_MAX_WORKERS") {
            config.max_workers = parse_env_value(&val, "LORA_FORGE_MAX_WORKERS")?;
        }

        if let Ok(val) = std::env::var("LORA_FORGE_AUTO_CLEAN") {
            config.auto_clean = parse_env_bool(&val, "LORA_FORGE_AUTO_CLEAN")?;
        }

        if let Ok(val) = std::env::var("LORA_FORGE_VERBOSE") {
            config.verbose = parse_env_bool(&val, "LORA_FORGE_VERBOSE")?;
        }

        if let Ok(val) = std::env::var("LORA_FORGE_TRAINING_COMMAND") {
            config.training_command = val;
        }

        if let Ok(val) = std::env::var("LORA_FORGE_DATABASE_URL") {
            if !val.trim().is_empty() {
                config.database_url = Some(val);
            }
        }

        if let Ok(val) = std::env::var("LORA_FORGE_PRESETS_DIR") {
            config.presets_dir = Some(PathBuf::from(val));
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_workers must be greater than 0".to_string(),
            ));
        }

        if self.base_path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "base_path cannot be empty".to_string(),
            ));
        }

        if self.training_command.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "training_command cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Returns the workspace directory layout rooted at `base_path`.
    pub fn layout(&self) -> WorkspaceLayout {
        WorkspaceLayout::new(&self.base_path)
    }

    /// Returns the preset directory.
    pub fn presets_dir(&self) -> PathBuf {
        self.presets_dir
            .clone()
            .unwrap_or_else(|| self.base_path.join("presets"))
    }

    /// Builder method to set the workspace root.
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = path.into();
        self
    }

    /// Builder method to enable or disable parallel batches.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Builder method to set the worker pool size.
    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max;
        self
    }

    /// Builder method to enable or disable auto-clean.
    pub fn with_auto_clean(mut self, auto_clean: bool) -> Self {
        self.auto_clean = auto_clean;
        self
    }

    /// Builder method to enable or disable verbose reporting.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Builder method to set a path resolver.
    pub fn with_path_resolver(mut self, resolver: Arc<dyn PathResolver>) -> Self {
        self.path_resolver = Some(resolver);
        self
    }

    /// Builder method to set the training command.
    pub fn with_training_command(mut self, command: impl Into<String>) -> Self {
        self.training_command = command.into();
        self
    }

    /// Builder method to set the tracker database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    /// Builder method to set the preset directory.
    pub fn with_presets_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.presets_dir = Some(dir.into());
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.base_path, PathBuf::from("./workspace"));
        assert!(!config.parallel);
        assert_eq!(config.max_workers, 4);
        assert!(!config.auto_clean);
        assert!(config.path_resolver.is_none());
        assert_eq!(config.training_command, DEFAULT_TRAINING_COMMAND);
        assert_eq!(config.presets_dir(), PathBuf::from("./workspace/presets"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = PipelineConfig::new()
            .with_base_path("/data/ws")
            .with_parallel(true)
            .with_max_workers(8)
            .with_auto_clean(true)
            .with_verbose(true)
            .with_training_command("python train.py")
            .with_database_url("sqlite::memory:")
            .with_presets_dir("/data/presets");

        assert_eq!(config.base_path, PathBuf::from("/data/ws"));
        assert!(config.parallel);
        assert_eq!(config.max_workers, 8);
        assert!(config.auto_clean);
        assert!(config.verbose);
        assert_eq!(config.training_command, "python train.py");
        assert_eq!(config.database_url.as_deref(), Some("sqlite::memory:"));
        assert_eq!(config.presets_dir(), PathBuf::from("/data/presets"));
    }

    #[test]
    fn test_validation_errors() {
        let config = PipelineConfig::new().with_max_workers(0);
        assert!(config.validate().is_err());

        let config = PipelineConfig::new().with_base_path("");
        assert!(config.validate().is_err());

        let config = PipelineConfig::new().with_training_command("   ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_env_bool() {
        assert!(parse_env_bool("YES", "K").unwrap());
        assert!(!parse_env_bool("off", "K").unwrap());
        assert!(parse_env_bool("maybe", "K").is_err());
    }

    #[test]
    fn test_prefix_resolver() {
        let resolver = PrefixPathResolver::new("/host/ws", "/mnt/ws");
        assert_eq!(
            resolver.resolve(Path::new("/host/ws/output/faces")),
            PathBuf::from("/mnt/ws/output/faces")
        );
        assert_eq!(
            resolver.resolve(Path::new("/elsewhere/x")),
            PathBuf::from("/elsewhere/x")
        );
    }
}
