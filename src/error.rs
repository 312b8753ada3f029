//! Error types for lora-forge operations.
//!
//! Defines error types for the major subsystems:
//! - Preset loading
//! - Configuration generation
//! - Job tracking
//! - Dataset preparation
//! - Training process control
//! - Pipeline execution (the boundary every executor folds errors into)

use thiserror::Error;

/// Errors that can occur while loading presets.
#[derive(Debug, Error)]
pub enum PresetError {
    #[error("Failed to parse preset file '{path}': {message}")]
    ParseError { path: String, message: String },

    #[error("Duplicate preset '{0}' found during loading")]
    DuplicatePreset(String),

    #[error("Invalid preset name '{0}': must be non-empty and contain no path separators")]
    InvalidName(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur during configuration generation.
#[derive(Debug, Error)]
pub enum ConfigGenError {
    #[error("Preset '{0}' not found")]
    PresetNotFound(String),

    #[error("Invalid override key '{0}'")]
    InvalidKey(String),

    #[error("Configuration document is missing field '{0}'")]
    MissingField(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("TOML parsing error: {0}")]
    TomlDe(#[from] toml::de::Error),
}

/// Errors that can occur while recording job lifecycles.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Job '{0}' not found")]
    JobNotFound(String),

    #[error("Job '{0}' already exists")]
    DuplicateJob(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid job state '{0}'")]
    InvalidState(String),

    #[error("Total steps {0} does not fit in a database column")]
    StepsOutOfRange(u64),
}

/// Errors that can occur during dataset preparation and cleanup.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Source path does not exist: {0}")]
    SourceMissing(String),

    #[error("No images found in {0}")]
    NoImages(String),

    #[error("Failed to walk '{path}': {message}")]
    Walk { path: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while driving the external training process.
#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("Configuration file not found: {0}")]
    ConfigMissing(String),

    #[error("Training command is empty")]
    EmptyCommand,

    #[error("Failed to spawn training process: {0}")]
    SpawnFailed(String),

    #[error("Tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the pipeline executors.
///
/// `Validation` and `PresetNotFound` errors are detected before any side
/// effect and never carry a job record; every other variant is recorded
/// against a job.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Preset '{0}' not found")]
    PresetNotFound(String),

    #[error("Dataset '{0}' already exists")]
    DatasetExists(String),

    /// Carries the failing step's message unchanged.
    #[error("{0}")]
    Execution(String),

    #[error("Configuration error: {0}")]
    ConfigGen(#[from] ConfigGenError),

    #[error("Tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Returns whether this error was raised by caller input validation.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            PipelineError::Validation(_) | PipelineError::PresetNotFound(_)
        )
    }
}
