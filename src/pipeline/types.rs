//! Result and context types shared by every executor.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::generator::generate_job_id;

/// Execution mode selected by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineMode {
    Single,
    Batch,
    Variations,
}

impl PipelineMode {
    /// Returns the canonical mode name.
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineMode::Single => "single",
            PipelineMode::Batch => "batch",
            PipelineMode::Variations => "variations",
        }
    }
}

impl std::fmt::Display for PipelineMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PipelineMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "single" => Ok(PipelineMode::Single),
            "batch" => Ok(PipelineMode::Batch),
            "variations" | "variation" => Ok(PipelineMode::Variations),
            other => Err(PipelineError::Validation(format!(
                "unknown pipeline mode '{}': expected single, batch or variations",
                other
            ))),
        }
    }
}

/// Overall outcome of an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Success,
    PartialSuccess,
    Failed,
    Cancelled,
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineStatus::Success => write!(f, "success"),
            PipelineStatus::PartialSuccess => write!(f, "partial_success"),
            PipelineStatus::Failed => write!(f, "failed"),
            PipelineStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// An error recorded against an invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Dataset (or variation) the error belongs to, if any.
    pub dataset: Option<String>,
    /// Error message, unmodified.
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ContextState {
    processed_datasets: BTreeSet<String>,
    generated_configs: BTreeMap<String, Vec<PathBuf>>,
    errors: Vec<ErrorRecord>,
    warnings: Vec<String>,
}

/// Per-invocation bookkeeping shared by concurrent workers.
///
/// All mutation goes through one mutex held only for the duration of the
/// update; never hold it across I/O.
#[derive(Debug)]
pub struct PipelineContext {
    pub id: String,
    pub started_at: DateTime<Utc>,
    state: Mutex<ContextState>,
}

impl Default for PipelineContext {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineContext {
    /// Creates a context with a fresh identifier.
    pub fn new() -> Self {
        Self {
            id: generate_job_id(),
            started_at: Utc::now(),
            state: Mutex::new(ContextState::default()),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ContextState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Records a dataset as successfully processed.
    pub fn mark_processed(&self, dataset: &str) {
        self.with_state(|s| {
            s.processed_datasets.insert(dataset.to_string());
        });
    }

    /// Records configuration files generated for a dataset.
    pub fn add_configs(&self, dataset: &str, configs: &[PathBuf]) {
        if configs.is_empty() {
            return;
        }
        self.with_state(|s| {
            s.generated_configs
                .entry(dataset.to_string())
                .or_default()
                .extend(configs.iter().cloned());
        });
    }

    /// Appends an error record.
    pub fn add_error(&self, dataset: Option<&str>, message: impl Into<String>) {
        let record = ErrorRecord {
            dataset: dataset.map(str::to_string),
            message: message.into(),
            timestamp: Utc::now(),
        };
        self.with_state(|s| s.errors.push(record));
    }

    /// Appends a warning.
    pub fn add_warning(&self, message: impl Into<String>) {
        let message = message.into();
        self.with_state(|s| s.warnings.push(message));
    }

    /// Returns whether the dataset was recorded as processed.
    pub fn is_processed(&self, dataset: &str) -> bool {
        self.with_state(|s| s.processed_datasets.contains(dataset))
    }

    /// Copies the current state out of the lock.
    pub fn snapshot(&self) -> ContextSnapshot {
        self.with_state(|s| ContextSnapshot {
            id: self.id.clone(),
            started_at: self.started_at,
            processed_datasets: s.processed_datasets.iter().cloned().collect(),
            generated_configs: s.generated_configs.clone(),
            errors: s.errors.clone(),
            warnings: s.warnings.clone(),
        })
    }
}

/// Immutable copy of a [`PipelineContext`] attached to a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub processed_datasets: Vec<String>,
    pub generated_configs: BTreeMap<String, Vec<PathBuf>>,
    pub errors: Vec<ErrorRecord>,
    pub warnings: Vec<String>,
}

/// Outcome of processing one dataset (or one variation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetResult {
    pub name: String,
    pub success: bool,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub input_dir: Option<PathBuf>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub sample_prompts: Option<PathBuf>,
    #[serde(default)]
    pub configs: Vec<PathBuf>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl DatasetResult {
    /// Creates a successful result with no paths.
    pub fn succeeded(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            success: true,
            job_id: None,
            input_dir: None,
            output_dir: None,
            sample_prompts: None,
            configs: Vec::new(),
            error: None,
            warnings: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Creates a failed result carrying the error text.
    pub fn failed(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::succeeded(name)
        }
    }

    /// Sets the job identifier.
    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    /// Adds a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Aggregate outcome of one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub status: PipelineStatus,
    pub mode: PipelineMode,
    pub total_datasets: usize,
    pub successful_datasets: usize,
    pub failed_datasets: usize,
    pub results: IndexMap<String, DatasetResult>,
    pub execution_time: Duration,
    pub context: ContextSnapshot,
}

impl PipelineResult {
    /// Builds a result from the attempted items, deriving counts and status.
    pub fn from_results(
        mode: PipelineMode,
        results: IndexMap<String, DatasetResult>,
        execution_time: Duration,
        context: &PipelineContext,
    ) -> Self {
        let total = results.len();
        let successful = results.values().filter(|r| r.success).count();
        let failed = total - successful;

        let status = if total > 0 && successful == total {
            PipelineStatus::Success
        } else if successful > 0 {
            PipelineStatus::PartialSuccess
        } else {
            PipelineStatus::Failed
        };

        Self {
            status,
            mode,
            total_datasets: total,
            successful_datasets: successful,
            failed_datasets: failed,
            results,
            execution_time,
            context: context.snapshot(),
        }
    }

    /// Builds the result of a call rejected before any dataset was attempted.
    pub fn validation_failed(
        mode: PipelineMode,
        message: impl Into<String>,
        execution_time: Duration,
        context: &PipelineContext,
    ) -> Self {
        context.add_error(None, message);
        Self {
            status: PipelineStatus::Failed,
            mode,
            total_datasets: 0,
            successful_datasets: 0,
            failed_datasets: 0,
            results: IndexMap::new(),
            execution_time,
            context: context.snapshot(),
        }
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        if self.total_datasets == 0 {
            return 0.0;
        }
        (self.successful_datasets as f64 / self.total_datasets as f64) * 100.0
    }

    /// Returns whether every attempted dataset succeeded.
    pub fn is_success(&self) -> bool {
        self.status == PipelineStatus::Success
    }

    /// Human-readable one-line summary.
    pub fn summary(&self) -> String {
        let mut summary = format!(
            "{} pipeline {}: {}/{} succeeded, {} failed ({:.1}% success) in {:.1}s",
            self.mode,
            self.status,
            self.successful_datasets,
            self.total_datasets,
            self.failed_datasets,
            self.success_rate(),
            self.execution_time.as_secs_f64()
        );
        if self.total_datasets == 0 {
            if let Some(first) = self.context.errors.first() {
                summary.push_str(&format!(": {}", first.message));
            }
        }
        summary
    }
}
