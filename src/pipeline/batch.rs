//! Batch executor.
//!
//! Fans a list of datasets out to [`SingleExecutor::process`], either in
//! input order or over a bounded worker pool, and aggregates partial
//! success. Every dataset is an independent job owned by the worker that
//! processes it.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::{self, JoinSet};
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::generator::generate_job_id;
use crate::tracker::mark_failed;

use super::services::{ExistingPolicy, PipelineServices};
use super::single::{
    extract_dataset_name, validate_dataset_name, validate_source, DatasetTask, SingleExecutor,
    DEFAULT_CLASS_NAME, DEFAULT_REPEATS,
};
use super::types::{DatasetResult, PipelineContext, PipelineMode, PipelineResult};

/// How a batch is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStrategy {
    Sequential,
    Parallel,
}

impl std::fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStrategy::Sequential => write!(f, "sequential"),
            ExecutionStrategy::Parallel => write!(f, "parallel"),
        }
    }
}

impl std::str::FromStr for ExecutionStrategy {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sequential" => Ok(ExecutionStrategy::Sequential),
            "parallel" => Ok(ExecutionStrategy::Parallel),
            other => Err(PipelineError::Validation(format!(
                "unknown execution strategy '{}'",
                other
            ))),
        }
    }
}

/// Per-dataset overrides in a batch list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSpec {
    #[serde(alias = "source_path", alias = "path")]
    pub source: PathBuf,
    #[serde(default, alias = "dataset_name")]
    pub name: Option<String>,
    #[serde(default)]
    pub repeats: Option<u32>,
    #[serde(default)]
    pub class_name: Option<String>,
    #[serde(default)]
    pub preset: Option<String>,
}

impl DatasetSpec {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            name: None,
            repeats: None,
            class_name: None,
            preset: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_repeats(mut self, repeats: u32) -> Self {
        self.repeats = Some(repeats);
        self
    }

    pub fn with_class_name(mut self, class_name: impl Into<String>) -> Self {
        self.class_name = Some(class_name.into());
        self
    }

    pub fn with_preset(mut self, preset: impl Into<String>) -> Self {
        self.preset = Some(preset.into());
        self
    }
}

/// One entry of a batch: a bare path or a structured spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DatasetInput {
    Path(PathBuf),
    Spec(DatasetSpec),
}

impl From<PathBuf> for DatasetInput {
    fn from(path: PathBuf) -> Self {
        DatasetInput::Path(path)
    }
}

impl From<&str> for DatasetInput {
    fn from(path: &str) -> Self {
        DatasetInput::Path(PathBuf::from(path))
    }
}

impl From<DatasetSpec> for DatasetInput {
    fn from(spec: DatasetSpec) -> Self {
        DatasetInput::Spec(spec)
    }
}

impl DatasetInput {
    /// Fills defaults; per-dataset presets win over the batch preset.
    pub fn normalize(
        &self,
        batch_preset: Option<&str>,
        generate_configs: bool,
    ) -> Result<DatasetTask, PipelineError> {
        let (source, name, repeats, class_name, preset) = match self {
            DatasetInput::Path(path) => (path.clone(), None, None, None, None),
            DatasetInput::Spec(spec) => (
                spec.source.clone(),
                spec.name.clone(),
                spec.repeats,
                spec.class_name.clone(),
                spec.preset.clone(),
            ),
        };

        let name = match name {
            Some(name) => {
                validate_dataset_name(&name)?;
                name
            }
            None => extract_dataset_name(&source)?,
        };

        Ok(DatasetTask {
            source,
            name,
            repeats: repeats.unwrap_or(DEFAULT_REPEATS),
            class_name: class_name.unwrap_or_else(|| DEFAULT_CLASS_NAME.to_string()),
            preset: preset.or_else(|| batch_preset.map(str::to_string)),
            generate_configs,
            job_id: None,
        })
    }
}

fn default_true() -> bool {
    true
}

/// Parameters of a batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub datasets: Vec<DatasetInput>,
    /// Defaults to `PipelineConfig::parallel`.
    #[serde(default)]
    pub strategy: Option<ExecutionStrategy>,
    #[serde(default = "default_true")]
    pub continue_on_error: bool,
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default = "default_true")]
    pub generate_configs: bool,
}

impl BatchRequest {
    pub fn new<I, D>(datasets: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<DatasetInput>,
    {
        Self {
            datasets: datasets.into_iter().map(Into::into).collect(),
            strategy: None,
            continue_on_error: true,
            preset: None,
            generate_configs: true,
        }
    }

    pub fn with_strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    pub fn with_preset(mut self, preset: impl Into<String>) -> Self {
        self.preset = Some(preset.into());
        self
    }

    pub fn with_generate_configs(mut self, generate: bool) -> Self {
        self.generate_configs = generate;
        self
    }
}

fn problem_text(error: PipelineError) -> String {
    match error {
        PipelineError::Validation(message) => message,
        other => other.to_string(),
    }
}

/// A batch entry after validation and the pre-flight conflict check.
#[derive(Debug, Clone)]
struct PlannedTask {
    task: DatasetTask,
    policy: ExistingPolicy,
    declined: bool,
}

/// Executes lists of datasets.
#[derive(Debug, Clone)]
pub struct BatchExecutor {
    single: SingleExecutor,
}

impl BatchExecutor {
    pub fn new(services: PipelineServices) -> Self {
        Self {
            single: SingleExecutor::new(services),
        }
    }

    fn services(&self) -> &PipelineServices {
        self.single.services()
    }

    /// Normalizes and validates every entry. Any problem rejects the whole
    /// batch.
    pub fn validate(&self, request: &BatchRequest) -> Result<Vec<DatasetTask>, PipelineError> {
        if request.datasets.is_empty() {
            return Err(PipelineError::Validation("no datasets supplied".to_string()));
        }

        let mut problems = Vec::new();
        let mut tasks = Vec::with_capacity(request.datasets.len());
        let mut names = HashSet::new();

        for input in &request.datasets {
            let task = match input.normalize(request.preset.as_deref(), request.generate_configs) {
                Ok(task) => task,
                Err(e) => {
                    problems.push(problem_text(e));
                    continue;
                }
            };
            if let Err(e) = validate_source(&task.source, task.repeats) {
                problems.push(problem_text(e));
            }
            if let Some(preset) = &task.preset {
                if let Err(e) = self.services().require_preset(preset) {
                    problems.push(problem_text(e));
                }
            }
            if !names.insert(task.name.clone()) {
                problems.push(format!("duplicate dataset name '{}'", task.name));
            }
            tasks.push(task);
        }

        if problems.is_empty() {
            Ok(tasks)
        } else {
            Err(PipelineError::Validation(problems.join("; ")))
        }
    }

    /// Detects existing datasets and asks once about all of them.
    fn preflight(&self, tasks: Vec<DatasetTask>) -> Vec<PlannedTask> {
        let layout = self.services().layout();
        let conflicts: Vec<String> = tasks
            .iter()
            .filter(|t| layout.dataset_has_artifacts(&t.name))
            .map(|t| t.name.clone())
            .collect();

        let accepted = if conflicts.is_empty() || self.services().config.auto_clean {
            true
        } else {
            self.services().confirm_overwrite(&conflicts)
        };
        if !conflicts.is_empty() {
            info!(
                conflicts = %conflicts.join(", "),
                accepted = accepted,
                "Resolved existing datasets"
            );
        }

        tasks
            .into_iter()
            .map(|task| {
                let conflicting = conflicts.contains(&task.name);
                PlannedTask {
                    policy: if conflicting && accepted {
                        ExistingPolicy::Clean
                    } else {
                        ExistingPolicy::Decline
                    },
                    declined: conflicting && !accepted,
                    task,
                }
            })
            .collect()
    }

    /// Runs a batch.
    ///
    /// Validation failures reject the call with `total_datasets == 0` and no
    /// job records. Otherwise every attempted dataset appears in the result.
    pub async fn execute(&self, request: BatchRequest) -> PipelineResult {
        let start = Instant::now();
        let ctx = Arc::new(PipelineContext::new());

        let tasks = match self.validate(&request) {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "Rejected batch request");
                return PipelineResult::validation_failed(
                    PipelineMode::Batch,
                    e.to_string(),
                    start.elapsed(),
                    &ctx,
                );
            }
        };

        let strategy = request.strategy.unwrap_or(if self.services().config.parallel {
            ExecutionStrategy::Parallel
        } else {
            ExecutionStrategy::Sequential
        });
        info!(
            datasets = tasks.len(),
            strategy = %strategy,
            continue_on_error = request.continue_on_error,
            "Starting batch"
        );

        let planned = self.preflight(tasks);
        let results = match strategy {
            ExecutionStrategy::Sequential => {
                self.run_sequential(&ctx, planned, request.continue_on_error)
                    .await
            }
            ExecutionStrategy::Parallel => self.run_parallel(&ctx, planned).await,
        };

        let outcome =
            PipelineResult::from_results(PipelineMode::Batch, results, start.elapsed(), &ctx);
        info!(summary = %outcome.summary(), "Batch pipeline finished");
        outcome
    }

    fn declined_result(ctx: &PipelineContext, name: &str) -> DatasetResult {
        let message = PipelineError::DatasetExists(name.to_string()).to_string();
        ctx.add_error(Some(name), message.clone());
        DatasetResult::failed(name, message)
    }

    async fn run_sequential(
        &self,
        ctx: &PipelineContext,
        planned: Vec<PlannedTask>,
        continue_on_error: bool,
    ) -> IndexMap<String, DatasetResult> {
        let mut results = IndexMap::new();
        let total = planned.len();

        for (index, item) in planned.into_iter().enumerate() {
            let name = item.task.name.clone();
            if item.declined {
                results.insert(name.clone(), Self::declined_result(ctx, &name));
                continue;
            }

            info!(dataset = %name, position = index + 1, total = total, "Processing dataset");
            let result = self
                .single
                .process(ctx, &item.task, item.policy, PipelineMode::Batch)
                .await;
            let failed = !result.success;
            results.insert(name.clone(), result);

            if failed && !continue_on_error {
                warn!(dataset = %name, "Stopping batch after first failure");
                break;
            }
        }

        results
    }

    async fn run_parallel(
        &self,
        ctx: &Arc<PipelineContext>,
        planned: Vec<PlannedTask>,
    ) -> IndexMap<String, DatasetResult> {
        let mut results = IndexMap::new();
        let workers = Arc::new(Semaphore::new(self.services().config.max_workers));
        let mut set = JoinSet::new();
        // Spawned task -> (dataset, job id), to attribute a panic to its job.
        let mut spawned: HashMap<task::Id, (String, String)> = HashMap::new();

        for mut item in planned {
            let name = item.task.name.clone();
            if item.declined {
                results.insert(name.clone(), Self::declined_result(ctx, &name));
                continue;
            }

            let job_id = item
                .task
                .job_id
                .get_or_insert_with(generate_job_id)
                .clone();
            let executor = self.single.clone();
            let ctx = Arc::clone(ctx);
            let workers = Arc::clone(&workers);

            let handle = set.spawn(async move {
                let _permit = match workers.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        let message = format!("Failed to acquire worker: {}", e);
                        ctx.add_error(Some(&item.task.name), message.clone());
                        return DatasetResult::failed(&item.task.name, message);
                    }
                };
                executor
                    .process(&ctx, &item.task, item.policy, PipelineMode::Batch)
                    .await
            });
            spawned.insert(handle.id(), (name, job_id));
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => {
                    info!(dataset = %result.name, success = result.success, "Worker finished");
                    results.insert(result.name.clone(), result);
                }
                Err(e) => {
                    let Some((name, job_id)) = spawned.get(&e.id()).cloned() else {
                        warn!(error = %e, "Unattributed batch worker failure");
                        continue;
                    };
                    let message = format!("worker task failed: {}", e);
                    warn!(dataset = %name, job_id = %job_id, error = %message, "Batch worker aborted");
                    mark_failed(self.services().tracker.as_ref(), &job_id, &message).await;
                    ctx.add_error(Some(&name), message.clone());
                    results.insert(
                        name.clone(),
                        DatasetResult::failed(&name, message).with_job_id(&job_id),
                    );
                }
            }
        }

        results
    }
}
