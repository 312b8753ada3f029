//! Single-dataset executor.
//!
//! Processes exactly one dataset end to end: validate, handle an existing
//! dataset, prepare, generate one or every preset configuration, and
//! record the job lifecycle. Batch workers reuse [`SingleExecutor::process`].

use std::path::{Path, PathBuf};
use std::time::Instant;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::dataset::PreparationRequest;
use crate::error::PipelineError;
use crate::generator::generate_job_id;
use crate::tracker::{mark_failed, track_stage, JobState};

use super::services::{ExistingPolicy, PipelineServices};
use super::types::{DatasetResult, PipelineContext, PipelineMode, PipelineResult};

/// Default repeat count per training image.
pub const DEFAULT_REPEATS: u32 = 30;

/// Default class token.
pub const DEFAULT_CLASS_NAME: &str = "person";

/// Preset label recorded on jobs that generate every preset.
pub const ALL_PRESETS: &str = "all";

fn default_repeats() -> u32 {
    DEFAULT_REPEATS
}

fn default_class_name() -> String {
    DEFAULT_CLASS_NAME.to_string()
}

fn default_true() -> bool {
    true
}

/// Parameters of a single-dataset run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleRequest {
    #[serde(alias = "source")]
    pub source_path: PathBuf,
    #[serde(default = "default_repeats")]
    pub repeats: u32,
    #[serde(default = "default_class_name")]
    pub class_name: String,
    /// Derived from the last segment of `source_path` when absent.
    #[serde(default)]
    pub dataset_name: Option<String>,
    #[serde(default = "default_true")]
    pub generate_configs: bool,
    /// One preset, or every known preset when absent.
    #[serde(default)]
    pub preset: Option<String>,
    /// Overrides `PipelineConfig::auto_clean` for this call.
    #[serde(default)]
    pub auto_clean: Option<bool>,
    #[serde(default)]
    pub job_id: Option<String>,
}

impl SingleRequest {
    pub fn new(source_path: impl Into<PathBuf>) -> Self {
        Self {
            source_path: source_path.into(),
            repeats: DEFAULT_REPEATS,
            class_name: DEFAULT_CLASS_NAME.to_string(),
            dataset_name: None,
            generate_configs: true,
            preset: None,
            auto_clean: None,
            job_id: None,
        }
    }

    pub fn with_repeats(mut self, repeats: u32) -> Self {
        self.repeats = repeats;
        self
    }

    pub fn with_class_name(mut self, class_name: impl Into<String>) -> Self {
        self.class_name = class_name.into();
        self
    }

    pub fn with_dataset_name(mut self, name: impl Into<String>) -> Self {
        self.dataset_name = Some(name.into());
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

    pub fn with_auto_clean(mut self, auto_clean: bool) -> Self {
        self.auto_clean = Some(auto_clean);
        self
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    /// Returns the explicit dataset name or derives it from the source.
    pub fn resolved_name(&self) -> Result<String, PipelineError> {
        match &self.dataset_name {
            Some(name) => validate_dataset_name(name).map(|_| name.clone()),
            None => extract_dataset_name(&self.source_path),
        }
    }
}

/// A validated unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetTask {
    pub source: PathBuf,
    pub name: String,
    pub repeats: u32,
    pub class_name: String,
    pub preset: Option<String>,
    pub generate_configs: bool,
    pub job_id: Option<String>,
}

/// Derives a dataset name from the final segment of a path.
///
/// Trailing separators are ignored. An empty segment or a navigation token
/// (`.` or `..`) is a validation error.
pub fn extract_dataset_name(path: &Path) -> Result<String, PipelineError> {
    let text = path.to_string_lossy();
    let trimmed = text.trim_end_matches(['/', '\\']);
    let segment = trimmed.rsplit(['/', '\\']).next().unwrap_or_default();

    validate_dataset_name(segment)?;
    Ok(segment.to_string())
}

pub(crate) fn validate_dataset_name(name: &str) -> Result<(), PipelineError> {
    if name.trim().is_empty() || name == "." || name == ".." {
        return Err(PipelineError::Validation(format!(
            "cannot use '{}' as a dataset name",
            name
        )));
    }
    if name.contains(['/', '\\']) {
        return Err(PipelineError::Validation(format!(
            "dataset name '{}' must not contain path separators",
            name
        )));
    }
    Ok(())
}

/// Checks the inputs every dataset task shares.
pub(crate) fn validate_source(source: &Path, repeats: u32) -> Result<(), PipelineError> {
    if !source.exists() {
        return Err(PipelineError::Validation(format!(
            "Source path does not exist: {}",
            source.display()
        )));
    }
    if repeats == 0 {
        return Err(PipelineError::Validation(
            "repeats must be a positive integer".to_string(),
        ));
    }
    Ok(())
}

/// Executes one dataset end to end.
#[derive(Debug, Clone)]
pub struct SingleExecutor {
    services: PipelineServices,
}

impl SingleExecutor {
    pub fn new(services: PipelineServices) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &PipelineServices {
        &self.services
    }

    /// Validates a request into a task without touching the filesystem.
    pub fn validate(&self, request: &SingleRequest) -> Result<DatasetTask, PipelineError> {
        validate_source(&request.source_path, request.repeats)?;
        if request.class_name.trim().is_empty() {
            return Err(PipelineError::Validation(
                "class_name cannot be empty".to_string(),
            ));
        }
        let name = request.resolved_name()?;
        if let Some(preset) = &request.preset {
            self.services.require_preset(preset)?;
        }
        if let Some(job_id) = &request.job_id {
            if job_id.trim().is_empty() {
                return Err(PipelineError::Validation("job_id cannot be empty".to_string()));
            }
        }

        Ok(DatasetTask {
            source: request.source_path.clone(),
            name,
            repeats: request.repeats,
            class_name: request.class_name.clone(),
            preset: request.preset.clone(),
            generate_configs: request.generate_configs,
            job_id: request.job_id.clone(),
        })
    }

    /// Runs a single-dataset request.
    ///
    /// Never fails: validation problems produce a `failed` result with no
    /// job record, later problems a failed [`DatasetResult`].
    pub async fn execute(&self, request: SingleRequest) -> PipelineResult {
        let start = Instant::now();
        let ctx = PipelineContext::new();

        let task = match self.validate(&request) {
            Ok(task) => task,
            Err(e) => {
                warn!(source = %request.source_path.display(), error = %e, "Rejected single request");
                return PipelineResult::validation_failed(
                    PipelineMode::Single,
                    e.to_string(),
                    start.elapsed(),
                    &ctx,
                );
            }
        };

        let auto_clean = request.auto_clean.unwrap_or(self.services.config.auto_clean);
        let policy = ExistingPolicy::from_auto_clean(auto_clean);
        let result = self
            .process(&ctx, &task, policy, PipelineMode::Single)
            .await;

        let mut results = IndexMap::new();
        results.insert(result.name.clone(), result);
        let outcome =
            PipelineResult::from_results(PipelineMode::Single, results, start.elapsed(), &ctx);
        info!(summary = %outcome.summary(), "Single pipeline finished");
        outcome
    }

    /// Processes one validated dataset and records its job.
    pub async fn process(
        &self,
        ctx: &PipelineContext,
        task: &DatasetTask,
        policy: ExistingPolicy,
        mode: PipelineMode,
    ) -> DatasetResult {
        let layout = self.services.layout();

        if let Err(e) = self.services.resolve_existing(&task.name, policy).await {
            warn!(dataset = %task.name, error = %e, "Skipping dataset");
            ctx.add_error(Some(&task.name), e.to_string());
            return DatasetResult::failed(&task.name, e.to_string());
        }

        let job_id = task.job_id.clone().unwrap_or_else(generate_job_id);
        let preset_label = task.preset.as_deref().unwrap_or(ALL_PRESETS);
        let tracker = self.services.tracker.as_ref();

        if let Err(e) = tracker
            .create_execution(&job_id, mode, &task.name, preset_label)
            .await
        {
            warn!(dataset = %task.name, job_id = %job_id, error = %e, "Failed to create job");
            ctx.add_error(Some(&task.name), e.to_string());
            return DatasetResult::failed(&task.name, e.to_string()).with_job_id(&job_id);
        }
        info!(dataset = %task.name, job_id = %job_id, mode = %mode, "Created job");

        let request = PreparationRequest {
            source: task.source.clone(),
            dataset_name: task.name.clone(),
            repeats: task.repeats,
            class_name: task.class_name.clone(),
            input_dir: layout.input_dir(&task.name),
            output_dir: layout.output_dir(&task.name),
        };

        let mut result = DatasetResult::succeeded(&task.name).with_job_id(&job_id);
        result.input_dir = Some(request.input_dir.clone());
        result.output_dir = Some(request.output_dir.clone());

        let prepared = track_stage(
            tracker,
            &job_id,
            JobState::PreparingDataset,
            self.prepare(&request),
        )
        .await;
        let prepared = match prepared {
            Ok(prepared) => prepared,
            Err(e) => return self.fail(ctx, result, e),
        };

        result.sample_prompts = prepared.sample_prompts.clone();
        result.warnings.extend(prepared.warnings.iter().cloned());
        result = result
            .with_metadata("image_count", json!(prepared.image_count))
            .with_metadata("caption_count", json!(prepared.caption_count))
            .with_metadata("repeats", json!(task.repeats))
            .with_metadata("class_name", json!(task.class_name));

        if task.generate_configs {
            let generated = track_stage(
                tracker,
                &job_id,
                JobState::ConfiguringPreset,
                self.generate_configs(task, &job_id, mode),
            )
            .await;
            match generated {
                Ok((configs, warnings)) => {
                    for warning in &warnings {
                        ctx.add_warning(format!("{}: {}", task.name, warning));
                    }
                    result.warnings.extend(warnings);
                    result.configs = configs;
                }
                Err(e) => return self.fail(ctx, result, e),
            }
        }

        if let Err(e) = tracker
            .update_status(&job_id, JobState::ReadyForTraining, None)
            .await
        {
            let error = PipelineError::from(e);
            fail_job(&self.services, &job_id, &error.to_string()).await;
            return self.fail(ctx, result, error);
        }

        if !result.configs.is_empty() {
            let output = request.output_dir.display().to_string();
            if let Err(e) = tracker.set_output_path(&job_id, &output).await {
                warn!(job_id = %job_id, error = %e, "Failed to record output path");
            }
        }

        ctx.mark_processed(&task.name);
        ctx.add_configs(&task.name, &result.configs);
        info!(
            dataset = %task.name,
            job_id = %job_id,
            configs = result.configs.len(),
            "Dataset ready for training"
        );
        result
    }

    async fn prepare(
        &self,
        request: &PreparationRequest,
    ) -> Result<crate::dataset::PreparationResult, PipelineError> {
        let prepared = self.services.preparer.prepare(request).await;
        if prepared.success {
            Ok(prepared)
        } else {
            Err(PipelineError::Execution(prepared.error.unwrap_or_else(|| {
                format!("preparation of '{}' failed", request.dataset_name)
            })))
        }
    }

    /// Generates one configuration per requested preset.
    ///
    /// A failing preset becomes a warning; only a run where every preset
    /// fails is an error.
    async fn generate_configs(
        &self,
        task: &DatasetTask,
        job_id: &str,
        mode: PipelineMode,
    ) -> Result<(Vec<PathBuf>, Vec<String>), PipelineError> {
        let presets: Vec<String> = match &task.preset {
            Some(preset) => vec![preset.clone()],
            None => self.services.presets.get_presets().into_keys().collect(),
        };
        if presets.is_empty() {
            return Err(PipelineError::Execution(
                "no configurations generated: no presets available".to_string(),
            ));
        }

        let generator = self.services.generator();
        let mut configs = Vec::new();
        let mut warnings = Vec::new();

        for preset in &presets {
            match generator
                .generate_dataset_config(mode, &task.name, preset, job_id)
                .await
            {
                Ok(generated) => {
                    debug!(dataset = %task.name, preset = %preset, "Generated preset config");
                    configs.push(generated.path);
                }
                Err(e) => {
                    warn!(dataset = %task.name, preset = %preset, error = %e, "Preset config failed");
                    warnings.push(format!("preset '{}' failed: {}", preset, e));
                }
            }
        }

        if configs.is_empty() {
            return Err(PipelineError::Execution(format!(
                "no configurations generated: {}",
                warnings.join("; ")
            )));
        }
        Ok((configs, warnings))
    }

    fn fail(
        &self,
        ctx: &PipelineContext,
        mut result: DatasetResult,
        error: PipelineError,
    ) -> DatasetResult {
        let message = error.to_string();
        warn!(dataset = %result.name, error = %message, "Dataset failed");
        ctx.add_error(Some(&result.name), message.clone());
        result.success = false;
        result.error = Some(message);
        result
    }
}

/// Marks a job failed when a step outside [`track_stage`] goes wrong.
pub(crate) async fn fail_job(services: &PipelineServices, job_id: &str, message: &str) {
    mark_failed(services.tracker.as_ref(), job_id, message).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_dataset_name() {
        assert_eq!(extract_dataset_name(Path::new("/a/b/c/")).unwrap(), "c");
        assert_eq!(extract_dataset_name(Path::new("/a/b/c")).unwrap(), "c");
        assert_eq!(extract_dataset_name(Path::new("faces")).unwrap(), "faces");
        assert_eq!(
            extract_dataset_name(Path::new("C:\\data\\faces\\")).unwrap(),
            "faces"
        );
    }

    #[test]
    fn test_extract_dataset_name_rejects_navigation() {
        for bad in ["/", "", ".", "..", "/a/..", "./"] {
            let err = extract_dataset_name(Path::new(bad)).unwrap_err();
            assert!(err.is_validation(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_request_defaults_from_json() {
        let request: SingleRequest =
            serde_json::from_value(json!({"source": "/data/faces"})).expect("parse");
        assert_eq!(request.repeats, DEFAULT_REPEATS);
        assert_eq!(request.class_name, DEFAULT_CLASS_NAME);
        assert!(request.generate_configs);
        assert_eq!(request.resolved_name().unwrap(), "faces");
    }

    #[test]
    fn test_validate_source() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        assert!(validate_source(dir.path(), 10).is_ok());
        assert!(validate_source(dir.path(), 0).unwrap_err().is_validation());
        assert!(validate_source(&dir.path().join("missing"), 10)
            .unwrap_err()
            .to_string()
            .contains("does not exist"));
    }
}
