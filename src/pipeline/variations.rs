//! Variation sweep executor.
//!
//! Expands `param -> [values]` into the cartesian product of concrete
//! configurations. Every combination becomes its own job under one
//! variation group and one experiment identifier; all of them train from
//! the single prepared copy of the dataset while writing models and logs
//! to their own directory.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::dataset::SAMPLE_PROMPTS_FILE;
use crate::error::PipelineError;
use crate::generator::{generate_job_id, validate_dataset_exists, ConfigHeader, DatasetPaths};
use crate::tracker::{track_stage, JobState, VariationMembership};

use super::services::PipelineServices;
use super::single::{fail_job, validate_dataset_name};
use super::types::{DatasetResult, PipelineContext, PipelineMode, PipelineResult};

/// Default member name template.
pub const DEFAULT_NAMING_TEMPLATE: &str = "{dataset}_{preset}_v{n}";

/// Sweep metadata file written into the experiment directory.
pub const EXPERIMENT_FILE: &str = "experiment.json";

/// Ordered sweep definition: parameter to candidate values.
pub type VariationSpec = IndexMap<String, Vec<toml::Value>>;

/// One concrete combination of a sweep.
pub type Combination = IndexMap<String, toml::Value>;

/// Largest number of members a single sweep may expand to.
pub const MAX_COMBINATIONS: usize = 10_000;

/// Number of combinations a sweep expands to, or `None` when the product
/// does not fit in a `usize`.
pub fn combination_count(spec: &VariationSpec) -> Option<usize> {
    if spec.is_empty() {
        return Some(0);
    }
    spec.values()
        .try_fold(1usize, |acc, values| acc.checked_mul(values.len()))
}

/// Combination count if the sweep is within [`MAX_COMBINATIONS`], else 0.
fn expandable_count(spec: &VariationSpec) -> usize {
    match combination_count(spec) {
        Some(count) if count <= MAX_COMBINATIONS => count,
        _ => 0,
    }
}

/// Expands a sweep in lexicographic index order: the first parameter is
/// the outermost loop, the last the innermost.
///
/// Sweeps larger than [`MAX_COMBINATIONS`] expand to nothing.
pub fn cartesian_product(spec: &VariationSpec) -> Vec<Combination> {
    if expandable_count(spec) == 0 {
        return Vec::new();
    }

    let mut combinations = vec![Combination::new()];
    for (key, values) in spec {
        let mut next = Vec::with_capacity(combinations.len() * values.len());
        for partial in &combinations {
            for value in values {
                let mut combination = partial.clone();
                combination.insert(key.clone(), value.clone());
                next.push(combination);
            }
        }
        combinations = next;
    }
    combinations
}

/// Renders a member name. `{dataset}`, `{preset}` and `{n}` (1-indexed)
/// are substituted.
pub fn render_variation_name(template: &str, dataset: &str, preset: &str, n: usize) -> String {
    template
        .replace("{dataset}", dataset)
        .replace("{preset}", preset)
        .replace("{n}", &n.to_string())
}

/// Parameters of a variation sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariationRequest {
    pub dataset_name: String,
    #[serde(alias = "preset")]
    pub base_preset: String,
    pub variations: VariationSpec,
    #[serde(default)]
    pub naming_template: Option<String>,
}

impl VariationRequest {
    pub fn new(
        dataset_name: impl Into<String>,
        base_preset: impl Into<String>,
        variations: VariationSpec,
    ) -> Self {
        Self {
            dataset_name: dataset_name.into(),
            base_preset: base_preset.into(),
            variations,
            naming_template: None,
        }
    }

    pub fn with_naming_template(mut self, template: impl Into<String>) -> Self {
        self.naming_template = Some(template.into());
        self
    }

    pub fn template(&self) -> &str {
        self.naming_template
            .as_deref()
            .unwrap_or(DEFAULT_NAMING_TEMPLATE)
    }

    /// Member names in cartesian order. Empty for sweeps larger than
    /// [`MAX_COMBINATIONS`].
    pub fn member_names(&self) -> Vec<String> {
        (1..=expandable_count(&self.variations))
            .map(|n| {
                render_variation_name(self.template(), &self.dataset_name, &self.base_preset, n)
            })
            .collect()
    }
}

/// Sweep shape persisted as `experiment.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentMetadata {
    pub experiment_id: String,
    pub variation_id: String,
    pub dataset: String,
    pub base_preset: String,
    pub varied_parameters: Vec<String>,
    pub total_variations: usize,
    /// Members whose configuration was generated.
    pub variations: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// A validated sweep ready to run.
#[derive(Debug, Clone)]
struct SweepPlan {
    dataset: String,
    preset: String,
    /// Prepared dataset every member trains from.
    dataset_dir: PathBuf,
    combinations: Vec<(String, Combination)>,
    varied_parameters: Vec<String>,
}

/// Executes variation sweeps.
#[derive(Debug, Clone)]
pub struct VariationExecutor {
    services: PipelineServices,
}

impl VariationExecutor {
    pub fn new(services: PipelineServices) -> Self {
        Self { services }
    }

    /// Returns the prepared dataset directory, looking under `input/` first
    /// and falling back to `output/`.
    ///
    /// Members train from the output copy when it is prepared, since that
    /// is where the `<repeats>_<class>` training layout lives.
    pub fn locate_dataset(&self, dataset: &str) -> Option<PathBuf> {
        let layout = self.services.layout();
        let in_input = validate_dataset_exists(dataset, &layout.input_root());
        let in_output = validate_dataset_exists(dataset, &layout.output_root());

        match (in_input, in_output) {
            (_, true) => Some(layout.output_dir(dataset)),
            (true, false) => Some(layout.input_dir(dataset)),
            (false, false) => None,
        }
    }

    fn validate(&self, request: &VariationRequest) -> Result<SweepPlan, PipelineError> {
        validate_dataset_name(&request.dataset_name)?;
        self.services.require_preset(&request.base_preset)?;

        if request.variations.is_empty() {
            return Err(PipelineError::Validation("variation set is empty".to_string()));
        }
        if let Some((key, _)) = request.variations.iter().find(|(_, v)| v.is_empty()) {
            return Err(PipelineError::Validation(format!(
                "variation parameter '{}' has no values",
                key
            )));
        }
        if let Some(key) = request.variations.keys().find(|k| k.trim().is_empty()) {
            return Err(PipelineError::Validation(format!(
                "invalid variation parameter '{}'",
                key
            )));
        }

        match combination_count(&request.variations) {
            Some(count) if count <= MAX_COMBINATIONS => {}
            _ => {
                return Err(PipelineError::Validation(format!(
                    "variation set expands to more than {} combinations",
                    MAX_COMBINATIONS
                )))
            }
        }

        let names = request.member_names();
        let mut seen = HashSet::new();
        if let Some(duplicate) = names.iter().find(|n| !seen.insert(n.as_str())) {
            return Err(PipelineError::Validation(format!(
                "naming template '{}' produces duplicate name '{}'",
                request.template(),
                duplicate
            )));
        }
        if let Some(bad) = names.iter().find(|n| validate_dataset_name(n).is_err()) {
            return Err(PipelineError::Validation(format!(
                "naming template '{}' produces invalid name '{}'",
                request.template(),
                bad
            )));
        }

        let dataset_dir = self.locate_dataset(&request.dataset_name).ok_or_else(|| {
            PipelineError::Validation(format!(
                "Dataset '{}' has not been prepared",
                request.dataset_name
            ))
        })?;

        Ok(SweepPlan {
            dataset: request.dataset_name.clone(),
            preset: request.base_preset.clone(),
            dataset_dir,
            combinations: names
                .into_iter()
                .zip(cartesian_product(&request.variations))
                .collect(),
            varied_parameters: request.variations.keys().cloned().collect(),
        })
    }

    /// Runs a sweep. Results are keyed by member name in cartesian order.
    pub async fn execute(&self, request: VariationRequest) -> PipelineResult {
        let start = Instant::now();
        let ctx = PipelineContext::new();

        let plan = match self.validate(&request) {
            Ok(plan) => plan,
            Err(e) => {
                warn!(dataset = %request.dataset_name, error = %e, "Rejected variation request");
                return PipelineResult::validation_failed(
                    PipelineMode::Variations,
                    e.to_string(),
                    start.elapsed(),
                    &ctx,
                );
            }
        };

        let experiment_id = generate_job_id();
        let variation_id = generate_job_id();
        let total = plan.combinations.len();
        info!(
            dataset = %plan.dataset,
            preset = %plan.preset,
            experiment_id = %experiment_id,
            combinations = total,
            "Starting variation sweep"
        );

        let mut results = IndexMap::new();
        for (index, (name, combination)) in plan.combinations.iter().enumerate() {
            let membership = VariationMembership {
                variation_id: variation_id.clone(),
                experiment_name: name.clone(),
                total_combinations: total,
                varied_parameters: plan.varied_parameters.clone(),
                parameter_values: combination
                    .iter()
                    .map(|(k, v)| (k.clone(), display_value(v)))
                    .collect::<BTreeMap<_, _>>(),
                parent_experiment_id: experiment_id.clone(),
            };
            let result = self
                .run_member(&ctx, &plan, &experiment_id, index + 1, name, combination, membership)
                .await;
            results.insert(name.clone(), result);
        }

        let generated: Vec<String> = results
            .values()
            .filter(|r| r.success)
            .map(|r| r.name.clone())
            .collect();
        let metadata = ExperimentMetadata {
            experiment_id: experiment_id.clone(),
            variation_id,
            dataset: plan.dataset.clone(),
            base_preset: plan.preset.clone(),
            varied_parameters: plan.varied_parameters.clone(),
            total_variations: total,
            variations: generated,
            created_at: Utc::now(),
        };
        if let Err(e) = self.write_metadata(&metadata).await {
            warn!(experiment_id = %experiment_id, error = %e, "Failed to write experiment metadata");
            ctx.add_error(None, format!("failed to write {}: {}", EXPERIMENT_FILE, e));
        }

        let outcome =
            PipelineResult::from_results(PipelineMode::Variations, results, start.elapsed(), &ctx);
        info!(summary = %outcome.summary(), "Variation pipeline finished");
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_member(
        &self,
        ctx: &PipelineContext,
        plan: &SweepPlan,
        experiment_id: &str,
        n: usize,
        name: &str,
        combination: &Combination,
        membership: VariationMembership,
    ) -> DatasetResult {
        let job_id = generate_job_id();
        let tracker = self.services.tracker.as_ref();
        let member_dir = self.services.layout().experiment_dir(experiment_id).join(name);

        let mut result = DatasetResult::succeeded(name)
            .with_job_id(&job_id)
            .with_metadata("experiment_id", json!(experiment_id))
            .with_metadata("variation_id", json!(membership.variation_id))
            .with_metadata("index", json!(n))
            .with_metadata("parameters", json!(membership.parameter_values));
        result.input_dir = Some(plan.dataset_dir.clone());
        result.output_dir = Some(member_dir.clone());

        if let Err(e) = tracker
            .create_variation(&job_id, &plan.dataset, &plan.preset, membership)
            .await
        {
            return fail_member(ctx, result, e.to_string());
        }

        let configured = track_stage(
            tracker,
            &job_id,
            JobState::ConfiguringPreset,
            self.build_member(plan, &member_dir, name, &job_id, combination),
        )
        .await;
        let config_path = match configured {
            Ok(path) => path,
            Err(e) => return fail_member(ctx, result, e.to_string()),
        };

        if let Err(e) = tracker
            .update_status(&job_id, JobState::ReadyForTraining, None)
            .await
        {
            fail_job(&self.services, &job_id, &e.to_string()).await;
            return fail_member(ctx, result, e.to_string());
        }
        if let Err(e) = tracker
            .set_output_path(&job_id, &member_dir.display().to_string())
            .await
        {
            warn!(job_id = %job_id, error = %e, "Failed to record output path");
        }

        let prompts = member_dir.join(SAMPLE_PROMPTS_FILE);
        if prompts.is_file() {
            result.sample_prompts = Some(prompts);
        }
        result.configs.push(config_path);
        ctx.mark_processed(name);
        ctx.add_configs(name, &result.configs);
        debug!(variation = %name, job_id = %job_id, "Variation configured");
        result
    }

    /// Creates the member directories and writes its configuration.
    async fn build_member(
        &self,
        plan: &SweepPlan,
        member_dir: &Path,
        name: &str,
        job_id: &str,
        combination: &Combination,
    ) -> Result<PathBuf, PipelineError> {
        fs::create_dir_all(member_dir.join("model")).await?;
        fs::create_dir_all(member_dir.join("log")).await?;

        let shared_prompts = self.services.layout().sample_prompts(&plan.dataset);
        if shared_prompts.is_file() {
            fs::copy(&shared_prompts, member_dir.join(SAMPLE_PROMPTS_FILE)).await?;
        }

        let generator = self.services.generator();
        let document = generator.get_base_config(&plan.preset)?;
        let document = generator.apply_variations(document, combination)?;
        let document = generator.resolve_model_paths(document, &plan.preset);
        let paths = DatasetPaths::new(&plan.dataset, member_dir)
            .with_variation(name)
            .with_preset(&plan.preset)
            .with_original_dataset_dir(&plan.dataset_dir)
            .with_job_id(job_id);
        let document = generator.update_dataset_paths(document, &paths);

        let path = self
            .services
            .layout()
            .variation_config_dir(&plan.preset)
            .join(format!("{}.toml", name));
        let header = ConfigHeader::new(PipelineMode::Variations, &plan.preset, &plan.dataset, job_id)
            .with_variations(combination.clone());
        generator.write_config(&document, &header, &path).await?;

        Ok(path)
    }

    async fn write_metadata(&self, metadata: &ExperimentMetadata) -> Result<PathBuf, PipelineError> {
        let dir = self.services.layout().experiment_dir(&metadata.experiment_id);
        fs::create_dir_all(&dir).await?;
        let path = dir.join(EXPERIMENT_FILE);
        fs::write(&path, serde_json::to_string_pretty(metadata)?).await?;
        Ok(path)
    }
}

/// Renders a sweep value for job records; strings lose their TOML quotes.
fn display_value(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn fail_member(ctx: &PipelineContext, mut result: DatasetResult, message: String) -> DatasetResult {
    warn!(variation = %result.name, error = %message, "Variation failed");
    ctx.add_error(Some(&result.name), message.clone());
    result.success = false;
    result.error = Some(message);
    result
}
