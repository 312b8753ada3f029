//! Mode dispatch.
//!
//! The router maps a mode name (or a typed request) onto the matching
//! executor and exposes a side-effect-free planning query.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::PipelineError;

use super::batch::{BatchExecutor, BatchRequest};
use super::services::PipelineServices;
use super::single::{SingleExecutor, SingleRequest, ALL_PRESETS};
use super::types::{PipelineContext, PipelineMode, PipelineResult};
use super::variations::{
    combination_count, VariationExecutor, VariationRequest, MAX_COMBINATIONS,
};

/// A typed request for one of the executors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum PipelineRequest {
    Single(SingleRequest),
    Batch(BatchRequest),
    #[serde(alias = "variation")]
    Variations(VariationRequest),
}

impl PipelineRequest {
    pub fn mode(&self) -> PipelineMode {
        match self {
            PipelineRequest::Single(_) => PipelineMode::Single,
            PipelineRequest::Batch(_) => PipelineMode::Batch,
            PipelineRequest::Variations(_) => PipelineMode::Variations,
        }
    }

    /// Builds a request from a mode and untyped parameters.
    pub fn from_params(mode: PipelineMode, params: serde_json::Value) -> Result<Self, PipelineError> {
        let parsed = match mode {
            PipelineMode::Single => serde_json::from_value(params).map(PipelineRequest::Single),
            PipelineMode::Batch => serde_json::from_value(params).map(PipelineRequest::Batch),
            PipelineMode::Variations => {
                serde_json::from_value(params).map(PipelineRequest::Variations)
            }
        };
        parsed.map_err(|e| {
            PipelineError::Validation(format!("invalid {} parameters: {}", mode, e))
        })
    }
}

/// What an invocation would do, computed without side effects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub mode: PipelineMode,
    pub datasets: Vec<String>,
    pub presets: Vec<String>,
    /// Number of job records the invocation would create.
    pub total_jobs: usize,
    pub description: String,
}

/// Dispatches requests to the single, batch and variation executors.
#[derive(Debug, Clone)]
pub struct PipelineRouter {
    services: PipelineServices,
    single: SingleExecutor,
    batch: BatchExecutor,
    variations: VariationExecutor,
}

impl PipelineRouter {
    pub fn new(services: PipelineServices) -> Self {
        Self {
            single: SingleExecutor::new(services.clone()),
            batch: BatchExecutor::new(services.clone()),
            variations: VariationExecutor::new(services.clone()),
            services,
        }
    }

    pub fn services(&self) -> &PipelineServices {
        &self.services
    }

    /// Runs a typed request.
    pub async fn execute(&self, request: PipelineRequest) -> PipelineResult {
        info!(mode = %request.mode(), "Dispatching pipeline request");
        match request {
            PipelineRequest::Single(request) => self.single.execute(request).await,
            PipelineRequest::Batch(request) => self.batch.execute(request).await,
            PipelineRequest::Variations(request) => self.variations.execute(request).await,
        }
    }

    /// Runs a request given by mode name and untyped parameters.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Validation` for an unknown mode name. Bad
    /// parameters for a known mode produce a failed result instead.
    pub async fn execute_named(
        &self,
        mode: &str,
        params: serde_json::Value,
    ) -> Result<PipelineResult, PipelineError> {
        let mode: PipelineMode = mode.parse()?;
        match PipelineRequest::from_params(mode, params) {
            Ok(request) => Ok(self.execute(request).await),
            Err(e) => {
                let start = Instant::now();
                let ctx = PipelineContext::new();
                Ok(PipelineResult::validation_failed(
                    mode,
                    e.to_string(),
                    start.elapsed(),
                    &ctx,
                ))
            }
        }
    }

    /// Describes what `request` would do without touching the workspace.
    ///
    /// # Errors
    ///
    /// Returns a validation error when dataset names cannot be derived or
    /// a named preset is unknown.
    pub fn plan(&self, request: &PipelineRequest) -> Result<ExecutionPlan, PipelineError> {
        let all_presets = || -> Vec<String> {
            self.services.presets.get_presets().into_keys().collect()
        };

        let plan = match request {
            PipelineRequest::Single(single) => {
                let dataset = single.resolved_name()?;
                let presets = match &single.preset {
                    Some(preset) => {
                        self.services.require_preset(preset)?;
                        vec![preset.clone()]
                    }
                    None => all_presets(),
                };
                let description = format!(
                    "Prepare '{}' from {} and generate {} configuration(s)",
                    dataset,
                    single.source_path.display(),
                    if single.generate_configs { presets.len() } else { 0 }
                );
                ExecutionPlan {
                    mode: PipelineMode::Single,
                    datasets: vec![dataset],
                    presets,
                    total_jobs: 1,
                    description,
                }
            }
            PipelineRequest::Batch(batch) => {
                let mut datasets = Vec::with_capacity(batch.datasets.len());
                let mut presets = Vec::new();
                for input in &batch.datasets {
                    let task = input.normalize(batch.preset.as_deref(), batch.generate_configs)?;
                    let preset = task.preset.unwrap_or_else(|| ALL_PRESETS.to_string());
                    if preset != ALL_PRESETS {
                        self.services.require_preset(&preset)?;
                    }
                    if !presets.contains(&preset) {
                        presets.push(preset);
                    }
                    datasets.push(task.name);
                }
                if presets.iter().any(|p| p == ALL_PRESETS) {
                    presets = all_presets();
                }
                let description = format!(
                    "Prepare {} dataset(s) as independent jobs",
                    datasets.len()
                );
                ExecutionPlan {
                    mode: PipelineMode::Batch,
                    total_jobs: datasets.len(),
                    datasets,
                    presets,
                    description,
                }
            }
            PipelineRequest::Variations(variations) => {
                self.services.require_preset(&variations.base_preset)?;
                let total = match combination_count(&variations.variations) {
                    Some(total) if total <= MAX_COMBINATIONS => total,
                    _ => {
                        return Err(PipelineError::Validation(format!(
                            "variation set expands to more than {} combinations",
                            MAX_COMBINATIONS
                        )))
                    }
                };
                let parameters: Vec<&str> =
                    variations.variations.keys().map(String::as_str).collect();
                let description = format!(
                    "Sweep {} over [{}] from preset '{}': {} combination(s)",
                    variations.dataset_name,
                    parameters.join(", "),
                    variations.base_preset,
                    total
                );
                ExecutionPlan {
                    mode: PipelineMode::Variations,
                    datasets: vec![variations.dataset_name.clone()],
                    presets: vec![variations.base_preset.clone()],
                    total_jobs: total,
                    description,
                }
            }
        };

        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_params() {
        let request =
            PipelineRequest::from_params(PipelineMode::Single, json!({"source_path": "/d/faces"}))
                .expect("single");
        assert_eq!(request.mode(), PipelineMode::Single);

        let err = PipelineRequest::from_params(PipelineMode::Batch, json!({"items": []}))
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_tagged_request() {
        let request: PipelineRequest = serde_json::from_value(json!({
            "mode": "variation",
            "dataset_name": "faces",
            "base_preset": "sdxl",
            "variations": {"seed": [1, 2]}
        }))
        .expect("parse");
        assert_eq!(request.mode(), PipelineMode::Variations);
    }
}
