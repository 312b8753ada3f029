//! Collaborators injected into every executor.

use std::sync::Arc;

use tracing::{info, warn};

use crate::dataset::{clean_dataset_artifacts, DatasetPreparer, WorkspaceLayout};
use crate::error::PipelineError;
use crate::generator::ConfigGenerator;
use crate::presets::PresetProvider;
use crate::tracker::JobTracker;

use super::config::PipelineConfig;
use super::confirm::{existing_datasets_prompt, Confirmer};

/// How an executor treats a dataset that already has prepared files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistingPolicy {
    /// Ask the attached confirmer; unattended runs decline.
    Ask,
    /// Delete prior artifacts without asking.
    Clean,
    /// Report the dataset as already existing.
    Decline,
}

impl ExistingPolicy {
    pub fn from_auto_clean(auto_clean: bool) -> Self {
        if auto_clean {
            ExistingPolicy::Clean
        } else {
            ExistingPolicy::Ask
        }
    }
}

/// Shared, explicitly constructed dependencies of the executors.
#[derive(Clone)]
pub struct PipelineServices {
    pub config: Arc<PipelineConfig>,
    pub presets: Arc<dyn PresetProvider>,
    pub tracker: Arc<dyn JobTracker>,
    pub preparer: Arc<dyn DatasetPreparer>,
    /// Attended confirmation; `None` means unattended.
    pub confirmer: Option<Arc<dyn Confirmer>>,
}

impl std::fmt::Debug for PipelineServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineServices")
            .field("config", &self.config)
            .field("attended", &self.confirmer.is_some())
            .finish_non_exhaustive()
    }
}

impl PipelineServices {
    pub fn new(
        config: PipelineConfig,
        presets: Arc<dyn PresetProvider>,
        tracker: Arc<dyn JobTracker>,
        preparer: Arc<dyn DatasetPreparer>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            presets,
            tracker,
            preparer,
            confirmer: None,
        }
    }

    /// Attaches an operator confirmation source.
    pub fn with_confirmer(mut self, confirmer: Arc<dyn Confirmer>) -> Self {
        self.confirmer = Some(confirmer);
        self
    }

    pub fn layout(&self) -> WorkspaceLayout {
        self.config.layout()
    }

    pub fn generator(&self) -> ConfigGenerator {
        ConfigGenerator::new(Arc::clone(&self.config), Arc::clone(&self.presets))
    }

    /// Fails with a validation error unless the preset is known.
    pub fn require_preset(&self, preset: &str) -> Result<(), PipelineError> {
        if self.presets.is_valid_preset(preset) {
            Ok(())
        } else {
            Err(PipelineError::PresetNotFound(preset.to_string()))
        }
    }

    /// Asks once about every listed dataset. Unattended runs decline.
    pub fn confirm_overwrite(&self, datasets: &[String]) -> bool {
        match &self.confirmer {
            Some(confirmer) => confirmer.confirm(&existing_datasets_prompt(datasets)),
            None => {
                warn!(
                    datasets = %datasets.join(", "),
                    "Datasets already exist and no confirmation is available"
                );
                false
            }
        }
    }

    /// Applies `policy` to a dataset with prior artifacts.
    ///
    /// Returns `DatasetExists` when the dataset must not be touched.
    pub async fn resolve_existing(
        &self,
        dataset: &str,
        policy: ExistingPolicy,
    ) -> Result<(), PipelineError> {
        let layout = self.layout();
        if !layout.dataset_has_artifacts(dataset) {
            return Ok(());
        }

        let clean = match policy {
            ExistingPolicy::Clean => true,
            ExistingPolicy::Decline => false,
            ExistingPolicy::Ask => self.confirm_overwrite(&[dataset.to_string()]),
        };
        if !clean {
            return Err(PipelineError::DatasetExists(dataset.to_string()));
        }

        let removed = clean_dataset_artifacts(&layout, dataset).await?;
        info!(dataset = %dataset, removed = removed.len(), "Removed prior dataset artifacts");
        Ok(())
    }
}
