//! Pipeline orchestration.
//!
//! Routes a request to one of three executors and folds every outcome,
//! expected or not, into a [`PipelineResult`]:
//!
//! - **Single**: prepare one dataset and generate one or every preset
//!   configuration for it
//! - **Batch**: fan a list of datasets out sequentially or over a bounded
//!   worker pool, with partial success
//! - **Variations**: expand a parameter sweep into one job per combination
//!   under a shared experiment identifier
//!
//! Collaborators (presets, job tracker, dataset preparer, confirmation)
//! are injected through [`PipelineServices`].
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use lora_forge::dataset::FsDatasetPreparer;
//! use lora_forge::pipeline::{PipelineConfig, PipelineRouter, PipelineServices, SingleRequest};
//! use lora_forge::presets::PresetManager;
//! use lora_forge::tracker::MemoryJobTracker;
//!
//! let config = PipelineConfig::new().with_base_path("./workspace");
//! let presets = PresetManager::from_directory(config.presets_dir())?;
//! let services = PipelineServices::new(
//!     config,
//!     Arc::new(presets),
//!     Arc::new(MemoryJobTracker::new()),
//!     Arc::new(FsDatasetPreparer::new()),
//! );
//!
//! let router = PipelineRouter::new(services);
//! let result = router
//!     .execute(SingleRequest::new("/data/raw/faces").with_preset("sdxl").into())
//!     .await;
//! println!("{}", result.summary());
//! ```

pub mod batch;
pub mod config;
pub mod confirm;
pub mod router;
pub mod services;
pub mod single;
pub mod types;
pub mod variations;

pub use batch::{BatchExecutor, BatchRequest, DatasetInput, DatasetSpec, ExecutionStrategy};
pub use config::{
    ConfigError, PathResolver, PipelineConfig, PrefixPathResolver, DEFAULT_TRAINING_COMMAND,
};
pub use confirm::{AlwaysConfirm, Confirmer, NonInteractive, TerminalConfirmer};
pub use router::{ExecutionPlan, PipelineRequest, PipelineRouter};
pub use services::{ExistingPolicy, PipelineServices};
pub use single::{extract_dataset_name, SingleExecutor, SingleRequest};
pub use types::{
    ContextSnapshot, DatasetResult, ErrorRecord, PipelineContext, PipelineMode, PipelineResult,
    PipelineStatus,
};
pub use variations::{
    cartesian_product, combination_count, ExperimentMetadata, VariationExecutor,
    VariationRequest, VariationSpec, MAX_COMBINATIONS,
};

impl From<SingleRequest> for PipelineRequest {
    fn from(request: SingleRequest) -> Self {
        PipelineRequest::Single(request)
    }
}

impl From<BatchRequest> for PipelineRequest {
    fn from(request: BatchRequest) -> Self {
        PipelineRequest::Batch(request)
    }
}

impl From<VariationRequest> for PipelineRequest {
    fn from(request: VariationRequest) -> Self {
        PipelineRequest::Variations(request)
    }
}
