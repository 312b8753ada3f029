//! End-to-end pipeline tests against a temporary workspace.
//!
//! Each test builds a workspace with real source folders, runs the router,
//! and checks the files on disk together with the job records.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use lora_forge::dataset::{
    DatasetPreparer, FsDatasetPreparer, PreparationRequest, PreparationResult,
};
use lora_forge::generator::ConfigDocument;
use lora_forge::pipeline::{
    AlwaysConfirm, BatchRequest, Confirmer, DatasetInput, DatasetSpec, ExecutionStrategy,
    ExperimentMetadata, PipelineConfig, PipelineMode, PipelineRequest, PipelineRouter,
    PipelineServices, PipelineStatus, SingleRequest, VariationRequest, VariationSpec,
};
use lora_forge::presets::{PresetInfo, PresetManager, PresetProvider};
use lora_forge::tracker::{JobState, JobTracker, MemoryJobTracker};
use serde_json::json;
use tempfile::TempDir;

const SDXL_PRESET: &str = r#"
learning_rate = 0.0001
network_dim = 32
max_train_epochs = 10
seed = 42

[preset]
description = "SDXL base"

[preset.model_paths]
pretrained_model_name_or_path = "models/sdxl.safetensors"
"#;

struct Workspace {
    dir: TempDir,
    tracker: Arc<MemoryJobTracker>,
}

impl Workspace {
    fn new() -> Self {
        Self {
            dir: TempDir::new().expect("tempdir"),
            tracker: Arc::new(MemoryJobTracker::new()),
        }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Creates a source folder with `count` captioned images.
    fn source(&self, name: &str, count: usize) -> PathBuf {
        let dir = self.root().join("raw").join(name);
        std::fs::create_dir_all(&dir).expect("mkdir");
        for i in 0..count {
            std::fs::write(dir.join(format!("{:03}.png", i)), b"png").expect("image");
            std::fs::write(dir.join(format!("{:03}.txt", i)), format!("photo of {} {}", name, i))
                .expect("caption");
        }
        dir
    }

    fn presets(&self) -> PresetManager {
        let mut presets = PresetManager::new();
        presets
            .insert(PresetInfo::from_toml_str("sdxl", SDXL_PRESET).expect("preset"))
            .expect("insert");
        presets
    }

    fn config(&self) -> PipelineConfig {
        PipelineConfig::new()
            .with_base_path(self.root())
            .with_max_workers(2)
    }

    fn router_with(&self, config: PipelineConfig, presets: Arc<dyn PresetProvider>) -> PipelineRouter {
        PipelineRouter::new(PipelineServices::new(
            config,
            presets,
            self.tracker.clone(),
            Arc::new(FsDatasetPreparer::new()),
        ))
    }

    fn router(&self) -> PipelineRouter {
        self.router_with(self.config(), Arc::new(self.presets()))
    }

    fn confirming_router(&self, confirmer: Arc<dyn Confirmer>) -> PipelineRouter {
        PipelineRouter::new(
            PipelineServices::new(
                self.config(),
                Arc::new(self.presets()),
                self.tracker.clone(),
                Arc::new(FsDatasetPreparer::new()),
            )
            .with_confirmer(confirmer),
        )
    }
}

/// Lists a preset that cannot be loaded next to (optionally) the real ones.
struct GhostCatalogue {
    inner: PresetManager,
    list_real: bool,
}

impl GhostCatalogue {
    fn only_ghost(inner: PresetManager) -> Self {
        Self {
            inner,
            list_real: false,
        }
    }

    fn with_real(inner: PresetManager) -> Self {
        Self {
            inner,
            list_real: true,
        }
    }
}

impl PresetProvider for GhostCatalogue {
    fn get_preset(&self, name: &str) -> Option<PresetInfo> {
        self.inner.get_preset(name)
    }

    fn get_presets(&self) -> BTreeMap<String, PresetInfo> {
        let mut listed = if self.list_real {
            self.inner.get_presets()
        } else {
            BTreeMap::new()
        };
        listed.insert(
            "ghost".to_string(),
            PresetInfo::new("ghost", toml::Table::new()),
        );
        listed
    }
}

/// Panics while preparing the named datasets.
struct PanickingPreparer {
    victims: Vec<String>,
    inner: FsDatasetPreparer,
}

#[async_trait]
impl DatasetPreparer for PanickingPreparer {
    async fn prepare(&self, request: &PreparationRequest) -> PreparationResult {
        if self.victims.contains(&request.dataset_name) {
            panic!("preparer crashed on {}", request.dataset_name);
        }
        self.inner.prepare(request).await
    }
}

#[tokio::test]
async fn test_single_prepares_and_generates() {
    let ws = Workspace::new();
    let source = ws.source("faces", 3);

    let result = ws
        .router()
        .execute(SingleRequest::new(&source).with_preset("sdxl").into())
        .await;

    assert_eq!(result.status, PipelineStatus::Success, "{}", result.summary());
    assert_eq!(result.total_datasets, 1);

    let faces = &result.results["faces"];
    assert_eq!(faces.configs.len(), 1);
    assert!(faces.configs[0].starts_with(ws.root().join("Presets").join("sdxl")));
    assert!(ws
        .root()
        .join("output/faces/img/30_person/000.png")
        .is_file());
    assert!(ws.root().join("input/faces/img/002.txt").is_file());

    let document = ConfigDocument::load(&faces.configs[0]).await.expect("load");
    let job_id = faces.job_id.clone().expect("job id");
    assert_eq!(document.job_id(), Some(job_id.as_str()));
    assert!(document
        .train_data_dir()
        .expect("train_data_dir")
        .ends_with("output/faces/img"));

    let job = ws.tracker.get_job(&job_id).await.unwrap().expect("job");
    assert_eq!(job.state, JobState::ReadyForTraining);
    assert_eq!(job.mode, PipelineMode::Single);
    assert_eq!(job.preset_name, "sdxl");
}

#[tokio::test]
async fn test_batch_with_missing_source_is_rejected_whole() {
    let ws = Workspace::new();
    let faces = ws.source("faces", 2);
    let hands = ws.source("hands", 2);
    let missing = ws.root().join("raw").join("nowhere");

    let result = ws
        .router()
        .execute(BatchRequest::new([faces, missing, hands]).with_preset("sdxl").into())
        .await;

    assert_eq!(result.status, PipelineStatus::Failed);
    assert_eq!(result.total_datasets, 0);
    assert!(result.results.is_empty());
    assert!(result.summary().contains("does not exist"));
    assert!(ws.tracker.list_jobs().await.unwrap().is_empty());
    assert!(!ws.root().join("output").join("faces").exists());
}

#[tokio::test]
async fn test_sequential_batch_stops_at_first_failure() {
    let ws = Workspace::new();
    let inputs: Vec<DatasetInput> = vec![
        DatasetSpec::new(ws.source("faces", 2)).with_preset("sdxl").into(),
        // No preset: every listed preset is attempted, and none load.
        ws.source("hands", 2).into(),
        DatasetSpec::new(ws.source("feet", 2)).with_preset("sdxl").into(),
    ];
    let router = ws.router_with(ws.config(), Arc::new(GhostCatalogue::only_ghost(ws.presets())));

    let result = router
        .execute(
            BatchRequest::new(inputs)
                .with_strategy(ExecutionStrategy::Sequential)
                .with_continue_on_error(false)
                .into(),
        )
        .await;

    assert_eq!(result.status, PipelineStatus::PartialSuccess);
    assert_eq!(result.results.keys().collect::<Vec<_>>(), vec!["faces", "hands"]);
    assert_eq!(result.successful_datasets + result.failed_datasets, result.total_datasets);

    let hands = &result.results["hands"];
    assert!(!hands.success);
    let error = hands.error.as_deref().expect("error");
    assert!(error.starts_with("no configurations generated"), "{error}");

    let job = ws
        .tracker
        .get_job(hands.job_id.as_deref().expect("job id"))
        .await
        .unwrap()
        .expect("job");
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.error_message.as_deref(), Some(error));

    let jobs = ws.tracker.list_jobs().await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(|j| j.dataset_name != "feet"));
}

#[tokio::test]
async fn test_sequential_batch_continues_past_failure() {
    let ws = Workspace::new();
    let inputs: Vec<DatasetInput> = vec![
        DatasetSpec::new(ws.source("faces", 2)).with_preset("sdxl").into(),
        ws.source("hands", 2).into(),
        DatasetSpec::new(ws.source("feet", 2)).with_preset("sdxl").into(),
    ];
    let router = ws.router_with(ws.config(), Arc::new(GhostCatalogue::only_ghost(ws.presets())));

    let result = router
        .execute(
            BatchRequest::new(inputs)
                .with_strategy(ExecutionStrategy::Sequential)
                .into(),
        )
        .await;

    assert_eq!(result.total_datasets, 3);
    assert_eq!(result.successful_datasets, 2);
    assert_eq!(result.failed_datasets, 1);
    assert_eq!(
        result.results.keys().collect::<Vec<_>>(),
        vec!["faces", "hands", "feet"]
    );
}

#[tokio::test]
async fn test_parallel_batch_runs_every_dataset() {
    let ws = Workspace::new();
    let sources: Vec<PathBuf> = ["a", "b", "c", "d"]
        .iter()
        .map(|name| ws.source(name, 1))
        .collect();

    let result = ws
        .router()
        .execute(
            BatchRequest::new(sources)
                .with_strategy(ExecutionStrategy::Parallel)
                .with_preset("sdxl")
                .into(),
        )
        .await;

    assert_eq!(result.status, PipelineStatus::Success, "{}", result.summary());
    assert_eq!(result.total_datasets, 4);

    let jobs = ws.tracker.list_jobs().await.unwrap();
    assert_eq!(jobs.len(), 4);
    assert!(jobs.iter().all(|j| j.state == JobState::ReadyForTraining));
    assert!(jobs.iter().all(|j| j.mode == PipelineMode::Batch));
}

#[tokio::test]
async fn test_rerun_requires_clean_or_confirmation() {
    let ws = Workspace::new();
    let source = ws.source("faces", 2);
    let request = || SingleRequest::new(&source).with_preset("sdxl");

    let first = ws.router().execute(request().into()).await;
    assert!(first.is_success());

    // No confirmer attached: the existing dataset is left alone.
    let declined = ws.router().execute(request().into()).await;
    assert_eq!(declined.status, PipelineStatus::Failed);
    assert_eq!(
        declined.results["faces"].error.as_deref(),
        Some("Dataset 'faces' already exists")
    );
    assert_eq!(ws.tracker.list_jobs().await.unwrap().len(), 1);

    let cleaned = ws
        .router()
        .execute(request().with_auto_clean(true).into())
        .await;
    assert!(cleaned.is_success(), "{}", cleaned.summary());

    let confirmer = Arc::new(AlwaysConfirm::new());
    let router = PipelineRouter::new(
        PipelineServices::new(
            ws.config(),
            Arc::new(ws.presets()),
            ws.tracker.clone(),
            Arc::new(FsDatasetPreparer::new()),
        )
        .with_confirmer(confirmer.clone()),
    );
    let confirmed = router.execute(request().into()).await;
    assert!(confirmed.is_success());
    assert_eq!(confirmer.asked(), 1);

    let configs: Vec<_> = std::fs::read_dir(ws.root().join("Presets").join("sdxl"))
        .expect("read dir")
        .collect();
    assert_eq!(configs.len(), 1);
}

#[tokio::test]
async fn test_variation_sweep_shares_experiment() {
    let ws = Workspace::new();
    let source = ws.source("faces", 2);
    assert!(ws
        .router()
        .execute(SingleRequest::new(&source).with_preset("sdxl").into())
        .await
        .is_success());

    let mut spec = VariationSpec::new();
    spec.insert(
        "learning_rate".to_string(),
        vec![toml::Value::Float(1e-4), toml::Value::Float(5e-5)],
    );
    spec.insert(
        "network_dim".to_string(),
        vec![toml::Value::Integer(16), toml::Value::Integer(64)],
    );

    let result = ws
        .router()
        .execute(VariationRequest::new("faces", "sdxl", spec).into())
        .await;

    assert_eq!(result.status, PipelineStatus::Success, "{}", result.summary());
    assert_eq!(
        result.results.keys().collect::<Vec<_>>(),
        vec![
            "faces_sdxl_v1",
            "faces_sdxl_v2",
            "faces_sdxl_v3",
            "faces_sdxl_v4"
        ]
    );

    let mut experiment_ids = Vec::new();
    let mut train_dirs = Vec::new();
    for member in result.results.values() {
        let job = ws
            .tracker
            .get_job(member.job_id.as_deref().expect("job id"))
            .await
            .unwrap()
            .expect("job");
        assert_eq!(job.state, JobState::ReadyForTraining);
        let variation = job.variation.expect("variation membership");
        assert_eq!(variation.total_combinations, 4);
        experiment_ids.push(variation.parent_experiment_id);

        let document = ConfigDocument::load(&member.configs[0]).await.expect("load");
        train_dirs.push(document.train_data_dir().map(str::to_string));
    }
    experiment_ids.dedup();
    train_dirs.dedup();
    assert_eq!(experiment_ids.len(), 1);
    assert_eq!(train_dirs.len(), 1);

    let second = ConfigDocument::load(&result.results["faces_sdxl_v2"].configs[0])
        .await
        .expect("load");
    assert_eq!(second.get("learning_rate"), Some(&toml::Value::Float(1e-4)));
    assert_eq!(second.get("network_dim"), Some(&toml::Value::Integer(64)));
    assert_eq!(second.get("seed"), Some(&toml::Value::Integer(42)));

    let metadata_path = ws
        .root()
        .join("variations")
        .join(format!("exp_{}", experiment_ids[0]))
        .join("experiment.json");
    let metadata: ExperimentMetadata =
        serde_json::from_str(&std::fs::read_to_string(metadata_path).expect("read"))
            .expect("metadata");
    assert_eq!(metadata.total_variations, 4);
    assert_eq!(metadata.variations.len(), 4);
    assert_eq!(metadata.varied_parameters, vec!["learning_rate", "network_dim"]);
}

#[tokio::test]
async fn test_variations_require_prepared_dataset() {
    let ws = Workspace::new();
    let mut spec = VariationSpec::new();
    spec.insert("seed".to_string(), vec![toml::Value::Integer(1)]);

    let result = ws
        .router()
        .execute(VariationRequest::new("faces", "sdxl", spec).into())
        .await;

    assert_eq!(result.status, PipelineStatus::Failed);
    assert_eq!(result.total_datasets, 0);
    assert!(ws.tracker.list_jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_execute_named_modes() {
    let ws = Workspace::new();
    let router = ws.router();

    assert!(router.execute_named("turbo", json!({})).await.is_err());

    let rejected = router
        .execute_named("batch", json!({"datasets": "not-a-list"}))
        .await
        .expect("known mode");
    assert_eq!(rejected.status, PipelineStatus::Failed);
    assert_eq!(rejected.mode, PipelineMode::Batch);

    let source = ws.source("faces", 1);
    let single = router
        .execute_named(
            "single",
            json!({"source": source, "preset": "sdxl", "repeats": 5}),
        )
        .await
        .expect("known mode");
    assert!(single.is_success(), "{}", single.summary());
    assert!(ws
        .root()
        .join("output/faces/img/5_person/000.png")
        .is_file());
}

#[tokio::test]
async fn test_batch_keeps_dataset_when_one_preset_fails() {
    let ws = Workspace::new();
    let inputs: Vec<DatasetInput> = vec![
        DatasetSpec::new(ws.source("faces", 2)).with_preset("sdxl").into(),
        // Every listed preset: sdxl loads, ghost does not.
        ws.source("hands", 2).into(),
        DatasetSpec::new(ws.source("feet", 2)).with_preset("sdxl").into(),
    ];
    let router = ws.router_with(ws.config(), Arc::new(GhostCatalogue::with_real(ws.presets())));

    let result = router
        .execute(
            BatchRequest::new(inputs)
                .with_strategy(ExecutionStrategy::Sequential)
                .with_continue_on_error(false)
                .into(),
        )
        .await;

    assert_eq!(result.status, PipelineStatus::Success, "{}", result.summary());
    assert_eq!(result.total_datasets, 3);

    let hands = &result.results["hands"];
    assert!(hands.success);
    assert_eq!(hands.configs.len(), 1);
    assert_eq!(hands.warnings.len(), 1);
    assert!(hands.warnings[0].contains("ghost"), "{:?}", hands.warnings);

    let job = ws
        .tracker
        .get_job(hands.job_id.as_deref().expect("job id"))
        .await
        .unwrap()
        .expect("job");
    assert_eq!(job.state, JobState::ReadyForTraining);
    assert_eq!(job.preset_name, "all");
}

#[tokio::test]
async fn test_batch_preflight_asks_once_for_all_conflicts() {
    let ws = Workspace::new();
    let faces = ws.source("faces", 1);
    let hands = ws.source("hands", 1);
    let feet = ws.source("feet", 1);
    for source in [&faces, &hands] {
        let prepared = ws
            .router()
            .execute(SingleRequest::new(source).with_preset("sdxl").into())
            .await;
        assert!(prepared.is_success());
    }
    let batch = || {
        BatchRequest::new([faces.clone(), hands.clone(), feet.clone()])
            .with_strategy(ExecutionStrategy::Sequential)
            .with_preset("sdxl")
    };

    // Unattended: only the conflicting datasets are declined.
    let declined = ws.router().execute(batch().into()).await;
    assert_eq!(declined.status, PipelineStatus::PartialSuccess);
    assert_eq!(
        declined.results.keys().collect::<Vec<_>>(),
        vec!["faces", "hands", "feet"]
    );
    for name in ["faces", "hands"] {
        assert_eq!(
            declined.results[name].error.as_deref(),
            Some(format!("Dataset '{}' already exists", name).as_str())
        );
    }
    assert!(declined.results["feet"].success);

    // Every dataset now exists; one prompt covers all three.
    let confirmer = Arc::new(AlwaysConfirm::new());
    let confirmed = ws
        .confirming_router(confirmer.clone())
        .execute(batch().into())
        .await;
    assert!(confirmed.is_success(), "{}", confirmed.summary());
    assert_eq!(confirmed.total_datasets, 3);
    assert_eq!(confirmer.asked(), 1);
}

#[tokio::test]
async fn test_parallel_worker_panic_fails_its_own_job() {
    let ws = Workspace::new();
    let sources: Vec<PathBuf> = ["a", "b", "c"].iter().map(|n| ws.source(n, 1)).collect();
    let preparer = PanickingPreparer {
        victims: vec!["a".to_string(), "c".to_string()],
        inner: FsDatasetPreparer::new(),
    };
    let router = PipelineRouter::new(PipelineServices::new(
        ws.config(),
        Arc::new(ws.presets()),
        ws.tracker.clone(),
        Arc::new(preparer),
    ));

    let result = router
        .execute(
            BatchRequest::new(sources)
                .with_strategy(ExecutionStrategy::Parallel)
                .with_preset("sdxl")
                .into(),
        )
        .await;

    assert_eq!(result.total_datasets, 3);
    assert_eq!(result.successful_datasets, 1);
    assert!(result.results["b"].success);

    for name in ["a", "c"] {
        let failed = &result.results[name];
        assert!(!failed.success);
        assert!(failed.error.as_deref().unwrap_or_default().contains("panicked"));

        let job = ws
            .tracker
            .get_job(failed.job_id.as_deref().expect("job id"))
            .await
            .unwrap()
            .expect("job");
        assert_eq!(job.dataset_name, name);
        assert_eq!(job.state, JobState::Failed);
    }
}

#[tokio::test]
async fn test_oversized_sweep_is_rejected() {
    let ws = Workspace::new();
    let mut spec = VariationSpec::new();
    for i in 0..70 {
        spec.insert(
            format!("param_{}", i),
            vec![toml::Value::Integer(0), toml::Value::Integer(1)],
        );
    }

    let request = VariationRequest::new("faces", "sdxl", spec);
    let planned: PipelineRequest = request.clone().into();
    assert!(ws.router().plan(&planned).is_err());

    let result = ws.router().execute(request.into()).await;
    assert_eq!(result.status, PipelineStatus::Failed);
    assert_eq!(result.total_datasets, 0);
    assert!(result.summary().contains("more than 10000 combinations"));
    assert!(ws.tracker.list_jobs().await.unwrap().is_empty());
}
