//! Dataset preparation and workspace layout.
//!
//! Preparation (validating raw image/caption pairs and copying them into
//! the training layout) is consumed through the [`DatasetPreparer`] trait
//! as a black box returning a [`PreparationResult`]. [`FsDatasetPreparer`]
//! is the default implementation used by the CLI.
//!
//! # Layout
//!
//! ```text
//! <workspace>/
//!   input/<dataset>/img/                       prepared source copy
//!   output/<dataset>/img/<repeats>_<class>/    training images + captions
//!   output/<dataset>/{log,model}/
//!   output/<dataset>/sample_prompts.txt
//!   Presets/<preset>/<output_name>.toml        single/batch configs
//!   Presets/Variations/<preset>/<name>.toml    variation configs
//!   variations/exp_<id>/<variation>/{model,log}
//!   variations/exp_<id>/experiment.json
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::DatasetError;

/// Image extensions picked up from a source directory.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "bmp"];

/// Number of captions used to seed the sample prompt file.
const SAMPLE_PROMPT_COUNT: usize = 4;

/// Name of the generated sample prompt file.
pub const SAMPLE_PROMPTS_FILE: &str = "sample_prompts.txt";

/// Directory under `Presets/` holding variation configs.
pub const VARIATIONS_PRESET_DIR: &str = "Variations";

/// Directory layout of a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceLayout {
    root: PathBuf,
}

impl WorkspaceLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn input_root(&self) -> PathBuf {
        self.root.join("input")
    }

    pub fn input_dir(&self, dataset: &str) -> PathBuf {
        self.input_root().join(dataset)
    }

    pub fn output_root(&self) -> PathBuf {
        self.root.join("output")
    }

    pub fn output_dir(&self, dataset: &str) -> PathBuf {
        self.output_root().join(dataset)
    }

    pub fn presets_root(&self) -> PathBuf {
        self.root.join("Presets")
    }

    /// Directory for single/batch configs of one preset.
    pub fn preset_config_dir(&self, preset: &str) -> PathBuf {
        self.presets_root().join(preset)
    }

    /// Directory for variation configs of one preset.
    pub fn variation_config_dir(&self, preset: &str) -> PathBuf {
        self.presets_root().join(VARIATIONS_PRESET_DIR).join(preset)
    }

    pub fn variations_root(&self) -> PathBuf {
        self.root.join("variations")
    }

    /// Directory shared by every member of one sweep.
    pub fn experiment_dir(&self, experiment_id: &str) -> PathBuf {
        self.variations_root().join(format!("exp_{}", experiment_id))
    }

    pub fn sample_prompts(&self, dataset: &str) -> PathBuf {
        self.output_dir(dataset).join(SAMPLE_PROMPTS_FILE)
    }

    /// Returns whether any prepared artifact exists for the dataset.
    pub fn dataset_has_artifacts(&self, dataset: &str) -> bool {
        self.input_dir(dataset).exists() || self.output_dir(dataset).exists()
    }
}

/// Input to a preparation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparationRequest {
    pub source: PathBuf,
    pub dataset_name: String,
    pub repeats: u32,
    pub class_name: String,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
}

/// Structured outcome of a preparation run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreparationResult {
    pub success: bool,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub image_count: usize,
    pub caption_count: usize,
    pub sample_prompts: Option<PathBuf>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

impl PreparationResult {
    /// Creates a failed result for the given request.
    pub fn failed(request: &PreparationRequest, error: impl Into<String>) -> Self {
        Self {
            success: false,
            input_dir: request.input_dir.clone(),
            output_dir: request.output_dir.clone(),
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Black-box dataset preparation step.
#[async_trait]
pub trait DatasetPreparer: Send + Sync {
    /// Prepares the dataset; failures are reported in the result, not raised.
    async fn prepare(&self, request: &PreparationRequest) -> PreparationResult;
}

/// Copies image/caption pairs from a source directory into the workspace.
#[derive(Debug, Clone, Default)]
pub struct FsDatasetPreparer;

impl FsDatasetPreparer {
    pub fn new() -> Self {
        Self
    }

    async fn prepare_inner(
        &self,
        request: &PreparationRequest,
    ) -> Result<PreparationResult, DatasetError> {
        if !request.source.is_dir() {
            return Err(DatasetError::SourceMissing(
                request.source.display().to_string(),
            ));
        }

        let images = collect_images(&request.source)?;
        if images.is_empty() {
            return Err(DatasetError::NoImages(request.source.display().to_string()));
        }

        let input_img = request.input_dir.join("img");
        let train_img = request
            .output_dir
            .join("img")
            .join(format!("{}_{}", request.repeats, request.class_name));

        fs::create_dir_all(&input_img).await?;
        fs::create_dir_all(&train_img).await?;
        fs::create_dir_all(request.output_dir.join("log")).await?;
        fs::create_dir_all(request.output_dir.join("model")).await?;

        let mut result = PreparationResult {
            success: true,
            input_dir: request.input_dir.clone(),
            output_dir: request.output_dir.clone(),
            ..Default::default()
        };
        let mut seen = HashSet::new();
        let mut captions = Vec::new();

        for image in &images {
            let Some(file_name) = image.file_name() else {
                continue;
            };
            if !seen.insert(file_name.to_os_string()) {
                result.warnings.push(format!(
                    "Skipped duplicate image name {}",
                    image.display()
                ));
                continue;
            }

            fs::copy(image, input_img.join(file_name)).await?;
            fs::copy(image, train_img.join(file_name)).await?;
            result.image_count += 1;

            let caption = image.with_extension("txt");
            if caption.is_file() {
                let caption_name = Path::new(file_name).with_extension("txt");
                fs::copy(&caption, input_img.join(&caption_name)).await?;
                fs::copy(&caption, train_img.join(&caption_name)).await?;
                result.caption_count += 1;

                if captions.len() < SAMPLE_PROMPT_COUNT {
                    let text = fs::read_to_string(&caption).await?;
                    let text = text.trim();
                    if !text.is_empty() {
                        captions.push(text.replace('\n', " "));
                    }
                }
            } else {
                result
                    .warnings
                    .push(format!("Missing caption for {}", image.display()));
            }
        }

        if captions.is_empty() {
            captions.push(request.class_name.clone());
        }
        let prompts_path = request.output_dir.join(SAMPLE_PROMPTS_FILE);
        fs::write(&prompts_path, captions.join("\n") + "\n").await?;
        result.sample_prompts = Some(prompts_path);

        info!(
            dataset = %request.dataset_name,
            images = result.image_count,
            captions = result.caption_count,
            "Prepared dataset"
        );

        Ok(result)
    }
}

#[async_trait]
impl DatasetPreparer for FsDatasetPreparer {
    async fn prepare(&self, request: &PreparationRequest) -> PreparationResult {
        match self.prepare_inner(request).await {
            Ok(result) => result,
            Err(e) => {
                warn!(dataset = %request.dataset_name, error = %e, "Dataset preparation failed");
                PreparationResult::failed(request, e.to_string())
            }
        }
    }
}

/// Lists image files under `source`, sorted by path.
fn collect_images(source: &Path) -> Result<Vec<PathBuf>, DatasetError> {
    let mut images = Vec::new();

    for entry in WalkDir::new(source).follow_links(true) {
        let entry = entry.map_err(|e| DatasetError::Walk {
            path: source.display().to_string(),
            message: e.to_string(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let is_image = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
            .unwrap_or(false);

        if is_image {
            images.push(entry.into_path());
        }
    }

    images.sort();
    Ok(images)
}

/// Returns whether `file_name` is a config generated for `dataset` under
/// the preset directory `preset`: `<dataset>_<preset>_<job id>.toml`.
fn is_generated_config(file_name: &str, dataset: &str, preset: &str) -> bool {
    let Some(stem) = file_name.strip_suffix(".toml") else {
        return false;
    };
    let prefix = format!("{}_{}_", dataset, preset);
    match stem.strip_prefix(&prefix) {
        Some(job_id) => {
            job_id.len() == crate::generator::JOB_ID_LEN
                && job_id.chars().all(|c| c.is_ascii_alphanumeric())
        }
        None => false,
    }
}

/// Removes every prior artifact of a dataset: its input copy, its output
/// tree and the preset configs generated for it.
///
/// Returns the removed paths.
pub async fn clean_dataset_artifacts(
    layout: &WorkspaceLayout,
    dataset: &str,
) -> Result<Vec<PathBuf>, DatasetError> {
    let mut removed = Vec::new();

    for dir in [layout.input_dir(dataset), layout.output_dir(dataset)] {
        if dir.exists() {
            fs::remove_dir_all(&dir).await?;
            removed.push(dir);
        }
    }

    let presets_root = layout.presets_root();
    if presets_root.is_dir() {
        let mut preset_dirs = fs::read_dir(&presets_root).await?;
        while let Some(preset_dir) = preset_dirs.next_entry().await? {
            let preset_path = preset_dir.path();
            let Some(preset) = preset_path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if preset == VARIATIONS_PRESET_DIR || !preset_path.is_dir() {
                continue;
            }

            let mut files = fs::read_dir(&preset_path).await?;
            while let Some(file) = files.next_entry().await? {
                let path = file.path();
                let matches = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| is_generated_config(n, dataset, preset))
                    .unwrap_or(false);
                if matches {
                    fs::remove_file(&path).await?;
                    removed.push(path);
                }
            }
        }
    }

    debug!(dataset = %dataset, removed = removed.len(), "Cleaned dataset artifacts");
    Ok(removed)
}
