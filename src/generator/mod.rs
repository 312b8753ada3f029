//! Configuration generation engine.
//!
//! Turns a preset plus a dataset (plus optional overrides) into a concrete,
//! uniquely identified job configuration:
//!
//! 1. [`ConfigGenerator::get_base_config`] deep-copies the preset defaults
//! 2. [`ConfigGenerator::resolve_model_paths`] overlays the preset's model files
//! 3. [`ConfigGenerator::apply_variations`] applies scalar overrides
//! 4. [`ConfigGenerator::update_dataset_paths`] assigns the job id, output
//!    name and every dataset/output path
//!
//! Every embedded path is absolute against the workspace root, passed
//! through the configured [`PathResolver`](crate::pipeline::PathResolver),
//! and written with `/` separators so generated files are identical across
//! platforms.

pub mod document;

pub use document::{ConfigDocument, ConfigHeader};

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use crate::dataset::{WorkspaceLayout, SAMPLE_PROMPTS_FILE};
use crate::error::ConfigGenError;
use crate::pipeline::{PipelineConfig, PipelineMode};
use crate::presets::PresetProvider;

use document::{
    JOB_ID_KEY, LOGGING_DIR_KEY, OUTPUT_DIR_KEY, OUTPUT_NAME_KEY, SAMPLE_PROMPTS_KEY,
    TRAIN_DATA_DIR_KEY,
};

/// Length of a job identifier.
pub const JOB_ID_LEN: usize = 8;

/// Generates an 8-character opaque job identifier.
pub fn generate_job_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(JOB_ID_LEN);
    id
}

/// Lexically resolves `.` and `..` components.
fn clean_components(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !cleaned.pop() {
                    cleaned.push(component);
                }
            }
            other => cleaned.push(other),
        }
    }
    cleaned
}

/// Makes `path` absolute against `base` and rewrites separators to `/`.
///
/// A relative `base` is itself resolved against the current directory.
pub fn normalize_path(path: &Path, base: &Path) -> String {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };
    let absolute = if joined.is_absolute() {
        joined
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(&joined))
            .unwrap_or(joined)
    };

    to_forward_slashes(&clean_components(&absolute))
}

fn to_forward_slashes(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Returns whether `<base>/<name>` and `<base>/<name>/img` both exist.
///
/// Purely structural; the images themselves are not inspected.
pub fn validate_dataset_exists(name: &str, base: &Path) -> bool {
    let dataset_dir = base.join(name);
    dataset_dir.is_dir() && dataset_dir.join("img").is_dir()
}

/// Path inputs for [`ConfigGenerator::update_dataset_paths`].
#[derive(Debug, Clone, Default)]
pub struct DatasetPaths {
    pub dataset_name: String,
    /// Directory receiving `model/`, `log/` and the sample prompt file.
    pub output_dir: PathBuf,
    pub variation_name: Option<String>,
    pub preset_name: Option<String>,
    /// Prepared dataset to train from when it differs from `output_dir`
    /// (variation sweeps share one prepared copy).
    pub original_dataset_dir: Option<PathBuf>,
    pub job_id: Option<String>,
}

impl DatasetPaths {
    pub fn new(dataset_name: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            dataset_name: dataset_name.into(),
            output_dir: output_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_preset(mut self, preset: impl Into<String>) -> Self {
        self.preset_name = Some(preset.into());
        self
    }

    pub fn with_variation(mut self, variation: impl Into<String>) -> Self {
        self.variation_name = Some(variation.into());
        self
    }

    pub fn with_original_dataset_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.original_dataset_dir = Some(dir.into());
        self
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    /// Output name: `variation_jobid`, else `dataset_preset_jobid`, else
    /// `dataset_jobid`.
    pub fn output_name(&self, job_id: &str) -> String {
        match (&self.variation_name, &self.preset_name) {
            (Some(variation), _) => format!("{}_{}", variation, job_id),
            (None, Some(preset)) => format!("{}_{}_{}", self.dataset_name, preset, job_id),
            (None, None) => format!("{}_{}", self.dataset_name, job_id),
        }
    }
}

/// A configuration file written to disk.
#[derive(Debug, Clone)]
pub struct GeneratedConfig {
    pub path: PathBuf,
    pub job_id: String,
    pub output_name: String,
    pub document: ConfigDocument,
}

/// Builds job configuration documents from presets.
#[derive(Clone)]
pub struct ConfigGenerator {
    config: Arc<PipelineConfig>,
    presets: Arc<dyn PresetProvider>,
}

impl std::fmt::Debug for ConfigGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigGenerator")
            .field("base_path", &self.config.base_path)
            .finish_non_exhaustive()
    }
}

impl ConfigGenerator {
    pub fn new(config: Arc<PipelineConfig>, presets: Arc<dyn PresetProvider>) -> Self {
        Self { config, presets }
    }

    pub fn presets(&self) -> &Arc<dyn PresetProvider> {
        &self.presets
    }

    pub fn layout(&self) -> WorkspaceLayout {
        self.config.layout()
    }

    /// Normalizes a path and applies the configured resolver.
    pub fn normalize(&self, path: &Path) -> String {
        let absolute = PathBuf::from(normalize_path(path, &self.config.base_path));
        match &self.config.path_resolver {
            Some(resolver) => to_forward_slashes(&resolver.resolve(&absolute)),
            None => to_forward_slashes(&absolute),
        }
    }

    /// Returns a private copy of the preset's default document.
    pub fn get_base_config(&self, preset_name: &str) -> Result<ConfigDocument, ConfigGenError> {
        let preset = self
            .presets
            .get_preset(preset_name)
            .ok_or_else(|| ConfigGenError::PresetNotFound(preset_name.to_string()))?;
        Ok(ConfigDocument::from_table(preset.defaults))
    }

    /// Overlays preset-declared model paths, skipping empty ones.
    pub fn resolve_model_paths(
        &self,
        mut config: ConfigDocument,
        preset_name: &str,
    ) -> ConfigDocument {
        for (field, path) in self.presets.get_model_paths(preset_name) {
            if path.trim().is_empty() {
                continue;
            }
            config.set(field, self.normalize(Path::new(&path)));
        }
        config
    }

    /// Assigns the job id, output name and every dataset/output path.
    pub fn update_dataset_paths(
        &self,
        mut config: ConfigDocument,
        paths: &DatasetPaths,
    ) -> ConfigDocument {
        let job_id = paths.job_id.clone().unwrap_or_else(generate_job_id);
        let output_name = paths.output_name(&job_id);

        let train_data_dir = match &paths.original_dataset_dir {
            Some(original) => original.join("img"),
            None => paths.output_dir.join("img"),
        };

        config.set(JOB_ID_KEY, job_id);
        config.set(TRAIN_DATA_DIR_KEY, self.normalize(&train_data_dir));
        config.set(OUTPUT_DIR_KEY, self.normalize(&paths.output_dir.join("model")));
        config.set(LOGGING_DIR_KEY, self.normalize(&paths.output_dir.join("log")));
        config.set(
            SAMPLE_PROMPTS_KEY,
            self.normalize(&paths.output_dir.join(SAMPLE_PROMPTS_FILE)),
        );
        config.set(OUTPUT_NAME_KEY, output_name);
        config
    }

    /// Applies scalar overrides; dotted keys address nested fields.
    ///
    /// Keys are not checked against any schema: unknown keys create new
    /// fields.
    pub fn apply_variations(
        &self,
        mut config: ConfigDocument,
        variations: &IndexMap<String, toml::Value>,
    ) -> Result<ConfigDocument, ConfigGenError> {
        for (key, value) in variations {
            config.set_dotted(key, value.clone())?;
        }
        Ok(config)
    }

    /// Writes a document with its comment header, creating parent
    /// directories.
    pub async fn write_config(
        &self,
        document: &ConfigDocument,
        header: &ConfigHeader,
        path: &Path,
    ) -> Result<(), ConfigGenError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let content = header.render() + &document.to_toml_string()?;
        fs::write(path, content).await?;
        debug!(path = %path.display(), "Wrote configuration");
        Ok(())
    }

    /// Generates and writes the configuration of one single/batch job for
    /// one preset into `Presets/<preset>/<output_name>.toml`.
    pub async fn generate_dataset_config(
        &self,
        mode: PipelineMode,
        dataset_name: &str,
        preset_name: &str,
        job_id: &str,
    ) -> Result<GeneratedConfig, ConfigGenError> {
        let layout = self.layout();
        let paths = DatasetPaths::new(dataset_name, layout.output_dir(dataset_name))
            .with_preset(preset_name)
            .with_job_id(job_id);

        let document = self.get_base_config(preset_name)?;
        let document = self.resolve_model_paths(document, preset_name);
        let document = self.update_dataset_paths(document, &paths);

        let output_name = document
            .output_name()
            .ok_or_else(|| ConfigGenError::MissingField(OUTPUT_NAME_KEY.to_string()))?
            .to_string();
        let path = layout
            .preset_config_dir(preset_name)
            .join(format!("{}.toml", output_name));

        let header = ConfigHeader::new(mode, preset_name, dataset_name, job_id);
        self.write_config(&document, &header, &path).await?;

        info!(
            dataset = %dataset_name,
            preset = %preset_name,
            job_id = %job_id,
            path = %path.display(),
            "Generated configuration"
        );

        Ok(GeneratedConfig {
            path,
            job_id: job_id.to_string(),
            output_name,
            document,
        })
    }
}
