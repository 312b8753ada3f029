//! Preset catalogue for training configuration templates.
//!
//! A preset is a named TOML document of default training hyperparameters
//! plus the model files it trains against. Presets live as one file per
//! preset (`<name>.toml`) in a directory:
//!
//! ```toml
//! network_dim = 32
//! learning_rate = 1e-4
//! max_train_epochs = 10
//!
//! [preset]
//! description = "SDXL character LoRA"
//!
//! [preset.model_paths]
//! pretrained_model_name_or_path = "/models/sdxl_base.safetensors"
//! vae = ""
//! ```
//!
//! The `[preset]` table is metadata; every other key is part of the
//! default configuration document. Executors only see presets through the
//! [`PresetProvider`] trait so tests can inject their own catalogue.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PresetError;

/// Name of the metadata table inside a preset file.
const PRESET_META_KEY: &str = "preset";

/// Everything known about one preset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresetInfo {
    /// Preset name (the file stem).
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Default configuration document. Never handed out for mutation;
    /// the generator deep-copies it.
    pub defaults: toml::Table,
    /// Model file fields overlaid onto generated documents.
    #[serde(default)]
    pub model_paths: BTreeMap<String, String>,
    /// File the preset was loaded from, if any.
    #[serde(default)]
    pub source: Option<PathBuf>,
}

impl PresetInfo {
    /// Creates a preset with the given defaults and no model paths.
    pub fn new(name: impl Into<String>, defaults: toml::Table) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            defaults,
            model_paths: BTreeMap::new(),
            source: None,
        }
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Adds a model path field.
    pub fn with_model_path(mut self, field: impl Into<String>, path: impl Into<String>) -> Self {
        self.model_paths.insert(field.into(), path.into());
        self
    }

    /// Parses a preset from TOML text.
    pub fn from_toml_str(name: &str, content: &str) -> Result<Self, PresetError> {
        let mut defaults: toml::Table =
            toml::from_str(content).map_err(|e| PresetError::ParseError {
                path: name.to_string(),
                message: e.to_string(),
            })?;

        let mut info = PresetInfo::new(name, toml::Table::new());

        if let Some(meta) = defaults.remove(PRESET_META_KEY) {
            let toml::Value::Table(meta) = meta else {
                return Err(PresetError::ParseError {
                    path: name.to_string(),
                    message: format!("'{}' must be a table", PRESET_META_KEY),
                });
            };

            if let Some(toml::Value::String(description)) = meta.get("description") {
                info.description = description.clone();
            }

            if let Some(toml::Value::Table(paths)) = meta.get("model_paths") {
                for (field, value) in paths {
                    if let toml::Value::String(path) = value {
                        info.model_paths.insert(field.clone(), path.clone());
                    }
                }
            }
        }

        info.defaults = defaults;
        Ok(info)
    }
}

/// Read-only view of the preset catalogue consumed by the executors.
pub trait PresetProvider: Send + Sync {
    /// Returns the preset with the given name.
    fn get_preset(&self, name: &str) -> Option<PresetInfo>;

    /// Returns every known preset keyed by name, in name order.
    fn get_presets(&self) -> BTreeMap<String, PresetInfo>;

    /// Returns the model path fields declared by a preset.
    fn get_model_paths(&self, name: &str) -> BTreeMap<String, String> {
        self.get_preset(name)
            .map(|p| p.model_paths)
            .unwrap_or_default()
    }

    /// Returns whether the preset exists.
    fn is_valid_preset(&self, name: &str) -> bool {
        self.get_preset(name).is_some()
    }
}

/// Preset catalogue loaded from TOML files.
#[derive(Debug, Default)]
pub struct PresetManager {
    presets: BTreeMap<String, PresetInfo>,
}

impl PresetManager {
    /// Creates an empty catalogue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a catalogue from every `*.toml` file in `dir`.
    ///
    /// A missing directory yields an empty catalogue.
    pub fn from_directory<P: AsRef<Path>>(dir: P) -> Result<Self, PresetError> {
        let mut manager = Self::new();
        if dir.as_ref().is_dir() {
            manager.load_directory(dir)?;
        }
        Ok(manager)
    }

    /// Loads a single preset file; the file stem becomes the preset name.
    pub fn load_file<P: AsRef<Path>>(&mut self, path: P) -> Result<&PresetInfo, PresetError> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| PresetError::InvalidName(path.display().to_string()))?
            .to_string();

        let content = fs::read_to_string(path)?;
        let mut info =
            PresetInfo::from_toml_str(&name, &content).map_err(|e| match e {
                PresetError::ParseError { message, .. } => PresetError::ParseError {
                    path: path.display().to_string(),
                    message,
                },
                other => other,
            })?;
        info.source = Some(path.to_path_buf());

        debug!(preset = %name, path = %path.display(), "Loaded preset");
        self.insert(info)
    }

    /// Loads all TOML presets from a directory (non-recursive).
    ///
    /// Returns the number of presets loaded.
    pub fn load_directory<P: AsRef<Path>>(&mut self, dir: P) -> Result<usize, PresetError> {
        let mut count = 0;

        let mut paths: Vec<PathBuf> = fs::read_dir(dir.as_ref())?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .filter(|p| p.extension().map(|ext| ext == "toml").unwrap_or(false))
            .collect();
        paths.sort();

        for path in paths {
            self.load_file(&path)?;
            count += 1;
        }

        Ok(count)
    }

    /// Registers a preset built in memory.
    pub fn insert(&mut self, info: PresetInfo) -> Result<&PresetInfo, PresetError> {
        if info.name.is_empty() || info.name.contains(['/', '\\']) {
            return Err(PresetError::InvalidName(info.name));
        }
        if self.presets.contains_key(&info.name) {
            return Err(PresetError::DuplicatePreset(info.name));
        }

        let name = info.name.clone();
        Ok(self.presets.entry(name).or_insert(info))
    }

    /// Returns the number of loaded presets.
    pub fn len(&self) -> usize {
        self.presets.len()
    }

    /// Returns true if no presets are loaded.
    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }

    /// Returns an iterator over preset names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.presets.keys().map(|s| s.as_str())
    }
}

impl PresetProvider for PresetManager {
    fn get_preset(&self, name: &str) -> Option<PresetInfo> {
        self.presets.get(name).cloned()
    }

    fn get_presets(&self) -> BTreeMap<String, PresetInfo> {
        self.presets.clone()
    }
}
