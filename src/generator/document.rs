//! Job configuration documents.
//!
//! A document is an open TOML table: presets may carry any training
//! hyperparameter, and overrides may introduce new keys. The fields the
//! pipeline itself owns are exposed through typed accessors.

use std::path::Path;

use chrono::Utc;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::ConfigGenError;
use crate::pipeline::PipelineMode;

pub const JOB_ID_KEY: &str = "job_id";
pub const TRAIN_DATA_DIR_KEY: &str = "train_data_dir";
pub const OUTPUT_DIR_KEY: &str = "output_dir";
pub const LOGGING_DIR_KEY: &str = "logging_dir";
pub const SAMPLE_PROMPTS_KEY: &str = "sample_prompts";
pub const OUTPUT_NAME_KEY: &str = "output_name";

/// A fully or partially resolved job configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigDocument {
    table: toml::Table,
}

impl ConfigDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_table(table: toml::Table) -> Self {
        Self { table }
    }

    pub fn as_table(&self) -> &toml::Table {
        &self.table
    }

    pub fn into_table(self) -> toml::Table {
        self.table
    }

    /// Returns a top-level value.
    pub fn get(&self, key: &str) -> Option<&toml::Value> {
        self.table.get(key)
    }

    /// Returns a value addressed by a dotted path (`"a.b.c"`).
    pub fn get_dotted(&self, key: &str) -> Option<&toml::Value> {
        let mut segments = key.split('.');
        let mut current = self.table.get(segments.next()?)?;
        for segment in segments {
            current = current.as_table()?.get(segment)?;
        }
        Some(current)
    }

    /// Returns a top-level string field.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.table.get(key).and_then(|v| v.as_str())
    }

    /// Sets a top-level value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<toml::Value>) {
        self.table.insert(key.into(), value.into());
    }

    /// Sets a value addressed by a dotted path, creating intermediate
    /// tables. A non-table value in the way is replaced by a table.
    pub fn set_dotted(&mut self, key: &str, value: toml::Value) -> Result<(), ConfigGenError> {
        let segments: Vec<&str> = key.split('.').collect();
        if segments.iter().any(|s| s.trim().is_empty()) {
            return Err(ConfigGenError::InvalidKey(key.to_string()));
        }

        let (last, parents) = segments
            .split_last()
            .ok_or_else(|| ConfigGenError::InvalidKey(key.to_string()))?;

        let mut current = &mut self.table;
        for segment in parents {
            let entry = current
                .entry(segment.to_string())
                .or_insert_with(|| toml::Value::Table(toml::Table::new()));
            if !entry.is_table() {
                *entry = toml::Value::Table(toml::Table::new());
            }
            current = match entry {
                toml::Value::Table(table) => table,
                _ => return Err(ConfigGenError::InvalidKey(key.to_string())),
            };
        }

        current.insert(last.to_string(), value);
        Ok(())
    }

    pub fn job_id(&self) -> Option<&str> {
        self.get_str(JOB_ID_KEY)
    }

    pub fn train_data_dir(&self) -> Option<&str> {
        self.get_str(TRAIN_DATA_DIR_KEY)
    }

    pub fn output_dir(&self) -> Option<&str> {
        self.get_str(OUTPUT_DIR_KEY)
    }

    pub fn logging_dir(&self) -> Option<&str> {
        self.get_str(LOGGING_DIR_KEY)
    }

    pub fn sample_prompts(&self) -> Option<&str> {
        self.get_str(SAMPLE_PROMPTS_KEY)
    }

    pub fn output_name(&self) -> Option<&str> {
        self.get_str(OUTPUT_NAME_KEY)
    }

    /// Serializes the document as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigGenError> {
        Ok(toml::to_string(&self.table)?)
    }

    /// Parses a document from TOML text; comments are dropped.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigGenError> {
        Ok(Self {
            table: toml::from_str(content)?,
        })
    }

    /// Reads a document from disk.
    pub async fn load(path: &Path) -> Result<Self, ConfigGenError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_toml_str(&content)
    }
}

/// Comment header written at the top of every generated file.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigHeader {
    pub mode: PipelineMode,
    pub preset: String,
    pub dataset: String,
    pub job_id: String,
    pub variations: Option<IndexMap<String, toml::Value>>,
}

impl ConfigHeader {
    pub fn new(
        mode: PipelineMode,
        preset: impl Into<String>,
        dataset: impl Into<String>,
        job_id: impl Into<String>,
    ) -> Self {
        Self {
            mode,
            preset: preset.into(),
            dataset: dataset.into(),
            job_id: job_id.into(),
            variations: None,
        }
    }

    pub fn with_variations(mut self, variations: IndexMap<String, toml::Value>) -> Self {
        self.variations = Some(variations);
        self
    }

    /// Renders the header as TOML comment lines.
    pub fn render(&self) -> String {
        let mut lines = vec![
            "# Generated by lora-forge".to_string(),
            format!("# mode: {}", self.mode),
            format!("# base_preset: {}", self.preset),
            format!("# dataset: {}", self.dataset),
            format!("# job_id: {}", self.job_id),
        ];

        if let Some(variations) = &self.variations {
            let rendered: Vec<String> = variations
                .iter()
                .map(|(k, v)| format!("{} = {}", k, v))
                .collect();
            lines.push(format!("# variations: {{{}}}", rendered.join(", ")));
        }

        lines.push(format!("# generated_at: {}", Utc::now().to_rfc3339()));
        lines.join("\n") + "\n\n"
    }

    /// Reads the header back from a generated file's leading comments.
    ///
    /// Returns `None` when the mode, preset, dataset or job id is missing.
    /// The variation map is not recovered.
    pub fn parse(content: &str) -> Option<Self> {
        let mut mode = None;
        let mut preset = None;
        let mut dataset = None;
        let mut job_id = None;

        for line in content.lines() {
            let Some(comment) = line.strip_prefix('#') else {
                if line.trim().is_empty() {
                    continue;
                }
                break;
            };
            let Some((key, value)) = comment.split_once(':') else {
                continue;
            };
            let value = value.trim().to_string();
            match key.trim() {
                "mode" => mode = value.parse::<PipelineMode>().ok(),
                "base_preset" => preset = Some(value),
                "dataset" => dataset = Some(value),
                "job_id" => job_id = Some(value),
                _ => {}
            }
        }

        Some(Self::new(mode?, preset?, dataset?, job_id?))
    }
}
