//! lora-forge: Dataset preparation and LoRA training configuration orchestrator.
//!
//! This library prepares image/caption datasets into the Kohya folder
//! layout, generates training configurations from presets in single, batch
//! and parameter-sweep modes, tracks every job's lifecycle, and drives the
//! external training process.

// Core modules
pub mod cli;
pub mod dataset;
pub mod error;
pub mod generator;
pub mod pipeline;
pub mod presets;
pub mod tracker;
pub mod training;

// Re-export commonly used error types
pub use error::{
    ConfigGenError, DatasetError, PipelineError, PresetError, TrackerError, TrainingError,
};
