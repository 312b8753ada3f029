//! Job lifecycle tracking.
//!
//! Every unit of training work is a job with a short opaque identifier and
//! a lifecycle state. Executors record transitions through the
//! [`JobTracker`] trait; the store behind it is injected so the same
//! executors run against SQLite in the CLI and an in-memory map in tests.
//!
//! # Lifecycle
//!
//! ```text
//! PREPARING_DATASET -> CONFIGURING_PRESET -> READY_FOR_TRAINING -> TRAINING -> DONE
//!        |                    |                     |                 |
//!        +--------------------+---------------------+-----------------+--> FAILED
//! ```
//!
//! There is no cancellation state. Any error at any stage lands in
//! `FAILED` with the error text.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryJobTracker;
pub use sqlite::SqliteJobTracker;

use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::TrackerError;
use crate::pipeline::PipelineMode;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    PreparingDataset,
    ConfiguringPreset,
    ReadyForTraining,
    Training,
    Done,
    Failed,
}

impl JobState {
    /// Returns the canonical upper-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::PreparingDataset => "PREPARING_DATASET",
            JobState::ConfiguringPreset => "CONFIGURING_PRESET",
            JobState::ReadyForTraining => "READY_FOR_TRAINING",
            JobState::Training => "TRAINING",
            JobState::Done => "DONE",
            JobState::Failed => "FAILED",
        }
    }

    /// Returns whether no further transition is expected.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PREPARING_DATASET" => Ok(JobState::PreparingDataset),
            "CONFIGURING_PRESET" => Ok(JobState::ConfiguringPreset),
            "READY_FOR_TRAINING" => Ok(JobState::ReadyForTraining),
            "TRAINING" => Ok(JobState::Training),
            "DONE" => Ok(JobState::Done),
            "FAILED" => Ok(JobState::Failed),
            other => Err(TrackerError::InvalidState(other.to_string())),
        }
    }
}

/// Sweep membership of a variation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariationMembership {
    /// Identifier of the variation group the job belongs to.
    pub variation_id: String,
    /// Name of this member within the experiment.
    pub experiment_name: String,
    /// Number of combinations in the whole sweep.
    pub total_combinations: usize,
    /// Names of the varied parameters, in sweep order.
    pub varied_parameters: Vec<String>,
    /// Concrete values of this member, rendered as TOML literals.
    pub parameter_values: BTreeMap<String, String>,
    /// Experiment identifier shared by every member of the sweep.
    pub parent_experiment_id: String,
}

/// A job as stored by a tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub mode: PipelineMode,
    pub dataset_name: String,
    pub preset_name: String,
    pub state: JobState,
    #[serde(default)]
    pub total_steps: Option<u64>,
    #[serde(default)]
    pub output_path: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub variation: Option<VariationMembership>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Creates a record in the initial `PREPARING_DATASET` state.
    pub fn new(
        job_id: impl Into<String>,
        mode: PipelineMode,
        dataset_name: impl Into<String>,
        preset_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.into(),
            mode,
            dataset_name: dataset_name.into(),
            preset_name: preset_name.into(),
            state: JobState::PreparingDataset,
            total_steps: None,
            output_path: None,
            error_message: None,
            variation: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Attaches sweep membership.
    pub fn with_variation(mut self, variation: VariationMembership) -> Self {
        self.variation = Some(variation);
        self
    }
}

/// Durable store of job records.
///
/// Implementations must reject a second `create_*` call for the same job
/// identifier; a job id is owned by exactly one worker.
#[async_trait]
pub trait JobTracker: Send + Sync {
    /// Creates a single/batch job record.
    async fn create_execution(
        &self,
        job_id: &str,
        mode: PipelineMode,
        dataset_name: &str,
        preset_name: &str,
    ) -> Result<(), TrackerError>;

    /// Creates a variation member job record.
    async fn create_variation(
        &self,
        job_id: &str,
        dataset_name: &str,
        preset_name: &str,
        membership: VariationMembership,
    ) -> Result<(), TrackerError>;

    /// Moves a job to a new state, optionally recording an error message.
    async fn update_status(
        &self,
        job_id: &str,
        state: JobState,
        error_message: Option<&str>,
    ) -> Result<(), TrackerError>;

    /// Records where the job's outputs will be written.
    async fn set_output_path(&self, job_id: &str, path: &str) -> Result<(), TrackerError>;

    /// Records the total training step count once it is known.
    async fn set_total_steps(&self, job_id: &str, total_steps: u64) -> Result<(), TrackerError>;

    /// Fetches a job record.
    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, TrackerError>;

    /// Lists every job record in creation order.
    async fn list_jobs(&self) -> Result<Vec<JobRecord>, TrackerError>;
}

/// Records `state` for `job_id`, runs `operation`, and marks the job
/// `FAILED` with the error text if it returns an error.
///
/// Tracker write failures are logged and never mask the operation's own
/// outcome.
pub async fn track_stage<T, E, Fut>(
    tracker: &dyn JobTracker,
    job_id: &str,
    state: JobState,
    operation: Fut,
) -> Result<T, E>
where
    E: Display,
    Fut: Future<Output = Result<T, E>>,
{
    if let Err(e) = tracker.update_status(job_id, state, None).await {
        warn!(job_id = %job_id, state = %state, error = %e, "Failed to record job state");
    }

    match operation.await {
        Ok(value) => Ok(value),
        Err(err) => {
            let message = err.to_string();
            if let Err(e) = tracker
                .update_status(job_id, JobState::Failed, Some(&message))
                .await
            {
                warn!(job_id = %job_id, error = %e, "Failed to record job failure");
            }
            Err(err)
        }
    }
}

/// Moves a job to `FAILED`, logging instead of propagating tracker errors.
pub async fn mark_failed(tracker: &dyn JobTracker, job_id: &str, message: &str) {
    if let Err(e) = tracker
        .update_status(job_id, JobState::Failed, Some(message))
        .await
    {
        warn!(job_id = %job_id, error = %e, "Failed to record job failure");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_state_round_trip_names() {
        for state in [
            JobState::PreparingDataset,
            JobState::ConfiguringPreset,
            JobState::ReadyForTraining,
            JobState::Training,
            JobState::Done,
            JobState::Failed,
        ] {
            let parsed: JobState = state.as_str().parse().expect("parse");
            assert_eq!(parsed, state);
        }
        assert!("CANCELLED".parse::<JobState>().is_err());
    }

    #[test]
    fn test_job_state_serde_matches_display() {
        let json = serde_json::to_string(&JobState::ReadyForTraining).expect("serialize");
        assert_eq!(json, "\"READY_FOR_TRAINING\"");
        assert!(JobState::Done.is_terminal());
        assert!(!JobState::Training.is_terminal());
    }

    #[tokio::test]
    async fn test_track_stage_success_keeps_state() {
        let tracker = MemoryJobTracker::new();
        tracker
            .create_execution("job00001", PipelineMode::Single, "faces", "sdxl")
            .await
            .expect("create");

        let result: Result<u32, String> =
            track_stage(&tracker, "job00001", JobState::ConfiguringPreset, async { Ok(7) }).await;

        assert_eq!(result, Ok(7));
        let job = tracker.get_job("job00001").await.expect("get").expect("job");
        assert_eq!(job.state, JobState::ConfiguringPreset);
        assert!(job.error_message.is_none());
    }

    #[tokio::test]
    async fn test_track_stage_failure_records_error() {
        let tracker = MemoryJobTracker::new();
        tracker
            .create_execution("job00002", PipelineMode::Batch, "faces", "sdxl")
            .await
            .expect("create");

        let result: Result<(), String> = track_stage(
            &tracker,
            "job00002",
            JobState::PreparingDataset,
            async { Err("disk full".to_string()) },
        )
        .await;

        assert!(result.is_err());
        let job = tracker.get_job("job00002").await.expect("get").expect("job");
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error_message.as_deref(), Some("disk full"));
    }
}
