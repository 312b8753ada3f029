//! In-process job tracker.

use async_trait::async_trait;
use chrono::Utc;
use indexmap::IndexMap;
use tokio::sync::RwLock;

use crate::error::TrackerError;
use crate::pipeline::PipelineMode;

use super::{JobRecord, JobState, JobTracker, VariationMembership};

/// Job tracker backed by an insertion-ordered map.
#[derive(Debug, Default)]
pub struct MemoryJobTracker {
    jobs: RwLock<IndexMap<String, JobRecord>>,
}

impl MemoryJobTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of recorded jobs.
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Returns true if no job has been recorded.
    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    async fn insert(&self, record: JobRecord) -> Result<(), TrackerError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&record.job_id) {
            return Err(TrackerError::DuplicateJob(record.job_id));
        }
        jobs.insert(record.job_id.clone(), record);
        Ok(())
    }

    async fn modify<F>(&self, job_id: &str, apply: F) -> Result<(), TrackerError>
    where
        F: FnOnce(&mut JobRecord),
    {
        let mut jobs = self.jobs.write().await;
        let record = jobs
            .get_mut(job_id)
            .ok_or_else(|| TrackerError::JobNotFound(job_id.to_string()))?;
        apply(record);
        record.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl JobTracker for MemoryJobTracker {
    async fn create_execution(
        &self,
        job_id: &str,
        mode: PipelineMode,
        dataset_name: &str,
        preset_name: &str,
    ) -> Result<(), TrackerError> {
        self.insert(JobRecord::new(job_id, mode, dataset_name, preset_name))
            .await
    }

    async fn create_variation(
        &self,
        job_id: &str,
        dataset_name: &str,
        preset_name: &str,
        membership: VariationMembership,
    ) -> Result<(), TrackerError> {
        let record = JobRecord::new(job_id, PipelineMode::Variations, dataset_name, preset_name)
            .with_variation(membership);
        self.insert(record).await
    }

    async fn update_status(
        &self,
        job_id: &str,
        state: JobState,
        error_message: Option<&str>,
    ) -> Result<(), TrackerError> {
        self.modify(job_id, |record| {
            record.state = state;
            if let Some(message) = error_message {
                record.error_message = Some(message.to_string());
            }
        })
        .await
    }

    async fn set_output_path(&self, job_id: &str, path: &str) -> Result<(), TrackerError> {
        self.modify(job_id, |record| record.output_path = Some(path.to_string()))
            .await
    }

    async fn set_total_steps(&self, job_id: &str, total_steps: u64) -> Result<(), TrackerError> {
        self.modify(job_id, |record| record.total_steps = Some(total_steps))
            .await
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, TrackerError> {
        Ok(self.jobs.read().await.get(job_id).cloned())
    }

    async fn list_jobs(&self) -> Result<Vec<JobRecord>, TrackerError> {
        Ok(self.jobs.read().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_transition() {
        let tracker = MemoryJobTracker::new();
        tracker
            .create_execution("a1b2c3d4", PipelineMode::Single, "faces", "sdxl")
            .await
            .expect("create");

        tracker
            .update_status("a1b2c3d4", JobState::ReadyForTraining, None)
            .await
            .expect("update");
        tracker
            .set_output_path("a1b2c3d4", "/ws/output/faces")
            .await
            .expect("output");
        tracker.set_total_steps("a1b2c3d4", 1200).await.expect("steps");

        let job = tracker.get_job("a1b2c3d4").await.expect("get").expect("job");
        assert_eq!(job.state, JobState::ReadyForTraining);
        assert_eq!(job.output_path.as_deref(), Some("/ws/output/faces"));
        assert_eq!(job.total_steps, Some(1200));
        assert!(job.updated_at >= job.created_at);
    }

    #[tokio::test]
    async fn test_duplicate_job_rejected() {
        let tracker = MemoryJobTracker::new();
        tracker
            .create_execution("dup00000", PipelineMode::Batch, "a", "p")
            .await
            .expect("create");

        let err = tracker
            .create_execution("dup00000", PipelineMode::Batch, "b", "p")
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::DuplicateJob(_)));
        assert_eq!(tracker.len().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_job_update_fails() {
        let tracker = MemoryJobTracker::new();
        let err = tracker
            .update_status("missing0", JobState::Done, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn test_variation_record() {
        let tracker = MemoryJobTracker::new();
        let membership = VariationMembership {
            variation_id: "grp00001".to_string(),
            experiment_name: "faces_sdxl_v1".to_string(),
            total_combinations: 4,
            varied_parameters: vec!["learning_rate".to_string()],
            parameter_values: [("learning_rate".to_string(), "0.0001".to_string())]
                .into_iter()
                .collect(),
            parent_experiment_id: "exp00001".to_string(),
        };
        tracker
            .create_variation("var00001", "faces", "sdxl", membership.clone())
            .await
            .expect("create");

        let jobs = tracker.list_jobs().await.expect("list");
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].mode, PipelineMode::Variations);
        assert_eq!(jobs[0].variation.as_ref(), Some(&membership));
    }
}
