//! SQLite-backed job tracker.
//!
//! Job records live in a single `jobs` table created on connect. Variation
//! membership is stored as a JSON column.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::debug;

use crate::error::TrackerError;
use crate::pipeline::PipelineMode;

use super::{JobRecord, JobState, JobTracker, VariationMembership};

const CREATE_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    job_id TEXT PRIMARY KEY NOT NULL,
    mode TEXT NOT NULL,
    dataset_name TEXT NOT NULL,
    preset_name TEXT NOT NULL,
    state TEXT NOT NULL,
    total_steps INTEGER,
    output_path TEXT,
    error_message TEXT,
    variation TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

const SELECT_COLUMNS: &str = "job_id, mode, dataset_name, preset_name, state, total_steps, \
                              output_path, error_message, variation, created_at, updated_at";

/// Job tracker persisting records in SQLite.
#[derive(Debug, Clone)]
pub struct SqliteJobTracker {
    pool: SqlitePool,
}

impl SqliteJobTracker {
    /// Connects to the database, creating the file and schema if needed.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite URL, e.g. `sqlite://jobs.db` or `sqlite::memory:`
    pub async fn connect(database_url: &str) -> Result<Self, TrackerError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| TrackerError::ConnectionFailed(e.to_string()))?
            .create_if_missing(true);

        // Every in-memory connection is its own database.
        let max_connections = if database_url.contains(":memory:") {
            1
        } else {
            5
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| TrackerError::ConnectionFailed(e.to_string()))?;

        let tracker = Self { pool };
        tracker.run_migrations().await?;
        Ok(tracker)
    }

    /// Creates a tracker from an existing pool without touching the schema.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Creates the `jobs` table if it does not exist.
    pub async fn run_migrations(&self) -> Result<(), TrackerError> {
        sqlx::query(CREATE_JOBS_TABLE).execute(&self.pool).await?;
        debug!("Job tracker schema ready");
        Ok(())
    }

    async fn insert(&self, record: &JobRecord) -> Result<(), TrackerError> {
        let exists = sqlx::query("SELECT 1 FROM jobs WHERE job_id = ?")
            .bind(&record.job_id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_some() {
            return Err(TrackerError::DuplicateJob(record.job_id.clone()));
        }

        let total_steps = record.total_steps.map(steps_column).transpose()?;
        let variation_json = match &record.variation {
            Some(v) => Some(serde_json::to_string(v)?),
            None => None,
        };

        sqlx::query(
            r#"
            INSERT INTO jobs (
                job_id, mode, dataset_name, preset_name, state, total_steps,
                output_path, error_message, variation, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.job_id)
        .bind(record.mode.as_str())
        .bind(&record.dataset_name)
        .bind(&record.preset_name)
        .bind(record.state.as_str())
        .bind(total_steps)
        .bind(&record.output_path)
        .bind(&record.error_message)
        .bind(variation_json)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn ensure_updated(job_id: &str, rows_affected: u64) -> Result<(), TrackerError> {
        if rows_affected == 0 {
            return Err(TrackerError::JobNotFound(job_id.to_string()));
        }
        Ok(())
    }

    fn record_from_row(row: &SqliteRow) -> Result<JobRecord, TrackerError> {
        let mode: String = row.try_get("mode")?;
        let state: String = row.try_get("state")?;
        let total_steps: Option<i64> = row.try_get("total_steps")?;
        let variation: Option<String> = row.try_get("variation")?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;
        let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

        let variation = match variation {
            Some(json) => Some(serde_json::from_str::<VariationMembership>(&json)?),
            None => None,
        };

        Ok(JobRecord {
            job_id: row.try_get("job_id")?,
            mode: mode
                .parse()
                .map_err(|_| TrackerError::InvalidState(format!("unknown mode '{}'", mode)))?,
            dataset_name: row.try_get("dataset_name")?,
            preset_name: row.try_get("preset_name")?,
            state: state.parse()?,
            total_steps: total_steps.map(|s| u64::try_from(s).unwrap_or(0)),
            output_path: row.try_get("output_path")?,
            error_message: row.try_get("error_message")?,
            variation,
            created_at,
            updated_at,
        })
    }
}

#[async_trait]
impl JobTracker for SqliteJobTracker {
    async fn create_execution(
        &self,
        job_id: &str,
        mode: PipelineMode,
        dataset_name: &str,
        preset_name: &str,
    ) -> Result<(), TrackerError> {
        self.insert(&JobRecord::new(job_id, mode, dataset_name, preset_name))
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
        self.insert(&record).await
    }

    async fn update_status(
        &self,
        job_id: &str,
        state: JobState,
        error_message: Option<&str>,
    ) -> Result<(), TrackerError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = ?, error_message = COALESCE(?, error_message), updated_at = ?
            WHERE job_id = ?
            "#,
        )
        .bind(state.as_str())
        .bind(error_message)
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Self::ensure_updated(job_id, result.rows_affected())
    }

    async fn set_output_path(&self, job_id: &str, path: &str) -> Result<(), TrackerError> {
        let result = sqlx::query("UPDATE jobs SET output_path = ?, updated_at = ? WHERE job_id = ?")
            .bind(path)
            .bind(Utc::now())
            .bind(job_id)
            .execute(&self.pool)
            .await?;

        Self::ensure_updated(job_id, result.rows_affected())
    }

    async fn set_total_steps(&self, job_id: &str, total_steps: u64) -> Result<(), TrackerError> {
        let total_steps = steps_column(total_steps)?;
        let result = sqlx::query("UPDATE jobs SET total_steps = ?, updated_at = ? WHERE job_id = ?")
            .bind(total_steps)
            .bind(Utc::now())
            .bind(job_id)
            .execute(&self.pool)
            .await?;

        Self::ensure_updated(job_id, result.rows_affected())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, TrackerError> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE job_id = ?", SELECT_COLUMNS))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::record_from_row).transpose()
    }

    async fn list_jobs(&self) -> Result<Vec<JobRecord>, TrackerError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM jobs ORDER BY created_at ASC, rowid ASC",
            SELECT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::record_from_row).collect()
    }
}

/// SQLite integers are signed 64-bit.
fn steps_column(steps: u64) -> Result<i64, TrackerError> {
    i64::try_from(steps).map_err(|_| TrackerError::StepsOutOfRange(steps))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_tracker() -> SqliteJobTracker {
        SqliteJobTracker::connect("sqlite::memory:")
            .await
            .expect("connect")
    }

    #[tokio::test]
    async fn test_sqlite_lifecycle() {
        let tracker = memory_tracker().await;
        tracker
            .create_execution("q1w2e3r4", PipelineMode::Single, "faces", "sdxl")
            .await
            .expect("create");

        tracker
            .update_status("q1w2e3r4", JobState::ConfiguringPreset, None)
            .await
            .expect("update");
        tracker
            .update_status("q1w2e3r4", JobState::Failed, Some("preset broke"))
            .await
            .expect("fail");
        tracker
            .set_output_path("q1w2e3r4", "/ws/output/faces")
            .await
            .expect("output");

        let job = tracker.get_job("q1w2e3r4").await.expect("get").expect("job");
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.mode, PipelineMode::Single);
        assert_eq!(job.error_message.as_deref(), Some("preset broke"));
        assert_eq!(job.output_path.as_deref(), Some("/ws/output/faces"));
        assert!(job.variation.is_none());
    }

    #[tokio::test]
    async fn test_sqlite_duplicate_and_missing() {
        let tracker = memory_tracker().await;
        tracker
            .create_execution("same0000", PipelineMode::Batch, "a", "p")
            .await
            .expect("create");

        let dup = tracker
            .create_execution("same0000", PipelineMode::Batch, "a", "p")
            .await;
        assert!(matches!(dup, Err(TrackerError::DuplicateJob(_))));

        let missing = tracker.set_total_steps("nope0000", 10).await;
        assert!(matches!(missing, Err(TrackerError::JobNotFound(_))));
        assert!(tracker.get_job("nope0000").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_sqlite_variation_round_trip() {
        let tracker = memory_tracker().await;
        let membership = VariationMembership {
            variation_id: "grp00002".to_string(),
            experiment_name: "faces_sdxl_v2".to_string(),
            total_combinations: 2,
            varied_parameters: vec!["seed".to_string()],
            parameter_values: [("seed".to_string(), "2".to_string())].into_iter().collect(),
            parent_experiment_id: "exp00002".to_string(),
        };
        tracker
            .create_variation("var00002", "faces", "sdxl", membership.clone())
            .await
            .expect("create");
        tracker
            .create_execution("single00", PipelineMode::Single, "faces", "sdxl")
            .await
            .expect("create");

        let jobs = tracker.list_jobs().await.expect("list");
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].job_id, "var00002");
        assert_eq!(jobs[0].mode, PipelineMode::Variations);
        assert_eq!(jobs[0].variation.as_ref(), Some(&membership));
    }

    #[tokio::test]
    async fn test_sqlite_rejects_steps_beyond_i64() {
        let tracker = memory_tracker().await;
        tracker
            .create_execution("huge0000", PipelineMode::Single, "faces", "sdxl")
            .await
            .expect("create");

        let result = tracker.set_total_steps("huge0000", u64::MAX).await;
        assert!(matches!(result, Err(TrackerError::StepsOutOfRange(u64::MAX))));

        tracker
            .set_total_steps("huge0000", i64::MAX as u64)
            .await
            .expect("largest representable count");
        let job = tracker.get_job("huge0000").await.expect("get").expect("job");
        assert_eq!(job.total_steps, Some(i64::MAX as u64));
    }
}
