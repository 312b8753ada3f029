//! External training process driver.
//!
//! [`TrainingLauncher`] runs the configured training command against a
//! generated configuration (`<command> --config_file <path>`), streams its
//! output through a [`ProgressMonitor`], and records the job lifecycle:
//! `TRAINING` on start, then `DONE` or `FAILED` from the exit status alone.

pub mod progress;

pub use progress::{ProgressMonitor, ProgressSnapshot, TrainingPhase, ETA_UNKNOWN};

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::TrainingError;
use crate::pipeline::PipelineConfig;
use crate::tracker::{mark_failed, JobState, JobTracker};

/// Splits process output on `\r` as well as `\n`, so each redraw of a
/// progress bar arrives as its own segment. Empty segments are skipped.
///
/// Partial segments survive a dropped `next_segment` future, which keeps
/// the reader usable as a `select!` branch.
struct OutputSegments<R> {
    reader: R,
    pending: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> OutputSegments<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            pending: Vec::new(),
        }
    }

    async fn next_segment(&mut self) -> std::io::Result<Option<String>> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.take_pending()));
            }

            match available.iter().position(|b| *b == b'\n' || *b == b'\r') {
                Some(end) => {
                    self.pending.extend_from_slice(&available[..end]);
                    self.reader.consume(end + 1);
                    if !self.pending.is_empty() {
                        return Ok(Some(self.take_pending()));
                    }
                }
                None => {
                    let len = available.len();
                    self.pending.extend_from_slice(available);
                    self.reader.consume(len);
                }
            }
        }
    }

    fn take_pending(&mut self) -> String {
        let bytes = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Outcome of one training run.
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub job_id: String,
    pub config_path: PathBuf,
    pub exit_code: i32,
    pub progress: ProgressSnapshot,
    pub duration: Duration,
}

impl TrainingOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Launches the external trainer and tracks its job.
#[derive(Clone)]
pub struct TrainingLauncher {
    command: String,
    tracker: Arc<dyn JobTracker>,
}

impl std::fmt::Debug for TrainingLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainingLauncher")
            .field("command", &self.command)
            .finish_non_exhaustive()
    }
}

impl TrainingLauncher {
    /// Creates a launcher for a whitespace-separated command line.
    pub fn new(command: impl Into<String>, tracker: Arc<dyn JobTracker>) -> Self {
        Self {
            command: command.into(),
            tracker,
        }
    }

    pub fn from_config(config: &PipelineConfig, tracker: Arc<dyn JobTracker>) -> Self {
        Self::new(config.training_command.clone(), tracker)
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    fn build_command(&self, config_path: &Path) -> Result<Command, TrainingError> {
        let mut parts = self.command.split_whitespace();
        let program = parts.next().ok_or(TrainingError::EmptyCommand)?;

        let mut cmd = Command::new(program);
        cmd.args(parts)
            .arg("--config_file")
            .arg(config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }

    /// Runs training for `job_id` and waits for the process to exit.
    ///
    /// `on_progress` is called after every recognised output line.
    ///
    /// # Errors
    ///
    /// Returns `TrainingError` if the configuration is missing or the
    /// process cannot be started; the job is marked `FAILED` in both cases.
    /// A non-zero exit is not an error: it is reported in the outcome.
    pub async fn launch<F>(
        &self,
        job_id: &str,
        config_path: &Path,
        mut on_progress: F,
    ) -> Result<TrainingOutcome, TrainingError>
    where
        F: FnMut(&ProgressSnapshot) + Send,
    {
        let start = Instant::now();
        let tracker = self.tracker.as_ref();

        if !config_path.is_file() {
            let err = TrainingError::ConfigMissing(config_path.display().to_string());
            mark_failed(tracker, job_id, &err.to_string()).await;
            return Err(err);
        }

        let mut cmd = match self.build_command(config_path) {
            Ok(cmd) => cmd,
            Err(e) => {
                mark_failed(tracker, job_id, &e.to_string()).await;
                return Err(e);
            }
        };

        tracker
            .update_status(job_id, JobState::Training, None)
            .await?;
        info!(job_id = %job_id, config = %config_path.display(), command = %self.command, "Starting training");

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let err = TrainingError::SpawnFailed(e.to_string());
                mark_failed(tracker, job_id, &err.to_string()).await;
                return Err(err);
            }
        };

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => {
                let err = TrainingError::SpawnFailed("output streams not captured".to_string());
                mark_failed(tracker, job_id, &err.to_string()).await;
                return Err(err);
            }
        };

        let mut stdout_lines = OutputSegments::new(BufReader::new(stdout));
        let mut stderr_lines = OutputSegments::new(BufReader::new(stderr));
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut monitor = ProgressMonitor::new();
        let mut steps_recorded = false;

        while stdout_open || stderr_open {
            let line = tokio::select! {
                line = stdout_lines.next_segment(), if stdout_open => match line {
                    Ok(Some(l)) => Some(l),
                    Ok(None) => { stdout_open = false; None }
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "Error reading training stdout");
                        stdout_open = false;
                        None
                    }
                },
                line = stderr_lines.next_segment(), if stderr_open => match line {
                    Ok(Some(l)) => Some(l),
                    Ok(None) => { stderr_open = false; None }
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "Error reading training stderr");
                        stderr_open = false;
                        None
                    }
                },
            };

            let Some(line) = line else {
                continue;
            };
            debug!(job_id = %job_id, "[train] {}", line);

            if monitor.observe(&line) {
                if !steps_recorded {
                    if let Some(total) = monitor.total_steps() {
                        steps_recorded = true;
                        if let Err(e) = tracker.set_total_steps(job_id, total).await {
                            warn!(job_id = %job_id, error = %e, "Failed to record total steps");
                        }
                    }
                }
                on_progress(&monitor.snapshot());
            }
        }

        let status = match child.wait().await {
            Ok(status) => status,
            Err(e) => {
                let message = format!("failed to wait for training process: {}", e);
                mark_failed(tracker, job_id, &message).await;
                return Err(TrainingError::Io(e));
            }
        };
        let exit_code = status.code().unwrap_or(-1);
        monitor.finish(exit_code);

        if exit_code == 0 {
            tracker.update_status(job_id, JobState::Done, None).await?;
            info!(job_id = %job_id, elapsed = ?start.elapsed(), "Training finished");
        } else {
            let message = format!("training process exited with code {}", exit_code);
            tracker
                .update_status(job_id, JobState::Failed, Some(&message))
                .await?;
            warn!(job_id = %job_id, exit_code = exit_code, "Training failed");
        }

        Ok(TrainingOutcome {
            job_id: job_id.to_string(),
            config_path: config_path.to_path_buf(),
            exit_code,
            progress: monitor.snapshot(),
            duration: start.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineMode;
    use crate::tracker::MemoryJobTracker;
    use tempfile::TempDir;

    async fn tracker_with_job(job_id: &str) -> Arc<MemoryJobTracker> {
        let tracker = Arc::new(MemoryJobTracker::new());
        tracker
            .create_execution(job_id, PipelineMode::Single, "faces", "sdxl")
            .await
            .expect("create");
        tracker
    }

    fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).expect("write");
        path
    }

    #[tokio::test]
    async fn test_output_segments_split_on_carriage_return() {
        let data: &[u8] = b"loading\r\n1/30 [a]\r15/30 [b]\r30/30 [c]\nsaving";
        let mut segments = OutputSegments::new(BufReader::with_capacity(4, data));

        let mut seen = Vec::new();
        while let Some(segment) = segments.next_segment().await.expect("read") {
            seen.push(segment);
        }
        assert_eq!(seen, vec!["loading", "1/30 [a]", "15/30 [b]", "30/30 [c]", "saving"]);
    }

    #[tokio::test]
    async fn test_missing_config_marks_failed() {
        let dir = TempDir::new().expect("tempdir");
        let tracker = tracker_with_job("job00001").await;
        let launcher = TrainingLauncher::new("true", tracker.clone());

        let err = launcher
            .launch("job00001", &dir.path().join("missing.toml"), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, TrainingError::ConfigMissing(_)));

        let job = tracker.get_job("job00001").await.unwrap().expect("job");
        assert_eq!(job.state, JobState::Failed);
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let config = write(&dir, "job.toml", "job_id = \"job00002\"\n");
        let tracker = tracker_with_job("job00002").await;
        let launcher = TrainingLauncher::new("   ", tracker);

        let err = launcher.launch("job00002", &config, |_| {}).await.unwrap_err();
        assert!(matches!(err, TrainingError::EmptyCommand));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_run_records_done_and_steps() {
        let dir = TempDir::new().expect("tempdir");
        let config = write(&dir, "job.toml", "job_id = \"job00003\"\n");
        let script = write(
            &dir,
            "train.sh",
            "echo 'total optimization steps / steps: 30'\n\
             echo 'steps: 20%|██ | 6/30 [00:18<01:13, 3.07s/it, avr_loss=0.565]' >&2\n\
             exit 0\n",
        );
        let tracker = tracker_with_job("job00003").await;
        let launcher = TrainingLauncher::new(format!("sh {}", script.display()), tracker.clone());

        let mut updates = 0;
        let outcome = launcher
            .launch("job00003", &config, |_| updates += 1)
            .await
            .expect("launch");

        assert!(outcome.success());
        assert_eq!(outcome.progress.phase, TrainingPhase::Completed);
        assert_eq!(outcome.progress.current_step, 6);
        assert_eq!(updates, 2);

        let job = tracker.get_job("job00003").await.unwrap().expect("job");
        assert_eq!(job.state, JobState::Done);
        assert_eq!(job.total_steps, Some(30));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_redrawn_progress_bar_reports_every_update() {
        let dir = TempDir::new().expect("tempdir");
        let config = write(&dir, "job.toml", "job_id = \"job00005\"\n");
        let script = write(
            &dir,
            "train.sh",
            "printf 'steps: 3%%| | 1/30 [00:01<00:29, 1.00s/it, avr_loss=0.9]\\r' >&2\n\
             printf 'steps: 50%%| | 15/30 [00:15<00:15, 1.00s/it, avr_loss=0.4]\\r' >&2\n\
             printf 'steps: 100%%| | 30/30 [00:30<00:00, 1.00s/it, avr_loss=0.1]\\n' >&2\n\
             exit 0\n",
        );
        let tracker = tracker_with_job("job00005").await;
        let launcher = TrainingLauncher::new(format!("sh {}", script.display()), tracker);

        let mut steps = Vec::new();
        let outcome = launcher
            .launch("job00005", &config, |snap| steps.push(snap.current_step))
            .await
            .expect("launch");

        assert_eq!(steps, vec![1, 15, 30]);
        assert_eq!(outcome.progress.current_step, 30);
        assert_eq!(outcome.progress.average_loss, Some(0.1));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_marks_failed() {
        let dir = TempDir::new().expect("tempdir");
        let config = write(&dir, "job.toml", "job_id = \"job00004\"\n");
        let script = write(&dir, "train.sh", "echo 'loading model'\nexit 3\n");
        let tracker = tracker_with_job("job00004").await;
        let launcher = TrainingLauncher::new(format!("sh {}", script.display()), tracker.clone());

        let outcome = launcher
            .launch("job00004", &config, |_| {})
            .await
            .expect("launch");
        assert_eq!(outcome.exit_code, 3);
        assert_eq!(outcome.progress.phase, TrainingPhase::Failed);

        let job = tracker.get_job("job00004").await.unwrap().expect("job");
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(
            job.error_message.as_deref(),
            Some("training process exited with code 3")
        );
    }
}
