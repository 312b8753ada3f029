//! Best-effort progress parsing for training output.
//!
//! [`ProgressMonitor`] is fed one line of the training process's output at
//! a time and keeps a point-in-time view of step, epoch, loss and ETA.
//! Lines that match nothing are ignored; parsing never fails. The monitor
//! is advisory: job state follows the process exit status, not anything
//! parsed here.

use std::collections::VecDeque;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Number of recent step durations averaged for the ETA.
const STEP_WINDOW: usize = 10;

/// Placeholder shown while the ETA cannot be computed.
pub const ETA_UNKNOWN: &str = "--:--:--";

/// Coarse phase of a training run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainingPhase {
    Initializing,
    Preparing,
    Training,
    Saving,
    Completed,
    Failed,
}

impl std::fmt::Display for TrainingPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TrainingPhase::Initializing => "initializing",
            TrainingPhase::Preparing => "preparing",
            TrainingPhase::Training => "training",
            TrainingPhase::Saving => "saving",
            TrainingPhase::Completed => "completed",
            TrainingPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

struct Patterns {
    total_steps: Regex,
    total_epochs: Regex,
    epoch: Regex,
    step_counts: Regex,
    step_rate: Regex,
    loss: Regex,
    preparing: Regex,
    saving: Regex,
}

impl Patterns {
    fn compile() -> Self {
        // Literal patterns; compilation cannot fail.
        let re = |pattern: &str| Regex::new(pattern).expect("Invalid progress pattern");
        Self {
            total_steps: re(r"(?i)total (?:optimization |training )?steps\b[^\d\n]*(\d+)"),
            total_epochs: re(r"(?i)(?:num|total) epochs\b[^\d\n]*(\d+)"),
            epoch: re(r"(?i)^\s*epoch\s+(\d+)\s*/\s*(\d+)"),
            step_counts: re(r"(\d+)/(\d+)\s*\["),
            step_rate: re(r"(\d+(?:\.\d+)?)\s*(s/it|it/s)"),
            loss: re(r"(?:avr_loss|avg_loss|loss)\s*[=:]\s*(-?\d+(?:\.\d+)?(?:[eE][-+]?\d+)?)"),
            preparing: re(r"(?i)\b(?:loading|load|caching|cache|prepar\w*|prepare)\b"),
            saving: re(r"(?i)\bsaving\b"),
        }
    }
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(Patterns::compile)
}

/// Point-in-time view of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub phase: TrainingPhase,
    pub current_step: u64,
    pub total_steps: Option<u64>,
    pub current_epoch: u64,
    pub total_epochs: Option<u64>,
    pub average_loss: Option<f64>,
    /// `current / total * 100`, or 0 while the total is unknown.
    pub percentage: f64,
    /// Mean of the last observed step durations, in seconds.
    pub average_step_seconds: Option<f64>,
    pub eta: Option<Duration>,
    pub elapsed: Duration,
}

impl ProgressSnapshot {
    /// ETA as `HH:MM:SS`, or [`ETA_UNKNOWN`].
    pub fn eta_display(&self) -> String {
        match self.eta {
            Some(eta) => format_hms(eta),
            None => ETA_UNKNOWN.to_string(),
        }
    }

    /// One-line progress summary.
    pub fn render(&self) -> String {
        let total = self
            .total_steps
            .map(|t| t.to_string())
            .unwrap_or_else(|| "?".to_string());
        let loss = self
            .average_loss
            .map(|l| format!(" loss={:.4}", l))
            .unwrap_or_default();
        format!(
            "[{}] step {}/{} ({:.1}%) epoch {}{} eta {}",
            self.phase,
            self.current_step,
            total,
            self.percentage,
            self.current_epoch,
            loss,
            self.eta_display()
        )
    }
}

fn format_hms(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Stateful line parser for one training run.
#[derive(Debug, Clone)]
pub struct ProgressMonitor {
    phase: TrainingPhase,
    current_step: u64,
    total_steps: Option<u64>,
    current_epoch: u64,
    total_epochs: Option<u64>,
    average_loss: Option<f64>,
    step_durations: VecDeque<f64>,
    started_at: Instant,
}

impl Default for ProgressMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressMonitor {
    pub fn new() -> Self {
        Self {
            phase: TrainingPhase::Initializing,
            current_step: 0,
            total_steps: None,
            current_epoch: 0,
            total_epochs: None,
            average_loss: None,
            step_durations: VecDeque::with_capacity(STEP_WINDOW),
            started_at: Instant::now(),
        }
    }

    pub fn phase(&self) -> TrainingPhase {
        self.phase
    }

    pub fn total_steps(&self) -> Option<u64> {
        self.total_steps
    }

    /// Consumes one output line. Returns whether anything was recognised.
    pub fn observe(&mut self, line: &str) -> bool {
        if self.is_finished() {
            return false;
        }

        let p = patterns();
        let mut matched = false;

        if let Some(total) = capture_u64(&p.total_steps, line, 1) {
            self.total_steps = Some(total);
            matched = true;
        }

        if let Some(total) = capture_u64(&p.total_epochs, line, 1) {
            self.total_epochs = Some(total);
            matched = true;
        }

        if let Some(caps) = p.epoch.captures(line) {
            if let Some(current) = caps.get(1).and_then(|m| m.as_str().parse().ok()) {
                self.current_epoch = current;
                matched = true;
            }
            if let Some(total) = caps.get(2).and_then(|m| m.as_str().parse().ok()) {
                self.total_epochs = Some(total);
            }
        }

        if self.observe_step_line(line) {
            matched = true;
        } else if p.saving.is_match(line) {
            self.phase = TrainingPhase::Saving;
            matched = true;
        } else if matches!(
            self.phase,
            TrainingPhase::Initializing | TrainingPhase::Preparing
        ) && p.preparing.is_match(line)
        {
            self.phase = TrainingPhase::Preparing;
            matched = true;
        }

        matched
    }

    fn observe_step_line(&mut self, line: &str) -> bool {
        let p = patterns();
        let Some(caps) = p.step_counts.captures(line) else {
            return false;
        };
        let current = caps.get(1).and_then(|m| m.as_str().parse::<u64>().ok());
        let total = caps.get(2).and_then(|m| m.as_str().parse::<u64>().ok());
        let (Some(current), Some(total)) = (current, total) else {
            return false;
        };

        self.current_step = current;
        if self.total_steps.is_none() && total > 0 {
            self.total_steps = Some(total);
        }
        self.phase = TrainingPhase::Training;

        if let Some(rate) = p.step_rate.captures(line) {
            let value = rate.get(1).and_then(|m| m.as_str().parse::<f64>().ok());
            let seconds = match (value, rate.get(2).map(|m| m.as_str())) {
                (Some(v), Some("s/it")) => Some(v),
                (Some(v), Some("it/s")) if v > 0.0 => Some(1.0 / v),
                _ => None,
            };
            if let Some(seconds) = seconds.filter(|s| s.is_finite() && *s > 0.0) {
                if self.step_durations.len() == STEP_WINDOW {
                    self.step_durations.pop_front();
                }
                self.step_durations.push_back(seconds);
            }
        }

        if let Some(loss) = p
            .loss
            .captures(line)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok())
        {
            self.average_loss = Some(loss);
        }

        true
    }

    /// Records the process exit. Exit status 0 completes the run, anything
    /// else fails it.
    pub fn finish(&mut self, exit_code: i32) {
        self.phase = if exit_code == 0 {
            TrainingPhase::Completed
        } else {
            TrainingPhase::Failed
        };
    }

    fn is_finished(&self) -> bool {
        matches!(self.phase, TrainingPhase::Completed | TrainingPhase::Failed)
    }

    fn average_step_seconds(&self) -> Option<f64> {
        if self.step_durations.is_empty() {
            return None;
        }
        Some(self.step_durations.iter().sum::<f64>() / self.step_durations.len() as f64)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let percentage = match self.total_steps {
            Some(total) if total > 0 => (self.current_step as f64 * 100.0) / total as f64,
            _ => 0.0,
        };
        let average = self.average_step_seconds();
        // An ETA too large for a Duration is reported as unknown.
        let eta = match (self.total_steps, average) {
            (Some(total), Some(avg)) => {
                let remaining = total.saturating_sub(self.current_step);
                Duration::try_from_secs_f64(remaining as f64 * avg).ok()
            }
            _ => None,
        };

        ProgressSnapshot {
            phase: self.phase,
            current_step: self.current_step,
            total_steps: self.total_steps,
            current_epoch: self.current_epoch,
            total_epochs: self.total_epochs,
            average_loss: self.average_loss,
            percentage,
            average_step_seconds: average,
            eta,
            elapsed: self.started_at.elapsed(),
        }
    }
}

fn capture_u64(regex: &Regex, line: &str, group: usize) -> Option<u64> {
    regex
        .captures(line)
        .and_then(|c| c.get(group))
        .and_then(|m| m.as_str().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_line() {
        let mut monitor = ProgressMonitor::new();
        assert!(monitor.observe("steps: 20%|██ | 6/30 [00:18<01:13, 3.07s/it, avr_loss=0.565]"));

        let snap = monitor.snapshot();
        assert_eq!(snap.current_step, 6);
        assert_eq!(snap.total_steps, Some(30));
        assert_eq!(snap.average_loss, Some(0.565));
        assert_eq!(snap.percentage, 20.0);
        assert_eq!(snap.phase, TrainingPhase::Training);

        let eta = snap.eta.expect("eta");
        assert!((eta.as_secs_f64() - 24.0 * 3.07).abs() < 1e-6);
    }

    #[test]
    fn test_header_lines_set_denominators() {
        let mut monitor = ProgressMonitor::new();
        monitor.observe("loading model for process 0/1");
        assert_eq!(monitor.phase(), TrainingPhase::Preparing);

        monitor.observe("  total optimization steps / 学習ステップ数: 1500");
        monitor.observe("  num epochs / epoch数: 10");
        monitor.observe("epoch 3/10");

        let snap = monitor.snapshot();
        assert_eq!(snap.total_steps, Some(1500));
        assert_eq!(snap.total_epochs, Some(10));
        assert_eq!(snap.current_epoch, 3);
        assert_eq!(snap.percentage, 0.0);
        assert_eq!(snap.eta_display(), ETA_UNKNOWN);
    }

    #[test]
    fn test_known_total_not_overridden_by_progress() {
        let mut monitor = ProgressMonitor::new();
        monitor.observe("total optimization steps: 100");
        monitor.observe("steps:   5%| | 5/40 [00:05<00:35, 1.00s/it]");
        assert_eq!(monitor.total_steps(), Some(100));
    }

    #[test]
    fn test_rolling_average_window() {
        let mut monitor = ProgressMonitor::new();
        for step in 1..=10 {
            monitor.observe(&format!("steps: | {}/100 [00:01<00:10, 10.00s/it]", step));
        }
        for step in 11..=20 {
            monitor.observe(&format!("steps: | {}/100 [00:01<00:10, 2.00s/it]", step));
        }
        let snap = monitor.snapshot();
        assert_eq!(snap.average_step_seconds, Some(2.0));
    }

    #[test]
    fn test_iterations_per_second() {
        let mut monitor = ProgressMonitor::new();
        monitor.observe("steps: 50%| | 50/100 [00:10<00:10, 4.00it/s, loss=0.1]");
        let snap = monitor.snapshot();
        assert_eq!(snap.average_step_seconds, Some(0.25));
        assert_eq!(snap.eta_display(), "00:00:12");
    }

    #[test]
    fn test_saving_and_finish() {
        let mut monitor = ProgressMonitor::new();
        monitor.observe("steps: 100%| | 30/30 [01:30<00:00, 3.00s/it]");
        monitor.observe("saving checkpoint: /out/model.safetensors");
        assert_eq!(monitor.phase(), TrainingPhase::Saving);

        monitor.finish(0);
        assert_eq!(monitor.phase(), TrainingPhase::Completed);
        assert!(!monitor.observe("steps: 1/30 [00:01<00:10, 1.00s/it]"));
    }

    #[test]
    fn test_unrepresentable_eta_is_unknown() {
        let mut monitor = ProgressMonitor::new();
        assert!(monitor.observe("steps: 0%| | 1/100000 [00:01<99:99, 999999999999999999999s/it]"));

        let snap = monitor.snapshot();
        assert_eq!(snap.current_step, 1);
        assert!(snap.eta.is_none());
        assert_eq!(snap.eta_display(), ETA_UNKNOWN);
        assert!(snap.render().ends_with(ETA_UNKNOWN));
    }

    #[test]
    fn test_garbage_is_ignored() {
        let mut monitor = ProgressMonitor::new();
        for line in ["", "\u{1b}[2K", "Traceback (most recent call last):", "x/y [", "12/ab ["] {
            assert!(!monitor.observe(line));
        }
        monitor.finish(1);
        assert_eq!(monitor.snapshot().phase, TrainingPhase::Failed);
    }
}
