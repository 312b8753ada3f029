//! Attended confirmation for destructive steps.
//!
//! Executors only ask when `auto_clean` is off and a dataset already has
//! prepared files. Without a confirmer attached the run is unattended and
//! every question is answered "no".

use std::sync::atomic::{AtomicUsize, Ordering};

use dialoguer::Confirm;
use tracing::warn;

/// Answers yes/no questions on behalf of the operator.
pub trait Confirmer: Send + Sync {
    /// Returns whether the operator accepted `prompt`.
    fn confirm(&self, prompt: &str) -> bool;
}

/// Declines every question.
#[derive(Debug, Clone, Copy, Default)]
pub struct NonInteractive;

impl Confirmer for NonInteractive {
    fn confirm(&self, _prompt: &str) -> bool {
        false
    }
}

/// Accepts every question and counts how often it was asked.
#[derive(Debug, Default)]
pub struct AlwaysConfirm {
    asked: AtomicUsize,
}

impl AlwaysConfirm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of prompts answered so far.
    pub fn asked(&self) -> usize {
        self.asked.load(Ordering::SeqCst)
    }
}

impl Confirmer for AlwaysConfirm {
    fn confirm(&self, _prompt: &str) -> bool {
        self.asked.fetch_add(1, Ordering::SeqCst);
        true
    }
}

/// Asks on the terminal through `dialoguer`.
///
/// A terminal error (no TTY, closed stdin) counts as "no".
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalConfirmer;

impl Confirmer for TerminalConfirmer {
    fn confirm(&self, prompt: &str) -> bool {
        match Confirm::new().with_prompt(prompt).default(false).interact() {
            Ok(answer) => answer,
            Err(e) => {
                warn!(error = %e, "Confirmation prompt failed, treating as declined");
                false
            }
        }
    }
}

/// Prompt text covering every conflicting dataset of one call.
pub fn existing_datasets_prompt(names: &[String]) -> String {
    match names {
        [single] => format!(
            "Dataset '{}' already exists. Delete its prepared files and configs and continue?",
            single
        ),
        _ => format!(
            "{} datasets already exist ({}). Delete their prepared files and configs and continue?",
            names.len(),
            names.join(", ")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_interactive_declines() {
        assert!(!NonInteractive.confirm("continue?"));
    }

    #[test]
    fn test_always_confirm_counts() {
        let confirmer = AlwaysConfirm::new();
        assert!(confirmer.confirm("a"));
        assert!(confirmer.confirm("b"));
        assert_eq!(confirmer.asked(), 2);
    }

    #[test]
    fn test_prompt_lists_all_conflicts() {
        let one = existing_datasets_prompt(&["faces".to_string()]);
        assert!(one.contains("'faces'"));

        let many = existing_datasets_prompt(&["faces".to_string(), "hands".to_string()]);
        assert!(many.starts_with("2 datasets"));
        assert!(many.contains("faces, hands"));
    }
}
