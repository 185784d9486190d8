//! Grader port and graders.
//!
//! A grader evaluates a produced solution for a task: `setup` prepares an
//! isolated per-task working directory, `grade` produces a `GradeResult`,
//! `teardown` cleans up. Graders fold evaluation problems (bad patch,
//! failing tests, scorer errors) into the result; only setup can fail.

pub mod function;
pub mod mock;
pub mod repo;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::model::Task;

pub use function::{FunctionGrader, LevelScore, Scorer, ScorerReport, Verdict};
pub use mock::{MockGrader, MockStrategy};
pub use repo::RepoGrader;

/// Name of the shared solution file inside a grader workspace. The
/// file-persistence iteration strategy and the function grader agree on it.
pub const SOLUTION_FILE: &str = "solution.py";

/// Result of grading a solution. Immutable value object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GradeResult {
    pub passed: bool,
    /// Optional score in [0, 1] for graded evaluations.
    pub score: Option<f64>,

    pub message: String,
    /// Set when grading itself went wrong (not just a failing solution).
    pub error: Option<String>,

    pub tests_passed: u32,
    pub tests_failed: u32,
    pub tests_total: u32,

    /// Free-form detail for debugging.
    #[serde(default)]
    pub details: serde_json::Value,
}

impl GradeResult {
    /// A passing result with a message.
    pub fn pass(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            score: Some(1.0),
            message: message.into(),
            ..Default::default()
        }
    }

    /// A failing result caused by a grading problem.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            passed: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// True if grading itself failed (not just the solution).
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Short feedback text for iteration loops.
    pub fn feedback(&self) -> String {
        match (&self.error, self.message.is_empty()) {
            (Some(error), true) => error.clone(),
            (Some(error), false) => format!("{} ({})", self.message, error),
            (None, false) => self.message.clone(),
            (None, true) => format!(
                "{} of {} tests passed",
                self.tests_passed, self.tests_total
            ),
        }
    }
}

/// Error type for grader setup.
#[derive(Debug, thiserror::Error)]
pub enum GraderError {
    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("Clone failed: {0}")]
    CloneFailed(String),

    #[error("Checkout failed: {0}")]
    CheckoutFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Port for solution evaluation.
#[async_trait]
pub trait Grader: Send + Sync {
    /// Prepares the environment for grading a task.
    ///
    /// Returns the working directory the agent should execute in, or None
    /// when no special directory is needed.
    async fn setup(&self, task: &Task) -> Result<Option<PathBuf>, GraderError>;

    /// Grades a solution against a task. Evaluation problems are reported
    /// in the result, never as an error.
    async fn grade(&self, solution: &str, task: &Task) -> GradeResult;

    /// Cleans up after grading a task. Best effort.
    async fn teardown(&self, task: &Task);
}

/// Captured output of a bounded subprocess.
#[derive(Debug, Clone)]
pub(crate) struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Runs a command with an explicit argument vector under a timeout.
///
/// Never goes through a shell: the inputs here are test identifiers and
/// commit hashes, and keeping them as argv elements is a correctness
/// property, not just hardening. The child is killed when the timeout
/// expires.
pub(crate) async fn run_command(
    program: &str,
    args: &[&str],
    cwd: &Path,
    timeout: Duration,
) -> CommandOutput {
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(cwd).kill_on_drop(true);

    let result = tokio::time::timeout(timeout, cmd.output()).await;

    match result {
        Ok(Ok(output)) => CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            timed_out: false,
        },
        Ok(Err(e)) => CommandOutput {
            exit_code: -1,
            stdout: String::new(),
            stderr: format!("Failed to run {}: {}", program, e),
            timed_out: false,
        },
        Err(_) => CommandOutput {
            exit_code: -1,
            stdout: String::new(),
            stderr: format!("Command timed out after {}s", timeout.as_secs()),
            timed_out: true,
        },
    }
}

/// Truncates a string for storage in result details.
pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        format!("{}... [truncated]", &s[..end])
    }
}
