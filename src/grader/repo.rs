//! Repository grader for SWE-bench-style tasks.
//!
//! Subprocess-driven, no container required:
//! 1. Shallow-clone the repository at the task's base commit
//! 2. Validate and apply the solution patch
//! 3. Run fail_to_pass tests (should pass after the fix)
//! 4. Run pass_to_pass tests (should still pass)
//!
//! Every subprocess uses an explicit argument vector and an explicit
//! timeout; a timed-out test counts as a failed test.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::model::Task;

use super::{run_command, truncate, GradeResult, Grader, GraderError};

/// Timeout for the initial shallow clone.
const CLONE_TIMEOUT: Duration = Duration::from_secs(300);
/// Timeout for the unshallow fallback fetch, which can take a while.
const UNSHALLOW_TIMEOUT: Duration = Duration::from_secs(600);
/// Timeout for quick git operations (fetch a commit, checkout, apply).
const GIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Grader that clones a repository, applies the solution as a unified
/// diff, and runs the task's ground-truth tests.
pub struct RepoGrader {
    /// Parent directory for per-task checkouts.
    workspace_dir: PathBuf,
    /// Timeout per test subprocess.
    test_timeout: Duration,
    /// Keep checkouts after grading (debugging mode).
    keep_workspace: bool,
    /// Active per-task directories, keyed by task id.
    task_dirs: Mutex<HashMap<String, PathBuf>>,
}

impl RepoGrader {
    /// Creates a grader that clones into the given workspace directory.
    pub fn new(workspace_dir: impl Into<PathBuf>) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
            test_timeout: Duration::from_secs(300),
            keep_workspace: false,
            task_dirs: Mutex::new(HashMap::new()),
        }
    }

    /// Sets the per-test timeout.
    pub fn with_test_timeout(mut self, timeout: Duration) -> Self {
        self.test_timeout = timeout;
        self
    }

    /// Keeps per-task checkouts after grading.
    pub fn with_keep_workspace(mut self, keep: bool) -> Self {
        self.keep_workspace = keep;
        self
    }

    fn task_dir(&self, task: &Task) -> PathBuf {
        self.workspace_dir.join(&task.id)
    }

    /// Best-effort dependency installation. Failures are logged, not fatal.
    async fn install_deps(&self, repo_dir: &PathBuf) {
        let args: &[&str] = if repo_dir.join("pyproject.toml").exists()
            || repo_dir.join("setup.py").exists()
        {
            &["pip", "install", "-e", "."]
        } else if repo_dir.join("requirements.txt").exists() {
            &["pip", "install", "-r", "requirements.txt"]
        } else {
            return;
        };

        let out = run_command("uv", args, repo_dir, CLONE_TIMEOUT).await;
        if !out.success() {
            warn!(
                dir = %repo_dir.display(),
                "Dependency install failed (continuing): {}",
                truncate(&out.stderr, 200)
            );
        }
    }

    /// Validates and applies the solution patch.
    ///
    /// Rejects anything not starting with a diff header, then dry-runs
    /// with `git apply --check` before applying for real.
    async fn apply_solution(&self, solution: &str, repo_dir: &PathBuf) -> Result<(), String> {
        let trimmed = solution.trim_start();
        if !trimmed.starts_with("diff ") && !trimmed.starts_with("---") {
            return Err(
                "Solution does not appear to be a valid git patch. Expected 'diff' or '---' header."
                    .to_string(),
            );
        }

        let patch_file = repo_dir.join("solution.patch");
        tokio::fs::write(&patch_file, solution)
            .await
            .map_err(|e| format!("Failed to write patch file: {}", e))?;

        let check = run_command(
            "git",
            &["apply", "--check", "solution.patch"],
            repo_dir,
            GIT_TIMEOUT,
        )
        .await;
        if !check.success() {
            return Err(format!(
                "git apply --check failed: {}",
                truncate(&check.stderr, 500)
            ));
        }

        let apply = run_command("git", &["apply", "solution.patch"], repo_dir, GIT_TIMEOUT).await;
        if !apply.success() {
            return Err(format!(
                "git apply failed: {}",
                truncate(&apply.stderr, 500)
            ));
        }

        Ok(())
    }

    /// Runs one category of tests, each as its own bounded subprocess.
    async fn run_tests(&self, tests: &[String], repo_dir: &PathBuf) -> TestRunSummary {
        let mut summary = TestRunSummary::default();
        summary.total = tests.len() as u32;

        for test in tests {
            let out = run_command(
                "uv",
                &["run", "pytest", "-xvs", test],
                repo_dir,
                self.test_timeout,
            )
            .await;

            if out.success() {
                summary.passed += 1;
            } else {
                summary.failed += 1;
                summary.failures.push(json!({
                    "test": test,
                    "exit_code": out.exit_code,
                    "timed_out": out.timed_out,
                    "stdout": truncate(&out.stdout, 2000),
                    "stderr": truncate(&out.stderr, 2000),
                }));
            }
            debug!(
                test = %test,
                passed = out.success(),
                timed_out = out.timed_out,
                "Test executed"
            );
        }

        summary
    }
}

#[derive(Debug, Default)]
struct TestRunSummary {
    total: u32,
    passed: u32,
    failed: u32,
    failures: Vec<serde_json::Value>,
}

impl TestRunSummary {
    fn all_passed(&self) -> bool {
        self.failed == 0
    }

    fn to_json(&self) -> serde_json::Value {
        json!({
            "total": self.total,
            "passed": self.passed,
            "failed": self.failed,
            "all_passed": self.all_passed(),
            "failures": self.failures,
        })
    }
}

#[async_trait]
impl Grader for RepoGrader {
    /// Clones the repository at the task's base commit.
    ///
    /// Shallow clone plus a depth-1 fetch of the specific commit; falls
    /// back to a full unshallow fetch when the commit isn't reachable.
    async fn setup(&self, task: &Task) -> Result<Option<PathBuf>, GraderError> {
        if !task.is_repo_task() {
            return Ok(None);
        }

        let task_dir = self.task_dir(task);
        if task_dir.exists() {
            tokio::fs::remove_dir_all(&task_dir).await?;
        }
        tokio::fs::create_dir_all(&self.workspace_dir).await?;

        let repo_url = format!("https://github.com/{}.git", task.repo);
        let dir_str = task_dir.to_string_lossy().to_string();

        info!(task_id = %task.id, repo = %task.repo, "Cloning repository");
        let clone = run_command(
            "git",
            &["clone", "--depth", "1", &repo_url, &dir_str],
            &self.workspace_dir,
            CLONE_TIMEOUT,
        )
        .await;
        if !clone.success() {
            return Err(GraderError::CloneFailed(format!(
                "{}: {}",
                repo_url,
                truncate(&clone.stderr, 500)
            )));
        }

        // Fetch the specific commit (works regardless of clone depth).
        let fetch = run_command(
            "git",
            &["fetch", "--depth", "1", "origin", &task.base_commit],
            &task_dir,
            GIT_TIMEOUT,
        )
        .await;
        if !fetch.success() {
            // Fallback: full history when the targeted fetch isn't enough.
            let unshallow =
                run_command("git", &["fetch", "--unshallow"], &task_dir, UNSHALLOW_TIMEOUT).await;
            if !unshallow.success() {
                return Err(GraderError::CloneFailed(format!(
                    "Failed to fetch {}: {}",
                    task.base_commit,
                    truncate(&unshallow.stderr, 500)
                )));
            }
        }

        let checkout = run_command(
            "git",
            &["checkout", &task.base_commit],
            &task_dir,
            GIT_TIMEOUT,
        )
        .await;
        if !checkout.success() {
            return Err(GraderError::CheckoutFailed(format!(
                "{}: {}",
                task.base_commit,
                truncate(&checkout.stderr, 500)
            )));
        }

        self.install_deps(&task_dir).await;

        self.task_dirs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task.id.clone(), task_dir.clone());

        Ok(Some(task_dir))
    }

    async fn grade(&self, solution: &str, task: &Task) -> GradeResult {
        let task_dir = {
            let dirs = self.task_dirs.lock().unwrap_or_else(|e| e.into_inner());
            dirs.get(&task.id).cloned()
        };
        let Some(task_dir) = task_dir else {
            return GradeResult::failure("Task not set up. Call setup() first.");
        };

        if let Err(error) = self.apply_solution(solution, &task_dir).await {
            return GradeResult {
                passed: false,
                message: "Patch application failed".to_string(),
                error: Some(error),
                ..Default::default()
            };
        }

        let fail_to_pass = self.run_tests(&task.fail_to_pass, &task_dir).await;
        let pass_to_pass = self.run_tests(&task.pass_to_pass, &task_dir).await;

        let passed = fail_to_pass.all_passed() && pass_to_pass.all_passed();
        let total = fail_to_pass.total + pass_to_pass.total;
        let total_passed = fail_to_pass.passed + pass_to_pass.passed;

        let message = format!(
            "fail_to_pass: {}/{} passed; pass_to_pass: {}/{} passed",
            fail_to_pass.passed, fail_to_pass.total, pass_to_pass.passed, pass_to_pass.total
        );
        info!(task_id = %task.id, passed = passed, "{}", message);

        GradeResult {
            passed,
            score: if total > 0 {
                Some(total_passed as f64 / total as f64)
            } else {
                None
            },
            message,
            error: None,
            tests_passed: total_passed,
            tests_failed: total - total_passed,
            tests_total: total,
            details: json!({
                "fail_to_pass": fail_to_pass.to_json(),
                "pass_to_pass": pass_to_pass.to_json(),
            }),
        }
    }

    async fn teardown(&self, task: &Task) {
        if self.keep_workspace {
            return;
        }

        let task_dir = {
            let mut dirs = self.task_dirs.lock().unwrap_or_else(|e| e.into_inner());
            dirs.remove(&task.id)
        };
        if let Some(dir) = task_dir {
            if dir.exists() {
                if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                    warn!(task_id = %task.id, error = %e, "Failed to remove task workspace");
                }
            }
        }
    }
}
