//! Function grader for function-implementation tasks.
//!
//! The task prompt is a function stub written into an isolated workspace
//! file; the agent edits it in place. Grading runs a scorer registered for
//! the task ahead of time - scorers are plain Rust callables resolved at
//! configuration time, keyed by task id.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::model::Task;

use super::{GradeResult, Grader, GraderError, SOLUTION_FILE};

/// Verdict from a scorer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Pass,
    Fail,
    /// Functionally correct but with a security problem.
    Insecure,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pass => write!(f, "PASS"),
            Self::Fail => write!(f, "FAIL"),
            Self::Insecure => write!(f, "INSECURE"),
        }
    }
}

/// Score for one level of checks (e.g. basic correctness, edge cases,
/// security), contributing `weight * passed/total` to the overall score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelScore {
    pub name: String,
    pub weight: f64,
    pub passed: u32,
    pub total: u32,
}

impl LevelScore {
    pub fn new(name: impl Into<String>, weight: f64, passed: u32, total: u32) -> Self {
        Self {
            name: name.into(),
            weight,
            passed,
            total,
        }
    }

    fn ratio(&self) -> f64 {
        if self.total > 0 {
            self.passed as f64 / self.total as f64
        } else {
            0.0
        }
    }
}

/// Level-weighted report produced by a scorer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScorerReport {
    pub levels: Vec<LevelScore>,
    pub verdict: Verdict,
}

impl ScorerReport {
    /// Weighted score in [0, 1]; levels without tests are skipped.
    pub fn weighted_score(&self) -> f64 {
        let mut weight_sum = 0.0;
        let mut score = 0.0;
        for level in self.levels.iter().filter(|l| l.total > 0) {
            weight_sum += level.weight;
            score += level.weight * level.ratio();
        }
        if weight_sum > 0.0 {
            score / weight_sum
        } else {
            0.0
        }
    }

    pub fn tests_passed(&self) -> u32 {
        self.levels.iter().map(|l| l.passed).sum()
    }

    pub fn tests_total(&self) -> u32 {
        self.levels.iter().map(|l| l.total).sum()
    }
}

/// A caller-supplied scoring function for a task.
///
/// Receives the solution source and the target function name; returns the
/// level-weighted report. Errors become failed grades, never panics.
pub trait Scorer: Send + Sync {
    fn score(&self, solution: &str, function_name: &str) -> Result<ScorerReport, String>;
}

impl<F> Scorer for F
where
    F: Fn(&str, &str) -> Result<ScorerReport, String> + Send + Sync,
{
    fn score(&self, solution: &str, function_name: &str) -> Result<ScorerReport, String> {
        self(solution, function_name)
    }
}

/// Grader for function-implementation tasks.
pub struct FunctionGrader {
    keep_workspace: bool,
    scorers: HashMap<String, Arc<dyn Scorer>>,
    /// Active workspaces and the original stub, keyed by task id.
    task_dirs: Mutex<HashMap<String, PathBuf>>,
    stubs: Mutex<HashMap<String, String>>,
}

impl FunctionGrader {
    pub fn new() -> Self {
        Self {
            keep_workspace: false,
            scorers: HashMap::new(),
            task_dirs: Mutex::new(HashMap::new()),
            stubs: Mutex::new(HashMap::new()),
        }
    }

    /// Keeps workspaces after grading.
    pub fn with_keep_workspace(mut self, keep: bool) -> Self {
        self.keep_workspace = keep;
        self
    }

    /// Registers a scoring function for a task. Must happen before the
    /// batch runs; there is no runtime code loading.
    pub fn register_scorer(&mut self, task_id: impl Into<String>, scorer: Arc<dyn Scorer>) {
        self.scorers.insert(task_id.into(), scorer);
    }

    /// Extracts the target function name from the stub.
    fn extract_function_name(stub: &str) -> String {
        // def/fn/function covers the stub languages tasks actually use.
        Regex::new(r"(?:def|fn|function)\s+([A-Za-z_][A-Za-z0-9_]*)\s*\(")
            .ok()
            .and_then(|re| {
                re.captures(stub)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_string())
            })
            .unwrap_or_else(|| "solution".to_string())
    }

    fn defines_function(solution: &str, name: &str) -> bool {
        let escaped = regex::escape(name);
        Regex::new(&format!(r"(?:def|fn|function)\s+{}\s*\(", escaped))
            .map(|re| re.is_match(solution))
            .unwrap_or(false)
    }
}

impl Default for FunctionGrader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Grader for FunctionGrader {
    /// Creates an isolated workspace holding the function stub.
    async fn setup(&self, task: &Task) -> Result<Option<PathBuf>, GraderError> {
        let task_dir = std::env::temp_dir().join(format!(
            "condforge-fn-{}-{}",
            task.id,
            Uuid::new_v4().simple()
        ));
        tokio::fs::create_dir_all(&task_dir).await?;
        tokio::fs::write(task_dir.join(SOLUTION_FILE), &task.prompt).await?;

        self.stubs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task.id.clone(), task.prompt.clone());
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

        if solution.trim().is_empty() {
            return GradeResult {
                passed: false,
                message: "Empty implementation".to_string(),
                error: Some("No solution provided".to_string()),
                ..Default::default()
            };
        }

        // Keep the workspace file in sync with what gets graded.
        let solution_file = task_dir.join(SOLUTION_FILE);
        let on_disk = tokio::fs::read_to_string(&solution_file).await.ok();
        if on_disk.as_deref() != Some(solution) {
            if let Err(e) = tokio::fs::write(&solution_file, solution).await {
                return GradeResult::failure(format!("Failed to write solution file: {}", e));
            }
        }

        let stub = {
            let stubs = self.stubs.lock().unwrap_or_else(|e| e.into_inner());
            stubs.get(&task.id).cloned().unwrap_or_default()
        };
        let function_name = Self::extract_function_name(&stub);

        if !Self::defines_function(solution, &function_name) {
            return GradeResult::failure(format!(
                "Function '{}' not found in solution",
                function_name
            ));
        }

        let Some(scorer) = self.scorers.get(&task.id) else {
            // No scorer registered: structural check only.
            return GradeResult {
                passed: true,
                score: Some(0.5),
                message: format!(
                    "Function '{}' present; no scorer registered for task '{}'",
                    function_name, task.id
                ),
                ..Default::default()
            };
        };

        let report = match scorer.score(solution, &function_name) {
            Ok(report) => report,
            Err(e) => {
                return GradeResult {
                    passed: false,
                    message: "Scorer failed".to_string(),
                    error: Some(format!("Error grading solution: {}", e)),
                    ..Default::default()
                };
            }
        };

        let weighted = report.weighted_score();
        let passed = report.verdict == Verdict::Pass;
        let total = report.tests_total();
        let tests_passed = report.tests_passed();

        GradeResult {
            passed,
            score: Some(weighted),
            message: format!("{}: score {:.0}%", report.verdict, weighted * 100.0),
            error: None,
            tests_passed,
            tests_failed: total - tests_passed,
            tests_total: total,
            details: serde_json::to_value(&report).unwrap_or_default(),
        }
    }

    async fn teardown(&self, task: &Task) {
        self.stubs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&task.id);

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

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_task() -> Task {
        Task {
            id: "fn-1".to_string(),
            prompt: "def is_palindrome(s):\n    ...\n".to_string(),
            repo: String::new(),
            base_commit: String::new(),
            fail_to_pass: Vec::new(),
            pass_to_pass: Vec::new(),
            difficulty: "easy".to_string(),
            hints: String::new(),
        }
    }

    fn full_marks(_solution: &str, _name: &str) -> Result<ScorerReport, String> {
        Ok(ScorerReport {
            levels: vec![
                LevelScore::new("basic", 0.5, 4, 4),
                LevelScore::new("edge_cases", 0.3, 3, 3),
                LevelScore::new("security", 0.2, 2, 2),
            ],
            verdict: Verdict::Pass,
        })
    }

    #[test]
    fn test_function_name_extraction() {
        assert_eq!(
            FunctionGrader::extract_function_name("def is_palindrome(s):"),
            "is_palindrome"
        );
        assert_eq!(
            FunctionGrader::extract_function_name("fn parse_header(input: &str)"),
            "parse_header"
        );
        assert_eq!(
            FunctionGrader::extract_function_name("function doThing(x) {"),
            "doThing"
        );
        assert_eq!(FunctionGrader::extract_function_name("no stub here"), "solution");
    }

    #[test]
    fn test_weighted_score() {
        let report = ScorerReport {
            levels: vec![
                LevelScore::new("basic", 0.5, 2, 4),   // 0.5
                LevelScore::new("edge", 0.3, 3, 3),    // 1.0
                LevelScore::new("security", 0.2, 0, 2), // 0.0
            ],
            verdict: Verdict::Fail,
        };
        // (0.5*0.5 + 0.3*1.0 + 0.2*0.0) / 1.0 = 0.55
        assert!((report.weighted_score() - 0.55).abs() < 1e-9);
    }

    #[test]
    fn test_weighted_score_skips_empty_levels() {
        let report = ScorerReport {
            levels: vec![
                LevelScore::new("basic", 0.5, 4, 4),
                LevelScore::new("security", 0.5, 0, 0),
            ],
            verdict: Verdict::Pass,
        };
        assert!((report.weighted_score() - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_setup_writes_stub() {
        let grader = FunctionGrader::new();
        let task = stub_task();

        let workdir = grader.setup(&task).await.unwrap().unwrap();
        let stub = std::fs::read_to_string(workdir.join(SOLUTION_FILE)).unwrap();
        assert!(stub.contains("is_palindrome"));

        grader.teardown(&task).await;
        assert!(!workdir.exists());
    }

    #[tokio::test]
    async fn test_grade_with_registered_scorer() {
        let mut grader = FunctionGrader::new();
        grader.register_scorer("fn-1", Arc::new(full_marks));
        let task = stub_task();

        grader.setup(&task).await.unwrap();
        let result = grader
            .grade("def is_palindrome(s):\n    return s == s[::-1]\n", &task)
            .await;
        grader.teardown(&task).await;

        assert!(result.passed);
        assert_eq!(result.score, Some(1.0));
        assert_eq!(result.tests_total, 9);
        assert_eq!(result.tests_failed, 0);
    }

    #[tokio::test]
    async fn test_grade_missing_function() {
        let mut grader = FunctionGrader::new();
        grader.register_scorer("fn-1", Arc::new(full_marks));
        let task = stub_task();

        grader.setup(&task).await.unwrap();
        let result = grader.grade("def something_else(): pass", &task).await;
        grader.teardown(&task).await;

        assert!(!result.passed);
        assert!(result.error.unwrap().contains("is_palindrome"));
    }

    #[tokio::test]
    async fn test_grade_empty_solution() {
        let grader = FunctionGrader::new();
        let task = stub_task();

        grader.setup(&task).await.unwrap();
        let result = grader.grade("   ", &task).await;
        grader.teardown(&task).await;

        assert!(!result.passed);
        assert!(result.error.unwrap().contains("No solution"));
    }

    #[tokio::test]
    async fn test_scorer_error_becomes_failed_grade() {
        let mut grader = FunctionGrader::new();
        grader.register_scorer(
            "fn-1",
            Arc::new(|_: &str, _: &str| Err::<ScorerReport, String>("scorer blew up".to_string())),
        );
        let task = stub_task();

        grader.setup(&task).await.unwrap();
        let result = grader.grade("def is_palindrome(s): pass", &task).await;
        grader.teardown(&task).await;

        assert!(!result.passed);
        assert!(result.error.unwrap().contains("scorer blew up"));
    }

    #[tokio::test]
    async fn test_insecure_verdict_fails() {
        let mut grader = FunctionGrader::new();
        grader.register_scorer(
            "fn-1",
            Arc::new(|_: &str, _: &str| {
                Ok(ScorerReport {
                    levels: vec![LevelScore::new("security", 1.0, 0, 2)],
                    verdict: Verdict::Insecure,
                })
            }),
        );
        let task = stub_task();

        grader.setup(&task).await.unwrap();
        let result = grader.grade("def is_palindrome(s): pass", &task).await;
        grader.teardown(&task).await;

        assert!(!result.passed);
        assert!(result.message.contains("INSECURE"));
    }

    #[tokio::test]
    async fn test_grade_without_setup() {
        let grader = FunctionGrader::new();
        let result = grader.grade("def f(): pass", &stub_task()).await;
        assert!(!result.passed);
        assert!(result.error.unwrap().contains("setup"));
    }
}
