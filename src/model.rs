//! Domain model for experiment batches.
//!
//! Core concepts:
//! - `Condition`: the independent variable (a prompting strategy)
//! - `Task`: a problem to solve
//! - `Batch`: an executable configuration of tasks x conditions x attempts
//! - `Run`: a single task + condition + attempt
//! - `RunResult`: the outcome of a Run

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Type of experimental condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    /// Control - no special prompting.
    Baseline,
    /// WHAT + WHY + CONSTRAINTS.
    Motivation,
    /// WHAT + WHY + CONSTRAINTS + HOW.
    Mandate,
}

impl Default for ConditionType {
    fn default() -> Self {
        Self::Baseline
    }
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Baseline => write!(f, "baseline"),
            Self::Motivation => write!(f, "motivation"),
            Self::Mandate => write!(f, "mandate"),
        }
    }
}

impl std::str::FromStr for ConditionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "baseline" => Ok(Self::Baseline),
            "motivation" => Ok(Self::Motivation),
            "mandate" => Ok(Self::Mandate),
            other => Err(format!("Unknown condition type: {}", other)),
        }
    }
}

/// Status of a Run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// How the agent iterates on solutions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IterationStrategy {
    /// Single shot.
    #[serde(rename = "none")]
    None,
    /// The agent reviews its own work in the same conversational context.
    #[serde(rename = "self-review")]
    SelfReview,
    /// Fresh agent session per iteration; the harness feeds test failures
    /// back through a shared solution file.
    #[serde(rename = "test-feedback")]
    TestFeedback,
}

impl Default for IterationStrategy {
    fn default() -> Self {
        Self::None
    }
}

impl std::str::FromStr for IterationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "self-review" | "self_review" => Ok(Self::SelfReview),
            "test-feedback" | "test_feedback" => Ok(Self::TestFeedback),
            other => Err(format!("Unknown iteration strategy: {}", other)),
        }
    }
}

/// Configuration for iteration behavior. Immutable value object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationConfig {
    #[serde(default)]
    pub strategy: IterationStrategy,
    /// Maximum attempts the agent gets per run. Always at least 1.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_review_prompt")]
    pub review_prompt: String,
}

fn default_max_iterations() -> u32 {
    1
}

fn default_review_prompt() -> String {
    "Review your solution for correctness and edge cases.".to_string()
}

impl Default for IterationConfig {
    fn default() -> Self {
        Self {
            strategy: IterationStrategy::None,
            max_iterations: default_max_iterations(),
            review_prompt: default_review_prompt(),
        }
    }
}

/// An experimental condition (the independent variable). Immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub name: String,
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    /// Agent framing, used as the system prompt for every run.
    pub prompt: String,
    #[serde(default)]
    pub description: String,
    /// Optional style tag, e.g. "template", "structure", "role".
    #[serde(default)]
    pub style: Option<String>,
}

impl Condition {
    pub fn is_baseline(&self) -> bool {
        self.condition_type == ConditionType::Baseline
    }

    pub fn is_mandate(&self) -> bool {
        self.condition_type == ConditionType::Mandate
    }
}

/// A problem for the agent to solve. Works for SWE-bench-style repository
/// tasks as well as plain function-implementation tasks. Immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// The problem statement.
    pub prompt: String,

    /// Repository coordinates (empty for non-repository tasks).
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub base_commit: String,

    /// Tests that should pass after the fix, in order.
    #[serde(default)]
    pub fail_to_pass: Vec<String>,
    /// Tests that should keep passing, in order.
    #[serde(default)]
    pub pass_to_pass: Vec<String>,

    #[serde(default = "default_difficulty")]
    pub difficulty: String,
    #[serde(default)]
    pub hints: String,
}

fn default_difficulty() -> String {
    "medium".to_string()
}

impl Task {
    /// True when the task carries repository coordinates.
    pub fn is_repo_task(&self) -> bool {
        !self.repo.is_empty() && !self.base_commit.is_empty()
    }
}

/// Unique identity of a Run, used for deduplication and resumption.
///
/// Equality and hashing are structural: two identities with the same
/// fields are the same run, regardless of where they came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunIdentity {
    pub task_id: String,
    pub condition_name: String,
    pub attempt: u32,
}

impl std::fmt::Display for RunIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.task_id, self.condition_name, self.attempt)
    }
}

/// The outcome of a single Run. Immutable value object; this is the only
/// record that gets persisted, one per completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub task_id: String,
    pub condition_name: String,
    pub attempt: u32,

    pub passed: bool,
    /// Graded score in [0, 1], when the grader produced one.
    #[serde(default)]
    pub score: Option<f64>,

    #[serde(default)]
    pub iterations_used: u32,
    #[serde(default)]
    pub tokens_input: u64,
    #[serde(default)]
    pub tokens_output: u64,
    #[serde(default)]
    pub duration_ms: u64,

    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,

    /// RFC 3339 completion timestamp.
    pub timestamp: String,
}

impl RunResult {
    pub fn total_tokens(&self) -> u64 {
        self.tokens_input + self.tokens_output
    }

    pub fn identity(&self) -> RunIdentity {
        RunIdentity {
            task_id: self.task_id.clone(),
            condition_name: self.condition_name.clone(),
            attempt: self.attempt,
        }
    }
}

/// A single execution of one task under one condition.
///
/// The atomic unit of experimentation: has identity and a lifecycle
/// (pending -> running -> completed | failed). Never persisted directly;
/// only its terminal `RunResult` is.
#[derive(Debug, Clone)]
pub struct Run {
    pub task_id: String,
    pub condition_name: String,
    pub attempt: u32,

    pub status: RunStatus,
    pub result: Option<RunResult>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(task_id: impl Into<String>, condition_name: impl Into<String>, attempt: u32) -> Self {
        Self {
            task_id: task_id.into(),
            condition_name: condition_name.into(),
            attempt,
            status: RunStatus::Pending,
            result: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn identity(&self) -> RunIdentity {
        RunIdentity {
            task_id: self.task_id.clone(),
            condition_name: self.condition_name.clone(),
            attempt: self.attempt,
        }
    }

    /// Marks the run as started.
    pub fn start(&mut self) {
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Marks the run as completed with a result.
    pub fn complete(&mut self, result: RunResult) {
        self.status = RunStatus::Completed;
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
    }

    /// Marks the run as failed, synthesizing and returning a failed result.
    pub fn fail(&mut self, error: impl Into<String>) -> RunResult {
        self.status = RunStatus::Failed;
        let result = RunResult {
            task_id: self.task_id.clone(),
            condition_name: self.condition_name.clone(),
            attempt: self.attempt,
            passed: false,
            score: None,
            iterations_used: 0,
            tokens_input: 0,
            tokens_output: 0,
            duration_ms: 0,
            error: Some(error.into()),
            trace_id: None,
            timestamp: Utc::now().to_rfc3339(),
        };
        self.result = Some(result.clone());
        self.completed_at = Some(Utc::now());
        result
    }
}

/// An executable experiment configuration.
///
/// Combines tasks, conditions, and run parameters into an executable unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub name: String,
    pub tasks: Vec<Task>,
    pub conditions: Vec<Condition>,
    #[serde(default = "default_runs_per_condition")]
    pub runs_per_condition: u32,

    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub iteration: IterationConfig,

    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub hypothesis: String,
}

fn default_runs_per_condition() -> u32 {
    5
}

fn default_model() -> String {
    "sonnet".to_string()
}

impl Batch {
    /// Total number of runs in this batch.
    pub fn total_runs(&self) -> u64 {
        self.tasks.len() as u64 * self.conditions.len() as u64 * self.runs_per_condition as u64
    }

    /// Generates runs lazily in deterministic order: tasks, then
    /// conditions, then attempt 1..=runs_per_condition.
    ///
    /// Re-invoking from the start always yields the same sequence, which is
    /// what makes resumption well-defined. Filtering out completed runs is
    /// the executor's job, not the generator's.
    pub fn generate_runs(&self) -> impl Iterator<Item = Run> + '_ {
        self.tasks.iter().flat_map(move |task| {
            self.conditions.iter().flat_map(move |condition| {
                (1..=self.runs_per_condition)
                    .map(move |attempt| Run::new(&task.id, &condition.name, attempt))
            })
        })
    }

    pub fn get_task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn get_condition(&self, name: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.name == name)
    }
}

/// Summary statistics for a single condition, aggregated online.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConditionSummary {
    pub condition_name: String,
    pub total_runs: u64,
    pub passed: u64,
    pub failed: u64,

    pub total_tokens: u64,
    pub total_iterations: u64,
    pub total_duration_ms: u64,
}

impl ConditionSummary {
    pub fn new(condition_name: impl Into<String>) -> Self {
        Self {
            condition_name: condition_name.into(),
            ..Default::default()
        }
    }

    pub fn pass_rate(&self) -> f64 {
        if self.total_runs > 0 {
            self.passed as f64 / self.total_runs as f64
        } else {
            0.0
        }
    }

    pub fn avg_tokens(&self) -> f64 {
        if self.total_runs > 0 {
            self.total_tokens as f64 / self.total_runs as f64
        } else {
            0.0
        }
    }

    pub fn avg_iterations(&self) -> f64 {
        if self.total_runs > 0 {
            self.total_iterations as f64 / self.total_runs as f64
        } else {
            0.0
        }
    }

    pub fn avg_duration_ms(&self) -> f64 {
        if self.total_runs > 0 {
            self.total_duration_ms as f64 / self.total_runs as f64
        } else {
            0.0
        }
    }
}

/// Aggregated results for a batch run.
///
/// Built incrementally from a stream of `RunResult` - never holds the full
/// result list, and can be rebuilt by replaying the persisted stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResults {
    pub batch_name: String,
    pub timestamp: String,

    pub total_runs: u64,
    pub completed_runs: u64,
    pub passed_runs: u64,

    /// Ordered map for stable summary output.
    pub by_condition: std::collections::BTreeMap<String, ConditionSummary>,
}

impl BatchResults {
    pub fn new(batch_name: impl Into<String>) -> Self {
        Self {
            batch_name: batch_name.into(),
            timestamp: Utc::now().to_rfc3339(),
            total_runs: 0,
            completed_runs: 0,
            passed_runs: 0,
            by_condition: std::collections::BTreeMap::new(),
        }
    }

    /// Adds a result to the summary (online aggregation).
    pub fn add_result(&mut self, result: &RunResult) {
        self.total_runs += 1;
        self.completed_runs += 1;
        if result.passed {
            self.passed_runs += 1;
        }

        let summary = self
            .by_condition
            .entry(result.condition_name.clone())
            .or_insert_with(|| ConditionSummary::new(&result.condition_name));

        summary.total_runs += 1;
        if result.passed {
            summary.passed += 1;
        } else {
            summary.failed += 1;
        }
        summary.total_tokens += result.total_tokens();
        summary.total_iterations += result.iterations_used as u64;
        summary.total_duration_ms += result.duration_ms;
    }

    pub fn pass_rate(&self) -> f64 {
        if self.completed_runs > 0 {
            self.passed_runs as f64 / self.completed_runs as f64
        } else {
            0.0
        }
    }
}
