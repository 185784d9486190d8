//! Batch executor: the run-the-experiment use case.
//!
//! Generates runs in deterministic order, skips already-completed ones on
//! resume, executes each against the agent and grader, persists every
//! result durably before yielding it, and finishes by rebuilding the
//! summary from the persisted stream so summary and storage can never
//! diverge.

pub mod iteration;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::agent::{AgentConfig, AgentPort};
use crate::grader::Grader;
use crate::model::{Batch, BatchResults, Run, RunResult};
use crate::stats::PerConditionStatistics;
use crate::storage::{Storage, StorageError};
use crate::trace::{NoopTracer, Tracer};

pub use iteration::{IterationOutcome, StopReason};

/// Errors that abort a batch. Per-run agent/grader failures are not here:
/// they become failed results and the batch continues. Result durability
/// is a correctness requirement, so storage failures are fatal.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Executor tuning knobs.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Timeout for a single agent generation.
    pub agent_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            agent_timeout: Duration::from_secs(600),
        }
    }
}

/// Cooperative cancellation handle.
///
/// Cancelling stops the batch before the next run starts; a run already in
/// flight finishes normally (its subprocesses carry their own timeouts).
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Orchestrates run generation, agent invocation, grading, persistence,
/// and statistics for one batch at a time.
pub struct BatchExecutor {
    agent: Arc<dyn AgentPort>,
    grader: Arc<dyn Grader>,
    /// Lightweight grader used as the iteration pre-check; the external
    /// grader above stays authoritative.
    review_grader: Option<Arc<dyn Grader>>,
    storage: Arc<dyn Storage>,
    tracer: Arc<dyn Tracer>,
    config: ExecutorConfig,
    cancel: CancelFlag,
}

impl BatchExecutor {
    pub fn new(
        agent: Arc<dyn AgentPort>,
        grader: Arc<dyn Grader>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            agent,
            grader,
            review_grader: None,
            storage,
            tracer: Arc::new(NoopTracer),
            config: ExecutorConfig::default(),
            cancel: CancelFlag::new(),
        }
    }

    /// Injects a tracer (defaults to no-op).
    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Injects the internal pre-check grader for iteration strategies.
    pub fn with_review_grader(mut self, grader: Arc<dyn Grader>) -> Self {
        self.review_grader = Some(grader);
        self
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Handle for cancelling the batch from another task.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Executes the batch, streaming results as they complete.
    ///
    /// Every yielded result has already been durably persisted. With
    /// `resume`, runs whose identity is already on disk are skipped; the
    /// generator's deterministic ordering makes that well-defined.
    pub fn execute(
        &self,
        batch: Batch,
        resume: bool,
    ) -> impl Stream<Item = Result<RunResult, ExecutorError>> + '_ {
        async_stream::try_stream! {
            let completed: HashSet<_> = if resume {
                self.storage.get_completed_runs(&batch.name).await?
            } else {
                HashSet::new()
            };
            if !completed.is_empty() {
                info!(
                    batch = %batch.name,
                    completed = completed.len(),
                    total = batch.total_runs(),
                    "Resuming batch"
                );
            }

            let mut stats = PerConditionStatistics::new();
            let mut batch_span = self.tracer.span(
                "experiment_batch",
                &[
                    ("batch_name", batch.name.clone()),
                    ("total_runs", batch.total_runs().to_string()),
                    ("model", batch.model.clone()),
                ],
            );

            for run in batch.generate_runs() {
                if completed.contains(&run.identity()) {
                    debug!(run = %run.identity(), "Skipping completed run");
                    continue;
                }
                if self.cancel.is_cancelled() {
                    warn!(batch = %batch.name, "Batch cancelled; stopping before next run");
                    break;
                }

                let result = self.execute_run(run, &batch).await;

                // Persist before yielding; a write failure aborts the batch.
                self.storage.append_result(&batch.name, &result).await?;
                stats.update(&result);

                yield result;
            }

            // The summary always reflects exactly what is on disk, even
            // after a crash-and-resume: rebuild it from the stream.
            let mut summary = BatchResults::new(&batch.name);
            {
                let mut persisted = self.storage.stream_results(&batch.name);
                while let Some(result) = persisted.next().await {
                    summary.add_result(&result?);
                }
            }
            self.storage.save_summary(&batch.name, &summary).await?;
            batch_span.set_attribute("completed_runs", summary.completed_runs.to_string());
            batch_span.set_attribute("passed_runs", summary.passed_runs.to_string());

            for (name, condition_stats) in &stats.by_condition {
                info!(
                    condition = %name,
                    pass_rate = condition_stats.pass_rate(),
                    avg_tokens = condition_stats.avg_tokens(),
                    avg_iterations = condition_stats.avg_iterations(),
                    "Condition statistics"
                );
            }
        }
    }

    /// Executes a single run. Never fails: agent and grader problems are
    /// folded into a failed `RunResult` so one bad run cannot abort the
    /// batch.
    async fn execute_run(&self, mut run: Run, batch: &Batch) -> RunResult {
        run.start();
        let started = Instant::now();

        let mut span = self.tracer.span(
            "experiment_run",
            &[
                ("task_id", run.task_id.clone()),
                ("condition", run.condition_name.clone()),
                ("attempt", run.attempt.to_string()),
            ],
        );
        let trace_id = span.trace_id();

        let (task, condition) = match (
            batch.get_task(&run.task_id),
            batch.get_condition(&run.condition_name),
        ) {
            (Some(task), Some(condition)) => (task, condition),
            _ => {
                let message = format!("Missing task or condition for run {}", run.identity());
                span.record_error(&message);
                let mut result = run.fail(message);
                result.trace_id = trace_id;
                return result;
            }
        };

        // Workspace first: file-persistence iteration and function grading
        // need it in place while the agent works.
        let workdir = match self.grader.setup(task).await {
            Ok(workdir) => workdir,
            Err(e) => {
                let message = format!("Grader setup failed: {}", e);
                span.record_error(&message);
                self.grader.teardown(task).await;
                let mut result = run.fail(message);
                result.trace_id = trace_id;
                result.duration_ms = started.elapsed().as_millis() as u64;
                return result;
            }
        };

        let mut agent_config = AgentConfig::new(batch.model.clone())
            .with_system_prompt(condition.prompt.clone())
            .with_timeout(self.config.agent_timeout);
        if let Some(ref dir) = workdir {
            agent_config = agent_config.with_working_dir(dir);
        }

        let outcome = iteration::drive(
            self.agent.as_ref(),
            self.review_grader.as_deref(),
            task,
            &batch.iteration,
            &agent_config,
        )
        .await;

        let result = match outcome {
            Ok(outcome) => {
                let grade = self.grader.grade(&outcome.solution, task).await;

                span.set_attribute("passed", grade.passed.to_string());
                span.set_attribute("iterations", outcome.iterations_used.to_string());
                span.set_attribute(
                    "tokens",
                    (outcome.tokens_input + outcome.tokens_output).to_string(),
                );

                let result = RunResult {
                    task_id: run.task_id.clone(),
                    condition_name: run.condition_name.clone(),
                    attempt: run.attempt,
                    passed: grade.passed,
                    score: grade.score,
                    iterations_used: outcome.iterations_used,
                    tokens_input: outcome.tokens_input,
                    tokens_output: outcome.tokens_output,
                    duration_ms: started.elapsed().as_millis() as u64,
                    error: grade.error.clone(),
                    trace_id: trace_id.clone(),
                    timestamp: Utc::now().to_rfc3339(),
                };
                run.complete(result.clone());
                result
            }
            Err(e) => {
                let message = format!("Agent invocation failed: {}", e);
                span.record_error(&message);
                let mut result = run.fail(message);
                result.trace_id = trace_id.clone();
                result.duration_ms = started.elapsed().as_millis() as u64;
                result
            }
        };

        // Teardown is always attempted, pass or fail.
        self.grader.teardown(task).await;

        debug!(
            run = %result.identity(),
            passed = result.passed,
            duration_ms = result.duration_ms,
            "Run finished"
        );

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MockAgentAdapter;
    use crate::grader::MockGrader;
    use crate::model::{Condition, ConditionType, IterationConfig, Task};
    use crate::storage::StreamingFileAdapter;
    use tempfile::TempDir;

    fn make_batch(name: &str, tasks: usize, conditions: usize, runs: u32) -> Batch {
        Batch {
            name: name.to_string(),
            tasks: (0..tasks)
                .map(|i| Task {
                    id: format!("task-{}", i),
                    prompt: "solve".to_string(),
                    repo: String::new(),
                    base_commit: String::new(),
                    fail_to_pass: Vec::new(),
                    pass_to_pass: Vec::new(),
                    difficulty: "easy".to_string(),
                    hints: String::new(),
                })
                .collect(),
            conditions: (0..conditions)
                .map(|i| Condition {
                    name: format!("cond-{}", i),
                    condition_type: ConditionType::Baseline,
                    prompt: "be careful".to_string(),
                    description: String::new(),
                    style: None,
                })
                .collect(),
            runs_per_condition: runs,
            model: "test-model".to_string(),
            iteration: IterationConfig::default(),
            description: String::new(),
            hypothesis: String::new(),
        }
    }

    fn make_executor(results_dir: &TempDir, agent: MockAgentAdapter, grader: MockGrader) -> BatchExecutor {
        BatchExecutor::new(
            Arc::new(agent),
            Arc::new(grader),
            Arc::new(StreamingFileAdapter::new(results_dir.path())),
        )
    }

    async fn collect(
        executor: &BatchExecutor,
        batch: Batch,
        resume: bool,
    ) -> Vec<RunResult> {
        let stream = executor.execute(batch, resume);
        futures::pin_mut!(stream);
        let mut results = Vec::new();
        while let Some(item) = stream.next().await {
            results.push(item.expect("storage should not fail in tests"));
        }
        results
    }

    #[tokio::test]
    async fn test_executes_full_cross_product() {
        let dir = TempDir::new().unwrap();
        let executor = make_executor(&dir, MockAgentAdapter::always("x"), MockGrader::always_pass());

        let results = collect(&executor, make_batch("b", 2, 2, 3), false).await;
        assert_eq!(results.len(), 12);
        assert!(results.iter().all(|r| r.passed));

        let identities: HashSet<_> = results.iter().map(|r| r.identity()).collect();
        assert_eq!(identities.len(), 12);
    }

    #[tokio::test]
    async fn test_agent_failure_does_not_abort_batch() {
        let dir = TempDir::new().unwrap();
        let executor = make_executor(&dir, MockAgentAdapter::failing("down"), MockGrader::always_pass());

        let results = collect(&executor, make_batch("b", 1, 1, 3), false).await;
        assert_eq!(results.len(), 3);
        for result in &results {
            assert!(!result.passed);
            assert!(result.error.as_ref().unwrap().contains("down"));
        }
    }

    #[tokio::test]
    async fn test_cancellation_stops_before_next_run() {
        let dir = TempDir::new().unwrap();
        let executor = make_executor(&dir, MockAgentAdapter::always("x"), MockGrader::always_pass());

        executor.cancel_flag().cancel();
        let results = collect(&executor, make_batch("b", 2, 2, 2), false).await;
        assert!(results.is_empty());

        // Summary still written, reflecting the (empty) persisted stream.
        let storage = StreamingFileAdapter::new(dir.path());
        assert!(storage.summary_path("b").exists());
    }

    #[tokio::test]
    async fn test_summary_matches_persisted_stream() {
        let dir = TempDir::new().unwrap();
        let executor = make_executor(&dir, MockAgentAdapter::always("x"), MockGrader::always_pass());

        let results = collect(&executor, make_batch("b", 2, 1, 2), false).await;
        assert_eq!(results.len(), 4);

        let storage = StreamingFileAdapter::new(dir.path());
        let summary: BatchResults = serde_json::from_str(
            &std::fs::read_to_string(storage.summary_path("b")).unwrap(),
        )
        .unwrap();
        assert_eq!(summary.completed_runs, 4);
        assert_eq!(summary.passed_runs, 4);
    }

    #[tokio::test]
    async fn test_resume_skips_completed_identities() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(StreamingFileAdapter::new(dir.path()));
        let batch = make_batch("b", 2, 1, 2);

        // Simulate a crashed batch: two results already on disk.
        let pre_existing: Vec<RunResult> = {
            let executor = BatchExecutor::new(
                Arc::new(MockAgentAdapter::always("x")),
                Arc::new(MockGrader::always_pass()),
                storage.clone(),
            );
            let mut first_two = Vec::new();
            for run in batch.generate_runs().take(2) {
                let result = executor.execute_run(run, &batch).await;
                storage.append_result(&batch.name, &result).await.unwrap();
                first_two.push(result);
            }
            first_two
        };
        assert_eq!(pre_existing.len(), 2);

        let executor = BatchExecutor::new(
            Arc::new(MockAgentAdapter::always("x")),
            Arc::new(MockGrader::always_pass()),
            storage.clone(),
        );
        let resumed = collect(&executor, batch.clone(), true).await;
        assert_eq!(resumed.len(), 2);

        // No duplicates, no gaps: N unique identities on disk.
        let completed = storage.get_completed_runs("b").await.unwrap();
        assert_eq!(completed.len() as u64, batch.total_runs());

        let expected: HashSet<_> = batch.generate_runs().map(|r| r.identity()).collect();
        assert_eq!(completed, expected);
    }

    #[tokio::test]
    async fn test_self_review_wiring_through_executor() {
        let dir = TempDir::new().unwrap();
        let mut batch = make_batch("b", 1, 1, 1);
        batch.iteration = IterationConfig {
            strategy: crate::model::IterationStrategy::SelfReview,
            max_iterations: 4,
            review_prompt: "Check again.".to_string(),
        };

        let agent = MockAgentAdapter::scripted(vec![
            "draft".to_string(),
            "final CORRECT version".to_string(),
        ]);
        let executor = BatchExecutor::new(
            Arc::new(agent),
            Arc::new(MockGrader::pattern("CORRECT").unwrap()),
            Arc::new(StreamingFileAdapter::new(dir.path())),
        )
        .with_review_grader(Arc::new(MockGrader::pattern("CORRECT").unwrap()));

        let results = collect(&executor, batch, false).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].passed);
        assert_eq!(results[0].iterations_used, 2);
    }

    #[tokio::test]
    async fn test_results_persisted_in_execution_order() {
        let dir = TempDir::new().unwrap();
        let executor = make_executor(&dir, MockAgentAdapter::always("x"), MockGrader::always_pass());
        let batch = make_batch("b", 1, 2, 2);

        let yielded = collect(&executor, batch, false).await;

        let storage = StreamingFileAdapter::new(dir.path());
        let persisted: Vec<RunResult> = storage
            .stream_results("b")
            .map(|r| r.unwrap())
            .collect()
            .await;

        let yielded_ids: Vec<_> = yielded.iter().map(|r| r.identity()).collect();
        let persisted_ids: Vec<_> = persisted.iter().map(|r| r.identity()).collect();
        assert_eq!(yielded_ids, persisted_ids);
    }
}
