//! Iteration strategy driver.
//!
//! Drives the agent through one run's attempts according to the batch's
//! iteration policy. The state machine is small: start, iterate, stop for
//! one of the reasons in `StopReason`. An unrecoverable agent error
//! terminates the run (never the batch) and is surfaced to the executor.

use tracing::debug;

use crate::agent::{contains_stop_sentinel, AgentConfig, AgentError, AgentPort};
use crate::grader::{Grader, SOLUTION_FILE};
use crate::model::{IterationConfig, IterationStrategy, Task};
use crate::prompt;

/// Why iteration stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Single-shot strategy: exactly one generation.
    SingleShot,
    /// The internal correctness pre-check passed.
    CheckPassed,
    /// The agent signalled completion with a sentinel phrase.
    Sentinel,
    /// max_iterations reached without an early stop.
    Exhausted,
}

/// Terminal state of one run's iteration loop.
#[derive(Debug, Clone)]
pub struct IterationOutcome {
    /// The artifact to grade: response text, or the solution file's
    /// content for the file-persistence strategy.
    pub solution: String,
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub duration_ms: u64,
    pub iterations_used: u32,
    pub stop: StopReason,
}

/// Runs the configured iteration strategy for one task.
///
/// `precheck` is the internal, non-authoritative correctness check used
/// for early stopping; the external grader still produces the final
/// verdict. Correctness means the same thing in both places:
/// `GradeResult::passed`.
pub async fn drive(
    agent: &dyn AgentPort,
    precheck: Option<&dyn Grader>,
    task: &Task,
    iteration: &IterationConfig,
    config: &AgentConfig,
) -> Result<IterationOutcome, AgentError> {
    let task_prompt = prompt::build_task_prompt(task);

    match iteration.strategy {
        IterationStrategy::None => {
            let response = agent.generate(&task_prompt, config).await?;
            Ok(IterationOutcome {
                solution: response.content.clone(),
                tokens_input: response.tokens_input,
                tokens_output: response.tokens_output,
                duration_ms: response.duration_ms,
                iterations_used: 1,
                stop: StopReason::SingleShot,
            })
        }
        IterationStrategy::SelfReview => {
            self_review(agent, precheck, task, iteration, config, &task_prompt).await
        }
        IterationStrategy::TestFeedback => {
            test_feedback(agent, precheck, task, iteration, config).await
        }
    }
}

/// Self-review: one conversational thread, candidate embedded in each
/// review turn, stopped early by the pre-check or a sentinel phrase.
async fn self_review(
    agent: &dyn AgentPort,
    precheck: Option<&dyn Grader>,
    task: &Task,
    iteration: &IterationConfig,
    config: &AgentConfig,
    task_prompt: &str,
) -> Result<IterationOutcome, AgentError> {
    let Some(precheck) = precheck else {
        // No internal check configured: the agent's own sentinel is the
        // only early-stop signal.
        let (response, iterations_used) = agent
            .generate_with_iteration(
                task_prompt,
                config,
                iteration.max_iterations,
                &iteration.review_prompt,
            )
            .await?;
        let stop = if iterations_used < iteration.max_iterations {
            StopReason::Sentinel
        } else {
            StopReason::Exhausted
        };
        return Ok(IterationOutcome {
            solution: response.content.clone(),
            tokens_input: response.tokens_input,
            tokens_output: response.tokens_output,
            duration_ms: response.duration_ms,
            iterations_used,
            stop,
        });
    };

    let mut current = agent.generate(task_prompt, config).await?;
    let mut iterations_used = 1;
    let mut stop = StopReason::Exhausted;

    while iterations_used < iteration.max_iterations {
        let grade = precheck.grade(&current.content, task).await;
        if grade.passed {
            stop = StopReason::CheckPassed;
            break;
        }
        debug!(task_id = %task.id, iteration = iterations_used, "Pre-check failed, reviewing");

        let follow_up = prompt::build_review_prompt(&current.content, &iteration.review_prompt);
        let review = agent.generate(&follow_up, config).await?;
        iterations_used += 1;

        if contains_stop_sentinel(&review.content) {
            // Keep the previous candidate; only account for the usage.
            current.tokens_input += review.tokens_input;
            current.tokens_output += review.tokens_output;
            current.duration_ms += review.duration_ms;
            stop = StopReason::Sentinel;
            break;
        }

        current.absorb(review);
    }

    Ok(IterationOutcome {
        solution: current.content.clone(),
        tokens_input: current.tokens_input,
        tokens_output: current.tokens_output,
        duration_ms: current.duration_ms,
        iterations_used,
        stop,
    })
}

/// Test-feedback with file persistence: every iteration is a fresh agent
/// session; continuity lives in the shared solution file and in the test
/// failures the harness feeds back, not in conversation history.
async fn test_feedback(
    agent: &dyn AgentPort,
    precheck: Option<&dyn Grader>,
    task: &Task,
    iteration: &IterationConfig,
    config: &AgentConfig,
) -> Result<IterationOutcome, AgentError> {
    let solution_file = config
        .working_dir
        .as_ref()
        .map(|dir| dir.join(SOLUTION_FILE));

    let mut tokens_input = 0;
    let mut tokens_output = 0;
    let mut duration_ms = 0;
    let mut iterations_used = 0;
    let mut stop = StopReason::Exhausted;
    let mut solution = String::new();
    let mut feedback = String::new();

    for attempt in 1..=iteration.max_iterations {
        let prompt_text = match &solution_file {
            Some(file) => prompt::build_file_iteration_prompt(task, file, &feedback),
            None => {
                let mut text = prompt::build_task_prompt(task);
                if !feedback.is_empty() {
                    text.push_str(&format!(
                        "\n\n## Test Results From Your Previous Attempt\n\n{}\n",
                        feedback
                    ));
                }
                text
            }
        };

        // Fresh session each iteration; no conversational carry-over.
        let response = agent.generate(&prompt_text, config).await?;
        iterations_used = attempt;
        tokens_input += response.tokens_input;
        tokens_output += response.tokens_output;
        duration_ms += response.duration_ms;

        // The artifact is the file when the workspace has one.
        solution = match &solution_file {
            Some(file) => tokio::fs::read_to_string(file)
                .await
                .unwrap_or_else(|_| response.content.clone()),
            None => response.content.clone(),
        };

        match precheck {
            Some(precheck) => {
                let grade = precheck.grade(&solution, task).await;
                if grade.passed {
                    stop = StopReason::CheckPassed;
                    break;
                }
                feedback = grade.feedback();
                debug!(task_id = %task.id, iteration = attempt, feedback = %feedback, "Feeding back test results");
            }
            None => {
                if contains_stop_sentinel(&response.content) {
                    stop = StopReason::Sentinel;
                    break;
                }
            }
        }
    }

    Ok(IterationOutcome {
        solution,
        tokens_input,
        tokens_output,
        duration_ms,
        iterations_used,
        stop,
    })
}
