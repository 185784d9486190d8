//! Agent port and adapters.
//!
//! The language-model call itself is opaque to the engine: an agent takes a
//! prompt plus configuration and returns text with token/duration metadata.
//! Adapters decide how that happens (external CLI agent, scripted mock).

pub mod command;
pub mod mock;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::prompt::build_review_prompt;

pub use command::CommandAgentAdapter;
pub use mock::MockAgentAdapter;

/// Sentinel phrases an agent can emit to signal its solution needs no
/// further iteration.
const STOP_SENTINELS: [&str; 3] = [
    "SOLUTION VERIFIED",
    "SOLUTION_VERIFIED",
    "IMPLEMENTATION CORRECT",
];

/// True when the response text contains an early-stop sentinel.
pub fn contains_stop_sentinel(content: &str) -> bool {
    let upper = content.to_uppercase();
    STOP_SENTINELS.iter().any(|s| upper.contains(s))
}

/// Configuration passed to an agent for one generation.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Model identifier, forwarded verbatim to the adapter.
    pub model: String,
    /// Agent framing; the experiment condition's prompt.
    pub system_prompt: String,
    /// Working directory for tool-using agents.
    pub working_dir: Option<PathBuf>,
    /// Maximum wall-clock time for a single generation.
    pub timeout: Duration,
    /// Environment variables for subprocess-based agents.
    pub env_vars: Vec<(String, String)>,
}

impl AgentConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_prompt: String::new(),
            working_dir: None,
            timeout: Duration::from_secs(600),
            env_vars: Vec::new(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }
}

/// Response from one agent generation.
#[derive(Debug, Clone, Default)]
pub struct AgentResponse {
    pub content: String,
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub duration_ms: u64,
    pub model: String,
}

impl AgentResponse {
    pub fn total_tokens(&self) -> u64 {
        self.tokens_input + self.tokens_output
    }

    /// Folds a follow-up response into this one: the follow-up's content
    /// wins, usage accumulates.
    pub fn absorb(&mut self, next: AgentResponse) {
        self.content = next.content;
        self.tokens_input += next.tokens_input;
        self.tokens_output += next.tokens_output;
        self.duration_ms += next.duration_ms;
    }
}

/// Error type for agent operations.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Agent not found: {0}")]
    NotFound(String),

    #[error("Agent execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Agent timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Port for language-model agents.
#[async_trait]
pub trait AgentPort: Send + Sync {
    /// Generates a response for the prompt.
    async fn generate(&self, prompt: &str, config: &AgentConfig)
        -> Result<AgentResponse, AgentError>;

    /// Generates with self-review iterations.
    ///
    /// The default implementation re-prompts with the previous candidate
    /// embedded and stops early on a sentinel phrase. Token counts and
    /// durations accumulate across iterations.
    async fn generate_with_iteration(
        &self,
        prompt: &str,
        config: &AgentConfig,
        max_iterations: u32,
        review_prompt: &str,
    ) -> Result<(AgentResponse, u32), AgentError> {
        let mut current = self.generate(prompt, config).await?;
        let mut iterations_used = 1;

        if max_iterations <= 1 || review_prompt.is_empty() {
            return Ok((current, iterations_used));
        }

        for _ in 1..max_iterations {
            let follow_up = build_review_prompt(&current.content, review_prompt);
            let review = self.generate(&follow_up, config).await?;
            iterations_used += 1;

            if contains_stop_sentinel(&review.content) {
                // Keep the previous candidate; only account for the usage.
                current.tokens_input += review.tokens_input;
                current.tokens_output += review.tokens_output;
                current.duration_ms += review.duration_ms;
                break;
            }

            current.absorb(review);
        }

        Ok((current, iterations_used))
    }
}
