//! Mock agent for tests and dry runs.

use std::sync::Mutex;

use async_trait::async_trait;

use super::{AgentConfig, AgentError, AgentPort, AgentResponse};

/// Scripted agent: returns canned responses in order, repeating the last
/// one once the script is exhausted.
pub struct MockAgentAdapter {
    responses: Mutex<Vec<String>>,
    cursor: Mutex<usize>,
    tokens_input: u64,
    tokens_output: u64,
    /// When set, every call fails with this message.
    failure: Option<String>,
}

impl MockAgentAdapter {
    /// Agent that always returns the same content.
    pub fn always(content: impl Into<String>) -> Self {
        Self::scripted(vec![content.into()])
    }

    /// Agent that returns the given responses in sequence.
    pub fn scripted(responses: Vec<String>) -> Self {
        Self {
            responses: Mutex::new(responses),
            cursor: Mutex::new(0),
            tokens_input: 100,
            tokens_output: 50,
            failure: None,
        }
    }

    /// Agent whose every call fails.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            cursor: Mutex::new(0),
            tokens_input: 0,
            tokens_output: 0,
            failure: Some(message.into()),
        }
    }

    /// Overrides the token counts reported per call.
    pub fn with_tokens(mut self, input: u64, output: u64) -> Self {
        self.tokens_input = input;
        self.tokens_output = output;
        self
    }

    /// Number of generate calls made so far.
    pub fn calls(&self) -> usize {
        *self.cursor.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl AgentPort for MockAgentAdapter {
    async fn generate(
        &self,
        _prompt: &str,
        config: &AgentConfig,
    ) -> Result<AgentResponse, AgentError> {
        let mut cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());
        *cursor += 1;

        if let Some(ref message) = self.failure {
            return Err(AgentError::ExecutionFailed(message.clone()));
        }

        let responses = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        let index = (*cursor - 1).min(responses.len().saturating_sub(1));
        let content = responses.get(index).cloned().unwrap_or_default();

        Ok(AgentResponse {
            content,
            tokens_input: self.tokens_input,
            tokens_output: self.tokens_output,
            duration_ms: 10,
            model: config.model.clone(),
        })
    }
}
