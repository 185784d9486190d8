//! Command-line agent adapter.
//!
//! Drives any CLI coding agent that accepts a prompt via argument or stdin.
//! The process runs under an explicit timeout and is killed on expiry.

use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use super::{AgentConfig, AgentError, AgentPort, AgentResponse};

/// Adapter for external command-line agents.
pub struct CommandAgentAdapter {
    /// Base command to run.
    command: String,
    /// Arguments prepended before the prompt.
    args: Vec<String>,
    /// Whether to pass the prompt via stdin (true) or `--prompt` (false).
    use_stdin: bool,
}

impl CommandAgentAdapter {
    /// Creates a new adapter for the given command.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            use_stdin: false,
        }
    }

    /// Adds fixed arguments.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Passes the prompt via stdin instead of `--prompt`.
    pub fn with_stdin(mut self, use_stdin: bool) -> Self {
        self.use_stdin = use_stdin;
        self
    }

    /// Checks whether the agent command can be spawned at all.
    pub async fn is_available(&self) -> bool {
        Command::new(&self.command)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

#[async_trait]
impl AgentPort for CommandAgentAdapter {
    async fn generate(
        &self,
        prompt: &str,
        config: &AgentConfig,
    ) -> Result<AgentResponse, AgentError> {
        let start = Instant::now();

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);

        if !config.model.is_empty() {
            cmd.arg("--model").arg(&config.model);
        }
        if !config.system_prompt.is_empty() {
            cmd.arg("--system-prompt").arg(&config.system_prompt);
        }
        if let Some(ref dir) = config.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &config.env_vars {
            cmd.env(key, value);
        }

        if self.use_stdin {
            cmd.stdin(Stdio::piped());
        } else {
            cmd.arg("--prompt").arg(prompt);
        }

        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        info!(command = %self.command, "Starting agent");

        let mut child = cmd
            .spawn()
            .map_err(|e| AgentError::NotFound(format!("Failed to spawn {}: {}", self.command, e)))?;

        if self.use_stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(prompt.as_bytes()).await.map_err(|e| {
                    AgentError::ExecutionFailed(format!("Failed to write prompt: {}", e))
                })?;
                stdin.shutdown().await.ok();
            }
        }

        let output = match tokio::time::timeout(config.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(AgentError::ExecutionFailed(format!("Process error: {}", e)));
            }
            Err(_) => {
                // kill_on_drop reaps the child once the future is dropped.
                return Err(AgentError::Timeout(config.timeout));
            }
        };

        let duration = start.elapsed();
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            debug!(exit_code = code, stderr = %stderr, "Agent exited with non-zero code");
            return Err(AgentError::ExecutionFailed(format!(
                "Agent exited with code {}: {}",
                code,
                stderr.trim()
            )));
        }

        info!(
            command = %self.command,
            duration_ms = duration.as_millis() as u64,
            "Agent completed"
        );

        // CLI agents don't report token usage; the counts stay zero and
        // statistics degrade gracefully.
        Ok(AgentResponse {
            content: stdout,
            tokens_input: 0,
            tokens_output: 0,
            duration_ms: duration.as_millis() as u64,
            model: config.model.clone(),
        })
    }
}
