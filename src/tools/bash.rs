//! Bash tool — execute shell commands with timeout and output capture.
//!
//! Trust model equals the host shell; there is no sandboxing layer.

use crate::types::{AgentTool, ContentBlock, ToolError, ToolResult, ToolUpdateFn};
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

pub struct BashTool {
    /// Working directory for commands.
    pub cwd: Option<String>,
    /// Max execution time per command.
    pub timeout: Duration,
    /// Max output bytes to capture.
    pub max_output_bytes: usize,
}

impl Default for BashTool {
    fn default() -> Self {
        Self {
            cwd: None,
            timeout: Duration::from_secs(120),
            max_output_bytes: 256 * 1024,
        }
    }
}

impl BashTool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

fn truncate_output(mut output: String, max_bytes: usize) -> String {
    if output.len() > max_bytes {
        let cut = (0..=max_bytes)
            .rev()
            .find(|i| output.is_char_boundary(*i))
            .unwrap_or(0);
        output.truncate(cut);
        output.push_str("\n... (output truncated)");
    }
    output
}

#[async_trait]
impl AgentTool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn label(&self) -> &str {
        "Run Command"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return its exit code, stdout and stderr."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(
        &self,
        _call_id: &str,
        args: serde_json::Value,
        cancel: CancellationToken,
        on_update: Option<ToolUpdateFn>,
    ) -> Result<ToolResult, ToolError> {
        let command = args["command"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArgs("missing 'command' parameter".into()))?;

        if let Some(on_update) = &on_update {
            on_update(ToolResult::text(format!("$ {}", command)));
        }

        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(command);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(ToolError::Cancelled),
            _ = tokio::time::sleep(self.timeout) => {
                return Err(ToolError::Failed(format!(
                    "Command timed out after {}s",
                    self.timeout.as_secs()
                )));
            }
            result = cmd.output() => {
                result.map_err(|e| ToolError::Failed(format!("Failed to execute: {}", e)))?
            }
        };

        let stdout = truncate_output(
            String::from_utf8_lossy(&output.stdout).to_string(),
            self.max_output_bytes,
        );
        let stderr = truncate_output(
            String::from_utf8_lossy(&output.stderr).to_string(),
            self.max_output_bytes,
        );
        let exit_code = output.status.code().unwrap_or(-1);

        let text = if stderr.is_empty() {
            format!("Exit code: {}\n{}", exit_code, stdout)
        } else {
            format!(
                "Exit code: {}\nSTDOUT:\n{}\nSTDERR:\n{}",
                exit_code, stdout, stderr
            )
        };

        // Non-zero exits still return Ok: the model needs the output to
        // self-correct.
        Ok(ToolResult {
            content: vec![ContentBlock::text(text)],
            details: serde_json::json!({ "exit_code": exit_code, "success": exit_code == 0 }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let tool = BashTool::new();
        let result = tool
            .execute(
                "c1",
                serde_json::json!({"command": "echo hello"}),
                CancellationToken::new(),
                None,
            )
            .await
            .unwrap();
        match &result.content[0] {
            ContentBlock::Text { text } => {
                assert!(text.contains("Exit code: 0"));
                assert!(text.contains("hello"));
            }
            other => panic!("unexpected block {:?}", other),
        }
    }

    #[tokio::test]
    async fn cancellation_stops_the_command() {
        let tool = BashTool::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = tool
            .execute(
                "c1",
                serde_json::json!({"command": "sleep 30"}),
                cancel,
                None,
            )
            .await;
        assert!(matches!(result, Err(ToolError::Cancelled)));
    }
}
