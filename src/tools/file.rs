//! File tools — read and write files on the host filesystem.

use crate::types::{AgentTool, ContentBlock, ToolError, ToolResult, ToolUpdateFn};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

const DEFAULT_MAX_BYTES: usize = 512 * 1024;

/// Read a file as UTF-8 text. Re-entrant: concurrent reads are safe.
pub struct ReadFileTool {
    pub max_bytes: usize,
}

impl Default for ReadFileTool {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

#[async_trait]
impl AgentTool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn label(&self) -> &str {
        "Read File"
    }

    fn description(&self) -> &str {
        "Read a file and return its contents as text."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path of the file to read"
                }
            },
            "required": ["path"]
        })
    }

    fn reentrant(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        _call_id: &str,
        args: serde_json::Value,
        _cancel: CancellationToken,
        _on_update: Option<ToolUpdateFn>,
    ) -> Result<ToolResult, ToolError> {
        let path = args["path"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArgs("missing 'path' parameter".into()))?
            .to_string();

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| ToolError::Failed(format!("Failed to read {}: {}", path, e)))?;
        let truncated = bytes.len() > self.max_bytes;
        let text = String::from_utf8_lossy(&bytes[..bytes.len().min(self.max_bytes)]).to_string();

        let mut content = vec![ContentBlock::text(text)];
        if truncated {
            content.push(ContentBlock::text(format!(
                "... (truncated at {} bytes)",
                self.max_bytes
            )));
        }

        Ok(ToolResult {
            content,
            details: serde_json::json!({ "path": path, "bytes": bytes.len() }),
        })
    }
}

/// Write a file, creating parent directories as needed.
#[derive(Default)]
pub struct WriteFileTool;

#[async_trait]
impl AgentTool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn label(&self) -> &str {
        "Write File"
    }

    fn description(&self) -> &str {
        "Write text content to a file, replacing any existing content."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path of the file to write"
                },
                "content": {
                    "type": "string",
                    "description": "The full content to write"
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(
        &self,
        _call_id: &str,
        args: serde_json::Value,
        _cancel: CancellationToken,
        _on_update: Option<ToolUpdateFn>,
    ) -> Result<ToolResult, ToolError> {
        let path = args["path"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArgs("missing 'path' parameter".into()))?
            .to_string();
        let content = args["content"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArgs("missing 'content' parameter".into()))?;

        if let Some(parent) = std::path::Path::new(&path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ToolError::Failed(format!("Failed to create {}: {}", parent.display(), e)))?;
            }
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| ToolError::Failed(format!("Failed to write {}: {}", path, e)))?;

        Ok(ToolResult {
            content: vec![ContentBlock::text(format!(
                "Wrote {} bytes to {}",
                content.len(),
                path
            ))],
            details: serde_json::json!({ "path": path, "bytes": content.len() }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt").display().to_string();

        let write = WriteFileTool;
        write
            .execute(
                "c1",
                serde_json::json!({"path": path, "content": "hello"}),
                CancellationToken::new(),
                None,
            )
            .await
            .unwrap();

        let read = ReadFileTool::default();
        let result = read
            .execute(
                "c2",
                serde_json::json!({"path": path}),
                CancellationToken::new(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(result.content[0], ContentBlock::text("hello"));
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let read = ReadFileTool::default();
        let result = read
            .execute(
                "c1",
                serde_json::json!({"path": "/nonexistent/definitely/missing"}),
                CancellationToken::new(),
                None,
            )
            .await;
        assert!(matches!(result, Err(ToolError::Failed(_))));
    }
}
