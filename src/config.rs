//! Config-value resolution.
//!
//! String values beginning with `$` resolve as environment variables and
//! values beginning with `!` resolve as shell commands through `sh -c`
//! (10 s wall clock, stdout trimmed, blank output becomes null, results
//! memoised for the process lifetime keyed by the command string). Anything
//! else is a literal.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

pub const SHELL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("shell command failed: {0}")]
    Shell(String),
    #[error("shell command timed out after {}s", SHELL_TIMEOUT.as_secs())]
    Timeout,
}

fn shell_cache() -> &'static Mutex<HashMap<String, Option<String>>> {
    static CACHE: OnceLock<Mutex<HashMap<String, Option<String>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Resolve a config value. `Ok(None)` means the value resolved to null
/// (unset variable, blank command output).
pub async fn resolve_value(raw: &str) -> Result<Option<String>, ConfigError> {
    if let Some(name) = raw.strip_prefix('$') {
        return Ok(std::env::var(name).ok().filter(|v| !v.is_empty()));
    }
    if let Some(command) = raw.strip_prefix('!') {
        return resolve_shell(command).await;
    }
    Ok(Some(raw.to_string()))
}

async fn resolve_shell(command: &str) -> Result<Option<String>, ConfigError> {
    if let Some(cached) = shell_cache()
        .lock()
        .expect("shell cache lock poisoned")
        .get(command)
    {
        return Ok(cached.clone());
    }

    debug!(command, "resolving config value via shell");
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());

    let output = tokio::time::timeout(SHELL_TIMEOUT, cmd.output())
        .await
        .map_err(|_| ConfigError::Timeout)?
        .map_err(|e| ConfigError::Shell(e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ConfigError::Shell(format!(
            "exit {}: {}",
            output.status.code().unwrap_or(-1),
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let resolved = if stdout.is_empty() { None } else { Some(stdout) };
    shell_cache()
        .lock()
        .expect("shell cache lock poisoned")
        .insert(command.to_string(), resolved.clone());
    Ok(resolved)
}
