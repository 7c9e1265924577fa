// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(unix)]
use libc;
use tokio::process::Command;
use tracing::debug;

use crate::tool::{ProgressSink, Tool, ToolCall, ToolParam, ToolResult};

/// Built-in tool that runs a shell command inside the workspace.
pub struct ShellTool {
    workspace: PathBuf,
    timeout_secs: u64,
}

impl ShellTool {
    pub fn new(workspace: PathBuf, timeout_secs: u64) -> Self {
        Self {
            workspace,
            timeout_secs,
        }
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return its output. Use for git, npm, pip, \
         and other CLI operations. Prefer non-interactive commands; avoid \
         commands that require a TTY. For servers and other long-running \
         processes use background_start instead."
    }

    fn parameters(&self) -> Vec<ToolParam> {
        vec![
            ToolParam::string("command", "The shell command to execute"),
            ToolParam::integer("timeout", "Timeout in seconds (default 120)").optional(),
        ]
    }

    // Shell commands mutate the shared workspace.
    fn concurrent_safe(&self) -> bool {
        false
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    async fn execute(&self, call: &ToolCall, _progress: &ProgressSink) -> ToolResult {
        let command = match call.args.get("command").and_then(|v| v.as_str()) {
            Some(c) => c.to_string(),
            None => return ToolResult::err("missing 'command' parameter"),
        };
        let timeout = call
            .args
            .get("timeout")
            .and_then(|v| v.as_u64())
            .unwrap_or(self.timeout_secs);

        debug!(cmd = %command, "executing shell tool");

        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(&command);
        // stdin(null) keeps the subprocess away from the controlling
        // terminal; kill_on_drop ensures the child dies with the future
        // when the timeout fires.
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        // setsid() detaches the child from the controlling terminal so it
        // cannot write escape sequences through /dev/tty.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
        cmd.current_dir(&self.workspace);

        let result = tokio::time::timeout(Duration::from_secs(timeout), cmd.output()).await;

        match result {
            Ok(Ok(output)) => {
                let mut parts = Vec::new();
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stdout.is_empty() {
                    parts.push(stdout.into_owned());
                }
                if !stderr.is_empty() {
                    parts.push(format!("STDERR:\n{stderr}"));
                }
                let mut text = parts.join("\n");
                let code = output.status.code().unwrap_or(-1);
                if code != 0 {
                    text = format!("Exit code: {code}\n{text}");
                }
                if text.is_empty() {
                    text = "(no output)".into();
                }
                ToolResult::ok(text)
            }
            Ok(Err(e)) => ToolResult::err(format!("spawn error: {e}")),
            Err(_) => ToolResult::err(format!("Command timed out after {timeout}s")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn tool() -> ShellTool {
        ShellTool::new(std::env::temp_dir(), 30)
    }

    fn call(args: serde_json::Value) -> ToolCall {
        ToolCall {
            id: "1".into(),
            name: "shell".into(),
            args,
        }
    }

    #[tokio::test]
    async fn echo_returns_stdout() {
        let out = tool()
            .execute(&call(json!({"command": "echo hello"})), &ProgressSink::disabled())
            .await;
        assert!(!out.is_error, "{:?}", out.error);
        assert!(out.output.contains("hello"));
    }

    #[tokio::test]
    async fn stderr_is_labelled() {
        let out = tool()
            .execute(
                &call(json!({"command": "echo oops >&2"})),
                &ProgressSink::disabled(),
            )
            .await;
        assert!(out.output.contains("STDERR:"));
        assert!(out.output.contains("oops"));
    }

    #[tokio::test]
    async fn nonzero_exit_prefixes_code_but_is_not_error() {
        let out = tool()
            .execute(&call(json!({"command": "exit 7"})), &ProgressSink::disabled())
            .await;
        // The model sees the exit code and may react; the call itself worked.
        assert!(!out.is_error);
        assert!(out.output.contains("Exit code: 7"));
    }

    #[tokio::test]
    async fn runs_in_workspace_directory() {
        let dir = tempfile::tempdir().unwrap();
        let t = ShellTool::new(dir.path().to_path_buf(), 30);
        let out = t
            .execute(&call(json!({"command": "pwd"})), &ProgressSink::disabled())
            .await;
        assert!(out.output.trim_end().ends_with(
            dir.path().file_name().unwrap().to_str().unwrap()
        ));
    }

    #[tokio::test]
    async fn missing_command_is_error() {
        let out = tool().execute(&call(json!({})), &ProgressSink::disabled()).await;
        assert!(out.is_error);
        assert!(out.error.as_deref().unwrap().contains("command"));
    }

    #[tokio::test]
    async fn timeout_parameter_is_honoured() {
        let out = tool()
            .execute(
                &call(json!({"command": "sleep 30", "timeout": 1})),
                &ProgressSink::disabled(),
            )
            .await;
        assert!(out.is_error);
        assert!(out.error.as_deref().unwrap().contains("timed out"));
        assert!(!out.retryable, "timeouts are never retryable");
    }
}
