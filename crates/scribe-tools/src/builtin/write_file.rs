// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use async_trait::async_trait;

use crate::builtin::read_file::resolve;
use crate::tool::{ProgressSink, Tool, ToolCall, ToolParam, ToolResult};

/// Write a file into the workspace, creating parent directories as needed.
pub struct WriteFileTool {
    workspace: PathBuf,
}

impl WriteFileTool {
    pub fn new(workspace: PathBuf) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file, replacing it if it exists. Parent \
         directories are created automatically. Paths are resolved relative \
         to the workspace."
    }

    fn parameters(&self) -> Vec<ToolParam> {
        vec![
            ToolParam::string("path", "File path to write"),
            ToolParam::string("content", "Full file content"),
        ]
    }

    fn concurrent_safe(&self) -> bool {
        false
    }

    async fn execute(&self, call: &ToolCall, _progress: &ProgressSink) -> ToolResult {
        let Some(path) = call.args.get("path").and_then(|v| v.as_str()) else {
            return ToolResult::err("missing 'path' parameter");
        };
        let Some(content) = call.args.get("content").and_then(|v| v.as_str()) else {
            return ToolResult::err("missing 'content' parameter");
        };
        let full = resolve(&self.workspace, path);
        if let Some(parent) = full.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ToolResult::err(format!("cannot create {}: {e}", parent.display()));
            }
        }
        match tokio::fs::write(&full, content).await {
            Ok(()) => ToolResult::ok(format!("Wrote {} bytes to {path}", content.len())),
            Err(e) => ToolResult::err(format!("cannot write {}: {e}", full.display())),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
