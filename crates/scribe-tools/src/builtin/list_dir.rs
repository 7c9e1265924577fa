// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use async_trait::async_trait;

use crate::builtin::read_file::resolve;
use crate::tool::{ProgressSink, Tool, ToolCall, ToolParam, ToolResult};

/// List the entries of a workspace directory, one per line, directories
/// marked with a trailing `/`.
pub struct ListDirTool {
    workspace: PathBuf,
}

impl ListDirTool {
    pub fn new(workspace: PathBuf) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List directory contents. Directories are suffixed with '/'. Paths \
         are resolved relative to the workspace; default is the workspace root."
    }

    fn parameters(&self) -> Vec<ToolParam> {
        vec![ToolParam::string("path", "Directory to list (default: '.')").optional()]
    }

    fn read_only(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCall, _progress: &ProgressSink) -> ToolResult {
        let path = call
            .args
            .get("path")
            .and_then(|v| v.as_str())
            .unwrap_or(".");
        let full = resolve(&self.workspace, path);

        let mut rd = match tokio::fs::read_dir(&full).await {
            Ok(rd) => rd,
            Err(e) => return ToolResult::err(format!("cannot list {}: {e}", full.display())),
        };
        let mut entries = Vec::new();
        while let Ok(Some(entry)) = rd.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            entries.push(if is_dir { format!("{name}/") } else { name });
        }
        entries.sort();
        if entries.is_empty() {
            ToolResult::ok("(empty directory)")
        } else {
            ToolResult::ok(entries.join("\n"))
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
