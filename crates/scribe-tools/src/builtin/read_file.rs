// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::tool::{ProgressSink, Tool, ToolCall, ToolParam, ToolResult};

/// Read a file from the workspace.
///
/// Declared read-only, so the gate caches results for identical paths
/// within a session.
pub struct ReadFileTool {
    workspace: PathBuf,
}

impl ReadFileTool {
    pub fn new(workspace: PathBuf) -> Self {
        Self { workspace }
    }
}

/// Resolve `path` against the workspace unless it is already absolute.
pub(crate) fn resolve(workspace: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        workspace.join(p)
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file and return its contents. Paths are resolved relative \
         to the workspace."
    }

    fn parameters(&self) -> Vec<ToolParam> {
        vec![ToolParam::string("path", "File path to read")]
    }

    fn read_only(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCall, _progress: &ProgressSink) -> ToolResult {
        let Some(path) = call.args.get("path").and_then(|v| v.as_str()) else {
            return ToolResult::err("missing 'path' parameter");
        };
        let full = resolve(&self.workspace, path);
        match tokio::fs::read_to_string(&full).await {
            Ok(content) => ToolResult::ok(content),
            Err(e) => ToolResult::err(format!("cannot read {}: {e}", full.display())),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
