// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Model-facing wrappers around the [`BackgroundTaskManager`].
//!
//! `background_start` launches a persistent process; the agent then polls it
//! with `background_output` (incrementally via `since`), stops it with
//! `background_stop`, and inspects everything with `background_list`.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::background::BackgroundTaskManager;
use crate::tool::{ProgressSink, Tool, ToolCall, ToolParam, ToolResult};

pub struct BackgroundStartTool {
    manager: Arc<BackgroundTaskManager>,
    workspace: PathBuf,
}

impl BackgroundStartTool {
    pub fn new(manager: Arc<BackgroundTaskManager>, workspace: PathBuf) -> Self {
        Self { manager, workspace }
    }
}

#[async_trait]
impl Tool for BackgroundStartTool {
    fn name(&self) -> &str {
        "background_start"
    }

    fn description(&self) -> &str {
        "Start a long-running command in the background (dev servers, \
         watchers). Returns a task id for polling with background_output."
    }

    fn parameters(&self) -> Vec<ToolParam> {
        vec![ToolParam::string("command", "The shell command to run")]
    }

    async fn execute(&self, call: &ToolCall, _progress: &ProgressSink) -> ToolResult {
        let Some(command) = call.args.get("command").and_then(|v| v.as_str()) else {
            return ToolResult::err("missing 'command' parameter");
        };
        let task = self.manager.start(command, Some(self.workspace.clone()));
        ToolResult::ok(format!(
            "Started background task {} ({})",
            task.id,
            task.status.as_str()
        ))
    }
}

pub struct BackgroundOutputTool {
    manager: Arc<BackgroundTaskManager>,
}

impl BackgroundOutputTool {
    pub fn new(manager: Arc<BackgroundTaskManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for BackgroundOutputTool {
    fn name(&self) -> &str {
        "background_output"
    }

    fn description(&self) -> &str {
        "Read output from a background task. Pass 'since' (the line index \
         from a previous call) to poll incrementally."
    }

    fn parameters(&self) -> Vec<ToolParam> {
        vec![
            ToolParam::string("id", "Task id returned by background_start"),
            ToolParam::integer("since", "Return lines after this index").optional(),
        ]
    }

    async fn execute(&self, call: &ToolCall, _progress: &ProgressSink) -> ToolResult {
        let Some(id) = call.args.get("id").and_then(|v| v.as_str()) else {
            return ToolResult::err("missing 'id' parameter");
        };
        let since = call
            .args
            .get("since")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize);

        let Some(task) = self.manager.get(id) else {
            return ToolResult::err(format!("unknown task: {id}"));
        };
        let lines = self.manager.get_output(id, since).unwrap_or_default();
        let next_index = since.unwrap_or(0) + lines.len();
        ToolResult::ok(format!(
            "[status: {}, next_index: {next_index}]\n{}",
            task.status.as_str(),
            lines.join("\n")
        ))
    }
}

pub struct BackgroundStopTool {
    manager: Arc<BackgroundTaskManager>,
}

impl BackgroundStopTool {
    pub fn new(manager: Arc<BackgroundTaskManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for BackgroundStopTool {
    fn name(&self) -> &str {
        "background_stop"
    }

    fn description(&self) -> &str {
        "Stop a running background task."
    }

    fn parameters(&self) -> Vec<ToolParam> {
        vec![ToolParam::string("id", "Task id to stop")]
    }

    async fn execute(&self, call: &ToolCall, _progress: &ProgressSink) -> ToolResult {
        let Some(id) = call.args.get("id").and_then(|v| v.as_str()) else {
            return ToolResult::err("missing 'id' parameter");
        };
        if self.manager.stop(id) {
            ToolResult::ok(format!("Stopped task {id}"))
        } else {
            ToolResult::err(format!("task {id} is not running"))
        }
    }
}

pub struct BackgroundListTool {
    manager: Arc<BackgroundTaskManager>,
}

impl BackgroundListTool {
    pub fn new(manager: Arc<BackgroundTaskManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for BackgroundListTool {
    fn name(&self) -> &str {
        "background_list"
    }

    fn description(&self) -> &str {
        "List all background tasks with their status."
    }

    fn parameters(&self) -> Vec<ToolParam> {
        Vec::new()
    }

    fn read_only(&self) -> bool {
        // Listing mutates nothing, but the status column changes between
        // calls; caching would freeze it.
        false
    }

    async fn execute(&self, _call: &ToolCall, _progress: &ProgressSink) -> ToolResult {
        let tasks = self.manager.list();
        if tasks.is_empty() {
            return ToolResult::ok("No background tasks.");
        }
        let lines: Vec<String> = tasks
            .iter()
            .map(|t| {
                format!(
                    "{}  {}  pid={}  {}",
                    t.id,
                    t.status.as_str(),
                    t.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
                    t.command
                )
            })
            .collect();
        ToolResult::ok(lines.join("\n"))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
