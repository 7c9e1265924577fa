// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;

use crate::tool::{ProgressSink, Tool, ToolCall, ToolParam, ToolResult};

/// Scratchpad tool: the model reasons in the arguments; the content is not
/// shown to the user.
pub struct ThinkTool;

#[async_trait]
impl Tool for ThinkTool {
    fn name(&self) -> &str {
        "think"
    }

    fn description(&self) -> &str {
        "Use this tool to think through complex problems step by step. \
         The content is not shown to the user."
    }

    fn parameters(&self) -> Vec<ToolParam> {
        vec![ToolParam::string("thought", "Your reasoning and analysis")]
    }

    async fn execute(&self, _call: &ToolCall, _progress: &ProgressSink) -> ToolResult {
        ToolResult::ok("Thought recorded.")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
