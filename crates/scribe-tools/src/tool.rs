// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier returned by the model (forwarded verbatim)
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments
    pub args: Value,
}

/// The result of executing a tool.
///
/// Errors are values, never exceptions across this boundary: a failed tool
/// sets `is_error` and `error`; the execution gate converts panics into the
/// same shape.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub output: String,
    pub error: Option<String>,
    pub is_error: bool,
    /// A retryable failure (transient network/backend error).  The gate only
    /// re-runs a tool when this is set and retries are configured; timeouts
    /// and argument errors are never retryable.
    pub retryable: bool,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            error: None,
            is_error: false,
            retryable: false,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            output: String::new(),
            error: Some(msg.into()),
            is_error: true,
            retryable: false,
        }
    }

    pub fn err_retryable(msg: impl Into<String>) -> Self {
        Self {
            retryable: true,
            ..Self::err(msg)
        }
    }

    /// The text appended to the conversation as the tool-role message.
    pub fn to_content(&self) -> String {
        if self.is_error {
            format!("Error: {}", self.error.as_deref().unwrap_or("unknown error"))
        } else {
            self.output.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

/// A single tool parameter.  Schemas are data, not reflection: the registry
/// serialises these into JSON Schema and the gate validates against them.
#[derive(Debug, Clone)]
pub struct ToolParam {
    pub name: String,
    pub kind: ParamKind,
    pub description: String,
    pub required: bool,
    /// Allowed values; empty means unconstrained.
    pub allowed: Vec<String>,
}

impl ToolParam {
    pub fn string(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(name, ParamKind::String, description)
    }

    pub fn integer(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Integer, description)
    }

    pub fn array(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Array, description)
    }

    fn new(name: impl Into<String>, kind: ParamKind, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            description: description.into(),
            required: true,
            allowed: Vec::new(),
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_enum(mut self, values: &[&str]) -> Self {
        self.allowed = values.iter().map(|s| s.to_string()).collect();
        self
    }
}

/// An intermediate progress report from a streaming-capable tool.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub message: String,
    pub pct: Option<f32>,
}

/// Handle through which a tool reports intermediate progress.
///
/// Simple tools ignore it; streaming tools call [`ProgressSink::report`] and
/// the gate forwards each update as a `ToolProgress` event.  A disabled sink
/// drops updates silently, so tools never need to care whether anyone
/// listens.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    tx: Option<mpsc::UnboundedSender<ProgressUpdate>>,
}

impl ProgressSink {
    pub fn new(tx: mpsc::UnboundedSender<ProgressUpdate>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that discards all updates.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn report(&self, message: impl Into<String>, pct: Option<f32>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(ProgressUpdate {
                message: message.into(),
                pct,
            });
        }
    }
}

/// Trait that every built-in and user-defined tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters(&self) -> Vec<ToolParam>;

    /// Two instances of this tool may run in parallel without racing over
    /// shared state (primarily the workspace).
    fn concurrent_safe(&self) -> bool {
        true
    }

    /// The result is a pure function of the arguments for the session's
    /// lifetime; the gate may cache it.
    fn read_only(&self) -> bool {
        false
    }

    /// Per-tool execution deadline enforced by the gate.
    fn timeout(&self) -> Duration {
        Duration::from_secs(120)
    }

    /// Retries for retryable failures (0–3).
    fn max_retries(&self) -> u32 {
        0
    }

    /// First back-off delay; doubles on every retry.
    fn base_delay(&self) -> Duration {
        Duration::from_millis(500)
    }

    /// Execute the tool.  Errors must be returned via [`ToolResult::err`],
    /// never propagated.
    async fn execute(&self, call: &ToolCall, progress: &ProgressSink) -> ToolResult;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
