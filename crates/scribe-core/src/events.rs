// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Why a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneReason {
    /// The model produced a final text answer and stopped.
    Stop,
    /// The step counter reached the configured budget.
    StepLimitReached,
    /// The session's cancel flag was observed.
    Cancelled,
    /// A fatal error ended the turn; an `Error` event precedes this.
    Error,
}

/// Events emitted by the engine during a turn.
/// Consumers (CLI, web UI) subscribe to these to drive their output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A text chunk streamed from the model
    TextDelta { text: String },
    /// A complete text response from the model (after streaming finishes)
    Text { text: String },
    /// The model has requested a tool call
    ToolCall {
        id: String,
        name: String,
        args: Value,
    },
    /// Intermediate progress from a streaming-capable tool
    ToolProgress {
        id: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pct: Option<f32>,
    },
    /// A tool call finished
    ToolResult {
        id: String,
        output: String,
        is_error: bool,
        /// True when the result was served from the read-only cache.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        cache_hit: bool,
    },
    /// A policy pre/post-hook produced a warn finding
    ToolPolicyWarn { tool: String, message: String },
    /// A policy pre-hook refused the call; the tool sees an error result
    ToolPolicyBlock { tool: String, message: String },
    /// Running token/cost totals after a provider usage report
    UsageUpdate {
        input_tokens: u64,
        output_tokens: u64,
        cached_tokens: u64,
        cost_usd: f64,
    },
    /// A recoverable, user-visible error; followed (eventually) by `Done`
    Error { message: String },
    /// Terminal event; the stream closes after this
    Done { reason: DoneReason },
}

impl StreamEvent {
    pub fn is_done(&self) -> bool {
        matches!(self, StreamEvent::Done { .. })
    }
}

/// An event as it appears on the bus and in the streaming view: one JSON
/// object per line with `type`, monotonic `seq`, `session_id`, `ts`, and the
/// type-specific fields flattened in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub seq: u64,
    pub session_id: String,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub event: StreamEvent,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
