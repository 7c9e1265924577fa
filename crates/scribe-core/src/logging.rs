// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Structured JSONL log for production debugging.
//!
//! Records LLM calls, tool executions, and turn steps as single-line JSON to
//! an optional file sink (`agent.jsonl`).  Human-readable mirrors go through
//! `tracing`, which the binary filters by severity onto stderr.

use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

/// One structured record.  The `record` tag names the schema.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum LogRecord {
    LlmCall {
        model: String,
        attempt: u32,
        elapsed_s: f64,
        prompt_tokens: u64,
        completion_tokens: u64,
        finish_reason: String,
        tool_calls: usize,
    },
    LlmCallError {
        model: String,
        attempt: u32,
        elapsed_s: f64,
        error: String,
        partial_text_len: usize,
        /// Bytes of tool-call argument fragments received before the error.
        /// Partial calls are never replayed; they are only recorded here.
        partial_tool_call_bytes: usize,
    },
    ToolExec {
        tool: String,
        elapsed_s: f64,
        output_len: usize,
        is_error: bool,
    },
    TurnStep {
        step: u32,
        text_len: usize,
        tool_calls: usize,
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: f64,
    },
}

impl LogRecord {
    fn is_warning(&self) -> bool {
        matches!(self, LogRecord::LlmCallError { .. })
    }
}

/// JSONL sink.  Write failures are swallowed: observability must never take
/// down the agent loop.
pub struct StructuredLog {
    file: Option<Mutex<std::fs::File>>,
}

impl StructuredLog {
    /// Open `<log_dir>/agent.jsonl` for append.  `None` disables the file
    /// sink; records still mirror to `tracing`.
    pub fn new(log_dir: Option<&Path>) -> Self {
        let file = log_dir.and_then(|dir| {
            if let Err(e) = std::fs::create_dir_all(dir) {
                warn!(error = %e, "cannot create log directory");
                return None;
            }
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join("agent.jsonl"))
                .map_err(|e| warn!(error = %e, "cannot open agent.jsonl"))
                .ok()
        });
        Self {
            file: file.map(Mutex::new),
        }
    }

    pub fn disabled() -> Self {
        Self { file: None }
    }

    pub fn write(&self, record: &LogRecord) {
        let level = if record.is_warning() { "WARNING" } else { "INFO" };
        if record.is_warning() {
            warn!(record = ?record, "engine log");
        } else {
            info!(record = ?record, "engine log");
        }

        let Some(file) = &self.file else { return };
        let mut entry = match serde_json::to_value(record) {
            Ok(v) => v,
            Err(_) => return,
        };
        entry["ts"] = serde_json::json!(Utc::now().to_rfc3339());
        entry["level"] = serde_json::json!(level);
        if let Ok(mut f) = file.lock() {
            let _ = writeln!(f, "{entry}");
        }
    }
}

/// Measures one LLM API call; produces the matching record on completion.
pub struct LlmCallTimer {
    model: String,
    attempt: u32,
    start: Instant,
}

impl LlmCallTimer {
    pub fn start(model: &str, attempt: u32) -> Self {
        Self {
            model: model.to_string(),
            attempt,
            start: Instant::now(),
        }
    }

    pub fn success(
        self,
        log: &StructuredLog,
        prompt_tokens: u64,
        completion_tokens: u64,
        finish_reason: &str,
        tool_calls: usize,
    ) {
        log.write(&LogRecord::LlmCall {
            model: self.model,
            attempt: self.attempt,
            elapsed_s: round3(self.start.elapsed().as_secs_f64()),
            prompt_tokens,
            completion_tokens,
            finish_reason: finish_reason.to_string(),
            tool_calls,
        });
    }

    pub fn error(
        self,
        log: &StructuredLog,
        error: &str,
        partial_text_len: usize,
        partial_tool_call_bytes: usize,
    ) {
        log.write(&LogRecord::LlmCallError {
            model: self.model,
            attempt: self.attempt,
            elapsed_s: round3(self.start.elapsed().as_secs_f64()),
            error: error.to_string(),
            partial_text_len,
            partial_tool_call_bytes,
        });
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
