// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Conversation context: append-only message log, token estimate, compaction,
//! snapshots, and JSONL persistence.

use std::path::Path;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use scribe_model::{Message, Role};

/// Immutable named copy of the message list, used for undo and branching.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub id: String,
    pub label: String,
    pub created_at: DateTime<Utc>,
    messages: Vec<Message>,
}

/// Outcome of loading a context from disk.
pub struct LoadReport {
    pub context: Context,
    /// Malformed JSONL lines that were skipped.
    pub skipped_lines: usize,
}

/// One conversation context, owned by its session for the session lifetime.
#[derive(Debug, Clone, Default)]
pub struct Context {
    system_prompt: String,
    messages: Vec<Message>,
    token_estimate: usize,
    snapshots: Vec<Snapshot>,
}

impl Context {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            ..Default::default()
        }
    }

    // ── Appending ─────────────────────────────────────────────────────────────

    /// Replace the system prompt (not a message in the log).
    pub fn add_system(&mut self, content: impl Into<String>) {
        self.system_prompt = content.into();
    }

    pub fn add_user(&mut self, content: impl Into<String>) {
        self.push(Message::user(content));
    }

    pub fn add_assistant(&mut self, msg: Message) {
        debug_assert_eq!(msg.role, Role::Assistant);
        self.push(msg);
    }

    pub fn add_assistant_text(&mut self, content: impl Into<String>) {
        self.push(Message::assistant(content));
    }

    pub fn add_tool_result(&mut self, tool_call_id: impl Into<String>, content: impl Into<String>) {
        self.push(Message::tool_result(tool_call_id, content));
    }

    pub fn push(&mut self, msg: Message) {
        self.token_estimate += msg.approx_tokens();
        self.messages.push(msg);
    }

    // ── Views ─────────────────────────────────────────────────────────────────

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// The provider-ready view: system prompt first, then the log.
    pub fn get_messages(&self) -> Vec<Message> {
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        if !self.system_prompt.is_empty() {
            out.push(Message::system(self.system_prompt.clone()));
        }
        out.extend(self.messages.iter().cloned());
        out
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn token_estimate(&self) -> usize {
        self.token_estimate
    }

    fn recalculate_tokens(&mut self) {
        self.token_estimate = self.messages.iter().map(|m| m.approx_tokens()).sum();
    }

    // ── Compaction ────────────────────────────────────────────────────────────

    /// Keep the first 2 and last `keep_recent` messages; elide the middle
    /// into a synthetic system placeholder.  Both keep-windows are extended
    /// so a tool-call/tool-result pair is never split: the head grows
    /// forward past tool results answering a kept assistant, the tail grows
    /// backward past tool results whose call lies before the split.
    ///
    /// Returns the number of elided messages (0 when nothing was compacted).
    pub fn compact(&mut self, keep_recent: usize) -> usize {
        if self.messages.len() <= keep_recent + 2 {
            return 0;
        }
        let mut head_end = 2;
        while head_end < self.messages.len() && self.messages[head_end].role == Role::Tool {
            head_end += 1;
        }
        let mut start = self.messages.len() - keep_recent;
        while start > head_end && self.messages[start].role == Role::Tool {
            start -= 1;
        }
        if start <= head_end {
            return 0;
        }

        let elided = start - head_end;
        let placeholder =
            Message::system(format!("[Context compacted: {elided} messages summarized]"));

        let mut compacted = Vec::with_capacity(self.messages.len() - elided + 1);
        compacted.extend(self.messages[..head_end].iter().cloned());
        compacted.push(placeholder);
        compacted.extend(self.messages[start..].iter().cloned());
        self.messages = compacted;
        self.recalculate_tokens();
        elided
    }

    // ── Snapshots / branches / undo ───────────────────────────────────────────

    /// Record an immutable copy of the current messages; returns its id.
    pub fn snapshot(&mut self, label: impl Into<String>) -> String {
        let id = Uuid::new_v4().simple().to_string()[..8].to_string();
        self.snapshots.push(Snapshot {
            id: id.clone(),
            label: label.into(),
            created_at: Utc::now(),
            messages: self.messages.clone(),
        });
        id
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    /// Replace the current messages with a deep copy of the snapshot's.
    pub fn restore(&mut self, id: &str) -> bool {
        let Some(snap) = self.snapshots.iter().find(|s| s.id == id) else {
            return false;
        };
        self.messages = snap.messages.clone();
        self.recalculate_tokens();
        true
    }

    /// An independent context branched from the snapshot; shares no mutable
    /// state with `self`.
    pub fn fork(&self, id: &str) -> Option<Context> {
        let snap = self.snapshots.iter().find(|s| s.id == id)?;
        let mut ctx = Context::new(self.system_prompt.clone());
        ctx.messages = snap.messages.clone();
        ctx.recalculate_tokens();
        Some(ctx)
    }

    // ── Pairing invariant ─────────────────────────────────────────────────────

    /// Check that every assistant tool call is answered by exactly one tool
    /// message before the next non-tool message.
    pub fn validate_pairing(&self) -> Result<(), String> {
        let mut pending: Vec<String> = Vec::new();
        for m in &self.messages {
            match m.role {
                Role::Tool => {
                    let id = m.tool_call_id.as_deref().unwrap_or("");
                    match pending.iter().position(|p| p == id) {
                        Some(pos) => {
                            pending.remove(pos);
                        }
                        None => {
                            return Err(format!("tool result '{id}' without a matching call"))
                        }
                    }
                }
                _ => {
                    if !pending.is_empty() {
                        return Err(format!("unanswered tool calls: {}", pending.join(", ")));
                    }
                    if m.role == Role::Assistant {
                        pending = m.tool_calls.iter().map(|tc| tc.id.clone()).collect();
                    }
                }
            }
        }
        if pending.is_empty() {
            Ok(())
        } else {
            Err(format!("unanswered tool calls: {}", pending.join(", ")))
        }
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    /// Write the message log as JSONL, one message per line.  The system
    /// prompt is not persisted; it is supplied again on load.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut out = String::new();
        for m in &self.messages {
            out.push_str(&serde_json::to_string(m)?);
            out.push('\n');
        }
        std::fs::write(path, out).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// Load a context from JSONL.  The load is order-preserving and lenient:
    /// unknown fields are ignored and malformed lines are skipped with a
    /// count.  A missing file yields an empty context.
    pub fn load(path: &Path, system_prompt: impl Into<String>) -> anyhow::Result<LoadReport> {
        let mut ctx = Context::new(system_prompt);
        if !path.exists() {
            return Ok(LoadReport {
                context: ctx,
                skipped_lines: 0,
            });
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut skipped = 0usize;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(line) {
                Ok(mut msg) => {
                    normalize_loaded(&mut msg);
                    ctx.messages.push(msg);
                }
                Err(e) => {
                    skipped += 1;
                    warn!(error = %e, "skipping malformed context line");
                }
            }
        }
        ctx.recalculate_tokens();
        Ok(LoadReport {
            context: ctx,
            skipped_lines: skipped,
        })
    }
}

/// The only intentional mutations during load:
/// - assistant-with-tool-calls gets `reasoning_content` backfilled to `""`,
/// - tool-call argument strings that are not valid JSON are replaced with
///   the canonical `{"_invalid_json_args": true, "original_length": N}`
///   payload so the provider never sees a broken fragment.
fn normalize_loaded(msg: &mut Message) {
    if msg.role == Role::Assistant && msg.has_tool_calls() && msg.reasoning_content.is_none() {
        msg.reasoning_content = Some(String::new());
    }
    for tc in &mut msg.tool_calls {
        if serde_json::from_str::<serde_json::Value>(&tc.arguments).is_err() {
            let original_length = tc.arguments.len();
            tc.arguments = json!({
                "_invalid_json_args": true,
                "original_length": original_length,
            })
            .to_string();
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
