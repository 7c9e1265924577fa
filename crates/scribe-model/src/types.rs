// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One tool invocation recorded on an assistant message.
///
/// `arguments` is the raw JSON-encoded argument object exactly as the
/// provider streamed it.  It is kept as a string so malformed payloads
/// survive save/load and can be canonicalised on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// A single message in the conversation history.
///
/// For every tool call id emitted on an assistant message, exactly one
/// `role: tool` message with that `tool_call_id` must appear before the next
/// assistant message — providers reject histories that violate this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Opaque provider metadata (chain-of-thought text).  Preserved across
    /// save/load; backfilled to `""` on assistant-with-tool-calls replay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self::text(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text(Role::Assistant, text)
    }

    fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(text.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            reasoning_content: None,
        }
    }

    /// An assistant message that carries tool calls; `content` may be empty
    /// when the model emitted only calls.
    pub fn assistant_tool_calls(content: Option<String>, calls: Vec<ToolCallRecord>) -> Self {
        Self {
            role: Role::Assistant,
            content,
            tool_calls: calls,
            tool_call_id: None,
            reasoning_content: None,
        }
    }

    pub fn tool_result(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(id.into()),
            reasoning_content: None,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub fn as_text(&self) -> Option<&str> {
        self.content.as_deref()
    }

    /// Approximate token count used for context management (bytes ÷ 3).
    pub fn approx_tokens(&self) -> usize {
        let mut bytes = self.content.as_deref().map(str::len).unwrap_or(0);
        for tc in &self.tool_calls {
            bytes += tc.name.len() + tc.arguments.len();
        }
        (bytes / 3).max(1)
    }
}

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: serde_json::Value,
}

/// Request sent to a model provider.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub stream: bool,
}

/// A single streamed chunk from the model.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// A text delta streamed from the model
    TextDelta(String),
    /// Part of a tool call.  Arguments arrive as one or more partial JSON
    /// fragments that the consumer concatenates and parses at end-of-call;
    /// `index` routes fragments of parallel calls.
    ToolCallDelta {
        index: u32,
        id: String,
        name: String,
        arguments_partial: String,
    },
    /// Token usage statistics, typically in the final chunk
    Usage {
        input_tokens: u64,
        output_tokens: u64,
        cached_tokens: u64,
    },
    /// The stream finished normally
    Done { finish_reason: String },
}

/// Token usage from one provider call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cached_tokens += other.cached_tokens;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Message construction ──────────────────────────────────────────────────

    #[test]
    fn message_user_sets_role_and_text() {
        let m = Message::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.as_text(), Some("hello"));
    }

    #[test]
    fn message_tool_result_carries_call_id() {
        let m = Message::tool_result("call_1", "output");
        assert_eq!(m.role, Role::Tool);
        assert_eq!(m.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(m.as_text(), Some("output"));
    }

    #[test]
    fn assistant_tool_calls_may_have_no_content() {
        let m = Message::assistant_tool_calls(
            None,
            vec![ToolCallRecord {
                id: "c1".into(),
                name: "echo".into(),
                arguments: "{}".into(),
            }],
        );
        assert!(m.content.is_none());
        assert!(m.has_tool_calls());
    }

    // ── Token approximation ───────────────────────────────────────────────────

    #[test]
    fn approx_tokens_divides_bytes_by_three() {
        let m = Message::user("123456789"); // 9 bytes → 3 tokens
        assert_eq!(m.approx_tokens(), 3);
    }

    #[test]
    fn approx_tokens_minimum_is_one() {
        assert_eq!(Message::user("").approx_tokens(), 1);
    }

    #[test]
    fn approx_tokens_counts_tool_call_arguments() {
        let m = Message::assistant_tool_calls(
            None,
            vec![ToolCallRecord {
                id: "c1".into(),
                name: "abc".into(),           // 3 bytes
                arguments: "123456".into(),   // 6 bytes
            }],
        );
        assert_eq!(m.approx_tokens(), 3);
    }

    // ── Serialisation ─────────────────────────────────────────────────────────

    #[test]
    fn message_round_trips_through_json() {
        let original = Message::tool_result("id-1", "payload");
        let json = serde_json::to_string(&original).unwrap();
        let decoded: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn plain_message_omits_empty_fields() {
        let json = serde_json::to_string(&Message::user("hi")).unwrap();
        assert!(!json.contains("tool_calls"));
        assert!(!json.contains("tool_call_id"));
        assert!(!json.contains("reasoning_content"));
    }

    #[test]
    fn reasoning_content_survives_round_trip() {
        let mut m = Message::assistant_tool_calls(
            Some(String::new()),
            vec![ToolCallRecord {
                id: "c1".into(),
                name: "echo".into(),
                arguments: r#"{"text":"hi"}"#.into(),
            }],
        );
        m.reasoning_content = Some("tool decision rationale".into());
        let json = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.reasoning_content.as_deref(), Some("tool decision rationale"));
    }

    #[test]
    fn unknown_fields_are_ignored_on_load() {
        let json = r#"{"role":"user","content":"hi","some_future_field":42}"#;
        let m: Message = serde_json::from_str(json).unwrap();
        assert_eq!(m.as_text(), Some("hi"));
    }
}
