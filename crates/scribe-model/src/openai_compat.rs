// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! OpenAI-compatible chat-completions driver.
//!
//! Works against hosted OpenAI and the local servers that speak the same
//! wire format (LMStudio, Ollama, llama.cpp, vLLM).  This is a thin adapter
//! over the abstract [`ModelProvider`] contract; the engine never depends on
//! this wire format directly.

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use scribe_config::ModelConfig;

use crate::{
    provider::ChunkStream, CompletionRequest, Message, ModelProvider, Role, StreamChunk,
};

pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    chat_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiCompatProvider {
    pub fn from_config(cfg: &ModelConfig) -> anyhow::Result<Self> {
        let base = cfg
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        let api_key = cfg
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok());
        Ok(Self {
            client: reqwest::Client::new(),
            chat_url: format!("{}/chat/completions", base.trim_end_matches('/')),
            api_key,
            model: cfg.name.clone(),
        })
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ChunkStream> {
        let messages = build_wire_messages(&req.messages);
        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": req.stream,
            "stream_options": { "include_usage": true },
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        debug!(
            model = %self.model,
            tool_count = tools.len(),
            message_count = req.messages.len(),
            "sending completion request"
        );

        let mut http_req = self.client.post(&self.chat_url).json(&body);
        if let Some(key) = &self.api_key {
            http_req = http_req.bearer_auth(key);
        }

        let resp = http_req.send().await.context("provider request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("provider error {status}: {text}");
        }

        // SSE events can be split across TCP packets.  Maintain a line buffer
        // across chunks; emit chunks only for complete lines.
        let chunk_stream = resp
            .bytes_stream()
            .scan(String::new(), |buf, chunk| {
                let items: Vec<anyhow::Result<StreamChunk>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_complete_sse_lines(buf)
                    }
                    Err(e) => vec![Err(anyhow::anyhow!(e))],
                };
                std::future::ready(Some(items))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(chunk_stream))
    }
}

/// Drain all complete `\n`-terminated SSE lines from `buf`.
///
/// Any trailing incomplete line is left in `buf` so it can be extended by
/// the next TCP chunk.
pub(crate) fn drain_complete_sse_lines(buf: &mut String) -> Vec<anyhow::Result<StreamChunk>> {
    let mut items = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(item) = parse_sse_data_line(&line) {
            items.push(item);
        }
    }
    items
}

/// Parse a single complete SSE `data:` line into a [`StreamChunk`].
///
/// Returns `None` for empty lines, comment lines, or unparseable data.
fn parse_sse_data_line(line: &str) -> Option<anyhow::Result<StreamChunk>> {
    let data = line.strip_prefix("data: ")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return None;
    }
    let v: Value = serde_json::from_str(data).ok()?;
    parse_sse_chunk(&v)
}

fn parse_sse_chunk(v: &Value) -> Option<anyhow::Result<StreamChunk>> {
    // Usage-only chunk (emitted when stream_options.include_usage = true)
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        let cached_tokens = usage
            .get("prompt_tokens_details")
            .and_then(|d| d.get("cached_tokens"))
            .and_then(|t| t.as_u64())
            .unwrap_or(0);
        return Some(Ok(StreamChunk::Usage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
            cached_tokens,
        }));
    }

    let choice = &v["choices"][0];

    if let Some(reason) = choice["finish_reason"].as_str() {
        return Some(Ok(StreamChunk::Done {
            finish_reason: reason.to_string(),
        }));
    }

    let delta = &choice["delta"];

    // Tool call delta — each SSE chunk carries one tool-call fragment in
    // practice; the index routes accumulation in the turn driver.
    if let Some(tc) = delta.get("tool_calls").and_then(|t| t.get(0)) {
        return Some(Ok(StreamChunk::ToolCallDelta {
            index: tc["index"].as_u64().unwrap_or(0) as u32,
            id: tc["id"].as_str().unwrap_or("").to_string(),
            name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
            arguments_partial: tc["function"]["arguments"].as_str().unwrap_or("").to_string(),
        }));
    }

    if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
        if !text.is_empty() {
            return Some(Ok(StreamChunk::TextDelta(text.to_string())));
        }
    }

    None
}

fn role_str(r: &Role) -> &'static str {
    match r {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

/// Convert messages into the OpenAI wire-format JSON array.
///
/// Extracted as a free function so it can be unit-tested without HTTP.
pub(crate) fn build_wire_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            let mut obj = json!({ "role": role_str(&m.role) });
            // OpenAI requires "content": null rather than a missing key for
            // assistant messages that carry only tool calls.
            obj["content"] = match &m.content {
                Some(c) => json!(c),
                None => Value::Null,
            };
            if !m.tool_calls.is_empty() {
                obj["tool_calls"] = Value::Array(
                    m.tool_calls
                        .iter()
                        .map(|tc| {
                            json!({
                                "id": tc.id,
                                "type": "function",
                                "function": { "name": tc.name, "arguments": tc.arguments },
                            })
                        })
                        .collect(),
                );
            }
            if let Some(id) = &m.tool_call_id {
                obj["tool_call_id"] = json!(id);
            }
            obj
        })
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolCallRecord;

    fn drain(s: &str) -> Vec<StreamChunk> {
        let mut buf = s.to_string();
        drain_complete_sse_lines(&mut buf)
            .into_iter()
            .map(|r| r.unwrap())
            .collect()
    }

    // ── SSE framing ───────────────────────────────────────────────────────────

    #[test]
    fn text_delta_line_parses() {
        let chunks = drain("data: {\"choices\":[{\"delta\":{\"content\":\"hello\"}}]}\n");
        assert!(matches!(&chunks[0], StreamChunk::TextDelta(t) if t == "hello"));
    }

    #[test]
    fn partial_line_is_left_in_buffer() {
        let mut buf = "data: {\"choices\":[{\"delta\":{\"content\":\"hel".to_string();
        let chunks = drain_complete_sse_lines(&mut buf);
        assert!(chunks.is_empty());
        assert!(buf.starts_with("data: "));
    }

    #[test]
    fn split_line_completes_across_chunks() {
        let mut buf = "data: {\"choices\":[{\"delta\":{\"content\":\"hel".to_string();
        assert!(drain_complete_sse_lines(&mut buf).is_empty());
        buf.push_str("lo\"}}]}\n");
        let chunks = drain_complete_sse_lines(&mut buf);
        assert_eq!(chunks.len(), 1);
        assert!(matches!(
            chunks[0].as_ref().unwrap(),
            StreamChunk::TextDelta(t) if t == "hello"
        ));
    }

    #[test]
    fn done_sentinel_is_silent() {
        assert!(drain("data: [DONE]\n").is_empty());
    }

    #[test]
    fn crlf_line_endings_are_tolerated() {
        let chunks = drain("data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\r\n");
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn finish_reason_maps_to_done() {
        let chunks =
            drain("data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n");
        assert!(matches!(&chunks[0], StreamChunk::Done { finish_reason } if finish_reason == "stop"));
    }

    #[test]
    fn tool_call_delta_carries_index_id_name_args() {
        let line = concat!(
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":1,\"id\":\"c1\",",
            "\"function\":{\"name\":\"grep\",\"arguments\":\"{\\\"pat\"}}]}}]}\n"
        );
        let chunks = drain(line);
        match &chunks[0] {
            StreamChunk::ToolCallDelta { index, id, name, arguments_partial } => {
                assert_eq!(*index, 1);
                assert_eq!(id, "c1");
                assert_eq!(name, "grep");
                assert_eq!(arguments_partial, "{\"pat");
            }
            other => panic!("unexpected chunk: {other:?}"),
        }
    }

    #[test]
    fn usage_chunk_reads_cached_tokens() {
        let line = concat!(
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":100,\"completion_tokens\":20,",
            "\"prompt_tokens_details\":{\"cached_tokens\":60}}}\n"
        );
        let chunks = drain(line);
        match &chunks[0] {
            StreamChunk::Usage { input_tokens, output_tokens, cached_tokens } => {
                assert_eq!(*input_tokens, 100);
                assert_eq!(*output_tokens, 20);
                assert_eq!(*cached_tokens, 60);
            }
            other => panic!("unexpected chunk: {other:?}"),
        }
    }

    // ── Wire message shape ────────────────────────────────────────────────────

    #[test]
    fn assistant_tool_call_message_serialises_null_content() {
        let msgs = build_wire_messages(&[Message::assistant_tool_calls(
            None,
            vec![ToolCallRecord {
                id: "c1".into(),
                name: "shell".into(),
                arguments: "{}".into(),
            }],
        )]);
        assert!(msgs[0]["content"].is_null());
        assert_eq!(msgs[0]["tool_calls"][0]["function"]["name"], "shell");
    }

    #[test]
    fn tool_result_message_carries_tool_call_id() {
        let msgs = build_wire_messages(&[Message::tool_result("c1", "output")]);
        assert_eq!(msgs[0]["role"], "tool");
        assert_eq!(msgs[0]["tool_call_id"], "c1");
        assert_eq!(msgs[0]["content"], "output");
    }
}
