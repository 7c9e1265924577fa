// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{provider::ChunkStream, CompletionRequest, ModelProvider, Role, StreamChunk};

/// Deterministic mock provider for tests.  Echoes the last user message
/// back as the assistant response.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ChunkStream> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .and_then(|m| m.as_text())
            .unwrap_or("[no input]")
            .to_string();

        let chunks: Vec<anyhow::Result<StreamChunk>> = vec![
            Ok(StreamChunk::TextDelta(format!("MOCK: {reply}"))),
            Ok(StreamChunk::Usage {
                input_tokens: 10,
                output_tokens: 10,
                cached_tokens: 0,
            }),
            Ok(StreamChunk::Done {
                finish_reason: "stop".into(),
            }),
        ];
        Ok(Box::pin(stream::iter(chunks)))
    }
}

/// One scripted item: either a chunk to emit or an error to inject
/// mid-stream.  Errors let tests exercise partial-response recovery.
#[derive(Debug, Clone)]
pub enum ScriptItem {
    Chunk(StreamChunk),
    Error(String),
}

/// A pre-scripted provider.  Each call to `complete` pops the next script
/// from the front of the queue, so tests can specify exact chunk sequences —
/// including tool calls and mid-stream failures — without network access.
pub struct ScriptedProvider {
    scripts: Arc<Mutex<Vec<Vec<ScriptItem>>>>,
    /// Number of `complete()` calls made so far.
    pub calls: Arc<Mutex<u32>>,
    /// The last `CompletionRequest` seen, for request-shape assertions.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Vec<ScriptItem>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            calls: Arc::new(Mutex::new(0)),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Convenience: provider that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![Self::text_script(reply)])
    }

    /// Convenience: provider that returns a tool call, then a text reply on
    /// the following call.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            Self::tool_call_script(&[(tool_id.into(), tool_name.into(), args_json.into())]),
            Self::text_script(final_text),
        ])
    }

    /// Script emitting a single text reply with usage.
    pub fn text_script(reply: impl Into<String>) -> Vec<ScriptItem> {
        vec![
            ScriptItem::Chunk(StreamChunk::TextDelta(reply.into())),
            ScriptItem::Chunk(StreamChunk::Usage {
                input_tokens: 5,
                output_tokens: 5,
                cached_tokens: 0,
            }),
            ScriptItem::Chunk(StreamChunk::Done {
                finish_reason: "stop".into(),
            }),
        ]
    }

    /// Script emitting one or more complete tool calls in a single turn.
    pub fn tool_call_script(calls: &[(String, String, String)]) -> Vec<ScriptItem> {
        let mut items = Vec::new();
        for (i, (id, name, args)) in calls.iter().enumerate() {
            items.push(ScriptItem::Chunk(StreamChunk::ToolCallDelta {
                index: i as u32,
                id: id.clone(),
                name: name.clone(),
                arguments_partial: args.clone(),
            }));
        }
        items.push(ScriptItem::Chunk(StreamChunk::Done {
            finish_reason: "tool_calls".into(),
        }));
        items
    }

    /// Script that streams `partial`, then fails mid-stream.
    pub fn partial_then_error(partial: impl Into<String>, error: impl Into<String>) -> Vec<ScriptItem> {
        vec![
            ScriptItem::Chunk(StreamChunk::TextDelta(partial.into())),
            ScriptItem::Error(error.into()),
        ]
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted-mock"
    }
    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ChunkStream> {
        *self.last_request.lock().unwrap() = Some(req);
        *self.calls.lock().unwrap() += 1;
        let items = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed
                vec![
                    ScriptItem::Chunk(StreamChunk::TextDelta("[no more scripts]".into())),
                    ScriptItem::Chunk(StreamChunk::Done {
                        finish_reason: "stop".into(),
                    }),
                ]
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<anyhow::Result<StreamChunk>> = items
            .into_iter()
            .map(|item| match item {
                ScriptItem::Chunk(c) => Ok(c),
                ScriptItem::Error(e) => Err(anyhow::anyhow!(e)),
            })
            .collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
