// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The turn driver: one agentic turn of model ↔ tool interaction.
//!
//! A turn is a loop over steps.  Each step submits the context to the
//! provider, streams the response onto the bus, dispatches any tool calls
//! through the gate, appends the results, and repeats until the model stops,
//! the step budget runs out, or the session is cancelled.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use scribe_config::EngineConfig;
use scribe_model::{
    CompletionRequest, Message, ModelProvider, StreamChunk, ToolCallRecord, ToolSchema, Usage,
};
use scribe_tools::{ToolCall, ToolRegistry};

use crate::bus::EventBus;
use crate::context::Context;
use crate::cost::{CostTracker, ModelUsage};
use crate::deferred::DeferredPersistenceBuffer;
use crate::events::{DoneReason, StreamEvent};
use crate::gate::ExecutionGate;
use crate::logging::{LlmCallTimer, LogRecord, StructuredLog};
use crate::store::Persistence;

/// Observable phase of the turn state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Ready,
    Calling,
    Streaming,
    DispatchingTools,
    Awaiting,
    Done,
    Failed,
    Cancelled,
}

/// What one turn produced (events travel separately, over the bus).
#[derive(Debug, Clone)]
pub struct TurnSummary {
    pub final_text: String,
    pub usage: ModelUsage,
    pub steps: u32,
    pub done: DoneReason,
}

enum StepOutcome {
    Completed {
        text: String,
        calls: Vec<ToolCall>,
        records: Vec<ToolCallRecord>,
    },
    Cancelled,
    Failed(String),
}

enum StreamEnd {
    Complete {
        text: String,
        pending: Vec<PendingToolCall>,
        finish_reason: String,
        usage: Usage,
    },
    Cancelled {
        partial: String,
    },
    Error {
        partial: String,
        partial_tool_call_bytes: usize,
        error: String,
    },
}

pub struct TurnDriver {
    model: Arc<dyn ModelProvider>,
    registry: Arc<ToolRegistry>,
    gate: Arc<ExecutionGate>,
    context: Context,
    config: EngineConfig,
    cost: CostTracker,
    log: Arc<StructuredLog>,
    deferred: Arc<Mutex<DeferredPersistenceBuffer>>,
    persistence: Option<Arc<dyn Persistence>>,
    session_id: String,
    state: TurnState,
}

impl TurnDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model: Arc<dyn ModelProvider>,
        registry: Arc<ToolRegistry>,
        gate: Arc<ExecutionGate>,
        context: Context,
        config: EngineConfig,
        log: Arc<StructuredLog>,
        session_id: String,
        persistence: Option<Arc<dyn Persistence>>,
    ) -> Self {
        Self {
            model,
            registry,
            gate,
            context,
            config,
            cost: CostTracker::new(),
            log,
            deferred: Arc::new(Mutex::new(DeferredPersistenceBuffer::new())),
            persistence,
            session_id,
            state: TurnState::Ready,
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    pub fn cost(&self) -> &CostTracker {
        &self.cost
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Shared handle for product tools that coalesce writes until turn end.
    pub fn deferred(&self) -> Arc<Mutex<DeferredPersistenceBuffer>> {
        Arc::clone(&self.deferred)
    }

    /// Run one turn.  Exactly one `Done` event is emitted on the bus, the
    /// deferred buffer is flushed regardless of how the turn ended, and the
    /// context is left pairing-valid.
    pub async fn run_turn(
        &mut self,
        prompt: &str,
        bus: &Arc<EventBus>,
        cancel: &CancellationToken,
    ) -> TurnSummary {
        self.cost.begin_turn();
        let mut final_text = String::new();
        let mut steps = 0u32;
        let mut turn_error: Option<String> = None;

        // Resuming a session and submitting an empty prompt must produce
        // only a Done event.
        if prompt.trim().is_empty() {
            self.state = TurnState::Done;
            self.flush_deferred();
            bus.emit(StreamEvent::Done {
                reason: DoneReason::Stop,
            });
            return TurnSummary {
                final_text,
                usage: self.cost.turn_delta(),
                steps,
                done: DoneReason::Stop,
            };
        }

        if !cancel.is_cancelled() {
            self.push_message(Message::user(prompt));
        }

        let reason = loop {
            if cancel.is_cancelled() {
                break DoneReason::Cancelled;
            }
            if steps >= self.config.max_steps {
                break DoneReason::StepLimitReached;
            }
            steps += 1;

            if self.context.token_estimate() > self.config.compaction_threshold_tokens {
                let elided = self.context.compact(self.config.compaction_keep_recent);
                if elided > 0 {
                    debug!(elided, "compacted context before provider call");
                }
            }

            match self.run_step(bus, cancel).await {
                StepOutcome::Cancelled => break DoneReason::Cancelled,
                StepOutcome::Failed(msg) => {
                    turn_error = Some(msg);
                    break DoneReason::Error;
                }
                StepOutcome::Completed {
                    text,
                    calls,
                    records,
                } => {
                    let delta = self.cost.turn_delta();
                    self.log.write(&LogRecord::TurnStep {
                        step: steps,
                        text_len: text.len(),
                        tool_calls: calls.len(),
                        input_tokens: delta.input_tokens,
                        output_tokens: delta.output_tokens,
                        cost_usd: delta.usd,
                    });

                    if calls.is_empty() {
                        if !text.is_empty() {
                            bus.emit(StreamEvent::Text { text: text.clone() });
                            self.push_message(Message::assistant(text.clone()));
                            final_text = text;
                        }
                        break DoneReason::Stop;
                    }

                    if !text.is_empty() {
                        bus.emit(StreamEvent::Text { text: text.clone() });
                        final_text = text.clone();
                    }
                    let content = if text.is_empty() { None } else { Some(text) };
                    self.push_message(Message::assistant_tool_calls(content, records));

                    self.state = TurnState::DispatchingTools;
                    let outcomes = self.gate.run_batch(calls, bus, cancel).await;
                    self.state = TurnState::Awaiting;
                    for outcome in outcomes {
                        self.push_message(Message::tool_result(
                            outcome.call.id.clone(),
                            outcome.result.to_content(),
                        ));
                    }

                    // A cancel that lands between the provider's last chunk
                    // and tool dispatch arrives here with synthetic
                    // `cancelled` results already paired in.
                    if cancel.is_cancelled() {
                        break DoneReason::Cancelled;
                    }
                }
            }
        };

        if let Err(e) = self.context.validate_pairing() {
            // Internal invariant violation: surface and end the turn; the
            // session remains resumable from disk.
            bus.emit(StreamEvent::Error {
                message: format!("context pairing violated: {e}"),
            });
        }
        if let Some(msg) = turn_error {
            bus.emit(StreamEvent::Error { message: msg });
        }

        // The deferred buffer flushes no matter how the turn ended; its
        // failures are logged, never re-raised.
        self.flush_deferred();

        self.state = match reason {
            DoneReason::Stop | DoneReason::StepLimitReached => TurnState::Done,
            DoneReason::Cancelled => TurnState::Cancelled,
            DoneReason::Error => TurnState::Failed,
        };
        bus.emit(StreamEvent::Done { reason });

        TurnSummary {
            final_text,
            usage: self.cost.turn_delta(),
            steps,
            done: reason,
        }
    }

    /// One provider call with retry and context-overflow recovery.
    async fn run_step(&mut self, bus: &Arc<EventBus>, cancel: &CancellationToken) -> StepOutcome {
        let mut attempt = 0u32;
        let mut compacted_for_overflow = false;

        loop {
            self.state = TurnState::Calling;
            let req = CompletionRequest {
                messages: self.context.get_messages(),
                tools: self.tool_schemas(),
                stream: true,
            };
            let timer = LlmCallTimer::start(self.model.model_name(), attempt);

            let stream = match self.model.complete(req).await {
                Ok(s) => s,
                Err(e) => {
                    // A context-length rejection triggers a single compaction
                    // attempt before normal retry/raise handling.
                    if is_context_length_error(&e) && !compacted_for_overflow {
                        compacted_for_overflow = true;
                        let elided = self.context.compact(self.config.compaction_keep_recent);
                        timer.error(&self.log, &format!("context length: {e}"), 0, 0);
                        if elided > 0 {
                            continue;
                        }
                    } else {
                        timer.error(&self.log, &e.to_string(), 0, 0);
                    }
                    if attempt < self.config.provider_retries {
                        attempt += 1;
                        continue;
                    }
                    return StepOutcome::Failed(format!("model completion failed: {e}"));
                }
            };

            self.state = TurnState::Streaming;
            match self.consume_stream(stream, bus, cancel).await {
                StreamEnd::Cancelled { partial } => {
                    if !partial.is_empty() {
                        self.push_message(Message::assistant(partial));
                    }
                    return StepOutcome::Cancelled;
                }
                StreamEnd::Error {
                    partial,
                    partial_tool_call_bytes,
                    error,
                } => {
                    // Salvage: text already streamed is committed as an
                    // assistant message; partial tool-call fragments are
                    // only recorded in the log, never replayed.
                    timer.error(&self.log, &error, partial.len(), partial_tool_call_bytes);
                    if !partial.is_empty() {
                        self.push_message(Message::assistant(partial));
                    }
                    if attempt < self.config.provider_retries {
                        attempt += 1;
                        continue;
                    }
                    return StepOutcome::Failed(error);
                }
                StreamEnd::Complete {
                    text,
                    pending,
                    finish_reason,
                    usage,
                } => {
                    let (calls, records) = finalize_tool_calls(pending);
                    timer.success(
                        &self.log,
                        usage.input_tokens,
                        usage.output_tokens,
                        &finish_reason,
                        calls.len(),
                    );
                    return StepOutcome::Completed {
                        text,
                        calls,
                        records,
                    };
                }
            }
        }
    }

    /// Consume provider chunks, forwarding deltas to the bus and buffering
    /// tool-call fragments keyed by the provider's parallel-call index.
    async fn consume_stream(
        &mut self,
        mut stream: scribe_model::ChunkStream,
        bus: &Arc<EventBus>,
        cancel: &CancellationToken,
    ) -> StreamEnd {
        let mut text = String::new();
        let mut pending: HashMap<u32, PendingToolCall> = HashMap::new();
        let mut finish_reason = String::new();
        let mut usage = Usage::default();

        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return StreamEnd::Cancelled { partial: text };
                }
                item = stream.next() => item,
            };
            let Some(item) = item else { break };
            match item {
                Err(e) => {
                    let partial_tool_call_bytes =
                        pending.values().map(|p| p.args_buf.len()).sum();
                    return StreamEnd::Error {
                        partial: text,
                        partial_tool_call_bytes,
                        error: e.to_string(),
                    };
                }
                Ok(StreamChunk::TextDelta(delta)) if !delta.is_empty() => {
                    text.push_str(&delta);
                    bus.emit(StreamEvent::TextDelta { text: delta });
                }
                Ok(StreamChunk::TextDelta(_)) => {}
                Ok(StreamChunk::ToolCallDelta {
                    index,
                    id,
                    name,
                    arguments_partial,
                }) => {
                    let entry = pending.entry(index).or_insert_with(|| PendingToolCall {
                        index,
                        id: String::new(),
                        name: String::new(),
                        args_buf: String::new(),
                    });
                    if !id.is_empty() {
                        entry.id = id;
                    }
                    if !name.is_empty() {
                        entry.name = name;
                    }
                    entry.args_buf.push_str(&arguments_partial);
                }
                Ok(StreamChunk::Usage {
                    input_tokens,
                    output_tokens,
                    cached_tokens,
                }) => {
                    usage = Usage {
                        input_tokens,
                        output_tokens,
                        cached_tokens,
                    };
                    self.cost.add_usage(self.model.model_name(), &usage);
                    let delta = self.cost.turn_delta();
                    bus.emit(StreamEvent::UsageUpdate {
                        input_tokens: delta.input_tokens,
                        output_tokens: delta.output_tokens,
                        cached_tokens: delta.cached_tokens,
                        cost_usd: delta.usd,
                    });
                }
                Ok(StreamChunk::Done { finish_reason: f }) => {
                    // Usage may still follow the finish chunk; keep draining
                    // until the stream itself ends.
                    finish_reason = f;
                }
            }
        }

        StreamEnd::Complete {
            text,
            pending: {
                let mut items: Vec<PendingToolCall> = pending.into_values().collect();
                items.sort_by_key(|p| p.index);
                items
            },
            finish_reason,
            usage,
        }
    }

    fn tool_schemas(&self) -> Vec<ToolSchema> {
        self.registry
            .schemas()
            .into_iter()
            .map(|s| ToolSchema {
                name: s.name,
                description: s.description,
                parameters: s.parameters,
            })
            .collect()
    }

    /// Append to the context and mirror to persistence; persistence failures
    /// are logged, never surfaced into the loop.
    fn push_message(&mut self, msg: Message) {
        if let Some(p) = &self.persistence {
            if let Err(e) = p.append_message(&self.session_id, &msg) {
                warn!(session_id = %self.session_id, error = %e, "failed to persist message");
            }
        }
        self.context.push(msg);
    }

    fn flush_deferred(&mut self) {
        let mut deferred = self.deferred.lock().unwrap();
        if deferred.has_pending() {
            deferred.flush(self.persistence.as_deref(), &self.session_id);
        }
    }
}

struct PendingToolCall {
    index: u32,
    id: String,
    name: String,
    args_buf: String,
}

/// Turn accumulated fragments into dispatchable calls plus the records that
/// go on the assistant message.
///
/// Calls with an empty name cannot be dispatched and are dropped; an empty
/// id gets a synthetic fallback so the pairing invariant can still be kept.
/// Argument buffers that fail to parse are replaced by `{}` — the gate's
/// schema validation then reports the missing parameters to the model.
fn finalize_tool_calls(pending: Vec<PendingToolCall>) -> (Vec<ToolCall>, Vec<ToolCallRecord>) {
    let mut calls = Vec::new();
    let mut records = Vec::new();
    for (i, p) in pending.into_iter().enumerate() {
        if p.name.is_empty() {
            warn!(tool_call_id = %p.id, "dropping tool call with empty name");
            continue;
        }
        let id = if p.id.is_empty() {
            warn!(tool_name = %p.name, "tool call had empty id; generating synthetic id");
            format!("tc_synthetic_{i}")
        } else {
            p.id
        };
        let args: Value = if p.args_buf.is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(&p.args_buf).unwrap_or_else(|e| {
                warn!(tool_name = %p.name, error = %e, "invalid JSON tool arguments; substituting {{}}");
                Value::Object(Default::default())
            })
        };
        records.push(ToolCallRecord {
            id: id.clone(),
            name: p.name.clone(),
            arguments: args.to_string(),
        });
        calls.push(ToolCall {
            id,
            name: p.name,
            args,
        });
    }
    (calls, records)
}

fn is_context_length_error(e: &anyhow::Error) -> bool {
    let msg = e.to_string().to_lowercase();
    msg.contains("context_length")
        || msg.contains("context length")
        || msg.contains("maximum context")
        || msg.contains("exceed_context_size")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
