// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Tool execution gate.
//!
//! Every tool call emitted by the model passes through here.  The gate
//! validates arguments, partitions the batch by concurrency-safety, serves
//! read-only results from the session cache, and wraps each execution with
//! timeout, retry, policy hooks, progress forwarding, and output truncation.
//! A tool can fail, panic, or hang; the agent loop never sees anything but
//! an error-bearing [`ToolResult`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use scribe_config::PolicyMode;
use scribe_tools::{
    PolicyHook, ProgressSink, Severity, Tool, ToolCall, ToolRegistry, ToolResult,
};

use crate::bus::EventBus;
use crate::events::StreamEvent;
use crate::logging::{LogRecord, StructuredLog};

/// Outputs above this many characters are cut to a head+tail window before
/// they reach the context.
const TRUNCATE_CHARS: usize = 30_000;
const TRUNCATE_KEEP: usize = 15_000;

/// One completed call as returned to the turn driver, in completion order.
pub struct GateOutcome {
    pub call: ToolCall,
    pub result: ToolResult,
    pub cache_hit: bool,
}

pub struct ExecutionGate {
    registry: Arc<ToolRegistry>,
    policy: Arc<dyn PolicyHook>,
    policy_mode: PolicyMode,
    pool: Arc<Semaphore>,
    cache: Mutex<HashMap<String, ToolResult>>,
    log: Arc<StructuredLog>,
}

impl ExecutionGate {
    pub fn new(
        registry: Arc<ToolRegistry>,
        policy: Arc<dyn PolicyHook>,
        policy_mode: PolicyMode,
        pool_size: usize,
        log: Arc<StructuredLog>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            policy,
            policy_mode,
            pool: Arc::new(Semaphore::new(pool_size.max(1))),
            cache: Mutex::new(HashMap::new()),
            log,
        })
    }

    /// Execute one batch of tool calls.
    ///
    /// Concurrent-unsafe calls run sequentially in declared order; safe
    /// calls run in the bounded pool.  Outcomes are returned in completion
    /// order (each references its call id, so order among unrelated calls is
    /// immaterial to the context).
    pub async fn run_batch(
        self: &Arc<Self>,
        calls: Vec<ToolCall>,
        bus: &Arc<EventBus>,
        cancel: &CancellationToken,
    ) -> Vec<GateOutcome> {
        let (safe, sequential): (Vec<ToolCall>, Vec<ToolCall>) =
            calls.into_iter().partition(|c| {
                self.registry
                    .get(&c.name)
                    .map(|t| t.concurrent_safe())
                    // Unknown tools short-circuit in run_one; route them
                    // through the pool so they never delay the sequential lane.
                    .unwrap_or(true)
            });

        let mut join = JoinSet::new();
        for call in safe {
            let gate = Arc::clone(self);
            let bus = Arc::clone(bus);
            let cancel = cancel.clone();
            let pool = Arc::clone(&self.pool);
            join.spawn(async move {
                let _permit = pool.acquire_owned().await.expect("gate pool closed");
                gate.run_one(call, &bus, &cancel).await
            });
        }

        let mut outcomes = Vec::new();
        for call in sequential {
            outcomes.push(self.run_one(call, bus, cancel).await);
        }
        while let Some(res) = join.join_next().await {
            match res {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!(error = %e, "gate worker panicked"),
            }
        }
        outcomes
    }

    /// Run a single call through the full pipeline.  The `ToolCall`,
    /// `ToolProgress*`, `ToolResult` event triple is emitted in order.
    async fn run_one(
        &self,
        call: ToolCall,
        bus: &Arc<EventBus>,
        cancel: &CancellationToken,
    ) -> GateOutcome {
        // Validation short-circuit: invalid calls become synthetic error
        // results without touching policy, cache, or the executor.
        let (call, tool) = match self.registry.validate_tool_args(&call.name, &call.args) {
            Ok(normalised) => {
                let tool = self.registry.get(&call.name).expect("validated tool exists");
                let call = ToolCall {
                    args: Value::Object(normalised),
                    ..call
                };
                (call, tool)
            }
            Err(errors) => {
                bus.emit(StreamEvent::ToolCall {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    args: call.args.clone(),
                });
                let result = ToolResult::err(format!("invalid arguments: {}", errors.join("; ")));
                return self.finish(call, result, false, bus, 0.0);
            }
        };

        bus.emit(StreamEvent::ToolCall {
            id: call.id.clone(),
            name: call.name.clone(),
            args: call.args.clone(),
        });

        // Read-only cache: given identical (name, args), the executor runs
        // at most once per session.
        let cache_key = tool.read_only().then(|| cache_key(&call.name, &call.args));
        if let Some(key) = &cache_key {
            let cached = self.cache.lock().unwrap().get(key).cloned();
            if let Some(result) = cached {
                return self.finish(call, result, true, bus, 0.0);
            }
        }

        // Policy pre-hook.
        if self.policy_mode != PolicyMode::Off {
            let findings = self.policy.pre(&call.name, &call.args);
            let mut blocked: Option<String> = None;
            for f in findings {
                let severity = match (self.policy_mode, f.severity) {
                    // log_only downgrades every block to warn.
                    (PolicyMode::LogOnly, Severity::Block) => Severity::Warn,
                    (_, s) => s,
                };
                match severity {
                    Severity::Warn => {
                        bus.emit(StreamEvent::ToolPolicyWarn {
                            tool: call.name.clone(),
                            message: f.message.clone(),
                        });
                        warn!(tool = %call.name, policy = %f.policy, "{}", f.message);
                    }
                    Severity::Block => blocked = blocked.or(Some(f.message)),
                }
            }
            if let Some(msg) = blocked {
                bus.emit(StreamEvent::ToolPolicyBlock {
                    tool: call.name.clone(),
                    message: msg.clone(),
                });
                let result = ToolResult::err(format!("blocked by policy: {msg}"));
                return self.finish(call, result, false, bus, 0.0);
            }
        }

        // Execute with timeout and retry.
        let started = Instant::now();
        let mut attempt = 0u32;
        let mut result = loop {
            let result = self.execute_once(&tool, &call, bus, cancel).await;
            if result.is_error && result.retryable && attempt < tool.max_retries().min(3) {
                let delay = tool.base_delay() * 2u32.saturating_pow(attempt);
                attempt += 1;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break ToolResult::err("cancelled"),
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }
            break result;
        };

        // Policy post-hook may truncate or re-classify the raw result.
        if self.policy_mode != PolicyMode::Off {
            let (rewritten, findings) = self.policy.post(&call.name, &call.args, result);
            result = rewritten;
            for f in findings {
                bus.emit(StreamEvent::ToolPolicyWarn {
                    tool: call.name.clone(),
                    message: f.message,
                });
            }
        }

        result.output = truncate_output(std::mem::take(&mut result.output));

        if let (Some(key), false) = (&cache_key, result.is_error) {
            self.cache
                .lock()
                .unwrap()
                .insert(key.clone(), result.clone());
        }

        self.finish(call, result, false, bus, started.elapsed().as_secs_f64())
    }

    /// One execution attempt on its own task: a panic, a hang, or a prompt
    /// return all come back as a `ToolResult`.
    async fn execute_once(
        &self,
        tool: &Arc<dyn Tool>,
        call: &ToolCall,
        bus: &Arc<EventBus>,
        cancel: &CancellationToken,
    ) -> ToolResult {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = ProgressSink::new(tx);
        let bus2 = Arc::clone(bus);
        let progress_id = call.id.clone();
        let forward = tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                bus2.emit(StreamEvent::ToolProgress {
                    id: progress_id.clone(),
                    message: update.message,
                    pct: update.pct,
                });
            }
        });

        let tool2 = Arc::clone(tool);
        let call2 = call.clone();
        let handle = tokio::spawn(async move { tool2.execute(&call2, &sink).await });
        let abort = handle.abort_handle();

        let timeout = tool.timeout();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                abort.abort();
                ToolResult::err("cancelled")
            }
            joined = tokio::time::timeout(timeout, handle) => match joined {
                Err(_) => {
                    abort.abort();
                    // Deadline expiry behaves like a scoped cancel and is
                    // never retryable.
                    ToolResult::err(format!("timeout after {}s", timeout.as_secs()))
                }
                Ok(Ok(result)) => result,
                Ok(Err(e)) => ToolResult::err(format!("tool panicked: {e}")),
            }
        };

        // The executor task (and with it the sink) is gone; drain the
        // forwarder so every ToolProgress lands before the ToolResult.
        let _ = forward.await;
        result
    }

    /// Emit the terminal event, log the execution, and package the outcome.
    fn finish(
        &self,
        call: ToolCall,
        result: ToolResult,
        cache_hit: bool,
        bus: &Arc<EventBus>,
        elapsed_s: f64,
    ) -> GateOutcome {
        bus.emit(StreamEvent::ToolResult {
            id: call.id.clone(),
            output: result.to_content(),
            is_error: result.is_error,
            cache_hit,
        });
        self.log.write(&LogRecord::ToolExec {
            tool: call.name.clone(),
            elapsed_s: (elapsed_s * 1000.0).round() / 1000.0,
            output_len: result.output.len(),
            is_error: result.is_error,
        });
        GateOutcome {
            call,
            result,
            cache_hit,
        }
    }
}

/// Cache key over the canonical argument rendering.  serde_json maps are
/// ordered, so semantically equal objects serialise identically.
fn cache_key(name: &str, args: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(b"\0");
    hasher.update(args.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Cut output above [`TRUNCATE_CHARS`] characters down to the first and last
/// [`TRUNCATE_KEEP`] with an omission marker between.  Exactly-at-the-limit
/// output passes through unchanged.
fn truncate_output(output: String) -> String {
    let char_count = output.chars().count();
    if char_count <= TRUNCATE_CHARS {
        return output;
    }
    let head_end = output
        .char_indices()
        .nth(TRUNCATE_KEEP)
        .map(|(i, _)| i)
        .unwrap_or(output.len());
    let tail_start = output
        .char_indices()
        .nth(char_count - TRUNCATE_KEEP)
        .map(|(i, _)| i)
        .unwrap_or(0);
    format!(
        "{}\n...[truncated]...\n{}",
        &output[..head_end],
        &output[tail_start..]
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
