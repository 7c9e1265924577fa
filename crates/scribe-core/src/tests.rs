// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! End-to-end tests for the turn driver, gate, and bus working together.
//!
//! Uses `ScriptedProvider` so every scenario is deterministic and requires
//! no network access.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use scribe_config::{EngineConfig, PolicyMode, ToolsConfig};
use scribe_model::{Role, ScriptedProvider};
use scribe_tools::{
    NoopPolicy, PatternPolicy, PolicyHook, ProgressSink, Tool, ToolCall, ToolParam, ToolRegistry,
    ToolResult,
};

use crate::bus::EventBus;
use crate::context::Context;
use crate::driver::{TurnDriver, TurnSummary};
use crate::events::{DoneReason, EventEnvelope, StreamEvent};
use crate::gate::ExecutionGate;
use crate::logging::StructuredLog;

// ── Test tools ────────────────────────────────────────────────────────────────

/// Read-only echo; counts executor invocations for cache assertions.
struct EchoTool {
    invocations: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "echoes text"
    }
    fn parameters(&self) -> Vec<ToolParam> {
        vec![ToolParam::string("text", "text to echo")]
    }
    fn read_only(&self) -> bool {
        true
    }
    async fn execute(&self, call: &ToolCall, _progress: &ProgressSink) -> ToolResult {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        ToolResult::ok(call.args["text"].as_str().unwrap_or_default())
    }
}

/// Concurrent-safe sleeper for pool parallelism assertions.
struct SleepTool;

#[async_trait]
impl Tool for SleepTool {
    fn name(&self) -> &str {
        "sleep"
    }
    fn description(&self) -> &str {
        "sleeps for ms"
    }
    fn parameters(&self) -> Vec<ToolParam> {
        vec![ToolParam::integer("ms", "milliseconds")]
    }
    async fn execute(&self, call: &ToolCall, _progress: &ProgressSink) -> ToolResult {
        let ms = call.args["ms"].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        ToolResult::ok(format!("slept {ms}ms"))
    }
}

/// Concurrent-unsafe sleeper for sequential-lane assertions.
struct UnsafeSleepTool;

#[async_trait]
impl Tool for UnsafeSleepTool {
    fn name(&self) -> &str {
        "unsafe_sleep"
    }
    fn description(&self) -> &str {
        "sleeps, not concurrency-safe"
    }
    fn parameters(&self) -> Vec<ToolParam> {
        vec![ToolParam::integer("ms", "milliseconds")]
    }
    fn concurrent_safe(&self) -> bool {
        false
    }
    async fn execute(&self, call: &ToolCall, _progress: &ProgressSink) -> ToolResult {
        let ms = call.args["ms"].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        ToolResult::ok("done")
    }
}

/// Fails with a retryable error until `succeed_after` attempts have run.
struct FlakyTool {
    attempts: Arc<AtomicUsize>,
    succeed_after: usize,
}

#[async_trait]
impl Tool for FlakyTool {
    fn name(&self) -> &str {
        "flaky"
    }
    fn description(&self) -> &str {
        "transiently failing tool"
    }
    fn parameters(&self) -> Vec<ToolParam> {
        Vec::new()
    }
    fn max_retries(&self) -> u32 {
        3
    }
    fn base_delay(&self) -> Duration {
        Duration::from_millis(1)
    }
    async fn execute(&self, _call: &ToolCall, _progress: &ProgressSink) -> ToolResult {
        let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if n < self.succeed_after {
            ToolResult::err_retryable("backend hiccup")
        } else {
            ToolResult::ok("recovered")
        }
    }
}

/// Hangs long enough to trip its own deadline.
struct HangingTool {
    invocations: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for HangingTool {
    fn name(&self) -> &str {
        "hang"
    }
    fn description(&self) -> &str {
        "sleeps past its deadline"
    }
    fn parameters(&self) -> Vec<ToolParam> {
        Vec::new()
    }
    fn timeout(&self) -> Duration {
        Duration::from_millis(100)
    }
    fn max_retries(&self) -> u32 {
        3
    }
    async fn execute(&self, _call: &ToolCall, _progress: &ProgressSink) -> ToolResult {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(10)).await;
        ToolResult::ok("never")
    }
}

struct PanicTool;

#[async_trait]
impl Tool for PanicTool {
    fn name(&self) -> &str {
        "panicker"
    }
    fn description(&self) -> &str {
        "panics on execute"
    }
    fn parameters(&self) -> Vec<ToolParam> {
        Vec::new()
    }
    async fn execute(&self, _call: &ToolCall, _progress: &ProgressSink) -> ToolResult {
        panic!("tool bug");
    }
}

/// Streams two progress updates before finishing.
struct ProgressTool;

#[async_trait]
impl Tool for ProgressTool {
    fn name(&self) -> &str {
        "progressive"
    }
    fn description(&self) -> &str {
        "reports progress"
    }
    fn parameters(&self) -> Vec<ToolParam> {
        Vec::new()
    }
    async fn execute(&self, _call: &ToolCall, progress: &ProgressSink) -> ToolResult {
        progress.report("halfway", Some(0.5));
        progress.report("almost", Some(0.9));
        ToolResult::ok("finished")
    }
}

/// Shell-shaped tool for policy tests; counts invocations.
struct CommandTool {
    invocations: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for CommandTool {
    fn name(&self) -> &str {
        "shell"
    }
    fn description(&self) -> &str {
        "pretend shell"
    }
    fn parameters(&self) -> Vec<ToolParam> {
        vec![ToolParam::string("command", "command to run")]
    }
    async fn execute(&self, _call: &ToolCall, _progress: &ProgressSink) -> ToolResult {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        ToolResult::ok("ran")
    }
}

/// Emits output of a configurable size for truncation assertions.
struct BigOutputTool {
    chars: usize,
}

#[async_trait]
impl Tool for BigOutputTool {
    fn name(&self) -> &str {
        "bigout"
    }
    fn description(&self) -> &str {
        "produces large output"
    }
    fn parameters(&self) -> Vec<ToolParam> {
        Vec::new()
    }
    async fn execute(&self, _call: &ToolCall, _progress: &ProgressSink) -> ToolResult {
        ToolResult::ok("y".repeat(self.chars))
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn gate_for(registry: &Arc<ToolRegistry>, pool: usize) -> Arc<ExecutionGate> {
    gate_with_policy(registry, Arc::new(NoopPolicy), PolicyMode::Off, pool)
}

fn gate_with_policy(
    registry: &Arc<ToolRegistry>,
    policy: Arc<dyn PolicyHook>,
    mode: PolicyMode,
    pool: usize,
) -> Arc<ExecutionGate> {
    ExecutionGate::new(
        Arc::clone(registry),
        policy,
        mode,
        pool,
        Arc::new(StructuredLog::disabled()),
    )
}

fn driver_for(provider: ScriptedProvider, registry: ToolRegistry, config: EngineConfig) -> TurnDriver {
    let registry = Arc::new(registry);
    let gate = gate_for(&registry, config.tool_pool_size);
    driver_with_gate(provider, registry, gate, config)
}

fn driver_with_gate(
    provider: ScriptedProvider,
    registry: Arc<ToolRegistry>,
    gate: Arc<ExecutionGate>,
    config: EngineConfig,
) -> TurnDriver {
    TurnDriver::new(
        Arc::new(provider),
        registry,
        gate,
        Context::new("sys"),
        config,
        Arc::new(StructuredLog::disabled()),
        "test-session".into(),
        None,
    )
}

async fn run(driver: &mut TurnDriver, prompt: &str) -> (TurnSummary, Vec<Arc<EventEnvelope>>) {
    let bus = EventBus::new("test-session");
    let cancel = CancellationToken::new();
    let summary = driver.run_turn(prompt, &bus, &cancel).await;
    let (events, _) = bus.events_since(0);
    (summary, events)
}

fn seq_of(events: &[Arc<EventEnvelope>], pred: impl Fn(&StreamEvent) -> bool) -> Option<u64> {
    events.iter().find(|e| pred(&e.event)).map(|e| e.seq)
}

fn tc(id: &str, name: &str, args: &str) -> (String, String, String) {
    (id.to_string(), name.to_string(), args.to_string())
}

// ── Basic text turn ───────────────────────────────────────────────────────────

#[tokio::test]
async fn text_turn_emits_delta_text_and_done() {
    let mut driver = driver_for(
        ScriptedProvider::always_text("hello there"),
        ToolRegistry::new(),
        EngineConfig::default(),
    );
    let (summary, events) = run(&mut driver, "hi").await;

    assert_eq!(summary.final_text, "hello there");
    assert_eq!(summary.done, DoneReason::Stop);
    assert!(matches!(&events[0].event, StreamEvent::TextDelta { text } if text == "hello there"));
    assert!(events
        .iter()
        .any(|e| matches!(&e.event, StreamEvent::Text { text } if text == "hello there")));
    assert!(events.last().unwrap().event.is_done());
}

#[tokio::test]
async fn context_records_user_and_assistant() {
    let mut driver = driver_for(
        ScriptedProvider::always_text("reply"),
        ToolRegistry::new(),
        EngineConfig::default(),
    );
    run(&mut driver, "my question").await;

    let msgs = driver.context().messages();
    assert_eq!(msgs.len(), 2);
    assert_eq!(msgs[0].role, Role::User);
    assert_eq!(msgs[0].as_text(), Some("my question"));
    assert_eq!(msgs[1].role, Role::Assistant);
    assert_eq!(msgs[1].as_text(), Some("reply"));
}

// ── Tool round-trip ───────────────────────────────────────────────────────────

#[tokio::test]
async fn tool_call_round_trip_keeps_pairing() {
    let mut reg = ToolRegistry::new();
    reg.register(EchoTool {
        invocations: Arc::new(AtomicUsize::new(0)),
    });
    let mut driver = driver_for(
        ScriptedProvider::tool_then_text("c1", "echo", r#"{"text":"ping"}"#, "pong"),
        reg,
        EngineConfig::default(),
    );
    let (summary, events) = run(&mut driver, "go").await;

    assert_eq!(summary.final_text, "pong");
    assert!(driver.context().validate_pairing().is_ok());
    let call_seq = seq_of(&events, |e| matches!(e, StreamEvent::ToolCall { id, .. } if id == "c1"));
    let result_seq =
        seq_of(&events, |e| matches!(e, StreamEvent::ToolResult { id, .. } if id == "c1"));
    assert!(call_seq.unwrap() < result_seq.unwrap());

    // assistant-with-calls, tool result, final assistant
    let roles: Vec<Role> = driver.context().messages().iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
    assert!(driver.context().messages()[1].has_tool_calls());
}

#[tokio::test]
async fn unknown_tool_becomes_error_result_and_turn_continues() {
    let mut driver = driver_for(
        ScriptedProvider::tool_then_text("c1", "nonexistent", "{}", "recovered"),
        ToolRegistry::new(),
        EngineConfig::default(),
    );
    let (summary, events) = run(&mut driver, "go").await;

    assert_eq!(summary.done, DoneReason::Stop);
    assert!(events.iter().any(|e| matches!(
        &e.event,
        StreamEvent::ToolResult { is_error: true, output, .. } if output.contains("unknown tool")
    )));
    assert!(driver.context().validate_pairing().is_ok());
}

#[tokio::test]
async fn invalid_arguments_short_circuit_to_error_result() {
    let mut reg = ToolRegistry::new();
    let invocations = Arc::new(AtomicUsize::new(0));
    reg.register(EchoTool {
        invocations: invocations.clone(),
    });
    // Missing the required "text" parameter.
    let mut driver = driver_for(
        ScriptedProvider::tool_then_text("c1", "echo", r#"{"wrong":"field"}"#, "ok"),
        reg,
        EngineConfig::default(),
    );
    let (_, events) = run(&mut driver, "go").await;

    assert_eq!(invocations.load(Ordering::SeqCst), 0, "executor must not run");
    assert!(events.iter().any(|e| matches!(
        &e.event,
        StreamEvent::ToolResult { is_error: true, output, .. } if output.contains("invalid arguments")
    )));
}

#[tokio::test]
async fn panicking_tool_is_contained() {
    let mut reg = ToolRegistry::new();
    reg.register(PanicTool);
    let mut driver = driver_for(
        ScriptedProvider::tool_then_text("c1", "panicker", "{}", "still alive"),
        reg,
        EngineConfig::default(),
    );
    let (summary, events) = run(&mut driver, "go").await;

    assert_eq!(summary.final_text, "still alive");
    assert!(events.iter().any(|e| matches!(
        &e.event,
        StreamEvent::ToolResult { is_error: true, output, .. } if output.contains("panicked")
    )));
    assert!(driver.context().validate_pairing().is_ok());
}

// ── S1: read-only cache ───────────────────────────────────────────────────────

#[tokio::test]
async fn identical_read_only_calls_hit_cache() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let mut reg = ToolRegistry::new();
    reg.register(EchoTool {
        invocations: invocations.clone(),
    });

    let provider = ScriptedProvider::new(vec![
        ScriptedProvider::tool_call_script(&[tc("c1", "echo", r#"{"text":"hi"}"#)]),
        ScriptedProvider::tool_call_script(&[tc("c2", "echo", r#"{"text":"hi"}"#)]),
        ScriptedProvider::text_script("done"),
    ]);
    let mut driver = driver_for(provider, reg, EngineConfig::default());
    let (_, events) = run(&mut driver, "go").await;

    assert_eq!(invocations.load(Ordering::SeqCst), 1, "executor runs at most once");
    let hits: Vec<bool> = events
        .iter()
        .filter_map(|e| match &e.event {
            StreamEvent::ToolResult { cache_hit, .. } => Some(*cache_hit),
            _ => None,
        })
        .collect();
    assert_eq!(hits, vec![false, true]);
}

#[tokio::test]
async fn different_arguments_miss_the_cache() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let mut reg = ToolRegistry::new();
    reg.register(EchoTool {
        invocations: invocations.clone(),
    });
    let provider = ScriptedProvider::new(vec![
        ScriptedProvider::tool_call_script(&[tc("c1", "echo", r#"{"text":"one"}"#)]),
        ScriptedProvider::tool_call_script(&[tc("c2", "echo", r#"{"text":"two"}"#)]),
        ScriptedProvider::text_script("done"),
    ]);
    let mut driver = driver_for(provider, reg, EngineConfig::default());
    run(&mut driver, "go").await;
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
}

// ── S2: concurrent-safe pool ──────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_safe_batch_runs_in_parallel() {
    let mut reg = ToolRegistry::new();
    reg.register(SleepTool);
    let provider = ScriptedProvider::new(vec![
        ScriptedProvider::tool_call_script(&[
            tc("s1", "sleep", r#"{"ms":100}"#),
            tc("s2", "sleep", r#"{"ms":100}"#),
            tc("s3", "sleep", r#"{"ms":100}"#),
        ]),
        ScriptedProvider::text_script("done"),
    ]);
    let config = EngineConfig {
        tool_pool_size: 3,
        ..EngineConfig::default()
    };
    let mut driver = driver_for(provider, reg, config);

    let started = Instant::now();
    let (_, events) = run(&mut driver, "go").await;
    let elapsed = started.elapsed();

    assert!(
        elapsed < Duration::from_millis(250),
        "three 100ms sleeps should overlap, took {elapsed:?}"
    );
    let result_ids: Vec<String> = events
        .iter()
        .filter_map(|e| match &e.event {
            StreamEvent::ToolResult { id, .. } => Some(id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(result_ids.len(), 3);
    for id in ["s1", "s2", "s3"] {
        assert!(result_ids.iter().any(|r| r == id));
        let call = seq_of(&events, |e| matches!(e, StreamEvent::ToolCall { id: i, .. } if i == id));
        let result =
            seq_of(&events, |e| matches!(e, StreamEvent::ToolResult { id: i, .. } if i == id));
        assert!(call.unwrap() < result.unwrap());
    }
}

// ── S3: concurrent-unsafe sequential lane ─────────────────────────────────────

#[tokio::test]
async fn unsafe_calls_run_strictly_sequentially() {
    let mut reg = ToolRegistry::new();
    reg.register(UnsafeSleepTool);
    let provider = ScriptedProvider::new(vec![
        ScriptedProvider::tool_call_script(&[
            tc("u1", "unsafe_sleep", r#"{"ms":50}"#),
            tc("u2", "unsafe_sleep", r#"{"ms":50}"#),
        ]),
        ScriptedProvider::text_script("done"),
    ]);
    let mut driver = driver_for(provider, reg, EngineConfig::default());
    let (_, events) = run(&mut driver, "go").await;

    let first_result =
        seq_of(&events, |e| matches!(e, StreamEvent::ToolResult { id, .. } if id == "u1")).unwrap();
    let second_call =
        seq_of(&events, |e| matches!(e, StreamEvent::ToolCall { id, .. } if id == "u2")).unwrap();
    assert!(
        second_call > first_result,
        "second ToolCall (seq {second_call}) must come after first ToolResult (seq {first_result})"
    );
}

// ── S4: partial-response recovery ─────────────────────────────────────────────

#[tokio::test]
async fn partial_text_is_salvaged_and_retry_completes() {
    let provider = ScriptedProvider::new(vec![
        ScriptedProvider::partial_then_error("Hello ", "connection reset"),
        ScriptedProvider::text_script("Hello world"),
    ]);
    let config = EngineConfig {
        provider_retries: 1,
        ..EngineConfig::default()
    };
    let mut driver = driver_for(provider, ToolRegistry::new(), config);
    let (summary, _) = run(&mut driver, "greet").await;

    assert_eq!(summary.done, DoneReason::Stop);
    assert_eq!(summary.final_text, "Hello world");
    // The salvaged partial is its own assistant message; the final assistant
    // message is exactly the successful completion.
    let assistants: Vec<&str> = driver
        .context()
        .messages()
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .filter_map(|m| m.as_text())
        .collect();
    assert_eq!(assistants, vec!["Hello ", "Hello world"]);
    // Usage totals reflect only the successful completion (the failed script
    // carried no usage chunk).
    assert_eq!(summary.usage.input_tokens, 5);
    assert_eq!(summary.usage.output_tokens, 5);
}

#[tokio::test]
async fn exhausted_provider_retries_surface_error_then_done() {
    let provider = ScriptedProvider::new(vec![
        ScriptedProvider::partial_then_error("x", "boom 1"),
        ScriptedProvider::partial_then_error("y", "boom 2"),
    ]);
    let config = EngineConfig {
        provider_retries: 1,
        ..EngineConfig::default()
    };
    let mut driver = driver_for(provider, ToolRegistry::new(), config);
    let (summary, events) = run(&mut driver, "go").await;

    assert_eq!(summary.done, DoneReason::Error);
    let error_seq = seq_of(&events, |e| matches!(e, StreamEvent::Error { .. })).unwrap();
    let done_seq = seq_of(&events, |e| e.is_done()).unwrap();
    assert!(error_seq < done_seq);
    assert!(events.last().unwrap().event.is_done());
}

// ── S5: cancellation mid-tool ─────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_mid_tool_yields_synthetic_result_within_deadline() {
    let mut reg = ToolRegistry::new();
    reg.register(SleepTool);
    let provider = ScriptedProvider::new(vec![
        ScriptedProvider::tool_call_script(&[tc("c1", "sleep", r#"{"ms":2000}"#)]),
        ScriptedProvider::text_script("never reached"),
    ]);
    let mut driver = driver_for(provider, reg, EngineConfig::default());

    let bus = EventBus::new("test-session");
    let cancel = CancellationToken::new();
    let bus2 = bus.clone();
    let cancel2 = cancel.clone();
    let turn = tokio::spawn(async move {
        let summary = driver.run_turn("go", &bus2, &cancel2).await;
        (summary, driver)
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let cancelled_at = Instant::now();
    cancel.cancel();
    let (summary, driver) = turn.await.unwrap();
    assert!(
        cancelled_at.elapsed() < Duration::from_millis(500),
        "cancellation must unwind promptly"
    );

    assert_eq!(summary.done, DoneReason::Cancelled);
    let (events, _) = bus.events_since(0);
    assert!(events.iter().any(|e| matches!(
        &e.event,
        StreamEvent::ToolResult { id, is_error: true, output, .. }
            if id == "c1" && output.contains("cancelled")
    )));
    assert!(matches!(
        events.last().unwrap().event,
        StreamEvent::Done { reason: DoneReason::Cancelled }
    ));
    // Exactly one Done, nothing after it.
    assert_eq!(events.iter().filter(|e| e.event.is_done()).count(), 1);
    assert!(driver.context().validate_pairing().is_ok());
}

#[tokio::test]
async fn cancel_before_turn_emits_done_only_once() {
    let mut driver = driver_for(
        ScriptedProvider::always_text("unused"),
        ToolRegistry::new(),
        EngineConfig::default(),
    );
    let bus = EventBus::new("test-session");
    let cancel = CancellationToken::new();
    cancel.cancel();
    let summary = driver.run_turn("go", &bus, &cancel).await;

    assert_eq!(summary.done, DoneReason::Cancelled);
    let (events, _) = bus.events_since(0);
    assert_eq!(events.len(), 1);
    assert!(events[0].event.is_done());
}

// ── Step budget ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn max_steps_zero_ends_immediately_with_step_limit() {
    let config = EngineConfig {
        max_steps: 0,
        ..EngineConfig::default()
    };
    let mut driver = driver_for(ScriptedProvider::always_text("unused"), ToolRegistry::new(), config);
    let (summary, events) = run(&mut driver, "go").await;

    assert_eq!(summary.done, DoneReason::StepLimitReached);
    assert_eq!(summary.steps, 0);
    assert_eq!(events.len(), 1);
    assert!(matches!(
        events[0].event,
        StreamEvent::Done { reason: DoneReason::StepLimitReached }
    ));
}

#[tokio::test]
async fn step_budget_stops_endless_tool_loops() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let mut reg = ToolRegistry::new();
    reg.register(EchoTool {
        invocations: invocations.clone(),
    });
    // Every step requests another tool call; the budget must cut it off.
    let scripts: Vec<_> = (0..10)
        .map(|i| {
            ScriptedProvider::tool_call_script(&[tc(
                &format!("c{i}"),
                "echo",
                &format!(r#"{{"text":"{i}"}}"#),
            )])
        })
        .collect();
    let config = EngineConfig {
        max_steps: 2,
        ..EngineConfig::default()
    };
    let mut driver = driver_for(ScriptedProvider::new(scripts), reg, config);
    let (summary, _) = run(&mut driver, "go").await;

    assert_eq!(summary.done, DoneReason::StepLimitReached);
    assert_eq!(summary.steps, 2);
    assert!(driver.context().validate_pairing().is_ok());
}

// ── Retry / timeout at the gate ───────────────────────────────────────────────

#[tokio::test]
async fn retryable_failures_are_retried_until_success() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let mut reg = ToolRegistry::new();
    reg.register(FlakyTool {
        attempts: attempts.clone(),
        succeed_after: 3,
    });
    let mut driver = driver_for(
        ScriptedProvider::tool_then_text("c1", "flaky", "{}", "ok"),
        reg,
        EngineConfig::default(),
    );
    let (_, events) = run(&mut driver, "go").await;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert!(events.iter().any(|e| matches!(
        &e.event,
        StreamEvent::ToolResult { is_error: false, output, .. } if output == "recovered"
    )));
}

#[tokio::test]
async fn timeout_is_not_retried() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let mut reg = ToolRegistry::new();
    reg.register(HangingTool {
        invocations: invocations.clone(),
    });
    let mut driver = driver_for(
        ScriptedProvider::tool_then_text("c1", "hang", "{}", "moving on"),
        reg,
        EngineConfig::default(),
    );
    let started = Instant::now();
    let (summary, events) = run(&mut driver, "go").await;

    assert_eq!(summary.final_text, "moving on");
    assert_eq!(
        invocations.load(Ordering::SeqCst),
        1,
        "timeouts are non-retryable even with max_retries set"
    );
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(events.iter().any(|e| matches!(
        &e.event,
        StreamEvent::ToolResult { is_error: true, output, .. } if output.contains("timeout")
    )));
}

// ── Progress streaming ────────────────────────────────────────────────────────

#[tokio::test]
async fn progress_events_arrive_between_call_and_result() {
    let mut reg = ToolRegistry::new();
    reg.register(ProgressTool);
    let mut driver = driver_for(
        ScriptedProvider::tool_then_text("c1", "progressive", "{}", "done"),
        reg,
        EngineConfig::default(),
    );
    let (_, events) = run(&mut driver, "go").await;

    let call = seq_of(&events, |e| matches!(e, StreamEvent::ToolCall { id, .. } if id == "c1")).unwrap();
    let result =
        seq_of(&events, |e| matches!(e, StreamEvent::ToolResult { id, .. } if id == "c1")).unwrap();
    let progress: Vec<u64> = events
        .iter()
        .filter(|e| matches!(&e.event, StreamEvent::ToolProgress { id, .. } if id == "c1"))
        .map(|e| e.seq)
        .collect();
    assert_eq!(progress.len(), 2);
    for p in &progress {
        assert!(call < *p && *p < result);
    }
}

// ── Output truncation ─────────────────────────────────────────────────────────

#[tokio::test]
async fn oversized_tool_output_is_truncated_in_context() {
    let mut reg = ToolRegistry::new();
    reg.register(BigOutputTool { chars: 40_000 });
    let mut driver = driver_for(
        ScriptedProvider::tool_then_text("c1", "bigout", "{}", "done"),
        reg,
        EngineConfig::default(),
    );
    run(&mut driver, "go").await;

    let tool_msg = driver
        .context()
        .messages()
        .iter()
        .find(|m| m.role == Role::Tool)
        .unwrap();
    let content = tool_msg.as_text().unwrap();
    assert!(content.contains("...[truncated]..."));
    assert!(content.len() < 40_000);
}

#[tokio::test]
async fn output_at_limit_is_not_truncated() {
    let mut reg = ToolRegistry::new();
    reg.register(BigOutputTool { chars: 30_000 });
    let mut driver = driver_for(
        ScriptedProvider::tool_then_text("c1", "bigout", "{}", "done"),
        reg,
        EngineConfig::default(),
    );
    run(&mut driver, "go").await;

    let tool_msg = driver
        .context()
        .messages()
        .iter()
        .find(|m| m.role == Role::Tool)
        .unwrap();
    assert_eq!(tool_msg.as_text().unwrap().len(), 30_000);
}

// ── Policy hooks ──────────────────────────────────────────────────────────────

fn pattern_policy(block: &[&str], warn: &[&str]) -> Arc<dyn PolicyHook> {
    Arc::new(PatternPolicy::from_config(&ToolsConfig {
        block_patterns: block.iter().map(|s| s.to_string()).collect(),
        warn_patterns: warn.iter().map(|s| s.to_string()).collect(),
        ..ToolsConfig::default()
    }))
}

#[tokio::test]
async fn enforce_mode_blocks_matching_calls() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let mut reg = ToolRegistry::new();
    reg.register(CommandTool {
        invocations: invocations.clone(),
    });
    let registry = Arc::new(reg);
    let gate = gate_with_policy(&registry, pattern_policy(&["rm *"], &[]), PolicyMode::Enforce, 4);
    let mut driver = driver_with_gate(
        ScriptedProvider::tool_then_text("c1", "shell", r#"{"command":"rm -rf /tmp/x"}"#, "done"),
        registry,
        gate,
        EngineConfig::default(),
    );
    let (_, events) = run(&mut driver, "go").await;

    assert_eq!(invocations.load(Ordering::SeqCst), 0, "blocked call must not execute");
    assert!(events
        .iter()
        .any(|e| matches!(&e.event, StreamEvent::ToolPolicyBlock { .. })));
    assert!(events.iter().any(|e| matches!(
        &e.event,
        StreamEvent::ToolResult { is_error: true, output, .. } if output.contains("blocked by policy")
    )));
}

#[tokio::test]
async fn log_only_mode_downgrades_blocks_to_warnings() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let mut reg = ToolRegistry::new();
    reg.register(CommandTool {
        invocations: invocations.clone(),
    });
    let registry = Arc::new(reg);
    let gate = gate_with_policy(&registry, pattern_policy(&["rm *"], &[]), PolicyMode::LogOnly, 4);
    let mut driver = driver_with_gate(
        ScriptedProvider::tool_then_text("c1", "shell", r#"{"command":"rm -rf /tmp/x"}"#, "done"),
        registry,
        gate,
        EngineConfig::default(),
    );
    let (_, events) = run(&mut driver, "go").await;

    assert_eq!(invocations.load(Ordering::SeqCst), 1, "log_only must still execute");
    assert!(events
        .iter()
        .any(|e| matches!(&e.event, StreamEvent::ToolPolicyWarn { .. })));
    assert!(!events
        .iter()
        .any(|e| matches!(&e.event, StreamEvent::ToolPolicyBlock { .. })));
}

// ── Compaction under the driver ───────────────────────────────────────────────

#[tokio::test]
async fn compaction_mid_turn_preserves_pairing() {
    let mut reg = ToolRegistry::new();
    reg.register(EchoTool {
        invocations: Arc::new(AtomicUsize::new(0)),
    });
    // Many tool steps with a tiny compaction threshold force compaction
    // between steps.
    let mut scripts: Vec<_> = (0..6)
        .map(|i| {
            ScriptedProvider::tool_call_script(&[tc(
                &format!("c{i}"),
                "echo",
                &format!(r#"{{"text":"payload payload payload {i}"}}"#),
            )])
        })
        .collect();
    scripts.push(ScriptedProvider::text_script("done"));
    let config = EngineConfig {
        compaction_threshold_tokens: 60,
        compaction_keep_recent: 4,
        ..EngineConfig::default()
    };
    let mut driver = driver_for(ScriptedProvider::new(scripts), reg, config);
    let (summary, _) = run(&mut driver, "go").await;

    assert_eq!(summary.done, DoneReason::Stop);
    assert!(driver.context().validate_pairing().is_ok());
    assert!(driver
        .context()
        .messages()
        .iter()
        .any(|m| m.as_text().map(|t| t.contains("Context compacted")).unwrap_or(false)));
}

// ── Event stream invariants ───────────────────────────────────────────────────

#[tokio::test]
async fn sequence_numbers_are_strictly_increasing_and_dense() {
    let mut reg = ToolRegistry::new();
    reg.register(EchoTool {
        invocations: Arc::new(AtomicUsize::new(0)),
    });
    let mut driver = driver_for(
        ScriptedProvider::tool_then_text("c1", "echo", r#"{"text":"x"}"#, "end"),
        reg,
        EngineConfig::default(),
    );
    let (_, events) = run(&mut driver, "go").await;

    for (i, ev) in events.iter().enumerate() {
        assert_eq!(ev.seq, i as u64);
        assert_eq!(ev.session_id, "test-session");
    }
}

#[tokio::test]
async fn every_turn_emits_exactly_one_done() {
    for script in [
        vec![ScriptedProvider::text_script("plain")],
        vec![ScriptedProvider::partial_then_error("p", "fail")],
    ] {
        let mut driver = driver_for(
            ScriptedProvider::new(script),
            ToolRegistry::new(),
            EngineConfig {
                provider_retries: 0,
                ..EngineConfig::default()
            },
        );
        let (_, events) = run(&mut driver, "go").await;
        assert_eq!(events.iter().filter(|e| e.event.is_done()).count(), 1);
        assert!(events.last().unwrap().event.is_done());
    }
}
