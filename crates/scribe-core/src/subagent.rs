// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Sub-agent dispatcher: child engines spawned by the sub-agent tools.
//!
//! Children share the parent's workspace and background manager but run
//! with their own context and a restricted toolset (file, shell, think —
//! no sub-agent spawn), which bounds recursion structurally rather than by
//! counter.  The tools hold a *weak* handle to the spawner, bound late by
//! the orchestrator, so the engine ↔ tool cycle never owns itself.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use scribe_config::{EngineConfig, PolicyMode, ToolsConfig};
use scribe_model::ModelProvider;
use scribe_tools::{
    BackgroundTaskManager, NoopPolicy, ProgressSink, Tool, ToolCall, ToolDeps, ToolParam,
    ToolRegistry, ToolResult,
};

use crate::bus::EventBus;
use crate::context::Context;
use crate::driver::TurnDriver;
use crate::gate::ExecutionGate;
use crate::logging::StructuredLog;

const SUB_AGENT_PROMPT: &str = "You are a focused sub-agent. Complete the assigned task \
     autonomously using the available tools, then reply with a concise \
     summary of what you did. Do not ask questions.";

/// Everything needed to construct child engines.
pub struct SubAgentSpawner {
    model: Arc<dyn ModelProvider>,
    engine_cfg: EngineConfig,
    tools_cfg: ToolsConfig,
    workspace: PathBuf,
    background: Arc<BackgroundTaskManager>,
    log: Arc<StructuredLog>,
}

/// One task in a parallel batch.
#[derive(Debug, Clone)]
pub struct SubTaskSpec {
    pub task: String,
    pub max_steps: Option<u32>,
}

/// Result entry for one parallel task; exactly one of `result`/`error` is set.
#[derive(Debug, Clone)]
pub struct SubTaskOutcome {
    pub task: String,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl SubAgentSpawner {
    pub fn default_sub_agent_steps(&self) -> u32 {
        self.engine_cfg.sub_agent_max_steps
    }

    pub fn new(
        model: Arc<dyn ModelProvider>,
        engine_cfg: EngineConfig,
        tools_cfg: ToolsConfig,
        workspace: PathBuf,
        background: Arc<BackgroundTaskManager>,
        log: Arc<StructuredLog>,
    ) -> Arc<Self> {
        Arc::new(Self {
            model,
            engine_cfg,
            tools_cfg,
            workspace,
            background,
            log,
        })
    }

    /// The restricted child toolset.  The sub-agent tools are deliberately
    /// absent so children cannot spawn grandchildren.
    fn build_sub_registry(&self) -> ToolRegistry {
        let deps = ToolDeps {
            workspace: self.workspace.clone(),
            background: Arc::clone(&self.background),
            timeout_secs: self.tools_cfg.timeout_secs,
        };
        let mut reg = ToolRegistry::new();
        reg.load_tools(
            &[
                "shell:Shell",
                "file:ReadFile",
                "file:WriteFile",
                "file:ListDir",
                "think:Think",
            ],
            &deps,
        );
        reg
    }

    fn build_child(&self, max_steps: u32, child_id: &str) -> TurnDriver {
        let registry = Arc::new(self.build_sub_registry());
        let gate = ExecutionGate::new(
            Arc::clone(&registry),
            Arc::new(NoopPolicy),
            PolicyMode::Off,
            self.engine_cfg.tool_pool_size,
            Arc::clone(&self.log),
        );
        let mut cfg = self.engine_cfg.clone();
        cfg.max_steps = max_steps;
        TurnDriver::new(
            Arc::clone(&self.model),
            registry,
            gate,
            Context::new(SUB_AGENT_PROMPT),
            cfg,
            Arc::clone(&self.log),
            child_id.to_string(),
            None,
        )
    }

    /// Run one child to completion and return its final text.
    ///
    /// The child writes to its own bus; the parent observes it through the
    /// progress sink of the spawning tool call, not through the parent bus
    /// (whose `Done` must stay the parent's own).
    pub async fn run_sub_agent(
        &self,
        task: &str,
        max_steps: u32,
        cancel: &CancellationToken,
    ) -> anyhow::Result<String> {
        let child_id = format!("sub-{}", uuid::Uuid::new_v4().simple());
        debug!(task, max_steps, child_id = %child_id, "spawning sub-agent");
        let bus = EventBus::new(child_id.clone());
        let mut driver = self.build_child(max_steps, &child_id);
        let summary = driver.run_turn(task, &bus, cancel).await;
        match summary.done {
            crate::events::DoneReason::Error => {
                anyhow::bail!("sub-agent failed: see structured log for {child_id}")
            }
            _ => Ok(summary.final_text),
        }
    }

    /// Run up to `max_parallel` children concurrently.  Per-task failures
    /// are recorded in that task's entry; the others continue.  The overall
    /// timeout aborts outstanding children.
    pub async fn run_sub_agents_parallel(
        self: &Arc<Self>,
        tasks: Vec<SubTaskSpec>,
        cancel: &CancellationToken,
    ) -> Vec<SubTaskOutcome> {
        let limit = self.engine_cfg.max_parallel_sub_agents.max(1);
        let semaphore = Arc::new(tokio::sync::Semaphore::new(limit));
        let default_steps = self.engine_cfg.sub_agent_max_steps;

        let mut join = JoinSet::new();
        for (i, spec) in tasks.iter().cloned().enumerate() {
            let spawner = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            join.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                let max_steps = spec.max_steps.unwrap_or(default_steps);
                let result = spawner
                    .run_sub_agent(&spec.task, max_steps, &cancel)
                    .await;
                (i, spec.task, result)
            });
        }

        let mut outcomes: Vec<SubTaskOutcome> = tasks
            .iter()
            .map(|spec| SubTaskOutcome {
                task: spec.task.clone(),
                result: None,
                error: Some("timed out".into()),
            })
            .collect();

        let deadline = Duration::from_secs(self.engine_cfg.parallel_sub_agent_timeout_secs);
        let collect = async {
            while let Some(joined) = join.join_next().await {
                match joined {
                    Ok((i, _task, Ok(text))) => {
                        outcomes[i].result = Some(text);
                        outcomes[i].error = None;
                    }
                    Ok((i, _task, Err(e))) => {
                        outcomes[i].error = Some(e.to_string());
                    }
                    Err(e) => warn!(error = %e, "parallel sub-agent worker panicked"),
                }
            }
        };
        if tokio::time::timeout(deadline, collect).await.is_err() {
            warn!(
                timeout_secs = self.engine_cfg.parallel_sub_agent_timeout_secs,
                "parallel sub-agent batch timed out; aborting outstanding children"
            );
            join.abort_all();
        }
        outcomes
    }
}

/// Spawn a single child engine and return its final text.
pub struct SubAgentTool {
    spawner: Mutex<Weak<SubAgentSpawner>>,
    cancel: CancellationToken,
}

impl SubAgentTool {
    pub fn unbound(cancel: CancellationToken) -> Self {
        Self {
            spawner: Mutex::new(Weak::new()),
            cancel,
        }
    }

    /// Late-bind the engine handle.  Called once at orchestrator setup; the
    /// tool fails gracefully while unset.
    pub fn bind(&self, spawner: &Arc<SubAgentSpawner>) {
        *self.spawner.lock().unwrap() = Arc::downgrade(spawner);
    }
}

#[async_trait]
impl Tool for SubAgentTool {
    fn name(&self) -> &str {
        "create_sub_agent"
    }

    fn description(&self) -> &str {
        "Create a sub-agent to handle a specific task autonomously. Use this \
         for complex tasks that benefit from focused execution. The sub-agent \
         has access to file, shell, and think tools but cannot create further \
         sub-agents."
    }

    fn parameters(&self) -> Vec<ToolParam> {
        vec![
            ToolParam::string("task", "Clear description of the task for the sub-agent"),
            ToolParam::integer("max_steps", "Max steps for the sub-agent (default: 30)")
                .optional(),
        ]
    }

    fn concurrent_safe(&self) -> bool {
        false
    }

    async fn execute(&self, call: &ToolCall, progress: &ProgressSink) -> ToolResult {
        let Some(spawner) = self.spawner.lock().unwrap().upgrade() else {
            return ToolResult::err("Sub-agent engine not available");
        };
        let Some(task) = call.args.get("task").and_then(|v| v.as_str()) else {
            return ToolResult::err("missing 'task' parameter");
        };
        let max_steps = call
            .args
            .get("max_steps")
            .and_then(|v| v.as_u64())
            .map(|n| n as u32)
            .unwrap_or(spawner.default_sub_agent_steps());

        progress.report(format!("sub-agent started: {task}"), None);
        match spawner.run_sub_agent(task, max_steps, &self.cancel).await {
            Ok(text) if text.is_empty() => ToolResult::ok("(sub-agent produced no text output)"),
            Ok(text) => ToolResult::ok(text),
            Err(e) => ToolResult::err(format!("Sub-agent failed: {e}")),
        }
    }
}

/// Spawn several children that run concurrently and aggregate their results.
pub struct ParallelSubAgentsTool {
    spawner: Mutex<Weak<SubAgentSpawner>>,
    cancel: CancellationToken,
}

impl ParallelSubAgentsTool {
    pub fn unbound(cancel: CancellationToken) -> Self {
        Self {
            spawner: Mutex::new(Weak::new()),
            cancel,
        }
    }

    pub fn bind(&self, spawner: &Arc<SubAgentSpawner>) {
        *self.spawner.lock().unwrap() = Arc::downgrade(spawner);
    }
}

#[async_trait]
impl Tool for ParallelSubAgentsTool {
    fn name(&self) -> &str {
        "create_parallel_sub_agents"
    }

    fn description(&self) -> &str {
        "Spawn multiple sub-agents that run concurrently. Each executes its \
         task independently; all share the same workspace and have access to \
         file, shell, and think tools. Use for work that splits into \
         independent pieces."
    }

    fn parameters(&self) -> Vec<ToolParam> {
        vec![ToolParam::array(
            "tasks",
            "Array of task objects. Each has: 'task' (string, required) — what \
             to do; 'max_steps' (integer, optional, default 30) — step limit.",
        )]
    }

    fn concurrent_safe(&self) -> bool {
        false
    }

    fn timeout(&self) -> Duration {
        // Must outlive the batch's own overall timeout.
        Duration::from_secs(660)
    }

    async fn execute(&self, call: &ToolCall, progress: &ProgressSink) -> ToolResult {
        let Some(spawner) = self.spawner.lock().unwrap().upgrade() else {
            return ToolResult::err("Sub-agent engine not available");
        };
        let Some(tasks) = call.args.get("tasks").and_then(|v| v.as_array()) else {
            return ToolResult::err("'tasks' must be a non-empty array");
        };
        if tasks.is_empty() {
            return ToolResult::err("'tasks' must be a non-empty array");
        }

        let mut specs = Vec::with_capacity(tasks.len());
        for t in tasks {
            let Some(task) = t.get("task").and_then(|v| v.as_str()) else {
                return ToolResult::err("each task object needs a 'task' string");
            };
            specs.push(SubTaskSpec {
                task: task.to_string(),
                max_steps: t.get("max_steps").and_then(|v| v.as_u64()).map(|n| n as u32),
            });
        }

        progress.report(format!("running {} sub-agents", specs.len()), None);
        let outcomes = spawner.run_sub_agents_parallel(specs, &self.cancel).await;

        let mut lines = vec![format!(
            "Parallel execution complete — {} sub-agents ran.\n",
            outcomes.len()
        )];
        for (i, o) in outcomes.iter().enumerate() {
            let task_desc: String = o.task.chars().take(80).collect();
            match &o.error {
                Some(err) => lines.push(format!(
                    "### Agent {}: FAILED\nTask: {task_desc}\nError: {err}\n",
                    i + 1
                )),
                None => {
                    let summary: String = o
                        .result
                        .as_deref()
                        .unwrap_or("")
                        .chars()
                        .take(500)
                        .collect();
                    lines.push(format!(
                        "### Agent {}: OK\nTask: {task_desc}\nResult: {summary}\n",
                        i + 1
                    ));
                }
            }
        }
        ToolResult::ok(lines.join("\n"))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
