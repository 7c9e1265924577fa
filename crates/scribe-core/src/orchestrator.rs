// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Public entry point: create or resume a session, run a turn, stream
//! events, cancel.

use std::sync::{Arc, Mutex};

use anyhow::Context as _;
use futures::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use scribe_config::Config;
use scribe_model::ModelProvider;
use scribe_tools::{BackgroundTaskManager, PatternPolicy, ToolDeps, ToolRegistry};

use crate::bus::EventBus;
use crate::context::Context;
use crate::cost::ModelUsage;
use crate::driver::TurnDriver;
use crate::events::{DoneReason, EventEnvelope};
use crate::gate::ExecutionGate;
use crate::logging::StructuredLog;
use crate::store::{Persistence, ProjectStore};
use crate::subagent::{ParallelSubAgentsTool, SubAgentSpawner, SubAgentTool};

const DEFAULT_SYSTEM_PROMPT: &str = "You are Scribe, an AI coding assistant. You build and \
     modify projects in your workspace using the available tools. Work \
     step by step, verify your changes, and reply with concise summaries.";

/// What [`Session::run_turn`] returns: the final text, the turn's usage
/// totals, and every event the turn emitted.
#[derive(Debug, Clone)]
pub struct TurnResult {
    pub final_text: String,
    pub usage: ModelUsage,
    pub steps: u32,
    pub done: DoneReason,
    pub events: Vec<Arc<EventEnvelope>>,
}

pub struct Orchestrator {
    config: Arc<Config>,
    model: Arc<dyn ModelProvider>,
    store: Arc<ProjectStore>,
    background: Arc<BackgroundTaskManager>,
    log: Arc<StructuredLog>,
}

impl Orchestrator {
    pub fn new(config: Arc<Config>, model: Arc<dyn ModelProvider>) -> anyhow::Result<Self> {
        let base_dir = config.storage.resolved_base_dir();
        let store = Arc::new(ProjectStore::new(&base_dir)?);
        let log = Arc::new(StructuredLog::new(config.storage.log_dir.as_deref()));
        Ok(Self {
            config,
            model,
            store,
            background: Arc::new(BackgroundTaskManager::new()),
            log,
        })
    }

    pub fn store(&self) -> &Arc<ProjectStore> {
        &self.store
    }

    /// Create a fresh project and its session.
    pub fn create_session(&self) -> anyhow::Result<Arc<Session>> {
        let meta = self.store.create("")?;
        info!(project_id = %meta.id, "created project");
        self.build_session(meta.id, Context::new(DEFAULT_SYSTEM_PROMPT))
    }

    /// Rehydrate a session from disk.
    pub fn resume(&self, session_id: &str) -> anyhow::Result<Arc<Session>> {
        let meta = self
            .store
            .get(session_id)
            .with_context(|| format!("no such project: {session_id}"))?;
        let report = Context::load(&self.store.context_path(&meta.id), DEFAULT_SYSTEM_PROMPT)?;
        if report.skipped_lines > 0 {
            warn!(
                project_id = %meta.id,
                skipped = report.skipped_lines,
                "skipped malformed context lines during resume"
            );
        }
        info!(project_id = %meta.id, messages = report.context.messages().len(), "resumed project");
        self.build_session(meta.id, report.context)
    }

    fn build_session(&self, session_id: String, context: Context) -> anyhow::Result<Arc<Session>> {
        let workspace = self.store.workspace_dir(&session_id);
        let cancel = CancellationToken::new();

        let deps = ToolDeps {
            workspace: workspace.clone(),
            background: Arc::clone(&self.background),
            timeout_secs: self.config.tools.timeout_secs,
        };
        let mut registry = ToolRegistry::new();
        registry.load_tools(
            &[
                "shell:Shell",
                "file:ReadFile",
                "file:WriteFile",
                "file:ListDir",
                "think:Think",
                "web:WebFetch",
                "background:Start",
                "background:Output",
                "background:Stop",
                "background:List",
            ],
            &deps,
        );

        // The sub-agent tools get a weak engine handle, bound below once the
        // spawner exists; until then they fail gracefully.
        let sub_agent = Arc::new(SubAgentTool::unbound(cancel.clone()));
        let parallel = Arc::new(ParallelSubAgentsTool::unbound(cancel.clone()));
        registry.register_arc(sub_agent.clone());
        registry.register_arc(parallel.clone());
        let registry = Arc::new(registry);

        let spawner = SubAgentSpawner::new(
            Arc::clone(&self.model),
            self.config.engine.clone(),
            self.config.tools.clone(),
            workspace,
            Arc::clone(&self.background),
            Arc::clone(&self.log),
        );
        sub_agent.bind(&spawner);
        parallel.bind(&spawner);

        let gate = ExecutionGate::new(
            Arc::clone(&registry),
            Arc::new(PatternPolicy::from_config(&self.config.tools)),
            self.config.tools.policy_mode,
            self.config.engine.tool_pool_size,
            Arc::clone(&self.log),
        );

        let driver = TurnDriver::new(
            Arc::clone(&self.model),
            registry,
            gate,
            context,
            self.config.engine.clone(),
            Arc::clone(&self.log),
            session_id.clone(),
            Some(Arc::clone(&self.store) as Arc<dyn Persistence>),
        );

        Ok(Arc::new(Session {
            id: session_id,
            driver: tokio::sync::Mutex::new(driver),
            cancel: Mutex::new(cancel),
            _spawner: spawner,
        }))
    }
}

/// One live session.  Owns the turn driver; hands out event streams.
pub struct Session {
    pub id: String,
    driver: tokio::sync::Mutex<TurnDriver>,
    cancel: Mutex<CancellationToken>,
    // Keeps the weak handles in the sub-agent tools alive.
    _spawner: Arc<SubAgentSpawner>,
}

impl Session {
    /// Non-streaming convenience: run the turn to completion and return the
    /// final text, usage, and collected events.
    pub async fn run_turn(self: &Arc<Self>, prompt: &str) -> TurnResult {
        let bus = EventBus::new(self.id.clone());
        let cancel = self.current_cancel();
        let summary = {
            let mut driver = self.driver.lock().await;
            driver.run_turn(prompt, &bus, &cancel).await
        };
        let (events, _) = bus.events_since(0);
        TurnResult {
            final_text: summary.final_text,
            usage: summary.usage,
            steps: summary.steps,
            done: summary.done,
            events,
        }
    }

    /// Primary interface: an async sequence of events, terminated by `Done`.
    /// The turn runs on its own task; dropping the stream does not cancel it.
    pub fn stream_turn(
        self: &Arc<Self>,
        prompt: String,
    ) -> impl Stream<Item = Arc<EventEnvelope>> {
        let bus = EventBus::new(self.id.clone());
        let subscriber = bus.subscribe();
        let session = Arc::clone(self);
        let cancel = self.current_cancel();
        tokio::spawn(async move {
            let mut driver = session.driver.lock().await;
            driver.run_turn(&prompt, &bus, &cancel).await;
        });
        subscriber.into_stream()
    }

    /// Snapshot the current conversation for undo/branching.  The snapshot
    /// is also written to disk; a failed write is logged, not surfaced.
    pub async fn snapshot(&self, label: &str, store: &Arc<ProjectStore>) -> String {
        let mut driver = self.driver.lock().await;
        let id = driver.context_mut().snapshot(label);
        let messages = driver.context().messages().to_vec();
        if let Err(e) = store.save_snapshot(&self.id, label, &messages) {
            warn!(session_id = %self.id, error = %e, "failed to persist snapshot");
        }
        id
    }

    /// Replace the conversation with an earlier snapshot's messages.
    pub async fn restore(&self, snapshot_id: &str) -> bool {
        let mut driver = self.driver.lock().await;
        driver.context_mut().restore(snapshot_id)
    }

    /// Set the cancel flag observed by the turn driver and running tools.
    /// A fresh token is armed for the next turn.
    pub fn cancel(&self) {
        let mut guard = self.cancel.lock().unwrap();
        guard.cancel();
        *guard = CancellationToken::new();
    }

    fn current_cancel(&self) -> CancellationToken {
        self.cancel.lock().unwrap().clone()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
