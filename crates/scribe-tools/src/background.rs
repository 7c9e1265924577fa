// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Background task manager for persistent shell processes.
//!
//! Manages long-running commands (`npm run dev`, servers, watchers) that
//! outlive a single tool call.  Each task owns one reader that pipes
//! combined stdout+stderr line-by-line into a bounded ring buffer which the
//! agent polls incrementally.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Most recent lines kept per task.
const MAX_BUFFER_LINES: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Starting,
    Running,
    Stopped,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

/// Point-in-time snapshot of a background task, handed to callers.
#[derive(Debug, Clone)]
pub struct BackgroundTask {
    pub id: String,
    pub command: String,
    pub workspace: Option<PathBuf>,
    pub status: TaskStatus,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
}

struct TaskState {
    id: String,
    command: String,
    workspace: Option<PathBuf>,
    status: TaskStatus,
    pid: Option<u32>,
    exit_code: Option<i32>,
    created_at: DateTime<Utc>,
    ring: VecDeque<String>,
}

impl TaskState {
    fn push_line(&mut self, line: String) {
        self.ring.push_back(line);
        while self.ring.len() > MAX_BUFFER_LINES {
            self.ring.pop_front();
        }
    }

    fn output_text(&self) -> String {
        self.ring.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    fn snapshot(&self) -> BackgroundTask {
        BackgroundTask {
            id: self.id.clone(),
            command: self.command.clone(),
            workspace: self.workspace.clone(),
            status: self.status,
            pid: self.pid,
            exit_code: self.exit_code,
            created_at: self.created_at,
        }
    }
}

type StartedHook = Box<dyn Fn(&str, &str) + Send + Sync>;
type CompletedHook = Box<dyn Fn(&str, &str, Option<i32>) + Send + Sync>;
type FailedHook = Box<dyn Fn(&str, &str) + Send + Sync>;

/// Optional lifecycle callbacks.  Panics inside a callback are swallowed so
/// a misbehaving observer can never take down a reader.
#[derive(Default)]
pub struct LifecycleHooks {
    pub on_task_started: Option<StartedHook>,
    pub on_task_completed: Option<CompletedHook>,
    pub on_task_failed: Option<FailedHook>,
}

/// Per-process resource explicitly injected into engines that need it.
/// Tests construct a fresh one.
pub struct BackgroundTaskManager {
    tasks: Mutex<HashMap<String, Arc<Mutex<TaskState>>>>,
    readers: Mutex<HashMap<String, JoinHandle<()>>>,
    hooks: RwLock<LifecycleHooks>,
}

impl BackgroundTaskManager {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            readers: Mutex::new(HashMap::new()),
            hooks: RwLock::new(LifecycleHooks::default()),
        }
    }

    pub fn set_hooks(&self, hooks: LifecycleHooks) {
        *self.hooks.write().unwrap() = hooks;
    }

    /// Start a background task and return its initial snapshot.
    pub fn start(self: &Arc<Self>, command: &str, workspace: Option<PathBuf>) -> BackgroundTask {
        let id = Uuid::new_v4().simple().to_string()[..8].to_string();
        let state = Arc::new(Mutex::new(TaskState {
            id: id.clone(),
            command: command.to_string(),
            workspace,
            status: TaskStatus::Starting,
            pid: None,
            exit_code: None,
            created_at: Utc::now(),
            ring: VecDeque::new(),
        }));

        let snapshot = state.lock().unwrap().snapshot();
        self.tasks.lock().unwrap().insert(id.clone(), state.clone());

        let manager = Arc::clone(self);
        let reader = tokio::spawn(async move {
            manager.read_output(state).await;
        });
        self.readers.lock().unwrap().insert(id, reader);

        snapshot
    }

    /// Reader routine: spawn the process, pipe combined stdout+stderr into
    /// the ring buffer, record the exit status.
    async fn read_output(&self, state: Arc<Mutex<TaskState>>) {
        let (id, command, workspace) = {
            let s = state.lock().unwrap();
            (s.id.clone(), s.command.clone(), s.workspace.clone())
        };

        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(wd) = &workspace {
            cmd.current_dir(wd);
        }

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                let mut s = state.lock().unwrap();
                s.push_line(format!("Task error: {e}"));
                s.status = TaskStatus::Failed;
                drop(s);
                self.fire_failed(&id, &e.to_string());
                return;
            }
        };

        {
            let mut s = state.lock().unwrap();
            s.pid = child.id();
            // A stop() racing the spawn already moved the task to Stopped;
            // do not resurrect it.
            if s.status == TaskStatus::Starting {
                s.status = TaskStatus::Running;
            }
        }
        self.fire_started(&id, &command);
        debug!(task_id = %id, pid = ?child.id(), "background task running");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut out_lines = stdout.map(|s| BufReader::new(s).lines());
        let mut err_lines = stderr.map(|s| BufReader::new(s).lines());

        loop {
            tokio::select! {
                line = next_line(&mut out_lines) => match line {
                    Some(text) => state.lock().unwrap().push_line(text),
                    None => {
                        out_lines = None;
                        if err_lines.is_none() { break; }
                    }
                },
                line = next_line(&mut err_lines) => match line {
                    Some(text) => state.lock().unwrap().push_line(text),
                    None => {
                        err_lines = None;
                        if out_lines.is_none() { break; }
                    }
                },
            }
        }

        let code = child.wait().await.ok().and_then(|st| st.code());
        let (explicitly_stopped, output_text) = {
            let mut s = state.lock().unwrap();
            s.exit_code = code;
            let stopped = s.status == TaskStatus::Stopped;
            if !stopped {
                s.status = if code == Some(0) {
                    TaskStatus::Stopped
                } else {
                    TaskStatus::Failed
                };
            }
            (stopped, s.output_text())
        };

        if explicitly_stopped {
            return;
        }
        if code == Some(0) {
            self.fire_completed(&id, &output_text, code);
        } else {
            let tail: String = output_text
                .chars()
                .rev()
                .take(500)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            self.fire_failed(&id, &format!("Exit code {}: {tail}", code.unwrap_or(-1)));
        }
    }

    /// Stop a running task.  Returns `true` when a terminate signal was sent;
    /// a task that already exited returns `false`.
    pub fn stop(&self, task_id: &str) -> bool {
        let Some(state) = self.tasks.lock().unwrap().get(task_id).cloned() else {
            return false;
        };
        let mut s = state.lock().unwrap();
        if s.status != TaskStatus::Running {
            return false;
        }
        if let Some(pid) = s.pid {
            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
        // The task is stopped immediately; the reader exits when the
        // process dies.
        s.status = TaskStatus::Stopped;
        true
    }

    pub fn get(&self, task_id: &str) -> Option<BackgroundTask> {
        self.tasks
            .lock()
            .unwrap()
            .get(task_id)
            .map(|s| s.lock().unwrap().snapshot())
    }

    pub fn list(&self) -> Vec<BackgroundTask> {
        let mut tasks: Vec<BackgroundTask> = self
            .tasks
            .lock()
            .unwrap()
            .values()
            .map(|s| s.lock().unwrap().snapshot())
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tasks
    }

    /// Ring-buffer slice; `since` indexes into the current buffer for
    /// incremental polling.
    pub fn get_output(&self, task_id: &str, since: Option<usize>) -> Option<Vec<String>> {
        let state = self.tasks.lock().unwrap().get(task_id).cloned()?;
        let s = state.lock().unwrap();
        Some(s.ring.iter().skip(since.unwrap_or(0)).cloned().collect())
    }

    /// Remove a task from the manager, cancelling its reader if still alive.
    pub fn cleanup(&self, task_id: &str) {
        self.tasks.lock().unwrap().remove(task_id);
        if let Some(reader) = self.readers.lock().unwrap().remove(task_id) {
            if !reader.is_finished() {
                reader.abort();
            }
        }
    }

    /// Remove all stopped and failed tasks; returns how many were removed.
    pub fn cleanup_stopped(&self) -> usize {
        let to_remove: Vec<String> = self
            .tasks
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s)| {
                matches!(
                    s.lock().unwrap().status,
                    TaskStatus::Stopped | TaskStatus::Failed
                )
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &to_remove {
            self.cleanup(id);
        }
        to_remove.len()
    }

    fn fire_started(&self, id: &str, command: &str) {
        let hooks = self.hooks.read().unwrap();
        if let Some(cb) = &hooks.on_task_started {
            if catch_unwind(AssertUnwindSafe(|| cb(id, command))).is_err() {
                warn!(task_id = %id, "on_task_started callback panicked");
            }
        }
    }

    fn fire_completed(&self, id: &str, output: &str, code: Option<i32>) {
        let hooks = self.hooks.read().unwrap();
        if let Some(cb) = &hooks.on_task_completed {
            if catch_unwind(AssertUnwindSafe(|| cb(id, output, code))).is_err() {
                warn!(task_id = %id, "on_task_completed callback panicked");
            }
        }
    }

    fn fire_failed(&self, id: &str, error: &str) {
        let hooks = self.hooks.read().unwrap();
        if let Some(cb) = &hooks.on_task_failed {
            if catch_unwind(AssertUnwindSafe(|| cb(id, error))).is_err() {
                warn!(task_id = %id, "on_task_failed callback panicked");
            }
        }
    }
}

impl Default for BackgroundTaskManager {
    fn default() -> Self {
        Self::new()
    }
}

/// `next_line` over an optional stream: an exhausted (`None`) side pends
/// forever so the select loop drains the other side to EOF.
/// `Lines::next_line` is cancel-safe, so losing the race drops no data.
async fn next_line<R>(lines: &mut Option<tokio::io::Lines<BufReader<R>>>) -> Option<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    match lines {
        Some(l) => l.next_line().await.ok().flatten(),
        None => std::future::pending().await,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;

    async fn wait_until_done(mgr: &BackgroundTaskManager, id: &str) -> BackgroundTask {
        for _ in 0..100 {
            let task = mgr.get(id).unwrap();
            if matches!(task.status, TaskStatus::Stopped | TaskStatus::Failed) {
                // Give the reader a beat to drain trailing lines.
                tokio::time::sleep(Duration::from_millis(20)).await;
                return mgr.get(id).unwrap();
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("task {id} did not finish in time");
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn short_command_runs_to_stopped() {
        let mgr = Arc::new(BackgroundTaskManager::new());
        let task = mgr.start("echo hello", None);
        let done = wait_until_done(&mgr, &task.id).await;
        assert_eq!(done.status, TaskStatus::Stopped);
        assert_eq!(done.exit_code, Some(0));
        let out = mgr.get_output(&task.id, None).unwrap();
        assert_eq!(out, vec!["hello"]);
    }

    #[tokio::test]
    async fn failing_command_ends_failed() {
        let mgr = Arc::new(BackgroundTaskManager::new());
        let task = mgr.start("exit 3", None);
        let done = wait_until_done(&mgr, &task.id).await;
        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.exit_code, Some(3));
    }

    #[tokio::test]
    async fn stderr_is_merged_into_buffer() {
        let mgr = Arc::new(BackgroundTaskManager::new());
        let task = mgr.start("echo out && echo err >&2", None);
        wait_until_done(&mgr, &task.id).await;
        let out = mgr.get_output(&task.id, None).unwrap();
        assert!(out.contains(&"out".to_string()));
        assert!(out.contains(&"err".to_string()));
    }

    #[tokio::test]
    async fn stop_terminates_running_task() {
        let mgr = Arc::new(BackgroundTaskManager::new());
        let task = mgr.start("sleep 30", None);
        // Wait for the task to reach Running.
        for _ in 0..100 {
            if mgr.get(&task.id).unwrap().status == TaskStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(mgr.stop(&task.id));
        assert_eq!(mgr.get(&task.id).unwrap().status, TaskStatus::Stopped);
        // A second stop is a no-op.
        assert!(!mgr.stop(&task.id));
    }

    #[tokio::test]
    async fn stop_unknown_task_returns_false() {
        let mgr = Arc::new(BackgroundTaskManager::new());
        assert!(!mgr.stop("nope"));
    }

    // ── Ring buffer ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn ring_buffer_keeps_last_1000_lines() {
        let mgr = Arc::new(BackgroundTaskManager::new());
        let task = mgr.start("seq 1 1500", None);
        wait_until_done(&mgr, &task.id).await;
        let out = mgr.get_output(&task.id, None).unwrap();
        assert_eq!(out.len(), 1000);
        assert_eq!(out.first().map(String::as_str), Some("501"));
        assert_eq!(out.last().map(String::as_str), Some("1500"));
    }

    #[tokio::test]
    async fn get_output_since_returns_incremental_slice() {
        let mgr = Arc::new(BackgroundTaskManager::new());
        let task = mgr.start("printf 'a\\nb\\nc\\n'", None);
        wait_until_done(&mgr, &task.id).await;
        let out = mgr.get_output(&task.id, Some(1)).unwrap();
        assert_eq!(out, vec!["b", "c"]);
    }

    // ── Cleanup ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn cleanup_stopped_removes_finished_tasks() {
        let mgr = Arc::new(BackgroundTaskManager::new());
        let done = mgr.start("echo one", None);
        wait_until_done(&mgr, &done.id).await;
        let running = mgr.start("sleep 30", None);

        assert_eq!(mgr.cleanup_stopped(), 1);
        assert!(mgr.get(&done.id).is_none());
        assert!(mgr.get(&running.id).is_some());

        mgr.stop(&running.id);
        mgr.cleanup(&running.id);
        assert!(mgr.list().is_empty());
    }

    // ── Lifecycle hooks ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn started_and_completed_hooks_fire() {
        let started = Arc::new(AtomicBool::new(false));
        let completed = Arc::new(AtomicBool::new(false));
        let mgr = Arc::new(BackgroundTaskManager::new());
        let s = started.clone();
        let c = completed.clone();
        mgr.set_hooks(LifecycleHooks {
            on_task_started: Some(Box::new(move |_, _| s.store(true, Ordering::SeqCst))),
            on_task_completed: Some(Box::new(move |_, _, _| c.store(true, Ordering::SeqCst))),
            on_task_failed: None,
        });
        let task = mgr.start("echo done", None);
        wait_until_done(&mgr, &task.id).await;
        assert!(started.load(Ordering::SeqCst));
        assert!(completed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn panicking_hook_does_not_kill_reader() {
        let mgr = Arc::new(BackgroundTaskManager::new());
        mgr.set_hooks(LifecycleHooks {
            on_task_started: Some(Box::new(|_, _| panic!("observer bug"))),
            on_task_completed: None,
            on_task_failed: None,
        });
        let task = mgr.start("echo survived", None);
        let done = wait_until_done(&mgr, &task.id).await;
        assert_eq!(done.status, TaskStatus::Stopped);
        let out = mgr.get_output(&task.id, None).unwrap();
        assert_eq!(out, vec!["survived"]);
    }
}
