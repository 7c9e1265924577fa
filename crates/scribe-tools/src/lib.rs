// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod background;
pub mod builtin;
pub mod policy;
pub mod registry;
pub mod schema;
pub mod tool;

pub use background::{BackgroundTask, BackgroundTaskManager, LifecycleHooks, TaskStatus};
pub use policy::{Finding, NoopPolicy, PatternPolicy, PolicyHook, Severity};
pub use registry::{ToolDeps, ToolRegistry, ToolSchema};
pub use schema::{params_to_schema, validate_args};
pub use tool::{
    ParamKind, ProgressSink, ProgressUpdate, Tool, ToolCall, ToolParam, ToolResult,
};

pub use builtin::background_tasks::{
    BackgroundListTool, BackgroundOutputTool, BackgroundStartTool, BackgroundStopTool,
};
pub use builtin::list_dir::ListDirTool;
pub use builtin::read_file::ReadFileTool;
pub use builtin::shell::ShellTool;
pub use builtin::think::ThinkTool;
pub use builtin::web_fetch::WebFetchTool;
pub use builtin::write_file::WriteFileTool;
