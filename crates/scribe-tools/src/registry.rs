// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::warn;

use crate::background::BackgroundTaskManager;
use crate::schema::{params_to_schema, validate_args};
use crate::tool::Tool;

/// A tool schema as presented to the model.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Dependencies injected into tool constructors by name.
///
/// Mirrors how tools receive their collaborators: the workspace they operate
/// in, the shared background task manager, and the default timeout.  Tools
/// that need an engine handle (sub-agent spawn) are registered by the engine
/// itself with a late-bound weak reference.
#[derive(Clone)]
pub struct ToolDeps {
    pub workspace: PathBuf,
    pub background: Arc<BackgroundTaskManager>,
    pub timeout_secs: u64,
}

impl ToolDeps {
    pub fn new(workspace: PathBuf) -> Self {
        Self {
            workspace,
            background: Arc::new(BackgroundTaskManager::new()),
            timeout_secs: 120,
        }
    }
}

type ToolFactory = fn(&ToolDeps) -> Arc<dyn Tool>;

/// Factory table resolving `"module:Symbol"` specs to constructors.
fn builtin_factories() -> HashMap<&'static str, ToolFactory> {
    use crate::builtin::*;
    let mut m: HashMap<&'static str, ToolFactory> = HashMap::new();
    m.insert("shell:Shell", |d| {
        Arc::new(shell::ShellTool::new(d.workspace.clone(), d.timeout_secs))
    });
    m.insert("file:ReadFile", |d| {
        Arc::new(read_file::ReadFileTool::new(d.workspace.clone()))
    });
    m.insert("file:WriteFile", |d| {
        Arc::new(write_file::WriteFileTool::new(d.workspace.clone()))
    });
    m.insert("file:ListDir", |d| {
        Arc::new(list_dir::ListDirTool::new(d.workspace.clone()))
    });
    m.insert("think:Think", |_| Arc::new(think::ThinkTool));
    m.insert("web:WebFetch", |_| Arc::new(web_fetch::WebFetchTool::new()));
    m.insert("background:Start", |d| {
        Arc::new(background_tasks::BackgroundStartTool::new(
            d.background.clone(),
            d.workspace.clone(),
        ))
    });
    m.insert("background:Output", |d| {
        Arc::new(background_tasks::BackgroundOutputTool::new(d.background.clone()))
    });
    m.insert("background:Stop", |d| {
        Arc::new(background_tasks::BackgroundStopTool::new(d.background.clone()))
    });
    m.insert("background:List", |d| {
        Arc::new(background_tasks::BackgroundListTool::new(d.background.clone()))
    });
    m
}

/// Central registry holding all available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    /// Reject unknown parameters during validation.
    strict: bool,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            strict: true,
        }
    }

    pub fn lenient() -> Self {
        Self {
            tools: HashMap::new(),
            strict: false,
        }
    }

    pub fn strict_mode(&self) -> bool {
        self.strict
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Load tools from `"module:Symbol"` specs against the factory table.
    /// A spec that fails to resolve is logged and skipped; its siblings are
    /// still registered.
    pub fn load_tools(&mut self, specs: &[&str], deps: &ToolDeps) {
        let factories = builtin_factories();
        for spec in specs {
            match factories.get(spec) {
                Some(factory) => self.register_arc(factory(deps)),
                None => warn!(spec, "failed to load tool: unknown spec"),
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Produce schemas for all registered tools, sorted by name.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: params_to_schema(&t.parameters()),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Validate a call's arguments against the named tool's schema.
    ///
    /// Returns the normalised argument map or a list of human-readable
    /// errors.  An unknown tool name is a single-error list.
    pub fn validate_tool_args(
        &self,
        name: &str,
        args: &Value,
    ) -> Result<Map<String, Value>, Vec<String>> {
        match self.tools.get(name) {
            Some(tool) => validate_args(&tool.parameters(), args, self.strict),
            None => Err(vec![format!("unknown tool: {name}")]),
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::tool::{ProgressSink, ToolCall, ToolParam, ToolResult};

    struct EchoTool {
        name: &'static str,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn parameters(&self) -> Vec<ToolParam> {
            vec![ToolParam::string("text", "text to echo")]
        }
        async fn execute(&self, call: &ToolCall, _progress: &ProgressSink) -> ToolResult {
            ToolResult::ok(call.args["text"].as_str().unwrap_or_default())
        }
    }

    #[test]
    fn register_and_get() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "echo" });
        assert!(reg.get("echo").is_some());
        assert!(reg.get("nope").is_none());
    }

    #[test]
    fn schemas_are_sorted_by_name() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "zeta" });
        reg.register(EchoTool { name: "alpha" });
        let schemas = reg.schemas();
        assert_eq!(schemas[0].name, "alpha");
        assert_eq!(schemas[1].name, "zeta");
    }

    #[test]
    fn validate_unknown_tool_is_error() {
        let reg = ToolRegistry::new();
        let errs = reg.validate_tool_args("missing", &json!({})).unwrap_err();
        assert!(errs[0].contains("unknown tool"));
    }

    #[test]
    fn validate_known_tool_applies_schema() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "echo" });
        assert!(reg.validate_tool_args("echo", &json!({"text": "hi"})).is_ok());
        assert!(reg.validate_tool_args("echo", &json!({})).is_err());
    }

    #[test]
    fn load_tools_skips_unknown_specs() {
        let mut reg = ToolRegistry::new();
        let deps = ToolDeps::new(std::env::temp_dir());
        reg.load_tools(&["think:Think", "bogus:Nope", "file:ReadFile"], &deps);
        // The bad spec is skipped; both valid siblings are registered.
        assert_eq!(reg.names(), vec!["read_file", "think"]);
    }

    #[test]
    fn registering_same_name_twice_overwrites() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "t" });
        reg.register(EchoTool { name: "t" });
        assert_eq!(reg.names().len(), 1);
    }
}
