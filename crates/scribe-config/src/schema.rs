// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier: "openai" (any OpenAI-compatible endpoint) | "mock"
    pub provider: String,
    /// Model name forwarded to the provider API
    pub name: String,
    /// Environment variable that holds the API key (read at runtime)
    pub api_key_env: Option<String>,
    /// Base URL override.  Useful for local servers, LiteLLM, or proxies.
    pub base_url: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            name: "gpt-4o".into(),
            api_key_env: Some("OPENAI_API_KEY".into()),
            base_url: None,
        }
    }
}

/// Knobs for the agent engine: step budgets, compaction, tool scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum provider calls within one turn before the turn is stopped
    /// with `step_limit_reached`.
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    /// Token estimate above which the context is compacted before the next
    /// provider call.
    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold_tokens: usize,
    /// Number of trailing messages preserved verbatim by compaction.
    #[serde(default = "default_keep_recent")]
    pub compaction_keep_recent: usize,
    /// Size of the pool that runs concurrent-safe tool calls.
    #[serde(default = "default_pool_size")]
    pub tool_pool_size: usize,
    /// Step budget for sub-agents spawned by the sub-agent tool.
    #[serde(default = "default_sub_agent_max_steps")]
    pub sub_agent_max_steps: u32,
    /// Upper bound on concurrently running parallel sub-agents.
    #[serde(default = "default_max_parallel_sub_agents")]
    pub max_parallel_sub_agents: usize,
    /// Overall wall-clock budget for one parallel sub-agent batch.
    #[serde(default = "default_parallel_timeout")]
    pub parallel_sub_agent_timeout_secs: u64,
    /// Retries for a provider call that fails mid-stream.
    #[serde(default = "default_provider_retries")]
    pub provider_retries: u32,
}

fn default_max_steps() -> u32 {
    30
}
fn default_compaction_threshold() -> usize {
    80_000
}
fn default_keep_recent() -> usize {
    10
}
fn default_pool_size() -> usize {
    4
}
fn default_sub_agent_max_steps() -> u32 {
    30
}
fn default_max_parallel_sub_agents() -> usize {
    4
}
fn default_parallel_timeout() -> u64 {
    600
}
fn default_provider_retries() -> u32 {
    1
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            compaction_threshold_tokens: default_compaction_threshold(),
            compaction_keep_recent: default_keep_recent(),
            tool_pool_size: default_pool_size(),
            sub_agent_max_steps: default_sub_agent_max_steps(),
            max_parallel_sub_agents: default_max_parallel_sub_agents(),
            parallel_sub_agent_timeout_secs: default_parallel_timeout(),
            provider_retries: default_provider_retries(),
        }
    }
}

/// How policy findings affect tool execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMode {
    /// Hooks are not consulted at all.
    Off,
    /// Hooks run; every `block` is downgraded to `warn`.
    LogOnly,
    /// Hooks run; `block` findings prevent execution.
    #[default]
    Enforce,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Default per-tool execution timeout (tools may override).
    #[serde(default = "default_tool_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub policy_mode: PolicyMode,
    /// Shell-glob patterns; a matching command string yields a `warn` finding.
    #[serde(default)]
    pub warn_patterns: Vec<String>,
    /// Shell-glob patterns; a matching command string yields a `block` finding.
    #[serde(default = "default_block_patterns")]
    pub block_patterns: Vec<String>,
}

fn default_tool_timeout() -> u64 {
    120
}

fn default_block_patterns() -> Vec<String> {
    vec!["rm -rf /*".into(), "mkfs*".into(), "* > /dev/sda*".into()]
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_tool_timeout(),
            policy_mode: PolicyMode::default(),
            warn_patterns: Vec::new(),
            block_patterns: default_block_patterns(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root under which `projects/<id>/` directories are created.
    /// Defaults to `~/.scribe`.
    pub base_dir: Option<PathBuf>,
    /// Directory for the structured JSONL log.  `None` disables the file sink.
    pub log_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            log_dir: None,
        }
    }
}

impl StorageConfig {
    /// Resolve the effective base directory, falling back to `~/.scribe`.
    pub fn resolved_base_dir(&self) -> PathBuf {
        if let Some(dir) = &self.base_dir {
            return dir.clone();
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".scribe")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
