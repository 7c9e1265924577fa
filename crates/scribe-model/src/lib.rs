// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod mock;
pub mod openai_compat;
pub mod pricing;
pub mod provider;
pub mod types;

pub use mock::{MockProvider, ScriptItem, ScriptedProvider};
pub use openai_compat::OpenAiCompatProvider;
pub use provider::{ChunkStream, ModelProvider};
pub use types::{
    CompletionRequest, Message, Role, StreamChunk, ToolCallRecord, ToolSchema, Usage,
};

use scribe_config::ModelConfig;

/// Build a provider from configuration.
///
/// `provider: mock` yields the deterministic echo provider; anything else is
/// treated as an OpenAI-compatible endpoint (hosted OpenAI, LMStudio, Ollama,
/// llama.cpp, vLLM, proxies).
pub fn from_config(cfg: &ModelConfig) -> anyhow::Result<Box<dyn ModelProvider>> {
    match cfg.provider.as_str() {
        "mock" => Ok(Box::new(MockProvider)),
        _ => Ok(Box::new(OpenAiCompatProvider::from_config(cfg)?)),
    }
}
