// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use async_trait::async_trait;

use crate::tool::{ProgressSink, Tool, ToolCall, ToolParam, ToolResult};

/// Fetch a URL and return the response body as text.
///
/// Network failures are retryable; HTTP error statuses are not (the server
/// answered, retrying will not change its mind for 4xx, and the model should
/// see 5xx bodies).
pub struct WebFetchTool {
    client: reqwest::Client,
}

impl WebFetchTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for WebFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch a URL over HTTP GET and return the response body as text."
    }

    fn parameters(&self) -> Vec<ToolParam> {
        vec![ToolParam::string("url", "The URL to fetch")]
    }

    fn read_only(&self) -> bool {
        true
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    fn max_retries(&self) -> u32 {
        2
    }

    async fn execute(&self, call: &ToolCall, progress: &ProgressSink) -> ToolResult {
        let Some(url) = call.args.get("url").and_then(|v| v.as_str()) else {
            return ToolResult::err("missing 'url' parameter");
        };
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return ToolResult::err(format!("unsupported URL scheme: {url}"));
        }

        progress.report(format!("fetching {url}"), None);
        let resp = match self.client.get(url).send().await {
            Ok(r) => r,
            Err(e) => return ToolResult::err_retryable(format!("fetch failed: {e}")),
        };
        let status = resp.status();
        match resp.text().await {
            Ok(body) if status.is_success() => ToolResult::ok(body),
            Ok(body) => ToolResult::err(format!("HTTP {status}: {body}")),
            Err(e) => ToolResult::err_retryable(format!("read failed: {e}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
