// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use regex::Regex;
use serde_json::Value;

use scribe_config::ToolsConfig;

use crate::tool::ToolResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warn,
    Block,
}

/// One policy finding produced by a pre- or post-hook.
#[derive(Debug, Clone)]
pub struct Finding {
    pub policy: String,
    pub severity: Severity,
    pub message: String,
}

/// External policy hook consulted by the execution gate.
///
/// The pre-hook runs before execution; a `Block` finding prevents the call
/// (subject to the configured mode).  The post-hook may rewrite the result,
/// e.g. replacing oversized output with a truncation marker.
pub trait PolicyHook: Send + Sync {
    fn pre(&self, tool: &str, args: &Value) -> Vec<Finding>;

    fn post(&self, tool: &str, args: &Value, result: ToolResult) -> (ToolResult, Vec<Finding>) {
        let _ = (tool, args);
        (result, Vec::new())
    }
}

/// Hook that never produces findings.
pub struct NoopPolicy;

impl PolicyHook for NoopPolicy {
    fn pre(&self, _tool: &str, _args: &Value) -> Vec<Finding> {
        Vec::new()
    }
}

/// Pattern-based policy: shell-glob patterns matched against the textual
/// rendering of a call's arguments (the `command` string when present, the
/// whole argument object otherwise).
pub struct PatternPolicy {
    warn_patterns: Vec<Regex>,
    block_patterns: Vec<Regex>,
    /// Post-hook output ceiling in bytes; larger outputs are replaced by a
    /// truncation marker.
    max_output_bytes: usize,
}

impl PatternPolicy {
    pub fn from_config(cfg: &ToolsConfig) -> Self {
        let compile = |patterns: &[String]| -> Vec<Regex> {
            patterns.iter().filter_map(|p| glob_to_regex(p)).collect()
        };
        Self {
            warn_patterns: compile(&cfg.warn_patterns),
            block_patterns: compile(&cfg.block_patterns),
            max_output_bytes: 200_000,
        }
    }

    fn subject(args: &Value) -> String {
        args.get("command")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| args.to_string())
    }
}

impl PolicyHook for PatternPolicy {
    fn pre(&self, tool: &str, args: &Value) -> Vec<Finding> {
        let subject = Self::subject(args);
        let mut findings = Vec::new();
        for re in &self.block_patterns {
            if re.is_match(&subject) {
                findings.push(Finding {
                    policy: "pattern".into(),
                    severity: Severity::Block,
                    message: format!("{tool}: blocked by pattern {}", re.as_str()),
                });
            }
        }
        for re in &self.warn_patterns {
            if re.is_match(&subject) {
                findings.push(Finding {
                    policy: "pattern".into(),
                    severity: Severity::Warn,
                    message: format!("{tool}: matched warn pattern {}", re.as_str()),
                });
            }
        }
        findings
    }

    fn post(&self, tool: &str, _args: &Value, mut result: ToolResult) -> (ToolResult, Vec<Finding>) {
        if result.output.len() > self.max_output_bytes {
            let bytes = result.output.len();
            result.output = format!("{{\"truncated\": true, \"bytes\": {bytes}}}");
            let finding = Finding {
                policy: "output-size".into(),
                severity: Severity::Warn,
                message: format!("{tool}: output of {bytes} bytes replaced by truncation marker"),
            };
            return (result, vec![finding]);
        }
        (result, Vec::new())
    }
}

/// Convert a simple shell glob pattern to a [`Regex`].
/// Only `*` (match anything) and `?` (match one char) are supported.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => {
                for esc in regex::escape(&c.to_string()).chars() {
                    re.push(esc);
                }
            }
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_with(warn: &[&str], block: &[&str]) -> PatternPolicy {
        PatternPolicy::from_config(&ToolsConfig {
            warn_patterns: warn.iter().map(|s| s.to_string()).collect(),
            block_patterns: block.iter().map(|s| s.to_string()).collect(),
            ..ToolsConfig::default()
        })
    }

    // ── Pre-hook matching ─────────────────────────────────────────────────────

    #[test]
    fn block_pattern_produces_block_finding() {
        let p = policy_with(&[], &["rm -rf /*"]);
        let findings = p.pre("shell", &serde_json::json!({"command": "rm -rf /tmp"}));
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Block);
    }

    #[test]
    fn warn_pattern_produces_warn_finding() {
        let p = policy_with(&["curl *"], &[]);
        let findings = p.pre("shell", &serde_json::json!({"command": "curl http://x"}));
        assert_eq!(findings[0].severity, Severity::Warn);
    }

    #[test]
    fn unmatched_command_produces_no_findings() {
        let p = policy_with(&["curl *"], &["rm -rf /*"]);
        let findings = p.pre("shell", &serde_json::json!({"command": "git status"}));
        assert!(findings.is_empty());
    }

    #[test]
    fn args_without_command_match_against_json() {
        let p = policy_with(&["*secret*"], &[]);
        let findings = p.pre("write_file", &serde_json::json!({"path": "secret.txt"}));
        assert_eq!(findings.len(), 1);
    }

    #[test]
    fn question_mark_matches_exactly_one_char() {
        let p = policy_with(&["ls ?"], &[]);
        assert_eq!(p.pre("shell", &serde_json::json!({"command": "ls -"})).len(), 1);
        assert!(p.pre("shell", &serde_json::json!({"command": "ls --"})).is_empty());
    }

    // ── Post-hook truncation ──────────────────────────────────────────────────

    #[test]
    fn small_output_passes_post_hook_unchanged() {
        let p = policy_with(&[], &[]);
        let (r, findings) = p.post("shell", &serde_json::json!({}), ToolResult::ok("short"));
        assert_eq!(r.output, "short");
        assert!(findings.is_empty());
    }

    #[test]
    fn oversized_output_replaced_by_marker() {
        let p = policy_with(&[], &[]);
        let big = "x".repeat(200_001);
        let (r, findings) = p.post("shell", &serde_json::json!({}), ToolResult::ok(big));
        assert!(r.output.contains("\"truncated\": true"));
        assert!(r.output.contains("200001"));
        assert_eq!(findings.len(), 1);
    }

    // ── Noop hook ─────────────────────────────────────────────────────────────

    #[test]
    fn noop_policy_never_finds_anything() {
        let p = NoopPolicy;
        assert!(p.pre("shell", &serde_json::json!({"command": "rm -rf /"})).is_empty());
    }
}
