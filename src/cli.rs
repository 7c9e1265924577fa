// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::Parser;

/// Scribe — an AI CLI coding assistant.
///
/// With --prompt it runs a single turn and exits; otherwise it starts an
/// interactive loop reading prompts from stdin.
#[derive(Debug, Parser)]
#[command(name = "scribe", version, about)]
pub struct Cli {
    /// Resume a previous project by ID
    #[arg(short, long)]
    pub resume: Option<String>,

    /// Model name override (e.g. gpt-4o-mini, or "mock")
    #[arg(short, long)]
    pub model: Option<String>,

    /// Run a single prompt and exit (non-interactive mode)
    #[arg(short, long)]
    pub prompt: Option<String>,

    /// Explicit config file (merged over the standard search paths)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_long_flags() {
        let cli = Cli::try_parse_from(["scribe", "--resume", "abc123", "--prompt", "hi"]).unwrap();
        assert_eq!(cli.resume.as_deref(), Some("abc123"));
        assert_eq!(cli.prompt.as_deref(), Some("hi"));
    }

    #[test]
    fn parses_short_flags_and_verbosity() {
        let cli = Cli::try_parse_from(["scribe", "-m", "mock", "-vv"]).unwrap();
        assert_eq!(cli.model.as_deref(), Some("mock"));
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn rejects_unknown_flags() {
        assert!(Cli::try_parse_from(["scribe", "--bogus"]).is_err());
    }
}
