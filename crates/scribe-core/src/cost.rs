// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

use serde::Serialize;

use scribe_model::{pricing, Usage};

/// Accumulated tokens and dollars for one model (or a total).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ModelUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub usd: f64,
}

impl ModelUsage {
    fn add(&mut self, other: &ModelUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cached_tokens += other.cached_tokens;
        self.usd += other.usd;
    }

    fn sub(&self, other: &ModelUsage) -> ModelUsage {
        ModelUsage {
            input_tokens: self.input_tokens - other.input_tokens,
            output_tokens: self.output_tokens - other.output_tokens,
            cached_tokens: self.cached_tokens - other.cached_tokens,
            usd: self.usd - other.usd,
        }
    }
}

/// Append-only usage accountant.  Written by the turn driver from provider
/// usage reports; read by consumers after `Done`.
#[derive(Debug, Default)]
pub struct CostTracker {
    by_model: HashMap<String, ModelUsage>,
    totals: ModelUsage,
    turn_start: ModelUsage,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a usage report from the provider.
    pub fn add_usage(&mut self, model: &str, usage: &Usage) {
        let delta = ModelUsage {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cached_tokens: usage.cached_tokens,
            usd: pricing::usd(
                model,
                usage.input_tokens,
                usage.output_tokens,
                usage.cached_tokens,
            ),
        };
        self.by_model.entry(model.to_string()).or_default().add(&delta);
        self.totals.add(&delta);
    }

    /// Mark the start of a turn so [`turn_delta`] can report what this turn
    /// alone consumed.
    pub fn begin_turn(&mut self) {
        self.turn_start = self.totals;
    }

    /// Usage accumulated since the last [`begin_turn`].
    pub fn turn_delta(&self) -> ModelUsage {
        self.totals.sub(&self.turn_start)
    }

    /// Per-session running total.
    pub fn totals(&self) -> ModelUsage {
        self.totals
    }

    pub fn by_model(&self) -> &HashMap<String, ModelUsage> {
        &self.by_model
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(input: u64, output: u64, cached: u64) -> Usage {
        Usage {
            input_tokens: input,
            output_tokens: output,
            cached_tokens: cached,
        }
    }

    #[test]
    fn totals_accumulate_across_models() {
        let mut c = CostTracker::new();
        c.add_usage("gpt-4o", &usage(100, 10, 0));
        c.add_usage("gpt-4o-mini", &usage(50, 5, 0));
        assert_eq!(c.totals().input_tokens, 150);
        assert_eq!(c.totals().output_tokens, 15);
        assert_eq!(c.by_model().len(), 2);
    }

    #[test]
    fn known_model_accrues_dollars() {
        let mut c = CostTracker::new();
        c.add_usage("gpt-4o", &usage(1_000_000, 0, 0));
        assert!((c.totals().usd - 2.50).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_accrues_tokens_at_zero_cost() {
        let mut c = CostTracker::new();
        c.add_usage("mystery", &usage(1000, 1000, 0));
        assert_eq!(c.totals().usd, 0.0);
        assert_eq!(c.totals().output_tokens, 1000);
    }

    #[test]
    fn turn_delta_reports_only_current_turn() {
        let mut c = CostTracker::new();
        c.add_usage("gpt-4o", &usage(100, 10, 0));
        c.begin_turn();
        c.add_usage("gpt-4o", &usage(30, 3, 0));
        let delta = c.turn_delta();
        assert_eq!(delta.input_tokens, 30);
        assert_eq!(delta.output_tokens, 3);
        assert_eq!(c.totals().input_tokens, 130);
    }

    #[test]
    fn cached_tokens_tracked_separately() {
        let mut c = CostTracker::new();
        c.add_usage("gpt-4o", &usage(100, 10, 60));
        assert_eq!(c.totals().cached_tokens, 60);
    }
}
