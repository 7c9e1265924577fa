// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Static price table used by the cost tracker.
//!
//! Prices are USD per million tokens.  `cached_discount` is the fraction of
//! the input price charged for tokens served from the provider's prompt
//! cache (e.g. 0.25 = cached input costs a quarter of fresh input).

#[derive(Debug, Clone, Copy)]
pub struct ModelPrice {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
    pub cached_discount: f64,
}

const PRICES: &[(&str, ModelPrice)] = &[
    (
        "gpt-4o",
        ModelPrice { input_per_mtok: 2.50, output_per_mtok: 10.00, cached_discount: 0.50 },
    ),
    (
        "gpt-4o-mini",
        ModelPrice { input_per_mtok: 0.15, output_per_mtok: 0.60, cached_discount: 0.50 },
    ),
    (
        "gpt-4.1",
        ModelPrice { input_per_mtok: 2.00, output_per_mtok: 8.00, cached_discount: 0.25 },
    ),
    (
        "gpt-4.1-mini",
        ModelPrice { input_per_mtok: 0.40, output_per_mtok: 1.60, cached_discount: 0.25 },
    ),
    (
        "deepseek-chat",
        ModelPrice { input_per_mtok: 0.27, output_per_mtok: 1.10, cached_discount: 0.25 },
    ),
    (
        "claude-sonnet-4-20250514",
        ModelPrice { input_per_mtok: 3.00, output_per_mtok: 15.00, cached_discount: 0.10 },
    ),
];

/// Look up the price entry for a model id.  Unknown models return `None`
/// and are accounted at zero cost.
pub fn lookup(model: &str) -> Option<ModelPrice> {
    PRICES.iter().find(|(id, _)| *id == model).map(|(_, p)| *p)
}

/// Convert a token triple into USD for the given model.
pub fn usd(model: &str, input_tokens: u64, output_tokens: u64, cached_tokens: u64) -> f64 {
    let Some(p) = lookup(model) else { return 0.0 };
    let fresh_input = input_tokens.saturating_sub(cached_tokens) as f64;
    let cached = cached_tokens as f64;
    (fresh_input * p.input_per_mtok
        + cached * p.input_per_mtok * p.cached_discount
        + output_tokens as f64 * p.output_per_mtok)
        / 1_000_000.0
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
