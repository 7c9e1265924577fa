// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Layered configuration loading.
//!
//! Configuration can live at the system, user, and workspace level.  Every
//! file that exists contributes one YAML layer; layers are overlaid in
//! priority order so a workspace file overrides user settings key-by-key,
//! which override system settings.  An explicit `--config` path is applied
//! last and, unlike the standard locations, must exist.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde_yaml::Value;
use tracing::debug;

use crate::Config;

/// Candidate config files, lowest priority first.
///
/// Each location is a path stem expanded to both the `.yaml` and `.yml`
/// spelling, so `~/.config/scribe/config.yml` works as well as the
/// canonical `.yaml` name.
fn search_paths() -> Vec<PathBuf> {
    let mut stems = vec![PathBuf::from("/etc/scribe/config")];
    if let Some(home) = dirs::home_dir() {
        stems.push(home.join(".config/scribe/config"));
    }
    if let Some(cfg) = dirs::config_dir() {
        stems.push(cfg.join("scribe/config"));
    }
    // Workspace-local: a config directory or a single hidden file.
    stems.push(PathBuf::from(".scribe/config"));
    stems.push(PathBuf::from(".scribe"));

    stems
        .into_iter()
        .flat_map(|stem| {
            ["yaml", "yml"]
                .into_iter()
                .map(move |ext| stem.with_extension(ext))
        })
        .collect()
}

/// Load the effective configuration.
///
/// `explicit` is the `--config` CLI flag; a missing explicit file is an
/// error, a missing standard location is simply skipped.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut layers: Vec<(PathBuf, Value)> = Vec::new();
    for path in search_paths() {
        if path.is_file() {
            layers.push((path.clone(), read_layer(&path)?));
        }
    }
    if let Some(path) = explicit {
        layers.push((path.to_path_buf(), read_layer(path)?));
    }

    let mut config = if layers.is_empty() {
        Config::default()
    } else {
        let mut merged = Value::Null;
        for (path, layer) in layers {
            if layer.is_null() {
                // An empty file contributes nothing; overlaying null would
                // erase the layers below it.
                continue;
            }
            debug!(path = %path.display(), "applying config layer");
            merged = overlay(merged, layer);
        }
        match serde_yaml::from_value(merged) {
            Ok(config) => config,
            Err(e) => {
                debug!(error = %e, "merged config did not deserialize; using defaults");
                Config::default()
            }
        }
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

fn read_layer(path: &Path) -> anyhow::Result<Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    serde_yaml::from_str(&text)
        .with_context(|| format!("config file {} is not valid YAML", path.display()))
}

/// Overlay `layer` onto `base` and return the combined value.
///
/// Two mappings merge key-by-key, recursing into shared keys; every other
/// combination resolves to the layer's value.
fn overlay(base: Value, layer: Value) -> Value {
    match (base, layer) {
        (Value::Mapping(mut below), Value::Mapping(above)) => {
            for (key, value) in above {
                let combined = match below.remove(&key) {
                    Some(existing) => overlay(existing, value),
                    None => value,
                };
                below.insert(key, combined);
            }
            Value::Mapping(below)
        }
        (_, layer) => layer,
    }
}

/// Environment overrides layered on top of the file config.  Provider API
/// keys are read lazily via `api_key_env` and never stored here.
fn apply_env_overrides(config: &mut Config) {
    if let Ok(dir) = std::env::var("SCRIBE_LOG_DIR") {
        if !dir.is_empty() {
            config.storage.log_dir = Some(PathBuf::from(dir));
        }
    }
    if let Ok(mode) = std::env::var("SCRIBE_POLICY_MODE") {
        match mode.as_str() {
            "off" => config.tools.policy_mode = crate::PolicyMode::Off,
            "log_only" => config.tools.policy_mode = crate::PolicyMode::LogOnly,
            "enforce" => config.tools.policy_mode = crate::PolicyMode::Enforce,
            other => debug!(mode = other, "ignoring unknown SCRIBE_POLICY_MODE"),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
