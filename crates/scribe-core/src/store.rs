// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Session persistence: the abstract [`Persistence`] contract consumed by
//! the engine, and the filesystem [`ProjectStore`] implementing it.
//!
//! Each project lives at:
//! ```text
//! <base>/projects/<project_id>/
//!   meta.json        {id, title, created_at, updated_at}
//!   context.jsonl    one message per line
//!   workspace/       tool-produced artifacts
//! ```

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use scribe_model::Message;

use crate::context::Context;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectMeta {
    pub id: String,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Persistence contract consumed by the engine.  All operations may fail;
/// callers surface failures via structured-log records and never propagate
/// them into the user loop.
pub trait Persistence: Send + Sync {
    fn load_session(&self, id: &str) -> anyhow::Result<(Vec<Message>, ProjectMeta)>;
    fn append_message(&self, id: &str, msg: &Message) -> anyhow::Result<()>;
    fn save_snapshot(&self, id: &str, label: &str, messages: &[Message]) -> anyhow::Result<()>;
    fn persist_artifact(&self, id: &str, key: &str, bytes: &[u8]) -> anyhow::Result<()>;
}

/// Filesystem project store.
pub struct ProjectStore {
    base_dir: PathBuf,
}

impl ProjectStore {
    pub fn new(base: &Path) -> anyhow::Result<Self> {
        let base_dir = base.join("projects");
        std::fs::create_dir_all(&base_dir)
            .with_context(|| format!("creating {}", base_dir.display()))?;
        Ok(Self { base_dir })
    }

    pub fn create(&self, title: &str) -> anyhow::Result<ProjectMeta> {
        let now = Utc::now().to_rfc3339();
        let id = Uuid::new_v4().simple().to_string()[..12].to_string();
        let meta = ProjectMeta {
            id: id.clone(),
            title: if title.is_empty() {
                format!("Project {}", &now[..10])
            } else {
                title.to_string()
            },
            created_at: now.clone(),
            updated_at: now,
        };
        std::fs::create_dir_all(self.workspace_dir(&id))?;
        self.save_meta(&meta)?;
        Ok(meta)
    }

    pub fn get(&self, id: &str) -> Option<ProjectMeta> {
        let path = self.project_dir(id).join("meta.json");
        let text = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&text).ok()
    }

    /// Most recently created projects first.
    pub fn list(&self, limit: usize) -> Vec<ProjectMeta> {
        let Ok(rd) = std::fs::read_dir(&self.base_dir) else {
            return Vec::new();
        };
        let mut metas: Vec<ProjectMeta> = rd
            .flatten()
            .filter(|e| e.path().is_dir())
            .filter_map(|e| self.get(&e.file_name().to_string_lossy()))
            .collect();
        metas.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        metas.truncate(limit);
        metas
    }

    pub fn project_dir(&self, id: &str) -> PathBuf {
        self.base_dir.join(id)
    }

    pub fn workspace_dir(&self, id: &str) -> PathBuf {
        self.project_dir(id).join("workspace")
    }

    pub fn context_path(&self, id: &str) -> PathBuf {
        self.project_dir(id).join("context.jsonl")
    }

    pub fn update_timestamp(&self, meta: &mut ProjectMeta) -> anyhow::Result<()> {
        meta.updated_at = Utc::now().to_rfc3339();
        self.save_meta(meta)
    }

    fn save_meta(&self, meta: &ProjectMeta) -> anyhow::Result<()> {
        let path = self.project_dir(&meta.id).join("meta.json");
        std::fs::write(&path, serde_json::to_string_pretty(meta)?)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

impl Persistence for ProjectStore {
    fn load_session(&self, id: &str) -> anyhow::Result<(Vec<Message>, ProjectMeta)> {
        let meta = self
            .get(id)
            .with_context(|| format!("no such project: {id}"))?;
        let report = Context::load(&self.context_path(id), "")?;
        Ok((report.context.messages().to_vec(), meta))
    }

    fn append_message(&self, id: &str, msg: &Message) -> anyhow::Result<()> {
        let path = self.context_path(id);
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        writeln!(f, "{}", serde_json::to_string(msg)?)?;
        Ok(())
    }

    fn save_snapshot(&self, id: &str, label: &str, messages: &[Message]) -> anyhow::Result<()> {
        let dir = self.project_dir(id).join("snapshots");
        std::fs::create_dir_all(&dir)?;
        let mut out = String::new();
        for m in messages {
            out.push_str(&serde_json::to_string(m)?);
            out.push('\n');
        }
        std::fs::write(dir.join(format!("{label}.jsonl")), out)?;
        Ok(())
    }

    fn persist_artifact(&self, id: &str, key: &str, bytes: &[u8]) -> anyhow::Result<()> {
        let path = self.workspace_dir(id).join(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
