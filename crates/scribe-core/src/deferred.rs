// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Deferred persistence buffer.
//!
//! Tools that produce the product document or HTML pages record them here
//! instead of persisting on every write; the turn driver flushes once at
//! turn end.  Repeated writes of the same key coalesce (last writer wins),
//! so a model that rewrites a page five times in one turn costs one persist.

use std::collections::HashMap;

use tracing::warn;

use crate::store::Persistence;

#[derive(Debug, Clone)]
struct Entry {
    path: String,
    content: String,
}

#[derive(Debug, Default)]
pub struct DeferredPersistenceBuffer {
    product_doc: Option<Entry>,
    html: HashMap<String, Entry>,
}

impl DeferredPersistenceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the product document.  Overwrites any earlier record silently.
    pub fn record_product_doc(&mut self, path: &str, content: &str) {
        self.product_doc = Some(Entry {
            path: path.to_string(),
            content: content.to_string(),
        });
    }

    /// Record an HTML page keyed by slug.  Overwrites earlier records for
    /// the same slug silently.
    pub fn record_html(&mut self, path: &str, content: &str, slug: &str) {
        self.html.insert(
            slug.to_string(),
            Entry {
                path: path.to_string(),
                content: content.to_string(),
            },
        );
    }

    pub fn has_pending(&self) -> bool {
        self.product_doc.is_some() || !self.html.is_empty()
    }

    pub fn clear(&mut self) {
        self.product_doc = None;
        self.html.clear();
    }

    /// Persist each buffered key exactly once, then clear the buffer.
    ///
    /// Per-key failures are logged and do not prevent other keys from
    /// flushing.  The buffer clears even when `persistence` is `None` or
    /// every persist call fails.  Returns the number of keys persisted.
    pub fn flush(&mut self, persistence: Option<&dyn Persistence>, session_id: &str) -> usize {
        let mut persisted = 0usize;

        if let Some(p) = persistence {
            if let Some(doc) = &self.product_doc {
                match p.persist_artifact(session_id, &doc.path, doc.content.as_bytes()) {
                    Ok(()) => persisted += 1,
                    Err(e) => {
                        warn!(session_id, path = %doc.path, error = %e, "deferred flush failed")
                    }
                }
            }
            // Deterministic flush order for stable logs.
            let mut slugs: Vec<&String> = self.html.keys().collect();
            slugs.sort();
            for slug in slugs {
                let entry = &self.html[slug];
                match p.persist_artifact(session_id, &entry.path, entry.content.as_bytes()) {
                    Ok(()) => persisted += 1,
                    Err(e) => {
                        warn!(session_id, slug = %slug, error = %e, "deferred flush failed")
                    }
                }
            }
        }

        self.clear();
        persisted
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
