// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! In-process, session-scoped event broadcaster.
//!
//! Single producer (the turn driver), any number of readers.  Each
//! subscriber holds an independent cursor into the append-only event log,
//! so a reader that subscribes at sequence 0 sees every event in producer
//! order.  `Done` closes the bus; emitting afterwards is a no-op.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::Stream;
use tokio::sync::Notify;
use tracing::warn;

use crate::events::{EventEnvelope, StreamEvent};

type Callback = Box<dyn Fn(&EventEnvelope) + Send + Sync>;

struct BusInner {
    events: Vec<Arc<EventEnvelope>>,
    closed: bool,
}

pub struct EventBus {
    session_id: String,
    inner: Mutex<BusInner>,
    notify: Notify,
    callbacks: Mutex<Vec<Callback>>,
}

impl EventBus {
    pub fn new(session_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            session_id: session_id.into(),
            inner: Mutex::new(BusInner {
                events: Vec::new(),
                closed: false,
            }),
            notify: Notify::new(),
            callbacks: Mutex::new(Vec::new()),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Append an event.  Returns its sequence number, or `None` when the bus
    /// is already closed (emit-after-`Done` is a no-op).
    pub fn emit(&self, event: StreamEvent) -> Option<u64> {
        let envelope = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return None;
            }
            let envelope = Arc::new(EventEnvelope {
                seq: inner.events.len() as u64,
                session_id: self.session_id.clone(),
                ts: Utc::now(),
                event,
            });
            if envelope.event.is_done() {
                inner.closed = true;
            }
            inner.events.push(envelope.clone());
            envelope
        };
        self.notify.notify_waiters();

        // Callback fan-out is fault-isolated: a panicking observer is logged
        // and must not block other subscribers or halt the producer.
        let callbacks = self.callbacks.lock().unwrap();
        for cb in callbacks.iter() {
            if catch_unwind(AssertUnwindSafe(|| cb(&envelope))).is_err() {
                warn!(seq = envelope.seq, "event callback panicked");
            }
        }

        Some(envelope.seq)
    }

    /// Register a synchronous observer invoked for every subsequent event.
    pub fn on_event(&self, cb: impl Fn(&EventEnvelope) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().push(Box::new(cb));
    }

    /// All events at or after `cursor`, plus the new cursor.
    pub fn events_since(&self, cursor: u64) -> (Vec<Arc<EventEnvelope>>, u64) {
        let inner = self.inner.lock().unwrap();
        let events: Vec<Arc<EventEnvelope>> = inner
            .events
            .iter()
            .skip(cursor as usize)
            .cloned()
            .collect();
        (events, inner.events.len() as u64)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// A cursor-based reader starting at sequence 0.
    pub fn subscribe(self: &Arc<Self>) -> BusSubscriber {
        BusSubscriber {
            bus: Arc::clone(self),
            cursor: 0,
        }
    }
}

/// Independent reader over the bus's event log.
pub struct BusSubscriber {
    bus: Arc<EventBus>,
    cursor: u64,
}

impl BusSubscriber {
    /// Next event in producer order; `None` once every event up to and
    /// including `Done` has been consumed.
    pub async fn next(&mut self) -> Option<Arc<EventEnvelope>> {
        loop {
            // Register interest before checking state so an emit between the
            // check and the await cannot be missed.
            let notified = self.bus.notify.notified();
            {
                let inner = self.bus.inner.lock().unwrap();
                if (self.cursor as usize) < inner.events.len() {
                    let ev = inner.events[self.cursor as usize].clone();
                    self.cursor += 1;
                    return Some(ev);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Consume the subscriber as an async stream terminated by `Done`.
    pub fn into_stream(self) -> impl Stream<Item = Arc<EventEnvelope>> {
        futures::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|ev| (ev, sub))
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
