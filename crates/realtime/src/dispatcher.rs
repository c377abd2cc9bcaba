//! Topic dispatcher: routes inbound envelopes to subscribers by `type`.
//!
//! Handlers for a topic receive the envelope's payload object.  Handlers on
//! the wildcard topic (`"message"`) receive the whole envelope, `type`
//! included, for every envelope dispatched.  Within a topic, handlers run in
//! registration order.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use pl_protocol::{Envelope, WILDCARD_TOPIC};
use serde_json::Value;

/// A subscriber callback.
pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Identifies one registration, for [`Dispatcher::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
pub struct Dispatcher {
    next_id: AtomicU64,
    topics: Mutex<HashMap<String, Vec<(HandlerId, Handler)>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `handler` to `topic`.
    pub fn on<F>(&self, topic: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.on_arc(topic, Arc::new(handler))
    }

    /// Subscribe a pre-wrapped handler.
    pub fn on_arc(&self, topic: impl Into<String>, handler: Handler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.topics
            .lock()
            .entry(topic.into())
            .or_default()
            .push((id, handler));
        id
    }

    /// Remove one registration.  Unknown ids are a no-op returning `false`.
    pub fn off(&self, topic: &str, id: HandlerId) -> bool {
        let mut topics = self.topics.lock();
        let Some(handlers) = topics.get_mut(topic) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            topics.remove(topic);
        }
        removed
    }

    /// Number of handlers currently registered on `topic`.
    pub fn handler_count(&self, topic: &str) -> usize {
        self.topics.lock().get(topic).map_or(0, Vec::len)
    }

    /// Deliver `envelope` to its topic, then to the wildcard topic.
    ///
    /// A panicking handler is logged and skipped; the rest still run.
    /// Returns how many handlers completed normally.
    pub fn dispatch(&self, envelope: &Envelope) -> usize {
        // Snapshot so handlers can call on/off without deadlocking.
        let (direct, wildcard) = {
            let topics = self.topics.lock();
            let direct = if envelope.kind == WILDCARD_TOPIC {
                Vec::new()
            } else {
                snapshot(&topics, &envelope.kind)
            };
            (direct, snapshot(&topics, WILDCARD_TOPIC))
        };

        let mut delivered = 0;
        if !direct.is_empty() {
            let payload = envelope.payload_value();
            delivered += invoke_all(&envelope.kind, &direct, &payload);
        }
        if !wildcard.is_empty() {
            let whole = envelope.to_value();
            delivered += invoke_all(WILDCARD_TOPIC, &wildcard, &whole);
        }
        delivered
    }
}

fn snapshot(topics: &HashMap<String, Vec<(HandlerId, Handler)>>, topic: &str) -> Vec<Handler> {
    topics
        .get(topic)
        .map(|hs| hs.iter().map(|(_, h)| h.clone()).collect())
        .unwrap_or_default()
}

fn invoke_all(topic: &str, handlers: &[Handler], value: &Value) -> usize {
    let mut ok = 0;
    for (index, handler) in handlers.iter().enumerate() {
        match catch_unwind(AssertUnwindSafe(|| handler(value))) {
            Ok(()) => ok += 1,
            Err(panic) => {
                tracing::error!(
                    topic = %topic,
                    handler_index = index,
                    panic = %panic_message(panic.as_ref()),
                    "subscriber panicked during dispatch"
                );
            }
        }
    }
    ok
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".into()
    }
}
