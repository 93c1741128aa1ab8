//! Event bus
//!
//! In-process publish/subscribe registry shared by the supervision loops.
//! One bus is built at startup and handed to every component; there is no
//! global instance.
//!
//! Delivery is synchronous and best-effort: `publish` calls every handler
//! registered for the topic, in subscription order, and a handler that
//! returns an error or panics is logged and skipped. Nothing a handler does
//! reaches the publisher.

use anyhow::Result;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use tracing::{error, warn};
use warden_common::{EventKind, WardenEvent};

/// Subscriber callback. Identity is the `Arc` allocation, so keep the clone
/// you subscribed with if you intend to unsubscribe later.
pub type Handler = Arc<dyn Fn(&WardenEvent) -> Result<()> + Send + Sync>;

/// Wrap a closure as a [`Handler`]
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&WardenEvent) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

fn same_handler(a: &Handler, b: &Handler) -> bool {
    // Compare data pointers only; vtable addresses are not stable across codegen units
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

#[derive(Default)]
pub struct EventBus {
    topics: RwLock<HashMap<String, Vec<Handler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `topic`. Duplicates are allowed.
    pub fn subscribe(&self, topic: &str, handler: Handler) {
        let mut topics = self.topics.write().unwrap_or_else(|e| e.into_inner());
        topics.entry(topic.to_string()).or_default().push(handler);
    }

    /// Remove the first registration of exactly this handler.
    ///
    /// Unknown topics and handlers are ignored.
    pub fn unsubscribe(&self, topic: &str, handler: &Handler) {
        let mut topics = self.topics.write().unwrap_or_else(|e| e.into_inner());
        let Some(handlers) = topics.get_mut(topic) else {
            return;
        };
        if let Some(index) = handlers.iter().position(|h| same_handler(h, handler)) {
            handlers.remove(index);
        }
        if handlers.is_empty() {
            topics.remove(topic);
        }
    }

    /// Number of handlers currently registered for `topic`
    pub fn subscription_count(&self, topic: &str) -> usize {
        let topics = self.topics.read().unwrap_or_else(|e| e.into_inner());
        topics.get(topic).map_or(0, Vec::len)
    }

    /// Stamp `kind` and deliver it on its topic
    pub fn publish(&self, kind: EventKind) {
        self.publish_event(&WardenEvent::new(kind));
    }

    /// Deliver an already-built event
    pub fn publish_event(&self, event: &WardenEvent) {
        let topic = event.topic();

        // Snapshot under the lock, invoke outside it: handlers may subscribe,
        // unsubscribe or publish without deadlocking, and a registration made
        // during delivery takes effect from the next publish.
        let handlers: Vec<Handler> = {
            let topics = self.topics.read().unwrap_or_else(|e| e.into_inner());
            match topics.get(topic) {
                Some(handlers) => handlers.clone(),
                None => return,
            }
        };

        for (index, handler) in handlers.iter().enumerate() {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("Handler #{} for {} failed: {:#}", index, topic, e);
                }
                Err(payload) => {
                    error!(
                        "Handler #{} for {} panicked: {}",
                        index,
                        topic,
                        panic_message(payload.as_ref())
                    );
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
