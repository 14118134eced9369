//! Shared helpers for integration suites.

use std::sync::{Arc, Mutex};

use scanarr_watcher::protocol::EventPayload;
use scanarr_watcher::ws::EventSink;

/// Sink that records every emission in order.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<EventPayload>>,
}

impl CollectingSink {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<EventPayload> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, payload: EventPayload) {
        self.events.lock().unwrap().push(payload);
    }
}
