//! Event sink abstraction
//!
//! Producers such as the tracing bridge and the network logger only need a
//! place to hand events to. Keeping that behind a trait lets them live in
//! crates that do not depend on the storage engine.

use std::sync::{Arc, Mutex};

use crate::event::StoreEvent;

/// Something that accepts store events without blocking
pub trait EventSink: Send + Sync {
    /// Hand an event over. Must not block the caller.
    fn submit(&self, event: StoreEvent);
}

impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    fn submit(&self, event: StoreEvent) {
        (**self).submit(event)
    }
}

/// Sink that keeps every event in memory, for tests and previews
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<StoreEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events received so far, oldest first
    pub fn events(&self) -> Vec<StoreEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.events().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for MemorySink {
    fn submit(&self, event: StoreEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::MessageCreated;
    use crate::level::Level;

    #[test]
    fn test_memory_sink_collects_in_order() {
        let sink = Arc::new(MemorySink::new());
        let shared: Arc<dyn EventSink> = sink.clone();
        shared.submit(MessageCreated::new(Level::Info, "a", "first").into());
        shared.submit(MessageCreated::new(Level::Info, "a", "second").into());

        let events = sink.events();
        assert_eq!(events.len(), 2);
        match &events[1] {
            StoreEvent::MessageStored(m) => assert_eq!(m.message, "second"),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
