//! Bridge from `tracing` into the store
//!
//! [`StoreLayer`] turns every `tracing` event into a stored message. Events
//! from Vigil's own crates are skipped, since the store logs through
//! `tracing` itself and would otherwise feed on its own output.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use vigil_core::{EventSink, Level, MessageCreated};

/// Targets skipped by default
pub const INTERNAL_TARGET_PREFIX: &str = "vigil_";

/// Map a `tracing` level to a store level
pub fn level_of(level: &tracing::Level) -> Level {
    match *level {
        tracing::Level::TRACE => Level::Trace,
        tracing::Level::DEBUG => Level::Debug,
        tracing::Level::INFO => Level::Info,
        tracing::Level::WARN => Level::Warning,
        tracing::Level::ERROR => Level::Error,
    }
}

/// Layer that records `tracing` events as store messages
pub struct StoreLayer {
    sink: Arc<dyn EventSink>,
    min_level: tracing::Level,
    ignored_targets: Vec<String>,
}

impl fmt::Debug for StoreLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreLayer")
            .field("min_level", &self.min_level)
            .field("ignored_targets", &self.ignored_targets)
            .finish()
    }
}

impl StoreLayer {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            min_level: tracing::Level::TRACE,
            ignored_targets: vec![INTERNAL_TARGET_PREFIX.to_string()],
        }
    }

    /// Skip events less severe than `level`
    pub fn with_min_level(mut self, level: tracing::Level) -> Self {
        self.min_level = level;
        self
    }

    /// Also skip targets starting with `prefix`
    pub fn ignore_target(mut self, prefix: impl Into<String>) -> Self {
        self.ignored_targets.push(prefix.into());
        self
    }

    fn is_ignored(&self, target: &str) -> bool {
        self.ignored_targets
            .iter()
            .any(|prefix| target.starts_with(prefix.as_str()))
    }
}

impl<S: Subscriber> Layer<S> for StoreLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        // More verbose levels compare greater
        if *metadata.level() > self.min_level || self.is_ignored(metadata.target()) {
            return;
        }

        let mut fields = FieldVisitor::default();
        event.record(&mut fields);

        let mut message = MessageCreated::new(
            level_of(metadata.level()),
            metadata.target(),
            fields.message.unwrap_or_default(),
        )
        .with_location(
            metadata.file().unwrap_or_default(),
            metadata.module_path().unwrap_or_default(),
            metadata.line().unwrap_or_default(),
        );
        message.metadata = fields.metadata;
        self.sink.submit(message.into());
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    metadata: BTreeMap<String, String>,
}

impl FieldVisitor {
    fn insert(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = Some(value);
        } else {
            self.metadata.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, value.to_string());
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.insert(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field, format!("{value:?}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;
    use vigil_core::{MemorySink, StoreEvent};

    fn capture(
        layer: impl FnOnce(Arc<MemorySink>) -> StoreLayer,
        f: impl FnOnce(),
    ) -> Vec<MessageCreated> {
        let sink = Arc::new(MemorySink::new());
        let subscriber = tracing_subscriber::registry().with(layer(sink.clone()));
        tracing::subscriber::with_default(subscriber, f);
        sink.events()
            .into_iter()
            .map(|event| match event {
                StoreEvent::MessageStored(message) => message,
                other => panic!("unexpected event: {other:?}"),
            })
            .collect()
    }

    #[test]
    fn test_event_becomes_message() {
        let messages = capture(
            |sink| StoreLayer::new(sink),
            || {
                tracing::warn!(
                    target: "checkout",
                    order = 42,
                    user = "alice",
                    "payment {} failed",
                    "card"
                )
            },
        );

        assert_eq!(messages.len(), 1);
        let message = &messages[0];
        assert_eq!(message.level, Level::Warning);
        assert_eq!(message.label, "checkout");
        assert_eq!(message.message, "payment card failed");
        assert_eq!(message.metadata["order"], "42");
        assert_eq!(message.metadata["user"], "alice");
        assert!(message.file.ends_with("store_layer.rs"));
        assert!(message.line > 0);
    }

    #[test]
    fn test_levels() {
        assert_eq!(level_of(&tracing::Level::TRACE), Level::Trace);
        assert_eq!(level_of(&tracing::Level::INFO), Level::Info);
        assert_eq!(level_of(&tracing::Level::ERROR), Level::Error);
    }

    #[test]
    fn test_min_level_and_own_targets() {
        let messages = capture(
            |sink| StoreLayer::new(sink).with_min_level(tracing::Level::INFO),
            || {
                tracing::debug!(target: "app", "too verbose");
                tracing::info!(target: "app", "kept");
                // This module's own target
                tracing::error!("internal");
                tracing::error!(target: "vigil_storage::store", "internal");
            },
        );
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message, "kept");
    }

    #[test]
    fn test_custom_ignored_target() {
        let messages = capture(
            |sink| StoreLayer::new(sink).ignore_target("hyper"),
            || {
                tracing::info!(target: "hyper::client", "noise");
                tracing::info!(target: "app", "signal");
            },
        );
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].label, "app");
    }
}
