//! Tracing events recorded in a real store

use std::sync::Arc;

use tempfile::TempDir;
use tracing_subscriber::layer::SubscriberExt;
use vigil_core::Level;
use vigil_logging::{ConsoleConfig, LogConfig, StoreLayer, VigilSubscriberBuilder};
use vigil_storage::{EventStore, MessageFilter, StoreConfig, StoreOptions};

#[tokio::test]
async fn test_tracing_events_land_in_the_store() {
    let dir = TempDir::new().unwrap();
    let store = EventStore::open(
        dir.path().join("logs"),
        StoreOptions::synchronous(),
        StoreConfig::default(),
    )
    .await
    .unwrap();

    let subscriber =
        tracing_subscriber::registry().with(StoreLayer::new(Arc::new(store.clone())));
    tracing::subscriber::with_default(subscriber, || {
        tracing::info!(target: "auth", user_id = 7, "signed in");
        tracing::error!(target: "sync", attempt = 3, "upload failed");
        tracing::info!(target: "vigil_storage::store", "ignored");
    });

    let messages = store.all_messages().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].label, "auth");
    assert_eq!(messages[0].text, "signed in");
    assert_eq!(messages[0].metadata["user_id"], "7");
    assert_eq!(messages[1].level, Level::Error);

    let errors = store
        .messages(&MessageFilter::new().with_min_level(Level::Error))
        .unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].label, "sync");

    store.close().await.unwrap();
}

#[tokio::test]
async fn test_store_level_keeps_the_store_quieter_than_the_filter() {
    let dir = TempDir::new().unwrap();
    let store = EventStore::open(
        dir.path().join("logs"),
        StoreOptions::synchronous(),
        StoreConfig::default(),
    )
    .await
    .unwrap();

    let config = LogConfig {
        default_level: "debug".to_string(),
        console: ConsoleConfig::disabled(),
        store_level: Some("warn".to_string()),
        ..LogConfig::default()
    };
    let (layer, guard) = VigilSubscriberBuilder::new()
        .with_config(config)
        .with_store(Arc::new(store.clone()))
        .build()
        .unwrap();
    assert!(guard.is_none());

    tracing::subscriber::with_default(tracing_subscriber::registry().with(layer), || {
        tracing::info!(target: "sync", "started");
        tracing::warn!(target: "sync", "retrying");
        tracing::error!(target: "sync", "gave up");
    });

    let texts: Vec<_> = store
        .all_messages()
        .unwrap()
        .into_iter()
        .map(|m| m.text)
        .collect();
    assert_eq!(texts, ["retrying", "gave up"]);

    store.close().await.unwrap();
}
