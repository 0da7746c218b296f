//! Logging setup for applications using Vigil
//!
//! # Features
//!
//! - **Console output**: pretty for development, JSON lines otherwise
//! - **File output**: JSON lines with daily or hourly rotation via tracing-appender
//! - **Store bridge**: [`StoreLayer`] records `tracing` events as store messages
//!
//! # Quick Start
//!
//! ```ignore
//! use vigil_logging::{LogConfig, VigilSubscriberBuilder};
//!
//! // JSON lines to the console
//! VigilSubscriberBuilder::new().init()?;
//!
//! // Pretty output, and every event also lands in the store
//! let _guard = VigilSubscriberBuilder::new()
//!     .with_config(LogConfig::development())
//!     .with_store(Arc::new(store.clone()))
//!     .init()?;
//! ```

pub mod config;
pub mod store_layer;

pub use config::{ConsoleConfig, FileConfig, LogConfig, RotationStrategy};
pub use store_layer::{StoreLayer, level_of};
pub use tracing_appender::non_blocking::WorkerGuard;

use std::fs::{self, File};
use std::io;
use std::sync::Arc;

use thiserror::Error;
use tracing_appender::non_blocking::NonBlocking;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt};
use vigil_core::EventSink;

/// Errors setting up logging
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("A global subscriber is already set")]
    AlreadyInitialized,

    #[error("Failed to open log file: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid store level: {0}")]
    InvalidLevel(String),
}

/// Builder for configuring and installing the global subscriber
pub struct VigilSubscriberBuilder {
    config: LogConfig,
    store: Option<StoreLayer>,
}

impl VigilSubscriberBuilder {
    /// Default configuration: JSON lines to the console at `info`
    pub fn new() -> Self {
        Self {
            config: LogConfig::default(),
            store: None,
        }
    }

    pub fn with_config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the default filter directive
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.config.default_level = level.into();
        self
    }

    pub fn with_console(mut self, enabled: bool) -> Self {
        self.config.console.enabled = enabled;
        self
    }

    pub fn with_file_output(mut self, config: FileConfig) -> Self {
        self.config.file = Some(config);
        self
    }

    /// Record events in a store through [`StoreLayer`]
    pub fn with_store(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.store = Some(StoreLayer::new(sink));
        self
    }

    /// Record events through a customized [`StoreLayer`]
    pub fn with_store_layer(mut self, layer: StoreLayer) -> Self {
        self.store = Some(layer);
        self
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.config.default_level))
    }

    /// Build the layers without installing them
    ///
    /// The guard, when present, must be kept alive for file output to be
    /// flushed.
    pub fn build(
        self,
    ) -> Result<(Box<dyn Layer<Registry> + Send + Sync>, Option<WorkerGuard>), LoggingError> {
        let filter = self.env_filter();
        let config = self.config;
        let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
        let mut guard = None;

        if config.console.enabled {
            if config.console.pretty {
                layers.push(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(config.console.ansi)
                        .with_target(true)
                        .boxed(),
                );
            } else {
                layers.push(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_current_span(true)
                        .flatten_event(true)
                        .with_file(config.include_location)
                        .with_line_number(config.include_location)
                        .boxed(),
                );
            }
        }

        if let Some(file_config) = &config.file {
            let (writer, file_guard) = file_writer(file_config)?;
            guard = Some(file_guard);
            layers.push(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .flatten_event(true)
                    .with_file(config.include_location)
                    .with_line_number(config.include_location)
                    .with_writer(writer)
                    .boxed(),
            );
        }

        if let Some(mut store) = self.store {
            if let Some(level) = &config.store_level {
                let level: tracing::Level = level
                    .parse()
                    .map_err(|_| LoggingError::InvalidLevel(level.clone()))?;
                store = store.with_min_level(level);
            }
            layers.push(store.boxed());
        }

        Ok((layers.with_filter(filter).boxed(), guard))
    }

    /// Install the subscriber globally
    pub fn init(self) -> Result<Option<WorkerGuard>, LoggingError> {
        let (layer, guard) = self.build()?;
        tracing_subscriber::registry()
            .with(layer)
            .try_init()
            .map_err(|_| LoggingError::AlreadyInitialized)?;
        Ok(guard)
    }
}

impl Default for VigilSubscriberBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Single file is truncated; rotating files are appended to
fn file_writer(config: &FileConfig) -> Result<(NonBlocking, WorkerGuard), LoggingError> {
    fs::create_dir_all(&config.directory)?;
    Ok(match config.rotation {
        RotationStrategy::Never => {
            let file = File::create(config.directory.join(format!("{}.log", config.prefix)))?;
            tracing_appender::non_blocking(file)
        }
        RotationStrategy::Daily => tracing_appender::non_blocking(RollingFileAppender::new(
            Rotation::DAILY,
            &config.directory,
            &config.prefix,
        )),
        RotationStrategy::Hourly => tracing_appender::non_blocking(RollingFileAppender::new(
            Rotation::HOURLY,
            &config.directory,
            &config.prefix,
        )),
    })
}

/// Pretty console output at `debug`
pub fn init_development() -> Result<(), LoggingError> {
    VigilSubscriberBuilder::new()
        .with_config(LogConfig::development())
        .init()
        .map(|_| ())
}

/// Minimal output for tests. Safe to call more than once.
pub fn init_testing() {
    let _ = VigilSubscriberBuilder::new()
        .with_config(LogConfig::testing())
        .init();
}
