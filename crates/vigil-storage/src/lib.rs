//! # Vigil Storage
//!
//! Bounded persistent event store for Vigil.
//!
//! A store is a directory (or a read-only archive) holding a record store of
//! messages, network tasks and sessions, a content-addressed blob store for
//! request and response bodies, and a `manifest.json` describing its version.
//!
//! ## Features
//!
//! - **EventStore**: Non-blocking ingestion with batched background writes
//! - **Blob deduplication**: Bodies keyed by BLAKE3 hash with link counting
//! - **Sweeps**: Age, record store size and blob size limits
//! - **Archives**: Filtered export to a single read-only file
//! - **NetworkLogger**: Turns HTTP client callbacks into store events
//!
//! ## Example
//!
//! ```rust,ignore
//! use vigil_storage::{EventStore, StoreConfig, StoreOptions};
//! use vigil_core::Level;
//!
//! #[tokio::main]
//! async fn main() -> vigil_storage::StorageResult<()> {
//!     let store = EventStore::open("logs", StoreOptions::default(), StoreConfig::default()).await?;
//!     store.store_message("application", Level::Info, "Started");
//!     store.flush().await?;
//!
//!     for message in store.all_messages()? {
//!         println!("{} {}", message.level, message.text);
//!     }
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod blobs;
pub mod config;
pub mod error;
mod export;
pub mod network_logger;
pub mod package;
pub mod store;
pub mod sweep;
pub mod tables;
pub(crate) mod writer;

// Re-exports
pub use blobs::BlobStore;
pub use config::{EventFilter, ExportOptions, StoreConfig, StoreOptions};
pub use error::{StorageError, StorageResult};
pub use network_logger::{NetworkLogger, NetworkLoggerConfig};
pub use package::{ARCHIVE_EXTENSION, INFO_FILE, MANIFEST_FILE};
pub use store::{EventStore, MessageFilter};
pub use sweep::SweepReport;
pub use tables::{DATABASE_FILE, RecordCounts, RecordDb};
