//! # Vigil Core
//!
//! Shared model for the Vigil on-device logging stack.
//!
//! This crate holds the types that flow between the persistent store, the
//! remote streaming session and the logging front-ends, without depending on
//! any of them.
//!
//! ## Key Types
//!
//! - [`StoreEvent`]: Everything the store ingests (messages and network task lifecycle)
//! - [`MessageRecord`], [`NetworkTaskRecord`], [`BlobHandle`]: Persisted rows
//! - [`Manifest`], [`Info`]: Store metadata documents
//! - [`EventSink`]: Non-blocking destination for events
//! - [`Level`]: Ordered severity

pub mod compression;
pub mod error;
pub mod event;
pub mod level;
pub mod manifest;
pub mod record;
pub mod sink;

// Re-export main types
pub use error::*;
pub use event::*;
pub use level::*;
pub use manifest::*;
pub use record::*;
pub use sink::*;
