//! Content-addressed blob storage
//!
//! Request and response bodies are stored once per distinct content and
//! shared between tasks through a reference count. Small blobs live inline
//! in the record store, larger ones as files under `blobs/`.
//!
//! Uses BLAKE3 for hashing and deflate for compression.

mod content;
mod preprocess;
mod store;

pub use content::{ContentKey, is_valid_key};
pub use preprocess::{IMAGE_THUMBNAIL_THRESHOLD, make_thumbnail};
pub use store::{BlobStore, PendingFiles};

/// Directory holding file-tier blobs inside a store
pub const BLOBS_DIR: &str = "blobs";
