//! Store configuration
//!
//! [`StoreConfig`] carries the limits and timings of a store and can be
//! loaded from TOML. [`StoreOptions`] controls how a store is opened.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vigil_core::{AppInfo, StoreEvent};

use crate::error::{StorageError, StorageResult};

/// Default record store size limit (128 MiB)
pub const DEFAULT_DATABASE_SIZE_LIMIT: u64 = 128 * 1024 * 1024;
/// Default blob store size limit (256 MiB)
pub const DEFAULT_BLOBS_SIZE_LIMIT: u64 = 256 * 1024 * 1024;
/// Default sweep interval (20 minutes)
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 1200;
/// Default maximum message age (14 days)
pub const DEFAULT_MAX_AGE_SECS: u64 = 14 * 24 * 60 * 60;
/// Default debounce between a mutation and its commit
pub const DEFAULT_SAVE_INTERVAL_MS: u64 = 100;
/// Bodies at or above this size are not stored (10 MiB)
pub const DEFAULT_RESPONSE_BODY_SIZE_LIMIT: u64 = 10 * 1024 * 1024;
/// Blobs up to this stored size live in the record store (32 KiB)
pub const DEFAULT_INLINE_LIMIT: u64 = 32 * 1024;
/// Maximum thumbnail edge in pixels
pub const DEFAULT_THUMBNAIL_MAX_PIXEL_SIZE: u32 = 256;

/// Hook that can rewrite or drop an event before the store sees it
#[derive(Clone)]
pub struct EventFilter(Arc<dyn Fn(StoreEvent) -> Option<StoreEvent> + Send + Sync>);

impl EventFilter {
    pub fn new(f: impl Fn(StoreEvent) -> Option<StoreEvent> + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Run the hook. `None` means the event is dropped.
    pub fn apply(&self, event: StoreEvent) -> Option<StoreEvent> {
        (self.0)(event)
    }
}

impl fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventFilter(..)")
    }
}

/// Limits and timings of a store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Size of the record store file above which the size sweep runs
    pub database_size_limit: u64,
    /// Total stored blob size above which the blob sweep runs
    pub blobs_size_limit: u64,
    /// Fraction of data kept when a size limit is hit
    pub trim_ratio: f64,
    pub sweep_interval_secs: u64,
    /// Messages older than this are removed by the sweep
    pub max_age_secs: u64,
    /// Debounce between the first pending mutation and the commit
    pub save_interval_ms: u64,
    /// Replace large image bodies with a PNG thumbnail
    pub store_only_image_thumbnails: bool,
    pub thumbnail_max_pixel_size: u32,
    /// Bodies at or above this size are not stored
    pub response_body_size_limit: u64,
    /// Blobs up to this stored size are kept inline in the record store
    pub inline_limit: u64,
    /// Deflate blobs when it saves space
    pub blob_compression: bool,
    /// Application identification written to sessions and `info.json`
    pub app_info: AppInfo,
    /// Event rewrite hook; not loaded from files
    #[serde(skip)]
    pub will_handle_event: Option<EventFilter>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_size_limit: DEFAULT_DATABASE_SIZE_LIMIT,
            blobs_size_limit: DEFAULT_BLOBS_SIZE_LIMIT,
            trim_ratio: 0.7,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            max_age_secs: DEFAULT_MAX_AGE_SECS,
            save_interval_ms: DEFAULT_SAVE_INTERVAL_MS,
            store_only_image_thumbnails: false,
            thumbnail_max_pixel_size: DEFAULT_THUMBNAIL_MAX_PIXEL_SIZE,
            response_body_size_limit: DEFAULT_RESPONSE_BODY_SIZE_LIMIT,
            inline_limit: DEFAULT_INLINE_LIMIT,
            blob_compression: true,
            app_info: AppInfo::default(),
            will_handle_event: None,
        }
    }
}

impl StoreConfig {
    /// Parse from a TOML document. Missing fields take their defaults.
    pub fn from_toml_str(s: &str) -> StorageResult<Self> {
        let config: Self = toml::from_str(s).map_err(|e| StorageError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> StorageResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> StorageResult<()> {
        if !(self.trim_ratio > 0.0 && self.trim_ratio <= 1.0) {
            return Err(StorageError::Config(format!(
                "trim_ratio must be in (0, 1], got {}",
                self.trim_ratio
            )));
        }
        if self.sweep_interval_secs == 0 {
            return Err(StorageError::Config("sweep_interval_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_millis(self.save_interval_ms)
    }

    pub fn with_database_size_limit(mut self, limit: u64) -> Self {
        self.database_size_limit = limit;
        self
    }

    pub fn with_blobs_size_limit(mut self, limit: u64) -> Self {
        self.blobs_size_limit = limit;
        self
    }

    pub fn with_trim_ratio(mut self, ratio: f64) -> Self {
        self.trim_ratio = ratio;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age_secs = max_age.as_secs();
        self
    }

    pub fn with_save_interval(mut self, interval: Duration) -> Self {
        self.save_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_inline_limit(mut self, limit: u64) -> Self {
        self.inline_limit = limit;
        self
    }

    pub fn with_image_thumbnails(mut self, enabled: bool) -> Self {
        self.store_only_image_thumbnails = enabled;
        self
    }

    pub fn with_app_info(mut self, app_info: AppInfo) -> Self {
        self.app_info = app_info;
        self
    }

    /// Install the event rewrite hook
    pub fn with_event_filter(
        mut self,
        f: impl Fn(StoreEvent) -> Option<StoreEvent> + Send + Sync + 'static,
    ) -> Self {
        self.will_handle_event = Some(EventFilter::new(f));
        self
    }
}

/// How a store is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// Create the store directory when it does not exist
    pub create: bool,
    /// Run the periodic sweep
    pub sweep: bool,
    /// Apply and commit every event on the caller's thread
    pub synchronous: bool,
    /// Ignore every mutation
    pub readonly: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            create: true,
            sweep: true,
            synchronous: false,
            readonly: false,
        }
    }
}

impl StoreOptions {
    /// Options for opening an existing store for inspection only
    pub fn readonly() -> Self {
        Self {
            create: false,
            sweep: false,
            synchronous: false,
            readonly: true,
        }
    }

    pub fn synchronous() -> Self {
        Self {
            synchronous: true,
            ..Default::default()
        }
    }

    pub fn with_sweep(mut self, sweep: bool) -> Self {
        self.sweep = sweep;
        self
    }

    pub fn with_create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }
}

/// Restricts which messages an export carries
///
/// Tasks and blobs follow the messages they belong to.
#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    /// Only these sessions
    pub sessions: Option<HashSet<Uuid>>,
    /// Only messages created at or after this instant
    pub since: Option<DateTime<Utc>>,
}

impl ExportOptions {
    pub fn with_sessions(mut self, sessions: impl IntoIterator<Item = Uuid>) -> Self {
        self.sessions = Some(sessions.into_iter().collect());
        self
    }

    pub fn with_since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub(crate) fn includes(&self, session: Uuid, created_at: DateTime<Utc>) -> bool {
        if let Some(sessions) = &self.sessions {
            if !sessions.contains(&session) {
                return false;
            }
        }
        self.since.is_none_or(|since| created_at >= since)
    }
}
