//! The persistent event store
//!
//! [`EventStore`] is a cheap, cloneable handle. `record` never blocks in the
//! default mode: events go over an unbounded channel to a worker task that
//! batches them behind a debounce timer and commits each batch in one
//! transaction. The worker also runs the periodic sweep and every other
//! mutation, so they never interleave with batch application.
//!
//! Reads open their own redb read transactions and see committed data only.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;
use vigil_core::{
    AppInfo, BlobHandle, EventSink, Info, Level, Manifest, MessageCreated, MessageRecord,
    NetworkTaskRecord, Session, SessionRecord, StoreEvent, StoreVersion,
};

use crate::archive;
use crate::blobs::{BLOBS_DIR, BlobStore};
use crate::config::{ExportOptions, StoreConfig, StoreOptions};
use crate::error::{StorageError, StorageResult};
use crate::package::{MANIFEST_FILE, compute_info, read_manifest, write_manifest};
use crate::sweep::SweepReport;
use crate::tables::{DATABASE_FILE, RecordDb};
use crate::writer::{StoreState, StoreWriter};

/// Capacity of the event broadcast bus
pub const EVENT_BUS_CAPACITY: usize = 1024;

/// Delay before the first automatic sweep when one is already overdue
const OVERDUE_SWEEP_DELAY: Duration = Duration::from_secs(15);

type Job = Box<dyn FnOnce(&mut StoreWriter) + Send>;

enum Command {
    Event(StoreEvent),
    Run(Job),
    Close(oneshot::Sender<()>),
}

/// Filter for [`EventStore::messages`]
#[derive(Debug, Clone)]
pub struct MessageFilter {
    /// Minimum level, inclusive
    pub min_level: Option<Level>,
    pub label: Option<String>,
    pub session: Option<Uuid>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Include messages created for network tasks
    pub include_tasks: bool,
    /// Keep only the newest `limit` matches
    pub limit: Option<usize>,
}

impl Default for MessageFilter {
    fn default() -> Self {
        Self {
            min_level: None,
            label: None,
            session: None,
            since: None,
            until: None,
            include_tasks: true,
            limit: None,
        }
    }
}

impl MessageFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_level(mut self, level: Level) -> Self {
        self.min_level = Some(level);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_session(mut self, session: Uuid) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn with_until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn without_tasks(mut self) -> Self {
        self.include_tasks = false;
        self
    }

    pub fn matches(&self, message: &MessageRecord) -> bool {
        self.min_level.is_none_or(|level| message.level >= level)
            && self.label.as_ref().is_none_or(|label| &message.label == label)
            && self.session.is_none_or(|session| message.session == session)
            && self.since.is_none_or(|since| message.created_at >= since)
            && self.until.is_none_or(|until| message.created_at < until)
            && (self.include_tasks || message.task_id.is_none())
    }
}

enum WriteMode {
    ReadOnly,
    Synchronous(Arc<Mutex<StoreWriter>>),
    Background(mpsc::UnboundedSender<Command>),
}

struct StoreInner {
    path: PathBuf,
    root: PathBuf,
    db: RecordDb,
    blobs: BlobStore,
    config: Arc<StoreConfig>,
    state: Arc<StoreState>,
    events: broadcast::Sender<StoreEvent>,
    mode: WriteMode,
    is_archive: bool,
    // Keeps an unpacked archive alive
    _unpacked: Option<TempDir>,
}

/// Handle to an open store
#[derive(Clone)]
pub struct EventStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore")
            .field("path", &self.inner.path)
            .field("readonly", &self.is_readonly())
            .field("archive", &self.inner.is_archive)
            .finish()
    }
}

impl EventStore {
    /// Open a store directory, or an archive file read-only
    ///
    /// Must be called within a tokio runtime; the background writer is
    /// spawned onto it.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open(
        path: impl AsRef<Path>,
        options: StoreOptions,
        config: StoreConfig,
    ) -> StorageResult<Self> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();

        if path.is_file() {
            return Self::open_archive(path, config);
        }

        if !path.exists() {
            if !options.create || options.readonly {
                return Err(StorageError::FileDoesntExist(path));
            }
            std::fs::create_dir_all(&path)?;
        }

        let has_db = path.join(DATABASE_FILE).exists();
        let has_manifest = path.join(MANIFEST_FILE).exists();
        let manifest = match (has_db, has_manifest) {
            (true, true) => {
                let manifest = read_manifest(&path)?;
                if manifest.version.is_supported() {
                    Some(manifest)
                } else if options.readonly {
                    return Err(unsupported(&manifest.version));
                } else {
                    warn!(version = %manifest.version, "Store version is outdated, recreating");
                    reset_directory(&path)?;
                    None
                }
            }
            (false, false) if options.create && !options.readonly => None,
            (false, false) => {
                return Err(StorageError::invalid("database and manifest are missing"));
            }
            (false, true) => return Err(StorageError::invalid("database is missing")),
            (true, false) => return Err(StorageError::invalid("manifest is missing")),
        };

        let mut manifest = manifest.unwrap_or_default();
        if !options.readonly && manifest.version < StoreVersion::CURRENT {
            manifest.version = StoreVersion::CURRENT;
        }

        let db = RecordDb::open(&path.join(DATABASE_FILE))?;
        let blobs = BlobStore::new(
            path.join(BLOBS_DIR),
            config.inline_limit,
            config.blob_compression,
        );
        let config = Arc::new(config);
        let state = Arc::new(StoreState {
            manifest: RwLock::new(manifest.clone()),
            session: RwLock::new(Session::new()),
        });
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);

        let mode = if options.readonly {
            WriteMode::ReadOnly
        } else {
            std::fs::create_dir_all(path.join(BLOBS_DIR))?;
            write_manifest(&path, &manifest)?;

            let mut writer = StoreWriter::new(
                path.clone(),
                db.clone(),
                blobs.clone(),
                config.clone(),
                state.clone(),
            )?;
            let session = *state.session.read();
            writer.start_session(session, &config.app_info)?;

            let writer = Arc::new(Mutex::new(writer));
            if options.synchronous {
                WriteMode::Synchronous(writer)
            } else {
                let (tx, rx) = mpsc::unbounded_channel();
                let sweep = options
                    .sweep
                    .then(|| first_sweep_at(manifest.last_sweep_date, config.sweep_interval()));
                tokio::spawn(run_worker(
                    writer,
                    rx,
                    config.save_interval(),
                    sweep.map(|start| (start, config.sweep_interval())),
                ));
                WriteMode::Background(tx)
            }
        };

        info!(store_id = %manifest.store_id, readonly = options.readonly, "Store opened");
        Ok(Self {
            inner: Arc::new(StoreInner {
                root: path.clone(),
                path,
                db,
                blobs,
                config,
                state,
                events,
                mode,
                is_archive: false,
                _unpacked: None,
            }),
        })
    }

    fn open_archive(path: PathBuf, config: StoreConfig) -> StorageResult<Self> {
        let unpacked = tempfile::Builder::new().prefix("vigil-archive").tempdir()?;
        archive::unpack(&path, unpacked.path())?;
        let root = unpacked.path().to_path_buf();

        if !root.join(DATABASE_FILE).exists() {
            return Err(StorageError::invalid("archive has no database"));
        }
        if !root.join(MANIFEST_FILE).exists() {
            return Err(StorageError::invalid("archive has no manifest"));
        }
        let manifest = read_manifest(&root)?;
        if !manifest.version.is_supported() {
            return Err(unsupported(&manifest.version));
        }

        let db = RecordDb::open(&root.join(DATABASE_FILE))?;
        let blobs = BlobStore::new(
            root.join(BLOBS_DIR),
            config.inline_limit,
            config.blob_compression,
        );
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        debug!(store_id = %manifest.store_id, "Archive opened");

        Ok(Self {
            inner: Arc::new(StoreInner {
                path,
                root,
                db,
                blobs,
                config: Arc::new(config),
                state: Arc::new(StoreState {
                    manifest: RwLock::new(manifest),
                    session: RwLock::new(Session::new()),
                }),
                events,
                mode: WriteMode::ReadOnly,
                is_archive: true,
                _unpacked: Some(unpacked),
            }),
        })
    }

    /// Path the store was opened from
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn is_readonly(&self) -> bool {
        matches!(self.inner.mode, WriteMode::ReadOnly)
    }

    pub fn is_archive(&self) -> bool {
        self.inner.is_archive
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Session every new record is tagged with
    pub fn session(&self) -> Session {
        *self.inner.state.session.read()
    }

    pub fn manifest(&self) -> Manifest {
        self.inner.state.manifest.read().clone()
    }

    /// Receive every event accepted by [`record`](Self::record)
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.events.subscribe()
    }

    /// Accept an event
    ///
    /// Runs the event hook, publishes the event to subscribers and hands it
    /// to the writer. Read-only stores ignore it.
    pub fn record(&self, event: impl Into<StoreEvent>) {
        let event = event.into();
        let event = match &self.inner.config.will_handle_event {
            Some(filter) => match filter.apply(event) {
                Some(event) => event,
                None => return,
            },
            None => event,
        };

        match &self.inner.mode {
            WriteMode::ReadOnly => {}
            WriteMode::Synchronous(writer) => {
                let _ = self.inner.events.send(event.clone());
                if let Err(e) = writer.lock().apply_batch(vec![event]) {
                    warn!(error = %e, "Failed to save event");
                }
            }
            WriteMode::Background(tx) => {
                let _ = self.inner.events.send(event.clone());
                if tx.send(Command::Event(event)).is_err() {
                    trace!("Store closed, event dropped");
                }
            }
        }
    }

    /// Record a plain message
    pub fn store_message(&self, label: impl Into<String>, level: Level, text: impl Into<String>) {
        self.record(MessageCreated::new(level, label, text));
    }

    /// Run a job on the write context after pending events are applied
    ///
    /// Fails with [`StorageError::ReadOnly`] on read-only stores; mutations
    /// check [`is_readonly`](Self::is_readonly) first and do nothing instead.
    async fn with_writer<R, F>(&self, f: F) -> StorageResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut StoreWriter) -> StorageResult<R> + Send + 'static,
    {
        match &self.inner.mode {
            WriteMode::ReadOnly => Err(StorageError::ReadOnly),
            WriteMode::Synchronous(writer) => f(&mut writer.lock()),
            WriteMode::Background(tx) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                let job: Job = Box::new(move |writer| {
                    let _ = reply_tx.send(f(writer));
                });
                tx.send(Command::Run(job)).map_err(|_| StorageError::Closed)?;
                reply_rx.await.map_err(|_| StorageError::Closed)?
            }
        }
    }

    /// Commit everything recorded so far
    pub async fn flush(&self) -> StorageResult<()> {
        if self.is_readonly() {
            return Ok(());
        }
        self.with_writer(|_| Ok(())).await
    }

    /// Reclaim space now. Removes nothing on read-only stores.
    pub async fn sweep(&self) -> StorageResult<SweepReport> {
        if self.is_readonly() {
            return Ok(SweepReport::default());
        }
        self.with_writer(|writer| writer.sweep()).await
    }

    /// Export a consistent snapshot into an archive at `dest`
    ///
    /// Runs on the write context, so read-only stores cannot be exported.
    pub async fn copy(&self, dest: impl AsRef<Path>) -> StorageResult<Info> {
        self.copy_with(dest, ExportOptions::default()).await
    }

    /// Export the messages selected by `options`
    pub async fn copy_with(
        &self,
        dest: impl AsRef<Path>,
        options: ExportOptions,
    ) -> StorageResult<Info> {
        let dest = dest.as_ref().to_path_buf();
        self.with_writer(move |writer| writer.export(&dest, &options))
            .await
    }

    /// Delete every record and blob. No-op on read-only stores.
    pub async fn remove_all(&self) -> StorageResult<()> {
        if self.is_readonly() {
            return Ok(());
        }
        self.with_writer(|writer| writer.remove_all()).await
    }

    /// Pin or unpin a message; returns whether it was updated
    pub async fn pin(&self, message_id: u64, pinned: bool) -> StorageResult<bool> {
        if self.is_readonly() {
            return Ok(false);
        }
        self.with_writer(move |writer| writer.pin(message_id, pinned))
            .await
    }

    /// Switch to a new session. No-op on read-only stores.
    pub async fn start_session(&self, session: Session, app_info: AppInfo) -> StorageResult<()> {
        if self.is_readonly() {
            return Ok(());
        }
        self.with_writer(move |writer| writer.start_session(session, &app_info))
            .await
    }

    /// Delete sessions together with their messages
    pub async fn remove_sessions(&self, ids: Vec<Uuid>) -> StorageResult<SweepReport> {
        if self.is_readonly() {
            return Ok(SweepReport::default());
        }
        self.with_writer(move |writer| writer.remove_sessions(&ids))
            .await
    }

    /// Flush and stop the background writer
    pub async fn close(&self) -> StorageResult<()> {
        match &self.inner.mode {
            WriteMode::ReadOnly | WriteMode::Synchronous(_) => Ok(()),
            WriteMode::Background(tx) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                if tx.send(Command::Close(reply_tx)).is_err() {
                    return Ok(());
                }
                let _ = reply_rx.await;
                Ok(())
            }
        }
    }

    /// All messages, oldest first
    pub fn all_messages(&self) -> StorageResult<Vec<MessageRecord>> {
        let mut messages = self.inner.db.messages()?;
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(messages)
    }

    /// Messages matching a filter, oldest first
    pub fn messages(&self, filter: &MessageFilter) -> StorageResult<Vec<MessageRecord>> {
        let mut messages: Vec<_> = self
            .all_messages()?
            .into_iter()
            .filter(|m| filter.matches(m))
            .collect();
        if let Some(limit) = filter.limit {
            let skip = messages.len().saturating_sub(limit);
            messages.drain(..skip);
        }
        Ok(messages)
    }

    pub fn message(&self, id: u64) -> StorageResult<Option<MessageRecord>> {
        self.inner.db.message(id)
    }

    /// All network tasks, oldest first
    pub fn all_network_tasks(&self) -> StorageResult<Vec<NetworkTaskRecord>> {
        let mut tasks = self.inner.db.tasks()?;
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    pub fn network_task(&self, task_id: Uuid) -> StorageResult<Option<NetworkTaskRecord>> {
        self.inner.db.task(task_id)
    }

    pub fn blob_handle(&self, key: &str) -> StorageResult<Option<BlobHandle>> {
        self.inner.db.blob_handle(key)
    }

    /// Decompressed content of a blob
    pub fn blob_data(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.inner.blobs.get(self.inner.db.database(), key)
    }

    /// Sessions, oldest first
    pub fn sessions(&self) -> StorageResult<Vec<SessionRecord>> {
        let mut sessions = self.inner.db.sessions()?;
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    /// Summary of the store's contents
    pub fn info(&self) -> StorageResult<Info> {
        let manifest = self.manifest();
        compute_info(
            &self.inner.root,
            &self.inner.db,
            &manifest,
            &self.inner.config.app_info,
        )
    }
}

impl EventSink for EventStore {
    fn submit(&self, event: StoreEvent) {
        self.record(event);
    }
}

fn unsupported(version: &StoreVersion) -> StorageError {
    StorageError::UnsupportedVersion {
        version: version.to_string(),
        minimum: StoreVersion::MINIMUM_SUPPORTED.to_string(),
    }
}

fn reset_directory(path: &Path) -> StorageResult<()> {
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(entry.path())?;
        } else {
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// When the first automatic sweep should run
fn first_sweep_at(last_sweep: Option<DateTime<Utc>>, interval: Duration) -> Instant {
    let now = Instant::now();
    let Some(last_sweep) = last_sweep else {
        return now + OVERDUE_SWEEP_DELAY;
    };
    let elapsed = (Utc::now() - last_sweep).to_std().unwrap_or_default();
    match interval.checked_sub(elapsed) {
        Some(remaining) if !remaining.is_zero() => now + remaining,
        _ => now + OVERDUE_SWEEP_DELAY,
    }
}

fn flush_pending(writer: &Mutex<StoreWriter>, pending: &mut Vec<StoreEvent>) {
    if pending.is_empty() {
        return;
    }
    let events = std::mem::take(pending);
    if let Err(e) = writer.lock().apply_batch(events) {
        warn!(error = %e, "Failed to save events");
    }
}

async fn run_worker(
    writer: Arc<Mutex<StoreWriter>>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    save_interval: Duration,
    sweep: Option<(Instant, Duration)>,
) {
    let mut pending: Vec<StoreEvent> = Vec::new();
    let mut save_deadline: Option<Instant> = None;
    let mut sweep_timer = sweep.map(|(start, period)| {
        let mut timer = tokio::time::interval_at(start, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer
    });

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Event(event)) => {
                    pending.push(event);
                    if save_deadline.is_none() {
                        save_deadline = Some(Instant::now() + save_interval);
                    }
                }
                Some(Command::Run(job)) => {
                    flush_pending(&writer, &mut pending);
                    save_deadline = None;
                    job(&mut writer.lock());
                }
                Some(Command::Close(reply)) => {
                    flush_pending(&writer, &mut pending);
                    let _ = reply.send(());
                    break;
                }
                None => {
                    flush_pending(&writer, &mut pending);
                    break;
                }
            },
            _ = async {
                if let Some(deadline) = save_deadline {
                    tokio::time::sleep_until(deadline).await;
                }
            }, if save_deadline.is_some() => {
                flush_pending(&writer, &mut pending);
                save_deadline = None;
            }
            _ = async {
                match sweep_timer.as_mut() {
                    Some(timer) => {
                        timer.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            }, if sweep_timer.is_some() => {
                flush_pending(&writer, &mut pending);
                save_deadline = None;
                if let Err(e) = writer.lock().sweep() {
                    warn!(error = %e, "Sweep failed");
                }
            }
        }
    }
    debug!("Store writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_filter() {
        let message = MessageRecord {
            id: 1,
            created_at: Utc::now(),
            level: Level::Warning,
            label: "auth".into(),
            session: Uuid::nil(),
            text: "x".into(),
            metadata: Default::default(),
            file: String::new(),
            function: String::new(),
            line: 0,
            is_pinned: false,
            task_id: Some(Uuid::new_v4()),
        };
        assert!(MessageFilter::new().matches(&message));
        assert!(MessageFilter::new().with_min_level(Level::Warning).matches(&message));
        assert!(!MessageFilter::new().with_min_level(Level::Error).matches(&message));
        assert!(!MessageFilter::new().with_label("db").matches(&message));
        assert!(!MessageFilter::new().without_tasks().matches(&message));
        assert!(!MessageFilter::new().with_session(Uuid::new_v4()).matches(&message));
    }

    #[test]
    fn test_first_sweep_schedule() {
        let interval = Duration::from_secs(1200);
        let now = Instant::now();

        let never = first_sweep_at(None, interval);
        assert!(never <= now + OVERDUE_SWEEP_DELAY + Duration::from_secs(1));

        let recent = first_sweep_at(Some(Utc::now() - chrono::Duration::seconds(200)), interval);
        assert!(recent >= now + Duration::from_secs(990));
        assert!(recent <= now + Duration::from_secs(1001));

        let overdue = first_sweep_at(Some(Utc::now() - chrono::Duration::hours(2)), interval);
        assert!(overdue <= now + OVERDUE_SWEEP_DELAY + Duration::from_secs(1));
    }
}
