//! The write context
//!
//! [`StoreWriter`] owns every mutation of a store. Events are applied in
//! batches, one redb write transaction per batch; blob bookkeeping joins the
//! same transaction and file unlinks run only after it commits.
//!
//! Each event is applied completely or not at all. When one fails, the batch
//! transaction is aborted and the events are replayed one transaction each,
//! so only the failing event is lost.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use redb::WriteTransaction;
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;
use vigil_core::{
    AppInfo, Level, MOCKED_REQUEST_HEADER, Manifest, MessageCreated, MessageRecord, NETWORK_LABEL,
    NetworkRequest, NetworkTaskCompleted, NetworkTaskCreated, NetworkTaskProgressUpdated,
    NetworkTaskRecord, Session, SessionRecord, StoreEvent, TaskProgress, TaskState, TaskType,
};

use crate::blobs::{BlobStore, IMAGE_THUMBNAIL_THRESHOLD, PendingFiles, make_thumbnail};
use crate::config::StoreConfig;
use crate::error::StorageResult;
use crate::sweep::SweepReport;
use crate::tables::{
    self, BLOB_DATA, BLOBS, MESSAGES, NEXT_MESSAGE_ID, RecordDb, SESSIONS, TASKS,
};

/// State shared between the store handle and its writer
#[derive(Debug)]
pub(crate) struct StoreState {
    pub manifest: RwLock<Manifest>,
    pub session: RwLock<Session>,
}

/// Where a task row comes from when it is first created
struct TaskOrigin<'a> {
    task_id: Uuid,
    task_type: TaskType,
    created_at: DateTime<Utc>,
    label: Option<&'a str>,
    original_request: &'a NetworkRequest,
    current_request: Option<&'a NetworkRequest>,
    description: Option<&'a str>,
}

impl<'a> From<&'a NetworkTaskCreated> for TaskOrigin<'a> {
    fn from(event: &'a NetworkTaskCreated) -> Self {
        Self {
            task_id: event.task_id,
            task_type: event.task_type,
            created_at: event.created_at,
            label: event.label.as_deref(),
            original_request: &event.original_request,
            current_request: event.current_request.as_ref(),
            description: event.task_description.as_deref(),
        }
    }
}

impl<'a> From<&'a NetworkTaskCompleted> for TaskOrigin<'a> {
    fn from(event: &'a NetworkTaskCompleted) -> Self {
        Self {
            task_id: event.task_id,
            task_type: event.task_type,
            created_at: event.created_at,
            label: event.label.as_deref(),
            original_request: &event.original_request,
            current_request: event.current_request.as_ref(),
            description: event.task_description.as_deref(),
        }
    }
}

/// Owner of all mutations of one store
pub(crate) struct StoreWriter {
    pub(crate) root: PathBuf,
    pub(crate) db: RecordDb,
    pub(crate) blobs: BlobStore,
    pub(crate) config: Arc<StoreConfig>,
    pub(crate) state: Arc<StoreState>,
    pub(crate) pending_files: PendingFiles,
    next_message_id: u64,
}

impl StoreWriter {
    pub(crate) fn new(
        root: PathBuf,
        db: RecordDb,
        blobs: BlobStore,
        config: Arc<StoreConfig>,
        state: Arc<StoreState>,
    ) -> StorageResult<Self> {
        let next_message_id = db.counter(NEXT_MESSAGE_ID)?.unwrap_or(1);
        Ok(Self {
            root,
            db,
            blobs,
            config,
            state,
            pending_files: PendingFiles::new(),
            next_message_id,
        })
    }

    pub(crate) fn begin(&self) -> StorageResult<WriteTransaction> {
        Ok(self.db.database().begin_write()?)
    }

    /// Commit, then unlink the files of blobs freed by the transaction
    pub(crate) fn commit(&mut self, txn: WriteTransaction) -> StorageResult<()> {
        match txn.commit() {
            Ok(()) => {
                self.blobs.commit_files(&mut self.pending_files);
                Ok(())
            }
            Err(e) => {
                self.rollback();
                Err(e.into())
            }
        }
    }

    /// Drop a transaction and everything it changed
    fn abort(&mut self, txn: WriteTransaction) {
        if let Err(e) = txn.abort() {
            warn!(error = %e, "Failed to abort transaction");
        }
        self.rollback();
    }

    /// Undo the side effects of a transaction that did not commit
    fn rollback(&mut self) {
        self.blobs.rollback_files(&mut self.pending_files);
        match self.db.counter(NEXT_MESSAGE_ID) {
            Ok(next) => self.next_message_id = next.unwrap_or(1),
            Err(e) => warn!(error = %e, "Failed to reload message counter"),
        }
    }

    /// Save the message counter and commit
    fn finish(&mut self, txn: WriteTransaction) -> StorageResult<()> {
        if let Err(e) = tables::write_counter(&txn, NEXT_MESSAGE_ID, self.next_message_id) {
            self.abort(txn);
            return Err(e);
        }
        self.commit(txn)
    }

    /// Apply a batch of events in a single transaction
    ///
    /// If an event fails, the batch is replayed event by event and only the
    /// failing events are dropped.
    #[instrument(skip_all, fields(count = events.len()))]
    pub(crate) fn apply_batch(&mut self, events: Vec<StoreEvent>) -> StorageResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        let txn = self.begin()?;
        let mut failure = None;
        for event in &events {
            if let Err(e) = self.apply(&txn, event) {
                failure = Some((event.kind(), e));
                break;
            }
        }
        let Some((kind, error)) = failure else {
            self.finish(txn)?;
            trace!("Batch committed");
            return Ok(());
        };

        warn!(kind, %error, "Failed to apply event, replaying batch event by event");
        self.abort(txn);
        for event in &events {
            self.apply_alone(event)?;
        }
        Ok(())
    }

    /// Apply one event in its own transaction
    ///
    /// A completion whose bodies cannot be stored is recorded without them.
    fn apply_alone(&mut self, event: &StoreEvent) -> StorageResult<()> {
        let txn = self.begin()?;
        let error = match self.apply(&txn, event) {
            Ok(()) => return self.finish(txn),
            Err(e) => e,
        };
        self.abort(txn);

        match event {
            StoreEvent::NetworkTaskCompleted(completed)
                if completed.request_body.is_some() || completed.response_body.is_some() =>
            {
                warn!(task_id = %completed.task_id, %error, "Failed to store task bodies, dropping them");
                let mut without_bodies = completed.clone();
                without_bodies.request_body = None;
                without_bodies.response_body = None;
                self.apply_alone(&without_bodies.into())
            }
            _ => {
                warn!(kind = event.kind(), %error, "Failed to apply event");
                Ok(())
            }
        }
    }

    fn apply(&mut self, txn: &WriteTransaction, event: &StoreEvent) -> StorageResult<()> {
        match event {
            StoreEvent::MessageStored(event) => self.store_message(txn, event).map(|_| ()),
            StoreEvent::NetworkTaskCreated(event) => self.task_created(txn, event),
            StoreEvent::NetworkTaskProgressUpdated(event) => self.task_progress(txn, event),
            StoreEvent::NetworkTaskCompleted(event) => self.task_completed(txn, event),
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_message_id;
        self.next_message_id += 1;
        id
    }

    fn store_message(&mut self, txn: &WriteTransaction, event: &MessageCreated) -> StorageResult<u64> {
        let record = MessageRecord {
            id: self.next_id(),
            created_at: event.created_at,
            level: event.level,
            label: event.label.clone(),
            session: self.state.session.read().id,
            text: event.message.clone(),
            metadata: event.metadata.clone(),
            file: event.file.clone(),
            function: event.function.clone(),
            line: event.line,
            is_pinned: false,
            task_id: None,
        };
        tables::put_message(txn, &record)?;
        Ok(record.id)
    }

    /// Create a pending task together with its message
    fn create_task(
        &mut self,
        txn: &WriteTransaction,
        origin: TaskOrigin<'_>,
    ) -> StorageResult<NetworkTaskRecord> {
        let session = self.state.session.read().id;
        let url = origin.original_request.url.clone();
        let message = MessageRecord {
            id: self.next_id(),
            created_at: origin.created_at,
            level: Level::Debug,
            label: origin.label.unwrap_or(NETWORK_LABEL).to_string(),
            session,
            text: url.clone().unwrap_or_default(),
            metadata: Default::default(),
            file: String::new(),
            function: String::new(),
            line: 0,
            is_pinned: false,
            task_id: Some(origin.task_id),
        };
        tables::put_message(txn, &message)?;

        let mut task = NetworkTaskRecord::pending(
            origin.task_id,
            message.id,
            origin.task_type,
            origin.created_at,
            session,
        );
        task.host = origin.original_request.host();
        task.http_method = origin.original_request.http_method.clone();
        task.url = url;
        task.original_request = origin.original_request.clone();
        task.current_request = origin.current_request.cloned();
        task.task_description = origin.description.map(str::to_string);
        tables::put_task(txn, &task)?;
        Ok(task)
    }

    fn task_created(&mut self, txn: &WriteTransaction, event: &NetworkTaskCreated) -> StorageResult<()> {
        if tables::get_task(txn, event.task_id)?.is_some() {
            debug!(task_id = %event.task_id, "Task already exists");
            return Ok(());
        }
        let mut original_request = event.original_request.clone();
        strip_mock_header(&mut original_request);
        let mut current_request = event.current_request.clone();
        if let Some(request) = current_request.as_mut() {
            strip_mock_header(request);
        }
        let origin = TaskOrigin {
            original_request: &original_request,
            current_request: current_request.as_ref(),
            ..TaskOrigin::from(event)
        };
        self.create_task(txn, origin)?;
        Ok(())
    }

    fn task_progress(
        &mut self,
        txn: &WriteTransaction,
        event: &NetworkTaskProgressUpdated,
    ) -> StorageResult<()> {
        let Some(mut task) = tables::get_task(txn, event.task_id)? else {
            trace!(task_id = %event.task_id, "Progress for unknown task");
            return Ok(());
        };
        if task.state.is_terminal() {
            return Ok(());
        }
        task.progress = Some(TaskProgress {
            completed_unit_count: event.completed_unit_count,
            total_unit_count: event.total_unit_count,
        });
        tables::put_task(txn, &task)
    }

    fn task_completed(
        &mut self,
        txn: &WriteTransaction,
        event: &NetworkTaskCompleted,
    ) -> StorageResult<()> {
        let mut original_request = event.original_request.clone();
        let mut is_mocked = strip_mock_header(&mut original_request);
        let mut current_request = event.current_request.clone();
        if let Some(request) = current_request.as_mut() {
            is_mocked |= strip_mock_header(request);
        }

        let mut task = match tables::get_task(txn, event.task_id)? {
            Some(task) => task,
            None => {
                let origin = TaskOrigin {
                    original_request: &original_request,
                    current_request: current_request.as_ref(),
                    ..TaskOrigin::from(event)
                };
                self.create_task(txn, origin)?
            }
        };
        if task.state.is_terminal() {
            debug!(task_id = %event.task_id, state = %task.state, "Task already completed");
            return Ok(());
        }

        let is_failure = event.is_failure();
        task.state = if is_failure {
            TaskState::Failure
        } else {
            TaskState::Success
        };
        task.is_mocked = task.is_mocked || is_mocked;
        task.url = original_request.url.clone();
        task.host = original_request.host();
        task.http_method = original_request.http_method.clone();
        task.status_code = event.response.as_ref().and_then(|r| r.status_code);
        task.response_content_type = event
            .response
            .as_ref()
            .and_then(|r| r.content_type())
            .map(str::to_string);
        if let Some(error) = &event.error {
            task.error_code = Some(error.code);
            task.error_domain = Some(error.domain.clone());
            task.error_debug_description = Some(error.debug_description.clone());
        }
        if let Some(metrics) = &event.metrics {
            task.start_date = Some(metrics.start_date);
            task.duration = metrics.duration;
            task.redirect_count = metrics.redirect_count;
            task.is_from_cache = metrics.is_from_cache();
        }

        if let Some(body) = event.request_body.as_deref() {
            let content_type = original_request.content_type().map(str::to_string);
            task.request_body = self.store_body(txn, body, content_type.as_deref())?;
        }
        if let Some(body) = event.response_body.as_deref() {
            let content_type = task.response_content_type.clone();
            task.response_body = self.store_body(txn, body, content_type.as_deref())?;
        }

        let request_len = event.request_body.as_ref().map(|b| b.len() as i64);
        let response_len = event.response_body.as_ref().map(|b| b.len() as i64);
        let last_load = event.metrics.as_ref().and_then(|m| m.last_network_load());
        match event.task_type {
            TaskType::DataTask => {
                task.request_body_size = request_len.unwrap_or(0);
                task.response_body_size = response_len.unwrap_or(0);
            }
            TaskType::DownloadTask => {
                task.response_body_size = last_load
                    .map(|t| t.response_body_bytes_received)
                    .or(task.progress.map(|p| p.completed_unit_count))
                    .unwrap_or(-1);
            }
            TaskType::UploadTask => {
                task.request_body_size = last_load
                    .map(|t| t.request_body_bytes_sent)
                    .or(request_len)
                    .unwrap_or(-1);
            }
            TaskType::StreamTask | TaskType::WebSocketTask => {}
        }

        task.original_request = original_request;
        task.current_request = current_request;
        task.response = event.response.clone();
        if let Some(description) = &event.task_description {
            task.task_description = Some(description.clone());
        }
        task.progress = None;
        tables::put_task(txn, &task)?;

        if let Some(mut message) = tables::get_message(txn, task.message_id)? {
            if let Some(url) = &task.url {
                message.text = url.clone();
            }
            if is_failure {
                message.level = Level::Error;
            }
            tables::put_message(txn, &message)?;
        }
        Ok(())
    }

    /// Preprocess a body and store it, returning the blob key
    fn store_body(
        &mut self,
        txn: &WriteTransaction,
        data: &[u8],
        content_type: Option<&str>,
    ) -> StorageResult<Option<String>> {
        if data.is_empty() || data.len() as u64 >= self.config.response_body_size_limit {
            return Ok(None);
        }
        let is_image = content_type.is_some_and(|ct| ct.trim_start().starts_with("image/"));
        let thumbnail = if self.config.store_only_image_thumbnails
            && is_image
            && data.len() > IMAGE_THUMBNAIL_THRESHOLD
        {
            make_thumbnail(data, self.config.thumbnail_max_pixel_size)
        } else {
            None
        };
        let (payload, content_type) = match &thumbnail {
            Some(thumbnail) => (thumbnail.as_slice(), Some("image/png")),
            None => (data, content_type),
        };
        let handle = self
            .blobs
            .put(txn, &mut self.pending_files, payload, content_type)?;
        Ok(Some(handle.key))
    }

    /// Delete messages, cascading to their tasks and releasing blobs first
    pub(crate) fn delete_messages(
        &mut self,
        txn: &WriteTransaction,
        ids: &[u64],
        report: &mut SweepReport,
    ) -> StorageResult<()> {
        for &id in ids {
            let Some(message) = tables::get_message(txn, id)? else {
                continue;
            };
            if let Some(task_id) = message.task_id {
                self.delete_task(txn, task_id, report)?;
            }
            if tables::remove_message(txn, id)? {
                report.messages += 1;
            }
        }
        Ok(())
    }

    fn delete_task(
        &mut self,
        txn: &WriteTransaction,
        task_id: Uuid,
        report: &mut SweepReport,
    ) -> StorageResult<()> {
        let Some(task) = tables::get_task(txn, task_id)? else {
            return Ok(());
        };
        for key in task.blob_keys() {
            if let Some(size) = self.blobs.release(txn, &mut self.pending_files, key)? {
                report.blobs += 1;
                report.bytes_freed += size;
            }
        }
        if tables::remove_task(txn, task_id)? {
            report.tasks += 1;
        }
        Ok(())
    }

    /// Pin or unpin a message
    pub(crate) fn pin(&mut self, message_id: u64, pinned: bool) -> StorageResult<bool> {
        let txn = self.begin()?;
        let found = match tables::get_message(&txn, message_id)? {
            Some(mut message) => {
                message.is_pinned = pinned;
                tables::put_message(&txn, &message)?;
                true
            }
            None => false,
        };
        self.commit(txn)?;
        Ok(found)
    }

    /// Make `session` current and record it
    pub(crate) fn start_session(&mut self, session: Session, app_info: &AppInfo) -> StorageResult<()> {
        let txn = self.begin()?;
        tables::put_session(
            &txn,
            &SessionRecord {
                id: session.id,
                created_at: session.start_date,
                version: app_info.version.clone(),
                build: app_info.build.clone(),
            },
        )?;
        self.commit(txn)?;
        *self.state.session.write() = session;
        debug!(session = %session.id, "Session started");
        Ok(())
    }

    /// Delete sessions and every message recorded in them
    pub(crate) fn remove_sessions(&mut self, ids: &[Uuid]) -> StorageResult<SweepReport> {
        let mut report = SweepReport::default();
        let txn = self.begin()?;
        let doomed: Vec<u64> = tables::messages_in(&txn)?
            .into_iter()
            .filter(|m| ids.contains(&m.session))
            .map(|m| m.id)
            .collect();
        self.delete_messages(&txn, &doomed, &mut report)?;
        for id in ids {
            if tables::remove_session(&txn, *id)? {
                report.sessions += 1;
            }
        }
        self.commit(txn)?;
        Ok(report)
    }

    /// Delete everything and re-register the current session
    pub(crate) fn remove_all(&mut self) -> StorageResult<()> {
        let txn = self.begin()?;
        tables::clear_u64_table(&txn, MESSAGES)?;
        tables::clear_u128_table(&txn, TASKS)?;
        tables::clear_str_table(&txn, BLOBS)?;
        tables::clear_str_table(&txn, BLOB_DATA)?;
        tables::clear_u128_table(&txn, SESSIONS)?;
        let session = *self.state.session.read();
        tables::put_session(
            &txn,
            &SessionRecord {
                id: session.id,
                created_at: session.start_date,
                version: self.config.app_info.version.clone(),
                build: self.config.app_info.build.clone(),
            },
        )?;
        self.pending_files = PendingFiles::new();
        self.commit(txn)?;
        self.blobs.remove_all()?;
        debug!("Removed all records");
        Ok(())
    }
}

/// Remove the mock marker header, reporting whether it was present
fn strip_mock_header(request: &mut NetworkRequest) -> bool {
    let before = request.headers.len();
    request
        .headers
        .retain(|name, _| !name.eq_ignore_ascii_case(MOCKED_REQUEST_HEADER));
    request.headers.len() != before
}
