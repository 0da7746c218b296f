//! Space reclamation
//!
//! A sweep runs independent passes in one transaction: age, record store
//! size, blob size and finally files under `blobs/` that no handle owns. A
//! failing pass is logged and the next one still runs.

use chrono::Utc;
use redb::WriteTransaction;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::error::StorageResult;
use crate::package::{file_size, write_manifest};
use crate::tables::{self, DATABASE_FILE};
use crate::writer::StoreWriter;

/// Minimum number of messages before the size pass trims anything
const MIN_MESSAGES_FOR_SIZE_SWEEP: usize = 10;

/// What a sweep removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub messages: u64,
    pub tasks: u64,
    pub blobs: u64,
    pub sessions: u64,
    /// Files under `blobs/` that no blob referred to
    pub orphaned_files: u64,
    /// Stored bytes of deleted blobs and orphaned files
    pub bytes_freed: u64,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl StoreWriter {
    #[instrument(skip_all)]
    pub(crate) fn sweep(&mut self) -> StorageResult<SweepReport> {
        let mut report = SweepReport::default();
        let txn = self.begin()?;

        if let Err(e) = self.sweep_by_age(&txn, &mut report) {
            warn!(error = %e, "Age sweep failed");
        }
        if let Err(e) = self.sweep_by_database_size(&txn, &mut report) {
            warn!(error = %e, "Database size sweep failed");
        }
        if let Err(e) = self.sweep_blobs(&txn, &mut report) {
            warn!(error = %e, "Blob sweep failed");
        }
        if let Err(e) = self.sweep_orphaned_files(&txn, &mut report) {
            warn!(error = %e, "Orphaned file sweep failed");
        }
        self.commit(txn)?;

        let manifest = {
            let mut manifest = self.state.manifest.write();
            manifest.last_sweep_date = Some(Utc::now());
            manifest.clone()
        };
        write_manifest(&self.root, &manifest)?;

        info!(
            messages = report.messages,
            tasks = report.tasks,
            blobs = report.blobs,
            orphaned_files = report.orphaned_files,
            bytes_freed = report.bytes_freed,
            "Sweep finished"
        );
        Ok(report)
    }

    fn sweep_by_age(&mut self, txn: &WriteTransaction, report: &mut SweepReport) -> StorageResult<()> {
        let max_age = chrono::Duration::from_std(self.config.max_age())
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let Some(cutoff) = Utc::now().checked_sub_signed(max_age) else {
            return Ok(());
        };

        let expired: Vec<u64> = tables::messages_in(txn)?
            .into_iter()
            .filter(|m| m.created_at < cutoff)
            .map(|m| m.id)
            .collect();
        self.delete_messages(txn, &expired, report)?;

        let current = self.state.session.read().id;
        for session in tables::sessions_in(txn)? {
            if session.id != current && session.created_at < cutoff {
                tables::remove_session(txn, session.id)?;
                report.sessions += 1;
            }
        }
        Ok(())
    }

    fn sweep_by_database_size(
        &mut self,
        txn: &WriteTransaction,
        report: &mut SweepReport,
    ) -> StorageResult<()> {
        let size = file_size(&self.root.join(DATABASE_FILE))?;
        if size <= self.config.database_size_limit {
            return Ok(());
        }
        let mut messages = tables::messages_in(txn)?;
        if messages.len() <= MIN_MESSAGES_FOR_SIZE_SWEEP {
            return Ok(());
        }

        // Newest first
        messages.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let index = ((messages.len() as f64) * self.config.trim_ratio).floor() as usize;
        let cutoff = messages[index.min(messages.len() - 1)].created_at;

        let doomed: Vec<u64> = messages
            .iter()
            .filter(|m| m.created_at < cutoff)
            .map(|m| m.id)
            .collect();
        info!(size, limit = self.config.database_size_limit, removing = doomed.len(), "Database over limit");
        self.delete_messages(txn, &doomed, report)
    }

    fn sweep_blobs(&mut self, txn: &WriteTransaction, report: &mut SweepReport) -> StorageResult<()> {
        let limit = self.config.blobs_size_limit;
        let mut total = self.blobs.total_size_in(txn)?;
        if total <= limit {
            return Ok(());
        }
        let target = ((limit as f64) * self.config.trim_ratio) as u64;

        let mut tasks: Vec<_> = tables::tasks_in(txn)?
            .into_iter()
            .filter(|t| t.has_blobs())
            .collect();
        tasks.sort_by_key(|t| t.created_at);

        for mut task in tasks {
            if total <= target {
                break;
            }
            for key in [task.request_body.take(), task.response_body.take()]
                .into_iter()
                .flatten()
            {
                if let Some(size) = self.blobs.release(txn, &mut self.pending_files, &key)? {
                    total = total.saturating_sub(size);
                    report.blobs += 1;
                    report.bytes_freed += size;
                }
            }
            tables::put_task(txn, &task)?;
        }
        info!(remaining = total, target, "Blob store trimmed");
        Ok(())
    }

    /// Unlink files left behind by interrupted writes or lost handles
    fn sweep_orphaned_files(
        &mut self,
        txn: &WriteTransaction,
        report: &mut SweepReport,
    ) -> StorageResult<()> {
        for (name, size) in self.blobs.orphaned_files(txn, &self.pending_files)? {
            debug!(name, size, "Orphaned blob file");
            self.pending_files.unlink(name);
            report.orphaned_files += 1;
            report.bytes_freed += size;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobs::BlobStore;
    use crate::config::StoreConfig;
    use crate::tables::RecordDb;
    use crate::writer::StoreState;
    use chrono::Duration;
    use parking_lot::RwLock;
    use std::sync::Arc;
    use tempfile::TempDir;
    use uuid::Uuid;
    use vigil_core::{
        Level, Manifest, MessageCreated, NetworkRequest, NetworkResponse, NetworkTaskCompleted,
        Session, StoreEvent,
    };

    fn test_writer(config: StoreConfig) -> (StoreWriter, TempDir) {
        let temp = TempDir::new().unwrap();
        let db = RecordDb::open(&temp.path().join(DATABASE_FILE)).unwrap();
        let blobs = BlobStore::new(temp.path().join("blobs"), config.inline_limit, false);
        let state = Arc::new(StoreState {
            manifest: RwLock::new(Manifest::new()),
            session: RwLock::new(Session::new()),
        });
        let writer =
            StoreWriter::new(temp.path().to_path_buf(), db, blobs, Arc::new(config), state).unwrap();
        (writer, temp)
    }

    fn task_with_body(body: &[u8], age: Duration) -> StoreEvent {
        let mut event = NetworkTaskCompleted::new(Uuid::new_v4(), NetworkRequest::new("https://e.com"))
            .with_response(NetworkResponse::new(200))
            .with_response_body(body.to_vec());
        event.created_at = Utc::now() - age;
        event.into()
    }

    #[test]
    fn test_empty_sweep_updates_manifest() {
        let (mut writer, temp) = test_writer(StoreConfig::default());
        let report = writer.sweep().unwrap();
        assert!(report.is_empty());
        let manifest = crate::package::read_manifest(temp.path()).unwrap();
        assert!(manifest.last_sweep_date.is_some());
    }

    #[test]
    fn test_blob_sweep_keeps_sizes_and_newest_blobs() {
        let config = StoreConfig::default()
            .with_blobs_size_limit(250)
            .with_trim_ratio(0.5)
            .with_inline_limit(1024);
        let (mut writer, _temp) = test_writer(config);
        let events: Vec<StoreEvent> = (0..5u8)
            .map(|i| task_with_body(&[i; 100], Duration::minutes(10 - i as i64)))
            .collect();
        writer.apply_batch(events).unwrap();

        let report = writer.sweep().unwrap();
        // 500 bytes down to at most 125
        assert_eq!(report.blobs, 4);
        assert_eq!(report.bytes_freed, 400);
        assert_eq!(writer.blobs.total_size(writer.db.database()).unwrap(), 100);

        let mut tasks = writer.db.tasks().unwrap();
        tasks.sort_by_key(|t| t.created_at);
        assert!(tasks.iter().all(|t| t.response_body_size == 100));
        assert!(tasks[..4].iter().all(|t| t.response_body.is_none()));
        assert!(tasks[4].response_body.is_some());
    }

    #[test]
    fn test_orphaned_files_are_removed() {
        let config = StoreConfig::default().with_inline_limit(16);
        let (mut writer, temp) = test_writer(config);
        let body = vec![7u8; 64];
        writer
            .apply_batch(vec![task_with_body(&body, Duration::minutes(1))])
            .unwrap();
        let blobs_dir = temp.path().join("blobs");
        std::fs::write(blobs_dir.join("0badc0de"), [0u8; 20]).unwrap();
        std::fs::write(blobs_dir.join("0badc0de.tmp"), [0u8; 5]).unwrap();

        let report = writer.sweep().unwrap();
        assert_eq!(report.orphaned_files, 2);
        assert_eq!(report.bytes_freed, 25);
        assert_eq!(report.blobs, 0);
        assert!(!blobs_dir.join("0badc0de").exists());
        assert!(!blobs_dir.join("0badc0de.tmp").exists());

        let task = &writer.db.tasks().unwrap()[0];
        let key = task.response_body.as_deref().unwrap();
        assert_eq!(writer.blobs.get(writer.db.database(), key).unwrap().unwrap(), body);
        assert!(writer.sweep().unwrap().is_empty());
    }

    #[test]
    fn test_old_sessions_are_removed() {
        let config = StoreConfig::default().with_max_age(std::time::Duration::from_secs(60));
        let (mut writer, _temp) = test_writer(config);
        let old = Session {
            id: Uuid::new_v4(),
            start_date: Utc::now() - Duration::hours(1),
        };
        let current = Session::new();
        writer.start_session(old, &Default::default()).unwrap();
        writer.start_session(current, &Default::default()).unwrap();
        writer
            .apply_batch(vec![
                MessageCreated::new(Level::Info, "a", "old")
                    .with_created_at(Utc::now() - Duration::hours(1))
                    .into(),
            ])
            .unwrap();

        let report = writer.sweep().unwrap();
        assert_eq!(report.messages, 1);
        assert_eq!(report.sessions, 1);
        let sessions = writer.db.sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, current.id);
    }
}
