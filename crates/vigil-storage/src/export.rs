//! Export to a read-only archive
//!
//! The copy is built in a staging directory: a fresh record store holding
//! the selected rows with link counts recomputed, the file-tier blobs they
//! reference, a manifest with a new store id and `info.json`. The directory
//! is then packed into a single archive.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use redb::ReadableTable;
use tracing::{info, instrument};
use vigil_core::{BlobHandle, BlobLocation, Info, MessageRecord, NetworkTaskRecord, SessionRecord};

use crate::archive;
use crate::blobs::BLOBS_DIR;
use crate::config::ExportOptions;
use crate::error::{StorageError, StorageResult};
use crate::package::{compute_info, write_info, write_manifest};
use crate::tables::{
    self, BLOB_DATA, BLOBS, DATABASE_FILE, MESSAGES, NEXT_MESSAGE_ID, RecordDb, SESSIONS, TASKS,
    decode, decode_all, encode,
};
use crate::writer::StoreWriter;

/// Rows selected for an export
struct Selection {
    messages: Vec<MessageRecord>,
    tasks: Vec<NetworkTaskRecord>,
    sessions: Vec<SessionRecord>,
    /// Blob handles with their link counts in the copy
    blobs: Vec<(BlobHandle, Option<Vec<u8>>)>,
}

impl StoreWriter {
    #[instrument(skip_all, fields(dest = %dest.display()))]
    pub(crate) fn export(&mut self, dest: &Path, options: &ExportOptions) -> StorageResult<Info> {
        if dest.exists() {
            return Err(StorageError::FileAlreadyExists(dest.to_path_buf()));
        }

        let staging = tempfile::Builder::new().prefix("vigil-export").tempdir()?;
        let selection = self.select(options)?;
        let counts = (
            selection.messages.len(),
            selection.tasks.len(),
            selection.blobs.len(),
        );

        let target = RecordDb::open(&staging.path().join(DATABASE_FILE))?;
        std::fs::create_dir_all(staging.path().join(BLOBS_DIR))?;
        let txn = target.database().begin_write()?;
        let next_id = selection.messages.iter().map(|m| m.id + 1).max().unwrap_or(1);
        for message in &selection.messages {
            tables::put_message(&txn, message)?;
        }
        for task in &selection.tasks {
            tables::put_task(&txn, task)?;
        }
        for session in &selection.sessions {
            tables::put_session(&txn, session)?;
        }
        {
            let mut handles = txn.open_table(BLOBS)?;
            let mut inline = txn.open_table(BLOB_DATA)?;
            for (handle, data) in &selection.blobs {
                handles.insert(handle.key.as_str(), encode(handle)?.as_slice())?;
                match (handle.location, data) {
                    (BlobLocation::Inline, Some(data)) => {
                        inline.insert(handle.key.as_str(), data.as_slice())?;
                    }
                    _ => {
                        std::fs::copy(
                            self.blobs.blob_path(&handle.key),
                            staging.path().join(BLOBS_DIR).join(&handle.key),
                        )?;
                    }
                }
            }
        }
        tables::write_counter(&txn, NEXT_MESSAGE_ID, next_id)?;
        txn.commit()?;

        let manifest = self.state.manifest.read().with_new_id();
        write_manifest(staging.path(), &manifest)?;
        let info = compute_info(staging.path(), &target, &manifest, &self.config.app_info)?;
        write_info(staging.path(), &info)?;
        drop(target);

        archive::pack(staging.path(), dest)?;
        info!(
            messages = counts.0,
            tasks = counts.1,
            blobs = counts.2,
            "Store exported"
        );
        Ok(info)
    }

    fn select(&self, options: &ExportOptions) -> StorageResult<Selection> {
        let txn = self.db.database().begin_read()?;

        let messages: Vec<MessageRecord> =
            decode_all::<_, _, MessageRecord>(&txn.open_table(MESSAGES)?)?
                .into_iter()
                .filter(|m| options.includes(m.session, m.created_at))
                .collect();

        let task_table = txn.open_table(TASKS)?;
        let mut tasks = Vec::new();
        for task_id in messages.iter().filter_map(|m| m.task_id) {
            if let Some(value) = task_table.get(task_id.as_u128())? {
                tasks.push(decode::<NetworkTaskRecord>(value.value())?);
            }
        }

        let mut links: BTreeMap<String, u32> = BTreeMap::new();
        for task in &tasks {
            for key in task.blob_keys() {
                *links.entry(key.to_string()).or_default() += 1;
            }
        }

        let handle_table = txn.open_table(BLOBS)?;
        let inline_table = txn.open_table(BLOB_DATA)?;
        let mut blobs = Vec::with_capacity(links.len());
        for (key, link_count) in links {
            let Some(value) = handle_table.get(key.as_str())? else {
                continue;
            };
            let mut handle: BlobHandle = decode(value.value())?;
            handle.link_count = link_count;
            let data = match handle.location {
                BlobLocation::Inline => inline_table
                    .get(key.as_str())?
                    .map(|v| v.value().to_vec()),
                BlobLocation::File => None,
            };
            blobs.push((handle, data));
        }

        let unfiltered = options.sessions.is_none() && options.since.is_none();
        let mut session_ids: HashSet<_> = messages.iter().map(|m| m.session).collect();
        if let Some(ids) = &options.sessions {
            session_ids.extend(ids.iter().copied());
        }
        let sessions = decode_all::<_, _, SessionRecord>(&txn.open_table(SESSIONS)?)?
            .into_iter()
            .filter(|s| unfiltered || session_ids.contains(&s.id))
            .collect();

        Ok(Selection {
            messages,
            tasks,
            sessions,
            blobs,
        })
    }
}
