//! redb table definitions and record access
//!
//! Every persisted row is a postcard-encoded record. The helpers taking a
//! `&WriteTransaction` open exactly one table, do their work and release it
//! again, so callers can freely combine them inside one transaction.

use std::path::Path;
use std::sync::Arc;

use redb::{
    Database, Key, ReadableTable, ReadableTableMetadata, TableDefinition, WriteTransaction,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};
use uuid::Uuid;
use vigil_core::{BlobHandle, MessageRecord, NetworkTaskRecord, SessionRecord};

use crate::error::{StorageError, StorageResult};

// Key: message id, Value: serialized MessageRecord
pub const MESSAGES: TableDefinition<u64, &[u8]> = TableDefinition::new("messages");

// Key: task id as u128, Value: serialized NetworkTaskRecord
pub const TASKS: TableDefinition<u128, &[u8]> = TableDefinition::new("network_tasks");

// Key: hex blob key, Value: serialized BlobHandle
pub const BLOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("blob_handles");

// Key: hex blob key, Value: stored bytes of inline blobs
pub const BLOB_DATA: TableDefinition<&str, &[u8]> = TableDefinition::new("blob_data");

// Key: session id as u128, Value: serialized SessionRecord
pub const SESSIONS: TableDefinition<u128, &[u8]> = TableDefinition::new("sessions");

// Key: counter name, Value: counter
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// META key holding the next message id
pub const NEXT_MESSAGE_ID: &str = "next_message_id";

/// Database file name inside a store directory
pub const DATABASE_FILE: &str = "logs.redb";

pub(crate) fn encode<T: Serialize>(value: &T) -> StorageResult<Vec<u8>> {
    postcard::to_allocvec(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StorageResult<T> {
    postcard::from_bytes(bytes).map_err(|e| StorageError::Deserialization(e.to_string()))
}

/// Decode every value of a table, in key order
pub(crate) fn decode_all<K, T, R>(table: &T) -> StorageResult<Vec<R>>
where
    K: Key + 'static,
    T: ReadableTable<K, &'static [u8]>,
    R: DeserializeOwned,
{
    let mut out = Vec::new();
    for entry in table.iter()? {
        let (_, value) = entry?;
        out.push(decode(value.value())?);
    }
    Ok(out)
}

/// Create every table so read transactions never see a missing one
pub(crate) fn init_tables(db: &Database) -> StorageResult<()> {
    let txn = db.begin_write()?;
    txn.open_table(MESSAGES)?;
    txn.open_table(TASKS)?;
    txn.open_table(BLOBS)?;
    txn.open_table(BLOB_DATA)?;
    txn.open_table(SESSIONS)?;
    txn.open_table(META)?;
    txn.commit()?;
    debug!("Initialized redb tables");
    Ok(())
}

// Write-side helpers

pub(crate) fn get_message(txn: &WriteTransaction, id: u64) -> StorageResult<Option<MessageRecord>> {
    let table = txn.open_table(MESSAGES)?;
    let value = table.get(id)?;
    value.map(|v| decode(v.value())).transpose()
}

pub(crate) fn put_message(txn: &WriteTransaction, record: &MessageRecord) -> StorageResult<()> {
    let bytes = encode(record)?;
    let mut table = txn.open_table(MESSAGES)?;
    table.insert(record.id, bytes.as_slice())?;
    Ok(())
}

pub(crate) fn remove_message(txn: &WriteTransaction, id: u64) -> StorageResult<bool> {
    let mut table = txn.open_table(MESSAGES)?;
    let removed = table.remove(id)?.is_some();
    Ok(removed)
}

pub(crate) fn messages_in(txn: &WriteTransaction) -> StorageResult<Vec<MessageRecord>> {
    let table = txn.open_table(MESSAGES)?;
    decode_all(&table)
}

pub(crate) fn get_task(
    txn: &WriteTransaction,
    task_id: Uuid,
) -> StorageResult<Option<NetworkTaskRecord>> {
    let table = txn.open_table(TASKS)?;
    let value = table.get(task_id.as_u128())?;
    value.map(|v| decode(v.value())).transpose()
}

pub(crate) fn put_task(txn: &WriteTransaction, record: &NetworkTaskRecord) -> StorageResult<()> {
    let bytes = encode(record)?;
    let mut table = txn.open_table(TASKS)?;
    table.insert(record.task_id.as_u128(), bytes.as_slice())?;
    Ok(())
}

pub(crate) fn remove_task(txn: &WriteTransaction, task_id: Uuid) -> StorageResult<bool> {
    let mut table = txn.open_table(TASKS)?;
    let removed = table.remove(task_id.as_u128())?.is_some();
    Ok(removed)
}

pub(crate) fn tasks_in(txn: &WriteTransaction) -> StorageResult<Vec<NetworkTaskRecord>> {
    let table = txn.open_table(TASKS)?;
    decode_all(&table)
}

pub(crate) fn put_session(txn: &WriteTransaction, record: &SessionRecord) -> StorageResult<()> {
    let bytes = encode(record)?;
    let mut table = txn.open_table(SESSIONS)?;
    table.insert(record.id.as_u128(), bytes.as_slice())?;
    Ok(())
}

pub(crate) fn remove_session(txn: &WriteTransaction, id: Uuid) -> StorageResult<bool> {
    let mut table = txn.open_table(SESSIONS)?;
    let removed = table.remove(id.as_u128())?.is_some();
    Ok(removed)
}

pub(crate) fn sessions_in(txn: &WriteTransaction) -> StorageResult<Vec<SessionRecord>> {
    let table = txn.open_table(SESSIONS)?;
    decode_all(&table)
}

pub(crate) fn read_counter(txn: &WriteTransaction, name: &str) -> StorageResult<Option<u64>> {
    let table = txn.open_table(META)?;
    let value = table.get(name)?;
    Ok(value.map(|v| v.value()))
}

pub(crate) fn write_counter(txn: &WriteTransaction, name: &str, value: u64) -> StorageResult<()> {
    let mut table = txn.open_table(META)?;
    table.insert(name, value)?;
    Ok(())
}

/// Empty a table by collecting its keys first
pub(crate) fn clear_u64_table(
    txn: &WriteTransaction,
    def: TableDefinition<u64, &[u8]>,
) -> StorageResult<u64> {
    let mut table = txn.open_table(def)?;
    let keys = table
        .iter()?
        .map(|entry| entry.map(|(k, _)| k.value()))
        .collect::<Result<Vec<_>, _>>()?;
    for key in &keys {
        table.remove(*key)?;
    }
    Ok(keys.len() as u64)
}

pub(crate) fn clear_u128_table(
    txn: &WriteTransaction,
    def: TableDefinition<u128, &[u8]>,
) -> StorageResult<u64> {
    let mut table = txn.open_table(def)?;
    let keys = table
        .iter()?
        .map(|entry| entry.map(|(k, _)| k.value()))
        .collect::<Result<Vec<_>, _>>()?;
    for key in &keys {
        table.remove(*key)?;
    }
    Ok(keys.len() as u64)
}

pub(crate) fn clear_str_table(
    txn: &WriteTransaction,
    def: TableDefinition<&str, &[u8]>,
) -> StorageResult<u64> {
    let mut table = txn.open_table(def)?;
    let keys = table
        .iter()?
        .map(|entry| entry.map(|(k, _)| k.value().to_string()))
        .collect::<Result<Vec<_>, _>>()?;
    for key in &keys {
        table.remove(key.as_str())?;
    }
    Ok(keys.len() as u64)
}

/// Row counts of a store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordCounts {
    /// Messages not created for a network task
    pub messages: u64,
    pub tasks: u64,
    pub blobs: u64,
    pub blobs_size: u64,
    pub blobs_decompressed_size: u64,
}

/// Read access to the record store
///
/// Each call runs in its own read transaction and only sees committed data.
#[derive(Clone)]
pub struct RecordDb {
    db: Arc<Database>,
}

impl RecordDb {
    /// Open or create the database file
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;
        init_tables(&db)?;
        debug!("Opened record store");
        Ok(Self { db: Arc::new(db) })
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// All messages in id order
    pub fn messages(&self) -> StorageResult<Vec<MessageRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(MESSAGES)?;
        decode_all(&table)
    }

    pub fn message(&self, id: u64) -> StorageResult<Option<MessageRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(MESSAGES)?;
        let value = table.get(id)?;
        value.map(|v| decode(v.value())).transpose()
    }

    pub fn tasks(&self) -> StorageResult<Vec<NetworkTaskRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(TASKS)?;
        decode_all(&table)
    }

    pub fn task(&self, task_id: Uuid) -> StorageResult<Option<NetworkTaskRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(TASKS)?;
        let value = table.get(task_id.as_u128())?;
        value.map(|v| decode(v.value())).transpose()
    }

    pub fn blob_handle(&self, key: &str) -> StorageResult<Option<BlobHandle>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(BLOBS)?;
        let value = table.get(key)?;
        value.map(|v| decode(v.value())).transpose()
    }

    pub fn blob_handles(&self) -> StorageResult<Vec<BlobHandle>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(BLOBS)?;
        decode_all(&table)
    }

    pub fn counter(&self, name: &str) -> StorageResult<Option<u64>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(META)?;
        let value = table.get(name)?;
        Ok(value.map(|v| v.value()))
    }

    pub fn sessions(&self) -> StorageResult<Vec<SessionRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SESSIONS)?;
        decode_all(&table)
    }

    pub fn counts(&self) -> StorageResult<RecordCounts> {
        let txn = self.db.begin_read()?;
        let messages = txn.open_table(MESSAGES)?;
        let mut counts = RecordCounts::default();
        for entry in messages.iter()? {
            let (_, value) = entry?;
            let message: MessageRecord = decode(value.value())?;
            if message.task_id.is_none() {
                counts.messages += 1;
            }
        }
        counts.tasks = txn.open_table(TASKS)?.len()?;
        let blobs = txn.open_table(BLOBS)?;
        counts.blobs = blobs.len()?;
        for handle in decode_all::<_, _, BlobHandle>(&blobs)? {
            counts.blobs_size += handle.size;
            counts.blobs_decompressed_size += handle.decompressed_size;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use tempfile::TempDir;
    use vigil_core::Level;

    fn message(id: u64, task_id: Option<Uuid>) -> MessageRecord {
        MessageRecord {
            id,
            created_at: Utc::now(),
            level: Level::Info,
            label: "test".into(),
            session: Uuid::nil(),
            text: format!("message {id}"),
            metadata: BTreeMap::new(),
            file: String::new(),
            function: String::new(),
            line: 0,
            is_pinned: false,
            task_id,
        }
    }

    fn create_test_db() -> (RecordDb, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = RecordDb::open(&temp_dir.path().join(DATABASE_FILE)).unwrap();
        (db, temp_dir)
    }

    #[test]
    fn test_put_and_read_back() {
        let (db, _temp) = create_test_db();
        let txn = db.database().begin_write().unwrap();
        put_message(&txn, &message(1, None)).unwrap();
        put_message(&txn, &message(2, Some(Uuid::new_v4()))).unwrap();
        assert_eq!(messages_in(&txn).unwrap().len(), 2);
        txn.commit().unwrap();

        assert_eq!(db.message(1).unwrap().unwrap().text, "message 1");
        assert!(db.message(3).unwrap().is_none());
        assert_eq!(db.counts().unwrap().messages, 1);
    }

    #[test]
    fn test_uncommitted_writes_are_invisible() {
        let (db, _temp) = create_test_db();
        let txn = db.database().begin_write().unwrap();
        put_message(&txn, &message(1, None)).unwrap();
        assert!(db.messages().unwrap().is_empty());
        drop(txn);
        assert!(db.messages().unwrap().is_empty());
    }

    #[test]
    fn test_clear_and_counters() {
        let (db, _temp) = create_test_db();
        let txn = db.database().begin_write().unwrap();
        for id in 0..5 {
            put_message(&txn, &message(id, None)).unwrap();
        }
        write_counter(&txn, NEXT_MESSAGE_ID, 5).unwrap();
        assert_eq!(clear_u64_table(&txn, MESSAGES).unwrap(), 5);
        assert_eq!(read_counter(&txn, NEXT_MESSAGE_ID).unwrap(), Some(5));
        txn.commit().unwrap();
        assert!(db.messages().unwrap().is_empty());
    }
}
