//! Blob store implementation
//!
//! Reference-counted, content-addressed storage. Handle bookkeeping happens
//! inside the caller's write transaction. File changes are tracked in
//! [`PendingFiles`]: freed files are unlinked once that transaction commits,
//! and files written for it are removed again if it does not.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use redb::{Database, ReadableTable, WriteTransaction};
use tracing::{debug, instrument, warn};
use vigil_core::compression::{deflate, inflate};
use vigil_core::{BlobHandle, BlobLocation};

use super::content::ContentKey;
use crate::error::{StorageError, StorageResult};
use crate::tables::{BLOB_DATA, BLOBS, decode, decode_all, encode};

/// File changes of the current write transaction
#[derive(Debug, Default)]
pub struct PendingFiles {
    unlinks: HashSet<String>,
    written: HashSet<String>,
}

impl PendingFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.unlinks.is_empty() && self.written.is_empty()
    }

    /// Whether the file of `key` goes away on commit
    pub fn will_unlink(&self, key: &str) -> bool {
        self.unlinks.contains(key)
    }

    /// Unlink the file of `key` once the transaction commits
    pub fn unlink(&mut self, key: impl Into<String>) {
        self.unlinks.insert(key.into());
    }

    /// Whether the file of `key` was created by this transaction
    pub fn was_written(&self, key: &str) -> bool {
        self.written.contains(key)
    }
}

/// Reference-counted blob storage over the record store and `blobs/`
#[derive(Debug, Clone)]
pub struct BlobStore {
    dir: PathBuf,
    inline_limit: u64,
    compression: bool,
}

impl BlobStore {
    pub fn new(dir: impl Into<PathBuf>, inline_limit: u64, compression: bool) -> Self {
        Self {
            dir: dir.into(),
            inline_limit,
            compression,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a file-tier blob
    pub fn blob_path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    /// Store content and return its handle
    ///
    /// Identical content only bumps the link count of the existing handle.
    #[instrument(skip_all, fields(size = data.len()))]
    pub fn put(
        &self,
        txn: &WriteTransaction,
        pending: &mut PendingFiles,
        data: &[u8],
        content_type: Option<&str>,
    ) -> StorageResult<BlobHandle> {
        let content = ContentKey::from_data(data);
        let key = content.hash_hex();

        let mut handles = txn.open_table(BLOBS)?;
        let existing: Option<BlobHandle> = handles
            .get(key.as_str())?
            .map(|v| decode(v.value()))
            .transpose()?;

        if let Some(mut handle) = existing {
            handle.link_count += 1;
            handles.insert(key.as_str(), encode(&handle)?.as_slice())?;
            debug!(hash = %content.short_hash(), links = handle.link_count, "Blob already exists");
            return Ok(handle);
        }

        // Released earlier in this batch: the new handle owns the bytes again
        pending.unlinks.remove(&key);

        let (stored, is_compressed) = self.compress(data)?;
        let location = if stored.len() as u64 <= self.inline_limit {
            let mut inline = txn.open_table(BLOB_DATA)?;
            inline.insert(key.as_str(), stored.as_slice())?;
            BlobLocation::Inline
        } else {
            if self.write_file(&key, &stored)? {
                pending.written.insert(key.clone());
            }
            BlobLocation::File
        };

        let handle = BlobHandle {
            key: key.clone(),
            size: stored.len() as u64,
            decompressed_size: content.size,
            link_count: 1,
            is_compressed,
            content_type: content_type.map(str::to_string),
            location,
        };
        handles.insert(key.as_str(), encode(&handle)?.as_slice())?;

        debug!(hash = %content.short_hash(), ?location, is_compressed, "Stored blob");
        Ok(handle)
    }

    /// Drop one reference
    ///
    /// Returns the stored size when this was the last reference and the blob
    /// was deleted.
    pub fn release(
        &self,
        txn: &WriteTransaction,
        pending: &mut PendingFiles,
        key: &str,
    ) -> StorageResult<Option<u64>> {
        let mut handles = txn.open_table(BLOBS)?;
        let existing: Option<BlobHandle> = handles
            .get(key)?
            .map(|v| decode(v.value()))
            .transpose()?;

        let Some(mut handle) = existing else {
            warn!(key, "Released unknown blob");
            return Ok(None);
        };

        if handle.link_count > 1 {
            handle.link_count -= 1;
            handles.insert(key, encode(&handle)?.as_slice())?;
            return Ok(None);
        }

        handles.remove(key)?;
        match handle.location {
            BlobLocation::Inline => {
                let mut inline = txn.open_table(BLOB_DATA)?;
                inline.remove(key)?;
            }
            BlobLocation::File => pending.unlink(key),
        }
        debug!(key, size = handle.size, "Blob freed");
        Ok(Some(handle.size))
    }

    /// The transaction committed: remove files of the blobs it freed
    pub fn commit_files(&self, pending: &mut PendingFiles) {
        pending.written.clear();
        for key in pending.unlinks.drain() {
            self.remove_file(&key);
        }
    }

    /// The transaction did not commit: remove the files it wrote
    pub fn rollback_files(&self, pending: &mut PendingFiles) {
        pending.unlinks.clear();
        for key in pending.written.drain() {
            debug!(key, "Removing blob file of a rolled back transaction");
            self.remove_file(&key);
        }
    }

    fn remove_file(&self, key: &str) {
        match std::fs::remove_file(self.blob_path(key)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(key, error = %e, "Failed to remove blob file"),
        }
    }

    /// Files under the blob directory that no handle in `txn` refers to
    ///
    /// Returns names and sizes. Files already due for unlinking are skipped.
    /// Only the writer touches the directory, so a leftover `.tmp` file is
    /// never a write in progress.
    pub fn orphaned_files(
        &self,
        txn: &WriteTransaction,
        pending: &PendingFiles,
    ) -> StorageResult<Vec<(String, u64)>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let handles = txn.open_table(BLOBS)?;
        let mut orphans = Vec::new();
        for entry in entries {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if pending.will_unlink(&name) {
                continue;
            }
            let is_live = match handles.get(name.as_str())? {
                Some(value) => decode::<BlobHandle>(value.value())?.location == BlobLocation::File,
                None => false,
            };
            if !is_live {
                orphans.push((name, metadata.len()));
            }
        }
        Ok(orphans)
    }

    /// Decompressed content of a blob, `None` for unknown keys
    pub fn get(&self, db: &Database, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let txn = db.begin_read()?;
        let handles = txn.open_table(BLOBS)?;
        let handle: Option<BlobHandle> = handles
            .get(key)?
            .map(|v| decode(v.value()))
            .transpose()?;
        let Some(handle) = handle else {
            return Ok(None);
        };

        let stored = match handle.location {
            BlobLocation::Inline => {
                let inline = txn.open_table(BLOB_DATA)?;
                let value = inline.get(key)?;
                match value {
                    Some(v) => v.value().to_vec(),
                    None => return Err(StorageError::not_found(format!("inline data for {key}"))),
                }
            }
            BlobLocation::File => match std::fs::read(self.blob_path(key)) {
                Ok(data) => data,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(StorageError::not_found(format!("blob file {key}")));
                }
                Err(e) => return Err(e.into()),
            },
        };

        if handle.is_compressed {
            Ok(Some(inflate(&stored)?))
        } else {
            Ok(Some(stored))
        }
    }

    /// Sum of stored sizes of live blobs
    pub fn total_size(&self, db: &Database) -> StorageResult<u64> {
        let txn = db.begin_read()?;
        let handles = txn.open_table(BLOBS)?;
        sum_sizes(&handles)
    }

    /// Same as [`total_size`](Self::total_size), seeing uncommitted changes
    pub fn total_size_in(&self, txn: &WriteTransaction) -> StorageResult<u64> {
        let handles = txn.open_table(BLOBS)?;
        sum_sizes(&handles)
    }

    /// Delete every blob file
    pub fn remove_all(&self) -> StorageResult<()> {
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        std::fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    fn compress(&self, data: &[u8]) -> StorageResult<(Vec<u8>, bool)> {
        if self.compression && !data.is_empty() {
            let compressed = deflate(data)?;
            if (compressed.len() as f64) * 1.1 < data.len() as f64 {
                return Ok((compressed, true));
            }
        }
        Ok((data.to_vec(), false))
    }

    /// Write a blob file, returning whether it did not exist before
    fn write_file(&self, key: &str, data: &[u8]) -> StorageResult<bool> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.blob_path(key);
        let created = !path.exists();
        // Write atomically (write to temp, then rename)
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, data)?;
        std::fs::rename(&temp_path, &path)?;
        Ok(created)
    }
}

fn sum_sizes<T>(handles: &T) -> StorageResult<u64>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    Ok(decode_all::<_, _, BlobHandle>(handles)?
        .iter()
        .map(|h| h.size)
        .sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::{DATABASE_FILE, RecordDb};
    use tempfile::TempDir;

    struct Fixture {
        db: RecordDb,
        blobs: BlobStore,
        _temp: TempDir,
    }

    fn fixture(inline_limit: u64, compression: bool) -> Fixture {
        let temp = TempDir::new().unwrap();
        let db = RecordDb::open(&temp.path().join(DATABASE_FILE)).unwrap();
        let blobs = BlobStore::new(temp.path().join("blobs"), inline_limit, compression);
        Fixture {
            db,
            blobs,
            _temp: temp,
        }
    }

    fn put(f: &Fixture, pending: &mut PendingFiles, data: &[u8]) -> BlobHandle {
        let txn = f.db.database().begin_write().unwrap();
        let handle = f.blobs.put(&txn, pending, data, None).unwrap();
        txn.commit().unwrap();
        handle
    }

    fn release(f: &Fixture, pending: &mut PendingFiles, key: &str) -> Option<u64> {
        let txn = f.db.database().begin_write().unwrap();
        let freed = f.blobs.release(&txn, pending, key).unwrap();
        txn.commit().unwrap();
        f.blobs.commit_files(pending);
        freed
    }

    #[test]
    fn test_dedup_and_release() {
        let f = fixture(1024, true);
        let mut pending = PendingFiles::new();

        let first = put(&f, &mut pending, b"shared body");
        let second = put(&f, &mut pending, b"shared body");
        assert_eq!(first.key, second.key);
        assert_eq!(second.link_count, 2);

        assert_eq!(release(&f, &mut pending, &first.key), None);
        assert_eq!(
            f.blobs.get(f.db.database(), &first.key).unwrap().unwrap(),
            b"shared body"
        );

        assert!(release(&f, &mut pending, &first.key).is_some());
        assert!(f.blobs.get(f.db.database(), &first.key).unwrap().is_none());
        assert!(f.db.blob_handles().unwrap().is_empty());
    }

    #[test]
    fn test_large_blob_goes_to_file_tier() {
        let f = fixture(16, false);
        let mut pending = PendingFiles::new();
        let data = vec![42u8; 100];

        let handle = put(&f, &mut pending, &data);
        assert_eq!(handle.location, BlobLocation::File);
        assert!(f.blobs.blob_path(&handle.key).exists());
        assert_eq!(f.blobs.get(f.db.database(), &handle.key).unwrap().unwrap(), data);

        release(&f, &mut pending, &handle.key);
        assert!(!f.blobs.blob_path(&handle.key).exists());
    }

    #[test]
    fn test_compressible_data_is_compressed() {
        let f = fixture(1024 * 1024, true);
        let mut pending = PendingFiles::new();
        let data = b"0123456789".repeat(1000);

        let handle = put(&f, &mut pending, &data);
        assert!(handle.is_compressed);
        assert!(handle.size < handle.decompressed_size);
        assert_eq!(handle.decompressed_size, data.len() as u64);
        assert_eq!(f.blobs.get(f.db.database(), &handle.key).unwrap().unwrap(), data);
        assert_eq!(f.blobs.total_size(f.db.database()).unwrap(), handle.size);
    }

    #[test]
    fn test_random_data_is_stored_raw() {
        let f = fixture(1024 * 1024, true);
        let mut pending = PendingFiles::new();
        let data: Vec<u8> = (0..4096).map(|_| rand::random::<u8>()).collect();

        let handle = put(&f, &mut pending, &data);
        assert!(!handle.is_compressed);
        assert_eq!(handle.size, data.len() as u64);
        assert_eq!(f.blobs.get(f.db.database(), &handle.key).unwrap().unwrap(), data);
    }

    #[test]
    fn test_put_after_release_in_same_batch_keeps_file() {
        let f = fixture(8, false);
        let mut pending = PendingFiles::new();
        let data = vec![1u8; 64];
        let handle = put(&f, &mut pending, &data);

        let txn = f.db.database().begin_write().unwrap();
        assert!(f.blobs.release(&txn, &mut pending, &handle.key).unwrap().is_some());
        assert!(pending.will_unlink(&handle.key));
        let again = f.blobs.put(&txn, &mut pending, &data, None).unwrap();
        assert_eq!(again.link_count, 1);
        assert!(!pending.will_unlink(&handle.key));
        assert!(!pending.was_written(&handle.key));
        txn.commit().unwrap();
        f.blobs.commit_files(&mut pending);

        assert_eq!(f.blobs.get(f.db.database(), &handle.key).unwrap().unwrap(), data);
    }

    #[test]
    fn test_rollback_removes_only_new_files() {
        let f = fixture(8, false);
        let mut pending = PendingFiles::new();
        let kept = put(&f, &mut pending, &[3u8; 64]);
        assert!(pending.is_empty());

        let txn = f.db.database().begin_write().unwrap();
        let fresh = f.blobs.put(&txn, &mut pending, &[4u8; 64], None).unwrap();
        assert!(pending.was_written(&fresh.key));
        // Freed and stored again within the same transaction
        f.blobs.release(&txn, &mut pending, &kept.key).unwrap();
        f.blobs.put(&txn, &mut pending, &[3u8; 64], None).unwrap();
        txn.abort().unwrap();
        f.blobs.rollback_files(&mut pending);

        assert!(pending.is_empty());
        assert!(!f.blobs.blob_path(&fresh.key).exists());
        assert_eq!(
            f.blobs.get(f.db.database(), &kept.key).unwrap().unwrap(),
            vec![3u8; 64]
        );
    }

    #[test]
    fn test_orphaned_files() {
        let f = fixture(8, false);
        let mut pending = PendingFiles::new();
        let live = put(&f, &mut pending, &[5u8; 64]);
        let freed = put(&f, &mut pending, &[6u8; 64]);
        std::fs::write(f.blobs.blob_path("stray"), [0u8; 20]).unwrap();
        std::fs::write(f.blobs.blob_path("stale.tmp"), [0u8; 5]).unwrap();
        std::fs::create_dir(f.blobs.dir().join("nested")).unwrap();

        let txn = f.db.database().begin_write().unwrap();
        f.blobs.release(&txn, &mut pending, &freed.key).unwrap();
        let mut orphans = f.blobs.orphaned_files(&txn, &pending).unwrap();
        orphans.sort();
        assert_eq!(
            orphans,
            vec![("stale.tmp".to_string(), 5), ("stray".to_string(), 20)]
        );
        assert!(!orphans.iter().any(|(name, _)| *name == live.key));
    }

    #[test]
    fn test_remove_all_clears_directory() {
        let f = fixture(8, false);
        let mut pending = PendingFiles::new();
        let handle = put(&f, &mut pending, &[9u8; 64]);
        f.blobs.remove_all().unwrap();
        assert!(!f.blobs.blob_path(&handle.key).exists());
        assert!(f.blobs.dir().exists());
    }
}
