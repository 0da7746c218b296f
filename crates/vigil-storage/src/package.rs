//! Store package layout
//!
//! A store is a directory holding `logs.redb`, `manifest.json` and a
//! `blobs/` directory. Archives add `info.json`.

use std::io::ErrorKind;
use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use vigil_core::{AppInfo, DeviceInfo, Info, Manifest};

use crate::blobs::BLOBS_DIR;
use crate::error::StorageResult;
use crate::tables::{DATABASE_FILE, RecordDb};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const INFO_FILE: &str = "info.json";

/// Conventional extension of exported archives
pub const ARCHIVE_EXTENSION: &str = "vigil";

pub fn read_manifest(root: &Path) -> StorageResult<Manifest> {
    let data = std::fs::read(root.join(MANIFEST_FILE))?;
    Ok(serde_json::from_slice(&data)?)
}

pub fn write_manifest(root: &Path, manifest: &Manifest) -> StorageResult<()> {
    write_json(&root.join(MANIFEST_FILE), manifest)
}

pub fn read_info(root: &Path) -> StorageResult<Info> {
    let data = std::fs::read(root.join(INFO_FILE))?;
    Ok(serde_json::from_slice(&data)?)
}

pub fn write_info(root: &Path, info: &Info) -> StorageResult<()> {
    write_json(&root.join(INFO_FILE), info)
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> StorageResult<()> {
    let data = serde_json::to_vec_pretty(value)
        .map_err(|e| crate::error::StorageError::Serialization(e.to_string()))?;
    let temp_path = path.with_extension("tmp");
    std::fs::write(&temp_path, data)?;
    std::fs::rename(&temp_path, path)?;
    Ok(())
}

/// Summarize a store directory
pub fn compute_info(
    root: &Path,
    db: &RecordDb,
    manifest: &Manifest,
    app_info: &AppInfo,
) -> StorageResult<Info> {
    let counts = db.counts()?;
    let db_path = root.join(DATABASE_FILE);
    let metadata = std::fs::metadata(&db_path)?;
    let modified = metadata.modified().unwrap_or_else(|_| SystemTime::now());
    let created = metadata.created().unwrap_or(modified);

    Ok(Info {
        store_id: manifest.store_id,
        store_version: manifest.version.to_string(),
        creation_date: DateTime::<Utc>::from(created),
        modified_date: DateTime::<Utc>::from(modified),
        message_count: counts.messages,
        task_count: counts.tasks,
        blob_count: counts.blobs,
        total_store_size: directory_size(root)?,
        blobs_size: counts.blobs_size,
        blobs_decompressed_size: counts.blobs_decompressed_size,
        app_info: app_info.clone(),
        device_info: DeviceInfo::current(),
    })
}

/// Total size of the database file and every blob file
pub fn directory_size(root: &Path) -> StorageResult<u64> {
    let mut total = file_size(&root.join(DATABASE_FILE))?;
    match std::fs::read_dir(root.join(BLOBS_DIR)) {
        Ok(entries) => {
            for entry in entries {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    total += entry.metadata()?.len();
                }
            }
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(total)
}

pub fn file_size(path: &Path) -> StorageResult<u64> {
    match std::fs::metadata(path) {
        Ok(metadata) => Ok(metadata.len()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_manifest_file_round_trip() {
        let temp = TempDir::new().unwrap();
        let manifest = Manifest::new();
        write_manifest(temp.path(), &manifest).unwrap();
        assert_eq!(read_manifest(temp.path()).unwrap(), manifest);
        assert!(!temp.path().join("manifest.tmp").exists());
    }

    #[test]
    fn test_sizes_of_missing_files() {
        let temp = TempDir::new().unwrap();
        assert_eq!(file_size(&temp.path().join("nope")).unwrap(), 0);
        assert_eq!(directory_size(temp.path()).unwrap(), 0);
    }
}
