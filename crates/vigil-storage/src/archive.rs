//! Archive container
//!
//! An exported store is its package directory packed into a gzip-compressed
//! tar file.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tracing::{debug, instrument};
use vigil_core::Info;

use crate::error::{StorageError, StorageResult};
use crate::package::INFO_FILE;

/// Pack every file under `dir` into a new archive at `dest`
#[instrument(skip_all, fields(dest = %dest.display()))]
pub fn pack(dir: &Path, dest: &Path) -> StorageResult<()> {
    let file = File::create(dest)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder
        .append_dir_all(".", dir)
        .map_err(|e| StorageError::archive(format!("failed to add files: {e}")))?;
    let encoder = builder
        .into_inner()
        .map_err(|e| StorageError::archive(format!("failed to finish tar: {e}")))?;
    let file = encoder
        .finish()
        .map_err(|e| StorageError::archive(format!("failed to finish gzip: {e}")))?;
    file.sync_all()?;
    debug!("Archive written");
    Ok(())
}

/// Unpack an archive into `into`
#[instrument(skip_all, fields(archive = %archive.display()))]
pub fn unpack(archive: &Path, into: &Path) -> StorageResult<()> {
    let file = File::open(archive)?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    tar.unpack(into)
        .map_err(|e| StorageError::archive(format!("failed to unpack: {e}")))?;
    Ok(())
}

/// Read `info.json` from an archive without unpacking the rest
pub fn read_info(archive: &Path) -> StorageResult<Info> {
    let file = File::open(archive)?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    let entries = tar
        .entries()
        .map_err(|e| StorageError::archive(e.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| StorageError::archive(e.to_string()))?;
        let is_info = entry
            .path()
            .map(|p| p.file_name().is_some_and(|name| name == INFO_FILE))
            .unwrap_or(false);
        if is_info {
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            return Ok(serde_json::from_slice(&data)?);
        }
    }
    Err(StorageError::invalid(format!("{INFO_FILE} missing from archive")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_pack_and_unpack() {
        let source = TempDir::new().unwrap();
        std::fs::create_dir(source.path().join("blobs")).unwrap();
        std::fs::write(source.path().join("manifest.json"), b"{}").unwrap();
        std::fs::write(source.path().join("blobs").join("abc"), b"blob").unwrap();

        let out = TempDir::new().unwrap();
        let archive = out.path().join("store.vigil");
        pack(source.path(), &archive).unwrap();

        let target = TempDir::new().unwrap();
        unpack(&archive, target.path()).unwrap();
        assert_eq!(std::fs::read(target.path().join("manifest.json")).unwrap(), b"{}");
        assert_eq!(
            std::fs::read(target.path().join("blobs").join("abc")).unwrap(),
            b"blob"
        );
    }

    #[test]
    fn test_garbage_is_an_archive_error() {
        let out = TempDir::new().unwrap();
        let path = out.path().join("broken.vigil");
        std::fs::write(&path, b"not a gzip stream").unwrap();
        let target = TempDir::new().unwrap();
        assert!(matches!(
            unpack(&path, target.path()),
            Err(StorageError::Archive(_))
        ));
    }
}
