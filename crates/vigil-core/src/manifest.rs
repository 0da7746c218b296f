//! Store-level metadata documents
//!
//! [`Manifest`] is written to `manifest.json` in every store directory and
//! [`Info`] to `info.json` inside exported archives.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::CoreError;

/// A `major.minor.patch` store format version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StoreVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl StoreVersion {
    /// Format written by this build
    pub const CURRENT: StoreVersion = StoreVersion::new(1, 1, 0);

    /// Oldest format this build can read
    pub const MINIMUM_SUPPORTED: StoreVersion = StoreVersion::new(1, 0, 0);

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub fn is_supported(&self) -> bool {
        *self >= Self::MINIMUM_SUPPORTED
    }
}

impl fmt::Display for StoreVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for StoreVersion {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split('.');
        let mut next = || -> Result<u32, CoreError> {
            match parts.next() {
                Some(part) => part
                    .parse()
                    .map_err(|_| CoreError::InvalidVersion(s.to_string())),
                None => Ok(0),
            }
        };
        let version = Self::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(CoreError::InvalidVersion(s.to_string()));
        }
        Ok(version)
    }
}

impl Serialize for StoreVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StoreVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Contents of `manifest.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub store_id: Uuid,
    pub version: StoreVersion,
    #[serde(default)]
    pub last_sweep_date: Option<DateTime<Utc>>,
}

impl Manifest {
    /// A manifest for a brand-new store
    pub fn new() -> Self {
        Self {
            store_id: Uuid::new_v4(),
            version: StoreVersion::CURRENT,
            last_sweep_date: None,
        }
    }

    /// Same contents under a fresh store id
    pub fn with_new_id(&self) -> Self {
        Self {
            store_id: Uuid::new_v4(),
            ..self.clone()
        }
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new()
    }
}

/// Identification of the host application
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInfo {
    pub bundle_identifier: Option<String>,
    pub name: Option<String>,
    pub version: Option<String>,
    pub build: Option<String>,
}

impl AppInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            bundle_identifier: None,
            name: Some(name.into()),
            version: Some(version.into()),
            build: None,
        }
    }
}

/// Identification of the device the store was recorded on
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub name: String,
    pub model: String,
    pub local_identifier: Option<String>,
    pub system_name: String,
    pub system_version: String,
}

impl DeviceInfo {
    /// Describe the current machine from the environment
    pub fn current() -> Self {
        let name = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            name,
            model: std::env::consts::ARCH.to_string(),
            local_identifier: None,
            system_name: std::env::consts::OS.to_string(),
            system_version: std::env::consts::FAMILY.to_string(),
        }
    }
}

/// Summary of a store, written as `info.json` in archives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Info {
    pub store_id: Uuid,
    pub store_version: String,
    pub creation_date: DateTime<Utc>,
    pub modified_date: DateTime<Utc>,
    /// Plain messages, excluding those created for network tasks
    pub message_count: u64,
    pub task_count: u64,
    pub blob_count: u64,
    pub total_store_size: u64,
    pub blobs_size: u64,
    pub blobs_decompressed_size: u64,
    pub app_info: AppInfo,
    pub device_info: DeviceInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parse_and_order() {
        let v: StoreVersion = "1.0.3".parse().unwrap();
        assert_eq!(v, StoreVersion::new(1, 0, 3));
        assert!(v < StoreVersion::new(1, 1, 0));
        assert_eq!("2".parse::<StoreVersion>().unwrap(), StoreVersion::new(2, 0, 0));
        assert!("1.x".parse::<StoreVersion>().is_err());
        assert!("1.2.3.4".parse::<StoreVersion>().is_err());
    }

    #[test]
    fn test_minimum_supported() {
        assert!(StoreVersion::CURRENT.is_supported());
        assert!(!StoreVersion::new(0, 9, 0).is_supported());
    }

    #[test]
    fn test_manifest_json_fields() {
        let manifest = Manifest::new();
        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["version"], StoreVersion::CURRENT.to_string());
        assert!(json["storeId"].is_string());
        assert!(json["lastSweepDate"].is_null());

        let copy = manifest.with_new_id();
        assert_ne!(copy.store_id, manifest.store_id);
        assert_eq!(copy.version, manifest.version);
    }
}
