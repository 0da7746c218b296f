//! Subscriber settings
//!
//! A [`LogConfig`] decides where a process's `tracing` output goes: the
//! console, JSON lines on disk, and the store itself when a sink is given to
//! [`VigilSubscriberBuilder::with_store`](crate::VigilSubscriberBuilder::with_store).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Where tracing output goes and how much of it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub default_level: String,
    pub console: ConsoleConfig,
    pub file: Option<FileConfig>,
    /// Lowest level recorded in the store. Applies on top of the filter, so
    /// the store can stay quieter than the console.
    pub store_level: Option<String>,
    /// Source file and line in JSON lines
    pub include_location: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_level: "info".to_string(),
            console: ConsoleConfig::json(),
            file: None,
            store_level: None,
            include_location: true,
        }
    }
}

impl LogConfig {
    /// Colored console output at `debug`
    pub fn development() -> Self {
        Self {
            default_level: "debug".to_string(),
            console: ConsoleConfig::pretty(true),
            ..Self::default()
        }
    }

    /// `vigil` command line: colored console output at `level`
    pub fn cli(level: impl Into<String>) -> Self {
        Self {
            default_level: level.into(),
            console: ConsoleConfig::pretty(true),
            include_location: false,
            ..Self::default()
        }
    }

    /// Daily JSON files under `log_dir` and nothing on the console. Only
    /// warnings and errors reach the store.
    pub fn production(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            console: ConsoleConfig::disabled(),
            file: Some(FileConfig::new(log_dir)),
            store_level: Some("warn".to_string()),
            ..Self::default()
        }
    }

    /// Warnings only, without colors so captured test output stays readable
    pub fn testing() -> Self {
        Self {
            default_level: "warn".to_string(),
            console: ConsoleConfig::pretty(false),
            include_location: false,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub enabled: bool,
    /// Human-readable lines; JSON lines otherwise
    pub pretty: bool,
    pub ansi: bool,
}

impl ConsoleConfig {
    pub fn pretty(ansi: bool) -> Self {
        Self {
            enabled: true,
            pretty: true,
            ansi,
        }
    }

    pub fn json() -> Self {
        Self {
            enabled: true,
            pretty: false,
            ansi: false,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::json()
        }
    }
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self::json()
    }
}

/// JSON lines written under `directory`
///
/// Rotating files are named `<prefix>.<date>` and appended to across
/// restarts. With [`RotationStrategy::Never`] a single `<prefix>.log` is
/// truncated on start.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub directory: PathBuf,
    pub prefix: String,
    pub rotation: RotationStrategy,
}

impl FileConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Self::default()
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_rotation(mut self, rotation: RotationStrategy) -> Self {
        self.rotation = rotation;
        self
    }
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("logs"),
            prefix: "vigil".to_string(),
            rotation: RotationStrategy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RotationStrategy {
    #[default]
    Daily,
    Hourly,
    Never,
}
