use std::net::SocketAddr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use uuid::Uuid;
use vigil_core::Level;

#[derive(Parser)]
#[command(name = "vigil", about = "Inspect Vigil log stores and receive remote logs")]
pub struct Cli {
    /// Store configuration file (TOML)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Print the summary of a store or archive
    Info {
        /// Store directory or archive
        path: PathBuf,
    },
    /// List messages
    Messages {
        /// Store directory or archive
        path: PathBuf,
        /// Minimum level
        #[arg(long)]
        level: Option<Level>,
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        session: Option<Uuid>,
        /// Only messages created at or after this time (RFC 3339)
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        /// Show only the newest N messages
        #[arg(long)]
        limit: Option<usize>,
        /// Leave out messages created for network tasks
        #[arg(long)]
        no_tasks: bool,
        /// One JSON object per line
        #[arg(long)]
        json: bool,
    },
    /// List network tasks
    Tasks {
        /// Store directory or archive
        path: PathBuf,
        /// Only failed tasks
        #[arg(long)]
        failed: bool,
        /// Show only the newest N tasks
        #[arg(long)]
        limit: Option<usize>,
        /// One JSON object per line
        #[arg(long)]
        json: bool,
    },
    /// Write a store to an archive
    Export {
        /// Store directory
        path: PathBuf,
        /// Archive to create
        dest: PathBuf,
        /// Only these sessions (repeatable)
        #[arg(long = "session")]
        sessions: Vec<Uuid>,
        /// Only messages created at or after this time (RFC 3339)
        #[arg(long)]
        since: Option<DateTime<Utc>>,
    },
    /// Remove expired records and enforce size limits
    Sweep {
        /// Store directory
        path: PathBuf,
    },
    /// Receive logs from devices
    Listen {
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0:9090")]
        bind: SocketAddr,
        /// Name reported to devices
        #[arg(long, default_value = "vigil-viewer")]
        name: String,
        /// Require devices to present this passcode
        #[arg(long)]
        passcode: Option<String>,
        /// Also record received events in this store
        #[arg(long)]
        store: Option<PathBuf>,
    },
}
