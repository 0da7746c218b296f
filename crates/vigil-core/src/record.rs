//! Persisted records
//!
//! These are the rows kept by the store. They are derived from
//! [`StoreEvent`](crate::event::StoreEvent)s and serialized with a compact
//! binary format, so no field here may be conditionally skipped.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::{NetworkRequest, NetworkResponse, TaskType};
use crate::level::Level;

/// Label given to messages created for network tasks without their own label
pub const NETWORK_LABEL: &str = "network";

/// A stored log message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    pub level: Level,
    pub label: String,
    pub session: Uuid,
    pub text: String,
    pub metadata: BTreeMap<String, String>,
    pub file: String,
    pub function: String,
    pub line: u32,
    pub is_pinned: bool,
    /// Set when the message represents a network task
    pub task_id: Option<Uuid>,
}

/// Lifecycle state of a network task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    #[default]
    Pending,
    Success,
    Failure,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
        }
    }
}

/// Byte progress of an in-flight task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskProgress {
    pub completed_unit_count: i64,
    pub total_unit_count: i64,
}

/// A stored network task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkTaskRecord {
    pub task_id: Uuid,
    /// Id of the message created together with the task
    pub message_id: u64,
    pub task_type: TaskType,
    pub created_at: DateTime<Utc>,
    pub session: Uuid,
    pub start_date: Option<DateTime<Utc>>,
    /// Seconds, zero until metrics arrive
    pub duration: f64,
    pub redirect_count: u32,
    pub url: Option<String>,
    pub host: Option<String>,
    pub http_method: Option<String>,
    pub status_code: Option<u16>,
    pub error_domain: Option<String>,
    pub error_code: Option<i64>,
    pub error_debug_description: Option<String>,
    pub response_content_type: Option<String>,
    pub is_from_cache: bool,
    pub is_mocked: bool,
    pub state: TaskState,
    pub progress: Option<TaskProgress>,
    pub original_request: NetworkRequest,
    pub current_request: Option<NetworkRequest>,
    pub response: Option<NetworkResponse>,
    /// Blob key of the request body
    pub request_body: Option<String>,
    /// Blob key of the response body
    pub response_body: Option<String>,
    /// Size of the request body, kept after the blob is evicted. `-1` if unknown
    pub request_body_size: i64,
    /// Size of the response body, kept after the blob is evicted. `-1` if unknown
    pub response_body_size: i64,
    pub task_description: Option<String>,
}

impl NetworkTaskRecord {
    /// Create a pending task record
    pub fn pending(
        task_id: Uuid,
        message_id: u64,
        task_type: TaskType,
        created_at: DateTime<Utc>,
        session: Uuid,
    ) -> Self {
        Self {
            task_id,
            message_id,
            task_type,
            created_at,
            session,
            start_date: None,
            duration: 0.0,
            redirect_count: 0,
            url: None,
            host: None,
            http_method: None,
            status_code: None,
            error_domain: None,
            error_code: None,
            error_debug_description: None,
            response_content_type: None,
            is_from_cache: false,
            is_mocked: false,
            state: TaskState::Pending,
            progress: None,
            original_request: NetworkRequest::default(),
            current_request: None,
            response: None,
            request_body: None,
            response_body: None,
            request_body_size: -1,
            response_body_size: -1,
            task_description: None,
        }
    }

    /// Blob keys currently referenced by this task
    pub fn blob_keys(&self) -> impl Iterator<Item = &str> {
        self.request_body
            .as_deref()
            .into_iter()
            .chain(self.response_body.as_deref())
    }

    pub fn has_blobs(&self) -> bool {
        self.request_body.is_some() || self.response_body.is_some()
    }
}

/// Where a blob's bytes live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobLocation {
    /// Stored in the record store next to the handle
    Inline,
    /// Stored as a file named by the key
    File,
}

/// A deduplicated body referenced by one or more tasks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobHandle {
    /// Hex-encoded content hash
    pub key: String,
    /// Bytes occupied on disk (after compression)
    pub size: u64,
    pub decompressed_size: u64,
    pub link_count: u32,
    pub is_compressed: bool,
    pub content_type: Option<String>,
    pub location: BlobLocation,
}

/// A logging session, one per process launch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: Uuid,
    pub start_date: DateTime<Utc>,
}

impl Session {
    /// Start a new session now
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            start_date: Utc::now(),
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// A stored session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub version: Option<String>,
    pub build: Option<String>,
}
