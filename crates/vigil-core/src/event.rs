//! Store events
//!
//! Everything the store ingests arrives as a [`StoreEvent`]. The same values
//! are re-published on the store's broadcast bus and forwarded verbatim to a
//! remote viewer, so every type here is serde-serializable with camelCase
//! field names.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::level::Level;

/// Header added to requests answered by a mock; stripped before storing
pub const MOCKED_REQUEST_HEADER: &str = "X-Vigil-Mocked";

/// Kind of HTTP task being logged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum TaskType {
    #[default]
    DataTask,
    DownloadTask,
    UploadTask,
    StreamTask,
    WebSocketTask,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DataTask => write!(f, "data"),
            Self::DownloadTask => write!(f, "download"),
            Self::UploadTask => write!(f, "upload"),
            Self::StreamTask => write!(f, "stream"),
            Self::WebSocketTask => write!(f, "websocket"),
        }
    }
}

/// An HTTP request as seen by the logger
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRequest {
    pub url: Option<String>,
    pub http_method: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl NetworkRequest {
    /// Create a GET request for a URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            http_method: Some("GET".to_string()),
            headers: BTreeMap::new(),
        }
    }

    /// Set the HTTP method
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.http_method = Some(method.into());
        self
    }

    /// Add a header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Value of the `Content-Type` header, matched case-insensitively
    pub fn content_type(&self) -> Option<&str> {
        header_value(&self.headers, "content-type")
    }

    /// Host component of the URL
    pub fn host(&self) -> Option<String> {
        self.url.as_deref().and_then(host_of)
    }
}

/// An HTTP response as seen by the logger
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkResponse {
    pub status_code: Option<u16>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl NetworkResponse {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code: Some(status_code),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Whether the status code is in the 2xx range
    pub fn is_success(&self) -> bool {
        matches!(self.status_code, Some(code) if (200..300).contains(&code))
    }

    pub fn content_type(&self) -> Option<&str> {
        header_value(&self.headers, "content-type")
    }
}

/// A transport-level error attached to a completed task
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseError {
    pub code: i64,
    pub domain: String,
    pub debug_description: String,
}

/// How a transaction was fulfilled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum FetchType {
    NetworkLoad,
    LocalCache,
    ServerPush,
    #[default]
    Unknown,
}

/// Metrics for one request/response transaction of a task
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionMetrics {
    pub fetch_type: FetchType,
    pub status_code: Option<u16>,
    pub request_body_bytes_sent: i64,
    pub response_body_bytes_received: i64,
}

/// Timing and transfer metrics for a whole task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetrics {
    pub start_date: DateTime<Utc>,
    /// Seconds
    pub duration: f64,
    pub redirect_count: u32,
    #[serde(default)]
    pub transactions: Vec<TransactionMetrics>,
}

impl TaskMetrics {
    /// Last transaction that went over the network
    pub fn last_network_load(&self) -> Option<&TransactionMetrics> {
        self.transactions
            .iter()
            .rev()
            .find(|t| t.fetch_type == FetchType::NetworkLoad)
    }

    /// Whether the response was served from a cache
    ///
    /// A network load answered with 304 counts as a cache hit.
    pub fn is_from_cache(&self) -> bool {
        match self.transactions.last() {
            Some(t) => {
                t.fetch_type == FetchType::LocalCache
                    || (t.fetch_type == FetchType::NetworkLoad && t.status_code == Some(304))
            }
            None => false,
        }
    }
}

/// A plain log message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageCreated {
    pub created_at: DateTime<Utc>,
    pub label: String,
    pub level: Level,
    pub message: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub function: String,
    #[serde(default)]
    pub line: u32,
}

impl MessageCreated {
    pub fn new(level: Level, label: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            created_at: Utc::now(),
            label: label.into(),
            level,
            message: message.into(),
            metadata: BTreeMap::new(),
            file: String::new(),
            function: String::new(),
            line: 0,
        }
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_location(
        mut self,
        file: impl Into<String>,
        function: impl Into<String>,
        line: u32,
    ) -> Self {
        self.file = file.into();
        self.function = function.into();
        self.line = line;
        self
    }
}

/// A network task has started
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkTaskCreated {
    pub task_id: Uuid,
    pub task_type: TaskType,
    pub created_at: DateTime<Utc>,
    pub original_request: NetworkRequest,
    pub current_request: Option<NetworkRequest>,
    pub label: Option<String>,
    pub task_description: Option<String>,
}

impl NetworkTaskCreated {
    pub fn new(task_id: Uuid, request: NetworkRequest) -> Self {
        Self {
            task_id,
            task_type: TaskType::DataTask,
            created_at: Utc::now(),
            original_request: request,
            current_request: None,
            label: None,
            task_description: None,
        }
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn with_task_type(mut self, task_type: TaskType) -> Self {
        self.task_type = task_type;
        self
    }
}

/// Byte progress of a running task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkTaskProgressUpdated {
    pub task_id: Uuid,
    pub url: Option<String>,
    pub completed_unit_count: i64,
    pub total_unit_count: i64,
}

/// A network task has finished, successfully or not
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkTaskCompleted {
    pub task_id: Uuid,
    pub task_type: TaskType,
    pub created_at: DateTime<Utc>,
    pub original_request: NetworkRequest,
    pub current_request: Option<NetworkRequest>,
    pub response: Option<NetworkResponse>,
    pub error: Option<ResponseError>,
    #[serde(default)]
    pub request_body: Option<Vec<u8>>,
    #[serde(default)]
    pub response_body: Option<Vec<u8>>,
    pub metrics: Option<TaskMetrics>,
    pub label: Option<String>,
    pub task_description: Option<String>,
}

impl NetworkTaskCompleted {
    pub fn new(task_id: Uuid, request: NetworkRequest) -> Self {
        Self {
            task_id,
            task_type: TaskType::DataTask,
            created_at: Utc::now(),
            original_request: request,
            current_request: None,
            response: None,
            error: None,
            request_body: None,
            response_body: None,
            metrics: None,
            label: None,
            task_description: None,
        }
    }

    pub fn with_task_type(mut self, task_type: TaskType) -> Self {
        self.task_type = task_type;
        self
    }

    pub fn with_response(mut self, response: NetworkResponse) -> Self {
        self.response = Some(response);
        self
    }

    pub fn with_error(mut self, error: ResponseError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_request_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.request_body = Some(body.into());
        self
    }

    pub fn with_response_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.response_body = Some(body.into());
        self
    }

    pub fn with_metrics(mut self, metrics: TaskMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Failure means a transport error or a non-2xx response
    pub fn is_failure(&self) -> bool {
        self.error.is_some() || self.response.as_ref().is_some_and(|r| !r.is_success())
    }
}

/// An event accepted by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StoreEvent {
    MessageStored(MessageCreated),
    NetworkTaskCreated(NetworkTaskCreated),
    NetworkTaskProgressUpdated(NetworkTaskProgressUpdated),
    NetworkTaskCompleted(NetworkTaskCompleted),
}

impl StoreEvent {
    /// Task id for network events
    pub fn task_id(&self) -> Option<Uuid> {
        match self {
            Self::MessageStored(_) => None,
            Self::NetworkTaskCreated(e) => Some(e.task_id),
            Self::NetworkTaskProgressUpdated(e) => Some(e.task_id),
            Self::NetworkTaskCompleted(e) => Some(e.task_id),
        }
    }

    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MessageStored(_) => "message_stored",
            Self::NetworkTaskCreated(_) => "task_created",
            Self::NetworkTaskProgressUpdated(_) => "task_progress",
            Self::NetworkTaskCompleted(_) => "task_completed",
        }
    }
}

impl From<MessageCreated> for StoreEvent {
    fn from(event: MessageCreated) -> Self {
        Self::MessageStored(event)
    }
}

impl From<NetworkTaskCreated> for StoreEvent {
    fn from(event: NetworkTaskCreated) -> Self {
        Self::NetworkTaskCreated(event)
    }
}

impl From<NetworkTaskProgressUpdated> for StoreEvent {
    fn from(event: NetworkTaskProgressUpdated) -> Self {
        Self::NetworkTaskProgressUpdated(event)
    }
}

impl From<NetworkTaskCompleted> for StoreEvent {
    fn from(event: NetworkTaskCompleted) -> Self {
        Self::NetworkTaskCompleted(event)
    }
}

fn header_value<'a>(headers: &'a BTreeMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Extract the host from an absolute URL
pub fn host_of(url: &str) -> Option<String> {
    let rest = url.split_once("://").map(|(_, rest)| rest)?;
    let authority = rest.split(['/', '?', '#']).next()?;
    let authority = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
    let host = if authority.starts_with('[') {
        authority.split_inclusive(']').next()?
    } else {
        authority.split(':').next()?
    };
    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}
