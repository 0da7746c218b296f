//! Network traffic front-end
//!
//! [`NetworkLogger`] turns the lifecycle callbacks of an HTTP client into
//! store events. It keeps per-task context (the request, accumulated
//! response data and metrics) between callbacks, filters hosts and redacts
//! sensitive headers and query items before anything reaches the sink.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use regex::Regex;
use tracing::trace;
use uuid::Uuid;
use vigil_core::{
    EventSink, NetworkRequest, NetworkResponse, NetworkTaskCompleted, NetworkTaskCreated,
    NetworkTaskProgressUpdated, ResponseError, StoreEvent, TaskMetrics, TaskType,
};

use crate::config::EventFilter;
use crate::error::{StorageError, StorageResult};

/// Replacement for redacted values
pub const REDACTED: &str = "<private>";

/// Configuration for [`NetworkLogger`]
#[derive(Debug, Clone, Default)]
pub struct NetworkLoggerConfig {
    /// Label of task messages; `None` uses the store default
    pub label: Option<String>,
    /// Hosts matching any of these patterns are not logged
    pub excluded_hosts: Vec<String>,
    /// When non-empty, only hosts matching one of these patterns are logged
    pub included_hosts: Vec<String>,
    /// Header names whose values are redacted, case-insensitive
    pub sensitive_headers: Vec<String>,
    /// Query item names whose values are redacted
    pub sensitive_query_items: Vec<String>,
    pub will_handle_event: Option<EventFilter>,
}

impl NetworkLoggerConfig {
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn exclude_host(mut self, pattern: impl Into<String>) -> Self {
        self.excluded_hosts.push(pattern.into());
        self
    }

    pub fn include_host(mut self, pattern: impl Into<String>) -> Self {
        self.included_hosts.push(pattern.into());
        self
    }

    pub fn redact_header(mut self, name: impl Into<String>) -> Self {
        self.sensitive_headers.push(name.into());
        self
    }

    pub fn redact_query_item(mut self, name: impl Into<String>) -> Self {
        self.sensitive_query_items.push(name.into());
        self
    }
}

#[derive(Debug, Clone)]
struct TaskContext {
    task_type: TaskType,
    created_at: DateTime<Utc>,
    request: NetworkRequest,
    data: Vec<u8>,
    metrics: Option<TaskMetrics>,
}

/// Produces network task events for an [`EventSink`]
pub struct NetworkLogger {
    sink: Arc<dyn EventSink>,
    config: NetworkLoggerConfig,
    included: Vec<Regex>,
    excluded: Vec<Regex>,
    tasks: DashMap<Uuid, TaskContext>,
}

impl NetworkLogger {
    pub fn new(sink: Arc<dyn EventSink>, config: NetworkLoggerConfig) -> StorageResult<Self> {
        let compile = |patterns: &[String]| -> StorageResult<Vec<Regex>> {
            patterns
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|e| StorageError::Config(format!("invalid host pattern {p:?}: {e}")))
                })
                .collect()
        };
        Ok(Self {
            included: compile(&config.included_hosts)?,
            excluded: compile(&config.excluded_hosts)?,
            sink,
            config,
            tasks: DashMap::new(),
        })
    }

    /// A task was created
    pub fn log_task_created(&self, task_id: Uuid, task_type: TaskType, request: NetworkRequest) {
        if !self.is_logged(&request) {
            trace!(%task_id, "Host filtered out");
            return;
        }
        let request = self.redact(request);
        let created_at = Utc::now();
        self.tasks.insert(
            task_id,
            TaskContext {
                task_type,
                created_at,
                request: request.clone(),
                data: Vec::new(),
                metrics: None,
            },
        );
        self.send(
            NetworkTaskCreated {
                task_id,
                task_type,
                created_at,
                original_request: request,
                current_request: None,
                label: self.config.label.clone(),
                task_description: None,
            }
            .into(),
        );
    }

    /// A chunk of the response body arrived
    pub fn log_data_received(&self, task_id: Uuid, data: &[u8]) {
        if let Some(mut context) = self.tasks.get_mut(&task_id) {
            context.data.extend_from_slice(data);
        }
    }

    /// Byte progress of a tracked task
    pub fn log_progress(&self, task_id: Uuid, completed: i64, total: i64) {
        let url = match self.tasks.get(&task_id) {
            Some(context) => context.request.url.clone(),
            None => return,
        };
        self.send(
            NetworkTaskProgressUpdated {
                task_id,
                url,
                completed_unit_count: completed,
                total_unit_count: total,
            }
            .into(),
        );
    }

    pub fn log_metrics(&self, task_id: Uuid, metrics: TaskMetrics) {
        if let Some(mut context) = self.tasks.get_mut(&task_id) {
            context.metrics = Some(metrics);
        }
    }

    /// A task finished
    ///
    /// The response body is whatever [`log_data_received`](Self::log_data_received)
    /// accumulated. Tasks that were never created (or were filtered out)
    /// are ignored.
    pub fn log_task_completed(
        &self,
        task_id: Uuid,
        response: Option<NetworkResponse>,
        error: Option<ResponseError>,
        request_body: Option<Vec<u8>>,
    ) {
        let Some((_, context)) = self.tasks.remove(&task_id) else {
            trace!(%task_id, "Completion for untracked task");
            return;
        };
        let response = response.map(|mut r| {
            self.redact_headers(&mut r.headers);
            r
        });
        self.send(
            NetworkTaskCompleted {
                task_id,
                task_type: context.task_type,
                created_at: context.created_at,
                original_request: context.request,
                current_request: None,
                response,
                error,
                request_body,
                response_body: Some(context.data),
                metrics: context.metrics,
                label: self.config.label.clone(),
                task_description: None,
            }
            .into(),
        );
    }

    /// Number of tasks still in flight
    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    fn send(&self, event: StoreEvent) {
        let event = match &self.config.will_handle_event {
            Some(filter) => match filter.apply(event) {
                Some(event) => event,
                None => return,
            },
            None => event,
        };
        self.sink.submit(event);
    }

    fn is_logged(&self, request: &NetworkRequest) -> bool {
        let Some(host) = request.host() else {
            return self.included.is_empty();
        };
        if self.excluded.iter().any(|r| r.is_match(&host)) {
            return false;
        }
        self.included.is_empty() || self.included.iter().any(|r| r.is_match(&host))
    }

    fn redact(&self, mut request: NetworkRequest) -> NetworkRequest {
        self.redact_headers(&mut request.headers);
        if let Some(url) = request.url.as_mut() {
            *url = redact_query(url, &self.config.sensitive_query_items);
        }
        request
    }

    fn redact_headers(&self, headers: &mut std::collections::BTreeMap<String, String>) {
        for (name, value) in headers.iter_mut() {
            if self
                .config
                .sensitive_headers
                .iter()
                .any(|s| s.eq_ignore_ascii_case(name))
            {
                *value = REDACTED.to_string();
            }
        }
    }
}

/// Replace the values of sensitive query items in a URL
fn redact_query(url: &str, sensitive: &[String]) -> String {
    if sensitive.is_empty() {
        return url.to_string();
    }
    let (base, fragment) = match url.split_once('#') {
        Some((base, fragment)) => (base, Some(fragment)),
        None => (url, None),
    };
    let Some((path, query)) = base.split_once('?') else {
        return url.to_string();
    };
    let query = query
        .split('&')
        .map(|item| match item.split_once('=') {
            Some((name, _)) if sensitive.iter().any(|s| s == name) => format!("{name}={REDACTED}"),
            _ => item.to_string(),
        })
        .collect::<Vec<_>>()
        .join("&");
    match fragment {
        Some(fragment) => format!("{path}?{query}#{fragment}"),
        None => format!("{path}?{query}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::MemorySink;

    fn logger(config: NetworkLoggerConfig) -> (NetworkLogger, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let logger = NetworkLogger::new(sink.clone(), config).unwrap();
        (logger, sink)
    }

    #[test]
    fn test_full_lifecycle() {
        let (logger, sink) = logger(NetworkLoggerConfig::default().with_label("api"));
        let task_id = Uuid::new_v4();
        logger.log_task_created(
            task_id,
            TaskType::DataTask,
            NetworkRequest::new("https://api.example.com/users"),
        );
        logger.log_progress(task_id, 2, 4);
        logger.log_data_received(task_id, b"[1,");
        logger.log_data_received(task_id, b"2]");
        logger.log_task_completed(task_id, Some(NetworkResponse::new(200)), None, None);

        let events = sink.events();
        assert_eq!(events.len(), 3);
        match &events[2] {
            StoreEvent::NetworkTaskCompleted(e) => {
                assert_eq!(e.response_body.as_deref(), Some(&b"[1,2]"[..]));
                assert_eq!(e.label.as_deref(), Some("api"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(logger.pending_tasks(), 0);
    }

    #[test]
    fn test_host_filters() {
        let (logger, sink) = logger(
            NetworkLoggerConfig::default()
                .include_host(r"example\.com$")
                .exclude_host(r"^metrics\."),
        );
        for url in [
            "https://api.example.com/a",
            "https://metrics.example.com/b",
            "https://other.org/c",
        ] {
            logger.log_task_created(Uuid::new_v4(), TaskType::DataTask, NetworkRequest::new(url));
        }
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn test_redaction() {
        let (logger, sink) = logger(
            NetworkLoggerConfig::default()
                .redact_header("authorization")
                .redact_query_item("token"),
        );
        let request = NetworkRequest::new("https://example.com/a?token=abc&page=2#top")
            .with_header("Authorization", "Bearer secret")
            .with_header("Accept", "*/*");
        logger.log_task_created(Uuid::new_v4(), TaskType::DataTask, request);

        match &sink.events()[0] {
            StoreEvent::NetworkTaskCreated(e) => {
                assert_eq!(
                    e.original_request.url.as_deref(),
                    Some("https://example.com/a?token=<private>&page=2#top")
                );
                assert_eq!(e.original_request.headers["Authorization"], REDACTED);
                assert_eq!(e.original_request.headers["Accept"], "*/*");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_invalid_pattern() {
        let sink: Arc<dyn EventSink> = Arc::new(MemorySink::new());
        let result = NetworkLogger::new(sink, NetworkLoggerConfig::default().exclude_host("("));
        assert!(matches!(result, Err(StorageError::Config(_))));
    }

    #[test]
    fn test_untracked_completion_is_ignored() {
        let (logger, sink) = logger(NetworkLoggerConfig::default());
        logger.log_task_completed(Uuid::new_v4(), None, None, None);
        assert!(sink.is_empty());
    }
}
