//! Mock registry
//!
//! A viewer can replace responses for requests matching a URL pattern. The
//! client keeps the current set of mocks here; the actual response is
//! fetched from the viewer on demand with
//! [`RemoteSession::get_mocked_response`](crate::RemoteSession::get_mocked_response).

use std::collections::BTreeMap;

use dashmap::DashMap;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

/// A request pattern with an optional method and hit window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mock {
    pub mock_id: Uuid,
    /// Case-insensitive regex matched against the full URL
    pub pattern: String,
    #[serde(default)]
    pub method: Option<String>,
    /// Number of matching requests to let through first
    #[serde(default)]
    pub skip: Option<u32>,
    /// Number of requests to mock after `skip`; unlimited when absent
    #[serde(default)]
    pub count: Option<u32>,
}

impl Mock {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            mock_id: Uuid::new_v4(),
            pattern: pattern.into(),
            method: None,
            skip: None,
            count: None,
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_skip(mut self, skip: u32) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }
}

/// Response the viewer returns for a mock
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockedResponse {
    #[serde(default)]
    pub error_code: Option<i64>,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug)]
struct Entry {
    position: usize,
    mock: Mock,
    regex: Regex,
    hits: u32,
}

impl Entry {
    fn matches(&self, url: &str, method: Option<&str>) -> bool {
        if let (Some(lhs), Some(rhs)) = (method, self.mock.method.as_deref())
            && !lhs.eq_ignore_ascii_case(rhs)
        {
            return false;
        }
        self.regex.is_match(url)
    }

    /// Count a matching request and report whether it falls in the window
    fn hit(&mut self) -> bool {
        self.hits = self.hits.saturating_add(1);
        let skip = self.mock.skip.unwrap_or(0);
        if self.hits <= skip {
            return false;
        }
        match self.mock.count {
            Some(count) => self.hits - skip <= count,
            None => true,
        }
    }
}

/// The client's current mocks
#[derive(Debug, Default)]
pub struct MockRegistry {
    entries: DashMap<Uuid, Entry>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every mock. Mocks with invalid patterns are skipped.
    pub fn replace(&self, mocks: Vec<Mock>) {
        self.entries.clear();
        for (position, mock) in mocks.into_iter().enumerate() {
            let regex = match RegexBuilder::new(&mock.pattern).case_insensitive(true).build() {
                Ok(regex) => regex,
                Err(e) => {
                    warn!(mock_id = %mock.mock_id, error = %e, "Ignoring mock with invalid pattern");
                    continue;
                }
            };
            self.entries.insert(
                mock.mock_id,
                Entry {
                    position,
                    mock,
                    regex,
                    hits: 0,
                },
            );
        }
    }

    /// Mock for a request, counting the hit
    ///
    /// Mocks are tried in the order they were sent.
    pub fn mock_for(&self, url: &str, method: Option<&str>) -> Option<Mock> {
        let mut candidates: Vec<(usize, Uuid)> = self
            .entries
            .iter()
            .filter(|entry| entry.matches(url, method))
            .map(|entry| (entry.position, *entry.key()))
            .collect();
        candidates.sort_unstable();

        for (_, id) in candidates {
            if let Some(mut entry) = self.entries.get_mut(&id)
                && entry.hit()
            {
                return Some(entry.mock.clone());
            }
        }
        None
    }

    /// Current mocks in order
    pub fn mocks(&self) -> Vec<Mock> {
        let mut entries: Vec<(usize, Mock)> = self
            .entries
            .iter()
            .map(|entry| (entry.position, entry.mock.clone()))
            .collect();
        entries.sort_by_key(|(position, _)| *position);
        entries.into_iter().map(|(_, mock)| mock).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_and_method() {
        let registry = MockRegistry::new();
        registry.replace(vec![Mock::new(r"/users/\d+$").with_method("get")]);

        assert!(registry.mock_for("https://API.example.com/USERS/7", Some("GET")).is_some());
        assert!(registry.mock_for("https://api.example.com/users/7", None).is_some());
        assert!(registry.mock_for("https://api.example.com/users/7", Some("POST")).is_none());
        assert!(registry.mock_for("https://api.example.com/users/me", Some("GET")).is_none());
    }

    #[test]
    fn test_skip_and_count() {
        let registry = MockRegistry::new();
        registry.replace(vec![Mock::new("example").with_skip(1).with_count(2)]);

        let hits: Vec<bool> = (0..5)
            .map(|_| registry.mock_for("https://example.com", None).is_some())
            .collect();
        assert_eq!(hits, vec![false, true, true, false, false]);
    }

    #[test]
    fn test_first_mock_in_order_wins() {
        let first = Mock::new("example.com");
        let second = Mock::new(".*");
        let registry = MockRegistry::new();
        registry.replace(vec![first.clone(), second.clone()]);

        assert_eq!(registry.mock_for("https://example.com/a", None), Some(first.clone()));
        assert_eq!(registry.mock_for("https://other.org", None), Some(second.clone()));
        assert_eq!(registry.mocks(), vec![first, second]);
    }

    #[test]
    fn test_replace_drops_previous_and_invalid() {
        let registry = MockRegistry::new();
        registry.replace(vec![Mock::new("a"), Mock::new("b")]);
        assert_eq!(registry.len(), 2);

        registry.replace(vec![Mock::new("("), Mock::new("c")]);
        assert_eq!(registry.len(), 1);
        assert!(registry.mock_for("https://a.com", None).is_none());
    }
}
