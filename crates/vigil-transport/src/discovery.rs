//! Endpoint discovery
//!
//! A [`Discovery`] yields named endpoints as they appear and disappear. Two
//! implementations ship with the crate: [`StaticDiscovery`] for a fixed
//! list and [`ManualDiscovery`] for endpoints announced at runtime.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// A named server endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    pub address: SocketAddr,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, address: SocketAddr) -> Self {
        Self {
            name: name.into(),
            address,
        }
    }
}

/// Events emitted by discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// An endpoint appeared or changed address
    Found(Endpoint),
    /// An endpoint went away
    Lost(String),
}

/// Errors in endpoint discovery
#[derive(Debug, Clone, Error)]
pub enum DiscoveryError {
    #[error("Discovery failed to start: {0}")]
    StartFailed(String),

    #[error("Discovery is unavailable")]
    Unavailable,
}

/// Source of server endpoints
#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    /// Start browsing. Endpoints already known are reported first.
    ///
    /// The stream ends when discovery fails or is stopped.
    async fn start(&self) -> Result<mpsc::UnboundedReceiver<DiscoveryEvent>, DiscoveryError>;

    /// Stop browsing and end every stream handed out by `start`
    async fn stop(&self);
}

/// Discovery over a fixed list of endpoints
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    endpoints: Vec<Endpoint>,
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<DiscoveryEvent>>>>,
}

impl StaticDiscovery {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self {
            endpoints,
            subscribers: Arc::default(),
        }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn start(&self) -> Result<mpsc::UnboundedReceiver<DiscoveryEvent>, DiscoveryError> {
        let (tx, rx) = mpsc::unbounded_channel();
        for endpoint in &self.endpoints {
            let _ = tx.send(DiscoveryEvent::Found(endpoint.clone()));
        }
        // The stream stays open until stopped
        self.subscribers.lock().push(tx);
        Ok(rx)
    }

    async fn stop(&self) {
        self.subscribers.lock().clear();
    }
}

#[derive(Debug, Default)]
struct ManualState {
    endpoints: Vec<Endpoint>,
    subscribers: Vec<mpsc::UnboundedSender<DiscoveryEvent>>,
}

/// Discovery fed by explicit [`announce`](Self::announce) and
/// [`withdraw`](Self::withdraw) calls
#[derive(Debug, Clone, Default)]
pub struct ManualDiscovery {
    state: Arc<Mutex<ManualState>>,
}

impl ManualDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make an endpoint visible, replacing one with the same name
    pub fn announce(&self, endpoint: Endpoint) {
        let mut state = self.state.lock();
        state.endpoints.retain(|e| e.name != endpoint.name);
        state.endpoints.push(endpoint.clone());
        debug!(name = %endpoint.name, address = %endpoint.address, "Endpoint announced");
        state
            .subscribers
            .retain(|tx| tx.send(DiscoveryEvent::Found(endpoint.clone())).is_ok());
    }

    pub fn withdraw(&self, name: &str) {
        let mut state = self.state.lock();
        let before = state.endpoints.len();
        state.endpoints.retain(|e| e.name != name);
        if state.endpoints.len() == before {
            return;
        }
        state
            .subscribers
            .retain(|tx| tx.send(DiscoveryEvent::Lost(name.to_string())).is_ok());
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.state.lock().endpoints.clone()
    }
}

#[async_trait]
impl Discovery for ManualDiscovery {
    async fn start(&self) -> Result<mpsc::UnboundedReceiver<DiscoveryEvent>, DiscoveryError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        for endpoint in &state.endpoints {
            let _ = tx.send(DiscoveryEvent::Found(endpoint.clone()));
        }
        state.subscribers.push(tx);
        Ok(rx)
    }

    async fn stop(&self) {
        self.state.lock().subscribers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(name: &str, port: u16) -> Endpoint {
        Endpoint::new(name, SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[tokio::test]
    async fn test_static_discovery_reports_all() {
        let discovery = StaticDiscovery::new(vec![endpoint("a", 1), endpoint("b", 2)]);
        let mut rx = discovery.start().await.unwrap();
        assert_eq!(rx.recv().await, Some(DiscoveryEvent::Found(endpoint("a", 1))));
        assert_eq!(rx.recv().await, Some(DiscoveryEvent::Found(endpoint("b", 2))));
    }

    #[tokio::test]
    async fn test_manual_discovery_replays_and_streams() {
        let discovery = ManualDiscovery::new();
        discovery.announce(endpoint("Mac-1", 1));

        let mut rx = discovery.start().await.unwrap();
        assert_eq!(rx.recv().await, Some(DiscoveryEvent::Found(endpoint("Mac-1", 1))));

        discovery.announce(endpoint("Mac-1", 2));
        discovery.withdraw("Mac-1");
        discovery.withdraw("Mac-1");
        assert_eq!(rx.recv().await, Some(DiscoveryEvent::Found(endpoint("Mac-1", 2))));
        assert_eq!(rx.recv().await, Some(DiscoveryEvent::Lost("Mac-1".into())));

        discovery.stop().await;
        assert_eq!(rx.recv().await, None);
    }
}
