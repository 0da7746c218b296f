//! Integration tests for vigil-transport
//!
//! Runs a real session against a viewer server on localhost.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::broadcast;
use vigil_core::{Level, MessageCreated, StoreEvent};
use vigil_transport::{
    ConnectionStatus, DisconnectReason, DiscoveryStatus, Endpoint, KnownServers, ManualDiscovery,
    Mock, MockedResponse, Path, RemoteSession, ServerEvent, SessionConfig, ViewerServer,
    ViewerServerConfig,
};

const TIMEOUT: Duration = Duration::from_secs(5);

async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(TIMEOUT, future)
        .await
        .expect("timed out")
}

fn localhost() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn message(text: &str) -> StoreEvent {
    MessageCreated::new(Level::Info, "test", text).into()
}

async fn next_event(events: &mut broadcast::Receiver<ServerEvent>) -> StoreEvent {
    loop {
        if let ServerEvent::Event { event, .. } = events.recv().await.unwrap() {
            return event;
        }
    }
}

struct Harness {
    events: broadcast::Sender<StoreEvent>,
    discovery: ManualDiscovery,
    session: RemoteSession,
    dir: TempDir,
}

impl Harness {
    fn start(config: SessionConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let (events, rx) = broadcast::channel(256);
        let discovery = ManualDiscovery::new();
        let config = config.with_known_servers_path(dir.path().join("servers.json"));
        let session = RemoteSession::start(config, Arc::new(discovery.clone()), rx).unwrap();
        session.enable().unwrap();
        Self {
            events,
            discovery,
            session,
            dir,
        }
    }

    fn servers_path(&self) -> std::path::PathBuf {
        self.dir.path().join("servers.json")
    }

    async fn wait_connected(&self) {
        within(
            self.session
                .wait_for(|s| s.connection == ConnectionStatus::Connected && !s.is_paused),
        )
        .await
        .unwrap();
    }
}

#[tokio::test]
async fn test_discovered_server_is_connected_automatically() {
    let harness = Harness::start(SessionConfig::default());
    let status = within(
        harness
            .session
            .wait_for(|s| s.discovery == DiscoveryStatus::Searching),
    )
    .await
    .unwrap();
    assert_eq!(status.connection, ConnectionStatus::Disconnected);
    assert!(harness.session.known_servers().is_empty());

    let server = ViewerServer::bind(localhost(), ViewerServerConfig::new("Mac-1"))
        .await
        .unwrap();
    harness
        .discovery
        .announce(Endpoint::new("Mac-1", server.local_addr()));

    harness.wait_connected().await;
    let status = harness.session.status();
    assert_eq!(status.server.as_deref(), Some("Mac-1"));
    assert_eq!(status.discovered, vec!["Mac-1"]);
    assert_eq!(harness.session.known_servers(), vec!["Mac-1"]);
    assert_eq!(
        KnownServers::load(harness.servers_path()).unwrap().names(),
        vec!["Mac-1"]
    );
    assert_eq!(server.clients().len(), 1);
}

#[tokio::test]
async fn test_events_flow_with_pause_and_resume() {
    let harness = Harness::start(SessionConfig::default());
    // Sent before any server exists; held during the grace period
    let early = message("early");
    harness.events.send(early.clone()).unwrap();

    let server = ViewerServer::bind(localhost(), ViewerServerConfig::new("Mac-1"))
        .await
        .unwrap();
    let mut server_events = server.subscribe();
    harness
        .discovery
        .announce(Endpoint::new("Mac-1", server.local_addr()));
    harness.wait_connected().await;

    assert_eq!(within(next_event(&mut server_events)).await, early);

    let live = message("live");
    harness.events.send(live.clone()).unwrap();
    assert_eq!(within(next_event(&mut server_events)).await, live);

    server.pause();
    within(harness.session.wait_for(|s| s.is_paused)).await.unwrap();
    let held = message("held");
    harness.events.send(held.clone()).unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(200), next_event(&mut server_events))
            .await
            .is_err()
    );

    server.resume();
    assert_eq!(within(next_event(&mut server_events)).await, held);
}

#[tokio::test]
async fn test_mocks_and_mocked_responses() {
    let harness = Harness::start(SessionConfig::default());
    let server = ViewerServer::bind(localhost(), ViewerServerConfig::new("Mac-1"))
        .await
        .unwrap();
    harness
        .discovery
        .announce(Endpoint::new("Mac-1", server.local_addr()));
    harness.wait_connected().await;

    let mock = Mock::new(r"/users/\d+").with_method("GET");
    let response = MockedResponse {
        status_code: Some(200),
        body: Some(r#"{"name":"Alice"}"#.to_string()),
        ..Default::default()
    };
    server.set_mocked_response(mock.mock_id, response.clone());
    let client = server.clients()[0].id;
    assert!(server.update_mocks(client, &[mock.clone()]).unwrap());

    within(async {
        while harness.session.mocks().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    let matched = harness
        .session
        .mocks()
        .mock_for("https://api.example.com/users/42", Some("GET"));
    assert_eq!(matched, Some(mock.clone()));

    assert_eq!(
        within(harness.session.get_mocked_response(mock.mock_id)).await,
        Some(response)
    );
    assert_eq!(
        within(harness.session.get_mocked_response(uuid::Uuid::new_v4())).await,
        None
    );
}

#[tokio::test]
async fn test_requests_without_connection_resolve_to_none() {
    let harness = Harness::start(SessionConfig::default());
    let reply = within(harness.session.request(Path::OpenTaskDetails, Vec::new())).await;
    assert!(reply.is_none());
}

#[tokio::test]
async fn test_passcode_is_required() {
    let harness = Harness::start(SessionConfig::default());
    let server = ViewerServer::bind(
        localhost(),
        ViewerServerConfig::new("Mac-1").with_passcode("1234"),
    )
    .await
    .unwrap();
    let endpoint = Endpoint::new("Mac-1", server.local_addr());
    harness.discovery.announce(endpoint.clone());

    let status = within(harness.session.wait_for(|s| {
        s.last_error == Some(DisconnectReason::AuthenticationRequired)
    }))
    .await
    .unwrap();
    assert_eq!(status.connection, ConnectionStatus::Disconnected);
    assert!(harness.session.known_servers().is_empty());

    harness
        .session
        .connect(endpoint, Some("1234".to_string()))
        .unwrap();
    harness.wait_connected().await;
    let known = KnownServers::load(harness.servers_path()).unwrap();
    assert_eq!(known.credential("Mac-1"), Some("1234"));
}

#[tokio::test]
async fn test_reconnects_after_server_restart() {
    let config = SessionConfig::default().with_reconnect_delay(Duration::from_millis(100));
    let harness = Harness::start(config);
    let server = ViewerServer::bind(localhost(), ViewerServerConfig::new("Mac-1"))
        .await
        .unwrap();
    harness
        .discovery
        .announce(Endpoint::new("Mac-1", server.local_addr()));
    harness.wait_connected().await;

    server.shutdown();
    let status = within(
        harness
            .session
            .wait_for(|s| s.connection == ConnectionStatus::Disconnected),
    )
    .await
    .unwrap();
    assert!(matches!(
        status.last_error,
        Some(DisconnectReason::PeerClosed(_))
    ));
    drop(server);

    let restarted = ViewerServer::bind(localhost(), ViewerServerConfig::new("Mac-1"))
        .await
        .unwrap();
    harness
        .discovery
        .announce(Endpoint::new("Mac-1", restarted.local_addr()));
    harness.wait_connected().await;
    assert_eq!(harness.session.known_servers(), vec!["Mac-1"]);
}

#[tokio::test]
async fn test_disable_disconnects() {
    let harness = Harness::start(SessionConfig::default());
    let server = ViewerServer::bind(localhost(), ViewerServerConfig::new("Mac-1"))
        .await
        .unwrap();
    let mut server_events = server.subscribe();
    harness
        .discovery
        .announce(Endpoint::new("Mac-1", server.local_addr()));
    harness.wait_connected().await;

    harness.session.disable().unwrap();
    let status = within(harness.session.wait_for(|s| !s.is_enabled))
        .await
        .unwrap();
    assert_eq!(status.connection, ConnectionStatus::Disconnected);
    assert_eq!(status.discovery, DiscoveryStatus::Idle);

    within(async {
        loop {
            if let ServerEvent::ClientDisconnected { .. } = server_events.recv().await.unwrap() {
                break;
            }
        }
    })
    .await;
    harness.session.shutdown().await;
}

#[tokio::test]
async fn test_pause_queue_drops_oldest_when_full() {
    let harness = Harness::start(SessionConfig::default().with_pause_queue_capacity(2));
    let server = ViewerServer::bind(localhost(), ViewerServerConfig::new("Mac-1"))
        .await
        .unwrap();
    let mut server_events = server.subscribe();
    harness
        .discovery
        .announce(Endpoint::new("Mac-1", server.local_addr()));
    harness.wait_connected().await;

    server.pause();
    within(harness.session.wait_for(|s| s.is_paused)).await.unwrap();
    let held: Vec<StoreEvent> = ["first", "second", "third"].map(message).to_vec();
    for event in &held {
        harness.events.send(event.clone()).unwrap();
    }
    // Let the session queue all three before resuming
    tokio::time::sleep(Duration::from_millis(100)).await;

    server.resume();
    assert_eq!(within(next_event(&mut server_events)).await, held[1]);
    assert_eq!(within(next_event(&mut server_events)).await, held[2]);

    let after = message("after");
    harness.events.send(after.clone()).unwrap();
    assert_eq!(within(next_event(&mut server_events)).await, after);
}

#[tokio::test]
async fn test_disconnect_resolves_outstanding_requests() {
    let harness = Harness::start(SessionConfig::default());
    let server = ViewerServer::bind(localhost(), ViewerServerConfig::new("Mac-1"))
        .await
        .unwrap();
    harness
        .discovery
        .announce(Endpoint::new("Mac-1", server.local_addr()));
    harness.wait_connected().await;

    // The server never answers this path
    let session = harness.session.clone();
    let reply = tokio::spawn(async move { session.request(Path::OpenTaskDetails, Vec::new()).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!reply.is_finished());

    server.shutdown();
    let reply = tokio::time::timeout(Duration::from_secs(2), reply)
        .await
        .expect("request outlived the connection")
        .unwrap();
    assert!(reply.is_none());
}
