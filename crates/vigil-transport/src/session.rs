//! Remote session
//!
//! [`RemoteSession`] streams store events to a viewer. It runs as an actor
//! task that owns discovery, the current connection and every timer; the
//! handle only sends commands and reads status from a `watch` channel.
//!
//! ## Lifecycle
//!
//! ```text
//! Disconnected -> Connecting -> (transport ready, clientHello sent)
//!              -> Connected   (serverHello received, pings every 2s)
//!              -> Disconnected (failure or timeout, retry after 5s)
//! ```
//!
//! Events are held in a bounded queue while the viewer has the session
//! paused, which it is until the viewer sends `resume`.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;
use vigil_core::{AppInfo, Session, StoreEvent};

use crate::codec::DEFAULT_MAX_FRAME_SIZE;
use crate::connection::{
    ConnectionEvent, ConnectionState, Connector, StreamConnection, TcpConnector,
};
use crate::discovery::{Discovery, DiscoveryEvent, Endpoint};
use crate::known_servers::KnownServers;
use crate::mocks::{MockRegistry, MockedResponse};
use crate::protocol::{
    self, ClientHello, HelloError, Message, PacketCode, Path, ServerHello, encode_event,
};

/// Configuration for a remote session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Client ping interval in milliseconds
    pub ping_interval_ms: u64,
    /// Disconnect when no server ping arrives within this many milliseconds
    pub server_ping_timeout_ms: u64,
    /// Time allowed for `serverHello` after the transport is ready
    pub handshake_timeout_ms: u64,
    /// Time allowed for the transport to become ready
    pub connect_timeout_ms: u64,
    /// Delay before reconnecting after a failure
    pub reconnect_delay_ms: u64,
    /// Delay before restarting failed discovery
    pub discovery_retry_ms: u64,
    /// Events are queued this long after start even without a connection
    pub grace_period_ms: u64,
    /// Time to wait for a reply to [`RemoteSession::request`]
    pub request_timeout_ms: u64,
    /// Events kept while paused; the oldest are dropped beyond this
    pub pause_queue_capacity: usize,
    /// Connect to the first endpoint found when no server is known yet
    pub connect_to_first_discovered: bool,
    /// Where the known-servers list is persisted
    pub known_servers_path: Option<PathBuf>,
    pub max_frame_size: usize,
    /// Reported in `clientHello`
    pub device_id: Uuid,
    pub app_info: AppInfo,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: 2_000,
            server_ping_timeout_ms: 5_000,
            handshake_timeout_ms: 10_000,
            connect_timeout_ms: 5_000,
            reconnect_delay_ms: 5_000,
            discovery_retry_ms: 5_000,
            grace_period_ms: 3_000,
            request_timeout_ms: 20_000,
            pause_queue_capacity: 10_000,
            connect_to_first_discovered: true,
            known_servers_path: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            device_id: Uuid::new_v4(),
            app_info: AppInfo::default(),
        }
    }
}

impl SessionConfig {
    pub fn with_known_servers_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_servers_path = Some(path.into());
        self
    }

    pub fn with_connect_to_first_discovered(mut self, enabled: bool) -> Self {
        self.connect_to_first_discovered = enabled;
        self
    }

    pub fn with_pause_queue_capacity(mut self, capacity: usize) -> Self {
        self.pause_queue_capacity = capacity;
        self
    }

    pub fn with_app_info(mut self, app_info: AppInfo) -> Self {
        self.app_info = app_info;
        self
    }

    pub fn with_device_id(mut self, device_id: Uuid) -> Self {
        self.device_id = device_id;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }
}

/// Errors from session operations
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("Session task has stopped")]
    Closed,

    #[error("Not connected")]
    NotConnected,

    #[error("Persistence error: {0}")]
    Persistence(String),
}

/// Why the session last lost (or failed to get) a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DisconnectReason {
    NoServersFound,
    ConnectFailed(String),
    HandshakeTimeout,
    PingTimeout,
    PeerClosed(String),
    AuthenticationRequired,
}

impl DisconnectReason {
    /// Whether retrying the same server can help
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::AuthenticationRequired)
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoServersFound => write!(f, "no servers found"),
            Self::ConnectFailed(reason) => write!(f, "connection failed: {reason}"),
            Self::HandshakeTimeout => write!(f, "the handshake with the server timed out"),
            Self::PingTimeout => write!(f, "no pings from the server"),
            Self::PeerClosed(reason) => write!(f, "server closed the connection: {reason}"),
            Self::AuthenticationRequired => write!(f, "the server requires a passcode"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DiscoveryStatus {
    #[default]
    Idle,
    Searching,
}

/// Observable state of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub is_enabled: bool,
    pub connection: ConnectionStatus,
    pub discovery: DiscoveryStatus,
    /// Server being connected to or connected to
    pub server: Option<String>,
    pub server_version: Option<String>,
    pub is_paused: bool,
    /// Names of the endpoints currently discovered
    pub discovered: Vec<String>,
    pub last_error: Option<DisconnectReason>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            is_enabled: false,
            connection: ConnectionStatus::Disconnected,
            discovery: DiscoveryStatus::Idle,
            server: None,
            server_version: None,
            is_paused: true,
            discovered: Vec::new(),
            last_error: None,
        }
    }
}

type Reply = oneshot::Sender<Option<Vec<u8>>>;

enum Command {
    Enable,
    Disable,
    Connect {
        endpoint: Endpoint,
        credential: Option<String>,
    },
    Request {
        id: u32,
        path: Path,
        data: Vec<u8>,
    },
    SetSession(Option<Session>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running remote session
#[derive(Clone)]
pub struct RemoteSession {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SessionStatus>,
    known_servers: Arc<RwLock<KnownServers>>,
    mocks: Arc<MockRegistry>,
    pending: Arc<DashMap<u32, Reply>>,
    next_request_id: Arc<AtomicU32>,
    request_timeout: Duration,
}

impl std::fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSession")
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl RemoteSession {
    /// Start a session over TCP
    ///
    /// `events` is a subscription to the store's event bus. The session
    /// starts disabled; call [`enable`](Self::enable) to begin discovery.
    pub fn start(
        config: SessionConfig,
        discovery: Arc<dyn Discovery>,
        events: broadcast::Receiver<StoreEvent>,
    ) -> Result<Self, SessionError> {
        Self::with_connector(config, discovery, Arc::new(TcpConnector), events)
    }

    /// Start a session with a custom stream connector
    pub fn with_connector(
        config: SessionConfig,
        discovery: Arc<dyn Discovery>,
        connector: Arc<dyn Connector>,
        events: broadcast::Receiver<StoreEvent>,
    ) -> Result<Self, SessionError> {
        let known_servers = match &config.known_servers_path {
            Some(path) => KnownServers::load(path)?,
            None => KnownServers::new(),
        };
        let known_servers = Arc::new(RwLock::new(known_servers));
        let mocks = Arc::new(MockRegistry::new());
        let pending = Arc::new(DashMap::new());
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(SessionStatus::default());
        let (connection_tx, connection_rx) = mpsc::unbounded_channel();
        let request_timeout = SessionConfig::ms(config.request_timeout_ms);

        let now = Instant::now();
        let actor = SessionActor {
            grace_until: now + SessionConfig::ms(config.grace_period_ms),
            config,
            discovery,
            connector,
            known_servers: known_servers.clone(),
            mocks: mocks.clone(),
            pending: pending.clone(),
            status: status_tx,
            state: SessionStatus::default(),
            session: None,
            discovery_rx: None,
            discovered: Vec::new(),
            connection: None,
            connection_id: 0,
            connection_tx,
            endpoint: None,
            credential: None,
            queue: VecDeque::new(),
            timers: Timers::default(),
        };
        tokio::spawn(actor.run(commands_rx, connection_rx, events));

        Ok(Self {
            commands,
            status,
            known_servers,
            mocks,
            pending,
            next_request_id: Arc::new(AtomicU32::new(1)),
            request_timeout,
        })
    }

    fn send(&self, command: Command) -> Result<(), SessionError> {
        self.commands.send(command).map_err(|_| SessionError::Closed)
    }

    /// Start discovery and connect automatically
    pub fn enable(&self) -> Result<(), SessionError> {
        self.send(Command::Enable)
    }

    /// Stop discovery and disconnect
    pub fn disable(&self) -> Result<(), SessionError> {
        self.send(Command::Disable)
    }

    /// Connect to a specific endpoint, replacing any current connection
    pub fn connect(&self, endpoint: Endpoint, credential: Option<String>) -> Result<(), SessionError> {
        self.send(Command::Connect {
            endpoint,
            credential,
        })
    }

    /// Session reported in the next `clientHello`
    pub fn set_session(&self, session: Option<Session>) -> Result<(), SessionError> {
        self.send(Command::SetSession(session))
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Wait until the status satisfies `f`
    pub async fn wait_for(
        &self,
        f: impl FnMut(&SessionStatus) -> bool,
    ) -> Result<SessionStatus, SessionError> {
        let mut status = self.status.clone();
        let result = status.wait_for(f).await.map_err(|_| SessionError::Closed)?;
        Ok((*result).clone())
    }

    /// Known servers, most recent first
    pub fn known_servers(&self) -> Vec<String> {
        self.known_servers.read().names()
    }

    pub fn mocks(&self) -> &MockRegistry {
        &self.mocks
    }

    /// Send a request to the viewer and wait for its reply
    ///
    /// Resolves to `None` when not connected, on disconnect or after the
    /// request timeout.
    pub async fn request(&self, path: Path, data: Vec<u8>) -> Option<Vec<u8>> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        if self.send(Command::Request { id, path, data }).is_err() {
            self.pending.remove(&id);
            return None;
        }
        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => None,
            Err(_) => {
                debug!(id, "Request timed out");
                self.pending.remove(&id);
                None
            }
        }
    }

    /// Ask the viewer for the response of a mock
    pub async fn get_mocked_response(&self, mock_id: Uuid) -> Option<MockedResponse> {
        let data = self
            .request(Path::GetMockedResponse { mock_id }, Vec::new())
            .await?;
        match serde_json::from_slice::<Option<MockedResponse>>(&data) {
            Ok(response) => response,
            Err(e) => {
                warn!(%mock_id, error = %e, "Invalid mocked response");
                None
            }
        }
    }

    /// Stop the session task
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.send(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Deadlines owned by the actor. `None` means not armed.
#[derive(Debug, Default)]
struct Timers {
    discovery_retry: Option<Instant>,
    connect: Option<Instant>,
    handshake: Option<Instant>,
    ping: Option<Instant>,
    server_ping: Option<Instant>,
    reconnect: Option<Instant>,
}

impl Timers {
    fn next(&self) -> Option<Instant> {
        [
            self.discovery_retry,
            self.connect,
            self.handshake,
            self.ping,
            self.server_ping,
            self.reconnect,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn cancel_connection(&mut self) {
        self.connect = None;
        self.handshake = None;
        self.ping = None;
        self.server_ping = None;
    }
}

/// Take a deadline if it has passed
fn expired(deadline: &mut Option<Instant>, now: Instant) -> bool {
    match *deadline {
        Some(at) if at <= now => {
            *deadline = None;
            true
        }
        _ => false,
    }
}

struct SessionActor {
    config: SessionConfig,
    discovery: Arc<dyn Discovery>,
    connector: Arc<dyn Connector>,
    known_servers: Arc<RwLock<KnownServers>>,
    mocks: Arc<MockRegistry>,
    pending: Arc<DashMap<u32, Reply>>,
    status: watch::Sender<SessionStatus>,
    state: SessionStatus,
    session: Option<Session>,
    discovery_rx: Option<mpsc::UnboundedReceiver<DiscoveryEvent>>,
    discovered: Vec<Endpoint>,
    connection: Option<StreamConnection>,
    connection_id: u64,
    connection_tx: mpsc::UnboundedSender<(u64, ConnectionEvent)>,
    /// Last endpoint connected to; retried after failures
    endpoint: Option<Endpoint>,
    credential: Option<String>,
    queue: VecDeque<StoreEvent>,
    grace_until: Instant,
    timers: Timers,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut connection_events: mpsc::UnboundedReceiver<(u64, ConnectionEvent)>,
        events: broadcast::Receiver<StoreEvent>,
    ) {
        let mut events = Some(events);
        loop {
            let next_deadline = self.timers.next();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        self.disable().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.disable().await;
                        break;
                    }
                },
                event = async {
                    match self.discovery_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                }, if self.discovery_rx.is_some() => match event {
                    Some(event) => self.handle_discovery_event(event),
                    None => self.discovery_stopped(),
                },
                Some((id, event)) = connection_events.recv() => {
                    if id == self.connection_id && self.connection.is_some() {
                        self.handle_connection_event(event);
                    } else {
                        trace!(id, "Ignoring event from a replaced connection");
                    }
                }
                event = async {
                    match events.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                }, if events.is_some() => match event {
                    Ok(event) => self.handle_store_event(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Remote session fell behind the store, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Store event bus closed");
                        events = None;
                    }
                },
                _ = async {
                    if let Some(deadline) = next_deadline {
                        tokio::time::sleep_until(deadline).await;
                    }
                }, if next_deadline.is_some() => self.handle_timers().await,
            }
            self.publish();
        }
        self.publish();
        debug!("Remote session stopped");
    }

    fn publish(&mut self) {
        self.state.discovered = self.discovered.iter().map(|e| e.name.clone()).collect();
        self.status.send_if_modified(|status| {
            if *status == self.state {
                false
            } else {
                *status = self.state.clone();
                true
            }
        });
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Enable => self.enable().await,
            Command::Disable => self.disable().await,
            Command::Connect {
                endpoint,
                credential,
            } => {
                let credential = credential.or_else(|| {
                    self.known_servers
                        .read()
                        .credential(&endpoint.name)
                        .map(str::to_string)
                });
                self.timers.reconnect = None;
                self.open_connection(endpoint, credential);
            }
            Command::Request { id, path, data } => self.send_request(id, path, data),
            Command::SetSession(session) => self.session = session,
            Command::Shutdown(_) => {}
        }
    }

    async fn enable(&mut self) {
        if self.state.is_enabled {
            return;
        }
        info!("Remote logging enabled");
        self.state.is_enabled = true;
        self.start_discovery().await;
    }

    async fn disable(&mut self) {
        if !self.state.is_enabled && self.connection.is_none() {
            return;
        }
        info!("Remote logging disabled");
        self.state.is_enabled = false;
        self.discovery.stop().await;
        self.discovery_rx = None;
        self.discovered.clear();
        self.state.discovery = DiscoveryStatus::Idle;
        self.timers.discovery_retry = None;
        self.timers.reconnect = None;
        self.cancel_connection();
        self.state.server = None;
    }

    // Discovery

    async fn start_discovery(&mut self) {
        if !self.state.is_enabled || self.discovery_rx.is_some() {
            return;
        }
        match self.discovery.start().await {
            Ok(rx) => {
                debug!("Discovery started");
                self.discovery_rx = Some(rx);
                self.state.discovery = DiscoveryStatus::Searching;
            }
            Err(e) => {
                warn!(error = %e, "Discovery failed, retrying");
                self.state.discovery = DiscoveryStatus::Idle;
                self.timers.discovery_retry =
                    Some(Instant::now() + SessionConfig::ms(self.config.discovery_retry_ms));
            }
        }
    }

    fn discovery_stopped(&mut self) {
        self.discovery_rx = None;
        self.discovered.clear();
        self.state.discovery = DiscoveryStatus::Idle;
        if self.state.is_enabled {
            warn!("Discovery stopped, retrying");
            self.timers.discovery_retry =
                Some(Instant::now() + SessionConfig::ms(self.config.discovery_retry_ms));
        }
    }

    fn handle_discovery_event(&mut self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Found(endpoint) => {
                debug!(name = %endpoint.name, address = %endpoint.address, "Endpoint found");
                match self.discovered.iter_mut().find(|e| e.name == endpoint.name) {
                    Some(existing) => *existing = endpoint,
                    None => self.discovered.push(endpoint),
                }
                self.connect_automatically_if_needed();
            }
            DiscoveryEvent::Lost(name) => {
                debug!(%name, "Endpoint lost");
                self.discovered.retain(|e| e.name != name);
            }
        }
    }

    /// Pick the most recently used known server that is visible, or the
    /// first visible endpoint when no server is known yet
    fn connect_automatically_if_needed(&mut self) {
        if !self.state.is_enabled
            || self.state.connection != ConnectionStatus::Disconnected
            || self.timers.reconnect.is_some()
        {
            return;
        }
        let target = {
            let known = self.known_servers.read();
            if known.is_empty() {
                if self.config.connect_to_first_discovered {
                    self.discovered.first().map(|e| (e.clone(), None))
                } else {
                    None
                }
            } else {
                known.servers().iter().find_map(|server| {
                    self.discovered
                        .iter()
                        .find(|e| e.name == server.name)
                        .map(|e| (e.clone(), server.credential.clone()))
                })
            }
        };
        if let Some((endpoint, credential)) = target {
            info!(name = %endpoint.name, "Connecting automatically");
            self.open_connection(endpoint, credential);
        }
    }

    // Connection

    fn open_connection(&mut self, endpoint: Endpoint, credential: Option<String>) {
        self.cancel_connection();
        self.connection_id += 1;
        debug!(name = %endpoint.name, id = self.connection_id, "Opening connection");

        self.connection = Some(StreamConnection::connect(
            self.connector.clone(),
            endpoint.clone(),
            self.connection_id,
            self.config.max_frame_size,
            self.connection_tx.clone(),
        ));
        self.state.connection = ConnectionStatus::Connecting;
        self.state.server = Some(endpoint.name.clone());
        self.state.server_version = None;
        self.endpoint = Some(endpoint);
        self.credential = credential;
        self.timers.connect =
            Some(Instant::now() + SessionConfig::ms(self.config.connect_timeout_ms));
    }

    fn cancel_connection(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.cancel();
        }
        self.timers.cancel_connection();
        self.state.connection = ConnectionStatus::Disconnected;
        self.state.is_paused = true;
        self.drain_pending();
    }

    /// Resolve every outstanding request with `None`
    fn drain_pending(&mut self) {
        let ids: Vec<u32> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, reply)) = self.pending.remove(&id) {
                let _ = reply.send(None);
            }
        }
    }

    /// Drop the connection and retry later
    fn schedule_reconnect(&mut self, reason: DisconnectReason) {
        warn!(%reason, server = ?self.state.server, "Disconnected");
        self.cancel_connection();
        if self.state.is_enabled && reason.is_retryable() {
            self.timers.reconnect =
                Some(Instant::now() + SessionConfig::ms(self.config.reconnect_delay_ms));
        }
        self.state.last_error = Some(reason);
    }

    fn reconnect(&mut self) {
        if !self.state.is_enabled {
            return;
        }
        let visible = self.endpoint.as_ref().and_then(|last| {
            self.discovered
                .iter()
                .find(|e| e.name == last.name)
                .cloned()
        });
        match visible {
            Some(endpoint) => {
                let credential = self.credential.clone();
                self.open_connection(endpoint, credential);
            }
            None => {
                debug!("Last server not visible, waiting for discovery");
                if self.discovered.is_empty() {
                    self.state.last_error = Some(DisconnectReason::NoServersFound);
                }
                self.connect_automatically_if_needed();
            }
        }
    }

    fn send_packet(&mut self, code: PacketCode, body: &[u8]) {
        let Some(connection) = &self.connection else {
            return;
        };
        if let Err(e) = connection.send(code.as_u8(), body) {
            debug!(?code, error = %e, "Send failed");
        }
    }

    fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::State(ConnectionState::Connecting) => {}
            ConnectionEvent::State(ConnectionState::Ready) => self.handshake(),
            ConnectionEvent::State(ConnectionState::Failed(reason)) => {
                let reason = match self.state.connection {
                    ConnectionStatus::Connected => DisconnectReason::PeerClosed(reason),
                    _ => DisconnectReason::ConnectFailed(reason),
                };
                self.schedule_reconnect(reason);
            }
            ConnectionEvent::State(ConnectionState::Cancelled) => {}
            ConnectionEvent::Frame(frame) => match PacketCode::try_from(frame.code) {
                Ok(code) => self.handle_packet(code, &frame.body),
                Err(e) => warn!(error = %e, "Invalid packet from the server"),
            },
        }
    }

    fn handshake(&mut self) {
        debug!("Transport ready, sending hello");
        self.timers.connect = None;
        let mut hello = ClientHello::new(self.config.device_id, self.config.app_info.clone());
        hello.session = self.session;
        hello.credential = self.credential.clone();
        match protocol::to_json(&hello) {
            Ok(body) => self.send_packet(PacketCode::ClientHello, &body),
            Err(e) => warn!(error = %e, "Failed to encode hello"),
        }
        self.timers.handshake =
            Some(Instant::now() + SessionConfig::ms(self.config.handshake_timeout_ms));
    }

    fn handle_packet(&mut self, code: PacketCode, body: &[u8]) {
        trace!(?code, "Packet received");
        match code {
            PacketCode::ServerHello => self.server_hello(body),
            PacketCode::Pause => {
                debug!("Paused by the viewer");
                self.state.is_paused = true;
            }
            PacketCode::Resume => {
                debug!(queued = self.queue.len(), "Resumed by the viewer");
                self.state.is_paused = false;
                self.flush_queue();
            }
            PacketCode::Ping => {
                if self.state.connection == ConnectionStatus::Connected {
                    self.timers.server_ping = Some(
                        Instant::now() + SessionConfig::ms(self.config.server_ping_timeout_ms),
                    );
                }
            }
            PacketCode::UpdateMocks => self.update_mocks(body),
            PacketCode::Message | PacketCode::GetMockedResponse => match Message::decode(body) {
                Ok(message) => self.handle_message(message),
                Err(e) => warn!(error = %e, "Invalid message from the server"),
            },
            other => warn!(code = ?other, "Unexpected packet from the server"),
        }
    }

    fn server_hello(&mut self, body: &[u8]) {
        if self.state.connection == ConnectionStatus::Connected {
            return;
        }
        let hello: ServerHello = match protocol::from_json(body) {
            Ok(hello) => hello,
            Err(e) => {
                warn!(error = %e, "Invalid serverHello");
                return;
            }
        };
        if hello.error == Some(HelloError::AuthenticationRequired) {
            self.schedule_reconnect(DisconnectReason::AuthenticationRequired);
            return;
        }

        let now = Instant::now();
        self.timers.connect = None;
        self.timers.handshake = None;
        self.timers.ping = Some(now);
        self.timers.server_ping = Some(now + SessionConfig::ms(self.config.server_ping_timeout_ms));
        self.state.connection = ConnectionStatus::Connected;
        self.state.server_version = Some(hello.version.clone());
        self.state.last_error = None;

        if let Some(endpoint) = &self.endpoint {
            info!(name = %endpoint.name, version = %hello.version, "Connected to server");
            let mut known = self.known_servers.write();
            known.remember(&endpoint.name, self.credential.clone());
            if let Err(e) = known.save() {
                warn!(error = %e, "Failed to save known servers");
            }
        }
        if !self.state.is_paused {
            self.flush_queue();
        }
    }

    fn update_mocks(&mut self, body: &[u8]) {
        match protocol::from_json(body) {
            Ok(mocks) => {
                self.mocks.replace(mocks);
                debug!(count = self.mocks.len(), "Mocks updated");
            }
            Err(e) => warn!(error = %e, "Invalid mocks"),
        }
    }

    fn handle_message(&mut self, message: Message) {
        if message.is_response {
            match self.pending.remove(&message.id) {
                Some((_, reply)) => {
                    let _ = reply.send(Some(message.data));
                }
                None => debug!(id = message.id, "Response to an unknown request"),
            }
            return;
        }
        match message.path {
            Path::UpdateMocks => self.update_mocks(&message.data),
            other => debug!(path = ?other, "Ignoring message"),
        }
    }

    fn send_request(&mut self, id: u32, path: Path, data: Vec<u8>) {
        if self.state.connection != ConnectionStatus::Connected {
            if let Some((_, reply)) = self.pending.remove(&id) {
                let _ = reply.send(None);
            }
            return;
        }
        match Message::request(id, path, data).encode() {
            Ok(body) => self.send_packet(PacketCode::Message, &body),
            Err(e) => {
                warn!(error = %e, "Failed to encode request");
                if let Some((_, reply)) = self.pending.remove(&id) {
                    let _ = reply.send(None);
                }
            }
        }
    }

    // Events

    fn handle_store_event(&mut self, event: StoreEvent) {
        if self.state.connection == ConnectionStatus::Connected && !self.state.is_paused {
            self.send_event(&event);
        } else if Instant::now() < self.grace_until || self.connection.is_some() {
            if self.queue.len() >= self.config.pause_queue_capacity {
                self.queue.pop_front();
            }
            if self.config.pause_queue_capacity > 0 {
                self.queue.push_back(event);
            }
        }
    }

    fn send_event(&mut self, event: &StoreEvent) {
        match encode_event(event) {
            Ok((code, body)) => self.send_packet(code, &body),
            Err(e) => warn!(kind = event.kind(), error = %e, "Failed to encode event"),
        }
    }

    fn flush_queue(&mut self) {
        if self.state.connection != ConnectionStatus::Connected {
            return;
        }
        while let Some(event) = self.queue.pop_front() {
            self.send_event(&event);
        }
    }

    async fn handle_timers(&mut self) {
        let now = Instant::now();
        if expired(&mut self.timers.discovery_retry, now) {
            self.start_discovery().await;
        }
        if expired(&mut self.timers.connect, now) {
            self.schedule_reconnect(DisconnectReason::ConnectFailed("timed out".to_string()));
        }
        if expired(&mut self.timers.handshake, now) {
            self.schedule_reconnect(DisconnectReason::HandshakeTimeout);
        }
        if expired(&mut self.timers.server_ping, now) {
            self.schedule_reconnect(DisconnectReason::PingTimeout);
        }
        if expired(&mut self.timers.ping, now) {
            self.send_packet(PacketCode::Ping, &protocol::empty());
            self.timers.ping = Some(now + SessionConfig::ms(self.config.ping_interval_ms));
        }
        if expired(&mut self.timers.reconnect, now) {
            self.reconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timers_pick_earliest() {
        let now = Instant::now();
        let mut timers = Timers::default();
        assert_eq!(timers.next(), None);

        timers.ping = Some(now + Duration::from_secs(2));
        timers.handshake = Some(now + Duration::from_secs(1));
        assert_eq!(timers.next(), Some(now + Duration::from_secs(1)));

        timers.cancel_connection();
        assert_eq!(timers.next(), None);
    }

    #[test]
    fn test_expired_takes_deadline_once() {
        let now = Instant::now();
        let mut deadline = Some(now);
        assert!(expired(&mut deadline, now));
        assert!(deadline.is_none());
        assert!(!expired(&mut deadline, now));

        let mut later = Some(now + Duration::from_secs(5));
        assert!(!expired(&mut later, now));
        assert!(later.is_some());
    }

    #[test]
    fn test_authentication_is_not_retried() {
        assert!(!DisconnectReason::AuthenticationRequired.is_retryable());
        assert!(DisconnectReason::PingTimeout.is_retryable());
    }

    #[test]
    fn test_default_timings() {
        let config = SessionConfig::default();
        assert_eq!(config.ping_interval_ms, 2_000);
        assert_eq!(config.server_ping_timeout_ms, 5_000);
        assert_eq!(config.handshake_timeout_ms, 10_000);
        assert_eq!(config.pause_queue_capacity, 10_000);
        assert!(config.connect_to_first_discovered);
    }
}
