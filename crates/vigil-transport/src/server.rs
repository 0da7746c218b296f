//! Viewer server
//!
//! The receiving end of remote streaming. Accepts client connections,
//! answers the handshake, pings every client and republishes the store
//! events they send on a broadcast channel. The viewer controls the flow
//! with [`pause`](ViewerServer::pause) and [`resume`](ViewerServer::resume)
//! and serves mocked responses on request.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;
use vigil_core::StoreEvent;

use crate::codec::DEFAULT_MAX_FRAME_SIZE;
use crate::connection::{BoxedStream, ConnectionEvent, ConnectionState, StreamConnection};
use crate::error::TransportResult;
use crate::mocks::{Mock, MockedResponse};
use crate::protocol::{
    self, ClientHello, HelloError, Message, PROTOCOL_VERSION, PacketCode, Path, ProtocolError,
    ServerHello, decode_event,
};

/// Capacity of the server event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Configuration for a [`ViewerServer`]
#[derive(Debug, Clone)]
pub struct ViewerServerConfig {
    /// Name advertised to clients
    pub name: String,
    /// Version reported in `serverHello`
    pub version: String,
    pub ping_interval: Duration,
    /// Clients must present this credential when set
    pub passcode: Option<String>,
    pub max_frame_size: usize,
}

impl Default for ViewerServerConfig {
    fn default() -> Self {
        Self {
            name: "vigil-viewer".to_string(),
            version: PROTOCOL_VERSION.to_string(),
            ping_interval: Duration::from_secs(2),
            passcode: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ViewerServerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_passcode(mut self, passcode: impl Into<String>) -> Self {
        self.passcode = Some(passcode.into());
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }
}

/// Events published by the server
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A client completed the handshake
    ClientConnected { client: u64, hello: ClientHello },
    /// A client presented a wrong or missing passcode
    ClientRejected { client: u64 },
    /// A store event from a client
    Event { client: u64, event: StoreEvent },
    /// A handshaken client went away
    ClientDisconnected { client: u64 },
}

/// A client that completed the handshake
#[derive(Debug, Clone)]
pub struct ConnectedClient {
    pub id: u64,
    pub hello: ClientHello,
}

enum ClientCommand {
    Send(PacketCode, Vec<u8>),
}

struct ClientHandle {
    commands: mpsc::UnboundedSender<ClientCommand>,
    hello: Option<ClientHello>,
}

struct Shared {
    config: ViewerServerConfig,
    clients: DashMap<u64, ClientHandle>,
    mocked_responses: DashMap<Uuid, MockedResponse>,
    events: broadcast::Sender<ServerEvent>,
    paused: AtomicBool,
    next_client_id: AtomicU64,
}

impl Shared {
    fn publish(&self, event: ServerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// TCP server that receives remote logs
pub struct ViewerServer {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    shutdown: broadcast::Sender<()>,
}

impl std::fmt::Debug for ViewerServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewerServer")
            .field("name", &self.shared.config.name)
            .field("local_addr", &self.local_addr)
            .field("clients", &self.shared.clients.len())
            .finish()
    }
}

impl ViewerServer {
    /// Bind and start accepting clients
    pub async fn bind(addr: SocketAddr, config: ViewerServerConfig) -> TransportResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown, _) = broadcast::channel(1);

        let shared = Arc::new(Shared {
            config,
            clients: DashMap::new(),
            mocked_responses: DashMap::new(),
            events,
            paused: AtomicBool::new(false),
            next_client_id: AtomicU64::new(1),
        });
        info!(name = %shared.config.name, %local_addr, "Viewer server listening");

        tokio::spawn(accept_loop(listener, shared.clone(), shutdown.subscribe()));
        Ok(Self {
            shared,
            local_addr,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.shared.events.subscribe()
    }

    /// Clients that completed the handshake
    pub fn clients(&self) -> Vec<ConnectedClient> {
        let mut clients: Vec<ConnectedClient> = self
            .shared
            .clients
            .iter()
            .filter_map(|entry| {
                entry.hello.clone().map(|hello| ConnectedClient {
                    id: *entry.key(),
                    hello,
                })
            })
            .collect();
        clients.sort_by_key(|c| c.id);
        clients
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    /// Ask every client to hold its events
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Release);
        self.broadcast(PacketCode::Pause, protocol::empty());
    }

    /// Let every client send again, including what it held
    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::Release);
        self.broadcast(PacketCode::Resume, protocol::empty());
    }

    fn broadcast(&self, code: PacketCode, body: Vec<u8>) {
        for entry in self.shared.clients.iter() {
            if entry.hello.is_some() {
                let _ = entry.commands.send(ClientCommand::Send(code, body.clone()));
            }
        }
    }

    /// Replace the mocks of a client. Returns false for unknown clients.
    pub fn update_mocks(&self, client: u64, mocks: &[Mock]) -> TransportResult<bool> {
        let body = protocol::to_json(&mocks)?;
        let Some(handle) = self.shared.clients.get(&client) else {
            return Ok(false);
        };
        Ok(handle
            .commands
            .send(ClientCommand::Send(PacketCode::UpdateMocks, body))
            .is_ok())
    }

    /// Response served when a client asks for `mock_id`
    pub fn set_mocked_response(&self, mock_id: Uuid, response: MockedResponse) {
        self.shared.mocked_responses.insert(mock_id, response);
    }

    pub fn remove_mocked_response(&self, mock_id: Uuid) -> Option<MockedResponse> {
        self.shared.mocked_responses.remove(&mock_id).map(|(_, r)| r)
    }

    /// Stop accepting and disconnect every client
    pub fn shutdown(&self) {
        info!(name = %self.shared.config.name, "Viewer server shutting down");
        let _ = self.shutdown.send(());
    }
}

impl Drop for ViewerServer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(error = %e, "Failed to set nodelay");
                    }
                    let id = shared.next_client_id.fetch_add(1, Ordering::Relaxed);
                    let (commands, commands_rx) = mpsc::unbounded_channel();
                    shared.clients.insert(id, ClientHandle { commands, hello: None });
                    debug!(client = id, %peer, "Client accepted");
                    tokio::spawn(serve_client(
                        id,
                        Box::new(stream),
                        shared.clone(),
                        commands_rx,
                        shutdown.resubscribe(),
                    ));
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            },
        }
    }
    debug!("Accept loop stopped");
}

#[instrument(skip_all, fields(client = id))]
async fn serve_client(
    id: u64,
    stream: BoxedStream,
    shared: Arc<Shared>,
    mut commands: mpsc::UnboundedReceiver<ClientCommand>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let connection =
        StreamConnection::from_stream(stream, id, shared.config.max_frame_size, events_tx);
    let mut ping = tokio::time::interval(shared.config.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut handshaken = false;

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            command = commands.recv() => match command {
                Some(ClientCommand::Send(code, body)) => {
                    if let Err(e) = connection.send(code.as_u8(), &body) {
                        debug!(error = %e, "Send failed");
                        break;
                    }
                }
                None => break,
            },
            event = events.recv() => match event {
                Some((_, ConnectionEvent::Frame(frame))) => {
                    let code = match PacketCode::try_from(frame.code) {
                        Ok(code) => code,
                        Err(e) => {
                            warn!(error = %e, "Invalid packet from client");
                            continue;
                        }
                    };
                    match handle_packet(id, &shared, &connection, code, &frame.body) {
                        Ok(Some(hello)) => {
                            handshaken = true;
                            if let Some(mut handle) = shared.clients.get_mut(&id) {
                                handle.hello = Some(hello.clone());
                            }
                            shared.publish(ServerEvent::ClientConnected { client: id, hello });
                        }
                        Ok(None) => {}
                        Err(e) => warn!(?code, error = %e, "Failed to handle packet"),
                    }
                }
                Some((_, ConnectionEvent::State(ConnectionState::Failed(reason)))) => {
                    debug!(%reason, "Client connection failed");
                    break;
                }
                Some(_) => {}
                None => break,
            },
            _ = ping.tick(), if handshaken => {
                if connection.send(PacketCode::Ping.as_u8(), &protocol::empty()).is_err() {
                    break;
                }
            }
        }
    }

    shared.clients.remove(&id);
    if handshaken {
        info!("Client disconnected");
        shared.publish(ServerEvent::ClientDisconnected { client: id });
    }
}

/// Returns the hello of a client that just completed the handshake
fn handle_packet(
    id: u64,
    shared: &Shared,
    connection: &StreamConnection,
    code: PacketCode,
    body: &[u8],
) -> Result<Option<ClientHello>, ProtocolError> {
    trace!(?code, size = body.len(), "Packet received");
    match code {
        PacketCode::ClientHello => {
            let hello: ClientHello = protocol::from_json(body)?;
            if let Some(passcode) = &shared.config.passcode
                && hello.credential.as_deref() != Some(passcode.as_str())
            {
                warn!(device = %hello.device_info.name, "Client rejected: passcode required");
                let rejected = ServerHello::rejected(HelloError::AuthenticationRequired);
                send(connection, PacketCode::ServerHello, protocol::to_json(&rejected)?);
                shared.publish(ServerEvent::ClientRejected { client: id });
                return Ok(None);
            }

            info!(
                device = %hello.device_info.name,
                app = ?hello.app_info.name,
                "Client connected"
            );
            send(
                connection,
                PacketCode::ServerHello,
                protocol::to_json(&ServerHello::new(shared.config.version.clone()))?,
            );
            if !shared.paused.load(Ordering::Acquire) {
                send(connection, PacketCode::Resume, protocol::empty());
            }
            Ok(Some(hello))
        }
        PacketCode::Ping => Ok(None),
        code if code.is_store_event() => {
            let event = decode_event(code, body)?;
            shared.publish(ServerEvent::Event { client: id, event });
            Ok(None)
        }
        PacketCode::Message | PacketCode::GetMockedResponse => {
            let message = Message::decode(body)?;
            match &message.path {
                Path::GetMockedResponse { mock_id } if !message.is_response => {
                    let response = shared.mocked_responses.get(mock_id).map(|r| r.value().clone());
                    let reply = message.reply(protocol::to_json(&response)?);
                    send(connection, PacketCode::Message, reply.encode()?);
                }
                other => debug!(path = ?other, "Ignoring message"),
            }
            Ok(None)
        }
        other => Err(ProtocolError::UnexpectedPacket(other)),
    }
}

fn send(connection: &StreamConnection, code: PacketCode, body: Vec<u8>) {
    if let Err(e) = connection.send(code.as_u8(), &body) {
        debug!(?code, error = %e, "Send failed");
    }
}
