//! Stream connections
//!
//! A [`StreamConnection`] owns one bidirectional byte stream. A spawned task
//! reads from it, reassembles frames and reports them together with state
//! changes on the owner's event channel; outgoing frames are queued to the
//! same task. Events carry the connection id so the owner can ignore
//! anything from a connection it has already replaced.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace};

use crate::codec::{self, Frame, FrameError, FrameReassembler};
use crate::discovery::Endpoint;

/// Read buffer size
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Any stream a connection can run over
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// Boxed [`ByteStream`]
pub type BoxedStream = Box<dyn ByteStream>;

/// Opens streams to endpoints
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &Endpoint) -> io::Result<BoxedStream>;
}

/// Plain TCP
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect(endpoint.address).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Errors that can occur on a connection
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Connection closed")]
    Closed,

    #[error("Failed to encode frame: {0}")]
    Frame(#[from] FrameError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Transport state of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Ready,
    Failed(String),
    Cancelled,
}

/// Something that happened on a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    State(ConnectionState),
    Frame(Frame),
}

/// Owner side of the event channel: `(connection id, event)`
pub type ConnectionEvents = mpsc::UnboundedSender<(u64, ConnectionEvent)>;

/// One framed connection
#[derive(Debug)]
pub struct StreamConnection {
    id: u64,
    outgoing: mpsc::UnboundedSender<Bytes>,
    events: ConnectionEvents,
    task: JoinHandle<()>,
}

impl StreamConnection {
    /// Open a connection to `endpoint` in the background
    pub fn connect(
        connector: Arc<dyn Connector>,
        endpoint: Endpoint,
        id: u64,
        max_frame_size: usize,
        events: ConnectionEvents,
    ) -> Self {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let task_events = events.clone();
        let task = tokio::spawn(async move {
            let _ = task_events.send((id, ConnectionEvent::State(ConnectionState::Connecting)));
            match connector.connect(&endpoint).await {
                Ok(stream) => run(stream, id, max_frame_size, outgoing_rx, task_events).await,
                Err(e) => {
                    debug!(name = %endpoint.name, error = %e, "Connect failed");
                    let _ = task_events.send((
                        id,
                        ConnectionEvent::State(ConnectionState::Failed(e.to_string())),
                    ));
                }
            }
        });
        Self {
            id,
            outgoing,
            events,
            task,
        }
    }

    /// Run over an already established stream, such as an accepted socket
    pub fn from_stream(
        stream: BoxedStream,
        id: u64,
        max_frame_size: usize,
        events: ConnectionEvents,
    ) -> Self {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(stream, id, max_frame_size, outgoing_rx, events.clone()));
        Self {
            id,
            outgoing,
            events,
            task,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue a frame for writing
    pub fn send(&self, code: u8, body: &[u8]) -> Result<(), ConnectionError> {
        let frame = codec::encode(code, body)?;
        self.outgoing
            .send(frame)
            .map_err(|_| ConnectionError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.task.is_finished() || self.outgoing.is_closed()
    }

    /// Close the stream and report `Cancelled`
    pub fn cancel(self) {
        let _ = self
            .events
            .send((self.id, ConnectionEvent::State(ConnectionState::Cancelled)));
        // Drop aborts the task
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[instrument(skip_all, fields(connection = id))]
async fn run(
    stream: BoxedStream,
    id: u64,
    max_frame_size: usize,
    mut outgoing: mpsc::UnboundedReceiver<Bytes>,
    events: ConnectionEvents,
) {
    let notify = |state: ConnectionState| {
        let _ = events.send((id, ConnectionEvent::State(state)));
    };
    notify(ConnectionState::Ready);

    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut reassembler = FrameReassembler::new(max_frame_size);
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    loop {
        tokio::select! {
            read = reader.read(&mut chunk) => match read {
                Ok(0) => {
                    notify(ConnectionState::Failed("closed by peer".to_string()));
                    break;
                }
                Ok(n) => {
                    for frame in reassembler.push(&chunk[..n]) {
                        trace!(code = frame.code, size = frame.body.len(), "Frame received");
                        if events.send((id, ConnectionEvent::Frame(frame))).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    notify(ConnectionState::Failed(e.to_string()));
                    break;
                }
            },
            frame = outgoing.recv() => match frame {
                Some(frame) => {
                    let written = async {
                        writer.write_all(&frame).await?;
                        writer.flush().await
                    }
                    .await;
                    if let Err(e) = written {
                        notify(ConnectionState::Failed(e.to_string()));
                        break;
                    }
                }
                // Owner went away
                None => break,
            },
        }
    }
    let _ = writer.shutdown().await;
    debug!("Connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DEFAULT_MAX_FRAME_SIZE;
    use tokio::io::duplex;

    async fn next_frame(rx: &mut mpsc::UnboundedReceiver<(u64, ConnectionEvent)>) -> Frame {
        loop {
            match rx.recv().await {
                Some((_, ConnectionEvent::Frame(frame))) => return frame,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    }

    #[tokio::test]
    async fn test_frames_cross_a_duplex_stream() {
        let (a, b) = duplex(1024);
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let left = StreamConnection::from_stream(Box::new(a), 1, DEFAULT_MAX_FRAME_SIZE, tx_a);
        let right = StreamConnection::from_stream(Box::new(b), 2, DEFAULT_MAX_FRAME_SIZE, tx_b);

        assert_eq!(
            rx_a.recv().await,
            Some((1, ConnectionEvent::State(ConnectionState::Ready)))
        );

        left.send(7, b"hello").unwrap();
        // Incompressible and larger than the duplex buffer, so it arrives in pieces
        let mut seed: u32 = 12345;
        let big: Vec<u8> = (0..8 * 1024)
            .map(|_| {
                seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
                (seed >> 16) as u8
            })
            .collect();
        left.send(10, &big).unwrap();
        assert_eq!(next_frame(&mut rx_b).await, Frame::new(7, b"hello".to_vec()));
        assert_eq!(next_frame(&mut rx_b).await, Frame::new(10, big));

        right.send(6, b"{}").unwrap();
        assert_eq!(next_frame(&mut rx_a).await, Frame::new(6, b"{}".to_vec()));
    }

    #[tokio::test]
    async fn test_peer_close_reports_failure() {
        let (a, b) = duplex(64);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection = StreamConnection::from_stream(Box::new(a), 5, DEFAULT_MAX_FRAME_SIZE, tx);
        drop(b);

        let mut states = Vec::new();
        while let Some((id, ConnectionEvent::State(state))) = rx.recv().await {
            assert_eq!(id, 5);
            let failed = matches!(state, ConnectionState::Failed(_));
            states.push(state);
            if failed {
                break;
            }
        }
        assert_eq!(states[0], ConnectionState::Ready);
        assert!(matches!(states[1], ConnectionState::Failed(_)));
        drop(connection);
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        struct Refused;

        #[async_trait]
        impl Connector for Refused {
            async fn connect(&self, _: &Endpoint) -> io::Result<BoxedStream> {
                Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let endpoint = Endpoint::new("nowhere", "127.0.0.1:9".parse().unwrap());
        let connection = StreamConnection::connect(Arc::new(Refused), endpoint, 3, 1024, tx);

        assert_eq!(
            rx.recv().await,
            Some((3, ConnectionEvent::State(ConnectionState::Connecting)))
        );
        assert!(matches!(
            rx.recv().await,
            Some((3, ConnectionEvent::State(ConnectionState::Failed(_))))
        ));
        drop(connection);
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let frame = codec::encode(7, br#"{"text":"split"}"#).unwrap();
        let (head, tail) = frame.split_at(3);
        let stream = tokio_test::io::Builder::new()
            .read(head)
            .read(tail)
            .build();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _connection =
            StreamConnection::from_stream(Box::new(stream), 9, DEFAULT_MAX_FRAME_SIZE, tx);
        assert_eq!(
            next_frame(&mut rx).await,
            Frame::new(7, br#"{"text":"split"}"#.to_vec())
        );
        assert!(matches!(
            rx.recv().await,
            Some((9, ConnectionEvent::State(ConnectionState::Failed(_))))
        ));
    }
}
