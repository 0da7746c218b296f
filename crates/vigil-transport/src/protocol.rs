//! Wire protocol for Vigil remote streaming
//!
//! Packet codes, handshake payloads and the two binary sub-codecs:
//!
//! - [`encode_task_completed`]: a completed network task with its bodies
//!   carried as raw bytes next to the JSON metadata
//! - [`Message`]: an addressed request/response envelope

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use vigil_core::{AppInfo, DeviceInfo, NetworkTaskCompleted, Session, StoreEvent};

/// Protocol version sent in the handshake
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Packet codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketCode {
    // Handshake
    ClientHello = 0,
    ServerHello = 1,
    // Controls
    Pause = 2,
    Resume = 3,
    Ping = 6,
    // Store events
    MessageStored = 7,
    NetworkTaskCreated = 8,
    NetworkTaskProgressUpdated = 9,
    NetworkTaskCompleted = 10,
    // Mocking
    UpdateMocks = 11,
    GetMockedResponse = 12,
    /// Addressed [`Message`] envelope
    Message = 13,
}

impl PacketCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether the packet carries a store event
    pub fn is_store_event(self) -> bool {
        matches!(
            self,
            Self::MessageStored
                | Self::NetworkTaskCreated
                | Self::NetworkTaskProgressUpdated
                | Self::NetworkTaskCompleted
        )
    }
}

impl TryFrom<u8> for PacketCode {
    type Error = ProtocolError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => Self::ClientHello,
            1 => Self::ServerHello,
            2 => Self::Pause,
            3 => Self::Resume,
            6 => Self::Ping,
            7 => Self::MessageStored,
            8 => Self::NetworkTaskCreated,
            9 => Self::NetworkTaskProgressUpdated,
            10 => Self::NetworkTaskCompleted,
            11 => Self::UpdateMocks,
            12 => Self::GetMockedResponse,
            13 => Self::Message,
            other => return Err(ProtocolError::UnknownCode(other)),
        })
    }
}

/// Errors decoding packet payloads
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Unknown packet code: {0}")]
    UnknownCode(u8),

    #[error("Unexpected packet: {0:?}")]
    UnexpectedPacket(PacketCode),

    #[error("Insufficient data: need {needed} bytes, have {available}")]
    InsufficientData { needed: usize, available: usize },

    #[error("Section too large: {0} bytes")]
    UnsupportedSize(usize),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// First packet from the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientHello {
    pub version: String,
    pub device_id: Uuid,
    pub device_info: DeviceInfo,
    pub app_info: AppInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<Session>,
    /// Passcode remembered for this server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl ClientHello {
    pub fn new(device_id: Uuid, app_info: AppInfo) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            device_id,
            device_info: DeviceInfo::current(),
            app_info,
            session: None,
            credential: None,
        }
    }

    pub fn with_session(mut self, session: Session) -> Self {
        self.session = Some(session);
        self
    }
}

/// Why a server refused a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HelloError {
    AuthenticationRequired,
}

/// Server reply to [`ClientHello`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerHello {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<HelloError>,
}

impl ServerHello {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            error: None,
        }
    }

    pub fn rejected(error: HelloError) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            error: Some(error),
        }
    }
}

/// Payload of control packets
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Empty {}

pub fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    Ok(serde_json::to_vec(value)?)
}

pub fn from_json<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    Ok(serde_json::from_slice(data)?)
}

/// Encoded [`Empty`] payload
pub fn empty() -> Vec<u8> {
    b"{}".to_vec()
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn section_len(len: usize) -> Result<u32, ProtocolError> {
    u32::try_from(len).map_err(|_| ProtocolError::UnsupportedSize(len))
}

/// End offset of sections laid out after `start`
fn sections_end(start: usize, lens: &[usize]) -> Result<usize, ProtocolError> {
    lens.iter()
        .try_fold(start, |end, &len| end.checked_add(len))
        .ok_or(ProtocolError::UnsupportedSize(usize::MAX))
}

/// Size of the network-task-completed manifest
pub const TASK_MANIFEST_SIZE: usize = 12;

/// Encode a completed task: a manifest of three section sizes, the JSON
/// metadata, then the request and response bodies as raw bytes
pub fn encode_task_completed(event: &NetworkTaskCompleted) -> Result<Vec<u8>, ProtocolError> {
    let mut slim = event.clone();
    let request_body = slim.request_body.take().unwrap_or_default();
    let response_body = slim.response_body.take().unwrap_or_default();
    let metadata = serde_json::to_vec(&slim)?;

    let mut data =
        Vec::with_capacity(TASK_MANIFEST_SIZE + metadata.len() + request_body.len() + response_body.len());
    data.extend_from_slice(&section_len(metadata.len())?.to_be_bytes());
    data.extend_from_slice(&section_len(request_body.len())?.to_be_bytes());
    data.extend_from_slice(&section_len(response_body.len())?.to_be_bytes());
    data.extend_from_slice(&metadata);
    data.extend_from_slice(&request_body);
    data.extend_from_slice(&response_body);
    Ok(data)
}

/// Decode [`encode_task_completed`] output. Empty bodies decode as `None`.
pub fn decode_task_completed(data: &[u8]) -> Result<NetworkTaskCompleted, ProtocolError> {
    if data.len() < TASK_MANIFEST_SIZE {
        return Err(ProtocolError::InsufficientData {
            needed: TASK_MANIFEST_SIZE,
            available: data.len(),
        });
    }
    let metadata_len = read_u32(data, 0) as usize;
    let request_len = read_u32(data, 4) as usize;
    let response_len = read_u32(data, 8) as usize;
    let needed = sections_end(TASK_MANIFEST_SIZE, &[metadata_len, request_len, response_len])?;
    if data.len() < needed {
        return Err(ProtocolError::InsufficientData {
            needed,
            available: data.len(),
        });
    }

    let mut offset = TASK_MANIFEST_SIZE;
    let mut event: NetworkTaskCompleted =
        serde_json::from_slice(&data[offset..offset + metadata_len])?;
    offset += metadata_len;
    event.request_body = (request_len > 0).then(|| data[offset..offset + request_len].to_vec());
    offset += request_len;
    event.response_body = (response_len > 0).then(|| data[offset..offset + response_len].to_vec());
    Ok(event)
}

/// Encode a store event as a packet
pub fn encode_event(event: &StoreEvent) -> Result<(PacketCode, Vec<u8>), ProtocolError> {
    Ok(match event {
        StoreEvent::MessageStored(e) => (PacketCode::MessageStored, to_json(e)?),
        StoreEvent::NetworkTaskCreated(e) => (PacketCode::NetworkTaskCreated, to_json(e)?),
        StoreEvent::NetworkTaskProgressUpdated(e) => {
            (PacketCode::NetworkTaskProgressUpdated, to_json(e)?)
        }
        StoreEvent::NetworkTaskCompleted(e) => {
            (PacketCode::NetworkTaskCompleted, encode_task_completed(e)?)
        }
    })
}

/// Decode a store event packet
pub fn decode_event(code: PacketCode, body: &[u8]) -> Result<StoreEvent, ProtocolError> {
    Ok(match code {
        PacketCode::MessageStored => StoreEvent::MessageStored(from_json(body)?),
        PacketCode::NetworkTaskCreated => StoreEvent::NetworkTaskCreated(from_json(body)?),
        PacketCode::NetworkTaskProgressUpdated => {
            StoreEvent::NetworkTaskProgressUpdated(from_json(body)?)
        }
        PacketCode::NetworkTaskCompleted => {
            StoreEvent::NetworkTaskCompleted(decode_task_completed(body)?)
        }
        other => return Err(ProtocolError::UnexpectedPacket(other)),
    })
}

/// Address of a [`Message`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Path {
    /// Payload: the full list of mocks
    UpdateMocks,
    #[serde(rename_all = "camelCase")]
    GetMockedResponse { mock_id: Uuid },
    /// Payload: a `MessageStored` event
    OpenMessageDetails,
    /// Payload: a `NetworkTaskCompleted` event
    OpenTaskDetails,
}

/// Size of the [`Message`] header
pub const MESSAGE_HEADER_SIZE: usize = 13;

const OPTION_RESPONSE: u8 = 1;

/// Addressed envelope used for requests, their responses and pushes
///
/// ```text
/// [u32 id][u8 options][u32 path size][u32 data size][path JSON][data]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u32,
    pub is_response: bool,
    pub path: Path,
    pub data: Vec<u8>,
}

impl Message {
    pub fn request(id: u32, path: Path, data: Vec<u8>) -> Self {
        Self {
            id,
            is_response: false,
            path,
            data,
        }
    }

    /// Reply to this message
    pub fn reply(&self, data: Vec<u8>) -> Self {
        Self {
            id: self.id,
            is_response: true,
            path: self.path.clone(),
            data,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let path = serde_json::to_vec(&self.path)?;
        let options = if self.is_response { OPTION_RESPONSE } else { 0 };

        let mut data = Vec::with_capacity(MESSAGE_HEADER_SIZE + path.len() + self.data.len());
        data.extend_from_slice(&self.id.to_be_bytes());
        data.push(options);
        data.extend_from_slice(&section_len(path.len())?.to_be_bytes());
        data.extend_from_slice(&section_len(self.data.len())?.to_be_bytes());
        data.extend_from_slice(&path);
        data.extend_from_slice(&self.data);
        Ok(data)
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < MESSAGE_HEADER_SIZE {
            return Err(ProtocolError::InsufficientData {
                needed: MESSAGE_HEADER_SIZE,
                available: data.len(),
            });
        }
        let id = read_u32(data, 0);
        let options = data[4];
        let path_len = read_u32(data, 5) as usize;
        let data_len = read_u32(data, 9) as usize;
        let needed = sections_end(MESSAGE_HEADER_SIZE, &[path_len, data_len])?;
        if data.len() < needed {
            return Err(ProtocolError::InsufficientData {
                needed,
                available: data.len(),
            });
        }
        let path_end = MESSAGE_HEADER_SIZE + path_len;
        Ok(Self {
            id,
            is_response: options & OPTION_RESPONSE != 0,
            path: serde_json::from_slice(&data[MESSAGE_HEADER_SIZE..path_end])?,
            data: data[path_end..path_end + data_len].to_vec(),
        })
    }
}
