//! Binary protocol for keyed value synchronization.
//!
//! Wire format (bincode-encoded, one message per WebSocket binary frame):
//! ```text
//! ┌──────────┬───────────┬────────────┬──────────┐
//! │ msg_type │ sender_id │ request_id │ payload  │
//! │ 1 byte   │ 16 bytes  │ varint     │ variable │
//! └──────────┴───────────┴────────────┴──────────┘
//! ```
//!
//! Requests carry a non-zero `request_id`; the relay echoes it on the
//! matching response. Push messages (`ReceiveUpdate`) use `request_id = 0`.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Session declares its writer identity
    Hello = 1,
    /// Local write sent to the relay
    SendUpdate = 2,
    /// Relay push of another session's write
    ReceiveUpdate = 3,
    /// Point lookup request
    GetValue = 4,
    /// Point lookup response
    Value = 5,
    /// Full-state (resync) request
    GetAllState = 6,
    /// Full-state response
    AllState = 7,
    /// Introspection request
    GetStatus = 8,
    /// Introspection response
    Status = 9,
    /// Heartbeat ping
    Ping = 10,
    /// Heartbeat pong
    Pong = 11,
    /// Request rejected by the relay
    Error = 12,
}

/// Current time as milliseconds since the UNIX epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Authoritative state of one key as held by the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CellState {
    pub key: String,
    pub value: String,
    /// Writer identity of the last accepted write (None for seeded values)
    pub last_writer: Option<Uuid>,
    /// Milliseconds since the UNIX epoch
    pub last_updated: u64,
}

impl CellState {
    pub fn new(key: impl Into<String>, value: impl Into<String>, writer: Option<Uuid>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            last_writer: writer,
            last_updated: now_millis(),
        }
    }
}

/// Peer identity sent in the `Hello` handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create with explicit peer_id (for testing)
    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
        }
    }
}

/// Payload of `SendUpdate` and `ReceiveUpdate`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdatePayload {
    pub key: String,
    pub value: String,
    pub timestamp: u64,
}

/// Relay introspection snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayStatus {
    pub tracked_key_count: u64,
    pub timestamp: u64,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Originating session (nil for relay-generated responses)
    pub sender_id: Uuid,
    /// Request/response correlation id (0 = unsolicited)
    pub request_id: u64,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

impl SyncMessage {
    fn bare(msg_type: MessageType, sender_id: Uuid, request_id: u64) -> Self {
        Self {
            msg_type,
            sender_id,
            request_id,
            payload: Vec::new(),
        }
    }

    fn with_payload<T: Serialize>(
        msg_type: MessageType,
        sender_id: Uuid,
        request_id: u64,
        payload: &T,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            payload: encode_payload(payload)?,
            ..Self::bare(msg_type, sender_id, request_id)
        })
    }

    /// Create a hello (writer identity) message.
    pub fn hello(info: &PeerInfo) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::Hello, info.peer_id, 0, info)
    }

    /// Create a local write for the relay.
    pub fn send_update(
        sender_id: Uuid,
        key: impl Into<String>,
        value: impl Into<String>,
        timestamp: u64,
    ) -> Result<Self, ProtocolError> {
        let update = UpdatePayload {
            key: key.into(),
            value: value.into(),
            timestamp,
        };
        Self::with_payload(MessageType::SendUpdate, sender_id, 0, &update)
    }

    /// Create the push event fanned out to other sessions.
    pub fn receive_update(sender_id: Uuid, update: &UpdatePayload) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::ReceiveUpdate, sender_id, 0, update)
    }

    /// Create a point lookup request.
    pub fn get_value(sender_id: Uuid, request_id: u64, key: &str) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::GetValue, sender_id, request_id, &key)
    }

    /// Create a point lookup response.
    pub fn value(request_id: u64, state: Option<&CellState>) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::Value, Uuid::nil(), request_id, &state)
    }

    /// Create a full-state request.
    pub fn get_all_state(sender_id: Uuid, request_id: u64) -> Self {
        Self::bare(MessageType::GetAllState, sender_id, request_id)
    }

    /// Create a full-state response.
    pub fn all_state(request_id: u64, states: &[CellState]) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::AllState, Uuid::nil(), request_id, &states)
    }

    /// Create a status request.
    pub fn get_status(sender_id: Uuid, request_id: u64) -> Self {
        Self::bare(MessageType::GetStatus, sender_id, request_id)
    }

    /// Create a status response.
    pub fn status(request_id: u64, status: &RelayStatus) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::Status, Uuid::nil(), request_id, status)
    }

    /// Create an error response to a rejected request.
    pub fn error(request_id: u64, reason: &str) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::Error, Uuid::nil(), request_id, &reason)
    }

    /// Create a ping message.
    pub fn ping(sender_id: Uuid) -> Self {
        Self::bare(MessageType::Ping, sender_id, 0)
    }

    /// Create a pong message.
    pub fn pong(sender_id: Uuid) -> Self {
        Self::bare(MessageType::Pong, sender_id, 0)
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    fn parse<T: serde::de::DeserializeOwned>(
        &self,
        expected: &[MessageType],
    ) -> Result<T, ProtocolError> {
        if !expected.contains(&self.msg_type) {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (parsed, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(parsed)
    }

    /// Parse hello payload.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        self.parse(&[MessageType::Hello])
    }

    /// Parse update payload (`SendUpdate` or `ReceiveUpdate`).
    pub fn update(&self) -> Result<UpdatePayload, ProtocolError> {
        self.parse(&[MessageType::SendUpdate, MessageType::ReceiveUpdate])
    }

    /// Parse the key of a `GetValue` request.
    pub fn requested_key(&self) -> Result<String, ProtocolError> {
        self.parse(&[MessageType::GetValue])
    }

    /// Parse a `Value` response.
    pub fn cell(&self) -> Result<Option<CellState>, ProtocolError> {
        self.parse(&[MessageType::Value])
    }

    /// Parse an `AllState` response.
    pub fn cells(&self) -> Result<Vec<CellState>, ProtocolError> {
        self.parse(&[MessageType::AllState])
    }

    /// Parse a `Status` response.
    pub fn relay_status(&self) -> Result<RelayStatus, ProtocolError> {
        self.parse(&[MessageType::Status])
    }

    /// Parse an `Error` response.
    pub fn error_reason(&self) -> Result<String, ProtocolError> {
        self.parse(&[MessageType::Error])
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_update_roundtrip() {
        let sender = Uuid::new_v4();
        let msg = SyncMessage::send_update(sender, "price", "100", 1_700_000_000_000).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::SendUpdate);
        assert_eq!(decoded.sender_id, sender);
        assert_eq!(decoded.request_id, 0);
        let update = decoded.update().unwrap();
        assert_eq!(update.key, "price");
        assert_eq!(update.value, "100");
        assert_eq!(update.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn test_receive_update_keeps_origin() {
        let origin = Uuid::new_v4();
        let update = UpdatePayload {
            key: "k".into(),
            value: "v".into(),
            timestamp: 5,
        };
        let msg = SyncMessage::receive_update(origin, &update).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.msg_type, MessageType::ReceiveUpdate);
        assert_eq!(decoded.sender_id, origin);
        assert_eq!(decoded.update().unwrap(), update);
    }

    #[test]
    fn test_all_state_response() {
        let writer = Uuid::new_v4();
        let states = vec![
            CellState::new("a", "1", Some(writer)),
            CellState::new("b", "2", None),
        ];
        let msg = SyncMessage::all_state(9, &states).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.request_id, 9);
        assert_eq!(decoded.cells().unwrap(), states);
    }

    #[test]
    fn test_value_response_absent() {
        let msg = SyncMessage::value(3, None).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.cell().unwrap(), None);
    }

    #[test]
    fn test_get_value_carries_key() {
        let msg = SyncMessage::get_value(Uuid::new_v4(), 12, "temperature").unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.requested_key().unwrap(), "temperature");
        assert_eq!(decoded.request_id, 12);
    }

    #[test]
    fn test_hello_peer_info() {
        let info = PeerInfo::new("Alice");
        let msg = SyncMessage::hello(&info).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.sender_id, info.peer_id);
        assert_eq!(decoded.peer_info().unwrap(), info);
    }

    #[test]
    fn test_status_and_error() {
        let status = RelayStatus {
            tracked_key_count: 4,
            timestamp: 77,
        };
        let decoded = SyncMessage::decode(&SyncMessage::status(1, &status).unwrap().encode().unwrap()).unwrap();
        assert_eq!(decoded.relay_status().unwrap(), status);

        let err = SyncMessage::error(2, "empty key").unwrap();
        assert_eq!(err.error_reason().unwrap(), "empty key");
    }

    #[test]
    fn test_invalid_message_type_error() {
        let msg = SyncMessage::ping(Uuid::new_v4());
        assert!(matches!(msg.update(), Err(ProtocolError::InvalidMessageType)));
        assert!(msg.cells().is_err());
        assert!(msg.peer_info().is_err());
    }

    struct Refuses;

    impl Serialize for Refuses {
        fn serialize<S: serde::Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("refused"))
        }
    }

    #[test]
    fn test_payload_encode_failure_is_reported() {
        let result = SyncMessage::with_payload(MessageType::Hello, Uuid::nil(), 0, &Refuses);
        assert!(matches!(result, Err(ProtocolError::SerializationError(_))));
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(SyncMessage::decode(&garbage).is_err());
    }

    #[test]
    fn test_update_size_efficient() {
        let msg = SyncMessage::send_update(Uuid::new_v4(), "price", "100", now_millis()).unwrap();
        let encoded = msg.encode().unwrap();
        assert!(encoded.len() < 64, "Encoded size {} too large", encoded.len());
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Hello as u8, 1);
        assert_eq!(MessageType::SendUpdate as u8, 2);
        assert_eq!(MessageType::ReceiveUpdate as u8, 3);
        assert_eq!(MessageType::AllState as u8, 7);
        assert_eq!(MessageType::Error as u8, 12);
    }
}
