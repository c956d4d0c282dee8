/// Wire protocol for topic synchronization.
///
/// This module provides the low-level primitives shared by servers and
/// clients:
///
/// - Protocol message types
/// - Length-prefixed framing over any async byte stream
/// - Connection metadata reported to listeners
///
/// # Framing
///
/// Each message is prefixed with a 4-byte big-endian length header followed
/// by the JSON-encoded payload. Frames larger than [`MAX_MESSAGE_SIZE`] are
/// rejected on both the sending and the receiving side.
///
/// # Topic ids
///
/// Topic ids are chosen by the side that sends the `Announce` and are only
/// meaningful on that connection, in that direction. `Value` messages
/// reference the sender's id; `Properties` messages carry the topic name
/// since either side may update any topic.
use crate::directory::SubscribeOptions;
use crate::error::{TableError, TableResult};
use crate::handle::ConnectionId;
use crate::value::ValueKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::fmt;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use uuid::Uuid;

/// Default port for topic synchronization.
pub const DEFAULT_PORT: u16 = 5810;

/// Maximum message size (16 MB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Version spoken by this implementation.
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion { major: 4, minor: 1 };

/// Protocol version. Peers must agree on the major number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    pub fn is_compatible(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Protocol messages exchanged between a server and its clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    // ─────────────────────────────────────────────────────────────────────
    // Handshake
    // ─────────────────────────────────────────────────────────────────────
    /// First message from a client.
    Hello {
        version: ProtocolVersion,
        instance_id: Uuid,
        identity: String,
        /// Client local time when sent.
        time: u64,
    },

    /// Server accepted the handshake.
    HelloAck {
        version: ProtocolVersion,
        instance_id: Uuid,
        identity: String,
        /// Echo of the client's `Hello::time`.
        client_time: u64,
        server_time: u64,
    },

    /// Server refused the handshake; the connection closes after this.
    Reject { reason: String },

    /// End of the sender's initial state dump.
    SyncDone,

    // ─────────────────────────────────────────────────────────────────────
    // Topics
    // ─────────────────────────────────────────────────────────────────────
    /// The sender has publishers for a topic.
    Announce {
        id: u32,
        name: String,
        kind: ValueKind,
        #[serde(default)]
        properties: JsonMap<String, JsonValue>,
    },

    /// The sender no longer publishes a topic.
    Unannounce { id: u32, name: String },

    /// Properties update by topic name; `null` members delete keys.
    Properties {
        name: String,
        update: JsonMap<String, JsonValue>,
    },

    /// New value for an announced topic, timestamped in server time.
    Value {
        id: u32,
        time: u64,
        value: JsonValue,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Subscriptions (client to server)
    // ─────────────────────────────────────────────────────────────────────
    Subscribe {
        subuid: u32,
        patterns: Vec<String>,
        options: SubscribeOptions,
    },

    Unsubscribe { subuid: u32 },

    // ─────────────────────────────────────────────────────────────────────
    // Keep-alive
    // ─────────────────────────────────────────────────────────────────────
    Ping { time: u64 },

    Pong { client_time: u64, server_time: u64 },
}

impl Message {
    /// Serialize message to bytes.
    pub fn to_bytes(&self) -> TableResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(TableError::SerializationError)
    }

    /// Deserialize message from bytes.
    pub fn from_bytes(bytes: &[u8]) -> TableResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| TableError::ProtocolError(format!("malformed message: {}", e)))
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "hello",
            Message::HelloAck { .. } => "hello_ack",
            Message::Reject { .. } => "reject",
            Message::SyncDone => "sync_done",
            Message::Announce { .. } => "announce",
            Message::Unannounce { .. } => "unannounce",
            Message::Properties { .. } => "properties",
            Message::Value { .. } => "value",
            Message::Subscribe { .. } => "subscribe",
            Message::Unsubscribe { .. } => "unsubscribe",
            Message::Ping { .. } => "ping",
            Message::Pong { .. } => "pong",
        }
    }
}

/// Liveness of one peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Created, nothing exchanged yet.
    Idle,
    /// Version exchange and initial state dump in progress.
    Handshaking,
    /// Both sides finished their initial state dump.
    Synchronized,
    /// Terminal.
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Synchronized => "synchronized",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Information about a peer link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Local identifier of the link.
    pub id: ConnectionId,
    /// Identity string the peer announced.
    pub remote_id: String,
    /// Instance id the peer announced, once known.
    pub remote_instance: Option<Uuid>,
    /// Network address of the peer.
    pub remote_addr: Option<SocketAddr>,
    pub state: ConnectionState,
    /// Negotiated protocol version, once known.
    pub protocol_version: Option<ProtocolVersion>,
    /// When the link was established.
    pub connected_at: DateTime<Utc>,
    /// When the peer last sent anything.
    pub last_seen: DateTime<Utc>,
}

impl ConnectionInfo {
    pub fn new(
        id: ConnectionId,
        remote_id: String,
        remote_addr: Option<SocketAddr>,
        state: ConnectionState,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            remote_id,
            remote_instance: None,
            remote_addr,
            state,
            protocol_version: None,
            connected_at: now,
            last_seen: now,
        }
    }

    /// Update the last seen timestamp.
    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }
}

/// Reading half of a framed stream.
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Receive a message from the peer.
    pub async fn receive(&mut self) -> TableResult<Message> {
        // Read length header (4 bytes, big-endian).
        let mut len_bytes = [0u8; 4];
        self.inner
            .read_exact(&mut len_bytes)
            .await
            .map_err(|e| TableError::ConnectionLost(format!("failed to read frame length: {}", e)))?;

        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(TableError::ProtocolError(format!(
                "message too large: {} bytes (max: {})",
                len, MAX_MESSAGE_SIZE
            )));
        }

        let mut bytes = vec![0u8; len];
        self.inner
            .read_exact(&mut bytes)
            .await
            .map_err(|e| TableError::ConnectionLost(format!("failed to read frame body: {}", e)))?;

        Message::from_bytes(&bytes)
    }
}

/// Writing half of a framed stream.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Send a message to the peer.
    pub async fn send(&mut self, message: &Message) -> TableResult<()> {
        let bytes = message.to_bytes()?;
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(TableError::ProtocolError(format!(
                "message too large: {} bytes (max: {})",
                bytes.len(),
                MAX_MESSAGE_SIZE
            )));
        }

        let len = bytes.len() as u32;
        let mut frame = Vec::with_capacity(4 + bytes.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&bytes);

        self.inner
            .write_all(&frame)
            .await
            .map_err(|e| TableError::ConnectionLost(format!("failed to write frame: {}", e)))?;
        self.inner
            .flush()
            .await
            .map_err(|e| TableError::ConnectionLost(format!("failed to flush stream: {}", e)))?;
        Ok(())
    }
}

/// A framed TCP connection to a peer.
pub struct Connection {
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
    peer_addr: SocketAddr,
}

impl Connection {
    /// Wrap an accepted or connected TCP stream.
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        // Values are small and latency matters more than throughput.
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(peer = %peer_addr, error = %e, "failed to set TCP_NODELAY");
        }
        let (read, write) = stream.into_split();
        Self {
            reader: FrameReader::new(read),
            writer: FrameWriter::new(write),
            peer_addr,
        }
    }

    /// Connect to a peer.
    pub async fn connect(addr: SocketAddr) -> TableResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TableError::ConnectionLost(format!("failed to connect to {}: {}", addr, e)))?;
        Ok(Self::new(stream, addr))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub async fn send(&mut self, message: &Message) -> TableResult<()> {
        self.writer.send(message).await
    }

    pub async fn receive(&mut self) -> TableResult<Message> {
        self.reader.receive().await
    }

    /// Split into independently owned halves.
    pub fn into_split(self) -> (FrameReader<OwnedReadHalf>, FrameWriter<OwnedWriteHalf>) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::net::TcpListener;

    #[test]
    fn test_version_compatibility() {
        let same_major = ProtocolVersion { major: 4, minor: 0 };
        let other_major = ProtocolVersion { major: 3, minor: 1 };
        assert!(PROTOCOL_VERSION.is_compatible(&same_major));
        assert!(!PROTOCOL_VERSION.is_compatible(&other_major));
        assert_eq!(PROTOCOL_VERSION.to_string(), "4.1");
    }

    #[test]
    fn test_message_is_tagged() {
        let message = Message::Value {
            id: 3,
            time: 42,
            value: json!(1.5),
        };
        let encoded: JsonValue = serde_json::from_slice(&message.to_bytes().unwrap()).unwrap();
        assert_eq!(encoded["type"], "value");
        assert_eq!(encoded["id"], 3);

        let sync: JsonValue = serde_json::from_slice(&Message::SyncDone.to_bytes().unwrap()).unwrap();
        assert_eq!(sync, json!({"type": "sync_done"}));
    }

    #[test]
    fn test_announce_uses_type_strings() {
        let message = Message::Announce {
            id: 1,
            name: "/arm/angle".to_string(),
            kind: ValueKind::DoubleArray,
            properties: JsonMap::new(),
        };
        let encoded: JsonValue = serde_json::from_slice(&message.to_bytes().unwrap()).unwrap();
        assert_eq!(encoded["kind"], "double[]");
        assert_eq!(Message::from_bytes(&message.to_bytes().unwrap()).unwrap(), message);
    }

    #[test]
    fn test_malformed_message_is_protocol_error() {
        let err = Message::from_bytes(b"{\"type\":\"bogus\"}").unwrap_err();
        assert!(matches!(err, TableError::ProtocolError(_)));
    }

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (a, b) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(a);
        let mut reader = FrameReader::new(b);

        writer.send(&Message::Ping { time: 7 }).await.unwrap();
        writer.send(&Message::SyncDone).await.unwrap();

        assert_eq!(reader.receive().await.unwrap(), Message::Ping { time: 7 });
        assert_eq!(reader.receive().await.unwrap(), Message::SyncDone);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, b) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(b);
        let len = (MAX_MESSAGE_SIZE as u32) + 1;
        a.write_all(&len.to_be_bytes()).await.unwrap();

        let err = reader.receive().await.unwrap_err();
        assert!(matches!(err, TableError::ProtocolError(_)));
    }

    #[tokio::test]
    async fn test_closed_stream_is_connection_lost() {
        let (a, b) = tokio::io::duplex(64);
        drop(a);
        let mut reader = FrameReader::new(b);
        let err = reader.receive().await.unwrap_err();
        assert!(matches!(err, TableError::ConnectionLost(_)));
    }

    #[tokio::test]
    async fn test_tcp_connection_round_trip() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 0);
        let listener = TcpListener::bind(addr).await.unwrap();
        let listen_addr = listener.local_addr().unwrap();

        let accept_handle = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let mut conn = Connection::new(stream, peer);
            let msg = conn.receive().await.unwrap();
            conn.send(&Message::Pong {
                client_time: 1,
                server_time: 2,
            })
            .await
            .unwrap();
            msg
        });

        let mut client = Connection::connect(listen_addr).await.unwrap();
        client.send(&Message::Ping { time: 1 }).await.unwrap();
        let response = client.receive().await.unwrap();
        assert!(matches!(response, Message::Pong { server_time: 2, .. }));

        let received = accept_handle.await.unwrap();
        assert_eq!(received, Message::Ping { time: 1 });
    }
}
