use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const CMD_PEER_READY: &str = "peer_ready";
pub const CMD_HOST_READY: &str = "host_ready";
pub const CMD_HANDSHAKE_CONFIRM: &str = "handshake_confirm";

pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_SAFETY_LOCK_TIMEOUT: &str = "safety_lock_timeout";
pub const EVENT_LOG: &str = "log";

pub const TYPE_COMMAND: &str = "COMMAND";
pub const TYPE_RESPONSE: &str = "RESPONSE";
pub const TYPE_REGISTER_HOST: &str = "REGISTER_HOST";

pub const HEARTBEAT_STATUS_ALIVE: &str = "alive";

/// Browser native messaging frames are little-endian; the local service link
/// uses network byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthPrefix {
    LittleEndian,
    BigEndian,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("frame exceeds {max_bytes} bytes (got {frame_bytes})")]
    TooLarge { frame_bytes: usize, max_bytes: usize },
    #[error("invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("invalid {kind} frame: {reason}")]
    Invalid { kind: &'static str, reason: String },
}

impl FrameError {
    /// Errors that poison only the offending frame, not the stream.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, FrameError::Io(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerReady {
    pub profile_id: String,
    pub launch_id: String,
    pub peer_id: String,
    #[serde(default)]
    pub profile_alias: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostReady {
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub version: String,
    pub max_message_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeConfirm {
    pub profile_id: String,
    pub launch_id: String,
    pub peer_id: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum HandshakeFrame {
    PeerReady(PeerReady),
    HostReady(HostReady),
    HandshakeConfirm(HandshakeConfirm),
}

impl HandshakeFrame {
    pub fn name(&self) -> &'static str {
        match self {
            HandshakeFrame::PeerReady(_) => CMD_PEER_READY,
            HandshakeFrame::HostReady(_) => CMD_HOST_READY,
            HandshakeFrame::HandshakeConfirm(_) => CMD_HANDSHAKE_CONFIRM,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub profile_id: String,
    pub launch_id: String,
    pub timestamp: u64,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyLockTimeout {
    pub idle_ms: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionLog {
    #[serde(default = "default_log_level")]
    pub level: String,
    pub message: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventFrame {
    Heartbeat(Heartbeat),
    SafetyLockTimeout(SafetyLockTimeout),
    Log(ExtensionLog),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandFrame {
    pub command: String,
    pub id: String,
    #[serde(default)]
    pub target: Value,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    pub payload: ResponsePayload,
}

impl ResponseFrame {
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            payload: ResponsePayload {
                ok: true,
                result: Some(result),
                error: None,
                code: None,
            },
        }
    }

    pub fn failure(id: impl Into<String>, code: &str, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: ResponsePayload {
                ok: false,
                result: None,
                error: Some(error.into()),
                code: Some(code.to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RpcFrame {
    #[serde(rename = "COMMAND")]
    Command(CommandFrame),
    #[serde(rename = "RESPONSE")]
    Response(ResponseFrame),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterHost {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub pid: u32,
    pub profile_id: String,
    pub version: String,
}

impl RegisterHost {
    pub fn new(profile_id: impl Into<String>) -> Self {
        Self {
            frame_type: TYPE_REGISTER_HOST.to_string(),
            pid: std::process::id(),
            profile_id: profile_id.into(),
            version: BRIDGE_VERSION.to_string(),
        }
    }
}

/// A decoded frame, classified for gating and routing.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Chunk(Value),
    Handshake(HandshakeFrame),
    Event(EventFrame),
    Command(CommandFrame),
    Response(ResponseFrame),
    Other(Value),
}

impl InboundMessage {
    pub fn classify(value: Value) -> Result<Self, FrameError> {
        let Some(obj) = value.as_object() else {
            return Err(FrameError::NotAnObject);
        };

        if obj.contains_key("chunk") || obj.contains_key("bloom_chunk") {
            return Ok(InboundMessage::Chunk(value));
        }

        if let Some(frame_type) = obj.get("type").and_then(Value::as_str) {
            if frame_type == TYPE_COMMAND || frame_type == TYPE_RESPONSE {
                return match serde_json::from_value::<RpcFrame>(value) {
                    Ok(RpcFrame::Command(cmd)) => Ok(InboundMessage::Command(cmd)),
                    Ok(RpcFrame::Response(resp)) => Ok(InboundMessage::Response(resp)),
                    Err(err) => Err(FrameError::Invalid {
                        kind: "rpc",
                        reason: err.to_string(),
                    }),
                };
            }
            return Ok(InboundMessage::Other(value));
        }

        if let Some(command) = obj.get("command").and_then(Value::as_str) {
            if is_handshake_command(command) {
                return serde_json::from_value::<HandshakeFrame>(value)
                    .map(InboundMessage::Handshake)
                    .map_err(|err| FrameError::Invalid {
                        kind: "handshake",
                        reason: err.to_string(),
                    });
            }
            return Ok(InboundMessage::Other(value));
        }

        if let Some(event) = obj.get("event").and_then(Value::as_str) {
            if is_known_event(event) {
                return serde_json::from_value::<EventFrame>(value)
                    .map(InboundMessage::Event)
                    .map_err(|err| FrameError::Invalid {
                        kind: "event",
                        reason: err.to_string(),
                    });
            }
        }

        Ok(InboundMessage::Other(value))
    }

    /// Back to wire form, for relaying.
    pub fn into_value(self) -> Value {
        match self {
            InboundMessage::Chunk(value) | InboundMessage::Other(value) => value,
            InboundMessage::Handshake(frame) => to_value(&frame),
            InboundMessage::Event(frame) => to_value(&frame),
            InboundMessage::Command(frame) => to_value(&RpcFrame::Command(frame)),
            InboundMessage::Response(frame) => to_value(&RpcFrame::Response(frame)),
        }
    }

    pub fn is_handshake(&self) -> bool {
        matches!(self, InboundMessage::Handshake(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::Chunk(_) => "chunk",
            InboundMessage::Handshake(frame) => frame.name(),
            InboundMessage::Event(EventFrame::Heartbeat(_)) => EVENT_HEARTBEAT,
            InboundMessage::Event(EventFrame::SafetyLockTimeout(_)) => EVENT_SAFETY_LOCK_TIMEOUT,
            InboundMessage::Event(EventFrame::Log(_)) => EVENT_LOG,
            InboundMessage::Command(_) => "command",
            InboundMessage::Response(_) => "response",
            InboundMessage::Other(_) => "other",
        }
    }
}

fn is_handshake_command(command: &str) -> bool {
    matches!(
        command,
        CMD_PEER_READY | CMD_HOST_READY | CMD_HANDSHAKE_CONFIRM
    )
}

fn is_known_event(event: &str) -> bool {
    matches!(
        event,
        EVENT_HEARTBEAT | EVENT_SAFETY_LOCK_TIMEOUT | EVENT_LOG
    )
}

pub fn to_value<T: Serialize>(frame: &T) -> Value {
    serde_json::to_value(frame).unwrap_or_else(|err| {
        tracing::error!(error = %err, "frame serialization failed");
        Value::Object(Map::new())
    })
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Reads one length-prefixed frame body.
///
/// Returns `Ok(None)` on a clean end of stream. Zero-length frames are
/// skipped. An oversized frame is drained from the stream so the next read
/// stays aligned, then reported as [`FrameError::TooLarge`].
pub async fn read_frame<R>(
    reader: &mut R,
    prefix: LengthPrefix,
    max_bytes: usize,
) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let len = match prefix {
            LengthPrefix::LittleEndian => reader.read_u32_le().await,
            LengthPrefix::BigEndian => reader.read_u32().await,
        };
        let len = match len {
            Ok(len) => len as usize,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(FrameError::Io(err)),
        };
        if len == 0 {
            continue;
        }
        if len > max_bytes {
            let mut limited = (&mut *reader).take(len as u64);
            tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;
            return Err(FrameError::TooLarge {
                frame_bytes: len,
                max_bytes,
            });
        }
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await?;
        return Ok(Some(buf));
    }
}

pub async fn write_frame<W>(
    writer: &mut W,
    prefix: LengthPrefix,
    payload: &[u8],
    max_bytes: usize,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > max_bytes {
        return Err(FrameError::TooLarge {
            frame_bytes: payload.len(),
            max_bytes,
        });
    }
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::TooLarge {
        frame_bytes: payload.len(),
        max_bytes: u32::MAX as usize,
    })?;
    match prefix {
        LengthPrefix::LittleEndian => writer.write_u32_le(len).await?,
        LengthPrefix::BigEndian => writer.write_u32(len).await?,
    }
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_json_frame<R>(
    reader: &mut R,
    prefix: LengthPrefix,
    max_bytes: usize,
) -> Result<Option<Value>, FrameError>
where
    R: AsyncRead + Unpin,
{
    match read_frame(reader, prefix, max_bytes).await? {
        Some(body) => Ok(Some(serde_json::from_slice(&body)?)),
        None => Ok(None),
    }
}

pub async fn write_json_frame<W>(
    writer: &mut W,
    prefix: LengthPrefix,
    value: &Value,
    max_bytes: usize,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(value)?;
    write_frame(writer, prefix, &body, max_bytes).await
}
