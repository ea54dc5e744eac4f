//! Chunked message reassembly and splitting.
//!
//! A chunked message is one `header`, any number of `data` frames carrying
//! base64 fragments, and a `footer` with the SHA-256 hex digest of the raw
//! bytes. The reassembler keeps a bounded table of open messages behind a
//! single mutex; the digest is computed after the entry has been detached.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::{FrameError, InboundMessage};

pub const DEFAULT_MAX_IN_FLIGHT: usize = 15;
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(120);
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 50 * 1024 * 1024;

/// Bytes reserved for the JSON envelope around each data fragment.
const CHUNK_ENVELOPE_OVERHEAD: usize = 256;

const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_allow_trailing_bits(true)
        .with_decode_padding_mode(DecodePaddingMode::RequireNone),
);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Chunk {
    Header {
        message_id: String,
        #[serde(default)]
        total_chunks: u64,
        total_size_bytes: u64,
    },
    Data {
        message_id: String,
        data: String,
    },
    Footer {
        message_id: String,
        checksum_verify: String,
    },
}

impl Chunk {
    pub fn message_id(&self) -> &str {
        match self {
            Chunk::Header { message_id, .. }
            | Chunk::Data { message_id, .. }
            | Chunk::Footer { message_id, .. } => message_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFrame {
    #[serde(alias = "bloom_chunk")]
    pub chunk: Chunk,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkErrorKind {
    #[error("malformed chunk: {0}")]
    Malformed(String),
    #[error("chunk has an empty message id")]
    EmptyMessageId,
    #[error("chunk references unknown message {0}")]
    UnknownMessage(String),
    #[error("message {message_id} declares {declared} bytes, limit is {limit}")]
    TooLarge {
        message_id: String,
        declared: u64,
        limit: usize,
    },
    #[error("message {message_id} grew past {limit} bytes")]
    Overflow { message_id: String, limit: usize },
    #[error("invalid base64 in message {message_id}: {reason}")]
    InvalidBase64 { message_id: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Incomplete,
    CompleteValid(Vec<u8>),
    CompleteInvalidChecksum,
    ChunkError(ChunkErrorKind),
}

#[derive(Debug, Clone)]
pub struct ReassemblerConfig {
    pub max_in_flight: usize,
    pub stale_after: Duration,
    pub max_message_bytes: usize,
    pub strict_base64: bool,
}

impl Default for ReassemblerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            stale_after: DEFAULT_STALE_AFTER,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            strict_base64: false,
        }
    }
}

#[derive(Debug)]
struct InProgressMessage {
    buffer: Vec<u8>,
    expected_size: u64,
    total_chunks: u64,
    received_chunks: u64,
    started_at: Instant,
    last_chunk_at: Instant,
}

#[derive(Debug)]
pub struct ChunkReassembler {
    config: ReassemblerConfig,
    active: Mutex<HashMap<String, InProgressMessage>>,
}

impl Default for ChunkReassembler {
    fn default() -> Self {
        Self::new(ReassemblerConfig::default())
    }
}

impl ChunkReassembler {
    pub fn new(config: ReassemblerConfig) -> Self {
        Self {
            config,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn process(&self, frame: &Value) -> ChunkOutcome {
        self.process_at(frame, Instant::now())
    }

    pub fn process_at(&self, frame: &Value, now: Instant) -> ChunkOutcome {
        match ChunkFrame::deserialize(frame) {
            Ok(parsed) => self.process_chunk(parsed.chunk, now),
            Err(err) => ChunkOutcome::ChunkError(ChunkErrorKind::Malformed(err.to_string())),
        }
    }

    pub fn process_chunk(&self, chunk: Chunk, now: Instant) -> ChunkOutcome {
        if chunk.message_id().is_empty() {
            return ChunkOutcome::ChunkError(ChunkErrorKind::EmptyMessageId);
        }
        match chunk {
            Chunk::Header {
                message_id,
                total_chunks,
                total_size_bytes,
            } => self.open(message_id, total_chunks, total_size_bytes, now),
            Chunk::Data { message_id, data } => self.append(&message_id, &data, now),
            Chunk::Footer {
                message_id,
                checksum_verify,
            } => self.finish(&message_id, &checksum_verify),
        }
    }

    fn open(
        &self,
        message_id: String,
        total_chunks: u64,
        total_size: u64,
        now: Instant,
    ) -> ChunkOutcome {
        let limit = self.config.max_message_bytes;
        if total_size > limit as u64 {
            return ChunkOutcome::ChunkError(ChunkErrorKind::TooLarge {
                message_id,
                declared: total_size,
                limit,
            });
        }

        let mut active = self.lock();
        purge_stale_locked(&mut active, now, self.config.stale_after);

        if !active.contains_key(&message_id) && active.len() >= self.config.max_in_flight {
            let oldest = active
                .iter()
                .min_by_key(|(_, entry)| entry.last_chunk_at)
                .map(|(id, _)| id.clone());
            if let Some(evicted) = oldest {
                active.remove(&evicted);
                tracing::warn!(
                    message_id = %evicted,
                    max_in_flight = self.config.max_in_flight,
                    "chunk table full, evicted least recently active message"
                );
            }
        }

        let entry = InProgressMessage {
            buffer: Vec::with_capacity(total_size as usize),
            expected_size: total_size,
            total_chunks,
            received_chunks: 0,
            started_at: now,
            last_chunk_at: now,
        };
        if active.insert(message_id.clone(), entry).is_some() {
            tracing::warn!(message_id = %message_id, "duplicate chunk header, restarting message");
        } else {
            tracing::debug!(
                message_id = %message_id,
                total_chunks,
                total_size,
                "chunked message started"
            );
        }
        ChunkOutcome::Incomplete
    }

    fn append(&self, message_id: &str, data: &str, now: Instant) -> ChunkOutcome {
        let decoded = decode_fragment(data, self.config.strict_base64);

        let mut active = self.lock();
        let Some(entry) = active.get_mut(message_id) else {
            return ChunkOutcome::ChunkError(ChunkErrorKind::UnknownMessage(
                message_id.to_string(),
            ));
        };

        let bytes = match decoded {
            Ok(bytes) => bytes,
            Err(reason) => {
                active.remove(message_id);
                return ChunkOutcome::ChunkError(ChunkErrorKind::InvalidBase64 {
                    message_id: message_id.to_string(),
                    reason,
                });
            }
        };

        let limit = self.config.max_message_bytes;
        if entry.buffer.len() + bytes.len() > limit {
            active.remove(message_id);
            return ChunkOutcome::ChunkError(ChunkErrorKind::Overflow {
                message_id: message_id.to_string(),
                limit,
            });
        }

        entry.buffer.extend_from_slice(&bytes);
        entry.received_chunks += 1;
        entry.last_chunk_at = now;
        ChunkOutcome::Incomplete
    }

    fn finish(&self, message_id: &str, checksum: &str) -> ChunkOutcome {
        let entry = self.lock().remove(message_id);
        let Some(entry) = entry else {
            return ChunkOutcome::ChunkError(ChunkErrorKind::UnknownMessage(
                message_id.to_string(),
            ));
        };

        if entry.received_chunks != entry.total_chunks {
            tracing::warn!(
                message_id = %message_id,
                received = entry.received_chunks,
                expected = entry.total_chunks,
                "chunk count mismatch"
            );
        }
        if entry.buffer.len() as u64 != entry.expected_size {
            tracing::debug!(
                message_id = %message_id,
                received = entry.buffer.len(),
                expected = entry.expected_size,
                "chunk size mismatch"
            );
        }

        let digest = sha256_hex(&entry.buffer);
        if digest == checksum {
            tracing::debug!(
                message_id = %message_id,
                bytes = entry.buffer.len(),
                elapsed_ms = entry.last_chunk_at.duration_since(entry.started_at).as_millis() as u64,
                "chunked message verified"
            );
            ChunkOutcome::CompleteValid(entry.buffer)
        } else {
            tracing::warn!(
                message_id = %message_id,
                expected = %checksum,
                actual = %digest,
                "chunk checksum mismatch, message discarded"
            );
            ChunkOutcome::CompleteInvalidChecksum
        }
    }

    /// Drops every message whose last chunk is older than the stale window.
    pub fn purge_stale(&self, now: Instant) -> usize {
        let mut active = self.lock();
        purge_stale_locked(&mut active, now, self.config.stale_after)
    }

    pub fn clear(&self) {
        let mut active = self.lock();
        if !active.is_empty() {
            tracing::info!(count = active.len(), "discarding in-flight chunked messages");
        }
        active.clear();
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, InProgressMessage>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn purge_stale_locked(
    active: &mut HashMap<String, InProgressMessage>,
    now: Instant,
    stale_after: Duration,
) -> usize {
    let before = active.len();
    active.retain(|message_id, entry| {
        let keep = now.saturating_duration_since(entry.last_chunk_at) < stale_after;
        if !keep {
            tracing::warn!(message_id = %message_id, "stale chunked message discarded");
        }
        keep
    });
    before - active.len()
}

fn decode_fragment(data: &str, strict: bool) -> Result<Vec<u8>, String> {
    if strict {
        return STANDARD.decode(data).map_err(|err| err.to_string());
    }
    let symbols: Vec<u8> = data
        .bytes()
        .take_while(|b| *b != b'=')
        .filter(|b| b.is_ascii_alphanumeric() || *b == b'+' || *b == b'/')
        .collect();
    // A lone trailing symbol carries fewer than eight bits.
    let usable = if symbols.len() % 4 == 1 {
        symbols.len() - 1
    } else {
        symbols.len()
    };
    LENIENT
        .decode(&symbols[..usable])
        .map_err(|err| err.to_string())
}

/// Classifies an inbound frame, feeding chunk frames through `reassembler`.
/// Returns `None` while a chunked message is still incomplete and for every
/// frame that has to be dropped.
pub fn assemble_inbound(
    reassembler: &ChunkReassembler,
    value: Value,
    now: Instant,
) -> Option<InboundMessage> {
    let message = match InboundMessage::classify(value) {
        Ok(message) => message,
        Err(err) => {
            tracing::warn!(error = %err, "dropping malformed frame");
            return None;
        }
    };
    let frame = match message {
        InboundMessage::Chunk(frame) => frame,
        other => return Some(other),
    };

    let bytes = match reassembler.process_at(&frame, now) {
        ChunkOutcome::Incomplete | ChunkOutcome::CompleteInvalidChecksum => return None,
        ChunkOutcome::CompleteValid(bytes) => bytes,
        ChunkOutcome::ChunkError(kind) => {
            tracing::warn!(error = %kind, "chunk rejected");
            return None;
        }
    };
    let assembled = serde_json::from_slice::<Value>(&bytes)
        .map_err(FrameError::from)
        .and_then(InboundMessage::classify);
    match assembled {
        Ok(InboundMessage::Chunk(_)) => {
            tracing::warn!("nested chunk frame dropped");
            None
        }
        Ok(message) => Some(message),
        Err(err) => {
            tracing::warn!(error = %err, "reassembled message is not a valid frame");
            None
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub struct ChunkEncoder;

impl ChunkEncoder {
    /// Splits raw bytes into header, data and footer frames.
    pub fn split(message_id: &str, bytes: &[u8], chunk_bytes: usize) -> Vec<ChunkFrame> {
        let chunk_bytes = chunk_bytes.max(1);
        let pieces: Vec<&[u8]> = bytes.chunks(chunk_bytes).collect();
        let mut frames = Vec::with_capacity(pieces.len() + 2);
        frames.push(ChunkFrame {
            chunk: Chunk::Header {
                message_id: message_id.to_string(),
                total_chunks: pieces.len() as u64,
                total_size_bytes: bytes.len() as u64,
            },
        });
        frames.extend(pieces.into_iter().map(|piece| ChunkFrame {
            chunk: Chunk::Data {
                message_id: message_id.to_string(),
                data: STANDARD.encode(piece),
            },
        }));
        frames.push(ChunkFrame {
            chunk: Chunk::Footer {
                message_id: message_id.to_string(),
                checksum_verify: sha256_hex(bytes),
            },
        });
        frames
    }

    /// Returns the value itself when it fits in `frame_limit` bytes,
    /// otherwise the chunk frames that carry it.
    pub fn encode_message(value: Value, frame_limit: usize) -> Result<Vec<Value>, serde_json::Error> {
        let body = serde_json::to_vec(&value)?;
        if body.len() <= frame_limit {
            return Ok(vec![value]);
        }
        let chunk_bytes = (frame_limit.saturating_sub(CHUNK_ENVELOPE_OVERHEAD) / 4 * 3).max(3);
        let message_id = Uuid::new_v4().to_string();
        tracing::debug!(
            message_id = %message_id,
            bytes = body.len(),
            chunk_bytes,
            "chunking oversized message"
        );
        Self::split(&message_id, &body, chunk_bytes)
            .iter()
            .map(serde_json::to_value)
            .collect()
    }
}
