//! Replicated messages and the blob codec.
//!
//! A message is created once on its origin node and never changes after
//! that. Its blob is the flattened form the transport moves around; the
//! transport never looks inside it beyond its length.
//!
//! Blob layout (all integers big-endian):
//!
//! ```text
//!   0  origin_id     u32
//!   4  message_id    u32
//!   8  timestamp     u32   seconds since the Unix epoch
//!  12  type_id       u16
//!  14  signature     [u8; 128]  currently all zero
//! 142  payload       ..
//! ```

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the signature block carried in every blob.
pub const SIGNATURE_SIZE: usize = 128;

/// Fixed header size preceding the payload.
pub const BLOB_HEADER_LEN: usize = 4 + 4 + 4 + 2 + SIGNATURE_SIZE;

// ── Message types ─────────────────────────────────────────────────────────────

/// The registry of message types this build knows how to apply.
///
/// A blob carrying any other type id cannot be materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    CreateServer = 0x0001,
    CreateUser = 0x0002,
    UpdatePassword = 0x0003,
    ProblemUpdate = 0x0004,
    Submission = 0x0005,
    StartStop = 0x0006,
    SubmissionMark = 0x0007,
    Clarification = 0x0008,
    CreateGroup = 0x0009,
}

impl MessageType {
    pub fn name(self) -> &'static str {
        match self {
            Self::CreateServer => "create_server",
            Self::CreateUser => "create_user",
            Self::UpdatePassword => "update_password",
            Self::ProblemUpdate => "problem_update",
            Self::Submission => "submission",
            Self::StartStop => "start_stop",
            Self::SubmissionMark => "submission_mark",
            Self::Clarification => "clarification",
            Self::CreateGroup => "create_group",
        }
    }
}

impl TryFrom<u16> for MessageType {
    type Error = CodecError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0001 => Ok(Self::CreateServer),
            0x0002 => Ok(Self::CreateUser),
            0x0003 => Ok(Self::UpdatePassword),
            0x0004 => Ok(Self::ProblemUpdate),
            0x0005 => Ok(Self::Submission),
            0x0006 => Ok(Self::StartStop),
            0x0007 => Ok(Self::SubmissionMark),
            0x0008 => Ok(Self::Clarification),
            0x0009 => Ok(Self::CreateGroup),
            other => Err(CodecError::UnknownType(other)),
        }
    }
}

impl From<MessageType> for u16 {
    fn from(t: MessageType) -> u16 {
        t as u16
    }
}

// ── Message key ───────────────────────────────────────────────────────────────

/// Global primary key of a message: the origin node plus its local id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageKey {
    pub origin_id: u32,
    pub message_id: u32,
}

impl MessageKey {
    pub fn new(origin_id: u32, message_id: u32) -> Self {
        Self {
            origin_id,
            message_id,
        }
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.origin_id, self.message_id)
    }
}

// ── Message ───────────────────────────────────────────────────────────────────

/// An immutable replicated message.
///
/// The blob is built once at construction (or kept as received) and the
/// payload is a view into it, so handing the blob to the transport never
/// copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    key: MessageKey,
    timestamp: u32,
    message_type: MessageType,
    blob: Bytes,
}

impl Message {
    /// Build a new message with an empty signature.
    pub fn new(
        origin_id: u32,
        message_id: u32,
        timestamp: u32,
        message_type: MessageType,
        payload: &[u8],
    ) -> Self {
        let mut buf = BytesMut::with_capacity(BLOB_HEADER_LEN + payload.len());
        buf.put_u32(origin_id);
        buf.put_u32(message_id);
        buf.put_u32(timestamp);
        buf.put_u16(message_type.into());
        buf.put_bytes(0, SIGNATURE_SIZE);
        buf.put_slice(payload);

        Self {
            key: MessageKey::new(origin_id, message_id),
            timestamp,
            message_type,
            blob: buf.freeze(),
        }
    }

    /// Build a new message stamped with the current wall-clock time.
    pub fn stamped(
        origin_id: u32,
        message_id: u32,
        message_type: MessageType,
        payload: &[u8],
    ) -> Self {
        Self::new(origin_id, message_id, unix_now(), message_type, payload)
    }

    /// Materialize a message from a complete blob. Takes ownership of the
    /// buffer; on success the message keeps it without copying.
    pub fn decode(blob: impl Into<Bytes>) -> Result<Self, CodecError> {
        let blob = blob.into();
        if blob.len() < BLOB_HEADER_LEN {
            return Err(CodecError::TooShort(blob.len()));
        }

        let origin_id = read_u32(&blob, 0);
        let message_id = read_u32(&blob, 4);
        let timestamp = read_u32(&blob, 8);
        let type_id = u16::from_be_bytes([blob[12], blob[13]]);
        let message_type = MessageType::try_from(type_id)?;

        Ok(Self {
            key: MessageKey::new(origin_id, message_id),
            timestamp,
            message_type,
            blob,
        })
    }

    pub fn key(&self) -> MessageKey {
        self.key
    }

    pub fn origin_id(&self) -> u32 {
        self.key.origin_id
    }

    pub fn message_id(&self) -> u32 {
        self.key.message_id
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn type_id(&self) -> u16 {
        self.message_type.into()
    }

    pub fn signature(&self) -> &[u8] {
        &self.blob[14..BLOB_HEADER_LEN]
    }

    pub fn payload(&self) -> Bytes {
        self.blob.slice(BLOB_HEADER_LEN..)
    }

    /// The flattened encoding. Cheap to clone.
    pub fn blob(&self) -> &Bytes {
        &self.blob
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Seconds since the Unix epoch, saturating into 32 bits.
pub fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().min(u32::MAX as u64) as u32)
        .unwrap_or(0)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("blob of {0} bytes is shorter than the {}-byte header", BLOB_HEADER_LEN)]
    TooShort(usize),

    #[error("unknown message type id: 0x{0:04x}")]
    UnknownType(u16),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
