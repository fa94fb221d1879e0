//! Abacus wire format: the plaintext content of one peer datagram.
//!
//! These functions ARE the protocol between nodes. Every field and its
//! width is fixed; changing any of it requires restarting the whole fleet
//! on the new build at once.
//!
//! All integers are big-endian and encoded field by field. Nothing here
//! reinterprets a Rust struct as wire bytes.
//!
//! ```text
//!  0  checksum        u32
//!  4  sender_id       u32   node that sent THIS datagram
//!  8  origin_id       u32   node that created the message
//! 12  message_id      u32
//! 16  fragment word   u16   0 = ack; else bits 0-14 fragment number,
//!                           bit 15 set on the last fragment
//! 18  len / acker     u32   data: fragment length; ack: acking node id
//! 22  fragment bytes  ..    data frames only
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::message::MessageKey;

/// Encoded frame header size.
pub const FRAME_HEADER_LEN: usize = 22;

/// Bit set in the fragment word on the final fragment of a blob.
pub const LAST_FRAGMENT_FLAG: u16 = 0x8000;

/// Largest fragment number that fits beside the last flag.
pub const MAX_FRAGMENT_NUM: u16 = 0x7fff;

/// Default UDP port for peer datagrams.
pub const DEFAULT_PEER_PORT: u16 = 7368;

// ── Checksum ──────────────────────────────────────────────────────────────────

/// XOR-fold checksum over `data`, starting from `seed`.
///
/// Every complete 4-byte big-endian word is XORed in; the 1–3 trailing
/// bytes are shifted together (`last = last << 8 | byte`) and XORed in as
/// a final word.
///
/// This only catches accidental corruption. A single flipped bit always
/// changes the result, but two flips in the same bit lane of different
/// words cancel, and a random corruption collides with probability 2^-32.
/// It is not a MAC.
pub fn checksum(seed: u32, data: &[u8]) -> u32 {
    let mut sum = seed;
    let mut words = data.chunks_exact(4);
    for w in &mut words {
        sum ^= u32::from_be_bytes([w[0], w[1], w[2], w[3]]);
    }
    let last = words
        .remainder()
        .iter()
        .fold(0u32, |acc, b| (acc << 8) | u32::from(*b));
    sum ^ last
}

// ── Frames ────────────────────────────────────────────────────────────────────

/// A node announcing it durably holds a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckFrame {
    pub sender_id: u32,
    pub key: MessageKey,
    pub acking_id: u32,
}

/// One fragment of a message blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub sender_id: u32,
    pub key: MessageKey,
    /// 1-based fragment index, never above `MAX_FRAGMENT_NUM`.
    pub fragment_num: u16,
    pub last: bool,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Ack(AckFrame),
    Data(DataFrame),
}

impl Frame {
    /// Encode to plaintext datagram bytes, filling in the checksum.
    pub fn encode(&self, seed: u32) -> Vec<u8> {
        match self {
            Frame::Ack(ack) => {
                let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN);
                put_header(&mut buf, 0, ack.sender_id, ack.key, 0, ack.acking_id);
                let sum = checksum(seed, &buf);
                buf[0..4].copy_from_slice(&sum.to_be_bytes());
                buf.to_vec()
            }
            Frame::Data(data) => {
                debug_assert!(data.fragment_num >= 1 && data.fragment_num <= MAX_FRAGMENT_NUM);
                let mut word = data.fragment_num & MAX_FRAGMENT_NUM;
                if data.last {
                    word |= LAST_FRAGMENT_FLAG;
                }
                let sum = checksum(seed, &data.payload);
                let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + data.payload.len());
                put_header(
                    &mut buf,
                    sum,
                    data.sender_id,
                    data.key,
                    word,
                    data.payload.len() as u32,
                );
                buf.put_slice(&data.payload);
                buf.to_vec()
            }
        }
    }

    /// Decode plaintext datagram bytes, verifying length and checksum.
    pub fn decode(buf: &[u8], seed: u32) -> Result<Frame, WireError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(WireError::Truncated(buf.len()));
        }

        let sum = read_u32(buf, 0);
        let sender_id = read_u32(buf, 4);
        let key = MessageKey::new(read_u32(buf, 8), read_u32(buf, 12));
        let word = u16::from_be_bytes([buf[16], buf[17]]);
        let len_or_acker = read_u32(buf, 18);

        if word == 0 {
            let mut header = [0u8; FRAME_HEADER_LEN];
            header.copy_from_slice(&buf[..FRAME_HEADER_LEN]);
            header[0..4].fill(0);
            let computed = checksum(seed, &header);
            if computed != sum {
                return Err(WireError::ChecksumMismatch {
                    carried: sum,
                    computed,
                });
            }
            return Ok(Frame::Ack(AckFrame {
                sender_id,
                key,
                acking_id: len_or_acker,
            }));
        }

        let fragment_num = word & MAX_FRAGMENT_NUM;
        if fragment_num == 0 {
            return Err(WireError::ZeroFragment);
        }

        let actual = buf.len() - FRAME_HEADER_LEN;
        if len_or_acker as usize != actual {
            return Err(WireError::LengthMismatch {
                declared: len_or_acker,
                actual,
            });
        }

        let payload = &buf[FRAME_HEADER_LEN..];
        let computed = checksum(seed, payload);
        if computed != sum {
            return Err(WireError::ChecksumMismatch {
                carried: sum,
                computed,
            });
        }

        Ok(Frame::Data(DataFrame {
            sender_id,
            key,
            fragment_num,
            last: word & LAST_FRAGMENT_FLAG != 0,
            payload: Bytes::copy_from_slice(payload),
        }))
    }
}

fn put_header(buf: &mut BytesMut, sum: u32, sender_id: u32, key: MessageKey, word: u16, tail: u32) {
    buf.put_u32(sum);
    buf.put_u32(sender_id);
    buf.put_u32(key.origin_id);
    buf.put_u32(key.message_id);
    buf.put_u16(word);
    buf.put_u32(tail);
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Reasons a decrypted datagram is not a usable frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("frame of {0} bytes is shorter than the {}-byte header", FRAME_HEADER_LEN)]
    Truncated(usize),

    #[error("fragment length field says {declared} bytes but {actual} arrived")]
    LengthMismatch { declared: u32, actual: usize },

    #[error("checksum mismatch: carried 0x{carried:08x}, computed 0x{computed:08x}")]
    ChecksumMismatch { carried: u32, computed: u32 },

    #[error("data frame with fragment number 0")]
    ZeroFragment,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
