//! Replication Frame Codec
//!
//! ## Inbound (primary -> standby)
//!
//! ```text
//! 'w' ┌─────────────────────────────────┐
//!     │ start_pos: u64 BE               │
//!     │ wal_end:   u64 BE               │
//!     │ send_time: i64 BE (micros)      │
//!     │ body: raw log bytes             │
//!     └─────────────────────────────────┘
//! 'k' ┌─────────────────────────────────┐
//!     │ wal_end:   u64 BE               │
//!     │ send_time: i64 BE (micros)      │
//!     │ reply_requested: u8             │
//!     └─────────────────────────────────┘
//! ```
//!
//! ## Outbound (standby -> primary)
//!
//! ```text
//! 'r' write/flush/apply positions + timestamp + reply-requested flag
//! 'h' timestamp + xmin/epoch + catalog_xmin/epoch
//! ```
//!
//! All integers are network byte order. The decoder keeps no state across
//! frames; every call parses one complete frame from a fresh buffer.

use crate::lsn::{Lsn, TimestampMicros};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Inbound frame tags.
pub const MSG_WAL_DATA: u8 = b'w';
pub const MSG_KEEPALIVE: u8 = b'k';

/// Outbound frame tags.
pub const MSG_STATUS_UPDATE: u8 = b'r';
pub const MSG_HS_FEEDBACK: u8 = b'h';

/// Header size of a `'w'` frame: start + wal_end + send_time.
pub const WAL_DATA_HEADER_LEN: usize = 24;
/// Exact payload size of a `'k'` frame.
pub const KEEPALIVE_LEN: usize = 17;

/// A decoded frame from the primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalSenderMessage {
    /// Log bytes starting at `start`, to be written at that exact position.
    WalData {
        start: Lsn,
        wal_end: Lsn,
        send_time: TimestampMicros,
        body: Bytes,
    },
    /// Liveness frame carrying no log bytes.
    Keepalive {
        wal_end: Lsn,
        send_time: TimestampMicros,
        reply_requested: bool,
    },
}

/// Protocol violation detected while decoding an inbound frame. All of
/// these end the streaming attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum ProtocolError {
    /// Empty frame (no tag byte).
    EmptyFrame,
    /// Tag byte was neither `'w'` nor `'k'`.
    InvalidMessageType(u8),
    /// `'w'` payload shorter than its fixed header.
    ShortWalHeader { expected: usize, actual: usize },
    /// `'k'` payload length mismatch (must be exact).
    BadKeepaliveLength { expected: usize, actual: usize },
    /// The primary reported a history file under an unexpected name.
    UnexpectedHistoryFileName { expected: String, actual: String },
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::EmptyFrame => write!(f, "empty replication frame"),
            ProtocolError::InvalidMessageType(tag) => {
                write!(f, "invalid replication message type {:#04x}", tag)
            }
            ProtocolError::ShortWalHeader { expected, actual } => write!(
                f,
                "invalid WAL data message: header needs {} bytes, got {}",
                expected, actual
            ),
            ProtocolError::BadKeepaliveLength { expected, actual } => write!(
                f,
                "invalid keepalive message: expected {} bytes, got {}",
                expected, actual
            ),
            ProtocolError::UnexpectedHistoryFileName { expected, actual } => write!(
                f,
                "primary reported unexpected history file name: expected {}, got {}",
                expected, actual
            ),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl WalSenderMessage {
    /// Decode one complete frame (tag byte plus payload).
    pub fn decode(frame: Bytes) -> Result<Self, ProtocolError> {
        let mut buf = frame;
        if buf.is_empty() {
            return Err(ProtocolError::EmptyFrame);
        }
        let tag = buf.get_u8();

        match tag {
            MSG_WAL_DATA => {
                if buf.remaining() < WAL_DATA_HEADER_LEN {
                    return Err(ProtocolError::ShortWalHeader {
                        expected: WAL_DATA_HEADER_LEN,
                        actual: buf.remaining(),
                    });
                }
                let start = Lsn(buf.get_u64());
                let wal_end = Lsn(buf.get_u64());
                let send_time = buf.get_i64();
                Ok(WalSenderMessage::WalData {
                    start,
                    wal_end,
                    send_time,
                    body: buf,
                })
            }
            MSG_KEEPALIVE => {
                if buf.remaining() != KEEPALIVE_LEN {
                    return Err(ProtocolError::BadKeepaliveLength {
                        expected: KEEPALIVE_LEN,
                        actual: buf.remaining(),
                    });
                }
                let wal_end = Lsn(buf.get_u64());
                let send_time = buf.get_i64();
                let reply_requested = buf.get_u8() != 0;
                Ok(WalSenderMessage::Keepalive {
                    wal_end,
                    send_time,
                    reply_requested,
                })
            }
            other => Err(ProtocolError::InvalidMessageType(other)),
        }
    }
}

/// An outbound frame to the primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StandbyMessage {
    /// Progress report: how far we have written, flushed, and applied.
    StatusUpdate {
        write: Lsn,
        flush: Lsn,
        apply: Lsn,
        send_time: TimestampMicros,
        reply_requested: bool,
    },
    /// Oldest transaction ids standby-side queries still need. Zero xids
    /// tell the primary to forget this standby's horizon.
    HotStandbyFeedback {
        send_time: TimestampMicros,
        xmin: u32,
        xmin_epoch: u32,
        catalog_xmin: u32,
        catalog_xmin_epoch: u32,
    },
}

impl StandbyMessage {
    /// Encode to a complete frame, tag byte included.
    pub fn encode(&self) -> Bytes {
        match *self {
            StandbyMessage::StatusUpdate {
                write,
                flush,
                apply,
                send_time,
                reply_requested,
            } => {
                let mut buf = BytesMut::with_capacity(34);
                buf.put_u8(MSG_STATUS_UPDATE);
                buf.put_u64(write.0);
                buf.put_u64(flush.0);
                buf.put_u64(apply.0);
                buf.put_i64(send_time);
                buf.put_u8(u8::from(reply_requested));
                buf.freeze()
            }
            StandbyMessage::HotStandbyFeedback {
                send_time,
                xmin,
                xmin_epoch,
                catalog_xmin,
                catalog_xmin_epoch,
            } => {
                let mut buf = BytesMut::with_capacity(25);
                buf.put_u8(MSG_HS_FEEDBACK);
                buf.put_i64(send_time);
                buf.put_u32(xmin);
                buf.put_u32(xmin_epoch);
                buf.put_u32(catalog_xmin);
                buf.put_u32(catalog_xmin_epoch);
                buf.freeze()
            }
        }
    }

    /// Decode an outbound frame. Used by test doubles standing in for the
    /// primary; production code only encodes.
    pub fn decode(frame: &[u8]) -> Option<Self> {
        let mut buf = frame;
        if buf.is_empty() {
            return None;
        }
        let tag = buf.get_u8();
        match tag {
            MSG_STATUS_UPDATE if buf.remaining() == 33 => Some(StandbyMessage::StatusUpdate {
                write: Lsn(buf.get_u64()),
                flush: Lsn(buf.get_u64()),
                apply: Lsn(buf.get_u64()),
                send_time: buf.get_i64(),
                reply_requested: buf.get_u8() != 0,
            }),
            MSG_HS_FEEDBACK if buf.remaining() == 24 => Some(StandbyMessage::HotStandbyFeedback {
                send_time: buf.get_i64(),
                xmin: buf.get_u32(),
                xmin_epoch: buf.get_u32(),
                catalog_xmin: buf.get_u32(),
                catalog_xmin_epoch: buf.get_u32(),
            }),
            _ => None,
        }
    }
}

/// Build a `'w'` frame. Test-double helper; production receivers never
/// send WAL data.
pub fn encode_wal_data(start: Lsn, wal_end: Lsn, send_time: TimestampMicros, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + WAL_DATA_HEADER_LEN + body.len());
    buf.put_u8(MSG_WAL_DATA);
    buf.put_u64(start.0);
    buf.put_u64(wal_end.0);
    buf.put_i64(send_time);
    buf.put_slice(body);
    buf.freeze()
}

/// Build a `'k'` frame. Test-double helper.
pub fn encode_keepalive(wal_end: Lsn, send_time: TimestampMicros, reply_requested: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + KEEPALIVE_LEN);
    buf.put_u8(MSG_KEEPALIVE);
    buf.put_u64(wal_end.0);
    buf.put_i64(send_time);
    buf.put_u8(u8::from(reply_requested));
    buf.freeze()
}
