//! Framing codec.
//!
//! Frame layout on the wire (all integers little-endian):
//!
//! ```text
//! [0..4]  payload length L (u32)
//! [4]     kind tag (u8)
//! [5..]   body, field order fixed per kind
//! ```
//!
//! Within a body, strings and byte arrays are `u32 len || raw bytes`,
//! 64-bit integers are 8 bytes, booleans one byte (0 or 1). The codec only
//! frames and unframes; it never inspects sequence semantics.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::message::Message;

/// Ceiling on the declared payload length of a single frame. Large enough
/// for the biggest permitted chunk-carrying frame with headroom.
pub const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// Protocol-level chunk size for `FILE_DATA` payloads. The sender chunks at
/// this size and the hub derives expected-chunk-count from it; only the last
/// chunk of a transfer may be shorter.
pub const CHUNK_SIZE: usize = 8192;

/// Largest file a peer may offer.
pub const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Decode failure. Any of these is fatal to the connection that produced
/// the frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame payload")]
    Empty,
    #[error("unknown message kind 0x{0:02x}")]
    UnknownKind(u8),
    #[error("truncated frame: {field} needs {wanted} more bytes")]
    Truncated { field: &'static str, wanted: usize },
    #[error("length of {field} out of range: {len}")]
    BadLength { field: &'static str, len: u32 },
    #[error("{field} is not valid UTF-8")]
    BadUtf8 { field: &'static str },
    #[error("{field} is negative: {value}")]
    Negative { field: &'static str, value: i64 },
    #[error("{field} is not a boolean: {value}")]
    BadBool { field: &'static str, value: u8 },
    #[error("{0} trailing bytes after message body")]
    Trailing(usize),
}

/// Serializes a message into a frame payload (without the 4-byte length
/// prefix). Never fails for a well-formed value.
pub fn encode(msg: &Message) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u8(msg.kind());
    match msg {
        Message::Chat {
            sender,
            target,
            content,
        } => {
            put_str(&mut buf, sender);
            put_str(&mut buf, target);
            put_str(&mut buf, content);
        }
        Message::FileStart {
            sender,
            target,
            transfer_id,
            file_name,
            file_size,
        } => {
            put_str(&mut buf, sender);
            put_str(&mut buf, target);
            put_str(&mut buf, transfer_id);
            put_str(&mut buf, file_name);
            buf.put_i64_le(*file_size as i64);
        }
        Message::FileData {
            sender,
            target,
            transfer_id,
            seq,
            data,
        } => {
            put_str(&mut buf, sender);
            put_str(&mut buf, target);
            put_str(&mut buf, transfer_id);
            buf.put_u32_le(*seq);
            buf.put_u32_le(data.len() as u32);
            buf.put_slice(data);
        }
        Message::FileEnd {
            sender,
            target,
            transfer_id,
            success,
            error,
        } => {
            put_str(&mut buf, sender);
            put_str(&mut buf, target);
            put_str(&mut buf, transfer_id);
            buf.put_u8(u8::from(*success));
            put_str(&mut buf, error);
        }
        Message::Ack {
            sender,
            target,
            transfer_id,
            seq,
        } => {
            put_str(&mut buf, sender);
            put_str(&mut buf, target);
            put_str(&mut buf, transfer_id);
            buf.put_u32_le(*seq);
        }
        Message::Error {
            sender,
            target,
            description,
        } => {
            put_str(&mut buf, sender);
            put_str(&mut buf, target);
            put_str(&mut buf, description);
        }
        Message::ClientConnect {
            sender,
            client_name,
        } => {
            put_str(&mut buf, sender);
            put_str(&mut buf, client_name);
        }
        Message::ClientDisconnect { sender, reason } => {
            put_str(&mut buf, sender);
            put_str(&mut buf, reason);
        }
        Message::ClientIdResponse { sender, client_id } => {
            put_str(&mut buf, sender);
            put_str(&mut buf, client_id);
        }
        Message::DownloadAccept {
            sender,
            transfer_id,
        }
        | Message::DownloadReject {
            sender,
            transfer_id,
        }
        | Message::UploadConfirmed {
            sender,
            transfer_id,
        } => {
            put_str(&mut buf, sender);
            put_str(&mut buf, transfer_id);
        }
    }
    buf.freeze()
}

/// Parses one complete frame payload. Rejects truncation, out-of-range
/// length fields, unknown kind tags, and trailing garbage.
pub fn decode(payload: &[u8]) -> Result<Message, FrameError> {
    let mut r = Reader { buf: payload };
    let kind = r.u8("kind").map_err(|_| FrameError::Empty)?;

    let msg = match kind {
        0x01 => Message::Chat {
            sender: r.string("sender")?,
            target: r.string("target")?,
            content: r.string("content")?,
        },
        0x02 => Message::FileStart {
            sender: r.string("sender")?,
            target: r.string("target")?,
            transfer_id: r.string("transferId")?,
            file_name: r.string("fileName")?,
            file_size: r.non_negative_i64("fileSize")?,
        },
        0x03 => Message::FileData {
            sender: r.string("sender")?,
            target: r.string("target")?,
            transfer_id: r.string("transferId")?,
            seq: r.u32_le("seq")?,
            data: r.bytes("data")?,
        },
        0x04 => Message::FileEnd {
            sender: r.string("sender")?,
            target: r.string("target")?,
            transfer_id: r.string("transferId")?,
            success: r.bool("success")?,
            error: r.string("errorMessage")?,
        },
        0x05 => Message::Ack {
            sender: r.string("sender")?,
            target: r.string("target")?,
            transfer_id: r.string("transferId")?,
            seq: r.u32_le("seq")?,
        },
        0x06 => Message::Error {
            sender: r.string("sender")?,
            target: r.string("target")?,
            description: r.string("errorDescription")?,
        },
        0x07 => Message::ClientConnect {
            sender: r.string("sender")?,
            client_name: r.string("clientName")?,
        },
        0x08 => Message::ClientDisconnect {
            sender: r.string("sender")?,
            reason: r.string("reason")?,
        },
        0x09 => Message::ClientIdResponse {
            sender: r.string("sender")?,
            client_id: r.string("clientId")?,
        },
        0x0A => Message::DownloadAccept {
            sender: r.string("sender")?,
            transfer_id: r.string("transferId")?,
        },
        0x0B => Message::DownloadReject {
            sender: r.string("sender")?,
            transfer_id: r.string("transferId")?,
        },
        0x0C => Message::UploadConfirmed {
            sender: r.string("sender")?,
            transfer_id: r.string("transferId")?,
        },
        other => return Err(FrameError::UnknownKind(other)),
    };

    if !r.buf.is_empty() {
        return Err(FrameError::Trailing(r.buf.len()));
    }
    Ok(msg)
}

/// Bounds-checked cursor over a frame payload.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], FrameError> {
        if self.buf.len() < n {
            return Err(FrameError::Truncated {
                field,
                wanted: n - self.buf.len(),
            });
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, FrameError> {
        Ok(self.take(1, field)?[0])
    }

    fn bool(&mut self, field: &'static str) -> Result<bool, FrameError> {
        match self.u8(field)? {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(FrameError::BadBool { field, value }),
        }
    }

    fn u32_le(&mut self, field: &'static str) -> Result<u32, FrameError> {
        let raw = self.take(4, field)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn non_negative_i64(&mut self, field: &'static str) -> Result<u64, FrameError> {
        let raw = self.take(8, field)?;
        let value = i64::from_le_bytes([
            raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
        ]);
        if value < 0 {
            return Err(FrameError::Negative { field, value });
        }
        Ok(value as u64)
    }

    /// A `u32 len || raw` field. The length must fit in the remaining
    /// payload; values with the sign bit set are rejected outright.
    fn raw_prefixed(&mut self, field: &'static str) -> Result<&'a [u8], FrameError> {
        let len = self.u32_le(field)?;
        if len > i32::MAX as u32 {
            return Err(FrameError::BadLength { field, len });
        }
        self.take(len as usize, field)
    }

    fn string(&mut self, field: &'static str) -> Result<String, FrameError> {
        let raw = self.raw_prefixed(field)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| FrameError::BadUtf8 { field })
    }

    fn bytes(&mut self, field: &'static str) -> Result<Bytes, FrameError> {
        Ok(Bytes::copy_from_slice(self.raw_prefixed(field)?))
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}
