//! Frame encoding and decoding
//!
//! Every message travels as one frame:
//!
//! ```text
//! +----------+------------------+
//! |  Length  |     Payload      |
//! |  4B LE   |  Length-4 bytes  |
//! +----------+------------------+
//! ```
//!
//! The length field is inclusive of itself; frames are capped at 128 KiB.
//! The payload is a self-describing tag-length-value rendering of the
//! message dictionary:
//!
//! ```text
//! value   := tag:1B body
//! int     := 0x01 i64-LE
//! string  := 0x02 len:u32-LE utf8-bytes
//! bytes   := 0x03 len:u32-LE raw-bytes
//! list    := 0x04 count:u32-LE value*
//! intlist := 0x05 count:u32-LE i64-LE*
//! map     := 0x06 count:u32-LE (keylen:u32-LE key-bytes value)*
//! ```
//!
//! A message payload is a single `map`. Map keys are emitted in sorted
//! order, so equal messages always encode to identical bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{Message, Value};
use crate::error::FrameError;

/// Size of the frame length field
pub const LENGTH_FIELD_LEN: usize = 4;

/// Maximum permitted frame length, length field included
pub const MAX_FRAME_LEN: usize = 131_072;

/// Maximum nesting depth of lists and maps
const MAX_DEPTH: usize = 16;

/// Value tag bytes
mod tag {
    pub const INT: u8 = 0x01;
    pub const STRING: u8 = 0x02;
    pub const BYTES: u8 = 0x03;
    pub const LIST: u8 = 0x04;
    pub const INT_LIST: u8 = 0x05;
    pub const MAP: u8 = 0x06;
}

/// Encode a message into a complete frame, length field included
///
/// # Errors
///
/// Returns `FrameError::Oversize` if the frame would exceed
/// [`MAX_FRAME_LEN`], and `FrameError::MissingCommand` /
/// `FrameError::UnknownCommand` if the message has no valid command.
#[allow(clippy::cast_possible_truncation)] // frame length is bounded by MAX_FRAME_LEN
pub fn encode_frame(message: &Message) -> Result<Bytes, FrameError> {
    message.command()?;

    let mut buf = BytesMut::with_capacity(256);
    buf.put_u32_le(0); // patched below
    encode_map(&mut buf, message.entries());

    if buf.len() > MAX_FRAME_LEN {
        return Err(FrameError::Oversize { length: buf.len() });
    }
    let length = buf.len() as u32;
    buf[..LENGTH_FIELD_LEN].copy_from_slice(&length.to_le_bytes());
    Ok(buf.freeze())
}

#[allow(clippy::cast_possible_truncation)] // lengths are bounded by MAX_FRAME_LEN at frame level
fn encode_value(buf: &mut BytesMut, value: &Value) {
    match value {
        Value::Int(v) => {
            buf.put_u8(tag::INT);
            buf.put_i64_le(*v);
        }
        Value::Str(s) => {
            buf.put_u8(tag::STRING);
            buf.put_u32_le(s.len() as u32);
            buf.put_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            buf.put_u8(tag::BYTES);
            buf.put_u32_le(b.len() as u32);
            buf.put_slice(b);
        }
        Value::List(items) => {
            buf.put_u8(tag::LIST);
            buf.put_u32_le(items.len() as u32);
            for item in items {
                encode_value(buf, item);
            }
        }
        Value::IntList(items) => {
            buf.put_u8(tag::INT_LIST);
            buf.put_u32_le(items.len() as u32);
            for item in items {
                buf.put_i64_le(*item);
            }
        }
        Value::Map(entries) => {
            buf.put_u8(tag::MAP);
            encode_map_body(buf, entries);
        }
    }
}

fn encode_map(buf: &mut BytesMut, entries: &std::collections::BTreeMap<String, Value>) {
    buf.put_u8(tag::MAP);
    encode_map_body(buf, entries);
}

#[allow(clippy::cast_possible_truncation)]
fn encode_map_body(buf: &mut BytesMut, entries: &std::collections::BTreeMap<String, Value>) {
    buf.put_u32_le(entries.len() as u32);
    for (key, value) in entries {
        buf.put_u32_le(key.len() as u32);
        buf.put_slice(key.as_bytes());
        encode_value(buf, value);
    }
}

/// Decode a frame payload (the bytes after the length field)
///
/// # Errors
///
/// Returns a `FrameError` on truncation, malformed encoding, or a missing
/// or unknown `command`.
pub fn decode_payload(payload: &[u8]) -> Result<Message, FrameError> {
    let mut reader = PayloadReader { buf: payload };
    let value = reader.read_value(0)?;
    if reader.buf.has_remaining() {
        return Err(FrameError::decode(format!(
            "{} trailing bytes after payload",
            reader.buf.remaining()
        )));
    }
    let Value::Map(entries) = value else {
        return Err(FrameError::decode("payload is not a map"));
    };
    let message = Message::from_entries(entries);
    message.command()?;
    Ok(message)
}

struct PayloadReader<'a> {
    buf: &'a [u8],
}

impl PayloadReader<'_> {
    fn need(&self, needed: usize) -> Result<(), FrameError> {
        if self.buf.remaining() < needed {
            return Err(FrameError::Truncated {
                needed,
                available: self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8, FrameError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn read_u32(&mut self) -> Result<usize, FrameError> {
        self.need(4)?;
        Ok(self.buf.get_u32_le() as usize)
    }

    fn read_i64(&mut self) -> Result<i64, FrameError> {
        self.need(8)?;
        Ok(self.buf.get_i64_le())
    }

    fn read_slice(&mut self, len: usize) -> Result<&[u8], FrameError> {
        self.need(len)?;
        let buf = self.buf;
        let (head, tail) = buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn read_string(&mut self) -> Result<String, FrameError> {
        let len = self.read_u32()?;
        let raw = self.read_slice(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| FrameError::decode(format!("invalid UTF-8 string: {e}")))
    }

    fn read_value(&mut self, depth: usize) -> Result<Value, FrameError> {
        if depth > MAX_DEPTH {
            return Err(FrameError::decode("nesting too deep"));
        }
        let tag = self.read_u8()?;
        match tag {
            tag::INT => Ok(Value::Int(self.read_i64()?)),
            tag::STRING => Ok(Value::Str(self.read_string()?)),
            tag::BYTES => {
                let len = self.read_u32()?;
                let raw = self.read_slice(len)?;
                Ok(Value::Bytes(Bytes::copy_from_slice(raw)))
            }
            tag::LIST => {
                let count = self.read_u32()?;
                // every element takes at least a tag byte
                self.need(count)?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.read_value(depth + 1)?);
                }
                Ok(Value::List(items))
            }
            tag::INT_LIST => {
                let count = self.read_u32()?;
                self.need(count.saturating_mul(8))?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.read_i64()?);
                }
                Ok(Value::IntList(items))
            }
            tag::MAP => {
                let count = self.read_u32()?;
                // every entry takes at least a key length and a tag byte
                self.need(count.saturating_mul(5))?;
                let mut entries = std::collections::BTreeMap::new();
                for _ in 0..count {
                    let key = self.read_string()?;
                    let value = self.read_value(depth + 1)?;
                    entries.insert(key, value);
                }
                Ok(Value::Map(entries))
            }
            _ => Err(FrameError::decode(format!("invalid value tag: 0x{tag:02x}"))),
        }
    }
}

/// Incremental frame decoder for streaming input
///
/// Feed raw bytes in as they arrive and pull complete messages out.
/// Framing errors are unrecoverable; the caller must close the tunnel.
pub struct FrameCodec {
    buffer: BytesMut,
}

impl FrameCodec {
    /// Create a new codec
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Feed raw bytes into the codec
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode one complete frame from the buffer
    ///
    /// Returns `Ok(Some(message))` when a full frame is available,
    /// `Ok(None)` when more bytes are needed.
    ///
    /// # Errors
    ///
    /// Returns a `FrameError` for an out-of-range length field or a
    /// malformed payload.
    pub fn decode(&mut self) -> Result<Option<Message>, FrameError> {
        if self.buffer.len() < LENGTH_FIELD_LEN {
            return Ok(None);
        }

        let length = u32::from_le_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;
        if !(LENGTH_FIELD_LEN..=MAX_FRAME_LEN).contains(&length) {
            return Err(FrameError::LengthOutOfRange { length });
        }
        if self.buffer.len() < length {
            return Ok(None);
        }

        self.buffer.advance(LENGTH_FIELD_LEN);
        let payload = self.buffer.split_to(length - LENGTH_FIELD_LEN);
        decode_payload(&payload).map(Some)
    }

    /// Number of buffered, not-yet-decoded bytes
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}
