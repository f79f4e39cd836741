//! Wire format for peer application messages
//!
//! Each application message is framed as:
//!
//! ```text
//! ┌──────────────────┬────────────────────┬──────────────┬─────────────┐
//! │ Category len (1B)│ Category (UTF-8)   │ Code (4B BE) │ Payload     │
//! └──────────────────┴────────────────────┴──────────────┴─────────────┘
//! ```
//!
//! The category string groups message codes so independent enumerations
//! can share numeric values. Payload encoding is left to each handler;
//! this module only provides the cursor-addressed primitive reads
//! (little-endian numerics, length-prefixed UTF-8 strings).

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::dispatch::MessageHandler;

// ============================================================================
// Constants
// ============================================================================

/// Maximum category string length (fits the 1-byte length prefix)
pub const MAX_CATEGORY_LEN: usize = 255;

/// Minimum frame size: 1-byte category length + 4-byte code
pub const HEADER_MIN_LEN: usize = 5;

// ============================================================================
// Peer Identity
// ============================================================================

/// Opaque reference to a connected peer, assigned by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

// ============================================================================
// Network Message
// ============================================================================

/// An inbound application message.
///
/// Immutable once parsed except for the read cursor. Shared between the
/// dispatcher and the deferred-message cache as [`SharedMessage`]; cache
/// membership is decided by `Rc` pointer identity, never by comparing
/// header or payload bytes (two byte-identical messages are distinct).
pub struct NetworkMessage {
    category: String,
    code: i32,
    payload: Vec<u8>,
    sender: PeerId,
    cursor: Cell<usize>,
    /// The handler bound at receipt time, retained so a deferred replay
    /// re-invokes the same callback.
    handler: RefCell<Option<MessageHandler>>,
}

/// Shared handle to a [`NetworkMessage`].
pub type SharedMessage = Rc<NetworkMessage>;

impl NetworkMessage {
    /// Build a message directly (used by tests and loopback paths).
    pub fn new(category: impl Into<String>, code: i32, payload: Vec<u8>, sender: PeerId) -> Self {
        NetworkMessage {
            category: category.into(),
            code,
            payload,
            sender,
            cursor: Cell::new(0),
            handler: RefCell::new(None),
        }
    }

    /// Parse a message from a received frame.
    pub fn decode(sender: PeerId, frame: &[u8]) -> Result<Self, DecodeError> {
        if frame.len() < HEADER_MIN_LEN {
            return Err(DecodeError::Incomplete(HEADER_MIN_LEN - frame.len()));
        }

        let cat_len = frame[0] as usize;
        let total_header = 1 + cat_len + 4;
        if frame.len() < total_header {
            return Err(DecodeError::Incomplete(total_header - frame.len()));
        }

        let category = std::str::from_utf8(&frame[1..1 + cat_len])
            .map_err(|_| DecodeError::InvalidCategory)?
            .to_string();

        let code_start = 1 + cat_len;
        let code = i32::from_be_bytes([
            frame[code_start],
            frame[code_start + 1],
            frame[code_start + 2],
            frame[code_start + 3],
        ]);

        let payload = frame[total_header..].to_vec();

        Ok(NetworkMessage::new(category, code, payload, sender))
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn sender(&self) -> PeerId {
        self.sender
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Re-encode the full frame, used for verbatim host re-broadcast.
    pub fn to_frame(&self) -> Vec<u8> {
        // Category length was validated at decode/encode time
        encode_frame(&self.category, self.code, &self.payload)
            .expect("previously validated category length")
    }

    /// Bind the registered handler at receipt time.
    pub fn bind_handler(&self, handler: MessageHandler) {
        *self.handler.borrow_mut() = Some(handler);
    }

    /// The handler bound at receipt time, if any.
    pub fn handler(&self) -> Option<MessageHandler> {
        self.handler.borrow().clone()
    }

    /// Reset the read cursor to the start of the payload.
    pub fn reset_cursor(&self) {
        self.cursor.set(0);
    }

    fn take(&self, n: usize) -> Result<&[u8], ReadError> {
        let pos = self.cursor.get();
        let remaining = self.payload.len() - pos;
        if remaining < n {
            return Err(ReadError::OutOfBounds {
                needed: n,
                remaining,
            });
        }
        self.cursor.set(pos + n);
        Ok(&self.payload[pos..pos + n])
    }

    pub fn read_u8(&self) -> Result<u8, ReadError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&self) -> Result<u16, ReadError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_i32(&self) -> Result<i32, ReadError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_f32(&self) -> Result<f32, ReadError> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_bool(&self) -> Result<bool, ReadError> {
        Ok(self.read_u8()? != 0)
    }

    /// Read a UTF-8 string with a 2-byte little-endian length prefix.
    pub fn read_string(&self) -> Result<String, ReadError> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(|s| s.to_string())
            .map_err(|_| ReadError::InvalidUtf8)
    }
}

impl fmt::Debug for NetworkMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkMessage")
            .field("category", &self.category)
            .field("code", &self.code)
            .field("sender", &self.sender)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

// ============================================================================
// Payload Writer
// ============================================================================

/// Builds payload bytes with the primitive encodings the readers expect.
#[derive(Default)]
pub struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn write_u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn write_i32(&mut self, v: i32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn write_f32(&mut self, v: f32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn write_bool(&mut self, v: bool) -> &mut Self {
        self.buf.push(v as u8);
        self
    }

    /// Write a UTF-8 string with a 2-byte little-endian length prefix.
    ///
    /// # Panics
    ///
    /// Panics when the string exceeds the prefix (caller defect); a
    /// wrapped length would desync every subsequent read.
    pub fn write_string(&mut self, s: &str) -> &mut Self {
        assert!(
            s.len() <= u16::MAX as usize,
            "string too long for length prefix: {} bytes",
            s.len()
        );
        self.write_u16(s.len() as u16);
        self.buf.extend_from_slice(s.as_bytes());
        self
    }

    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

// ============================================================================
// Frame Encoding
// ============================================================================

/// Encode an outbound frame: category header, code, payload bytes.
pub fn encode_frame(category: &str, code: i32, payload: &[u8]) -> Result<Vec<u8>, EncodeError> {
    let cat = category.as_bytes();
    if cat.len() > MAX_CATEGORY_LEN {
        return Err(EncodeError::CategoryTooLong(cat.len()));
    }

    let mut buf = Vec::with_capacity(1 + cat.len() + 4 + payload.len());
    buf.push(cat.len() as u8);
    buf.extend_from_slice(cat);
    buf.extend_from_slice(&code.to_be_bytes());
    buf.extend_from_slice(payload);

    Ok(buf)
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur when encoding a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Category exceeds the 1-byte length prefix
    CategoryTooLong(usize),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::CategoryTooLong(len) => {
                write!(f, "category too long: {} bytes (max {})", len, MAX_CATEGORY_LEN)
            }
        }
    }
}

impl std::error::Error for EncodeError {}

/// Errors that can occur when decoding a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough data (value = bytes still needed)
    Incomplete(usize),
    /// Category bytes are not valid UTF-8
    InvalidCategory,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Incomplete(needed) => {
                write!(f, "incomplete frame, need {} more bytes", needed)
            }
            DecodeError::InvalidCategory => write!(f, "category is not valid UTF-8"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors from cursor-addressed payload reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    /// Read past the end of the payload
    OutOfBounds { needed: usize, remaining: usize },
    /// String bytes are not valid UTF-8
    InvalidUtf8,
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadError::OutOfBounds { needed, remaining } => {
                write!(f, "payload read out of bounds: need {}, {} remaining", needed, remaining)
            }
            ReadError::InvalidUtf8 => write!(f, "string payload is not valid UTF-8"),
        }
    }
}

impl std::error::Error for ReadError {}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_frame() {
        let payload = {
            let mut w = PayloadWriter::new();
            w.write_i32(42).write_string("blip");
            w.finish()
        };
        let frame = encode_frame("entity", 3, &payload).unwrap();

        let msg = NetworkMessage::decode(PeerId(1), &frame).unwrap();
        assert_eq!(msg.category(), "entity");
        assert_eq!(msg.code(), 3);
        assert_eq!(msg.sender(), PeerId(1));
        assert_eq!(msg.read_i32().unwrap(), 42);
        assert_eq!(msg.read_string().unwrap(), "blip");
    }

    #[test]
    fn test_decode_incomplete_header() {
        assert!(matches!(
            NetworkMessage::decode(PeerId(0), &[3, b'a']),
            Err(DecodeError::Incomplete(_))
        ));
    }

    #[test]
    fn test_decode_truncated_category() {
        // Claims a 10-byte category but only 2 bytes follow
        let frame = [10u8, b'a', b'b'];
        assert!(matches!(
            NetworkMessage::decode(PeerId(0), &frame),
            Err(DecodeError::Incomplete(_))
        ));
    }

    #[test]
    fn test_encode_category_too_long() {
        let category = "x".repeat(256);
        assert!(matches!(
            encode_frame(&category, 0, &[]),
            Err(EncodeError::CategoryTooLong(256))
        ));
    }

    #[test]
    fn test_empty_payload_frame() {
        let frame = encode_frame("sys", -7, &[]).unwrap();
        let msg = NetworkMessage::decode(PeerId(9), &frame).unwrap();
        assert_eq!(msg.code(), -7);
        assert!(msg.payload().is_empty());
        assert!(matches!(
            msg.read_u8(),
            Err(ReadError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_cursor_reset_rereads_payload() {
        let mut w = PayloadWriter::new();
        w.write_i32(7);
        let msg = NetworkMessage::new("entity", 1, w.finish(), PeerId(2));

        assert_eq!(msg.read_i32().unwrap(), 7);
        assert!(msg.read_i32().is_err());

        msg.reset_cursor();
        assert_eq!(msg.read_i32().unwrap(), 7);
    }

    #[test]
    fn test_to_frame_roundtrip() {
        let frame = encode_frame("veh", 12, &[1, 2, 3]).unwrap();
        let msg = NetworkMessage::decode(PeerId(5), &frame).unwrap();
        assert_eq!(msg.to_frame(), frame);
    }

    #[test]
    fn test_write_string_fits_prefix() {
        let mut w = PayloadWriter::new();
        let s = "x".repeat(u16::MAX as usize);
        w.write_string(&s);
        let msg = NetworkMessage::new("t", 0, w.finish(), PeerId(0));
        assert_eq!(msg.read_string().unwrap().len(), u16::MAX as usize);
    }

    #[test]
    #[should_panic(expected = "too long for length prefix")]
    fn test_write_string_over_prefix_panics() {
        let mut w = PayloadWriter::new();
        w.write_string(&"x".repeat(u16::MAX as usize + 1));
    }

    #[test]
    fn test_read_primitives() {
        let mut w = PayloadWriter::new();
        w.write_u8(200)
            .write_u16(5000)
            .write_f32(1.5)
            .write_bool(true);
        let msg = NetworkMessage::new("t", 0, w.finish(), PeerId(0));

        assert_eq!(msg.read_u8().unwrap(), 200);
        assert_eq!(msg.read_u16().unwrap(), 5000);
        assert_eq!(msg.read_f32().unwrap(), 1.5);
        assert!(msg.read_bool().unwrap());
    }
}
