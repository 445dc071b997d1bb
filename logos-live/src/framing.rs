//! Length-prefixed packet framing over a byte stream.
//!
//! Wire format:
//! ```text
//! ┌──────────────┬─────────┬───────────────────┐
//! │ length (LE)  │ tag     │ payload           │
//! │ u32          │ u8      │ length - 1 bytes  │
//! └──────────────┴─────────┴───────────────────┘
//! ```
//!
//! `length` counts the body (tag + payload). A length of zero or above
//! [`MAX_MESSAGE_SIZE`] is a fatal protocol violation: the decoder poisons
//! itself and the connection must be dropped.

use crate::codec::MAX_MESSAGE_SIZE;

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// One complete packet body, split into tag and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u8,
    pub payload: Vec<u8>,
}

/// Framing violations. All of them are fatal to the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    ZeroLength,
    Oversized(u32),
}

impl std::fmt::Display for FramingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ZeroLength => write!(f, "Zero-length packet"),
            Self::Oversized(len) => {
                write!(f, "Packet length {len} exceeds maximum {MAX_MESSAGE_SIZE}")
            }
        }
    }
}

impl std::error::Error for FramingError {}

/// Prefix a packet body with its length.
pub fn encode_frame(body: &[u8]) -> Result<Vec<u8>, FramingError> {
    if body.is_empty() {
        return Err(FramingError::ZeroLength);
    }
    if body.len() > MAX_MESSAGE_SIZE as usize {
        return Err(FramingError::Oversized(body.len().min(u32::MAX as usize) as u32));
    }
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

/// Per-connection receive buffer that turns arbitrary read chunks into
/// whole frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    poisoned: Option<FramingError>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        if self.poisoned.is_none() {
            self.buf.extend_from_slice(bytes);
        }
    }

    /// Pop the next complete frame, if one is buffered.
    ///
    /// `Ok(None)` means more bytes are needed. After an error the decoder
    /// keeps returning that error.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FramingError> {
        if let Some(e) = &self.poisoned {
            return Err(e.clone());
        }
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        if len == 0 {
            return Err(self.poison(FramingError::ZeroLength));
        }
        if len > MAX_MESSAGE_SIZE {
            return Err(self.poison(FramingError::Oversized(len)));
        }

        let total = HEADER_LEN + len as usize;
        if self.buf.len() < total {
            return Ok(None);
        }

        let tag = self.buf[HEADER_LEN];
        let payload = self.buf[HEADER_LEN + 1..total].to_vec();
        self.buf.drain(..total);
        Ok(Some(Frame { tag, payload }))
    }

    fn poison(&mut self, e: FramingError) -> FramingError {
        self.buf.clear();
        self.poisoned = Some(e.clone());
        e
    }

    /// Bytes waiting for a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }
}
