//! Wire codec for live packet bodies.
//!
//! Every value is fixed-width little-endian:
//! ```text
//! u8        1 byte
//! u16       2 bytes LE
//! u32       4 bytes LE
//! string    u16 byte length ‖ UTF-8 bytes
//! blob      u32 byte length ‖ raw bytes
//! position  x: u16 ‖ y: u16 ‖ z: u8        (5 bytes)
//! color     r: u8 ‖ g: u8 ‖ b: u8          (3 bytes)
//! ```
//!
//! Both [`PacketWriter`] and [`PacketReader`] carry a sticky error: after the
//! first failure every later call fails with the same error, so a sequence of
//! reads or writes only has to be checked once.

use crate::presence::PeerColor;

/// Hard upper bound for a packet body (tag + payload), in bytes.
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Map coordinate: column, row and floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Position {
    pub x: u16,
    pub y: u16,
    pub z: u8,
}

impl Position {
    pub const ENCODED_LEN: usize = 5;

    pub fn new(x: u16, y: u16, z: u8) -> Self {
        Self { x, y, z }
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Fewer bytes remained than the requested value needs
    Truncated { needed: usize, remaining: usize },
    /// A string field was not valid UTF-8
    InvalidUtf8,
    /// A value or the whole message exceeds its size limit
    TooLarge { size: usize, limit: usize },
    /// Bytes were left over after the last expected field
    TrailingBytes(usize),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated { needed, remaining } => {
                write!(f, "Truncated value: needed {needed} bytes, {remaining} remaining")
            }
            Self::InvalidUtf8 => write!(f, "Invalid UTF-8 in string field"),
            Self::TooLarge { size, limit } => {
                write!(f, "Value too large: {size} bytes (limit {limit})")
            }
            Self::TrailingBytes(n) => write!(f, "{n} trailing bytes"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Append-only writer for a packet body.
#[derive(Debug, Default)]
pub struct PacketWriter {
    buf: Vec<u8>,
    error: Option<CodecError>,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a body with its packet type tag.
    pub fn with_tag(tag: u8) -> Self {
        let mut writer = Self::new();
        writer.write_u8(tag);
        writer
    }

    fn put(&mut self, bytes: &[u8]) {
        if self.error.is_some() {
            return;
        }
        let size = self.buf.len() + bytes.len();
        if size > MAX_MESSAGE_SIZE as usize {
            self.error = Some(CodecError::TooLarge {
                size,
                limit: MAX_MESSAGE_SIZE as usize,
            });
            return;
        }
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.put(&[value]);
        self
    }

    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        self.put(&value.to_le_bytes());
        self
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.put(&value.to_le_bytes());
        self
    }

    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.write_u8(u8::from(value))
    }

    /// Write a `u16` byte-length prefix followed by the UTF-8 bytes.
    pub fn write_string(&mut self, value: &str) -> &mut Self {
        let len = value.len();
        if len > u16::MAX as usize {
            if self.error.is_none() {
                self.error = Some(CodecError::TooLarge {
                    size: len,
                    limit: u16::MAX as usize,
                });
            }
            return self;
        }
        self.write_u16(len as u16);
        self.put(value.as_bytes());
        self
    }

    /// Write a `u32` byte-length prefix followed by raw bytes.
    pub fn write_bytes(&mut self, value: &[u8]) -> &mut Self {
        // put() enforces MAX_MESSAGE_SIZE, which is below u32::MAX.
        self.write_u32(value.len().min(u32::MAX as usize) as u32);
        self.put(value);
        self
    }

    pub fn write_position(&mut self, pos: Position) -> &mut Self {
        self.write_u16(pos.x).write_u16(pos.y).write_u8(pos.z)
    }

    pub fn write_color(&mut self, color: PeerColor) -> &mut Self {
        self.write_u8(color.r).write_u8(color.g).write_u8(color.b)
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn error(&self) -> Option<&CodecError> {
        self.error.as_ref()
    }

    /// Finish the body, reporting the first error if any write failed.
    pub fn finish(self) -> Result<Vec<u8>, CodecError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.buf),
        }
    }
}

/// Cursor over a received packet payload.
#[derive(Debug)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
    error: Option<CodecError>,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            error: None,
        }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error(&self) -> Option<&CodecError> {
        self.error.as_ref()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        if self.remaining() < n {
            let e = CodecError::Truncated {
                needed: n,
                remaining: self.remaining(),
            };
            self.error = Some(e.clone());
            return Err(e);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn fail(&mut self, e: CodecError) -> CodecError {
        self.error = Some(e.clone());
        e
    }

    /// Fail unless every byte has been consumed.
    pub fn expect_end(&mut self) -> Result<(), CodecError> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        match self.remaining() {
            0 => Ok(()),
            n => Err(self.fail(CodecError::TrailingBytes(n))),
        }
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        match std::str::from_utf8(bytes) {
            Ok(s) => Ok(s.to_owned()),
            Err(_) => Err(self.fail(CodecError::InvalidUtf8)),
        }
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.read_u32()? as usize;
        if len > MAX_MESSAGE_SIZE as usize {
            return Err(self.fail(CodecError::TooLarge {
                size: len,
                limit: MAX_MESSAGE_SIZE as usize,
            }));
        }
        Ok(self.take(len)?.to_vec())
    }

    pub fn read_position(&mut self) -> Result<Position, CodecError> {
        let x = self.read_u16()?;
        let y = self.read_u16()?;
        let z = self.read_u8()?;
        Ok(Position { x, y, z })
    }

    pub fn read_color(&mut self) -> Result<PeerColor, CodecError> {
        let r = self.read_u8()?;
        let g = self.read_u8()?;
        let b = self.read_u8()?;
        Ok(PeerColor::rgb(r, g, b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integers_are_little_endian() {
        let mut w = PacketWriter::new();
        w.write_u8(0xAB).write_u16(0x1234).write_u32(0xDEAD_BEEF);
        let bytes = w.finish().unwrap();
        assert_eq!(bytes, vec![0xAB, 0x34, 0x12, 0xEF, 0xBE, 0xAD, 0xDE]);

        let mut r = PacketReader::new(&bytes);
        assert_eq!(r.read_u8().unwrap(), 0xAB);
        assert_eq!(r.read_u16().unwrap(), 0x1234);
        assert_eq!(r.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_string_prefix_counts_bytes() {
        let mut w = PacketWriter::new();
        w.write_string("héllo");
        let bytes = w.finish().unwrap();
        // "é" is two bytes in UTF-8
        assert_eq!(&bytes[..2], &6u16.to_le_bytes());
        assert_eq!(bytes.len(), 8);

        let mut r = PacketReader::new(&bytes);
        assert_eq!(r.read_string().unwrap(), "héllo");
    }

    #[test]
    fn test_string_longer_than_buffer_fails() {
        let mut bytes = 10u16.to_le_bytes().to_vec();
        bytes.extend_from_slice(b"abc");
        let mut r = PacketReader::new(&bytes);
        assert_eq!(
            r.read_string(),
            Err(CodecError::Truncated { needed: 10, remaining: 3 })
        );
    }

    #[test]
    fn test_reader_error_is_sticky() {
        let bytes = [1u8];
        let mut r = PacketReader::new(&bytes);
        assert!(r.read_u16().is_err());
        assert!(r.has_error());
        // A u8 would fit, but the reader already failed.
        assert!(r.read_u8().is_err());
        assert!(r.read_string().is_err());
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut bytes = 2u16.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0xC3, 0x28]);
        let mut r = PacketReader::new(&bytes);
        assert_eq!(r.read_string(), Err(CodecError::InvalidUtf8));
        assert!(r.read_u8().is_err());
    }

    #[test]
    fn test_position_and_color_layout() {
        let mut w = PacketWriter::new();
        w.write_position(Position::new(1000, 2000, 7))
            .write_color(PeerColor::rgb(1, 2, 3));
        let bytes = w.finish().unwrap();
        assert_eq!(bytes.len(), Position::ENCODED_LEN + 3);

        let mut r = PacketReader::new(&bytes);
        assert_eq!(r.read_position().unwrap(), Position::new(1000, 2000, 7));
        assert_eq!(r.read_color().unwrap(), PeerColor::rgb(1, 2, 3));
    }

    #[test]
    fn test_truncated_position_returns_nothing() {
        let bytes = [0x01, 0x00, 0x02];
        let mut r = PacketReader::new(&bytes);
        assert!(r.read_position().is_err());
    }

    #[test]
    fn test_writer_rejects_oversized_string() {
        let long = "x".repeat(u16::MAX as usize + 1);
        let mut w = PacketWriter::new();
        w.write_string(&long).write_u8(1);
        assert!(matches!(w.finish(), Err(CodecError::TooLarge { .. })));
    }

    #[test]
    fn test_writer_rejects_message_over_limit() {
        let mut w = PacketWriter::with_tag(1);
        w.write_bytes(&vec![0u8; MAX_MESSAGE_SIZE as usize]);
        assert!(matches!(w.finish(), Err(CodecError::TooLarge { .. })));
    }

    #[test]
    fn test_blob_declared_length_over_limit() {
        let bytes = (MAX_MESSAGE_SIZE + 1).to_le_bytes();
        let mut r = PacketReader::new(&bytes);
        assert!(matches!(r.read_bytes(), Err(CodecError::TooLarge { .. })));
    }

    #[test]
    fn test_with_tag_writes_tag_first() {
        let mut w = PacketWriter::with_tag(0x42);
        w.write_bool(true);
        assert_eq!(w.finish().unwrap(), vec![0x42, 1]);
    }
}
