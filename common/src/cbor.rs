//! Bounded CBOR encoding for telemetry frames.
//!
//! Only the subset needed for the sensor frame is implemented: definite-length
//! maps, text strings, integers and double-precision floats. The encoder emits
//! the canonical form (shortest argument encoding, big-endian) and never writes
//! past the buffer it was given; the reader accepts any well-formed ordering.

use crate::error::Error;

const MAJOR_UINT: u8 = 0;
const MAJOR_NINT: u8 = 1;
const MAJOR_TSTR: u8 = 3;
const MAJOR_MAP: u8 = 5;
/// Initial byte of a big-endian IEEE 754 double-precision float.
const DOUBLE_HEADER: u8 = 0xfb;

/// Sequential CBOR encoder over a caller-provided buffer.
///
/// Every write checks the remaining capacity and fails with
/// [`Error::BufferExhausted`], leaving the caller to abandon the whole frame.
pub struct Encoder<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl<'a> Encoder<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, len: 0 }
    }

    fn put(&mut self, byte: u8) -> crate::Result<()> {
        if self.len >= self.buf.len() {
            return Err(Error::BufferExhausted);
        }
        self.buf[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    fn put_slice(&mut self, bytes: &[u8]) -> crate::Result<()> {
        if self.buf.len() - self.len < bytes.len() {
            return Err(Error::BufferExhausted);
        }
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }

    /// Writes an initial byte plus the shortest argument encoding of `value`.
    fn item(&mut self, major: u8, value: u64) -> crate::Result<()> {
        let major = major << 5;
        match value {
            0..=23 => self.put(major | value as u8),
            24..=0xff => {
                self.put(major | 24)?;
                self.put(value as u8)
            }
            0x100..=0xffff => {
                self.put(major | 25)?;
                self.put_slice(&(value as u16).to_be_bytes())
            }
            0x1_0000..=0xffff_ffff => {
                self.put(major | 26)?;
                self.put_slice(&(value as u32).to_be_bytes())
            }
            _ => {
                self.put(major | 27)?;
                self.put_slice(&value.to_be_bytes())
            }
        }
    }

    /// Opens a definite-length map of `entries` key/value pairs.
    pub fn map(&mut self, entries: u64) -> crate::Result<()> {
        self.item(MAJOR_MAP, entries)
    }

    pub fn text(&mut self, text: &str) -> crate::Result<()> {
        self.item(MAJOR_TSTR, text.len() as u64)?;
        self.put_slice(text.as_bytes())
    }

    pub fn uint(&mut self, value: u64) -> crate::Result<()> {
        self.item(MAJOR_UINT, value)
    }

    pub fn int(&mut self, value: i64) -> crate::Result<()> {
        if value >= 0 {
            self.item(MAJOR_UINT, value as u64)
        } else {
            self.item(MAJOR_NINT, !(value as u64))
        }
    }

    pub fn float64(&mut self, value: f64) -> crate::Result<()> {
        self.put(DOUBLE_HEADER)?;
        self.put_slice(&value.to_be_bytes())
    }

    /// Number of bytes committed so far.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Consumes the encoder, returning the exact number of bytes written.
    pub fn finish(self) -> usize {
        self.len
    }
}

/// Sequential CBOR reader, the decoding counterpart of [`Encoder`].
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, count: usize) -> crate::Result<&'a [u8]> {
        if self.buf.len() - self.pos < count {
            return Err(Error::ParseError);
        }
        let bytes = &self.buf[self.pos..self.pos + count];
        self.pos += count;
        Ok(bytes)
    }

    fn argument(&mut self, info: u8) -> crate::Result<u64> {
        match info {
            0..=23 => Ok(u64::from(info)),
            24 => Ok(u64::from(self.take(1)?[0])),
            25 => {
                let b = self.take(2)?;
                Ok(u64::from(u16::from_be_bytes([b[0], b[1]])))
            }
            26 => {
                let b = self.take(4)?;
                Ok(u64::from(u32::from_be_bytes([b[0], b[1], b[2], b[3]])))
            }
            27 => {
                let b = self.take(8)?;
                Ok(u64::from_be_bytes([
                    b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
                ]))
            }
            _ => Err(Error::ParseError),
        }
    }

    fn header(&mut self, expected_major: u8) -> crate::Result<u64> {
        let initial = self.take(1)?[0];
        if initial >> 5 != expected_major {
            return Err(Error::ParseError);
        }
        self.argument(initial & 0x1f)
    }

    /// Reads a definite-length map header, returning the number of entries.
    pub fn map(&mut self) -> crate::Result<u64> {
        self.header(MAJOR_MAP)
    }

    pub fn text(&mut self) -> crate::Result<&'a str> {
        let len = self.header(MAJOR_TSTR)?;
        let bytes = self.take(len as usize)?;
        core::str::from_utf8(bytes).map_err(|_| Error::ParseError)
    }

    pub fn int(&mut self) -> crate::Result<i64> {
        let initial = self.take(1)?[0];
        let value = self.argument(initial & 0x1f)?;
        match initial >> 5 {
            MAJOR_UINT => i64::try_from(value).map_err(|_| Error::ParseError),
            MAJOR_NINT => i64::try_from(value)
                .map(|v| -1 - v)
                .map_err(|_| Error::ParseError),
            _ => Err(Error::ParseError),
        }
    }

    pub fn float64(&mut self) -> crate::Result<f64> {
        let initial = self.take(1)?[0];
        if initial != DOUBLE_HEADER {
            return Err(Error::ParseError);
        }
        let b = self.take(8)?;
        Ok(f64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}
