//! Utilities for decoding from and encoding into bytes.
//!
//! This module defines the (de)serialization traits [`ToBytes`] and [`FromBytes`], as well as the
//! helper structs [`ByteWriter`] and [`ByteReader`], which wrap a `&mut [u8]` or `&[u8]` and offer
//! useful utilities to read and write values.
//!
//! All types that end up on the air or on the wire to the radio implement [`ToBytes`] and
//! [`FromBytes`]: the GAIA envelope and its payloads, AX.25 frames, and the records the station
//! persists. The GAIA protocol is big-endian while a few embedded payloads are little-endian, so
//! both byte orders are offered.
//!
//! [`ToBytes`]: trait.ToBytes.html
//! [`FromBytes`]: trait.FromBytes.html
//! [`ByteWriter`]: struct.ByteWriter.html
//! [`ByteReader`]: struct.ByteReader.html

use crate::Error;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use core::mem;
use zerocopy::LayoutVerified;

/// Wrapper around a byte slice that can be used to encode data into bytes.
///
/// All `write_*` methods on this type will return `Error::Eof` when the underlying buffer slice is
/// full.
pub struct ByteWriter<'a>(&'a mut [u8]);

impl<'a> ByteWriter<'a> {
    /// Creates a writer that will write to `buf`.
    pub fn new(buf: &'a mut [u8]) -> Self {
        ByteWriter(buf)
    }

    /// Consumes `self` and returns the part of the contained buffer that has not yet been written
    /// to.
    pub fn into_rest(self) -> &'a mut [u8] {
        self.0
    }

    /// Skips the given number of bytes in the output data without writing anything there.
    ///
    /// This is a potentially dangerous operation that should only be used when necessary (eg. when
    /// the skipped data will be filled in by other code). If the skipped bytes are *not* written,
    /// they will probably contain garbage data from an earlier use of the underlying buffer.
    pub fn skip(&mut self, bytes: usize) -> Result<(), Error> {
        if self.space_left() < bytes {
            Err(Error::Eof)
        } else {
            let this = mem::replace(&mut self.0, &mut []);
            self.0 = &mut this[bytes..];
            Ok(())
        }
    }

    /// Splits off the next byte in the buffer, allowing its value to be filled in later.
    pub fn split_next_mut(&mut self) -> Option<&'a mut u8> {
        let this = mem::replace(&mut self.0, &mut []);
        // Slight contortion to please the borrow checker:
        if this.is_empty() {
            self.0 = this;
            None
        } else {
            let (first, rest) = this.split_first_mut().unwrap();
            self.0 = rest;
            Some(first)
        }
    }

    /// Returns the number of bytes that can be written to `self` until it is full.
    pub fn space_left(&self) -> usize {
        self.0.len()
    }

    /// Writes all bytes from `other` to `self`.
    ///
    /// Returns `Error::Eof` when `self` does not have enough space left to fit `other`. In that
    /// case, `self` will not be modified.
    pub fn write_slice(&mut self, other: &[u8]) -> Result<(), Error> {
        if self.space_left() < other.len() {
            Err(Error::Eof)
        } else {
            self.0[..other.len()].copy_from_slice(other);
            let this = mem::replace(&mut self.0, &mut []);
            self.0 = &mut this[other.len()..];
            Ok(())
        }
    }

    /// Writes a single byte to `self`.
    ///
    /// Returns `Error::Eof` when no space is left.
    pub fn write_u8(&mut self, byte: u8) -> Result<(), Error> {
        let first = self.split_next_mut().ok_or(Error::Eof)?;
        *first = byte;
        Ok(())
    }

    /// Writes a `u16` to `self`, using Big Endian byte order.
    pub fn write_u16_be(&mut self, value: u16) -> Result<(), Error> {
        let mut buf = [0; 2];
        BigEndian::write_u16(&mut buf, value);
        self.write_slice(&buf)
    }

    /// Writes a `u32` to `self`, using Big Endian byte order.
    pub fn write_u32_be(&mut self, value: u32) -> Result<(), Error> {
        let mut buf = [0; 4];
        BigEndian::write_u32(&mut buf, value);
        self.write_slice(&buf)
    }

    /// Writes a `u16` to `self`, using Little Endian byte order.
    pub fn write_u16_le(&mut self, value: u16) -> Result<(), Error> {
        let mut buf = [0; 2];
        LittleEndian::write_u16(&mut buf, value);
        self.write_slice(&buf)
    }

    /// Writes a `u32` to `self`, using Little Endian byte order.
    pub fn write_u32_le(&mut self, value: u32) -> Result<(), Error> {
        let mut buf = [0; 4];
        LittleEndian::write_u32(&mut buf, value);
        self.write_slice(&buf)
    }

    /// Writes a value to the stream by transmuting it to bytes.
    pub fn write_obj<T: zerocopy::AsBytes>(&mut self, obj: &T) -> Result<(), Error> {
        self.write_slice(obj.as_bytes())
    }
}

/// Allows reading values from a borrowed byte slice.
pub struct ByteReader<'a>(&'a [u8]);

impl<'a> ByteReader<'a> {
    /// Creates a new `ByteReader` that will read from the given byte slice.
    pub fn new(bytes: &'a [u8]) -> Self {
        ByteReader(bytes)
    }

    /// Returns a reference to the raw bytes in `self`, without advancing `self` or reading any
    /// data.
    pub fn as_raw_bytes(&self) -> &'a [u8] {
        self.0
    }

    /// Consumes `self` and returns the part of the contained buffer that has not yet been read
    /// from.
    pub fn into_rest(self) -> &'a [u8] {
        self.0
    }

    /// Skips the given number of bytes in the input data without inspecting them.
    pub fn skip(&mut self, bytes: usize) -> Result<(), Error> {
        if self.bytes_left() < bytes {
            Err(Error::Eof)
        } else {
            self.0 = &self.0[bytes..];
            Ok(())
        }
    }

    /// Creates and returns another `ByteReader` that will read from the next `len` Bytes in the
    /// buffer.
    ///
    /// `self` will be modified to point after the split-off bytes, and will continue reading from
    /// there.
    #[must_use = "data from ByteReader will be ignored if not used (use skip() if this is intended)"]
    pub fn split_off(&mut self, len: usize) -> Result<Self, Error> {
        if self.bytes_left() < len {
            Err(Error::Eof)
        } else {
            let (head, tail) = (&self.0[..len], &self.0[len..]);
            self.0 = tail;
            Ok(ByteReader::new(head))
        }
    }

    /// Returns the number of bytes that can still be read from `self`.
    pub fn bytes_left(&self) -> usize {
        self.0.len()
    }

    /// Returns whether `self` is at the end of the underlying buffer (EOF).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Reads a `zerocopy`-supported object from the stream by transmuting an appropriate number of
    /// bytes.
    pub fn read_obj<T: zerocopy::FromBytes + zerocopy::Unaligned>(
        &mut self,
    ) -> Result<&'a T, Error> {
        let (obj, rest): (LayoutVerified<&'a [u8], T>, _) =
            zerocopy::LayoutVerified::new_unaligned_from_prefix(self.0).ok_or(Error::Eof)?;
        self.0 = rest;
        Ok(obj.into_ref())
    }

    /// Reads a byte slice of length `len` from `self`.
    ///
    /// If `self` contains less than `len` bytes, `Error::Eof` will be returned and `self` will not
    /// be modified.
    pub fn read_slice(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if self.bytes_left() < len {
            Err(Error::Eof)
        } else {
            let slice = &self.0[..len];
            self.0 = &self.0[len..];
            Ok(slice)
        }
    }

    /// Reads a byte-array-like type `S` from `self`.
    ///
    /// `S` must implement `Default` and `AsMut<[u8]>`, which allows using small arrays as well as
    /// datastructures from `alloc` (eg. `Box<[u8]>` or `Vec<u8>`).
    pub fn read_array<S>(&mut self) -> Result<S, Error>
    where
        S: Default + AsMut<[u8]>,
    {
        let mut buf = S::default();
        let slice = buf.as_mut();
        if self.bytes_left() < slice.len() {
            return Err(Error::Eof);
        }

        slice.copy_from_slice(&self.0[..slice.len()]);
        self.0 = &self.0[slice.len()..];
        Ok(buf)
    }

    /// Reads the remaining bytes from `self`.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = self.0;
        self.0 = &[];
        rest
    }

    /// Reads a single byte from `self`.
    ///
    /// Returns `Error::Eof` when `self` is empty.
    pub fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.read_array::<[u8; 1]>()?[0])
    }

    /// Reads a `u16` from `self`, using Big Endian byte order.
    pub fn read_u16_be(&mut self) -> Result<u16, Error> {
        Ok(BigEndian::read_u16(self.read_slice(2)?))
    }

    /// Reads a `u32` from `self`, using Big Endian byte order.
    pub fn read_u32_be(&mut self) -> Result<u32, Error> {
        Ok(BigEndian::read_u32(self.read_slice(4)?))
    }

    /// Reads a `u16` from `self`, using Little Endian byte order.
    pub fn read_u16_le(&mut self) -> Result<u16, Error> {
        Ok(LittleEndian::read_u16(self.read_slice(2)?))
    }

    /// Reads a `u32` from `self`, using Little Endian byte order.
    pub fn read_u32_le(&mut self) -> Result<u32, Error> {
        Ok(LittleEndian::read_u32(self.read_slice(4)?))
    }
}

/// Trait for encoding a value into a byte buffer.
pub trait ToBytes {
    /// Converts `self` to bytes and writes them into `writer`, advancing `writer` to point past the
    /// encoded value.
    ///
    /// If `writer` does not contain enough space, an error will be returned and the state of the
    /// buffer is unspecified (eg. `self` may be partially written into `writer`).
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error>;
}

/// Trait for decoding values from a byte slice.
pub trait FromBytes<'a>: Sized {
    /// Decode a `Self` from a byte slice, advancing `bytes` to point past the data that was read.
    ///
    /// If `bytes` contains data not valid for the target type, or contains an insufficient number
    /// of bytes, an error will be returned and the state of `bytes` is unspecified (it can point to
    /// arbitrary data).
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error>;
}

/// Encodes a value into a freshly allocated buffer of (at most) `cap` bytes.
///
/// Convenience for callers that assemble frames into heap-allocated packets before handing them to
/// the TNC queue.
pub fn encode_to_vec<T: ToBytes>(value: &T, cap: usize) -> Result<alloc::vec::Vec<u8>, Error> {
    let mut buf = alloc::vec![0; cap];
    let mut writer = ByteWriter::new(&mut buf);
    value.to_bytes(&mut writer)?;
    let left = writer.space_left();
    let used = buf.len() - left;
    buf.truncate(used);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_eof() {
        let mut buf = [0; 2];
        let mut w = ByteWriter::new(&mut buf);
        w.write_u8(0xAB).unwrap();
        assert_eq!(w.write_u16_be(0x1234), Err(Error::Eof));
        w.write_u8(0xCD).unwrap();
        assert_eq!(w.write_u8(0), Err(Error::Eof));
        assert_eq!(buf, [0xAB, 0xCD]);
    }

    #[test]
    fn endianness() {
        let mut buf = [0; 8];
        {
            let mut w = ByteWriter::new(&mut buf);
            w.write_u16_be(0x0102).unwrap();
            w.write_u16_le(0x0102).unwrap();
            w.write_u32_be(0x0A0B0C0D).unwrap();
        }
        assert_eq!(buf, [0x01, 0x02, 0x02, 0x01, 0x0A, 0x0B, 0x0C, 0x0D]);

        let mut r = ByteReader::new(&buf);
        assert_eq!(r.read_u16_be().unwrap(), 0x0102);
        assert_eq!(r.read_u16_le().unwrap(), 0x0102);
        assert_eq!(r.read_u32_be().unwrap(), 0x0A0B0C0D);
        assert!(r.is_empty());
    }

    #[test]
    fn reader_split() {
        let data = [1, 2, 3, 4, 5];
        let mut r = ByteReader::new(&data);
        let head = r.split_off(2).unwrap();
        assert_eq!(head.into_rest(), &[1, 2]);
        assert_eq!(r.read_rest(), &[3, 4, 5]);
    }
}
