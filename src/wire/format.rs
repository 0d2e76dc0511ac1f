//! Low-level field layout for the wire protocol.
//!
//! All multi-byte integers are big-endian. Variable-length fields are prefixed:
//!
//! | Field            | Layout                                                   |
//! |------------------|----------------------------------------------------------|
//! | `bool`           | one byte, `0` or `1`                                     |
//! | string           | `i32` byte length, UTF-8 bytes                           |
//! | optional string  | `i32` byte length (`-1` = absent), UTF-8 bytes           |
//! | array            | `i32` element count, elements                            |
//! | nested bytes     | `i32` array count, then `(i32 length, bytes)` per entry  |
//!
//! Every length is validated before anything is allocated: negative values and values
//! above [`MAX_ARRAY_LEN`] / [`MAX_BYTES_LEN`] are rejected, and a count whose minimal
//! encoded size exceeds the remaining input is reported as truncated.

use bytes::{BufMut, BytesMut};

use crate::error::{DecodeError, EncodeError};

/// Largest element count accepted for any array field.
pub const MAX_ARRAY_LEN: usize = 16 * 1024 * 1024;

/// Largest byte length accepted for a single string or byte array.
pub const MAX_BYTES_LEN: usize = 64 * 1024 * 1024;

const ABSENT: i32 = -1;

/// Cursor over an input buffer.
#[derive(Debug)]
pub(crate) struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn ensure(&self, needed: usize) -> Result<(), DecodeError> {
        if self.remaining() < needed {
            return Err(DecodeError::Truncated {
                needed: self.pos.saturating_add(needed),
                available: self.buf.len(),
            });
        }
        Ok(())
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        self.ensure(n)?;
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub(crate) fn skip(&mut self, n: usize) -> Result<(), DecodeError> {
        self.take(n).map(|_| ())
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn read_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(self.read_u32()? as i32)
    }

    pub(crate) fn read_i64(&mut self) -> Result<i64, DecodeError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(i64::from_be_bytes(raw))
    }

    pub(crate) fn read_bool(&mut self, field: &'static str) -> Result<bool, DecodeError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DecodeError::malformed(field, format!("boolean byte {other}"))),
        }
    }

    /// Reads a length prefix, rejecting negative and oversized values.
    fn read_len(&mut self, field: &'static str, max: usize) -> Result<usize, DecodeError> {
        let raw = self.read_i32()?;
        if raw < 0 || raw as usize > max {
            return Err(DecodeError::InvalidLength { field, length: raw as i64 });
        }
        Ok(raw as usize)
    }

    fn read_optional_len(
        &mut self,
        field: &'static str,
        max: usize,
    ) -> Result<Option<usize>, DecodeError> {
        let raw = self.read_i32()?;
        if raw == ABSENT {
            return Ok(None);
        }
        if raw < 0 || raw as usize > max {
            return Err(DecodeError::InvalidLength { field, length: raw as i64 });
        }
        Ok(Some(raw as usize))
    }

    /// Reads an array count and checks that `min_element_size` bytes per element remain.
    fn read_count(
        &mut self,
        field: &'static str,
        min_element_size: usize,
    ) -> Result<usize, DecodeError> {
        let count = self.read_len(field, MAX_ARRAY_LEN)?;
        self.ensure(count.saturating_mul(min_element_size))?;
        Ok(count)
    }

    pub(crate) fn read_string(&mut self, field: &'static str) -> Result<String, DecodeError> {
        let len = self.read_len(field, MAX_BYTES_LEN)?;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8 { field })
    }

    pub(crate) fn read_optional_string(
        &mut self,
        field: &'static str,
    ) -> Result<Option<String>, DecodeError> {
        match self.read_optional_len(field, MAX_BYTES_LEN)? {
            None => Ok(None),
            Some(len) => {
                let bytes = self.take(len)?;
                String::from_utf8(bytes.to_vec())
                    .map(Some)
                    .map_err(|_| DecodeError::InvalidUtf8 { field })
            }
        }
    }

    pub(crate) fn read_bytes(&mut self, field: &'static str) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_len(field, MAX_BYTES_LEN)?;
        Ok(self.take(len)?.to_vec())
    }

    pub(crate) fn read_string_array(
        &mut self,
        field: &'static str,
    ) -> Result<Vec<String>, DecodeError> {
        let count = self.read_count(field, 4)?;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.read_string(field)?);
        }
        Ok(out)
    }

    pub(crate) fn read_i32_array(&mut self, field: &'static str) -> Result<Vec<i32>, DecodeError> {
        let count = self.read_count(field, 4)?;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.read_i32()?);
        }
        Ok(out)
    }

    pub(crate) fn read_i64_array(&mut self, field: &'static str) -> Result<Vec<i64>, DecodeError> {
        let count = self.read_count(field, 8)?;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.read_i64()?);
        }
        Ok(out)
    }

    pub(crate) fn read_i32_arrays(
        &mut self,
        field: &'static str,
    ) -> Result<Vec<Vec<i32>>, DecodeError> {
        let count = self.read_count(field, 4)?;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.read_i32_array(field)?);
        }
        Ok(out)
    }

    pub(crate) fn read_byte_arrays(
        &mut self,
        field: &'static str,
    ) -> Result<Vec<Option<Vec<u8>>>, DecodeError> {
        let count = self.read_count(field, 4)?;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let entry = match self.read_optional_len(field, MAX_BYTES_LEN)? {
                None => None,
                Some(len) => Some(self.take(len)?.to_vec()),
            };
            out.push(entry);
        }
        Ok(out)
    }
}

/// Appends fields to an output buffer.
pub(crate) struct WireWriter<'a> {
    buf: &'a mut BytesMut,
}

impl<'a> WireWriter<'a> {
    pub(crate) fn new(buf: &'a mut BytesMut) -> Self {
        Self { buf }
    }

    pub(crate) fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub(crate) fn put_i32(&mut self, value: i32) {
        self.buf.put_i32(value);
    }

    pub(crate) fn put_i64(&mut self, value: i64) {
        self.buf.put_i64(value);
    }

    pub(crate) fn put_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    fn put_len(&mut self, field: &'static str, len: usize, max: usize) -> Result<(), EncodeError> {
        if len > max {
            return Err(EncodeError::TooLarge { field, length: len, max });
        }
        self.buf.put_i32(len as i32);
        Ok(())
    }

    pub(crate) fn put_string(&mut self, field: &'static str, value: &str) -> Result<(), EncodeError> {
        self.put_len(field, value.len(), MAX_BYTES_LEN)?;
        self.buf.put_slice(value.as_bytes());
        Ok(())
    }

    pub(crate) fn put_optional_string(
        &mut self,
        field: &'static str,
        value: Option<&str>,
    ) -> Result<(), EncodeError> {
        match value {
            None => {
                self.buf.put_i32(ABSENT);
                Ok(())
            }
            Some(s) => self.put_string(field, s),
        }
    }

    pub(crate) fn put_bytes(&mut self, field: &'static str, value: &[u8]) -> Result<(), EncodeError> {
        self.put_len(field, value.len(), MAX_BYTES_LEN)?;
        self.buf.put_slice(value);
        Ok(())
    }

    pub(crate) fn put_string_array<S: AsRef<str>>(
        &mut self,
        field: &'static str,
        values: &[S],
    ) -> Result<(), EncodeError> {
        self.put_len(field, values.len(), MAX_ARRAY_LEN)?;
        for value in values {
            self.put_string(field, value.as_ref())?;
        }
        Ok(())
    }

    pub(crate) fn put_i32_array(&mut self, field: &'static str, values: &[i32]) -> Result<(), EncodeError> {
        self.put_len(field, values.len(), MAX_ARRAY_LEN)?;
        for &value in values {
            self.buf.put_i32(value);
        }
        Ok(())
    }

    pub(crate) fn put_i64_array(&mut self, field: &'static str, values: &[i64]) -> Result<(), EncodeError> {
        self.put_len(field, values.len(), MAX_ARRAY_LEN)?;
        for &value in values {
            self.buf.put_i64(value);
        }
        Ok(())
    }

    pub(crate) fn put_i32_arrays(
        &mut self,
        field: &'static str,
        values: &[Vec<i32>],
    ) -> Result<(), EncodeError> {
        self.put_len(field, values.len(), MAX_ARRAY_LEN)?;
        for inner in values {
            self.put_i32_array(field, inner)?;
        }
        Ok(())
    }

    pub(crate) fn put_byte_arrays(
        &mut self,
        field: &'static str,
        values: &[Option<Vec<u8>>],
    ) -> Result<(), EncodeError> {
        self.put_len(field, values.len(), MAX_ARRAY_LEN)?;
        for entry in values {
            match entry {
                None => self.buf.put_i32(ABSENT),
                Some(bytes) => self.put_bytes(field, bytes)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn written(f: impl FnOnce(&mut WireWriter<'_>)) -> BytesMut {
        let mut buf = BytesMut::new();
        f(&mut WireWriter::new(&mut buf));
        buf
    }

    #[test]
    fn negative_array_count_is_rejected_before_allocation() {
        let buf = written(|w| w.put_i32(-5));
        let err = WireReader::new(&buf).read_i32_array("ids").unwrap_err();
        assert_eq!(err, DecodeError::InvalidLength { field: "ids", length: -5 });
    }

    #[test]
    fn absurd_array_count_is_rejected() {
        let buf = written(|w| w.put_i32(i32::MAX));
        let err = WireReader::new(&buf).read_string_array("names").unwrap_err();
        assert!(matches!(err, DecodeError::InvalidLength { field: "names", .. }));
    }

    #[test]
    fn count_larger_than_input_is_truncated() {
        let buf = written(|w| {
            w.put_i32(1000);
            w.put_i64(7);
        });
        let err = WireReader::new(&buf).read_i64_array("starts").unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { .. }));
    }

    #[test]
    fn optional_fields_use_minus_one_for_absent() {
        let buf = written(|w| {
            w.put_optional_string("msg", None).unwrap();
            w.put_byte_arrays("bytes", &[None, Some(vec![1, 2, 3])]).unwrap();
        });
        let mut reader = WireReader::new(&buf);
        assert_eq!(reader.read_optional_string("msg").unwrap(), None);
        assert_eq!(reader.read_byte_arrays("bytes").unwrap(), vec![None, Some(vec![1, 2, 3])]);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn minus_one_is_invalid_for_required_strings() {
        let buf = written(|w| w.put_i32(-1));
        let err = WireReader::new(&buf).read_string("name").unwrap_err();
        assert_eq!(err, DecodeError::InvalidLength { field: "name", length: -1 });
    }

    #[test]
    fn invalid_boolean_byte_is_malformed() {
        let buf = written(|w| w.put_u8(2));
        let err = WireReader::new(&buf).read_bool("ok").unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { context: "ok", .. }));
    }

    #[test]
    fn invalid_utf8_is_reported_with_field() {
        let buf = written(|w| w.put_bytes("raw", &[0xff, 0xfe]).unwrap());
        let err = WireReader::new(&buf).read_string("class_name").unwrap_err();
        assert_eq!(err, DecodeError::InvalidUtf8 { field: "class_name" });
    }
}
