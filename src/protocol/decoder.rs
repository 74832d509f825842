/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use super::crc_field::{release_crc32_field, Crc32Field};
use super::{Error, Result};

// Arrays above this element count are rejected to bound allocation on
// malformed or hostile frames.
const MAX_ARRAY_LEN: i32 = 1 << 24;

/// Cursor over one immutable request frame.
///
/// All integers on the wire are big-endian two's complement. Length-prefixed
/// fields use -1 as the null sentinel, which is distinct from an empty value.
pub struct Decoder<'a> {
    raw: &'a [u8],
    off: usize,
    stack: Vec<PushedField>,
}

/// A bounded sub-region of the frame whose consumption is tracked between
/// `push` and `pop`.
pub enum PushedField {
    Crc32(Box<Crc32Field>),
    VarintLength(VarintLengthField),
}

impl PushedField {
    fn reserve(&self) -> usize {
        match self {
            PushedField::Crc32(f) => f.reserve(),
            PushedField::VarintLength(_) => 0,
        }
    }

    fn save_offset(&mut self, off: usize) {
        match self {
            PushedField::Crc32(f) => f.save_offset(off),
            PushedField::VarintLength(f) => f.save_offset(off),
        }
    }

    fn check(&self, cur_offset: usize, buf: &[u8]) -> Result<()> {
        match self {
            PushedField::Crc32(f) => f.check(cur_offset, buf),
            PushedField::VarintLength(f) => f.check(cur_offset),
        }
    }
}

/// Length guard for varint-prefixed regions (v2 records). The length is read
/// before the push; the pop asserts the region was consumed exactly.
#[derive(Default)]
pub struct VarintLengthField {
    start_offset: usize,
    length: i64,
}

impl VarintLengthField {
    pub fn decode(&mut self, pd: &mut Decoder) -> Result<()> {
        self.length = pd.get_varint()?;
        if self.length < 0 {
            return Err(Error::InvalidData("negative region length".into()));
        }
        Ok(())
    }

    fn save_offset(&mut self, off: usize) {
        self.start_offset = off;
    }

    fn check(&self, cur_offset: usize) -> Result<()> {
        if cur_offset - self.start_offset != self.length as usize {
            return Err(Error::InvalidData("region not fully consumed".into()));
        }
        Ok(())
    }
}

impl<'a> Decoder<'a> {
    pub fn new(raw: &'a [u8]) -> Self {
        Self {
            raw,
            off: 0,
            stack: Vec::new(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.raw.len() - self.off
    }

    pub fn offset(&self) -> usize {
        self.off
    }

    pub fn get_int8(&mut self) -> Result<i8> {
        if self.remaining() < 1 {
            return Err(Error::InsufficientData);
        }
        let v = self.raw[self.off] as i8;
        self.off += 1;
        Ok(v)
    }

    pub fn get_int16(&mut self) -> Result<i16> {
        if self.remaining() < 2 {
            return Err(Error::InsufficientData);
        }
        let v = i16::from_be_bytes(self.raw[self.off..self.off + 2].try_into().unwrap());
        self.off += 2;
        Ok(v)
    }

    pub fn get_int32(&mut self) -> Result<i32> {
        if self.remaining() < 4 {
            return Err(Error::InsufficientData);
        }
        let v = i32::from_be_bytes(self.raw[self.off..self.off + 4].try_into().unwrap());
        self.off += 4;
        Ok(v)
    }

    pub fn get_int64(&mut self) -> Result<i64> {
        if self.remaining() < 8 {
            return Err(Error::InsufficientData);
        }
        let v = i64::from_be_bytes(self.raw[self.off..self.off + 8].try_into().unwrap());
        self.off += 8;
        Ok(v)
    }

    /// Reads the int8 at `cursor + offset` without advancing.
    pub fn peek_int8(&self, offset: usize) -> Result<i8> {
        if self.remaining() < offset + 1 {
            return Err(Error::InsufficientData);
        }
        Ok(self.raw[self.off + offset] as i8)
    }

    /// Zig-zag encoded signed varint, at most 64 bits.
    pub fn get_varint(&mut self) -> Result<i64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            if self.remaining() < 1 {
                return Err(Error::InsufficientData);
            }
            let b = self.raw[self.off];
            self.off += 1;
            value |= u64::from(b & 0x7f) << shift;
            if b & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift >= 64 {
                return Err(Error::InvalidData("varint overflows 64 bits".into()));
            }
        }
        Ok((value >> 1) as i64 ^ -((value & 1) as i64))
    }

    /// int16-length-prefixed string; -1 means null. The bytes are taken as
    /// UTF-8 without strict validation.
    pub fn get_string(&mut self) -> Result<Option<String>> {
        let len = self.get_int16()?;
        match len {
            -1 => Ok(None),
            n if n < -1 => Err(Error::InvalidData("negative string length".into())),
            n => {
                let raw = self.get_raw_bytes(n as usize)?;
                Ok(Some(String::from_utf8_lossy(raw).into_owned()))
            }
        }
    }

    /// int32-length-prefixed bytes; -1 means null.
    pub fn get_bytes(&mut self) -> Result<Option<&'a [u8]>> {
        let len = self.get_int32()?;
        match len {
            -1 => Ok(None),
            n if n < -1 => Err(Error::InvalidData("negative bytes length".into())),
            n => Ok(Some(self.get_raw_bytes(n as usize)?)),
        }
    }

    /// varint-length-prefixed bytes (v2 records); -1 means null.
    pub fn get_varint_bytes(&mut self) -> Result<Option<&'a [u8]>> {
        let len = self.get_varint()?;
        match len {
            -1 => Ok(None),
            n if n < -1 => Err(Error::InvalidData("negative bytes length".into())),
            n => Ok(Some(self.get_raw_bytes(n as usize)?)),
        }
    }

    pub fn get_raw_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            self.off = self.raw.len();
            return Err(Error::InsufficientData);
        }
        let s = &self.raw[self.off..self.off + n];
        self.off += n;
        Ok(s)
    }

    /// int32 element count; -1 means null array, distinct from empty.
    pub fn get_array_length(&mut self) -> Result<Option<usize>> {
        let len = self.get_int32()?;
        match len {
            -1 => Ok(None),
            n if n < -1 => Err(Error::InvalidData("negative array length".into())),
            n if n >= MAX_ARRAY_LEN => Err(Error::InvalidData("array length too large".into())),
            n => Ok(Some(n as usize)),
        }
    }

    /// varint element count (v2 record headers); -1 means null.
    pub fn get_varint_array_length(&mut self) -> Result<Option<usize>> {
        let len = self.get_varint()?;
        match len {
            -1 => Ok(None),
            n if n < -1 => Err(Error::InvalidData("negative array length".into())),
            n if n >= i64::from(MAX_ARRAY_LEN) => {
                Err(Error::InvalidData("array length too large".into()))
            }
            n => Ok(Some(n as usize)),
        }
    }

    pub fn push(&mut self, mut field: PushedField) -> Result<()> {
        field.save_offset(self.off);
        let reserve = field.reserve();
        if self.remaining() < reserve {
            return Err(Error::InsufficientData);
        }
        self.off += reserve;
        self.stack.push(field);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<()> {
        let field = self
            .stack
            .pop()
            .ok_or_else(|| Error::InvalidData("pop on empty sub-region stack".into()))?;
        let res = field.check(self.off, self.raw);
        if let PushedField::Crc32(f) = field {
            release_crc32_field(f);
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_width_integers() {
        let buf = [
            0x7f, 0x01, 0x02, 0xff, 0xff, 0xff, 0xfe, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x2a,
        ];
        let mut d = Decoder::new(&buf);
        assert_eq!(d.get_int8().unwrap(), 0x7f);
        assert_eq!(d.get_int16().unwrap(), 0x0102);
        assert_eq!(d.get_int32().unwrap(), -2);
        assert_eq!(d.get_int64().unwrap(), 42);
        assert_eq!(d.remaining(), 0);
        assert!(matches!(d.get_int8(), Err(Error::InsufficientData)));
    }

    #[test]
    fn peek_does_not_advance() {
        let buf = [0x00, 0x01, 0x02];
        let d = Decoder::new(&buf);
        assert_eq!(d.peek_int8(2).unwrap(), 2);
        assert_eq!(d.peek_int8(0).unwrap(), 0);
        assert!(matches!(d.peek_int8(3), Err(Error::InsufficientData)));
    }

    #[test]
    fn strings_and_nulls() {
        let buf = [0x00, 0x03, b'f', b'o', b'o', 0xff, 0xff];
        let mut d = Decoder::new(&buf);
        assert_eq!(d.get_string().unwrap().as_deref(), Some("foo"));
        assert_eq!(d.get_string().unwrap(), None);
    }

    #[test]
    fn string_shorter_than_length() {
        let buf = [0x00, 0x05, b'f', b'o'];
        let mut d = Decoder::new(&buf);
        assert!(matches!(d.get_string(), Err(Error::InsufficientData)));
    }

    #[test]
    fn bytes_and_nulls() {
        let buf = [0x00, 0x00, 0x00, 0x02, 0xde, 0xad, 0xff, 0xff, 0xff, 0xff];
        let mut d = Decoder::new(&buf);
        assert_eq!(d.get_bytes().unwrap(), Some(&[0xde, 0xad][..]));
        assert_eq!(d.get_bytes().unwrap(), None);
    }

    #[test]
    fn null_array_is_distinct_from_empty() {
        let buf = [0xff, 0xff, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00];
        let mut d = Decoder::new(&buf);
        assert_eq!(d.get_array_length().unwrap(), None);
        assert_eq!(d.get_array_length().unwrap(), Some(0));
    }

    #[test]
    fn oversized_array_rejected() {
        let buf = (1i32 << 24).to_be_bytes();
        let mut d = Decoder::new(&buf);
        assert!(matches!(d.get_array_length(), Err(Error::InvalidData(_))));
    }

    #[test]
    fn varint_zigzag() {
        // 0, -1, 1, -2, 300
        let buf = [0x00, 0x01, 0x02, 0x03, 0xd8, 0x04];
        let mut d = Decoder::new(&buf);
        assert_eq!(d.get_varint().unwrap(), 0);
        assert_eq!(d.get_varint().unwrap(), -1);
        assert_eq!(d.get_varint().unwrap(), 1);
        assert_eq!(d.get_varint().unwrap(), -2);
        assert_eq!(d.get_varint().unwrap(), 300);
    }

    #[test]
    fn varint_overflow_rejected() {
        let buf = [0xff; 11];
        let mut d = Decoder::new(&buf);
        assert!(matches!(d.get_varint(), Err(Error::InvalidData(_))));
    }

    #[test]
    fn varint_length_region_must_be_consumed() {
        // length 3 followed by 3 payload bytes
        let buf = [0x06, 0xaa, 0xbb, 0xcc];
        let mut d = Decoder::new(&buf);
        let mut field = VarintLengthField::default();
        field.decode(&mut d).unwrap();
        d.push(PushedField::VarintLength(field)).unwrap();
        d.get_raw_bytes(2).unwrap();
        assert!(matches!(d.pop(), Err(Error::InvalidData(_))));

        let mut d = Decoder::new(&buf);
        let mut field = VarintLengthField::default();
        field.decode(&mut d).unwrap();
        let start = d.offset();
        d.push(PushedField::VarintLength(field)).unwrap();
        d.get_raw_bytes(3).unwrap();
        d.pop().unwrap();
        assert_eq!(d.offset(), start + 3);
    }
}
