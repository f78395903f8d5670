use crate::internal::common::bitmap::Bitmap;
use crate::internal::common::error::unpack_error;
use crate::internal::common::ids::{NO_VAL, NO_VAL16, NO_VAL64};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Version of the binary layout.
///
/// `LEGACY` carries only the topology, memory and core bitmaps of a resource map (bit strings
/// as range lists). `CURRENT` appends per-node CPU counters, the cpu array, used memory and
/// the global node bitmap, and writes bit strings as hex masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolVersion(u16);

impl ProtocolVersion {
    pub const LEGACY: ProtocolVersion = ProtocolVersion(0x2300);
    pub const CURRENT: ProtocolVersion = ProtocolVersion(0x2400);

    #[inline]
    pub const fn new(version: u16) -> Self {
        ProtocolVersion(version)
    }

    #[inline]
    pub fn as_num(&self) -> u16 {
        self.0
    }

    pub fn is_supported(&self) -> bool {
        *self == Self::LEGACY || *self == Self::CURRENT
    }

    #[inline]
    pub fn has_usage_fields(&self) -> bool {
        *self >= Self::CURRENT
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Big-endian output buffer.
#[derive(Default)]
pub struct PackBuffer {
    data: BytesMut,
}

impl PackBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn freeze(self) -> Bytes {
        self.data.freeze()
    }

    pub fn pack_raw(&mut self, data: &[u8]) {
        self.data.put_slice(data);
    }

    #[inline]
    pub fn pack8(&mut self, value: u8) {
        self.data.put_u8(value);
    }

    #[inline]
    pub fn pack_bool(&mut self, value: bool) {
        self.pack8(value as u8);
    }

    #[inline]
    pub fn pack16(&mut self, value: u16) {
        self.data.put_u16(value);
    }

    #[inline]
    pub fn pack32(&mut self, value: u32) {
        self.data.put_u32(value);
    }

    #[inline]
    pub fn pack64(&mut self, value: u64) {
        self.data.put_u64(value);
    }

    pub fn pack_opt32(&mut self, value: Option<u32>) {
        self.pack32(value.unwrap_or(NO_VAL));
    }

    pub fn pack_opt16(&mut self, value: Option<u16>) {
        self.pack16(value.unwrap_or(NO_VAL16));
    }

    pub fn pack_opt64(&mut self, value: Option<u64>) {
        self.pack64(value.unwrap_or(NO_VAL64));
    }

    /// Strings are written as a length that includes a terminating NUL, the bytes and the
    /// NUL. An absent string is a zero length.
    pub fn pack_str(&mut self, value: Option<&str>) {
        match value {
            None => self.pack32(0),
            Some(s) => {
                self.pack32(s.len() as u32 + 1);
                self.data.put_slice(s.as_bytes());
                self.data.put_u8(0);
            }
        }
    }

    pub fn pack16_array(&mut self, values: &[u16]) {
        self.pack32(values.len() as u32);
        for value in values {
            self.pack16(*value);
        }
    }

    pub fn pack32_array(&mut self, values: &[u32]) {
        self.pack32(values.len() as u32);
        for value in values {
            self.pack32(*value);
        }
    }

    pub fn pack64_array(&mut self, values: &[u64]) {
        self.pack32(values.len() as u32);
        for value in values {
            self.pack64(*value);
        }
    }

    /// Bit string only; the reader has to know the bitmap size.
    pub fn pack_bit_str(&mut self, bitmap: &Bitmap, version: ProtocolVersion) {
        let formatted = if version.has_usage_fields() {
            bitmap.fmt_hex()
        } else {
            bitmap.fmt_ranges()
        };
        self.pack_str(Some(&formatted));
    }

    /// Bitmap with its size; `None` is written as a `NO_VAL` size.
    pub fn pack_bitmap(&mut self, bitmap: Option<&Bitmap>, version: ProtocolVersion) {
        match bitmap {
            None => self.pack32(NO_VAL),
            Some(bitmap) => {
                self.pack32(bitmap.size() as u32);
                self.pack_bit_str(bitmap, version);
            }
        }
    }
}

/// Reader over a packed buffer. Every read checks the remaining length first, so truncated
/// input fails with a malformed-data error instead of panicking.
pub struct UnpackBuffer<'a> {
    data: &'a [u8],
}

impl<'a> UnpackBuffer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        UnpackBuffer { data }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    fn ensure(&self, size: usize, what: &str) -> crate::Result<()> {
        if self.data.len() < size {
            return Err(unpack_error(format!(
                "truncated buffer while reading {what}: need {size} bytes, {} left",
                self.data.len()
            )));
        }
        Ok(())
    }

    pub fn unpack_raw(&mut self, size: usize) -> crate::Result<&'a [u8]> {
        self.ensure(size, "raw bytes")?;
        let (head, tail) = self.data.split_at(size);
        self.data = tail;
        Ok(head)
    }

    pub fn unpack8(&mut self) -> crate::Result<u8> {
        self.ensure(1, "u8")?;
        Ok(self.data.get_u8())
    }

    pub fn unpack_bool(&mut self) -> crate::Result<bool> {
        match self.unpack8()? {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(unpack_error(format!("invalid boolean value {value}"))),
        }
    }

    pub fn unpack16(&mut self) -> crate::Result<u16> {
        self.ensure(2, "u16")?;
        Ok(self.data.get_u16())
    }

    pub fn unpack32(&mut self) -> crate::Result<u32> {
        self.ensure(4, "u32")?;
        Ok(self.data.get_u32())
    }

    pub fn unpack64(&mut self) -> crate::Result<u64> {
        self.ensure(8, "u64")?;
        Ok(self.data.get_u64())
    }

    pub fn unpack_opt16(&mut self) -> crate::Result<Option<u16>> {
        Ok(Some(self.unpack16()?).filter(|v| *v != NO_VAL16))
    }

    pub fn unpack_opt32(&mut self) -> crate::Result<Option<u32>> {
        Ok(Some(self.unpack32()?).filter(|v| *v != NO_VAL))
    }

    pub fn unpack_opt64(&mut self) -> crate::Result<Option<u64>> {
        Ok(Some(self.unpack64()?).filter(|v| *v != NO_VAL64))
    }

    pub fn unpack_str(&mut self) -> crate::Result<Option<String>> {
        let size = self.unpack32()? as usize;
        if size == 0 {
            return Ok(None);
        }
        let bytes = self.unpack_raw(size)?;
        let (content, terminator) = bytes.split_at(size - 1);
        if terminator.first() != Some(&0) {
            return Err(unpack_error("string is not NUL terminated".to_string()));
        }
        String::from_utf8(content.to_vec())
            .map(Some)
            .map_err(|e| unpack_error(format!("invalid string: {e}")))
    }

    fn unpack_count(&mut self, item_size: usize, what: &str) -> crate::Result<usize> {
        let count = self.unpack32()? as usize;
        self.ensure(count.saturating_mul(item_size), what)?;
        Ok(count)
    }

    pub fn unpack16_array(&mut self) -> crate::Result<Vec<u16>> {
        let count = self.unpack_count(2, "u16 array")?;
        Ok((0..count).map(|_| self.data.get_u16()).collect())
    }

    pub fn unpack32_array(&mut self) -> crate::Result<Vec<u32>> {
        let count = self.unpack_count(4, "u32 array")?;
        Ok((0..count).map(|_| self.data.get_u32()).collect())
    }

    pub fn unpack64_array(&mut self) -> crate::Result<Vec<u64>> {
        let count = self.unpack_count(8, "u64 array")?;
        Ok((0..count).map(|_| self.data.get_u64()).collect())
    }

    pub fn unpack_bit_str(&mut self, size: usize, version: ProtocolVersion) -> crate::Result<Bitmap> {
        let Some(formatted) = self.unpack_str()? else {
            return Ok(Bitmap::new(size));
        };
        let parsed = if version.has_usage_fields() {
            Bitmap::parse_hex(size, &formatted)
        } else {
            Bitmap::parse_ranges(size, &formatted)
        };
        parsed.map_err(|e| unpack_error(e.to_string()))
    }

    pub fn unpack_bitmap(
        &mut self,
        version: ProtocolVersion,
        max_size: usize,
    ) -> crate::Result<Option<Bitmap>> {
        let size = self.unpack32()?;
        if size == NO_VAL {
            return Ok(None);
        }
        if size as usize > max_size {
            return Err(unpack_error(format!(
                "bitmap size {size} exceeds the limit {max_size}"
            )));
        }
        self.unpack_bit_str(size as usize, version).map(Some)
    }
}
