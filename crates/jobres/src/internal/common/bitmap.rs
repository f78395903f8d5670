use bitvec::prelude::*;
use std::fmt::{Debug, Display, Formatter};
use std::ops::Range;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BitmapParseError {
    #[error("Bit {index} is out of range for a bitmap of size {size}")]
    OutOfRange { index: usize, size: usize },
    #[error("Invalid bit string '{0}'")]
    InvalidFormat(String),
}

/// Fixed-size bitmap.
///
/// Used both for node sets (indexed by global node index) and for core sets (indexed by the
/// job's packed core offsets). Sizes are fixed on creation and only change through
/// [`Bitmap::resize`] or [`Bitmap::remove_range`].
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Bitmap {
    bits: BitVec<u64, Lsb0>,
}

impl Bitmap {
    pub fn new(size: usize) -> Self {
        Bitmap {
            bits: bitvec![u64, Lsb0; 0; size],
        }
    }

    pub fn full(size: usize) -> Self {
        Bitmap {
            bits: bitvec![u64, Lsb0; 1; size],
        }
    }

    pub fn from_indices(size: usize, indices: impl IntoIterator<Item = usize>) -> Self {
        let mut bitmap = Bitmap::new(size);
        for index in indices {
            bitmap.set(index);
        }
        bitmap
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.bits.len()
    }

    #[inline]
    pub fn test(&self, index: usize) -> bool {
        self.bits.get(index).is_some_and(|bit| *bit)
    }

    /// Sets a bit; indices outside of the bitmap are ignored.
    #[inline]
    pub fn set(&mut self, index: usize) {
        debug_assert!(index < self.size());
        if index < self.size() {
            self.bits.set(index, true);
        }
    }

    #[inline]
    pub fn clear(&mut self, index: usize) {
        if index < self.size() {
            self.bits.set(index, false);
        }
    }

    pub fn set_range(&mut self, range: Range<usize>) {
        self.bits[range].fill(true);
    }

    pub fn clear_range(&mut self, range: Range<usize>) {
        self.bits[range].fill(false);
    }

    pub fn clear_all(&mut self) {
        self.bits.fill(false);
    }

    #[inline]
    pub fn set_count(&self) -> usize {
        self.bits.count_ones()
    }

    pub fn count_range(&self, range: Range<usize>) -> usize {
        self.bits[range].count_ones()
    }

    pub fn any_in_range(&self, range: Range<usize>) -> bool {
        self.bits[range].any()
    }

    #[inline]
    pub fn is_clear(&self) -> bool {
        self.bits.not_any()
    }

    pub fn first_set(&self) -> Option<usize> {
        self.bits.first_one()
    }

    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }

    pub fn ones_in(&self, range: Range<usize>) -> impl Iterator<Item = usize> + '_ {
        let start = range.start;
        self.bits[range].iter_ones().map(move |index| index + start)
    }

    /// Number of set bits strictly below `index`.
    pub fn rank(&self, index: usize) -> usize {
        self.bits[..index.min(self.size())].count_ones()
    }

    /// Sets every bit that is set in `other`.
    pub fn or_with(&mut self, other: &Bitmap) {
        for index in other.ones() {
            self.set(index);
        }
    }

    /// Clears every bit that is set in `other`.
    pub fn and_not_with(&mut self, other: &Bitmap) {
        for index in other.ones() {
            self.clear(index);
        }
    }

    /// Keeps only bits that are also set in `other`.
    pub fn and_with(&mut self, other: &Bitmap) {
        let to_clear: Vec<usize> = self.ones().filter(|index| !other.test(*index)).collect();
        for index in to_clear {
            self.clear(index);
        }
    }

    pub fn is_superset_of(&self, other: &Bitmap) -> bool {
        other.ones().all(|index| self.test(index))
    }

    pub fn overlaps(&self, other: &Bitmap) -> bool {
        other.ones().any(|index| self.test(index))
    }

    pub fn resize(&mut self, size: usize) {
        self.bits.resize(size, false);
    }

    /// Returns a copy without the bits of `range`; bits above the range move down.
    pub fn remove_range(&self, range: Range<usize>) -> Bitmap {
        let removed = range.end.saturating_sub(range.start);
        let mut result = Bitmap::new(self.size().saturating_sub(removed));
        for index in self.ones() {
            if index < range.start {
                result.set(index);
            } else if index >= range.end {
                result.set(index - removed);
            }
        }
        result
    }

    /// Formats set bits as a range list, e.g. `0-3,7`.
    pub fn fmt_ranges(&self) -> String {
        let mut out = String::new();
        let mut iter = self.ones().peekable();
        while let Some(start) = iter.next() {
            let mut end = start;
            while iter.peek() == Some(&(end + 1)) {
                end += 1;
                iter.next();
            }
            if !out.is_empty() {
                out.push(',');
            }
            if start == end {
                out.push_str(&start.to_string());
            } else {
                out.push_str(&format!("{start}-{end}"));
            }
        }
        out
    }

    pub fn parse_ranges(size: usize, input: &str) -> Result<Bitmap, BitmapParseError> {
        let mut bitmap = Bitmap::new(size);
        let input = input.trim();
        if input.is_empty() {
            return Ok(bitmap);
        }
        let invalid = || BitmapParseError::InvalidFormat(input.to_string());
        for part in input.split(',') {
            let (start, end) = match part.split_once('-') {
                Some((start, end)) => (
                    start.trim().parse::<usize>().map_err(|_| invalid())?,
                    end.trim().parse::<usize>().map_err(|_| invalid())?,
                ),
                None => {
                    let index = part.trim().parse::<usize>().map_err(|_| invalid())?;
                    (index, index)
                }
            };
            if start > end {
                return Err(invalid());
            }
            if end >= size {
                return Err(BitmapParseError::OutOfRange { index: end, size });
            }
            bitmap.set_range(start..end + 1);
        }
        Ok(bitmap)
    }

    /// Formats the bitmap as a hex mask, most significant nibble first, e.g. `0x0F`.
    pub fn fmt_hex(&self) -> String {
        let digits = self.size().div_ceil(4).max(1);
        let mut out = String::with_capacity(digits + 2);
        out.push_str("0x");
        for digit in (0..digits).rev() {
            let mut value = 0u32;
            for bit in 0..4 {
                if self.test(digit * 4 + bit) {
                    value |= 1 << bit;
                }
            }
            out.push(char::from_digit(value, 16).unwrap_or('0').to_ascii_uppercase());
        }
        out
    }

    pub fn parse_hex(size: usize, input: &str) -> Result<Bitmap, BitmapParseError> {
        let invalid = || BitmapParseError::InvalidFormat(input.to_string());
        let digits = input
            .trim()
            .strip_prefix("0x")
            .or_else(|| input.trim().strip_prefix("0X"))
            .ok_or_else(invalid)?;
        if digits.is_empty() {
            return Err(invalid());
        }
        let mut bitmap = Bitmap::new(size);
        for (position, c) in digits.chars().rev().enumerate() {
            let value = c.to_digit(16).ok_or_else(invalid)?;
            for bit in 0..4 {
                if value & (1 << bit) != 0 {
                    let index = position * 4 + bit;
                    if index >= size {
                        return Err(BitmapParseError::OutOfRange { index, size });
                    }
                    bitmap.set(index);
                }
            }
        }
        Ok(bitmap)
    }
}

impl Display for Bitmap {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.fmt_ranges())
    }
}

impl Debug for Bitmap {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Bitmap[{}]{{{}}}", self.size(), self.fmt_ranges())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_ranges() {
        let bitmap = Bitmap::from_indices(12, [0, 1, 2, 3, 7, 9, 10]);
        assert_eq!(bitmap.fmt_ranges(), "0-3,7,9-10");
        assert_eq!(Bitmap::parse_ranges(12, "0-3,7,9-10").unwrap(), bitmap);
        assert_eq!(Bitmap::new(5).fmt_ranges(), "");
        assert!(Bitmap::parse_ranges(5, "").unwrap().is_clear());
    }

    #[test]
    fn test_bitmap_ranges_invalid() {
        assert_eq!(
            Bitmap::parse_ranges(4, "0-4"),
            Err(BitmapParseError::OutOfRange { index: 4, size: 4 })
        );
        assert!(matches!(
            Bitmap::parse_ranges(4, "3-1"),
            Err(BitmapParseError::InvalidFormat(_))
        ));
        assert!(matches!(
            Bitmap::parse_ranges(4, "a"),
            Err(BitmapParseError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_bitmap_hex() {
        let bitmap = Bitmap::from_indices(10, [0, 1, 2, 3, 9]);
        assert_eq!(bitmap.fmt_hex(), "0x20F");
        assert_eq!(Bitmap::parse_hex(10, "0x20F").unwrap(), bitmap);
        assert_eq!(Bitmap::new(0).fmt_hex(), "0x0");
        assert_eq!(Bitmap::parse_hex(0, "0x0").unwrap(), Bitmap::new(0));
        assert_eq!(
            Bitmap::parse_hex(10, "0x40F"),
            Err(BitmapParseError::OutOfRange { index: 10, size: 10 })
        );
        assert!(Bitmap::parse_hex(10, "20F").is_err());
    }

    #[test]
    fn test_bitmap_set_ops() {
        let mut a = Bitmap::from_indices(8, [0, 1, 2]);
        let b = Bitmap::from_indices(8, [2, 3]);
        assert!(a.overlaps(&b));
        a.or_with(&b);
        assert_eq!(a.fmt_ranges(), "0-3");
        assert!(a.is_superset_of(&b));
        a.and_not_with(&b);
        assert_eq!(a.fmt_ranges(), "0-1");
        assert!(!a.overlaps(&b));
        a.set(6);
        a.and_with(&Bitmap::from_indices(8, [1, 6, 7]));
        assert_eq!(a.fmt_ranges(), "1,6");
        assert_eq!(a.rank(6), 1);
        assert_eq!(a.count_range(0..6), 1);
    }

    #[test]
    fn test_bitmap_remove_range() {
        let bitmap = Bitmap::from_indices(10, [0, 3, 4, 8]);
        let removed = bitmap.remove_range(2..5);
        assert_eq!(removed.size(), 7);
        assert_eq!(removed.fmt_ranges(), "0,5");
    }
}
