//! Fixed-width record keys.
//!
//! Keys compare as unsigned byte strings, most significant byte first. The
//! lowest bit of the last byte marks a live record (1) versus a tombstone (0).

use std::fmt;

use crate::error::Result;
use crate::Error;

/// Bit in the lowest key byte that marks a positive (live) record.
pub const POSITIVE_BIT: u8 = 0x01;

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Key(Vec<u8>);

impl Key {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    /// The smallest key of the given width.
    pub fn min(width: usize) -> Self {
        Self(vec![0u8; width])
    }

    /// The largest key of the given width. Also used as the cache's
    /// evicted-entry sentinel.
    pub fn max(width: usize) -> Self {
        Self(vec![0xffu8; width])
    }

    /// Builds a key whose low eight bytes hold `value` big-endian.
    pub fn from_u64(width: usize, value: u64) -> Self {
        let mut bytes = vec![0u8; width];
        let be = value.to_be_bytes();
        let n = width.min(8);
        bytes[width - n..].copy_from_slice(&be[8 - n..]);
        Self(bytes)
    }

    /// Reads back the low eight bytes as an integer.
    pub fn low_u64(&self) -> u64 {
        let n = self.0.len().min(8);
        let mut be = [0u8; 8];
        be[8 - n..].copy_from_slice(&self.0[self.0.len() - n..]);
        u64::from_be_bytes(be)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn width(&self) -> usize {
        self.0.len()
    }

    pub fn is_positive(&self) -> bool {
        self.0.last().map_or(false, |b| b & POSITIVE_BIT != 0)
    }

    pub fn is_negative(&self) -> bool {
        !self.is_positive()
    }

    /// The same key with the live bit set.
    pub fn positive(&self) -> Self {
        let mut k = self.clone();
        if let Some(b) = k.0.last_mut() {
            *b |= POSITIVE_BIT;
        }
        k
    }

    /// The same key with the live bit cleared (its tombstone).
    pub fn negative(&self) -> Self {
        let mut k = self.clone();
        if let Some(b) = k.0.last_mut() {
            *b &= !POSITIVE_BIT;
        }
        k
    }

    /// Compares two keys ignoring the live bit, so a record and its tombstone
    /// sort together.
    pub fn same_record(&self, other: &Key) -> bool {
        self.0.len() == other.0.len()
            && self.0[..self.0.len().saturating_sub(1)] == other.0[..other.0.len().saturating_sub(1)]
            && self.0.last().map(|b| b | POSITIVE_BIT) == other.0.last().map(|b| b | POSITIVE_BIT)
    }

    /// The next key in order, or `None` when this is the max key.
    pub fn successor(&self) -> Option<Key> {
        let mut bytes = self.0.clone();
        for b in bytes.iter_mut().rev() {
            if *b == 0xff {
                *b = 0;
            } else {
                *b += 1;
                return Some(Key(bytes));
            }
        }
        None
    }

    /// The previous key in order, or `None` when this is the min key.
    pub fn predecessor(&self) -> Option<Key> {
        let mut bytes = self.0.clone();
        for b in bytes.iter_mut().rev() {
            if *b == 0 {
                *b = 0xff;
            } else {
                *b -= 1;
                return Some(Key(bytes));
            }
        }
        None
    }

    pub fn check_width(&self, width: usize) -> Result<()> {
        if self.0.len() != width {
            return Err(Error::InvalidOperation(format!(
                "key width {} does not match configured width {}",
                self.0.len(),
                width
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x")?;
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl From<Vec<u8>> for Key {
    fn from(bytes: Vec<u8>) -> Self {
        Key(bytes)
    }
}

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_is_unsigned_bytewise() {
        let a = Key::new(vec![0x00, 0xff]);
        let b = Key::new(vec![0x01, 0x00]);
        assert!(a < b);
        assert!(Key::min(4) < Key::from_u64(4, 1));
        assert!(Key::from_u64(4, u32::MAX as u64) == Key::max(4));
    }

    #[test]
    fn test_positive_negative_bit() {
        let k = Key::from_u64(12, 0x10);
        assert!(k.is_negative());
        let p = k.positive();
        assert!(p.is_positive());
        assert_eq!(p.low_u64(), 0x11);
        assert_eq!(p.negative(), k);
        assert!(p.same_record(&k));
        assert!(!p.same_record(&Key::from_u64(12, 0x13)));
    }

    #[test]
    fn test_successor_and_predecessor() {
        let k = Key::new(vec![0x00, 0xff]);
        assert_eq!(k.successor().unwrap(), Key::new(vec![0x01, 0x00]));
        assert_eq!(
            Key::new(vec![0x01, 0x00]).predecessor().unwrap(),
            Key::new(vec![0x00, 0xff])
        );
        assert!(Key::max(3).successor().is_none());
        assert!(Key::min(3).predecessor().is_none());
    }

    #[test]
    fn test_from_u64_wider_than_eight() {
        let k = Key::from_u64(16, 0x0102);
        assert_eq!(k.width(), 16);
        assert_eq!(k.low_u64(), 0x0102);
        assert_eq!(format!("{}", Key::new(vec![0xab, 0x01])), "0xab01");
    }

    #[test]
    fn test_check_width() {
        assert!(Key::min(12).check_width(12).is_ok());
        assert!(matches!(
            Key::min(12).check_width(16),
            Err(Error::InvalidOperation(_))
        ));
    }
}
