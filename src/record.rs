//! On-disk record layout.
//!
//! A record is `[key][data length (u32 LE, variable size only)][data]`. Keys
//! are written least significant byte first so the first stored byte always
//! carries the live bit and, when key compression is enabled, the two flag
//! bits that say how many key bytes follow:
//!
//! ```text
//! flags (bits 1..2 of the first byte)
//!   00  full key (key_size bytes)
//!   01  12 low bytes, the rest shared with the previous key
//!   10   6 low bytes, the rest shared with the previous key
//! ```
//!
//! With compression on, bits 1..2 of a key's lowest byte are reserved and
//! always read back as zero.

use std::cmp::Ordering;
use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use itertools::Itertools;

use crate::error::Result;
use crate::key::Key;
use crate::Error;

const HALF_12: u8 = 0x02;
const HALF_6: u8 = 0x04;
const FLAG_BITS: u8 = HALF_12 | HALF_6;

/// Payload size of each record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSize {
    /// Every record carries exactly this many payload bytes (0 = keys only).
    Fixed(usize),
    /// Each record is preceded by a 4-byte payload length.
    Variable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordFormat {
    pub key_size: usize,
    pub data_size: DataSize,
    pub half_keys: bool,
    pub max_record_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Key,
    pub data: Vec<u8>,
}

impl Record {
    pub fn new(key: Key, data: Vec<u8>) -> Self {
        Self { key, data }
    }

    pub fn key_only(key: Key) -> Self {
        Self {
            key,
            data: Vec::new(),
        }
    }
}

impl RecordFormat {
    pub fn new(key_size: usize, data_size: DataSize) -> Self {
        Self {
            key_size,
            data_size,
            half_keys: false,
            max_record_size: 64 * 1024 * 1024,
        }
    }

    pub fn with_half_keys(mut self) -> Self {
        self.half_keys = true;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.key_size == 0 {
            return Err(Error::InvalidConfig("key size must be positive".to_string()));
        }
        if self.half_keys {
            if self.data_size != DataSize::Fixed(0) {
                return Err(Error::InvalidConfig(
                    "compressed keys require key-only records".to_string(),
                ));
            }
            if self.key_size < 12 {
                return Err(Error::InvalidConfig(format!(
                    "compressed keys need at least 12 key bytes, have {}",
                    self.key_size
                )));
            }
        }
        Ok(())
    }

    /// Size of the smallest possible record; a headless file may be off by
    /// less than this much.
    pub fn min_record_size(&self) -> usize {
        let key = if self.half_keys { 6 } else { self.key_size };
        match self.data_size {
            DataSize::Fixed(n) => key + n,
            DataSize::Variable => key + 4,
        }
    }

    /// Size of a record with a full key and the given payload length.
    pub fn full_record_size(&self, data_len: usize) -> usize {
        match self.data_size {
            DataSize::Fixed(n) => self.key_size + n,
            DataSize::Variable => self.key_size + 4 + data_len,
        }
    }

    /// Encoded width of `key` when it follows `prev`.
    fn stored_key_width(&self, key: &Key, prev: Option<&Key>) -> (usize, u8) {
        let ks = self.key_size;
        if !self.half_keys {
            return (ks, 0);
        }
        let Some(prev) = prev else {
            return (ks, 0);
        };
        let (k, p) = (key.as_bytes(), prev.as_bytes());
        if k[..ks - 6] == p[..ks - 6] {
            (6, HALF_6)
        } else if ks > 12 && k[..ks - 12] == p[..ks - 12] {
            (12, HALF_12)
        } else {
            (ks, 0)
        }
    }

    /// Rejects keys this format cannot store unchanged. With compressed
    /// keys, bits 1 and 2 of the lowest key byte carry the compression flags.
    pub fn check_key(&self, key: &Key) -> Result<()> {
        key.check_width(self.key_size)?;
        if self.half_keys && key.as_bytes()[self.key_size - 1] & FLAG_BITS != 0 {
            return Err(Error::InvalidOperation(format!(
                "key {} sets bits reserved for key compression",
                key
            )));
        }
        Ok(())
    }

    /// Appends one encoded record to `out` and returns its length.
    pub fn encode_record(&self, record: &Record, prev: Option<&Key>, out: &mut Vec<u8>) -> Result<usize> {
        self.check_key(&record.key)?;
        match self.data_size {
            DataSize::Fixed(n) if record.data.len() != n => {
                return Err(Error::InvalidOperation(format!(
                    "record payload of {} bytes in a fixed {}-byte format",
                    record.data.len(),
                    n
                )));
            }
            DataSize::Variable if record.data.len() > self.max_record_size => {
                return Err(Error::RecordTooLarge {
                    size: record.data.len(),
                    limit: self.max_record_size,
                });
            }
            _ => {}
        }

        let start = out.len();
        let (width, flag) = self.stored_key_width(&record.key, prev);
        let key = record.key.as_bytes();
        for i in 0..width {
            let mut b = key[self.key_size - 1 - i];
            if i == 0 && self.half_keys {
                b = (b & !FLAG_BITS) | flag;
            }
            out.push(b);
        }
        if self.data_size == DataSize::Variable {
            out.write_u32::<LittleEndian>(record.data.len() as u32)?;
        }
        out.extend_from_slice(&record.data);
        Ok(out.len() - start)
    }

    /// Decodes the record at the start of `buf`.
    ///
    /// Returns `BufferTooSmall` when `buf` ends mid-record, so callers reading
    /// in chunks can tell a truncated record from a damaged one.
    pub fn decode_record(&self, buf: &[u8], prev: Option<&Key>) -> Result<(Record, usize)> {
        let ks = self.key_size;
        if buf.is_empty() {
            return Err(Error::BufferTooSmall {
                needed: 1,
                available: 0,
            });
        }

        let width = if self.half_keys {
            match buf[0] & FLAG_BITS {
                0 => ks,
                HALF_6 => 6,
                HALF_12 if ks > 12 => 12,
                flags => {
                    return Err(Error::Corrupt(format!(
                        "invalid key compression flags {:#04x}",
                        flags
                    )))
                }
            }
        } else {
            ks
        };
        if buf.len() < width {
            return Err(Error::BufferTooSmall {
                needed: width,
                available: buf.len(),
            });
        }

        let mut key = match (width < ks, prev) {
            (false, _) => vec![0u8; ks],
            (true, Some(prev)) => prev.as_bytes().to_vec(),
            (true, None) => {
                return Err(Error::Corrupt(
                    "compressed key without a preceding full key".to_string(),
                ))
            }
        };
        for i in 0..width {
            key[ks - 1 - i] = buf[i];
        }
        if self.half_keys {
            key[ks - 1] &= !FLAG_BITS;
        }

        let (data_len, header) = match self.data_size {
            DataSize::Fixed(n) => (n, width),
            DataSize::Variable => {
                if buf.len() < width + 4 {
                    return Err(Error::BufferTooSmall {
                        needed: width + 4,
                        available: buf.len(),
                    });
                }
                let mut cursor = Cursor::new(&buf[width..width + 4]);
                let len = cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|e| Error::ReadError("record data length", e))?
                    as usize;
                if len > self.max_record_size {
                    return Err(Error::Corrupt(format!(
                        "record declares {} data bytes, limit is {}",
                        len, self.max_record_size
                    )));
                }
                (len, width + 4)
            }
        };
        let total = header + data_len;
        if buf.len() < total {
            return Err(Error::BufferTooSmall {
                needed: total,
                available: buf.len(),
            });
        }

        let record = Record {
            key: Key::new(key),
            data: buf[header..total].to_vec(),
        };
        Ok((record, total))
    }
}

/// A key-ordered run of records, as read from one file or merged from many.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordList {
    format: RecordFormat,
    records: Vec<Record>,
}

impl RecordList {
    pub fn new(format: RecordFormat) -> Self {
        Self {
            format,
            records: Vec::new(),
        }
    }

    /// Builds a list, rejecting keys that go backwards.
    pub fn from_records(format: RecordFormat, records: Vec<Record>) -> Result<Self> {
        let mut list = Self::new(format);
        for record in records {
            list.push(record)?;
        }
        Ok(list)
    }

    pub fn push(&mut self, record: Record) -> Result<()> {
        self.format.check_key(&record.key)?;
        if let Some(last) = self.records.last() {
            if record.key < last.key {
                return Err(Error::InvalidOperation(format!(
                    "key {} added after {}",
                    record.key, last.key
                )));
            }
        }
        self.records.push(record);
        Ok(())
    }

    /// Decodes a contiguous byte range read from a data file.
    ///
    /// `seed` is the full key of the first record in the range; it supplies
    /// the shared prefix when that record was written compressed.
    pub fn decode(format: RecordFormat, bytes: &[u8], seed: Option<&Key>) -> Result<Self> {
        let mut records: Vec<Record> = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            let prev = records.last().map(|r| &r.key).or(seed);
            let (record, len) = match format.decode_record(&bytes[pos..], prev) {
                Ok(decoded) => decoded,
                Err(Error::BufferTooSmall { needed, available }) => {
                    return Err(Error::Corrupt(format!(
                        "record at byte {} truncated: needs {} bytes, {} left",
                        pos, needed, available
                    )))
                }
                Err(e) => return Err(e),
            };
            if let Some(last) = records.last() {
                if record.key < last.key {
                    return Err(Error::Corrupt(format!(
                        "key {} out of order after {} at byte {}",
                        record.key, last.key, pos
                    )));
                }
            }
            records.push(record);
            pos += len;
        }
        Ok(Self { format, records })
    }

    /// Encodes the list; the first record is always written with a full key.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut prev: Option<&Key> = None;
        for record in &self.records {
            self.format.encode_record(record, prev, &mut out)?;
            prev = Some(&record.key);
        }
        Ok(out)
    }

    /// Drops every record outside `[start, end]`.
    pub fn constrain(&mut self, start: &Key, end: &Key) {
        let hi = self.records.partition_point(|r| r.key <= *end);
        self.records.truncate(hi);
        let lo = self.records.partition_point(|r| r.key < *start);
        self.records.drain(..lo);
    }

    /// Merges lists ordered oldest to newest. When several lists hold the same
    /// record (ignoring the live bit) the newest wins; with
    /// `remove_negatives` winning tombstones are dropped as well.
    pub fn merge(format: RecordFormat, lists: Vec<RecordList>, remove_negatives: bool) -> RecordList {
        let merged = lists
            .into_iter()
            .enumerate()
            .map(|(age, list)| list.records.into_iter().map(move |r| (age, r)))
            .kmerge_by(|(age_a, a), (age_b, b)| match cmp_ignoring_live(&a.key, &b.key) {
                Ordering::Equal => age_a > age_b,
                ord => ord == Ordering::Less,
            });

        let mut records: Vec<Record> = Vec::new();
        let mut last_seen: Option<Key> = None;
        for (_, record) in merged {
            if let Some(seen) = &last_seen {
                if seen.same_record(&record.key) {
                    continue;
                }
            }
            last_seen = Some(record.key.clone());
            if remove_negatives && record.key.is_negative() {
                continue;
            }
            records.push(record);
        }
        RecordList { format, records }
    }

    pub fn format(&self) -> RecordFormat {
        self.format
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn first_key(&self) -> Option<&Key> {
        self.records.first().map(|r| &r.key)
    }

    pub fn last_key(&self) -> Option<&Key> {
        self.records.last().map(|r| &r.key)
    }
}

fn cmp_ignoring_live(a: &Key, b: &Key) -> Ordering {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    let n = a.len().min(b.len());
    if n == 0 {
        return a.len().cmp(&b.len());
    }
    a[..n - 1]
        .cmp(&b[..n - 1])
        .then((a[n - 1] | 1).cmp(&(b[n - 1] | 1)))
}
