//! Sparse page index over a sorted data file.
//!
//! The data file is cut into fixed-size pages. For every page the index keeps
//! the key of the first record that starts in it and that record's offset
//! relative to the page start. A page no record starts in (the middle of a
//! large record) stores the spanning record's key and offset `-1`.
//!
//! ```text
//! page:     0            1            2            3
//!         +------------+------------+------------+------------+
//! data:   |r1  r2  r3  | r4 ....... | .......  r5|  r6  r7    |
//!         +------------+------------+------------+------------+
//! index:  (k1, 0)      (k4, 7)      (k4, -1)     (k6, 3)
//! ```
//!
//! Pages are grouped into segments so the head of the index can be released
//! once the matching data parts are removed.

mod generate;
mod persist;

pub use generate::{find_next_full_key_offset, generate_map, load_or_generate, GenerateOptions};
pub(crate) use persist::write_atomic;

use std::collections::VecDeque;

use crate::error::Result;
use crate::key::Key;
use crate::record::RecordList;
use crate::Error;

/// Relative offset of a page no record starts in.
pub const NO_RECORD: i16 = -1;

#[derive(Debug, Clone, Default)]
struct Segment {
    keys: Vec<u8>,
    offsets: Vec<i16>,
}

#[derive(Debug, Clone)]
pub struct PageIndex {
    key_size: usize,
    page_size: usize,
    pages_per_segment: usize,
    segments: VecDeque<Segment>,
    num_pages: usize,
    /// Logical offset of page 0.
    file_start: u64,
    /// Logical offset one past the last indexed byte.
    logical_size: u64,
    positive: u64,
    negative: u64,
    last_key: Key,
    dirty: bool,
}

impl PageIndex {
    pub fn new(key_size: usize, page_size: usize, pages_per_segment: usize) -> Self {
        Self {
            key_size,
            page_size,
            pages_per_segment,
            segments: VecDeque::new(),
            num_pages: 0,
            file_start: 0,
            logical_size: 0,
            positive: 0,
            negative: 0,
            last_key: Key::min(key_size),
            dirty: false,
        }
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn pages_per_segment(&self) -> usize {
        self.pages_per_segment
    }

    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }

    pub fn file_start(&self) -> u64 {
        self.file_start
    }

    pub fn logical_size(&self) -> u64 {
        self.logical_size
    }

    pub fn positive_count(&self) -> u64 {
        self.positive
    }

    pub fn negative_count(&self) -> u64 {
        self.negative
    }

    pub fn record_count(&self) -> u64 {
        self.positive + self.negative
    }

    pub fn last_key(&self) -> &Key {
        &self.last_key
    }

    pub fn is_empty(&self) -> bool {
        self.num_pages == 0
    }

    /// True when changed since the last save.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    fn segment_bytes(&self) -> u64 {
        self.page_size as u64 * self.pages_per_segment as u64
    }

    /// Places an empty index at `offset`, for files whose head is gone.
    pub fn start_at(&mut self, offset: u64) -> Result<()> {
        if !self.is_empty() {
            return Err(Error::InvalidOperation(
                "cannot move the start of a non-empty page index".to_string(),
            ));
        }
        self.file_start = offset;
        self.logical_size = offset;
        self.dirty = true;
        Ok(())
    }

    /// Moves the append position forward over bytes that hold no records.
    pub fn skip_to(&mut self, offset: u64) -> Result<()> {
        if offset < self.logical_size {
            return Err(Error::InvalidOperation(format!(
                "cannot skip back from {} to {}",
                self.logical_size, offset
            )));
        }
        self.logical_size = offset;
        self.dirty = true;
        Ok(())
    }

    pub fn key_bytes(&self, page: usize) -> &[u8] {
        let seg = &self.segments[page / self.pages_per_segment];
        let slot = page % self.pages_per_segment;
        &seg.keys[slot * self.key_size..(slot + 1) * self.key_size]
    }

    pub fn key_at(&self, page: usize) -> Option<Key> {
        (page < self.num_pages).then(|| Key::from_slice(self.key_bytes(page)))
    }

    pub fn offset_at(&self, page: usize) -> Option<i16> {
        (page < self.num_pages).then(|| self.raw_offset(page))
    }

    fn raw_offset(&self, page: usize) -> i16 {
        self.segments[page / self.pages_per_segment].offsets[page % self.pages_per_segment]
    }

    fn set_offset(&mut self, page: usize, offset: i16) {
        let pps = self.pages_per_segment;
        self.segments[page / pps].offsets[page % pps] = offset;
    }

    fn set_key(&mut self, page: usize, key: &[u8]) {
        let (pps, ks) = (self.pages_per_segment, self.key_size);
        let slot = page % pps;
        self.segments[page / pps].keys[slot * ks..(slot + 1) * ks].copy_from_slice(key);
    }

    fn push_page(&mut self, key: &[u8], offset: i16) {
        if self.num_pages == self.segments.len() * self.pages_per_segment {
            self.segments.push_back(Segment {
                keys: Vec::with_capacity(self.pages_per_segment * self.key_size),
                offsets: Vec::with_capacity(self.pages_per_segment),
            });
        }
        if let Some(seg) = self.segments.back_mut() {
            seg.keys.extend_from_slice(key);
            seg.offsets.push(offset);
        }
        self.num_pages += 1;
    }

    fn pop_page(&mut self) {
        if let Some(seg) = self.segments.back_mut() {
            seg.offsets.pop();
            let len = seg.offsets.len() * self.key_size;
            seg.keys.truncate(len);
            if seg.offsets.is_empty() {
                self.segments.pop_back();
            }
            self.num_pages -= 1;
        }
    }

    /// Indexes a record of `len` bytes written at the current end of the file.
    ///
    /// Keys must arrive in non-decreasing order. The first page the record
    /// touches is claimed for it unless an earlier record already starts
    /// there; any later pages it covers are marked as continuations.
    pub fn add_record(&mut self, key: &Key, len: usize) -> Result<()> {
        key.check_width(self.key_size)?;
        if len == 0 {
            return Err(Error::InvalidOperation("zero-length record".to_string()));
        }
        if !self.is_empty() && *key < self.last_key {
            return Err(Error::InvalidOperation(format!(
                "key {} indexed after {}",
                key, self.last_key
            )));
        }

        let page_size = self.page_size as u64;
        let rel = self.logical_size - self.file_start;
        let first = (rel / page_size) as usize;
        let last = ((rel + len as u64 - 1) / page_size) as usize;

        while self.num_pages <= last {
            self.push_page(key.as_bytes(), NO_RECORD);
        }
        if self.raw_offset(first) == NO_RECORD {
            self.set_key(first, key.as_bytes());
            self.set_offset(first, (rel % page_size) as i16);
        }

        self.logical_size += len as u64;
        if key.is_positive() {
            self.positive += 1;
        } else {
            self.negative += 1;
        }
        self.last_key = key.clone();
        self.dirty = true;
        Ok(())
    }

    /// Indexes every record of `list` as if appended at the current end and
    /// returns the encoded bytes to write there.
    ///
    /// The first record is compressed against the current last key, so the
    /// bytes must be written at exactly `logical_size()`.
    pub fn add_list(&mut self, list: &RecordList) -> Result<Vec<u8>> {
        let format = list.format();
        let mut out = Vec::new();
        let mut prev = (!self.is_empty()).then(|| self.last_key.clone());
        for record in list.iter() {
            let len = format.encode_record(record, prev.as_ref(), &mut out)?;
            self.add_record(&record.key, len)?;
            prev = Some(record.key.clone());
        }
        Ok(out)
    }

    /// Absolute offset where reading from `page` starts: the first record
    /// starting at or after that page, or the end of the data.
    pub fn abs_offset(&self, page: usize) -> u64 {
        let page_size = self.page_size as u64;
        (page..self.num_pages)
            .find_map(|p| {
                let off = self.raw_offset(p);
                (off != NO_RECORD).then(|| self.file_start + p as u64 * page_size + off as u64)
            })
            .unwrap_or(self.logical_size)
    }

    /// Key of the first record readable from `page`, used to seed key
    /// decompression.
    pub fn seed_key(&self, page: usize) -> Option<Key> {
        (page..self.num_pages)
            .find(|&p| self.raw_offset(p) != NO_RECORD)
            .map(|p| Key::from_slice(self.key_bytes(p)))
    }

    fn partition_point(&self, pred: impl Fn(&[u8]) -> bool) -> usize {
        let (mut lo, mut hi) = (0, self.num_pages);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if pred(self.key_bytes(mid)) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Pages `[start_page, end_page)` whose bytes hold every record with a
    /// key in `[start, end]`.
    ///
    /// The start page is the last page keyed below `start`, the end page the
    /// first keyed above `end`. Pages may carry no keys or many equal ones, so
    /// the binary search result is walked into place.
    pub fn page_range(&self, start: &Key, end: &Key) -> (usize, usize) {
        let n = self.num_pages;
        if n == 0 {
            return (0, 0);
        }
        let (start, end) = (start.as_bytes(), end.as_bytes());

        let mut sp = self.partition_point(|k| k < start).saturating_sub(1);
        while sp + 1 < n && self.key_bytes(sp + 1) < start {
            sp += 1;
        }
        while sp > 0 && self.key_bytes(sp) >= start {
            sp -= 1;
        }

        let mut ep = self.partition_point(|k| k <= end);
        while ep < n && self.key_bytes(ep) <= end {
            ep += 1;
        }
        while ep > 0 && self.key_bytes(ep - 1) > end {
            ep -= 1;
        }

        (sp, ep.max(sp))
    }

    /// Byte range covering the pages `[start_page, end_page)`.
    pub fn byte_range(&self, start_page: usize, end_page: usize) -> (u64, u64) {
        let from = self.abs_offset(start_page);
        let to = self.abs_offset(end_page).max(from);
        (from, to)
    }

    fn span(&self, page: usize) -> u64 {
        if self.raw_offset(page) == NO_RECORD {
            return 0;
        }
        self.abs_offset(page + 1) - self.abs_offset(page)
    }

    fn sum_spans(&self, pages: impl Iterator<Item = usize>, subtract_tombstones: bool) -> u64 {
        let total: i64 = pages
            .map(|p| {
                let span = self.span(p) as i64;
                let negative = self.key_bytes(p).last().map_or(false, |b| b & 1 == 0);
                if subtract_tombstones && negative {
                    -span
                } else {
                    span
                }
            })
            .sum();
        total.max(0) as u64
    }

    /// Upper estimate of record bytes in `[start_page, end_page)`.
    ///
    /// With `subtract_tombstones` the spans of pages led by a tombstone count
    /// against the total, approximating what survives annihilation.
    pub fn max_rec_sizes(&self, start_page: usize, end_page: usize, subtract_tombstones: bool) -> u64 {
        let end_page = end_page.min(self.num_pages);
        self.sum_spans(start_page..end_page, subtract_tombstones)
    }

    /// Lower estimate of record bytes with keys in `[start, end]`: only pages
    /// known to lie entirely inside the key range count.
    pub fn min_rec_sizes(
        &self,
        start_page: usize,
        end_page: usize,
        start: &Key,
        end: &Key,
        subtract_tombstones: bool,
    ) -> u64 {
        let end_page = end_page.min(self.num_pages);
        let inside = (start_page..end_page).filter(|&p| {
            let next = if p + 1 < self.num_pages {
                self.key_bytes(p + 1)
            } else {
                self.last_key.as_bytes()
            };
            self.key_bytes(p) >= start.as_bytes() && next <= end.as_bytes()
        });
        self.sum_spans(inside, subtract_tombstones)
    }

    /// Keys of claimed pages strictly above `start` and at most `end`. These
    /// are the places a range over this file can be cut short.
    pub fn boundary_keys(&self, start: &Key, end: &Key) -> Vec<Key> {
        let (sp, ep) = self.page_range(start, end);
        (sp..ep)
            .filter(|&p| self.raw_offset(p) != NO_RECORD)
            .map(|p| self.key_bytes(p))
            .filter(|k| *k > start.as_bytes() && *k <= end.as_bytes())
            .map(Key::from_slice)
            .collect()
    }

    /// Fails unless the indexed size matches the data file.
    ///
    /// A headless file may be short or long by less than one record: the
    /// crash that removed its head part can have cut a write short.
    pub fn verify(&self, file_size: u64, headless: bool, record_width: usize) -> Result<()> {
        if self.logical_size == file_size {
            return Ok(());
        }
        let diff = self.logical_size.abs_diff(file_size);
        if headless && diff < record_width as u64 {
            tracing::warn!(
                mapped = self.logical_size,
                file_size,
                "Headless file size differs from its map by less than a record, tolerating"
            );
            return Ok(());
        }
        Err(Error::IndexCorruption(format!(
            "map covers {} bytes but the data file has {}",
            self.logical_size, file_size
        )))
    }

    /// Drops whole segments covering the first `bytes` bytes and advances the
    /// start offset past them. Returns the number of segments dropped.
    pub fn chop_head(&mut self, bytes: u64) -> usize {
        let seg_bytes = self.segment_bytes();
        let available = (self.logical_size - self.file_start) / seg_bytes;
        let drop = (bytes / seg_bytes).min(available) as usize;
        let drop = drop.min(self.segments.len());
        if drop == 0 {
            return 0;
        }
        self.segments.drain(..drop);
        self.num_pages -= (drop * self.pages_per_segment).min(self.num_pages);
        self.file_start += drop as u64 * seg_bytes;
        self.dirty = true;
        tracing::debug!(segments = drop, file_start = self.file_start, "Chopped page index head");
        drop
    }

    /// Forgets everything at or after `offset`. The last key falls back to
    /// the key of the last remaining page, a lower bound of the true one.
    pub fn truncate_to_offset(&mut self, offset: u64) {
        if offset >= self.logical_size {
            return;
        }
        let offset = offset.max(self.file_start);
        let rel = offset - self.file_start;
        let keep = rel.div_ceil(self.page_size as u64) as usize;
        while self.num_pages > keep {
            self.pop_page();
        }
        // a kept page whose only record started past the cut is empty now
        while self.num_pages > 0 {
            let p = self.num_pages - 1;
            let off = self.raw_offset(p);
            let abs = self.file_start + p as u64 * self.page_size as u64;
            if off == NO_RECORD || abs + (off as u64) < offset {
                break;
            }
            self.pop_page();
        }
        self.logical_size = offset;
        if let Some(key) = self.num_pages.checked_sub(1).and_then(|p| self.key_at(p)) {
            self.last_key = key;
        }
        self.dirty = true;
    }
}
