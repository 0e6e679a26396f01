//! Record cache: recently read byte ranges kept in a ring of large buffers.
//!
//! Entries are appended at the write head and never moved. Space is
//! reclaimed strictly from the tail: the oldest entry is dropped whenever the
//! head needs its bytes or the table gets too full. Each entry is
//!
//! ```text
//! +------+------------+-----------------+-----------+-------------+------+
//! | 0x01 | coll u16   | key (key_size)  | stamp u32 | [size u32]  | data |
//! +------+------------+-----------------+-----------+-------------+------+
//! ```
//!
//! followed by a zero byte while more room remains in the buffer, so the
//! tail can tell where a buffer's entries end. An entry is never split across
//! buffers.
//!
//! Lookups go through an open-addressing table of (buffer, offset)
//! locations. A replaced or removed entry stays in its buffer with its key
//! overwritten by the all-0xff sentinel until the tail passes it.

mod persist;

use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ByteOrder};
use crc::{Crc, CRC_32_ISCSI};
use parking_lot::{Mutex, MutexGuard};

use crate::collection::CollectionId;
use crate::config::CacheConfig;
use crate::error::Result;
use crate::record::DataSize;
use crate::Error;

pub(crate) const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const MARK: u8 = 0x01;
const DELIMITER: u8 = 0x00;
const SENTINEL: u8 = 0xff;

/// Live entries may fill this share of the table, in percent.
const TABLE_FILL_PERCENT: usize = 90;

/// Hits this close to the tail, in percent of total space, get promoted.
const PROMOTE_WINDOW_PERCENT: usize = 10;

const MIN_TABLE_SLOTS: usize = 8;

/// Cache key for `len` bytes at `offset` of data file `file_id`.
pub fn range_key(file_id: u32, offset: u64, len: u32) -> Vec<u8> {
    let mut key = vec![0u8; 16];
    BigEndian::write_u32(&mut key[0..4], file_id);
    BigEndian::write_u64(&mut key[4..12], offset);
    BigEndian::write_u32(&mut key[12..16], len);
    key
}

/// Seconds since the epoch, as stored in entry timestamps.
pub fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Loc {
    buf: usize,
    off: usize,
}

/// Counters describing cache activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub adds: u64,
    pub evictions: u64,
    pub promotions: u64,
    pub entries: usize,
    pub bytes_occupied: usize,
    pub bytes_total: usize,
}

struct EntryView {
    coll: CollectionId,
    key_start: usize,
    timestamp: u32,
    data_start: usize,
    len: usize,
}

/// The cache state; reached through [`RecordCache::lock`].
pub struct CacheCore {
    key_size: usize,
    data_size: DataSize,
    max_mem: usize,
    buf_size: usize,
    buffers: Vec<Vec<u8>>,
    table: Vec<Option<Loc>>,
    max_live: usize,
    head: Loc,
    tail: Loc,
    /// Entries between tail and head, dead ones included.
    ring_entries: usize,
    /// Entries reachable from the table.
    live: usize,
    /// Bytes between tail and head.
    occupied: usize,
    wrapped: bool,
    stats: CacheStats,
}

impl CacheCore {
    pub fn new(config: &CacheConfig) -> Self {
        let num_bufs = config.num_buffers();
        let buf_size = if num_bufs == 0 {
            0
        } else {
            config.max_mem.div_ceil(num_bufs)
        };
        let slots = config.max_recs.max(MIN_TABLE_SLOTS);
        Self {
            key_size: config.key_size,
            data_size: config.data_size,
            max_mem: config.max_mem,
            buf_size,
            buffers: (0..num_bufs).map(|_| vec![DELIMITER; buf_size]).collect(),
            table: vec![None; slots],
            max_live: (slots * TABLE_FILL_PERCENT / 100).max(1),
            head: Loc { buf: 0, off: 0 },
            tail: Loc { buf: 0, off: 0 },
            ring_entries: 0,
            live: 0,
            occupied: 0,
            wrapped: false,
            stats: CacheStats::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.buffers.is_empty()
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    fn total_bytes(&self) -> usize {
        self.buf_size * self.buffers.len()
    }

    fn entry_len(&self, data_len: usize) -> usize {
        let size_field = match self.data_size {
            DataSize::Variable => 4,
            DataSize::Fixed(_) => 0,
        };
        1 + 2 + self.key_size + 4 + size_field + data_len
    }

    fn view(&self, loc: Loc) -> EntryView {
        let buf = &self.buffers[loc.buf];
        let ks = self.key_size;
        let coll = CollectionId(BigEndian::read_u16(&buf[loc.off + 1..loc.off + 3]));
        let key_start = loc.off + 3;
        let ts_start = key_start + ks;
        let timestamp = BigEndian::read_u32(&buf[ts_start..ts_start + 4]);
        let (data_len, data_start) = match self.data_size {
            DataSize::Fixed(n) => (n, ts_start + 4),
            DataSize::Variable => (
                BigEndian::read_u32(&buf[ts_start + 4..ts_start + 8]) as usize,
                ts_start + 8,
            ),
        };
        EntryView {
            coll,
            key_start,
            timestamp,
            data_start,
            len: data_start + data_len - loc.off,
        }
    }

    fn key_of(&self, loc: Loc, view: &EntryView) -> &[u8] {
        &self.buffers[loc.buf][view.key_start..view.key_start + self.key_size]
    }

    fn is_dead(&self, loc: Loc, view: &EntryView) -> bool {
        self.key_of(loc, view).iter().all(|b| *b == SENTINEL)
    }

    fn home(&self, coll: CollectionId, key: &[u8]) -> usize {
        let mut digest = CRC32.digest();
        digest.update(&coll.0.to_be_bytes());
        digest.update(key);
        digest.finalize() as usize % self.table.len()
    }

    /// Table slot holding (coll, key), with its location.
    fn find(&self, coll: CollectionId, key: &[u8]) -> Option<(usize, Loc)> {
        let n = self.table.len();
        let mut i = self.home(coll, key);
        for _ in 0..n {
            let loc = self.table[i]?;
            let view = self.view(loc);
            if view.coll == coll && self.key_of(loc, &view) == key {
                return Some((i, loc));
            }
            i = (i + 1) % n;
        }
        None
    }

    fn insert_slot(&mut self, coll: CollectionId, key: &[u8], loc: Loc) {
        let n = self.table.len();
        let mut i = self.home(coll, key);
        while self.table[i].is_some() {
            i = (i + 1) % n;
        }
        self.table[i] = Some(loc);
    }

    /// Empties slot `i`, pulling later entries of the probe chain back so
    /// lookups that passed through `i` still find them.
    fn delete_slot(&mut self, mut i: usize) {
        let n = self.table.len();
        self.table[i] = None;
        let mut j = i;
        loop {
            j = (j + 1) % n;
            let Some(loc) = self.table[j] else {
                break;
            };
            let view = self.view(loc);
            let home = self.home(view.coll, self.key_of(loc, &view));
            let stays = if i <= j {
                i < home && home <= j
            } else {
                i < home || home <= j
            };
            if !stays {
                self.table[i] = Some(loc);
                self.table[j] = None;
                i = j;
            }
        }
    }

    /// Drops the entry in slot `i` and stamps the sentinel over its key.
    fn kill(&mut self, slot: usize, loc: Loc) {
        self.delete_slot(slot);
        let view = self.view(loc);
        let ks = self.key_size;
        self.buffers[loc.buf][view.key_start..view.key_start + ks].fill(SENTINEL);
        self.live -= 1;
    }

    /// Reclaims the entry at the tail.
    fn evict_one(&mut self) {
        for _ in 0..=self.buffers.len() {
            let t = self.tail;
            if t.off >= self.buf_size || self.buffers[t.buf][t.off] != MARK {
                self.tail = Loc {
                    buf: (t.buf + 1) % self.buffers.len(),
                    off: 0,
                };
                continue;
            }
            let view = self.view(t);
            if !self.is_dead(t, &view) {
                let key = self.key_of(t, &view).to_vec();
                if let Some((slot, loc)) = self.find(view.coll, &key) {
                    if loc == t {
                        self.delete_slot(slot);
                        self.live -= 1;
                        self.stats.evictions += 1;
                    }
                }
            }
            self.tail.off += view.len;
            self.ring_entries -= 1;
            self.occupied -= view.len;
            if self.ring_entries == 0 {
                self.tail = self.head;
            } else if self.tail.off >= self.buf_size || self.buffers[self.tail.buf][self.tail.off] != MARK {
                // nothing more in this buffer
                self.tail = Loc {
                    buf: (self.tail.buf + 1) % self.buffers.len(),
                    off: 0,
                };
            }
            return;
        }
    }

    fn tail_ahead_in_head_buffer(&self, from: usize, to: usize) -> bool {
        self.ring_entries > 0 && self.tail.buf == self.head.buf && self.tail.off >= from && self.tail.off < to
    }

    /// Adds or replaces the entry for (coll, key).
    ///
    /// Fails only for misuse (wrong key width, wrong fixed payload size) or
    /// an entry larger than one buffer.
    pub fn put(&mut self, coll: CollectionId, key: &[u8], timestamp: u32, data: &[u8]) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        if key.len() != self.key_size {
            return Err(Error::InvalidOperation(format!(
                "cache key of {} bytes, expected {}",
                key.len(),
                self.key_size
            )));
        }
        if key.iter().all(|b| *b == SENTINEL) {
            return Err(Error::InvalidOperation(
                "cache key collides with the evicted-entry sentinel".to_string(),
            ));
        }
        if let DataSize::Fixed(n) = self.data_size {
            if data.len() != n {
                return Err(Error::InvalidOperation(format!(
                    "cache payload of {} bytes, expected {}",
                    data.len(),
                    n
                )));
            }
        }
        let len = self.entry_len(data.len());
        if len > self.buf_size {
            return Err(Error::RecordTooLarge {
                size: len,
                limit: self.buf_size,
            });
        }

        if let Some((slot, loc)) = self.find(coll, key) {
            self.kill(slot, loc);
        }
        self.write_entry(coll, key, timestamp, data, len);
        self.stats.adds += 1;
        Ok(())
    }

    fn write_entry(&mut self, coll: CollectionId, key: &[u8], timestamp: u32, data: &[u8], len: usize) {
        if self.head.off + len > self.buf_size {
            // older entries still ahead of the head in this buffer go first
            while self.tail_ahead_in_head_buffer(self.head.off, self.buf_size) {
                self.evict_one();
            }
            if self.head.off < self.buf_size {
                self.buffers[self.head.buf][self.head.off] = DELIMITER;
            }
            self.head = Loc {
                buf: (self.head.buf + 1) % self.buffers.len(),
                off: 0,
            };
            if self.head.buf == 0 {
                self.wrapped = true;
            }
            if self.ring_entries == 0 {
                self.tail = self.head;
            }
        }

        let end = (self.head.off + len + 1).min(self.buf_size);
        while self.tail_ahead_in_head_buffer(self.head.off, end) {
            self.evict_one();
        }
        while self.live >= self.max_live && self.ring_entries > 0 {
            self.evict_one();
        }
        if self.ring_entries == 0 {
            self.tail = self.head;
        }

        let at = self.head;
        let buf = &mut self.buffers[at.buf];
        let mut pos = at.off;
        buf[pos] = MARK;
        BigEndian::write_u16(&mut buf[pos + 1..pos + 3], coll.0);
        pos += 3;
        buf[pos..pos + key.len()].copy_from_slice(key);
        pos += key.len();
        BigEndian::write_u32(&mut buf[pos..pos + 4], timestamp);
        pos += 4;
        if self.data_size == DataSize::Variable {
            BigEndian::write_u32(&mut buf[pos..pos + 4], data.len() as u32);
            pos += 4;
        }
        buf[pos..pos + data.len()].copy_from_slice(data);
        pos += data.len();
        if pos < self.buf_size {
            buf[pos] = DELIMITER;
        }

        self.head.off = pos;
        self.insert_slot(coll, key, at);
        self.ring_entries += 1;
        self.live += 1;
        self.occupied += len;
    }

    /// Looks up (coll, key) and returns a copy of its payload.
    ///
    /// A hit older than `max_age` seconds counts as a miss. With `promote`
    /// set, a hit about to be evicted is copied to the head.
    pub fn get(&mut self, coll: CollectionId, key: &[u8], max_age: Option<u32>, promote: bool) -> Option<Vec<u8>> {
        self.get_at(coll, key, max_age, promote, now_secs())
    }

    /// `get` against an explicit clock.
    pub fn get_at(
        &mut self,
        coll: CollectionId,
        key: &[u8],
        max_age: Option<u32>,
        promote: bool,
        now: u32,
    ) -> Option<Vec<u8>> {
        if !self.is_enabled() || key.len() != self.key_size {
            self.stats.misses += 1;
            return None;
        }
        let Some((slot, loc)) = self.find(coll, key) else {
            self.stats.misses += 1;
            return None;
        };
        let view = self.view(loc);
        if max_age.is_some_and(|age| now.saturating_sub(view.timestamp) > age) {
            self.stats.misses += 1;
            return None;
        }
        let data = self.buffers[loc.buf][view.data_start..loc.off + view.len].to_vec();
        self.stats.hits += 1;

        if promote && self.near_tail(loc) {
            let timestamp = view.timestamp;
            let len = view.len;
            self.kill(slot, loc);
            self.write_entry(coll, key, timestamp, &data, len);
            self.stats.promotions += 1;
        }
        Some(data)
    }

    fn near_tail(&self, loc: Loc) -> bool {
        let total = self.total_bytes();
        let linear = |l: Loc| l.buf * self.buf_size + l.off;
        let distance = (linear(loc) + total - linear(self.tail)) % total;
        distance < total * PROMOTE_WINDOW_PERCENT / 100
    }

    pub fn contains(&self, coll: CollectionId, key: &[u8]) -> bool {
        self.is_enabled() && key.len() == self.key_size && self.find(coll, key).is_some()
    }

    pub fn remove(&mut self, coll: CollectionId, key: &[u8]) -> bool {
        if !self.is_enabled() || key.len() != self.key_size {
            return false;
        }
        match self.find(coll, key) {
            Some((slot, loc)) => {
                self.kill(slot, loc);
                true
            }
            None => false,
        }
    }

    /// Removes every entry of `coll`; returns how many.
    pub fn clear_collection(&mut self, coll: CollectionId) -> usize {
        self.remove_where(|c, _| c == coll)
    }

    /// Removes every entry for which `pred(collection, key)` holds.
    pub fn remove_where(&mut self, pred: impl Fn(CollectionId, &[u8]) -> bool) -> usize {
        let doomed: Vec<(CollectionId, Vec<u8>)> = self
            .table
            .iter()
            .flatten()
            .filter_map(|&loc| {
                let view = self.view(loc);
                let key = self.key_of(loc, &view);
                pred(view.coll, key).then(|| (view.coll, key.to_vec()))
            })
            .collect();
        doomed.iter().filter(|(coll, key)| self.remove(*coll, key)).count()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.live,
            bytes_occupied: self.occupied,
            bytes_total: self.total_bytes(),
            ..self.stats
        }
    }

    /// The entry at `loc`, if a whole one starts there.
    fn entry_at(&self, loc: Loc) -> Option<EntryView> {
        if loc.buf >= self.buffers.len()
            || loc.off + self.entry_len(0) > self.buf_size
            || self.buffers[loc.buf][loc.off] != MARK
        {
            return None;
        }
        let view = self.view(loc);
        (loc.off + view.len <= self.buf_size).then_some(view)
    }

    /// Checks that every table slot points at a live entry that hashes back
    /// to that same slot.
    pub fn check_consistency(&self) -> Result<()> {
        for (slot, loc) in self.table.iter().enumerate() {
            let Some(loc) = *loc else {
                continue;
            };
            let Some(view) = self.entry_at(loc) else {
                return Err(Error::Corrupt(format!(
                    "cache slot {} points at {}:{} which holds no entry",
                    slot, loc.buf, loc.off
                )));
            };
            if self.is_dead(loc, &view) {
                return Err(Error::Corrupt(format!("cache slot {} points at a dead entry", slot)));
            }
        }

        let mut seen = 0;
        for (slot, loc) in self.table.iter().enumerate() {
            let Some(loc) = *loc else {
                continue;
            };
            let view = self.view(loc);
            match self.find(view.coll, self.key_of(loc, &view)) {
                Some((found, _)) if found == slot => seen += 1,
                _ => {
                    return Err(Error::Corrupt(format!(
                        "cache slot {} does not resolve back to itself",
                        slot
                    )))
                }
            }
        }
        if seen != self.live {
            return Err(Error::Corrupt(format!(
                "cache table holds {} entries, expected {}",
                seen, self.live
            )));
        }
        Ok(())
    }
}

/// Process-wide record cache for one database, guarded by a single lock.
pub struct RecordCache {
    core: Mutex<CacheCore>,
}

pub type CacheGuard<'a> = MutexGuard<'a, CacheCore>;

impl RecordCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            core: Mutex::new(CacheCore::new(config)),
        }
    }

    /// Holds the cache lock across several operations.
    pub fn lock(&self) -> CacheGuard<'_> {
        self.core.lock()
    }

    pub fn is_enabled(&self) -> bool {
        self.core.lock().is_enabled()
    }

    pub fn get(&self, coll: CollectionId, key: &[u8], max_age: Option<u32>, promote: bool) -> Option<Vec<u8>> {
        self.core.lock().get(coll, key, max_age, promote)
    }

    pub fn put(&self, coll: CollectionId, key: &[u8], timestamp: u32, data: &[u8]) -> Result<()> {
        self.core.lock().put(coll, key, timestamp, data)
    }

    pub fn contains(&self, coll: CollectionId, key: &[u8]) -> bool {
        self.core.lock().contains(coll, key)
    }

    pub fn remove(&self, coll: CollectionId, key: &[u8]) -> bool {
        self.core.lock().remove(coll, key)
    }

    pub fn clear_collection(&self, coll: CollectionId) -> usize {
        self.core.lock().clear_collection(coll)
    }

    /// Drops every range cached for data file `file_id`.
    pub fn clear_file(&self, file_id: u32) -> usize {
        let prefix = file_id.to_be_bytes();
        self.core.lock().remove_where(|_, key| key.starts_with(&prefix))
    }

    pub fn stats(&self) -> CacheStats {
        self.core.lock().stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const C: CollectionId = CollectionId(1);

    fn config(max_mem: usize, buffer_size: usize, max_recs: usize) -> CacheConfig {
        CacheConfig::default()
            .max_mem(max_mem)
            .buffer_size(buffer_size)
            .max_recs(max_recs)
            .key_size(8)
    }

    fn key(i: u64) -> Vec<u8> {
        i.to_be_bytes().to_vec()
    }

    #[test]
    fn test_put_get_replace() {
        let mut cache = CacheCore::new(&config(4096, 1024, 64));
        cache.put(C, &key(1), 10, b"one").unwrap();
        cache.put(C, &key(2), 10, b"two").unwrap();
        assert_eq!(cache.get_at(C, &key(1), None, false, 10), Some(b"one".to_vec()));
        assert_eq!(cache.get_at(CollectionId(2), &key(1), None, false, 10), None);

        cache.put(C, &key(1), 11, b"uno").unwrap();
        assert_eq!(cache.get_at(C, &key(1), None, false, 11), Some(b"uno".to_vec()));
        assert_eq!(cache.len(), 2);
        cache.check_consistency().unwrap();

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.adds, 3);
    }

    #[test]
    fn test_max_age() {
        let mut cache = CacheCore::new(&config(4096, 1024, 64));
        cache.put(C, &key(1), 100, b"x").unwrap();
        assert!(cache.get_at(C, &key(1), Some(30), false, 120).is_some());
        assert!(cache.get_at(C, &key(1), Some(30), false, 131).is_none());
        assert!(cache.get_at(C, &key(1), None, false, 10_000).is_some());
    }

    #[test]
    fn test_two_small_buffers_evict_from_tail() {
        let mut cache = CacheCore::new(&config(2000, 1000, 64));
        assert_eq!(cache.stats().bytes_total, 2000);
        // 1 + 2 + 8 + 4 + 4 + 200 = 219 bytes per entry, four fit per buffer
        let payload = vec![7u8; 200];
        for i in 0..8 {
            cache.put(C, &key(i), 0, &payload).unwrap();
        }
        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(cache.len(), 8);

        // the ninth entry wraps back into buffer 0 and pushes out the oldest
        cache.put(C, &key(8), 0, &payload).unwrap();
        assert!(cache.stats().evictions >= 1);
        assert!(!cache.contains(C, &key(0)));
        assert!(cache.contains(C, &key(8)));
        assert!(cache.contains(C, &key(7)));
        cache.check_consistency().unwrap();
    }

    #[test]
    fn test_eviction_stops_at_buffer_end() {
        let mut cache = CacheCore::new(&config(200, 100, 64));
        // 19 header bytes, so 11 payload bytes make a 30-byte entry
        let small = vec![1u8; 11];
        for i in 0..7 {
            cache.put(C, &key(i), 0, &small).unwrap();
        }
        // 6 wrapped into buffer 0 over 0 and 1; buffer 1 holds 3, 4 and 5
        assert_eq!(cache.stats().evictions, 2);
        // 2 is the last entry in buffer 0
        cache.put(C, &key(7), 0, &small).unwrap();
        assert_eq!(cache.stats().evictions, 3);

        // fits before the end of buffer 0, so buffer 1 is left alone
        cache.put(C, &key(8), 0, &vec![2u8; 16]).unwrap();
        assert_eq!(cache.stats().evictions, 3);
        for i in 3..9 {
            assert!(cache.contains(C, &key(i)), "key {} evicted", i);
        }
        assert_eq!(cache.len(), 6);
        cache.check_consistency().unwrap();
    }

    #[test]
    fn test_oversize_entry_is_the_only_failure() {
        let mut cache = CacheCore::new(&config(2000, 1000, 64));
        let result = cache.put(C, &key(1), 0, &vec![0u8; 1000]);
        assert!(matches!(result, Err(Error::RecordTooLarge { .. })));

        // anything up to half the memory always goes in
        for i in 0..500u64 {
            let size = (i as usize * 37) % 480;
            cache.put(C, &key(i), 0, &vec![i as u8; size]).unwrap();
            assert_eq!(cache.get_at(C, &key(i), None, false, 0), Some(vec![i as u8; size]));
        }
        cache.check_consistency().unwrap();
    }

    #[test]
    fn test_table_fill_limit_evicts() {
        let mut cache = CacheCore::new(&config(1 << 20, 1 << 18, 10));
        for i in 0..100 {
            cache.put(C, &key(i), 0, b"v").unwrap();
        }
        // 90% of 10 slots
        assert_eq!(cache.len(), 9);
        assert!(cache.contains(C, &key(99)));
        assert!(!cache.contains(C, &key(0)));
        cache.check_consistency().unwrap();
    }

    #[test]
    fn test_consistency_after_churn() {
        let mut cache = CacheCore::new(&config(3000, 1000, 40));
        for i in 0..2000u64 {
            let k = key(i % 97);
            match i % 5 {
                0 => {
                    cache.remove(C, &k);
                }
                1 => {
                    cache.get_at(C, &k, None, true, 0);
                }
                _ => cache.put(C, &k, 0, &vec![1u8; (i % 50) as usize]).unwrap(),
            }
            if i % 100 == 0 {
                cache.check_consistency().unwrap();
            }
        }
        cache.check_consistency().unwrap();
    }

    #[test]
    fn test_promotion_only_near_tail() {
        let mut cache = CacheCore::new(&config(2000, 1000, 64));
        let payload = vec![1u8; 60];
        // 79-byte entries
        for i in 0..20 {
            cache.put(C, &key(i), 0, &payload).unwrap();
        }
        // key 0 sits at the tail, key 19 at the head
        assert!(cache.get_at(C, &key(19), None, true, 0).is_some());
        assert_eq!(cache.stats().promotions, 0);
        assert!(cache.get_at(C, &key(0), None, true, 0).is_some());
        assert_eq!(cache.stats().promotions, 1);

        // the promoted copy survives the eviction of its old neighbours
        for i in 20..26 {
            cache.put(C, &key(i), 0, &payload).unwrap();
        }
        assert!(cache.contains(C, &key(0)));
        assert!(!cache.contains(C, &key(1)));
        cache.check_consistency().unwrap();
    }

    #[test]
    fn test_clear_collection() {
        let cache = RecordCache::new(&config(4096, 1024, 64));
        for i in 0..10 {
            cache.put(C, &key(i), 0, b"a").unwrap();
            cache.put(CollectionId(2), &key(i), 0, b"b").unwrap();
        }
        assert_eq!(cache.clear_collection(C), 10);
        assert!(!cache.contains(C, &key(3)));
        assert!(cache.contains(CollectionId(2), &key(3)));
        assert_eq!(cache.stats().entries, 10);
        cache.lock().check_consistency().unwrap();
    }

    #[test]
    fn test_clear_file() {
        let cache = RecordCache::new(&config(8192, 1024, 64).key_size(16));
        for offset in 0..5u64 {
            cache.put(C, &range_key(1, offset * 100, 100), 0, b"a").unwrap();
            cache.put(C, &range_key(2, offset * 100, 100), 0, b"b").unwrap();
        }
        assert_eq!(cache.clear_file(1), 5);
        assert!(!cache.contains(C, &range_key(1, 0, 100)));
        assert!(cache.contains(C, &range_key(2, 0, 100)));
        cache.lock().check_consistency().unwrap();
    }

    #[test]
    fn test_lock_spans_read_modify_write() {
        let cache = RecordCache::new(&config(4096, 1024, 64));
        cache.put(C, &key(1), 0, &[1]).unwrap();
        {
            let mut guard = cache.lock();
            let value = guard.get_at(C, &key(1), None, false, 0).unwrap();
            guard.put(C, &key(1), 0, &[value[0] + 1]).unwrap();
        }
        assert_eq!(cache.get(C, &key(1), None, false), Some(vec![2]));
    }

    #[test]
    fn test_misuse_and_disabled() {
        let mut cache = CacheCore::new(&config(4096, 1024, 64));
        assert!(matches!(cache.put(C, &[1, 2], 0, b"x"), Err(Error::InvalidOperation(_))));
        assert!(matches!(cache.put(C, &[0xff; 8], 0, b"x"), Err(Error::InvalidOperation(_))));

        let mut fixed = CacheCore::new(&config(4096, 1024, 64).data_size(DataSize::Fixed(4)));
        assert!(fixed.put(C, &key(1), 0, b"abcd").is_ok());
        assert!(matches!(fixed.put(C, &key(2), 0, b"abc"), Err(Error::InvalidOperation(_))));

        let mut disabled = CacheCore::new(&config(0, 1024, 64));
        assert!(disabled.put(C, &key(1), 0, b"x").is_ok());
        assert!(disabled.get_at(C, &key(1), None, false, 0).is_none());
    }

    #[test]
    fn test_range_key_layout() {
        let key = range_key(7, 0x0102_0304, 99);
        assert_eq!(key.len(), 16);
        assert_eq!(&key[0..4], &[0, 0, 0, 7]);
        assert_eq!(&key[8..12], &[1, 2, 3, 4]);
        assert_eq!(&key[12..16], &[0, 0, 0, 99]);
    }
}
