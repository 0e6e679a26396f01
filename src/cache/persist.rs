//! Cache snapshot file.
//!
//! ```text
//! +---------------------------------------------------------------+
//! | table slots u32 | max mem u64 | total bytes u64 | occupied u64 |
//! | buffers u32 | buffer size u64 | head u64 | tail u64           |
//! | wrapped u8 | ring entries u64 | live u64                       |
//! | key size u16 | data size u32 (u32::MAX = variable)             |
//! +---------------------------------------------------------------+
//! | buffer 0 | buffer 1 | ...                                      |
//! +---------------------------------------------------------------+
//! | slot 0 i32 | slot 1 i32 | ...  (buffer-relative, -1 = free)    |
//! +---------------------------------------------------------------+
//! | crc32 u32                                                     |
//! +---------------------------------------------------------------+
//! ```
//!
//! A snapshot taken with the same geometry is restored as is. Otherwise its
//! live entries are re-inserted oldest first with their original timestamps.

use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::{CacheCore, CacheStats, Loc, RecordCache, CRC32};
use crate::error::Result;
use crate::map::write_atomic;
use crate::record::DataSize;
use crate::Error;

const EMPTY_SLOT: i32 = -1;
const VARIABLE: u32 = u32::MAX;
const HEADER_LEN: usize = 79;

impl CacheCore {
    fn linear(&self, loc: Loc) -> u64 {
        (loc.buf * self.buf_size + loc.off) as u64
    }

    fn from_linear(&self, pos: u64) -> Loc {
        let pos = pos as usize;
        if self.buf_size == 0 {
            return Loc { buf: 0, off: 0 };
        }
        Loc {
            buf: pos / self.buf_size,
            off: pos % self.buf_size,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let total = self.total_bytes();
        if total > i32::MAX as usize {
            return Err(Error::InvalidState(format!(
                "cache of {} bytes is too large to save",
                total
            )));
        }
        let mut buf = Vec::with_capacity(HEADER_LEN + total + self.table.len() * 4 + 4);
        buf.write_u32::<BigEndian>(self.table.len() as u32)?;
        buf.write_u64::<BigEndian>(self.max_mem as u64)?;
        buf.write_u64::<BigEndian>(total as u64)?;
        buf.write_u64::<BigEndian>(self.occupied as u64)?;
        buf.write_u32::<BigEndian>(self.buffers.len() as u32)?;
        buf.write_u64::<BigEndian>(self.buf_size as u64)?;
        buf.write_u64::<BigEndian>(self.linear(self.head))?;
        buf.write_u64::<BigEndian>(self.linear(self.tail))?;
        buf.write_u8(self.wrapped as u8)?;
        buf.write_u64::<BigEndian>(self.ring_entries as u64)?;
        buf.write_u64::<BigEndian>(self.live as u64)?;
        buf.write_u16::<BigEndian>(self.key_size as u16)?;
        buf.write_u32::<BigEndian>(match self.data_size {
            DataSize::Fixed(n) => n as u32,
            DataSize::Variable => VARIABLE,
        })?;

        for b in &self.buffers {
            buf.write_all(b)?;
        }
        for slot in &self.table {
            let pos = slot.map_or(EMPTY_SLOT, |loc| self.linear(loc) as i32);
            buf.write_i32::<BigEndian>(pos)?;
        }

        let crc = CRC32.checksum(&buf);
        buf.write_u32::<BigEndian>(crc)?;
        Ok(buf)
    }

    /// Writes a snapshot of the cache to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, &self.encode()?)
    }

    /// Replaces the cache contents with the snapshot at `path` and returns
    /// how many entries it holds afterwards. A missing file loads nothing.
    pub fn load(&mut self, path: &Path) -> Result<usize> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Error::ReadError("cache file", e)),
        };
        let saved = self.decode(&bytes)?;
        if !self.is_enabled() {
            return Ok(0);
        }

        let same_shape = saved.buffers.len() == self.buffers.len()
            && saved.buf_size == self.buf_size
            && saved.table.len() == self.table.len();
        if same_shape {
            let stats = self.stats;
            let max_live = self.max_live;
            *self = saved;
            self.stats = stats;
            self.max_live = max_live;
            match self.restore_counters() {
                Ok(()) => return Ok(self.live),
                Err(e) => {
                    tracing::warn!(error = %e, "Cache file did not restore as saved, re-inserting entries");
                    let fresh = CacheCore::new(&self.config());
                    let saved = std::mem::replace(self, fresh);
                    self.stats = stats;
                    self.convert_from(&saved);
                    return Ok(self.live);
                }
            }
        }

        self.convert_from(&saved);
        Ok(self.live)
    }

    fn config(&self) -> crate::config::CacheConfig {
        crate::config::CacheConfig::default()
            .max_mem(self.max_mem)
            .buffer_size(self.buf_size)
            .max_recs(self.table.len())
            .key_size(self.key_size)
            .data_size(self.data_size)
    }

    fn decode(&self, bytes: &[u8]) -> Result<CacheCore> {
        if bytes.len() < 4 {
            return Err(Error::Corrupt("cache file is truncated".to_string()));
        }
        let (body, trailer) = bytes.split_at(bytes.len() - 4);
        let stored = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        if CRC32.checksum(body) != stored {
            return Err(Error::Corrupt("cache file checksum mismatch".to_string()));
        }

        let read_err = |e| Error::ReadError("cache file header", e);
        let mut cursor = Cursor::new(body);
        let slots = cursor.read_u32::<BigEndian>().map_err(read_err)? as usize;
        let max_mem = cursor.read_u64::<BigEndian>().map_err(read_err)? as usize;
        let _total = cursor.read_u64::<BigEndian>().map_err(read_err)?;
        let occupied = cursor.read_u64::<BigEndian>().map_err(read_err)? as usize;
        let num_bufs = cursor.read_u32::<BigEndian>().map_err(read_err)? as usize;
        let buf_size = cursor.read_u64::<BigEndian>().map_err(read_err)? as usize;
        let head = cursor.read_u64::<BigEndian>().map_err(read_err)?;
        let tail = cursor.read_u64::<BigEndian>().map_err(read_err)?;
        let wrapped = cursor.read_u8().map_err(read_err)? != 0;
        let ring_entries = cursor.read_u64::<BigEndian>().map_err(read_err)? as usize;
        let live = cursor.read_u64::<BigEndian>().map_err(read_err)? as usize;
        let key_size = cursor.read_u16::<BigEndian>().map_err(read_err)? as usize;
        let data_size = match cursor.read_u32::<BigEndian>().map_err(read_err)? {
            VARIABLE => DataSize::Variable,
            n => DataSize::Fixed(n as usize),
        };

        if key_size != self.key_size || data_size != self.data_size {
            return Err(Error::InvalidState(format!(
                "cache file holds {}-byte keys with {:?} payloads, expected {}-byte keys with {:?}",
                key_size, data_size, self.key_size, self.data_size
            )));
        }
        let expected = cursor.position() as usize + num_bufs * buf_size + slots * 4;
        if body.len() != expected {
            return Err(Error::Corrupt(format!(
                "cache file body is {} bytes, header implies {}",
                body.len(),
                expected
            )));
        }

        let mut buffers = Vec::with_capacity(num_bufs);
        for _ in 0..num_bufs {
            let mut b = vec![0u8; buf_size];
            cursor
                .read_exact(&mut b)
                .map_err(|e| Error::ReadError("cache buffer", e))?;
            buffers.push(b);
        }

        let mut core = CacheCore {
            key_size,
            data_size,
            max_mem,
            buf_size,
            buffers,
            table: vec![None; slots],
            max_live: self.max_live,
            head: Loc { buf: 0, off: 0 },
            tail: Loc { buf: 0, off: 0 },
            ring_entries,
            live,
            occupied,
            wrapped,
            stats: CacheStats::default(),
        };
        let limit = (num_bufs * buf_size) as u64;
        if (head >= limit || tail >= limit) && limit > 0 {
            return Err(Error::Corrupt("cache file ring pointers out of range".to_string()));
        }
        core.head = core.from_linear(head);
        core.tail = core.from_linear(tail);
        for slot in 0..slots {
            let pos = cursor
                .read_i32::<BigEndian>()
                .map_err(|e| Error::ReadError("cache table", e))?;
            if pos == EMPTY_SLOT {
                continue;
            }
            let pos = u64::try_from(pos)
                .map_err(|_| Error::Corrupt(format!("cache slot {} holds offset {}", slot, pos)))?;
            if pos >= limit {
                return Err(Error::Corrupt(format!("cache slot {} points past the buffers", slot)));
            }
            core.table[slot] = Some(core.from_linear(pos));
        }
        Ok(core)
    }

    /// Recounts live entries and occupied bytes of a restored snapshot.
    fn restore_counters(&mut self) -> Result<()> {
        self.live = self.table.iter().flatten().count();
        let n = self.buffers.len();
        let mut at = self.tail;
        let mut bytes = 0;
        for _ in 0..self.ring_entries {
            let mut hops = 0;
            while at.off >= self.buf_size || self.buffers[at.buf][at.off] != super::MARK {
                at = Loc {
                    buf: (at.buf + 1) % n,
                    off: 0,
                };
                hops += 1;
                if hops > n {
                    return Err(Error::Corrupt("cache ring ends before its entry count".to_string()));
                }
            }
            let view = self
                .entry_at(at)
                .ok_or_else(|| Error::Corrupt(format!("cache ring entry at {}:{} is cut short", at.buf, at.off)))?;
            bytes += view.len;
            at.off += view.len;
        }
        self.occupied = bytes;
        self.check_consistency()
    }

    /// Re-inserts the live entries of `saved`, oldest first.
    fn convert_from(&mut self, saved: &CacheCore) {
        let total = saved.linear(Loc {
            buf: saved.buffers.len(),
            off: 0,
        });
        let tail = saved.linear(saved.tail);
        let mut entries: Vec<(u64, Loc)> = saved
            .table
            .iter()
            .flatten()
            .filter(|loc| saved.entry_at(**loc).is_some())
            .map(|loc| ((saved.linear(*loc) + total - tail) % total.max(1), *loc))
            .collect();
        entries.sort_unstable_by_key(|(distance, _)| *distance);

        let mut dropped = 0;
        for (_, loc) in entries {
            let view = saved.view(loc);
            if saved.is_dead(loc, &view) {
                continue;
            }
            let key = saved.key_of(loc, &view).to_vec();
            let data = &saved.buffers[loc.buf][view.data_start..loc.off + view.len];
            if self.put(view.coll, &key, view.timestamp, data).is_err() {
                dropped += 1;
            }
        }
        // converting counts as neither adds nor evictions
        self.stats.adds = 0;
        self.stats.evictions = 0;
        if dropped > 0 {
            tracing::warn!(dropped, "Cache entries too large for the new buffer size");
        }
    }
}

impl RecordCache {
    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = self.lock().encode()?;
        write_atomic(path, &bytes)
    }

    pub fn load(&self, path: &Path) -> Result<usize> {
        self.lock().load(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::CollectionId;
    use crate::config::CacheConfig;
    use tempfile::tempdir;

    const C: CollectionId = CollectionId(3);

    fn config(max_mem: usize, buffer_size: usize) -> CacheConfig {
        CacheConfig::default()
            .max_mem(max_mem)
            .buffer_size(buffer_size)
            .max_recs(128)
            .key_size(8)
    }

    fn fill(cache: &mut CacheCore, count: u64) {
        for i in 0..count {
            cache
                .put(C, &i.to_be_bytes(), 1000 + i as u32, &vec![i as u8; 40])
                .unwrap();
        }
    }

    #[test]
    fn test_save_load_same_shape() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.cache");
        let mut cache = CacheCore::new(&config(4000, 1000));
        fill(&mut cache, 60);
        cache.remove(C, &59u64.to_be_bytes());
        cache.save(&path)?;

        let mut restored = CacheCore::new(&config(4000, 1000));
        let loaded = restored.load(&path)?;
        assert_eq!(loaded, cache.len());
        assert_eq!(restored.stats().bytes_occupied, cache.stats().bytes_occupied);
        for i in 0..60u64 {
            assert_eq!(
                restored.get_at(C, &i.to_be_bytes(), None, false, 0),
                cache.get_at(C, &i.to_be_bytes(), None, false, 0)
            );
        }
        restored.check_consistency()?;

        // appending after a restore continues from the saved head
        restored.put(C, &999u64.to_be_bytes(), 0, b"new")?;
        restored.check_consistency()?;
        Ok(())
    }

    #[test]
    fn test_table_saved_as_four_byte_offsets() -> Result<()> {
        let mut cache = CacheCore::new(&config(4000, 1000));
        let empty = cache.encode()?;
        assert_eq!(empty.len(), HEADER_LEN + 4000 + 128 * 4 + 4);
        let table = &empty[HEADER_LEN + 4000..HEADER_LEN + 4000 + 128 * 4];
        assert!(table.iter().all(|b| *b == 0xff));

        // the second entry starts right after the first
        fill(&mut cache, 2);
        let bytes = cache.encode()?;
        let table = &bytes[HEADER_LEN + 4000..bytes.len() - 4];
        let mut offsets: Vec<i32> = table
            .chunks(4)
            .map(|c| i32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .filter(|pos| *pos != EMPTY_SLOT)
            .collect();
        offsets.sort_unstable();
        assert_eq!(offsets, vec![0, 59]);
        Ok(())
    }

    #[test]
    fn test_load_into_smaller_cache_keeps_newest() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.cache");
        let mut cache = CacheCore::new(&config(8000, 1000));
        fill(&mut cache, 100);
        cache.save(&path)?;

        let mut smaller = CacheCore::new(&config(2000, 500));
        let loaded = smaller.load(&path)?;
        assert!(loaded > 0 && loaded < 100);
        assert!(smaller.contains(C, &99u64.to_be_bytes()));
        assert!(!smaller.contains(C, &0u64.to_be_bytes()));
        let view = smaller.get_at(C, &99u64.to_be_bytes(), Some(10), false, 1105);
        assert_eq!(view, Some(vec![99u8; 40]));
        smaller.check_consistency()?;
        Ok(())
    }

    #[test]
    fn test_load_rejects_damage_and_mismatch() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.cache");
        let mut cache = CacheCore::new(&config(4000, 1000));
        fill(&mut cache, 10);
        cache.save(&path)?;

        let mut other_keys = CacheCore::new(&config(4000, 1000).key_size(16));
        assert!(matches!(other_keys.load(&path), Err(Error::InvalidState(_))));

        let mut bytes = fs::read(&path).unwrap();
        bytes[100] ^= 0xff;
        fs::write(&path, &bytes).unwrap();
        let mut fresh = CacheCore::new(&config(4000, 1000));
        assert!(matches!(fresh.load(&path), Err(Error::Corrupt(_))));
        assert!(fresh.is_empty());

        assert_eq!(fresh.load(&dir.path().join("missing.cache"))?, 0);
        Ok(())
    }
}
