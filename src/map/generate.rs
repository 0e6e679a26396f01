//! Rebuilding a page index from raw data, and deciding when to.

use std::path::Path;

use super::PageIndex;
use crate::config::Config;
use crate::error::Result;
use crate::file::PartitionedFile;
use crate::jobs::Priority;
use crate::key::Key;
use crate::record::{DataSize, RecordFormat};
use crate::Error;

/// Records that must parse cleanly before an offset is accepted as the start
/// of a full key.
const PROBE_RECORDS: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct GenerateOptions {
    pub page_size: usize,
    pub pages_per_segment: usize,
    pub max_truncate_bytes: u64,
    /// Bytes read from the data file at a time.
    pub chunk_size: usize,
}

impl From<&Config> for GenerateOptions {
    fn from(config: &Config) -> Self {
        Self {
            page_size: config.page_size,
            pages_per_segment: config.pages_per_segment,
            max_truncate_bytes: config.max_truncate_bytes,
            chunk_size: 1024 * 1024,
        }
    }
}

/// Finds the first offset in `buf` where a record with a full, uncompressed
/// key starts, for data whose head was cut at an arbitrary byte. `base` is
/// the logical offset of `buf[0]`.
///
/// Fixed-width records without key compression line up with offset zero, so
/// their boundary is computed. Otherwise an offset is accepted when the
/// records following it decode and keep their keys in order, for eight
/// records or up to the end of `buf`.
pub fn find_next_full_key_offset(format: &RecordFormat, buf: &[u8], base: u64) -> Option<usize> {
    if let DataSize::Fixed(n) = format.data_size {
        if !format.half_keys {
            let width = (format.key_size + n) as u64;
            let skip = (base.div_ceil(width) * width - base) as usize;
            return (skip < buf.len()).then_some(skip);
        }
    }
    (0..buf.len()).find(|&off| plausible_run(format, &buf[off..]))
}

fn plausible_run(format: &RecordFormat, buf: &[u8]) -> bool {
    let mut pos = 0;
    let mut parsed = 0;
    let mut prev: Option<Key> = None;
    while parsed < PROBE_RECORDS {
        match format.decode_record(&buf[pos..], prev.as_ref()) {
            Ok((record, len)) => {
                if prev.as_ref().is_some_and(|p| record.key < *p) {
                    return false;
                }
                pos += len;
                parsed += 1;
                prev = Some(record.key);
                if pos == buf.len() {
                    return true;
                }
            }
            Err(Error::BufferTooSmall { .. }) => return parsed > 0,
            Err(_) => return false,
        }
    }
    true
}

/// Rebuilds the page index of `file` by reading every record.
///
/// A headless file is indexed from the first full key after its first part
/// starts. A damaged tail (a record cut short or out of order, as a crash in
/// the middle of a write leaves behind) is cut off when it is no larger than
/// `max_truncate_bytes`; a larger one is reported as corruption.
pub async fn generate_map(file: &PartitionedFile, format: RecordFormat, options: &GenerateOptions) -> Result<PageIndex> {
    let mut map = PageIndex::new(format.key_size, options.page_size, options.pages_per_segment);
    let size = file.size()?;
    let start = file.start_offset();
    let mut pos = start;

    if start > 0 {
        map.start_at(start)?;
        if size > start {
            let probe_len = (options.chunk_size as u64).min(size - start) as usize;
            let probe = file.read(start, probe_len, Priority::Normal).await?;
            let skip = find_next_full_key_offset(&format, &probe, start).ok_or_else(|| {
                Error::Corrupt(format!(
                    "no full key in the first {} bytes of headless file {} at offset {}",
                    probe_len,
                    file.base(),
                    start
                ))
            })?;
            pos = start + skip as u64;
            map.skip_to(pos)?;
            tracing::info!(file = %file.base(), start, skip, "Found first full key in headless file");
        }
    }

    let mut chunk = options.chunk_size.max(format.min_record_size());
    let mut damaged_at = None;
    'read: while pos < size {
        let len = (chunk as u64).min(size - pos) as usize;
        let buf = file.read(pos, len, Priority::Normal).await?;

        let mut used = 0;
        while used < buf.len() {
            let prev = (!map.is_empty()).then(|| map.last_key().clone());
            match format.decode_record(&buf[used..], prev.as_ref()) {
                Ok((record, n)) => {
                    if prev.as_ref().is_some_and(|p| record.key < *p) {
                        damaged_at = Some(pos + used as u64);
                        break 'read;
                    }
                    map.add_record(&record.key, n)?;
                    used += n;
                }
                Err(Error::BufferTooSmall { needed, .. }) => {
                    if pos + used as u64 + needed as u64 > size {
                        damaged_at = Some(pos + used as u64);
                        break 'read;
                    }
                    // the record runs past this chunk; read again from its start
                    if used == 0 {
                        chunk = chunk.saturating_mul(2).max(needed);
                    }
                    break;
                }
                Err(e) if e.is_corruption() => {
                    damaged_at = Some(pos + used as u64);
                    break 'read;
                }
                Err(e) => return Err(e),
            }
        }
        pos += used as u64;
    }

    if let Some(offset) = damaged_at {
        let tail = size - offset;
        if tail > options.max_truncate_bytes {
            tracing::error!(
                file = %file.base(),
                offset,
                tail,
                limit = options.max_truncate_bytes,
                "Damaged tail too large to truncate"
            );
            return Err(Error::Corrupt(format!(
                "{} bytes of unreadable data at offset {} of {}",
                tail,
                offset,
                file.base()
            )));
        }
        tracing::warn!(file = %file.base(), offset, tail, "Truncating damaged tail");
        file.truncate(offset)?;
    }

    tracing::info!(
        file = %file.base(),
        pages = map.num_pages(),
        records = map.record_count(),
        size = map.logical_size(),
        "Generated page index"
    );
    Ok(map)
}

/// Loads the saved map for `file` if it exists and agrees with the data,
/// otherwise regenerates it. A regenerated map comes back dirty so the
/// caller saves it.
pub async fn load_or_generate(
    file: &PartitionedFile,
    map_path: &Path,
    format: RecordFormat,
    options: &GenerateOptions,
) -> Result<PageIndex> {
    if map_path.exists() {
        match load_and_verify(file, map_path, format, options) {
            Ok(map) => return Ok(map),
            Err(e) if e.is_corruption() => {
                tracing::warn!(
                    file = %file.base(),
                    map = %map_path.display(),
                    error = %e,
                    "Map does not match data file, regenerating"
                );
            }
            Err(e) => return Err(e),
        }
    } else if !file.exists() {
        return Ok(PageIndex::new(format.key_size, options.page_size, options.pages_per_segment));
    }
    generate_map(file, format, options).await
}

fn load_and_verify(file: &PartitionedFile, map_path: &Path, format: RecordFormat, options: &GenerateOptions) -> Result<PageIndex> {
    let mut map = PageIndex::read_from(map_path, format.key_size, options.page_size, options.pages_per_segment)?;
    let start = file.start_offset();
    // parts removed after the map was last saved
    let from = map.file_start();
    if start > from {
        map.chop_head(start - from);
    }
    map.verify(file.size()?, file.is_headless(), format.full_record_size(0))?;
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobConfig;
    use crate::file::{FileOptions, UnlinkRegistry};
    use crate::jobs::JobPool;
    use crate::record::{Record, RecordList};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    fn open(dir: &Path, part_size: u64) -> PartitionedFile {
        let options = FileOptions {
            part_size,
            unlink_grace: Duration::from_millis(50),
            unlink_poll: Duration::from_millis(5),
        };
        PartitionedFile::open(dir, "db0001.dat", options, UnlinkRegistry::new(), Arc::new(JobPool::new(&JobConfig::default()))).unwrap()
    }

    fn options() -> GenerateOptions {
        GenerateOptions {
            page_size: 64,
            pages_per_segment: 4,
            max_truncate_bytes: 100,
            chunk_size: 50,
        }
    }

    fn variable_list(n: u64) -> RecordList {
        let format = RecordFormat::new(12, DataSize::Variable);
        let records = (0..n)
            .map(|i| Record::new(Key::from_u64(12, i * 2 + 1), vec![i as u8; (i % 9) as usize * 3]))
            .collect();
        RecordList::from_records(format, records).unwrap()
    }

    async fn write_indexed(file: &PartitionedFile, list: &RecordList) -> PageIndex {
        let mut map = PageIndex::new(12, 64, 4);
        let bytes = map.add_list(list).unwrap();
        file.write(0, bytes, Priority::Normal).await.unwrap();
        map
    }

    fn pages(map: &PageIndex) -> Vec<(Key, i16)> {
        (0..map.num_pages())
            .map(|p| (map.key_at(p).unwrap(), map.offset_at(p).unwrap()))
            .collect()
    }

    #[tokio::test]
    async fn test_generate_matches_incremental_map() -> Result<()> {
        let dir = tempdir().unwrap();
        let file = open(dir.path(), 1 << 20);
        let list = variable_list(60);
        let built = write_indexed(&file, &list).await;

        let generated = generate_map(&file, list.format(), &options()).await?;
        assert_eq!(pages(&generated), pages(&built));
        assert_eq!(generated.logical_size(), built.logical_size());
        assert_eq!(generated.record_count(), 60);
        Ok(())
    }

    #[tokio::test]
    async fn test_generate_truncates_small_garbage_tail() -> Result<()> {
        let dir = tempdir().unwrap();
        let file = open(dir.path(), 1 << 20);
        let list = variable_list(20);
        let built = write_indexed(&file, &list).await;
        let good = built.logical_size();

        // half a record: a length prefix promising more than is there
        let mut tail = Key::from_u64(12, 999).into_bytes();
        tail.reverse();
        tail.extend_from_slice(&[40, 0, 0, 0, 1, 2, 3]);
        file.write(good, tail, Priority::Normal).await?;

        let generated = generate_map(&file, list.format(), &options()).await?;
        assert_eq!(generated.logical_size(), good);
        assert_eq!(file.size()?, good);
        Ok(())
    }

    #[tokio::test]
    async fn test_generate_rejects_large_garbage_tail() -> Result<()> {
        let dir = tempdir().unwrap();
        let file = open(dir.path(), 1 << 20);
        let list = variable_list(20);
        let built = write_indexed(&file, &list).await;

        // a key lower than everything before it, followed by junk
        let mut junk = vec![0u8; 12];
        junk.extend_from_slice(&[0, 0, 0, 0]);
        junk.extend_from_slice(&[0xab; 200]);
        file.write(built.logical_size(), junk, Priority::Normal).await?;

        let result = generate_map(&file, list.format(), &options()).await;
        assert!(matches!(result, Err(Error::Corrupt(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_generate_headless_file() -> Result<()> {
        let dir = tempdir().unwrap();
        let format = RecordFormat::new(12, DataSize::Fixed(4));
        let file = open(dir.path(), 100);
        let records = (0..30u64)
            .map(|i| Record::new(Key::from_u64(12, 0x1000 + i * 2 + 1), vec![7; 4]))
            .collect();
        let list = RecordList::from_records(format, records).unwrap();
        let mut map = PageIndex::new(12, 64, 4);
        let bytes = map.add_list(&list).unwrap();
        file.write(0, bytes, Priority::Normal).await?;

        file.unlink_part(0).await?;
        let generated = generate_map(&file, format, &options()).await?;
        // records are 16 bytes, so the first one starting in part 1 is at 112
        assert_eq!(generated.file_start(), 100);
        assert_eq!(generated.abs_offset(0), 112);
        assert_eq!(generated.key_at(0).unwrap().low_u64(), 0x1000 + 7 * 2 + 1);
        assert_eq!(generated.logical_size(), 480);
        assert!(generated.verify(file.size()?, true, 16).is_ok());
        Ok(())
    }

    #[test]
    fn test_find_next_full_key_offset_needs_full_key() {
        let format = RecordFormat::new(18, DataSize::Fixed(0)).with_half_keys();
        let records = (0..12u64)
            .map(|i| Record::key_only(Key::from_u64(18, (i << 56) | 0x0101 | (i << 8))))
            .collect();
        let list = RecordList::from_records(format, records).unwrap();
        let bytes = list.encode().unwrap();
        assert_eq!(find_next_full_key_offset(&format, &bytes, 0), Some(0));
        // starting mid-record lands on the next full key or not at all
        if let Some(off) = find_next_full_key_offset(&format, &bytes[5..], 5) {
            assert_eq!(bytes[5 + off] & 0x06, 0);
        }
    }

    #[test]
    fn test_fixed_records_align_to_offset_zero() {
        let format = RecordFormat::new(12, DataSize::Fixed(4));
        let buf = vec![0u8; 64];
        assert_eq!(find_next_full_key_offset(&format, &buf, 100), Some(12));
        assert_eq!(find_next_full_key_offset(&format, &buf, 96), Some(0));
        assert_eq!(find_next_full_key_offset(&format, &buf[..10], 100), None);
    }

    #[tokio::test]
    async fn test_load_or_generate_regenerates_bad_map() -> Result<()> {
        let dir = tempdir().unwrap();
        let file = open(dir.path(), 1 << 20);
        let list = variable_list(30);
        let built = write_indexed(&file, &list).await;
        let map_path = dir.path().join("db0001.map");

        // a map that claims less data than the file holds
        let mut stale = built.clone();
        stale.truncate_to_offset(built.logical_size() / 2);
        stale.write_to(&map_path)?;

        let map = load_or_generate(&file, &map_path, list.format(), &options()).await?;
        assert_eq!(map.logical_size(), built.logical_size());
        assert!(map.is_dirty());

        map.write_to(&map_path)?;
        let again = load_or_generate(&file, &map_path, list.format(), &options()).await?;
        assert!(!again.is_dirty());
        assert_eq!(pages(&again), pages(&built));
        Ok(())
    }

    #[tokio::test]
    async fn test_load_or_generate_empty_file() -> Result<()> {
        let dir = tempdir().unwrap();
        let file = open(dir.path(), 1 << 20);
        let map = load_or_generate(&file, &dir.path().join("db0001.map"), RecordFormat::new(12, DataSize::Variable), &options()).await?;
        assert!(map.is_empty());
        Ok(())
    }
}
