//! Map side file.
//!
//! ```text
//! +----------------+----------------+----------------+----------------+
//! | logical size 8 | file start 8   | positive 8     | negative 8     |
//! +----------------+----------------+----------------+----------------+
//! | last key (key_size)                                               |
//! +-------------------------------------------------------------------+
//! | page 0: key (key_size) | offset i16 | page 1: key | offset | ...  |
//! +-------------------------------------------------------------------+
//! ```
//!
//! All integers are big endian. The page count is implied by the file length.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{Cursor, Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::{PageIndex, Segment, NO_RECORD};
use crate::error::Result;
use crate::key::Key;
use crate::Error;

const FIXED_HEADER: usize = 32;

impl PageIndex {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let entry = self.key_size + 2;
        let mut buf = Vec::with_capacity(FIXED_HEADER + self.key_size + self.num_pages * entry);
        buf.write_u64::<BigEndian>(self.logical_size)?;
        buf.write_u64::<BigEndian>(self.file_start)?;
        buf.write_u64::<BigEndian>(self.positive)?;
        buf.write_u64::<BigEndian>(self.negative)?;
        buf.write_all(self.last_key.as_bytes())?;

        for seg in &self.segments {
            for (slot, offset) in seg.offsets.iter().enumerate() {
                buf.write_all(&seg.keys[slot * self.key_size..(slot + 1) * self.key_size])?;
                buf.write_i16::<BigEndian>(*offset)?;
            }
        }
        Ok(buf)
    }

    /// Parses a saved map. Anything inconsistent is `IndexCorruption`, which
    /// callers answer by regenerating the map from the data file.
    pub fn decode(bytes: &[u8], key_size: usize, page_size: usize, pages_per_segment: usize) -> Result<Self> {
        let header = FIXED_HEADER + key_size;
        if bytes.len() < header {
            return Err(Error::IndexCorruption(format!(
                "map is {} bytes, header needs {}",
                bytes.len(),
                header
            )));
        }
        let entry = key_size + 2;
        if (bytes.len() - header) % entry != 0 {
            return Err(Error::IndexCorruption(format!(
                "map body of {} bytes is not a whole number of {}-byte pages",
                bytes.len() - header,
                entry
            )));
        }

        let mut cursor = Cursor::new(bytes);
        let logical_size = cursor
            .read_u64::<BigEndian>()
            .map_err(|e| Error::ReadError("logical size in map header", e))?;
        let file_start = cursor
            .read_u64::<BigEndian>()
            .map_err(|e| Error::ReadError("file start in map header", e))?;
        let positive = cursor
            .read_u64::<BigEndian>()
            .map_err(|e| Error::ReadError("positive count in map header", e))?;
        let negative = cursor
            .read_u64::<BigEndian>()
            .map_err(|e| Error::ReadError("negative count in map header", e))?;
        let mut last_key = vec![0u8; key_size];
        cursor
            .read_exact(&mut last_key)
            .map_err(|e| Error::ReadError("last key in map header", e))?;

        if file_start > logical_size {
            return Err(Error::IndexCorruption(format!(
                "map starts at {} past its end {}",
                file_start, logical_size
            )));
        }

        let num_pages = (bytes.len() - header) / entry;
        let mut segments: VecDeque<Segment> = VecDeque::new();
        let mut prev: Option<Vec<u8>> = None;
        for page in 0..num_pages {
            let mut key = vec![0u8; key_size];
            cursor
                .read_exact(&mut key)
                .map_err(|e| Error::ReadError("page key in map", e))?;
            let offset = cursor
                .read_i16::<BigEndian>()
                .map_err(|e| Error::ReadError("page offset in map", e))?;

            if offset != NO_RECORD && (offset < 0 || offset as usize >= page_size) {
                return Err(Error::IndexCorruption(format!(
                    "page {} has offset {} outside a {}-byte page",
                    page, offset, page_size
                )));
            }
            if let Some(prev) = &prev {
                if key < *prev {
                    return Err(Error::IndexCorruption(format!(
                        "page {} key {} is below the previous page key {}",
                        page,
                        Key::from_slice(&key),
                        Key::from_slice(prev)
                    )));
                }
            }

            if page % pages_per_segment == 0 {
                segments.push_back(Segment {
                    keys: Vec::with_capacity(pages_per_segment * key_size),
                    offsets: Vec::with_capacity(pages_per_segment),
                });
            }
            if let Some(seg) = segments.back_mut() {
                seg.keys.extend_from_slice(&key);
                seg.offsets.push(offset);
            }
            prev = Some(key);
        }

        if let Some(prev) = &prev {
            if last_key < *prev {
                return Err(Error::IndexCorruption(format!(
                    "last key {} is below the last page key {}",
                    Key::from_slice(&last_key),
                    Key::from_slice(prev)
                )));
            }
        }

        Ok(Self {
            key_size,
            page_size,
            pages_per_segment,
            segments,
            num_pages,
            file_start,
            logical_size,
            positive,
            negative,
            last_key: Key::new(last_key),
            dirty: false,
        })
    }

    /// Writes the map next to its data file through a temporary file, so a
    /// crash leaves either the old map or the new one.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        write_atomic(path, &self.encode()?)
    }

    pub fn read_from(path: &Path, key_size: usize, page_size: usize, pages_per_segment: usize) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| Error::ReadError("map file", e))?;
        Self::decode(&bytes, key_size, page_size, pages_per_segment)
    }
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = Path::new(&tmp);

    let mut file = File::create(tmp).map_err(|e| Error::WriteError("temporary side file", e))?;
    file.write_all(bytes)
        .map_err(|e| Error::WriteError("temporary side file", e))?;
    file.sync_all()
        .map_err(|e| Error::WriteError("temporary side file", e))?;
    fs::rename(tmp, path).map_err(|e| Error::WriteError("side file", e))?;
    Ok(())
}
