//! Open handles for the physical parts of a partitioned file.
//!
//! Every (re)open of a part bumps its generation. Operations capture a
//! `PartHandle` before they are queued and validate it when they finish, so a
//! part that was closed and reopened underneath them fails with a typed
//! `StaleHandle` instead of touching the wrong file.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::Error;

/// A part index paired with the generation it was opened under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartHandle {
    pub part: u32,
    pub generation: u64,
}

#[derive(Debug, Default)]
struct PartSlot {
    file: Option<Arc<File>>,
    generation: u64,
    /// Writes in progress; a part with writers is never closed.
    writers: usize,
}

/// The parts that currently exist on disk, keyed by part index.
#[derive(Debug, Default)]
pub struct PartTable {
    slots: BTreeMap<u32, PartSlot>,
}

impl PartTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a part found on disk without opening it.
    pub fn insert_existing(&mut self, part: u32) {
        self.slots.entry(part).or_default();
    }

    pub fn contains(&self, part: u32) -> bool {
        self.slots.contains_key(&part)
    }

    pub fn parts(&self) -> Vec<u32> {
        self.slots.keys().copied().collect()
    }

    pub fn first(&self) -> Option<u32> {
        self.slots.keys().next().copied()
    }

    pub fn last(&self) -> Option<u32> {
        self.slots.keys().next_back().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Returns an open handle for `part`, opening it if needed.
    ///
    /// Missing parts are created only when `create` is set; reads of a part
    /// that does not exist fail with `NotFound`.
    pub fn open(&mut self, part: u32, path: &Path, create: bool) -> Result<(Arc<File>, PartHandle)> {
        if !create && !self.slots.contains_key(&part) {
            return Err(Error::ReadError(
                "file part",
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("part {} of {} does not exist", part, path.display()),
                ),
            ));
        }
        let slot = self.slots.entry(part).or_default();
        if let Some(file) = &slot.file {
            return Ok((
                Arc::clone(file),
                PartHandle {
                    part,
                    generation: slot.generation,
                },
            ));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::ReadError("file part", e))?;
        let file = Arc::new(file);
        slot.file = Some(Arc::clone(&file));
        slot.generation += 1;
        Ok((
            file,
            PartHandle {
                part,
                generation: slot.generation,
            },
        ))
    }

    /// Fails if `handle` no longer names the currently open part.
    pub fn validate(&self, handle: &PartHandle) -> Result<()> {
        let current = match self.slots.get(&handle.part) {
            Some(slot) if slot.file.is_some() => slot.generation,
            Some(slot) => slot.generation + 1,
            None => 0,
        };
        if current != handle.generation {
            return Err(Error::StaleHandle {
                part: handle.part,
                captured: handle.generation,
                current,
            });
        }
        Ok(())
    }

    pub fn begin_write(&mut self, part: u32) {
        self.slots.entry(part).or_default().writers += 1;
    }

    pub fn end_write(&mut self, part: u32) {
        if let Some(slot) = self.slots.get_mut(&part) {
            slot.writers = slot.writers.saturating_sub(1);
        }
    }

    /// Closes one part unless a write is using it.
    pub fn close(&mut self, part: u32) -> bool {
        match self.slots.get_mut(&part) {
            Some(slot) if slot.writers == 0 && slot.file.is_some() => {
                slot.file = None;
                true
            }
            _ => false,
        }
    }

    /// Closes every part without a write in progress; returns how many closed.
    pub fn close_idle(&mut self) -> usize {
        let parts: Vec<u32> = self.slots.keys().copied().collect();
        parts.into_iter().filter(|&p| self.close(p)).count()
    }

    /// Open files, for syncing.
    pub fn open_files(&self) -> Vec<Arc<File>> {
        self.slots.values().filter_map(|s| s.file.clone()).collect()
    }

    /// Forgets a part after it was removed from disk.
    pub fn remove(&mut self, part: u32) {
        self.slots.remove(&part);
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// Drops all handles so parts reopen under their new names; generations
    /// keep counting so handles captured before stay stale.
    pub fn reset_handles(&mut self) {
        for slot in self.slots.values_mut() {
            slot.file = None;
        }
    }
}

/// Keeps a part open for the duration of a write.
pub struct WriteGuard {
    table: Arc<Mutex<PartTable>>,
    part: u32,
}

impl WriteGuard {
    pub fn new(table: Arc<Mutex<PartTable>>, part: u32) -> Self {
        table.lock().begin_write(part);
        Self { table, part }
    }

    /// Takes over a writer count already added with `begin_write`.
    pub fn adopt(table: Arc<Mutex<PartTable>>, part: u32) -> Self {
        Self { table, part }
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        self.table.lock().end_write(self.part);
    }
}
