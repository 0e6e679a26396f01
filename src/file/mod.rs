//! One logical file stored as a run of bounded-size physical parts.
//!
//! Logical offset `o` lives in part `o / part_size` at local offset
//! `o % part_size`. Part 0 is named after the file itself and part `n` gets a
//! `.part{n}` suffix:
//!
//! ```text
//! posdb0001.dat         bytes [0, part_size)
//! posdb0001.dat.part1   bytes [part_size, 2 * part_size)
//! posdb0001.dat.part2   ...
//! ```
//!
//! Leading parts may be missing once a merge has consumed them (a headless
//! file); logical offsets never shift when that happens.
//!
//! Reads and writes run as jobs on the shared [`JobPool`], or inline when the
//! pool is full. Unlink and rename register every part name with the shared
//! [`UnlinkRegistry`] before touching the file system, cancel reads that have
//! not started yet and give running ones a bounded grace period.

mod parts;
mod registry;
mod txn;

pub use parts::{PartHandle, PartTable, WriteGuard};
pub use registry::{UnlinkRegistry, WorkerGuard};
pub use txn::{MetaKind, MetaSlot, MetaTxn, TxnState};

use std::fs::{self, File};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::Result;
use crate::jobs::{JobPool, Priority, Rejected, Tally};
use crate::Error;

type PartOp = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// Geometry and timing for a partitioned file.
#[derive(Debug, Clone, Copy)]
pub struct FileOptions {
    pub part_size: u64,
    pub unlink_grace: Duration,
    pub unlink_poll: Duration,
}

impl From<&Config> for FileOptions {
    fn from(config: &Config) -> Self {
        Self {
            part_size: config.part_size,
            unlink_grace: config.unlink_grace,
            unlink_poll: config.unlink_poll,
        }
    }
}

/// How many operations went through the pool versus ran inline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStats {
    pub pooled_ops: u64,
    pub inline_ops: u64,
}

pub struct PartitionedFile {
    dir: PathBuf,
    base: RwLock<String>,
    options: FileOptions,
    parts: Arc<Mutex<PartTable>>,
    registry: Arc<UnlinkRegistry>,
    pool: Arc<JobPool>,
    size: Mutex<Option<u64>>,
    modified: Mutex<Option<SystemTime>>,
    read_cancel: Mutex<CancellationToken>,
    reads_in_flight: AtomicUsize,
    meta: Mutex<MetaSlot>,
    pooled_ops: AtomicU64,
    inline_ops: AtomicU64,
}

/// One contiguous slice of an operation that stays inside a single part.
#[derive(Debug, Clone, Copy)]
struct Piece {
    part: u32,
    local: u64,
    start: usize,
    len: usize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn part_path(dir: &Path, base: &str, part: u32) -> PathBuf {
    if part == 0 {
        dir.join(base)
    } else {
        dir.join(format!("{}.part{}", base, part))
    }
}

impl PartitionedFile {
    /// Opens the file named `base` in `dir`, picking up whatever parts exist.
    /// Nothing is created until the first write.
    pub fn open(
        dir: impl Into<PathBuf>,
        base: &str,
        options: FileOptions,
        registry: Arc<UnlinkRegistry>,
        pool: Arc<JobPool>,
    ) -> Result<Self> {
        let dir = dir.into();
        let mut table = PartTable::new();
        let suffix_prefix = format!("{}.part", base);
        for entry in fs::read_dir(&dir).map_err(|e| Error::ReadError("data directory", e))? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name == base {
                table.insert_existing(0);
            } else if let Some(n) = name.strip_prefix(&suffix_prefix) {
                if let Ok(part) = n.parse::<u32>() {
                    table.insert_existing(part);
                }
            }
        }

        Ok(Self {
            dir,
            base: RwLock::new(base.to_string()),
            options,
            parts: Arc::new(Mutex::new(table)),
            registry,
            pool,
            size: Mutex::new(None),
            modified: Mutex::new(None),
            read_cancel: Mutex::new(CancellationToken::new()),
            reads_in_flight: AtomicUsize::new(0),
            meta: Mutex::new(MetaSlot::default()),
            pooled_ops: AtomicU64::new(0),
            inline_ops: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn base(&self) -> String {
        self.base.read().clone()
    }

    pub fn part_size(&self) -> u64 {
        self.options.part_size
    }

    pub fn part_path(&self, part: u32) -> PathBuf {
        part_path(&self.dir, &self.base.read(), part)
    }

    pub fn parts(&self) -> Vec<u32> {
        self.parts.lock().parts()
    }

    pub fn first_part(&self) -> Option<u32> {
        self.parts.lock().first()
    }

    /// True when leading parts were removed, so the first existing byte is
    /// past logical offset zero.
    pub fn is_headless(&self) -> bool {
        matches!(self.first_part(), Some(p) if p > 0)
    }

    /// Logical offset of the first byte still on disk.
    pub fn start_offset(&self) -> u64 {
        self.first_part().map_or(0, |p| p as u64 * self.options.part_size)
    }

    pub fn exists(&self) -> bool {
        !self.parts.lock().is_empty()
    }

    /// Logical size: the end offset of the last part. Cached until the next write.
    pub fn size(&self) -> Result<u64> {
        if let Some(size) = *self.size.lock() {
            return Ok(size);
        }
        let last = self.parts.lock().last();
        let size = match last {
            None => 0,
            Some(part) => {
                let len = match fs::metadata(self.part_path(part)) {
                    Ok(meta) => meta.len(),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
                    Err(e) => return Err(Error::ReadError("part size", e)),
                };
                part as u64 * self.options.part_size + len
            }
        };
        *self.size.lock() = Some(size);
        Ok(size)
    }

    /// Time of the last write through this handle, else the last part's mtime.
    pub fn last_modified(&self) -> Option<SystemTime> {
        if let Some(time) = *self.modified.lock() {
            return Some(time);
        }
        let last = self.parts.lock().last()?;
        fs::metadata(self.part_path(last)).and_then(|m| m.modified()).ok()
    }

    pub fn stats(&self) -> FileStats {
        FileStats {
            pooled_ops: self.pooled_ops.load(Ordering::Relaxed),
            inline_ops: self.inline_ops.load(Ordering::Relaxed),
        }
    }

    fn split(&self, offset: u64, len: usize) -> Vec<Piece> {
        let part_size = self.options.part_size;
        let mut pieces = Vec::new();
        let mut done = 0usize;
        while done < len {
            let abs = offset + done as u64;
            let local = abs % part_size;
            let n = (len - done).min((part_size - local) as usize);
            pieces.push(Piece {
                part: (abs / part_size) as u32,
                local,
                start: done,
                len: n,
            });
            done += n;
        }
        pieces
    }

    /// Reads `len` bytes at logical `offset`.
    ///
    /// Fails with `PendingUnlink` if the file is being unlinked or renamed,
    /// `Cancelled` if that started while the read was queued, and
    /// `StaleHandle` if a part was reopened while the read ran.
    pub async fn read(&self, offset: u64, len: usize, priority: Priority) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        // counted before the pending check; unlink marks parts pending, then drains
        let _in_flight = InFlight::new(&self.reads_in_flight);
        let pieces = self.split(offset, len);
        let paths: Vec<PathBuf> = pieces.iter().map(|p| self.part_path(p.part)).collect();
        if let Some(path) = self.registry.first_pending(&paths) {
            return Err(Error::PendingUnlink(path));
        }

        let handles = {
            let mut parts = self.parts.lock();
            pieces
                .iter()
                .zip(&paths)
                .map(|(piece, path)| parts.open(piece.part, path, false))
                .collect::<Result<Vec<_>>>()?
        };

        let mut buf = Vec::new();
        buf.try_reserve_exact(len).map_err(|_| Error::OutOfMemory(len))?;
        buf.resize(len, 0);

        let parts = Arc::clone(&self.parts);
        let registry = Arc::clone(&self.registry);
        let job = move || -> Result<Vec<u8>> {
            if let Some(path) = registry.first_pending(&paths) {
                return Err(Error::PendingUnlink(path));
            }
            for (piece, (file, _)) in pieces.iter().zip(&handles) {
                read_full_at(file, &mut buf[piece.start..piece.start + piece.len], piece.local)?;
            }
            let parts = parts.lock();
            for (_, handle) in &handles {
                parts.validate(handle)?;
            }
            Ok(buf)
        };

        let token = self.read_cancel.lock().clone();
        self.dispatch(priority, token, job).await
    }

    /// Writes `data` at logical `offset`, creating parts as needed.
    pub async fn write(&self, offset: u64, data: Vec<u8>, priority: Priority) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if self.meta.lock().is_busy() {
            return Err(Error::InvalidOperation(format!(
                "write to {} while an unlink or rename is outstanding",
                self.base()
            )));
        }
        let pieces = self.split(offset, data.len());
        let paths: Vec<PathBuf> = pieces.iter().map(|p| self.part_path(p.part)).collect();
        if let Some(path) = self.registry.first_pending(&paths) {
            return Err(Error::PendingUnlink(path));
        }

        let (handles, guards) = {
            let mut parts = self.parts.lock();
            let mut handles = Vec::with_capacity(pieces.len());
            let mut guards = Vec::with_capacity(pieces.len());
            for (piece, path) in pieces.iter().zip(&paths) {
                handles.push(parts.open(piece.part, path, true)?);
                parts.begin_write(piece.part);
                guards.push(WriteGuard::adopt(Arc::clone(&self.parts), piece.part));
            }
            (handles, guards)
        };

        let parts = Arc::clone(&self.parts);
        let job = move || -> Result<()> {
            let _guards = guards;
            for (piece, (file, _)) in pieces.iter().zip(&handles) {
                file.write_all_at(&data[piece.start..piece.start + piece.len], piece.local)
                    .map_err(|e| Error::WriteError("file part", e))?;
            }
            let parts = parts.lock();
            for (_, handle) in &handles {
                parts.validate(handle)?;
            }
            Ok(())
        };

        let result = self
            .dispatch(priority, CancellationToken::new(), job)
            .await;
        *self.size.lock() = None;
        *self.modified.lock() = Some(SystemTime::now());
        result
    }

    async fn dispatch<F, T>(&self, priority: Priority, token: CancellationToken, job: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        match self.pool.try_submit(priority, token.clone(), job) {
            Ok(job) => {
                self.pooled_ops.fetch_add(1, Ordering::Relaxed);
                job.wait().await
            }
            Err(Rejected(job)) => {
                self.inline_ops.fetch_add(1, Ordering::Relaxed);
                if token.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                job()
            }
        }
    }

    /// Cuts the file back to `new_size` bytes, removing whole parts past it.
    pub fn truncate(&self, new_size: u64) -> Result<()> {
        if self.meta.lock().is_busy() {
            return Err(Error::InvalidOperation(format!(
                "truncate of {} while an unlink or rename is outstanding",
                self.base()
            )));
        }
        let part_size = self.options.part_size;
        let keep = if new_size == 0 {
            None
        } else {
            Some(((new_size - 1) / part_size) as u32)
        };

        let mut parts = self.parts.lock();
        for part in parts.parts() {
            if keep.map_or(true, |k| part > k) {
                parts.close(part);
                remove_if_exists(&self.part_path(part))?;
                parts.remove(part);
            }
        }
        if let Some(k) = keep {
            if parts.contains(k) {
                let path = self.part_path(k);
                let (file, _) = parts.open(k, &path, false)?;
                file.set_len(new_size - k as u64 * part_size)
                    .map_err(|e| Error::WriteError("truncated part", e))?;
            }
        }
        drop(parts);

        *self.size.lock() = None;
        *self.modified.lock() = Some(SystemTime::now());
        tracing::info!(file = %self.base(), new_size, "Truncated file");
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        for file in self.parts.lock().open_files() {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Closes parts that are not being written; they reopen on next use under
    /// a new generation.
    pub fn close_idle_parts(&self) -> usize {
        self.parts.lock().close_idle()
    }

    /// Cancels every read that is queued but not yet running.
    pub fn cancel_queued_reads(&self) {
        let mut token = self.read_cancel.lock();
        token.cancel();
        *token = CancellationToken::new();
    }

    /// Removes every part. Unlinking a file with no parts left is a no-op.
    pub async fn unlink(&self) -> Result<()> {
        let parts = self.parts();
        self.remove_parts(MetaKind::Unlink, parts).await
    }

    /// Removes a single part, typically a head part a merge has consumed.
    pub async fn unlink_part(&self, part: u32) -> Result<()> {
        if !self.parts.lock().contains(part) {
            return Ok(());
        }
        self.remove_parts(MetaKind::UnlinkPart(part), vec![part]).await
    }

    async fn remove_parts(&self, kind: MetaKind, parts: Vec<u32>) -> Result<()> {
        self.meta.lock().begin(&kind)?;
        let mut txn = MetaTxn::new(kind.clone());
        let result = self.run_unlink(&mut txn, &parts).await;
        self.meta.lock().end(&kind);
        result
    }

    async fn run_unlink(&self, txn: &mut MetaTxn, parts: &[u32]) -> Result<()> {
        if parts.is_empty() {
            return txn.transition(TxnState::Done);
        }
        let paths: Vec<PathBuf> = parts.iter().map(|&p| self.part_path(p)).collect();
        self.registry.mark_pending(&paths)?;
        let _worker = self.registry.begin_worker();
        self.cancel_queued_reads();
        self.drain_reads().await;

        txn.transition(TxnState::Committing)?;
        {
            let mut table = self.parts.lock();
            for &part in parts {
                table.close(part);
            }
        }
        let ops: Vec<(u32, PartOp)> = parts
            .iter()
            .zip(&paths)
            .map(|(&part, path)| {
                let path = path.clone();
                (part, Box::new(move || remove_if_exists(&path)) as PartOp)
            })
            .collect();
        let results = self.fan_out(txn.tally(), ops).await;

        let mut first_err = None;
        {
            let mut table = self.parts.lock();
            for (part, result) in results {
                match result {
                    Ok(()) => table.remove(part),
                    Err(e) => {
                        tracing::error!(file = %self.base(), part, error = %e, "Failed to unlink part");
                        first_err.get_or_insert(e);
                    }
                }
            }
        }
        self.registry.clear_pending(&paths);
        *self.size.lock() = None;
        txn.transition(TxnState::Done)?;

        match first_err {
            Some(e) => Err(e),
            None => {
                tracing::info!(file = %self.base(), op = %txn.kind(), parts = parts.len(), "Unlinked file parts");
                Ok(())
            }
        }
    }

    /// Renames every part to `new_base`. If any part fails to move, the parts
    /// already moved are moved back and the error is returned.
    pub async fn rename(&self, new_base: &str) -> Result<()> {
        let kind = MetaKind::Rename {
            to: new_base.to_string(),
        };
        self.meta.lock().begin(&kind)?;
        let mut txn = MetaTxn::new(kind.clone());
        let result = self.run_rename(&mut txn, new_base).await;
        self.meta.lock().end(&kind);
        result
    }

    async fn run_rename(&self, txn: &mut MetaTxn, new_base: &str) -> Result<()> {
        let old_base = self.base();
        let parts = self.parts();
        if new_base == old_base {
            return txn.transition(TxnState::Done);
        }
        if parts.is_empty() {
            *self.base.write() = new_base.to_string();
            return txn.transition(TxnState::Done);
        }

        let from: Vec<PathBuf> = parts.iter().map(|&p| part_path(&self.dir, &old_base, p)).collect();
        let to: Vec<PathBuf> = parts.iter().map(|&p| part_path(&self.dir, new_base, p)).collect();
        let marked: Vec<PathBuf> = from.iter().chain(&to).cloned().collect();
        self.registry.mark_pending(&marked)?;
        let _worker = self.registry.begin_worker();
        self.cancel_queued_reads();
        self.drain_reads().await;

        txn.transition(TxnState::Committing)?;
        self.parts.lock().reset_handles();

        // phase 1: move every part
        let ops: Vec<(u32, PartOp)> = parts
            .iter()
            .zip(from.iter().zip(&to))
            .map(|(&part, (src, dst))| {
                let (src, dst) = (src.clone(), dst.clone());
                let op = Box::new(move || {
                    fs::rename(&src, &dst).map_err(|e| Error::WriteError("renamed part", e))
                }) as PartOp;
                (part, op)
            })
            .collect();
        let results = self.fan_out(txn.tally(), ops).await;

        let mut moved = Vec::new();
        let mut first_err = None;
        for (part, result) in results {
            match result {
                Ok(()) => moved.push(part),
                Err(e) => {
                    tracing::warn!(file = %old_base, part, error = %e, "Failed to rename part");
                    first_err.get_or_insert(e);
                }
            }
        }

        if let Some(err) = first_err {
            txn.transition(TxnState::RollingBack)?;
            for part in moved {
                let (src, dst) = (
                    part_path(&self.dir, &old_base, part),
                    part_path(&self.dir, new_base, part),
                );
                if let Err(e) = fs::rename(&dst, &src) {
                    tracing::error!(file = %old_base, part, error = %e, "Failed to roll back part rename");
                }
            }
            self.registry.clear_pending(&marked);
            txn.transition(TxnState::Done)?;
            return Err(err);
        }

        // phase 2: the old names are gone, switch over
        *self.base.write() = new_base.to_string();
        self.registry.clear_pending(&marked);
        *self.size.lock() = None;
        txn.transition(TxnState::Done)?;
        tracing::info!(from = %old_base, to = %new_base, parts = parts.len(), "Renamed file");
        Ok(())
    }

    /// Runs one operation per part on the pool (inline when it is full) and
    /// collects the results once every part reported back.
    async fn fan_out(&self, tally: &Tally, ops: Vec<(u32, PartOp)>) -> Vec<(u32, Result<()>)> {
        let mut results = Vec::with_capacity(ops.len());
        let mut queued = Vec::new();
        for (part, op) in ops {
            tally.submit();
            match self
                .pool
                .try_submit(Priority::Normal, CancellationToken::new(), op)
            {
                Ok(job) => queued.push((part, job)),
                Err(Rejected(op)) => {
                    results.push((part, op()));
                    tally.complete();
                }
            }
        }
        tally.seal();
        for (part, job) in queued {
            results.push((part, job.wait().await));
            tally.complete();
        }
        debug_assert!(tally.is_done());
        results.sort_by_key(|(part, _)| *part);
        results
    }

    /// Waits for running reads to finish, up to the grace period.
    async fn drain_reads(&self) {
        let deadline = tokio::time::Instant::now() + self.options.unlink_grace;
        while self.reads_in_flight.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    file = %self.base(),
                    reads = self.reads_in_flight.load(Ordering::SeqCst),
                    "Reads still running after grace period, proceeding"
                );
                return;
            }
            tokio::time::sleep(self.options.unlink_poll).await;
        }
    }
}

fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    let mut done = 0;
    while done < buf.len() {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => {
                return Err(Error::ShortIo {
                    expected: buf.len(),
                    actual: done,
                })
            }
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::ReadError("file part", e)),
        }
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::WriteError("unlinked part", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobConfig;
    use tempfile::tempdir;

    fn options(part_size: u64) -> FileOptions {
        FileOptions {
            part_size,
            unlink_grace: Duration::from_millis(200),
            unlink_poll: Duration::from_millis(5),
        }
    }

    fn pool(max_jobs: usize) -> Arc<JobPool> {
        Arc::new(JobPool::new(&JobConfig {
            max_jobs,
            urgent_reserve: 0,
        }))
    }

    fn open(dir: &Path, base: &str, part_size: u64) -> PartitionedFile {
        PartitionedFile::open(dir, base, options(part_size), UnlinkRegistry::new(), pool(8)).unwrap()
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_write_and_read_across_parts() -> Result<()> {
        let dir = tempdir().unwrap();
        let file = open(dir.path(), "test.dat", 100);

        let data = pattern(250);
        file.write(50, data.clone(), Priority::Normal).await?;

        assert_eq!(file.parts(), vec![0, 1, 2]);
        assert!(dir.path().join("test.dat").exists());
        assert!(dir.path().join("test.dat.part1").exists());
        assert!(dir.path().join("test.dat.part2").exists());
        assert_eq!(file.size()?, 300);
        assert!(file.last_modified().is_some());

        let read = file.read(50, 250, Priority::Normal).await?;
        assert_eq!(read, data);
        let middle = file.read(120, 60, Priority::Urgent).await?;
        assert_eq!(middle, data[70..130].to_vec());
        Ok(())
    }

    #[tokio::test]
    async fn test_reopen_discovers_parts() -> Result<()> {
        let dir = tempdir().unwrap();
        {
            let file = open(dir.path(), "test.dat", 64);
            file.write(0, pattern(200), Priority::Normal).await?;
            file.sync()?;
        }
        let file = open(dir.path(), "test.dat", 64);
        assert_eq!(file.parts(), vec![0, 1, 2, 3]);
        assert_eq!(file.size()?, 200);
        assert_eq!(file.read(190, 10, Priority::Normal).await?, pattern(200)[190..].to_vec());
        Ok(())
    }

    #[tokio::test]
    async fn test_short_read_past_end() -> Result<()> {
        let dir = tempdir().unwrap();
        let file = open(dir.path(), "test.dat", 100);
        file.write(0, pattern(40), Priority::Normal).await?;
        let result = file.read(30, 20, Priority::Normal).await;
        assert!(matches!(result, Err(Error::ShortIo { expected: 20, actual: 10 })));
        Ok(())
    }

    #[tokio::test]
    async fn test_inline_when_pool_has_no_capacity() -> Result<()> {
        let dir = tempdir().unwrap();
        let file = PartitionedFile::open(dir.path(), "test.dat", options(100), UnlinkRegistry::new(), pool(0))?;
        file.write(0, pattern(150), Priority::Normal).await?;
        assert_eq!(file.read(0, 150, Priority::Normal).await?, pattern(150));
        let stats = file.stats();
        assert_eq!(stats.pooled_ops, 0);
        assert_eq!(stats.inline_ops, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_unlink_part_makes_headless() -> Result<()> {
        let dir = tempdir().unwrap();
        let file = open(dir.path(), "test.dat", 100);
        file.write(0, pattern(300), Priority::Normal).await?;

        file.unlink_part(0).await?;
        assert!(file.is_headless());
        assert_eq!(file.start_offset(), 100);
        assert_eq!(file.size()?, 300);
        assert!(!dir.path().join("test.dat").exists());

        assert_eq!(file.read(150, 50, Priority::Normal).await?, pattern(300)[150..200].to_vec());
        assert!(file.read(50, 10, Priority::Normal).await.is_err());

        // again is a no-op
        file.unlink_part(0).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_unlink_is_idempotent() -> Result<()> {
        let dir = tempdir().unwrap();
        let file = open(dir.path(), "test.dat", 100);
        file.write(0, pattern(150), Priority::Normal).await?;

        file.unlink().await?;
        assert!(!file.exists());
        assert!(!dir.path().join("test.dat").exists());
        assert!(!dir.path().join("test.dat.part1").exists());
        assert_eq!(file.size()?, 0);

        file.unlink().await?;
        let never_written = open(dir.path(), "other.dat", 100);
        never_written.unlink().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_rename_moves_all_parts() -> Result<()> {
        let dir = tempdir().unwrap();
        let file = open(dir.path(), "old.dat", 100);
        file.write(0, pattern(250), Priority::Normal).await?;

        file.rename("new.dat").await?;
        assert_eq!(file.base(), "new.dat");
        assert!(dir.path().join("new.dat").exists());
        assert!(dir.path().join("new.dat.part2").exists());
        assert!(!dir.path().join("old.dat").exists());
        assert_eq!(file.read(0, 250, Priority::Normal).await?, pattern(250));
        Ok(())
    }

    #[tokio::test]
    async fn test_rename_rolls_back_on_failure() -> Result<()> {
        let dir = tempdir().unwrap();
        let file = open(dir.path(), "old.dat", 100);
        file.write(0, pattern(250), Priority::Normal).await?;

        // a non-empty directory where part 1 should land makes that rename fail
        let blocker = dir.path().join("new.dat.part1");
        fs::create_dir(&blocker).unwrap();
        fs::write(blocker.join("keep"), b"x").unwrap();

        let result = file.rename("new.dat").await;
        assert!(matches!(result, Err(Error::WriteError(..))));
        assert_eq!(file.base(), "old.dat");
        assert!(dir.path().join("old.dat").exists());
        assert!(dir.path().join("old.dat.part1").exists());
        assert!(dir.path().join("old.dat.part2").exists());
        assert!(!dir.path().join("new.dat").exists());
        assert!(!dir.path().join("new.dat.part2").exists());

        assert_eq!(file.read(0, 250, Priority::Normal).await?, pattern(250));
        Ok(())
    }

    #[tokio::test]
    async fn test_pending_unlink_aborts_reads() -> Result<()> {
        let dir = tempdir().unwrap();
        let registry = UnlinkRegistry::new();
        let file = PartitionedFile::open(dir.path(), "test.dat", options(100), Arc::clone(&registry), pool(4))?;
        file.write(0, pattern(50), Priority::Normal).await?;

        let path = file.part_path(0);
        registry.mark_pending(&[path.clone()])?;
        assert!(matches!(
            file.read(0, 10, Priority::Normal).await,
            Err(Error::PendingUnlink(p)) if p == path
        ));
        assert_eq!(file.reads_in_flight.load(Ordering::SeqCst), 0);
        // a second unlink of the same name is misuse
        assert!(matches!(file.unlink().await, Err(Error::InvalidOperation(_))));

        registry.clear_pending(&[path]);
        assert_eq!(file.read(0, 10, Priority::Normal).await?, pattern(10));
        Ok(())
    }

    #[tokio::test]
    async fn test_unlink_waits_for_running_reads_and_rejects_double_submission() -> Result<()> {
        let dir = tempdir().unwrap();
        let registry = UnlinkRegistry::new();
        let file = Arc::new(PartitionedFile::open(
            dir.path(),
            "test.dat",
            options(100),
            Arc::clone(&registry),
            pool(4),
        )?);
        file.write(0, pattern(50), Priority::Normal).await?;

        // pretend a read is running
        file.reads_in_flight.fetch_add(1, Ordering::SeqCst);

        let unlinker = {
            let file = Arc::clone(&file);
            tokio::spawn(async move { file.unlink().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.outstanding(), 1);
        assert!(dir.path().join("test.dat").exists());

        assert!(matches!(file.rename("x.dat").await, Err(Error::InvalidOperation(_))));
        assert!(matches!(
            file.write(0, vec![1], Priority::Normal).await,
            Err(Error::InvalidOperation(_))
        ));

        file.reads_in_flight.fetch_sub(1, Ordering::SeqCst);
        unlinker.await.unwrap()?;
        assert!(!dir.path().join("test.dat").exists());
        assert!(registry.wait_idle(Duration::from_secs(1)).await);
        Ok(())
    }

    #[tokio::test]
    async fn test_grace_period_times_out() -> Result<()> {
        let dir = tempdir().unwrap();
        let file = open(dir.path(), "test.dat", 100);
        file.write(0, pattern(50), Priority::Normal).await?;
        file.reads_in_flight.fetch_add(1, Ordering::SeqCst);

        // a read that never finishes does not block the unlink forever
        file.unlink().await?;
        assert!(!dir.path().join("test.dat").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_truncate() -> Result<()> {
        let dir = tempdir().unwrap();
        let file = open(dir.path(), "test.dat", 100);
        file.write(0, pattern(350), Priority::Normal).await?;

        file.truncate(150)?;
        assert_eq!(file.parts(), vec![0, 1]);
        assert_eq!(file.size()?, 150);
        assert!(!dir.path().join("test.dat.part3").exists());

        file.truncate(100)?;
        assert_eq!(file.parts(), vec![0]);
        assert_eq!(file.size()?, 100);
        Ok(())
    }

    #[tokio::test]
    async fn test_close_idle_parts_reopens() -> Result<()> {
        let dir = tempdir().unwrap();
        let file = open(dir.path(), "test.dat", 100);
        file.write(0, pattern(150), Priority::Normal).await?;
        assert_eq!(file.close_idle_parts(), 2);
        assert_eq!(file.read(0, 150, Priority::Normal).await?, pattern(150));
        Ok(())
    }
}
