use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::Result;
use crate::file::{FileOptions, PartitionedFile, UnlinkRegistry};
use crate::jobs::{JobPool, Priority};
use crate::map::{load_or_generate, write_atomic, GenerateOptions, PageIndex};
use crate::record::{RecordFormat, RecordList};
use crate::scan::ScanTarget;
use crate::Error;

pub const DATA_SUFFIX: &str = ".dat";
pub const MAP_SUFFIX: &str = ".map";

pub fn data_file_name(db: &str, id: u32) -> String {
    format!("{}{:04}{}", db, id, DATA_SUFFIX)
}

pub fn map_file_name(db: &str, id: u32) -> String {
    format!("{}{:04}{}", db, id, MAP_SUFFIX)
}

/// Parses the id out of a data file name produced by [`data_file_name`].
pub fn parse_data_file_name(db: &str, name: &str) -> Option<u32> {
    let digits = name.strip_prefix(db)?.strip_suffix(DATA_SUFFIX)?;
    if digits.len() < 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// One sorted data file and its page index.
pub struct DataFile {
    id: AtomicU32,
    db: String,
    format: RecordFormat,
    file: PartitionedFile,
    map: RwLock<PageIndex>,
    map_path: Mutex<PathBuf>,
    pool: Arc<JobPool>,
    append_lock: tokio::sync::Mutex<()>,
}

impl DataFile {
    /// Opens data file `id`, loading its map or rebuilding it from the data.
    pub async fn open(id: u32, config: &Config, registry: Arc<UnlinkRegistry>, pool: Arc<JobPool>) -> Result<Self> {
        let file = PartitionedFile::open(
            &config.dir,
            &data_file_name(&config.name, id),
            FileOptions::from(config),
            registry,
            Arc::clone(&pool),
        )?;
        let map_path = config.dir.join(map_file_name(&config.name, id));
        let map = load_or_generate(&file, &map_path, config.format(), &GenerateOptions::from(config)).await?;

        let data = Self {
            id: AtomicU32::new(id),
            db: config.name.clone(),
            format: config.format(),
            file,
            map: RwLock::new(map),
            map_path: Mutex::new(map_path),
            pool,
            append_lock: tokio::sync::Mutex::new(()),
        };
        if data.map.read().is_dirty() {
            data.save_map().await?;
        }
        tracing::debug!(
            db = %data.db,
            file = id,
            size = data.map.read().logical_size(),
            pages = data.map.read().num_pages(),
            "Opened data file"
        );
        Ok(data)
    }

    pub fn id(&self) -> u32 {
        self.id.load(Ordering::SeqCst)
    }

    pub fn format(&self) -> RecordFormat {
        self.format
    }

    pub fn file(&self) -> &PartitionedFile {
        &self.file
    }

    pub fn page_index(&self) -> &RwLock<PageIndex> {
        &self.map
    }

    pub fn map_path(&self) -> PathBuf {
        self.map_path.lock().clone()
    }

    pub fn logical_size(&self) -> u64 {
        self.map.read().logical_size()
    }

    pub fn record_count(&self) -> u64 {
        self.map.read().record_count()
    }

    /// Appends a sorted list after the current end of the file.
    ///
    /// The list's first key must not sort below the file's last key. The
    /// index is updated before the write and restored if the write fails.
    pub async fn append(&self, list: &RecordList) -> Result<()> {
        if list.format() != self.format {
            return Err(Error::InvalidOperation(format!(
                "list format {:?} does not match file format {:?}",
                list.format(),
                self.format
            )));
        }
        if list.is_empty() {
            return Ok(());
        }

        let _guard = self.append_lock.lock().await;
        let (offset, bytes, before) = {
            let mut map = self.map.write();
            let before = map.clone();
            let offset = map.logical_size();
            match map.add_list(list) {
                Ok(bytes) => (offset, bytes, before),
                Err(e) => {
                    *map = before;
                    return Err(e);
                }
            }
        };

        let len = bytes.len();
        if let Err(e) = self.file.write(offset, bytes, Priority::Normal).await {
            *self.map.write() = before;
            tracing::warn!(db = %self.db, file = self.id(), offset, error = %e, "Append failed, index rolled back");
            return Err(e);
        }
        tracing::debug!(db = %self.db, file = self.id(), offset, len, records = list.len(), "Appended records");
        Ok(())
    }

    /// Writes the map to its side file if it changed since the last save.
    pub async fn save_map(&self) -> Result<()> {
        let (bytes, size) = {
            let map = self.map.read();
            if !map.is_dirty() {
                return Ok(());
            }
            (map.encode()?, map.logical_size())
        };
        let path = self.map_path();
        self.pool
            .run(Priority::Normal, CancellationToken::new(), move || write_atomic(&path, &bytes))
            .await?;

        let mut map = self.map.write();
        // appends that landed during the write keep the map dirty
        if map.logical_size() == size {
            map.mark_clean();
        }
        Ok(())
    }

    /// Removes the lowest part of the data file and forgets the index
    /// segments it covered.
    pub async fn unlink_head_part(&self) -> Result<()> {
        let Some(part) = self.file.first_part() else {
            return Ok(());
        };
        self.file.unlink_part(part).await?;
        {
            let mut map = self.map.write();
            let start = self.file.start_offset();
            let from = map.file_start();
            if start > from {
                let dropped = map.chop_head(start - from);
                tracing::info!(db = %self.db, file = self.id(), part, segments = dropped, "Removed head part");
            }
        }
        self.save_map().await
    }

    /// Deletes the data file and its map.
    pub async fn unlink(&self) -> Result<()> {
        self.file.unlink().await?;
        remove_if_exists(&self.map_path())?;
        tracing::info!(db = %self.db, file = self.id(), "Unlinked data file");
        Ok(())
    }

    /// Renames the data file and its map to those of file `new_id`.
    pub async fn rename(&self, new_id: u32) -> Result<()> {
        let old_id = self.id();
        self.save_map().await?;
        self.file.rename(&data_file_name(&self.db, new_id)).await?;

        let new_map = self.file.dir().join(map_file_name(&self.db, new_id));
        let old_map = self.map_path();
        if old_map.exists() {
            std::fs::rename(&old_map, &new_map).map_err(|e| Error::WriteError("map rename", e))?;
        }
        *self.map_path.lock() = new_map;
        self.id.store(new_id, Ordering::SeqCst);
        tracing::info!(db = %self.db, from = old_id, to = new_id, "Renamed data file");
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::WriteError("map removal", e)),
    }
}

#[async_trait]
impl ScanTarget for DataFile {
    fn file_id(&self) -> u32 {
        self.id()
    }

    fn name(&self) -> String {
        self.file.base()
    }

    fn map(&self) -> &RwLock<PageIndex> {
        &self.map
    }

    async fn read(&self, offset: u64, len: usize, priority: Priority) -> Result<Vec<u8>> {
        self.file.read(offset, len, priority).await
    }
}
