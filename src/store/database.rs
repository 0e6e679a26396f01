use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::datafile::DataFile;
use super::metrics::{self, Metrics};
use super::recovery;
use super::state::DbState;
use super::tasks::{CacheSaveTask, MetricsTask};
use super::CACHE_SUFFIX;
use crate::cache::RecordCache;
use crate::collection::{CollectionId, CollectionResolver, Collections};
use crate::config::Config;
use crate::error::Result;
use crate::flock::FileLock;
use crate::jobs::Priority;
use crate::scan::{ScanRequest, ScanResult, ScanTarget};
use crate::scheduler::Scheduler;
use crate::Error;

const LOCK_FILE: &str = "rdbstore.lock";

/// Longest shutdown waits for unlink and rename workers.
const UNLINK_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// A named set of sorted data files sharing one directory, job pool and
/// record cache.
pub struct Database {
    pub(crate) config: Config,
    lock: Option<FileLock>,
    pub(crate) state: Arc<DbState>,
}

impl Database {
    /// Open database with default configuration
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_config(Config::new(dir)).await
    }

    /// Open database with custom configuration
    pub async fn open_with_config(config: Config) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.dir)?;

        let lock = FileLock::lock(config.dir.join(LOCK_FILE))?;
        let state = Arc::new(recovery::recover_state(&config).await?);

        Ok(Self {
            config,
            lock: Some(lock),
            state,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    pub fn cache(&self) -> &Arc<RecordCache> {
        &self.state.cache
    }

    pub fn collections(&self) -> &Collections {
        &self.state.collections
    }

    /// The id of collection `name`, registering it on first use.
    pub fn collection(&self, name: &str) -> Result<CollectionId> {
        self.state.collections.register(name)
    }

    /// Starts a new, empty data file newer than every existing one.
    pub async fn create_file(&self) -> Result<Arc<DataFile>> {
        let id = self.state.next_file_id();
        let file = DataFile::open(
            id,
            &self.config,
            Arc::clone(&self.state.registry),
            Arc::clone(&self.state.pool),
        )
        .await?;
        if file.file().exists() {
            return Err(Error::InvalidState(format!("data file {} already exists on disk", id)));
        }
        // a previous file with this id may have left ranges behind
        self.state.cache.clear_file(id);
        let file = Arc::new(file);
        self.state.files.write().insert(id, Arc::clone(&file));
        tracing::info!(db = %self.config.name, file = id, "Created data file");
        Ok(file)
    }

    pub fn file(&self, id: u32) -> Option<Arc<DataFile>> {
        self.state.file(id)
    }

    /// Data files ordered oldest to newest.
    pub fn files(&self) -> Vec<Arc<DataFile>> {
        self.state.files()
    }

    /// Scans every data file for `request`.
    pub async fn scan(&self, request: &ScanRequest) -> Result<ScanResult> {
        let targets: Vec<Arc<dyn ScanTarget>> = self
            .files()
            .into_iter()
            .map(|f| f as Arc<dyn ScanTarget>)
            .collect();
        self.state.scanner.scan(&targets, request).await
    }

    /// Scans only the files with the given ids.
    pub async fn scan_files(&self, ids: &[u32], request: &ScanRequest) -> Result<ScanResult> {
        let mut targets: Vec<Arc<dyn ScanTarget>> = Vec::with_capacity(ids.len());
        for id in ids {
            let file = self
                .file(*id)
                .ok_or_else(|| Error::InvalidOperation(format!("no data file {}", id)))?;
            targets.push(file);
        }
        self.state.scanner.scan(&targets, request).await
    }

    /// Removes data file `id` from the database and deletes it from disk.
    pub async fn remove_file(&self, id: u32) -> Result<()> {
        let file = self
            .state
            .files
            .write()
            .remove(&id)
            .ok_or_else(|| Error::InvalidOperation(format!("no data file {}", id)))?;

        if let Err(e) = file.unlink().await {
            self.state.files.write().insert(id, file);
            return Err(e);
        }
        self.state.cache.clear_file(id);
        Ok(())
    }

    /// Gives data file `id` the name of unused id `new_id`.
    pub async fn rename_file(&self, id: u32, new_id: u32) -> Result<()> {
        let file = {
            let files = self.state.files.read();
            if files.contains_key(&new_id) {
                return Err(Error::InvalidOperation(format!("data file {} already exists", new_id)));
            }
            files
                .get(&id)
                .cloned()
                .ok_or_else(|| Error::InvalidOperation(format!("no data file {}", id)))?
        };

        file.rename(new_id).await?;
        {
            let mut files = self.state.files.write();
            files.remove(&id);
            files.insert(new_id, file);
        }
        self.state.reserve_through(new_id);
        self.state.cache.clear_file(id);
        self.state.cache.clear_file(new_id);
        Ok(())
    }

    /// Forgets collection `name` and its cached ranges.
    pub fn drop_collection(&self, name: &str) -> usize {
        match self.state.collections.resolve(name) {
            Some(id) => {
                self.state.collections.remove(name);
                let removed = self.state.cache.clear_collection(id);
                tracing::info!(db = %self.config.name, collection = name, removed, "Dropped collection");
                removed
            }
            None => 0,
        }
    }

    pub fn cache_path(&self) -> PathBuf {
        self.config.dir.join(format!("{}{}", self.config.name, CACHE_SUFFIX))
    }

    /// Writes every changed map.
    pub async fn save_maps(&self) -> Result<()> {
        for file in self.files() {
            file.save_map().await?;
        }
        Ok(())
    }

    /// Writes a snapshot of the record cache.
    pub async fn save_cache(&self) -> Result<()> {
        if !self.state.cache.is_enabled() {
            return Ok(());
        }
        let cache = Arc::clone(&self.state.cache);
        let path = self.cache_path();
        self.state
            .pool
            .run(Priority::Normal, CancellationToken::new(), move || cache.save(&path))
            .await?;
        tracing::info!(db = %self.config.name, entries = self.state.cache.stats().entries, "Saved record cache");
        Ok(())
    }

    pub async fn save(&self) -> Result<()> {
        self.save_maps().await?;
        self.save_cache().await
    }

    pub fn metrics(&self) -> Metrics {
        metrics::snapshot(&self.state)
    }

    /// Collect and log metrics
    pub fn collect_metrics(&self) -> Result<()> {
        metrics::collect_metrics(&self.config.name, &self.state)
    }

    /// Starts the periodic cache save and metrics tasks.
    pub fn start_background_tasks(self: &Arc<Self>) -> Scheduler {
        let scheduler = Scheduler::new();
        scheduler
            .register(Arc::new(CacheSaveTask::new(Arc::clone(self))))
            .register(Arc::new(MetricsTask::new(Arc::clone(self))));
        scheduler
    }

    /// Saves everything and waits for unlink and rename workers to finish.
    pub async fn shutdown(&self) -> Result<()> {
        self.save().await?;
        if !self.state.registry.wait_idle(UNLINK_DRAIN_TIMEOUT).await {
            tracing::warn!(
                db = %self.config.name,
                outstanding = self.state.registry.outstanding(),
                "Unlink workers still running at shutdown"
            );
        }
        tracing::info!(db = %self.config.name, "Database shut down");
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            tracing::debug!(path = %lock.path().display(), "Releasing directory lock");
        }
    }
}
