use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::datafile::DataFile;
use crate::cache::RecordCache;
use crate::collection::Collections;
use crate::file::UnlinkRegistry;
use crate::jobs::JobPool;
use crate::scan::ScanOrchestrator;

/// Shared state of an open database
pub struct DbState {
    /// Data files by id; lower ids are older
    pub files: RwLock<BTreeMap<u32, Arc<DataFile>>>,
    pub next_file_id: AtomicU32,

    pub registry: Arc<UnlinkRegistry>,
    pub pool: Arc<JobPool>,
    pub cache: Arc<RecordCache>,
    pub collections: Collections,
    pub scanner: ScanOrchestrator,
}

impl DbState {
    /// Get next file id atomically
    pub fn next_file_id(&self) -> u32 {
        self.next_file_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Make sure ids at or below `id` are never handed out again
    pub fn reserve_through(&self, id: u32) {
        self.next_file_id.fetch_max(id + 1, Ordering::SeqCst);
    }

    pub fn file(&self, id: u32) -> Option<Arc<DataFile>> {
        self.files.read().get(&id).cloned()
    }

    /// Files ordered oldest to newest
    pub fn files(&self) -> Vec<Arc<DataFile>> {
        self.files.read().values().cloned().collect()
    }

    pub fn total_size(&self) -> u64 {
        self.files.read().values().map(|f| f.logical_size()).sum()
    }
}
