use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use super::datafile::{parse_data_file_name, DataFile};
use super::state::DbState;
use super::CACHE_SUFFIX;
use crate::cache::RecordCache;
use crate::collection::Collections;
use crate::config::Config;
use crate::error::Result;
use crate::file::UnlinkRegistry;
use crate::jobs::JobPool;
use crate::scan::ScanOrchestrator;
use crate::Error;

/// Ids of the data files in `dir`, including headless ones whose first
/// remaining part is not part zero.
pub fn discover_file_ids(dir: &Path, db: &str) -> Result<BTreeSet<u32>> {
    let mut ids = BTreeSet::new();
    for entry in fs::read_dir(dir).map_err(|e| Error::ReadError("database directory", e))? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let base = match name.rfind(".part") {
            Some(at) if name[at + 5..].bytes().all(|b| b.is_ascii_digit()) && name.len() > at + 5 => &name[..at],
            _ => name,
        };
        if let Some(id) = parse_data_file_name(db, base) {
            ids.insert(id);
        }
    }
    Ok(ids)
}

/// Deletes temporary side files left by a crash mid-save.
fn remove_stale_temporaries(dir: &Path, db: &str) -> Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir).map_err(|e| Error::ReadError("database directory", e))? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.starts_with(db) && name.ends_with(".tmp") {
            fs::remove_file(entry.path()).map_err(|e| Error::WriteError("stale temporary file", e))?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Rebuilds database state from the files in the directory.
pub async fn recover_state(config: &Config) -> Result<DbState> {
    let removed = remove_stale_temporaries(&config.dir, &config.name)?;
    if removed > 0 {
        tracing::warn!(db = %config.name, removed, "Removed temporary files left by an interrupted save");
    }

    let registry = UnlinkRegistry::new();
    let pool = Arc::new(JobPool::new(&config.jobs));

    let cache = Arc::new(RecordCache::new(&config.cache));
    let cache_path = config.dir.join(format!("{}{}", config.name, CACHE_SUFFIX));
    match cache.load(&cache_path) {
        Ok(0) => {}
        Ok(entries) => tracing::info!(db = %config.name, entries, "Loaded record cache"),
        Err(e) => tracing::warn!(db = %config.name, error = %e, "Ignoring unreadable cache file"),
    }

    let mut files = BTreeMap::new();
    let ids = discover_file_ids(&config.dir, &config.name)?;
    for id in &ids {
        let file = DataFile::open(*id, config, Arc::clone(&registry), Arc::clone(&pool)).await?;
        files.insert(*id, Arc::new(file));
    }
    let next_file_id = ids.last().map_or(1, |id| id + 1);

    let scanner = ScanOrchestrator::new(
        config.name.clone(),
        config.format(),
        config.scan.clone(),
        Some(Arc::clone(&cache)),
    );

    tracing::info!(db = %config.name, files = files.len(), next_file_id, "Recovered database state");
    Ok(DbState {
        files: parking_lot::RwLock::new(files),
        next_file_id: AtomicU32::new(next_file_id),
        registry,
        pool,
        cache,
        collections: Collections::new(),
        scanner,
    })
}
