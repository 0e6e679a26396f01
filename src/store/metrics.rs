use super::DbState;
use crate::cache::CacheStats;
use crate::error::Result;
use crate::jobs::PoolSnapshot;

/// A point-in-time view of database activity.
#[derive(Debug, Clone)]
pub struct Metrics {
    pub files: usize,
    pub total_size: u64,
    pub records: u64,
    pub pooled_ops: u64,
    pub inline_ops: u64,
    pub pending_unlinks: usize,
    pub unlink_workers: usize,
    pub cache: CacheStats,
    pub pool: PoolSnapshot,
}

pub fn snapshot(state: &DbState) -> Metrics {
    let files = state.files();
    let (pooled_ops, inline_ops) = files.iter().fold((0, 0), |(pooled, inline), f| {
        let stats = f.file().stats();
        (pooled + stats.pooled_ops, inline + stats.inline_ops)
    });
    Metrics {
        files: files.len(),
        total_size: files.iter().map(|f| f.logical_size()).sum(),
        records: files.iter().map(|f| f.record_count()).sum(),
        pooled_ops,
        inline_ops,
        pending_unlinks: state.registry.pending_count(),
        unlink_workers: state.registry.outstanding(),
        cache: state.cache.stats(),
        pool: state.pool.snapshot(),
    }
}

/// Collect metrics from database state and log them
pub fn collect_metrics(db: &str, state: &DbState) -> Result<()> {
    let m = snapshot(state);
    let hit_rate = if m.cache.hits + m.cache.misses == 0 {
        0.0
    } else {
        m.cache.hits as f64 / (m.cache.hits + m.cache.misses) as f64
    };

    tracing::info!(
        db = %db,
        files = m.files,
        total_size = m.total_size,
        records = m.records,
        pooled_ops = m.pooled_ops,
        inline_ops = m.inline_ops,
        pending_unlinks = m.pending_unlinks,
        unlink_workers = m.unlink_workers,
        cache_entries = m.cache.entries,
        cache_bytes = m.cache.bytes_occupied,
        cache_hit_rate = hit_rate,
        cache_evictions = m.cache.evictions,
        cache_promotions = m.cache.promotions,
        jobs_submitted = m.pool.submitted,
        jobs_rejected = m.pool.rejected,
        jobs_available = m.pool.available,
        "Database metrics"
    );

    Ok(())
}
