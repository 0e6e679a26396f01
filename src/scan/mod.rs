//! Range scans across the data files of a database.
//!
//! A scan reads every record with a key in `[start, end]` from each file,
//! oldest file first. When the caller only needs a minimum amount of data the
//! end key is pulled in as far as the page indexes allow while still covering
//! at least that many bytes. The pulled-in key only bounds which pages are
//! read; records are still cut at the requested range, and the result reports
//! the key the reads were planned against.
//!
//! Each attempt moves through
//!
//! ```text
//! Init -> PageRangeComputed -> ScansSubmitted -> ScansCompleting -> Done
//!                                                       |
//!                                                       +-> Retry -> Init
//! ```
//!
//! and a failed attempt is classified by [`RetryPolicy`]: transient I/O
//! errors back off and try again, corruption and misuse end the scan.

mod retry;

pub use retry::{RetryPolicy, Verdict};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use itertools::Itertools;
use parking_lot::RwLock;
use tokio::task::JoinSet;

use crate::cache::{range_key, RecordCache};
use crate::collection::CollectionId;
use crate::config::ScanConfig;
use crate::error::Result;
use crate::jobs::{Priority, Tally};
use crate::key::Key;
use crate::map::PageIndex;
use crate::record::{RecordFormat, RecordList};
use crate::Error;

/// A sorted data file a scan can read from.
#[async_trait]
pub trait ScanTarget: Send + Sync {
    /// Identity of the file; scans visit files in increasing id order and
    /// cache their reads under it.
    fn file_id(&self) -> u32;

    fn name(&self) -> String;

    fn map(&self) -> &RwLock<PageIndex>;

    async fn read(&self, offset: u64, len: usize, priority: Priority) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Init,
    PageRangeComputed,
    ScansSubmitted,
    ScansCompleting,
    Retry,
    Done,
}

impl ScanState {
    fn can_move_to(self, next: ScanState) -> bool {
        use ScanState::*;
        matches!(
            (self, next),
            (Init, PageRangeComputed)
                | (PageRangeComputed, ScansSubmitted)
                | (ScansSubmitted, ScansCompleting)
                | (ScansCompleting, Retry)
                | (ScansCompleting, Done)
                | (PageRangeComputed, Retry)
                | (Retry, Init)
        )
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What to scan and how hard to try.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub collection: CollectionId,
    pub start: Key,
    pub end: Key,
    /// Stop early once this many bytes are covered (default: read the whole range)
    pub min_bytes: Option<u64>,
    pub priority: Priority,
    /// Retries after running out of memory or buffer space (default: 0)
    pub max_retries: u32,
    pub use_cache: bool,
    /// Cache hits older than this many seconds are ignored (default: any age)
    pub max_cache_age: Option<u32>,
}

impl ScanRequest {
    pub fn new(collection: CollectionId, start: Key, end: Key) -> Self {
        Self {
            collection,
            start,
            end,
            min_bytes: None,
            priority: Priority::Normal,
            max_retries: 0,
            use_cache: true,
            max_cache_age: None,
        }
    }

    pub fn min_bytes(mut self, bytes: u64) -> Self {
        self.min_bytes = Some(bytes);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn use_cache(mut self, enabled: bool) -> Self {
        self.use_cache = enabled;
        self
    }

    pub fn max_cache_age(mut self, secs: u32) -> Self {
        self.max_cache_age = Some(secs);
        self
    }
}

/// Records found by a scan, one list per file in file id order.
#[derive(Debug, Clone)]
pub struct ScanResult {
    pub format: RecordFormat,
    pub file_ids: Vec<u32>,
    pub lists: Vec<RecordList>,
    /// The end key the page ranges were planned against; at most the
    /// requested one. Lists may hold records past it, never past the
    /// requested end.
    pub end_key: Key,
    pub attempts: u32,
    pub cache_hits: usize,
    pub bytes_read: u64,
}

impl ScanResult {
    /// Merges the per-file lists, newest file winning.
    pub fn merged(&self, remove_negatives: bool) -> RecordList {
        RecordList::merge(self.format, self.lists.clone(), remove_negatives)
    }

    pub fn record_count(&self) -> usize {
        self.lists.iter().map(RecordList::len).sum()
    }
}

/// Where one file's part of an attempt is read from.
#[derive(Clone)]
struct FilePlan {
    target: Arc<dyn ScanTarget>,
    from: u64,
    to: u64,
    seed: Option<Key>,
}

struct FileOutcome {
    slot: usize,
    list: RecordList,
    cache_hit: bool,
    bytes: u64,
}

struct ScanFailure {
    file: String,
    offset: u64,
    error: Error,
}

/// Settings shared by the per-file reads of one attempt.
struct AttemptContext {
    db_name: String,
    format: RecordFormat,
    collection: CollectionId,
    start: Key,
    end: Key,
    priority: Priority,
    use_cache: bool,
    max_cache_age: Option<u32>,
    validate_cache: bool,
    max_read_size: u64,
    cache: Option<Arc<RecordCache>>,
}

pub struct ScanOrchestrator {
    db_name: String,
    format: RecordFormat,
    config: ScanConfig,
    cache: Option<Arc<RecordCache>>,
}

impl ScanOrchestrator {
    pub fn new(
        db_name: impl Into<String>,
        format: RecordFormat,
        config: ScanConfig,
        cache: Option<Arc<RecordCache>>,
    ) -> Self {
        Self {
            db_name: db_name.into(),
            format,
            config,
            cache,
        }
    }

    /// Scans `targets` for `request`, retrying failed attempts as the error
    /// allows. The targets may come in any order.
    pub async fn scan(&self, targets: &[Arc<dyn ScanTarget>], request: &ScanRequest) -> Result<ScanResult> {
        request.start.check_width(self.format.key_size)?;
        request.end.check_width(self.format.key_size)?;
        if request.start > request.end {
            return Err(Error::InvalidOperation(format!(
                "scan start {} is past its end {}",
                request.start, request.end
            )));
        }

        let mut targets: Vec<Arc<dyn ScanTarget>> = targets.to_vec();
        targets.sort_by_key(|t| t.file_id());
        if let Some((a, _)) = targets.iter().tuple_windows().find(|(a, b)| a.file_id() == b.file_id()) {
            return Err(Error::InvalidOperation(format!(
                "file {} appears twice in one scan",
                a.file_id()
            )));
        }

        let mut policy = RetryPolicy::new(&self.config, request.priority, request.max_retries);
        let mut state = ScanState::Init;
        let mut attempts = 0;
        loop {
            attempts += 1;
            let end_key = self.shrink_end_key(&targets, request);
            let plans = self.plan(&targets, &request.start, &end_key);
            self.transition(&mut state, ScanState::PageRangeComputed, attempts)?;

            let outcome = match plans {
                Ok(plans) => {
                    let ctx = Arc::new(self.attempt_context(request));
                    let (set, tally) = submit(ctx, plans);
                    self.transition(&mut state, ScanState::ScansSubmitted, attempts)?;
                    self.transition(&mut state, ScanState::ScansCompleting, attempts)?;
                    complete(set, &tally).await
                }
                Err(failure) => Err(failure),
            };

            let failure = match outcome {
                Ok(outcomes) => {
                    self.transition(&mut state, ScanState::Done, attempts)?;
                    return Ok(self.finish(&targets, outcomes, end_key, attempts));
                }
                Err(failure) => failure,
            };

            match policy.classify(failure.error) {
                Verdict::Retry(delay) => {
                    tracing::debug!(
                        db = %self.db_name,
                        file = %failure.file,
                        offset = failure.offset,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying scan"
                    );
                    self.transition(&mut state, ScanState::Retry, attempts)?;
                    tokio::time::sleep(delay).await;
                    self.transition(&mut state, ScanState::Init, attempts)?;
                }
                Verdict::Fail(error) => {
                    if error.is_corruption() {
                        tracing::error!(
                            db = %self.db_name,
                            file = %failure.file,
                            offset = failure.offset,
                            error = %error,
                            "Scan hit corrupt data"
                        );
                    } else {
                        tracing::debug!(
                            db = %self.db_name,
                            file = %failure.file,
                            attempt = attempts,
                            error = %error,
                            "Scan failed"
                        );
                    }
                    return Err(error);
                }
            }
        }
    }

    fn transition(&self, state: &mut ScanState, next: ScanState, attempt: u32) -> Result<()> {
        if !state.can_move_to(next) {
            return Err(Error::InvalidState(format!("scan cannot move from {} to {}", state, next)));
        }
        tracing::debug!(db = %self.db_name, from = %state, to = %next, attempt, "Scan state");
        *state = next;
        Ok(())
    }

    fn attempt_context(&self, request: &ScanRequest) -> AttemptContext {
        AttemptContext {
            db_name: self.db_name.clone(),
            format: self.format,
            collection: request.collection,
            start: request.start.clone(),
            end: request.end.clone(),
            priority: request.priority,
            use_cache: request.use_cache,
            max_cache_age: request.max_cache_age,
            validate_cache: self.config.validate_cache,
            max_read_size: self.config.max_read_size,
            cache: self.cache.clone(),
        }
    }

    /// Smallest end key, no further than the requested one, at which the
    /// pages wholly inside the range add up to `min_bytes`. Tombstone-led
    /// pages count against the total since their records cancel out.
    fn shrink_end_key(&self, targets: &[Arc<dyn ScanTarget>], request: &ScanRequest) -> Key {
        let Some(min_bytes) = request.min_bytes else {
            return request.end.clone();
        };
        let start = &request.start;
        let estimate = |end: &Key| -> u64 {
            targets
                .iter()
                .map(|t| {
                    let map = t.map().read();
                    let (sp, ep) = map.page_range(start, end);
                    map.min_rec_sizes(sp, ep, start, end, true)
                })
                .sum()
        };
        if estimate(&request.end) < min_bytes {
            return request.end.clone();
        }

        // the same key may bound pages in several files
        let candidates: Vec<Key> = targets
            .iter()
            .map(|t| t.map().read().boundary_keys(start, &request.end))
            .kmerge()
            .dedup()
            .collect();
        let first = candidates.partition_point(|k| estimate(k) < min_bytes);
        match candidates.get(first) {
            Some(key) => key.clone(),
            None => request.end.clone(),
        }
    }

    fn plan(
        &self,
        targets: &[Arc<dyn ScanTarget>],
        start: &Key,
        end: &Key,
    ) -> std::result::Result<Vec<FilePlan>, ScanFailure> {
        targets
            .iter()
            .map(|target| {
                let map = target.map().read();
                let (sp, ep) = map.page_range(start, end);
                let (from, to) = map.byte_range(sp, ep);
                if to - from > self.config.max_read_size {
                    return Err(ScanFailure {
                        file: target.name(),
                        offset: from,
                        error: Error::Corrupt(format!(
                            "pages {}..{} span {} bytes, more than the {} a scan may read",
                            sp,
                            ep,
                            to - from,
                            self.config.max_read_size
                        )),
                    });
                }
                Ok(FilePlan {
                    target: Arc::clone(target),
                    from,
                    to,
                    seed: map.seed_key(sp),
                })
            })
            .collect()
    }

    fn finish(&self, targets: &[Arc<dyn ScanTarget>], mut outcomes: Vec<FileOutcome>, end_key: Key, attempts: u32) -> ScanResult {
        outcomes.sort_by_key(|o| o.slot);
        let cache_hits = outcomes.iter().filter(|o| o.cache_hit).count();
        let bytes_read = outcomes.iter().map(|o| o.bytes).sum();
        ScanResult {
            format: self.format,
            file_ids: targets.iter().map(|t| t.file_id()).collect(),
            lists: outcomes.into_iter().map(|o| o.list).collect(),
            end_key,
            attempts,
            cache_hits,
            bytes_read,
        }
    }
}

type FileTask = std::result::Result<FileOutcome, ScanFailure>;

/// Starts reading every planned file concurrently.
fn submit(ctx: Arc<AttemptContext>, plans: Vec<FilePlan>) -> (JoinSet<FileTask>, Arc<Tally>) {
    let tally = Arc::new(Tally::new());
    let mut set = JoinSet::new();
    for (slot, plan) in plans.into_iter().enumerate() {
        tally.submit();
        let ctx = Arc::clone(&ctx);
        let tally = Arc::clone(&tally);
        set.spawn(async move {
            let result = scan_file(&ctx, slot, plan).await;
            tally.complete();
            result
        });
    }
    tally.seal();
    (set, tally)
}

/// Collects the reads of one attempt. The first failure abandons the rest.
async fn complete(mut set: JoinSet<FileTask>, tally: &Tally) -> std::result::Result<Vec<FileOutcome>, ScanFailure> {
    let mut outcomes = Vec::new();
    while let Some(joined) = set.join_next().await {
        let result = joined.map_err(|e| ScanFailure {
            file: String::new(),
            offset: 0,
            error: Error::InvalidState(format!("scan task failed: {}", e)),
        })?;
        match result {
            Ok(outcome) => outcomes.push(outcome),
            Err(failure) => {
                set.abort_all();
                return Err(failure);
            }
        }
    }
    debug_assert!(tally.is_done());
    Ok(outcomes)
}

async fn scan_file(ctx: &AttemptContext, slot: usize, plan: FilePlan) -> std::result::Result<FileOutcome, ScanFailure> {
    let file = plan.target.name();
    let fail = |error: Error| ScanFailure {
        file: file.clone(),
        offset: plan.from,
        error,
    };

    let len = (plan.to - plan.from) as usize;
    if len == 0 {
        return Ok(FileOutcome {
            slot,
            list: RecordList::new(ctx.format),
            cache_hit: false,
            bytes: 0,
        });
    }

    let key = range_key(plan.target.file_id(), plan.from, len as u32);
    let cached = match (&ctx.cache, ctx.use_cache) {
        (Some(cache), true) => cache.get(ctx.collection, &key, ctx.max_cache_age, true),
        _ => None,
    };

    let (bytes, cache_hit) = match cached {
        Some(bytes) if ctx.validate_cache => {
            let disk = plan
                .target
                .read(plan.from, len, ctx.priority)
                .await
                .map_err(fail)?;
            if disk != bytes {
                tracing::error!(
                    db = %ctx.db_name,
                    file = %file,
                    offset = plan.from,
                    len,
                    "Cached range differs from disk, replacing it"
                );
                if let Some(cache) = &ctx.cache {
                    if cache.put(ctx.collection, &key, crate::cache::now_secs(), &disk).is_err() {
                        cache.remove(ctx.collection, &key);
                    }
                }
                (disk, false)
            } else {
                (bytes, true)
            }
        }
        Some(bytes) => (bytes, true),
        None => {
            let bytes = plan
                .target
                .read(plan.from, len, ctx.priority)
                .await
                .map_err(fail)?;
            if let (Some(cache), true) = (&ctx.cache, ctx.use_cache) {
                if let Err(e) = cache.put(ctx.collection, &key, crate::cache::now_secs(), &bytes) {
                    tracing::debug!(file = %file, offset = plan.from, error = %e, "Range not cached");
                }
            }
            (bytes, false)
        }
    };

    let mut list = RecordList::decode(ctx.format, &bytes, plan.seed.as_ref()).map_err(fail)?;
    list.constrain(&ctx.start, &ctx.end);
    Ok(FileOutcome {
        slot,
        list,
        cache_hit,
        bytes: len as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::record::{DataSize, Record};
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};

    const C: CollectionId = CollectionId(0);

    /// A data file held in memory; the first `failures` reads fail.
    struct MemoryTarget {
        id: u32,
        bytes: Vec<u8>,
        map: RwLock<PageIndex>,
        failures: AtomicU32,
        reads: AtomicU32,
    }

    impl MemoryTarget {
        fn new(id: u32, format: RecordFormat, page_size: usize, keys: impl IntoIterator<Item = Key>) -> Self {
            let records = keys.into_iter().map(|k| Record::new(k, Vec::new())).collect();
            let list = RecordList::from_records(format, records).unwrap();
            let mut map = PageIndex::new(format.key_size, page_size, 16);
            let bytes = map.add_list(&list).unwrap();
            Self {
                id,
                bytes,
                map: RwLock::new(map),
                failures: AtomicU32::new(0),
                reads: AtomicU32::new(0),
            }
        }

        fn failing(self, failures: u32) -> Self {
            self.failures.store(failures, Ordering::SeqCst);
            self
        }
    }

    #[async_trait]
    impl ScanTarget for MemoryTarget {
        fn file_id(&self) -> u32 {
            self.id
        }

        fn name(&self) -> String {
            format!("mem{:04}", self.id)
        }

        fn map(&self) -> &RwLock<PageIndex> {
            &self.map
        }

        async fn read(&self, offset: u64, len: usize, _priority: Priority) -> Result<Vec<u8>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(Error::ReadError("memory target", io::Error::new(io::ErrorKind::Other, "flaky")));
            }
            let start = offset as usize;
            Ok(self.bytes[start..start + len].to_vec())
        }
    }

    fn format() -> RecordFormat {
        RecordFormat::new(10, DataSize::Fixed(0))
    }

    fn key(v: u64) -> Key {
        Key::from_u64(10, v)
    }

    fn orchestrator(cache: Option<Arc<RecordCache>>) -> ScanOrchestrator {
        ScanOrchestrator::new("test", format(), ScanConfig::default(), cache)
    }

    #[tokio::test]
    async fn test_full_range_reads_everything() -> Result<()> {
        let target: Arc<dyn ScanTarget> =
            Arc::new(MemoryTarget::new(1, format(), 256, (0..1000u64).map(|i| key(i * 2 + 1))));
        let request = ScanRequest::new(C, key(101), key(201));
        let result = orchestrator(None).scan(&[target], &request).await?;
        assert_eq!(result.attempts, 1);
        assert_eq!(result.end_key, key(201));
        let keys: Vec<Key> = result.lists[0].iter().map(|r| r.key.clone()).collect();
        assert_eq!(keys, (50..=100u64).map(|i| key(i * 2 + 1)).collect::<Vec<_>>());
        Ok(())
    }

    #[tokio::test]
    async fn test_min_bytes_shrinks_end_key() -> Result<()> {
        let target: Arc<dyn ScanTarget> =
            Arc::new(MemoryTarget::new(1, format(), 256, (0..10_000u64).map(|i| key(i * 2 + 1))));
        let request = ScanRequest::new(C, key(0), Key::max(10)).min_bytes(1000);
        let result = orchestrator(None).scan(&[target], &request).await?;

        assert!(result.end_key < request.end);
        assert_eq!(request.end, Key::max(10));
        assert!(result.record_count() >= 100, "only {} records", result.record_count());
        assert!(result.record_count() < 10_000);
        assert!(result.lists[0].last_key().is_some_and(|k| *k <= request.end));
        Ok(())
    }

    #[tokio::test]
    async fn test_records_past_shrunk_end_are_kept() -> Result<()> {
        let target: Arc<dyn ScanTarget> =
            Arc::new(MemoryTarget::new(1, format(), 256, (0..1000u64).map(|i| key(i * 2 + 1))));
        let request = ScanRequest::new(C, key(0), key(1001)).min_bytes(300);
        let result = orchestrator(None).scan(&[target], &request).await?;

        assert!(result.end_key < key(1001));
        let list = &result.lists[0];
        // the page holding the shrunk end key is read whole
        assert!(list.iter().any(|r| r.key > result.end_key));
        assert!(list.iter().all(|r| r.key <= key(1001)));
        assert!(list.len() < 501);
        Ok(())
    }

    #[tokio::test]
    async fn test_files_merge_newest_wins() -> Result<()> {
        let old: Arc<dyn ScanTarget> = Arc::new(MemoryTarget::new(1, format(), 128, (0..100u64).map(|i| key(i * 2 + 1))));
        // the newer file deletes every record divisible by 10
        let new: Arc<dyn ScanTarget> = Arc::new(MemoryTarget::new(2, format(), 128, (0..10u64).map(|i| key(i * 20 + 1).negative())));
        let request = ScanRequest::new(C, key(0), Key::max(10));
        let result = orchestrator(None).scan(&[new, old], &request).await?;

        assert_eq!(result.file_ids, vec![1, 2]);
        let merged = result.merged(true);
        assert_eq!(merged.len(), 90);
        assert!(merged.iter().all(|r| r.key.is_positive()));
        assert_eq!(result.merged(false).len(), 100);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_retried_once() -> Result<()> {
        let memory = Arc::new(MemoryTarget::new(1, format(), 256, (0..100u64).map(|i| key(i * 2 + 1))).failing(1));
        let target: Arc<dyn ScanTarget> = memory.clone();
        let request = ScanRequest::new(C, key(0), Key::max(10));

        let started = tokio::time::Instant::now();
        let result = orchestrator(None).scan(&[target], &request).await?;
        assert_eq!(result.attempts, 2);
        assert_eq!(result.record_count(), 100);
        assert_eq!(memory.reads.load(Ordering::SeqCst), 2);
        let waited = started.elapsed();
        assert!(waited >= std::time::Duration::from_millis(10) && waited < std::time::Duration::from_millis(20));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_urgent_scan_gives_up() {
        let target: Arc<dyn ScanTarget> =
            Arc::new(MemoryTarget::new(1, format(), 256, (0..100u64).map(|i| key(i * 2 + 1))).failing(10));
        let request = ScanRequest::new(C, key(0), Key::max(10)).priority(Priority::Urgent);
        let result = orchestrator(None).scan(&[target], &request).await;
        assert!(matches!(result, Err(Error::ReadError(..))));
    }

    #[tokio::test]
    async fn test_second_scan_hits_cache() -> Result<()> {
        let cache = Arc::new(RecordCache::new(&CacheConfig::default().max_mem(1 << 20).buffer_size(1 << 16)));
        let memory = Arc::new(MemoryTarget::new(1, format(), 256, (0..500u64).map(|i| key(i * 2 + 1))));
        let target: Arc<dyn ScanTarget> = memory.clone();
        let orchestrator = orchestrator(Some(Arc::clone(&cache)));
        let request = ScanRequest::new(C, key(100), key(300));

        let first = orchestrator.scan(&[Arc::clone(&target)], &request).await?;
        assert_eq!(first.cache_hits, 0);
        let second = orchestrator.scan(&[Arc::clone(&target)], &request).await?;
        assert_eq!(second.cache_hits, 1);
        assert_eq!(second.lists, first.lists);
        assert_eq!(memory.reads.load(Ordering::SeqCst), 1);

        let uncached = orchestrator.scan(&[target], &request.clone().use_cache(false)).await?;
        assert_eq!(uncached.cache_hits, 0);
        assert_eq!(memory.reads.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_validation_replaces_stale_cache_entry() -> Result<()> {
        let cache = Arc::new(RecordCache::new(&CacheConfig::default().max_mem(1 << 20).buffer_size(1 << 16)));
        let target: Arc<dyn ScanTarget> =
            Arc::new(MemoryTarget::new(7, format(), 256, (0..50u64).map(|i| key(i * 2 + 1))));
        let request = ScanRequest::new(C, key(0), Key::max(10));
        let (from, to) = {
            let map = target.map().read();
            let (sp, ep) = map.page_range(&request.start, &request.end);
            map.byte_range(sp, ep)
        };
        let cache_key = range_key(7, from, (to - from) as u32);
        cache.put(C, &cache_key, 0, &vec![0u8; (to - from) as usize])?;

        let config = ScanConfig::default().validate_cache(true);
        let orchestrator = ScanOrchestrator::new("test", format(), config, Some(Arc::clone(&cache)));
        let result = orchestrator.scan(&[Arc::clone(&target)], &request).await?;
        assert_eq!(result.cache_hits, 0);
        assert_eq!(result.record_count(), 50);

        let disk = target.read(from, (to - from) as usize, Priority::Normal).await?;
        assert_eq!(cache.get(C, &cache_key, None, false), Some(disk));
        let again = orchestrator.scan(&[target], &request).await?;
        assert_eq!(again.cache_hits, 1);
        assert_eq!(again.lists, result.lists);
        Ok(())
    }

    #[tokio::test]
    async fn test_misuse_rejected() {
        let a: Arc<dyn ScanTarget> = Arc::new(MemoryTarget::new(1, format(), 256, (0..10u64).map(key)));
        let b: Arc<dyn ScanTarget> = Arc::new(MemoryTarget::new(1, format(), 256, (0..10u64).map(key)));
        let orchestrator = orchestrator(None);

        let backwards = ScanRequest::new(C, key(9), key(1));
        assert!(matches!(
            orchestrator.scan(&[Arc::clone(&a)], &backwards).await,
            Err(Error::InvalidOperation(_))
        ));
        let twice = ScanRequest::new(C, key(0), key(9));
        assert!(matches!(orchestrator.scan(&[a, b], &twice).await, Err(Error::InvalidOperation(_))));
    }

    #[tokio::test]
    async fn test_oversized_range_is_corrupt() {
        let target: Arc<dyn ScanTarget> =
            Arc::new(MemoryTarget::new(1, format(), 256, (0..1000u64).map(|i| key(i * 2 + 1))));
        let config = ScanConfig::default().max_read_size(1000);
        let orchestrator = ScanOrchestrator::new("test", format(), config, None);
        let request = ScanRequest::new(C, key(0), Key::max(10));
        assert!(matches!(orchestrator.scan(&[target], &request).await, Err(Error::Corrupt(_))));
    }
}
