use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;
use crate::record::{DataSize, RecordFormat};
use crate::Error;

/// Largest page size a 16-bit relative offset can address.
pub const MAX_PAGE_SIZE: usize = 32 * 1024;

/// Most ring buffers a record cache may be split into.
pub const MAX_CACHE_BUFFERS: usize = 32;

/// Configuration for one database (a named set of data files).
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the data, map and cache files
    pub dir: PathBuf,

    /// Database name, used as the file name prefix and in logs
    pub name: String,

    /// Width of every key in bytes (default: 16)
    pub key_size: usize,

    /// Size of the payload following each key (default: variable)
    pub data_size: DataSize,

    /// Store keys in 6/12-byte compressed form when they share a prefix
    /// with the previous key (default: false)
    pub half_keys: bool,

    /// Maximum bytes per physical part (default: 1GB)
    pub part_size: u64,

    /// Bytes per index page (default: 16KB)
    pub page_size: usize,

    /// Pages per index segment (default: 2048)
    pub pages_per_segment: usize,

    /// Largest trailing garbage tail that map regeneration may cut off (default: 20MB)
    pub max_truncate_bytes: u64,

    /// Largest payload a variable-size record may declare (default: 64MB)
    pub max_record_size: usize,

    /// How long unlink/rename waits for running reads to drain (default: 2s)
    pub unlink_grace: Duration,

    /// Poll interval while waiting for running reads (default: 10ms)
    pub unlink_poll: Duration,

    pub cache: CacheConfig,
    pub scan: ScanConfig,
    pub jobs: JobConfig,
    pub scheduler: SchedulerConfig,
}

/// Configuration for the record cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Total bytes across all ring buffers; 0 disables the cache (default: 32MB)
    pub max_mem: usize,

    /// Bytes per ring buffer; the buffer count is max_mem / buffer_size,
    /// at most 32 (default: 4MB)
    pub buffer_size: usize,

    /// Maximum number of live entries (default: 65536)
    pub max_recs: usize,

    /// Width of cache keys (default: 16)
    pub key_size: usize,

    /// Payload size for every entry (default: variable)
    pub data_size: DataSize,
}

/// Retry and validation policy for range scans.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Backoff before the first retry (default: 10ms)
    pub base_backoff: Duration,

    /// Backoff ceiling (default: 2s)
    pub max_backoff: Duration,

    /// I/O retries for normal priority scans (default: effectively unbounded)
    pub max_io_retries: u32,

    /// I/O retries for urgent scans (default: 2)
    pub urgent_max_retries: u32,

    /// Consecutive I/O failures after which a region is treated as corrupt (default: 10)
    pub corrupt_after_io_errors: u32,

    /// Largest byte range a single file scan may request (default: 512MB)
    pub max_read_size: u64,

    /// Re-read cache hits from disk and compare (default: false)
    pub validate_cache: bool,
}

/// Configuration for the I/O job pool.
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Jobs queued or running at once (default: 64)
    pub max_jobs: usize,

    /// Slots only urgent jobs may take (default: 8)
    pub urgent_reserve: usize,
}

/// Intervals for background tasks.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the record cache is saved (default: 300s)
    pub cache_save_interval: Duration,

    /// How often metrics are logged (default: 60s)
    pub metrics_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_mem: 32 * 1024 * 1024,
            buffer_size: 4 * 1024 * 1024,
            max_recs: 64 * 1024,
            key_size: 16,
            data_size: DataSize::Variable,
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(2),
            max_io_retries: u32::MAX,
            urgent_max_retries: 2,
            corrupt_after_io_errors: 10,
            max_read_size: 512 * 1024 * 1024,
            validate_cache: false,
        }
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            max_jobs: 64,
            urgent_reserve: 8,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cache_save_interval: Duration::from_secs(300),
            metrics_interval: Duration::from_secs(60),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./rdb"),
            name: "rdb".to_string(),
            key_size: 16,
            data_size: DataSize::Variable,
            half_keys: false,
            part_size: 1024 * 1024 * 1024, // 1GB
            page_size: 16 * 1024,           // 16KB
            pages_per_segment: 2048,
            max_truncate_bytes: 20 * 1024 * 1024, // 20MB
            max_record_size: 64 * 1024 * 1024,    // 64MB
            unlink_grace: Duration::from_secs(2),
            unlink_poll: Duration::from_millis(10),
            cache: CacheConfig::default(),
            scan: ScanConfig::default(),
            jobs: JobConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Config {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the database name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the key width
    pub fn key_size(mut self, size: usize) -> Self {
        self.key_size = size;
        self
    }

    /// Set the payload size
    pub fn data_size(mut self, size: DataSize) -> Self {
        self.data_size = size;
        self
    }

    /// Enable key compression
    pub fn half_keys(mut self, enabled: bool) -> Self {
        self.half_keys = enabled;
        self
    }

    /// Set the maximum part size
    pub fn part_size(mut self, size: u64) -> Self {
        self.part_size = size;
        self
    }

    /// Set the index page size
    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    /// Set the pages per index segment
    pub fn pages_per_segment(mut self, pages: usize) -> Self {
        self.pages_per_segment = pages;
        self
    }

    /// Set the garbage-tail truncation ceiling
    pub fn max_truncate_bytes(mut self, bytes: u64) -> Self {
        self.max_truncate_bytes = bytes;
        self
    }

    /// Set the unlink grace period
    pub fn unlink_grace(mut self, grace: Duration) -> Self {
        self.unlink_grace = grace;
        self
    }

    /// Configure the record cache
    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.cache = config;
        self
    }

    /// Configure scan retries
    pub fn scan(mut self, config: ScanConfig) -> Self {
        self.scan = config;
        self
    }

    /// Configure the job pool
    pub fn jobs(mut self, config: JobConfig) -> Self {
        self.jobs = config;
        self
    }

    /// Configure background task intervals
    pub fn scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }

    /// The record layout described by this config.
    pub fn format(&self) -> RecordFormat {
        RecordFormat {
            key_size: self.key_size,
            data_size: self.data_size,
            half_keys: self.half_keys,
            max_record_size: self.max_record_size,
        }
    }

    /// Bytes covered by one index segment.
    pub fn segment_bytes(&self) -> u64 {
        self.page_size as u64 * self.pages_per_segment as u64
    }

    pub fn validate(&self) -> Result<()> {
        self.format().validate()?;
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(Error::InvalidConfig(format!(
                "page size {} must be in 1..={}",
                self.page_size, MAX_PAGE_SIZE
            )));
        }
        if self.pages_per_segment == 0 {
            return Err(Error::InvalidConfig(
                "pages per segment must be positive".to_string(),
            ));
        }
        if self.part_size == 0 {
            return Err(Error::InvalidConfig("part size must be positive".to_string()));
        }
        // removing a head part must drop whole index segments
        if self.part_size % self.segment_bytes() != 0 {
            return Err(Error::InvalidConfig(format!(
                "part size {} is not a multiple of the {}-byte index segment",
                self.part_size,
                self.segment_bytes()
            )));
        }
        self.cache.validate()?;
        if self.jobs.urgent_reserve > self.jobs.max_jobs {
            return Err(Error::InvalidConfig(format!(
                "urgent reserve {} exceeds job capacity {}",
                self.jobs.urgent_reserve, self.jobs.max_jobs
            )));
        }
        Ok(())
    }
}

impl CacheConfig {
    /// Set total cache memory
    pub fn max_mem(mut self, bytes: usize) -> Self {
        self.max_mem = bytes;
        self
    }

    /// Set ring buffer size
    pub fn buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = bytes;
        self
    }

    /// Set maximum live entries
    pub fn max_recs(mut self, recs: usize) -> Self {
        self.max_recs = recs;
        self
    }

    /// Set cache key width
    pub fn key_size(mut self, size: usize) -> Self {
        self.key_size = size;
        self
    }

    /// Set entry payload size
    pub fn data_size(mut self, size: DataSize) -> Self {
        self.data_size = size;
        self
    }

    /// Number of ring buffers the configured memory is split into.
    pub fn num_buffers(&self) -> usize {
        if self.max_mem == 0 || self.buffer_size == 0 {
            return 0;
        }
        self.max_mem.div_ceil(self.buffer_size).min(MAX_CACHE_BUFFERS)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_mem > 0 && self.buffer_size == 0 {
            return Err(Error::InvalidConfig(
                "cache buffer size must be positive".to_string(),
            ));
        }
        if self.key_size == 0 {
            return Err(Error::InvalidConfig("cache key size must be positive".to_string()));
        }
        Ok(())
    }
}

impl ScanConfig {
    /// Set the first retry backoff
    pub fn base_backoff(mut self, backoff: Duration) -> Self {
        self.base_backoff = backoff;
        self
    }

    /// Set the backoff ceiling
    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    /// Set the I/O retry limit for normal scans
    pub fn max_io_retries(mut self, retries: u32) -> Self {
        self.max_io_retries = retries;
        self
    }

    /// Set the I/O retry limit for urgent scans
    pub fn urgent_max_retries(mut self, retries: u32) -> Self {
        self.urgent_max_retries = retries;
        self
    }

    /// Set the I/O failure count that downgrades to corruption
    pub fn corrupt_after_io_errors(mut self, count: u32) -> Self {
        self.corrupt_after_io_errors = count;
        self
    }

    /// Set the largest allowed read
    pub fn max_read_size(mut self, bytes: u64) -> Self {
        self.max_read_size = bytes;
        self
    }

    /// Enable cache validation against disk
    pub fn validate_cache(mut self, enabled: bool) -> Self {
        self.validate_cache = enabled;
        self
    }
}

impl JobConfig {
    /// Set the job capacity
    pub fn max_jobs(mut self, jobs: usize) -> Self {
        self.max_jobs = jobs;
        self
    }

    /// Set the urgent-only reserve
    pub fn urgent_reserve(mut self, jobs: usize) -> Self {
        self.urgent_reserve = jobs;
        self
    }
}

impl SchedulerConfig {
    /// Set the cache save interval
    pub fn cache_save_interval(mut self, interval: Duration) -> Self {
        self.cache_save_interval = interval;
        self
    }

    /// Set the metrics interval
    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }
}
