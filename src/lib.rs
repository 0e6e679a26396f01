pub mod cache;
pub mod collection;
pub mod config;
pub mod error;
pub mod file;
pub mod flock;
pub mod jobs;
pub mod key;
pub mod map;
pub mod record;
pub mod scan;
pub mod scheduler;
pub mod store;

pub use cache::RecordCache;
pub use collection::{CollectionId, Collections};
pub use config::Config;
pub use error::{Error, Result};
pub use file::PartitionedFile;
pub use key::Key;
pub use map::PageIndex;
pub use record::{DataSize, Record, RecordFormat, RecordList};
pub use scan::{ScanOrchestrator, ScanRequest, ScanResult};
pub use store::Database;
