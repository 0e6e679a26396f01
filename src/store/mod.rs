//! Databases built from sorted data files.
//!
//! A database is a directory of numbered data files sharing a name prefix:
//!
//! ```text
//! <dir>/
//!   rdbstore.lock        exclusive directory lock
//!   <name>0001.dat       data file 1, part 0
//!   <name>0001.dat.part1 data file 1, part 1
//!   <name>0001.map       page index of data file 1
//!   <name>.cache         record cache snapshot
//! ```
//!
//! Lower file ids hold older records. Scans read every file and merge the
//! results so that the newest file wins.

mod datafile;
mod database;
pub mod metrics;
mod recovery;
mod state;
pub mod tasks;

pub use datafile::{data_file_name, map_file_name, parse_data_file_name, DataFile, DATA_SUFFIX, MAP_SUFFIX};
pub use database::Database;
pub use metrics::Metrics;
pub use recovery::discover_file_ids;
pub use state::DbState;
pub use tasks::{CacheSaveTask, MetricsTask};

/// Suffix of the record cache snapshot, appended to the database name.
pub const CACHE_SUFFIX: &str = ".cache";
