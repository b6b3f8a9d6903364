pub mod cache;
pub mod comparator;
pub mod engine;
pub mod hasher;
pub mod metadata;
pub mod paths;
pub mod scanner;
pub mod stats;

pub use engine::{SyncConfig, SyncEngine, SyncReport};
pub use scanner::{LocalEntry, LocalScanner, ScanConfig};
pub use stats::{StatsSnapshot, SyncStats};
