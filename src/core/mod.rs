pub mod comparator;
pub mod engine;
pub mod hash_store;
pub mod hashing;
pub mod scanner;

pub use comparator::{FileComparator, HashDiff};
pub use engine::{DeviceAppData, DirectorySyncer, SyncMode, SyncOptions, SyncReport};
pub use hash_store::{parse_hashes, serialize_hashes, HashStore};
pub use hashing::{calculate_hash, hash_file, hash_mappings};
pub use scanner::{FileScanner, LocalToDevicePathMapping, ScanConfig};
