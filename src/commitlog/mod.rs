mod in_memory;
mod log;
mod segment;
mod storage;

pub use in_memory::InMemoryLog;
pub use in_memory::InMemoryLogReader;
pub use log::opt_index_as_u64;
pub use log::Entry;
pub use log::EntryDecodeError;
pub use log::Index;
pub use log::Log;
pub use log::LogError;
pub use log::LogReader;
pub(crate) use segment::sync_directory;
pub use storage::SegmentedDiskLog;
pub use storage::SegmentedDiskLogReader;
pub use storage::StorageConfig;
