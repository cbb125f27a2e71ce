// Config services: cache, disk mirror, persistence, queries and long polling

pub mod cache;
pub mod disk;
pub mod dump;
pub mod listener;
pub mod lock;
pub mod long_polling;
pub mod query;
pub mod repository;

// Re-export commonly used types
pub use cache::{ConfigCacheService, FatalHandler, ProcessExitHandler};
pub use disk::{ConfigDiskService, LocalDiskService, is_valid_identity, is_valid_part};
pub use dump::DumpService;
pub use lock::{ConfigReadGuard, ReadLockResult, SimpleReadWriteLock};
pub use long_polling::{LongPollingRequest, LongPollingService, PendingPoll};
pub use query::{ConfigQueryResponse, ConfigQueryService, QueryResult};
pub use repository::{ConfigInfoRepository, MemoryConfigRepository};
