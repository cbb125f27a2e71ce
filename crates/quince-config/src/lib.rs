//! Quince Config - Configuration cache and change notification
//!
//! This crate provides:
//! - The in-memory config cache with per-key read/write locking
//! - Disk mirroring and the persistence contract
//! - Config queries and publishing (dump) services
//! - HTTP long polling for config changes

pub mod model;
pub mod service;

// Re-export commonly used types
pub use model::*;
pub use service::{
    ConfigCacheService, ConfigDiskService, ConfigInfoRepository, ConfigQueryResponse,
    ConfigQueryService, ConfigReadGuard, DumpService, FatalHandler, LocalDiskService,
    LongPollingRequest, LongPollingService, MemoryConfigRepository, PendingPoll,
    ProcessExitHandler, QueryResult, ReadLockResult, SimpleReadWriteLock, is_valid_identity,
    is_valid_part,
};
