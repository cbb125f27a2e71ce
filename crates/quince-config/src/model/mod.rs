// Config data models

pub mod cache;
pub mod config;
pub mod gray_rule;

pub use cache::{CacheItem, ConfigCache, ConfigCacheGray};
pub use config::{
    ConfigCacheConfig, ConfigRecord, LocalDataChangeEvent, LongPollingConfig, SubscriberInfo,
};
pub use gray_rule::GrayRule;
