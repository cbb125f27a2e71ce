//! Cache item model
//!
//! One `CacheItem` per group key. The main content and every gray variant
//! carry their own digest and last modified timestamp.

use std::collections::HashMap;

use parking_lot::RwLock;

use super::gray_rule::GrayRule;
use crate::service::lock::SimpleReadWriteLock;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigCache {
    pub md5: String,
    pub last_modified_ts: i64,
    /// Kept in memory so reads never hit the disk mirror
    pub content: String,
    pub r#type: String,
    pub encrypted_data_key: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigCacheGray {
    pub cache: ConfigCache,
    pub rule: GrayRule,
}

#[derive(Debug)]
pub struct CacheItem {
    group_key: String,
    rw_lock: SimpleReadWriteLock,
    config_cache: RwLock<ConfigCache>,
    gray_cache: RwLock<HashMap<String, ConfigCacheGray>>,
}

impl CacheItem {
    pub fn new(group_key: impl Into<String>) -> Self {
        Self {
            group_key: group_key.into(),
            rw_lock: SimpleReadWriteLock::default(),
            config_cache: RwLock::new(ConfigCache::default()),
            gray_cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn group_key(&self) -> &str {
        &self.group_key
    }

    pub fn rw_lock(&self) -> &SimpleReadWriteLock {
        &self.rw_lock
    }

    pub fn config_cache(&self) -> ConfigCache {
        self.config_cache.read().clone()
    }

    pub fn md5(&self) -> String {
        self.config_cache.read().md5.clone()
    }

    pub fn last_modified_ts(&self) -> i64 {
        self.config_cache.read().last_modified_ts
    }

    pub fn is_beta(&self) -> bool {
        self.gray_cache
            .read()
            .values()
            .any(|g| matches!(g.rule, GrayRule::Beta { .. }))
    }

    /// Client ips the beta variant is served to
    pub fn ips4beta(&self) -> Vec<String> {
        self.gray_cache
            .read()
            .values()
            .find_map(|g| g.rule.beta_ips().map(super::config::sorted_ips))
            .unwrap_or_default()
    }

    pub fn tag_md5(&self, tag: &str) -> Option<String> {
        self.gray_cache
            .read()
            .get(&GrayRule::tag(tag).gray_name())
            .map(|g| g.cache.md5.clone())
    }

    pub fn gray(&self, gray_name: &str) -> Option<ConfigCacheGray> {
        self.gray_cache.read().get(gray_name).cloned()
    }

    pub fn gray_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.gray_cache.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// The highest priority gray variant served to this client, if any
    pub fn match_gray(&self, client_ip: &str, tag: Option<&str>) -> Option<ConfigCacheGray> {
        self.gray_cache
            .read()
            .values()
            .filter(|g| g.rule.matches(client_ip, tag))
            .max_by_key(|g| g.rule.priority())
            .cloned()
    }

    pub(crate) fn update_cache(&self, cache: ConfigCache) {
        *self.config_cache.write() = cache;
    }

    pub(crate) fn touch(&self, last_modified_ts: i64) {
        self.config_cache.write().last_modified_ts = last_modified_ts;
    }

    pub(crate) fn update_gray(&self, gray_name: &str, gray: ConfigCacheGray) {
        self.gray_cache.write().insert(gray_name.to_string(), gray);
    }

    pub(crate) fn touch_gray(&self, gray_name: &str, last_modified_ts: i64) {
        if let Some(gray) = self.gray_cache.write().get_mut(gray_name) {
            gray.cache.last_modified_ts = last_modified_ts;
        }
    }

    pub(crate) fn remove_gray(&self, gray_name: &str) -> Option<ConfigCacheGray> {
        self.gray_cache.write().remove(gray_name)
    }
}
