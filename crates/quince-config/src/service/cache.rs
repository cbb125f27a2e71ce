//! Config cache service
//!
//! Holds the current digest and content of every config item. Dumps are
//! ordered by the timestamp they carry: an older timestamp never overwrites a
//! newer one. Memory is updated first, then the change event is published,
//! then the disk mirror is written. A failed disk write is fatal.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use quince_common::{EventPublisher, group_key, md5_hex};

use super::disk::{ConfigDiskService, is_valid_identity, is_valid_part};
use super::lock::{ConfigReadGuard, ConfigWriteGuard, ReadLockResult, spin};
use crate::model::{
    CacheItem, ConfigCache, ConfigCacheConfig, ConfigCacheGray, GrayRule, LocalDataChangeEvent,
};

/// Called when the disk mirror can no longer be trusted
pub trait FatalHandler: Send + Sync {
    fn on_disk_failure(&self, group_key: &str, error: &anyhow::Error);
}

/// Exits the process so a supervisor restarts it from the repository
#[derive(Debug, Default)]
pub struct ProcessExitHandler;

impl FatalHandler for ProcessExitHandler {
    fn on_disk_failure(&self, group_key: &str, error: &anyhow::Error) {
        error!(group_key, error = %error, "Config dump to disk failed, exiting");
        std::process::exit(1);
    }
}

pub struct ConfigCacheService {
    cache: DashMap<String, Arc<CacheItem>>,
    disk: Arc<dyn ConfigDiskService>,
    fatal: Arc<dyn FatalHandler>,
    events: EventPublisher<LocalDataChangeEvent>,
    config: ConfigCacheConfig,
}

impl ConfigCacheService {
    pub fn new(
        disk: Arc<dyn ConfigDiskService>,
        fatal: Arc<dyn FatalHandler>,
        events: EventPublisher<LocalDataChangeEvent>,
        config: ConfigCacheConfig,
    ) -> Self {
        Self {
            cache: DashMap::new(),
            disk,
            fatal,
            events,
            config,
        }
    }

    pub fn events(&self) -> &EventPublisher<LocalDataChangeEvent> {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    fn make_sure(&self, group_key: &str) -> Arc<CacheItem> {
        self.cache
            .entry(group_key.to_string())
            .or_insert_with(|| Arc::new(CacheItem::new(group_key)))
            .clone()
    }

    fn try_write_lock(&self, item: Arc<CacheItem>) -> Option<ConfigWriteGuard> {
        if spin(self.config.write_lock_retries, || item.rw_lock().try_write_lock()) {
            Some(ConfigWriteGuard::new(item))
        } else {
            None
        }
    }

    /// Dump content, deriving its md5.
    #[allow(clippy::too_many_arguments)]
    pub async fn dump(
        &self,
        data_id: &str,
        group: &str,
        tenant: &str,
        content: &str,
        last_modified_ts: i64,
        r#type: &str,
        encrypted_data_key: &str,
    ) -> bool {
        let md5 = md5_hex(content);
        self.dump_with_md5(
            data_id,
            group,
            tenant,
            content,
            &md5,
            last_modified_ts,
            r#type,
            encrypted_data_key,
        )
        .await
    }

    /// Dump content with a known md5.
    ///
    /// Returns false only when the write lock could not be taken or the disk
    /// write failed. A stale timestamp is dropped and still returns true.
    #[allow(clippy::too_many_arguments)]
    pub async fn dump_with_md5(
        &self,
        data_id: &str,
        group: &str,
        tenant: &str,
        content: &str,
        md5: &str,
        last_modified_ts: i64,
        r#type: &str,
        encrypted_data_key: &str,
    ) -> bool {
        let group_key = group_key::get_key(data_id, group, tenant);
        if !is_valid_identity(data_id, group, tenant) {
            warn!(group_key = %group_key, "Config dump rejected, invalid identity");
            return false;
        }
        let Some(guard) = self.try_write_lock(self.make_sure(&group_key)) else {
            warn!(group_key = %group_key, "Config dump failed to get write lock");
            return false;
        };

        let item = guard.item();
        let current_ts = item.last_modified_ts();
        if last_modified_ts < current_ts {
            debug!(group_key = %group_key, last_modified_ts, current_ts, "Stale config dump dropped");
            return true;
        }
        if item.md5() == md5 {
            item.touch(last_modified_ts);
            debug!(group_key = %group_key, md5, "Config unchanged, timestamp updated");
            return true;
        }

        item.update_cache(ConfigCache {
            md5: md5.to_string(),
            last_modified_ts,
            content: content.to_string(),
            r#type: r#type.to_string(),
            encrypted_data_key: encrypted_data_key.to_string(),
        });
        drop(guard);

        info!(group_key = %group_key, md5, last_modified_ts, "Config cache updated");
        self.events.publish(LocalDataChangeEvent::new(group_key.as_str()));

        match self.disk.save_to_disk(data_id, group, tenant, content).await {
            Ok(()) => true,
            Err(e) => {
                self.fatal.on_disk_failure(&group_key, &e);
                false
            }
        }
    }

    /// Dump one gray variant. Each variant keeps its own timestamp.
    #[allow(clippy::too_many_arguments)]
    pub async fn dump_gray(
        &self,
        data_id: &str,
        group: &str,
        tenant: &str,
        rule: GrayRule,
        content: &str,
        last_modified_ts: i64,
        encrypted_data_key: &str,
    ) -> bool {
        let group_key = group_key::get_key(data_id, group, tenant);
        let gray_name = rule.gray_name();
        if !is_valid_identity(data_id, group, tenant) || !is_valid_part(&gray_name) {
            warn!(group_key = %group_key, gray_name = %gray_name, "Gray config dump rejected, invalid identity");
            return false;
        }
        let Some(guard) = self.try_write_lock(self.make_sure(&group_key)) else {
            warn!(group_key = %group_key, gray_name = %gray_name, "Gray config dump failed to get write lock");
            return false;
        };

        let item = guard.item();
        let md5 = md5_hex(content);
        if let Some(current) = item.gray(&gray_name) {
            if last_modified_ts < current.cache.last_modified_ts {
                debug!(group_key = %group_key, gray_name = %gray_name, "Stale gray dump dropped");
                return true;
            }
            if current.cache.md5 == md5 && current.rule == rule {
                item.touch_gray(&gray_name, last_modified_ts);
                return true;
            }
        }

        item.update_gray(
            &gray_name,
            ConfigCacheGray {
                cache: ConfigCache {
                    md5: md5.clone(),
                    last_modified_ts,
                    content: content.to_string(),
                    r#type: item.config_cache().r#type,
                    encrypted_data_key: encrypted_data_key.to_string(),
                },
                rule: rule.clone(),
            },
        );
        drop(guard);

        info!(group_key = %group_key, gray_name = %gray_name, md5 = %md5, "Gray config cache updated");
        self.events.publish(LocalDataChangeEvent::gray(group_key.as_str(), &rule));

        match self
            .disk
            .save_gray_to_disk(data_id, group, tenant, &gray_name, content)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                self.fatal.on_disk_failure(&group_key, &e);
                false
            }
        }
    }

    /// Remove an item with all its gray variants. Absent keys succeed.
    pub async fn remove(&self, data_id: &str, group: &str, tenant: &str) -> bool {
        let group_key = group_key::get_key(data_id, group, tenant);
        let Some(item) = self.cache.get(&group_key).map(|e| e.value().clone()) else {
            return true;
        };
        let Some(guard) = self.try_write_lock(item) else {
            warn!(group_key = %group_key, "Config remove failed to get write lock");
            return false;
        };
        let gray_names = guard.item().gray_names();
        self.cache.remove(&group_key);
        drop(guard);

        info!(group_key = %group_key, "Config cache removed");
        self.events.publish(LocalDataChangeEvent::new(group_key.as_str()));

        if let Err(e) = self.disk.remove_config_info(data_id, group, tenant).await {
            warn!(group_key = %group_key, error = %e, "Failed to remove config from disk");
        }
        for gray_name in gray_names {
            if let Err(e) = self.disk.remove_gray(data_id, group, tenant, &gray_name).await {
                warn!(group_key = %group_key, gray_name = %gray_name, error = %e, "Failed to remove gray config from disk");
            }
        }
        true
    }

    pub async fn remove_gray(&self, data_id: &str, group: &str, tenant: &str, gray_name: &str) -> bool {
        let group_key = group_key::get_key(data_id, group, tenant);
        let Some(item) = self.cache.get(&group_key).map(|e| e.value().clone()) else {
            return true;
        };
        let Some(guard) = self.try_write_lock(item) else {
            warn!(group_key = %group_key, gray_name, "Gray config remove failed to get write lock");
            return false;
        };
        let removed = guard.item().remove_gray(gray_name);
        drop(guard);

        let Some(removed) = removed else {
            return true;
        };
        info!(group_key = %group_key, gray_name, "Gray config cache removed");
        self.events
            .publish(LocalDataChangeEvent::gray(group_key.as_str(), &removed.rule));

        if let Err(e) = self.disk.remove_gray(data_id, group, tenant, gray_name).await {
            warn!(group_key = %group_key, gray_name, error = %e, "Failed to remove gray config from disk");
        }
        true
    }

    /// Bounded read lock acquisition. The guard releases the lock on drop.
    pub fn try_config_read_lock(&self, group_key: &str) -> ReadLockResult {
        let Some(item) = self.cache.get(group_key).map(|e| e.value().clone()) else {
            return ReadLockResult::Absent;
        };
        if spin(self.config.read_lock_retries, || item.rw_lock().try_read_lock()) {
            ReadLockResult::Acquired(ConfigReadGuard::new(item))
        } else {
            ReadLockResult::Failed
        }
    }

    pub fn get_content_cache(&self, group_key: &str) -> Option<Arc<CacheItem>> {
        self.cache.get(group_key).map(|e| e.value().clone())
    }

    /// Digest the client should have, honouring beta ips and tags
    pub fn content_md5(&self, group_key: &str, client_ip: &str, tag: Option<&str>) -> Option<String> {
        let item = self.get_content_cache(group_key)?;
        match item.match_gray(client_ip, tag) {
            Some(gray) => Some(gray.cache.md5),
            None => Some(item.md5()),
        }
    }

    /// An absent item is up to date for a client reporting an empty md5.
    pub fn is_uptodate(&self, group_key: &str, md5: &str, client_ip: &str, tag: Option<&str>) -> bool {
        self.content_md5(group_key, client_ip, tag).unwrap_or_default() == md5
    }

    /// Group keys whose digest differs from what the client reported, sorted
    pub fn compare_md5(
        &self,
        client_md5_map: &HashMap<String, String>,
        client_ip: &str,
        tag: Option<&str>,
    ) -> Vec<String> {
        let mut changed: Vec<String> = client_md5_map
            .iter()
            .filter(|(group_key, md5)| !self.is_uptodate(group_key, md5, client_ip, tag))
            .map(|(group_key, _)| group_key.clone())
            .collect();
        changed.sort();
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::disk::LocalDiskService;

    struct PanicHandler;

    impl FatalHandler for PanicHandler {
        fn on_disk_failure(&self, group_key: &str, error: &anyhow::Error) {
            panic!("unexpected disk failure for {}: {}", group_key, error);
        }
    }

    fn service(dir: &std::path::Path) -> ConfigCacheService {
        ConfigCacheService::new(
            Arc::new(LocalDiskService::new(dir)),
            Arc::new(PanicHandler),
            EventPublisher::new(16),
            ConfigCacheConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_dump_publishes_and_mirrors() {
        let dir = tempfile::tempdir().unwrap();
        let cache = service(dir.path());
        let mut events = cache.events().subscribe();

        assert!(cache.dump("a", "G", "", "v1", 1, "text", "").await);
        let key = group_key::get_key("a", "G", "");
        assert_eq!(events.recv().await.unwrap().group_key, key);
        assert_eq!(cache.get_content_cache(&key).unwrap().md5(), md5_hex("v1"));
        assert!(dir.path().join("config-data/G/a").exists());
    }

    #[tokio::test]
    async fn test_same_md5_only_moves_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let cache = service(dir.path());
        assert!(cache.dump("a", "G", "", "v1", 1, "text", "").await);
        let mut events = cache.events().subscribe();

        assert!(cache.dump("a", "G", "", "v1", 5, "text", "").await);
        let item = cache.get_content_cache("a+G").unwrap();
        assert_eq!(item.last_modified_ts(), 5);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dump_fails_while_read_locked() {
        let dir = tempfile::tempdir().unwrap();
        let cache = service(dir.path());
        assert!(cache.dump("a", "G", "", "v1", 1, "text", "").await);

        let guard = cache.try_config_read_lock("a+G");
        assert_eq!(guard.code(), 1);
        assert!(!cache.dump("a", "G", "", "v2", 2, "text", "").await);
        drop(guard);
        assert!(cache.dump("a", "G", "", "v2", 2, "text", "").await);
    }

    #[tokio::test]
    async fn test_read_lock_fails_while_write_locked() {
        let dir = tempfile::tempdir().unwrap();
        let cache = service(dir.path());
        assert_eq!(cache.try_config_read_lock("a+G").code(), 0);

        assert!(cache.dump("a", "G", "", "v1", 1, "text", "").await);
        let item = cache.get_content_cache("a+G").unwrap();
        assert!(item.rw_lock().try_write_lock());
        assert_eq!(cache.try_config_read_lock("a+G").code(), -1);
        item.rw_lock().release_write_lock();
        assert_eq!(cache.try_config_read_lock("a+G").code(), 1);
    }

    #[tokio::test]
    async fn test_gray_md5_served_to_matching_clients() {
        let dir = tempfile::tempdir().unwrap();
        let cache = service(dir.path());
        assert!(cache.dump("a", "G", "", "main", 1, "text", "").await);
        assert!(cache.dump_gray("a", "G", "", GrayRule::beta("10.0.0.1"), "beta", 1, "").await);
        assert!(cache.dump_gray("a", "G", "", GrayRule::tag("blue"), "blue", 1, "").await);

        assert_eq!(cache.content_md5("a+G", "10.0.0.1", None), Some(md5_hex("beta")));
        assert_eq!(cache.content_md5("a+G", "10.0.0.2", Some("blue")), Some(md5_hex("blue")));
        assert_eq!(cache.content_md5("a+G", "10.0.0.2", None), Some(md5_hex("main")));

        // gray timestamps are independent of the main one
        assert!(cache.dump_gray("a", "G", "", GrayRule::beta("10.0.0.1"), "old", 0, "").await);
        assert_eq!(cache.content_md5("a+G", "10.0.0.1", None), Some(md5_hex("beta")));

        assert!(cache.remove_gray("a", "G", "", "beta").await);
        assert_eq!(cache.content_md5("a+G", "10.0.0.1", None), Some(md5_hex("main")));
    }

    #[tokio::test]
    async fn test_gray_carries_main_type() {
        let dir = tempfile::tempdir().unwrap();
        let cache = service(dir.path());
        assert!(cache.dump("a", "G", "", "k: v", 1, "yaml", "").await);
        assert!(cache.dump_gray("a", "G", "", GrayRule::tag("blue"), "k: w", 2, "").await);

        let item = cache.get_content_cache("a+G").unwrap();
        assert_eq!(item.gray("tag_blue").unwrap().cache.r#type, "yaml");
    }

    #[tokio::test]
    async fn test_compare_md5() {
        let dir = tempfile::tempdir().unwrap();
        let cache = service(dir.path());
        assert!(cache.dump("a", "G", "", "v1", 1, "text", "").await);
        assert!(cache.dump("b", "G", "", "v1", 1, "text", "").await);

        let client: HashMap<String, String> = [
            ("a+G".to_string(), md5_hex("v1")),
            ("b+G".to_string(), "stale".to_string()),
            ("c+G".to_string(), String::new()),
            ("d+G".to_string(), "gone".to_string()),
        ]
        .into_iter()
        .collect();
        assert_eq!(cache.compare_md5(&client, "10.0.0.1", None), vec!["b+G", "d+G"]);
    }
}
