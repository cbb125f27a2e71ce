//! Config read path
//!
//! Content is served from the cache under the bounded read lock. A group key
//! missing from the cache is loaded from the repository once.

use std::sync::Arc;

use tracing::{debug, warn};

use quince_common::group_key;

use super::cache::ConfigCacheService;
use super::lock::ReadLockResult;
use super::repository::ConfigInfoRepository;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigQueryResponse {
    pub content: String,
    pub md5: String,
    pub r#type: String,
    pub encrypted_data_key: String,
    pub last_modified: i64,
    /// Set when a gray variant was served
    pub gray_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryResult {
    Found(ConfigQueryResponse),
    NotFound,
    /// A dump held the item for every read lock attempt
    Conflict,
}

pub struct ConfigQueryService {
    cache: Arc<ConfigCacheService>,
    repository: Arc<dyn ConfigInfoRepository>,
}

impl ConfigQueryService {
    pub fn new(cache: Arc<ConfigCacheService>, repository: Arc<dyn ConfigInfoRepository>) -> Self {
        Self { cache, repository }
    }

    pub async fn query(
        &self,
        data_id: &str,
        group: &str,
        tenant: &str,
        client_ip: &str,
        tag: Option<&str>,
    ) -> anyhow::Result<QueryResult> {
        let key = group_key::get_key(data_id, group, tenant);
        let mut loaded = false;
        loop {
            match self.cache.try_config_read_lock(&key) {
                ReadLockResult::Acquired(guard) => {
                    let item = guard.item();
                    let (cache, gray_name) = match item.match_gray(client_ip, tag) {
                        Some(gray) => (gray.cache, Some(gray.rule.gray_name())),
                        None => (item.config_cache(), None),
                    };
                    if cache.md5.is_empty() {
                        return Ok(QueryResult::NotFound);
                    }
                    return Ok(QueryResult::Found(ConfigQueryResponse {
                        content: cache.content,
                        md5: cache.md5,
                        r#type: cache.r#type,
                        encrypted_data_key: cache.encrypted_data_key,
                        last_modified: cache.last_modified_ts,
                        gray_name,
                    }));
                }
                ReadLockResult::Failed => {
                    warn!(group_key = %key, client_ip, "Config read lock failed");
                    return Ok(QueryResult::Conflict);
                }
                ReadLockResult::Absent if !loaded => {
                    loaded = true;
                    if !self.load(data_id, group, tenant).await? {
                        return Ok(QueryResult::NotFound);
                    }
                }
                ReadLockResult::Absent => return Ok(QueryResult::NotFound),
            }
        }
    }

    /// Load one item and its gray variants into the cache.
    async fn load(&self, data_id: &str, group: &str, tenant: &str) -> anyhow::Result<bool> {
        let Some(record) = self.repository.find_config_info(data_id, group, tenant).await? else {
            debug!(data_id, group, tenant, "Config not found in repository");
            return Ok(false);
        };
        self.cache
            .dump_with_md5(
                data_id,
                group,
                tenant,
                &record.content,
                &record.md5,
                record.last_modified,
                &record.r#type,
                &record.encrypted_data_key,
            )
            .await;
        for gray in self.repository.find_gray_list(data_id, group, tenant).await? {
            if let Some(rule) = gray.gray_rule {
                self.cache
                    .dump_gray(
                        data_id,
                        group,
                        tenant,
                        rule,
                        &gray.content,
                        gray.last_modified,
                        &gray.encrypted_data_key,
                    )
                    .await;
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConfigCacheConfig, ConfigRecord, GrayRule};
    use crate::service::cache::FatalHandler;
    use crate::service::disk::LocalDiskService;
    use crate::service::repository::MemoryConfigRepository;
    use quince_common::{EventPublisher, md5_hex};

    struct NoopFatal;

    impl FatalHandler for NoopFatal {
        fn on_disk_failure(&self, _group_key: &str, _error: &anyhow::Error) {}
    }

    async fn setup() -> (ConfigQueryService, Arc<ConfigCacheService>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ConfigCacheService::new(
            Arc::new(LocalDiskService::new(dir.path())),
            Arc::new(NoopFatal),
            EventPublisher::new(16),
            ConfigCacheConfig::default(),
        ));
        let repository = Arc::new(MemoryConfigRepository::new());
        repository
            .insert_or_update(ConfigRecord::new("a", "G", "", "main"))
            .await
            .unwrap();
        repository
            .insert_or_update(ConfigRecord::new("a", "G", "", "beta").with_gray_rule(GrayRule::beta("10.0.0.1")))
            .await
            .unwrap();
        (ConfigQueryService::new(cache.clone(), repository), cache, dir)
    }

    #[tokio::test]
    async fn test_cold_load_then_serve() {
        let (query, cache, _dir) = setup().await;
        assert!(cache.is_empty());

        let QueryResult::Found(found) = query.query("a", "G", "", "10.0.0.9", None).await.unwrap() else {
            panic!("expected content");
        };
        assert_eq!(found.content, "main");
        assert_eq!(found.md5, md5_hex("main"));
        assert!(found.gray_name.is_none());

        let QueryResult::Found(beta) = query.query("a", "G", "", "10.0.0.1", None).await.unwrap() else {
            panic!("expected beta content");
        };
        assert_eq!(beta.content, "beta");
        assert_eq!(beta.gray_name.as_deref(), Some("beta"));
    }

    #[tokio::test]
    async fn test_missing_config() {
        let (query, _cache, _dir) = setup().await;
        assert_eq!(
            query.query("missing", "G", "", "10.0.0.1", None).await.unwrap(),
            QueryResult::NotFound
        );
    }

    #[tokio::test]
    async fn test_conflict_while_dumping() {
        let (query, cache, _dir) = setup().await;
        query.query("a", "G", "", "10.0.0.9", None).await.unwrap();

        let item = cache.get_content_cache("a+G").unwrap();
        assert!(item.rw_lock().try_write_lock());
        assert_eq!(
            query.query("a", "G", "", "10.0.0.9", None).await.unwrap(),
            QueryResult::Conflict
        );
        item.rw_lock().release_write_lock();
    }
}
