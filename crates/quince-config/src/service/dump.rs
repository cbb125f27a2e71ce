//! Publishing and startup loading
//!
//! Writes go to the repository first and are then dumped into the cache,
//! which publishes the change to long polling clients.

use std::sync::Arc;

use tracing::{info, warn};

use super::cache::ConfigCacheService;
use super::repository::ConfigInfoRepository;
use crate::model::ConfigRecord;

pub struct DumpService {
    cache: Arc<ConfigCacheService>,
    repository: Arc<dyn ConfigInfoRepository>,
}

impl DumpService {
    pub fn new(cache: Arc<ConfigCacheService>, repository: Arc<dyn ConfigInfoRepository>) -> Self {
        Self { cache, repository }
    }

    async fn dump_record(&self, record: &ConfigRecord) -> bool {
        match &record.gray_rule {
            Some(rule) => {
                self.cache
                    .dump_gray(
                        &record.data_id,
                        &record.group,
                        &record.tenant,
                        rule.clone(),
                        &record.content,
                        record.last_modified,
                        &record.encrypted_data_key,
                    )
                    .await
            }
            None => {
                self.cache
                    .dump_with_md5(
                        &record.data_id,
                        &record.group,
                        &record.tenant,
                        &record.content,
                        &record.md5,
                        record.last_modified,
                        &record.r#type,
                        &record.encrypted_data_key,
                    )
                    .await
            }
        }
    }

    /// Load every stored record into the cache. Returns how many were dumped.
    pub async fn dump_all(&self) -> anyhow::Result<usize> {
        let records = self.repository.find_all().await?;
        let total = records.len();
        let mut dumped = 0;
        for record in &records {
            if self.dump_record(record).await {
                dumped += 1;
            } else {
                warn!(group_key = %record.group_key(), "Config not dumped at startup");
            }
        }
        info!(dumped, total, "Config cache loaded");
        Ok(dumped)
    }

    /// Store a record (main or gray) and dump it.
    pub async fn publish(&self, record: ConfigRecord) -> anyhow::Result<ConfigRecord> {
        let stored = self.repository.insert_or_update(record).await?;
        if !self.dump_record(&stored).await {
            anyhow::bail!("config {} stored but not dumped", stored.group_key());
        }
        Ok(stored)
    }

    /// Delete a config with its gray variants. Returns whether it existed.
    pub async fn remove(&self, data_id: &str, group: &str, tenant: &str) -> anyhow::Result<bool> {
        let existed = self.repository.remove_config_info(data_id, group, tenant).await?;
        if !self.cache.remove(data_id, group, tenant).await {
            anyhow::bail!("config {}+{} removed but still cached", data_id, group);
        }
        Ok(existed)
    }

    pub async fn remove_gray(
        &self,
        data_id: &str,
        group: &str,
        tenant: &str,
        gray_name: &str,
    ) -> anyhow::Result<bool> {
        let existed = self
            .repository
            .remove_gray(data_id, group, tenant, gray_name)
            .await?;
        if !self.cache.remove_gray(data_id, group, tenant, gray_name).await {
            anyhow::bail!("gray config {} of {}+{} removed but still cached", gray_name, data_id, group);
        }
        Ok(existed)
    }
}
