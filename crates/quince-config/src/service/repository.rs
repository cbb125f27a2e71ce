//! Persistence contract for config records
//!
//! The cache is only a mirror; records are owned by a repository. The
//! in-memory repository backs standalone mode and tests.

use async_trait::async_trait;
use dashmap::DashMap;

use quince_common::{group_key, md5_hex, now_millis};

use crate::model::ConfigRecord;

#[async_trait]
pub trait ConfigInfoRepository: Send + Sync {
    async fn find_config_info(
        &self,
        data_id: &str,
        group: &str,
        tenant: &str,
    ) -> anyhow::Result<Option<ConfigRecord>>;

    async fn find_gray_list(
        &self,
        data_id: &str,
        group: &str,
        tenant: &str,
    ) -> anyhow::Result<Vec<ConfigRecord>>;

    /// Every record, gray variants included
    async fn find_all(&self) -> anyhow::Result<Vec<ConfigRecord>>;

    /// Store a record, main or gray by its `gray_rule`. Returns it with the
    /// digest and modification time the repository assigned.
    async fn insert_or_update(&self, record: ConfigRecord) -> anyhow::Result<ConfigRecord>;

    async fn remove_config_info(&self, data_id: &str, group: &str, tenant: &str) -> anyhow::Result<bool>;

    async fn remove_gray(
        &self,
        data_id: &str,
        group: &str,
        tenant: &str,
        gray_name: &str,
    ) -> anyhow::Result<bool>;
}

#[derive(Debug, Default)]
pub struct MemoryConfigRepository {
    configs: DashMap<String, ConfigRecord>,
    grays: DashMap<(String, String), ConfigRecord>,
}

impl MemoryConfigRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

/// Next modification time, strictly after `previous`
fn next_modified(previous: Option<i64>) -> i64 {
    let now = now_millis();
    match previous {
        Some(previous) if previous >= now => previous + 1,
        _ => now,
    }
}

#[async_trait]
impl ConfigInfoRepository for MemoryConfigRepository {
    async fn find_config_info(
        &self,
        data_id: &str,
        group: &str,
        tenant: &str,
    ) -> anyhow::Result<Option<ConfigRecord>> {
        let key = group_key::get_key(data_id, group, tenant);
        Ok(self.configs.get(&key).map(|r| r.clone()))
    }

    async fn find_gray_list(
        &self,
        data_id: &str,
        group: &str,
        tenant: &str,
    ) -> anyhow::Result<Vec<ConfigRecord>> {
        let key = group_key::get_key(data_id, group, tenant);
        let mut grays: Vec<ConfigRecord> = self
            .grays
            .iter()
            .filter(|e| e.key().0 == key)
            .map(|e| e.value().clone())
            .collect();
        grays.sort_by_key(|r| r.gray_rule.as_ref().map(|g| g.gray_name()));
        Ok(grays)
    }

    async fn find_all(&self) -> anyhow::Result<Vec<ConfigRecord>> {
        let mut all: Vec<ConfigRecord> = self.configs.iter().map(|e| e.value().clone()).collect();
        all.extend(self.grays.iter().map(|e| e.value().clone()));
        Ok(all)
    }

    async fn insert_or_update(&self, mut record: ConfigRecord) -> anyhow::Result<ConfigRecord> {
        record.md5 = md5_hex(&record.content);
        let key = record.group_key();
        match record.gray_rule.as_ref().map(|rule| rule.gray_name()) {
            Some(gray_name) => {
                let mut entry = self.grays.entry((key, gray_name)).or_default();
                record.last_modified = next_modified(Some(entry.last_modified));
                *entry = record.clone();
            }
            None => {
                let mut entry = self.configs.entry(key).or_default();
                record.last_modified = next_modified(Some(entry.last_modified));
                *entry = record.clone();
            }
        }
        Ok(record)
    }

    async fn remove_config_info(&self, data_id: &str, group: &str, tenant: &str) -> anyhow::Result<bool> {
        let key = group_key::get_key(data_id, group, tenant);
        self.grays.retain(|(k, _), _| *k != key);
        Ok(self.configs.remove(&key).is_some())
    }

    async fn remove_gray(
        &self,
        data_id: &str,
        group: &str,
        tenant: &str,
        gray_name: &str,
    ) -> anyhow::Result<bool> {
        let key = group_key::get_key(data_id, group, tenant);
        Ok(self.grays.remove(&(key, gray_name.to_string())).is_some())
    }
}
