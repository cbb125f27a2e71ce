//! Rule storage
//!
//! Storage backends for TPS and connection control rules.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::connection::ConnectionControlRule;
use crate::tps::TpsControlRule;

/// Rule storage trait for abstracting storage backends
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Get the TPS rule of a check point
    async fn get_tps_rule(&self, point_name: &str) -> anyhow::Result<Option<TpsControlRule>>;

    /// List all TPS rules
    async fn list_tps_rules(&self) -> anyhow::Result<Vec<TpsControlRule>>;

    /// Create or replace the TPS rule of `rule.point_name`
    async fn save_tps_rule(&self, rule: TpsControlRule) -> anyhow::Result<()>;

    /// Delete the TPS rule of a check point
    async fn delete_tps_rule(&self, point_name: &str) -> anyhow::Result<bool>;

    async fn get_connection_rule(&self) -> anyhow::Result<Option<ConnectionControlRule>>;

    async fn save_connection_rule(&self, rule: ConnectionControlRule) -> anyhow::Result<()>;
}

/// In-memory rule store implementation
#[derive(Debug, Default)]
pub struct MemoryRuleStore {
    tps_rules: DashMap<String, TpsControlRule>,
    connection_rule: RwLock<Option<ConnectionControlRule>>,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn get_tps_rule(&self, point_name: &str) -> anyhow::Result<Option<TpsControlRule>> {
        Ok(self.tps_rules.get(point_name).map(|r| r.clone()))
    }

    async fn list_tps_rules(&self) -> anyhow::Result<Vec<TpsControlRule>> {
        let mut rules: Vec<_> = self.tps_rules.iter().map(|r| r.clone()).collect();
        rules.sort_by(|a, b| a.point_name.cmp(&b.point_name));
        Ok(rules)
    }

    async fn save_tps_rule(&self, rule: TpsControlRule) -> anyhow::Result<()> {
        if rule.point_name.is_empty() {
            anyhow::bail!("tps rule has no point name");
        }
        self.tps_rules.insert(rule.point_name.clone(), rule);
        Ok(())
    }

    async fn delete_tps_rule(&self, point_name: &str) -> anyhow::Result<bool> {
        Ok(self.tps_rules.remove(point_name).is_some())
    }

    async fn get_connection_rule(&self) -> anyhow::Result<Option<ConnectionControlRule>> {
        Ok(self.connection_rule.read().clone())
    }

    async fn save_connection_rule(&self, rule: ConnectionControlRule) -> anyhow::Result<()> {
        *self.connection_rule.write() = Some(rule);
        Ok(())
    }
}

const TPS_DIR: &str = "tps";
const CONNECTION_DIR: &str = "connection";
const CONNECTION_RULE_FILE: &str = "limitRule.json";

/// Rule store keeping one JSON file per rule under a base directory
///
/// Layout: `<base>/tps/<point>.json` and `<base>/connection/limitRule.json`.
#[derive(Debug, Clone)]
pub struct LocalDiskRuleStore {
    base_dir: PathBuf,
}

impl LocalDiskRuleStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn tps_path(&self, point_name: &str) -> anyhow::Result<PathBuf> {
        if point_name.is_empty()
            || point_name.contains(['/', '\\'])
            || point_name.starts_with('.')
        {
            anyhow::bail!("invalid point name '{}'", point_name);
        }
        Ok(self
            .base_dir
            .join(TPS_DIR)
            .join(format!("{}.json", point_name)))
    }

    fn connection_path(&self) -> PathBuf {
        self.base_dir.join(CONNECTION_DIR).join(CONNECTION_RULE_FILE)
    }

    async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(value)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }
}

#[async_trait]
impl RuleStore for LocalDiskRuleStore {
    async fn get_tps_rule(&self, point_name: &str) -> anyhow::Result<Option<TpsControlRule>> {
        Self::read_json(&self.tps_path(point_name)?).await
    }

    async fn list_tps_rules(&self) -> anyhow::Result<Vec<TpsControlRule>> {
        let dir = self.base_dir.join(TPS_DIR);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut rules = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                match Self::read_json::<TpsControlRule>(&path).await {
                    Ok(Some(rule)) => rules.push(rule),
                    Ok(None) => {}
                    Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable tps rule file"),
                }
            }
        }
        rules.sort_by(|a, b| a.point_name.cmp(&b.point_name));
        Ok(rules)
    }

    async fn save_tps_rule(&self, rule: TpsControlRule) -> anyhow::Result<()> {
        let path = self.tps_path(&rule.point_name)?;
        Self::write_json(&path, &rule).await
    }

    async fn delete_tps_rule(&self, point_name: &str) -> anyhow::Result<bool> {
        match tokio::fs::remove_file(self.tps_path(point_name)?).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_connection_rule(&self) -> anyhow::Result<Option<ConnectionControlRule>> {
        Self::read_json(&self.connection_path()).await
    }

    async fn save_connection_rule(&self, rule: ConnectionControlRule) -> anyhow::Result<()> {
        Self::write_json(&self.connection_path(), &rule).await
    }
}
