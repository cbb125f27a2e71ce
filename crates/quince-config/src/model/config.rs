// Config records, change events and component settings

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use quince_core::Configuration;

use super::gray_rule::GrayRule;

/// One stored configuration item as the persistence layer returns it
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConfigRecord {
    pub data_id: String,
    pub group: String,
    pub tenant: String,
    pub content: String,
    pub md5: String,
    pub r#type: String,
    pub encrypted_data_key: String,
    pub last_modified: i64,
    /// Set for gray variants only
    pub gray_rule: Option<GrayRule>,
}

impl ConfigRecord {
    pub fn new(
        data_id: impl Into<String>,
        group: impl Into<String>,
        tenant: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let content = content.into();
        Self {
            data_id: data_id.into(),
            group: group.into(),
            tenant: tenant.into(),
            md5: quince_common::md5_hex(&content),
            content,
            r#type: "text".to_string(),
            ..Default::default()
        }
    }

    pub fn group_key(&self) -> String {
        quince_common::group_key::get_key(&self.data_id, &self.group, &self.tenant)
    }

    pub fn with_last_modified(mut self, last_modified: i64) -> Self {
        self.last_modified = last_modified;
        self
    }

    pub fn with_gray_rule(mut self, rule: GrayRule) -> Self {
        self.gray_rule = Some(rule);
        self
    }
}

/// Published after the cache content of a group key changed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalDataChangeEvent {
    pub group_key: String,
    pub is_beta: bool,
    pub beta_ips: Vec<String>,
    pub tag: Option<String>,
}

impl LocalDataChangeEvent {
    pub fn new(group_key: impl Into<String>) -> Self {
        Self {
            group_key: group_key.into(),
            is_beta: false,
            beta_ips: Vec::new(),
            tag: None,
        }
    }

    /// Event for a changed gray variant
    pub fn gray(group_key: impl Into<String>, rule: &GrayRule) -> Self {
        let mut event = Self::new(group_key);
        match rule {
            GrayRule::Beta { ips } => {
                event.is_beta = true;
                event.beta_ips = sorted_ips(ips);
            }
            GrayRule::Tag { tag } => event.tag = Some(tag.clone()),
        }
        event
    }
}

/// Snapshot of one pending long poll, for admin queries
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberInfo {
    pub client_ip: String,
    pub app_name: String,
    pub tag: Option<String>,
    pub create_time: i64,
    pub timeout_ms: u64,
    /// Group key to the md5 the client reported
    pub listening_configs: HashMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LongPollingConfig {
    /// Lower bound applied to the client requested timeout
    pub min_timeout_ms: u64,
    /// Subtracted from the timeout so the answer beats client side timeouts
    pub fixed_delay_ms: u64,
    pub fixed_polling: bool,
    pub fixed_polling_interval_ms: u64,
}

impl Default for LongPollingConfig {
    fn default() -> Self {
        Self {
            min_timeout_ms: 10_000,
            fixed_delay_ms: 500,
            fixed_polling: false,
            fixed_polling_interval_ms: 10_000,
        }
    }
}

impl LongPollingConfig {
    pub fn from_configuration(configuration: &Configuration) -> Self {
        Self {
            min_timeout_ms: configuration.long_polling_min_timeout_ms(),
            fixed_delay_ms: configuration.long_polling_fixed_delay_ms(),
            fixed_polling: configuration.long_polling_fixed_polling(),
            fixed_polling_interval_ms: configuration.long_polling_fixed_polling_interval_ms(),
        }
    }

    /// Effective wait for a client requested timeout, in milliseconds
    pub fn effective_timeout_ms(&self, requested_ms: u64) -> u64 {
        if self.fixed_polling {
            return self.fixed_polling_interval_ms;
        }
        requested_ms
            .max(self.min_timeout_ms)
            .saturating_sub(self.fixed_delay_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigCacheConfig {
    pub read_lock_retries: u32,
    pub write_lock_retries: u32,
    /// Root of the disk mirror
    pub base_dir: PathBuf,
}

impl Default for ConfigCacheConfig {
    fn default() -> Self {
        Self {
            read_lock_retries: 10,
            write_lock_retries: 10,
            base_dir: PathBuf::from("data"),
        }
    }
}

impl ConfigCacheConfig {
    pub fn from_configuration(configuration: &Configuration) -> Self {
        Self {
            read_lock_retries: configuration.config_read_lock_retries(),
            write_lock_retries: configuration.config_write_lock_retries(),
            base_dir: PathBuf::from(configuration.data_dir()),
        }
    }
}

/// Beta ips of a rule as a sorted list
pub(crate) fn sorted_ips(ips: &HashSet<String>) -> Vec<String> {
    let mut ips: Vec<String> = ips.iter().cloned().collect();
    ips.sort();
    ips
}
