//! Gray release rules
//!
//! A gray variant of a config is served to a subset of clients instead of the
//! main content. Beta variants match by client ip, tag variants by the
//! client's `Vipserver-Tag`.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

pub const GRAY_NAME_BETA: &str = "beta";
pub const GRAY_NAME_TAG_PREFIX: &str = "tag_";

/// Priority used when several gray variants match; higher wins
const BETA_PRIORITY: i32 = i32::MAX;
const TAG_PRIORITY: i32 = i32::MAX - 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GrayRule {
    Beta { ips: HashSet<String> },
    Tag { tag: String },
}

impl GrayRule {
    /// Beta rule from a comma separated ip list
    pub fn beta(ips: &str) -> Self {
        GrayRule::Beta {
            ips: ips
                .split(',')
                .map(str::trim)
                .filter(|ip| !ip.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn tag(tag: impl Into<String>) -> Self {
        GrayRule::Tag { tag: tag.into() }
    }

    /// Name the variant is stored under in a cache item
    pub fn gray_name(&self) -> String {
        match self {
            GrayRule::Beta { .. } => GRAY_NAME_BETA.to_string(),
            GrayRule::Tag { tag } => format!("{}{}", GRAY_NAME_TAG_PREFIX, tag),
        }
    }

    pub fn priority(&self) -> i32 {
        match self {
            GrayRule::Beta { .. } => BETA_PRIORITY,
            GrayRule::Tag { .. } => TAG_PRIORITY,
        }
    }

    pub fn matches(&self, client_ip: &str, tag: Option<&str>) -> bool {
        match self {
            GrayRule::Beta { ips } => ips.contains(client_ip),
            GrayRule::Tag { tag: rule_tag } => tag.is_some_and(|t| t == rule_tag),
        }
    }

    pub fn beta_ips(&self) -> Option<&HashSet<String>> {
        match self {
            GrayRule::Beta { ips } => Some(ips),
            GrayRule::Tag { .. } => None,
        }
    }
}
