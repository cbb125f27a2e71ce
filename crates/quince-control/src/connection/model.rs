//! Connection control data models

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Connection limits. Negative values are unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionControlRule {
    #[serde(default = "unlimited")]
    pub count_limit: i64,
    /// Explicit per-ip limits, taking precedence over the default
    #[serde(default)]
    pub count_limit_per_client_ip: HashMap<String, i64>,
    #[serde(default = "unlimited")]
    pub count_limit_per_ip_default: i64,
    #[serde(default)]
    pub count_limit_per_client_app: HashMap<String, i64>,
    /// Ips that are logged when over a limit but never denied
    #[serde(default)]
    pub monitor_ip_list: HashSet<String>,
}

fn unlimited() -> i64 {
    -1
}

impl Default for ConnectionControlRule {
    fn default() -> Self {
        Self {
            count_limit: -1,
            count_limit_per_client_ip: HashMap::new(),
            count_limit_per_ip_default: -1,
            count_limit_per_client_app: HashMap::new(),
            monitor_ip_list: HashSet::new(),
        }
    }
}

impl ConnectionControlRule {
    pub fn with_count_limit(mut self, limit: i64) -> Self {
        self.count_limit = limit;
        self
    }

    pub fn with_ip_limit(mut self, ip: impl Into<String>, limit: i64) -> Self {
        self.count_limit_per_client_ip.insert(ip.into(), limit);
        self
    }

    pub fn with_default_ip_limit(mut self, limit: i64) -> Self {
        self.count_limit_per_ip_default = limit;
        self
    }

    pub fn with_app_limit(mut self, app: impl Into<String>, limit: i64) -> Self {
        self.count_limit_per_client_app.insert(app.into(), limit);
        self
    }

    pub fn with_monitor_ip(mut self, ip: impl Into<String>) -> Self {
        self.monitor_ip_list.insert(ip.into());
        self
    }

    /// Limit for one client ip, negative if unlimited
    pub fn ip_limit(&self, ip: &str) -> i64 {
        self.count_limit_per_client_ip
            .get(ip)
            .copied()
            .unwrap_or(self.count_limit_per_ip_default)
    }

    pub fn app_limit(&self, app: &str) -> i64 {
        self.count_limit_per_client_app.get(app).copied().unwrap_or(-1)
    }

    /// Whether any limit is configured at all
    pub fn has_limits(&self) -> bool {
        self.count_limit >= 0
            || self.count_limit_per_ip_default >= 0
            || self.count_limit_per_client_ip.values().any(|v| *v >= 0)
            || self.count_limit_per_client_app.values().any(|v| *v >= 0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCheckRequest {
    pub client_ip: String,
    pub app_name: String,
    /// Where the connection comes from, e.g. `sdk` or `cluster`
    pub source: String,
}

impl ConnectionCheckRequest {
    pub fn new(
        client_ip: impl Into<String>,
        app_name: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            client_ip: client_ip.into(),
            app_name: app_name.into(),
            source: source.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionCheckCode {
    CheckSkip,
    PassByTotal,
    DenyByTotalOver,
    DenyByIpOver,
}

impl fmt::Display for ConnectionCheckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionCheckCode::CheckSkip => "CHECK_SKIP",
            ConnectionCheckCode::PassByTotal => "PASS_BY_TOTAL",
            ConnectionCheckCode::DenyByTotalOver => "DENY_BY_TOTAL_OVER",
            ConnectionCheckCode::DenyByIpOver => "DENY_BY_IP_OVER",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionCheckResponse {
    pub success: bool,
    pub code: ConnectionCheckCode,
    pub message: String,
}

impl ConnectionCheckResponse {
    pub fn pass(code: ConnectionCheckCode) -> Self {
        Self {
            success: true,
            code,
            message: String::new(),
        }
    }

    pub fn deny(code: ConnectionCheckCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            code,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_deserialize_defaults() {
        let rule: ConnectionControlRule =
            serde_json::from_str(r#"{"countLimit": 100, "countLimitPerClientIp": {"10.0.0.1": 3}}"#)
                .unwrap();
        assert_eq!(rule.count_limit, 100);
        assert_eq!(rule.ip_limit("10.0.0.1"), 3);
        assert_eq!(rule.ip_limit("10.0.0.2"), -1);
        assert!(rule.has_limits());
    }

    #[test]
    fn test_default_rule_is_unlimited() {
        let rule = ConnectionControlRule::default();
        assert!(!rule.has_limits());
        assert_eq!(rule.app_limit("app"), -1);
    }

    #[test]
    fn test_ip_limit_falls_back_to_default() {
        let rule = ConnectionControlRule::default()
            .with_default_ip_limit(5)
            .with_ip_limit("1.1.1.1", 1);
        assert_eq!(rule.ip_limit("1.1.1.1"), 1);
        assert_eq!(rule.ip_limit("2.2.2.2"), 5);
    }
}
