//! TPS control data models
//!
//! Defines rule details, check requests, and check responses.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use quince_common::now_millis;

/// Whether a rule only records would-be denials or actually blocks traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorType {
    /// Record and report denials, never block
    #[default]
    Monitor,
    /// Block requests over the threshold
    Intercept,
}

/// How a pattern rule counts matching keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleModel {
    /// One counter per distinct key value, plus the aggregate
    Proto,
    /// One aggregate counter for every key matching the pattern
    #[default]
    Fuzzy,
}

/// Counting window length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TpsPeriod {
    #[default]
    Seconds,
    Minutes,
}

impl TpsPeriod {
    pub fn millis(&self) -> i64 {
        match self {
            TpsPeriod::Seconds => 1_000,
            TpsPeriod::Minutes => 60_000,
        }
    }
}

/// Threshold definition for one barrier. Negative limits are unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDetail {
    #[serde(default)]
    pub rule_name: String,
    #[serde(default = "unlimited")]
    pub max_count: i64,
    #[serde(default = "unlimited")]
    pub max_flow: i64,
    #[serde(default)]
    pub period: TpsPeriod,
    #[serde(default)]
    pub monitor_type: MonitorType,
    #[serde(default)]
    pub model: RuleModel,
    #[serde(default)]
    pub order: i32,
    /// `type:glob` monitor key pattern, unused for point rules
    #[serde(default)]
    pub pattern: String,
}

fn unlimited() -> i64 {
    -1
}

impl Default for RuleDetail {
    fn default() -> Self {
        Self {
            rule_name: String::new(),
            max_count: -1,
            max_flow: -1,
            period: TpsPeriod::Seconds,
            monitor_type: MonitorType::Monitor,
            model: RuleModel::Fuzzy,
            order: 0,
            pattern: String::new(),
        }
    }
}

impl RuleDetail {
    pub fn count_limit(max_count: i64, monitor_type: MonitorType) -> Self {
        Self {
            max_count,
            monitor_type,
            ..Default::default()
        }
    }

    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = pattern.into();
        self
    }

    pub fn model(mut self, model: RuleModel) -> Self {
        self.model = model;
        self
    }

    pub fn order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn period(mut self, period: TpsPeriod) -> Self {
        self.period = period;
        self
    }

    pub fn max_flow(mut self, max_flow: i64) -> Self {
        self.max_flow = max_flow;
        self
    }

    pub fn is_intercept(&self) -> bool {
        self.monitor_type == MonitorType::Intercept
    }
}

/// Complete rule set for one check point
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TpsControlRule {
    pub point_name: String,
    #[serde(default)]
    pub point_rule: Option<RuleDetail>,
    /// Pattern rules keyed by rule name
    #[serde(default)]
    pub monitor_key_rule: HashMap<String, RuleDetail>,
}

/// Typed key a request is counted under, rendered as `type:value`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MonitorKey {
    pub key_type: String,
    pub key: String,
}

pub const MONITOR_KEY_CLIENT_IP: &str = "clientIp";
pub const MONITOR_KEY_CONNECTION_ID: &str = "connectionId";
pub const MONITOR_KEY_APP_NAME: &str = "appName";

impl MonitorKey {
    pub fn new(key_type: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            key_type: key_type.into(),
            key: key.into(),
        }
    }

    pub fn client_ip(ip: impl Into<String>) -> Self {
        Self::new(MONITOR_KEY_CLIENT_IP, ip)
    }

    pub fn connection_id(id: impl Into<String>) -> Self {
        Self::new(MONITOR_KEY_CONNECTION_ID, id)
    }

    pub fn app_name(app: impl Into<String>) -> Self {
        Self::new(MONITOR_KEY_APP_NAME, app)
    }

    pub fn build(&self) -> String {
        format!("{}:{}", self.key_type, self.key)
    }
}

impl fmt::Display for MonitorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key_type, self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TpsCheckRequest {
    pub point_name: String,
    #[serde(default)]
    pub monitor_keys: Vec<MonitorKey>,
    #[serde(default)]
    pub flow: i64,
    #[serde(default = "one")]
    pub count: i64,
    pub timestamp: i64,
}

fn one() -> i64 {
    1
}

impl TpsCheckRequest {
    /// A single-count request stamped with the current time
    pub fn new(point_name: impl Into<String>) -> Self {
        Self {
            point_name: point_name.into(),
            monitor_keys: Vec::new(),
            flow: 0,
            count: 1,
            timestamp: now_millis(),
        }
    }

    pub fn with_monitor_key(mut self, key: MonitorKey) -> Self {
        self.monitor_keys.push(key);
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_count(mut self, count: i64) -> Self {
        self.count = count;
        self
    }

    pub fn with_flow(mut self, flow: i64) -> Self {
        self.flow = flow;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TpsResultCode {
    PassByPoint,
    PassByMonitor,
    PassByPattern,
    PassByPreInterceptor,
    PassByPostInterceptor,
    DenyByPoint,
    DenyByPattern,
    DenyByPreInterceptor,
    DenyByPostInterceptor,
    CheckPass,
    CheckDeny,
}

impl TpsResultCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TpsResultCode::PassByPoint => "PASS_BY_POINT",
            TpsResultCode::PassByMonitor => "PASS_BY_MONITOR",
            TpsResultCode::PassByPattern => "PASS_BY_PATTERN",
            TpsResultCode::PassByPreInterceptor => "PASS_BY_PRE_INTERCEPTOR",
            TpsResultCode::PassByPostInterceptor => "PASS_BY_POST_INTERCEPTOR",
            TpsResultCode::DenyByPoint => "DENY_BY_POINT",
            TpsResultCode::DenyByPattern => "DENY_BY_PATTERN",
            TpsResultCode::DenyByPreInterceptor => "DENY_BY_PRE_INTERCEPTOR",
            TpsResultCode::DenyByPostInterceptor => "DENY_BY_POST_INTERCEPTOR",
            TpsResultCode::CheckPass => "CHECK_PASS",
            TpsResultCode::CheckDeny => "CHECK_DENY",
        }
    }
}

impl fmt::Display for TpsResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TpsCheckResponse {
    pub success: bool,
    pub code: TpsResultCode,
    pub message: String,
}

impl TpsCheckResponse {
    pub fn new(success: bool, code: TpsResultCode, message: impl Into<String>) -> Self {
        Self {
            success,
            code,
            message: message.into(),
        }
    }

    pub fn pass(code: TpsResultCode) -> Self {
        Self::new(true, code, "")
    }

    pub fn deny(code: TpsResultCode, message: impl Into<String>) -> Self {
        Self::new(false, code, message)
    }
}

/// Published for every denial, in monitor or intercept mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TpsDeniedEvent {
    pub point_name: String,
    pub rule_name: String,
    pub monitor_key: Option<String>,
    pub is_monitor_model: bool,
    pub code: TpsResultCode,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_detail_deserialize_defaults() {
        let detail: RuleDetail =
            serde_json::from_str(r#"{"maxCount": 5, "monitorType": "intercept"}"#).unwrap();
        assert_eq!(detail.max_count, 5);
        assert_eq!(detail.max_flow, -1);
        assert_eq!(detail.period, TpsPeriod::Seconds);
        assert_eq!(detail.model, RuleModel::Fuzzy);
        assert!(detail.is_intercept());
    }

    #[test]
    fn test_control_rule_deserialize() {
        let rule: TpsControlRule = serde_json::from_str(
            r#"{
                "pointName": "ConfigListen",
                "pointRule": {"maxCount": 100, "period": "MINUTES"},
                "monitorKeyRule": {
                    "perIp": {"maxCount": 10, "pattern": "clientIp:*", "model": "PROTO"}
                }
            }"#,
        )
        .unwrap();
        assert_eq!(rule.point_rule.unwrap().period.millis(), 60_000);
        assert_eq!(rule.monitor_key_rule["perIp"].model, RuleModel::Proto);
    }

    #[test]
    fn test_result_code_serializes_screaming() {
        let json = serde_json::to_string(&TpsResultCode::DenyByPattern).unwrap();
        assert_eq!(json, "\"DENY_BY_PATTERN\"");
        assert_eq!(TpsResultCode::PassByPoint.to_string(), "PASS_BY_POINT");
    }

    #[test]
    fn test_monitor_key_build() {
        assert_eq!(MonitorKey::client_ip("10.0.0.1").build(), "clientIp:10.0.0.1");
    }
}
