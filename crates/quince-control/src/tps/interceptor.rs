//! TPS interceptors
//!
//! Interceptors run before (pre) or after (post) the rule barriers of a check
//! point. A `CheckPass` or `CheckDeny` verdict decides the request; `CheckSkip`
//! leaves the decision to the barriers.

use std::collections::HashSet;

use parking_lot::RwLock;

use super::model::{MONITOR_KEY_CLIENT_IP, TpsCheckRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptResult {
    CheckPass,
    CheckDeny,
    CheckSkip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterceptStage {
    Pre,
    Post,
}

/// Matches every check point
pub const ALL_POINTS: &str = "*";

pub trait TpsInterceptor: Send + Sync {
    fn name(&self) -> &str;

    fn stage(&self) -> InterceptStage;

    /// Lower runs first
    fn order(&self) -> i32 {
        0
    }

    /// Point this interceptor applies to, `*` for all
    fn point_name(&self) -> &str {
        ALL_POINTS
    }

    fn is_disabled(&self) -> bool {
        false
    }

    fn intercept(&self, request: &TpsCheckRequest) -> InterceptResult;

    fn applies_to(&self, point_name: &str) -> bool {
        let own = self.point_name();
        own == ALL_POINTS || own == point_name
    }
}

/// Lets listed client ips through ahead of every rule
pub struct ClientIpWhitelistInterceptor {
    point_name: String,
    ips: RwLock<HashSet<String>>,
}

impl ClientIpWhitelistInterceptor {
    pub fn new(point_name: impl Into<String>, ips: impl IntoIterator<Item = String>) -> Self {
        Self {
            point_name: point_name.into(),
            ips: RwLock::new(ips.into_iter().collect()),
        }
    }

    pub fn set_ips(&self, ips: impl IntoIterator<Item = String>) {
        *self.ips.write() = ips.into_iter().collect();
    }
}

impl TpsInterceptor for ClientIpWhitelistInterceptor {
    fn name(&self) -> &str {
        "clientIpWhitelist"
    }

    fn stage(&self) -> InterceptStage {
        InterceptStage::Pre
    }

    fn point_name(&self) -> &str {
        &self.point_name
    }

    fn intercept(&self, request: &TpsCheckRequest) -> InterceptResult {
        let ips = self.ips.read();
        let listed = request
            .monitor_keys
            .iter()
            .any(|k| k.key_type == MONITOR_KEY_CLIENT_IP && ips.contains(&k.key));
        if listed {
            InterceptResult::CheckPass
        } else {
            InterceptResult::CheckSkip
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tps::model::MonitorKey;

    #[test]
    fn test_whitelist_passes_listed_ip() {
        let interceptor =
            ClientIpWhitelistInterceptor::new(ALL_POINTS, vec!["10.0.0.1".to_string()]);

        let listed = TpsCheckRequest::new("p").with_monitor_key(MonitorKey::client_ip("10.0.0.1"));
        let other = TpsCheckRequest::new("p").with_monitor_key(MonitorKey::client_ip("10.0.0.2"));
        assert_eq!(interceptor.intercept(&listed), InterceptResult::CheckPass);
        assert_eq!(interceptor.intercept(&other), InterceptResult::CheckSkip);

        interceptor.set_ips(vec!["10.0.0.2".to_string()]);
        assert_eq!(interceptor.intercept(&other), InterceptResult::CheckPass);
    }

    #[test]
    fn test_point_filter() {
        let interceptor = ClientIpWhitelistInterceptor::new("ConfigListen", Vec::new());
        assert!(interceptor.applies_to("ConfigListen"));
        assert!(!interceptor.applies_to("ConfigPublish"));

        let any = ClientIpWhitelistInterceptor::new(ALL_POINTS, Vec::new());
        assert!(any.applies_to("ConfigPublish"));
    }
}
