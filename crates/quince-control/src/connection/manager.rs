use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use quince_common::LABEL_SOURCE_CLUSTER;

use super::model::{
    ConnectionCheckCode, ConnectionCheckRequest, ConnectionCheckResponse, ConnectionControlRule,
};
use crate::rule_store::RuleStore;

/// Source of live connection counts
pub trait ConnectionMetricsCollector: Send + Sync {
    fn name(&self) -> &str;

    fn total_count(&self) -> usize;

    fn count_for_ip(&self, ip: &str) -> usize;
}

#[derive(Default)]
pub struct ConnectionControlManager {
    rule: RwLock<ConnectionControlRule>,
    collectors: RwLock<Vec<Arc<dyn ConnectionMetricsCollector>>>,
    admission: Mutex<()>,
}

impl ConnectionControlManager {
    pub fn new(rule: ConnectionControlRule) -> Self {
        Self {
            rule: RwLock::new(rule),
            collectors: RwLock::new(Vec::new()),
            admission: Mutex::new(()),
        }
    }

    pub fn register_collector(&self, collector: Arc<dyn ConnectionMetricsCollector>) {
        let mut collectors = self.collectors.write();
        collectors.retain(|c| c.name() != collector.name());
        info!(collector = collector.name(), "Registered connection metrics collector");
        collectors.push(collector);
    }

    pub fn apply_rule(&self, rule: ConnectionControlRule) {
        info!(
            count_limit = rule.count_limit,
            per_ip_default = rule.count_limit_per_ip_default,
            explicit_ips = rule.count_limit_per_client_ip.len(),
            "Applied connection control rule"
        );
        *self.rule.write() = rule;
    }

    pub fn rule(&self) -> ConnectionControlRule {
        self.rule.read().clone()
    }

    /// Reload the stored rule. Returns false if the store has none.
    pub async fn reload_rule(&self, store: &dyn RuleStore) -> anyhow::Result<bool> {
        match store.get_connection_rule().await? {
            Some(rule) => {
                self.apply_rule(rule);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Connection limit for the whole server, negative if unlimited
    pub fn count_limit(&self) -> i64 {
        self.rule.read().count_limit
    }

    pub fn per_ip_limit(&self, ip: &str) -> i64 {
        self.rule.read().ip_limit(ip)
    }

    pub fn per_app_limit(&self, app: &str) -> i64 {
        self.rule.read().app_limit(app)
    }

    pub fn total_count(&self) -> usize {
        self.collectors.read().iter().map(|c| c.total_count()).sum()
    }

    pub fn count_for_ip(&self, ip: &str) -> usize {
        self.collectors.read().iter().map(|c| c.count_for_ip(ip)).sum()
    }

    /// Check a new connection and, when it passes, run `register` before
    /// any other admission is checked, so two callers can never both take
    /// the last free slot. `register` returns whether it took a slot.
    pub fn admit(
        &self,
        request: &ConnectionCheckRequest,
        register: impl FnOnce() -> bool,
    ) -> Result<bool, ConnectionCheckResponse> {
        let _admission = self.admission.lock();
        let check = self.check(request);
        if !check.success {
            return Err(check);
        }
        Ok(register())
    }

    /// Decide whether one more connection from this client is accepted.
    pub fn check(&self, request: &ConnectionCheckRequest) -> ConnectionCheckResponse {
        if request.source == LABEL_SOURCE_CLUSTER {
            return ConnectionCheckResponse::pass(ConnectionCheckCode::CheckSkip);
        }
        let rule = self.rule.read().clone();
        if !rule.has_limits() {
            return ConnectionCheckResponse::pass(ConnectionCheckCode::CheckSkip);
        }
        let monitored = rule.monitor_ip_list.contains(&request.client_ip);

        let total = self.total_count() as i64;
        if rule.count_limit >= 0 && total >= rule.count_limit {
            if monitored {
                info!(client_ip = %request.client_ip, total, "Monitored client over total connection limit");
            } else {
                warn!(
                    client_ip = %request.client_ip,
                    total,
                    limit = rule.count_limit,
                    "Connection denied, total over limit"
                );
                return ConnectionCheckResponse::deny(
                    ConnectionCheckCode::DenyByTotalOver,
                    format!("total connections {} over limit {}", total, rule.count_limit),
                );
            }
        }

        let ip_limit = rule.ip_limit(&request.client_ip);
        if ip_limit >= 0 {
            let ip_count = self.count_for_ip(&request.client_ip) as i64;
            if ip_count >= ip_limit {
                if monitored {
                    info!(client_ip = %request.client_ip, ip_count, "Monitored client over ip connection limit");
                } else {
                    warn!(
                        client_ip = %request.client_ip,
                        ip_count,
                        limit = ip_limit,
                        "Connection denied, ip over limit"
                    );
                    return ConnectionCheckResponse::deny(
                        ConnectionCheckCode::DenyByIpOver,
                        format!(
                            "connections from {} ({}) over limit {}",
                            request.client_ip, ip_count, ip_limit
                        ),
                    );
                }
            }
        }

        ConnectionCheckResponse::pass(ConnectionCheckCode::PassByTotal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FixedCollector {
        name: &'static str,
        per_ip: HashMap<&'static str, usize>,
    }

    impl ConnectionMetricsCollector for FixedCollector {
        fn name(&self) -> &str {
            self.name
        }

        fn total_count(&self) -> usize {
            self.per_ip.values().sum()
        }

        fn count_for_ip(&self, ip: &str) -> usize {
            self.per_ip.get(ip).copied().unwrap_or(0)
        }
    }

    fn manager(rule: ConnectionControlRule) -> ConnectionControlManager {
        let manager = ConnectionControlManager::new(rule);
        manager.register_collector(Arc::new(FixedCollector {
            name: "rpc",
            per_ip: HashMap::from([("10.0.0.1", 3), ("10.0.0.2", 1)]),
        }));
        manager.register_collector(Arc::new(FixedCollector {
            name: "long_polling",
            per_ip: HashMap::from([("10.0.0.1", 1)]),
        }));
        manager
    }

    fn sdk(ip: &str) -> ConnectionCheckRequest {
        ConnectionCheckRequest::new(ip, "app", "sdk")
    }

    #[test]
    fn test_no_limits_skips() {
        let manager = manager(ConnectionControlRule::default());
        assert_eq!(manager.check(&sdk("10.0.0.1")).code, ConnectionCheckCode::CheckSkip);
    }

    #[test]
    fn test_total_over_limit() {
        let manager = manager(ConnectionControlRule::default().with_count_limit(5));
        assert_eq!(manager.total_count(), 5);

        let response = manager.check(&sdk("10.0.0.9"));
        assert!(!response.success);
        assert_eq!(response.code, ConnectionCheckCode::DenyByTotalOver);

        manager.apply_rule(ConnectionControlRule::default().with_count_limit(6));
        assert_eq!(manager.check(&sdk("10.0.0.9")).code, ConnectionCheckCode::PassByTotal);
    }

    #[test]
    fn test_ip_over_limit_counts_all_collectors() {
        let manager = manager(ConnectionControlRule::default().with_default_ip_limit(4));
        assert_eq!(manager.check(&sdk("10.0.0.1")).code, ConnectionCheckCode::DenyByIpOver);
        assert!(manager.check(&sdk("10.0.0.2")).success);
    }

    #[test]
    fn test_monitored_ip_never_denied() {
        let rule = ConnectionControlRule::default()
            .with_count_limit(1)
            .with_monitor_ip("10.0.0.1");
        let manager = manager(rule);
        assert!(manager.check(&sdk("10.0.0.1")).success);
        assert!(!manager.check(&sdk("10.0.0.2")).success);
    }

    #[test]
    fn test_cluster_source_skips() {
        let manager = manager(ConnectionControlRule::default().with_count_limit(0));
        let request = ConnectionCheckRequest::new("10.0.0.1", "", "cluster");
        assert_eq!(manager.check(&request).code, ConnectionCheckCode::CheckSkip);
    }

    struct CountingCollector(std::sync::atomic::AtomicUsize);

    impl ConnectionMetricsCollector for CountingCollector {
        fn name(&self) -> &str {
            "counting"
        }

        fn total_count(&self) -> usize {
            self.0.load(std::sync::atomic::Ordering::SeqCst)
        }

        fn count_for_ip(&self, _ip: &str) -> usize {
            self.total_count()
        }
    }

    #[test]
    fn test_admit_never_overshoots_the_limit() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let manager = Arc::new(ConnectionControlManager::new(
            ConnectionControlRule::default().with_count_limit(5),
        ));
        let counter = Arc::new(CountingCollector(AtomicUsize::new(0)));
        manager.register_collector(counter.clone());

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let manager = manager.clone();
                let counter = counter.clone();
                std::thread::spawn(move || {
                    manager
                        .admit(&sdk("10.0.0.1"), || {
                            let current = counter.0.load(Ordering::SeqCst);
                            std::thread::yield_now();
                            counter.0.store(current + 1, Ordering::SeqCst);
                            true
                        })
                        .is_ok()
                })
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(admitted, 5);
        assert_eq!(counter.total_count(), 5);
    }

    #[test]
    fn test_admit_denied_skips_register() {
        let manager = manager(ConnectionControlRule::default().with_count_limit(5));
        let denied = manager.admit(&sdk("10.0.0.9"), || panic!("registered over limit"));
        assert_eq!(denied.unwrap_err().code, ConnectionCheckCode::DenyByTotalOver);
    }
}
