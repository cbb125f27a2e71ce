//! TPS control manager
//!
//! Registry of check points. Requests for a point that was never registered
//! pass with `CHECK_PASS`.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use quince_common::EventPublisher;

use super::interceptor::TpsInterceptor;
use super::model::{TpsCheckRequest, TpsCheckResponse, TpsControlRule, TpsDeniedEvent, TpsResultCode};
use super::tps_barrier::TpsBarrier;
use crate::rule_store::RuleStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpsControlConfig {
    /// How often per-point totals are logged
    pub reporter_interval_ms: u64,
    /// Buffered denied events per subscriber
    pub denied_event_capacity: usize,
}

impl Default for TpsControlConfig {
    fn default() -> Self {
        Self {
            reporter_interval_ms: 60_000,
            denied_event_capacity: 1024,
        }
    }
}

/// Pass/deny totals of one check point's point barrier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpsPointStats {
    pub point_name: String,
    pub passed: u64,
    pub denied: u64,
    pub pattern_rules: usize,
}

pub struct TpsControlManager {
    config: TpsControlConfig,
    points: DashMap<String, Arc<TpsBarrier>>,
    interceptors: RwLock<Vec<Arc<dyn TpsInterceptor>>>,
    denied_events: EventPublisher<TpsDeniedEvent>,
}

impl Default for TpsControlManager {
    fn default() -> Self {
        Self::new(TpsControlConfig::default())
    }
}

impl TpsControlManager {
    pub fn new(config: TpsControlConfig) -> Self {
        let denied_events = EventPublisher::new(config.denied_event_capacity);
        Self {
            config,
            points: DashMap::new(),
            interceptors: RwLock::new(Vec::new()),
            denied_events,
        }
    }

    pub fn denied_events(&self) -> &EventPublisher<TpsDeniedEvent> {
        &self.denied_events
    }

    /// Register a check point, returning the existing barrier if already present.
    pub fn register_point(&self, point_name: &str) -> Arc<TpsBarrier> {
        self.points
            .entry(point_name.to_string())
            .or_insert_with(|| {
                let barrier = TpsBarrier::new(point_name, self.denied_events.clone());
                for interceptor in self.interceptors.read().iter() {
                    if interceptor.applies_to(point_name) {
                        barrier.add_interceptor(interceptor.clone());
                    }
                }
                info!(point_name, "Registered tps check point");
                Arc::new(barrier)
            })
            .clone()
    }

    pub fn point(&self, point_name: &str) -> Option<Arc<TpsBarrier>> {
        self.points.get(point_name).map(|b| b.clone())
    }

    pub fn point_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.points.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Install a rule, registering the point if needed.
    pub fn apply_rule(&self, point_name: &str, rule: &TpsControlRule) {
        self.register_point(point_name).apply_rule(rule);
    }

    pub fn check(&self, request: &TpsCheckRequest) -> TpsCheckResponse {
        match self.point(&request.point_name) {
            Some(barrier) => barrier.apply_tps(request),
            None => TpsCheckResponse::pass(TpsResultCode::CheckPass),
        }
    }

    /// Add an interceptor to every matching point, now and in the future.
    pub fn add_interceptor(&self, interceptor: Arc<dyn TpsInterceptor>) {
        {
            let mut interceptors = self.interceptors.write();
            interceptors.retain(|i| i.name() != interceptor.name());
            interceptors.push(interceptor.clone());
        }
        for entry in self.points.iter() {
            if interceptor.applies_to(entry.key()) {
                entry.value().add_interceptor(interceptor.clone());
            }
        }
        info!(
            interceptor = interceptor.name(),
            stage = ?interceptor.stage(),
            "Added tps interceptor"
        );
    }

    /// Apply every stored rule. Returns how many rules were applied.
    pub async fn reload_rules(&self, store: &dyn RuleStore) -> anyhow::Result<usize> {
        let rules = store.list_tps_rules().await?;
        let applied = rules.len();
        for rule in rules {
            self.apply_rule(&rule.point_name, &rule);
        }
        info!(applied, "Reloaded tps control rules");
        Ok(applied)
    }

    pub fn stats(&self) -> Vec<TpsPointStats> {
        let mut stats: Vec<TpsPointStats> = self
            .points
            .iter()
            .map(|entry| {
                let barrier = entry.value();
                TpsPointStats {
                    point_name: entry.key().clone(),
                    passed: barrier.point_barrier().passed_total(),
                    denied: barrier.point_barrier().denied_total(),
                    pattern_rules: barrier.pattern_barriers().len(),
                }
            })
            .collect();
        stats.sort_by(|a, b| a.point_name.cmp(&b.point_name));
        stats
    }

    /// Spawn the task that logs denials and periodic per-point totals.
    pub fn start_reporter(self: Arc<Self>) -> JoinHandle<()> {
        let mut denied = self.denied_events.subscribe();
        let period = Duration::from_millis(self.config.reporter_interval_ms.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for s in self.stats() {
                            info!(
                                point_name = %s.point_name,
                                passed = s.passed,
                                denied = s.denied,
                                pattern_rules = s.pattern_rules,
                                "Tps point report"
                            );
                        }
                    }
                    event = denied.recv() => match event {
                        Ok(event) => warn!(
                            point_name = %event.point_name,
                            rule_name = %event.rule_name,
                            monitor_key = ?event.monitor_key,
                            monitor = event.is_monitor_model,
                            code = %event.code,
                            "Tps denied"
                        ),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Tps denied events dropped by reporter");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tps::interceptor::ClientIpWhitelistInterceptor;
    use crate::tps::model::{MonitorKey, MonitorType, RuleDetail};

    fn limit(point: &str, max: i64) -> TpsControlRule {
        TpsControlRule {
            point_name: point.to_string(),
            point_rule: Some(RuleDetail::count_limit(max, MonitorType::Intercept)),
            ..Default::default()
        }
    }

    #[test]
    fn test_unregistered_point_check_pass() {
        let manager = TpsControlManager::default();
        let response = manager.check(&TpsCheckRequest::new("Unknown"));
        assert!(response.success);
        assert_eq!(response.code, TpsResultCode::CheckPass);
    }

    #[test]
    fn test_apply_rule_registers_point() {
        let manager = TpsControlManager::default();
        manager.apply_rule("ConfigPublish", &limit("ConfigPublish", 1));
        assert_eq!(manager.point_names(), vec!["ConfigPublish"]);

        let request = TpsCheckRequest::new("ConfigPublish").with_timestamp(0);
        assert!(manager.check(&request).success);
        assert_eq!(manager.check(&request).code, TpsResultCode::DenyByPoint);

        let stats = manager.stats();
        assert_eq!(stats[0].passed, 1);
        assert_eq!(stats[0].denied, 1);
    }

    #[test]
    fn test_interceptor_reaches_existing_and_new_points() {
        let manager = TpsControlManager::default();
        manager.apply_rule("A", &limit("A", 0));
        manager.add_interceptor(Arc::new(ClientIpWhitelistInterceptor::new(
            "*",
            vec!["10.0.0.1".to_string()],
        )));
        manager.apply_rule("B", &limit("B", 0));

        for point in ["A", "B"] {
            let request = TpsCheckRequest::new(point)
                .with_monitor_key(MonitorKey::client_ip("10.0.0.1"));
            assert_eq!(
                manager.check(&request).code,
                TpsResultCode::PassByPreInterceptor
            );
        }
    }
}
