//! Check point barrier
//!
//! Decision order: pre-interceptors, the point barrier in intercept mode,
//! pattern barriers, post-interceptors, and finally a monitor-mode point
//! denial as the fallback verdict. Counts left behind by barriers that passed
//! are rolled back whenever the final verdict is a denial.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use quince_common::EventPublisher;

use super::barrier::{BarrierCheckRequest, BarrierOutcome, RuleBarrier};
use super::interceptor::{InterceptResult, InterceptStage, TpsInterceptor};
use super::model::{
    MonitorType, RuleDetail, TpsCheckRequest, TpsCheckResponse, TpsControlRule, TpsDeniedEvent,
    TpsResultCode,
};

/// A barrier consulted during one check and whether it kept the request's counts
struct Consulted {
    barrier: Arc<RuleBarrier>,
    request: BarrierCheckRequest,
    counted: bool,
}

#[derive(Default)]
struct Ledger {
    entries: Vec<Consulted>,
}

impl Ledger {
    fn record(&mut self, barrier: &Arc<RuleBarrier>, request: BarrierCheckRequest, outcome: &BarrierOutcome) {
        self.entries.push(Consulted {
            barrier: barrier.clone(),
            request,
            counted: outcome.counted,
        });
    }

    fn rollback(&mut self) {
        for entry in self.entries.iter_mut().rev().filter(|e| e.counted) {
            entry.barrier.rollback_tps(&entry.request);
            entry.counted = false;
        }
    }

    fn commit(&mut self) {
        for entry in self.entries.iter_mut().filter(|e| !e.counted) {
            entry.barrier.commit_tps(&entry.request);
            entry.counted = true;
        }
    }
}

pub struct TpsBarrier {
    point_name: String,
    point_barrier: Arc<RuleBarrier>,
    patterns: RwLock<Vec<Arc<RuleBarrier>>>,
    interceptors: RwLock<Vec<Arc<dyn TpsInterceptor>>>,
    denied_events: EventPublisher<TpsDeniedEvent>,
}

fn unlimited_point_detail(point_name: &str) -> RuleDetail {
    RuleDetail {
        rule_name: point_name.to_string(),
        ..Default::default()
    }
}

impl TpsBarrier {
    pub fn new(point_name: impl Into<String>, denied_events: EventPublisher<TpsDeniedEvent>) -> Self {
        let point_name = point_name.into();
        let point_barrier = Arc::new(RuleBarrier::point(
            point_name.clone(),
            unlimited_point_detail(&point_name),
        ));
        Self {
            point_name,
            point_barrier,
            patterns: RwLock::new(Vec::new()),
            interceptors: RwLock::new(Vec::new()),
            denied_events,
        }
    }

    pub fn point_name(&self) -> &str {
        &self.point_name
    }

    pub fn point_barrier(&self) -> &Arc<RuleBarrier> {
        &self.point_barrier
    }

    pub fn pattern_barriers(&self) -> Vec<Arc<RuleBarrier>> {
        self.patterns.read().clone()
    }

    /// Install the point rule and pattern rules.
    ///
    /// Pattern barriers are matched to existing ones by rule name so counts
    /// in the active window survive. A missing point rule means unlimited.
    pub fn apply_rule(&self, rule: &TpsControlRule) {
        let mut point_detail = rule
            .point_rule
            .clone()
            .unwrap_or_else(|| unlimited_point_detail(&self.point_name));
        if point_detail.rule_name.is_empty() {
            point_detail.rule_name = self.point_name.clone();
        }
        self.point_barrier.apply_rule_detail(point_detail);

        let mut patterns = self.patterns.write();
        let mut existing: HashMap<String, Arc<RuleBarrier>> =
            patterns.drain(..).map(|b| (b.rule_name(), b)).collect();

        for (rule_name, detail) in &rule.monitor_key_rule {
            let mut detail = detail.clone();
            detail.rule_name = rule_name.clone();

            match existing.remove(rule_name) {
                Some(barrier) => {
                    barrier.apply_rule_detail(detail);
                    patterns.push(barrier);
                }
                None => match RuleBarrier::pattern(self.point_name.clone(), detail) {
                    Some(barrier) => patterns.push(Arc::new(barrier)),
                    None => warn!(
                        point_name = %self.point_name,
                        rule_name = %rule_name,
                        "Skipping monitor key rule with invalid pattern"
                    ),
                },
            }
        }

        patterns.sort_by(|a, b| {
            a.order()
                .cmp(&b.order())
                .then(a.specificity().cmp(&b.specificity()))
                .then_with(|| a.rule_name().cmp(&b.rule_name()))
        });
        debug!(
            point_name = %self.point_name,
            pattern_count = patterns.len(),
            "Applied tps control rule"
        );
    }

    /// Current rule set, as it would be stored
    pub fn rule(&self) -> TpsControlRule {
        TpsControlRule {
            point_name: self.point_name.clone(),
            point_rule: Some(self.point_barrier.detail()),
            monitor_key_rule: self
                .patterns
                .read()
                .iter()
                .map(|b| (b.rule_name(), b.detail()))
                .collect(),
        }
    }

    pub fn add_interceptor(&self, interceptor: Arc<dyn TpsInterceptor>) {
        let mut interceptors = self.interceptors.write();
        interceptors.retain(|i| i.name() != interceptor.name());
        interceptors.push(interceptor);
        interceptors.sort_by_key(|i| i.order());
    }

    fn run_interceptors(&self, stage: InterceptStage, request: &TpsCheckRequest) -> InterceptResult {
        let interceptors = self.interceptors.read().clone();
        for interceptor in interceptors
            .iter()
            .filter(|i| i.stage() == stage && !i.is_disabled())
        {
            match interceptor.intercept(request) {
                InterceptResult::CheckSkip => continue,
                verdict => {
                    debug!(
                        point_name = %self.point_name,
                        interceptor = interceptor.name(),
                        ?verdict,
                        "Interceptor decided tps check"
                    );
                    return verdict;
                }
            }
        }
        InterceptResult::CheckSkip
    }

    fn publish_denied(
        &self,
        rule_name: String,
        monitor_key: Option<String>,
        is_monitor_model: bool,
        code: TpsResultCode,
        timestamp: i64,
    ) {
        self.denied_events.publish(TpsDeniedEvent {
            point_name: self.point_name.clone(),
            rule_name,
            monitor_key,
            is_monitor_model,
            code,
            timestamp,
        });
    }

    pub fn apply_tps(&self, request: &TpsCheckRequest) -> TpsCheckResponse {
        match self.run_interceptors(InterceptStage::Pre, request) {
            InterceptResult::CheckPass => {
                return TpsCheckResponse::pass(TpsResultCode::PassByPreInterceptor);
            }
            InterceptResult::CheckDeny => {
                self.publish_denied(
                    "preInterceptor".to_string(),
                    None,
                    false,
                    TpsResultCode::DenyByPreInterceptor,
                    request.timestamp,
                );
                return TpsCheckResponse::deny(
                    TpsResultCode::DenyByPreInterceptor,
                    "denied by pre interceptor",
                );
            }
            InterceptResult::CheckSkip => {}
        }

        let mut ledger = Ledger::default();
        let verdict = self.apply_barriers(request, &mut ledger);
        if !verdict.success {
            ledger.rollback();
        }

        match self.run_interceptors(InterceptStage::Post, request) {
            InterceptResult::CheckPass => {
                if !verdict.success {
                    ledger.commit();
                }
                TpsCheckResponse::pass(TpsResultCode::PassByPostInterceptor)
            }
            InterceptResult::CheckDeny => {
                if verdict.success {
                    ledger.rollback();
                }
                self.publish_denied(
                    "postInterceptor".to_string(),
                    None,
                    false,
                    TpsResultCode::DenyByPostInterceptor,
                    request.timestamp,
                );
                TpsCheckResponse::deny(
                    TpsResultCode::DenyByPostInterceptor,
                    "denied by post interceptor",
                )
            }
            InterceptResult::CheckSkip => verdict,
        }
    }

    fn apply_barriers(&self, request: &TpsCheckRequest, ledger: &mut Ledger) -> TpsCheckResponse {
        let mut monitor_denied = false;

        let point_request = BarrierCheckRequest {
            monitor_key: None,
            timestamp: request.timestamp,
            count: request.count,
            flow: request.flow,
        };
        let outcome = self.point_barrier.apply_tps(&point_request);
        ledger.record(&self.point_barrier, point_request, &outcome);
        if !outcome.passed {
            let is_monitor = outcome.monitor_type == MonitorType::Monitor;
            self.publish_denied(
                self.point_barrier.rule_name(),
                None,
                is_monitor,
                TpsResultCode::DenyByPoint,
                request.timestamp,
            );
            if !is_monitor {
                return TpsCheckResponse::deny(
                    TpsResultCode::DenyByPoint,
                    format!("tps over limit at point {}", self.point_name),
                );
            }
            monitor_denied = true;
        }

        let patterns = self.patterns.read().clone();
        for barrier in &patterns {
            for key in request.monitor_keys.iter().filter(|k| barrier.matches(k)) {
                let key_request = BarrierCheckRequest {
                    monitor_key: Some(key.build()),
                    timestamp: request.timestamp,
                    count: request.count,
                    flow: request.flow,
                };
                let outcome = barrier.apply_tps(&key_request);
                ledger.record(barrier, key_request, &outcome);

                match (outcome.passed, outcome.monitor_type) {
                    (true, MonitorType::Intercept) => {
                        return TpsCheckResponse::pass(TpsResultCode::PassByPattern);
                    }
                    (true, MonitorType::Monitor) => {}
                    (false, monitor_type) => {
                        let is_monitor = monitor_type == MonitorType::Monitor;
                        self.publish_denied(
                            barrier.rule_name(),
                            Some(key.build()),
                            is_monitor,
                            TpsResultCode::DenyByPattern,
                            request.timestamp,
                        );
                        if !is_monitor {
                            return TpsCheckResponse::deny(
                                TpsResultCode::DenyByPattern,
                                format!("tps over limit for {} by rule {}", key, barrier.rule_name()),
                            );
                        }
                        monitor_denied = true;
                    }
                }
            }
        }

        if monitor_denied {
            TpsCheckResponse::pass(TpsResultCode::PassByMonitor)
        } else {
            TpsCheckResponse::pass(TpsResultCode::PassByPoint)
        }
    }
}
