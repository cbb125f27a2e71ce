//! Rule barriers
//!
//! A `RuleBarrier` owns one `RuleDetail` and the counters it is checked
//! against. Replacing the detail swaps thresholds only, so counts already
//! committed in the active window survive a rule update.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::RwLock;

use super::counter::SlotCounter;
use super::matcher::MonitorKeyMatcher;
use super::model::{MonitorKey, MonitorType, RuleDetail, RuleModel};

/// Per-key counter maps larger than this are swept for idle keys
const PROTO_KEY_SWEEP_THRESHOLD: usize = 1024;

/// What a barrier applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BarrierScope {
    /// All traffic through the check point
    Point,
    /// Only requests carrying a monitor key matching the pattern
    Pattern(MonitorKeyMatcher),
}

/// One barrier's view of a TPS check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarrierCheckRequest {
    /// Rendered monitor key for pattern barriers
    pub monitor_key: Option<String>,
    pub timestamp: i64,
    pub count: i64,
    pub flow: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierOutcome {
    pub passed: bool,
    /// Whether this check left counts behind that a rollback must undo
    pub counted: bool,
    pub monitor_type: MonitorType,
}

/// Scope and thresholds, replaced together
#[derive(Debug)]
struct BarrierState {
    scope: BarrierScope,
    detail: RuleDetail,
}

#[derive(Debug)]
pub struct RuleBarrier {
    point_name: String,
    state: RwLock<BarrierState>,
    total: SlotCounter,
    per_key: DashMap<String, SlotCounter>,
    passed: AtomicU64,
    denied: AtomicU64,
}

impl RuleBarrier {
    pub fn point(point_name: impl Into<String>, detail: RuleDetail) -> Self {
        Self::with_scope(point_name, BarrierScope::Point, detail)
    }

    /// Build a pattern barrier; `None` if the detail's pattern is not `type:glob`.
    pub fn pattern(point_name: impl Into<String>, detail: RuleDetail) -> Option<Self> {
        let matcher = MonitorKeyMatcher::parse(&detail.pattern)?;
        Some(Self::with_scope(
            point_name,
            BarrierScope::Pattern(matcher),
            detail,
        ))
    }

    fn with_scope(point_name: impl Into<String>, scope: BarrierScope, detail: RuleDetail) -> Self {
        Self {
            point_name: point_name.into(),
            state: RwLock::new(BarrierState { scope, detail }),
            total: SlotCounter::new(),
            per_key: DashMap::new(),
            passed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
        }
    }

    pub fn point_name(&self) -> &str {
        &self.point_name
    }

    pub fn rule_name(&self) -> String {
        self.state.read().detail.rule_name.clone()
    }

    pub fn detail(&self) -> RuleDetail {
        self.state.read().detail.clone()
    }

    pub fn order(&self) -> i32 {
        self.state.read().detail.order
    }

    /// Specificity of the pattern, lower is more specific. Point barriers sort last.
    pub fn specificity(&self) -> u8 {
        match &self.state.read().scope {
            BarrierScope::Point => u8::MAX,
            BarrierScope::Pattern(m) => m.specificity(),
        }
    }

    pub fn matches(&self, key: &MonitorKey) -> bool {
        match &self.state.read().scope {
            BarrierScope::Point => true,
            BarrierScope::Pattern(m) => m.matches(key),
        }
    }

    /// Replace the thresholds. Counters are kept; switching to the fuzzy model
    /// drops the per-key counters since only the aggregate is consulted then.
    pub fn apply_rule_detail(&self, detail: RuleDetail) {
        let mut state = self.state.write();
        if let BarrierScope::Pattern(_) = state.scope {
            match MonitorKeyMatcher::parse(&detail.pattern) {
                Some(matcher) => state.scope = BarrierScope::Pattern(matcher),
                None => {
                    tracing::warn!(
                        point_name = %self.point_name,
                        pattern = %detail.pattern,
                        "Ignoring rule detail with invalid monitor key pattern"
                    );
                    return;
                }
            }
        }

        if detail.model == RuleModel::Fuzzy && state.detail.model == RuleModel::Proto {
            self.per_key.clear();
        }
        tracing::info!(
            point_name = %self.point_name,
            rule_name = %detail.rule_name,
            max_count = detail.max_count,
            max_flow = detail.max_flow,
            monitor_type = ?detail.monitor_type,
            "Applied tps rule detail"
        );
        state.detail = detail;
    }

    /// Count the request against this barrier.
    ///
    /// Intercept mode only counts requests that fit; monitor mode always counts
    /// and reports whether the threshold was exceeded.
    pub fn apply_tps(&self, request: &BarrierCheckRequest) -> BarrierOutcome {
        let detail = self.state.read().detail.clone();
        let period = detail.period.millis();
        let ts = request.timestamp;

        let outcome = match detail.model {
            RuleModel::Fuzzy => self.check_counter(&self.total, &detail, request),
            RuleModel::Proto => {
                let key = request.monitor_key.clone().unwrap_or_default();
                let outcome = {
                    let counter = self.per_key.entry(key).or_default();
                    self.check_counter(&counter, &detail, request)
                };
                if outcome.counted {
                    self.total.add(ts, period, request.count, request.flow);
                }
                if self.per_key.len() > PROTO_KEY_SWEEP_THRESHOLD {
                    self.per_key.retain(|_, c| !c.is_idle(ts, period));
                }
                outcome
            }
        };

        if outcome.passed {
            self.passed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.denied.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    fn check_counter(
        &self,
        counter: &SlotCounter,
        detail: &RuleDetail,
        request: &BarrierCheckRequest,
    ) -> BarrierOutcome {
        let period = detail.period.millis();
        match detail.monitor_type {
            MonitorType::Intercept => {
                let passed = counter.try_add(
                    request.timestamp,
                    period,
                    request.count,
                    request.flow,
                    detail.max_count,
                    detail.max_flow,
                );
                BarrierOutcome {
                    passed,
                    counted: passed,
                    monitor_type: MonitorType::Intercept,
                }
            }
            MonitorType::Monitor => {
                let totals = counter.add(request.timestamp, period, request.count, request.flow);
                BarrierOutcome {
                    passed: totals.within(detail.max_count, detail.max_flow),
                    counted: true,
                    monitor_type: MonitorType::Monitor,
                }
            }
        }
    }

    /// Undo the counts a previous `apply_tps` left behind.
    pub fn rollback_tps(&self, request: &BarrierCheckRequest) {
        let detail = self.state.read().detail.clone();
        let period = detail.period.millis();
        if detail.model == RuleModel::Proto {
            let key = request.monitor_key.as_deref().unwrap_or_default();
            if let Some(counter) = self.per_key.get(key) {
                counter.minus(request.timestamp, period, request.count, request.flow);
            }
        }
        self.total
            .minus(request.timestamp, period, request.count, request.flow);
    }

    /// Record the request without checking thresholds.
    pub fn commit_tps(&self, request: &BarrierCheckRequest) {
        let detail = self.state.read().detail.clone();
        let period = detail.period.millis();
        if detail.model == RuleModel::Proto {
            let key = request.monitor_key.clone().unwrap_or_default();
            self.per_key
                .entry(key)
                .or_default()
                .add(request.timestamp, period, request.count, request.flow);
        }
        self.total
            .add(request.timestamp, period, request.count, request.flow);
    }

    /// Aggregate count in the bucket containing `timestamp`
    pub fn current_count(&self, timestamp: i64) -> i64 {
        let period = self.state.read().detail.period.millis();
        self.total.current(timestamp, period).count
    }

    pub fn passed_total(&self) -> u64 {
        self.passed.load(Ordering::Relaxed)
    }

    pub fn denied_total(&self) -> u64 {
        self.denied.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(ts: i64, key: Option<&str>) -> BarrierCheckRequest {
        BarrierCheckRequest {
            monitor_key: key.map(str::to_string),
            timestamp: ts,
            count: 1,
            flow: 0,
        }
    }

    #[test]
    fn test_intercept_point_barrier() {
        let barrier = RuleBarrier::point("p", RuleDetail::count_limit(2, MonitorType::Intercept));
        assert!(barrier.apply_tps(&request(0, None)).passed);
        assert!(barrier.apply_tps(&request(1, None)).passed);

        let denied = barrier.apply_tps(&request(2, None));
        assert!(!denied.passed);
        assert!(!denied.counted);
        assert_eq!(barrier.current_count(2), 2);
        assert_eq!(barrier.denied_total(), 1);
    }

    #[test]
    fn test_monitor_mode_counts_past_limit() {
        let barrier = RuleBarrier::point("p", RuleDetail::count_limit(1, MonitorType::Monitor));
        assert!(barrier.apply_tps(&request(0, None)).passed);

        let over = barrier.apply_tps(&request(1, None));
        assert!(!over.passed);
        assert!(over.counted);
        assert_eq!(barrier.current_count(1), 2);
    }

    #[test]
    fn test_rollback_frees_a_slot() {
        let barrier = RuleBarrier::point("p", RuleDetail::count_limit(1, MonitorType::Intercept));
        let req = request(0, None);
        assert!(barrier.apply_tps(&req).passed);
        assert!(!barrier.apply_tps(&req).passed);

        barrier.rollback_tps(&req);
        assert!(barrier.apply_tps(&req).passed);
    }

    #[test]
    fn test_proto_model_counts_per_key() {
        let detail = RuleDetail::count_limit(1, MonitorType::Intercept)
            .pattern("clientIp:*")
            .model(RuleModel::Proto);
        let barrier = RuleBarrier::pattern("p", detail).unwrap();

        assert!(barrier.apply_tps(&request(0, Some("clientIp:1.1.1.1"))).passed);
        assert!(barrier.apply_tps(&request(0, Some("clientIp:2.2.2.2"))).passed);
        assert!(!barrier.apply_tps(&request(0, Some("clientIp:1.1.1.1"))).passed);
        assert_eq!(barrier.current_count(0), 2);
    }

    #[test]
    fn test_fuzzy_model_counts_aggregate() {
        let detail = RuleDetail::count_limit(1, MonitorType::Intercept).pattern("clientIp:*");
        let barrier = RuleBarrier::pattern("p", detail).unwrap();

        assert!(barrier.apply_tps(&request(0, Some("clientIp:1.1.1.1"))).passed);
        assert!(!barrier.apply_tps(&request(0, Some("clientIp:2.2.2.2"))).passed);
    }

    #[test]
    fn test_rule_update_keeps_counts() {
        let barrier = RuleBarrier::point("p", RuleDetail::count_limit(5, MonitorType::Intercept));
        for ts in 0..3 {
            assert!(barrier.apply_tps(&request(ts, None)).passed);
        }

        barrier.apply_rule_detail(RuleDetail::count_limit(3, MonitorType::Intercept));
        assert_eq!(barrier.current_count(10), 3);
        assert!(!barrier.apply_tps(&request(10, None)).passed);
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let detail = RuleDetail::count_limit(1, MonitorType::Intercept).pattern("nopattern");
        assert!(RuleBarrier::pattern("p", detail).is_none());
    }

    #[test]
    fn test_pattern_update_swaps_scope_with_thresholds() {
        let detail = RuleDetail::count_limit(1, MonitorType::Intercept).pattern("clientIp:10.*");
        let barrier = RuleBarrier::pattern("p", detail).unwrap();
        assert!(barrier.matches(&MonitorKey::client_ip("10.0.0.1")));

        let invalid = RuleDetail::count_limit(9, MonitorType::Intercept).pattern("nopattern");
        barrier.apply_rule_detail(invalid);
        assert_eq!(barrier.detail().max_count, 1);
        assert!(barrier.matches(&MonitorKey::client_ip("10.0.0.1")));

        let moved = RuleDetail::count_limit(7, MonitorType::Intercept).pattern("clientIp:192.*");
        barrier.apply_rule_detail(moved);
        assert_eq!(barrier.detail().max_count, 7);
        assert!(!barrier.matches(&MonitorKey::client_ip("10.0.0.1")));
        assert!(barrier.matches(&MonitorKey::client_ip("192.168.0.1")));
    }
}
