//! Quince Control - Rate limiting and connection control
//!
//! This crate provides:
//! - TPS control: per-point and per-monitor-key rule barriers with
//!   interceptors and denied-event reporting
//! - Connection control: global, per-ip, and per-app connection limits
//! - Rule storage in memory or on local disk

pub mod connection;
pub mod rule_store;
pub mod tps;

pub use connection::{
    ConnectionCheckCode, ConnectionCheckRequest, ConnectionCheckResponse,
    ConnectionControlManager, ConnectionControlRule, ConnectionMetricsCollector,
};
pub use rule_store::{LocalDiskRuleStore, MemoryRuleStore, RuleStore};
pub use tps::{
    InterceptResult, InterceptStage, MonitorKey, MonitorType, RuleDetail, RuleModel, TpsBarrier,
    TpsCheckRequest, TpsCheckResponse, TpsControlConfig, TpsControlManager, TpsControlRule,
    TpsDeniedEvent, TpsInterceptor, TpsPeriod, TpsResultCode,
};
