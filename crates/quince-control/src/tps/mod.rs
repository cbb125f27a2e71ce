//! TPS control
//!
//! A `TpsBarrier` guards one named check point. It combines a point-level
//! `RuleBarrier` with pattern-level barriers keyed by monitor keys such as
//! `clientIp:10.0.0.*`, and runs registered interceptors around them.

mod barrier;
mod counter;
mod interceptor;
mod manager;
mod matcher;
mod model;
mod tps_barrier;

pub use barrier::{BarrierCheckRequest, BarrierOutcome, BarrierScope, RuleBarrier};
pub use counter::{SlotCounter, SlotTotals};
pub use interceptor::{ClientIpWhitelistInterceptor, InterceptResult, InterceptStage, TpsInterceptor};
pub use manager::{TpsControlConfig, TpsControlManager, TpsPointStats};
pub use matcher::{MonitorKeyMatcher, PatternKind};
pub use model::*;
pub use tps_barrier::TpsBarrier;
