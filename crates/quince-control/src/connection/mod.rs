//! Connection control
//!
//! Limits how many client connections the server accepts in total and per
//! client ip. Counts come from registered `ConnectionMetricsCollector`s, so
//! both long-lived rpc connections and suspended long-poll requests are seen.

mod manager;
mod model;

pub use manager::{ConnectionControlManager, ConnectionMetricsCollector};
pub use model::*;
