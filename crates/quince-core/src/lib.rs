//! Quince Core - Connection management
//!
//! This crate provides:
//! - Client connections and server-to-client request correlation
//! - The connection registry with incremental per-ip counts
//! - Runtime ejection of over-limit and unresponsive connections
//! - The configuration wrapper shared by all components

pub mod model;
pub mod service;

// Re-export commonly used types
pub use model::{
    ClientDetectionRequest, ClientResponse, Configuration, ConnectResetRequest, ConnectionMeta,
    Payload,
};
pub use service::{
    Connection, ConnectionEventListener, ConnectionManager, DefaultConnectionEjector, EjectReport,
    EjectorConfig, RpcAckSynchronizer, RuntimeConnectionEjector, start_ejector,
};
