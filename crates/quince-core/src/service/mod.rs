// Core services for connection management

pub mod ack;
pub mod connection;
pub mod ejector;
pub mod remote;

// Re-export commonly used types
pub use ack::RpcAckSynchronizer;
pub use connection::Connection;
pub use ejector::{
    DefaultConnectionEjector, EjectReport, EjectorConfig, RuntimeConnectionEjector, start_ejector,
};
pub use remote::{ConnectionEventListener, ConnectionManager, LoadOverride};
