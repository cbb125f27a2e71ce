//! Application startup: logging and the HTTP server

mod http;
pub mod logging;

pub use http::main_server;
pub use logging::{LogRotation, LoggingConfig, LoggingGuard, init_logging};
