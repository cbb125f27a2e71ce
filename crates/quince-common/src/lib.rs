//! Quince Common - Shared types, errors, and utilities
//!
//! This crate provides the foundational types used across all Quince components:
//! - Error types and error codes
//! - Group key encoding for configuration items
//! - Content digest helpers
//! - An explicitly constructed event bus

pub mod error;
pub mod event;
pub mod group_key;
pub mod utils;

// Re-exports for convenience
pub use error::{ErrorCode, QuinceError, Result};
pub use event::EventPublisher;
pub use utils::{is_valid, md5_hex, now_millis};

/// Label key carrying where a connection came from
pub const LABEL_SOURCE: &str = "source";
pub const LABEL_SOURCE_SDK: &str = "sdk";
pub const LABEL_SOURCE_CLUSTER: &str = "cluster";

/// Label key carrying the client application name
pub const LABEL_APP_NAME: &str = "AppName";
