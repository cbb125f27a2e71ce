//! Error types and error codes for Quince
//!
//! This module defines:
//! - `QuinceError`: Application-specific error enum
//! - `ErrorCode`: Structured error codes for API responses

use serde::{Deserialize, Serialize};

/// Application-specific error types
#[derive(thiserror::Error, Debug)]
pub enum QuinceError {
    #[error("caused: {0}")]
    IllegalArgument(String),

    #[error("connection '{0}' already closed")]
    ConnectionAlreadyClosed(String),

    #[error("request '{0}' timed out")]
    RequestTimeout(String),

    #[error("request '{0}' evicted before it was acknowledged")]
    RequestEvicted(String),

    #[error("disk error: {0}")]
    Disk(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, QuinceError>;

/// Error code structure for API responses
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct ErrorCode<'a> {
    pub code: i32,
    pub message: &'a str,
}

pub const SUCCESS: ErrorCode<'static> = ErrorCode {
    code: 0,
    message: "success",
};

pub const PARAMETER_MISSING: ErrorCode<'static> = ErrorCode {
    code: 10000,
    message: "parameter missing",
};

pub const PARAMETER_VALIDATE_ERROR: ErrorCode<'static> = ErrorCode {
    code: 20002,
    message: "parameter validate error",
};

pub const RESOURCE_NOT_FOUND: ErrorCode<'static> = ErrorCode {
    code: 20004,
    message: "resource not found",
};

pub const RESOURCE_CONFLICT: ErrorCode<'static> = ErrorCode {
    code: 20005,
    message: "resource conflict",
};

pub const OVER_THRESHOLD: ErrorCode<'static> = ErrorCode {
    code: 503,
    message: "request over threshold",
};

pub const SERVER_ERROR: ErrorCode<'static> = ErrorCode {
    code: 30000,
    message: "server error",
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quince_error_display() {
        let err = QuinceError::IllegalArgument("invalid param".to_string());
        assert_eq!(format!("{}", err), "caused: invalid param");

        let err = QuinceError::ConnectionAlreadyClosed("conn-1".to_string());
        assert_eq!(format!("{}", err), "connection 'conn-1' already closed");
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::other("disk full");
        let err: QuinceError = io.into();
        assert!(matches!(err, QuinceError::Disk(_)));
    }

    #[test]
    fn test_error_code_constants() {
        assert_eq!(SUCCESS.code, 0);
        assert_eq!(RESOURCE_NOT_FOUND.code, 20004);
        assert_eq!(RESOURCE_CONFLICT.code, 20005);
        assert_eq!(OVER_THRESHOLD.code, 503);
    }
}
