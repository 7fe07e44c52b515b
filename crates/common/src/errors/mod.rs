//! Error types for LedgerForge services
//!
//! Provides a comprehensive error handling system with:
//! - Distinct error types for different failure modes
//! - Error kinds that drive the pipeline's retry decisions
//! - Error codes for client handling

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (1xxx)
    ValidationError,
    InvalidFormat,
    PayloadTooLarge,
    UnsupportedMediaType,

    // Resource errors (4xxx)
    NotFound,
    BatchNotFound,
    ItemNotFound,

    // Conflict errors (5xxx)
    Conflict,
    InvalidTransition,
    BatchCancelled,
    BatchPromoted,

    // Database errors (7xxx)
    DatabaseError,
    ConnectionError,

    // External service errors (8xxx)
    UpstreamError,
    OcrError,
    DestinationError,
    Timeout,

    // Internal errors (9xxx)
    InternalError,
    ConfigurationError,
    SerializationError,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            // Validation (1xxx)
            ErrorCode::ValidationError => 1001,
            ErrorCode::InvalidFormat => 1003,
            ErrorCode::PayloadTooLarge => 1004,
            ErrorCode::UnsupportedMediaType => 1005,

            // Resources (4xxx)
            ErrorCode::NotFound => 4001,
            ErrorCode::BatchNotFound => 4002,
            ErrorCode::ItemNotFound => 4003,

            // Conflicts (5xxx)
            ErrorCode::Conflict => 5001,
            ErrorCode::InvalidTransition => 5004,
            ErrorCode::BatchCancelled => 5005,
            ErrorCode::BatchPromoted => 5006,

            // Database (7xxx)
            ErrorCode::DatabaseError => 7001,
            ErrorCode::ConnectionError => 7002,

            // External (8xxx)
            ErrorCode::UpstreamError => 8001,
            ErrorCode::OcrError => 8002,
            ErrorCode::DestinationError => 8003,
            ErrorCode::Timeout => 8004,

            // Internal (9xxx)
            ErrorCode::InternalError => 9001,
            ErrorCode::ConfigurationError => 9002,
            ErrorCode::SerializationError => 9003,
        }
    }

    /// Stable string form, used when errors are stored on items
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::InvalidFormat => "INVALID_FORMAT",
            ErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ErrorCode::UnsupportedMediaType => "UNSUPPORTED_MEDIA_TYPE",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::BatchNotFound => "BATCH_NOT_FOUND",
            ErrorCode::ItemNotFound => "ITEM_NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::InvalidTransition => "INVALID_TRANSITION",
            ErrorCode::BatchCancelled => "BATCH_CANCELLED",
            ErrorCode::BatchPromoted => "BATCH_PROMOTED",
            ErrorCode::DatabaseError => "DATABASE_ERROR",
            ErrorCode::ConnectionError => "CONNECTION_ERROR",
            ErrorCode::UpstreamError => "UPSTREAM_ERROR",
            ErrorCode::OcrError => "OCR_ERROR",
            ErrorCode::DestinationError => "DESTINATION_ERROR",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::ConfigurationError => "CONFIGURATION_ERROR",
            ErrorCode::SerializationError => "SERIALIZATION_ERROR",
        }
    }
}

/// How the pipeline reacts to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Retried with backoff, then terminal
    Transient,
    /// Immediate terminal failure, never retried
    Structural,
    /// Surfaces as structured item errors or a rejected request
    Validation,
    /// Lost race or state that forbids the operation
    Conflict,
    /// Bug or misconfiguration
    Internal,
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Validation errors
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("Invalid format: {message}")]
    InvalidFormat { message: String },

    #[error("Payload too large: {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Unsupported media type: {mime}")]
    UnsupportedMediaType { mime: String },

    // Resource errors
    #[error("Resource not found: {resource_type} with id {id}")]
    NotFound { resource_type: String, id: String },

    #[error("Batch not found: {id}")]
    BatchNotFound { id: String },

    #[error("Item not found: {id}")]
    ItemNotFound { id: String },

    // Conflict errors
    #[error("Duplicate resource: {message}")]
    Duplicate { message: String },

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Batch {id} has been cancelled")]
    BatchCancelled { id: String },

    #[error("Batch {id} is promoted and immutable")]
    BatchPromoted { id: String },

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Database connection error: {message}")]
    DatabaseConnection { message: String },

    // External service errors
    #[error("OCR error: {message}")]
    Ocr { message: String, retryable: bool },

    #[error("Destination error: {message}")]
    Destination { message: String },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::InvalidFormat { .. } => ErrorCode::InvalidFormat,
            AppError::PayloadTooLarge { .. } => ErrorCode::PayloadTooLarge,
            AppError::UnsupportedMediaType { .. } => ErrorCode::UnsupportedMediaType,
            AppError::NotFound { .. } => ErrorCode::NotFound,
            AppError::BatchNotFound { .. } => ErrorCode::BatchNotFound,
            AppError::ItemNotFound { .. } => ErrorCode::ItemNotFound,
            AppError::Duplicate { .. } => ErrorCode::Conflict,
            AppError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            AppError::BatchCancelled { .. } => ErrorCode::BatchCancelled,
            AppError::BatchPromoted { .. } => ErrorCode::BatchPromoted,
            AppError::Database(_) => ErrorCode::DatabaseError,
            AppError::DatabaseConnection { .. } => ErrorCode::ConnectionError,
            AppError::Ocr { .. } => ErrorCode::OcrError,
            AppError::Destination { .. } => ErrorCode::DestinationError,
            AppError::Timeout { .. } => ErrorCode::Timeout,
            AppError::HttpClient(_) => ErrorCode::UpstreamError,
            AppError::Internal { .. } => ErrorCode::InternalError,
            AppError::Configuration { .. } => ErrorCode::ConfigurationError,
            AppError::Serialization(_) => ErrorCode::SerializationError,
        }
    }

    /// Classify the error for the retry policy
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Validation { .. }
            | AppError::NotFound { .. }
            | AppError::BatchNotFound { .. }
            | AppError::ItemNotFound { .. } => ErrorKind::Validation,

            AppError::InvalidFormat { .. }
            | AppError::PayloadTooLarge { .. }
            | AppError::UnsupportedMediaType { .. }
            | AppError::Serialization(_) => ErrorKind::Structural,

            AppError::Duplicate { .. }
            | AppError::InvalidTransition { .. }
            | AppError::BatchCancelled { .. }
            | AppError::BatchPromoted { .. } => ErrorKind::Conflict,

            AppError::DatabaseConnection { .. }
            | AppError::Timeout { .. }
            | AppError::Destination { .. } => ErrorKind::Transient,

            AppError::Ocr { retryable, .. } => {
                if *retryable {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Structural
                }
            }

            AppError::Database(err) => match err {
                sea_orm::DbErr::ConnectionAcquire(_) | sea_orm::DbErr::Conn(_) => {
                    ErrorKind::Transient
                }
                _ => ErrorKind::Internal,
            },

            AppError::HttpClient(err) => {
                let server_side = err
                    .status()
                    .map(|s| s.is_server_error() || s.as_u16() == 429)
                    .unwrap_or(false);
                if err.is_timeout() || err.is_connect() || server_side {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Structural
                }
            }

            AppError::Internal { .. } | AppError::Configuration { .. } => ErrorKind::Internal,
        }
    }

    /// Whether a retry may succeed
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Check if this error should be logged at error level
    pub fn is_server_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::Internal | ErrorKind::Transient)
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal {
            message: err.to_string(),
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Configuration {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        let err = AppError::ItemNotFound { id: "test".into() };
        assert_eq!(err.code(), ErrorCode::ItemNotFound);
        assert_eq!(err.code().as_code(), 4003);
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_structural_errors_are_not_retried() {
        let err = AppError::PayloadTooLarge {
            size: 30 * 1024 * 1024,
            limit: 20 * 1024 * 1024,
        };
        assert_eq!(err.kind(), ErrorKind::Structural);
        assert!(!err.is_transient());

        let err = AppError::UnsupportedMediaType {
            mime: "application/zip".into(),
        };
        assert!(!err.is_transient());
    }

    #[test]
    fn test_transient_errors() {
        let err = AppError::Timeout {
            operation: "ocr".into(),
            timeout_ms: 30_000,
        };
        assert!(err.is_transient());
        assert!(err.is_server_error());

        let ocr = AppError::Ocr {
            message: "engine busy".into(),
            retryable: true,
        };
        assert!(ocr.is_transient());

        let ocr = AppError::Ocr {
            message: "unreadable".into(),
            retryable: false,
        };
        assert_eq!(ocr.kind(), ErrorKind::Structural);
    }

    #[test]
    fn test_database_connection_is_transient() {
        let err = AppError::from(sea_orm::DbErr::Conn(sea_orm::RuntimeErr::Internal(
            "connection reset".into(),
        )));
        assert!(err.is_transient());

        let err = AppError::from(sea_orm::DbErr::Custom("bad query".into()));
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_codes_are_unique() {
        let codes = [
            ErrorCode::ValidationError,
            ErrorCode::InvalidFormat,
            ErrorCode::PayloadTooLarge,
            ErrorCode::UnsupportedMediaType,
            ErrorCode::NotFound,
            ErrorCode::BatchNotFound,
            ErrorCode::ItemNotFound,
            ErrorCode::Conflict,
            ErrorCode::InvalidTransition,
            ErrorCode::BatchCancelled,
            ErrorCode::BatchPromoted,
            ErrorCode::DatabaseError,
            ErrorCode::ConnectionError,
            ErrorCode::UpstreamError,
            ErrorCode::OcrError,
            ErrorCode::DestinationError,
            ErrorCode::Timeout,
            ErrorCode::InternalError,
            ErrorCode::ConfigurationError,
            ErrorCode::SerializationError,
        ];
        let numeric: std::collections::HashSet<u16> = codes.iter().map(|c| c.as_code()).collect();
        let names: std::collections::HashSet<&str> = codes.iter().map(|c| c.as_str()).collect();
        assert_eq!(numeric.len(), codes.len());
        assert_eq!(names.len(), codes.len());
    }

    #[test]
    fn test_code_strings_match_serde() {
        let code = ErrorCode::BatchCancelled;
        let json = serde_json::to_string(&code).unwrap();
        assert_eq!(json, format!("\"{}\"", code.as_str()));
    }
}
