// ABOUTME: Unified error type and error codes for key administration and persistence
// ABOUTME: Maps every failure to a stable code, description and HTTP status
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

//! # Unified Error Handling System
//!
//! Every fallible operation outside the authorization hot path returns
//! [`AppResult`]. Authorization denials are not errors: they are
//! [`DecisionReason`](crate::authorizer::DecisionReason) values carried by a
//! [`Decision`](crate::authorizer::Decision).

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Standard error codes used throughout the crate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ErrorCode {
    // Validation (3000-3999)
    /// Generic invalid input
    #[serde(rename = "INVALID_INPUT")]
    InvalidInput = 3000,
    /// Permission string not in the catalog or malformed
    #[serde(rename = "INVALID_PERMISSION")]
    InvalidPermission = 3001,
    /// Numeric value outside accepted bounds
    #[serde(rename = "VALUE_OUT_OF_RANGE")]
    ValueOutOfRange = 3003,
    /// Destructive operation attempted without the confirmation token
    #[serde(rename = "CONFIRMATION_MISMATCH")]
    ConfirmationMismatch = 3004,

    // Resource Management (4000-4999)
    /// Key or record does not exist
    #[serde(rename = "RESOURCE_NOT_FOUND")]
    ResourceNotFound = 4000,
    /// An enabled key already uses the requested name
    #[serde(rename = "DUPLICATE_NAME")]
    DuplicateName = 4001,

    // Audit (7000-7999)
    /// Audit entry could not be accepted for durable storage
    #[serde(rename = "AUDIT_WRITE_FAILED")]
    AuditWriteFailed = 7000,

    // Configuration (6000-6999)
    /// Configuration value is invalid
    #[serde(rename = "CONFIG_INVALID")]
    ConfigInvalid = 6002,

    // Internal Errors (9000-9999)
    /// Unexpected internal failure
    #[serde(rename = "INTERNAL_ERROR")]
    InternalError = 9000,
    /// Database operation failed
    #[serde(rename = "DATABASE_ERROR")]
    DatabaseError = 9001,
    /// Data serialization/deserialization failed
    #[serde(rename = "SERIALIZATION_ERROR")]
    SerializationError = 9003,
}

impl ErrorCode {
    /// Get the HTTP status code for this error
    #[must_use]
    pub const fn http_status(self) -> u16 {
        match self {
            Self::InvalidInput
            | Self::InvalidPermission
            | Self::ValueOutOfRange
            | Self::ConfirmationMismatch => 400,

            Self::ResourceNotFound => 404,

            Self::DuplicateName => 409,

            Self::AuditWriteFailed => 503,

            Self::ConfigInvalid
            | Self::InternalError
            | Self::DatabaseError
            | Self::SerializationError => 500,
        }
    }

    /// Get a user-friendly description of this error
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::InvalidInput => "The provided input is invalid",
            Self::InvalidPermission => "The permission is not recognized",
            Self::ValueOutOfRange => "The provided value is outside the acceptable range",
            Self::ConfirmationMismatch => "Confirmation token does not match",
            Self::ResourceNotFound => "The requested resource was not found",
            Self::DuplicateName => "An active API key with this name already exists",
            Self::AuditWriteFailed => "Audit entry could not be recorded",
            Self::ConfigInvalid => "Configuration is invalid",
            Self::InternalError => "An internal error occurred",
            Self::DatabaseError => "Database operation failed",
            Self::SerializationError => "Data serialization/deserialization failed",
        }
    }

    /// Stable machine-readable form, identical to the serialized name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidInput => "INVALID_INPUT",
            Self::InvalidPermission => "INVALID_PERMISSION",
            Self::ValueOutOfRange => "VALUE_OUT_OF_RANGE",
            Self::ConfirmationMismatch => "CONFIRMATION_MISMATCH",
            Self::ResourceNotFound => "RESOURCE_NOT_FOUND",
            Self::DuplicateName => "DUPLICATE_NAME",
            Self::AuditWriteFailed => "AUDIT_WRITE_FAILED",
            Self::ConfigInvalid => "CONFIG_INVALID",
            Self::InternalError => "INTERNAL_ERROR",
            Self::DatabaseError => "DATABASE_ERROR",
            Self::SerializationError => "SERIALIZATION_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type for the crate
#[derive(Debug, Clone, Error)]
pub struct AppError {
    /// Error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// Additional structured context
    pub details: serde_json::Value,
}

impl AppError {
    /// Create a new `AppError` with the given code and message
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    /// Attach structured details
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    /// Get the HTTP status code for this error
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        self.code.http_status()
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.description(), self.message)
    }
}

/// Result type alias for convenience
pub type AppResult<T> = Result<T, AppError>;

/// Convenience functions for creating common errors
impl AppError {
    /// Resource not found
    #[must_use]
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ResourceNotFound,
            format!("{} not found", resource.into()),
        )
    }

    /// Name already used by an enabled key
    #[must_use]
    pub fn duplicate_name(name: &str) -> Self {
        Self::new(
            ErrorCode::DuplicateName,
            format!("API key name '{name}' is already in use by an active key"),
        )
        .with_details(serde_json::json!({ "name": name }))
    }

    /// Destructive operation without the expected confirmation token
    #[must_use]
    pub fn confirmation_mismatch(expected: &str) -> Self {
        Self::new(
            ErrorCode::ConfirmationMismatch,
            format!("confirmation must be exactly '{expected}'"),
        )
    }

    /// Unknown or malformed permission
    #[must_use]
    pub fn invalid_permission(permission: &str) -> Self {
        Self::new(
            ErrorCode::InvalidPermission,
            format!("invalid permission '{permission}'"),
        )
        .with_details(serde_json::json!({ "permission": permission }))
    }

    /// Invalid input
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    /// Value outside accepted bounds
    #[must_use]
    pub fn out_of_range(field: &str, value: i64, min: i64, max: i64) -> Self {
        Self::new(
            ErrorCode::ValueOutOfRange,
            format!("{field} must be between {min} and {max}, got {value}"),
        )
        .with_details(serde_json::json!({ "field": field, "value": value, "min": min, "max": max }))
    }

    /// Audit entry rejected by the writer
    #[must_use]
    pub fn audit_write_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AuditWriteFailed, message)
    }

    /// Internal error
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// Database error
    #[must_use]
    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DatabaseError, message)
    }

    /// Configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigInvalid, message)
    }

    /// Serialization error
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SerializationError, message)
    }
}

impl From<sqlx::Error> for AppError {
    fn from(error: sqlx::Error) -> Self {
        Self::database(error.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        Self::serialization(error.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        Self::internal(format!("{error:#}"))
    }
}
