//! Application error model with MCP error mapping
//!
//! Defines a typed error hierarchy using `thiserror` for internal error handling,
//! and maps each variant to the appropriate MCP `ErrorData` type for protocol
//! compliance.
//!
//! Retrieval failures fall in two classes. Session-level variants
//! (`Connection`, `AuthFailed`, `Folder`, `Search`, `Fetch`, `Timeout`,
//! `Cancelled`) abort the whole operation. `Parse` is scoped to a single
//! message and never reaches a tool caller.

use rmcp::model::ErrorData;
use serde_json::json;
use thiserror::Error;

/// Application error type
///
/// Covers all error cases the email MCP server may encounter. Each variant maps
/// to an appropriate MCP error code in [`ErrorData`].
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid user input (validation failed, malformed request)
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Resource not found (unknown account)
    #[error("not found: {0}")]
    NotFound(String),
    /// Network failure while establishing the session (TCP, TLS, greeting)
    #[error("connection failed: {0}")]
    Connection(String),
    /// Authentication failure (bad credentials, account disabled)
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    /// Folder missing or access denied on SELECT
    #[error("folder error: {0}")]
    Folder(String),
    /// Protocol-level SEARCH failure
    #[error("search failed: {0}")]
    Search(String),
    /// FETCH command or its response stream failed
    #[error("fetch failed: {0}")]
    Fetch(String),
    /// A single message could not be parsed
    #[error("failed to parse message {seq}: {cause}")]
    Parse {
        /// Sequence number of the offending message
        seq: u32,
        /// Underlying parser error text
        cause: String,
    },
    /// Operation timeout (TCP connect, TLS handshake, IMAP response, deadline)
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// Operation cancelled by server shutdown
    #[error("operation cancelled: {0}")]
    Cancelled(String),
    /// Outbound SMTP delivery failure
    #[error("delivery failed: {0}")]
    Delivery(String),
    /// Internal error (unexpected failure, external crate error)
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Convenience constructor for `InvalidInput`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Stable machine-readable code for the variant
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound(_) => "not_found",
            Self::Connection(_) => "connection",
            Self::AuthFailed(_) => "auth_failed",
            Self::Folder(_) => "folder",
            Self::Search(_) => "search",
            Self::Fetch(_) => "fetch",
            Self::Parse { .. } => "parse",
            Self::Timeout(_) => "timeout",
            Self::Cancelled(_) => "cancelled",
            Self::Delivery(_) => "delivery",
            Self::Internal(_) => "internal",
        }
    }

    /// Convert to MCP `ErrorData`
    ///
    /// Maps each `AppError` variant to the appropriate MCP error type and
    /// includes a structured `code` field for client error handling.
    ///
    /// # Mappings
    ///
    /// - `InvalidInput` → `invalid_params`
    /// - `NotFound`, `Folder` → `resource_not_found`
    /// - `AuthFailed` → `invalid_request`
    /// - everything else → `internal_error`
    pub fn to_error_data(&self) -> ErrorData {
        let data = Some(json!({ "code": self.code() }));
        let msg = self.to_string();
        match self {
            Self::InvalidInput(_) => ErrorData::invalid_params(msg, data),
            Self::NotFound(_) | Self::Folder(_) => ErrorData::resource_not_found(msg, data),
            Self::AuthFailed(_) => ErrorData::invalid_request(msg, data),
            Self::Connection(_)
            | Self::Search(_)
            | Self::Fetch(_)
            | Self::Parse { .. }
            | Self::Timeout(_)
            | Self::Cancelled(_)
            | Self::Delivery(_)
            | Self::Internal(_) => ErrorData::internal_error(msg, data),
        }
    }
}

/// Type alias for fallible return values
///
/// Use this for all internal functions that can fail. Provides a consistent
/// error type throughout the codebase.
pub type AppResult<T> = Result<T, AppError>;
