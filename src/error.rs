//! Error model shared by the session layer, the operation handlers and the bridge.
//! Auth failures are recovered at startup; everything else carries a numeric code
//! that survives the trip through the structured-RPC envelope unchanged.

use serde::{Deserialize, Serialize};

/// Numeric codes carried in structured error objects.
pub mod codes {
    pub const BAD_REQUEST: i64 = 400;
    pub const UNAUTHORIZED: i64 = 401;
    pub const NOT_FOUND: i64 = 404;
    pub const INTERNAL: i64 = 500;
    pub const BAD_GATEWAY: i64 = 502;
    pub const GATEWAY_TIMEOUT: i64 = 504;

    // JSON-RPC 2.0 protocol errors
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
}

/// Credential acquisition or session validity failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("credentials not configured: {0}")]
    NotConfigured(String),
    #[error("credential request failed: {0}")]
    Network(String),
    #[error("credential request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("malformed credential response: {0}")]
    MalformedResponse(String),
    #[error("session expired or unavailable")]
    SessionUnavailable,
}

/// Handler-level failure. Mapped to a structured error with a specific code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    #[error("missing required parameter: {0}")]
    MissingParam(String),
    #[error("invalid parameter {name}: {message}")]
    InvalidParam { name: String, message: String },
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("repository error ({status}): {message}")]
    Upstream { status: u16, message: String },
    #[error("{0}")]
    Internal(String),
}

impl OperationError {
    pub fn code(&self) -> i64 {
        match self {
            OperationError::MissingParam(_) | OperationError::InvalidParam { .. } => codes::BAD_REQUEST,
            OperationError::NotFound(_) => codes::NOT_FOUND,
            OperationError::Auth(_) => codes::UNAUTHORIZED,
            OperationError::Upstream { .. } => codes::BAD_GATEWAY,
            OperationError::Internal(_) => codes::INTERNAL,
        }
    }
}

/// Failure delivering or interpreting a structured call. `code` and `message` are
/// preserved verbatim when they come from a structured error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("bridge error {code}: {message}")]
pub struct BridgeError {
    pub code: i64,
    pub message: String,
}

impl BridgeError {
    pub fn new<S: Into<String>>(code: i64, message: S) -> Self { BridgeError { code, message: message.into() } }
    pub fn bad_request<S: Into<String>>(message: S) -> Self { Self::new(codes::BAD_REQUEST, message) }
    pub fn transport<S: Into<String>>(message: S) -> Self { Self::new(codes::BAD_GATEWAY, message) }
    pub fn timeout<S: Into<String>>(message: S) -> Self { Self::new(codes::GATEWAY_TIMEOUT, message) }
    pub fn unknown_method(method: &str) -> Self { Self::new(codes::METHOD_NOT_FOUND, format!("unknown method: {method}")) }

    pub fn is_timeout(&self) -> bool { self.code == codes::GATEWAY_TIMEOUT }

    /// Map to an HTTP status code. Protocol-level JSON-RPC codes become 400/404.
    pub fn http_status(&self) -> u16 {
        match self.code {
            c @ 400..=599 => c as u16,
            codes::METHOD_NOT_FOUND => 404,
            codes::PARSE_ERROR | codes::INVALID_REQUEST | codes::INVALID_PARAMS => 400,
            _ => 500,
        }
    }
}

impl From<OperationError> for BridgeError {
    fn from(err: OperationError) -> Self { BridgeError::new(err.code(), err.to_string()) }
}

impl From<anyhow::Error> for BridgeError {
    fn from(err: anyhow::Error) -> Self {
        // Default mapping: treat as internal unless classified elsewhere
        BridgeError::new(codes::INTERNAL, err.to_string())
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod error_tests;
