//! The closed error taxonomy.
//!
//! Every failure that crosses a wire is exactly one of these codes plus a
//! human message and optional structured details.  The table is frozen:
//!
//! | Code                  | Category   | Retryable | HTTP | JSON-RPC |
//! |-----------------------|------------|-----------|------|----------|
//! | `BAD_REQUEST`         | client     | no        | 400  | -32600   |
//! | `VALIDATION_ERROR`    | validation | no        | 400  | -32602   |
//! | `PARSE_ERROR`         | client     | no        | 400  | -32700   |
//! | `INVALID_ENVELOPE`    | client     | no        | 400  | -32600   |
//! | `UNAUTHENTICATED`     | auth       | no        | 401  | -32001   |
//! | `PERMISSION_DENIED`   | auth       | no        | 403  | -32002   |
//! | `NOT_FOUND`           | client     | no        | 404  | -32601   |
//! | `ALREADY_EXISTS`      | client     | no        | 409  | -32005   |
//! | `FAILED_PRECONDITION` | client     | no        | 400  | -32010   |
//! | `ABORTED`             | client     | yes       | 409  | -32011   |
//! | `RESOURCE_EXHAUSTED`  | client     | yes       | 429  | -32006   |
//! | `CANCELLED`           | client     | no        | 499  | -32009   |
//! | `DEADLINE_EXCEEDED`   | network    | yes       | 504  | -32008   |
//! | `UNAVAILABLE`         | server     | yes       | 503  | -32603   |
//! | `INTERNAL`            | server     | yes       | 500  | -32603   |
//! | `UNIMPLEMENTED`       | server     | no        | 501  | -32601   |
//! | `UNKNOWN`             | server     | yes       | 500  | -32603   |

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BadRequest,
    ValidationError,
    ParseError,
    InvalidEnvelope,
    Unauthenticated,
    PermissionDenied,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    Aborted,
    ResourceExhausted,
    Cancelled,
    DeadlineExceeded,
    Unavailable,
    Internal,
    Unimplemented,
    /// Catch-all; also the parse target for unrecognized code strings, so
    /// re-mapping an already-mapped error is a no-op.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Client,
    Validation,
    Auth,
    Network,
    Server,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::ParseError => "PARSE_ERROR",
            ErrorCode::InvalidEnvelope => "INVALID_ENVELOPE",
            ErrorCode::Unauthenticated => "UNAUTHENTICATED",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ErrorCode::FailedPrecondition => "FAILED_PRECONDITION",
            ErrorCode::Aborted => "ABORTED",
            ErrorCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::Internal => "INTERNAL",
            ErrorCode::Unimplemented => "UNIMPLEMENTED",
            ErrorCode::Unknown => "UNKNOWN",
        }
    }

    /// Parse a wire code string; unrecognized strings collapse to `Unknown`.
    pub fn parse(s: &str) -> Self {
        serde_json::from_value(Value::String(s.to_owned())).unwrap_or(ErrorCode::Unknown)
    }

    pub fn category(self) -> ErrorCategory {
        match self {
            ErrorCode::ValidationError => ErrorCategory::Validation,
            ErrorCode::Unauthenticated | ErrorCode::PermissionDenied => ErrorCategory::Auth,
            ErrorCode::DeadlineExceeded => ErrorCategory::Network,
            ErrorCode::Unavailable
            | ErrorCode::Internal
            | ErrorCode::Unimplemented
            | ErrorCode::Unknown => ErrorCategory::Server,
            _ => ErrorCategory::Client,
        }
    }

    pub fn retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::Aborted
                | ErrorCode::ResourceExhausted
                | ErrorCode::DeadlineExceeded
                | ErrorCode::Unavailable
                | ErrorCode::Internal
                | ErrorCode::Unknown
        )
    }

    pub fn http_status(self) -> u16 {
        match self {
            ErrorCode::BadRequest
            | ErrorCode::ValidationError
            | ErrorCode::ParseError
            | ErrorCode::InvalidEnvelope
            | ErrorCode::FailedPrecondition => 400,
            ErrorCode::Unauthenticated => 401,
            ErrorCode::PermissionDenied => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::AlreadyExists | ErrorCode::Aborted => 409,
            ErrorCode::ResourceExhausted => 429,
            ErrorCode::Cancelled => 499,
            ErrorCode::Internal | ErrorCode::Unknown => 500,
            ErrorCode::Unimplemented => 501,
            ErrorCode::Unavailable => 503,
            ErrorCode::DeadlineExceeded => 504,
        }
    }

    pub fn json_rpc_code(self) -> i32 {
        match self {
            ErrorCode::ParseError => -32700,
            ErrorCode::BadRequest | ErrorCode::InvalidEnvelope => -32600,
            ErrorCode::NotFound | ErrorCode::Unimplemented => -32601,
            ErrorCode::ValidationError => -32602,
            ErrorCode::Unavailable | ErrorCode::Internal | ErrorCode::Unknown => -32603,
            ErrorCode::Unauthenticated => -32001,
            ErrorCode::PermissionDenied => -32002,
            ErrorCode::AlreadyExists => -32005,
            ErrorCode::ResourceExhausted => -32006,
            ErrorCode::DeadlineExceeded => -32008,
            ErrorCode::Cancelled => -32009,
            ErrorCode::FailedPrecondition => -32010,
            ErrorCode::Aborted => -32011,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// RpcError
// ---------------------------------------------------------------------------

/// A tagged wire error: closed-taxonomy code, human message, optional
/// structured details.  Stack traces are never attached here; callers opt in
/// to development diagnostics through `details` explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        RpcError {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn not_found(procedure: &str) -> Self {
        RpcError::new(
            ErrorCode::NotFound,
            format!("no handler registered for '{procedure}'"),
        )
    }

    pub fn invalid_envelope(message: impl Into<String>) -> Self {
        RpcError::new(ErrorCode::InvalidEnvelope, message)
    }

    pub fn cancelled() -> Self {
        RpcError::new(ErrorCode::Cancelled, "request cancelled")
    }

    pub fn deadline_exceeded(ms: u64) -> Self {
        RpcError::new(
            ErrorCode::DeadlineExceeded,
            format!("deadline of {ms}ms exceeded"),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        RpcError::new(ErrorCode::Internal, message)
    }

    /// Field-level validation failure; the field list travels in
    /// `details.errors`.
    pub fn validation(errors: Vec<FieldError>) -> Self {
        let details = serde_json::json!({ "errors": errors });
        RpcError::new(ErrorCode::ValidationError, "validation failed").with_details(details)
    }

    /// A `Retry-After` style hint in milliseconds, if the details carry one.
    /// Read by the retry middleware before computing backoff.
    pub fn retry_after_ms(&self) -> Option<u64> {
        self.details
            .as_ref()
            .and_then(|d| d.get("retryAfter"))
            .and_then(Value::as_u64)
    }

    pub fn is_cancellation(&self) -> bool {
        self.code == ErrorCode::Cancelled
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        RpcError::new(ErrorCode::ParseError, format!("JSON: {e}"))
    }
}

// ---------------------------------------------------------------------------
// Validation field errors
// ---------------------------------------------------------------------------

/// One per-field validation failure, carried in `VALIDATION_ERROR` details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
    pub code: String,
}

impl FieldError {
    pub fn new(
        field: impl Into<String>,
        message: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        FieldError {
            field: field.into(),
            message: message.into(),
            code: code.into(),
        }
    }
}
