//! Invocation error taxonomy.
//!
//! Every failure of an invocation maps to exactly one kind, which fixes the
//! HTTP status and carries enough detail for the caller to diagnose it
//! without server-side logs.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Map, Value, json};

use crate::function::FunctionId;

/// Maximum number of stderr bytes carried by an [`InvocationError::ExecutionFailure`].
pub const STDERR_EXCERPT_LIMIT: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    #[error("Function {function_id} not found")]
    FunctionNotFound { function_id: FunctionId },

    #[error("Function code not found at {path}")]
    FunctionCodeNotFound { path: String },

    #[error("{handler_file} missing in function directory {path}")]
    MissingHandler { handler_file: String, path: String },

    #[error("Failed to load {path}: {reason}")]
    InvalidFixture { path: String, reason: String },

    #[error("Invalid JSON input: {reason}")]
    InvalidRequestPayload { reason: String },

    #[error("Failed to start container: {reason}")]
    ContainerStartFailure { reason: String },

    #[error("Failed to copy input to container: {reason}")]
    TransferFailure { reason: String },

    #[error("Function execution failed")]
    ExecutionFailure {
        exit_code: Option<i64>,
        stderr: String,
    },

    #[error("Function execution timed out: {detail}")]
    Timeout { detail: String },

    #[error("Invalid output format (not JSON)")]
    InvalidOutputFormat { raw: String },

    #[error("Internal error: {reason}")]
    Internal { reason: String },
}

impl InvocationError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            InvocationError::FunctionNotFound { .. } |
            InvocationError::FunctionCodeNotFound { .. } => StatusCode::NOT_FOUND,
            InvocationError::MissingHandler { .. } |
            InvocationError::InvalidFixture { .. } |
            InvocationError::InvalidRequestPayload { .. } => StatusCode::BAD_REQUEST,
            InvocationError::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
            InvocationError::InvalidOutputFormat { .. } => StatusCode::BAD_GATEWAY,
            InvocationError::ContainerStartFailure { .. } |
            InvocationError::TransferFailure { .. } |
            InvocationError::ExecutionFailure { .. } |
            InvocationError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable snake_case name of the kind, used in response bodies and
    /// metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            InvocationError::FunctionNotFound { .. } => "function_not_found",
            InvocationError::FunctionCodeNotFound { .. } => "function_code_not_found",
            InvocationError::MissingHandler { .. } => "missing_handler",
            InvocationError::InvalidFixture { .. } => "invalid_fixture",
            InvocationError::InvalidRequestPayload { .. } => "invalid_request_payload",
            InvocationError::ContainerStartFailure { .. } => "container_start_failure",
            InvocationError::TransferFailure { .. } => "transfer_failure",
            InvocationError::ExecutionFailure { .. } => "execution_failure",
            InvocationError::Timeout { .. } => "timeout",
            InvocationError::InvalidOutputFormat { .. } => "invalid_output_format",
            InvocationError::Internal { .. } => "internal_error",
        }
    }

    pub fn execution_failure(exit_code: Option<i64>, stderr: &str) -> Self {
        InvocationError::ExecutionFailure {
            exit_code,
            stderr: excerpt_tail(stderr.trim(), STDERR_EXCERPT_LIMIT),
        }
    }

    /// JSON body returned to the caller.
    pub fn to_body(&self) -> Value {
        let mut body = Map::new();
        body.insert("error".to_string(), json!(self.to_string()));
        body.insert("kind".to_string(), json!(self.kind()));
        match self {
            InvocationError::ExecutionFailure { exit_code, stderr } => {
                body.insert("exit_code".to_string(), json!(exit_code));
                body.insert("stderr".to_string(), json!(stderr));
            }
            InvocationError::InvalidOutputFormat { raw } => {
                body.insert("raw".to_string(), json!(raw));
            }
            InvocationError::FunctionNotFound { function_id } => {
                body.insert("detail".to_string(), json!({ "function_id": function_id }));
            }
            InvocationError::FunctionCodeNotFound { path } |
            InvocationError::MissingHandler { path, .. } => {
                body.insert("detail".to_string(), json!({ "path": path }));
            }
            InvocationError::InvalidFixture { reason, .. } |
            InvocationError::InvalidRequestPayload { reason } |
            InvocationError::ContainerStartFailure { reason } |
            InvocationError::TransferFailure { reason } |
            InvocationError::Internal { reason } => {
                body.insert("detail".to_string(), json!(reason));
            }
            InvocationError::Timeout { detail } => {
                body.insert("detail".to_string(), json!(detail));
            }
        }
        Value::Object(body)
    }
}

impl IntoResponse for InvocationError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(kind = self.kind(), error = %self, "Invocation failed");
        }
        (status, Json(self.to_body())).into_response()
    }
}

/// Truncate `text` to at most `limit` bytes on a char boundary.
pub(crate) fn excerpt(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...[truncated]", &text[..end])
}

/// Keep the last `limit` bytes of `text` on a char boundary. Tracebacks end
/// with the exception, so stderr is cut from the front.
pub(crate) fn excerpt_tail(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("[truncated]...{}", &text[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_taxonomy() {
        let cases = [
            (
                InvocationError::FunctionCodeNotFound {
                    path: "/f".into(),
                },
                404,
            ),
            (
                InvocationError::MissingHandler {
                    handler_file: "function.py".into(),
                    path: "/f".into(),
                },
                400,
            ),
            (
                InvocationError::InvalidRequestPayload {
                    reason: "eof".into(),
                },
                400,
            ),
            (
                InvocationError::Timeout {
                    detail: "5s".into(),
                },
                408,
            ),
            (InvocationError::execution_failure(Some(1), "boom"), 500),
            (
                InvocationError::InvalidOutputFormat { raw: "hi".into() },
                502,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.status_code().as_u16(), status, "{}", err.kind());
        }
    }

    #[test]
    fn test_invalid_output_body_carries_raw_text() {
        let body = InvocationError::InvalidOutputFormat {
            raw: "hello world".into(),
        }
        .to_body();
        assert_eq!(body["kind"], "invalid_output_format");
        assert_eq!(body["raw"], "hello world");
        assert_eq!(body["error"], "Invalid output format (not JSON)");
    }

    #[test]
    fn test_execution_failure_keeps_stderr_tail() {
        let stderr = format!(
            "Traceback (most recent call last):\n{}ValueError: boom",
            "é".repeat(STDERR_EXCERPT_LIMIT)
        );
        let err = InvocationError::execution_failure(Some(1), &stderr);
        let InvocationError::ExecutionFailure { stderr, exit_code } = err else {
            panic!("unexpected kind");
        };
        assert_eq!(exit_code, Some(1));
        assert!(stderr.starts_with("[truncated]..."));
        assert!(stderr.ends_with("ValueError: boom"));
        assert!(!stderr.contains("Traceback"));
        assert!(stderr.len() <= STDERR_EXCERPT_LIMIT + "[truncated]...".len());
    }

    #[test]
    fn test_excerpt_keeps_head() {
        let text = "a".repeat(20);
        assert_eq!(excerpt(&text, 5), "aaaaa...[truncated]");
        assert_eq!(excerpt_tail("abcdefgh", 3), "[truncated]...fgh");
    }

    #[test]
    fn test_excerpt_keeps_short_text() {
        assert_eq!(excerpt("short", 10), "short");
    }
}
