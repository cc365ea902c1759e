use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

/// Why a forwarded call did not produce a result.
///
/// Every variant names the RPC method or HTTP path it concerns. Errors are
/// returned to the request handler, which turns them into a response.
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("{method}: backend unreachable: {reason}")]
    Unreachable { method: String, reason: String },

    #[error("{method}: backend timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u128 },

    #[error("{method}: malformed backend response: {reason}")]
    Malformed { method: String, reason: String },

    #[error("{method}: backend responded with status {status}")]
    Status {
        method: String,
        status: u16,
        body: String,
    },

    #[error("{method}: backend returned error: {error}")]
    Rpc { method: String, error: Value },

    #[error("{method}: invalid target: {reason}")]
    InvalidTarget { method: String, reason: String },

    #[error("{method}: abandoned during shutdown")]
    Cancelled { method: String },
}

impl ForwardError {
    pub(crate) fn transport(method: &str, err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            ForwardError::Timeout {
                method: method.to_string(),
                timeout_ms: timeout.as_millis(),
            }
        } else if err.is_decode() || err.is_body() {
            ForwardError::Malformed {
                method: method.to_string(),
                reason: err.to_string(),
            }
        } else {
            ForwardError::Unreachable {
                method: method.to_string(),
                reason: err.to_string(),
            }
        }
    }

    /// Method or path the failed call targeted
    pub fn method(&self) -> &str {
        match self {
            ForwardError::Unreachable { method, .. }
            | ForwardError::Timeout { method, .. }
            | ForwardError::Malformed { method, .. }
            | ForwardError::Status { method, .. }
            | ForwardError::Rpc { method, .. }
            | ForwardError::InvalidTarget { method, .. }
            | ForwardError::Cancelled { method } => method,
        }
    }

    /// Short label used in responses, logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ForwardError::Unreachable { .. } => "unreachable",
            ForwardError::Timeout { .. } => "timeout",
            ForwardError::Malformed { .. } => "malformed_response",
            ForwardError::Status { .. } => "backend_status",
            ForwardError::Rpc { .. } => "rpc_error",
            ForwardError::InvalidTarget { .. } => "invalid_target",
            ForwardError::Cancelled { .. } => "cancelled",
        }
    }

    /// HTTP status the caller sees for this error
    pub fn status_code(&self) -> u16 {
        match self {
            ForwardError::InvalidTarget { .. } => 400,
            ForwardError::Rpc { .. } => 500,
            ForwardError::Unreachable { .. }
            | ForwardError::Malformed { .. }
            | ForwardError::Status { .. } => 502,
            ForwardError::Cancelled { .. } => 503,
            ForwardError::Timeout { .. } => 504,
        }
    }

    /// Caller-visible body: `{method, kind, error}`.
    ///
    /// For RPC errors `error` is the backend's payload, unchanged.
    pub fn to_json(&self) -> Value {
        let error = match self {
            ForwardError::Rpc { error, .. } => error.clone(),
            other => Value::String(other.to_string()),
        };
        json!({
            "method": self.method(),
            "kind": self.kind(),
            "error": error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_error_payload_is_verbatim() {
        let payload = json!({"code": -32601, "message": "method not found"});
        let err = ForwardError::Rpc {
            method: "Say.Hello".to_string(),
            error: payload.clone(),
        };
        let body = err.to_json();
        assert_eq!(body["method"], "Say.Hello");
        assert_eq!(body["kind"], "rpc_error");
        assert_eq!(body["error"], payload);
        assert_eq!(err.status_code(), 500);
    }

    #[test]
    fn test_transport_error_body_is_not_null() {
        let err = ForwardError::Unreachable {
            method: "Say.Hello".to_string(),
            reason: "connection refused".to_string(),
        };
        let body = err.to_json();
        assert!(body["error"].is_string());
        assert_eq!(err.status_code(), 502);
    }

    #[test]
    fn test_status_codes() {
        let method = "Say.Hello".to_string();
        assert_eq!(
            ForwardError::Timeout { method: method.clone(), timeout_ms: 10 }.status_code(),
            504
        );
        assert_eq!(ForwardError::Cancelled { method: method.clone() }.status_code(), 503);
        assert_eq!(
            ForwardError::InvalidTarget { method, reason: String::new() }.status_code(),
            400
        );
    }
}
