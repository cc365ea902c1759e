//! JSON-RPC forwarding
//!
//! Wraps positional parameters into a `{id, method, params}` envelope, POSTs it
//! to the backend RPC endpoint and unwraps the `{id, result | error}` answer.

use crate::ForwardError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Request envelope sent to the backend
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub method: String,
    pub params: Value,
}

/// Normalize caller input into a positional parameter list.
///
/// Arrays pass through, `null` becomes `[]`, anything else is wrapped as the
/// single positional argument.
pub fn positional_params(params: Value) -> Value {
    match params {
        Value::Array(_) => params,
        Value::Null => Value::Array(Vec::new()),
        other => Value::Array(vec![other]),
    }
}

/// Forwarder for JSON-RPC backends
pub struct RpcForwarder {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
    next_id: AtomicU64,
}

impl RpcForwarder {
    /// Create a forwarder posting to `backend_address` + `rpc_path`.
    /// Each call is bounded by `timeout`.
    pub fn new(backend_address: &str, rpc_path: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}{}", backend_address.trim_end_matches('/'), rpc_path),
            timeout,
            next_id: AtomicU64::new(1),
        })
    }

    /// Full URL of the backend RPC endpoint
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Call `method` on the backend and return its `result`.
    ///
    /// Transport failures, timeouts, unparseable answers and answers carrying
    /// an `error` all come back as a [`ForwardError`]. A cancelled `cancel`
    /// abandons the call.
    pub async fn forward_rpc(
        &self,
        method: &str,
        params: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, ForwardError> {
        let request = RpcRequest {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method: method.to_string(),
            params: positional_params(params),
        };

        debug!("Forwarding {} (id {}) to {}", method, request.id, self.endpoint);

        let exchange = async {
            let response = self.client.post(&self.endpoint).json(&request).send().await?;
            let status = response.status();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, body))
        };

        let (status, body) = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(ForwardError::Cancelled { method: method.to_string() });
            }
            exchange = exchange => {
                exchange.map_err(|e| ForwardError::transport(method, e, self.timeout))?
            }
        };

        let envelope: Value = match serde_json::from_slice(&body) {
            Ok(envelope) => envelope,
            Err(e) if status.is_success() => {
                return Err(ForwardError::Malformed {
                    method: method.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(_) => return Err(status_error(method, status, &body)),
        };

        // a failed status only carries an answer through its `error` field
        let result = match unwrap_envelope(method, envelope, request.id) {
            Err(e @ ForwardError::Rpc { .. }) => Err(e),
            _ if !status.is_success() => Err(status_error(method, status, &body)),
            other => other,
        };
        if let Err(e) = &result {
            warn!("RPC {} failed: {}", method, e);
        }
        result
    }
}

fn status_error(method: &str, status: reqwest::StatusCode, body: &[u8]) -> ForwardError {
    ForwardError::Status {
        method: method.to_string(),
        status: status.as_u16(),
        body: String::from_utf8_lossy(body).into_owned(),
    }
}

fn unwrap_envelope(method: &str, envelope: Value, sent_id: u64) -> Result<Value, ForwardError> {
    let Value::Object(mut fields) = envelope else {
        return Err(ForwardError::Malformed {
            method: method.to_string(),
            reason: "response is not a JSON object".to_string(),
        });
    };

    match fields.get("id") {
        Some(id) if id.as_u64() != Some(sent_id) => {
            debug!("RPC {} answered with id {} (sent {})", method, id, sent_id);
        }
        _ => {}
    }

    match fields.remove("error") {
        Some(Value::Null) | None => {}
        Some(error) => {
            return Err(ForwardError::Rpc {
                method: method.to_string(),
                error,
            });
        }
    }

    fields.remove("result").ok_or_else(|| ForwardError::Malformed {
        method: method.to_string(),
        reason: "response has neither result nor error".to_string(),
    })
}
