//! Form-encoded HTTP forwarding for backends that do not speak JSON-RPC

use crate::ForwardError;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Raw backend answer, relayed without interpretation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// Forwarder posting form parameters to a backend path
pub struct HttpForwarder {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpForwarder {
    /// Create a forwarder for the backend at `backend_address`.
    /// Each call is bounded by `timeout`.
    pub fn new(backend_address: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: backend_address.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    /// Build the backend URL for a request path
    pub fn target_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// POST `params` form-encoded to `path` on the backend and return the body
    /// as received. Backend status codes are relayed, not treated as errors.
    pub async fn forward_http(
        &self,
        path: &str,
        params: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<HttpReply, ForwardError> {
        validate_path(path)?;
        let url = self.target_url(path);

        debug!("Forwarding form POST with {} fields to {}", params.len(), url);

        let exchange = async {
            let response = self.client.post(&url).form(params).send().await?;
            let status = response.status().as_u16();
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = response.bytes().await?.to_vec();
            Ok::<_, reqwest::Error>(HttpReply {
                status,
                content_type,
                body,
            })
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ForwardError::Cancelled { method: path.to_string() }),
            exchange = exchange => {
                exchange.map_err(|e| ForwardError::transport(path, e, self.timeout))
            }
        };

        match &result {
            Ok(reply) => debug!(
                "Backend {} answered {} ({} bytes)",
                path,
                reply.status,
                reply.body.len()
            ),
            Err(e) => warn!("HTTP forward to {} failed: {}", path, e),
        }
        result
    }
}

fn validate_path(path: &str) -> Result<(), ForwardError> {
    let invalid = |reason: &str| ForwardError::InvalidTarget {
        method: path.to_string(),
        reason: reason.to_string(),
    };

    if !path.starts_with('/') {
        return Err(invalid("path must start with '/'"));
    }
    if path.starts_with("//") {
        return Err(invalid("path must not start with '//'"));
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(invalid("path must not contain '..'"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sidecar_core::testing::{unreachable_address, MockResponse, MockServer};

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_target_url() {
        let forwarder =
            HttpForwarder::new("http://127.0.0.1:8080/", Duration::from_secs(1)).unwrap();
        assert_eq!(
            forwarder.target_url("/greeter/hello"),
            "http://127.0.0.1:8080/greeter/hello"
        );
    }

    #[test]
    fn test_validate_path() {
        assert!(validate_path("/greeter/hello").is_ok());
        assert!(validate_path("greeter").is_err());
        assert!(validate_path("//evil.example/x").is_err());
        assert!(validate_path("/a/../b").is_err());
    }

    #[tokio::test]
    async fn test_forward_posts_form_and_returns_raw_body() {
        let backend = MockServer::respond_with(MockResponse::text(200, "hello John"))
            .await
            .unwrap();
        let forwarder = HttpForwarder::new(&backend.url(), Duration::from_secs(2)).unwrap();

        let reply = forwarder
            .forward_http(
                "/greeter/hello",
                &params(&[("name", "John Smith"), ("lang", "en&fr")]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(reply.status, 200);
        assert_eq!(reply.body, b"hello John");
        assert_eq!(reply.content_type.as_deref(), Some("text/plain"));

        let request = &backend.requests()[0];
        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/greeter/hello");
        assert_eq!(
            request.content_type.as_deref(),
            Some("application/x-www-form-urlencoded")
        );
        let sent: BTreeMap<String, String> = serde_urlencoded::from_bytes(&request.body).unwrap();
        assert_eq!(sent, params(&[("name", "John Smith"), ("lang", "en&fr")]));
    }

    #[tokio::test]
    async fn test_backend_status_is_relayed() {
        let backend = MockServer::respond_with(MockResponse::text(404, "no such page"))
            .await
            .unwrap();
        let forwarder = HttpForwarder::new(&backend.url(), Duration::from_secs(2)).unwrap();

        let reply = forwarder
            .forward_http("/missing", &BTreeMap::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply.status, 404);
        assert_eq!(reply.body, b"no such page");
    }

    #[tokio::test]
    async fn test_unreachable_backend() {
        let addr = unreachable_address().await.unwrap();
        let forwarder =
            HttpForwarder::new(&format!("http://{}", addr), Duration::from_secs(2)).unwrap();

        let err = forwarder
            .forward_http("/greeter/hello", &BTreeMap::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "unreachable");
        assert_eq!(err.method(), "/greeter/hello");
    }

    #[tokio::test]
    async fn test_invalid_path_is_not_sent() {
        let backend = MockServer::respond_with(MockResponse::ok()).await.unwrap();
        let forwarder = HttpForwarder::new(&backend.url(), Duration::from_secs(2)).unwrap();

        let err = forwarder
            .forward_http("/../etc", &BTreeMap::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_target");
        assert_eq!(backend.request_count(), 0);
    }
}
