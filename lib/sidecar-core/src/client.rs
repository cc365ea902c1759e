//! HTTP registry client
//!
//! Speaks the registry API: `POST /registry` to register and
//! `DELETE /registry` to deregister, both carrying the service descriptor as
//! JSON. Only the status code of the answer matters. A registration TTL
//! travels as a `ttl` query parameter in Go duration syntax (`30s`, `1500ms`).

use crate::{Registry, RegistrationError, Result, Service};
use reqwest::{Method, StatusCode};
use std::time::Duration;
use tracing::debug;

const REGISTRY_PATH: &str = "/registry";

/// Longest registry error body kept in a `Rejected` error
const MAX_ERROR_BODY: usize = 512;

/// Registry client over HTTP
pub struct HttpRegistry {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpRegistry {
    /// Create a client for the registry at `address` (e.g. `http://127.0.0.1:8081`).
    /// Every call is bounded by `timeout`.
    pub fn new(address: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| RegistrationError::Internal(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: format!("{}{}", address.trim_end_matches('/'), REGISTRY_PATH),
            timeout,
        })
    }

    /// Full URL of the registry endpoint
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send(
        &self,
        method: Method,
        service: &Service,
        ttl: Option<Duration>,
    ) -> Result<(StatusCode, String)> {
        debug!("{} {} for service {}", method, self.endpoint, service.name);

        let mut request = self.client.request(method, &self.endpoint).json(service);
        if let Some(ttl) = ttl {
            request = request.query(&[("ttl", ttl_param(ttl))]);
        }
        let response = request.send().await.map_err(|e| self.transport_error(e))?;

        let status = response.status();
        let body = if status.is_success() {
            String::new()
        } else {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            body
        };

        Ok((status, body))
    }

    fn transport_error(&self, e: reqwest::Error) -> RegistrationError {
        if e.is_timeout() {
            RegistrationError::Timeout {
                endpoint: self.endpoint.clone(),
                timeout_ms: self.timeout.as_millis(),
            }
        } else {
            RegistrationError::Unreachable {
                endpoint: self.endpoint.clone(),
                source: e,
            }
        }
    }

    fn rejected(&self, status: StatusCode, body: String) -> RegistrationError {
        RegistrationError::Rejected {
            endpoint: self.endpoint.clone(),
            status: status.as_u16(),
            body,
        }
    }
}

#[async_trait::async_trait]
impl Registry for HttpRegistry {
    async fn register(&self, service: &Service, ttl: Option<Duration>) -> Result<()> {
        let (status, body) = self.send(Method::POST, service, ttl).await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(self.rejected(status, body))
        }
    }

    async fn deregister(&self, service: &Service) -> Result<()> {
        let (status, body) = self.send(Method::DELETE, service, None).await?;
        // an absent node is already deregistered
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(self.rejected(status, body))
        }
    }
}

/// Render a TTL the way registries parse durations: whole seconds as `30s`,
/// anything finer in milliseconds
fn ttl_param(ttl: Duration) -> String {
    if ttl.subsec_nanos() == 0 {
        format!("{}s", ttl.as_secs())
    } else {
        format!("{}ms", ttl.as_millis())
    }
}
