//! Loopback HTTP server for tests
//!
//! [`MockServer`] binds `127.0.0.1:0`, records every request it receives and
//! answers with whatever the handler returns. It stops accepting when dropped.

use crate::{MemoryRegistry, Registry, Service};
use http_body_util::{BodyExt, Full};
use hyper::{
    body::{Bytes, Incoming},
    header::CONTENT_TYPE,
    server::conn::http1,
    service::service_fn,
    Request, Response,
};
use hyper_util::rt::tokio::TokioIo;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// A request as received by the mock server
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl RecordedRequest {
    pub fn json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_slice(&self.body)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// A scripted response
#[derive(Clone, Debug)]
pub struct MockResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub delay: Option<Duration>,
}

impl MockResponse {
    /// Empty `200 OK`
    pub fn ok() -> Self {
        Self::text(200, "")
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: Some("text/plain".to_string()),
            body: body.into().into_bytes(),
            delay: None,
        }
    }

    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            content_type: Some("application/json".to_string()),
            body: body.to_string().into_bytes(),
            delay: None,
        }
    }

    /// Wait before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// HTTP server on a loopback port driven by a handler closure
pub struct MockServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    shutdown: CancellationToken,
}

impl MockServer {
    /// Start a server answering every request with `handler`
    pub async fn start<F, Fut>(handler: F) -> std::io::Result<Self>
    where
        F: Fn(RecordedRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MockResponse> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let requests = Arc::new(Mutex::new(Vec::new()));
        let shutdown = CancellationToken::new();

        let handler = Arc::new(handler);
        let recorded = requests.clone();
        let token = shutdown.clone();

        tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => stream,
                        Err(_) => continue,
                    },
                };

                let handler = handler.clone();
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let handler = handler.clone();
                        let recorded = recorded.clone();
                        async move {
                            let request = record(req).await?;
                            if let Ok(mut requests) = recorded.lock() {
                                requests.push(request.clone());
                            }

                            let response = (*handler)(request).await;
                            if let Some(delay) = response.delay {
                                tokio::time::sleep(delay).await;
                            }
                            Ok::<_, hyper::Error>(into_response(response))
                        }
                    });

                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Ok(Self {
            addr,
            requests,
            shutdown,
        })
    }

    /// Start a server answering every request with the same response
    pub async fn respond_with(response: MockResponse) -> std::io::Result<Self> {
        Self::start(move |_| {
            let response = response.clone();
            async move { response }
        })
        .await
    }

    /// Start a server speaking the registry API on top of `registry`.
    ///
    /// `DELETE /registry` for nodes the registry does not hold answers
    /// `404 Not Found`, like registries that track nodes strictly.
    pub async fn registry(registry: Arc<MemoryRegistry>) -> std::io::Result<Self> {
        Self::start(move |request| {
            let registry = registry.clone();
            async move { registry_response(&registry, request).await }
        })
        .await
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Base URL, e.g. `http://127.0.0.1:41234`
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// All requests received so far
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// An address nothing is listening on
pub async fn unreachable_address() -> std::io::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    listener.local_addr()
}

async fn record(req: Request<Incoming>) -> Result<RecordedRequest, hyper::Error> {
    let (parts, body) = req.into_parts();
    let body = body.collect().await?.to_bytes();

    Ok(RecordedRequest {
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        content_type: parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body,
    })
}

fn into_response(response: MockResponse) -> Response<Full<Bytes>> {
    let mut builder = Response::builder().status(response.status);
    if let Some(content_type) = &response.content_type {
        builder = builder.header(CONTENT_TYPE, content_type.as_str());
    }
    builder
        .body(Full::new(Bytes::from(response.body)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

async fn registry_response(registry: &MemoryRegistry, request: RecordedRequest) -> MockResponse {
    if request.path != "/registry" {
        return MockResponse::text(404, "not found");
    }

    let service: Service = match serde_json::from_slice(&request.body) {
        Ok(service) => service,
        Err(e) => return MockResponse::text(400, e.to_string()),
    };

    match request.method.as_str() {
        "POST" => {
            let ttl = match request_ttl(&request) {
                Ok(ttl) => ttl,
                Err(reason) => return MockResponse::text(400, reason),
            };
            let _ = registry.register(&service, ttl).await;
            MockResponse::ok()
        }
        "DELETE" => {
            let known = registry
                .get_service(&service.name)
                .await
                .map(|live| {
                    live.nodes
                        .iter()
                        .any(|node| service.node_ids().any(|id| id == node.id))
                })
                .unwrap_or(false);
            let _ = registry.deregister(&service).await;
            if known {
                MockResponse::ok()
            } else {
                MockResponse::text(404, "service not found")
            }
        }
        _ => MockResponse::text(405, "method not allowed"),
    }
}

/// The `ttl` query parameter of a register call (`30s`, `250ms`, `2m`)
fn request_ttl(request: &RecordedRequest) -> Result<Option<Duration>, String> {
    let Some(query) = request.query.as_deref() else {
        return Ok(None);
    };
    let url = reqwest::Url::parse(&format!("http://registry/?{}", query))
        .map_err(|e| format!("invalid query: {}", e))?;
    let Some((_, ttl)) = url.query_pairs().find(|(key, _)| key == "ttl") else {
        return Ok(None);
    };

    let split = ttl
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("ttl '{}' has no unit", ttl))?;
    let (number, unit) = ttl.split_at(split);
    let value: u64 = number
        .parse()
        .map_err(|_| format!("invalid ttl '{}'", ttl))?;
    match unit {
        "ms" => Ok(Some(Duration::from_millis(value))),
        "s" => Ok(Some(Duration::from_secs(value))),
        "m" => value
            .checked_mul(60)
            .map(|secs| Some(Duration::from_secs(secs)))
            .ok_or_else(|| format!("ttl '{}' is too large", ttl)),
        _ => Err(format!("invalid ttl unit in '{}'", ttl)),
    }
}
