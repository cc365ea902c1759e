//! Inbound routes and request dispatch
//!
//! | route             | forwards to                        |
//! |-------------------|------------------------------------|
//! | `POST /rpc`       | RPC forwarder, method in the body  |
//! | `POST /rpc/{m}`   | RPC forwarder, body is the params  |
//! | `POST /http/{p}`  | HTTP forwarder at `/{p}`           |
//!
//! plus `GET /healthz`, `GET /metrics` and `GET /registry`.

use http_body_util::{BodyExt, Full, Limited};
use hyper::{
    body::{Bytes, Incoming},
    header::{HeaderValue, ALLOW, CONTENT_TYPE},
    Method, Request, Response, StatusCode,
};
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use serde_json::{json, Value};
use sidecar_core::Service;
use sidecar_proxy::{ForwardError, HttpForwarder, MetricsCollector, RpcForwarder};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Largest inbound request body accepted
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
const JSON_CONTENT_TYPE: &str = "application/json";

/// Everything a request handler needs. Shared read-only across requests.
pub struct AppState {
    pub descriptor: Arc<Service>,
    pub rpc: RpcForwarder,
    pub http: HttpForwarder,
    pub metrics: MetricsCollector,
    /// Cancelled when in-flight requests are abandoned at shutdown
    pub abandon: CancellationToken,
}

pub async fn handle_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    debug!("{} {}", req.method(), req.uri().path());

    let (route, response) = route_request(req, &state).await;
    state.metrics.record_inbound(route, response.status().as_u16());

    Ok(response)
}

async fn route_request(
    req: Request<Incoming>,
    state: &AppState,
) -> (&'static str, Response<Full<Bytes>>) {
    let path = req.uri().path().to_string();

    if path == "/healthz" {
        let response = only(&req, Method::GET)
            .unwrap_or_else(|| text_response(StatusCode::OK, "OK\n"));
        return ("/healthz", response);
    }

    if path == "/metrics" {
        let response = only(&req, Method::GET).unwrap_or_else(|| match state.metrics.gather() {
            Ok(text) => with_content_type(
                text_response(StatusCode::OK, text),
                "text/plain; version=0.0.4",
            ),
            Err(e) => {
                warn!("Failed to gather metrics: {}", e);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to gather metrics\n")
            }
        });
        return ("/metrics", response);
    }

    if path == "/registry" {
        let response = only(&req, Method::GET)
            .unwrap_or_else(|| match serde_json::to_value(state.descriptor.as_ref()) {
                Ok(body) => json_response(StatusCode::OK, &body),
                Err(e) => {
                    error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal", e.to_string())
                }
            });
        return ("/registry", response);
    }

    if path == "/rpc" {
        if let Some(response) = only(&req, Method::POST) {
            return ("/rpc", response);
        }
        let (content_type, body) = match read_body(req).await {
            Ok(read) => read,
            Err(response) => return ("/rpc", response),
        };
        let response = match parse_rpc_call(content_type.as_deref(), &body) {
            Ok((method, params)) => forward_rpc(state, &method, params).await,
            Err(reason) => error_response(StatusCode::BAD_REQUEST, "bad_request", reason),
        };
        return ("/rpc", response);
    }

    if match_path(&path, "/rpc/*") {
        if let Some(response) = only(&req, Method::POST) {
            return ("/rpc/{method}", response);
        }
        let Some(method) = rpc_method_from_path(&path) else {
            return (
                "/rpc/{method}",
                error_response(
                    StatusCode::BAD_REQUEST,
                    "bad_request",
                    "missing RPC method in path",
                ),
            );
        };
        let (_, body) = match read_body(req).await {
            Ok(read) => read,
            Err(response) => return ("/rpc/{method}", response),
        };
        let response = match parse_params(&body) {
            Ok(params) => forward_rpc(state, &method, params).await,
            Err(reason) => error_response(StatusCode::BAD_REQUEST, "bad_request", reason),
        };
        return ("/rpc/{method}", response);
    }

    if match_path(&path, "/http/*") {
        if let Some(response) = only(&req, Method::POST) {
            return ("/http/{path}", response);
        }
        let target = backend_path(&path);
        let query = req.uri().query().map(str::to_string);
        let (content_type, body) = match read_body(req).await {
            Ok(read) => read,
            Err(response) => return ("/http/{path}", response),
        };
        let response = match parse_form_params(query.as_deref(), content_type.as_deref(), &body) {
            Ok(params) => forward_http(state, &target, &params).await,
            Err(reason) => error_response(StatusCode::BAD_REQUEST, "bad_request", reason),
        };
        return ("/http/{path}", response);
    }

    (
        "unmatched",
        error_response(StatusCode::NOT_FOUND, "not_found", format!("no route for {}", path)),
    )
}

async fn forward_rpc(state: &AppState, method: &str, params: Value) -> Response<Full<Bytes>> {
    let started = Instant::now();
    let result = state.rpc.forward_rpc(method, params, &state.abandon).await;
    state
        .metrics
        .record_forward("rpc", outcome(&result), started.elapsed());

    match result {
        Ok(value) => json_response(StatusCode::OK, &value),
        Err(e) => forward_error_response(&e),
    }
}

async fn forward_http(
    state: &AppState,
    path: &str,
    params: &BTreeMap<String, String>,
) -> Response<Full<Bytes>> {
    let started = Instant::now();
    let result = state.http.forward_http(path, params, &state.abandon).await;
    state
        .metrics
        .record_forward("http", outcome(&result), started.elapsed());

    match result {
        Ok(reply) => {
            let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut response = Response::new(Full::new(Bytes::from(reply.body)));
            *response.status_mut() = status;
            if let Some(value) = reply
                .content_type
                .as_deref()
                .and_then(|ct| HeaderValue::from_str(ct).ok())
            {
                response.headers_mut().insert(CONTENT_TYPE, value);
            }
            response
        }
        Err(e) => forward_error_response(&e),
    }
}

fn outcome<T>(result: &Result<T, ForwardError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    }
}

/// Match a request path against a route pattern
fn match_path(path: &str, pattern: &str) -> bool {
    // Exact match
    if pattern == path {
        return true;
    }

    // Prefix match with wildcard
    if let Some(prefix) = pattern.strip_suffix("/*") {
        return path == prefix || path.starts_with(&format!("{}/", prefix));
    }

    false
}

/// Percent-decoded method name from `/rpc/{method}`
fn rpc_method_from_path(path: &str) -> Option<String> {
    let raw = path.strip_prefix("/rpc/")?;
    let method = percent_decode_str(raw).decode_utf8().ok()?;
    if method.is_empty() || method.contains('/') {
        return None;
    }
    Some(method.into_owned())
}

/// Backend path for `/http/{path}`
fn backend_path(path: &str) -> String {
    match path.strip_prefix("/http") {
        Some(rest) if rest.starts_with('/') => rest.to_string(),
        _ => "/".to_string(),
    }
}

#[derive(Deserialize)]
struct RpcCall {
    #[serde(alias = "endpoint")]
    method: String,
    #[serde(default, alias = "request")]
    params: Value,
}

/// Extract method and params from a `/rpc` body.
///
/// JSON bodies carry `{method, params}` (or `{endpoint, request}`). Form
/// bodies carry `method` (or `endpoint`) and `request`, the params as JSON
/// text.
fn parse_rpc_call(content_type: Option<&str>, body: &[u8]) -> Result<(String, Value), String> {
    let (method, params) = if is_form(content_type) {
        let mut form: BTreeMap<String, String> =
            serde_urlencoded::from_bytes(body).map_err(|e| format!("invalid form body: {}", e))?;
        let method = form
            .remove("method")
            .or_else(|| form.remove("endpoint"))
            .unwrap_or_default();
        let params = match form.remove("request").or_else(|| form.remove("params")) {
            Some(text) if !text.trim().is_empty() => serde_json::from_str(&text)
                .map_err(|e| format!("invalid JSON in request field: {}", e))?,
            _ => Value::Null,
        };
        (method, params)
    } else {
        let call: RpcCall =
            serde_json::from_slice(body).map_err(|e| format!("invalid RPC request: {}", e))?;
        (call.method, call.params)
    };

    if method.trim().is_empty() {
        return Err("missing RPC method".to_string());
    }
    Ok((method, params))
}

/// Params for `/rpc/{method}`; an empty body means no params
fn parse_params(body: &[u8]) -> Result<Value, String> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body).map_err(|e| format!("invalid JSON params: {}", e))
}

/// Form parameters for `/http/{path}`: query string first, body fields win.
/// A JSON object body is accepted too, its values stringified.
fn parse_form_params(
    query: Option<&str>,
    content_type: Option<&str>,
    body: &[u8],
) -> Result<BTreeMap<String, String>, String> {
    let mut params: BTreeMap<String, String> = match query {
        Some(query) => serde_urlencoded::from_str(query)
            .map_err(|e| format!("invalid query string: {}", e))?,
        None => BTreeMap::new(),
    };

    if body.is_empty() {
        return Ok(params);
    }

    if is_json(content_type) {
        let object: serde_json::Map<String, Value> =
            serde_json::from_slice(body).map_err(|e| format!("invalid JSON body: {}", e))?;
        for (key, value) in object {
            let value = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            params.insert(key, value);
        }
    } else {
        let form: BTreeMap<String, String> =
            serde_urlencoded::from_bytes(body).map_err(|e| format!("invalid form body: {}", e))?;
        params.extend(form);
    }

    Ok(params)
}

fn is_form(content_type: Option<&str>) -> bool {
    content_type.is_some_and(|ct| ct.starts_with(FORM_CONTENT_TYPE))
}

fn is_json(content_type: Option<&str>) -> bool {
    content_type.is_some_and(|ct| ct.starts_with(JSON_CONTENT_TYPE))
}

/// Collect the request body, bounded by `MAX_BODY_BYTES`
async fn read_body(
    req: Request<Incoming>,
) -> Result<(Option<String>, Bytes), Response<Full<Bytes>>> {
    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => Ok((content_type, collected.to_bytes())),
        Err(e) => {
            debug!("Failed to read request body: {}", e);
            Err(error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "bad_request",
                format!("request body unreadable or larger than {} bytes", MAX_BODY_BYTES),
            ))
        }
    }
}

/// `405` unless the request uses `allowed`
fn only(req: &Request<Incoming>, allowed: Method) -> Option<Response<Full<Bytes>>> {
    if *req.method() == allowed {
        return None;
    }
    let mut response = error_response(
        StatusCode::METHOD_NOT_ALLOWED,
        "method_not_allowed",
        format!("{} not allowed", req.method()),
    );
    if let Ok(value) = HeaderValue::from_str(allowed.as_str()) {
        response.headers_mut().insert(ALLOW, value);
    }
    Some(response)
}

fn forward_error_response(err: &ForwardError) -> Response<Full<Bytes>> {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::BAD_GATEWAY);
    json_response(status, &err.to_json())
}

fn error_response(
    status: StatusCode,
    kind: &str,
    message: impl Into<String>,
) -> Response<Full<Bytes>> {
    json_response(status, &json!({"kind": kind, "error": message.into()}))
}

fn json_response(status: StatusCode, body: &Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    with_content_type(response, JSON_CONTENT_TYPE)
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

fn with_content_type(
    mut response: Response<Full<Bytes>>,
    content_type: &'static str,
) -> Response<Full<Bytes>> {
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
