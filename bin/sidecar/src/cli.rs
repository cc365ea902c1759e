//! Command line and environment configuration

use clap::{Parser, ValueEnum};
use sidecar_core::{ConfigError, SidecarConfig};
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(
    name = "sidecar",
    version,
    about = "Registers a service instance with the registry and proxies requests to it"
)]
pub struct Cli {
    /// Service name to register
    #[arg(long, env = "SIDECAR_SERVICE_NAME")]
    pub name: Option<String>,

    /// Service version to register
    #[arg(long = "service-version", env = "SIDECAR_SERVICE_VERSION")]
    pub service_version: Option<String>,

    /// Node metadata as key=value, repeatable
    #[arg(
        long = "metadata",
        env = "SIDECAR_METADATA",
        value_delimiter = ',',
        value_parser = parse_key_value
    )]
    pub metadata: Vec<(String, String)>,

    /// Registry base URL
    #[arg(long, env = "SIDECAR_REGISTRY_ADDRESS", default_value = "http://127.0.0.1:8081")]
    pub registry_address: String,

    /// Backend base URL
    #[arg(long, env = "SIDECAR_BACKEND_ADDRESS", default_value = "http://127.0.0.1:8080")]
    pub backend_address: String,

    /// Path of the backend JSON-RPC endpoint
    #[arg(long, env = "SIDECAR_RPC_PATH", default_value = "/")]
    pub rpc_path: String,

    /// Address to accept requests on
    #[arg(long, env = "SIDECAR_LISTEN_ADDRESS", default_value = "127.0.0.1:8082")]
    pub listen_address: String,

    /// Host to announce instead of the listen IP
    #[arg(long, env = "SIDECAR_ADVERTISE_ADDRESS")]
    pub advertise_address: Option<String>,

    /// Timeout for each forwarded call (e.g. 30s, 500ms)
    #[arg(
        long,
        env = "SIDECAR_REQUEST_TIMEOUT",
        default_value = "30s",
        value_parser = parse_duration
    )]
    pub request_timeout: Duration,

    /// Timeout for each registry call
    #[arg(
        long,
        env = "SIDECAR_REGISTRY_TIMEOUT",
        default_value = "5s",
        value_parser = parse_duration
    )]
    pub registry_timeout: Duration,

    /// How long in-flight requests may run after a termination signal
    #[arg(
        long,
        env = "SIDECAR_SHUTDOWN_TIMEOUT",
        default_value = "10s",
        value_parser = parse_duration
    )]
    pub shutdown_timeout: Duration,

    /// Re-register on this interval while serving
    #[arg(long, env = "SIDECAR_REGISTER_INTERVAL", value_parser = parse_duration)]
    pub register_interval: Option<Duration>,

    /// Registry TTL for the node; needs a shorter --register-interval
    #[arg(long, env = "SIDECAR_REGISTER_TTL", value_parser = parse_duration)]
    pub register_ttl: Option<Duration>,

    /// Log output format
    #[arg(long, env = "SIDECAR_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Cli {
    /// Build and validate the sidecar configuration
    pub fn into_config(self) -> Result<SidecarConfig, ConfigError> {
        let listen_address: SocketAddr =
            self.listen_address
                .parse()
                .map_err(|e| ConfigError::Invalid {
                    field: "listen_address",
                    reason: format!("'{}': {}", self.listen_address, e),
                })?;

        let config = SidecarConfig {
            service_name: self.name.unwrap_or_default(),
            service_version: self.service_version,
            metadata: self.metadata.into_iter().collect(),
            registry_address: self.registry_address,
            backend_address: self.backend_address,
            rpc_path: self.rpc_path,
            listen_address,
            advertise_address: self.advertise_address,
            request_timeout: self.request_timeout,
            registry_timeout: self.registry_timeout,
            shutdown_timeout: self.shutdown_timeout,
            register_interval: self.register_interval,
            register_ttl: self.register_ttl,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Parse `key=value`
fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    Ok((key.trim().to_string(), value.trim().to_string()))
}

/// Parse `250ms`, `5s`, `2m`; a bare number is seconds
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (number, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let value: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration '{}'", s))?;

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => value
            .checked_mul(60)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration '{}' is too large", s)),
        _ => Err(format!("invalid duration unit in '{}' (use ms, s or m)", s)),
    }
}
