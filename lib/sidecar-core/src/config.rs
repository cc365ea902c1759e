//! Sidecar configuration
//!
//! Supplied once at process start and never changed afterwards. Call
//! [`SidecarConfig::validate`] before using it; an invalid configuration is
//! fatal.

use crate::{ConfigError, Service};
use reqwest::Url;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct SidecarConfig {
    /// Logical name the service is registered under
    pub service_name: String,
    pub service_version: Option<String>,
    /// Attributes announced on the node
    pub metadata: BTreeMap<String, String>,
    /// Base URL of the registry, e.g. `http://127.0.0.1:8081`
    pub registry_address: String,
    /// Base URL of the backend service
    pub backend_address: String,
    /// Path of the backend JSON-RPC endpoint
    pub rpc_path: String,
    /// Address the inbound listener binds
    pub listen_address: SocketAddr,
    /// Host announced to the registry instead of the listen IP
    pub advertise_address: Option<String>,
    /// Bound on each forwarded call
    pub request_timeout: Duration,
    /// Bound on each registry call
    pub registry_timeout: Duration,
    /// How long in-flight requests may run after a termination signal
    pub shutdown_timeout: Duration,
    /// Re-register on this interval while serving
    pub register_interval: Option<Duration>,
    /// Ask the registry to drop the node when it is not re-registered
    /// within this long
    pub register_ttl: Option<Duration>,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            service_name: String::new(),
            service_version: None,
            metadata: BTreeMap::new(),
            registry_address: "http://127.0.0.1:8081".to_string(),
            backend_address: "http://127.0.0.1:8080".to_string(),
            rpc_path: "/".to_string(),
            listen_address: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8082),
            advertise_address: None,
            request_timeout: Duration::from_secs(30),
            registry_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(10),
            register_interval: None,
            register_ttl: None,
        }
    }
}

impl SidecarConfig {
    /// Check every option. The first problem found is returned.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::Missing("service_name"));
        }
        if self
            .service_name
            .chars()
            .any(|c| c.is_whitespace() || c == '/')
        {
            return Err(ConfigError::Invalid {
                field: "service_name",
                reason: format!("'{}' contains whitespace or '/'", self.service_name),
            });
        }

        validate_base_url("registry_address", &self.registry_address)?;
        validate_base_url("backend_address", &self.backend_address)?;

        if !self.rpc_path.starts_with('/') {
            return Err(ConfigError::Invalid {
                field: "rpc_path",
                reason: format!("'{}' must start with '/'", self.rpc_path),
            });
        }

        if self.listen_address.port() == 0 {
            return Err(ConfigError::Invalid {
                field: "listen_address",
                reason: "port must not be 0".to_string(),
            });
        }

        if let Some(advertise) = &self.advertise_address {
            if advertise.trim().is_empty() || advertise.contains("://") || advertise.contains('/') {
                return Err(ConfigError::Invalid {
                    field: "advertise_address",
                    reason: format!("'{}' is not a host or IP", advertise),
                });
            }
        }

        if self.metadata.keys().any(|k| k.trim().is_empty()) {
            return Err(ConfigError::Invalid {
                field: "metadata",
                reason: "keys must not be empty".to_string(),
            });
        }

        for (field, value) in [
            ("request_timeout", Some(self.request_timeout)),
            ("registry_timeout", Some(self.registry_timeout)),
            ("shutdown_timeout", Some(self.shutdown_timeout)),
            ("register_interval", self.register_interval),
            ("register_ttl", self.register_ttl),
        ] {
            if value == Some(Duration::ZERO) {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        if let Some(ttl) = self.register_ttl {
            match self.register_interval {
                None => {
                    return Err(ConfigError::Invalid {
                        field: "register_interval",
                        reason: "required when register_ttl is set".to_string(),
                    });
                }
                Some(interval) if interval >= ttl => {
                    return Err(ConfigError::Invalid {
                        field: "register_interval",
                        reason: format!(
                            "{:?} must be shorter than register_ttl {:?}",
                            interval, ttl
                        ),
                    });
                }
                Some(_) => {}
            }
        }

        Ok(())
    }

    /// Host announced to the registry.
    ///
    /// Falls back to the listen IP, or loopback when listening on an
    /// unspecified address.
    pub fn advertised_host(&self) -> String {
        match &self.advertise_address {
            Some(host) => host.clone(),
            None if self.listen_address.ip().is_unspecified() => Ipv4Addr::LOCALHOST.to_string(),
            None => self.listen_address.ip().to_string(),
        }
    }

    /// Build the descriptor for this run. Every call yields a fresh node id.
    pub fn descriptor(&self) -> Service {
        let mut service = Service::build(
            self.service_name.clone(),
            self.advertised_host(),
            self.listen_address.port(),
        );
        if let Some(version) = &self.service_version {
            service = service.with_version(version.clone());
        }
        for (key, value) in &self.metadata {
            service = service.with_metadata(key.clone(), value.clone());
        }
        service
    }
}

fn validate_base_url(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Missing(field));
    }

    let url = Url::parse(value).map_err(|e| ConfigError::Invalid {
        field,
        reason: format!("'{}': {}", value, e),
    })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::Invalid {
            field,
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ConfigError::Invalid {
            field,
            reason: format!("'{}' has no host", value),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> SidecarConfig {
        SidecarConfig {
            service_name: "greeter".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_with_name_is_valid() {
        assert_eq!(valid().validate(), Ok(()));
    }

    #[test]
    fn test_missing_service_name() {
        let config = SidecarConfig::default();
        assert_eq!(config.validate(), Err(ConfigError::Missing("service_name")));
    }

    #[test]
    fn test_invalid_service_name() {
        let config = SidecarConfig {
            service_name: "greeter service".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "service_name", .. })
        ));
    }

    #[test]
    fn test_invalid_registry_address() {
        let mut config = valid();
        config.registry_address = "not a url".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "registry_address", .. })
        ));

        config.registry_address = "ftp://127.0.0.1:21".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "registry_address", .. })
        ));

        config.registry_address = String::new();
        assert_eq!(config.validate(), Err(ConfigError::Missing("registry_address")));
    }

    #[test]
    fn test_invalid_backend_address() {
        let mut config = valid();
        config.backend_address = "127.0.0.1:8080".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "backend_address", .. })
        ));
    }

    #[test]
    fn test_zero_port_rejected() {
        let mut config = valid();
        config.listen_address = "127.0.0.1:0".parse().unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "listen_address", .. })
        ));
    }

    #[test]
    fn test_rpc_path_must_be_absolute() {
        let mut config = valid();
        config.rpc_path = "rpc".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "rpc_path", .. })
        ));
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let mut config = valid();
        config.shutdown_timeout = Duration::ZERO;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "shutdown_timeout", .. })
        ));

        let mut config = valid();
        config.register_interval = Some(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "register_interval", .. })
        ));
    }

    #[test]
    fn test_register_ttl_needs_shorter_interval() {
        let mut config = valid();
        config.register_ttl = Some(Duration::from_secs(30));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "register_interval", .. })
        ));

        config.register_interval = Some(Duration::from_secs(30));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "register_interval", .. })
        ));

        config.register_interval = Some(Duration::from_secs(10));
        assert_eq!(config.validate(), Ok(()));

        config.register_ttl = Some(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "register_ttl", .. })
        ));
    }

    #[test]
    fn test_advertised_host() {
        let mut config = valid();
        config.listen_address = "10.0.0.5:9000".parse().unwrap();
        assert_eq!(config.advertised_host(), "10.0.0.5");

        config.listen_address = "0.0.0.0:9000".parse().unwrap();
        assert_eq!(config.advertised_host(), "127.0.0.1");

        config.advertise_address = Some("greeter.internal".to_string());
        assert_eq!(config.advertised_host(), "greeter.internal");
    }

    #[test]
    fn test_invalid_advertise_address() {
        let mut config = valid();
        config.advertise_address = Some("http://greeter".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "advertise_address", .. })
        ));
    }

    #[test]
    fn test_descriptor_from_config() {
        let mut config = valid();
        config.listen_address = "10.0.0.5:9000".parse().unwrap();
        config.service_version = Some("2.0.0".to_string());
        config.metadata.insert("zone".to_string(), "a".to_string());

        let service = config.descriptor();
        assert_eq!(service.name, "greeter");
        assert_eq!(service.version.as_deref(), Some("2.0.0"));
        assert_eq!(service.nodes[0].address, "10.0.0.5");
        assert_eq!(service.nodes[0].port, 9000);
        assert_eq!(service.nodes[0].metadata.get("zone").map(String::as_str), Some("a"));
    }
}
