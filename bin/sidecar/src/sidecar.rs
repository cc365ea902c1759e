//! Sidecar lifecycle
//!
//! `Starting → Registered → Serving → Deregistering → Stopped`. Registration
//! failures are logged and never stop the sidecar; the descriptor built while
//! starting is the one deregistered on the way out.

use crate::routes::AppState;
use crate::server;
use anyhow::{Context, Result};
use sidecar_core::{ConfigError, Registry, Service, SidecarConfig};
use sidecar_proxy::{HttpForwarder, MetricsCollector, RpcForwarder};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SidecarState {
    Starting,
    Registered,
    Serving,
    Deregistering,
    Stopped,
}

impl fmt::Display for SidecarState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SidecarState::Starting => "STARTING",
            SidecarState::Registered => "REGISTERED",
            SidecarState::Serving => "SERVING",
            SidecarState::Deregistering => "DEREGISTERING",
            SidecarState::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// One sidecar run: owns the configuration, the registry handle and the
/// lifecycle state.
pub struct Sidecar {
    config: SidecarConfig,
    registry: Arc<dyn Registry>,
    metrics: MetricsCollector,
    state: watch::Sender<SidecarState>,
}

impl Sidecar {
    /// Create a sidecar. Fails if `config` is invalid.
    pub fn new(
        config: SidecarConfig,
        registry: Arc<dyn Registry>,
        metrics: MetricsCollector,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let (state, _) = watch::channel(SidecarState::Starting);

        Ok(Self {
            config,
            registry,
            metrics,
            state,
        })
    }

    /// Watch lifecycle transitions
    pub fn subscribe(&self) -> watch::Receiver<SidecarState> {
        self.state.subscribe()
    }

    /// Run the full lifecycle, binding the configured listen address.
    /// Returns once deregistration has been attempted.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        self.run_inner(None, shutdown).await
    }

    /// Run the full lifecycle on an already bound listener
    pub async fn run_on(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        self.run_inner(Some(listener), shutdown).await
    }

    async fn run_inner(
        self,
        listener: Option<TcpListener>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let descriptor = Arc::new(self.config.descriptor());
        info!(
            "Starting sidecar for service {} as node {} ({}:{})",
            descriptor.name,
            descriptor.nodes[0].id,
            descriptor.nodes[0].address,
            descriptor.nodes[0].port
        );

        let rpc = RpcForwarder::new(
            &self.config.backend_address,
            &self.config.rpc_path,
            self.config.request_timeout,
        )
        .context("failed to create RPC forwarder")?;
        let http = HttpForwarder::new(&self.config.backend_address, self.config.request_timeout)
            .context("failed to create HTTP forwarder")?;
        info!("Forwarding RPC to {}", rpc.endpoint());

        let ttl = self.config.register_ttl;
        register(self.registry.as_ref(), &self.metrics, &descriptor, ttl).await;
        self.transition(SidecarState::Registered);

        let listener = match listener {
            Some(listener) => listener,
            None => match TcpListener::bind(self.config.listen_address).await {
                Ok(listener) => listener,
                Err(e) => {
                    // a node that cannot serve must not stay registered
                    self.shutdown_registration(&descriptor).await;
                    return Err(e).with_context(|| {
                        format!("failed to bind {}", self.config.listen_address)
                    });
                }
            },
        };
        if let Ok(addr) = listener.local_addr() {
            info!("Sidecar listening on {}", addr);
        }

        let state = Arc::new(AppState {
            descriptor: descriptor.clone(),
            rpc,
            http,
            metrics: self.metrics.clone(),
            abandon: CancellationToken::new(),
        });

        let heartbeat = self.config.register_interval.map(|interval| {
            spawn_heartbeat(
                self.registry.clone(),
                self.metrics.clone(),
                descriptor.clone(),
                interval,
                ttl,
                shutdown.clone(),
            )
        });

        self.transition(SidecarState::Serving);
        server::serve(listener, state, shutdown.clone(), self.config.shutdown_timeout).await;

        if let Some(heartbeat) = heartbeat {
            if let Err(e) = heartbeat.await {
                warn!("Re-registration task failed: {}", e);
            }
        }

        self.shutdown_registration(&descriptor).await;
        Ok(())
    }

    async fn shutdown_registration(&self, descriptor: &Service) {
        self.transition(SidecarState::Deregistering);
        deregister(
            self.registry.as_ref(),
            &self.metrics,
            descriptor,
            self.config.registry_timeout,
        )
        .await;
        self.transition(SidecarState::Stopped);
    }

    fn transition(&self, next: SidecarState) {
        let previous = self.state.send_replace(next);
        info!("Sidecar state: {} -> {}", previous, next);
    }
}

async fn register(
    registry: &dyn Registry,
    metrics: &MetricsCollector,
    descriptor: &Service,
    ttl: Option<Duration>,
) {
    match registry.register(descriptor, ttl).await {
        Ok(()) => {
            metrics.record_registry("register", "ok");
            info!("Registered node {}", descriptor.nodes[0].id);
        }
        Err(e) => {
            metrics.record_registry("register", e.kind());
            warn!("Registration failed, serving anyway: {}", e);
        }
    }
}

async fn deregister(
    registry: &dyn Registry,
    metrics: &MetricsCollector,
    descriptor: &Service,
    timeout: Duration,
) {
    match tokio::time::timeout(timeout, registry.deregister(descriptor)).await {
        Ok(Ok(())) => {
            metrics.record_registry("deregister", "ok");
            info!("Deregistered node {}", descriptor.nodes[0].id);
        }
        Ok(Err(e)) => {
            metrics.record_registry("deregister", e.kind());
            warn!("Deregistration failed: {}", e);
        }
        Err(_) => {
            metrics.record_registry("deregister", "timeout");
            warn!("Deregistration timed out after {:?}", timeout);
        }
    }
}

/// Re-register on `interval` until `shutdown` is cancelled.
///
/// Shutdown is only observed between registrations: a register already sent
/// runs to completion, bounded by the registry timeout, so it always lands
/// before the deregister.
fn spawn_heartbeat(
    registry: Arc<dyn Registry>,
    metrics: MetricsCollector,
    descriptor: Arc<Service>,
    interval: Duration,
    ttl: Option<Duration>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // the first tick completes immediately; registration already happened
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            debug!("Re-registering node {}", descriptor.nodes[0].id);
            register(registry.as_ref(), &metrics, &descriptor, ttl).await;
        }
    })
}
