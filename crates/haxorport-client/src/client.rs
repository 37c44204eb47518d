//! Client facade.
//!
//! Assembles the control session, the tunnel registry, and the HTTP worker,
//! and exposes the operations the CLI (or an embedding program) needs.

use std::sync::Arc;

use haxorport_proto::TunnelAuth;
use tracing::warn;

use crate::config::{ClientConfig, TunnelSpec};
use crate::control::ControlSession;
use crate::error::ClientError;
use crate::http_forwarder::HttpForwarder;
use crate::registry::TunnelRegistry;
use crate::tunnel::Tunnel;

/// A haxorport client: one control session plus its tunnels.
pub struct Client {
    config: Arc<ClientConfig>,
    session: Arc<ControlSession>,
    registry: Arc<TunnelRegistry>,
}

impl Client {
    /// Wire up the session, registry, and workers. Nothing connects yet.
    pub fn new(config: ClientConfig) -> Self {
        let config = Arc::new(config);
        let session = Arc::new(ControlSession::new(Arc::clone(&config)));
        let registry = TunnelRegistry::new(Arc::clone(&session));

        let forwarder = HttpForwarder::new(
            Arc::clone(&session),
            &registry,
            config.base_domain.clone(),
        );
        session.register_handler(
            haxorport_proto::MessageType::HttpRequest,
            forwarder.handler(),
        );

        Self {
            config,
            session,
            registry,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn session(&self) -> &Arc<ControlSession> {
        &self.session
    }

    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.registry
    }

    /// Connect and authenticate. Token validation failures and broker auth
    /// rejections are fatal; transport failures are retryable.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.session.connect().await
    }

    /// Start the background reconnect supervisor.
    pub fn run_with_reconnect(&self) {
        self.session.run_with_reconnect();
    }

    /// Register one tunnel from a spec.
    pub async fn register(&self, spec: TunnelSpec) -> Result<Tunnel, ClientError> {
        self.registry.register(spec).await
    }

    /// Register every tunnel listed in the configuration, best-effort.
    pub async fn register_configured(&self) -> Vec<Tunnel> {
        let mut tunnels = Vec::new();
        for spec in self.config.tunnels.clone() {
            match self.registry.register(spec.clone()).await {
                Ok(tunnel) => tunnels.push(tunnel),
                Err(err) => warn!(
                    "failed to register configured tunnel on port {}: {err}",
                    spec.local_port
                ),
            }
        }
        tunnels
    }

    pub async fn create_http_tunnel(
        &self,
        local_port: u16,
        subdomain: Option<String>,
        auth: Option<TunnelAuth>,
    ) -> Result<Tunnel, ClientError> {
        let mut spec = TunnelSpec::http(local_port, subdomain);
        spec.auth = auth;
        self.registry.register(spec).await
    }

    pub async fn create_tcp_tunnel(
        &self,
        local_port: u16,
        remote_port: Option<u16>,
        local_addr: Option<String>,
    ) -> Result<Tunnel, ClientError> {
        let mut spec = TunnelSpec::tcp(local_port, remote_port);
        if let Some(local_addr) = local_addr {
            spec.local_addr = local_addr;
        }
        self.registry.register(spec).await
    }

    pub async fn close_tunnel(&self, tunnel_id: &str) -> Result<(), ClientError> {
        self.registry.unregister(tunnel_id).await
    }

    pub fn tunnels(&self) -> Vec<Tunnel> {
        self.registry.get_all()
    }

    /// Graceful shutdown: unregister every active tunnel (ignoring errors),
    /// then close the control session.
    pub async fn shutdown(&self) {
        for tunnel in self.registry.get_all() {
            if let Err(err) = self.registry.unregister(&tunnel.id).await {
                warn!("failed to unregister tunnel {}: {err}", tunnel.id);
            }
        }
        self.session.close().await;
    }
}
