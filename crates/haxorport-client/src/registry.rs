//! Tunnel registry.
//!
//! Owns the tunnel records and the connection map for bridged TCP sockets.
//! Registration delegates to the control session; the registry enforces the
//! local quota gate and manages listener lifecycles.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use haxorport_proto::{DataPayload, MessageType, TunnelType};

use crate::config::TunnelSpec;
use crate::control::ControlSession;
use crate::error::ClientError;
use crate::tcp_forwarder;
use crate::tunnel::Tunnel;

/// Handle to one bridged TCP connection. Dropping the sender ends the
/// bridge task, which closes the local socket.
pub(crate) struct ConnectionHandle {
    pub(crate) tunnel_id: String,
    pub(crate) tx: mpsc::UnboundedSender<Vec<u8>>,
}

/// In-memory tunnel and connection bookkeeping.
pub struct TunnelRegistry {
    session: Arc<ControlSession>,
    tunnels: RwLock<HashMap<String, Tunnel>>,
    connections: RwLock<HashMap<String, ConnectionHandle>>,
    /// Listener tasks per tcp tunnel, aborted on unregister.
    listeners: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TunnelRegistry {
    /// Build the registry and hook its `data` handler into the session.
    pub fn new(session: Arc<ControlSession>) -> Arc<Self> {
        let registry = Arc::new(Self {
            session,
            tunnels: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&registry);
        registry.session.register_handler(
            MessageType::Data,
            Arc::new(move |envelope| {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(registry) = weak.upgrade() else {
                        return Ok(());
                    };
                    let payload: DataPayload = envelope.parse_payload()?;
                    if let Err(err) = registry.handle_data(
                        &payload.tunnel_id,
                        &payload.connection_id,
                        &payload.data,
                    ) {
                        // A data frame for a connection we no longer hold is
                        // dropped; the session is unaffected.
                        warn!("dropping data frame: {err}");
                    }
                    Ok(())
                })
            }),
        );

        registry
    }

    pub(crate) fn session(&self) -> &Arc<ControlSession> {
        &self.session
    }

    /// Register a tunnel with the broker.
    ///
    /// Fails locally with `QuotaExceeded` when the subscription's tunnel
    /// quota is already known exhausted; no frame is sent in that case. If
    /// the session is down, one connect attempt is made first.
    pub async fn register(self: &Arc<Self>, spec: TunnelSpec) -> Result<Tunnel, ClientError> {
        spec.validate()?;

        if let Some(quota) = self.session.quota() {
            let tunnels = &quota.subscription.limits.tunnels;
            if tunnels.exhausted() {
                return Err(ClientError::QuotaExceeded {
                    used: tunnels.used,
                    limit: tunnels.limit,
                });
            }
        }

        if !self.session.is_connected() {
            self.session.connect().await?;
        }

        let reply = self.session.register(spec.register_payload()).await?;

        let mut tunnel = Tunnel::new(reply.tunnel_id.clone(), spec);
        match tunnel.tunnel_type() {
            TunnelType::Http => tunnel.set_http_info(reply.url.unwrap_or_default()),
            TunnelType::Tcp => tunnel.set_tcp_info(reply.remote_port.unwrap_or(0)),
        }

        info!(
            "tunnel {} registered ({} -> local port {})",
            tunnel.id,
            tunnel.tunnel_type(),
            tunnel.spec.local_port
        );

        self.tunnels
            .write()
            .expect("tunnel map lock poisoned")
            .insert(tunnel.id.clone(), tunnel.clone());

        if tunnel.tunnel_type() == TunnelType::Tcp {
            let handle = tcp_forwarder::spawn_listener(self, tunnel.clone());
            self.listeners
                .lock()
                .expect("listener map lock poisoned")
                .insert(tunnel.id.clone(), handle);
        }

        Ok(tunnel)
    }

    /// Unregister a tunnel: tell the broker, drop the record, stop the
    /// listener, and close every bridged connection belonging to it.
    pub async fn unregister(&self, tunnel_id: &str) -> Result<(), ClientError> {
        if !self
            .tunnels
            .read()
            .expect("tunnel map lock poisoned")
            .contains_key(tunnel_id)
        {
            return Err(ClientError::NotFound(format!("tunnel {tunnel_id}")));
        }

        self.session.unregister(tunnel_id).await?;
        self.remove_tunnel(tunnel_id);
        info!("tunnel {tunnel_id} unregistered");
        Ok(())
    }

    /// Local teardown of a tunnel's listener and connections.
    pub(crate) fn remove_tunnel(&self, tunnel_id: &str) {
        self.tunnels
            .write()
            .expect("tunnel map lock poisoned")
            .remove(tunnel_id);

        if let Some(handle) = self
            .listeners
            .lock()
            .expect("listener map lock poisoned")
            .remove(tunnel_id)
        {
            handle.abort();
        }

        self.connections
            .write()
            .expect("connection map lock poisoned")
            .retain(|_, handle| handle.tunnel_id != tunnel_id);
    }

    /// Snapshot of all tunnel records.
    pub fn get_all(&self) -> Vec<Tunnel> {
        self.tunnels
            .read()
            .expect("tunnel map lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn get_by_id(&self, tunnel_id: &str) -> Result<Tunnel, ClientError> {
        self.tunnels
            .read()
            .expect("tunnel map lock poisoned")
            .get(tunnel_id)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(format!("tunnel {tunnel_id}")))
    }

    /// Route an inbound `data` frame to the matching local socket.
    pub fn handle_data(
        &self,
        _tunnel_id: &str,
        connection_id: &str,
        data: &[u8],
    ) -> Result<(), ClientError> {
        let connections = self
            .connections
            .read()
            .expect("connection map lock poisoned");
        let handle = connections
            .get(connection_id)
            .ok_or_else(|| ClientError::NotFound(format!("connection {connection_id}")))?;
        handle
            .tx
            .send(data.to_vec())
            .map_err(|_| ClientError::NotFound(format!("connection {connection_id} closed")))
    }

    pub(crate) fn insert_connection(
        &self,
        connection_id: String,
        tunnel_id: String,
        tx: mpsc::UnboundedSender<Vec<u8>>,
    ) {
        self.connections
            .write()
            .expect("connection map lock poisoned")
            .insert(connection_id, ConnectionHandle { tunnel_id, tx });
    }

    pub(crate) fn remove_connection(&self, connection_id: &str) {
        self.connections
            .write()
            .expect("connection map lock poisoned")
            .remove(connection_id);
    }

    /// Number of live bridged connections.
    pub fn connection_count(&self) -> usize {
        self.connections
            .read()
            .expect("connection map lock poisoned")
            .len()
    }
}
