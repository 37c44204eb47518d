//! TCP tunnel worker.
//!
//! One listener task per tcp tunnel, one bridge task per accepted socket.
//! The bridge owns its socket: local reads become `data` frames, inbound
//! `data` frames arrive over the connection's channel and are written back.
//! Dropping the channel sender tears the bridge (and the socket) down.

use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::control::ControlSession;
use crate::registry::TunnelRegistry;
use crate::tunnel::Tunnel;

/// Local socket read chunk size; each chunk becomes one `data` frame.
const READ_CHUNK: usize = 4096;

pub(crate) fn spawn_listener(registry: &Arc<TunnelRegistry>, tunnel: Tunnel) -> JoinHandle<()> {
    let session = Arc::clone(registry.session());
    let weak = Arc::downgrade(registry);
    tokio::spawn(run_listener(weak, session, tunnel))
}

async fn run_listener(
    registry: Weak<TunnelRegistry>,
    session: Arc<ControlSession>,
    tunnel: Tunnel,
) {
    let addr = format!("{}:{}", tunnel.spec.local_addr, tunnel.spec.local_port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("tunnel {}: failed to bind {addr}: {err}", tunnel.id);
            return;
        }
    };
    info!("tunnel {} listening on {addr}", tunnel.id);

    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let connection_id = new_connection_id(&tunnel.id);
                debug!("tunnel {}: accepted {peer} as {connection_id}", tunnel.id);

                let (tx, rx) = mpsc::unbounded_channel();
                registry.insert_connection(connection_id.clone(), tunnel.id.clone(), tx);

                tokio::spawn(run_bridge(
                    Arc::downgrade(&registry),
                    Arc::clone(&session),
                    tunnel.id.clone(),
                    connection_id,
                    socket,
                    rx,
                ));
            }
            Err(err) => {
                error!("tunnel {}: accept failed: {err}", tunnel.id);
                break;
            }
        }
    }
}

/// `<tunnel_id>-<nanos>`, minted on accept and used by both ends to steer
/// `data` frames.
fn new_connection_id(tunnel_id: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{tunnel_id}-{nanos}")
}

async fn run_bridge(
    registry: Weak<TunnelRegistry>,
    session: Arc<ControlSession>,
    tunnel_id: String,
    connection_id: String,
    mut socket: TcpStream,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        tokio::select! {
            read = socket.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(err) = session.send_data(&tunnel_id, &connection_id, buf[..n].to_vec()).await {
                        warn!("connection {connection_id}: failed to forward {n} bytes: {err}");
                        break;
                    }
                }
                Err(err) => {
                    warn!("connection {connection_id}: read failed: {err}");
                    break;
                }
            },
            inbound = rx.recv() => match inbound {
                Some(bytes) => {
                    if let Err(err) = socket.write_all(&bytes).await {
                        warn!("connection {connection_id}: write failed: {err}");
                        break;
                    }
                }
                // Sender dropped: the tunnel was unregistered.
                None => break,
            },
        }
    }

    if let Some(registry) = registry.upgrade() {
        registry.remove_connection(&connection_id);
    }
    debug!("connection {connection_id} closed");
}
