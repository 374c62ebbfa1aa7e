//! Remote Port Forwarding
//!
//! Forwards connections from a remote port back to a local host:port through SSH.
//! Example: Remote server:9000 -> local:3000 (expose local service to remote)
//!
//! ## Architecture
//!
//! Remote forwarding requires coordination between:
//! 1. The SSH client (sends `tcpip-forward` request via HandleController)
//! 2. The SSH server (listens on remote port)
//! 3. The ClientHandler callback (handles incoming `forwarded-tcpip` channels)
//!
//! Each connection owns a [`RemoteForwardRegistry`] mapping the bound server
//! port to its local target; the ClientHandler looks targets up there.
//! Servers do not always echo back the bind address we asked for, so only
//! the port is used as the key.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use russh::client::Msg;
use russh::Channel;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::local::{bridge_channel, listen_addr};
use super::manager::{ForwardCounters, ForwardStats, Tunnel};
use crate::ssh::{HandleController, SshError};

/// Where connections arriving on a bound server port are sent
#[derive(Debug, Clone)]
pub struct RemoteForwardTarget {
    pub local_host: String,
    pub local_port: u16,
    pub counters: Arc<ForwardCounters>,
}

/// Bound server port -> local target, for one connection
#[derive(Debug, Default)]
pub struct RemoteForwardRegistry {
    forwards: RwLock<HashMap<u32, RemoteForwardTarget>>,
}

impl RemoteForwardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        bound_port: u32,
        local_host: String,
        local_port: u16,
    ) -> Arc<ForwardCounters> {
        let counters = Arc::new(ForwardCounters::default());
        self.forwards.write().insert(
            bound_port,
            RemoteForwardTarget {
                local_host,
                local_port,
                counters: counters.clone(),
            },
        );
        debug!("Registered remote forward on server port {}", bound_port);
        counters
    }

    pub fn unregister(&self, bound_port: u32) {
        if self.forwards.write().remove(&bound_port).is_some() {
            debug!("Unregistered remote forward on server port {}", bound_port);
        }
    }

    pub fn lookup(&self, bound_port: u32) -> Option<RemoteForwardTarget> {
        self.forwards.read().get(&bound_port).cloned()
    }
}

/// Handle to a running remote port forward
pub struct RemoteForwardHandle {
    pub remote_addr: String,
    /// Actual bound port on the server (differs when 0 was requested)
    pub bound_port: u32,
    running: Arc<AtomicBool>,
    controller: HandleController,
    registry: Arc<RemoteForwardRegistry>,
    counters: Arc<ForwardCounters>,
}

#[async_trait]
impl Tunnel for RemoteForwardHandle {
    /// Cancel the server-side listener and forget the target
    async fn close(&self) -> Result<(), SshError> {
        info!(
            "Stopping remote port forward {}:{}",
            self.remote_addr, self.bound_port
        );
        self.running.store(false, Ordering::SeqCst);
        self.registry.unregister(self.bound_port);
        self.controller
            .cancel_tcpip_forward(&self.remote_addr, self.bound_port)
            .await
    }

    fn stats(&self) -> ForwardStats {
        self.counters.to_stats()
    }
}

/// Start remote port forwarding
///
/// Asks the server to listen on `remote_addr:remote_port` and registers the
/// local target. Bridging happens in the ClientHandler callback when the
/// server opens a forwarded-tcpip channel.
pub async fn start_remote_forward(
    controller: HandleController,
    registry: Arc<RemoteForwardRegistry>,
    remote_addr: &str,
    remote_port: u16,
    local_host: &str,
    local_port: u16,
) -> Result<RemoteForwardHandle, SshError> {
    info!(
        "Requesting remote port forward: {}:{} -> {}:{}",
        remote_addr, remote_port, local_host, local_port
    );

    let requested = remote_port as u32;
    let reply = controller.tcpip_forward(remote_addr, requested).await?;
    // servers answer 0 when the requested port was non-zero
    let bound_port = if requested == 0 { reply } else { requested };

    info!(
        "Remote forward established: {}:{} (requested {}) -> {}:{}",
        remote_addr, bound_port, remote_port, local_host, local_port
    );

    let counters = registry.register(bound_port, local_host.to_string(), local_port);
    let running = Arc::new(AtomicBool::new(true));

    let mut disconnect_rx = controller.subscribe_disconnect();
    let task_running = running.clone();
    let task_registry = registry.clone();
    tokio::spawn(async move {
        let _ = disconnect_rx.recv().await;
        if task_running.swap(false, Ordering::SeqCst) {
            info!("Remote port forward {} stopped: SSH disconnected", bound_port);
            task_registry.unregister(bound_port);
        }
    });

    Ok(RemoteForwardHandle {
        remote_addr: remote_addr.to_string(),
        bound_port,
        running,
        controller,
        registry,
        counters,
    })
}

/// Bridge one server-initiated forwarded-tcpip channel to its local target
pub async fn handle_forwarded_connection(
    registry: Arc<RemoteForwardRegistry>,
    channel: Channel<Msg>,
    connected_address: &str,
    connected_port: u32,
    originator_address: &str,
    originator_port: u32,
) -> Result<(), SshError> {
    debug!(
        "Handling forwarded connection: {}:{} from {}:{}",
        connected_address, connected_port, originator_address, originator_port
    );

    let Some(target) = registry.lookup(connected_port) else {
        let _ = channel.close().await;
        return Err(SshError::ForwardError(format!(
            "No registered forward for {}:{}",
            connected_address, connected_port
        )));
    };

    let counters = target.counters;
    counters.connection_opened();

    let local_addr = listen_addr(&target.local_host, target.local_port);
    let connected = tokio::time::timeout(Duration::from_secs(10), TcpStream::connect(&local_addr))
        .await
        .map_err(|_| SshError::Timeout(format!("Connecting to {}", local_addr)))
        .and_then(|r| {
            r.map_err(|e| SshError::ForwardError(format!("Failed to connect to {}: {}", local_addr, e)))
        });

    let stream = match connected {
        Ok(stream) => stream,
        Err(e) => {
            counters.connection_closed();
            let _ = channel.close().await;
            return Err(e);
        }
    };

    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }

    info!(
        "Bridging forwarded connection {}:{} -> {}",
        connected_address, connected_port, local_addr
    );
    bridge_channel(stream, channel, &counters).await;
    counters.connection_closed();
    Ok(())
}
