//! Tunnel factory backed by a live SSH connection

use std::sync::Arc;

use async_trait::async_trait;

use super::dynamic::start_dynamic_forward;
use super::local::{listen_addr, start_local_forward};
use super::manager::{PortForwardDescriptor, Tunnel, TunnelFactory};
use super::remote::{start_remote_forward, RemoteForwardRegistry};
use crate::ssh::{HandleController, SshError};

/// Opens local, remote and dynamic tunnels through one authenticated connection
pub struct SshTunnels {
    controller: HandleController,
    registry: Arc<RemoteForwardRegistry>,
    /// Local interface for local and dynamic listeners
    bind_address: String,
    /// Server-side bind address for remote forwards
    remote_bind_address: String,
}

impl SshTunnels {
    pub fn new(
        controller: HandleController,
        registry: Arc<RemoteForwardRegistry>,
        bind_address: impl Into<String>,
        remote_bind_address: impl Into<String>,
    ) -> Self {
        Self {
            controller,
            registry,
            bind_address: bind_address.into(),
            remote_bind_address: remote_bind_address.into(),
        }
    }
}

#[async_trait]
impl TunnelFactory for SshTunnels {
    async fn open_local(&self, forward: &PortForwardDescriptor) -> Result<Box<dyn Tunnel>, SshError> {
        let handle = start_local_forward(
            self.controller.clone(),
            &listen_addr(&self.bind_address, forward.source_port),
            &forward.dest_addr,
            forward.dest_port,
        )
        .await?;
        Ok(Box::new(handle))
    }

    async fn open_remote(
        &self,
        forward: &PortForwardDescriptor,
    ) -> Result<Box<dyn Tunnel>, SshError> {
        let handle = start_remote_forward(
            self.controller.clone(),
            self.registry.clone(),
            &self.remote_bind_address,
            forward.source_port,
            &forward.dest_addr,
            forward.dest_port,
        )
        .await?;
        Ok(Box::new(handle))
    }

    async fn open_dynamic(
        &self,
        forward: &PortForwardDescriptor,
    ) -> Result<Box<dyn Tunnel>, SshError> {
        let handle = start_dynamic_forward(
            self.controller.clone(),
            &listen_addr(&self.bind_address, forward.source_port),
        )
        .await?;
        Ok(Box::new(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarding::PortForwardManager;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_manager_runs_real_local_listener() {
        let (cmd_tx, _cmd_rx) = mpsc::channel(4);
        let controller = HandleController::new(cmd_tx);
        let tunnels = SshTunnels::new(
            controller,
            Arc::new(RemoteForwardRegistry::new()),
            "127.0.0.1",
            "localhost",
        );

        let occupied = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let busy_port = occupied.local_addr().unwrap().port();

        let manager = PortForwardManager::new();
        manager.attach(Arc::new(tunnels));

        let free = manager
            .add(PortForwardDescriptor::dynamic(0).with_nickname("socks"))
            .await;
        let busy = manager
            .add(PortForwardDescriptor::local(busy_port, "localhost", 80))
            .await;

        assert!(manager.enable(&free).await);
        assert!(!manager.enable(&busy).await);
        assert!(manager.disable(&free).await);
    }
}
