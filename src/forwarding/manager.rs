//! Port Forwarding Manager
//!
//! Tracks the forwards configured for one connection and turns them on and
//! off. Every mutation (add, remove, enable, disable, shutdown) runs under a
//! single async mutex, held across tunnel creation and teardown, so two
//! callers can never race to open or close the same tunnel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ssh::SshError;

/// Forward statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardStats {
    /// Total connection count
    pub connection_count: u64,
    /// Currently active connections
    pub active_connections: u64,
    /// Total bytes sent (towards the far side)
    pub bytes_sent: u64,
    /// Total bytes received (from the far side)
    pub bytes_received: u64,
}

/// Lock-free counters updated from connection tasks
#[derive(Debug, Default)]
pub struct ForwardCounters {
    pub connection_count: AtomicU64,
    pub active_connections: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
}

impl ForwardCounters {
    pub fn connection_opened(&self) {
        self.connection_count.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn active(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn to_stats(&self) -> ForwardStats {
        ForwardStats {
            connection_count: self.connection_count.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Type of port forward
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardType {
    /// Local port forwarding (-L)
    Local,
    /// Remote port forwarding (-R)
    Remote,
    /// Dynamic SOCKS proxy (-D)
    Dynamic,
    /// A type tag this client cannot run
    Unsupported(String),
}

impl ForwardType {
    /// Parse a stored type tag
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "local" => ForwardType::Local,
            "remote" => ForwardType::Remote,
            "dynamic5" | "dynamic" => ForwardType::Dynamic,
            other => ForwardType::Unsupported(other.to_string()),
        }
    }

    pub fn tag(&self) -> &str {
        match self {
            ForwardType::Local => "local",
            ForwardType::Remote => "remote",
            ForwardType::Dynamic => "dynamic5",
            ForwardType::Unsupported(tag) => tag,
        }
    }
}

/// Identity of a tracked forward
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForwardId(String);

impl ForwardId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ForwardId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ForwardId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for ForwardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A configured forward
///
/// `source_port` is the local listen port for local and dynamic forwards and
/// the server-side port for remote forwards. `enabled` is filled in by
/// [`PortForwardManager::list`]; it is ignored on input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortForwardDescriptor {
    #[serde(default)]
    pub id: ForwardId,
    pub forward_type: ForwardType,
    pub source_port: u16,
    #[serde(default)]
    pub dest_addr: String,
    #[serde(default)]
    pub dest_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default)]
    pub enabled: bool,
}

impl PortForwardDescriptor {
    pub fn local(source_port: u16, dest_addr: impl Into<String>, dest_port: u16) -> Self {
        Self::new(ForwardType::Local, source_port, dest_addr.into(), dest_port)
    }

    pub fn remote(source_port: u16, dest_addr: impl Into<String>, dest_port: u16) -> Self {
        Self::new(ForwardType::Remote, source_port, dest_addr.into(), dest_port)
    }

    pub fn dynamic(source_port: u16) -> Self {
        Self::new(ForwardType::Dynamic, source_port, String::new(), 0)
    }

    pub fn new(forward_type: ForwardType, source_port: u16, dest_addr: String, dest_port: u16) -> Self {
        Self {
            id: ForwardId::new(),
            forward_type,
            source_port,
            dest_addr,
            dest_port,
            nickname: None,
            enabled: false,
        }
    }

    pub fn with_nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = Some(nickname.into());
        self
    }

    /// Human-readable description
    pub fn label(&self) -> String {
        if let Some(nickname) = &self.nickname {
            return nickname.clone();
        }
        match &self.forward_type {
            ForwardType::Local => format!(
                "Local: {} -> {}:{}",
                self.source_port, self.dest_addr, self.dest_port
            ),
            ForwardType::Remote => format!(
                "Remote: {} -> {}:{}",
                self.source_port, self.dest_addr, self.dest_port
            ),
            ForwardType::Dynamic => format!("Dynamic (SOCKS): {}", self.source_port),
            ForwardType::Unsupported(tag) => format!("Unsupported ({}): {}", tag, self.source_port),
        }
    }
}

/// A running tunnel
#[async_trait]
pub trait Tunnel: Send + Sync {
    /// Stop accepting and cancel server-side state; best effort
    async fn close(&self) -> Result<(), SshError>;

    fn stats(&self) -> ForwardStats {
        ForwardStats::default()
    }
}

/// Creates tunnels over an authenticated connection
#[async_trait]
pub trait TunnelFactory: Send + Sync {
    async fn open_local(&self, forward: &PortForwardDescriptor) -> Result<Box<dyn Tunnel>, SshError>;

    async fn open_remote(&self, forward: &PortForwardDescriptor)
        -> Result<Box<dyn Tunnel>, SshError>;

    async fn open_dynamic(
        &self,
        forward: &PortForwardDescriptor,
    ) -> Result<Box<dyn Tunnel>, SshError>;
}

/// Internal tracking: `tunnel.is_some()` is exactly "enabled"
struct ForwardEntry {
    descriptor: PortForwardDescriptor,
    tunnel: Option<Box<dyn Tunnel>>,
}

impl ForwardEntry {
    fn snapshot(&self) -> PortForwardDescriptor {
        let mut descriptor = self.descriptor.clone();
        descriptor.enabled = self.tunnel.is_some();
        descriptor
    }

    /// The source port identifies a forward within one connection
    fn conflicts_with(&self, other: &PortForwardDescriptor) -> bool {
        self.descriptor.source_port == other.source_port
    }
}

/// Port forwarding manager for one connection
#[derive(Default)]
pub struct PortForwardManager {
    forwards: Mutex<Vec<ForwardEntry>>,
    /// Present only while the connection is authenticated
    factory: RwLock<Option<Arc<dyn TunnelFactory>>>,
}

impl PortForwardManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow tunnels to be created from now on
    pub fn attach(&self, factory: Arc<dyn TunnelFactory>) {
        *self.factory.write() = Some(factory);
    }

    pub fn is_attached(&self) -> bool {
        self.factory.read().is_some()
    }

    /// Track a forward; returns the id it is tracked under
    ///
    /// Adding the same id twice, or any second forward on the same source
    /// port, keeps the existing entry.
    pub async fn add(&self, mut descriptor: PortForwardDescriptor) -> ForwardId {
        let mut forwards = self.forwards.lock().await;
        if let Some(existing) = forwards
            .iter()
            .find(|e| e.descriptor.id == descriptor.id || e.conflicts_with(&descriptor))
        {
            debug!(
                "Forward {} already tracked as {}",
                descriptor.label(),
                existing.descriptor.id
            );
            return existing.descriptor.id.clone();
        }

        descriptor.enabled = false;
        let id = descriptor.id.clone();
        info!("Tracking port forward {} ({})", descriptor.label(), id);
        forwards.push(ForwardEntry {
            descriptor,
            tunnel: None,
        });
        id
    }

    /// Disable (if needed) and forget a forward; false if it was not tracked
    pub async fn remove(&self, id: &ForwardId) -> bool {
        let mut forwards = self.forwards.lock().await;
        let Some(index) = forwards.iter().position(|e| &e.descriptor.id == id) else {
            return false;
        };

        let mut entry = forwards.remove(index);
        if let Some(tunnel) = entry.tunnel.take() {
            if let Err(e) = tunnel.close().await {
                warn!("Failed to close {} while removing: {}", entry.descriptor.label(), e);
            }
        }
        info!("Removed port forward {}", entry.descriptor.label());
        true
    }

    /// Start the tunnel for a tracked forward
    ///
    /// False when the forward is unknown, already enabled, of an unsupported
    /// type, the connection is not authenticated, or creation fails. A failed
    /// attempt leaves the forward disabled.
    pub async fn enable(&self, id: &ForwardId) -> bool {
        let mut forwards = self.forwards.lock().await;
        let Some(entry) = forwards.iter_mut().find(|e| &e.descriptor.id == id) else {
            error!("Attempt to enable untracked port forward {}", id);
            return false;
        };
        self.enable_entry(entry).await
    }

    async fn enable_entry(&self, entry: &mut ForwardEntry) -> bool {
        if entry.tunnel.is_some() {
            debug!("Port forward {} is already enabled", entry.descriptor.label());
            return false;
        }

        let Some(factory) = self.factory.read().clone() else {
            warn!(
                "Cannot enable {}: connection is not authenticated",
                entry.descriptor.label()
            );
            return false;
        };

        let descriptor = &entry.descriptor;
        let result = match &descriptor.forward_type {
            ForwardType::Local => factory.open_local(descriptor).await,
            ForwardType::Remote => factory.open_remote(descriptor).await,
            ForwardType::Dynamic => factory.open_dynamic(descriptor).await,
            ForwardType::Unsupported(tag) => {
                error!("Attempt to forward unknown type {}", tag);
                return false;
            }
        };

        match result {
            Ok(tunnel) => {
                info!("Enabled port forward {}", descriptor.label());
                entry.tunnel = Some(tunnel);
                true
            }
            Err(e) => {
                warn!("Failed to enable {}: {}", descriptor.label(), e);
                false
            }
        }
    }

    /// Stop a forward's tunnel
    ///
    /// False when the forward is unknown or not enabled. The forward is
    /// marked disabled before the tunnel is closed; a close error still
    /// returns false but the forward stays disabled.
    pub async fn disable(&self, id: &ForwardId) -> bool {
        let mut forwards = self.forwards.lock().await;
        let Some(entry) = forwards.iter_mut().find(|e| &e.descriptor.id == id) else {
            error!("Attempt to disable untracked port forward {}", id);
            return false;
        };

        let Some(tunnel) = entry.tunnel.take() else {
            debug!(
                "Could not disable {}; it appears to be not enabled or have no handler",
                entry.descriptor.label()
            );
            return false;
        };

        match tunnel.close().await {
            Ok(()) => {
                info!("Disabled port forward {}", entry.descriptor.label());
                true
            }
            Err(e) => {
                warn!("Error closing {}: {}", entry.descriptor.label(), e);
                false
            }
        }
    }

    /// Enable every tracked forward that is not yet running
    ///
    /// Returns the descriptors that were enabled by this call.
    pub async fn enable_all(&self) -> Vec<PortForwardDescriptor> {
        let mut forwards = self.forwards.lock().await;
        let mut enabled = Vec::new();
        for entry in forwards.iter_mut() {
            if entry.tunnel.is_none() && self.enable_entry(entry).await {
                enabled.push(entry.snapshot());
            }
        }
        enabled
    }

    /// Snapshot of every tracked forward
    pub async fn list(&self) -> Vec<PortForwardDescriptor> {
        self.forwards
            .lock()
            .await
            .iter()
            .map(ForwardEntry::snapshot)
            .collect()
    }

    pub async fn stats(&self, id: &ForwardId) -> Option<ForwardStats> {
        let forwards = self.forwards.lock().await;
        let entry = forwards.iter().find(|e| &e.descriptor.id == id)?;
        entry.tunnel.as_ref().map(|t| t.stats())
    }

    /// Close every tunnel and refuse new ones (local shutdown)
    pub async fn shutdown(&self) {
        self.factory.write().take();
        let mut forwards = self.forwards.lock().await;
        for entry in forwards.iter_mut() {
            if let Some(tunnel) = entry.tunnel.take() {
                if let Err(e) = tunnel.close().await {
                    debug!("Error closing {} on shutdown: {}", entry.descriptor.label(), e);
                }
            }
        }
    }

    /// Drop every tunnel without talking to the server (connection lost)
    pub async fn suspend(&self) {
        self.factory.write().take();
        let mut forwards = self.forwards.lock().await;
        let mut dropped = 0;
        for entry in forwards.iter_mut() {
            if entry.tunnel.take().is_some() {
                dropped += 1;
            }
        }
        if dropped > 0 {
            info!("Connection lost, {} port forwards marked disabled", dropped);
        }
    }
}
