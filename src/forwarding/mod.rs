//! Port Forwarding Module
//!
//! Provides SSH port forwarding capabilities:
//! - Local forwarding: Forward local port to remote host:port via SSH
//! - Remote forwarding: Forward remote port to local host:port via SSH
//! - Dynamic forwarding: SOCKS5 proxy through SSH tunnel

pub mod dynamic;
pub mod local;
pub mod manager;
pub mod remote;
pub mod tunnels;

pub use dynamic::{start_dynamic_forward, DynamicForwardHandle};
pub use local::{start_local_forward, LocalForwardHandle};
pub use manager::{
    ForwardCounters, ForwardId, ForwardStats, ForwardType, PortForwardDescriptor,
    PortForwardManager, Tunnel, TunnelFactory,
};
pub use remote::{
    handle_forwarded_connection, start_remote_forward, RemoteForwardHandle, RemoteForwardRegistry,
};
pub use tunnels::SshTunnels;
