//! Shellbridge - client-side SSH session orchestration
//!
//! Negotiates authentication against a remote host, makes trust decisions about
//! its host key, manages local/remote/dynamic tunnels over the connection and
//! exposes the interactive PTY as a single read/write surface.

pub mod forwarding;
pub mod ssh;

#[cfg(test)]
pub(crate) mod testing;

pub use ssh::{Collaborators, HostDescriptor, SshError, SshTransport, TransportOptions};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging
///
/// Reads the filter from `RUST_LOG` (default `info`). Safe to call more than once.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
