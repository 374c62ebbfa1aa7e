//! Authenticated connection owner
//!
//! Once authentication succeeds the `Handle<ClientHandler>` moves into a
//! single task. The session channel, tunnels and `close()` all talk to it
//! through a cloneable [`HandleController`], so nothing holds a lock on the
//! handle across an `.await`.
//!
//! ```ignore
//! let controller = spawn_handle_owner_task(handle, "bob@example.com".into());
//! let channel = controller.open_session_channel().await?;
//! let bound_port = controller.tcpip_forward("localhost", 8080).await?;
//! ```

use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// How often the owner checks whether the transport died underneath it
const LIVENESS_INTERVAL: Duration = Duration::from_secs(1);

/// Commands sent to the handle owner task
pub enum HandleCommand {
    /// Open a session channel (for PTY/shell)
    ChannelOpenSession {
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Open a direct-tcpip channel (local and dynamic forwards)
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Request a remote forward (tcpip-forward)
    TcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<u32, russh::Error>>,
    },

    /// Cancel a remote forward
    CancelTcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<(), russh::Error>>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Cloneable front end of the handle owner task
///
/// Every clone has full control of the connection; keep it in-process.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    /// Fires once when the owner task stops
    disconnect_tx: broadcast::Sender<()>,
}

impl HandleController {
    /// Controller over a raw command channel (tests drive the other end)
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        let (disconnect_tx, _) = broadcast::channel(1);
        Self {
            cmd_tx,
            disconnect_tx,
        }
    }

    /// Receiver that yields `()` when the connection is gone
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    /// Open a session channel (for PTY/shell)
    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenSession { reply_tx })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Open a direct-tcpip channel to `host:port` on the remote side
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Request a remote forward
    ///
    /// Returns the port the server actually bound (differs when 0 was requested).
    pub async fn tcpip_forward(&self, address: &str, port: u32) -> Result<u32, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::TcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ForwardError(e.to_string()))
    }

    /// Cancel a remote forward
    pub async fn cancel_tcpip_forward(&self, address: &str, port: u32) -> Result<(), SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::CancelTcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ForwardError(e.to_string()))
    }

    /// Ask the owner task to disconnect; no-op if it already stopped
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Whether the owner task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }

    #[cfg(test)]
    pub(crate) fn notify_disconnect(&self) {
        let _ = self.disconnect_tx.send(());
    }
}

/// Move `handle` into its owner task and return the controller
pub fn spawn_handle_owner_task(handle: Handle<ClientHandler>, label: String) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);
    let disconnect_tx_clone = disconnect_tx.clone();

    tokio::spawn(async move {
        let mut handle = handle;
        let mut liveness = tokio::time::interval(LIVENESS_INTERVAL);

        info!("Handle owner task started for {}", label);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        info!("All controllers dropped for {}", label);
                        break;
                    };
                    if !run_command(&mut handle, cmd, &label).await {
                        info!("Disconnect requested for {}", label);
                        break;
                    }
                }
                _ = liveness.tick() => {
                    if handle.is_closed() {
                        info!("Connection to {} closed by transport", label);
                        break;
                    }
                }
            }
        }

        // close first: a late subscriber then sees is_connected() == false
        drain_pending_commands(&mut cmd_rx);
        let _ = disconnect_tx_clone.send(());

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        info!("Handle owner task terminated for {}", label);
    });

    HandleController {
        cmd_tx,
        disconnect_tx,
    }
}

/// Execute one command; false means stop the owner loop
async fn run_command(handle: &mut Handle<ClientHandler>, cmd: HandleCommand, label: &str) -> bool {
    match cmd {
        HandleCommand::ChannelOpenSession { reply_tx } => {
            let result = handle.channel_open_session().await;
            if reply_tx.send(result).is_err() {
                warn!("Caller dropped before receiving channel_open_session result");
            }
        }

        HandleCommand::ChannelOpenDirectTcpip {
            host,
            port,
            originator_host,
            originator_port,
            reply_tx,
        } => {
            let result = handle
                .channel_open_direct_tcpip(&host, port, &originator_host, originator_port)
                .await;
            if reply_tx.send(result).is_err() {
                warn!("Caller dropped before receiving direct_tcpip result");
            }
        }

        HandleCommand::TcpipForward {
            address,
            port,
            reply_tx,
        } => {
            let result = handle.tcpip_forward(&address, port).await;
            match result {
                Ok(bound_port) => {
                    if reply_tx.send(Ok(bound_port)).is_err() {
                        // forward exists on the server but nobody tracks it
                        warn!(
                            "Caller dropped after tcpip_forward succeeded on {}. \
                             Cancelling orphaned forward {}:{}",
                            label, address, bound_port
                        );
                        let _ = handle.cancel_tcpip_forward(&address, bound_port).await;
                    }
                }
                Err(e) => {
                    let _ = reply_tx.send(Err(e));
                }
            }
        }

        HandleCommand::CancelTcpipForward {
            address,
            port,
            reply_tx,
        } => {
            let result = handle.cancel_tcpip_forward(&address, port).await;
            if reply_tx.send(result).is_err() {
                debug!("Caller dropped before receiving cancel_tcpip_forward result");
            }
        }

        HandleCommand::Disconnect => return false,
    }
    true
}

/// Answer every queued command with a disconnect error
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenSession { reply_tx } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::TcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::CancelTcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Disconnect => {}
        }
    }
}
