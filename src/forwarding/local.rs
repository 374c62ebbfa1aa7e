//! Local Port Forwarding
//!
//! Forwards connections from a local port to a remote host:port through SSH.
//! Example: Forward local:8888 -> remote_jupyter:8888

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::manager::{ForwardCounters, ForwardStats, Tunnel};
use crate::ssh::{HandleController, SshError};

/// Idle timeout for forwarded connections (5 minutes)
pub(crate) const FORWARD_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// How long `close()` waits for in-flight connections to drain
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Bind a local listener, turning common failures into readable errors
pub(crate) async fn bind_listener(addr: &str) -> Result<TcpListener, SshError> {
    TcpListener::bind(addr).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::AddrInUse => SshError::ForwardError(format!(
            "Port already in use: {}. Another application may be using this port.",
            addr
        )),
        std::io::ErrorKind::PermissionDenied => SshError::ForwardError(format!(
            "Permission denied binding to {}. Ports below 1024 require elevated privileges.",
            addr
        )),
        std::io::ErrorKind::AddrNotAvailable => SshError::ForwardError(format!(
            "Address not available: {}. The specified address is not valid on this system.",
            addr
        )),
        _ => SshError::ForwardError(format!("Failed to bind to {}: {}", addr, e)),
    })
}

/// Format `host:port`, bracketing bare IPv6 literals
pub(crate) fn listen_addr(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Pump bytes between a TCP stream and an SSH channel until either side ends
///
/// The channel is owned by this loop alone; no lock is held across awaits.
pub(crate) async fn bridge_channel(
    mut stream: TcpStream,
    mut channel: Channel<Msg>,
    counters: &ForwardCounters,
) {
    let mut buf = vec![0u8; 32768];
    let mut local_open = true;

    loop {
        tokio::select! {
            read = tokio::time::timeout(FORWARD_IDLE_TIMEOUT, stream.read(&mut buf)), if local_open => {
                match read {
                    Ok(Ok(0)) => {
                        local_open = false;
                        let _ = channel.eof().await;
                    }
                    Ok(Ok(n)) => {
                        if let Err(e) = channel.data(&buf[..n]).await {
                            debug!("Channel write error: {}", e);
                            break;
                        }
                        counters.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                    }
                    Ok(Err(e)) => {
                        debug!("Local read error: {}", e);
                        break;
                    }
                    Err(_) => {
                        debug!(
                            "Local read idle timeout ({}s), closing forward connection",
                            FORWARD_IDLE_TIMEOUT.as_secs()
                        );
                        break;
                    }
                }
            }
            msg = tokio::time::timeout(FORWARD_IDLE_TIMEOUT, channel.wait()) => {
                match msg {
                    Ok(Some(ChannelMsg::Data { data })) => {
                        if let Err(e) = stream.write_all(&data).await {
                            debug!("Local write error: {}", e);
                            break;
                        }
                        counters
                            .bytes_received
                            .fetch_add(data.len() as u64, Ordering::Relaxed);
                    }
                    Ok(Some(ChannelMsg::Eof)) | Ok(Some(ChannelMsg::Close)) | Ok(None) => {
                        debug!("Channel ended");
                        break;
                    }
                    Ok(Some(_)) => {}
                    Err(_) => {
                        debug!(
                            "Remote read idle timeout ({}s), closing forward connection",
                            FORWARD_IDLE_TIMEOUT.as_secs()
                        );
                        break;
                    }
                }
            }
        }
    }

    let _ = stream.shutdown().await;
    let _ = channel.close().await;
}

/// Handle to a running local port forward
pub struct LocalForwardHandle {
    /// Actual bound address (may differ from requested if port was 0)
    pub bound_addr: SocketAddr,
    cancel: CancellationToken,
    counters: Arc<ForwardCounters>,
}

#[async_trait]
impl Tunnel for LocalForwardHandle {
    /// Stop listening and wait briefly for active connections to close
    async fn close(&self) -> Result<(), SshError> {
        info!("Stopping local port forward on {}", self.bound_addr);
        self.cancel.cancel();

        let start = std::time::Instant::now();
        while self.counters.active() > 0 {
            if start.elapsed() > DRAIN_TIMEOUT {
                warn!(
                    "Timeout waiting for {} active connections to close on {}",
                    self.counters.active(),
                    self.bound_addr
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(())
    }

    fn stats(&self) -> ForwardStats {
        self.counters.to_stats()
    }
}

/// Start local port forwarding
///
/// Listens on `bind_addr`; each accepted connection gets its own
/// direct-tcpip channel to `remote_host:remote_port`. The listener stops on
/// `close()` or when the connection drops.
pub async fn start_local_forward(
    controller: HandleController,
    bind_addr: &str,
    remote_host: &str,
    remote_port: u16,
) -> Result<LocalForwardHandle, SshError> {
    let listener = bind_listener(bind_addr).await?;
    let bound_addr = listener
        .local_addr()
        .map_err(|e| SshError::ForwardError(format!("Failed to get bound address: {}", e)))?;

    info!(
        "Started local port forward: {} -> {}:{}",
        bound_addr, remote_host, remote_port
    );

    let cancel = CancellationToken::new();
    let counters = Arc::new(ForwardCounters::default());

    let task_cancel = cancel.clone();
    let task_counters = counters.clone();
    let remote_host = remote_host.to_string();
    let mut disconnect_rx = controller.subscribe_disconnect();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = disconnect_rx.recv() => {
                    info!("Local port forward on {} stopped: SSH disconnected", bound_addr);
                    break;
                }
                _ = task_cancel.cancelled() => {
                    debug!("Local port forward on {} stopped by request", bound_addr);
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("Failed to set TCP_NODELAY: {}", e);
                            }
                            debug!("Accepted connection from {} on {}", peer_addr, bound_addr);
                            task_counters.connection_opened();

                            let controller = controller.clone();
                            let remote_host = remote_host.clone();
                            let counters = task_counters.clone();
                            let cancel = task_cancel.clone();
                            tokio::spawn(async move {
                                let originator = peer_addr.ip().to_string();
                                match controller
                                    .open_direct_tcpip(
                                        &remote_host,
                                        remote_port as u32,
                                        &originator,
                                        peer_addr.port() as u32,
                                    )
                                    .await
                                {
                                    Ok(channel) => {
                                        tokio::select! {
                                            _ = bridge_channel(stream, channel, &counters) => {}
                                            _ = cancel.cancelled() => {}
                                        }
                                    }
                                    Err(e) => warn!("Forward connection error: {}", e),
                                }
                                counters.connection_closed();
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }
    });

    Ok(LocalForwardHandle {
        bound_addr,
        cancel,
        counters,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::HandleCommand;
    use tokio::sync::mpsc;

    #[test]
    fn test_listen_addr_brackets_ipv6() {
        assert_eq!(listen_addr("127.0.0.1", 8080), "127.0.0.1:8080");
        assert_eq!(listen_addr("::1", 8080), "[::1]:8080");
        assert_eq!(listen_addr("[::1]", 8080), "[::1]:8080");
    }

    #[tokio::test]
    async fn test_bind_port_in_use() {
        let first = bind_listener("127.0.0.1:0").await.unwrap();
        let addr = first.local_addr().unwrap().to_string();
        let err = bind_listener(&addr).await.err().unwrap();
        assert!(err.to_string().contains("Port already in use"));
    }

    #[tokio::test]
    async fn test_close_stops_listener() {
        let (cmd_tx, _cmd_rx) = mpsc::channel(4);
        let controller = HandleController::new(cmd_tx);
        let handle = start_local_forward(controller, "127.0.0.1:0", "localhost", 80)
            .await
            .unwrap();
        assert_ne!(handle.bound_addr.port(), 0);
        assert!(TcpListener::bind(handle.bound_addr).await.is_err());

        handle.close().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while TcpListener::bind(handle.bound_addr).await.is_err() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(handle.stats(), ForwardStats::default());
    }

    #[tokio::test]
    async fn test_disconnect_stops_listener() {
        let (cmd_tx, _cmd_rx) = mpsc::channel(4);
        let controller = HandleController::new(cmd_tx);
        let handle = start_local_forward(controller.clone(), "127.0.0.1:0", "localhost", 80)
            .await
            .unwrap();

        controller.notify_disconnect();
        tokio::time::timeout(Duration::from_secs(2), async {
            while TcpListener::bind(handle.bound_addr).await.is_err() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_stats_count_accepted_connections() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(4);
        let controller = HandleController::new(cmd_tx);
        let handle = start_local_forward(controller, "127.0.0.1:0", "db.internal", 5432)
            .await
            .unwrap();

        let _client = TcpStream::connect(handle.bound_addr).await.unwrap();
        match cmd_rx.recv().await {
            Some(HandleCommand::ChannelOpenDirectTcpip {
                host,
                port,
                reply_tx,
                ..
            }) => {
                assert_eq!((host.as_str(), port), ("db.internal", 5432));
                drop(reply_tx);
            }
            _ => panic!("expected a direct-tcpip request"),
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while handle.stats().active_connections > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(handle.stats().connection_count, 1);
        handle.close().await.unwrap();
    }
}
