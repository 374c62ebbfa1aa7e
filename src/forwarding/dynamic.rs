//! Dynamic SOCKS5 Proxy Forwarding
//!
//! Implements a local SOCKS5 proxy server that tunnels connections through SSH.
//! Example: Local SOCKS5 proxy on 127.0.0.1:1080 -> SSH tunnel -> any destination

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::local::{bind_listener, bridge_channel};
use super::manager::{ForwardCounters, ForwardStats, Tunnel};
use crate::ssh::{HandleController, SshError};

/// SOCKS5 protocol constants
mod socks5 {
    pub const VERSION: u8 = 0x05;
    pub const AUTH_NONE: u8 = 0x00;
    pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
    pub const CMD_CONNECT: u8 = 0x01;
    pub const ATYP_IPV4: u8 = 0x01;
    pub const ATYP_DOMAIN: u8 = 0x03;
    pub const ATYP_IPV6: u8 = 0x04;
    pub const REP_SUCCESS: u8 = 0x00;
    pub const REP_HOST_UNREACHABLE: u8 = 0x04;
    pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
    pub const REP_ADDR_NOT_SUPPORTED: u8 = 0x08;
}

/// Time a client gets to finish the SOCKS handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle to a running dynamic forward (SOCKS5 proxy)
pub struct DynamicForwardHandle {
    pub bound_addr: SocketAddr,
    cancel: CancellationToken,
    counters: Arc<ForwardCounters>,
}

#[async_trait]
impl Tunnel for DynamicForwardHandle {
    async fn close(&self) -> Result<(), SshError> {
        info!("Stopping SOCKS5 proxy on {}", self.bound_addr);
        self.cancel.cancel();
        Ok(())
    }

    fn stats(&self) -> ForwardStats {
        self.counters.to_stats()
    }
}

/// Start dynamic (SOCKS5) port forwarding on `bind_addr`
pub async fn start_dynamic_forward(
    controller: HandleController,
    bind_addr: &str,
) -> Result<DynamicForwardHandle, SshError> {
    let listener = bind_listener(bind_addr).await?;
    let bound_addr = listener
        .local_addr()
        .map_err(|e| SshError::ForwardError(format!("Failed to get bound address: {}", e)))?;

    info!("Started SOCKS5 proxy on {}", bound_addr);

    let cancel = CancellationToken::new();
    let counters = Arc::new(ForwardCounters::default());

    let task_cancel = cancel.clone();
    let task_counters = counters.clone();
    let mut disconnect_rx = controller.subscribe_disconnect();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = disconnect_rx.recv() => {
                    info!("SOCKS5 proxy on {} stopped: SSH disconnected", bound_addr);
                    break;
                }
                _ = task_cancel.cancelled() => {
                    debug!("SOCKS5 proxy on {} stopped by request", bound_addr);
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("Failed to set TCP_NODELAY: {}", e);
                            }
                            debug!("SOCKS5: Accepted connection from {}", peer_addr);
                            task_counters.connection_opened();

                            let controller = controller.clone();
                            let counters = task_counters.clone();
                            let cancel = task_cancel.clone();
                            tokio::spawn(async move {
                                tokio::select! {
                                    result = handle_socks5_connection(controller, stream, peer_addr, &counters) => {
                                        if let Err(e) = result {
                                            warn!("SOCKS5 connection error from {}: {}", peer_addr, e);
                                        }
                                    }
                                    _ = cancel.cancelled() => {}
                                }
                                counters.connection_closed();
                            });
                        }
                        Err(e) => {
                            error!("SOCKS5 accept error: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }
    });

    Ok(DynamicForwardHandle {
        bound_addr,
        cancel,
        counters,
    })
}

async fn handle_socks5_connection(
    controller: HandleController,
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    counters: &ForwardCounters,
) -> Result<(), SshError> {
    let (dest_host, dest_port) =
        tokio::time::timeout(HANDSHAKE_TIMEOUT, socks5_handshake(&mut stream))
            .await
            .map_err(|_| SshError::Timeout("SOCKS5 handshake".into()))??;

    debug!("SOCKS5: Connecting to {}:{}", dest_host, dest_port);

    let channel = match controller
        .open_direct_tcpip(
            &dest_host,
            dest_port as u32,
            &peer_addr.ip().to_string(),
            peer_addr.port() as u32,
        )
        .await
    {
        Ok(channel) => channel,
        Err(e) => {
            warn!("Failed to open SSH channel to {}:{}: {}", dest_host, dest_port, e);
            send_socks5_reply(&mut stream, socks5::REP_HOST_UNREACHABLE).await?;
            return Err(e);
        }
    };

    send_socks5_reply(&mut stream, socks5::REP_SUCCESS).await?;
    debug!("SOCKS5: Tunnel established to {}:{}", dest_host, dest_port);

    bridge_channel(stream, channel, counters).await;
    Ok(())
}

/// Negotiate NO AUTH and read a CONNECT request
///
/// Returns the requested destination. Unsupported commands and address types
/// are answered with the matching SOCKS5 reply before the error is returned.
async fn socks5_handshake<S>(stream: &mut S) -> Result<(String, u16), SshError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 258];

    stream
        .read_exact(&mut buf[..2])
        .await
        .map_err(|e| SshError::ForwardError(format!("Failed to read SOCKS5 greeting: {}", e)))?;

    let version = buf[0];
    let nmethods = buf[1] as usize;
    if version != socks5::VERSION {
        return Err(SshError::ForwardError(format!(
            "Unsupported SOCKS version: {}",
            version
        )));
    }

    stream
        .read_exact(&mut buf[..nmethods])
        .await
        .map_err(|e| SshError::ForwardError(format!("Failed to read auth methods: {}", e)))?;

    if !buf[..nmethods].contains(&socks5::AUTH_NONE) {
        stream
            .write_all(&[socks5::VERSION, socks5::AUTH_NO_ACCEPTABLE])
            .await
            .ok();
        return Err(SshError::ForwardError(
            "Client doesn't support NO AUTH method".into(),
        ));
    }

    stream
        .write_all(&[socks5::VERSION, socks5::AUTH_NONE])
        .await
        .map_err(|e| SshError::ForwardError(format!("Failed to send auth response: {}", e)))?;

    stream
        .read_exact(&mut buf[..4])
        .await
        .map_err(|e| SshError::ForwardError(format!("Failed to read SOCKS5 request: {}", e)))?;

    let version = buf[0];
    let cmd = buf[1];
    let atyp = buf[3];

    if version != socks5::VERSION {
        return Err(SshError::ForwardError(
            "Invalid SOCKS5 version in request".into(),
        ));
    }

    if cmd != socks5::CMD_CONNECT {
        send_socks5_reply(stream, socks5::REP_CMD_NOT_SUPPORTED).await?;
        return Err(SshError::ForwardError(format!(
            "Unsupported SOCKS5 command: {}",
            cmd
        )));
    }

    let destination = match atyp {
        socks5::ATYP_IPV4 => {
            stream.read_exact(&mut buf[..6]).await.map_err(|e| {
                SshError::ForwardError(format!("Failed to read IPv4 address: {}", e))
            })?;
            let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            (ip.to_string(), u16::from_be_bytes([buf[4], buf[5]]))
        }
        socks5::ATYP_DOMAIN => {
            stream.read_exact(&mut buf[..1]).await.map_err(|e| {
                SshError::ForwardError(format!("Failed to read domain length: {}", e))
            })?;
            let len = buf[0] as usize;
            stream
                .read_exact(&mut buf[..len + 2])
                .await
                .map_err(|e| SshError::ForwardError(format!("Failed to read domain: {}", e)))?;
            let domain = String::from_utf8_lossy(&buf[..len]).to_string();
            (domain, u16::from_be_bytes([buf[len], buf[len + 1]]))
        }
        socks5::ATYP_IPV6 => {
            stream.read_exact(&mut buf[..18]).await.map_err(|e| {
                SshError::ForwardError(format!("Failed to read IPv6 address: {}", e))
            })?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let ip = Ipv6Addr::from(octets);
            (ip.to_string(), u16::from_be_bytes([buf[16], buf[17]]))
        }
        _ => {
            send_socks5_reply(stream, socks5::REP_ADDR_NOT_SUPPORTED).await?;
            return Err(SshError::ForwardError(format!(
                "Unsupported address type: {}",
                atyp
            )));
        }
    };

    Ok(destination)
}

/// Send a SOCKS5 reply with an unspecified bound address
async fn send_socks5_reply<S>(stream: &mut S, status: u8) -> Result<(), SshError>
where
    S: AsyncWrite + Unpin,
{
    // VER | REP | RSV | ATYP | BND.ADDR | BND.PORT
    let reply = [
        socks5::VERSION,
        status,
        0x00,
        socks5::ATYP_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ];

    stream
        .write_all(&reply)
        .await
        .map_err(|e| SshError::ForwardError(format!("Failed to send SOCKS5 reply: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_handshake_domain_connect() {
        let (mut client, mut server) = duplex(256);
        let proxy = tokio::spawn(async move { socks5_handshake(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x03, 11];
        request.extend_from_slice(b"example.com");
        request.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let (host, port) = proxy.await.unwrap().unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 443);
    }

    #[tokio::test]
    async fn test_handshake_ipv4_and_ipv6() {
        let (mut client, mut server) = duplex(256);
        let proxy = tokio::spawn(async move { socks5_handshake(&mut server).await });
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 1, 0x00, 0x50])
            .await
            .unwrap();
        assert_eq!(proxy.await.unwrap().unwrap(), ("10.0.0.1".to_string(), 80));

        let (mut client, mut server) = duplex(256);
        let proxy = tokio::spawn(async move { socks5_handshake(&mut server).await });
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        client.read_exact(&mut method).await.unwrap();
        let mut request = vec![0x05, 0x01, 0x00, 0x04];
        request.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        request.extend_from_slice(&22u16.to_be_bytes());
        client.write_all(&request).await.unwrap();
        assert_eq!(proxy.await.unwrap().unwrap(), ("::1".to_string(), 22));
    }

    #[tokio::test]
    async fn test_handshake_rejects_auth_only_clients() {
        let (mut client, mut server) = duplex(256);
        let proxy = tokio::spawn(async move { socks5_handshake(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0xFF]);
        assert!(proxy.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_handshake_rejects_bind_command() {
        let (mut client, mut server) = duplex(256);
        let proxy = tokio::spawn(async move { socks5_handshake(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x07);
        assert!(proxy.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_handshake_rejects_socks4() {
        let (mut client, mut server) = duplex(256);
        let proxy = tokio::spawn(async move { socks5_handshake(&mut server).await });
        client.write_all(&[0x04, 0x01]).await.unwrap();
        assert!(proxy.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_proxy_close_stops_listener() {
        let (cmd_tx, _cmd_rx) = mpsc::channel(4);
        let controller = HandleController::new(cmd_tx);
        let handle = start_dynamic_forward(controller, "127.0.0.1:0").await.unwrap();
        assert!(TcpListener::bind(handle.bound_addr).await.is_err());

        handle.close().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while TcpListener::bind(handle.bound_addr).await.is_err() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}
