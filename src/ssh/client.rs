//! SSH Client implementation using russh

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use russh::client::{self, AuthResult, Handle, KeyboardInteractiveAuthResponse};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PublicKey, PublicKeyBase64};
use russh::Channel;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::auth::{AuthAttempt, AuthTransport, KbiStep, MethodSet};
use super::config::TransportOptions;
use super::credentials::UnlockedKey;
use super::error::SshError;
use super::keyboard_interactive::{KbiPrompt, KbiRequest};
use super::trust::{algorithm_display_name, TrustVerifier};
use crate::forwarding::{handle_forwarded_connection, RemoteForwardRegistry};

/// What the transport agreed on during the handshake
///
/// russh only surfaces the host key to the handler, so cipher/MAC pairs stay
/// `None` unless a transport fills them in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NegotiatedAlgorithms {
    pub host_key: Option<String>,
    /// (cipher, mac)
    pub client_to_server: Option<(String, String)>,
    pub server_to_client: Option<(String, String)>,
}

impl NegotiatedAlgorithms {
    /// Lines narrated to the user after the handshake
    pub fn report_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        match (&self.client_to_server, &self.server_to_client) {
            (Some(c2s), Some(s2c)) if c2s == s2c => {
                lines.push(format!("Using algorithm: {} {}", c2s.0, c2s.1));
            }
            (c2s, s2c) => {
                if let Some((cipher, mac)) = c2s {
                    lines.push(format!("Client-to-server algorithm: {} {}", cipher, mac));
                }
                if let Some((cipher, mac)) = s2c {
                    lines.push(format!("Server-to-client algorithm: {} {}", cipher, mac));
                }
            }
        }
        if let Some(host_key) = &self.host_key {
            lines.push(format!(
                "Host key algorithm: {}",
                algorithm_display_name(host_key)
            ));
        }
        lines
    }
}

/// Client handler for russh callbacks
///
/// This handler processes server-initiated events, including:
/// - Host key verification through the [`TrustVerifier`]
/// - Remote port forwarding (forwarded-tcpip channels)
pub struct ClientHandler {
    host: String,
    port: u16,
    verifier: Arc<TrustVerifier>,
    algorithms: Arc<Mutex<NegotiatedAlgorithms>>,
    remote_forwards: Arc<RemoteForwardRegistry>,
}

impl ClientHandler {
    pub fn new(
        host: String,
        port: u16,
        verifier: Arc<TrustVerifier>,
        algorithms: Arc<Mutex<NegotiatedAlgorithms>>,
        remote_forwards: Arc<RemoteForwardRegistry>,
    ) -> Self {
        Self {
            host,
            port,
            verifier,
            algorithms,
            remote_forwards,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let algorithm = server_public_key.algorithm().as_str().to_string();
        self.algorithms.lock().host_key = Some(algorithm.clone());

        let accepted = self
            .verifier
            .verify(
                &self.host,
                self.port,
                &algorithm,
                &server_public_key.public_key_bytes(),
            )
            .await;

        if accepted {
            info!("Host key accepted for {}:{}", self.host, self.port);
        } else {
            warn!("Host key rejected for {}:{}", self.host, self.port);
        }
        Ok(accepted)
    }

    /// Called when the server opens a channel for a new remote port forwarding connection.
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        info!(
            "Server opened forwarded-tcpip channel: {}:{} from {}:{}",
            connected_address, connected_port, originator_address, originator_port
        );

        let registry = self.remote_forwards.clone();
        let connected_address = connected_address.to_string();
        let originator_address = originator_address.to_string();

        // must not block the SSH event loop
        tokio::spawn(async move {
            if let Err(e) = handle_forwarded_connection(
                registry,
                channel,
                &connected_address,
                connected_port,
                &originator_address,
                originator_port,
            )
            .await
            {
                warn!(
                    "Failed to handle forwarded connection {}:{}: {}",
                    connected_address, connected_port, e
                );
            }
        });

        Ok(())
    }
}

/// Open the TCP connection and run the SSH handshake
///
/// Only the TCP connect is bounded by `connect_timeout_secs`. The handshake
/// includes host key verification through `handler`, which may wait on the
/// user; the caller cancels it by dropping the future.
pub async fn connect(
    host: &str,
    port: u16,
    options: &TransportOptions,
    handler: ClientHandler,
) -> Result<Handle<ClientHandler>, SshError> {
    info!("Connecting to SSH server at {}:{}", host, port);

    let stream = tokio::time::timeout(options.connect_timeout(), TcpStream::connect((host, port)))
        .await
        .map_err(|_| SshError::Timeout("Connection timed out".to_string()))?
        .map_err(|e| SshError::ConnectionFailed(format!("{}:{}: {}", host, port, e)))?;
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }
    debug!("TCP connected to {}:{}", host, port);

    let config = client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(options.keepalive_interval_secs)),
        keepalive_max: options.keepalive_max,
        ..Default::default()
    };

    let handle = client::connect_stream(Arc::new(config), stream, handler)
        .await
        .map_err(|e| match e {
            SshError::Disconnected => {
                SshError::ConnectionFailed("Connection closed during handshake".to_string())
            }
            other => other,
        })?;

    debug!("SSH handshake completed");
    Ok(handle)
}

fn method_set(remaining: &russh::MethodSet) -> MethodSet {
    MethodSet::from_names(remaining.iter().map(|m| {
        let name: &str = m.into();
        name
    }))
}

fn auth_attempt(result: AuthResult) -> AuthAttempt {
    match result {
        AuthResult::Success => AuthAttempt::Success,
        AuthResult::Failure {
            remaining_methods, ..
        } => AuthAttempt::Failure {
            methods: method_set(&remaining_methods),
        },
    }
}

fn kbi_step(response: KeyboardInteractiveAuthResponse) -> KbiStep {
    match response {
        KeyboardInteractiveAuthResponse::Success => KbiStep::Success,
        KeyboardInteractiveAuthResponse::Failure {
            remaining_methods, ..
        } => KbiStep::Failure {
            methods: method_set(&remaining_methods),
        },
        KeyboardInteractiveAuthResponse::InfoRequest {
            name,
            instructions,
            prompts,
        } => KbiStep::InfoRequest(KbiRequest {
            name,
            instructions,
            prompts: prompts
                .into_iter()
                .map(|p| KbiPrompt {
                    prompt: p.prompt,
                    echo: p.echo,
                })
                .collect(),
        }),
    }
}

#[async_trait]
impl AuthTransport for Handle<ClientHandler> {
    async fn authenticate_none(&mut self, user: &str) -> Result<AuthAttempt, SshError> {
        Ok(auth_attempt(Handle::authenticate_none(self, user).await?))
    }

    async fn authenticate_publickey(
        &mut self,
        user: &str,
        key: &UnlockedKey,
    ) -> Result<AuthAttempt, SshError> {
        // only meaningful for RSA keys; None elsewhere
        let hash_alg = self.best_supported_rsa_hash().await.ok().flatten().flatten();
        let key_with_hash = PrivateKeyWithHashAlg::new(key.private_key(), hash_alg);
        Ok(auth_attempt(
            Handle::authenticate_publickey(self, user, key_with_hash).await?,
        ))
    }

    async fn authenticate_password(
        &mut self,
        user: &str,
        password: &str,
    ) -> Result<AuthAttempt, SshError> {
        Ok(auth_attempt(
            Handle::authenticate_password(self, user, password).await?,
        ))
    }

    async fn keyboard_interactive_start(&mut self, user: &str) -> Result<KbiStep, SshError> {
        let response = self
            .authenticate_keyboard_interactive_start(user, None::<String>)
            .await?;
        Ok(kbi_step(response))
    }

    async fn keyboard_interactive_respond(
        &mut self,
        responses: Vec<String>,
    ) -> Result<KbiStep, SshError> {
        let response = self
            .authenticate_keyboard_interactive_respond(responses)
            .await?;
        Ok(kbi_step(response))
    }
}
