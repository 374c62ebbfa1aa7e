//! Connection supervisor and the caller-facing transport surface
//!
//! `connect()` starts one background task that runs the handshake (host key
//! trust included), the bounded authentication rounds and the
//! finish-connection steps. Everything else on [`SshTransport`] may be called
//! from any task while that runs.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use russh::client::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::auth::{AuthNegotiator, AuthOutcome};
use super::client::{self, ClientHandler, NegotiatedAlgorithms};
use super::config::{default_nickname, HostDescriptor, TerminalSize, TransportOptions, DEFAULT_PORT};
use super::credentials::{CredentialResolver, CredentialStore, UnlockedKeyCache};
use super::error::SshError;
use super::handle_owner::{spawn_handle_owner_task, HandleController};
use super::known_hosts::KnownHostStore;
use super::notify::{ConnectedNotifier, DisconnectNotifier, NoopNotifier, OutputSink, TracingSink};
use super::prompt::{InteractivePrompt, PromptGate};
use super::session::SessionIoChannel;
use super::state::{ConnectionState, StateCell};
use super::trust::TrustVerifier;
use crate::forwarding::{
    ForwardId, ForwardStats, PortForwardDescriptor, PortForwardManager, RemoteForwardRegistry,
    SshTunnels,
};

/// External services a transport consumes
///
/// Cloning shares every service, including the prompt turn: transports built
/// from clones of one `Collaborators` never prompt at the same time.
#[derive(Clone)]
pub struct Collaborators {
    pub known_hosts: Arc<dyn KnownHostStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub key_cache: Arc<UnlockedKeyCache>,
    pub prompt: PromptGate,
    pub output: Arc<dyn OutputSink>,
    pub disconnect_notifier: Arc<dyn DisconnectNotifier>,
    pub connected_notifier: Arc<dyn ConnectedNotifier>,
}

impl Collaborators {
    pub fn new(
        known_hosts: Arc<dyn KnownHostStore>,
        credentials: Arc<dyn CredentialStore>,
        prompt: Arc<dyn InteractivePrompt>,
    ) -> Self {
        Self {
            known_hosts,
            credentials,
            key_cache: Arc::new(UnlockedKeyCache::new()),
            prompt: PromptGate::new(prompt),
            output: Arc::new(TracingSink),
            disconnect_notifier: Arc::new(NoopNotifier),
            connected_notifier: Arc::new(NoopNotifier),
        }
    }

    pub fn with_key_cache(mut self, key_cache: Arc<UnlockedKeyCache>) -> Self {
        self.key_cache = key_cache;
        self
    }

    pub fn with_output(mut self, output: Arc<dyn OutputSink>) -> Self {
        self.output = output;
        self
    }

    pub fn with_disconnect_notifier(mut self, notifier: Arc<dyn DisconnectNotifier>) -> Self {
        self.disconnect_notifier = notifier;
        self
    }

    pub fn with_connected_notifier(mut self, notifier: Arc<dyn ConnectedNotifier>) -> Self {
        self.connected_notifier = notifier;
        self
    }
}

struct Inner {
    host: HostDescriptor,
    label: String,
    options: RwLock<TransportOptions>,
    services: Collaborators,
    state: Arc<StateCell>,
    forwards: PortForwardManager,
    controller: Mutex<Option<HandleController>>,
    session: RwLock<Option<Arc<SessionIoChannel>>>,
    size: Mutex<TerminalSize>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// One SSH connection to one host
///
/// Cheap to clone; clones drive the same connection.
#[derive(Clone)]
pub struct SshTransport {
    inner: Arc<Inner>,
}

impl SshTransport {
    pub fn new(host: HostDescriptor, options: TransportOptions, services: Collaborators) -> Self {
        let label = host.nickname();
        Self {
            inner: Arc::new(Inner {
                host,
                label,
                options: RwLock::new(options),
                services,
                state: Arc::new(StateCell::new()),
                forwards: PortForwardManager::new(),
                controller: Mutex::new(None),
                session: RwLock::new(None),
                size: Mutex::new(TerminalSize::default()),
                cancel: CancellationToken::new(),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn host(&self) -> &HostDescriptor {
        &self.inner.host
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    /// Start connecting in the background
    ///
    /// Only the first call on an idle transport does anything. Failures are
    /// narrated through the output sink and end in
    /// `DisconnectNotifier::on_disconnected(false)`. Must be called from
    /// within a tokio runtime.
    pub fn connect(&self) {
        if !self.inner.state.advance(ConnectionState::Connecting) {
            warn!(
                "connect() ignored for {}: transport is {}",
                self.inner.label,
                self.inner.state.get()
            );
            return;
        }

        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = inner.cancel.cancelled() => {
                    debug!("Connect task for {} cancelled", inner.label);
                }
                result = inner.establish() => {
                    if let Err(e) = result {
                        inner.fail(e);
                    }
                }
            }
        });
        *self.inner.task.lock() = Some(task);
    }

    /// Read PTY output into `buf`; see [`SessionIoChannel::read`]
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, SshError> {
        let session = self.session()?;
        session.read(buf).await
    }

    pub async fn write(&self, data: &[u8]) -> Result<(), SshError> {
        let session = self.session()?;
        session.write(data).await
    }

    pub async fn write_byte(&self, byte: u8) -> Result<(), SshError> {
        let session = self.session()?;
        session.write_byte(byte).await
    }

    /// Record new PTY geometry and send it if the session is open
    pub async fn resize(&self, size: TerminalSize) {
        *self.inner.size.lock() = size;
        let session = self.inner.session.read().clone();
        match session {
            Some(session) if self.inner.state.is(ConnectionState::SessionOpen) => {
                session.resize(size).await;
            }
            _ => debug!(
                "Recorded {}x{} for {}; session not open",
                size.columns, size.rows, self.inner.label
            ),
        }
    }

    fn session(&self) -> Result<Arc<SessionIoChannel>, SshError> {
        if let Some(session) = self.inner.session.read().clone() {
            return Ok(session);
        }
        if self.inner.state.is(ConnectionState::Disconnected) {
            Err(SshError::Disconnected)
        } else {
            Err(SshError::InvalidState(format!(
                "Session is not open ({})",
                self.inner.state.get()
            )))
        }
    }

    pub async fn add_port_forward(&self, descriptor: PortForwardDescriptor) -> ForwardId {
        self.inner.forwards.add(descriptor).await
    }

    pub async fn remove_port_forward(&self, id: &ForwardId) -> bool {
        self.inner.forwards.remove(id).await
    }

    /// Start a tracked forward; false before authentication
    pub async fn enable_port_forward(&self, id: &ForwardId) -> bool {
        if !self.inner.state.get().can_forward() {
            warn!(
                "Cannot enable port forward on {}: transport is {}",
                self.inner.label,
                self.inner.state.get()
            );
            return false;
        }
        self.inner.forwards.enable(id).await
    }

    pub async fn disable_port_forward(&self, id: &ForwardId) -> bool {
        self.inner.forwards.disable(id).await
    }

    pub async fn list_port_forwards(&self) -> Vec<PortForwardDescriptor> {
        self.inner.forwards.list().await
    }

    /// Connection and byte counters of an enabled forward
    pub async fn port_forward_stats(&self, id: &ForwardId) -> Option<ForwardStats> {
        self.inner.forwards.stats(id).await
    }

    pub fn can_forward_ports(&self) -> bool {
        true
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.get().is_connected()
    }

    pub fn is_session_open(&self) -> bool {
        self.inner.state.is(ConnectionState::SessionOpen)
    }

    pub fn options(&self) -> HashMap<String, String> {
        self.inner.options.read().to_map()
    }

    pub fn set_options(&self, options: &HashMap<String, String>) {
        self.inner.options.write().apply_map(options);
    }

    pub fn default_port() -> u16 {
        DEFAULT_PORT
    }

    pub fn default_nickname(username: &str, hostname: &str, port: u16) -> String {
        default_nickname(username, hostname, port)
    }

    /// Tear everything down; safe at any point and more than once
    ///
    /// Does not fire the disconnect notifier. Blocked reads return
    /// `Err(Disconnected)`.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.state.disconnect() {
            info!("Closing connection to {}", inner.label);
        }
        inner.cancel.cancel();

        inner.forwards.shutdown().await;

        let session = inner.session.read().clone();
        if let Some(session) = session {
            session.close().await;
        }

        let controller = inner.controller.lock().take();
        if let Some(controller) = controller {
            controller.disconnect().await;
        }

        let task = inner.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!("Connect task for {} panicked: {}", inner.label, e);
                }
            }
        }
    }
}

impl Inner {
    async fn establish(self: &Arc<Self>) -> Result<(), SshError> {
        let options = self.options.read().clone();
        let services = &self.services;

        let verifier = Arc::new(TrustVerifier::new(
            services.known_hosts.clone(),
            services.prompt.clone(),
            services.output.clone(),
        ));
        let algorithms = Arc::new(Mutex::new(NegotiatedAlgorithms::default()));
        let registry = Arc::new(RemoteForwardRegistry::new());
        let handler = ClientHandler::new(
            self.host.hostname.clone(),
            self.host.port,
            verifier,
            algorithms.clone(),
            registry.clone(),
        );

        let mut handle =
            client::connect(&self.host.hostname, self.host.port, &options, handler).await?;

        if !self.state.advance(ConnectionState::Authenticating) {
            disconnect_handle(&handle).await;
            return Ok(());
        }

        let report = algorithms.lock().report_lines();
        for line in report {
            self.services.output.output_line(&line);
        }

        let resolver = CredentialResolver::new(
            services.key_cache.clone(),
            services.prompt.clone(),
            services.output.clone(),
            options.save_keys,
        );
        let mut negotiator = AuthNegotiator::new(
            self.host.username.clone(),
            self.host.credential,
            resolver,
            services.credentials.clone(),
            services.prompt.clone(),
            services.output.clone(),
            options.auth_tries,
            options.auth_retry_delay(),
        )
        .with_cancel(self.cancel.child_token());

        match negotiator.run(&mut handle).await {
            AuthOutcome::Authenticated { .. } => {}
            AuthOutcome::Exhausted { rounds } => {
                disconnect_handle(&handle).await;
                return Err(SshError::AuthenticationFailed(format!(
                    "No method succeeded after {} attempts",
                    rounds
                )));
            }
            AuthOutcome::Aborted(e) => return Err(e),
            AuthOutcome::Cancelled => {
                disconnect_handle(&handle).await;
                return Ok(());
            }
        }

        self.finish_connection(handle, registry, &options).await
    }

    /// Start forwards and, if wanted, the interactive session
    async fn finish_connection(
        self: &Arc<Self>,
        handle: Handle<ClientHandler>,
        registry: Arc<RemoteForwardRegistry>,
        options: &TransportOptions,
    ) -> Result<(), SshError> {
        let controller = spawn_handle_owner_task(handle, self.label.clone());
        *self.controller.lock() = Some(controller.clone());

        if !self.state.advance(ConnectionState::Authenticated) {
            controller.disconnect().await;
            return Ok(());
        }

        self.watch_disconnect(&controller);

        self.forwards.attach(Arc::new(SshTunnels::new(
            controller.clone(),
            registry,
            options.forward_bind_address.clone(),
            options.remote_bind_address.clone(),
        )));
        for forward in self.forwards.enable_all().await {
            self.services
                .output
                .output_line(&format!("Enable port forward: {}", forward.label()));
        }

        if !self.host.want_session {
            self.services
                .output
                .output_line("Session will not be started due to host preference.");
            return Ok(());
        }

        let size = *self.size.lock();
        let session = match SessionIoChannel::open(
            &controller,
            &self.host.emulation,
            size,
            self.state.clone(),
            self.services.disconnect_notifier.clone(),
        )
        .await
        {
            Ok(session) => Arc::new(session),
            Err(e) => {
                error!("Problem while trying to create PTY for {}: {}", self.label, e);
                self.services
                    .output
                    .output_line(&format!("Could not open session: {}", e));
                return Ok(());
            }
        };

        *self.session.write() = Some(session.clone());
        if !self.state.advance(ConnectionState::SessionOpen) {
            session.close().await;
            return Ok(());
        }

        let latest = *self.size.lock();
        if latest != size {
            session.resize(latest).await;
        }

        info!("Session open for {}", self.label);
        self.services.connected_notifier.on_session_ready();
        Ok(())
    }

    /// React to the connection dying underneath us
    fn watch_disconnect(self: &Arc<Self>, controller: &HandleController) {
        let mut disconnect_rx = controller.subscribe_disconnect();
        let alive = controller.clone();
        let inner: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            if alive.is_connected() {
                let _ = disconnect_rx.recv().await;
            }
            drop(alive);
            if let Some(inner) = inner.upgrade() {
                inner.connection_lost().await;
            }
        });
    }

    async fn connection_lost(&self) {
        self.forwards.suspend().await;

        // with a session open, the read path reports the end of the stream
        let session_open = self.session.read().is_some();
        if !session_open && self.state.disconnect() {
            warn!("Connection to {} lost", self.label);
            self.services.output.output_line("Connection lost");
            self.services.disconnect_notifier.on_disconnected(false);
        }
    }

    /// Narrate a fatal failure once and disconnect
    fn fail(&self, e: SshError) {
        if self.state.is(ConnectionState::Disconnected) {
            debug!("Ignoring failure after close for {}: {}", self.label, e);
            return;
        }
        error!("Problem in SSH connection task for {}: {}", self.label, e);
        self.services.output.output_line(&e.to_string());
        if self.state.disconnect() {
            self.services.disconnect_notifier.on_disconnected(false);
        }
    }
}

async fn disconnect_handle(handle: &Handle<ClientHandler>) {
    let _ = handle
        .disconnect(russh::Disconnect::ByApplication, "", "en")
        .await;
}
