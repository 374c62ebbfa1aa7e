//! Authentication negotiation
//!
//! One round is a single pass through the method priority list:
//!
//! ```text
//! none ──fail──▶ publickey (once per connection) ──▶ done for this round
//!                  │ skipped / exhausted
//!                  ▼
//!                password ──▶ keyboard-interactive ──▶ "no usable method"
//! ```
//!
//! Only one of publickey / password / keyboard-interactive runs per round.
//! Rounds repeat with a delay until success or the round ceiling is hit.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::CredentialRef;
use super::credentials::{CredentialResolver, CredentialStore, UnlockedKey};
use super::error::SshError;
use super::keyboard_interactive::KbiRequest;
use super::notify::OutputSink;
use super::prompt::PromptGate;

/// Authentication methods in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AuthMethod {
    None,
    PublicKey,
    Password,
    KeyboardInteractive,
}

impl AuthMethod {
    /// Wire name of the method
    pub fn as_str(self) -> &'static str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::PublicKey => "publickey",
            AuthMethod::Password => "password",
            AuthMethod::KeyboardInteractive => "keyboard-interactive",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(AuthMethod::None),
            "publickey" => Some(AuthMethod::PublicKey),
            "password" => Some(AuthMethod::Password),
            "keyboard-interactive" => Some(AuthMethod::KeyboardInteractive),
            _ => None,
        }
    }
}

/// Methods the server says may continue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodSet {
    methods: BTreeSet<AuthMethod>,
}

impl MethodSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from wire names, ignoring methods this client does not speak
    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            methods: names.into_iter().filter_map(AuthMethod::from_name).collect(),
        }
    }

    pub fn contains(&self, method: AuthMethod) -> bool {
        self.methods.contains(&method)
    }

    pub fn insert(&mut self, method: AuthMethod) {
        self.methods.insert(method);
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl FromIterator<AuthMethod> for MethodSet {
    fn from_iter<I: IntoIterator<Item = AuthMethod>>(iter: I) -> Self {
        Self {
            methods: iter.into_iter().collect(),
        }
    }
}

impl std::fmt::Display for MethodSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.methods.iter().map(|m| m.as_str()).collect();
        f.write_str(&names.join(","))
    }
}

/// Result of a single authentication request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthAttempt {
    Success,
    Failure { methods: MethodSet },
}

/// Result of one keyboard-interactive exchange step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KbiStep {
    Success,
    Failure { methods: MethodSet },
    InfoRequest(KbiRequest),
}

/// Authentication requests on an established, unauthenticated connection
///
/// `Err` is reserved for transport problems; a rejection is `Failure`.
#[async_trait]
pub trait AuthTransport: Send {
    async fn authenticate_none(&mut self, user: &str) -> Result<AuthAttempt, SshError>;

    async fn authenticate_publickey(
        &mut self,
        user: &str,
        key: &UnlockedKey,
    ) -> Result<AuthAttempt, SshError>;

    async fn authenticate_password(
        &mut self,
        user: &str,
        password: &str,
    ) -> Result<AuthAttempt, SshError>;

    async fn keyboard_interactive_start(&mut self, user: &str) -> Result<KbiStep, SshError>;

    async fn keyboard_interactive_respond(
        &mut self,
        responses: Vec<String>,
    ) -> Result<KbiStep, SshError>;
}

/// How negotiation ended
#[derive(Debug)]
pub enum AuthOutcome {
    Authenticated { method: AuthMethod, rounds: u32 },
    /// Every round failed
    Exhausted { rounds: u32 },
    /// The connection went away mid-negotiation
    Aborted(SshError),
    Cancelled,
}

/// Drives the bounded authentication rounds for one connection attempt
pub struct AuthNegotiator {
    username: String,
    credential: CredentialRef,
    resolver: CredentialResolver,
    credentials: Arc<dyn CredentialStore>,
    prompt: PromptGate,
    output: Arc<dyn OutputSink>,
    max_rounds: u32,
    retry_delay: Duration,
    cancel: CancellationToken,
    pubkeys_exhausted: bool,
    methods: MethodSet,
}

impl AuthNegotiator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        username: impl Into<String>,
        credential: CredentialRef,
        resolver: CredentialResolver,
        credentials: Arc<dyn CredentialStore>,
        prompt: PromptGate,
        output: Arc<dyn OutputSink>,
        max_rounds: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            username: username.into(),
            credential,
            resolver,
            credentials,
            prompt,
            output,
            max_rounds,
            retry_delay,
            cancel: CancellationToken::new(),
            pubkeys_exhausted: false,
            methods: MethodSet::new(),
        }
    }

    /// Stop between rounds when `cancel` fires
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run rounds until success, exhaustion, loss of connection or cancellation
    pub async fn run<T: AuthTransport + ?Sized>(&mut self, transport: &mut T) -> AuthOutcome {
        for round in 1..=self.max_rounds {
            if self.cancel.is_cancelled() {
                return AuthOutcome::Cancelled;
            }

            debug!("Authentication round {}/{}", round, self.max_rounds);
            match self.round(transport).await {
                Ok(Some(method)) => {
                    info!(
                        "Authenticated {} via {} in round {}",
                        self.username,
                        method.as_str(),
                        round
                    );
                    return AuthOutcome::Authenticated {
                        method,
                        rounds: round,
                    };
                }
                Ok(None) => {}
                Err(e) if e.is_disconnect() => {
                    warn!("Connection lost during authentication: {}", e);
                    return AuthOutcome::Aborted(e);
                }
                Err(e) => {
                    warn!("Problem during authentication round {}: {}", round, e);
                    self.output
                        .output_line(&format!("Authentication attempt failed: {}", e));
                }
            }

            if round < self.max_rounds && !self.retry_delay.is_zero() {
                tokio::select! {
                    _ = self.cancel.cancelled() => return AuthOutcome::Cancelled,
                    _ = tokio::time::sleep(self.retry_delay) => {}
                }
            }
        }

        warn!(
            "Authentication for {} exhausted after {} rounds",
            self.username, self.max_rounds
        );
        AuthOutcome::Exhausted {
            rounds: self.max_rounds,
        }
    }

    async fn round<T: AuthTransport + ?Sized>(
        &mut self,
        transport: &mut T,
    ) -> Result<Option<AuthMethod>, SshError> {
        match transport.authenticate_none(&self.username).await? {
            AuthAttempt::Success => return Ok(Some(AuthMethod::None)),
            AuthAttempt::Failure { methods } => {
                debug!("Host does not accept 'none' authentication (offers: {})", methods);
                self.methods = methods;
            }
        }

        self.output.output_line("Trying to authenticate");

        if !self.pubkeys_exhausted
            && self.credential != CredentialRef::Never
            && self.methods.contains(AuthMethod::PublicKey)
        {
            let result = match self.credential {
                CredentialRef::Id(id) => self.try_stored_key(transport, id).await,
                _ => self.try_cached_keys(transport).await,
            };
            self.pubkeys_exhausted = true;
            return Ok(result?.then_some(AuthMethod::PublicKey));
        }

        if self.methods.contains(AuthMethod::Password) {
            self.output
                .output_line("Attempting 'password' authentication");
            let accepted = match self.prompt.secret("Password:").await {
                Some(password) => {
                    let attempt = transport
                        .authenticate_password(&self.username, &password)
                        .await?;
                    self.accepted(attempt)
                }
                None => false,
            };
            if !accepted {
                self.output
                    .output_line("Authentication method 'password' failed");
            }
            return Ok(accepted.then_some(AuthMethod::Password));
        }

        if self.methods.contains(AuthMethod::KeyboardInteractive) {
            self.output
                .output_line("Attempting 'keyboard-interactive' authentication");
            let accepted = self.try_keyboard_interactive(transport).await?;
            if !accepted {
                self.output
                    .output_line("Authentication method 'keyboard-interactive' failed");
            }
            return Ok(accepted.then_some(AuthMethod::KeyboardInteractive));
        }

        self.output.output_line(
            "[Your host doesn't support 'password' or 'keyboard-interactive' authentication.]",
        );
        Ok(None)
    }

    fn accepted(&mut self, attempt: AuthAttempt) -> bool {
        match attempt {
            AuthAttempt::Success => true,
            AuthAttempt::Failure { methods } => {
                self.methods = methods;
                false
            }
        }
    }

    async fn try_cached_keys<T: AuthTransport + ?Sized>(
        &mut self,
        transport: &mut T,
    ) -> Result<bool, SshError> {
        self.output
            .output_line("Attempting 'publickey' authentication with any in-memory public keys");
        for key in self.resolver.cache().snapshot() {
            if self.try_public_key(transport, &key).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn try_stored_key<T: AuthTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        id: u64,
    ) -> Result<bool, SshError> {
        self.output
            .output_line("Attempting 'publickey' authentication with a specific public key");
        let Some(record) = self.credentials.find_by_id(id) else {
            self.output
                .output_line("Selected public key is invalid, try reselecting key in host editor");
            return Ok(false);
        };

        match self.resolver.resolve(&record).await {
            Ok(key) => self.try_public_key(transport, &key).await,
            Err(e) => {
                debug!("Skipping key '{}': {}", record.nickname, e);
                Ok(false)
            }
        }
    }

    async fn try_public_key<T: AuthTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        key: &UnlockedKey,
    ) -> Result<bool, SshError> {
        let attempt = transport
            .authenticate_publickey(&self.username, key)
            .await?;
        let accepted = self.accepted(attempt);
        if !accepted {
            self.output.output_line(&format!(
                "Authentication method 'publickey' with key '{}' failed",
                key.nickname()
            ));
        }
        Ok(accepted)
    }

    async fn try_keyboard_interactive<T: AuthTransport + ?Sized>(
        &mut self,
        transport: &mut T,
    ) -> Result<bool, SshError> {
        let mut step = transport
            .keyboard_interactive_start(&self.username)
            .await?;
        loop {
            match step {
                KbiStep::Success => return Ok(true),
                KbiStep::Failure { methods } => {
                    self.methods = methods;
                    return Ok(false);
                }
                KbiStep::InfoRequest(request) => {
                    let Some(answers) = request.answer(&self.prompt).await else {
                        return Ok(false);
                    };
                    let responses = answers.iter().map(|a| a.to_string()).collect();
                    step = transport.keyboard_interactive_respond(responses).await?;
                }
            }
        }
    }
}
