//! SSH module - connection, trust, authentication and the interactive session
//!
//! This module provides the core SSH functionality using russh library.
//!
//! # Features
//! - Trust-on-first-use host key verification with interactive confirmation
//! - Bounded authentication rounds: none, publickey, password, keyboard-interactive
//! - Passphrase-protected keys with an in-process unlocked-key cache
//! - PTY session exposed as a single read/write surface
//! - Port forwarding (local, remote, dynamic) over the authenticated connection

pub mod auth;
pub mod client;
pub mod config;
pub mod credentials;
mod error;
pub mod handle_owner;
pub mod keyboard_interactive;
pub mod known_hosts;
pub mod notify;
pub mod prompt;
pub mod session;
pub mod state;
pub mod transport;
pub mod trust;

pub use auth::{AuthMethod, AuthNegotiator, AuthOutcome, AuthTransport, MethodSet};
pub use client::{ClientHandler, NegotiatedAlgorithms};
pub use config::{
    default_nickname, match_key, CredentialRef, HostDescriptor, TerminalSize, TransportOptions,
    DEFAULT_PORT,
};
pub use credentials::{
    CredentialError, CredentialRecord, CredentialResolver, CredentialStore, KeyFormat, UnlockedKey,
    UnlockedKeyCache,
};
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
pub use keyboard_interactive::{KbiPrompt, KbiRequest};
pub use known_hosts::{HostKeyVerification, KnownHostEntry, KnownHostStore, KnownHostsFile};
pub use notify::{ConnectedNotifier, DisconnectNotifier, NoopNotifier, OutputSink, TracingSink};
pub use prompt::{InteractivePrompt, PromptBroker, PromptError, PromptEvent, PromptGate, PromptKind};
pub use session::{SessionCommand, SessionEvent, SessionIoChannel};
pub use state::{ConnectionState, StateCell};
pub use transport::{Collaborators, SshTransport};
pub use trust::TrustVerifier;
