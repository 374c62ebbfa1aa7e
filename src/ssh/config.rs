//! SSH Configuration

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default SSH port
pub const DEFAULT_PORT: u16 = 22;

/// Which credential the public-key step may use for a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum CredentialRef {
    /// Try every unlocked key held in the in-memory cache
    Any,
    /// Never offer a public key
    Never,
    /// A specific credential from the credential store
    Id(u64),
}

impl Default for CredentialRef {
    fn default() -> Self {
        CredentialRef::Any
    }
}

/// Remote endpoint description, fixed for one connection attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostDescriptor {
    /// Remote host address
    pub hostname: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Credential used by public-key authentication
    #[serde(default)]
    pub credential: CredentialRef,

    /// Whether to open an interactive shell after authentication
    #[serde(default = "default_want_session")]
    pub want_session: bool,

    /// Terminal type announced in the PTY request
    #[serde(default = "default_emulation")]
    pub emulation: String,

    /// Display name (falls back to `user@host[:port]`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
}

impl HostDescriptor {
    pub fn new(hostname: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            username: username.into(),
            credential: CredentialRef::Any,
            want_session: true,
            emulation: default_emulation(),
            nickname: None,
        }
    }

    pub fn with_credential(mut self, credential: CredentialRef) -> Self {
        self.credential = credential;
        self
    }

    pub fn with_session(mut self, want_session: bool) -> Self {
        self.want_session = want_session;
        self
    }

    pub fn with_emulation(mut self, emulation: impl Into<String>) -> Self {
        self.emulation = emulation.into();
        self
    }

    /// Display name for this host
    pub fn nickname(&self) -> String {
        self.nickname
            .clone()
            .unwrap_or_else(|| default_nickname(&self.username, &self.hostname, self.port))
    }

    /// Known-hosts match key, exactly `hostname:port`
    pub fn match_key(&self) -> String {
        match_key(&self.hostname, self.port)
    }
}

/// Known-hosts match key, exactly `hostname:port`
pub fn match_key(hostname: &str, port: u16) -> String {
    format!("{}:{}", hostname, port)
}

/// `user@host` on the default port, `user@host:port` otherwise
pub fn default_nickname(username: &str, hostname: &str, port: u16) -> String {
    if port == DEFAULT_PORT {
        format!("{}@{}", username, hostname)
    } else {
        format!("{}@{}:{}", username, hostname, port)
    }
}

/// PTY geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub columns: u32,
    pub rows: u32,
    pub pixel_width: u32,
    pub pixel_height: u32,
}

impl TerminalSize {
    pub fn new(columns: u32, rows: u32, pixel_width: u32, pixel_height: u32) -> Self {
        Self {
            columns,
            rows,
            pixel_width,
            pixel_height,
        }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self::new(default_cols(), default_rows(), 0, 0)
    }
}

/// Tunables for one transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportOptions {
    /// Ceiling on authentication rounds
    #[serde(default = "default_auth_tries")]
    pub auth_tries: u32,

    /// Pause between authentication rounds (ms)
    #[serde(default = "default_auth_retry_delay_ms")]
    pub auth_retry_delay_ms: u64,

    /// Connection timeout in seconds
    #[serde(default = "default_timeout")]
    pub connect_timeout_secs: u64,

    /// SSH keepalive interval in seconds
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,

    /// Missed keepalives before the transport gives up
    #[serde(default = "default_keepalive_max")]
    pub keepalive_max: usize,

    /// Keep unlocked keys in memory for later connections
    #[serde(default = "default_save_keys")]
    pub save_keys: bool,

    /// Compression preference. Recorded and reported, not negotiated.
    #[serde(default)]
    pub compression: bool,

    /// Listen address for local and dynamic forwards
    #[serde(default = "default_forward_bind_address")]
    pub forward_bind_address: String,

    /// Address the server binds for remote forwards
    #[serde(default = "default_remote_bind_address")]
    pub remote_bind_address: String,

    /// How long a brokered prompt waits for an answer
    #[serde(default = "default_prompt_timeout")]
    pub prompt_timeout_secs: u64,
}

impl TransportOptions {
    /// Parse options from JSON; missing fields take their defaults
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn auth_retry_delay(&self) -> Duration {
        Duration::from_millis(self.auth_retry_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_secs(self.prompt_timeout_secs)
    }

    /// String view of the user-tunable options
    pub fn to_map(&self) -> HashMap<String, String> {
        let mut options = HashMap::new();
        options.insert("compression".to_string(), self.compression.to_string());
        options
    }

    /// Apply recognized keys from a string map, ignoring the rest
    pub fn apply_map(&mut self, options: &HashMap<String, String>) {
        if let Some(value) = options.get("compression") {
            self.compression = value.trim().eq_ignore_ascii_case("true");
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_want_session() -> bool {
    true
}

fn default_emulation() -> String {
    "xterm-256color".to_string()
}

fn default_cols() -> u32 {
    80
}

fn default_rows() -> u32 {
    24
}

fn default_auth_tries() -> u32 {
    20
}

fn default_auth_retry_delay_ms() -> u64 {
    1000
}

fn default_timeout() -> u64 {
    30
}

fn default_keepalive_interval() -> u64 {
    30
}

fn default_keepalive_max() -> usize {
    3
}

fn default_save_keys() -> bool {
    true
}

fn default_forward_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_remote_bind_address() -> String {
    "localhost".to_string()
}

fn default_prompt_timeout() -> u64 {
    60
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            auth_tries: default_auth_tries(),
            auth_retry_delay_ms: default_auth_retry_delay_ms(),
            connect_timeout_secs: default_timeout(),
            keepalive_interval_secs: default_keepalive_interval(),
            keepalive_max: default_keepalive_max(),
            save_keys: default_save_keys(),
            compression: false,
            forward_bind_address: default_forward_bind_address(),
            remote_bind_address: default_remote_bind_address(),
            prompt_timeout_secs: default_prompt_timeout(),
        }
    }
}
