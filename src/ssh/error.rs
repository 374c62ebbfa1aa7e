//! SSH Error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Session error: {0}")]
    SessionError(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Port forward error: {0}")]
    ForwardError(String),

    #[error("Prompt error: {0}")]
    Prompt(String),

    #[error("Disconnected")]
    Disconnected,
}

impl SshError {
    /// True when the underlying connection is gone and nothing else can be attempted on it
    pub fn is_disconnect(&self) -> bool {
        matches!(self, SshError::Disconnected)
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::Disconnect => SshError::Disconnected,
            other => SshError::ProtocolError(other.to_string()),
        }
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_russh_disconnect_maps_to_disconnected() {
        let err: SshError = russh::Error::Disconnect.into();
        assert!(err.is_disconnect());
        let err: SshError = russh::Error::WrongChannel.into();
        assert!(!err.is_disconnect());
    }
}
