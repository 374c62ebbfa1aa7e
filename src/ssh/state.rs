//! Connection lifecycle state

use parking_lot::Mutex;
use serde::Serialize;

/// Lifecycle of one transport
///
/// Forward transitions follow declaration order. `Disconnected` is terminal
/// and reachable from every other state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Authenticating,
    Authenticated,
    SessionOpen,
    Disconnected,
}

impl ConnectionState {
    /// Connected at the transport level (handshake done, not torn down)
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnectionState::Authenticating
                | ConnectionState::Authenticated
                | ConnectionState::SessionOpen
        )
    }

    /// Forward enabling is allowed from here on
    pub fn can_forward(self) -> bool {
        matches!(
            self,
            ConnectionState::Authenticated | ConnectionState::SessionOpen
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::SessionOpen => "session_open",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Shared, transition-checked holder for [`ConnectionState`]
#[derive(Debug)]
pub struct StateCell {
    state: Mutex<ConnectionState>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Idle),
        }
    }

    pub fn get(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Move strictly forward to `next`
    ///
    /// Returns false (and leaves the state untouched) when the move would go
    /// backwards, stay put, or leave `Disconnected`. Use [`StateCell::disconnect`]
    /// for the terminal transition.
    pub fn advance(&self, next: ConnectionState) -> bool {
        let mut state = self.state.lock();
        if *state == ConnectionState::Disconnected
            || next == ConnectionState::Disconnected
            || next <= *state
        {
            return false;
        }
        *state = next;
        true
    }

    /// Terminal transition
    ///
    /// Returns true only for the call that actually performed it, so exactly
    /// one caller gets to fire the disconnect notification.
    pub fn disconnect(&self) -> bool {
        let mut state = self.state.lock();
        if *state == ConnectionState::Disconnected {
            return false;
        }
        *state = ConnectionState::Disconnected;
        true
    }

    pub fn is(&self, expected: ConnectionState) -> bool {
        self.get() == expected
    }
}
