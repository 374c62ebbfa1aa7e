//! User-visible narration and lifecycle notifications

use tracing::info;

/// Receives the plain-language status lines shown to the user
pub trait OutputSink: Send + Sync {
    fn output_line(&self, line: &str);
}

/// Told once when the transport goes away
///
/// `graceful` is true when the remote ended the stream, false when the
/// connection or authentication failed.
pub trait DisconnectNotifier: Send + Sync {
    fn on_disconnected(&self, graceful: bool);
}

/// Told once the interactive session is open
pub trait ConnectedNotifier: Send + Sync {
    fn on_session_ready(&self);
}

/// Output sink that only writes to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl OutputSink for TracingSink {
    fn output_line(&self, line: &str) {
        info!(target: "shellbridge::output", "{}", line);
    }
}

/// Notifier that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl DisconnectNotifier for NoopNotifier {
    fn on_disconnected(&self, _graceful: bool) {}
}

impl ConnectedNotifier for NoopNotifier {
    fn on_session_ready(&self) {}
}
