//! Interactive PTY session
//!
//! The russh channel lives in one pump task. Writes and resizes reach it
//! through a command channel; output comes back as [`SessionEvent`]s that
//! `read` drains into caller buffers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::config::TerminalSize;
use super::error::SshError;
use super::handle_owner::HandleController;
use super::notify::DisconnectNotifier;
use super::state::StateCell;

/// Commands that can be sent to the session pump
#[derive(Debug)]
pub enum SessionCommand {
    /// Data to send to the remote stdin
    Data(Vec<u8>),
    Resize(TerminalSize),
    Close,
}

/// What the pump saw on the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Output(Bytes),
    /// stderr; the terminal does not render it
    ErrorOutput(Bytes),
    Eof,
    Closed,
}

struct SessionReader {
    events: mpsc::UnboundedReceiver<SessionEvent>,
    pending: Bytes,
    finished: bool,
}

/// The PTY byte stream of one connection
pub struct SessionIoChannel {
    cmd_tx: mpsc::Sender<SessionCommand>,
    reader: Mutex<SessionReader>,
    closed: AtomicBool,
    state: Arc<StateCell>,
    notifier: Arc<dyn DisconnectNotifier>,
}

impl SessionIoChannel {
    /// Open a session channel, request a PTY and start the shell
    pub async fn open(
        controller: &HandleController,
        emulation: &str,
        size: TerminalSize,
        state: Arc<StateCell>,
        notifier: Arc<dyn DisconnectNotifier>,
    ) -> Result<Self, SshError> {
        let channel = controller.open_session_channel().await?;

        channel
            .request_pty(
                false,
                emulation,
                size.columns,
                size.rows,
                size.pixel_width,
                size.pixel_height,
                &[],
            )
            .await
            .map_err(|e| SshError::ChannelError(format!("Failed to request PTY: {}", e)))?;

        channel
            .request_shell(false)
            .await
            .map_err(|e| SshError::ChannelError(format!("Failed to request shell: {}", e)))?;

        info!(
            "Shell started ({}, {}x{})",
            emulation, size.columns, size.rows
        );

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(channel, cmd_rx, event_tx));

        Ok(Self::from_parts(cmd_tx, event_rx, state, notifier))
    }

    /// Assemble a session over existing queues
    pub fn from_parts(
        cmd_tx: mpsc::Sender<SessionCommand>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        state: Arc<StateCell>,
        notifier: Arc<dyn DisconnectNotifier>,
    ) -> Self {
        Self {
            cmd_tx,
            reader: Mutex::new(SessionReader {
                events,
                pending: Bytes::new(),
                finished: false,
            }),
            closed: AtomicBool::new(false),
            state,
            notifier,
        }
    }

    /// Fill `buf` with the next available output
    ///
    /// Blocks until at least one byte is available; never returns `Ok(0)`.
    /// Output that arrived before end-of-stream is always delivered first.
    /// Once the stream ends, every call returns `Err(Disconnected)` and the
    /// disconnect notifier fires exactly once for the connection.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, SshError> {
        if buf.is_empty() {
            return Err(SshError::InvalidState("Empty read buffer".into()));
        }

        let mut reader = self.reader.lock().await;
        loop {
            if !reader.pending.is_empty() {
                let n = buf.len().min(reader.pending.len());
                let chunk = reader.pending.split_to(n);
                buf[..n].copy_from_slice(&chunk);
                return Ok(n);
            }

            if reader.finished {
                drop(reader);
                return Err(self.end_of_stream());
            }

            match reader.events.recv().await {
                Some(SessionEvent::Output(data)) => reader.pending = data,
                Some(SessionEvent::ErrorOutput(data)) => {
                    debug!("Discarding {} bytes of stderr", data.len());
                }
                Some(SessionEvent::Eof) | Some(SessionEvent::Closed) | None => {
                    reader.finished = true;
                }
            }
        }
    }

    fn end_of_stream(&self) -> SshError {
        if self.state.disconnect() {
            info!("Remote session ended");
            self.notifier.on_disconnected(true);
        }
        SshError::Disconnected
    }

    pub async fn write(&self, data: &[u8]) -> Result<(), SshError> {
        if data.is_empty() {
            return Ok(());
        }
        self.cmd_tx
            .send(SessionCommand::Data(data.to_vec()))
            .await
            .map_err(|_| SshError::Disconnected)
    }

    pub async fn write_byte(&self, byte: u8) -> Result<(), SshError> {
        self.write(&[byte]).await
    }

    /// Ask the server to resize the PTY; failures are logged only
    pub async fn resize(&self, size: TerminalSize) {
        if let Err(e) = self.cmd_tx.send(SessionCommand::Resize(size)).await {
            debug!("Resize after session end ignored: {}", e);
        }
    }

    /// Send EOF and close the channel; later calls do nothing
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.cmd_tx.send(SessionCommand::Close).await;
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.cmd_tx.is_closed()
    }
}

/// Single owner of the channel
async fn pump(
    mut channel: Channel<Msg>,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
) {
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(SessionCommand::Data(data)) => {
                        if let Err(e) = channel.data(&data[..]).await {
                            warn!("Failed to write to session: {}", e);
                            break;
                        }
                    }
                    Some(SessionCommand::Resize(size)) => {
                        if let Err(e) = channel
                            .window_change(size.columns, size.rows, size.pixel_width, size.pixel_height)
                            .await
                        {
                            warn!("Failed to resize PTY: {}", e);
                        }
                    }
                    Some(SessionCommand::Close) | None => {
                        let _ = channel.eof().await;
                        let _ = channel.close().await;
                        break;
                    }
                }
            }
            msg = channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        let _ = event_tx.send(SessionEvent::Output(Bytes::copy_from_slice(&data)));
                    }
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        debug!("Extended data (type {}) on session channel", ext);
                        let _ = event_tx.send(SessionEvent::ErrorOutput(Bytes::copy_from_slice(&data)));
                    }
                    Some(ChannelMsg::Eof) => {
                        debug!("Session EOF received");
                        let _ = event_tx.send(SessionEvent::Eof);
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        info!("Remote shell exited with status {}", exit_status);
                    }
                    Some(ChannelMsg::Close) | None => {
                        debug!("Session channel closed");
                        break;
                    }
                    Some(_) => {}
                }
            }
        }
    }
    let _ = event_tx.send(SessionEvent::Closed);
}
