//! Interactive prompts
//!
//! Host-key confirmation, passphrases, passwords and keyboard-interactive
//! answers all go through [`InteractivePrompt`]. An absent answer means the
//! user cancelled; callers treat it as a refusal.
//!
//! [`PromptBroker`] is a channel-backed implementation for UI layers:
//!
//! ```text
//! UI                                    Transport
//!  │                                        │
//!  │◀─── PromptEvent { id, kind, message } ─│ request_confirmation / request_secret
//!  │                                        │   (waits, bounded by timeout)
//!  │──── respond_* / cancel(id) ───────────▶│
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::config::TransportOptions;

/// Source of interactive answers
#[async_trait]
pub trait InteractivePrompt: Send + Sync {
    /// Yes/no question. `None` = cancelled.
    async fn request_confirmation(&self, message: &str) -> Option<bool>;

    /// Secret string (password, passphrase, challenge answer). `None` = cancelled.
    async fn request_secret(&self, message: &str) -> Option<String>;
}

/// Serializes access to an [`InteractivePrompt`]
///
/// At most one request is outstanding at a time; concurrent callers queue.
#[derive(Clone)]
pub struct PromptGate {
    prompt: Arc<dyn InteractivePrompt>,
    turn: Arc<tokio::sync::Mutex<()>>,
}

impl PromptGate {
    pub fn new(prompt: Arc<dyn InteractivePrompt>) -> Self {
        Self {
            prompt,
            turn: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub async fn confirm(&self, message: &str) -> Option<bool> {
        let _turn = self.turn.lock().await;
        self.prompt.request_confirmation(message).await
    }

    pub async fn secret(&self, message: &str) -> Option<Zeroizing<String>> {
        let _turn = self.turn.lock().await;
        self.prompt.request_secret(message).await.map(Zeroizing::new)
    }
}

/// What kind of answer a prompt expects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    Confirmation,
    Secret,
}

/// Published to the UI for every brokered request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptEvent {
    /// Routes the answer back to the waiting request
    pub id: String,
    pub kind: PromptKind,
    pub message: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PromptError {
    /// Unknown id (already answered, cancelled or timed out)
    #[error("Prompt not found: {0}")]
    NotFound(String),

    #[error("Prompt {0} expects a different kind of answer")]
    KindMismatch(String),
}

enum PromptAnswer {
    Confirmation(bool),
    Secret(Zeroizing<String>),
    Cancelled,
}

struct PendingPrompt {
    kind: PromptKind,
    sender: oneshot::Sender<PromptAnswer>,
}

/// Channel-backed [`InteractivePrompt`]
pub struct PromptBroker {
    events: mpsc::UnboundedSender<PromptEvent>,
    pending: Mutex<HashMap<String, PendingPrompt>>,
    timeout: Duration,
}

impl PromptBroker {
    /// Create a broker and the stream of events the UI should render
    pub fn new(timeout: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<PromptEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let broker = Arc::new(Self {
            events,
            pending: Mutex::new(HashMap::new()),
            timeout,
        });
        (broker, rx)
    }

    /// Broker whose requests wait `prompt_timeout_secs`
    pub fn from_options(
        options: &TransportOptions,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PromptEvent>) {
        Self::new(options.prompt_timeout())
    }

    pub fn respond_confirmation(&self, id: &str, accepted: bool) -> Result<(), PromptError> {
        let request = self.take(id, PromptKind::Confirmation)?;
        let _ = request.sender.send(PromptAnswer::Confirmation(accepted));
        Ok(())
    }

    pub fn respond_secret(&self, id: &str, secret: String) -> Result<(), PromptError> {
        let request = self.take(id, PromptKind::Secret)?;
        let _ = request
            .sender
            .send(PromptAnswer::Secret(Zeroizing::new(secret)));
        Ok(())
    }

    /// User dismissed the prompt
    pub fn cancel(&self, id: &str) -> Result<(), PromptError> {
        let request = self
            .pending
            .lock()
            .remove(id)
            .ok_or_else(|| PromptError::NotFound(id.to_string()))?;
        let _ = request.sender.send(PromptAnswer::Cancelled);
        Ok(())
    }

    /// Number of requests waiting for an answer
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn take(&self, id: &str, kind: PromptKind) -> Result<PendingPrompt, PromptError> {
        let mut pending = self.pending.lock();
        match pending.get(id) {
            None => Err(PromptError::NotFound(id.to_string())),
            Some(request) if request.kind != kind => Err(PromptError::KindMismatch(id.to_string())),
            Some(_) => pending
                .remove(id)
                .ok_or_else(|| PromptError::NotFound(id.to_string())),
        }
    }

    async fn ask(&self, kind: PromptKind, message: &str) -> Option<PromptAnswer> {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .insert(id.clone(), PendingPrompt { kind, sender: tx });
        // the entry goes away however this future ends, including when dropped
        let _guard = PendingGuard {
            pending: &self.pending,
            id: &id,
        };

        let event = PromptEvent {
            id: id.clone(),
            kind,
            message: message.to_string(),
        };
        if self.events.send(event).is_err() {
            debug!("Prompt {} dropped: no UI listening", id);
            return None;
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(answer)) => Some(answer),
            Ok(Err(_)) => None,
            Err(_) => {
                warn!("Prompt {} timed out after {:?}", id, self.timeout);
                None
            }
        }
    }
}

struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<String, PendingPrompt>>,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.pending.lock().remove(self.id).is_some() {
            debug!("Prompt {} abandoned", self.id);
        }
    }
}

#[async_trait]
impl InteractivePrompt for PromptBroker {
    async fn request_confirmation(&self, message: &str) -> Option<bool> {
        match self.ask(PromptKind::Confirmation, message).await? {
            PromptAnswer::Confirmation(accepted) => Some(accepted),
            _ => None,
        }
    }

    async fn request_secret(&self, message: &str) -> Option<String> {
        match self.ask(PromptKind::Secret, message).await? {
            PromptAnswer::Secret(secret) => Some(secret.to_string()),
            _ => None,
        }
    }
}
