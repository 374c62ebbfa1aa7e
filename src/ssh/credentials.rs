//! Credential resolution
//!
//! Turns stored key material into signing keys:
//! - `Imported` keys are OpenSSH/PEM text, decoded with `decode_secret_key`
//! - `Generated` keys are the binary OpenSSH encoding plus the paired public key
//!
//! Unlocked keys are kept in an in-process cache keyed by nickname so later
//! attempts do not prompt again.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use russh::keys::{PrivateKey, PublicKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::notify::OutputSink;
use super::prompt::PromptGate;

/// Encoding of a record's private key material
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyFormat {
    /// OpenSSH or PEM text as produced by external tools
    Imported,
    /// Binary OpenSSH encoding written by this application
    Generated,
}

/// Key material owned by the credential store
#[derive(Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub id: u64,
    pub nickname: String,
    pub format: KeyFormat,
    pub private_key: Vec<u8>,
    /// SSH wire encoding of the public key (required for `Generated`)
    #[serde(default)]
    pub public_key: Vec<u8>,
    pub encrypted: bool,
}

impl std::fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("id", &self.id)
            .field("nickname", &self.nickname)
            .field("format", &self.format)
            .field("encrypted", &self.encrypted)
            .finish_non_exhaustive()
    }
}

/// Read-only view of the application's stored keys
pub trait CredentialStore: Send + Sync {
    fn find_by_id(&self, id: u64) -> Option<CredentialRecord>;
}

/// Errors that can occur while unlocking a credential
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Passphrase prompt cancelled")]
    PassphraseCancelled,

    #[error("Encrypted key requires passphrase")]
    PassphraseRequired,

    #[error("Invalid passphrase")]
    InvalidPassphrase,

    #[error("Failed to parse key: {0}")]
    Parse(String),

    #[error("Private key does not match its public key")]
    KeyMismatch,
}

/// Decrypted, signing-capable key
///
/// Opaque outside of authentication; cloning shares the key.
#[derive(Clone)]
pub struct UnlockedKey {
    nickname: String,
    key: Arc<PrivateKey>,
}

impl UnlockedKey {
    pub fn new(nickname: impl Into<String>, key: PrivateKey) -> Self {
        Self {
            nickname: nickname.into(),
            key: Arc::new(key),
        }
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn algorithm(&self) -> String {
        self.key.algorithm().to_string()
    }

    pub(crate) fn private_key(&self) -> Arc<PrivateKey> {
        self.key.clone()
    }
}

impl std::fmt::Debug for UnlockedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnlockedKey")
            .field("nickname", &self.nickname)
            .field("algorithm", &self.algorithm())
            .finish_non_exhaustive()
    }
}

/// In-memory cache of unlocked keys, iterated in nickname order
#[derive(Default)]
pub struct UnlockedKeyCache {
    keys: RwLock<BTreeMap<String, UnlockedKey>>,
}

impl UnlockedKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, nickname: &str) -> bool {
        self.keys.read().contains_key(nickname)
    }

    pub fn get(&self, nickname: &str) -> Option<UnlockedKey> {
        self.keys.read().get(nickname).cloned()
    }

    pub fn put(&self, key: UnlockedKey) {
        self.keys.write().insert(key.nickname.clone(), key);
    }

    pub fn remove(&self, nickname: &str) -> Option<UnlockedKey> {
        self.keys.write().remove(nickname)
    }

    pub fn clear(&self) {
        self.keys.write().clear();
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }

    /// Point-in-time copy, so callers never hold the lock across an await
    pub fn snapshot(&self) -> Vec<UnlockedKey> {
        self.keys.read().values().cloned().collect()
    }
}

/// Decode a record into a private key (blocking; bcrypt KDF may be slow)
pub fn decode_record(
    record: &CredentialRecord,
    passphrase: Option<&str>,
) -> Result<PrivateKey, CredentialError> {
    if record.encrypted && passphrase.is_none() {
        return Err(CredentialError::PassphraseRequired);
    }

    match record.format {
        KeyFormat::Imported => {
            let text = std::str::from_utf8(&record.private_key)
                .map_err(|e| CredentialError::Parse(e.to_string()))?;
            russh::keys::decode_secret_key(text, passphrase).map_err(|e| {
                if record.encrypted {
                    CredentialError::InvalidPassphrase
                } else {
                    CredentialError::Parse(e.to_string())
                }
            })
        }
        KeyFormat::Generated => {
            let key = PrivateKey::from_bytes(&record.private_key)
                .map_err(|e| CredentialError::Parse(e.to_string()))?;
            let key = if key.is_encrypted() {
                let passphrase = passphrase.ok_or(CredentialError::PassphraseRequired)?;
                key.decrypt(passphrase.as_bytes())
                    .map_err(|_| CredentialError::InvalidPassphrase)?
            } else {
                key
            };

            let public = PublicKey::from_bytes(&record.public_key)
                .map_err(|e| CredentialError::Parse(e.to_string()))?;
            if key.public_key().key_data() != public.key_data() {
                return Err(CredentialError::KeyMismatch);
            }
            Ok(key)
        }
    }
}

/// Produces [`UnlockedKey`]s from records, prompting for passphrases
pub struct CredentialResolver {
    cache: Arc<UnlockedKeyCache>,
    prompt: PromptGate,
    output: Arc<dyn OutputSink>,
    save_keys: bool,
}

impl CredentialResolver {
    pub fn new(
        cache: Arc<UnlockedKeyCache>,
        prompt: PromptGate,
        output: Arc<dyn OutputSink>,
        save_keys: bool,
    ) -> Self {
        Self {
            cache,
            prompt,
            output,
            save_keys,
        }
    }

    pub fn cache(&self) -> &Arc<UnlockedKeyCache> {
        &self.cache
    }

    /// Unlock `record`, reusing a cached key when present
    ///
    /// Every failure is local to this credential. Decode failures are narrated.
    pub async fn resolve(&self, record: &CredentialRecord) -> Result<UnlockedKey, CredentialError> {
        if let Some(key) = self.cache.get(&record.nickname) {
            debug!("Found unlocked key '{}' already in memory", record.nickname);
            return Ok(key);
        }

        let passphrase = if record.encrypted {
            let message = format!("Passphrase for key '{}'", record.nickname);
            match self.prompt.secret(&message).await {
                Some(passphrase) => Some(passphrase),
                None => {
                    debug!("Passphrase prompt for '{}' cancelled", record.nickname);
                    return Err(CredentialError::PassphraseCancelled);
                }
            }
        } else {
            None
        };

        let owned = record.clone();
        let decoded = tokio::task::spawn_blocking(move || {
            let passphrase: Option<Zeroizing<String>> = passphrase;
            decode_record(&owned, passphrase.as_deref().map(String::as_str))
        })
        .await
        .map_err(|e| CredentialError::Parse(format!("Task join error: {}", e)))?;

        let key = match decoded {
            Ok(key) => key,
            Err(e) => {
                warn!("Failed to unlock key '{}': {}", record.nickname, e);
                let line = match e {
                    CredentialError::InvalidPassphrase => format!(
                        "Bad password for key '{}'. Authentication failed.",
                        record.nickname
                    ),
                    _ => format!("Could not load key '{}': {}", record.nickname, e),
                };
                self.output.output_line(&line);
                return Err(e);
            }
        };

        info!("Unlocked key '{}'", record.nickname);
        let unlocked = UnlockedKey::new(record.nickname.clone(), key);
        if self.save_keys {
            self.cache.put(unlocked.clone());
        }
        Ok(unlocked)
    }
}
