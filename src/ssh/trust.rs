//! Host key trust decisions
//!
//! Trust-on-first-use over a [`KnownHostStore`]: a matching key is accepted
//! silently, an unknown or changed key is narrated and the user decides.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::config::match_key;
use super::known_hosts::{fingerprint, HostKeyVerification, KnownHostStore};
use super::notify::OutputSink;
use super::prompt::PromptGate;

const CONTINUE_PROMPT: &str = "Are you sure you want\nto continue connecting?";

const CHANGED_BANNER: &[&str] = &[
    "@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@",
    "@    WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED!     @",
    "@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@",
    "IT IS POSSIBLE THAT SOMEONE IS DOING SOMETHING NASTY!",
    "Someone could be eavesdropping on you right now (man-in-the-middle attack)!",
    "It is also possible that the host key has just been changed.",
];

/// Short display name for a host key algorithm
pub fn algorithm_display_name(algorithm: &str) -> &str {
    match algorithm {
        "ssh-rsa" => "RSA",
        "ssh-dss" => "DSA",
        other => other,
    }
}

pub struct TrustVerifier {
    store: Arc<dyn KnownHostStore>,
    prompt: PromptGate,
    output: Arc<dyn OutputSink>,
}

impl TrustVerifier {
    pub fn new(
        store: Arc<dyn KnownHostStore>,
        prompt: PromptGate,
        output: Arc<dyn OutputSink>,
    ) -> Self {
        Self {
            store,
            prompt,
            output,
        }
    }

    /// Decide whether to accept `key_bytes` as the identity of `hostname:port`
    ///
    /// Never fails: anything other than a match or an explicit "yes" rejects.
    pub async fn verify(
        &self,
        hostname: &str,
        port: u16,
        algorithm: &str,
        key_bytes: &[u8],
    ) -> bool {
        let match_key = match_key(hostname, port);
        let fingerprint = fingerprint(key_bytes);
        let display = algorithm_display_name(algorithm);

        let verdict = match self.store.lookup(&match_key) {
            Ok(Some(entry)) => entry.verify(algorithm, &fingerprint),
            Ok(None) => HostKeyVerification::Unknown {
                fingerprint: fingerprint.clone(),
            },
            Err(e) => {
                warn!("Known hosts lookup failed for {}: {}", match_key, e);
                return false;
            }
        };

        match verdict {
            HostKeyVerification::Verified { fingerprint } => {
                debug!("Host key verified for {} ({})", match_key, algorithm);
                self.output
                    .output_line(&format!("Verified host {} key: {}", display, fingerprint));
                true
            }
            HostKeyVerification::Unknown { fingerprint } => {
                info!("Unknown host key for {} ({})", match_key, algorithm);
                self.output.output_line(&format!(
                    "The authenticity of host '{}' can't be established.",
                    hostname
                ));
                self.output.output_line(&format!(
                    "Host {} key fingerprint is {}",
                    display, fingerprint
                ));
                self.confirm_and_save(hostname, port, algorithm, key_bytes)
                    .await
            }
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                warn!(
                    "HOST KEY CHANGED for {} (type: {})! Expected {}, got {}",
                    match_key, algorithm, expected_fingerprint, actual_fingerprint
                );
                for line in CHANGED_BANNER {
                    self.output.output_line(line);
                }
                self.output.output_line(&format!(
                    "Host {} key fingerprint is {}",
                    display, actual_fingerprint
                ));
                self.confirm_and_save(hostname, port, algorithm, key_bytes)
                    .await
            }
        }
    }

    async fn confirm_and_save(
        &self,
        hostname: &str,
        port: u16,
        algorithm: &str,
        key_bytes: &[u8],
    ) -> bool {
        match self.prompt.confirm(CONTINUE_PROMPT).await {
            Some(true) => {
                if let Err(e) = self.store.save(hostname, port, algorithm, key_bytes) {
                    warn!("Failed to save host key for {}:{}: {}", hostname, port, e);
                    self.output
                        .output_line(&format!("Warning: could not save host key: {}", e));
                }
                true
            }
            Some(false) => false,
            None => {
                debug!("Host key prompt for {}:{} cancelled", hostname, port);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::known_hosts::KnownHostsFile;
    use crate::testing::{MemoryKnownHosts, RecordingSink, ScriptedPrompt};

    fn verifier(
        store: Arc<dyn KnownHostStore>,
        prompt: Arc<ScriptedPrompt>,
    ) -> (TrustVerifier, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        (
            TrustVerifier::new(store, PromptGate::new(prompt), sink.clone()),
            sink,
        )
    }

    #[test]
    fn test_algorithm_display_name() {
        assert_eq!(algorithm_display_name("ssh-rsa"), "RSA");
        assert_eq!(algorithm_display_name("ssh-dss"), "DSA");
        assert_eq!(algorithm_display_name("ssh-ed25519"), "ssh-ed25519");
    }

    #[tokio::test]
    async fn test_unknown_host_accepted_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(KnownHostsFile::with_path(dir.path().join("known_hosts")));
        let prompt = Arc::new(ScriptedPrompt::default().confirm(Some(true)));
        let (verifier, sink) = verifier(store.clone(), prompt.clone());

        assert!(verifier.verify("example.com", 22, "ssh-rsa", b"key").await);
        assert!(sink
            .lines()
            .contains(&"The authenticity of host 'example.com' can't be established.".to_string()));
        assert_eq!(prompt.confirmations_asked(), 1);

        // second connection matches silently
        assert!(verifier.verify("example.com", 22, "ssh-rsa", b"key").await);
        assert_eq!(prompt.confirmations_asked(), 1);
        assert_eq!(
            sink.lines().last().unwrap(),
            &format!("Verified host RSA key: {}", fingerprint(b"key"))
        );
    }

    #[tokio::test]
    async fn test_unknown_host_cancelled_is_rejected() {
        let store = Arc::new(MemoryKnownHosts::default());
        let prompt = Arc::new(ScriptedPrompt::default().confirm(None));
        let (verifier, _sink) = verifier(store.clone(), prompt);

        assert!(!verifier.verify("h", 22, "ssh-ed25519", b"key").await);
        assert_eq!(store.saved(), 0);
    }

    #[tokio::test]
    async fn test_changed_key_warns_and_asks() {
        let store = Arc::new(MemoryKnownHosts::default());
        store.insert("h:2222", "ssh-ed25519", b"old");
        let prompt = Arc::new(ScriptedPrompt::default().confirm(Some(false)));
        let (verifier, sink) = verifier(store.clone(), prompt.clone());

        assert!(!verifier.verify("h", 2222, "ssh-ed25519", b"new").await);
        assert!(sink
            .lines()
            .iter()
            .any(|l| l.contains("REMOTE HOST IDENTIFICATION HAS CHANGED")));
        assert_eq!(prompt.confirmations_asked(), 1);
        assert_eq!(store.saved(), 0);
    }

    #[tokio::test]
    async fn test_lookup_error_rejects_without_prompt() {
        let store = Arc::new(MemoryKnownHosts::default());
        store.fail_lookups();
        let prompt = Arc::new(ScriptedPrompt::default().confirm(Some(true)));
        let (verifier, _sink) = verifier(store, prompt.clone());

        assert!(!verifier.verify("h", 22, "ssh-rsa", b"key").await);
        assert_eq!(prompt.confirmations_asked(), 0);
    }

    #[tokio::test]
    async fn test_save_failure_still_accepts() {
        let store = Arc::new(MemoryKnownHosts::default());
        store.fail_saves();
        let prompt = Arc::new(ScriptedPrompt::default().confirm(Some(true)));
        let (verifier, sink) = verifier(store, prompt);

        assert!(verifier.verify("h", 22, "ssh-rsa", b"key").await);
        assert!(sink
            .lines()
            .iter()
            .any(|l| l.starts_with("Warning: could not save host key")));
    }
}
