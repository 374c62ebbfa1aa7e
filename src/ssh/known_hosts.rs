//! Known hosts storage for host key verification
//!
//! Entries are keyed by `hostname:port` and hold one key per algorithm.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::error::SshError;

/// Result of comparing a presented key against the store
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    /// Key matches the stored entry for its algorithm
    Verified { fingerprint: String },
    /// Nothing stored for this host and algorithm
    Unknown { fingerprint: String },
    /// A different key is stored for this algorithm (potential MITM)
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

/// Stored fingerprints for one `hostname:port`, by algorithm name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KnownHostEntry {
    fingerprints: BTreeMap<String, String>,
}

impl KnownHostEntry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, algorithm: &str, fingerprint: impl Into<String>) -> Self {
        self.insert(algorithm, fingerprint);
        self
    }

    pub fn insert(&mut self, algorithm: &str, fingerprint: impl Into<String>) {
        self.fingerprints
            .insert(algorithm.to_string(), fingerprint.into());
    }

    pub fn fingerprint(&self, algorithm: &str) -> Option<&str> {
        self.fingerprints.get(algorithm).map(String::as_str)
    }

    pub fn algorithms(&self) -> impl Iterator<Item = &str> {
        self.fingerprints.keys().map(String::as_str)
    }

    /// Compare a presented key's fingerprint with what is stored
    pub fn verify(&self, algorithm: &str, fingerprint: &str) -> HostKeyVerification {
        match self.fingerprint(algorithm) {
            Some(stored) if stored == fingerprint => HostKeyVerification::Verified {
                fingerprint: fingerprint.to_string(),
            },
            Some(stored) => HostKeyVerification::Changed {
                expected_fingerprint: stored.to_string(),
                actual_fingerprint: fingerprint.to_string(),
            },
            None => HostKeyVerification::Unknown {
                fingerprint: fingerprint.to_string(),
            },
        }
    }
}

/// Persistent host key store
///
/// `lookup` returning `Err` means no verdict could be reached; the caller
/// rejects the host.
pub trait KnownHostStore: Send + Sync {
    fn lookup(&self, match_key: &str) -> Result<Option<KnownHostEntry>, SshError>;

    fn save(
        &self,
        hostname: &str,
        port: u16,
        algorithm: &str,
        key_bytes: &[u8],
    ) -> Result<(), SshError>;
}

/// SHA256 fingerprint in OpenSSH form: `SHA256:<unpadded base64>`
pub fn fingerprint(key_bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key_bytes);
    let hash = hasher.finalize();
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

/// One stored line: (key_type, base64_key)
#[derive(Clone, Debug)]
struct HostKeyLine {
    key_type: String,
    key_data: String,
}

/// File-backed [`KnownHostStore`]
///
/// One `host:port algorithm base64key` line per key.
pub struct KnownHostsFile {
    hosts: RwLock<HashMap<String, Vec<HostKeyLine>>>,
    path: PathBuf,
}

impl KnownHostsFile {
    /// Store at the default location (`<config dir>/shellbridge/known_hosts`)
    pub fn new() -> Self {
        let path = dirs::config_dir()
            .map(|d| d.join("shellbridge").join("known_hosts"))
            .unwrap_or_else(|| PathBuf::from("known_hosts"));
        Self::with_path(path)
    }

    /// Store at a custom path; a missing file is an empty store
    pub fn with_path(path: PathBuf) -> Self {
        let store = Self {
            hosts: RwLock::new(HashMap::new()),
            path,
        };

        if let Err(e) = store.load() {
            warn!("Failed to load known hosts from {:?}: {}", store.path, e);
        }

        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<(), SshError> {
        if !self.path.exists() {
            debug!("Known hosts file {:?} does not exist yet", self.path);
            return Ok(());
        }

        let file = fs::File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut hosts = self.hosts.write();
        let mut entry_count = 0;

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                continue;
            }

            let entries = hosts.entry(parts[0].to_string()).or_default();
            upsert(
                entries,
                HostKeyLine {
                    key_type: parts[1].to_string(),
                    key_data: parts[2].to_string(),
                },
            );
            entry_count += 1;
        }

        info!(
            "Loaded {} known host entries ({} unique hosts)",
            entry_count,
            hosts.len()
        );
        Ok(())
    }

    fn rewrite(&self, hosts: &HashMap<String, Vec<HostKeyLine>>) -> Result<(), SshError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut keys: Vec<&String> = hosts.keys().collect();
        keys.sort();

        let mut content = String::new();
        for host in keys {
            for entry in &hosts[host] {
                content.push_str(&format!("{} {} {}\n", host, entry.key_type, entry.key_data));
            }
        }

        fs::write(&self.path, content)?;
        Ok(())
    }
}

impl Default for KnownHostsFile {
    fn default() -> Self {
        Self::new()
    }
}

fn upsert(entries: &mut Vec<HostKeyLine>, line: HostKeyLine) {
    match entries.iter_mut().find(|e| e.key_type == line.key_type) {
        Some(existing) => *existing = line,
        None => entries.push(line),
    }
}

impl KnownHostStore for KnownHostsFile {
    fn lookup(&self, match_key: &str) -> Result<Option<KnownHostEntry>, SshError> {
        let hosts = self.hosts.read();
        let Some(lines) = hosts.get(match_key) else {
            return Ok(None);
        };

        let mut entry = KnownHostEntry::new();
        for line in lines {
            let bytes = BASE64.decode(&line.key_data).map_err(|e| {
                SshError::KeyError(format!(
                    "Corrupt known hosts entry for {} ({}): {}",
                    match_key, line.key_type, e
                ))
            })?;
            entry.insert(&line.key_type, fingerprint(&bytes));
        }
        Ok(Some(entry))
    }

    fn save(
        &self,
        hostname: &str,
        port: u16,
        algorithm: &str,
        key_bytes: &[u8],
    ) -> Result<(), SshError> {
        let match_key = super::config::match_key(hostname, port);
        let mut hosts = self.hosts.write();
        upsert(
            hosts.entry(match_key.clone()).or_default(),
            HostKeyLine {
                key_type: algorithm.to_string(),
                key_data: BASE64.encode(key_bytes),
            },
        );
        self.rewrite(&hosts)?;

        info!("Saved host key for {} (type: {})", match_key, algorithm);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_fingerprint_format() {
        let fp = fingerprint(b"hello");
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
        // sha256("hello") base64 without padding
        assert_eq!(fp, "SHA256:LPJNul+wow4m6DsqxbninhsWHlwfp0JecwQzYpOLmCQ");
    }

    #[test]
    fn test_save_then_lookup_verifies() {
        let dir = tempdir().unwrap();
        let store = KnownHostsFile::with_path(dir.path().join("known_hosts"));
        let key = b"\x00\x00\x00\x0bssh-ed25519 fake key bytes";

        assert_eq!(store.lookup("example.com:22").unwrap(), None);
        store.save("example.com", 22, "ssh-ed25519", key).unwrap();

        let entry = store.lookup("example.com:22").unwrap().unwrap();
        assert_eq!(
            entry.verify("ssh-ed25519", &fingerprint(key)),
            HostKeyVerification::Verified {
                fingerprint: fingerprint(key)
            }
        );
        assert_eq!(store.lookup("example.com:2222").unwrap(), None);
    }

    #[test]
    fn test_changed_and_new_algorithm() {
        let entry = KnownHostEntry::new().with_key("ssh-rsa", "SHA256:old");
        assert_eq!(
            entry.verify("ssh-rsa", "SHA256:new"),
            HostKeyVerification::Changed {
                expected_fingerprint: "SHA256:old".into(),
                actual_fingerprint: "SHA256:new".into(),
            }
        );
        assert_eq!(
            entry.verify("ssh-ed25519", "SHA256:new"),
            HostKeyVerification::Unknown {
                fingerprint: "SHA256:new".into()
            }
        );
    }

    #[test]
    fn test_save_replaces_same_algorithm_and_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("known_hosts");
        let store = KnownHostsFile::with_path(path.clone());

        store.save("h", 2222, "ssh-rsa", b"first").unwrap();
        store.save("h", 2222, "ssh-rsa", b"second").unwrap();
        store.save("h", 2222, "ssh-ed25519", b"third").unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);

        let reloaded = KnownHostsFile::with_path(path);
        let entry = reloaded.lookup("h:2222").unwrap().unwrap();
        assert_eq!(entry.fingerprint("ssh-rsa"), Some(fingerprint(b"second").as_str()));
        assert_eq!(
            entry.fingerprint("ssh-ed25519"),
            Some(fingerprint(b"third").as_str())
        );
    }

    #[test]
    fn test_corrupt_line_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        fs::write(&path, "# comment\nh:22 ssh-rsa !!notbase64!!\n").unwrap();

        let store = KnownHostsFile::with_path(path);
        assert!(store.lookup("h:22").is_err());
    }
}
