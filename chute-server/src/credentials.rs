//! Credential store: register and authenticate users by username and password.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Application-level login. Blocking; the dispatcher calls it off the async workers.
pub trait CredentialStore: Send + Sync {
    /// True if `username` exists and `password` matches.
    fn authenticate(&self, username: &str, password: &str) -> bool;
    /// Create a user. False if the name is taken, empty, or could not be saved.
    fn create(&self, username: &str, password: &str) -> bool;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredCredential {
    salt: String,
    digest: String,
    created_at: u64,
}

impl StoredCredential {
    fn new(password: &str) -> Self {
        let salt = to_hex(&rand::random::<[u8; 16]>());
        Self {
            digest: digest(&salt, password),
            salt,
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }

    fn matches(&self, password: &str) -> bool {
        digest(&self.salt, password) == self.digest
    }
}

fn digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    to_hex(&hasher.finalize())
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Users kept in a JSON file (`users.json`), passwords as salted SHA-256 digests.
pub struct FileCredentialStore {
    path: Option<PathBuf>,
    users: Mutex<HashMap<String, StoredCredential>>,
}

impl FileCredentialStore {
    /// Load users from `path`; a missing file starts an empty store that is created on first registration.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CredentialError> {
        let path = path.into();
        let users = match std::fs::read_to_string(&path) {
            Ok(s) => serde_json::from_str(&s).map_err(|source| CredentialError::Parse {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(CredentialError::Io(e)),
        };
        Ok(Self {
            path: Some(path),
            users: Mutex::new(users),
        })
    }

    /// Store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            users: Mutex::new(HashMap::new()),
        }
    }

    fn users(&self) -> MutexGuard<'_, HashMap<String, StoredCredential>> {
        self.users.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, users: &HashMap<String, StoredCredential>) -> Result<(), CredentialError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(users)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn authenticate(&self, username: &str, password: &str) -> bool {
        self.users()
            .get(username)
            .is_some_and(|cred| cred.matches(password))
    }

    fn create(&self, username: &str, password: &str) -> bool {
        if username.is_empty() {
            return false;
        }
        let mut users = self.users();
        if users.contains_key(username) {
            tracing::debug!(username, "registration refused: name taken");
            return false;
        }
        users.insert(username.to_string(), StoredCredential::new(password));
        if let Err(e) = self.persist(&users) {
            tracing::error!(username, error = %e, "could not save credential store");
            users.remove(username);
            return false;
        }
        true
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("credential store I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("credential store {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("credential store encode: {0}")]
    Encode(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_login() {
        let store = FileCredentialStore::in_memory();
        assert!(store.create("alice", "secret"));
        assert!(store.authenticate("alice", "secret"));
        assert!(!store.authenticate("alice", "wrong"));
        assert!(!store.authenticate("bob", "secret"));
    }

    #[test]
    fn duplicate_registration_fails() {
        let store = FileCredentialStore::in_memory();
        assert!(store.create("alice", "secret"));
        assert!(!store.create("alice", "other"));
        // The original password still works.
        assert!(store.authenticate("alice", "secret"));
    }

    #[test]
    fn empty_username_is_refused() {
        let store = FileCredentialStore::in_memory();
        assert!(!store.create("", "pw"));
    }

    #[test]
    fn users_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        {
            let store = FileCredentialStore::open(&path).unwrap();
            assert!(store.create("alice", "secret"));
        }
        let store = FileCredentialStore::open(&path).unwrap();
        assert!(store.authenticate("alice", "secret"));
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("secret"), "password must not be stored in clear");
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            FileCredentialStore::open(&path),
            Err(CredentialError::Parse { .. })
        ));
    }

    #[test]
    fn same_password_different_salt() {
        let a = StoredCredential::new("pw");
        let b = StoredCredential::new("pw");
        assert_ne!(a.digest, b.digest);
        assert!(a.matches("pw") && b.matches("pw"));
    }
}
