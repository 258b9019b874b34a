//! Secret storage for host passwords and key passphrases.
//!
//! Secrets are keyed `{host_id}/password` or `{host_id}/passphrase` and never
//! leave the store except to authenticate. Errors name the key only.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use log::debug;

use crate::error::{RemoteError, Result};

pub const KEYRING_SERVICE: &str = "runt-remote";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecretKind {
    Password,
    Passphrase,
}

impl SecretKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecretKind::Password => "password",
            SecretKind::Passphrase => "passphrase",
        }
    }
}

/// Store key for a host's secret.
pub fn secret_name(host_id: &str, kind: SecretKind) -> String {
    format!("{}/{}", host_id, kind.as_str())
}

/// A secret value. `Debug` is redacted and there is no `Display`.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

pub trait SecretStore: Send + Sync {
    fn get(&self, host_id: &str, kind: SecretKind) -> Result<Option<Secret>>;

    fn set(&self, host_id: &str, kind: SecretKind, secret: &Secret) -> Result<()>;

    /// Remove a secret. Deleting a missing secret succeeds.
    fn delete(&self, host_id: &str, kind: SecretKind) -> Result<()>;

    fn require(&self, host_id: &str, kind: SecretKind) -> Result<Secret> {
        self.get(host_id, kind)?
            .ok_or_else(|| RemoteError::MissingSecret {
                name: secret_name(host_id, kind),
            })
    }

    fn delete_all(&self, host_id: &str) -> Result<()> {
        self.delete(host_id, SecretKind::Password)?;
        self.delete(host_id, SecretKind::Passphrase)
    }
}

/// Secrets in the OS credential store.
pub struct KeyringSecretStore {
    service: String,
}

impl Default for KeyringSecretStore {
    fn default() -> Self {
        Self::new(KEYRING_SERVICE)
    }
}

impl KeyringSecretStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, name: &str) -> Result<keyring::Entry> {
        keyring::Entry::new(&self.service, name).map_err(|e| keyring_error(name, e))
    }
}

fn keyring_error(name: &str, error: keyring::Error) -> RemoteError {
    RemoteError::Config(format!("credential store failed for {}: {}", name, error))
}

impl SecretStore for KeyringSecretStore {
    fn get(&self, host_id: &str, kind: SecretKind) -> Result<Option<Secret>> {
        let name = secret_name(host_id, kind);
        match self.entry(&name)?.get_password() {
            Ok(value) => Ok(Some(Secret(value))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(keyring_error(&name, e)),
        }
    }

    fn set(&self, host_id: &str, kind: SecretKind, secret: &Secret) -> Result<()> {
        let name = secret_name(host_id, kind);
        self.entry(&name)?
            .set_password(secret.expose())
            .map_err(|e| keyring_error(&name, e))?;
        debug!("[secrets] Stored {}", name);
        Ok(())
    }

    fn delete(&self, host_id: &str, kind: SecretKind) -> Result<()> {
        let name = secret_name(host_id, kind);
        match self.entry(&name)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(keyring_error(&name, e)),
        }
    }
}

/// In-process secrets for tests and headless runs.
#[derive(Default)]
pub struct MemorySecretStore {
    entries: Mutex<HashMap<String, Secret>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, host_id: &str, kind: SecretKind) -> Result<Option<Secret>> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&secret_name(host_id, kind))
            .cloned())
    }

    fn set(&self, host_id: &str, kind: SecretKind, secret: &Secret) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(secret_name(host_id, kind), secret.clone());
        Ok(())
    }

    fn delete(&self, host_id: &str, kind: SecretKind) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&secret_name(host_id, kind));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{:?}", secret), "Secret(***)");
        assert_eq!(format!("{:?}", Some(secret)), "Some(Secret(***))");
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemorySecretStore::new();
        assert!(store.get("h", SecretKind::Password).unwrap().is_none());

        store.set("h", SecretKind::Password, &Secret::new("pw")).unwrap();
        assert_eq!(
            store.require("h", SecretKind::Password).unwrap().expose(),
            "pw"
        );
        assert!(store.get("h", SecretKind::Passphrase).unwrap().is_none());

        store.delete_all("h").unwrap();
        assert!(store.get("h", SecretKind::Password).unwrap().is_none());
    }

    #[test]
    fn test_require_names_secret_not_value() {
        let store = MemorySecretStore::new();
        let err = store.require("host-1", SecretKind::Passphrase).unwrap_err();
        assert_eq!(err.to_string(), "Secret host-1/passphrase is not available");
    }
}
