//! Host configuration and its on-disk store.
//!
//! Only non-secret fields live here. Passwords and passphrases go through
//! [`crate::secrets::SecretStore`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{RemoteError, Result};
use crate::status::ConnectionStatus;

pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default location of the host store.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("runt")
        .join("remote-hosts.json")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Password,
    KeyFile,
    ConfigFile,
}

impl FromStr for AuthMethod {
    type Err = RemoteError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "password" => Ok(AuthMethod::Password),
            "key_file" | "key-file" => Ok(AuthMethod::KeyFile),
            "config_file" | "config-file" => Ok(AuthMethod::ConfigFile),
            other => Err(RemoteError::InvalidArgument(format!(
                "unknown auth method '{}'",
                other
            ))),
        }
    }
}

/// Platform tag used to choose installer commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    #[default]
    Linux,
    Windows,
    Macos,
    Other,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::Windows => "windows",
            Platform::Macos => "macos",
            Platform::Other => "other",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = RemoteError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "linux" => Ok(Platform::Linux),
            "windows" => Ok(Platform::Windows),
            "macos" | "darwin" => Ok(Platform::Macos),
            "other" => Ok(Platform::Other),
            other => Err(RemoteError::InvalidArgument(format!(
                "unknown platform '{}'",
                other
            ))),
        }
    }
}

/// How the SSH client treats server host keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnownHostsPolicy {
    /// Accept any host key.
    #[default]
    Ignore,
    /// Require a matching entry in the user's known_hosts file.
    Strict,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    pub id: String,
    pub name: String,
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    pub auth_method: AuthMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<PathBuf>,
    #[serde(default)]
    pub platform: Platform,
    #[serde(default)]
    pub known_hosts: KnownHostsPolicy,
    #[serde(default)]
    pub status: ConnectionStatus,
    #[serde(default)]
    pub status_message: String,
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

impl HostConfig {
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        username: impl Into<String>,
        auth_method: AuthMethod,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            address: address.into(),
            port: DEFAULT_SSH_PORT,
            username: username.into(),
            auth_method,
            key_path: None,
            config_path: None,
            platform: Platform::default(),
            known_hosts: KnownHostsPolicy::default(),
            status: ConnectionStatus::Inactive,
            status_message: String::new(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(path.into());
        self
    }

    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_known_hosts(mut self, policy: KnownHostsPolicy) -> Self {
        self.known_hosts = policy;
        self
    }

    /// Check the mode-dependent fields are present.
    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(RemoteError::Config(format!("host {} has no address", self.id)));
        }
        match self.auth_method {
            AuthMethod::Password | AuthMethod::KeyFile if self.username.trim().is_empty() => {
                Err(RemoteError::Config(format!("host {} has no username", self.id)))
            }
            AuthMethod::KeyFile if self.key_path.is_none() => Err(RemoteError::Config(format!(
                "host {} uses key file auth but has no key_path",
                self.id
            ))),
            AuthMethod::ConfigFile if self.config_path.is_none() => {
                Err(RemoteError::Config(format!(
                    "host {} uses config file auth but has no config_path",
                    self.id
                )))
            }
            _ => Ok(()),
        }
    }

    /// `user@address:port`, for log lines.
    pub fn display_target(&self) -> String {
        if self.username.is_empty() {
            format!("{}:{}", self.address, self.port)
        } else {
            format!("{}@{}:{}", self.username, self.address, self.port)
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredHosts {
    #[serde(default)]
    hosts: BTreeMap<String, HostConfig>,
}

/// JSON-backed host store. Every mutation rewrites the file atomically.
pub struct ConfigStore {
    path: PathBuf,
    hosts: Mutex<BTreeMap<String, HostConfig>>,
}

impl ConfigStore {
    /// Load the store at `path`. A missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let hosts = match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let stored: StoredHosts = serde_json::from_str(&contents).map_err(|e| {
                    RemoteError::Config(format!("invalid host store {}: {}", path.display(), e))
                })?;
                stored.hosts
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!("[config] Loaded {} host(s) from {}", hosts.len(), path.display());
        Ok(Self {
            path,
            hosts: Mutex::new(hosts),
        })
    }

    pub fn open_default() -> Result<Self> {
        Self::open(default_config_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn hosts(&self) -> Vec<HostConfig> {
        self.lock().values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<HostConfig> {
        self.lock().get(id).cloned()
    }

    /// Look a host up by id, falling back to its display name.
    pub fn find(&self, id_or_name: &str) -> Option<HostConfig> {
        let hosts = self.lock();
        hosts
            .get(id_or_name)
            .or_else(|| hosts.values().find(|h| h.name == id_or_name))
            .cloned()
    }

    pub fn upsert(&self, host: HostConfig) -> Result<()> {
        host.validate()?;
        let mut hosts = self.lock();
        info!("[config] Saving host {} ({})", host.name, host.id);
        hosts.insert(host.id.clone(), host);
        self.save(&hosts)
    }

    pub fn remove(&self, id: &str) -> Result<Option<HostConfig>> {
        let mut hosts = self.lock();
        let removed = hosts.remove(id);
        if removed.is_some() {
            self.save(&hosts)?;
        }
        Ok(removed)
    }

    /// Persist a status change. Unknown ids are ignored.
    pub fn set_status(&self, id: &str, status: ConnectionStatus, message: &str) -> Result<()> {
        let mut hosts = self.lock();
        let Some(host) = hosts.get_mut(id) else {
            return Ok(());
        };
        if host.status == status && host.status_message == message {
            return Ok(());
        }
        host.status = status;
        host.status_message = message.to_string();
        self.save(&hosts)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, HostConfig>> {
        self.hosts.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn save(&self, hosts: &BTreeMap<String, HostConfig>) -> Result<()> {
        let dir = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&dir)?;

        let stored = StoredHosts {
            hosts: hosts.clone(),
        };
        let contents = serde_json::to_vec_pretty(&stored)?;

        let tmp = dir.join(format!(".tmp.{}", uuid::Uuid::new_v4()));
        if let Err(e) = std::fs::write(&tmp, &contents) {
            std::fs::remove_file(&tmp).ok();
            return Err(e.into());
        }
        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            warn!("[config] Failed to replace {}: {}", self.path.display(), e);
            std::fs::remove_file(&tmp).ok();
            return Err(e.into());
        }
        Ok(())
    }
}
