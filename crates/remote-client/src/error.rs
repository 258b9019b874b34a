//! Error taxonomy for remote hosts, the agent and its services.
//!
//! Every variant renders as a short sentence fit for a status line. The
//! longer remote tracebacks stay in [`RemoteError::tracebacks`].

use std::fmt;

use kernel_ws::KernelWsError;
use serde::{Deserialize, Serialize};

use crate::dispatcher::DispatchError;

pub type Result<T, E = RemoteError> = std::result::Result<T, E>;

/// An `OSError` raised by the agent, relayed with its original `errno`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteOsError {
    pub errno: i32,
    pub strerror: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub url: String,
}

impl fmt::Display for RemoteOsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.filename {
            Some(filename) => write!(f, "[Errno {}] {}: '{}'", self.errno, self.strerror, filename),
            None => write!(f, "[Errno {}] {}", self.errno, self.strerror),
        }
    }
}

impl std::error::Error for RemoteOsError {}

impl RemoteOsError {
    /// Parse the `{errno, strerror, filename}` body the agent sends with a
    /// 417 or 423 status. Missing fields degrade to neutral values.
    pub fn from_json(body: &serde_json::Value, url: impl Into<String>) -> Self {
        Self {
            errno: body
                .get("errno")
                .and_then(|v| v.as_i64())
                .and_then(|v| i32::try_from(v).ok())
                .unwrap_or(0),
            strerror: body
                .get("strerror")
                .and_then(|v| v.as_str())
                .or_else(|| body.get("message").and_then(|v| v.as_str()))
                .unwrap_or("Unknown error")
                .to_string(),
            filename: body
                .get("filename")
                .and_then(|v| v.as_str())
                .map(String::from),
            url: url.into(),
        }
    }
}

/// A failure inside the agent's file services that is not an OS error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("(type='{error_type}', message='{message}', url='{url}')")]
pub struct RemoteFileServicesError {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub tracebacks: Vec<String>,
}

impl RemoteFileServicesError {
    pub fn from_json(body: &serde_json::Value, url: impl Into<String>) -> Self {
        Self {
            error_type: body
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or("UnknownError")
                .to_string(),
            message: body
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("Unknown error")
                .to_string(),
            url: url.into(),
            tracebacks: body
                .get("tracebacks")
                .and_then(|v| v.as_array())
                .map(|lines| {
                    lines
                        .iter()
                        .filter_map(|l| l.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("Could not connect to {host}: {message}")]
    ConnectionFailed {
        host: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("The connection to {host} was lost")]
    ConnectionLost { host: String },

    #[error("Authentication failed for {user}@{host}: {message}")]
    AuthFailed {
        host: String,
        user: String,
        message: String,
    },

    #[error("There was an error installing the remote server: {stderr}")]
    InstallFailed { stderr: String },

    #[error("Cannot install the remote server on {platform} automatically")]
    UnsupportedPlatform { platform: String },

    #[error("Remote server version {found} is not supported (expected < {max})")]
    VersionMismatch { found: String, max: String },

    #[error("Error starting the remote server: {0}")]
    AgentStartFailed(String),

    #[error("Remote command `{command}` failed with exit code {exit_code:?}")]
    ProcessError {
        command: String,
        stderr: String,
        exit_code: Option<u32>,
    },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Message exceeds the maximum size of {limit} bytes")]
    MessageTooBig { limit: usize },

    #[error("{0}")]
    RemoteOs(#[from] RemoteOsError),

    #[error("Remote file services error {0}")]
    RemoteFileServices(#[from] RemoteFileServicesError),

    #[error("Remote service error {status} for {url}: {message}")]
    RemoteService {
        status: u16,
        url: String,
        message: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0} is not supported by the remote file API")]
    NotSupported(String),

    #[error("Secret {name} is not available")]
    MissingSecret { name: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Fieldless discriminant of [`RemoteError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConnectionFailed,
    ConnectionLost,
    AuthFailed,
    InstallFailed,
    UnsupportedPlatform,
    VersionMismatch,
    AgentStartFailed,
    ProcessError,
    Timeout,
    Protocol,
    MessageTooBig,
    RemoteOs,
    RemoteFileServices,
    RemoteService,
    NotFound,
    TypeMismatch,
    InvalidArgument,
    NotSupported,
    Config,
    Other,
}

impl ErrorKind {
    /// Process exit code used by the host tool when run non-interactively.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::ConnectionFailed | ErrorKind::ConnectionLost => 10,
            ErrorKind::AuthFailed => 11,
            ErrorKind::InstallFailed => 12,
            ErrorKind::UnsupportedPlatform => 13,
            ErrorKind::VersionMismatch => 14,
            ErrorKind::AgentStartFailed => 15,
            ErrorKind::ProcessError => 16,
            ErrorKind::Timeout => 17,
            ErrorKind::Protocol | ErrorKind::MessageTooBig => 18,
            ErrorKind::RemoteOs => 19,
            ErrorKind::RemoteFileServices => 20,
            ErrorKind::RemoteService | ErrorKind::NotFound => 21,
            ErrorKind::TypeMismatch | ErrorKind::InvalidArgument | ErrorKind::NotSupported => 22,
            ErrorKind::Config | ErrorKind::Other => 1,
        }
    }
}

impl RemoteError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RemoteError::ConnectionFailed { .. } => ErrorKind::ConnectionFailed,
            RemoteError::ConnectionLost { .. } => ErrorKind::ConnectionLost,
            RemoteError::AuthFailed { .. } => ErrorKind::AuthFailed,
            RemoteError::InstallFailed { .. } => ErrorKind::InstallFailed,
            RemoteError::UnsupportedPlatform { .. } => ErrorKind::UnsupportedPlatform,
            RemoteError::VersionMismatch { .. } => ErrorKind::VersionMismatch,
            RemoteError::AgentStartFailed(_) => ErrorKind::AgentStartFailed,
            RemoteError::ProcessError { .. } => ErrorKind::ProcessError,
            RemoteError::Timeout(_) => ErrorKind::Timeout,
            RemoteError::Protocol(_) | RemoteError::Json(_) => ErrorKind::Protocol,
            RemoteError::MessageTooBig { .. } => ErrorKind::MessageTooBig,
            RemoteError::RemoteOs(_) => ErrorKind::RemoteOs,
            RemoteError::RemoteFileServices(_) => ErrorKind::RemoteFileServices,
            RemoteError::RemoteService { .. } => ErrorKind::RemoteService,
            RemoteError::NotFound(_) => ErrorKind::NotFound,
            RemoteError::TypeMismatch(_) => ErrorKind::TypeMismatch,
            RemoteError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            RemoteError::NotSupported(_) => ErrorKind::NotSupported,
            RemoteError::MissingSecret { .. } | RemoteError::Config(_) => ErrorKind::Config,
            RemoteError::Dispatch(DispatchError::TypeMismatch(_)) => ErrorKind::TypeMismatch,
            RemoteError::Dispatch(_) | RemoteError::Io(_) => ErrorKind::Other,
        }
    }

    /// Remote traceback lines for a diagnostics pane, if the agent sent any.
    pub fn tracebacks(&self) -> &[String] {
        match self {
            RemoteError::RemoteFileServices(e) => &e.tracebacks,
            _ => &[],
        }
    }

    /// The POSIX errno of a relayed remote OS error.
    pub fn errno(&self) -> Option<i32> {
        match self {
            RemoteError::RemoteOs(e) => Some(e.errno),
            _ => None,
        }
    }

    pub fn connection_failed(
        host: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        RemoteError::ConnectionFailed {
            host: host.into(),
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// A copy for a second observer of the same failure. Source chains and
    /// foreign error values are flattened to their messages.
    pub fn duplicate(&self) -> RemoteError {
        match self {
            RemoteError::ConnectionFailed { host, message, .. } => RemoteError::ConnectionFailed {
                host: host.clone(),
                message: message.clone(),
                source: None,
            },
            RemoteError::ConnectionLost { host } => RemoteError::ConnectionLost { host: host.clone() },
            RemoteError::AuthFailed {
                host,
                user,
                message,
            } => RemoteError::AuthFailed {
                host: host.clone(),
                user: user.clone(),
                message: message.clone(),
            },
            RemoteError::InstallFailed { stderr } => RemoteError::InstallFailed {
                stderr: stderr.clone(),
            },
            RemoteError::UnsupportedPlatform { platform } => RemoteError::UnsupportedPlatform {
                platform: platform.clone(),
            },
            RemoteError::VersionMismatch { found, max } => RemoteError::VersionMismatch {
                found: found.clone(),
                max: max.clone(),
            },
            RemoteError::AgentStartFailed(m) => RemoteError::AgentStartFailed(m.clone()),
            RemoteError::ProcessError {
                command,
                stderr,
                exit_code,
            } => RemoteError::ProcessError {
                command: command.clone(),
                stderr: stderr.clone(),
                exit_code: *exit_code,
            },
            RemoteError::Timeout(m) => RemoteError::Timeout(m.clone()),
            RemoteError::Protocol(m) => RemoteError::Protocol(m.clone()),
            RemoteError::MessageTooBig { limit } => RemoteError::MessageTooBig { limit: *limit },
            RemoteError::RemoteOs(e) => RemoteError::RemoteOs(e.clone()),
            RemoteError::RemoteFileServices(e) => RemoteError::RemoteFileServices(e.clone()),
            RemoteError::RemoteService {
                status,
                url,
                message,
            } => RemoteError::RemoteService {
                status: *status,
                url: url.clone(),
                message: message.clone(),
            },
            RemoteError::NotFound(m) => RemoteError::NotFound(m.clone()),
            RemoteError::TypeMismatch(m) => RemoteError::TypeMismatch(m.clone()),
            RemoteError::InvalidArgument(m) => RemoteError::InvalidArgument(m.clone()),
            RemoteError::NotSupported(m) => RemoteError::NotSupported(m.clone()),
            RemoteError::MissingSecret { name } => RemoteError::MissingSecret { name: name.clone() },
            RemoteError::Config(m) => RemoteError::Config(m.clone()),
            RemoteError::Dispatch(e) => RemoteError::Dispatch(e.clone()),
            RemoteError::Io(e) => RemoteError::Io(std::io::Error::new(e.kind(), e.to_string())),
            RemoteError::Json(e) => RemoteError::Protocol(e.to_string()),
        }
    }

    pub(crate) fn http(url: &str, error: reqwest::Error) -> Self {
        if error.is_timeout() {
            return RemoteError::Timeout(format!("request to {}", url));
        }
        if error.is_connect() {
            return RemoteError::ConnectionFailed {
                host: url.to_string(),
                message: error.to_string(),
                source: Some(Box::new(error)),
            };
        }
        if error.is_decode() {
            return RemoteError::Protocol(format!("invalid response from {}: {}", url, error));
        }
        RemoteError::RemoteService {
            status: error.status().map(|s| s.as_u16()).unwrap_or(0),
            url: url.to_string(),
            message: error.to_string(),
        }
    }
}

impl From<KernelWsError> for RemoteError {
    fn from(error: KernelWsError) -> Self {
        match error {
            KernelWsError::MessageTooBig { limit } => RemoteError::MessageTooBig { limit },
            KernelWsError::InvalidArgument(msg) => RemoteError::InvalidArgument(msg),
            KernelWsError::Timeout(what) => RemoteError::Timeout(what),
            KernelWsError::NotConnected => RemoteError::Protocol("socket is not connected".into()),
            other => RemoteError::Protocol(other.to_string()),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RemoteError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::error::CapacityError;
        use tokio_tungstenite::tungstenite::Error as WsError;
        match error {
            WsError::Capacity(CapacityError::MessageTooLong { max_size, .. }) => {
                RemoteError::MessageTooBig { limit: max_size }
            }
            WsError::Io(e) => RemoteError::Io(e),
            other => RemoteError::Protocol(other.to_string()),
        }
    }
}
