//! remote-client - run Jupyter kernels on remote hosts over SSH.
//!
//! The [`Orchestrator`] connects to a host, installs and starts the remote
//! agent, and forwards its port to `127.0.0.1`. Kernels, environment
//! variables and files are then reached through an [`AgentClient`]; kernel
//! channels use [`kernel_ws`].
//!
//! Network objects live on named background loops managed by the
//! [`dispatcher`] module. Call [`dispatcher::close_all`] once at exit.

pub mod agent;
pub mod config;
pub mod connection_file;
pub mod dispatcher;
pub mod error;
pub mod files;
mod flight;
pub mod forward;
pub mod http;
pub mod installer;
pub mod orchestrator;
pub mod secrets;
pub mod shell;
pub mod ssh;
pub mod status;

pub use agent::{AgentLifecycle, AgentState, ServerInfo};
pub use config::{AuthMethod, ConfigStore, HostConfig, KnownHostsPolicy, Platform};
pub use connection_file::ConnectionFiles;
pub use dispatcher::{AsyncDispatcher, DispatchError, DispatchFuture, Dispatched, GuiQueue};
pub use error::{ErrorKind, RemoteError, RemoteFileServicesError, RemoteOsError, Result};
pub use files::{FileData, FileEntry, FileType, OpenOptions, RemoteFile, RemoteFiles, RemotePath, Whence};
pub use forward::PortForwarder;
pub use http::{AgentClient, KernelDescriptor, KernelInfo};
pub use installer::Installer;
pub use orchestrator::Orchestrator;
pub use secrets::{KeyringSecretStore, MemorySecretStore, Secret, SecretKind, SecretStore};
pub use shell::{CommandOutput, RemoteProcess, RemoteShell, RunOptions, SessionEvent, ShellFactory};
pub use ssh::{SshFactory, SshSession};
pub use status::{ConnectionStatus, StatusEvent, StatusTracker};

/// Loop id the SSH sessions and agent services run on.
pub const REMOTE_LOOP: &str = "asyncssh";
