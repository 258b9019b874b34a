//! SSH transport built on russh.
//!
//! One [`SshSession`] holds at most one authenticated connection to a host.
//! A watchdog notices when the transport drops and reports it once.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{load_secret_key, PublicKey};
use russh::{ChannelMsg, Disconnect, Sig};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::{AuthMethod, HostConfig, KnownHostsPolicy};
use crate::error::{RemoteError, Result};
use crate::secrets::{SecretKind, SecretStore};
use crate::shell::{
    run_with_options, CommandOutput, RemoteProcess, RemoteShell, RunOptions, SessionEvent,
    ShellFactory, TunnelStream,
};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const WATCHDOG_INTERVAL: Duration = Duration::from_millis(500);
const PROCESS_EXIT_GRACE: Duration = Duration::from_secs(2);

struct ClientHandler {
    host: String,
    port: u16,
    policy: KnownHostsPolicy,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        match self.policy {
            KnownHostsPolicy::Ignore => Ok(true),
            KnownHostsPolicy::Strict => {
                match russh::keys::check_known_hosts(&self.host, self.port, server_public_key) {
                    Ok(known) => {
                        if !known {
                            warn!("[ssh] Host key for {} is not in known_hosts", self.host);
                        }
                        Ok(known)
                    }
                    Err(e) => {
                        warn!("[ssh] Host key check failed for {}: {}", self.host, e);
                        Ok(false)
                    }
                }
            }
        }
    }
}

/// Where and as whom to connect, after resolving an OpenSSH client config.
#[derive(Debug, Clone)]
struct Target {
    host: String,
    port: u16,
    user: String,
    identity_files: Vec<PathBuf>,
}

fn resolve_target(config: &HostConfig) -> Result<Target> {
    let mut target = Target {
        host: config.address.clone(),
        port: config.port,
        user: config.username.clone(),
        identity_files: config.key_path.iter().cloned().collect(),
    };

    if config.auth_method == AuthMethod::ConfigFile {
        let path = config.config_path.as_deref().ok_or_else(|| {
            RemoteError::Config(format!("host {} has no config_path", config.id))
        })?;
        let file = std::fs::File::open(path).map_err(|e| {
            RemoteError::Config(format!("cannot read ssh config {}: {}", path.display(), e))
        })?;
        let mut reader = std::io::BufReader::new(file);
        let parsed = ssh2_config::SshConfig::default()
            .parse(&mut reader, ssh2_config::ParseRule::ALLOW_UNSUPPORTED_FIELDS)
            .map_err(|e| {
                RemoteError::Config(format!("invalid ssh config {}: {}", path.display(), e))
            })?;
        let params = parsed.query(&config.address);

        if let Some(host_name) = params.host_name {
            target.host = host_name;
        }
        if let Some(port) = params.port {
            target.port = port;
        }
        if let Some(user) = params.user {
            target.user = user;
        }
        target.identity_files = params
            .identity_file
            .unwrap_or_default()
            .into_iter()
            .map(|p| expand_home(&p))
            .collect();
    }

    if target.user.is_empty() {
        target.user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .map_err(|_| RemoteError::Config(format!("host {} has no username", config.id)))?;
    }
    Ok(target)
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

struct Connection {
    handle: Arc<client::Handle<ClientHandler>>,
    lost: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    watchdog: JoinHandle<()>,
}

/// An SSH connection to one configured host.
pub struct SshSession {
    config: HostConfig,
    secrets: Arc<dyn SecretStore>,
    connect_timeout: Duration,
    connection: Mutex<Option<Connection>>,
    processes: Mutex<Vec<RemoteProcess>>,
    events: broadcast::Sender<SessionEvent>,
}

impl SshSession {
    pub fn new(config: HostConfig, secrets: Arc<dyn SecretStore>) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            config,
            secrets,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            connection: Mutex::new(None),
            processes: Mutex::new(Vec::new()),
            events,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// The live handle, or `ConnectionLost` if there is none.
    fn handle(&self) -> Result<Arc<client::Handle<ClientHandler>>> {
        let guard = self.connection.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(conn) if !conn.handle.is_closed() => Ok(conn.handle.clone()),
            Some(conn) => {
                fire_lost(
                    &conn.lost,
                    &self.events,
                    &self.config.id,
                    "transport closed",
                );
                Err(self.lost_error())
            }
            None => Err(self.lost_error()),
        }
    }

    fn lost_error(&self) -> RemoteError {
        RemoteError::ConnectionLost {
            host: self.config.address.clone(),
        }
    }

    async fn open(&self) -> Result<client::Handle<ClientHandler>> {
        self.config.validate()?;
        let target = resolve_target(&self.config)?;
        info!(
            "[ssh] Connecting to {}@{}:{}",
            target.user, target.host, target.port
        );

        let config = Arc::new(client::Config {
            keepalive_interval: Some(Duration::from_secs(15)),
            keepalive_max: 3,
            ..Default::default()
        });
        let handler = ClientHandler {
            host: target.host.clone(),
            port: target.port,
            policy: self.config.known_hosts,
        };

        let connect = client::connect(config, (target.host.as_str(), target.port), handler);
        let mut session = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| {
                RemoteError::Timeout(format!("connecting to {}:{}", target.host, target.port))
            })?
            .map_err(|e| RemoteError::connection_failed(&target.host, e))?;

        if self.authenticate(&mut session, &target).await? {
            Ok(session)
        } else {
            Err(RemoteError::AuthFailed {
                host: target.host,
                user: target.user,
                message: "all authentication methods were rejected".into(),
            })
        }
    }

    async fn authenticate(
        &self,
        session: &mut client::Handle<ClientHandler>,
        target: &Target,
    ) -> Result<bool> {
        let auth_err = |e: russh::Error| RemoteError::AuthFailed {
            host: target.host.clone(),
            user: target.user.clone(),
            message: e.to_string(),
        };

        match self.config.auth_method {
            AuthMethod::Password => {
                let password = self.secrets.require(&self.config.id, SecretKind::Password)?;
                let result = session
                    .authenticate_password(&target.user, password.expose())
                    .await
                    .map_err(auth_err)?;
                return Ok(result.success());
            }
            AuthMethod::KeyFile | AuthMethod::ConfigFile => {
                let passphrase = self.secrets.get(&self.config.id, SecretKind::Passphrase)?;
                for key_path in &target.identity_files {
                    let key = match load_secret_key(key_path, passphrase.as_ref().map(|p| p.expose())) {
                        Ok(key) => key,
                        Err(russh::keys::Error::KeyIsEncrypted) if passphrase.is_none() => {
                            return Err(RemoteError::MissingSecret {
                                name: crate::secrets::secret_name(
                                    &self.config.id,
                                    SecretKind::Passphrase,
                                ),
                            });
                        }
                        Err(e) => {
                            if self.config.auth_method == AuthMethod::KeyFile {
                                return Err(RemoteError::AuthFailed {
                                    host: target.host.clone(),
                                    user: target.user.clone(),
                                    message: format!(
                                        "cannot load key {}: {}",
                                        key_path.display(),
                                        e
                                    ),
                                });
                            }
                            debug!("[ssh] Skipping key {}: {}", key_path.display(), e);
                            continue;
                        }
                    };
                    let key = PrivateKeyWithHashAlg::new(Arc::new(key), None);
                    let result = session
                        .authenticate_publickey(&target.user, key)
                        .await
                        .map_err(auth_err)?;
                    if result.success() {
                        info!("[ssh] Authenticated with key {}", key_path.display());
                        return Ok(true);
                    }
                }
            }
        }

        self.authenticate_with_agent(session, target).await
    }

    #[cfg(unix)]
    async fn authenticate_with_agent(
        &self,
        session: &mut client::Handle<ClientHandler>,
        target: &Target,
    ) -> Result<bool> {
        use russh::keys::agent::client::AgentClient;

        let Ok(sock) = std::env::var("SSH_AUTH_SOCK") else {
            return Ok(false);
        };
        let mut agent = match AgentClient::connect_uds(&sock).await {
            Ok(agent) => agent,
            Err(e) => {
                debug!("[ssh] No usable ssh-agent at {}: {}", sock, e);
                return Ok(false);
            }
        };
        let identities = match agent.request_identities().await {
            Ok(identities) => identities,
            Err(e) => {
                debug!("[ssh] Failed to list agent identities: {}", e);
                return Ok(false);
            }
        };
        for identity in identities {
            if let Ok(result) = session
                .authenticate_publickey_with(&target.user, identity, None, &mut agent)
                .await
            {
                if result.success() {
                    info!("[ssh] Authenticated via ssh-agent");
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    #[cfg(not(unix))]
    async fn authenticate_with_agent(
        &self,
        _session: &mut client::Handle<ClientHandler>,
        _target: &Target,
    ) -> Result<bool> {
        Ok(false)
    }

    fn take_connection(&self) -> Option<Connection> {
        self.connection
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    fn tracked_processes(&self) -> Vec<RemoteProcess> {
        let mut processes = self.processes.lock().unwrap_or_else(|e| e.into_inner());
        processes.retain(|p| p.is_running());
        processes.clone()
    }

    async fn shutdown(&self, conn: Connection) {
        conn.closing.store(true, Ordering::SeqCst);
        conn.watchdog.abort();

        let processes = self.tracked_processes();
        for process in &processes {
            debug!("[ssh] Terminating `{}`", process.command());
            process.terminate();
        }
        for process in &processes {
            let _ = tokio::time::timeout(PROCESS_EXIT_GRACE, process.wait()).await;
        }
        self.processes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();

        if let Err(e) = conn
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            debug!("[ssh] Disconnect from {}: {}", self.config.address, e);
        }
    }
}

fn fire_lost(
    lost: &AtomicBool,
    events: &broadcast::Sender<SessionEvent>,
    host_id: &str,
    cause: &str,
) {
    if !lost.swap(true, Ordering::SeqCst) {
        warn!("[ssh] Connection to {} lost: {}", host_id, cause);
        let _ = events.send(SessionEvent::Lost {
            host_id: host_id.to_string(),
            cause: cause.to_string(),
        });
    }
}

impl RemoteShell for SshSession {
    fn host_id(&self) -> &str {
        &self.config.id
    }

    async fn connect(&self) -> Result<()> {
        if let Some(existing) = self.take_connection() {
            debug!("[ssh] Replacing existing session to {}", self.config.address);
            self.shutdown(existing).await;
        }

        let session = match self.open().await {
            Ok(session) => session,
            Err(e) => {
                warn!("[ssh] Connection to {} failed: {}", self.config.address, e);
                self.emit(SessionEvent::Lost {
                    host_id: self.config.id.clone(),
                    cause: e.to_string(),
                });
                return Err(e);
            }
        };

        let handle = Arc::new(session);
        let lost = Arc::new(AtomicBool::new(false));
        let closing = Arc::new(AtomicBool::new(false));
        let watchdog = tokio::spawn({
            let handle = handle.clone();
            let lost = lost.clone();
            let closing = closing.clone();
            let events = self.events.clone();
            let host_id = self.config.id.clone();
            async move {
                let mut tick = tokio::time::interval(WATCHDOG_INTERVAL);
                loop {
                    tick.tick().await;
                    if handle.is_closed() {
                        if !closing.load(Ordering::SeqCst) {
                            fire_lost(&lost, &events, &host_id, "transport closed");
                        }
                        break;
                    }
                }
            }
        });

        *self.connection.lock().unwrap_or_else(|e| e.into_inner()) = Some(Connection {
            handle,
            lost,
            closing,
            watchdog,
        });
        info!("[ssh] Connected to {}", self.config.display_target());
        self.emit(SessionEvent::Established {
            host_id: self.config.id.clone(),
        });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|c| !c.handle.is_closed())
    }

    async fn run(&self, command: &str, options: RunOptions) -> Result<CommandOutput> {
        let handle = self.handle()?;
        debug!("[ssh] Running `{}`", command);
        run_with_options(command, options, async {
            let mut channel = handle
                .channel_open_session()
                .await
                .map_err(|e| self.channel_error(e))?;
            channel
                .exec(true, command)
                .await
                .map_err(|e| self.channel_error(e))?;

            let mut output = CommandOutput::default();
            loop {
                match channel.wait().await {
                    Some(ChannelMsg::Data { data }) => {
                        output.stdout.push_str(&String::from_utf8_lossy(&data));
                    }
                    Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                        output.stderr.push_str(&String::from_utf8_lossy(&data));
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        output.exit_code = Some(exit_status);
                    }
                    Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                }
            }
            Ok(output)
        })
        .await
    }

    async fn create_process(&self, command: &str) -> Result<RemoteProcess> {
        let handle = self.handle()?;
        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| self.channel_error(e))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| self.channel_error(e))?;
        info!("[ssh] Started `{}` on {}", command, self.config.address);

        let (process, mut control) = RemoteProcess::pair(command);
        tokio::spawn(async move {
            let mut exit_code = None;
            loop {
                tokio::select! {
                    msg = channel.wait() => match msg {
                        Some(ChannelMsg::Data { data }) => control.push_stdout(&data),
                        Some(ChannelMsg::ExtendedData { data, ext: 1 }) => control.push_stderr(&data),
                        Some(ChannelMsg::ExitStatus { exit_status }) => exit_code = Some(exit_status),
                        Some(ChannelMsg::Close) | None => break,
                        Some(_) => {}
                    },
                    _ = control.terminate_requested() => {
                        let _ = channel.signal(Sig::TERM).await;
                        let _ = channel.close().await;
                        break;
                    }
                }
            }
            control.finish(exit_code);
        });

        self.processes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(process.clone());
        Ok(process)
    }

    async fn open_direct_tcpip(&self, host: &str, port: u16) -> Result<TunnelStream> {
        let handle = self.handle()?;
        let channel = handle
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await
            .map_err(|e| self.channel_error(e))?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn close(&self) -> Result<()> {
        if let Some(conn) = self.take_connection() {
            info!("[ssh] Closing connection to {}", self.config.address);
            self.shutdown(conn).await;
        }
        self.emit(SessionEvent::Closed {
            host_id: self.config.id.clone(),
        });
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

impl SshSession {
    fn channel_error(&self, error: russh::Error) -> RemoteError {
        let guard = self.connection.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(conn) if conn.handle.is_closed() => {
                fire_lost(&conn.lost, &self.events, &self.config.id, &error.to_string());
                self.lost_error()
            }
            _ => RemoteError::connection_failed(&self.config.address, error),
        }
    }
}

/// Builds [`SshSession`]s sharing one secret store.
pub struct SshFactory {
    secrets: Arc<dyn SecretStore>,
    connect_timeout: Duration,
}

impl SshFactory {
    pub fn new(secrets: Arc<dyn SecretStore>) -> Self {
        Self {
            secrets,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl ShellFactory for SshFactory {
    type Shell = SshSession;

    fn create(&self, host: &HostConfig) -> Result<Arc<SshSession>> {
        host.validate()?;
        Ok(Arc::new(
            SshSession::new(host.clone(), self.secrets.clone())
                .with_connect_timeout(self.connect_timeout),
        ))
    }
}
