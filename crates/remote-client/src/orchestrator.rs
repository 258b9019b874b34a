//! One facade per process that turns a host id into a reachable agent.
//!
//! `ensure_server` walks connect, install, start and forward for a host and
//! reports every step through the [`StatusTracker`]. Each step is
//! idempotent, so calling it again on a healthy host only returns the
//! cached client.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kernel_ws::{ClientEvent, KernelWsClient};
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::agent::{AgentLifecycle, ServerInfo, DEFAULT_START_RETRIES, DEFAULT_START_RETRY_DELAY};
use crate::config::{ConfigStore, HostConfig};
use crate::connection_file::ConnectionFiles;
use crate::error::{RemoteError, Result};
use crate::forward::PortForwarder;
use crate::http::{AgentClient, KernelDescriptor};
use crate::installer::Installer;
use crate::shell::{RemoteShell, SessionEvent, ShellFactory};
use crate::status::{
    ConnectionStatus, StatusEvent, StatusTracker, MSG_ACTIVE, MSG_CLOSED, MSG_CONNECTED,
    MSG_CONNECTING, MSG_LOST, MSG_STARTING, MSG_STOPPING,
};

pub const DEFAULT_KERNEL_CREATE_RETRIES: u32 = 5;
pub const DEFAULT_KERNEL_CREATE_DELAY: Duration = Duration::from_secs(1);

/// A local port forwarded to the agent described by `info`.
struct Forwarded {
    forwarder: PortForwarder,
    info: ServerInfo,
    client: AgentClient,
}

type ForwardSlot = Arc<AsyncMutex<Option<Forwarded>>>;

struct HostEntry<S: RemoteShell> {
    config: HostConfig,
    shell: Arc<S>,
    installer: Installer<S>,
    agent: Arc<AgentLifecycle<S>>,
    forward: ForwardSlot,
    /// Serializes ensure/stop/close for the host.
    guard: AsyncMutex<()>,
    established: Arc<AtomicBool>,
    watcher: JoinHandle<()>,
}

impl<S: RemoteShell> Drop for HostEntry<S> {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

/// Composes SSH, installer, agent lifecycle and forwarding per host.
pub struct Orchestrator<F: ShellFactory> {
    factory: F,
    store: Arc<ConfigStore>,
    status: StatusTracker,
    connection_files: ConnectionFiles,
    kernel_create_retries: u32,
    kernel_create_delay: Duration,
    agent_start_retries: u32,
    agent_start_delay: Duration,
    agent_stop_grace: Option<Duration>,
    hosts: Mutex<HashMap<String, Arc<HostEntry<F::Shell>>>>,
}

impl<F: ShellFactory> Orchestrator<F> {
    pub fn new(factory: F, store: Arc<ConfigStore>) -> Self {
        Self {
            factory,
            status: StatusTracker::new(Some(store.clone())),
            store,
            connection_files: ConnectionFiles::default(),
            kernel_create_retries: DEFAULT_KERNEL_CREATE_RETRIES,
            kernel_create_delay: DEFAULT_KERNEL_CREATE_DELAY,
            agent_start_retries: DEFAULT_START_RETRIES,
            agent_start_delay: DEFAULT_START_RETRY_DELAY,
            agent_stop_grace: None,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_connection_files(mut self, files: ConnectionFiles) -> Self {
        self.connection_files = files;
        self
    }

    pub fn with_kernel_create_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.kernel_create_retries = retries.max(1);
        self.kernel_create_delay = delay;
        self
    }

    pub fn with_agent_start_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.agent_start_retries = retries;
        self.agent_start_delay = delay;
        self
    }

    pub fn with_agent_stop_grace(mut self, grace: Duration) -> Self {
        self.agent_stop_grace = Some(grace);
        self
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    pub fn status(&self) -> &StatusTracker {
        &self.status
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.status.subscribe()
    }

    pub fn connection_files(&self) -> &ConnectionFiles {
        &self.connection_files
    }

    fn existing(&self, host_id: &str) -> Option<Arc<HostEntry<F::Shell>>> {
        let hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        match self.store.find(host_id) {
            Some(config) => hosts.get(&config.id).cloned(),
            None => hosts.get(host_id).cloned(),
        }
    }

    fn entry(&self, host_id: &str) -> Result<Arc<HostEntry<F::Shell>>> {
        let config = self
            .store
            .find(host_id)
            .ok_or_else(|| RemoteError::Config(format!("unknown host '{}'", host_id)))?;

        let mut hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = hosts.get(&config.id) {
            return Ok(entry.clone());
        }

        let shell = self.factory.create(&config)?;
        let mut agent = AgentLifecycle::new(shell.clone(), config.platform)
            .with_start_retries(self.agent_start_retries, self.agent_start_delay);
        if let Some(grace) = self.agent_stop_grace {
            agent = agent.with_stop_grace(grace);
        }
        let agent = Arc::new(agent);
        let forward: ForwardSlot = Arc::new(AsyncMutex::new(None));
        let established = Arc::new(AtomicBool::new(false));

        let watcher = tokio::spawn(watch_session(
            config.id.clone(),
            shell.events(),
            established.clone(),
            agent.clone(),
            forward.clone(),
            self.status.clone(),
        ));

        let entry = Arc::new(HostEntry {
            installer: Installer::new(shell.clone(), config.platform),
            config,
            shell,
            agent,
            forward,
            guard: AsyncMutex::new(()),
            established,
            watcher,
        });
        hosts.insert(entry.config.id.clone(), entry.clone());
        Ok(entry)
    }

    /// Connect, install if missing, start the agent and forward its port.
    /// On failure the host moves to `error` with the failing step's message.
    pub async fn ensure_server(&self, host_id: &str) -> Result<AgentClient> {
        let entry = match self.entry(host_id) {
            Ok(entry) => entry,
            Err(e) => {
                if self.store.get(host_id).is_some() {
                    self.status
                        .emit(host_id, ConnectionStatus::Error, e.to_string());
                }
                return Err(e);
            }
        };
        let _guard = entry.guard.lock().await;
        match self.ensure_server_locked(&entry).await {
            Ok(client) => Ok(client),
            Err(e) => {
                error!("[orchestrator] {} failed: {}", entry.config.display_target(), e);
                self.status
                    .emit(&entry.config.id, ConnectionStatus::Error, e.to_string());
                Err(e)
            }
        }
    }

    async fn ensure_server_locked(&self, entry: &HostEntry<F::Shell>) -> Result<AgentClient> {
        let id = entry.config.id.as_str();

        if entry.shell.is_connected() {
            let forwarded = entry.forward.lock().await;
            if let Some(forwarded) = forwarded.as_ref() {
                if forwarded.forwarder.is_running()
                    && entry.agent.server_info().as_ref() == Some(&forwarded.info)
                {
                    return Ok(forwarded.client.clone());
                }
            }
        } else {
            self.status
                .emit(id, ConnectionStatus::Connecting, MSG_CONNECTING);
            entry.agent.forget();
            close_forward(&entry.forward).await;
            entry.shell.connect().await?;
            entry.established.store(true, Ordering::SeqCst);
            self.status
                .emit(id, ConnectionStatus::Connected, MSG_CONNECTED);
        }

        self.status.emit(id, ConnectionStatus::Starting, MSG_STARTING);
        let version = entry.installer.ensure_installed().await?;
        debug!("[orchestrator] {} runs server {}", id, version);

        let info = entry.agent.start().await?;
        let client = self.forward(entry, &info, false).await?;

        self.status.emit(id, ConnectionStatus::Active, MSG_ACTIVE);
        Ok(client)
    }

    /// Reuse the forward for `info` unless `fresh`; a changed agent always
    /// gets a new local port. The new port is bound before the old one is
    /// released so the two never coincide.
    async fn forward(
        &self,
        entry: &HostEntry<F::Shell>,
        info: &ServerInfo,
        fresh: bool,
    ) -> Result<AgentClient> {
        let mut slot = entry.forward.lock().await;
        if let Some(current) = slot.as_ref() {
            if !fresh && current.info == *info && current.forwarder.is_running() {
                return Ok(current.client.clone());
            }
        }

        let forwarder = PortForwarder::start(entry.shell.clone(), &info.hostname, info.port).await?;
        let client = AgentClient::new(forwarder.url(), info.token.clone())?;
        let previous = slot.replace(Forwarded {
            forwarder,
            info: info.clone(),
            client: client.clone(),
        });
        if let Some(old) = previous {
            debug!(
                "[orchestrator] Dropping forward on local port {}",
                old.forwarder.local_port()
            );
            old.forwarder.close().await;
        }
        Ok(client)
    }

    /// Client for a host that is already up, or bring it up.
    pub async fn agent_client(&self, host_id: &str) -> Result<AgentClient> {
        if let Some(entry) = self.existing(host_id) {
            if entry.shell.is_connected() {
                if let Some(forwarded) = entry.forward.lock().await.as_ref() {
                    if forwarded.forwarder.is_running() {
                        return Ok(forwarded.client.clone());
                    }
                }
            }
        }
        self.ensure_server(host_id).await
    }

    /// Bring the host up, then start a kernel and materialize its
    /// connection file.
    pub async fn start_new_kernel_ensure_server(&self, host_id: &str) -> Result<KernelDescriptor> {
        let client = self.ensure_server(host_id).await?;

        let mut last_error = None;
        for attempt in 1..=self.kernel_create_retries {
            match client.kernels().create().await {
                Ok(descriptor) => {
                    let path = self.write_connection_file(host_id, &descriptor).await?;
                    info!(
                        "[orchestrator] Kernel {} on {} (connection file {})",
                        descriptor.id,
                        host_id,
                        path.display()
                    );
                    return Ok(descriptor);
                }
                Err(e) => {
                    warn!(
                        "[orchestrator] Kernel start failed (attempt {}/{}): {}",
                        attempt, self.kernel_create_retries, e
                    );
                    last_error = Some(e);
                    if attempt < self.kernel_create_retries {
                        tokio::time::sleep(self.kernel_create_delay).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            RemoteError::Protocol("kernel creation was not attempted".into())
        }))
    }

    async fn write_connection_file(
        &self,
        host_id: &str,
        descriptor: &KernelDescriptor,
    ) -> Result<PathBuf> {
        let id = self
            .store
            .find(host_id)
            .map(|c| c.id)
            .unwrap_or_else(|| host_id.to_string());
        self.connection_files.write(&id, descriptor).await
    }

    /// A kernel channel client for `kernel_id`, pointed at the forwarded
    /// agent. Channels are not started.
    pub async fn kernel_client(&self, host_id: &str, kernel_id: &str) -> Result<KernelWsClient> {
        let client = self.agent_client(host_id).await?;
        Ok(KernelWsClient::new(client.base_url(), kernel_id).with_token(client.token()))
    }

    /// Recover after the heartbeat reported the kernel dead.
    ///
    /// `ensure_server` gets one retry. The agent port is then forwarded to a
    /// fresh local port before the kernel is looked up again, and the
    /// connection file is rewritten.
    pub async fn recover_kernel(&self, host_id: &str, kernel_id: &str) -> Result<KernelDescriptor> {
        if let Err(e) = self.ensure_server(host_id).await {
            warn!("[orchestrator] Recovering {} failed once: {}", host_id, e);
            self.ensure_server(host_id).await?;
        }

        let entry = self.entry(host_id)?;
        let client = {
            let _guard = entry.guard.lock().await;
            let info = entry
                .agent
                .server_info()
                .ok_or_else(|| RemoteError::AgentStartFailed("no server info after restart".into()))?;
            self.forward(&entry, &info, true).await?
        };

        let descriptor = match client.kernels().info(kernel_id).await? {
            Some(info) => match info.connection_info {
                Some(connection_info) => KernelDescriptor {
                    id: kernel_id.to_string(),
                    connection_info,
                },
                None => find_kernel(&client, kernel_id).await?,
            },
            None => return Err(RemoteError::NotFound(format!("kernel {}", kernel_id))),
        };
        self.write_connection_file(host_id, &descriptor).await?;
        info!("[orchestrator] Kernel {} on {} recovered", kernel_id, host_id);
        Ok(descriptor)
    }

    /// Stop the agent but keep the SSH session.
    pub async fn stop_server(&self, host_id: &str) -> Result<()> {
        let Some(entry) = self.existing(host_id) else {
            return Ok(());
        };
        let _guard = entry.guard.lock().await;
        close_forward(&entry.forward).await;
        entry.agent.stop().await?;
        if entry.shell.is_connected() {
            self.status
                .emit(&entry.config.id, ConnectionStatus::Connected, MSG_CONNECTED);
        }
        Ok(())
    }

    /// Stop the agent, close the forward and the SSH session, and end
    /// `inactive`.
    pub async fn close_connection(&self, host_id: &str) -> Result<()> {
        let Some(entry) = self.existing(host_id) else {
            return Ok(());
        };
        let id = entry.config.id.clone();
        {
            let _guard = entry.guard.lock().await;
            self.status.emit(&id, ConnectionStatus::Stopping, MSG_STOPPING);
            entry.established.store(false, Ordering::SeqCst);

            if entry.shell.is_connected() {
                if let Err(e) = entry.agent.stop().await {
                    warn!("[orchestrator] Error stopping server on {}: {}", id, e);
                }
            } else {
                entry.agent.forget();
            }
            close_forward(&entry.forward).await;
            if let Err(e) = entry.shell.close().await {
                warn!("[orchestrator] Error closing connection to {}: {}", id, e);
            }
        }

        self.hosts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        self.status.emit(&id, ConnectionStatus::Inactive, MSG_CLOSED);
        Ok(())
    }

    /// Close every open host.
    pub async fn close_all(&self) {
        let ids: Vec<String> = self
            .hosts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        for id in ids {
            if let Err(e) = self.close_connection(&id).await {
                warn!("[orchestrator] Error closing {}: {}", id, e);
            }
        }
    }

    /// Run [`Orchestrator::recover_kernel`] whenever the kernel client
    /// reports the kernel dead. Ends when the client closes.
    pub fn monitor_kernel(
        self: &Arc<Self>,
        host_id: &str,
        kernel_id: &str,
        mut events: broadcast::Receiver<ClientEvent>,
    ) -> JoinHandle<()> {
        let this = self.clone();
        let host_id = host_id.to_string();
        let kernel_id = kernel_id.to_string();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ClientEvent::KernelDied { since_last_beat }) => {
                        warn!(
                            "[orchestrator] Kernel {} died ({:.1}s since last beat)",
                            kernel_id,
                            since_last_beat.as_secs_f64()
                        );
                        if let Err(e) = this.recover_kernel(&host_id, &kernel_id).await {
                            error!("[orchestrator] Could not recover kernel {}: {}", kernel_id, e);
                        }
                    }
                    Ok(ClientEvent::Closed) => break,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

async fn find_kernel(client: &AgentClient, kernel_id: &str) -> Result<KernelDescriptor> {
    client
        .kernels()
        .list()
        .await?
        .into_iter()
        .find(|k| k.id == kernel_id)
        .ok_or_else(|| RemoteError::NotFound(format!("kernel {}", kernel_id)))
}

async fn close_forward(slot: &ForwardSlot) {
    let previous = slot.lock().await.take();
    if let Some(previous) = previous {
        previous.forwarder.close().await;
    }
}

/// React to the transport dropping underneath an established session.
async fn watch_session<S: RemoteShell>(
    host_id: String,
    mut events: broadcast::Receiver<SessionEvent>,
    established: Arc<AtomicBool>,
    agent: Arc<AgentLifecycle<S>>,
    forward: ForwardSlot,
    status: StatusTracker,
) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Lost { cause, .. }) => {
                if !established.swap(false, Ordering::SeqCst) {
                    continue;
                }
                warn!("[orchestrator] Connection to {} lost: {}", host_id, cause);
                agent.forget();
                close_forward(&forward).await;
                status.emit(&host_id, ConnectionStatus::Error, MSG_LOST);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
