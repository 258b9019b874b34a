//! Start, locate and stop the remote agent.
//!
//! The agent runs as a child of the SSH session. Its `info` command prints
//! `{hostname, port, pid, token}` as the last stdout line, which is how a
//! running agent is discovered.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::config::Platform;
use crate::error::{RemoteError, Result};
use crate::flight::SingleFlight;
use crate::installer::AgentCommands;
use crate::shell::{RemoteProcess, RemoteShell, RunOptions};

pub const DEFAULT_START_RETRIES: u32 = 5;
pub const DEFAULT_START_RETRY_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(2);
const INFO_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub hostname: String,
    pub port: u16,
    pub pid: u32,
    pub token: String,
}

impl fmt::Debug for ServerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerInfo")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("pid", &self.pid)
            .field("token", &"***")
            .finish()
    }
}

impl ServerInfo {
    /// Parse the last non-empty line of the `info` command's stdout.
    pub fn from_output(stdout: &str) -> Option<Self> {
        let line = stdout.lines().map(str::trim).rev().find(|l| !l.is_empty())?;
        serde_json::from_str(line).ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Lifecycle of the agent on one host.
pub struct AgentLifecycle<S: RemoteShell> {
    shell: Arc<S>,
    commands: AgentCommands,
    platform: Platform,
    start_retries: u32,
    retry_delay: Duration,
    stop_grace: Duration,
    state: watch::Sender<AgentState>,
    server_info: Mutex<Option<ServerInfo>>,
    process: Mutex<Option<RemoteProcess>>,
    flight: SingleFlight<ServerInfo>,
}

impl<S: RemoteShell> AgentLifecycle<S> {
    pub fn new(shell: Arc<S>, platform: Platform) -> Self {
        let (state, _) = watch::channel(AgentState::Stopped);
        Self {
            shell,
            commands: AgentCommands::new(platform),
            platform,
            start_retries: DEFAULT_START_RETRIES,
            retry_delay: DEFAULT_START_RETRY_DELAY,
            stop_grace: DEFAULT_STOP_GRACE,
            state,
            server_info: Mutex::new(None),
            process: Mutex::new(None),
            flight: SingleFlight::new(),
        }
    }

    pub fn with_start_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.start_retries = retries;
        self.retry_delay = delay;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn state(&self) -> AgentState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: AgentState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!("[agent] {:?} -> {:?}", current, state);
            *current = state;
            true
        });
    }

    /// Info from the last successful start.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.server_info
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Drop cached info, e.g. after the SSH session was lost.
    pub fn forget(&self) {
        *self.server_info.lock().unwrap_or_else(|e| e.into_inner()) = None;
        *self.process.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.set_state(AgentState::Stopped);
    }

    /// Ask the remote host for the running agent's info. `None` means no
    /// agent answered.
    pub async fn get_server_info(&self) -> Result<Option<ServerInfo>> {
        let options = RunOptions::checked().with_timeout(INFO_TIMEOUT);
        let output = match self.shell.run(&self.commands.info(), options).await {
            Ok(output) => output,
            Err(RemoteError::ProcessError { stderr, .. }) => {
                debug!("[agent] Error getting server info: {}", stderr.trim());
                return Ok(None);
            }
            Err(RemoteError::Timeout(what)) => {
                warn!("[agent] Getting server info timed out: {}", what);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let parsed = ServerInfo::from_output(&output.stdout);
        if parsed.is_none() {
            debug!("[agent] Issue parsing server info: {}", output.stdout.trim());
        }
        Ok(parsed)
    }

    /// A port is trusted only if the agent still reports the same pid.
    async fn confirm(&self, info: ServerInfo) -> Result<Option<ServerInfo>> {
        match self.get_server_info().await? {
            Some(again) if again.pid == info.pid => Ok(Some(again)),
            Some(again) => {
                debug!(
                    "[agent] Server pid changed from {} to {}",
                    info.pid, again.pid
                );
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Make sure the agent runs and return its info. Concurrent callers
    /// share one attempt.
    pub async fn start(self: &Arc<Self>) -> Result<ServerInfo> {
        let this = self.clone();
        self.flight.run(move || this.start_inner()).await
    }

    async fn start_inner(self: Arc<Self>) -> Result<ServerInfo> {
        self.set_state(AgentState::Starting);
        let result = self.discover_or_spawn().await;
        match &result {
            Ok(info) => {
                *self.server_info.lock().unwrap_or_else(|e| e.into_inner()) = Some(info.clone());
                self.set_state(AgentState::Running);
            }
            Err(e) => {
                warn!("[agent] Error starting remote server: {}", e);
                self.set_state(AgentState::Stopped);
            }
        }
        result
    }

    async fn discover_or_spawn(&self) -> Result<ServerInfo> {
        if let Some(info) = self.get_server_info().await? {
            if let Some(info) = self.confirm(info).await? {
                info!(
                    "[agent] Remote server already running on {} (pid {})",
                    self.shell.host_id(),
                    info.pid
                );
                return Ok(info);
            }
        }

        debug!("[agent] Starting remote server for {}", self.shell.host_id());
        let process = self
            .shell
            .create_process(&self.commands.start())
            .await
            .map_err(|e| match e {
                RemoteError::ConnectionLost { .. } => e,
                other => RemoteError::AgentStartFailed(other.to_string()),
            })?;
        *self.process.lock().unwrap_or_else(|e| e.into_inner()) = Some(process.clone());

        for attempt in 0..self.start_retries {
            if let Some(info) = self.get_server_info().await? {
                if let Some(info) = self.confirm(info).await? {
                    info!(
                        "[agent] Remote server started for {} at port {}",
                        self.shell.host_id(),
                        info.port
                    );
                    return Ok(info);
                }
            }
            if !process.is_running() {
                let output = process.stderr();
                let output = if output.trim().is_empty() {
                    process.stdout()
                } else {
                    output
                };
                return Err(RemoteError::AgentStartFailed(format!(
                    "server exited early: {}",
                    output.trim()
                )));
            }
            debug!(
                "[agent] Server info not available yet (attempt {}/{})",
                attempt + 1,
                self.start_retries
            );
            tokio::time::sleep(self.retry_delay).await;
        }

        process.terminate();
        *self.process.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Err(RemoteError::AgentStartFailed(format!(
            "no server info after {} attempts",
            self.start_retries
        )))
    }

    fn interrupt_command(&self, pid: u32) -> String {
        match self.platform {
            Platform::Windows => format!("taskkill /PID {}", pid),
            _ => format!("kill -INT {}", pid),
        }
    }

    fn kill_command(&self, pid: u32) -> String {
        match self.platform {
            Platform::Windows => format!("taskkill /F /PID {}", pid),
            _ => format!("kill -TERM {}", pid),
        }
    }

    /// Stop the agent.
    ///
    /// The agent only unwinds cleanly after two interrupts, so both are
    /// always sent. If it is still around after the grace period the
    /// tracked process is terminated and the pid is killed.
    pub async fn stop(&self) -> Result<()> {
        let info = match self.server_info() {
            Some(info) => Some(info),
            None => self.get_server_info().await?,
        };
        let process = self.process.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(info) = info else {
            if let Some(process) = process {
                process.terminate();
            }
            debug!("[agent] No remote server running on {}", self.shell.host_id());
            self.forget();
            return Ok(());
        };

        self.set_state(AgentState::Stopping);
        debug!(
            "[agent] Stopping remote server for {} with pid {}",
            self.shell.host_id(),
            info.pid
        );

        let interrupt = self.interrupt_command(info.pid);
        for _ in 0..2 {
            if let Err(e) = self.shell.run(&interrupt, RunOptions::default()).await {
                warn!("[agent] Failed to interrupt remote server: {}", e);
            }
        }

        if !self.wait_gone(&info, process.as_ref()).await? {
            warn!(
                "[agent] Remote server pid {} ignored interrupts, terminating",
                info.pid
            );
            if let Some(process) = &process {
                process.terminate();
            }
            let _ = self
                .shell
                .run(&self.kill_command(info.pid), RunOptions::default())
                .await;
        }

        self.forget();
        info!("[agent] Remote server stopped for {}", self.shell.host_id());
        Ok(())
    }

    async fn wait_gone(&self, info: &ServerInfo, process: Option<&RemoteProcess>) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + self.stop_grace;
        loop {
            let exited = process.is_some_and(|p| !p.is_running());
            let reported = match self.get_server_info().await? {
                Some(current) => current.pid == info.pid,
                None => false,
            };
            if exited || !reported {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
}
