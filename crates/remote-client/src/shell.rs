//! The transport seam between the orchestrator and a remote host.
//!
//! [`RemoteShell`] is what the installer, agent lifecycle and port forwarder
//! need from an SSH connection. [`crate::ssh::SshSession`] is the production
//! implementation.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, watch};

use crate::config::HostConfig;
use crate::error::{RemoteError, Result};

/// Captured result of a finished remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<u32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Last non-empty stdout line, trimmed.
    pub fn last_line(&self) -> Option<&str> {
        self.stdout
            .lines()
            .map(str::trim)
            .rev()
            .find(|line| !line.is_empty())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Turn a non-zero exit into [`RemoteError::ProcessError`].
    pub check: bool,
    pub timeout: Option<Duration>,
}

impl RunOptions {
    pub fn checked() -> Self {
        Self {
            check: true,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Apply [`RunOptions`] around a command future.
pub async fn run_with_options<F>(command: &str, options: RunOptions, run: F) -> Result<CommandOutput>
where
    F: Future<Output = Result<CommandOutput>>,
{
    let output = match options.timeout {
        Some(timeout) => tokio::time::timeout(timeout, run)
            .await
            .map_err(|_| RemoteError::Timeout(format!("`{}` after {:?}", command, timeout)))??,
        None => run.await?,
    };
    if options.check && !output.success() {
        return Err(RemoteError::ProcessError {
            command: command.to_string(),
            stderr: output.stderr,
            exit_code: output.exit_code,
        });
    }
    Ok(output)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Established { host_id: String },
    Lost { host_id: String, cause: String },
    Closed { host_id: String },
}

/// Byte stream through the SSH tunnel.
pub trait TunnelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TunnelIo for T {}

pub type TunnelStream = Box<dyn TunnelIo>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Exited(Option<u32>),
}

#[derive(Debug, Default)]
struct ProcessOutput {
    stdout: String,
    stderr: String,
}

/// A long-lived remote process whose lifetime is bound to its session.
#[derive(Clone)]
pub struct RemoteProcess {
    command: Arc<str>,
    output: Arc<Mutex<ProcessOutput>>,
    state: watch::Receiver<ProcessState>,
    terminate: Arc<watch::Sender<bool>>,
}

/// The transport's end of a [`RemoteProcess`].
pub struct ProcessControl {
    output: Arc<Mutex<ProcessOutput>>,
    state: watch::Sender<ProcessState>,
    terminate: watch::Receiver<bool>,
}

impl RemoteProcess {
    pub fn pair(command: &str) -> (RemoteProcess, ProcessControl) {
        let output = Arc::new(Mutex::new(ProcessOutput::default()));
        let (state_tx, state_rx) = watch::channel(ProcessState::Running);
        let (term_tx, term_rx) = watch::channel(false);
        (
            RemoteProcess {
                command: Arc::from(command),
                output: output.clone(),
                state: state_rx,
                terminate: Arc::new(term_tx),
            },
            ProcessControl {
                output,
                state: state_tx,
                terminate: term_rx,
            },
        )
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn stdout(&self) -> String {
        self.output
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .stdout
            .clone()
    }

    pub fn stderr(&self) -> String {
        self.output
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .stderr
            .clone()
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ProcessState::Running
    }

    /// Ask the transport to kill the process. Returns immediately.
    pub fn terminate(&self) {
        self.terminate.send_replace(true);
    }

    /// Wait for exit and return the exit code, if the remote sent one.
    pub async fn wait(&self) -> Option<u32> {
        let mut state = self.state.clone();
        // Bound so the borrowed value drops before `state`.
        let code = match state.wait_for(|s| *s != ProcessState::Running).await {
            Ok(s) => match *s {
                ProcessState::Exited(code) => code,
                ProcessState::Running => None,
            },
            // Control dropped without reporting an exit.
            Err(_) => None,
        };
        code
    }
}

impl ProcessControl {
    pub fn push_stdout(&self, data: &[u8]) {
        self.output
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .stdout
            .push_str(&String::from_utf8_lossy(data));
    }

    pub fn push_stderr(&self, data: &[u8]) {
        self.output
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .stderr
            .push_str(&String::from_utf8_lossy(data));
    }

    pub fn finish(&self, exit_code: Option<u32>) {
        self.state.send_replace(ProcessState::Exited(exit_code));
    }

    /// Resolves once [`RemoteProcess::terminate`] was called or every
    /// handle was dropped.
    pub async fn terminate_requested(&mut self) {
        let _ = self.terminate.wait_for(|t| *t).await;
    }
}

/// Operations the core needs from a connection to one host.
pub trait RemoteShell: Send + Sync + 'static {
    fn host_id(&self) -> &str;

    /// Open the session. An existing session is closed first.
    fn connect(&self) -> impl Future<Output = Result<()>> + Send;

    fn is_connected(&self) -> bool;

    fn run(
        &self,
        command: &str,
        options: RunOptions,
    ) -> impl Future<Output = Result<CommandOutput>> + Send;

    fn create_process(&self, command: &str) -> impl Future<Output = Result<RemoteProcess>> + Send;

    /// Open a channel to `host:port` as seen from the remote side.
    fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
    ) -> impl Future<Output = Result<TunnelStream>> + Send;

    /// Terminate tracked processes and close the session.
    fn close(&self) -> impl Future<Output = Result<()>> + Send;

    fn events(&self) -> broadcast::Receiver<SessionEvent>;
}

/// Builds one shell per host for the orchestrator.
pub trait ShellFactory: Send + Sync + 'static {
    type Shell: RemoteShell;

    fn create(&self, host: &HostConfig) -> Result<Arc<Self::Shell>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_line_skips_trailing_blank_lines() {
        let output = CommandOutput {
            stdout: "banner\n1.2.0\n\n".into(),
            ..Default::default()
        };
        assert_eq!(output.last_line(), Some("1.2.0"));
        assert_eq!(CommandOutput::default().last_line(), None);
    }

    #[tokio::test]
    async fn test_checked_run_maps_nonzero_exit() {
        let err = run_with_options("false", RunOptions::checked(), async {
            Ok(CommandOutput {
                stdout: String::new(),
                stderr: "boom".into(),
                exit_code: Some(1),
            })
        })
        .await
        .unwrap_err();
        match err {
            RemoteError::ProcessError {
                stderr, exit_code, ..
            } => {
                assert_eq!(stderr, "boom");
                assert_eq!(exit_code, Some(1));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let options = RunOptions::default().with_timeout(Duration::from_millis(20));
        let err = run_with_options("sleep", options, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(CommandOutput::default())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, RemoteError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_process_terminate_and_wait() {
        let (process, mut control) = RemoteProcess::pair("server");
        assert!(process.is_running());

        let waiter = tokio::spawn({
            let process = process.clone();
            async move { process.wait().await }
        });

        control.push_stdout(b"listening\n");
        process.terminate();
        control.terminate_requested().await;
        control.finish(Some(130));

        assert_eq!(waiter.await.unwrap(), Some(130));
        assert_eq!(process.stdout(), "listening\n");
        assert_eq!(process.state(), ProcessState::Exited(Some(130)));
    }

    #[tokio::test]
    async fn test_wait_without_exit_report() {
        let (process, control) = RemoteProcess::pair("server");
        let waiter = tokio::spawn({
            let process = process.clone();
            async move { process.wait().await }
        });
        drop(control);
        assert_eq!(waiter.await.unwrap(), None);
        assert!(process.is_running());
    }
}
