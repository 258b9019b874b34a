//! Local TCP listener tunnelled to a port on the remote host.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};

use crate::error::Result;
use crate::shell::{RemoteShell, SessionEvent};

/// Accepts on `127.0.0.1:<local_port>` and relays each connection through
/// a direct-tcpip channel to `remote_host:remote_port`.
pub struct PortForwarder {
    local_addr: SocketAddr,
    remote_host: String,
    remote_port: u16,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl PortForwarder {
    /// Bind a fresh local port and start forwarding. The listener stops on
    /// [`PortForwarder::close`] or when the session is lost or closed.
    pub async fn start<S: RemoteShell>(
        shell: Arc<S>,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let events = shell.events();

        let task = tokio::spawn(accept_loop(
            listener,
            shell,
            remote_host.to_string(),
            remote_port,
            shutdown_rx,
            events,
        ));

        info!(
            "[forward] Forwarded local port {} to remote {}:{}",
            local_addr.port(),
            remote_host,
            remote_port
        );
        Ok(Self {
            local_addr,
            remote_host: remote_host.to_string(),
            remote_port,
            shutdown,
            task: Some(task),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn remote(&self) -> (&str, u16) {
        (&self.remote_host, self.remote_port)
    }

    /// Base URL of the forwarded service.
    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.local_addr.port())
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop accepting and drop every relayed connection.
    pub async fn close(mut self) {
        self.shutdown.send_replace(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        debug!("[forward] Closed local port {}", self.local_addr.port());
    }
}

impl Drop for PortForwarder {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn accept_loop<S: RemoteShell>(
    listener: TcpListener,
    shell: Arc<S>,
    remote_host: String,
    remote_port: u16,
    mut shutdown: watch::Receiver<bool>,
    mut events: broadcast::Receiver<SessionEvent>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = async {
                let _ = shutdown.wait_for(|s| *s).await;
            } => break,
            event = events.recv() => match event {
                Ok(SessionEvent::Lost { .. }) | Ok(SessionEvent::Closed { .. }) => {
                    debug!("[forward] Session ended, closing listener");
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => break,
                _ => {}
            },
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    let shell = shell.clone();
                    let remote_host = remote_host.clone();
                    connections.spawn(async move {
                        match shell.open_direct_tcpip(&remote_host, remote_port).await {
                            Ok(tunnel) => {
                                bridge(socket, tunnel, &format!("{} -> {}:{}", peer, remote_host, remote_port)).await;
                            }
                            Err(e) => {
                                warn!("[forward] Could not open tunnel for {}: {}", peer, e);
                            }
                        }
                    });
                }
                Err(e) => {
                    warn!("[forward] Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    connections.shutdown().await;
}

/// Copy both directions until either side closes.
async fn bridge<A, B>(mut a: A, mut b: B, label: &str)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::io::copy_bidirectional(&mut a, &mut b).await {
        Ok((up, down)) => {
            debug!("[forward] {} done: {} bytes up, {} bytes down", label, up, down);
        }
        Err(e) => {
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                debug!("[forward] {} error: {}", label, e);
            }
        }
    }
}
