//! Queue-backed kernel channels sharing one WebSocket.
//!
//! Each channel owns an unbounded FIFO of decoded messages and a worker task
//! that hands them, in arrival order, to the registered handlers and then to
//! broadcast subscribers. Sends go through the shared [`Transport`], whose
//! single writer task keeps per-channel order on the wire.

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, warn};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::error::KernelWsError;
use crate::message::{Channel, JupyterMessage};
use crate::session::Session;

/// Capacity of each channel's broadcast fan-out.
const SUBSCRIBER_CAPACITY: usize = 1024;

/// Receives messages delivered on a channel.
///
/// Handlers run on the channel's worker task and must not block.
pub trait ChannelHandler: Send + Sync {
    fn message_received(&self, channel: Channel, msg: &JupyterMessage);

    fn error_occurred(&self, channel: Channel, error: &KernelWsError) {
        debug!("[kernel-ws] Unhandled error on {}: {}", channel, error);
    }
}

/// Write side of the kernel WebSocket, shared by every channel.
pub struct Transport {
    session: Arc<Session>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<WsMessage>>>,
    open: AtomicBool,
}

impl Transport {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            outgoing: Mutex::new(None),
            open: AtomicBool::new(false),
        }
    }

    pub(crate) fn attach(&self, sender: mpsc::UnboundedSender<WsMessage>) {
        *self.outgoing.lock().unwrap_or_else(|e| e.into_inner()) = Some(sender);
        self.open.store(true, Ordering::SeqCst);
    }

    pub(crate) fn detach(&self) {
        self.outgoing.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.open.store(false, Ordering::SeqCst);
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub(crate) fn send_raw(&self, message: WsMessage) -> Result<(), KernelWsError> {
        let guard = self.outgoing.lock().unwrap_or_else(|e| e.into_inner());
        let sender = guard.as_ref().ok_or(KernelWsError::NotConnected)?;
        sender.send(message).map_err(|_| KernelWsError::NotConnected)
    }

    /// Serialize and queue `msg` on `channel`.
    ///
    /// Returns `Ok(false)` when the message was dropped because this process
    /// is not the one that created the session.
    pub fn send(&self, channel: Channel, msg: JupyterMessage) -> Result<bool, KernelWsError> {
        if !self.session.is_current_process() {
            warn!(
                "[kernel-ws] Dropping {} from pid {}, session belongs to pid {}",
                msg.header.msg_type,
                std::process::id(),
                self.session.pid()
            );
            return Ok(false);
        }
        let frame = self.session.serialize(channel, msg)?;
        self.send_raw(WsMessage::Binary(frame))?;
        Ok(true)
    }

    /// Queue a close frame. The writer task exits after sending it.
    pub(crate) fn close(&self, code: CloseCode, reason: &'static str) {
        let frame = CloseFrame {
            code,
            reason: Cow::Borrowed(reason),
        };
        if self.send_raw(WsMessage::Close(Some(frame))).is_err() {
            debug!("[kernel-ws] Close requested on a detached transport");
        }
        self.open.store(false, Ordering::SeqCst);
    }
}

/// One of `shell`, `iopub`, `stdin` or `control`.
pub struct WsChannel {
    channel: Channel,
    transport: Arc<Transport>,
    handlers: Arc<RwLock<Vec<Arc<dyn ChannelHandler>>>>,
    subscribers: broadcast::Sender<JupyterMessage>,
    queue: Mutex<Option<mpsc::UnboundedSender<JupyterMessage>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WsChannel {
    pub(crate) fn new(channel: Channel, transport: Arc<Transport>) -> Self {
        let (subscribers, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        Self {
            channel,
            transport,
            handlers: Arc::new(RwLock::new(Vec::new())),
            subscribers,
            queue: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn add_handler(&self, handler: Arc<dyn ChannelHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler);
    }

    /// Receive every message delivered on this channel from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<JupyterMessage> {
        self.subscribers.subscribe()
    }

    /// Start the worker task. No-op if already running.
    pub fn start(&self) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.is_some() {
            return;
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<JupyterMessage>();
        *queue = Some(tx);

        let channel = self.channel;
        let handlers = self.handlers.clone();
        let subscribers = self.subscribers.clone();
        let worker = tokio::spawn(async move {
            while let Some(mut msg) = rx.recv().await {
                msg.channel = Some(channel);
                let current: Vec<Arc<dyn ChannelHandler>> =
                    handlers.read().unwrap_or_else(|e| e.into_inner()).clone();
                for handler in current {
                    handler.message_received(channel, &msg);
                }
                // No subscribers is fine.
                let _ = subscribers.send(msg);
            }
            debug!("[kernel-ws] {} worker finished", channel);
        });
        *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(worker);
    }

    /// Stop the worker task, discarding undelivered messages. No-op if stopped.
    pub fn stop(&self) {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take() {
            worker.abort();
        }
    }

    pub fn is_alive(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|w| !w.is_finished())
    }

    /// Send a message on this channel, returning its `msg_id`.
    pub fn send(&self, msg: JupyterMessage) -> Result<String, KernelWsError> {
        let msg_id = msg.header.msg_id.clone();
        self.transport.send(self.channel, msg)?;
        Ok(msg_id)
    }

    /// Hand a decoded message to the worker. Returns false if not started.
    pub(crate) fn enqueue(&self, msg: JupyterMessage) -> bool {
        let queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        match queue.as_ref() {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }

    pub(crate) fn report_error(&self, error: &KernelWsError) {
        let current: Vec<Arc<dyn ChannelHandler>> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for handler in current {
            handler.error_occurred(self.channel, error);
        }
    }
}

/// One-shot shell handler that negotiates the adapter version from the
/// first `kernel_info_reply` of a connection.
pub(crate) struct KernelInfoInspector {
    session: Arc<Session>,
    done: AtomicBool,
}

impl KernelInfoInspector {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            done: AtomicBool::new(false),
        }
    }

    pub(crate) fn reset(&self) {
        self.done.store(false, Ordering::SeqCst);
    }
}

impl ChannelHandler for KernelInfoInspector {
    fn message_received(&self, _channel: Channel, msg: &JupyterMessage) {
        if msg.header.msg_type != "kernel_info_reply" {
            return;
        }
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(version) = self.session.negotiate(msg) {
            debug!("[kernel-ws] Adapter version set to {}", version);
        }
    }
}
