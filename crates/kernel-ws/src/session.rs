//! Message-originator identity stamped on every outgoing message.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use chrono::Utc;
use log::{debug, warn};
use serde_json::Value;
use uuid::Uuid;

use crate::adapter::{adapt_recv, adapt_send, is_supported, parse_major};
use crate::codec;
use crate::error::KernelWsError;
use crate::message::{empty_object, Channel, Header, JupyterMessage};
use crate::{PROTOCOL_MAJOR, PROTOCOL_VERSION};

/// One Session per kernel client.
///
/// `msg_id`s take the form `{session}_{pid}_{counter}` with a counter that
/// only grows. The process ID is recorded at creation so a forked child can
/// be caught before it writes to a socket it does not own.
#[derive(Debug)]
pub struct Session {
    session_id: String,
    username: String,
    pid: AtomicU32,
    counter: AtomicU64,
    adapter_version: AtomicU32,
}

impl Session {
    pub fn new(username: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), username)
    }

    pub fn with_id(session_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            username: username.into(),
            pid: AtomicU32::new(std::process::id()),
            counter: AtomicU64::new(0),
            adapter_version: AtomicU32::new(PROTOCOL_MAJOR),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Process ID recorded when the session was created.
    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::SeqCst)
    }

    /// Override the recorded process ID.
    pub fn set_pid(&self, pid: u32) {
        self.pid.store(pid, Ordering::SeqCst);
    }

    /// False once the running process is not the one that created the session.
    pub fn is_current_process(&self) -> bool {
        self.pid() == std::process::id()
    }

    /// Major protocol version messages are adapted to.
    pub fn adapter_version(&self) -> u32 {
        self.adapter_version.load(Ordering::SeqCst)
    }

    pub fn set_adapter_version(&self, version: u32) {
        self.adapter_version.store(version, Ordering::SeqCst);
    }

    /// Adopt the major version of a `kernel_info_reply`.
    ///
    /// Returns the new adapter version when it changed.
    pub fn negotiate(&self, reply: &JupyterMessage) -> Option<u32> {
        let protocol_version = reply.content.get("protocol_version")?.as_str()?;
        let major = parse_major(protocol_version)?;
        if major == self.adapter_version() {
            return None;
        }
        if !is_supported(PROTOCOL_MAJOR, major) {
            warn!(
                "[kernel-ws] Kernel speaks protocol {}, no adapter from {}",
                protocol_version, PROTOCOL_MAJOR
            );
        }
        debug!(
            "[kernel-ws] Adapting session {} to protocol {}",
            self.session_id, major
        );
        self.set_adapter_version(major);
        Some(major)
    }

    pub fn next_msg_id(&self) -> String {
        let count = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("{}_{}_{}", self.session_id, self.pid(), count)
    }

    pub fn msg_header(&self, msg_type: &str) -> Header {
        Header {
            msg_id: self.next_msg_id(),
            msg_type: msg_type.to_string(),
            username: self.username.clone(),
            session: self.session_id.clone(),
            date: Utc::now(),
            version: Some(PROTOCOL_VERSION.to_string()),
        }
    }

    /// Build a native-version message, optionally replying to `parent`.
    pub fn msg(
        &self,
        msg_type: &str,
        content: Value,
        parent: Option<&JupyterMessage>,
    ) -> JupyterMessage {
        JupyterMessage {
            header: self.msg_header(msg_type),
            parent_header: parent.map(|p| p.header.clone()),
            metadata: empty_object(),
            content,
            buffers: Vec::new(),
            channel: None,
        }
    }

    /// Adapt and frame a message for `channel`.
    pub fn serialize(&self, channel: Channel, msg: JupyterMessage) -> Result<Vec<u8>, KernelWsError> {
        let adapted = adapt_send(msg, PROTOCOL_MAJOR, self.adapter_version());
        codec::encode_message(channel.as_str(), &adapted)
    }

    /// Decode the parts of a frame and adapt the message back to native.
    pub fn deserialize(&self, channel: &str, parts: &[&[u8]]) -> Result<JupyterMessage, KernelWsError> {
        let msg = codec::decode_parts(channel, parts)?;
        Ok(adapt_recv(msg, self.adapter_version(), PROTOCOL_MAJOR))
    }
}
