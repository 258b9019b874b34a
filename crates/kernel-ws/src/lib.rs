//! kernel-ws - Jupyter kernel client over the `v1.kernel.websocket.jupyter.org`
//! WebSocket subprotocol.
//!
//! A single socket multiplexes the shell, iopub, stdin and control channels.
//! Each message travels as one binary frame (see [`codec`]). Heartbeat is
//! carried by WebSocket ping/pong instead of a dedicated channel. Messages
//! are adapted between protocol major versions once the kernel reports its
//! own version in `kernel_info_reply`.

pub mod adapter;
pub mod base64;
pub mod channel;
pub mod client;
pub mod codec;
pub mod error;
pub mod heartbeat;
pub mod message;
pub mod session;

pub use channel::{ChannelHandler, WsChannel};
pub use client::{
    wait_for_reply, ChannelSelection, ClientEvent, ExecuteRequest, HistoryAccess, KernelWsClient,
};
pub use error::KernelWsError;
pub use heartbeat::{HeartbeatChannel, DEFAULT_TIME_TO_DEAD};
pub use message::{Channel, Header, JupyterMessage};
pub use session::Session;

/// Jupyter messaging protocol version this library speaks natively.
pub const PROTOCOL_VERSION: &str = "5.3";

/// Major component of [`PROTOCOL_VERSION`].
pub const PROTOCOL_MAJOR: u32 = 5;

/// WebSocket subprotocol requested when opening the channels socket.
pub const KERNEL_WS_PROTOCOL: &str = "v1.kernel.websocket.jupyter.org";

/// Default cap on a single inbound message, 100 MiB.
pub const DEFAULT_MAX_MSG_SIZE: usize = 100 * 1024 * 1024;
