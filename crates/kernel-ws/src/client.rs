//! Kernel client speaking the v1 kernel WebSocket protocol.
//!
//! One client serves one kernel. `start_channels` opens the socket at
//! `<base>/api/kernels/<id>/channels`, spawns the writer and receiver tasks,
//! starts the selected channel workers and the heartbeat, and arms the
//! one-shot `kernel_info_reply` inspector that picks the adapter version.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::CapacityError;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::channel::{ChannelHandler, KernelInfoInspector, Transport, WsChannel};
use crate::codec;
use crate::error::KernelWsError;
use crate::heartbeat::{HeartbeatChannel, DEFAULT_TIME_TO_DEAD};
use crate::message::{Channel, JupyterMessage};
use crate::session::Session;
use crate::{DEFAULT_MAX_MSG_SIZE, KERNEL_WS_PROTOCOL};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Out-of-band notifications for the owner of a client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// No heartbeat for longer than twice `time_to_dead`.
    KernelDied { since_last_beat: Duration },
    /// A frame exceeded the negotiated maximum and the socket was closed.
    MessageSizeOverflow { limit: usize },
    /// iopub announced `execution_state: restarting`.
    Restarting,
    /// The receiver stopped on an error.
    ReceiverFailed(String),
    /// The socket is closed.
    Closed,
}

/// Which channels `start_channels` brings up.
#[derive(Debug, Clone, Copy)]
pub struct ChannelSelection {
    pub shell: bool,
    pub iopub: bool,
    pub stdin: bool,
    pub hb: bool,
    pub control: bool,
}

impl Default for ChannelSelection {
    fn default() -> Self {
        Self {
            shell: true,
            iopub: true,
            stdin: true,
            hb: true,
            control: true,
        }
    }
}

impl ChannelSelection {
    fn enabled(&self, channel: Channel) -> bool {
        match channel {
            Channel::Shell => self.shell,
            Channel::Iopub => self.iopub,
            Channel::Stdin => self.stdin,
            Channel::Control => self.control,
        }
    }
}

/// Arguments of an `execute_request`.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub code: String,
    pub silent: bool,
    pub store_history: bool,
    pub user_expressions: BTreeMap<String, String>,
    /// Defaults to whether the stdin channel is running.
    pub allow_stdin: Option<bool>,
    pub stop_on_error: bool,
}

impl ExecuteRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            silent: false,
            store_history: true,
            user_expressions: BTreeMap::new(),
            allow_stdin: None,
            stop_on_error: true,
        }
    }

    /// Build a request from loosely typed JSON, as sent by a frontend.
    ///
    /// `code` must be a string and `user_expressions` a string to string map.
    pub fn from_json(value: &Value) -> Result<Self, KernelWsError> {
        let code = match value.get("code") {
            Some(Value::String(code)) => code.clone(),
            Some(other) => {
                return Err(KernelWsError::InvalidArgument(format!(
                    "code must be a string, got {}",
                    json_type_name(other)
                )))
            }
            None => return Err(KernelWsError::InvalidArgument("code is required".into())),
        };

        let mut request = ExecuteRequest::new(code);
        match value.get("user_expressions") {
            None | Some(Value::Null) => {}
            Some(Value::Object(map)) => {
                for (key, expr) in map {
                    let Value::String(expr) = expr else {
                        return Err(KernelWsError::InvalidArgument(format!(
                            "user_expressions[{}] must be a string",
                            key
                        )));
                    };
                    request.user_expressions.insert(key.clone(), expr.clone());
                }
            }
            Some(other) => {
                return Err(KernelWsError::InvalidArgument(format!(
                    "user_expressions must be a mapping, got {}",
                    json_type_name(other)
                )))
            }
        }

        request.silent = bool_field(value, "silent", request.silent)?;
        request.store_history = bool_field(value, "store_history", request.store_history)?;
        request.stop_on_error = bool_field(value, "stop_on_error", request.stop_on_error)?;
        request.allow_stdin = match value.get("allow_stdin") {
            None | Some(Value::Null) => None,
            Some(Value::Bool(b)) => Some(*b),
            Some(_) => {
                return Err(KernelWsError::InvalidArgument(
                    "allow_stdin must be a boolean".into(),
                ))
            }
        };
        Ok(request)
    }
}

fn bool_field(value: &Value, key: &str, default: bool) -> Result<bool, KernelWsError> {
    match value.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(KernelWsError::InvalidArgument(format!(
            "{} must be a boolean",
            key
        ))),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// `hist_access_type` and its parameters for a `history_request`.
#[derive(Debug, Clone)]
pub enum HistoryAccess {
    Range {
        session: i64,
        start: i64,
        stop: Option<i64>,
    },
    Tail {
        n: u32,
    },
    Search {
        pattern: String,
        unique: bool,
        n: Option<u32>,
    },
}

impl Default for HistoryAccess {
    fn default() -> Self {
        HistoryAccess::Range {
            session: 0,
            start: 0,
            stop: None,
        }
    }
}

struct Running {
    writer: JoinHandle<()>,
    receiver: Option<JoinHandle<Result<(), KernelWsError>>>,
}

pub struct KernelWsClient {
    base_url: String,
    kernel_id: String,
    token: Option<String>,
    max_msg_size: usize,
    session: Arc<Session>,
    transport: Arc<Transport>,
    shell: Arc<WsChannel>,
    iopub: Arc<WsChannel>,
    stdin: Arc<WsChannel>,
    control: Arc<WsChannel>,
    heartbeat: Arc<HeartbeatChannel>,
    inspector: Arc<KernelInfoInspector>,
    events: broadcast::Sender<ClientEvent>,
    running: Mutex<Option<Running>>,
}

impl KernelWsClient {
    /// Client for kernel `kernel_id` behind the server at `base_url`
    /// (`http://`, `https://`, `ws://` or `wss://`).
    pub fn new(base_url: &str, kernel_id: &str) -> Self {
        Self::with_session(base_url, kernel_id, Session::new(whoami()), DEFAULT_TIME_TO_DEAD)
    }

    pub fn with_session(
        base_url: &str,
        kernel_id: &str,
        session: Session,
        time_to_dead: Duration,
    ) -> Self {
        let session = Arc::new(session);
        let transport = Arc::new(Transport::new(session.clone()));
        let (events, _) = broadcast::channel(64);
        let inspector = Arc::new(KernelInfoInspector::new(session.clone()));
        let shell = Arc::new(WsChannel::new(Channel::Shell, transport.clone()));
        shell.add_handler(inspector.clone());

        Self {
            base_url: base_url.to_string(),
            kernel_id: kernel_id.to_string(),
            token: None,
            max_msg_size: DEFAULT_MAX_MSG_SIZE,
            session,
            heartbeat: Arc::new(HeartbeatChannel::new(time_to_dead, transport.clone())),
            iopub: Arc::new(WsChannel::new(Channel::Iopub, transport.clone())),
            stdin: Arc::new(WsChannel::new(Channel::Stdin, transport.clone())),
            control: Arc::new(WsChannel::new(Channel::Control, transport.clone())),
            shell,
            transport,
            inspector,
            events,
            running: Mutex::new(None),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_max_msg_size(mut self, max_msg_size: usize) -> Self {
        self.max_msg_size = max_msg_size;
        self
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn channel(&self, channel: Channel) -> &Arc<WsChannel> {
        match channel {
            Channel::Shell => &self.shell,
            Channel::Iopub => &self.iopub,
            Channel::Stdin => &self.stdin,
            Channel::Control => &self.control,
        }
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatChannel> {
        &self.heartbeat
    }

    pub fn add_handler(&self, channel: Channel, handler: Arc<dyn ChannelHandler>) {
        self.channel(channel).add_handler(handler);
    }

    pub fn subscribe(&self, channel: Channel) -> broadcast::Receiver<JupyterMessage> {
        self.channel(channel).subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn kernel_id(&self) -> &str {
        &self.kernel_id
    }

    /// Full URL of the channels socket, without the token.
    pub fn url(&self) -> Result<Url, KernelWsError> {
        let mut url = channels_endpoint(&self.base_url, &self.kernel_id)?;
        url.query_pairs_mut()
            .append_pair("session_id", self.session.session_id());
        Ok(url)
    }

    pub async fn channels_running(&self) -> bool {
        self.running.lock().await.is_some() && self.transport.is_open()
    }

    /// Open the socket and start the selected channels. No-op if running.
    pub async fn start_channels(&self, selection: ChannelSelection) -> Result<(), KernelWsError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let ws = self.connect().await?;
        let (mut sink, stream) = ws.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        self.transport.attach(tx);
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let closing = matches!(message, WsMessage::Close(_));
                if let Err(e) = sink.send(message).await {
                    debug!("[kernel-ws] Writer stopped: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let receiver = tokio::spawn(receive_loop(
            stream,
            ReceiverContext {
                transport: self.transport.clone(),
                channels: [
                    self.shell.clone(),
                    self.iopub.clone(),
                    self.stdin.clone(),
                    self.control.clone(),
                ],
                heartbeat: self.heartbeat.clone(),
                events: self.events.clone(),
                max_msg_size: self.max_msg_size,
            },
        ));

        for channel in Channel::ALL {
            if selection.enabled(channel) {
                self.channel(channel).start();
            }
        }
        if selection.hb {
            self.heartbeat.start(self.events.clone());
        }
        self.inspector.reset();

        info!("[kernel-ws] Channels started for kernel {}", self.kernel_id);
        *running = Some(Running {
            writer,
            receiver: Some(receiver),
        });
        Ok(())
    }

    /// Close the socket and stop every channel. No-op if not running.
    pub async fn stop_channels(&self) {
        let Some(mut running) = self.running.lock().await.take() else {
            return;
        };
        for channel in Channel::ALL {
            self.channel(channel).stop();
        }
        self.heartbeat.stop();
        self.transport.close(CloseCode::Normal, "");
        self.transport.detach();

        if let Some(receiver) = running.receiver.take() {
            receiver.abort();
        }
        if tokio::time::timeout(Duration::from_secs(1), &mut running.writer)
            .await
            .is_err()
        {
            running.writer.abort();
        }
        info!("[kernel-ws] Channels stopped for kernel {}", self.kernel_id);
    }

    /// Wait for the receiver to finish and surface how it ended.
    pub async fn wait_closed(&self) -> Result<(), KernelWsError> {
        let receiver = match self.running.lock().await.as_mut() {
            Some(running) => running.receiver.take(),
            None => None,
        };
        match receiver {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Ok(()),
                Err(e) => Err(KernelWsError::Protocol(format!("receiver panicked: {}", e))),
            },
            None => Ok(()),
        }
    }

    async fn connect(&self) -> Result<WsStream, KernelWsError> {
        let mut url = self.url()?;
        debug!("[kernel-ws] Connecting to {}", url);
        if let Some(token) = &self.token {
            url.query_pairs_mut().append_pair("token", token);
        }
        let mut request = url.as_str().into_client_request()?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(KERNEL_WS_PROTOCOL),
        );

        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_msg_size);
        config.max_frame_size = Some(self.max_msg_size);

        let (ws, _response) =
            tokio_tungstenite::connect_async_with_config(request, Some(config), false).await?;
        Ok(ws)
    }

    fn send_on(&self, channel: Channel, msg_type: &str, content: Value) -> Result<String, KernelWsError> {
        let msg = self.session.msg(msg_type, content, None);
        self.channel(channel).send(msg)
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Send an `execute_request` on shell and return its `msg_id`.
    pub fn execute(&self, request: ExecuteRequest) -> Result<String, KernelWsError> {
        let allow_stdin = request
            .allow_stdin
            .unwrap_or_else(|| self.stdin.is_alive());
        self.send_on(
            Channel::Shell,
            "execute_request",
            json!({
                "code": request.code,
                "silent": request.silent,
                "store_history": request.store_history,
                "user_expressions": request.user_expressions,
                "allow_stdin": allow_stdin,
                "stop_on_error": request.stop_on_error,
            }),
        )
    }

    /// Execute `code` with default options.
    pub fn execute_code(&self, code: &str) -> Result<String, KernelWsError> {
        self.execute(ExecuteRequest::new(code))
    }

    /// `cursor_pos` defaults to the end of `code`.
    pub fn complete(&self, code: &str, cursor_pos: Option<usize>) -> Result<String, KernelWsError> {
        let cursor_pos = cursor_pos.unwrap_or(code.chars().count());
        self.send_on(
            Channel::Shell,
            "complete_request",
            json!({"code": code, "cursor_pos": cursor_pos}),
        )
    }

    pub fn inspect(
        &self,
        code: &str,
        cursor_pos: Option<usize>,
        detail_level: u8,
    ) -> Result<String, KernelWsError> {
        let cursor_pos = cursor_pos.unwrap_or(code.chars().count());
        self.send_on(
            Channel::Shell,
            "inspect_request",
            json!({"code": code, "cursor_pos": cursor_pos, "detail_level": detail_level}),
        )
    }

    pub fn history(&self, raw: bool, output: bool, access: HistoryAccess) -> Result<String, KernelWsError> {
        let mut content = json!({"raw": raw, "output": output});
        let extra = match access {
            HistoryAccess::Range {
                session,
                start,
                stop,
            } => json!({
                "hist_access_type": "range",
                "session": session,
                "start": start,
                "stop": stop,
            }),
            HistoryAccess::Tail { n } => json!({"hist_access_type": "tail", "n": n}),
            HistoryAccess::Search { pattern, unique, n } => json!({
                "hist_access_type": "search",
                "pattern": pattern,
                "unique": unique,
                "n": n,
            }),
        };
        if let (Some(map), Value::Object(extra)) = (content.as_object_mut(), extra) {
            map.extend(extra);
        }
        self.send_on(Channel::Shell, "history_request", content)
    }

    pub fn kernel_info(&self) -> Result<String, KernelWsError> {
        self.send_on(Channel::Shell, "kernel_info_request", json!({}))
    }

    pub fn comm_info(&self, target_name: Option<&str>) -> Result<String, KernelWsError> {
        let content = match target_name {
            Some(target) => json!({"target_name": target}),
            None => json!({}),
        };
        self.send_on(Channel::Shell, "comm_info_request", content)
    }

    pub fn is_complete(&self, code: &str) -> Result<String, KernelWsError> {
        self.send_on(Channel::Shell, "is_complete_request", json!({"code": code}))
    }

    /// Answer an `input_request`. Travels on stdin.
    pub fn input(&self, value: &str) -> Result<String, KernelWsError> {
        self.send_on(Channel::Stdin, "input_reply", json!({"value": value}))
    }

    /// Request shutdown or restart. Travels on control.
    pub fn shutdown(&self, restart: bool) -> Result<String, KernelWsError> {
        self.send_on(Channel::Control, "shutdown_request", json!({"restart": restart}))
    }

    pub fn interrupt(&self) -> Result<String, KernelWsError> {
        self.send_on(Channel::Control, "interrupt_request", json!({}))
    }
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "username".to_string())
}

/// `<base>/api/kernels/<id>/channels` with a WebSocket scheme.
fn channels_endpoint(base_url: &str, kernel_id: &str) -> Result<Url, KernelWsError> {
    let invalid = || KernelWsError::InvalidArgument(format!("invalid server URL '{}'", base_url));
    let mut url = Url::parse(base_url).map_err(|_| invalid())?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        _ => return Err(invalid()),
    };
    url.set_scheme(scheme).map_err(|_| invalid())?;
    url.set_query(None);
    url.set_fragment(None);
    url.path_segments_mut()
        .map_err(|_| invalid())?
        .pop_if_empty()
        .extend(["api", "kernels", kernel_id, "channels"]);
    Ok(url)
}

/// Wait for the reply to `msg_id` on an already-subscribed channel.
pub async fn wait_for_reply(
    rx: &mut broadcast::Receiver<JupyterMessage>,
    msg_id: &str,
    timeout: Duration,
) -> Result<JupyterMessage, KernelWsError> {
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(msg) if msg.parent_msg_id() == Some(msg_id) => return Ok(msg),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("[kernel-ws] Reply waiter lagged by {} messages", n);
                }
                Err(broadcast::error::RecvError::Closed) => return Err(KernelWsError::NotConnected),
            }
        }
    };
    match tokio::time::timeout(timeout, wait).await {
        Ok(result) => result,
        Err(_) => Err(KernelWsError::Timeout(format!("reply to {}", msg_id))),
    }
}

struct ReceiverContext {
    transport: Arc<Transport>,
    channels: [Arc<WsChannel>; 4],
    heartbeat: Arc<HeartbeatChannel>,
    events: broadcast::Sender<ClientEvent>,
    max_msg_size: usize,
}

impl ReceiverContext {
    fn channel(&self, channel: Channel) -> &Arc<WsChannel> {
        match channel {
            Channel::Shell => &self.channels[0],
            Channel::Iopub => &self.channels[1],
            Channel::Stdin => &self.channels[2],
            Channel::Control => &self.channels[3],
        }
    }

    fn dispatch_frame(&self, frame: &[u8]) -> Result<bool, KernelWsError> {
        let (name, parts) = codec::deserialize_frame(frame)?;
        if name == "closed" {
            return Ok(false);
        }
        let Ok(channel) = name.parse::<Channel>() else {
            warn!("[kernel-ws] Dropping message on unknown channel {:?}", name);
            return Ok(true);
        };
        let msg = self.transport.session().deserialize(&name, &parts)?;

        if channel == Channel::Iopub && msg.is_status("restarting") {
            self.heartbeat.rearm();
            let _ = self.events.send(ClientEvent::Restarting);
        }
        if !self.channel(channel).enqueue(msg) {
            debug!("[kernel-ws] {} not started, message dropped", channel);
        }
        Ok(true)
    }

    fn fail(&self, code: CloseCode, error: KernelWsError) -> Result<(), KernelWsError> {
        self.transport.close(code, "");
        for channel in &self.channels {
            channel.report_error(&error);
        }
        let _ = self.events.send(ClientEvent::ReceiverFailed(error.to_string()));
        Err(error)
    }

    fn overflow(&self) -> Result<(), KernelWsError> {
        error!(
            "[kernel-ws] Message exceeded the {} byte limit, closing",
            self.max_msg_size
        );
        let _ = self.events.send(ClientEvent::MessageSizeOverflow {
            limit: self.max_msg_size,
        });
        self.fail(
            CloseCode::Size,
            KernelWsError::MessageTooBig {
                limit: self.max_msg_size,
            },
        )
    }
}

async fn receive_loop(
    mut stream: futures::stream::SplitStream<WsStream>,
    ctx: ReceiverContext,
) -> Result<(), KernelWsError> {
    let result = loop {
        let Some(next) = stream.next().await else {
            break Ok(());
        };
        match next {
            Ok(WsMessage::Binary(frame)) => {
                ctx.heartbeat.beat();
                match ctx.dispatch_frame(&frame) {
                    Ok(true) => {}
                    Ok(false) => break Ok(()),
                    Err(e) => break ctx.fail(CloseCode::Error, e),
                }
            }
            Ok(WsMessage::Pong(_)) | Ok(WsMessage::Ping(_)) => ctx.heartbeat.beat(),
            Ok(WsMessage::Close(frame)) => {
                if frame.as_ref().is_some_and(|f| f.code == CloseCode::Size) {
                    break ctx.overflow();
                }
                break Ok(());
            }
            Ok(WsMessage::Text(_)) | Ok(WsMessage::Frame(_)) => {
                warn!("[kernel-ws] Ignoring non-binary frame");
            }
            Err(tungstenite::Error::Capacity(CapacityError::MessageTooLong { .. })) => {
                break ctx.overflow();
            }
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                break Ok(());
            }
            Err(e) => break ctx.fail(CloseCode::Error, e.into()),
        }
    };
    ctx.transport.detach();
    let _ = ctx.events.send(ClientEvent::Closed);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channels_endpoint() {
        let endpoint = |base, id| channels_endpoint(base, id).unwrap().to_string();
        assert_eq!(
            endpoint("http://127.0.0.1:8888/", "k1"),
            "ws://127.0.0.1:8888/api/kernels/k1/channels"
        );
        assert_eq!(
            endpoint("https://host/base", "k1"),
            "wss://host/base/api/kernels/k1/channels"
        );
        assert_eq!(endpoint("ws://host:1", "k"), "ws://host:1/api/kernels/k/channels");
        assert_eq!(
            endpoint("http://host", "a/b c"),
            "ws://host/api/kernels/a%2Fb%20c/channels"
        );
        assert!(matches!(
            channels_endpoint("ftp://host", "k"),
            Err(KernelWsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_url_carries_session() {
        let client = KernelWsClient::new("http://localhost:9", "kid");
        let url = client.url().unwrap();
        assert!(url
            .as_str()
            .ends_with(&format!("?session_id={}", client.session().session_id())));
    }

    #[test]
    fn test_execute_request_from_json() {
        let req = ExecuteRequest::from_json(&json!({
            "code": "a = 10",
            "user_expressions": {"x": "a"},
            "silent": true,
        }))
        .unwrap();
        assert_eq!(req.code, "a = 10");
        assert!(req.silent);
        assert!(req.store_history);
        assert_eq!(req.user_expressions.get("x").map(String::as_str), Some("a"));
        assert_eq!(req.allow_stdin, None);
    }

    #[test]
    fn test_execute_request_rejects_non_string_code() {
        let err = ExecuteRequest::from_json(&json!({"code": 42})).unwrap_err();
        assert!(matches!(err, KernelWsError::InvalidArgument(_)));
    }

    #[test]
    fn test_execute_request_rejects_bad_user_expressions() {
        let err = ExecuteRequest::from_json(&json!({"code": "", "user_expressions": {"x": 1}}))
            .unwrap_err();
        assert!(matches!(err, KernelWsError::InvalidArgument(_)));
        let err = ExecuteRequest::from_json(&json!({"code": "", "user_expressions": ["x"]}))
            .unwrap_err();
        assert!(matches!(err, KernelWsError::InvalidArgument(_)));
    }

    #[test]
    fn test_requests_fail_when_not_started() {
        let client = KernelWsClient::new("http://localhost:9", "kid");
        assert!(matches!(
            client.execute_code("1"),
            Err(KernelWsError::NotConnected)
        ));
    }

    #[test]
    fn test_history_defaults_to_range_from_zero() {
        match HistoryAccess::default() {
            HistoryAccess::Range { session, start, stop } => {
                assert_eq!((session, start, stop), (0, 0, None));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
