//! End-to-end tests against an in-process mock kernel served over axum.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tokio::sync::broadcast;

use kernel_ws::codec;
use kernel_ws::{
    wait_for_reply, Channel, ChannelSelection, ClientEvent, ExecuteRequest, JupyterMessage,
    KernelWsClient, KernelWsError, Session, KERNEL_WS_PROTOCOL,
};

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct MockKernel {
    protocol_version: &'static str,
    /// Accept the socket and never read from it.
    silent: bool,
    /// Answer execute requests with an oversized stream message.
    oversize: bool,
    seen: Arc<Mutex<Vec<String>>>,
    queries: Arc<Mutex<Vec<HashMap<String, String>>>>,
}

impl MockKernel {
    fn new() -> Self {
        Self {
            protocol_version: "5.3",
            silent: false,
            oversize: false,
            seen: Arc::new(Mutex::new(Vec::new())),
            queries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn respond(&self, session: &Session, req: &JupyterMessage) -> Vec<(&'static str, JupyterMessage)> {
        let v4 = self.protocol_version.starts_with('4');
        let reply = |msg_type: &str, content| session.msg(msg_type, content, Some(req));
        let status = |state: &str| ("iopub", reply("status", json!({"execution_state": state})));

        let mut out = match req.msg_type() {
            "kernel_info_request" => vec![(
                "shell",
                reply(
                    "kernel_info_reply",
                    json!({
                        "status": "ok",
                        "protocol_version": self.protocol_version,
                        "implementation": "mock",
                    }),
                ),
            )],
            "execute_request" => {
                let code = req.content["code"].as_str().unwrap_or_default();
                let text = if self.oversize {
                    "x".repeat(64 * 1024)
                } else {
                    format!("{}\n", code)
                };
                let mut content = json!({"name": "stdout"});
                content[if v4 { "data" } else { "text" }] = json!(text);
                vec![
                    status("busy"),
                    ("iopub", reply("stream", content)),
                    (
                        "shell",
                        reply("execute_reply", json!({"status": "ok", "execution_count": 1})),
                    ),
                    status("idle"),
                ]
            }
            "inspect_request" | "object_info_request" => {
                let name = req
                    .content
                    .get("oname")
                    .or_else(|| req.content.get("code"))
                    .cloned()
                    .unwrap_or_default();
                let msg_type = if v4 { "object_info_reply" } else { "inspect_reply" };
                vec![(
                    "shell",
                    reply(msg_type, json!({"status": "ok", "found": true, "name": name})),
                )]
            }
            "shutdown_request" => {
                let restart = req.content["restart"].as_bool().unwrap_or(false);
                let mut out = Vec::new();
                if restart {
                    out.push(status("restarting"));
                }
                out.push((
                    "control",
                    reply("shutdown_reply", json!({"status": "ok", "restart": restart})),
                ));
                out
            }
            _ => Vec::new(),
        };
        if v4 {
            for (_, msg) in out.iter_mut() {
                msg.header.version = None;
            }
        }
        out
    }
}

async fn channels(
    ws: WebSocketUpgrade,
    Path(_kernel_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    State(kernel): State<MockKernel>,
) -> impl IntoResponse {
    kernel.queries.lock().unwrap().push(query);
    ws.protocols([KERNEL_WS_PROTOCOL])
        .on_upgrade(move |socket| serve(socket, kernel))
}

async fn serve(mut socket: WebSocket, kernel: MockKernel) {
    if kernel.silent {
        tokio::time::sleep(Duration::from_secs(30)).await;
        return;
    }
    let session = Session::new("kernel");
    while let Some(Ok(message)) = socket.recv().await {
        let Message::Binary(frame) = message else {
            continue;
        };
        let (_channel, request) = codec::decode_message(&frame).unwrap();
        kernel
            .seen
            .lock()
            .unwrap()
            .push(request.header.msg_type.clone());
        for (channel, reply) in kernel.respond(&session, &request) {
            let bytes = codec::encode_message(channel, &reply).unwrap();
            if socket.send(Message::Binary(bytes.into())).await.is_err() {
                return;
            }
        }
    }
}

async fn spawn_kernel(kernel: MockKernel) -> String {
    let app = Router::new()
        .route("/api/kernels/{kernel_id}/channels", get(channels))
        .with_state(kernel);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn next_event(
    rx: &mut broadcast::Receiver<ClientEvent>,
    accept: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    tokio::time::timeout(REPLY_TIMEOUT, async {
        loop {
            let event = rx.recv().await.unwrap();
            if accept(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not received in time")
}

#[tokio::test]
async fn test_kernel_info_reply_and_connect_query() {
    let kernel = MockKernel::new();
    let base = spawn_kernel(kernel.clone()).await;
    let client = KernelWsClient::new(&base, "k1").with_token("secret");
    client.start_channels(ChannelSelection::default()).await.unwrap();

    let mut shell = client.subscribe(Channel::Shell);
    let msg_id = client.kernel_info().unwrap();
    let reply = wait_for_reply(&mut shell, &msg_id, REPLY_TIMEOUT).await.unwrap();
    assert_eq!(reply.msg_type(), "kernel_info_reply");
    assert_eq!(reply.channel, Some(Channel::Shell));

    let queries = kernel.queries.lock().unwrap().clone();
    assert_eq!(queries.len(), 1);
    assert_eq!(
        queries[0].get("session_id").map(String::as_str),
        Some(client.session().session_id())
    );
    assert_eq!(queries[0].get("token").map(String::as_str), Some("secret"));

    client.stop_channels().await;
}

#[tokio::test]
async fn test_token_with_reserved_characters_is_one_query_value() {
    let kernel = MockKernel::new();
    let base = spawn_kernel(kernel.clone()).await;
    let client = KernelWsClient::new(&base, "k1").with_token("a&b=c d+e");
    client.start_channels(ChannelSelection::default()).await.unwrap();

    let queries = kernel.queries.lock().unwrap().clone();
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].get("token").map(String::as_str), Some("a&b=c d+e"));
    assert!(!queries[0].contains_key("b"));
    assert_eq!(queries[0].len(), 2);

    client.stop_channels().await;
}

#[tokio::test]
async fn test_iopub_output_arrives_in_order() {
    let base = spawn_kernel(MockKernel::new()).await;
    let client = KernelWsClient::new(&base, "k1");
    client.start_channels(ChannelSelection::default()).await.unwrap();
    let mut iopub = client.subscribe(Channel::Iopub);

    for i in 0..10 {
        client.execute(ExecuteRequest::new(i.to_string())).unwrap();
    }

    let mut texts = Vec::new();
    tokio::time::timeout(REPLY_TIMEOUT, async {
        while texts.len() < 10 {
            let msg = iopub.recv().await.unwrap();
            if msg.msg_type() == "stream" {
                texts.push(msg.content["text"].as_str().unwrap().to_string());
            }
        }
    })
    .await
    .unwrap();

    let expected: Vec<String> = (0..10).map(|i| format!("{}\n", i)).collect();
    assert_eq!(texts, expected);
    client.stop_channels().await;
}

#[tokio::test]
async fn test_v4_kernel_is_adapted() {
    let mut kernel = MockKernel::new();
    kernel.protocol_version = "4.1";
    let base = spawn_kernel(kernel.clone()).await;
    let client = KernelWsClient::new(&base, "k1");
    client.start_channels(ChannelSelection::default()).await.unwrap();

    let mut shell = client.subscribe(Channel::Shell);
    let mut iopub = client.subscribe(Channel::Iopub);
    let info_id = client.kernel_info().unwrap();
    wait_for_reply(&mut shell, &info_id, REPLY_TIMEOUT).await.unwrap();
    assert_eq!(client.session().adapter_version(), 4);

    let inspect_id = client.inspect("len", None, 0).unwrap();
    let reply = wait_for_reply(&mut shell, &inspect_id, REPLY_TIMEOUT).await.unwrap();
    assert_eq!(reply.msg_type(), "inspect_reply");
    assert_eq!(reply.content["name"], "len");
    assert!(kernel
        .seen
        .lock()
        .unwrap()
        .iter()
        .any(|t| t == "object_info_request"));

    client.execute_code("a").unwrap();
    let stream = tokio::time::timeout(REPLY_TIMEOUT, async {
        loop {
            let msg = iopub.recv().await.unwrap();
            if msg.msg_type() == "stream" {
                return msg;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(stream.content["text"], "a\n");
    assert!(stream.content.get("data").is_none());

    client.stop_channels().await;
}

#[tokio::test]
async fn test_start_and_stop_are_idempotent() {
    let base = spawn_kernel(MockKernel::new()).await;
    let client = KernelWsClient::new(&base, "k1");

    client.start_channels(ChannelSelection::default()).await.unwrap();
    client.start_channels(ChannelSelection::default()).await.unwrap();
    assert!(client.channels_running().await);

    client.stop_channels().await;
    client.stop_channels().await;
    assert!(!client.channels_running().await);
    assert!(matches!(
        client.kernel_info(),
        Err(KernelWsError::NotConnected)
    ));

    client.start_channels(ChannelSelection::default()).await.unwrap();
    let mut shell = client.subscribe(Channel::Shell);
    let msg_id = client.kernel_info().unwrap();
    wait_for_reply(&mut shell, &msg_id, REPLY_TIMEOUT).await.unwrap();
    client.stop_channels().await;
}

#[tokio::test]
async fn test_restarting_status_is_reported() {
    let base = spawn_kernel(MockKernel::new()).await;
    let client = KernelWsClient::new(&base, "k1");
    let mut events = client.events();
    client.start_channels(ChannelSelection::default()).await.unwrap();

    let mut control = client.subscribe(Channel::Control);
    let msg_id = client.shutdown(true).unwrap();
    next_event(&mut events, |e| matches!(e, ClientEvent::Restarting)).await;
    let reply = wait_for_reply(&mut control, &msg_id, REPLY_TIMEOUT).await.unwrap();
    assert_eq!(reply.content["restart"], true);

    client.stop_channels().await;
}

#[tokio::test]
async fn test_silent_kernel_is_declared_dead_once() {
    let mut kernel = MockKernel::new();
    kernel.silent = true;
    let base = spawn_kernel(kernel).await;
    let client = KernelWsClient::with_session(
        &base,
        "k1",
        Session::new("tester"),
        Duration::from_millis(100),
    );
    let mut events = client.events();
    client.start_channels(ChannelSelection::default()).await.unwrap();

    let event = next_event(&mut events, |e| matches!(e, ClientEvent::KernelDied { .. })).await;
    if let ClientEvent::KernelDied { since_last_beat } = event {
        assert!(since_last_beat > Duration::from_millis(200));
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    let mut deaths = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, ClientEvent::KernelDied { .. }) {
            deaths += 1;
        }
    }
    assert_eq!(deaths, 0);
    assert!(!client.heartbeat().is_alive());

    client.stop_channels().await;
}

#[tokio::test]
async fn test_oversized_message_closes_socket() {
    let mut kernel = MockKernel::new();
    kernel.oversize = true;
    let base = spawn_kernel(kernel).await;
    let client = KernelWsClient::new(&base, "k1").with_max_msg_size(4096);
    let mut events = client.events();
    client.start_channels(ChannelSelection::default()).await.unwrap();

    client.execute_code("big").unwrap();
    let event = next_event(&mut events, |e| {
        matches!(e, ClientEvent::MessageSizeOverflow { .. })
    })
    .await;
    assert!(matches!(
        event,
        ClientEvent::MessageSizeOverflow { limit: 4096 }
    ));

    let result = client.wait_closed().await;
    assert!(matches!(
        result,
        Err(KernelWsError::MessageTooBig { limit: 4096 })
    ));
    client.stop_channels().await;
}
