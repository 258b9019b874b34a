//! In-process stand-ins for the remote side: an axum mock agent serving the
//! kernel, environ and fs routes, and a scripted shell that plays the host.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::net::SocketAddr;
use std::os::unix::fs::MetadataExt;
use std::path::{Path as FsPath, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use remote_client::shell::{run_with_options, TunnelStream};
use remote_client::{
    CommandOutput, HostConfig, RemoteError, RemoteProcess, RemoteShell, Result, RunOptions,
    SessionEvent, ShellFactory,
};

pub const TOKEN: &str = "agent-token";

#[cfg(target_os = "linux")]
pub const EWOULDBLOCK: i32 = 11;
#[cfg(not(target_os = "linux"))]
pub const EWOULDBLOCK: i32 = 35;

pub const ENOENT: i32 = 2;

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_for<F: FnMut() -> bool>(mut check: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

// ============================================================================
// Mock agent
// ============================================================================

#[derive(Clone, Default)]
pub struct MockAgent {
    inner: Arc<AgentState>,
}

#[derive(Default)]
pub struct AgentState {
    kernels: Mutex<BTreeMap<String, Value>>,
    env: Mutex<BTreeMap<String, String>>,
    locks: Mutex<HashSet<String>>,
    /// Fail this many kernel creations with a 500 before succeeding.
    pub fail_creates: AtomicUsize,
    /// Refuse every file open with a close reason over the 123-byte limit.
    pub oversized_refusal: AtomicBool,
    pub creates: AtomicUsize,
    next_port: AtomicUsize,
}

impl MockAgent {
    pub fn state(&self) -> &AgentState {
        &self.inner
    }

    pub fn kernel_ids(&self) -> Vec<String> {
        self.inner.kernels.lock().unwrap().keys().cloned().collect()
    }
}

pub async fn spawn_agent(agent: MockAgent) -> SocketAddr {
    let app = Router::new()
        .route("/spyder-service/kernel", get(list_kernels).post(create_kernel))
        .route(
            "/spyder-service/kernel/{id}",
            get(kernel_info).delete(delete_kernel),
        )
        .route("/spyder-service/kernel/{id}/interrupt", post(kernel_flag))
        .route("/spyder-service/kernel/{id}/restart", post(kernel_flag))
        .route("/spyder-services/environ", get(env_dict))
        .route(
            "/spyder-services/environ/{name}",
            get(env_get).post(env_set).delete(env_delete),
        )
        .route("/spyder-services/fs/open/{*uri}", get(fs_open))
        .route(
            "/spyder-services/fs/{op}/{*uri}",
            get(fs_get).post(fs_post).delete(fs_delete),
        )
        .route_layer(middleware::from_fn_with_state(agent.clone(), require_token))
        .with_state(agent);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn require_token(State(_agent): State<MockAgent>, request: Request, next: Next) -> Response {
    let expected = format!("token {}", TOKEN);
    match request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        Some(value) if value == expected => next.run(request).await,
        _ => StatusCode::FORBIDDEN.into_response(),
    }
}

// --- kernels ---------------------------------------------------------------

async fn create_kernel(State(agent): State<MockAgent>) -> Response {
    let state = agent.state();
    state.creates.fetch_add(1, Ordering::SeqCst);
    let remaining = state.fail_creates.load(Ordering::SeqCst);
    if remaining > 0 {
        state.fail_creates.store(remaining - 1, Ordering::SeqCst);
        return (StatusCode::INTERNAL_SERVER_ERROR, "kernel manager not ready").into_response();
    }
    let id = uuid::Uuid::new_v4().to_string();
    let base = 50000 + 10 * state.next_port.fetch_add(1, Ordering::SeqCst) as u16;
    let descriptor = json!({
        "id": id,
        "ip": "127.0.0.1",
        "transport": "tcp",
        "shell_port": base + 1,
        "iopub_port": base + 2,
        "stdin_port": base + 3,
        "control_port": base + 4,
        "hb_port": base + 5,
        "key": "kernel-key",
        "signature_scheme": "hmac-sha256",
        "kernel_name": "python3"
    });
    state
        .kernels
        .lock()
        .unwrap()
        .insert(id, descriptor.clone());
    Json(descriptor).into_response()
}

async fn list_kernels(State(agent): State<MockAgent>) -> Json<Value> {
    let kernels: Vec<Value> = agent.state().kernels.lock().unwrap().values().cloned().collect();
    Json(json!({ "kernels": kernels }))
}

async fn kernel_info(State(agent): State<MockAgent>, Path(id): Path<String>) -> Response {
    match agent.state().kernels.lock().unwrap().get(&id) {
        Some(descriptor) => {
            let mut connection_info = descriptor.clone();
            if let Some(map) = connection_info.as_object_mut() {
                map.remove("id");
            }
            Json(json!({"alive": true, "pid": 4321, "connection_info": connection_info}))
                .into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn delete_kernel(State(agent): State<MockAgent>, Path(id): Path<String>) -> Response {
    let removed = agent.state().kernels.lock().unwrap().remove(&id).is_some();
    Json(json!({ "success": removed })).into_response()
}

async fn kernel_flag(State(agent): State<MockAgent>, Path(id): Path<String>) -> Json<Value> {
    let known = agent.state().kernels.lock().unwrap().contains_key(&id);
    Json(json!({ "success": known }))
}

// --- environ ---------------------------------------------------------------

async fn env_dict(State(agent): State<MockAgent>) -> Json<Value> {
    Json(json!(agent.state().env.lock().unwrap().clone()))
}

async fn env_get(State(agent): State<MockAgent>, Path(name): Path<String>) -> Response {
    match agent.state().env.lock().unwrap().get(&name) {
        Some(value) => value.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn env_set(
    State(agent): State<MockAgent>,
    Path(name): Path<String>,
    Json(body): Json<Value>,
) -> StatusCode {
    let value = body["value"].as_str().unwrap_or_default().to_string();
    agent.state().env.lock().unwrap().insert(name, value);
    StatusCode::OK
}

async fn env_delete(State(agent): State<MockAgent>, Path(name): Path<String>) -> StatusCode {
    match agent.state().env.lock().unwrap().remove(&name) {
        Some(_) => StatusCode::OK,
        None => StatusCode::NOT_FOUND,
    }
}

// --- fs --------------------------------------------------------------------

fn fs_path(uri: &str) -> String {
    let uri = uri.trim_start_matches('/');
    uri.strip_prefix("file://").unwrap_or(uri).to_string()
}

fn os_error_body(error: &io::Error, path: &str) -> Value {
    json!({
        "status": 417,
        "errno": error.raw_os_error().unwrap_or(0),
        "strerror": error.to_string(),
        "filename": path,
    })
}

fn os_error(error: &io::Error, path: &str) -> Response {
    (StatusCode::EXPECTATION_FAILED, Json(os_error_body(error, path))).into_response()
}

fn flag(query: &HashMap<String, String>, name: &str) -> bool {
    query.get(name).is_some_and(|v| v == "true")
}

fn seconds(time: io::Result<std::time::SystemTime>) -> Option<f64> {
    time.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
}

fn entry(path: &FsPath) -> io::Result<Value> {
    let meta = std::fs::symlink_metadata(path)?;
    let is_link = meta.file_type().is_symlink();
    let kind = if is_link {
        "link"
    } else if meta.is_dir() {
        "directory"
    } else {
        "file"
    };
    Ok(json!({
        "name": path.to_string_lossy(),
        "size": meta.len(),
        "type": kind,
        "created": seconds(meta.created()),
        "islink": is_link,
        "mode": meta.mode(),
        "uid": meta.uid(),
        "gid": meta.gid(),
        "mtime": seconds(meta.modified()),
        "ino": meta.ino(),
        "nlink": meta.nlink(),
    }))
}

fn ls(path: &FsPath, detail: bool) -> io::Result<Value> {
    let meta = std::fs::metadata(path)?;
    let mut paths = if meta.is_dir() {
        std::fs::read_dir(path)?
            .map(|e| e.map(|e| e.path()))
            .collect::<io::Result<Vec<PathBuf>>>()?
    } else {
        vec![path.to_path_buf()]
    };
    paths.sort();
    if detail {
        Ok(Value::Array(
            paths.iter().map(|p| entry(p)).collect::<io::Result<_>>()?,
        ))
    } else {
        Ok(json!(paths
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect::<Vec<_>>()))
    }
}

fn zip_dir(path: &FsPath) -> io::Result<Vec<u8>> {
    let mut writer = zip::ZipWriter::new(io::Cursor::new(Vec::new()));
    let mut names: Vec<PathBuf> = std::fs::read_dir(path)?
        .map(|e| e.map(|e| e.path()))
        .collect::<io::Result<_>>()?;
    names.sort();
    for file in names.into_iter().filter(|p| p.is_file()) {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        writer
            .start_file(name, zip::write::SimpleFileOptions::default())
            .map_err(io::Error::other)?;
        writer.write_all(&std::fs::read(&file)?)?;
    }
    Ok(writer.finish().map_err(io::Error::other)?.into_inner())
}

async fn fs_get(
    Path((op, uri)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let path = fs_path(&uri);
    let target = FsPath::new(&path);
    let result = match op.as_str() {
        "ls" => ls(target, flag(&query, "detail")),
        "info" => entry(target),
        "exists" => Ok(json!(target.exists())),
        "isfile" => Ok(json!(target.is_file())),
        "isdir" => Ok(json!(target.is_dir())),
        "zip" => {
            return match zip_dir(target) {
                Ok(bytes) => {
                    let chunks: Vec<io::Result<Vec<u8>>> =
                        bytes.chunks(1024).map(|c| Ok(c.to_vec())).collect();
                    (
                        [(header::CONTENT_TYPE, "application/zip")],
                        Body::from_stream(futures::stream::iter(chunks)),
                    )
                        .into_response()
                }
                Err(e) => os_error(&e, &path),
            }
        }
        _ => return StatusCode::NOT_FOUND.into_response(),
    };
    match result {
        Ok(value) => Json(value).into_response(),
        Err(e) => os_error(&e, &path),
    }
}

fn set_mtime(path: &FsPath, time: std::time::SystemTime) -> io::Result<()> {
    File::options().write(true).open(path)?.set_modified(time)
}

async fn fs_post(
    Path((op, uri)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let path = fs_path(&uri);
    let target = FsPath::new(&path);
    let dest = query.get("dest").map(|d| fs_path(d));
    let result: io::Result<()> = match (op.as_str(), dest) {
        ("mkdir", _) => {
            if flag(&query, "exist_ok") && target.is_dir() {
                Ok(())
            } else if flag(&query, "create_parents") {
                if target.exists() {
                    Err(io::Error::from_raw_os_error(17))
                } else {
                    std::fs::create_dir_all(target)
                }
            } else {
                std::fs::create_dir(target)
            }
        }
        ("copy", Some(dest)) => std::fs::copy(target, &dest).and_then(|_| {
            if flag(&query, "metadata") {
                set_mtime(FsPath::new(&dest), std::fs::metadata(target)?.modified()?)
            } else {
                Ok(())
            }
        }),
        ("move", Some(dest)) => std::fs::rename(target, dest),
        ("touch", _) => {
            if flag(&query, "truncate") {
                File::create(target).map(|_| ())
            } else {
                File::options()
                    .create(true)
                    .append(true)
                    .open(target)
                    .and_then(|f| f.set_modified(std::time::SystemTime::now()))
            }
        }
        _ => return StatusCode::BAD_REQUEST.into_response(),
    };
    match result {
        Ok(()) => Json(json!({"success": true})).into_response(),
        Err(e) => os_error(&e, &path),
    }
}

async fn fs_delete(
    Path((op, uri)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let path = fs_path(&uri);
    let result = match op.as_str() {
        "rmdir" => std::fs::remove_dir(&path),
        "file" => match std::fs::remove_file(&path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound && flag(&query, "missing_ok") => Ok(()),
            other => other,
        },
        _ => return StatusCode::NOT_FOUND.into_response(),
    };
    match result {
        Ok(()) => Json(json!({"success": true})).into_response(),
        Err(e) => os_error(&e, &path),
    }
}

// --- fs/open ---------------------------------------------------------------

async fn fs_open(
    ws: WebSocketUpgrade,
    State(agent): State<MockAgent>,
    Path(uri): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let path = fs_path(&uri);
    ws.on_upgrade(move |socket| serve_file(socket, agent, path, query))
}

/// Close reasons are capped at 123 bytes, so the filename stays out.
async fn refuse(socket: WebSocket, mut body: Value) {
    if let Some(body) = body.as_object_mut() {
        body.remove("filename");
    }
    let reason = body.to_string();
    assert!(reason.len() <= 123, "close reason too long: {reason}");
    close_with(socket, reason).await;
}

async fn close_with(mut socket: WebSocket, reason: String) {
    let frame = CloseFrame {
        code: 1002,
        reason: reason.into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

fn open_file(path: &FsPath, mode: &str) -> io::Result<File> {
    let plus = mode.contains('+');
    let mut options = File::options();
    if mode.contains('r') {
        options.read(true).write(plus);
    } else if mode.contains('w') {
        options.write(true).create(true).truncate(true).read(plus);
    } else if mode.contains('a') {
        options.append(true).create(true).read(plus);
    } else if mode.contains('x') {
        options.write(true).create_new(true).read(plus);
    } else {
        return Err(io::Error::from_raw_os_error(22));
    }
    options.open(path)
}

async fn serve_file(
    mut socket: WebSocket,
    agent: MockAgent,
    path: String,
    query: HashMap<String, String>,
) {
    let mode = query.get("mode").cloned().unwrap_or_else(|| "r".into());
    let writes = mode.contains(['w', 'a', 'x', '+']);

    if agent.state().oversized_refusal.load(Ordering::SeqCst) {
        let body = json!({"status": 500, "type": "OSError", "message": "x".repeat(200)});
        close_with(socket, body.to_string()).await;
        return;
    }
    let atomic = flag(&query, "atomic") && writes;

    if flag(&query, "lock") && !agent.state().locks.lock().unwrap().insert(path.clone()) {
        let error = io::Error::from_raw_os_error(EWOULDBLOCK);
        let mut body = os_error_body(&error, &path);
        body["status"] = json!(423);
        refuse(socket, body).await;
        return;
    }
    let locked = flag(&query, "lock");

    let target = PathBuf::from(&path);
    let working = if atomic {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = target.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4()));
        if mode.contains(['a', '+']) && target.exists() {
            if let Err(e) = std::fs::copy(&target, &tmp) {
                release(&agent, &path, locked);
                refuse(socket, os_error_body(&e, &path)).await;
                return;
            }
        }
        tmp
    } else {
        target.clone()
    };

    let mut file = match open_file(&working, &mode) {
        Ok(file) => file,
        Err(e) => {
            release(&agent, &path, locked);
            refuse(socket, os_error_body(&e, &path)).await;
            return;
        }
    };

    if socket
        .send(Message::Binary(json!({"status": 200}).to_string().into_bytes().into()))
        .await
        .is_err()
    {
        release(&agent, &path, locked);
        return;
    }

    let binary = mode.contains('b');
    let mut committed = false;
    loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => {
                let request: Value = serde_json::from_str(text.as_str()).unwrap_or_default();
                let reply = handle_request(&mut file, &mode, binary, &request, &path);
                let bytes = reply.to_string().into_bytes();
                if socket.send(Message::Binary(bytes.into())).await.is_err() {
                    break;
                }
            }
            Some(Ok(Message::Close(_))) => {
                committed = true;
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => break,
        }
    }

    drop(file);
    if atomic {
        if committed {
            let _ = std::fs::rename(&working, &target);
        } else {
            let _ = std::fs::remove_file(&working);
        }
    }
    release(&agent, &path, locked);
    drop(socket);
}

fn release(agent: &MockAgent, path: &str, locked: bool) {
    if locked {
        agent.state().locks.lock().unwrap().remove(path);
    }
}

fn read_line(file: &mut File, limit: i64) -> io::Result<Vec<u8>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    while limit < 0 || (line.len() as i64) < limit {
        if file.read(&mut byte)? == 0 {
            break;
        }
        line.push(byte[0]);
        if byte[0] == b'\n' {
            break;
        }
    }
    Ok(line)
}

fn handle_request(file: &mut File, mode: &str, binary: bool, request: &Value, path: &str) -> Value {
    let method = request["method"].as_str().unwrap_or_default();
    let encode = |bytes: &[u8]| json!(BASE64.encode(bytes));
    let decode = |value: &Value| BASE64.decode(value.as_str().unwrap_or_default()).unwrap_or_default();

    let result: io::Result<Value> = (|| match method {
        "read" => {
            let n = request["n"].as_i64().unwrap_or(-1);
            let mut buf = Vec::new();
            if n < 0 {
                file.read_to_end(&mut buf)?;
            } else {
                (&mut *file).take(n as u64).read_to_end(&mut buf)?;
            }
            Ok(encode(&buf))
        }
        "readline" => Ok(encode(&read_line(file, request["size"].as_i64().unwrap_or(-1))?)),
        "readlines" => {
            let mut lines = Vec::new();
            loop {
                let line = read_line(file, -1)?;
                if line.is_empty() {
                    break;
                }
                lines.push(encode(&line));
            }
            Ok(Value::Array(lines))
        }
        "write" => {
            let data = decode(&request["data"]);
            file.write_all(&data)?;
            let count = if binary {
                data.len()
            } else {
                String::from_utf8_lossy(&data).chars().count()
            };
            Ok(json!(count))
        }
        "writelines" => {
            for line in request["lines"].as_array().cloned().unwrap_or_default() {
                file.write_all(&decode(&line))?;
            }
            Ok(Value::Null)
        }
        "seek" => {
            let offset = request["offset"].as_i64().unwrap_or(0);
            let from = match request["whence"].as_i64().unwrap_or(0) {
                1 => SeekFrom::Current(offset),
                2 => SeekFrom::End(offset),
                _ => SeekFrom::Start(offset.max(0) as u64),
            };
            Ok(json!(file.seek(from)?))
        }
        "tell" => Ok(json!(file.stream_position()?)),
        "truncate" => {
            let size = match request["size"].as_u64() {
                Some(size) => size,
                None => file.stream_position()?,
            };
            file.set_len(size)?;
            Ok(json!(size))
        }
        "flush" => {
            file.flush()?;
            Ok(Value::Null)
        }
        "fileno" => {
            use std::os::unix::io::AsRawFd;
            Ok(json!(file.as_raw_fd()))
        }
        "isatty" => Ok(json!(false)),
        "readable" => Ok(json!(mode.contains(['r', '+']))),
        "writable" => Ok(json!(mode.contains(['w', 'a', 'x', '+']))),
        other => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("unknown method {}", other),
        )),
    })();

    match result {
        Ok(data) => json!({"status": 200, "data": data}),
        Err(e) if e.kind() == io::ErrorKind::Unsupported => json!({
            "status": 500,
            "type": "AttributeError",
            "message": e.to_string(),
            "tracebacks": ["Traceback (most recent call last):", "AttributeError"],
        }),
        Err(e) => os_error_body(&e, path),
    }
}

// ============================================================================
// Fake host
// ============================================================================

#[derive(Default)]
struct AgentProcess {
    pid: Option<u32>,
    interrupts: u32,
}

/// What the fake host has installed and running.
pub struct FakeRemote {
    agent_addr: SocketAddr,
    pub installed: AtomicBool,
    pub version: Mutex<String>,
    pub fail_connect: AtomicBool,
    pub connects: AtomicUsize,
    pub installs: AtomicUsize,
    pub starts: AtomicUsize,
    pub interrupts: AtomicUsize,
    process: Mutex<AgentProcess>,
}

impl FakeRemote {
    pub fn new(agent_addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            agent_addr,
            installed: AtomicBool::new(false),
            version: Mutex::new("1.2.0".into()),
            fail_connect: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            installs: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
            interrupts: AtomicUsize::new(0),
            process: Mutex::new(AgentProcess::default()),
        })
    }

    pub fn agent_pid(&self) -> Option<u32> {
        self.process.lock().unwrap().pid
    }

    fn stop_agent(&self) {
        self.process.lock().unwrap().pid = None;
    }
}

fn ok(stdout: impl Into<String>) -> CommandOutput {
    CommandOutput {
        stdout: stdout.into(),
        stderr: String::new(),
        exit_code: Some(0),
    }
}

fn failed(code: u32, stderr: &str) -> CommandOutput {
    CommandOutput {
        stdout: String::new(),
        stderr: stderr.into(),
        exit_code: Some(code),
    }
}

pub struct FakeShell {
    id: String,
    remote: Arc<FakeRemote>,
    connected: AtomicBool,
    events: broadcast::Sender<SessionEvent>,
}

impl FakeShell {
    /// Simulate the transport dropping.
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.events.send(SessionEvent::Lost {
            host_id: self.id.clone(),
            cause: "connection reset by peer".into(),
        });
    }

    fn respond(&self, command: &str) -> Result<CommandOutput> {
        if !self.is_connected() {
            return Err(RemoteError::ConnectionLost {
                host: self.id.clone(),
            });
        }
        let remote = &self.remote;
        let installed = remote.installed.load(Ordering::SeqCst);
        if command.ends_with("--help") {
            return Ok(if installed {
                ok("usage: spyder-server")
            } else {
                failed(127, "micromamba: not found")
            });
        }
        if command.ends_with("--version") {
            return Ok(if installed {
                ok(format!("{}\n", remote.version.lock().unwrap()))
            } else {
                failed(127, "micromamba: not found")
            });
        }
        if command.ends_with(" info") {
            return Ok(match remote.agent_pid() {
                Some(pid) => ok(format!(
                    "{}\n",
                    json!({
                        "hostname": remote.agent_addr.ip().to_string(),
                        "port": remote.agent_addr.port(),
                        "pid": pid,
                        "token": TOKEN,
                    })
                )),
                None => failed(1, "no server running"),
            });
        }
        if command.contains(" create -y -n ") {
            remote.installs.fetch_add(1, Ordering::SeqCst);
            remote.installed.store(true, Ordering::SeqCst);
            return Ok(ok("installed"));
        }
        if command.starts_with("kill -INT ") {
            remote.interrupts.fetch_add(1, Ordering::SeqCst);
            let mut process = remote.process.lock().unwrap();
            process.interrupts += 1;
            if process.interrupts >= 2 {
                process.pid = None;
            }
            return Ok(ok(""));
        }
        if command.starts_with("kill -TERM ") {
            remote.stop_agent();
            return Ok(ok(""));
        }
        Ok(failed(127, "command not found"))
    }
}

impl RemoteShell for FakeShell {
    fn host_id(&self) -> &str {
        &self.id
    }

    async fn connect(&self) -> Result<()> {
        if self.remote.fail_connect.load(Ordering::SeqCst) {
            let _ = self.events.send(SessionEvent::Lost {
                host_id: self.id.clone(),
                cause: "connection refused".into(),
            });
            return Err(RemoteError::ConnectionFailed {
                host: self.id.clone(),
                message: "connection refused".into(),
                source: None,
            });
        }
        self.remote.connects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events.send(SessionEvent::Established {
            host_id: self.id.clone(),
        });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn run(&self, command: &str, options: RunOptions) -> Result<CommandOutput> {
        let output = self.respond(command);
        run_with_options(command, options, async move { output }).await
    }

    async fn create_process(&self, command: &str) -> Result<RemoteProcess> {
        if !self.is_connected() {
            return Err(RemoteError::ConnectionLost {
                host: self.id.clone(),
            });
        }
        let starts = self.remote.starts.fetch_add(1, Ordering::SeqCst) as u32 + 1;
        let pid = 4000 + starts;
        *self.remote.process.lock().unwrap() = AgentProcess {
            pid: Some(pid),
            interrupts: 0,
        };

        let (process, mut control) = RemoteProcess::pair(command);
        let remote = self.remote.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = control.terminate_requested() => {
                        if remote.agent_pid() == Some(pid) {
                            remote.stop_agent();
                        }
                        control.finish(None);
                        return;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(20)) => {
                        if remote.agent_pid() != Some(pid) {
                            control.finish(Some(0));
                            return;
                        }
                    }
                }
            }
        });
        Ok(process)
    }

    async fn open_direct_tcpip(&self, host: &str, port: u16) -> Result<TunnelStream> {
        if !self.is_connected() {
            return Err(RemoteError::ConnectionLost {
                host: self.id.clone(),
            });
        }
        let stream = tokio::net::TcpStream::connect((host, port)).await?;
        Ok(Box::new(stream))
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.events.send(SessionEvent::Closed {
            host_id: self.id.clone(),
        });
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

#[derive(Clone)]
pub struct FakeFactory {
    remote: Arc<FakeRemote>,
    shells: Arc<Mutex<Vec<Arc<FakeShell>>>>,
}

impl FakeFactory {
    pub fn new(remote: Arc<FakeRemote>) -> Self {
        Self {
            remote,
            shells: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The most recently created shell.
    pub fn last_shell(&self) -> Option<Arc<FakeShell>> {
        self.shells.lock().unwrap().last().cloned()
    }
}

impl ShellFactory for FakeFactory {
    type Shell = FakeShell;

    fn create(&self, host: &HostConfig) -> Result<Arc<FakeShell>> {
        let (events, _) = broadcast::channel(16);
        let shell = Arc::new(FakeShell {
            id: host.id.clone(),
            remote: self.remote.clone(),
            connected: AtomicBool::new(false),
            events,
        });
        self.shells.lock().unwrap().push(shell.clone());
        Ok(shell)
    }
}
