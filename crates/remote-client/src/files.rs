//! Remote file API: metadata calls over REST and per-file WebSockets for
//! byte-stream access.
//!
//! Remote OS failures come back as [`RemoteOsError`] with the remote
//! `errno` intact, so callers can treat them like local `io::Error`s.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use futures::{SinkExt, Stream, StreamExt, TryStreamExt};
use log::{debug, warn};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::{RemoteError, RemoteFileServicesError, RemoteOsError, Result};
use crate::http::{decode_json, fs_error, AgentClient, AGENT_SERVICES};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const STATUS_EXPECTATION_FAILED: u64 = 417;
const STATUS_LOCKED: u64 = 423;

// ============================================================================
// Paths
// ============================================================================

/// A file on a specific remote host, `<client_id>://<path>`.
///
/// Paths are POSIX and kept canonical: `.` and empty components are
/// dropped and `..` is resolved lexically.
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePath {
    client_id: String,
    path: String,
    modified: Option<f64>,
    size: Option<u64>,
}

impl RemotePath {
    pub fn new(client_id: impl Into<String>, path: &str) -> Self {
        Self {
            client_id: client_id.into(),
            path: canonicalize(path),
            modified: None,
            size: None,
        }
    }

    pub fn parse(uri: &str) -> Result<Self> {
        let (client_id, path) = uri.split_once("://").ok_or_else(|| {
            RemoteError::InvalidArgument(format!("'{}' is not a <client_id>://<path> URI", uri))
        })?;
        if client_id.is_empty() {
            return Err(RemoteError::InvalidArgument(format!(
                "'{}' has no client id",
                uri
            )));
        }
        Ok(Self::new(client_id, path))
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Server-reported modification time, seconds since the epoch.
    pub fn modified(&self) -> Option<f64> {
        self.modified
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn uri(&self) -> String {
        format!("{}://{}", self.client_id, self.path)
    }

    pub fn file_name(&self) -> Option<&str> {
        self.path.rsplit('/').next().filter(|n| !n.is_empty() && *n != "..")
    }

    pub fn join(&self, name: &str) -> Self {
        let joined = if name.starts_with('/') {
            name.to_string()
        } else {
            format!("{}/{}", self.path, name)
        };
        Self::new(self.client_id.clone(), &joined)
    }

    pub fn parent(&self) -> Option<Self> {
        if self.path == "/" || self.file_name().is_none() {
            return None;
        }
        Some(self.join(".."))
    }

    fn with_metadata(&self, entry: &FileEntry) -> Self {
        Self {
            client_id: self.client_id.clone(),
            path: self.path.clone(),
            modified: entry.mtime,
            size: Some(entry.size),
        }
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.client_id, self.path)
    }
}

fn canonicalize(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => match parts.last() {
                Some(last) if *last != ".." => {
                    parts.pop();
                }
                _ if absolute => {}
                _ => parts.push(".."),
            },
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Endpoint for `op` on a remote path. The path travels as a `file://`
/// URI appended to the route, one encoded segment per path component.
fn fs_endpoint(client: &AgentClient, op: &str, path: &str) -> Result<Url> {
    let uri = format!("file://{}", path);
    client.endpoint([AGENT_SERVICES, "fs", op].into_iter().chain(uri.split('/')))
}

fn flag(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

// ============================================================================
// Metadata
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    File,
    #[serde(alias = "dir")]
    Directory,
    Link,
    #[serde(other)]
    Other,
}

/// One `ls`/`info` entry as reported by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(rename = "type")]
    pub file_type: FileType,
    #[serde(default)]
    pub created: Option<f64>,
    #[serde(default)]
    pub islink: bool,
    #[serde(default)]
    pub mode: Option<u32>,
    #[serde(default)]
    pub uid: Option<u32>,
    #[serde(default)]
    pub gid: Option<u32>,
    #[serde(default)]
    pub mtime: Option<f64>,
    #[serde(default)]
    pub ino: Option<u64>,
    #[serde(default)]
    pub nlink: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
}

impl FileEntry {
    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    pub fn is_file(&self) -> bool {
        self.file_type == FileType::File
    }

    pub fn is_link(&self) -> bool {
        self.islink || self.file_type == FileType::Link
    }
}

/// REST side of the file services.
#[derive(Debug, Clone)]
pub struct RemoteFiles {
    client: AgentClient,
}

impl RemoteFiles {
    pub fn new(client: AgentClient) -> Self {
        Self { client }
    }

    fn url(&self, op: &str, path: &str) -> Result<String> {
        Ok(fs_endpoint(&self.client, op, path)?.into())
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        op: &str,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let url = self.url(op, path)?;
        debug!("[files] {} {}", method, url);
        let builder = self.client.request(method, &url).query(query);
        let response = self.client.send(builder, &url).await?;
        if !response.status().is_success() {
            return Err(fs_error(response, &url).await);
        }
        decode_json(response, &url).await
    }

    async fn call_flag(
        &self,
        method: Method,
        op: &str,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<bool> {
        let value: Value = self.call(method, op, path, query).await?;
        Ok(value
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(true))
    }

    /// Detailed entries of a directory. A file yields its own entry.
    pub async fn ls(&self, path: &str) -> Result<Vec<FileEntry>> {
        self.call(Method::GET, "ls", path, &[("detail", "true")])
            .await
    }

    /// Names only.
    pub async fn ls_names(&self, path: &str) -> Result<Vec<String>> {
        self.call(Method::GET, "ls", path, &[("detail", "false")])
            .await
    }

    pub async fn info(&self, path: &str) -> Result<FileEntry> {
        self.call(Method::GET, "info", path, &[]).await
    }

    /// Refresh a handle with the server's size and mtime.
    pub async fn stat(&self, path: &RemotePath) -> Result<RemotePath> {
        let entry = self.info(path.path()).await?;
        Ok(path.with_metadata(&entry))
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        self.call(Method::GET, "exists", path, &[]).await
    }

    pub async fn is_file(&self, path: &str) -> Result<bool> {
        self.call(Method::GET, "isfile", path, &[]).await
    }

    pub async fn is_dir(&self, path: &str) -> Result<bool> {
        self.call(Method::GET, "isdir", path, &[]).await
    }

    pub async fn mkdir(&self, path: &str, create_parents: bool, exist_ok: bool) -> Result<bool> {
        self.call_flag(
            Method::POST,
            "mkdir",
            path,
            &[
                ("create_parents", flag(create_parents)),
                ("exist_ok", flag(exist_ok)),
            ],
        )
        .await
    }

    /// Fails unless the directory is empty.
    pub async fn rmdir(&self, path: &str) -> Result<bool> {
        self.call_flag(Method::DELETE, "rmdir", path, &[]).await
    }

    pub async fn unlink(&self, path: &str, missing_ok: bool) -> Result<bool> {
        self.call_flag(
            Method::DELETE,
            "file",
            path,
            &[("missing_ok", flag(missing_ok))],
        )
        .await
    }

    pub async fn copy(&self, src: &str, dst: &str) -> Result<bool> {
        let dest = format!("file://{}", dst);
        self.call_flag(Method::POST, "copy", src, &[("dest", &dest)])
            .await
    }

    /// Copy preserving metadata.
    pub async fn copy2(&self, src: &str, dst: &str) -> Result<bool> {
        let dest = format!("file://{}", dst);
        self.call_flag(
            Method::POST,
            "copy",
            src,
            &[("dest", &dest), ("metadata", "true")],
        )
        .await
    }

    pub async fn replace(&self, src: &str, dst: &str) -> Result<bool> {
        let dest = format!("file://{}", dst);
        self.call_flag(Method::POST, "move", src, &[("dest", &dest)])
            .await
    }

    pub async fn touch(&self, path: &str, truncate: bool) -> Result<bool> {
        self.call_flag(Method::POST, "touch", path, &[("truncate", flag(truncate))])
            .await
    }

    /// Stream a zip archive of `path`. No request timeout applies.
    pub async fn zip(
        &self,
        path: &str,
    ) -> Result<impl Stream<Item = Result<Bytes>> + Send + 'static> {
        let url = self.url("zip", path)?;
        let client = self.client.clone().with_timeout(None);
        let response = client.send(client.request(Method::GET, &url), &url).await?;
        if !response.status().is_success() {
            return Err(fs_error(response, &url).await);
        }
        Ok(response
            .bytes_stream()
            .map_err(move |e| RemoteError::http(&url, e)))
    }

    pub async fn open(&self, path: &str, options: OpenOptions) -> Result<RemoteFile> {
        RemoteFile::open(&self.client, path, options).await
    }

    /// Read a whole file as bytes.
    pub async fn read_bytes(&self, path: &str) -> Result<Vec<u8>> {
        let mut file = self.open(path, OpenOptions::new("rb")).await?;
        let data = file.read(None).await;
        file.close().await?;
        data?.into_bytes()
    }

    /// Replace a file's contents, atomically on the server side.
    pub async fn write_bytes(&self, path: &str, data: &[u8]) -> Result<u64> {
        let mut file = self
            .open(path, OpenOptions::new("wb").with_atomic(true))
            .await?;
        let written = file.write(FileData::Bytes(data.to_vec())).await;
        file.close().await?;
        written
    }
}

// ============================================================================
// Per-file WebSocket
// ============================================================================

#[derive(Debug, Clone)]
pub struct OpenOptions {
    mode: String,
    atomic: bool,
    lock: bool,
    encoding: String,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self::new("r")
    }
}

impl OpenOptions {
    pub fn new(mode: impl Into<String>) -> Self {
        Self {
            mode: mode.into(),
            atomic: false,
            lock: false,
            encoding: "utf-8".to_string(),
        }
    }

    /// Write to a sibling temp file and replace the target on close.
    pub fn with_atomic(mut self, atomic: bool) -> Self {
        self.atomic = atomic;
        self
    }

    /// Hold an advisory lock while the file is open.
    pub fn with_lock(mut self, lock: bool) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = encoding.into();
        self
    }

    pub fn is_binary(&self) -> bool {
        self.mode.contains('b')
    }
}

/// File contents in the mode the file was opened with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileData {
    Bytes(Vec<u8>),
    Text(String),
}

impl FileData {
    pub fn len(&self) -> usize {
        match self {
            FileData::Bytes(b) => b.len(),
            FileData::Text(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            FileData::Bytes(b) => Ok(b),
            FileData::Text(_) => Err(RemoteError::TypeMismatch(
                "expected bytes from a binary-mode file".into(),
            )),
        }
    }

    pub fn into_text(self) -> Result<String> {
        match self {
            FileData::Text(s) => Ok(s),
            FileData::Bytes(_) => Err(RemoteError::TypeMismatch(
                "expected text from a text-mode file".into(),
            )),
        }
    }
}

impl From<&str> for FileData {
    fn from(s: &str) -> Self {
        FileData::Text(s.to_string())
    }
}

impl From<String> for FileData {
    fn from(s: String) -> Self {
        FileData::Text(s)
    }
}

impl From<Vec<u8>> for FileData {
    fn from(b: Vec<u8>) -> Self {
        FileData::Bytes(b)
    }
}

impl From<&[u8]> for FileData {
    fn from(b: &[u8]) -> Self {
        FileData::Bytes(b.to_vec())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Start = 0,
    Current = 1,
    End = 2,
}

/// An open remote file. Every call is one request frame and one reply.
pub struct RemoteFile {
    name: String,
    options: OpenOptions,
    encoding: &'static encoding_rs::Encoding,
    url: String,
    ws: Option<WsStream>,
}

impl fmt::Debug for RemoteFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteFile")
            .field("name", &self.name)
            .field("mode", &self.options.mode)
            .field("closed", &self.ws.is_none())
            .finish()
    }
}

impl RemoteFile {
    async fn open(client: &AgentClient, path: &str, options: OpenOptions) -> Result<Self> {
        let encoding = encoding_rs::Encoding::for_label(options.encoding.as_bytes())
            .ok_or_else(|| {
                RemoteError::InvalidArgument(format!("unknown encoding '{}'", options.encoding))
            })?;

        let url = open_url(client, path, &options)?;

        let mut request = url.as_str().into_client_request()?;
        let auth = HeaderValue::from_str(&format!("token {}", client.token()))
            .map_err(|_| RemoteError::InvalidArgument("token is not a valid header value".into()))?;
        request.headers_mut().insert("Authorization", auth);

        debug!("[files] Opening {} ({})", path, options.mode);
        let connect = tokio_tungstenite::connect_async(request);
        let (ws, _response) = match client.timeout() {
            Some(timeout) => tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| RemoteError::Timeout(format!("opening {}", path)))??,
            None => connect.await?,
        };

        let mut file = Self {
            name: path.to_string(),
            options,
            encoding,
            url: url.into(),
            ws: Some(ws),
        };
        if let Err(e) = file.check_connection().await {
            file.ws = None;
            return Err(e);
        }
        Ok(file)
    }

    /// The agent either sends a first status frame or closes with the
    /// reason the open failed. A broken handshake counts as a failed open.
    async fn check_connection(&mut self) -> Result<()> {
        let url = self.url.clone();
        let ws = self.socket()?;
        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Close(frame))) => {
                    return Err(match frame {
                        Some(frame) if frame.code == CloseCode::Protocol => {
                            open_error(&frame.reason, &url)
                        }
                        _ => RemoteFileServicesError {
                            error_type: "UnknownError".into(),
                            message: "Failed to open file".into(),
                            url,
                            tracebacks: Vec::new(),
                        }
                        .into(),
                    });
                }
                Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => continue,
                Some(Ok(_)) => return Ok(()),
                Some(Err(e)) => {
                    return Err(RemoteFileServicesError {
                        error_type: "UnknownError".into(),
                        message: format!("Failed to open file: {}", e),
                        url,
                        tracebacks: Vec::new(),
                    }
                    .into())
                }
                None => {
                    return Err(RemoteFileServicesError {
                        error_type: "UnknownError".into(),
                        message: "Failed to open file".into(),
                        url,
                        tracebacks: Vec::new(),
                    }
                    .into())
                }
            }
        }
    }

    fn socket(&mut self) -> Result<&mut WsStream> {
        self.ws
            .as_mut()
            .ok_or_else(|| RemoteError::InvalidArgument("I/O operation on closed file".into()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> &str {
        &self.options.mode
    }

    pub fn closed(&self) -> bool {
        self.ws.is_none()
    }

    fn encode(&self, data: &FileData) -> Result<String> {
        match (data, self.options.is_binary()) {
            (FileData::Bytes(b), true) => Ok(BASE64.encode(b)),
            (FileData::Text(s), false) => {
                let (encoded, _, _) = self.encoding.encode(s);
                Ok(BASE64.encode(encoded))
            }
            (FileData::Text(_), true) => Err(RemoteError::TypeMismatch(format!(
                "a bytes-like object is required for mode '{}'",
                self.options.mode
            ))),
            (FileData::Bytes(_), false) => Err(RemoteError::TypeMismatch(format!(
                "a str object is required for mode '{}'",
                self.options.mode
            ))),
        }
    }

    fn decode(&self, data: &str) -> Result<FileData> {
        let bytes = BASE64
            .decode(data)
            .map_err(|e| RemoteError::Protocol(format!("invalid base64 payload: {}", e)))?;
        if self.options.is_binary() {
            Ok(FileData::Bytes(bytes))
        } else {
            let (text, _) = self.encoding.decode_without_bom_handling(&bytes);
            Ok(FileData::Text(text.into_owned()))
        }
    }

    async fn request(&mut self, method: &str, args: Value) -> Result<Option<Value>> {
        let mut body = Map::new();
        body.insert("method".into(), Value::String(method.into()));
        if let Value::Object(args) = args {
            body.extend(args);
        }
        let url = self.url.clone();
        let ws = self.socket()?;
        ws.send(WsMessage::Text(Value::Object(body).to_string()))
            .await?;

        let reply = loop {
            match ws.next().await {
                Some(Ok(WsMessage::Binary(bytes))) => break serde_json::from_slice::<Value>(&bytes)?,
                Some(Ok(WsMessage::Text(text))) => break serde_json::from_str::<Value>(&text)?,
                Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => continue,
                Some(Ok(WsMessage::Close(_))) | None => {
                    self.ws = None;
                    return Err(RemoteError::Protocol(format!(
                        "{} closed while waiting for a reply",
                        url
                    )));
                }
                Some(Ok(WsMessage::Frame(_))) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        };

        let status = reply.get("status").and_then(Value::as_u64).unwrap_or(0);
        if status >= 400 {
            return Err(if status == STATUS_EXPECTATION_FAILED || status == STATUS_LOCKED {
                RemoteOsError::from_json(&reply, &url).into()
            } else {
                RemoteFileServicesError::from_json(&reply, &url).into()
            });
        }
        Ok(reply.get("data").filter(|d| !d.is_null()).cloned())
    }

    async fn request_data(&mut self, method: &str, args: Value) -> Result<FileData> {
        match self.request(method, args).await? {
            Some(Value::String(data)) => self.decode(&data),
            None => Ok(if self.options.is_binary() {
                FileData::Bytes(Vec::new())
            } else {
                FileData::Text(String::new())
            }),
            Some(other) => Err(RemoteError::Protocol(format!(
                "expected encoded data from {}, got {}",
                method, other
            ))),
        }
    }

    async fn request_int(&mut self, method: &str, args: Value) -> Result<i64> {
        match self.request(method, args).await? {
            Some(Value::Number(n)) => n
                .as_i64()
                .ok_or_else(|| RemoteError::Protocol(format!("{} returned {}", method, n))),
            other => Err(RemoteError::Protocol(format!(
                "expected an integer from {}, got {:?}",
                method, other
            ))),
        }
    }

    async fn request_bool(&mut self, method: &str) -> Result<bool> {
        match self.request(method, json!({})).await? {
            Some(Value::Bool(b)) => Ok(b),
            other => Err(RemoteError::Protocol(format!(
                "expected a boolean from {}, got {:?}",
                method, other
            ))),
        }
    }

    /// Read up to `n` bytes or characters; `None` reads to the end.
    pub async fn read(&mut self, n: Option<usize>) -> Result<FileData> {
        let n = n.map(|n| n as i64).unwrap_or(-1);
        self.request_data("read", json!({ "n": n })).await
    }

    pub async fn read_all(&mut self) -> Result<FileData> {
        self.read(None).await
    }

    pub async fn readline(&mut self, size: Option<usize>) -> Result<FileData> {
        let size = size.map(|n| n as i64).unwrap_or(-1);
        self.request_data("readline", json!({ "size": size })).await
    }

    pub async fn readlines(&mut self, hint: Option<usize>) -> Result<Vec<FileData>> {
        let hint = hint.map(|n| n as i64).unwrap_or(-1);
        match self.request("readlines", json!({ "hint": hint })).await? {
            Some(Value::Array(lines)) => lines
                .iter()
                .map(|line| match line {
                    Value::String(data) => self.decode(data),
                    other => Err(RemoteError::Protocol(format!(
                        "expected encoded line, got {}",
                        other
                    ))),
                })
                .collect(),
            None => Ok(Vec::new()),
            Some(other) => Err(RemoteError::Protocol(format!(
                "expected a list from readlines, got {}",
                other
            ))),
        }
    }

    /// Not available over the file services.
    pub async fn readinto(&mut self, _buf: &mut [u8]) -> Result<usize> {
        Err(RemoteError::NotSupported("readinto()".into()))
    }

    /// Returns the number of bytes or characters written.
    pub async fn write(&mut self, data: impl Into<FileData>) -> Result<u64> {
        let encoded = self.encode(&data.into())?;
        let written = self.request_int("write", json!({ "data": encoded })).await?;
        Ok(written.max(0) as u64)
    }

    pub async fn writelines<I, D>(&mut self, lines: I) -> Result<()>
    where
        I: IntoIterator<Item = D>,
        D: Into<FileData>,
    {
        let encoded = lines
            .into_iter()
            .map(|line| self.encode(&line.into()))
            .collect::<Result<Vec<_>>>()?;
        self.request("writelines", json!({ "lines": encoded }))
            .await?;
        Ok(())
    }

    pub async fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64> {
        let position = self
            .request_int("seek", json!({ "offset": offset, "whence": whence as i32 }))
            .await?;
        Ok(position.max(0) as u64)
    }

    pub async fn tell(&mut self) -> Result<u64> {
        Ok(self.request_int("tell", json!({})).await?.max(0) as u64)
    }

    /// Truncate at `size`, or at the current position.
    pub async fn truncate(&mut self, size: Option<u64>) -> Result<u64> {
        Ok(self
            .request_int("truncate", json!({ "size": size }))
            .await?
            .max(0) as u64)
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.request("flush", json!({})).await?;
        Ok(())
    }

    pub async fn fileno(&mut self) -> Result<i64> {
        self.request_int("fileno", json!({})).await
    }

    pub async fn isatty(&mut self) -> Result<bool> {
        self.request_bool("isatty").await
    }

    pub async fn readable(&mut self) -> Result<bool> {
        self.request_bool("readable").await
    }

    pub async fn writable(&mut self) -> Result<bool> {
        self.request_bool("writable").await
    }

    /// Close the socket. For atomic files the agent replaces the target now.
    pub async fn close(&mut self) -> Result<()> {
        let Some(mut ws) = self.ws.take() else {
            return Ok(());
        };
        if let Err(e) = ws.close(None).await {
            debug!("[files] Close of {} failed: {}", self.name, e);
            return Ok(());
        }
        // Drain until the agent acknowledges the close.
        while let Some(message) = ws.next().await {
            if message.is_err() {
                break;
            }
        }
        Ok(())
    }
}

impl Drop for RemoteFile {
    fn drop(&mut self) {
        if self.ws.is_some() {
            warn!("[files] {} dropped without close()", self.name);
        }
    }
}

/// `ws://` URL of the per-file socket with the open options as query.
fn open_url(client: &AgentClient, path: &str, options: &OpenOptions) -> Result<Url> {
    let mut url = fs_endpoint(client, "open", path)?;
    let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
    url.set_scheme(scheme).map_err(|_| {
        RemoteError::InvalidArgument(format!("cannot open a WebSocket to {}", client.base_url()))
    })?;
    url.query_pairs_mut()
        .append_pair("mode", &options.mode)
        .append_pair("atomic", flag(options.atomic))
        .append_pair("lock", flag(options.lock))
        .append_pair("encoding", &options.encoding);
    Ok(url)
}

fn open_error(reason: &str, url: &str) -> RemoteError {
    let body: Value = match serde_json::from_str(reason) {
        Ok(body) => body,
        Err(_) => {
            return RemoteFileServicesError {
                error_type: "UnknownError".into(),
                message: reason.to_string(),
                url: url.to_string(),
                tracebacks: Vec::new(),
            }
            .into()
        }
    };
    let status = body.get("status").and_then(Value::as_u64).unwrap_or(0);
    if status == STATUS_LOCKED || status == STATUS_EXPECTATION_FAILED {
        RemoteOsError::from_json(&body, url).into()
    } else {
        RemoteFileServicesError::from_json(&body, url).into()
    }
}
