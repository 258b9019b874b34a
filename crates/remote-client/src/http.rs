//! REST client for the agent behind the forwarded local port.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use jupyter_protocol::ConnectionInfo;
use log::{debug, info};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use url::Url;

use crate::error::{RemoteError, RemoteFileServicesError, RemoteOsError, Result};
use crate::files::RemoteFiles;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Path prefix of the kernel service.
pub const KERNEL_SERVICE: &str = "spyder-service";
/// Path prefix of the environment and file services.
pub const AGENT_SERVICES: &str = "spyder-services";

/// A kernel started by the agent: its id plus the connection fields a
/// local frontend needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelDescriptor {
    pub id: String,
    #[serde(flatten)]
    pub connection_info: ConnectionInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelInfo {
    pub alive: bool,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub connection_info: Option<ConnectionInfo>,
}

#[derive(Deserialize)]
struct KernelList {
    #[serde(default)]
    kernels: Vec<KernelDescriptor>,
}

#[derive(Deserialize)]
struct Success {
    #[serde(default)]
    success: bool,
}

/// Token-authenticated client for one agent.
#[derive(Clone)]
pub struct AgentClient {
    base: Url,
    base_url: String,
    token: String,
    http: reqwest::Client,
    timeout: Option<Duration>,
}

impl fmt::Debug for AgentClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentClient")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl AgentClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let base = Url::parse(&base_url).map_err(|e| {
            RemoteError::InvalidArgument(format!("invalid agent URL '{}': {}", base_url, e))
        })?;
        if base.cannot_be_a_base() {
            return Err(RemoteError::InvalidArgument(format!(
                "invalid agent URL '{}'",
                base_url
            )));
        }
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| RemoteError::Config(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            base,
            base_url,
            token: token.into(),
            http,
            timeout: Some(DEFAULT_REQUEST_TIMEOUT),
        })
    }

    /// Per-request timeout. `None` disables it for long operations.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn token(&self) -> &str {
        &self.token
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn kernels(&self) -> KernelApi<'_> {
        KernelApi { client: self }
    }

    pub fn env(&self) -> EnvApi<'_> {
        EnvApi { client: self }
    }

    pub fn files(&self) -> RemoteFiles {
        RemoteFiles::new(self.clone())
    }

    /// Absolute URL of an agent endpoint. Each segment is percent-encoded
    /// on its own, so ids and names never add path levels.
    pub(crate) fn endpoint<'s, I>(&self, segments: I) -> Result<Url>
    where
        I: IntoIterator<Item = &'s str>,
    {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| {
                RemoteError::InvalidArgument(format!("invalid agent URL '{}'", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub(crate) fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, url)
            .header("Authorization", format!("token {}", self.token));
        match self.timeout {
            Some(timeout) => builder.timeout(timeout),
            None => builder,
        }
    }

    pub(crate) async fn send(&self, builder: RequestBuilder, url: &str) -> Result<Response> {
        builder.send().await.map_err(|e| RemoteError::http(url, e))
    }
}

/// Map a non-success response for the kernel and environment services.
async fn service_error(response: Response, url: &str) -> RemoteError {
    let status = response.status();
    let message = response.text().await.unwrap_or_default();
    if status == StatusCode::NOT_FOUND {
        return RemoteError::NotFound(url.to_string());
    }
    RemoteError::RemoteService {
        status: status.as_u16(),
        url: url.to_string(),
        message: if message.is_empty() {
            status.to_string()
        } else {
            message
        },
    }
}

async fn expect_success(response: Response, url: &str) -> Result<Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(service_error(response, url).await)
    }
}

/// Map a non-success response from the file services. 417 carries a
/// relayed OS error, 500 a file services error.
pub(crate) async fn fs_error(response: Response, url: &str) -> RemoteError {
    let status = response.status();
    match status {
        StatusCode::EXPECTATION_FAILED | StatusCode::INTERNAL_SERVER_ERROR => {
            let body: Value = response.json().await.unwrap_or_else(|_| json!({}));
            if status == StatusCode::EXPECTATION_FAILED {
                RemoteOsError::from_json(&body, url).into()
            } else {
                RemoteFileServicesError::from_json(&body, url).into()
            }
        }
        _ => service_error(response, url).await,
    }
}

pub(crate) async fn decode_json<T: serde::de::DeserializeOwned>(
    response: Response,
    url: &str,
) -> Result<T> {
    response
        .json()
        .await
        .map_err(|e| RemoteError::Protocol(format!("invalid response from {}: {}", url, e)))
}

/// `/spyder-service/kernel` endpoints.
pub struct KernelApi<'a> {
    client: &'a AgentClient,
}

impl KernelApi<'_> {
    fn url(&self, tail: &[&str]) -> Result<String> {
        let url = self
            .client
            .endpoint([KERNEL_SERVICE, "kernel"].into_iter().chain(tail.iter().copied()))?;
        Ok(url.into())
    }

    pub async fn create(&self) -> Result<KernelDescriptor> {
        let url = self.url(&[])?;
        let response = self
            .client
            .send(self.client.request(Method::POST, &url), &url)
            .await?;
        let descriptor: KernelDescriptor = decode_json(expect_success(response, &url).await?, &url).await?;
        info!("[http] Kernel started with ID {}", descriptor.id);
        Ok(descriptor)
    }

    pub async fn list(&self) -> Result<Vec<KernelDescriptor>> {
        let url = self.url(&[])?;
        let response = self
            .client
            .send(self.client.request(Method::GET, &url), &url)
            .await?;
        let list: KernelList = decode_json(expect_success(response, &url).await?, &url).await?;
        Ok(list.kernels)
    }

    /// `None` if the agent does not know the kernel.
    pub async fn info(&self, kernel_id: &str) -> Result<Option<KernelInfo>> {
        let url = self.url(&[kernel_id])?;
        let response = self
            .client
            .send(self.client.request(Method::GET, &url), &url)
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let info = decode_json(expect_success(response, &url).await?, &url).await?;
        Ok(Some(info))
    }

    pub async fn delete(&self, kernel_id: &str) -> Result<bool> {
        let url = self.url(&[kernel_id])?;
        self.expect_flag(Method::DELETE, &url).await
    }

    pub async fn interrupt(&self, kernel_id: &str) -> Result<bool> {
        let url = self.url(&[kernel_id, "interrupt"])?;
        self.expect_flag(Method::POST, &url).await
    }

    pub async fn restart(&self, kernel_id: &str) -> Result<bool> {
        let url = self.url(&[kernel_id, "restart"])?;
        self.expect_flag(Method::POST, &url).await
    }

    async fn expect_flag(&self, method: Method, url: &str) -> Result<bool> {
        debug!("[http] {} {}", method, url);
        let response = self
            .client
            .send(self.client.request(method, url), url)
            .await?;
        let flag: Success = decode_json(expect_success(response, url).await?, url).await?;
        Ok(flag.success)
    }
}

/// `/spyder-services/environ` endpoints.
pub struct EnvApi<'a> {
    client: &'a AgentClient,
}

impl EnvApi<'_> {
    fn url(&self, name: Option<&str>) -> Result<String> {
        let url = match name {
            None => self.client.endpoint([AGENT_SERVICES, "environ"])?,
            Some(name) if name.is_empty() || name.contains(['/', '?', '#']) => {
                return Err(RemoteError::InvalidArgument(format!(
                    "invalid environment variable name '{}'",
                    name
                )))
            }
            Some(name) => self.client.endpoint([AGENT_SERVICES, "environ", name])?,
        };
        Ok(url.into())
    }

    /// `None` if the variable is not set.
    pub async fn get(&self, name: &str) -> Result<Option<String>> {
        let url = self.url(Some(name))?;
        let response = self
            .client
            .send(self.client.request(Method::GET, &url), &url)
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = expect_success(response, &url).await?;
        let text = response
            .text()
            .await
            .map_err(|e| RemoteError::http(&url, e))?;
        Ok(Some(text))
    }

    pub async fn set(&self, name: &str, value: &str) -> Result<()> {
        let url = self.url(Some(name))?;
        let builder = self
            .client
            .request(Method::POST, &url)
            .json(&json!({ "value": value }));
        let response = self.client.send(builder, &url).await?;
        expect_success(response, &url).await?;
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        let url = self.url(Some(name))?;
        let response = self
            .client
            .send(self.client.request(Method::DELETE, &url), &url)
            .await?;
        expect_success(response, &url).await?;
        Ok(())
    }

    pub async fn dict(&self) -> Result<BTreeMap<String, String>> {
        let url = self.url(None)?;
        let response = self
            .client
            .send(self.client.request(Method::GET, &url), &url)
            .await?;
        decode_json(expect_success(response, &url).await?, &url).await
    }
}
