//! Local copies of remote kernels' connection info.
//!
//! Files live at `{cache_dir}/runt/remote-kernels/{host_id}-{kernel_id}.json`
//! and hold the plain Jupyter connection-file JSON.

use std::path::{Path, PathBuf};

use jupyter_protocol::ConnectionInfo;
use log::{debug, warn};

use crate::error::{RemoteError, Result};
use crate::http::KernelDescriptor;

pub fn default_connection_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("runt")
        .join("remote-kernels")
}

/// Directory of connection files, one per remote kernel.
#[derive(Debug, Clone)]
pub struct ConnectionFiles {
    dir: PathBuf,
}

impl Default for ConnectionFiles {
    fn default() -> Self {
        Self::new(default_connection_dir())
    }
}

impl ConnectionFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, host_id: &str, kernel_id: &str) -> Result<PathBuf> {
        for part in [host_id, kernel_id] {
            if part.is_empty() || part.contains(['/', '\\']) || part == "." || part == ".." {
                return Err(RemoteError::InvalidArgument(format!(
                    "'{}' cannot be used in a connection file name",
                    part
                )));
            }
        }
        Ok(self.dir.join(format!("{}-{}.json", host_id, kernel_id)))
    }

    /// Write (or replace) the file for `descriptor`.
    pub async fn write(&self, host_id: &str, descriptor: &KernelDescriptor) -> Result<PathBuf> {
        let path = self.path_for(host_id, &descriptor.id)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let contents = serde_json::to_string_pretty(&descriptor.connection_info)?;
        let tmp = self.dir.join(format!(".tmp.{}", uuid::Uuid::new_v4()));
        if let Err(e) = tokio::fs::write(&tmp, contents).await {
            tokio::fs::remove_file(&tmp).await.ok();
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            warn!("[connection-file] Failed to replace {}: {}", path.display(), e);
            tokio::fs::remove_file(&tmp).await.ok();
            return Err(e.into());
        }
        debug!("[connection-file] Wrote {}", path.display());
        Ok(path)
    }

    pub async fn read(&self, host_id: &str, kernel_id: &str) -> Result<Option<ConnectionInfo>> {
        let path = self.path_for(host_id, kernel_id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns whether a file was removed.
    pub async fn remove(&self, host_id: &str, kernel_id: &str) -> Result<bool> {
        let path = self.path_for(host_id, kernel_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
