//! Remote file store seam
//!
//! The transfer service only needs sizes and positioned streams. Production
//! branches reach the artifact share through a mounted SFTP file system, which
//! [`FsRemoteStore`] serves; tests wrap it to inject link failures.

use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWrite};

use crate::errors::AgentError;
use crate::transfer::path::normalize_remote_path;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Hands out sessions against the remote store
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn RemoteSession>, AgentError>;

    fn describe(&self) -> String;
}

/// One connected session. Paths are normalized remote paths.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Size of a regular file, `None` when it does not exist.
    async fn size(&self, path: &str) -> Result<Option<u64>, AgentError>;

    /// Stream the file starting at `offset`.
    async fn open_read(&self, path: &str, offset: u64) -> Result<BoxedReader, AgentError>;

    /// Truncate the file to `offset` (creating it if needed) and stream writes from there.
    async fn open_write(&self, path: &str, offset: u64) -> Result<BoxedWriter, AgentError>;

    async fn create_dir_all(&self, path: &str) -> Result<(), AgentError>;
}

/// Size of a local regular file, `None` when missing.
pub(crate) async fn local_size(path: &Path) -> Result<Option<u64>, AgentError> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() => Ok(Some(metadata.len())),
        Ok(_) => Err(AgentError::TransferError(format!(
            "{} is not a regular file",
            path.display()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub(crate) async fn open_local_read(path: &Path, offset: u64) -> Result<BoxedReader, AgentError> {
    let mut file = tokio::fs::File::open(path).await?;
    if offset > 0 {
        file.seek(SeekFrom::Start(offset)).await?;
    }
    Ok(Box::new(file))
}

pub(crate) async fn open_local_write(path: &Path, offset: u64) -> Result<BoxedWriter, AgentError> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .await?;
    // Drop anything past the resume point, e.g. a partially written chunk
    file.set_len(offset).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    Ok(Box::new(file))
}

/// Remote store exposed as a directory tree on the local file system
#[derive(Debug, Clone)]
pub struct FsRemoteStore {
    root: PathBuf,
}

impl FsRemoteStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a remote path below the root, refusing to escape it.
    pub fn resolve(&self, remote_path: &str) -> Result<PathBuf, AgentError> {
        let normalized = normalize_remote_path(remote_path);
        let relative = Path::new(normalized.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(AgentError::ValidationError(format!(
                "Remote path escapes the store: {}",
                remote_path
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl RemoteStore for FsRemoteStore {
    async fn connect(&self) -> Result<Box<dyn RemoteSession>, AgentError> {
        if !tokio::fs::try_exists(&self.root).await? {
            return Err(AgentError::TransferError(format!(
                "Remote store {} is not mounted",
                self.root.display()
            )));
        }
        Ok(Box::new(FsRemoteSession {
            store: self.clone(),
        }))
    }

    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }
}

struct FsRemoteSession {
    store: FsRemoteStore,
}

#[async_trait]
impl RemoteSession for FsRemoteSession {
    async fn size(&self, path: &str) -> Result<Option<u64>, AgentError> {
        local_size(&self.store.resolve(path)?).await
    }

    async fn open_read(&self, path: &str, offset: u64) -> Result<BoxedReader, AgentError> {
        open_local_read(&self.store.resolve(path)?, offset).await
    }

    async fn open_write(&self, path: &str, offset: u64) -> Result<BoxedWriter, AgentError> {
        open_local_write(&self.store.resolve(path)?, offset).await
    }

    async fn create_dir_all(&self, path: &str) -> Result<(), AgentError> {
        tokio::fs::create_dir_all(self.store.resolve(path)?).await?;
        Ok(())
    }
}
