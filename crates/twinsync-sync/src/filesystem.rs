//! Local filesystem adapter (secondary/driven adapter)
//!
//! Implements [`ISyncAdapter`] for a directory tree on the local disk using
//! `tokio::fs`. Workspace paths are resolved below the job's local root.
//!
//! - **Hashing**: SHA-256 of the file content, lowercase hex, read in
//!   64 KiB chunks so large files are never loaded whole.
//! - **Transfers**: the local side cannot upload or download by itself;
//!   transfers run through the remote adapter.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{debug, instrument};

use twinsync_core::domain::{Location, NodeInfo, NodePath};
use twinsync_core::ports::{AdapterError, ISyncAdapter};

/// Read size used while hashing
const HASH_CHUNK: usize = 64 * 1024;

/// SHA-256 of the file at `path`, hex encoded
pub async fn hash_file(path: &Path) -> Result<String, AdapterError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn modified_at(metadata: &std::fs::Metadata) -> DateTime<Utc> {
    metadata
        .modified()
        .ok()
        .and_then(|st| {
            st.duration_since(std::time::UNIX_EPOCH)
                .ok()
                .and_then(|dur| DateTime::from_timestamp(dur.as_secs() as i64, dur.subsec_nanos()))
        })
        .unwrap_or_default()
}

/// Adapter over the local replica directory
#[derive(Debug, Clone)]
pub struct LocalFileSystemAdapter {
    root: PathBuf,
}

impl LocalFileSystemAdapter {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute location of a workspace path
    pub fn resolve(&self, path: &NodePath) -> PathBuf {
        let relative = path.as_str().trim_start_matches('/');
        if relative.is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }

    async fn ensure_parent(&self, target: &Path) -> Result<(), AdapterError> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ISyncAdapter for LocalFileSystemAdapter {
    fn location(&self) -> Location {
        Location::Local
    }

    #[instrument(skip(self), fields(path = %path))]
    async fn stat(&self, path: &NodePath, with_hash: bool) -> Result<Option<NodeInfo>, AdapterError> {
        let full = self.resolve(path);
        let metadata = match tokio::fs::metadata(&full).await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("path not found");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let mtime = modified_at(&metadata);
        if metadata.is_dir() {
            return Ok(Some(NodeInfo::directory(path.clone(), mtime)));
        }

        let hash = if with_hash {
            hash_file(&full).await?
        } else {
            String::new()
        };
        Ok(Some(NodeInfo::file(path.clone(), hash, metadata.len(), mtime)))
    }

    #[instrument(skip(self), fields(path = %path))]
    async fn mkdir(&self, path: &NodePath) -> Result<(), AdapterError> {
        tokio::fs::create_dir_all(self.resolve(path)).await?;
        debug!("directory created");
        Ok(())
    }

    #[instrument(skip(self), fields(path = %path))]
    async fn mkfile(&self, path: &NodePath) -> Result<(), AdapterError> {
        let full = self.resolve(path);
        self.ensure_parent(&full).await?;
        tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&full)
            .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(path = %path))]
    async fn delete(&self, path: &NodePath) -> Result<(), AdapterError> {
        let full = self.resolve(path);
        let metadata = tokio::fs::metadata(&full).await?;
        if metadata.is_dir() {
            debug!("removing directory recursively");
            tokio::fs::remove_dir_all(&full).await?;
        } else {
            tokio::fs::remove_file(&full).await?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(source = %source, target = %target))]
    async fn move_node(&self, source: &NodePath, target: &NodePath) -> Result<(), AdapterError> {
        let to = self.resolve(target);
        self.ensure_parent(&to).await?;
        tokio::fs::rename(self.resolve(source), &to).await?;
        debug!("node moved");
        Ok(())
    }
}
