//! Replica adapter port (driven/secondary port)
//!
//! One [`ISyncAdapter`] wraps each replica. The local one sits on the
//! watched directory; the remote one wraps the server SDK.
//!
//! ## Transfers
//!
//! Uploads and downloads are driven by the remote adapter, which knows how
//! to move bytes between the two replicas. Adapters that cannot transfer
//! keep the default implementations, which fail with
//! [`AdapterError::Unsupported`].
//!
//! ## Errors
//!
//! Operations return a typed [`AdapterError`] rather than `anyhow` so the
//! applier can classify every failure with [`AdapterError::class`].

use std::collections::HashMap;

use thiserror::Error;

use crate::domain::{ErrorClass, Location, NodeInfo, NodePath, PathKey};

// ============================================================================
// AdapterError
// ============================================================================

/// Failure reported by a replica adapter or change feed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdapterError {
    /// The node does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The replica's storage quota is exhausted
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The operation is not permitted on this node
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Credentials were rejected
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Connection refused, reset or unreachable
    #[error("network error: {0}")]
    Network(String),

    /// TLS handshake or certificate failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// Proxy refused or failed the request
    #[error("proxy error: {0}")]
    Proxy(String),

    /// The remote did not answer in time
    #[error("timed out: {0}")]
    Timeout(String),

    /// Server-side failure (5xx and similar)
    #[error("server error: {0}")]
    Server(String),

    /// The operation stopped because the job was paused or stopped
    #[error("interrupted")]
    Interrupted,

    /// Local I/O failure
    #[error("I/O error: {0}")]
    Io(String),

    /// The adapter does not support this operation
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Anything else
    #[error("{0}")]
    Other(String),
}

impl AdapterError {
    /// Maps the error onto its effect on the running cycle
    pub fn class(&self) -> ErrorClass {
        match self {
            AdapterError::QuotaExceeded(_)
            | AdapterError::PermissionDenied(_)
            | AdapterError::AuthenticationFailed(_)
            | AdapterError::Unsupported(_) => ErrorClass::FatalPerCycle,
            AdapterError::Network(_)
            | AdapterError::Tls(_)
            | AdapterError::Proxy(_)
            | AdapterError::Timeout(_)
            | AdapterError::Server(_) => ErrorClass::FatalPerConnection,
            AdapterError::Interrupted => ErrorClass::UserRequested,
            AdapterError::NotFound(_) | AdapterError::Io(_) | AdapterError::Other(_) => {
                ErrorClass::RecoverablePerRecord
            }
        }
    }
}

impl From<std::io::Error> for AdapterError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => AdapterError::NotFound(err.to_string()),
            std::io::ErrorKind::PermissionDenied => AdapterError::PermissionDenied(err.to_string()),
            std::io::ErrorKind::Interrupted => AdapterError::Interrupted,
            _ => AdapterError::Io(err.to_string()),
        }
    }
}

// ============================================================================
// ISyncAdapter
// ============================================================================

/// Operations the engine performs on one replica
#[async_trait::async_trait]
pub trait ISyncAdapter: Send + Sync {
    /// Which replica this adapter operates on
    fn location(&self) -> Location;

    /// Stats a node; `Ok(None)` if it does not exist
    async fn stat(&self, path: &NodePath, with_hash: bool) -> Result<Option<NodeInfo>, AdapterError>;

    /// Stats many nodes; absent nodes are missing from the map
    async fn bulk_stat(
        &self,
        paths: &[NodePath],
        with_hash: bool,
    ) -> Result<HashMap<PathKey, NodeInfo>, AdapterError> {
        let mut found = HashMap::with_capacity(paths.len());
        for path in paths {
            if let Some(info) = self.stat(path, with_hash).await? {
                found.insert(path.key(), info);
            }
        }
        Ok(found)
    }

    /// Creates a directory, including missing parents
    async fn mkdir(&self, path: &NodePath) -> Result<(), AdapterError>;

    /// Creates many directories in one call
    async fn mkdirs(&self, paths: &[NodePath]) -> Result<(), AdapterError> {
        for path in paths {
            self.mkdir(path).await?;
        }
        Ok(())
    }

    /// Creates an empty file
    async fn mkfile(&self, path: &NodePath) -> Result<(), AdapterError>;

    /// Deletes a node; directories are removed recursively
    async fn delete(&self, path: &NodePath) -> Result<(), AdapterError>;

    /// Renames or moves a node
    async fn move_node(&self, source: &NodePath, target: &NodePath) -> Result<(), AdapterError>;

    /// Copies the local node at `local` to `remote` on this replica
    async fn upload(&self, local: &NodePath, remote: &NodePath) -> Result<(), AdapterError> {
        let _ = remote;
        Err(AdapterError::Unsupported(format!("upload of {local}")))
    }

    /// Copies this replica's node at `remote` to `local` on the local replica
    async fn download(&self, remote: &NodePath, local: &NodePath) -> Result<(), AdapterError> {
        let _ = local;
        Err(AdapterError::Unsupported(format!("download of {remote}")))
    }
}
