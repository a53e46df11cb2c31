//! Change processor
//!
//! Maps one surviving [`ChangeRecord`] onto the adapter calls that
//! reproduce it on the opposite replica:
//!
//! | change                  | call on the destination                     |
//! |-------------------------|---------------------------------------------|
//! | create / content (file) | upload (local origin) / download (remote)   |
//! | create (directory)      | `mkdir`                                     |
//! | delete                  | `delete`; an already absent node is success |
//! | path                    | `move_node`; falls back to a create when the source is missing |
//!
//! Transfers always go through the remote adapter. A successful call yields
//! the [`EchoRecord`] the destination's feed is expected to report back.

use std::sync::Arc;

use tracing::{debug, instrument};

use twinsync_core::config::Direction;
use twinsync_core::domain::{ChangeKind, ChangeOp, ChangeRecord, EchoRecord, Location, NodePath};
use twinsync_core::ports::{AdapterError, ISyncAdapter};

/// What applying a record amounted to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The destination was changed; the echo describes what was done
    Applied(EchoRecord),
    /// The job's direction excludes the record's origin
    Skipped,
}

/// Dispatches records to the local and remote adapters
#[derive(Clone)]
pub struct ChangeProcessor {
    local: Arc<dyn ISyncAdapter>,
    remote: Arc<dyn ISyncAdapter>,
    direction: Direction,
}

impl ChangeProcessor {
    pub fn new(
        local: Arc<dyn ISyncAdapter>,
        remote: Arc<dyn ISyncAdapter>,
        direction: Direction,
    ) -> Self {
        Self {
            local,
            remote,
            direction,
        }
    }

    /// The adapter of `location`
    pub fn adapter(&self, location: Location) -> &Arc<dyn ISyncAdapter> {
        match location {
            Location::Local => &self.local,
            Location::Remote => &self.remote,
        }
    }

    /// True if the job's direction lets changes from `origin` through
    pub fn permits(&self, origin: Location) -> bool {
        !matches!(
            (self.direction, origin),
            (Direction::Down, Location::Local) | (Direction::Up, Location::Remote)
        )
    }

    /// Creates a batch of directories on `destination`
    ///
    /// Returns one echo per directory.
    #[instrument(skip(self, paths), fields(count = paths.len()))]
    pub async fn mkdirs(
        &self,
        destination: Location,
        paths: &[NodePath],
    ) -> Result<Vec<EchoRecord>, AdapterError> {
        self.adapter(destination).mkdirs(paths).await?;
        Ok(paths
            .iter()
            .map(|path| EchoRecord::new(destination, ChangeKind::Create, None, Some(path.clone())))
            .collect())
    }

    /// Applies one record to the replica opposite its origin
    #[instrument(
        skip(self, record),
        fields(
            location = %record.location,
            seq = record.sequence,
            kind = %record.kind(),
            path = %record.primary_path()
        )
    )]
    pub async fn apply(&self, record: &ChangeRecord) -> Result<Outcome, AdapterError> {
        if !self.permits(record.location) {
            debug!(direction = ?self.direction, "Origin excluded by direction");
            return Ok(Outcome::Skipped);
        }

        let destination = record.location.opposite();
        let adapter = self.adapter(destination);

        let echo = match &record.op {
            ChangeOp::Create { target } => {
                if record.is_dir() {
                    adapter.mkdir(target).await?;
                } else {
                    self.transfer(record.location, target).await?;
                }
                EchoRecord::new(destination, ChangeKind::Create, None, Some(target.clone()))
            }
            ChangeOp::Content { path } => {
                if record.is_dir() {
                    return Ok(Outcome::Skipped);
                }
                self.transfer(record.location, path).await?;
                EchoRecord::new(
                    destination,
                    ChangeKind::Content,
                    Some(path.clone()),
                    Some(path.clone()),
                )
            }
            ChangeOp::Delete { source } => {
                match adapter.delete(source).await {
                    Ok(()) => {}
                    Err(AdapterError::NotFound(_)) => {
                        debug!("Already absent on the destination");
                    }
                    Err(e) => return Err(e),
                }
                EchoRecord::new(destination, ChangeKind::Delete, Some(source.clone()), None)
            }
            ChangeOp::Path { source, target } => {
                if adapter.stat(source, false).await?.is_some() {
                    adapter.move_node(source, target).await?;
                    EchoRecord::new(
                        destination,
                        ChangeKind::Path,
                        Some(source.clone()),
                        Some(target.clone()),
                    )
                } else {
                    debug!("Move source missing on the destination, creating the target");
                    if record.is_dir() {
                        adapter.mkdir(target).await?;
                    } else {
                        self.transfer(record.location, target).await?;
                    }
                    EchoRecord::new(destination, ChangeKind::Create, None, Some(target.clone()))
                }
            }
        };

        Ok(Outcome::Applied(echo))
    }

    /// Copies the file at `path` from `origin` to the other replica
    async fn transfer(&self, origin: Location, path: &NodePath) -> Result<(), AdapterError> {
        match origin {
            Location::Local => self.remote.upload(path, path).await,
            Location::Remote => self.remote.download(path, path).await,
        }
    }
}
