//! Shared test helpers for engine integration tests
//!
//! Provides in-memory replicas, scripted change feeds and an engine wired
//! to an in-memory SQLite state repository.
//!
//! The remote [`MemoryAdapter`] also sees the local volume, so its upload
//! and download calls copy bytes between the two replicas the way a real
//! transfer would.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use twinsync_cache::{DatabasePool, SqliteStateRepository};
use twinsync_core::config::{Config, ConfigBuilder, UnnecessaryChangePolicy};
use twinsync_core::domain::{Location, NodeInfo, NodePath, PathKey, RawChangeRow, RawKind};
use twinsync_core::ports::{
    AdapterError, ILocalEventSource, IRemoteChangeFeed, ISyncAdapter, IStateRepository,
};
use twinsync_sync::control::JobControl;
use twinsync_sync::engine::{EnginePorts, SyncEngine};

pub const JOB: &str = "job-test";

pub fn p(s: &str) -> NodePath {
    NodePath::new(s).unwrap()
}

pub fn sha(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn epoch() -> DateTime<Utc> {
    DateTime::from_timestamp(0, 0).unwrap()
}

pub fn file_node(path: &str, bytes: &[u8]) -> NodeInfo {
    NodeInfo::file(p(path), sha(bytes), bytes.len() as u64, epoch())
}

pub fn dir_node(path: &str) -> NodeInfo {
    NodeInfo::directory(p(path), epoch())
}

// ============================================================================
// In-memory replica
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Dir,
    File(Vec<u8>),
}

/// One replica's tree, keyed by path
#[derive(Clone, Default)]
pub struct Volume {
    nodes: Arc<DashMap<PathKey, (NodePath, Entry)>>,
}

impl Volume {
    /// A volume holding only its root
    pub fn new() -> Self {
        let volume = Self::default();
        volume.put_dir("/");
        volume
    }

    pub fn put_dir(&self, path: &str) {
        let path = p(path);
        self.nodes.insert(path.key(), (path, Entry::Dir));
    }

    pub fn put_file(&self, path: &str, bytes: &[u8]) {
        let path = p(path);
        self.nodes
            .insert(path.key(), (path, Entry::File(bytes.to_vec())));
    }

    pub fn get(&self, path: &str) -> Option<Entry> {
        self.nodes.get(&p(path).key()).map(|node| node.1.clone())
    }

    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        match self.get(path) {
            Some(Entry::File(bytes)) => Some(bytes),
            _ => None,
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.nodes.contains_key(&p(path).key())
    }

    /// Every path except the root, sorted
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .nodes
            .iter()
            .filter(|node| !node.0.is_root())
            .map(|node| node.0.to_string())
            .collect();
        paths.sort();
        paths
    }

    fn entry(&self, path: &NodePath) -> Option<Entry> {
        self.nodes.get(&path.key()).map(|node| node.1.clone())
    }

    fn within(&self, path: &NodePath) -> Vec<(PathKey, NodePath)> {
        self.nodes
            .iter()
            .filter(|node| node.0.is_within(path))
            .map(|node| (node.key().clone(), node.0.clone()))
            .collect()
    }
}

type Hook = Arc<dyn Fn() + Send + Sync>;

/// [`ISyncAdapter`] over a [`Volume`], logging every write
pub struct MemoryAdapter {
    location: Location,
    volume: Volume,
    /// The local volume, used by transfers on the remote adapter
    peer: Volume,
    calls: Mutex<Vec<String>>,
    failures: DashMap<PathKey, AdapterError>,
    delays: DashMap<String, Duration>,
    hooks: DashMap<PathKey, Hook>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

/// Counts one write in progress until dropped
struct Running<'a>(&'a AtomicUsize);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryAdapter {
    pub fn new(location: Location, volume: Volume, peer: Volume) -> Arc<Self> {
        Arc::new(Self {
            location,
            volume,
            peer,
            calls: Mutex::new(Vec::new()),
            failures: DashMap::new(),
            delays: DashMap::new(),
            hooks: DashMap::new(),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    /// Makes every write touching `path` fail with `err`
    pub fn fail_on(&self, path: &str, err: AdapterError) {
        self.failures.insert(p(path).key(), err);
    }

    pub fn clear_failures(&self) {
        self.failures.clear();
    }

    /// Makes one call, e.g. `"delete /x.txt"`, take `delay` before it runs
    pub fn delay_on(&self, call: &str, delay: Duration) {
        self.delays.insert(call.to_string(), delay);
    }

    /// Runs `hook` when a write touching `path` starts
    pub fn hook_on(&self, path: &str, hook: impl Fn() + Send + Sync + 'static) {
        self.hooks.insert(p(path).key(), Arc::new(hook));
    }

    /// Most writes seen running at the same time
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Write calls made so far, e.g. `"upload /a.txt"`
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    fn log(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    /// Starts the write `call` on `path`: hook, delay, then the scripted failure
    async fn enter(&self, path: &NodePath, call: &str) -> Result<Running<'_>, AdapterError> {
        let running = Running(&self.running);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let hook = self.hooks.get(&path.key()).map(|hook| Arc::clone(hook.value()));
        if let Some(hook) = hook {
            hook();
        }
        let delay = self.delays.get(call).map(|delay| *delay.value());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.failures.get(&path.key()) {
            Some(err) => Err(err.clone()),
            None => Ok(running),
        }
    }

    fn info(path: &NodePath, entry: &Entry, with_hash: bool) -> NodeInfo {
        match entry {
            Entry::Dir => NodeInfo::directory(path.clone(), epoch()),
            Entry::File(bytes) => {
                let hash = if with_hash { sha(bytes) } else { String::new() };
                NodeInfo::file(path.clone(), hash, bytes.len() as u64, epoch())
            }
        }
    }
}

#[async_trait::async_trait]
impl ISyncAdapter for MemoryAdapter {
    fn location(&self) -> Location {
        self.location
    }

    async fn stat(&self, path: &NodePath, with_hash: bool) -> Result<Option<NodeInfo>, AdapterError> {
        Ok(self
            .volume
            .entry(path)
            .map(|entry| Self::info(path, &entry, with_hash)))
    }

    async fn mkdir(&self, path: &NodePath) -> Result<(), AdapterError> {
        let call = format!("mkdir {path}");
        let _running = self.enter(path, &call).await?;
        self.log(call);
        self.volume.put_dir(path.as_str());
        Ok(())
    }

    async fn mkfile(&self, path: &NodePath) -> Result<(), AdapterError> {
        let call = format!("mkfile {path}");
        let _running = self.enter(path, &call).await?;
        self.log(call);
        self.volume.put_file(path.as_str(), b"");
        Ok(())
    }

    async fn delete(&self, path: &NodePath) -> Result<(), AdapterError> {
        let call = format!("delete {path}");
        let _running = self.enter(path, &call).await?;
        self.log(call);
        let doomed = self.volume.within(path);
        if doomed.is_empty() {
            return Err(AdapterError::NotFound(path.to_string()));
        }
        for (key, _) in doomed {
            self.volume.nodes.remove(&key);
        }
        Ok(())
    }

    async fn move_node(&self, source: &NodePath, target: &NodePath) -> Result<(), AdapterError> {
        let call = format!("move {source} {target}");
        let _running = self.enter(target, &call).await?;
        self.log(call);
        let moving = self.volume.within(source);
        if moving.is_empty() {
            return Err(AdapterError::NotFound(source.to_string()));
        }
        for (key, old) in moving {
            if let Some((_, (_, entry))) = self.volume.nodes.remove(&key) {
                let new = old.rebase(source, target).unwrap();
                self.volume.nodes.insert(new.key(), (new, entry));
            }
        }
        Ok(())
    }

    async fn upload(&self, local: &NodePath, remote: &NodePath) -> Result<(), AdapterError> {
        let call = format!("upload {local}");
        let _running = self.enter(remote, &call).await?;
        self.log(call);
        match self.peer.entry(local) {
            Some(Entry::File(bytes)) => {
                self.volume.put_file(remote.as_str(), &bytes);
                Ok(())
            }
            _ => Err(AdapterError::NotFound(local.to_string())),
        }
    }

    async fn download(&self, remote: &NodePath, local: &NodePath) -> Result<(), AdapterError> {
        let call = format!("download {remote}");
        let _running = self.enter(remote, &call).await?;
        self.log(call);
        match self.volume.entry(remote) {
            Some(Entry::File(bytes)) => {
                self.peer.put_file(local.as_str(), &bytes);
                Ok(())
            }
            _ => Err(AdapterError::NotFound(remote.to_string())),
        }
    }
}

// ============================================================================
// Scripted change feed
// ============================================================================

/// A feed replaying a fixed row log from any sequence
#[derive(Default)]
pub struct ScriptedFeed {
    rows: Mutex<Vec<RawChangeRow>>,
    next_seq: AtomicU64,
    error: Mutex<Option<AdapterError>>,
    writing: AtomicBool,
    fetches: AtomicU64,
    starts: Mutex<Vec<u64>>,
}

impl ScriptedFeed {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_seq: AtomicU64::new(1),
            ..Self::default()
        })
    }

    /// Appends a row; returns its sequence
    pub fn push(
        &self,
        entity: &str,
        kind: RawKind,
        source: Option<&str>,
        target: Option<&str>,
        node: NodeInfo,
    ) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.rows.lock().unwrap().push(RawChangeRow {
            seq,
            entity_id: entity.to_string(),
            kind,
            source: source.map(p),
            target: target.map(p),
            node,
        });
        seq
    }

    pub fn create_file(&self, entity: &str, path: &str, bytes: &[u8]) -> u64 {
        self.push(entity, RawKind::Create, None, Some(path), file_node(path, bytes))
    }

    pub fn create_dir(&self, entity: &str, path: &str) -> u64 {
        self.push(entity, RawKind::Create, None, Some(path), dir_node(path))
    }

    pub fn edit(&self, entity: &str, path: &str, bytes: &[u8]) -> u64 {
        self.push(entity, RawKind::Content, Some(path), Some(path), file_node(path, bytes))
    }

    pub fn rename(&self, entity: &str, source: &str, target: &str, node: NodeInfo) -> u64 {
        self.push(entity, RawKind::Path, Some(source), Some(target), node)
    }

    pub fn delete(&self, entity: &str, path: &str, node: NodeInfo) -> u64 {
        self.push(entity, RawKind::Delete, Some(path), None, node)
    }

    /// Makes the next fetches fail with `err` until cleared
    pub fn fail_with(&self, err: Option<AdapterError>) {
        *self.error.lock().unwrap() = err;
    }

    pub fn set_writing(&self, writing: bool) {
        self.writing.store(writing, Ordering::SeqCst);
    }

    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    /// The `since` of every fetch so far
    pub fn starts(&self) -> Vec<u64> {
        self.starts.lock().unwrap().clone()
    }

    async fn stream(
        &self,
        since: u64,
        sink: mpsc::Sender<RawChangeRow>,
    ) -> Result<u64, AdapterError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.starts.lock().unwrap().push(since);
        if let Some(err) = self.error.lock().unwrap().clone() {
            return Err(err);
        }

        let mut rows: Vec<RawChangeRow> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|row| row.seq >= since)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.entity_id.cmp(&b.entity_id).then(a.seq.cmp(&b.seq)));

        let upper = rows.iter().map(|row| row.seq + 1).max().unwrap_or(since);
        for row in rows {
            sink.send(row).await.map_err(|_| AdapterError::Interrupted)?;
        }
        Ok(upper)
    }
}

#[async_trait::async_trait]
impl IRemoteChangeFeed for ScriptedFeed {
    async fn fetch_changes(
        &self,
        since: u64,
        sink: mpsc::Sender<RawChangeRow>,
    ) -> Result<u64, AdapterError> {
        self.stream(since, sink).await
    }
}

#[async_trait::async_trait]
impl ILocalEventSource for ScriptedFeed {
    async fn read_events(
        &self,
        since: u64,
        sink: mpsc::Sender<RawChangeRow>,
    ) -> Result<u64, AdapterError> {
        self.stream(since, sink).await
    }

    fn is_writing(&self) -> bool {
        self.writing.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Both replicas, both feeds and the state database of one job
pub struct Harness {
    pub local_volume: Volume,
    pub remote_volume: Volume,
    pub local: Arc<MemoryAdapter>,
    pub remote: Arc<MemoryAdapter>,
    pub local_feed: Arc<ScriptedFeed>,
    pub remote_feed: Arc<ScriptedFeed>,
    pub repository: Arc<dyn IStateRepository>,
}

impl Harness {
    pub async fn new() -> Self {
        let pool = DatabasePool::in_memory()
            .await
            .expect("Failed to create in-memory database");
        let repository: Arc<dyn IStateRepository> =
            Arc::new(
                SqliteStateRepository::new(pool.pool().clone())
                    .with_failure_history(config().state.failure_history),
            );

        let local_volume = Volume::new();
        let remote_volume = Volume::new();
        Self {
            local: MemoryAdapter::new(Location::Local, local_volume.clone(), Volume::new()),
            remote: MemoryAdapter::new(Location::Remote, remote_volume.clone(), local_volume.clone()),
            local_volume,
            remote_volume,
            local_feed: ScriptedFeed::new(),
            remote_feed: ScriptedFeed::new(),
            repository,
        }
    }

    pub fn ports(&self) -> EnginePorts {
        EnginePorts {
            local: self.local.clone(),
            remote: self.remote.clone(),
            local_events: self.local_feed.clone(),
            remote_feed: self.remote_feed.clone(),
            repository: self.repository.clone(),
        }
    }

    pub fn control(&self) -> JobControl {
        JobControl::new(JOB, self.repository.clone())
    }

    /// An engine for `config`, sharing this harness's state
    pub fn engine_with(&self, config: &Config) -> SyncEngine {
        SyncEngine::new(config, self.ports(), self.control()).expect("engine config is valid")
    }

    pub fn engine(&self) -> SyncEngine {
        self.engine_with(&config())
    }
}

/// Test defaults: no pacing, no replica probing, a short write-burst cap
pub fn builder() -> ConfigBuilder {
    ConfigBuilder::new()
        .job_id(JOB)
        .pacing(0, 0)
        .event_wait_max_secs(1)
        .unnecessary_changes(UnnecessaryChangePolicy::Never)
}

pub fn config() -> Config {
    builder().build()
}
