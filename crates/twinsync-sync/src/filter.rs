//! Ingestion filters
//!
//! Both run on a record before it enters the Change Store:
//! - [`PathFilter`]: the job's include/exclude globs, matched on the
//!   record's primary path. Excludes win; no includes means everything.
//! - [`EchoFilter`]: drops changes the engine itself caused in the previous
//!   cycle. Every buffered echo suppresses at most one record.

use std::collections::HashMap;

use glob::Pattern;
use tracing::{debug, trace};

use twinsync_core::config::FilterConfig;
use twinsync_core::domain::{BufferedEcho, ChangeRecord, EchoKey, EchoRecord, NodePath};

use crate::SyncError;

// ============================================================================
// PathFilter
// ============================================================================

/// Compiled include/exclude globs
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    includes: Vec<Pattern>,
    excludes: Vec<Pattern>,
}

fn compile(patterns: &[String]) -> Result<Vec<Pattern>, SyncError> {
    patterns
        .iter()
        .map(|pattern| {
            Pattern::new(pattern).map_err(|e| {
                SyncError::InvalidConfig(format!("invalid filter pattern '{pattern}': {e}"))
            })
        })
        .collect()
}

fn matches(pattern: &Pattern, path: &NodePath) -> bool {
    let full = path.as_str();
    pattern.matches(full) || pattern.matches(full.trim_start_matches('/'))
}

impl PathFilter {
    /// Compiles the job's filters
    ///
    /// # Errors
    /// Returns `SyncError::InvalidConfig` for a malformed glob.
    pub fn from_config(config: &FilterConfig) -> Result<Self, SyncError> {
        Ok(Self {
            includes: compile(&config.includes)?,
            excludes: compile(&config.excludes)?,
        })
    }

    pub fn allows(&self, path: &NodePath) -> bool {
        if self.excludes.iter().any(|pattern| matches(pattern, path)) {
            return false;
        }
        self.includes.is_empty() || self.includes.iter().any(|pattern| matches(pattern, path))
    }

    pub fn allows_record(&self, record: &ChangeRecord) -> bool {
        let allowed = self.allows(record.primary_path());
        if !allowed {
            trace!(path = %record.primary_path(), "Change filtered out");
        }
        allowed
    }
}

// ============================================================================
// EchoFilter
// ============================================================================

/// One buffered echo as seen by the filter
#[derive(Debug)]
struct Slot {
    id: i64,
    matched_seq: Option<u64>,
    used: bool,
}

/// Multiset of the echoes buffered by the previous cycle
///
/// An unbound echo suppresses the first matching change and binds itself to
/// that change's sequence. A bound echo only suppresses a replay of the
/// change it was bound to.
#[derive(Debug, Default)]
pub struct EchoFilter {
    pending: HashMap<EchoKey, Vec<Slot>>,
    bindings: Vec<(i64, u64)>,
    suppressed: usize,
}

impl EchoFilter {
    pub fn new(echoes: impl IntoIterator<Item = BufferedEcho>) -> Self {
        let mut pending: HashMap<EchoKey, Vec<Slot>> = HashMap::new();
        for buffered in echoes {
            pending.entry(buffered.echo.key()).or_default().push(Slot {
                id: buffered.id,
                matched_seq: buffered.matched_seq,
                used: false,
            });
        }
        debug!(distinct = pending.len(), "Echo filter loaded");
        Self {
            pending,
            bindings: Vec::new(),
            suppressed: 0,
        }
    }

    /// Returns true, consuming one echo, if `record` is an echo
    pub fn suppress(&mut self, record: &ChangeRecord) -> bool {
        let key = EchoRecord::key_for(record);
        let Some(slots) = self.pending.get_mut(&key) else {
            return false;
        };

        let replayed = slots
            .iter()
            .position(|slot| !slot.used && slot.matched_seq == Some(record.sequence));
        let index = match replayed {
            Some(index) => index,
            None => match slots
                .iter()
                .position(|slot| !slot.used && slot.matched_seq.is_none())
            {
                Some(index) => {
                    self.bindings.push((slots[index].id, record.sequence));
                    index
                }
                None => return false,
            },
        };

        slots[index].used = true;
        self.suppressed += 1;
        trace!(
            location = %record.location,
            kind = %record.kind(),
            path = %record.primary_path(),
            seq = record.sequence,
            replay = replayed.is_some(),
            "Echo suppressed"
        );
        true
    }

    /// Echo ids newly bound during this ingest, with the sequence each matched
    pub fn bindings(&self) -> &[(i64, u64)] {
        &self.bindings
    }

    /// How many records were suppressed so far
    pub fn suppressed(&self) -> usize {
        self.suppressed
    }

    /// Echoes not matched by any record
    pub fn unmatched(&self) -> usize {
        self.pending
            .values()
            .flatten()
            .filter(|slot| !slot.used)
            .count()
    }
}
