//! Conflict naming for keep-both resolution
//!
//! Generates file names for conflict copies, following the pattern:
//! `filename (conflicted copy YYYY-MM-DD XXXXXXXX).ext`

use chrono::Utc;
use uuid::Uuid;

/// Number of numbered variants tried before falling back to a full UUID
pub const MAX_NUMBERED_ATTEMPTS: u32 = 99;

/// Generates conflict file names
pub struct ConflictNamer;

impl ConflictNamer {
    /// Generates a conflict copy filename
    ///
    /// Given "report.docx", produces something like:
    /// "report (conflicted copy 2026-10-14 a1b2c3d4).docx"
    pub fn generate(original_name: &str) -> String {
        let timestamp = Utc::now().format("%Y-%m-%d");
        let short_uuid = &Uuid::new_v4().to_string()[..8];

        match split_extension(original_name) {
            Some((stem, ext)) => format!("{stem} (conflicted copy {timestamp} {short_uuid}){ext}"),
            None => format!("{original_name} (conflicted copy {timestamp} {short_uuid})"),
        }
    }

    /// The `n`-th variant of a colliding candidate: "stem n.ext"
    pub fn numbered(candidate: &str, n: u32) -> String {
        match split_extension(candidate) {
            Some((stem, ext)) => format!("{stem} {n}{ext}"),
            None => format!("{candidate} {n}"),
        }
    }

    /// Name used once every numbered variant collided
    pub fn last_resort(original_name: &str) -> String {
        format!("{original_name}.conflict-{}", Uuid::new_v4())
    }
}

/// Splits "name.ext" into ("name", ".ext"); dotfiles have no extension
fn split_extension(name: &str) -> Option<(&str, &str)> {
    match name.rfind('.') {
        Some(0) | None => None,
        Some(dot_pos) => Some((&name[..dot_pos], &name[dot_pos..])),
    }
}
