//! Integration tests for twinsync-sync
//!
//! Drives full sync cycles against in-memory replicas and scripted change
//! feeds, with the state kept in an in-memory SQLite database.

mod common;

mod test_cycle;
mod test_conflicts;
mod test_failures;
