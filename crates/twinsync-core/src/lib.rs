//! TwinSync Core - Domain types and port definitions
//!
//! This crate contains the hexagonal architecture core of the reconciliation
//! engine:
//! - **Domain types** - `NodePath`, `ChangeRecord`, `EchoRecord`, `NodeStatus`, `ConflictRecord`
//! - **Port definitions** - Traits for adapters: `IRemoteChangeFeed`, `ILocalEventSource`,
//!   `ISyncAdapter`, `IStateRepository`
//! - **Configuration** - Typed YAML job configuration with validation
//!
//! # Architecture
//!
//! The domain module is pure data and validation with no I/O.
//! Ports define the trait interfaces that adapter crates implement and that
//! the sync engine drives.

pub mod config;
pub mod domain;
pub mod ports;
