//! # LoomDB Core
//!
//! Embedded object-storage engine with snapshot-coherent connections and
//! an extension hook pipeline.
//!
//! This crate provides:
//! - A [`Database`] facade over a pluggable backing store
//! - [`Connection`]s with private object caches, kept coherent by lazily
//!   applied changesets
//! - Snapshot-isolated read and serialized read-write [`transaction`]s
//! - An extension SPI with per-mutation hooks, private tables, and
//!   per-connection derived state
//! - Built-in extensions: ordered views, secondary indexes, and a
//!   relationship graph with delete rules

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod changeset;
pub mod config;
pub mod connection;
pub mod database;
pub mod error;
pub mod extension;
pub mod transaction;
pub mod types;

pub use changeset::{ChangeKind, ChangeRecord, Changeset, Fragment};
pub use config::Config;
pub use connection::Connection;
pub use database::Database;
pub use error::{EngineError, EngineResult};
pub use transaction::{ReadTransaction, WriteTransaction};
pub use types::{ConnectionId, ObjectKey, Snapshot};
