//! # LoomDB Store
//!
//! Backing store contract for LoomDB.
//!
//! This crate defines the transactional key/value surface the coherence
//! engine is layered over:
//! - [`KvStore`] - snapshot-isolated reads, single-write transactions,
//!   a monotonic commit counter
//! - [`ReadHandle`] / [`WriteHandle`] - scoped handles for one transaction
//! - [`MemoryStore`] - an in-memory MVCC implementation used for testing
//!   and for embedding without an external durable engine
//!
//! The engine owns all interpretation of collections and keys; stores treat
//! values as opaque bytes and do not understand changesets or extensions.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod memory;
mod store;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use store::{KvStore, ReadHandle, WriteHandle};
