//! In-memory caches used by connections and extensions.
//!
//! All caches are local data structures with no I/O. A connection's caches
//! are mutated only by that connection's own transactions or by the lazy
//! changeset-apply step, never concurrently, so none of them lock.

mod bidi;
mod edges;
mod lru;

pub use bidi::BidiCache;
pub use edges::EdgeCache;
pub use lru::ObjectCache;
