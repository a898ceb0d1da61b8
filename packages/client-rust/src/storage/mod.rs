//! Unified storage substrate.
//!
//! Layering, innermost first: [`StorageBackend`](backend::StorageBackend)
//! (flat bytes) -> [`WriteCoalescer`](coalescer::WriteCoalescer) (batched
//! writes) -> [`UnifiedStorage`](store::UnifiedStorage) (namespaces, TTL,
//! encryption, compression, LRU read cache, sweeper).

pub mod backend;
pub mod backends;
pub mod cache;
pub mod coalescer;
pub mod entry;
pub mod store;

pub use backend::StorageBackend;
pub use backends::file::FileBackend;
pub use backends::memory::MemoryBackend;
pub use entry::{
    EntryMetadata, QueryOptions, SetOptions, SortBy, SortOrder, StorageEntry, StorageStats,
};
pub use store::UnifiedStorage;
