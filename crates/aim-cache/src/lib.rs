//! Model artifact cache.
//!
//! Artifacts are materialized under `<root>/models/` and tracked in a JSON
//! index at `<root>/cache_index.json`. Total size never exceeds the
//! configured capacity: when a new artifact would not fit, unpinned entries
//! are evicted lowest priority first, least recently used within a tier.
//! Entries held by running instances are pinned and never evicted.

#![deny(missing_docs)]

pub mod entry;
pub mod fetcher;
pub mod index;
pub mod manager;

pub use entry::{model_dir_name, validate_model_id, CacheEntry, EntryState, Priority};
pub use fetcher::{Fetcher, HubCliConfig, HubCliFetcher, LocalCopyFetcher};
pub use index::{CacheIndex, INDEX_FILE};
pub use manager::{CacheConfig, CacheManager, CacheStats, EntrySnapshot, ModelPolicy};
