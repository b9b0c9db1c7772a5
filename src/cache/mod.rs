//! Client-side cache: keys, entries, the in-memory store, and optional
//! on-disk persistence for offline starts.

mod entry;
mod key;
mod lock;
mod persist;
mod store;

pub use entry::{CacheEntry, EntryPatch, FetchStatus, DEFAULT_GC_TIME};
pub use key::{is_prefix_of, make_key, CacheKey, EntityKeys, KeyParam, QueryKey};
pub(crate) use lock::mutex_lock;
pub use persist::{PersistedEntry, SqlitePersister};
pub use store::{CacheStore, Listener, StoreSubscription};
