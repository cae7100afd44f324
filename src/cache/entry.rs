use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::key::CacheKey;
use super::storage::{Tier, TierLocator};

/// Lifecycle of an index entry.
///
/// ```text
/// (absent) --has--> Fetching --put--> Ready --stale/forced--> Fetching --put--> Ready
///                      |                                          |
///                      +--fetch failed--> Invalid (removed)       +--fetch failed--> Ready (prior)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Fetching,
    Ready,
    Invalid,
}

/// Bytes committed for an entry by a successful fetch.
#[derive(Debug, Clone)]
pub struct StoredContent {
    pub locator: TierLocator,
    pub size: u64,
    pub loaded_at: SystemTime,
}

impl StoredContent {
    pub fn tier(&self) -> Tier {
        self.locator.tier()
    }

    /// Age at `now`; content stamped in the future counts as brand new.
    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.loaded_at).unwrap_or_default()
    }
}

/// Mutable part of an entry, only reachable through the entry lock.
#[derive(Debug)]
pub struct EntryMeta {
    pub state: EntryState,
    /// Present once the entry was `Ready` at least once. Kept while a refetch
    /// runs so a failed refetch can fall back to it.
    pub content: Option<StoredContent>,
}

/// One entry per key. The lock serializes fetches against reads and is the
/// singleflight primitive: whoever holds it owns the fetch for this key.
#[derive(Debug)]
pub struct CacheEntry {
    key: CacheKey,
    meta: Arc<Mutex<EntryMeta>>,
}

impl CacheEntry {
    pub(crate) fn fetching(key: CacheKey) -> Self {
        Self {
            key,
            meta: Arc::new(Mutex::new(EntryMeta {
                state: EntryState::Fetching,
                content: None,
            })),
        }
    }

    pub(crate) fn ready(key: CacheKey, content: StoredContent) -> Self {
        Self {
            key,
            meta: Arc::new(Mutex::new(EntryMeta {
                state: EntryState::Ready,
                content: Some(content),
            })),
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Waits for any in-flight fetch and takes the entry lock.
    pub async fn lock(&self) -> OwnedMutexGuard<EntryMeta> {
        Arc::clone(&self.meta).lock_owned().await
    }

    pub(crate) fn try_lock(&self) -> Option<OwnedMutexGuard<EntryMeta>> {
        Arc::clone(&self.meta).try_lock_owned().ok()
    }
}
