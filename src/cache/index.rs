//! Key to entry table.
//!
//! A [`DashMap`] provides the short index-wide exclusion for creation and
//! removal; content visibility is guarded by each entry's own lock.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

use super::entry::{CacheEntry, EntryMeta, StoredContent};
use super::key::CacheKey;

/// Outcome of [`CacheIndex::lookup_or_create`].
pub enum Lookup {
    /// The key already had an entry. Its lock is not held.
    Existing(Arc<CacheEntry>),
    /// A new `Fetching` entry was installed and its lock taken for the caller.
    Created(Arc<CacheEntry>, OwnedMutexGuard<EntryMeta>),
}

#[derive(Default)]
pub struct CacheIndex {
    entries: DashMap<CacheKey, Arc<CacheEntry>>,
}

impl CacheIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finds the entry for `key`, or creates it already locked.
    ///
    /// Check and insert happen under the same shard lock, so two concurrent
    /// callers can never both get `Created` for one key.
    pub fn lookup_or_create(&self, key: &CacheKey) -> Lookup {
        match self.entries.entry(key.clone()) {
            Entry::Occupied(occupied) => Lookup::Existing(Arc::clone(occupied.get())),
            Entry::Vacant(vacant) => {
                let entry = Arc::new(CacheEntry::fetching(key.clone()));
                let Some(guard) = entry.try_lock() else {
                    unreachable!("lock of an unpublished entry is contended");
                };
                vacant.insert(Arc::clone(&entry));
                Lookup::Created(entry, guard)
            }
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.entries.get(key).map(|e| Arc::clone(e.value()))
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Removes `key` only if it still maps to `entry`; a newer entry created
    /// after a rollback is left alone.
    pub fn remove_entry(&self, key: &CacheKey, entry: &Arc<CacheEntry>) -> bool {
        self.entries
            .remove_if(key, |_, current| Arc::ptr_eq(current, entry))
            .is_some()
    }

    /// Installs an entry recovered from the file tier at startup.
    pub fn insert_ready(&self, key: CacheKey, content: StoredContent) {
        let entry = Arc::new(CacheEntry::ready(key.clone(), content));
        self.entries.insert(key, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::EntryState;
    use crate::cache::storage::TierLocator;
    use std::time::SystemTime;

    fn key() -> CacheKey {
        CacheKey::parse("http://mirror.example/pkg-1.0.tgz").unwrap()
    }

    #[tokio::test]
    async fn first_lookup_creates_locked_entry() {
        let index = CacheIndex::new();
        let Lookup::Created(entry, guard) = index.lookup_or_create(&key()) else {
            panic!("expected a new entry");
        };
        assert_eq!(guard.state, EntryState::Fetching);
        assert!(entry.try_lock().is_none());

        let Lookup::Existing(same) = index.lookup_or_create(&key()) else {
            panic!("expected the existing entry");
        };
        assert!(Arc::ptr_eq(&entry, &same));
        drop(guard);
        assert!(same.try_lock().is_some());
    }

    #[tokio::test]
    async fn remove_entry_ignores_replacements() {
        let index = CacheIndex::new();
        let Lookup::Created(old, guard) = index.lookup_or_create(&key()) else {
            panic!("expected a new entry");
        };
        drop(guard);
        assert!(index.remove_entry(&key(), &old));
        assert!(!index.contains(&key()));

        let Lookup::Created(_new, _guard) = index.lookup_or_create(&key()) else {
            panic!("expected a new entry after removal");
        };
        assert!(!index.remove_entry(&key(), &old));
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn recovered_entries_are_ready() {
        let index = CacheIndex::new();
        index.insert_ready(
            key(),
            StoredContent {
                locator: TierLocator::File("/tmp/x".into()),
                size: 3,
                loaded_at: SystemTime::UNIX_EPOCH,
            },
        );
        let entry = index.get(&key()).unwrap();
        let meta = entry.lock().await;
        assert_eq!(meta.state, EntryState::Ready);
        assert_eq!(meta.content.as_ref().map(|c| c.size), Some(3));
    }
}
