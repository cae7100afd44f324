//! # Cache engine
//!
//! Keyed store in front of the upstream mirrors. For every request it decides
//! whether cached bytes exist and are fresh, makes sure only one upstream
//! fetch per key is ever in flight, and commits fetched bodies to one of two
//! storage tiers.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │  CacheEngine                                  │
//! │  ├─ CacheIndex (DashMap<CacheKey, Entry>)     │← creation/removal
//! │  │    └─ CacheEntry (tokio Mutex per key)     │← singleflight + visibility
//! │  └─ StorageTier                               │
//! │       ├─ memory (Bytes)                       │← bodies <= threshold
//! │       └─ file  (<root>/<b64 key>)             │← larger bodies, survive restarts
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Request flow
//!
//! `has` → (on miss) upstream fetch → `put` → `get`. The caller that gets
//! [`Presence::Missing`] owns a [`FetchPermit`] and is the only one fetching;
//! everyone else blocks on the entry lock inside `get` until the permit is
//! committed or dropped. Dropping an uncommitted permit rolls the entry back,
//! so no exit path can leave a key stuck in `Fetching`.

mod entry;
mod error;
mod index;
mod key;
mod storage;
mod upstream;

pub use entry::{CacheEntry, EntryMeta, EntryState, StoredContent};
pub use error::{CacheError, StorageError};
pub use index::{CacheIndex, Lookup};
pub use key::CacheKey;
pub use storage::{ContentReader, StorageConfig, StorageTier, Tier, TierLocator};
pub use upstream::{Fetched, Upstream, UpstreamBody};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::AsyncRead;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

/// Source of "now" for staleness decisions.
pub type Clock = Arc<dyn Fn() -> SystemTime + Send + Sync>;

/// How a served response relates to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// The key was unknown and this request fetched it.
    Miss,
    /// Served from the cache within its TTL.
    Fresh,
    /// The cached copy was older than its TTL and was refreshed.
    Stale,
    /// The client forced a refresh.
    Invalidated,
    /// The index pointed at missing bytes and the entry was rebuilt.
    Recovered,
}

impl CacheOutcome {
    /// Label used in metrics, logs and the `X-Pkgproxy-Cache` header.
    pub fn as_str(self) -> &'static str {
        match self {
            CacheOutcome::Miss => "miss",
            CacheOutcome::Fresh => "ok",
            CacheOutcome::Stale => "too_old",
            CacheOutcome::Invalidated => "invalidate",
            CacheOutcome::Recovered => "item_missing",
        }
    }
}

/// Content handed to the dispatcher.
#[derive(Debug)]
pub struct CachedContent {
    pub reader: ContentReader,
    pub loaded_at: SystemTime,
    pub size: u64,
    pub tier: Tier,
    pub outcome: CacheOutcome,
}

/// Result of [`CacheEngine::has`].
pub enum Presence {
    /// The key was absent. The caller must fetch and [`CacheEngine::put`], or
    /// drop the permit to roll back.
    Missing(FetchPermit),
    /// An entry exists, possibly still being fetched by someone else.
    Present(EntryHandle),
}

impl Presence {
    pub fn existed(&self) -> bool {
        matches!(self, Presence::Present(_))
    }
}

/// Handle on an existing entry whose lock the caller does not hold.
pub struct EntryHandle {
    entry: Arc<CacheEntry>,
}

impl EntryHandle {
    /// Returns once no fetch is in flight for the entry.
    pub async fn wait(&self) {
        drop(self.entry.lock().await);
    }
}

/// Exclusive right to fetch and commit one key.
///
/// Holds the entry lock. Committing through [`CacheEngine::put`] publishes the
/// new content; dropping it uncommitted restores the previous state: a new
/// entry disappears from the index, a refresh falls back to its prior content.
pub struct FetchPermit {
    key: CacheKey,
    entry: Arc<CacheEntry>,
    meta: OwnedMutexGuard<EntryMeta>,
    index: Arc<CacheIndex>,
    created: bool,
    committed: bool,
}

impl FetchPermit {
    fn refresh(
        key: &CacheKey,
        entry: Arc<CacheEntry>,
        mut meta: OwnedMutexGuard<EntryMeta>,
        index: Arc<CacheIndex>,
    ) -> Self {
        meta.state = EntryState::Fetching;
        Self {
            key: key.clone(),
            entry,
            meta,
            index,
            created: false,
            committed: false,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Whether this permit refreshes content that was already `Ready`.
    pub fn is_refresh(&self) -> bool {
        !self.created
    }
}

impl Drop for FetchPermit {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if self.created || self.meta.content.is_none() {
            self.meta.state = EntryState::Invalid;
            self.index.remove_entry(&self.key, &self.entry);
            warn!(key = %self.key, "Fetch did not complete, entry rolled back");
        } else {
            self.meta.state = EntryState::Ready;
            warn!(key = %self.key, "Refresh did not complete, keeping previous content");
        }
    }
}

/// Engine statistics for the admin API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub memory_bytes: u64,
    pub file_bytes: u64,
}

#[derive(Default)]
struct TierUsage {
    memory: AtomicU64,
    file: AtomicU64,
}

impl TierUsage {
    fn counter(&self, tier: Tier) -> &AtomicU64 {
        match tier {
            Tier::Memory => &self.memory,
            Tier::File => &self.file,
        }
    }

    fn add(&self, tier: Tier, bytes: u64) {
        self.counter(tier).fetch_add(bytes, Ordering::Relaxed);
    }

    fn sub(&self, tier: Tier, bytes: u64) {
        let _ = self
            .counter(tier)
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(bytes))
            });
    }
}

/// The cache engine. Construct once at startup and share behind an `Arc`.
pub struct CacheEngine {
    index: Arc<CacheIndex>,
    storage: StorageTier,
    usage: TierUsage,
    clock: Clock,
}

impl CacheEngine {
    /// Opens the file tier under `config.root` and rebuilds the index from it.
    ///
    /// Every file found becomes a `Ready` entry stamped with its modification
    /// time; memory-tier entries do not survive a restart.
    pub fn open(config: StorageConfig) -> Result<Self, CacheError> {
        let storage = StorageTier::open(&config).map_err(|source| CacheError::Open {
            path: config.root.clone(),
            source,
        })?;

        let index = CacheIndex::new();
        let usage = TierUsage::default();
        for object in storage.scan() {
            usage.add(Tier::File, object.size);
            index.insert_ready(
                object.key,
                StoredContent {
                    locator: TierLocator::File(object.path),
                    size: object.size,
                    loaded_at: object.modified,
                },
            );
        }
        info!(
            root = %config.root.display(),
            entries = index.len(),
            memory_threshold = config.memory_threshold,
            "Cache index rebuilt from file tier"
        );

        Ok(Self {
            index: Arc::new(index),
            storage,
            usage,
            clock: Arc::new(SystemTime::now),
        })
    }

    /// Replaces the clock used for staleness decisions and `loaded_at` stamps.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn storage(&self) -> &StorageTier {
        &self.storage
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.index.len(),
            memory_bytes: self.usage.memory.load(Ordering::Relaxed),
            file_bytes: self.usage.file.load(Ordering::Relaxed),
        }
    }

    /// Miss detection and fetch lock in one atomic step.
    ///
    /// Splitting the two would let several callers each see a miss and fetch.
    pub fn has(&self, key: &CacheKey) -> Presence {
        match self.index.lookup_or_create(key) {
            Lookup::Existing(entry) => Presence::Present(EntryHandle { entry }),
            Lookup::Created(entry, meta) => Presence::Missing(FetchPermit {
                key: key.clone(),
                entry,
                meta,
                index: Arc::clone(&self.index),
                created: true,
                committed: false,
            }),
        }
    }

    /// Commits a fetched body for the permit's key and releases the lock.
    ///
    /// On failure the permit is dropped uncommitted, which rolls the entry
    /// back before the error is returned.
    pub async fn put<R>(
        &self,
        mut permit: FetchPermit,
        body: R,
        content_length: Option<u64>,
    ) -> Result<(), CacheError>
    where
        R: AsyncRead + Unpin,
    {
        let stored = match self.storage.write(&permit.key, body, content_length).await {
            Ok(stored) => stored,
            Err(source) => {
                warn!(key = %permit.key, error = %source, "Failed to store fetched content");
                return Err(match source {
                    StorageError::Stream(_) | StorageError::LengthMismatch { .. } => {
                        CacheError::fetch_failed(permit.key.as_str(), source)
                    }
                    source => CacheError::StorageWrite {
                        key: permit.key.to_string(),
                        source,
                    },
                });
            }
        };

        let content = StoredContent {
            locator: stored.locator,
            size: stored.size,
            loaded_at: (self.clock)(),
        };
        self.usage.add(content.tier(), content.size);
        debug!(key = %permit.key, size = content.size, tier = content.tier().as_str(), "Committed");

        let previous = permit.meta.content.replace(content);
        permit.meta.state = EntryState::Ready;
        permit.committed = true;

        if let Some(previous) = previous {
            self.usage.sub(previous.tier(), previous.size);
            // Same path means the rename already replaced it.
            let superseded = match (&previous.locator, &permit.meta.content) {
                (TierLocator::File(old), Some(StoredContent { locator: TierLocator::File(new), .. })) => old != new,
                (TierLocator::File(_), _) => true,
                _ => false,
            };
            if superseded {
                self.storage.remove(&previous.locator).await;
            }
        }
        Ok(())
    }

    /// Reads the entry for `key`, refreshing it first when it is older than
    /// `ttl` or `force_invalidate` is set.
    ///
    /// Callers reach this after `has`/`put` so an entry normally exists; if the
    /// fetch they waited on failed, the result is [`CacheError::NotCached`].
    /// A `Ready` entry whose bytes are gone is discarded and fetched again once.
    /// Refreshes run in their own task, like the miss fetch in [`serve`](Self::serve).
    pub async fn get<U>(
        self: &Arc<Self>,
        key: &CacheKey,
        ttl: Duration,
        force_invalidate: bool,
        upstream: &Arc<U>,
    ) -> Result<CachedContent, CacheError>
    where
        U: Upstream + 'static,
    {
        let mut refreshed: Option<CacheOutcome> = None;
        let mut recovering = false;

        loop {
            let Some(entry) = self.index.get(key) else {
                return Err(CacheError::NotCached(key.to_string()));
            };
            let meta = entry.lock().await;

            let content = match (meta.state, meta.content.clone()) {
                (EntryState::Ready, Some(content)) => content,
                _ => {
                    drop(meta);
                    // Follow a replacement entry, if one was created meanwhile.
                    match self.index.get(key) {
                        Some(newer) if !Arc::ptr_eq(&newer, &entry) => continue,
                        _ => return Err(CacheError::NotCached(key.to_string())),
                    }
                }
            };

            if refreshed.is_none() && !recovering {
                let age = content.age((self.clock)());
                let reason = if force_invalidate {
                    Some(CacheOutcome::Invalidated)
                } else if age > ttl {
                    Some(CacheOutcome::Stale)
                } else {
                    None
                };
                if let Some(reason) = reason {
                    info!(
                        key = %key,
                        age_secs = age.as_secs(),
                        ttl_secs = ttl.as_secs(),
                        outcome = reason.as_str(),
                        "Refreshing cached content"
                    );
                    let permit = FetchPermit::refresh(key, Arc::clone(&entry), meta, Arc::clone(&self.index));
                    self.spawn_fetch(permit, upstream).await?;
                    refreshed = Some(reason);
                    continue;
                }
            }
            // Opened under the lock so a concurrent refresh cannot swap the
            // object between the snapshot and the open.
            let read = self.storage.read(&content.locator, content.size).await;
            drop(meta);

            match read {
                Ok(reader) => {
                    let outcome = match (refreshed, recovering) {
                        (Some(reason), _) => reason,
                        (None, true) => CacheOutcome::Recovered,
                        (None, false) => CacheOutcome::Fresh,
                    };
                    return Ok(CachedContent {
                        reader,
                        loaded_at: content.loaded_at,
                        size: content.size,
                        tier: content.tier(),
                        outcome,
                    });
                }
                Err(source) => {
                    error!(
                        key = %key,
                        tier = content.tier().as_str(),
                        error = %source,
                        "Cache index entry has no readable content"
                    );
                    if recovering {
                        return Err(CacheError::ConsistencyAnomaly {
                            key: key.to_string(),
                            source,
                        });
                    }
                    recovering = true;
                    self.discard(key, &entry, &content).await;
                    if let Presence::Missing(permit) = self.has(key) {
                        self.spawn_fetch(permit, upstream).await?;
                    }
                }
            }
        }
    }

    /// Full request path used by the dispatcher: detect a miss, fetch and
    /// commit it, then read the entry honouring `ttl` and `force_invalidate`.
    ///
    /// Every fetch runs in its own task, so a client that goes away does not
    /// abort a fetch that other requests are waiting on. A request that just
    /// populated the key is not refreshed again by its own force flag.
    pub async fn serve<U>(
        self: &Arc<Self>,
        key: &CacheKey,
        ttl: Duration,
        force_invalidate: bool,
        upstream: &Arc<U>,
    ) -> Result<CachedContent, CacheError>
    where
        U: Upstream + 'static,
    {
        let mut populated = false;
        if let Presence::Missing(permit) = self.has(key) {
            info!(key = %key, "CACHE_MISS");
            self.spawn_fetch(permit, upstream).await?;
            populated = true;
        } else {
            debug!(key = %key, "CACHE_HIT");
        }

        let mut content = self
            .get(key, ttl, force_invalidate && !populated, upstream)
            .await?;
        if populated && content.outcome == CacheOutcome::Fresh {
            content.outcome = CacheOutcome::Miss;
        }
        Ok(content)
    }

    /// Fetches and commits on a detached task. The permit moves into the task,
    /// so dropping the returned future leaves the fetch running.
    async fn spawn_fetch<U>(
        self: &Arc<Self>,
        permit: FetchPermit,
        upstream: &Arc<U>,
    ) -> Result<(), CacheError>
    where
        U: Upstream + 'static,
    {
        let key = permit.key.clone();
        let engine = Arc::clone(self);
        let upstream = Arc::clone(upstream);
        let fetch = tokio::spawn(async move { engine.fetch_into(permit, upstream.as_ref()).await });
        match fetch.await {
            Ok(result) => result,
            Err(e) => Err(CacheError::fetch_failed(key.as_str(), e)),
        }
    }

    async fn fetch_into<U>(&self, permit: FetchPermit, upstream: &U) -> Result<(), CacheError>
    where
        U: Upstream,
    {
        let fetched = upstream.fetch(permit.key.as_str()).await?;
        self.put(permit, fetched.body, fetched.content_length).await
    }

    /// Drops an entry whose bytes vanished, unless it was refreshed meanwhile.
    async fn discard(&self, key: &CacheKey, entry: &Arc<CacheEntry>, seen: &StoredContent) {
        let mut meta = entry.lock().await;
        let unchanged = meta
            .content
            .as_ref()
            .is_some_and(|c| c.loaded_at == seen.loaded_at && c.size == seen.size);
        if meta.state != EntryState::Ready || !unchanged {
            return;
        }
        if let Some(content) = meta.content.take() {
            self.usage.sub(content.tier(), content.size);
            self.storage.remove(&content.locator).await;
        }
        meta.state = EntryState::Invalid;
        self.index.remove_entry(key, entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    struct StaticUpstream {
        body: Vec<u8>,
        calls: AtomicUsize,
    }

    impl Upstream for StaticUpstream {
        async fn fetch(&self, _url: &str) -> Result<Fetched, CacheError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let len = self.body.len() as u64;
            Ok(Fetched::new(std::io::Cursor::new(self.body.clone()), Some(len)))
        }
    }

    fn engine(root: &std::path::Path) -> CacheEngine {
        CacheEngine::open(StorageConfig {
            root: root.to_path_buf(),
            memory_threshold: 64,
        })
        .unwrap()
    }

    fn key() -> CacheKey {
        CacheKey::parse("http://mirror.example/dists/stable/Release").unwrap()
    }

    #[tokio::test]
    async fn has_reports_existence_and_permit_drop_rolls_back() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());

        let first = engine.has(&key());
        assert!(!first.existed());
        assert!(engine.has(&key()).existed());

        drop(first);
        assert!(!engine.has(&key()).existed());
    }

    #[tokio::test]
    async fn waiters_see_committed_content() {
        let dir = tempdir().unwrap();
        let engine = Arc::new(engine(dir.path()));
        let Presence::Missing(permit) = engine.has(&key()) else {
            panic!("expected a miss");
        };
        let Presence::Present(handle) = engine.has(&key()) else {
            panic!("expected the entry to exist");
        };

        let writer = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                engine.put(permit, &b"Release file"[..], Some(12)).await
            })
        };
        handle.wait().await;
        writer.await.unwrap().unwrap();

        let upstream = Arc::new(StaticUpstream {
            body: Vec::new(),
            calls: AtomicUsize::new(0),
        });
        let content = engine
            .get(&key(), Duration::from_secs(60), false, &upstream)
            .await
            .unwrap();
        assert_eq!(content.outcome, CacheOutcome::Fresh);
        assert_eq!(content.reader.into_bytes().await.unwrap().as_ref(), b"Release file");
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn get_on_unknown_key_is_not_cached() {
        let dir = tempdir().unwrap();
        let engine = Arc::new(engine(dir.path()));
        let upstream = Arc::new(StaticUpstream {
            body: b"x".to_vec(),
            calls: AtomicUsize::new(0),
        });
        let err = engine
            .get(&key(), Duration::from_secs(1), false, &upstream)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::NotCached(_)));
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn refresh_moving_to_memory_removes_old_file() {
        let dir = tempdir().unwrap();
        let engine = Arc::new(engine(dir.path()));
        let big = Arc::new(StaticUpstream {
            body: vec![5u8; 200],
            calls: AtomicUsize::new(0),
        });
        let content = engine.serve(&key(), Duration::from_secs(60), false, &big).await.unwrap();
        assert_eq!(content.tier, Tier::File);
        let path = engine.storage().path_for(&key());
        assert!(path.is_file());
        assert_eq!(engine.stats().file_bytes, 200);

        let small = Arc::new(StaticUpstream {
            body: vec![1u8; 10],
            calls: AtomicUsize::new(0),
        });
        let content = engine.serve(&key(), Duration::from_secs(60), true, &small).await.unwrap();
        assert_eq!(content.outcome, CacheOutcome::Invalidated);
        assert_eq!(content.tier, Tier::Memory);
        assert!(!path.exists());
        assert_eq!(
            engine.stats(),
            CacheStats {
                entries: 1,
                memory_bytes: 10,
                file_bytes: 0
            }
        );
    }
}
