//! Two storage tiers behind one interface.
//!
//! Small bodies stay in memory as shared [`Bytes`], everything above the
//! configured threshold goes to one file per key under the cache root.
//!
//! ```text
//! <root>/
//!   .tmp/<pid>-<n>.tmp          in-progress writes, swept on open
//!   <b64>                       object of a short key
//!   <b64 segment>.d/<b64 tail>  object of a long key
//! ```
//!
//! File writes land in `.tmp/` first and are renamed into place once the full
//! body is on disk, so a failed write never leaves a half file under a key's
//! name, and readers holding the previous file keep their bytes.

use bytes::Bytes;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::SystemTime;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::error::StorageError;
use super::key::{CacheKey, DIR_SUFFIX};

const TMP_DIR: &str = ".tmp";

/// Renames attempted before giving up on a parent directory that keeps
/// disappearing under concurrent pruning.
const PLACE_ATTEMPTS: usize = 3;

/// Which backend holds an entry's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Memory,
    File,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Memory => "memory",
            Tier::File => "file",
        }
    }
}

/// Where a committed object lives.
#[derive(Debug, Clone)]
pub enum TierLocator {
    Memory(Bytes),
    File(PathBuf),
}

impl TierLocator {
    pub fn tier(&self) -> Tier {
        match self {
            TierLocator::Memory(_) => Tier::Memory,
            TierLocator::File(_) => Tier::File,
        }
    }
}

/// Settings for the storage tiers.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory of the file tier.
    pub root: PathBuf,
    /// Bodies larger than this many bytes always go to the file tier.
    pub memory_threshold: u64,
}

/// Result of a successful [`StorageTier::write`].
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub locator: TierLocator,
    pub size: u64,
}

/// A file found under the cache root at startup.
#[derive(Debug)]
pub struct PersistedObject {
    pub key: CacheKey,
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

pub struct StorageTier {
    root: PathBuf,
    tmp_dir: PathBuf,
    memory_threshold: u64,
    next_tmp: AtomicU64,
}

impl StorageTier {
    /// Creates the directory layout and sweeps temp files of interrupted writes.
    pub fn open(config: &StorageConfig) -> io::Result<Self> {
        let tmp_dir = config.root.join(TMP_DIR);
        std::fs::create_dir_all(&tmp_dir)?;

        let mut cleaned = 0u64;
        for entry in std::fs::read_dir(&tmp_dir)?.flatten() {
            let path = entry.path();
            match std::fs::remove_file(&path) {
                Ok(()) => cleaned += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove orphaned temp file"),
            }
        }
        if cleaned > 0 {
            info!(dir = %tmp_dir.display(), cleaned, "Removed orphaned temp files");
        }

        Ok(Self {
            root: config.root.clone(),
            tmp_dir,
            memory_threshold: config.memory_threshold,
            next_tmp: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn memory_threshold(&self) -> u64 {
        self.memory_threshold
    }

    /// Path a key is committed to in the file tier.
    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.relative_path())
    }

    /// Lists every committed object under the root.
    pub fn scan(&self) -> Vec<PersistedObject> {
        let mut found = Vec::new();
        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| e.file_name() != TMP_DIR);

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable cache path");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let Some(key) = path
                .strip_prefix(&self.root)
                .ok()
                .and_then(CacheKey::from_relative_path)
            else {
                warn!(path = %path.display(), "Ignoring file that does not name a cache key");
                continue;
            };
            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring cache file without metadata");
                    continue;
                }
            };
            found.push(PersistedObject {
                key,
                path: path.to_path_buf(),
                size: metadata.len(),
                modified: metadata.modified().unwrap_or_else(|_| SystemTime::now()),
            });
        }
        found
    }

    /// Consumes `reader` completely and commits it to one of the tiers.
    ///
    /// A declared length above the threshold goes straight to disk. Otherwise
    /// the body is buffered until it either ends (memory tier) or outgrows
    /// the threshold (spilled to the file tier).
    pub async fn write<R>(
        &self,
        key: &CacheKey,
        mut reader: R,
        expected_size: Option<u64>,
    ) -> Result<StoredObject, StorageError>
    where
        R: AsyncRead + Unpin,
    {
        let mut prefix = Vec::new();
        let straight_to_file = matches!(expected_size, Some(n) if n > self.memory_threshold);

        if !straight_to_file {
            let capacity = expected_size.unwrap_or(0).min(self.memory_threshold);
            prefix.reserve(usize::try_from(capacity).unwrap_or(0));
            (&mut reader)
                .take(self.memory_threshold + 1)
                .read_to_end(&mut prefix)
                .await
                .map_err(StorageError::Stream)?;

            let received = prefix.len() as u64;
            if received <= self.memory_threshold {
                check_length(expected_size, received)?;
                debug!(key = %key, size = received, "Stored in memory tier");
                return Ok(StoredObject {
                    locator: TierLocator::Memory(Bytes::from(prefix)),
                    size: received,
                });
            }
        }

        let path = self.path_for(key);
        let size = self.write_file(&path, &prefix, reader, expected_size).await?;
        debug!(key = %key, size, path = %path.display(), "Stored in file tier");
        Ok(StoredObject {
            locator: TierLocator::File(path),
            size,
        })
    }

    async fn write_file<R>(
        &self,
        path: &Path,
        prefix: &[u8],
        mut reader: R,
        expected_size: Option<u64>,
    ) -> Result<u64, StorageError>
    where
        R: AsyncRead + Unpin,
    {
        let n = self.next_tmp.fetch_add(1, Ordering::Relaxed);
        let tmp_path = self
            .tmp_dir
            .join(format!("{}-{}.tmp", std::process::id(), n));

        let result: Result<u64, StorageError> = async {
            let write_err = |source| StorageError::Write {
                path: tmp_path.clone(),
                source,
            };
            let mut file = tokio::fs::File::create(&tmp_path).await.map_err(write_err)?;
            file.write_all(prefix).await.map_err(write_err)?;
            let copied = tokio::io::copy(&mut reader, &mut file)
                .await
                .map_err(StorageError::Stream)?;
            let received = prefix.len() as u64 + copied;
            check_length(expected_size, received)?;
            file.flush().await.map_err(write_err)?;
            file.sync_data().await.map_err(write_err)?;
            drop(file);

            place(&tmp_path, path).await?;
            Ok(received)
        }
        .await;

        if result.is_err() {
            if let Err(e) = tokio::fs::remove_file(&tmp_path).await {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %tmp_path.display(), error = %e, "Failed to remove temp file");
                }
            }
        }
        result
    }

    /// Reopens a committed object for sequential reading.
    ///
    /// Any number of readers may hold the same locator at once.
    pub async fn read(
        &self,
        locator: &TierLocator,
        expected_size: u64,
    ) -> Result<ContentReader, StorageError> {
        match locator {
            TierLocator::Memory(bytes) => Ok(ContentReader::memory(bytes.clone())),
            TierLocator::File(path) => {
                let file = tokio::fs::File::open(path).await.map_err(|source| {
                    if source.kind() == io::ErrorKind::NotFound {
                        StorageError::Missing(path.clone())
                    } else {
                        StorageError::Read {
                            path: path.clone(),
                            source,
                        }
                    }
                })?;
                let actual = file
                    .metadata()
                    .await
                    .map_err(|source| StorageError::Read {
                        path: path.clone(),
                        source,
                    })?
                    .len();
                if actual != expected_size {
                    return Err(StorageError::Truncated {
                        path: path.clone(),
                        expected: expected_size,
                        actual,
                    });
                }
                Ok(ContentReader::file(file, actual))
            }
        }
    }

    /// Best-effort removal of a superseded object. Never fails.
    pub async fn remove(&self, locator: &TierLocator) {
        let TierLocator::File(path) = locator else {
            return;
        };
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!(path = %path.display(), "Removed cache file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to remove cache file");
                return;
            }
        }
        // drop now-empty segment directories of long keys
        let mut dir = path.parent();
        while let Some(d) = dir {
            let is_segment = d
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(DIR_SUFFIX));
            if d == self.root.as_path() || !is_segment || tokio::fs::remove_dir(d).await.is_err() {
                break;
            }
            dir = d.parent();
        }
    }
}

/// Renames a finished temp file onto its final path, creating the parent
/// directories. [`StorageTier::remove`] may prune an empty parent at any time,
/// so a rename that finds it gone recreates it and tries again.
async fn place(tmp_path: &Path, path: &Path) -> Result<(), StorageError> {
    let mut attempt = 1;
    loop {
        match tokio::fs::rename(tmp_path, path).await {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound && attempt < PLACE_ATTEMPTS => {
                attempt += 1;
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|source| StorageError::Write {
                            path: parent.to_path_buf(),
                            source,
                        })?;
                }
            }
            Err(source) => {
                return Err(StorageError::Write {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }
}

fn check_length(expected: Option<u64>, received: u64) -> Result<(), StorageError> {
    match expected {
        Some(declared) if declared != received => Err(StorageError::LengthMismatch { declared, received }),
        _ => Ok(()),
    }
}

enum ReaderInner {
    Memory(io::Cursor<Bytes>),
    File(tokio::fs::File),
}

/// Sequential reader over a committed object, with its byte length.
pub struct ContentReader {
    inner: ReaderInner,
    len: u64,
    tier: Tier,
}

impl ContentReader {
    fn memory(bytes: Bytes) -> Self {
        let len = bytes.len() as u64;
        Self {
            inner: ReaderInner::Memory(io::Cursor::new(bytes)),
            len,
            tier: Tier::Memory,
        }
    }

    fn file(file: tokio::fs::File, len: u64) -> Self {
        Self {
            inner: ReaderInner::File(file),
            len,
            tier: Tier::File,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Reads the whole object into memory. Meant for tests and small bodies.
    pub async fn into_bytes(mut self) -> io::Result<Bytes> {
        let mut buf = Vec::with_capacity(usize::try_from(self.len).unwrap_or(0));
        self.read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

impl AsyncRead for ContentReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.inner {
            ReaderInner::Memory(cursor) => Pin::new(cursor).poll_read(cx, buf),
            ReaderInner::File(file) => Pin::new(file).poll_read(cx, buf),
        }
    }
}

impl std::fmt::Debug for ContentReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentReader")
            .field("tier", &self.tier)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn tier(root: &Path, threshold: u64) -> StorageTier {
        StorageTier::open(&StorageConfig {
            root: root.to_path_buf(),
            memory_threshold: threshold,
        })
        .unwrap()
    }

    fn key(path: &str) -> CacheKey {
        CacheKey::parse(&format!("http://mirror.example/{path}")).unwrap()
    }

    /// A reader that yields some bytes and then fails.
    struct Broken(usize);

    impl AsyncRead for Broken {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.0 == 0 {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")));
            }
            let n = self.0.min(buf.remaining()).min(512);
            buf.put_slice(&vec![7u8; n]);
            self.0 -= n;
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn small_body_goes_to_memory() {
        let dir = tempdir().unwrap();
        let storage = tier(dir.path(), 1024);
        let stored = storage
            .write(&key("small"), &b"hello"[..], Some(5))
            .await
            .unwrap();
        assert_eq!(stored.locator.tier(), Tier::Memory);
        assert_eq!(stored.size, 5);
        let body = storage.read(&stored.locator, 5).await.unwrap();
        assert_eq!(body.into_bytes().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn unknown_length_spills_to_file_past_threshold() {
        let dir = tempdir().unwrap();
        let storage = tier(dir.path(), 16);
        let data = vec![1u8; 100];
        let k = key("spill");
        let stored = storage.write(&k, &data[..], None).await.unwrap();
        assert_eq!(stored.locator.tier(), Tier::File);
        assert_eq!(stored.size, 100);
        assert!(storage.path_for(&k).is_file());
        let body = storage.read(&stored.locator, 100).await.unwrap();
        assert_eq!(body.into_bytes().await.unwrap().as_ref(), &data[..]);
    }

    #[tokio::test]
    async fn length_mismatch_leaves_no_file() {
        let dir = tempdir().unwrap();
        let storage = tier(dir.path(), 16);
        let k = key("short");
        let err = storage.write(&k, &[0u8; 40][..], Some(64)).await.unwrap_err();
        assert!(matches!(err, StorageError::LengthMismatch { declared: 64, received: 40 }));
        assert!(!storage.path_for(&k).exists());
        assert_eq!(std::fs::read_dir(dir.path().join(TMP_DIR)).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn broken_stream_leaves_no_file() {
        let dir = tempdir().unwrap();
        let storage = tier(dir.path(), 16);
        let k = key("broken");
        let err = storage.write(&k, Broken(2048), None).await.unwrap_err();
        assert!(err.is_write());
        assert!(!storage.path_for(&k).exists());
        assert!(storage.scan().is_empty());
    }

    #[tokio::test]
    async fn missing_and_truncated_files_are_reported() {
        let dir = tempdir().unwrap();
        let storage = tier(dir.path(), 0);
        let k = key("gone");
        let stored = storage.write(&k, &[3u8; 10][..], Some(10)).await.unwrap();

        std::fs::write(storage.path_for(&k), b"abc").unwrap();
        assert!(matches!(
            storage.read(&stored.locator, 10).await,
            Err(StorageError::Truncated { expected: 10, actual: 3, .. })
        ));

        storage.remove(&stored.locator).await;
        assert!(matches!(
            storage.read(&stored.locator, 10).await,
            Err(StorageError::Missing(_))
        ));
        // removing twice is fine
        storage.remove(&stored.locator).await;
    }

    #[tokio::test]
    async fn extended_keys_share_the_file_tier() {
        let dir = tempdir().unwrap();
        let storage = tier(dir.path(), 0);
        let deb = key(&format!("pool/{}.deb", "p".repeat(65)));
        assert_eq!(deb.as_str().len(), 96);
        let asc = CacheKey::parse(&format!("{deb}.asc")).unwrap();

        let a = storage.write(&deb, &[1u8; 300][..], Some(300)).await.unwrap();
        let b = storage.write(&asc, &[2u8; 40][..], Some(40)).await.unwrap();
        assert_eq!(a.locator.tier(), Tier::File);
        assert_eq!(b.locator.tier(), Tier::File);
        assert!(storage.path_for(&deb).is_file());
        assert!(storage.path_for(&asc).is_file());

        let mut keys: Vec<_> = storage.scan().into_iter().map(|o| o.key).collect();
        keys.sort();
        assert_eq!(keys, vec![deb.clone(), asc.clone()]);

        // pruning the long key's directory leaves the short key alone
        storage.remove(&b.locator).await;
        assert!(storage.path_for(&deb).is_file());
        let body = storage.read(&a.locator, 300).await.unwrap();
        assert_eq!(body.into_bytes().await.unwrap().as_ref(), &[1u8; 300][..]);
    }

    #[tokio::test]
    async fn place_recreates_a_pruned_parent() {
        let dir = tempdir().unwrap();
        let tmp = dir.path().join("object.tmp");
        std::fs::write(&tmp, b"payload").unwrap();
        let target = dir.path().join("seg.d").join("tail");

        place(&tmp, &target).await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"payload");
        assert!(!tmp.exists());

        // a temp file that is gone is still an error
        let err = place(&tmp, &target).await.unwrap_err();
        assert!(matches!(err, StorageError::Write { .. }));
    }

    #[tokio::test]
    async fn scan_finds_committed_files_and_skips_temp() {
        let dir = tempdir().unwrap();
        let storage = tier(dir.path(), 0);
        let k = key("persisted.tgz");
        storage.write(&k, &[9u8; 32][..], Some(32)).await.unwrap();
        std::fs::write(dir.path().join(TMP_DIR).join("1-1.tmp"), b"partial").unwrap();
        std::fs::write(dir.path().join("README"), b"not a key").unwrap();

        let found = storage.scan();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].key, k);
        assert_eq!(found[0].size, 32);

        // reopening sweeps the temp dir
        let _reopened = tier(dir.path(), 0);
        assert_eq!(std::fs::read_dir(dir.path().join(TMP_DIR)).unwrap().count(), 0);
    }
}
