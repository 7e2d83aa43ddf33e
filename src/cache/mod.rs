//! Content-addressable download cache shared across concurrent invocations.
//!
//! Goals:
//! - Key entries by a stable hash of the remote locator (URL).
//! - Serialize writers per locator with an exclusive advisory file lock so
//!   independent invocations (e.g. CI matrix jobs) can race on one cache.
//! - Publish payloads atomically (rename-into-place) so a reader never
//!   observes a partially written entry.
//! - Record the fetch timestamp and declared TTL per entry so staleness can
//!   be reconstructed without re-fetching.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Per-entry fetch metadata, stored next to the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryMetadata {
    url: String,
    fetched_at_unix: u64,
    ttl_secs: Option<u64>,
}

/// The outcome of [`DownloadCache::acquire`].
pub enum CacheResult {
    /// An existing, non-stale payload.
    Hit(PathBuf),
    /// An exclusive write grant for this locator; see [`Work`].
    Miss(Work),
}

/// An on-disk cache of downloaded artifacts, safe to share between
/// concurrent processes.
#[derive(Debug)]
pub struct DownloadCache {
    root: PathBuf,
}

impl DownloadCache {
    /// Open (and create if needed) a cache rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<DownloadCache> {
        let cache = DownloadCache { root: root.into() };
        cache.ensure_layout()?;
        Ok(cache)
    }

    /// Open the user-wide cache under the platform cache directory.
    pub fn open_default() -> Result<DownloadCache> {
        let base = dirs::cache_dir()
            .context("Could not determine a cache directory for this platform")?;
        DownloadCache::new(base.join("scie-builder").join("downloads"))
    }

    fn ensure_layout(&self) -> Result<()> {
        for dir in [self.entries_dir(), self.locks_dir(), self.tmp_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create cache directory {}", dir.display()))?;
        }
        Ok(())
    }

    fn entries_dir(&self) -> PathBuf {
        self.root.join("entries")
    }

    fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    fn entry_dir(&self, url: &str) -> PathBuf {
        let key = locator_key(url);
        self.entries_dir().join(&key[..2]).join(key)
    }

    fn payload_path(&self, url: &str) -> PathBuf {
        self.entry_dir(url).join(payload_name(url))
    }

    fn metadata_path(&self, url: &str) -> PathBuf {
        self.entry_dir(url).join("metadata.json")
    }

    fn lock_path(&self, url: &str) -> PathBuf {
        self.locks_dir().join(format!("{}.lock", locator_key(url)))
    }

    /// Look up `url`, either returning the cached payload or granting this
    /// caller the exclusive right to populate the entry.
    ///
    /// A `ttl` of `None` means a published entry never goes stale. When the
    /// entry is missing or stale the caller blocks until any in-flight
    /// writer for the same locator publishes or aborts, then re-checks
    /// rather than assuming a miss.
    pub fn acquire(&self, url: &str, ttl: Option<Duration>) -> Result<CacheResult> {
        // Fast path: a fresh payload needs no lock.
        if let Some(path) = self.fresh_payload(url, ttl)? {
            return Ok(CacheResult::Hit(path));
        }

        let lock = self.lock(url)?;

        // A concurrent writer may have published while we waited.
        if let Some(path) = self.fresh_payload(url, ttl)? {
            return Ok(CacheResult::Hit(path));
        }

        let entry_dir = self.entry_dir(url);
        fs::create_dir_all(&entry_dir)
            .with_context(|| format!("Failed to create cache entry {}", entry_dir.display()))?;
        Ok(CacheResult::Miss(Work {
            _lock: lock,
            work_path: self.tmp_dir().join(tmp_name(&locator_key(url)[..16])),
            payload_path: self.payload_path(url),
            metadata_path: self.metadata_path(url),
            tmp_dir: self.tmp_dir(),
            url: url.to_string(),
            ttl,
            committed: false,
        }))
    }

    fn fresh_payload(&self, url: &str, ttl: Option<Duration>) -> Result<Option<PathBuf>> {
        let payload = self.payload_path(url);
        if !payload.exists() {
            return Ok(None);
        }
        let metadata_path = self.metadata_path(url);
        let Ok(bytes) = fs::read(&metadata_path) else {
            return Ok(None);
        };
        // Unreadable or corrupt metadata demotes the entry to a miss.
        let Ok(metadata) = serde_json::from_slice::<EntryMetadata>(&bytes) else {
            return Ok(None);
        };
        if let Some(ttl) = ttl {
            let deadline = metadata.fetched_at_unix.saturating_add(ttl.as_secs());
            if now_unix() > deadline {
                return Ok(None);
            }
        }
        Ok(Some(payload))
    }

    fn lock(&self, url: &str) -> Result<CacheLock> {
        let lock_path = self.lock_path(url);
        // Lock files are never unlinked: removing a path that another
        // process still holds a lock on lets a third process create a
        // fresh inode at the same path and lock it independently.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("Failed to create lock file {}", lock_path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("Failed to lock {}", lock_path.display()))?;
        Ok(CacheLock { file })
    }
}

/// An exclusive, locator-scoped write grant.
///
/// The caller streams the payload into [`Work::path`] (or a file opened via
/// [`Work::open`]) and then calls [`Work::commit`] to atomically publish it.
/// Dropping uncommitted work discards the partial write; the lock is
/// released on every exit path.
pub struct Work {
    _lock: CacheLock,
    work_path: PathBuf,
    payload_path: PathBuf,
    metadata_path: PathBuf,
    tmp_dir: PathBuf,
    url: String,
    ttl: Option<Duration>,
    committed: bool,
}

impl Work {
    /// The temporary path to write the payload into.
    pub fn path(&self) -> &Path {
        &self.work_path
    }

    /// Create the write target.
    pub fn open(&self) -> Result<File> {
        File::create(&self.work_path)
            .with_context(|| format!("Failed to create {}", self.work_path.display()))
    }

    /// Atomically publish the payload and record the fetch timestamp.
    pub fn commit(mut self) -> Result<PathBuf> {
        let metadata = EntryMetadata {
            url: self.url.clone(),
            fetched_at_unix: now_unix(),
            ttl_secs: self.ttl.map(|ttl| ttl.as_secs()),
        };
        let metadata_tmp = self.tmp_dir.join(tmp_name("metadata"));
        fs::write(
            &metadata_tmp,
            serde_json::to_vec_pretty(&metadata).context("Failed to encode cache metadata")?,
        )
        .with_context(|| format!("Failed to write {}", metadata_tmp.display()))?;

        atomic_rename(&self.work_path, &self.payload_path)?;
        if let Err(err) = atomic_rename(&metadata_tmp, &self.metadata_path) {
            // The payload landed but the timestamp did not: retract the
            // payload so the entry stays all-or-nothing.
            let _ = fs::remove_file(&self.payload_path);
            return Err(err);
        }
        self.committed = true;
        Ok(self.payload_path.clone())
    }
}

impl Drop for Work {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.work_path);
        }
    }
}

struct CacheLock {
    file: File,
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn locator_key(url: &str) -> String {
    format!("{:x}", Sha256::digest(url.as_bytes()))
}

/// Name the cached payload after the locator's final path segment so file
/// extensions survive into the cache.
fn payload_name(url: &str) -> String {
    let tail = url
        .split('?')
        .next()
        .unwrap_or(url)
        .rsplit('/')
        .next()
        .unwrap_or("");
    let name: String = tail
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '+') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() || name.starts_with('.') {
        "payload".to_string()
    } else {
        name
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn tmp_name(prefix: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{prefix}-{}-{nanos}", std::process::id())
}

fn atomic_rename(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::rename(from, to)
        .with_context(|| format!("Failed to rename {} to {}", from.display(), to.display()))
}
