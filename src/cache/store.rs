//! Single-tier cache store
//!
//! Entry table, LRU index, and size counter live under one exclusive lock.
//! Admission stages under the cache root and renames into place; eviction
//! unlinks under the lock and defers directory removal until the last
//! outstanding handle drops.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;

use crate::cache::eviction::{self, CleanupRecommendation, EvictionRequest};
use crate::cache::index::{CacheIndexFile, IndexItem, IndexStatistics, INDEX_FILE_NAME};
use crate::cache::lru::LruIndex;
use crate::cache::CacheStatistics;
use crate::core::config::CacheConfig;
use crate::core::package::safe_name;
use crate::core::services::Clock;
use crate::core::{MortarError, MortarResult};

const PACKAGES_DIR: &str = "packages";
const STAGING_PREFIX: &str = "staging-";
const STAGING_MAX_AGE_HOURS: i64 = 1;

/// Owner of an entry's on-disk directory. When doomed, the directory is
/// removed as the last reference drops.
#[derive(Debug)]
pub(crate) struct EntryGuard {
    path: PathBuf,
    doomed: AtomicBool,
}

impl EntryGuard {
    fn new(path: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            path,
            doomed: AtomicBool::new(false),
        })
    }

    pub(crate) fn doom(&self) {
        self.doomed.store(true, Ordering::SeqCst);
    }
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        if self.doomed.load(Ordering::SeqCst) && self.path.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove evicted entry");
            }
        }
    }
}

/// Stable reference to a cached directory. The directory outlives the
/// handle even if the entry is evicted while the handle is held.
#[derive(Debug, Clone)]
pub struct EntryHandle {
    path: PathBuf,
    _guard: Arc<EntryGuard>,
}

impl EntryHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsRef<Path> for EntryHandle {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

impl std::ops::Deref for EntryHandle {
    type Target = Path;

    fn deref(&self) -> &Path {
        &self.path
    }
}

/// One cached package version.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub package: String,
    pub version: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub install_time: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub access_count: u64,
    pub pinned: bool,
    pub(crate) guard: Arc<EntryGuard>,
}

impl CacheEntry {
    fn handle(&self) -> EntryHandle {
        EntryHandle {
            path: self.path.clone(),
            _guard: self.guard.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(
        key: &str,
        path: PathBuf,
        size_bytes: u64,
        last_access: DateTime<Utc>,
        access_count: u64,
        pinned: bool,
    ) -> Self {
        let (package, version) = key.split_once(':').unwrap_or((key, "0"));
        Self {
            key: key.to_string(),
            package: package.to_string(),
            version: version.to_string(),
            guard: EntryGuard::new(path.clone()),
            path,
            size_bytes,
            install_time: last_access,
            last_access,
            access_count,
            pinned,
        }
    }
}

struct StoreInner {
    entries: HashMap<String, CacheEntry>,
    lru: LruIndex,
    total_size: u64,
    hit_count: u64,
    miss_count: u64,
    last_cleanup: Option<DateTime<Utc>>,
}

/// A single cache tier rooted at one directory.
pub struct TierStore {
    root: PathBuf,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<StoreInner>,
}

impl TierStore {
    /// Open a tier: create directories, sweep stale staging leftovers, load
    /// the index, and reconcile it against the filesystem.
    pub fn open(root: &Path, config: CacheConfig, clock: Arc<dyn Clock>) -> MortarResult<Self> {
        std::fs::create_dir_all(root)?;
        std::fs::create_dir_all(root.join(PACKAGES_DIR))?;

        let store = Self {
            root: root.to_path_buf(),
            config,
            clock,
            inner: Mutex::new(StoreInner {
                entries: HashMap::new(),
                lru: LruIndex::new(),
                total_size: 0,
                hit_count: 0,
                miss_count: 0,
                last_cleanup: None,
            }),
        };

        store.sweep_staging()?;
        store.load_index()?;
        Ok(store)
    }

    fn key(package: &str, version: &str) -> String {
        format!("{}:{}", package, version)
    }

    fn entry_base_path(&self, package: &str, version: &str) -> PathBuf {
        self.root
            .join(PACKAGES_DIR)
            .join(safe_name(package))
            .join(version)
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE_NAME)
    }

    /// Look up a cached version. Hits update recency and frequency under
    /// the lock; the returned handle stays valid across later evictions.
    pub fn get(&self, package: &str, version: &str) -> Option<EntryHandle> {
        let key = Self::key(package, version);
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(&key) {
            Some(entry) => {
                entry.last_access = now;
                entry.access_count += 1;
                let handle = entry.handle();
                inner.lru.touch(&key);
                inner.hit_count += 1;
                Some(handle)
            }
            None => {
                inner.miss_count += 1;
                None
            }
        }
    }

    /// Presence check without touching counters or recency.
    pub fn contains(&self, package: &str, version: &str) -> bool {
        let key = Self::key(package, version);
        self.inner.lock().entries.contains_key(&key)
    }

    /// Admit a populated directory as `(package, version)`.
    ///
    /// The directory is moved into a staging path under the cache root and
    /// renamed into its final location once the entry fits the budget. An
    /// entry larger than the whole budget is rejected with `DiskFull` and
    /// `populated_dir` is left where it was.
    pub fn admit(
        &self,
        package: &str,
        version: &str,
        populated_dir: &Path,
    ) -> MortarResult<EntryHandle> {
        let key = Self::key(package, version);
        let size = dir_size(populated_dir);

        if size > self.config.max_size {
            return Err(MortarError::DiskFull {
                key,
                needed: size,
                limit: self.config.max_size,
            });
        }

        let staging = self
            .root
            .join(format!("{}{}", STAGING_PREFIX, uuid::Uuid::new_v4()));
        move_dir(populated_dir, &staging)?;

        let now = self.clock.now();
        let mut doomed: Vec<CacheEntry> = Vec::new();
        let result = (|| {
            let mut inner = self.inner.lock();

            // Replacing an existing version: unlink the old entry first so
            // budget math sees the cache without it.
            if let Some(old) = inner.entries.remove(&key) {
                inner.lru.remove(&key);
                inner.total_size -= old.size_bytes;
                old.guard.doom();
                doomed.push(old);
            }

            if inner.total_size + size > self.config.max_size
                || inner.entries.len() >= self.config.max_items
            {
                let victims = self.evict_locked(
                    &mut inner,
                    self.config.max_size.saturating_sub(size),
                    self.config.max_items.saturating_sub(1),
                );
                doomed.extend(victims);
            }

            if inner.total_size + size > self.config.max_size {
                return Err(MortarError::DiskFull {
                    key: key.clone(),
                    needed: size,
                    limit: self.config.max_size,
                });
            }

            let mut final_path = self.entry_base_path(package, version);
            if final_path.exists() {
                // Previous directory lives on under an outstanding handle.
                final_path = final_path.with_file_name(format!(
                    "{}-{}",
                    version,
                    &uuid::Uuid::new_v4().to_string()[..8]
                ));
            }
            if let Some(parent) = final_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::rename(&staging, &final_path)?;

            let entry = CacheEntry {
                key: key.clone(),
                package: package.to_string(),
                version: version.to_string(),
                guard: EntryGuard::new(final_path.clone()),
                path: final_path,
                size_bytes: size,
                install_time: now,
                last_access: now,
                access_count: 0,
                pinned: false,
            };
            let handle = entry.handle();
            inner.total_size += size;
            inner.lru.insert_front(&key);
            inner.entries.insert(key.clone(), entry);

            self.save_index_locked(&inner)?;
            tracing::debug!(key = %key, size, "cache admission");
            Ok(handle)
        })();

        match result {
            Ok(handle) => {
                // Physical removal of displaced entries happens after the
                // lock is released.
                drop(doomed);
                Ok(handle)
            }
            Err(e) => {
                drop(doomed);
                // Hand the payload back to the caller.
                if staging.exists() {
                    let _ = move_dir(&staging, populated_dir);
                }
                Err(e)
            }
        }
    }

    /// Toggle eviction exemption. Returns false for unknown entries.
    pub fn pin(&self, package: &str, version: &str, pinned: bool) -> bool {
        let key = Self::key(package, version);
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(&key) else {
            return false;
        };
        entry.pinned = pinned;
        let _ = self.save_index_locked(&inner);
        true
    }

    /// Remove an entry. Pinned entries survive unless `force` is set;
    /// missing entries are a silent no-op. Directory removal is deferred
    /// past any outstanding handles.
    pub fn remove(&self, package: &str, version: &str, force: bool) -> bool {
        let key = Self::key(package, version);
        let doomed;
        {
            let mut inner = self.inner.lock();
            match inner.entries.get(&key) {
                None => return false,
                Some(entry) if entry.pinned && !force => return false,
                Some(_) => {}
            }
            let entry = inner.entries.remove(&key).expect("checked above");
            inner.lru.remove(&key);
            inner.total_size -= entry.size_bytes;
            entry.guard.doom();
            doomed = entry;
            let _ = self.save_index_locked(&inner);
        }
        drop(doomed);
        true
    }

    /// Re-walk an entry's directory and refresh its size accounting.
    pub fn recompute_size(&self, package: &str, version: &str) -> MortarResult<u64> {
        let key = Self::key(package, version);
        let path = {
            let inner = self.inner.lock();
            inner
                .entries
                .get(&key)
                .map(|e| e.path.clone())
                .ok_or_else(|| MortarError::cache(format!("no such entry: {}", key)))?
        };
        let size = dir_size(&path);
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(&key) {
            let old = entry.size_bytes;
            entry.size_bytes = size;
            inner.total_size = inner.total_size - old + size;
            self.save_index_locked(&inner)?;
        }
        Ok(size)
    }

    /// Evict down to the configured soft thresholds (80% of max size, 90%
    /// of max items by default). Returns the number of entries removed.
    pub fn cleanup(&self) -> usize {
        let target_size = (self.config.max_size as f64 * self.config.size_soft_threshold) as u64;
        let target_items =
            (self.config.max_items as f64 * self.config.items_soft_threshold) as usize;

        let doomed;
        {
            let mut inner = self.inner.lock();
            doomed = self.evict_locked(&mut inner, target_size, target_items);
            inner.last_cleanup = Some(self.clock.now());
            let _ = self.save_index_locked(&inner);
        }
        let count = doomed.len();
        drop(doomed);
        count
    }

    /// Health-driven cleanup plan for the background cleaner.
    pub fn recommendation(&self) -> CleanupRecommendation {
        let inner = self.inner.lock();
        let stats = self.stats_locked(&inner);
        eviction::recommend(
            &stats,
            self.config.max_size,
            self.config.min_keep_items,
            &inner.entries,
        )
    }

    /// Execute a recommendation produced by [`TierStore::recommendation`].
    /// Returns the number of entries removed.
    pub fn apply_recommendation(&self, rec: &CleanupRecommendation) -> usize {
        let mut doomed = Vec::new();
        {
            let mut inner = self.inner.lock();
            for key in &rec.victims {
                if let Some(entry) = inner.entries.get(key) {
                    if entry.pinned {
                        continue;
                    }
                    let entry = inner.entries.remove(key).expect("present");
                    inner.lru.remove(key);
                    inner.total_size -= entry.size_bytes;
                    entry.guard.doom();
                    doomed.push(entry);
                }
            }
            inner.last_cleanup = Some(self.clock.now());
            let _ = self.save_index_locked(&inner);
        }
        let count = doomed.len();
        if count > 0 {
            tracing::info!(level = ?rec.level, evicted = count, "background cleanup pass");
        }
        drop(doomed);
        count
    }

    /// Snapshot of counts, sizes, and hit/miss counters.
    pub fn stats(&self) -> CacheStatistics {
        let inner = self.inner.lock();
        self.stats_locked(&inner)
    }

    /// Persist the index now.
    pub fn save(&self) -> MortarResult<()> {
        let inner = self.inner.lock();
        self.save_index_locked(&inner)
    }

    /// All cached package names.
    pub fn packages(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut names: Vec<String> = inner
            .entries
            .values()
            .map(|e| e.package.clone())
            .collect::<std::collections::HashSet<_>>()
            .into_iter()
            .collect();
        names.sort();
        names
    }

    /// Cached versions of one package.
    pub fn versions_of(&self, package: &str) -> Vec<String> {
        let inner = self.inner.lock();
        let mut versions: Vec<String> = inner
            .entries
            .values()
            .filter(|e| e.package == package)
            .map(|e| e.version.clone())
            .collect();
        versions.sort();
        versions
    }

    /// Up to `count` entries ordered by oldest access first.
    pub fn oldest_entries(&self, count: usize) -> Vec<CacheEntry> {
        let inner = self.inner.lock();
        let mut entries: Vec<CacheEntry> = inner.entries.values().cloned().collect();
        entries.sort_by_key(|e| e.last_access);
        entries.truncate(count);
        entries
    }

    /// Up to `count` entries ordered by fewest accesses first.
    pub fn least_used_entries(&self, count: usize) -> Vec<CacheEntry> {
        let inner = self.inner.lock();
        let mut entries: Vec<CacheEntry> = inner.entries.values().cloned().collect();
        entries.sort_by_key(|e| e.access_count);
        entries.truncate(count);
        entries
    }

    /// Verify that every entry's directory exists and its recorded size
    /// matches a fresh recomputation.
    pub fn validate_integrity(&self) -> MortarResult<()> {
        let snapshot: Vec<(String, PathBuf, u64)> = {
            let inner = self.inner.lock();
            inner
                .entries
                .values()
                .map(|e| (e.key.clone(), e.path.clone(), e.size_bytes))
                .collect()
        };
        for (key, path, recorded) in snapshot {
            if !path.exists() {
                return Err(MortarError::CorruptEntry {
                    key,
                    reason: format!("missing path {}", path.display()),
                });
            }
            let actual = dir_size(&path);
            if actual != recorded {
                return Err(MortarError::CorruptEntry {
                    key,
                    reason: format!("size mismatch: recorded {} actual {}", recorded, actual),
                });
            }
        }
        Ok(())
    }

    fn stats_locked(&self, inner: &StoreInner) -> CacheStatistics {
        let lookups = inner.hit_count + inner.miss_count;
        CacheStatistics {
            total_items: inner.entries.len(),
            total_size_bytes: inner.total_size,
            hit_count: inner.hit_count,
            miss_count: inner.miss_count,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                inner.hit_count as f64 / lookups as f64
            },
            last_cleanup: inner.last_cleanup,
        }
    }

    /// Unlink victims under the lock; physical removal is the caller's
    /// responsibility after the lock is released.
    fn evict_locked(
        &self,
        inner: &mut StoreInner,
        target_size: u64,
        target_items: usize,
    ) -> Vec<CacheEntry> {
        let positions = inner.lru.positions_from_tail();
        let request = EvictionRequest {
            policy: self.config.eviction_policy,
            now: self.clock.now(),
            max_age: ChronoDuration::hours(self.config.max_age_hours as i64),
            target_size,
            target_items,
            min_keep_items: self.config.min_keep_items,
            lru_positions: &positions,
        };
        let victims = eviction::select_victims(&inner.entries, inner.total_size, &request);

        let mut removed = Vec::with_capacity(victims.len());
        for key in victims {
            if let Some(entry) = inner.entries.remove(&key) {
                inner.lru.remove(&key);
                inner.total_size -= entry.size_bytes;
                entry.guard.doom();
                tracing::debug!(key = %key, size = entry.size_bytes, "evicting entry");
                removed.push(entry);
            }
        }
        removed
    }

    fn save_index_locked(&self, inner: &StoreInner) -> MortarResult<()> {
        let stats = self.stats_locked(inner);
        let mut items = Vec::with_capacity(inner.entries.len());
        // Least-recently-used first, so reload can insert_front in file
        // order and reproduce the list even across equal timestamps.
        for key in inner.lru.keys_lru_first().iter() {
            if let Some(e) = inner.entries.get(key) {
                items.push(IndexItem {
                    key: e.key.clone(),
                    package_name: e.package.clone(),
                    version: e.version.clone(),
                    cache_path: e.path.clone(),
                    size_bytes: e.size_bytes,
                    last_access: e.last_access.timestamp(),
                    install_time: e.install_time.timestamp(),
                    access_count: e.access_count,
                    is_pinned: e.pinned,
                });
            }
        }
        let file = CacheIndexFile {
            statistics: IndexStatistics {
                total_items: stats.total_items,
                total_size_bytes: stats.total_size_bytes,
                hit_count: stats.hit_count,
                miss_count: stats.miss_count,
                hit_rate: stats.hit_rate,
                last_cleanup: stats.last_cleanup.map(|t| t.timestamp()).unwrap_or(0),
            },
            items,
        };
        file.save(&self.index_path())
    }

    fn load_index(&self) -> MortarResult<()> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(());
        }
        let file = match CacheIndexFile::load(&path) {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!(error = %e, "cache index unreadable, starting empty");
                return Ok(());
            }
        };

        let mut inner = self.inner.lock();
        inner.hit_count = file.statistics.hit_count;
        inner.miss_count = file.statistics.miss_count;
        inner.last_cleanup = match file.statistics.last_cleanup {
            0 => None,
            ts => DateTime::from_timestamp(ts, 0),
        };

        let mut items = file.items;
        // Oldest access first, so insert_front leaves the most recent at
        // the head.
        items.sort_by_key(|i| i.last_access);
        let mut referenced = std::collections::HashSet::new();
        for item in items {
            if !item.cache_path.exists() {
                tracing::warn!(key = %item.key, "dropping index entry with missing path");
                continue;
            }
            referenced.insert(item.cache_path.clone());
            let entry = CacheEntry {
                key: item.key.clone(),
                package: item.package_name,
                version: item.version,
                guard: EntryGuard::new(item.cache_path.clone()),
                path: item.cache_path,
                size_bytes: item.size_bytes,
                install_time: DateTime::from_timestamp(item.install_time, 0)
                    .unwrap_or_else(|| self.clock.now()),
                last_access: DateTime::from_timestamp(item.last_access, 0)
                    .unwrap_or_else(|| self.clock.now()),
                access_count: item.access_count,
                pinned: item.is_pinned,
            };
            inner.total_size += entry.size_bytes;
            inner.lru.insert_front(&item.key);
            inner.entries.insert(item.key, entry);
        }
        drop(inner);

        // Directories the index does not know about are an operator
        // decision; report them, never delete them.
        for package_dir in read_dirs(&self.root.join(PACKAGES_DIR)) {
            for version_dir in read_dirs(&package_dir) {
                if !referenced.contains(&version_dir) {
                    tracing::warn!(path = %version_dir.display(), "unreferenced cache directory retained");
                }
            }
        }
        Ok(())
    }

    /// Remove `staging-*` leftovers older than one hour; a crash between
    /// staging and rename orphans them.
    fn sweep_staging(&self) -> MortarResult<()> {
        let cutoff = self.clock.now() - ChronoDuration::hours(STAGING_MAX_AGE_HOURS);
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(STAGING_PREFIX) {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(DateTime::<Utc>::from);
            let stale = match modified {
                Ok(ts) => ts < cutoff,
                Err(_) => true,
            };
            if stale {
                tracing::info!(path = %entry.path().display(), "sweeping stale staging directory");
                let _ = std::fs::remove_dir_all(entry.path());
            }
        }
        Ok(())
    }
}

fn read_dirs(path: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(path)
        .map(|rd| {
            rd.filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect()
        })
        .unwrap_or_default()
}

/// Sum of file sizes under `path`.
pub(crate) fn dir_size(path: &Path) -> u64 {
    walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Move a directory, falling back to copy+delete across filesystems.
fn move_dir(from: &Path, to: &Path) -> MortarResult<()> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    std::fs::create_dir_all(to)?;
    let mut options = fs_extra::dir::CopyOptions::new();
    options.content_only = true;
    fs_extra::dir::copy(from, to, &options)
        .map_err(|e| MortarError::cache(format!("copy {} -> {}: {}", from.display(), to.display(), e)))?;
    std::fs::remove_dir_all(from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::eviction::CleanupLevel;
    use crate::core::testing::{dir_size as test_dir_size, write_tree, ManualClock};
    use tempfile::tempdir;

    fn test_config(max_size: u64, max_items: usize) -> CacheConfig {
        CacheConfig {
            max_size,
            max_items,
            min_keep_items: 0,
            eviction_policy: EvictionPolicy::Lru,
            ..CacheConfig::default()
        }
    }

    fn store_with(
        root: &Path,
        max_size: u64,
        max_items: usize,
    ) -> (TierStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let store = TierStore::open(root, test_config(max_size, max_items), clock.clone()).unwrap();
        (store, clock)
    }

    fn payload(dir: &Path, name: &str, size: usize) -> PathBuf {
        let path = dir.join(name);
        write_tree(&path, &[("data.bin", vec![0u8; size].as_slice())]);
        path
    }

    #[test]
    fn test_admit_then_get_roundtrip() {
        let tmp = tempdir().unwrap();
        let (store, _) = store_with(&tmp.path().join("cache"), 10_000, 100);

        let src = tmp.path().join("pkg");
        write_tree(&src, &[("include/fmt.h", b"x".as_slice()), ("src/fmt.cc", b"yy")]);
        let original_size = test_dir_size(&src);

        store.admit("fmt", "10.1.0", &src).unwrap();
        assert!(!src.exists(), "payload is moved, not copied");

        let handle = store.get("fmt", "10.1.0").expect("cached");
        assert!(handle.path().join("include/fmt.h").exists());
        assert_eq!(test_dir_size(handle.path()), original_size);

        let stats = store.stats();
        assert_eq!(stats.total_items, 1);
        assert_eq!(stats.total_size_bytes, original_size);
        assert_eq!(stats.hit_count, 1);
    }

    #[test]
    fn test_cache_hit_updates_counters_and_lru_head() {
        // Scenario: cached entry, one lookup.
        let tmp = tempdir().unwrap();
        let (store, _) = store_with(&tmp.path().join("cache"), 10_000, 100);

        store.admit("lib", "1.0", &payload(tmp.path(), "a", 100)).unwrap();
        store.admit("other", "1.0", &payload(tmp.path(), "b", 50)).unwrap();

        let before = store.stats();
        let handle = store.get("lib", "1.0");
        assert!(handle.is_some());

        let after = store.stats();
        assert_eq!(after.hit_count, before.hit_count + 1);
        {
            let inner = store.inner.lock();
            assert_eq!(inner.lru.front(), Some("lib:1.0"));
            assert_eq!(inner.entries["lib:1.0"].access_count, 1);
        }
    }

    #[test]
    fn test_miss_increments_miss_count() {
        let tmp = tempdir().unwrap();
        let (store, _) = store_with(&tmp.path().join("cache"), 10_000, 100);
        assert!(store.get("nope", "1").is_none());
        assert_eq!(store.stats().miss_count, 1);
    }

    #[test]
    fn test_admission_triggers_lru_eviction() {
        // A=400 at the tail, B=400, C=100 at the head, budget 1000.
        // Admitting 300 bytes must evict exactly A.
        let tmp = tempdir().unwrap();
        let (store, _) = store_with(&tmp.path().join("cache"), 1000, 100);

        store.admit("a", "1", &payload(tmp.path(), "pa", 400)).unwrap();
        store.admit("b", "1", &payload(tmp.path(), "pb", 400)).unwrap();
        store.admit("c", "1", &payload(tmp.path(), "pc", 100)).unwrap();

        store.admit("new", "1", &payload(tmp.path(), "pn", 300)).unwrap();

        assert!(!store.contains("a", "1"));
        assert!(store.contains("b", "1"));
        assert!(store.contains("c", "1"));
        assert!(store.contains("new", "1"));

        let stats = store.stats();
        assert_eq!(stats.total_size_bytes, 800);
        assert_eq!(stats.total_items, 3);
        let inner = store.inner.lock();
        assert_eq!(inner.lru.front(), Some("new:1"));
    }

    #[test]
    fn test_oversized_entry_rejected_without_state_change() {
        let tmp = tempdir().unwrap();
        let (store, _) = store_with(&tmp.path().join("cache"), 1000, 100);
        store.admit("keep", "1", &payload(tmp.path(), "k", 100)).unwrap();

        let big = payload(tmp.path(), "big", 2000);
        let err = store.admit("big", "1", &big).unwrap_err();
        assert!(matches!(err, MortarError::DiskFull { .. }));
        assert!(big.exists(), "payload handed back to the caller");

        let stats = store.stats();
        assert_eq!(stats.total_items, 1);
        assert_eq!(stats.total_size_bytes, 100);
    }

    #[test]
    fn test_item_budget_evicts_exactly_enough() {
        let tmp = tempdir().unwrap();
        let (store, _) = store_with(&tmp.path().join("cache"), 1_000_000, 3);

        store.admit("a", "1", &payload(tmp.path(), "pa", 10)).unwrap();
        store.admit("b", "1", &payload(tmp.path(), "pb", 10)).unwrap();
        store.admit("c", "1", &payload(tmp.path(), "pc", 10)).unwrap();
        store.admit("d", "1", &payload(tmp.path(), "pd", 10)).unwrap();

        let stats = store.stats();
        assert_eq!(stats.total_items, 3);
        assert!(!store.contains("a", "1"), "only the LRU tail evicted");
        assert!(store.contains("b", "1"));
    }

    #[test]
    fn test_pinned_entry_survives_eviction() {
        let tmp = tempdir().unwrap();
        let (store, _) = store_with(&tmp.path().join("cache"), 1000, 100);

        store.admit("pinned", "1", &payload(tmp.path(), "pp", 400)).unwrap();
        store.admit("loose", "1", &payload(tmp.path(), "pl", 400)).unwrap();
        assert!(store.pin("pinned", "1", true));

        store.admit("new", "1", &payload(tmp.path(), "pn", 400)).unwrap();

        assert!(store.contains("pinned", "1"));
        assert!(!store.contains("loose", "1"));
    }

    #[test]
    fn test_all_pinned_admission_fails_and_restores_payload() {
        let tmp = tempdir().unwrap();
        let (store, _) = store_with(&tmp.path().join("cache"), 1000, 100);
        store.admit("a", "1", &payload(tmp.path(), "pa", 600)).unwrap();
        store.pin("a", "1", true);

        let src = payload(tmp.path(), "pb", 600);
        let err = store.admit("b", "1", &src).unwrap_err();
        assert!(matches!(err, MortarError::DiskFull { .. }));
        assert!(src.exists());
        assert!(store.contains("a", "1"));
    }

    #[test]
    fn test_remove_pinned_requires_force() {
        let tmp = tempdir().unwrap();
        let (store, _) = store_with(&tmp.path().join("cache"), 10_000, 100);
        store.admit("p", "1", &payload(tmp.path(), "pp", 10)).unwrap();
        store.pin("p", "1", true);

        assert!(!store.remove("p", "1", false));
        assert!(store.contains("p", "1"));
        assert!(store.remove("p", "1", true));
        assert!(!store.contains("p", "1"));
    }

    #[test]
    fn test_remove_missing_is_silent() {
        let tmp = tempdir().unwrap();
        let (store, _) = store_with(&tmp.path().join("cache"), 10_000, 100);
        assert!(!store.remove("ghost", "1", false));
    }

    #[test]
    fn test_evicted_path_survives_while_handle_held() {
        let tmp = tempdir().unwrap();
        let (store, _) = store_with(&tmp.path().join("cache"), 10_000, 100);
        store.admit("held", "1", &payload(tmp.path(), "ph", 10)).unwrap();

        let handle = store.get("held", "1").unwrap();
        let path = handle.path().to_path_buf();

        assert!(store.remove("held", "1", false));
        assert!(path.exists(), "directory alive while a handle exists");

        drop(handle);
        assert!(!path.exists(), "directory removed with the last handle");
    }

    #[test]
    fn test_index_roundtrip_preserves_entries_and_stats() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("cache");
        {
            let (store, _) = store_with(&root, 10_000, 100);
            store.admit("fmt", "10.1.0", &payload(tmp.path(), "p1", 64)).unwrap();
            store.admit("zlib", "1.3", &payload(tmp.path(), "p2", 32)).unwrap();
            store.get("fmt", "10.1.0");
            store.get("fmt", "10.1.0");
            store.get("missing", "0");
            store.pin("zlib", "1.3", true);
            store.save().unwrap();
        }

        let (reloaded, _) = store_with(&root, 10_000, 100);
        let stats = reloaded.stats();
        assert_eq!(stats.total_items, 2);
        assert_eq!(stats.total_size_bytes, 96);
        assert_eq!(stats.hit_count, 2);
        assert_eq!(stats.miss_count, 1);

        assert!(reloaded.contains("fmt", "10.1.0"));
        let inner = reloaded.inner.lock();
        assert!(inner.entries["zlib:1.3"].pinned);
        assert_eq!(inner.entries["fmt:10.1.0"].access_count, 2);
        // fmt was touched last, so it reloads at the head.
        assert_eq!(inner.lru.front(), Some("fmt:10.1.0"));
    }

    #[test]
    fn test_reconcile_drops_missing_paths() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("cache");
        let victim_path;
        {
            let (store, _) = store_with(&root, 10_000, 100);
            store.admit("gone", "1", &payload(tmp.path(), "pg", 10)).unwrap();
            store.admit("kept", "1", &payload(tmp.path(), "pk", 10)).unwrap();
            victim_path = store.get("gone", "1").unwrap().path().to_path_buf();
            store.save().unwrap();
        }
        std::fs::remove_dir_all(&victim_path).unwrap();

        let (reloaded, _) = store_with(&root, 10_000, 100);
        assert!(!reloaded.contains("gone", "1"));
        assert!(reloaded.contains("kept", "1"));
        assert_eq!(reloaded.stats().total_items, 1);
    }

    #[test]
    fn test_stale_staging_swept_on_open() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("cache");
        std::fs::create_dir_all(&root).unwrap();
        let stale = root.join("staging-deadbeef");
        std::fs::create_dir_all(&stale).unwrap();

        // The manual test clock sits far past the directory's mtime, so the
        // leftover counts as stale.
        let clock = Arc::new(ManualClock::new());
        clock.advance_hours(24 * 365 * 10);
        let _store = TierStore::open(&root, test_config(1000, 10), clock).unwrap();
        assert!(!stale.exists());
    }

    #[test]
    fn test_cleanup_hits_soft_thresholds() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("cache");
        let clock = Arc::new(ManualClock::new());
        let config = CacheConfig {
            max_size: 1000,
            max_items: 100,
            min_keep_items: 0,
            eviction_policy: EvictionPolicy::Lru,
            ..CacheConfig::default()
        };
        let store = TierStore::open(&root, config, clock).unwrap();

        for i in 0..10 {
            store
                .admit(&format!("p{}", i), "1", &payload(tmp.path(), &format!("d{}", i), 95))
                .unwrap();
        }
        assert_eq!(store.stats().total_size_bytes, 950);

        let evicted = store.cleanup();
        assert!(evicted >= 2);
        assert!(store.stats().total_size_bytes <= 800);
        assert!(store.stats().last_cleanup.is_some());
    }

    #[test]
    fn test_recommendation_applies_oldest_entries() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("cache");
        let clock = Arc::new(ManualClock::new());
        let config = test_config(1000, 100);
        let store = TierStore::open(&root, config, clock.clone()).unwrap();

        store.admit("old", "1", &payload(tmp.path(), "po", 480)).unwrap();
        clock.advance_hours(10);
        store.admit("new", "1", &payload(tmp.path(), "pn", 480)).unwrap();

        let rec = store.recommendation();
        assert_eq!(rec.level, CleanupLevel::Aggressive);
        assert_eq!(rec.victims, vec!["old:1"]);

        let removed = store.apply_recommendation(&rec);
        assert_eq!(removed, 1);
        assert!(!store.contains("old", "1"));
        assert!(store.contains("new", "1"));
    }

    #[test]
    fn test_total_size_matches_entry_sum() {
        let tmp = tempdir().unwrap();
        let (store, _) = store_with(&tmp.path().join("cache"), 100_000, 100);
        for i in 0..5 {
            store
                .admit(&format!("p{}", i), "1", &payload(tmp.path(), &format!("s{}", i), 10 * (i + 1)))
                .unwrap();
        }
        store.remove("p2", "1", false);

        let inner = store.inner.lock();
        let sum: u64 = inner.entries.values().map(|e| e.size_bytes).sum();
        assert_eq!(sum, inner.total_size);
        assert_eq!(
            inner.entries.keys().collect::<std::collections::HashSet<_>>(),
            inner
                .lru
                .keys_lru_first()
                .iter()
                .collect::<std::collections::HashSet<_>>()
        );
    }

    #[test]
    fn test_validate_integrity_detects_tampering() {
        let tmp = tempdir().unwrap();
        let (store, _) = store_with(&tmp.path().join("cache"), 10_000, 100);
        store.admit("t", "1", &payload(tmp.path(), "pt", 10)).unwrap();
        assert!(store.validate_integrity().is_ok());

        let handle = store.get("t", "1").unwrap();
        std::fs::write(handle.path().join("extra.bin"), b"tamper").unwrap();
        assert!(matches!(
            store.validate_integrity(),
            Err(MortarError::CorruptEntry { .. })
        ));
    }

    #[test]
    fn test_queries() {
        let tmp = tempdir().unwrap();
        let (store, clock) = store_with(&tmp.path().join("cache"), 10_000, 100);
        store.admit("fmt", "10.0.0", &payload(tmp.path(), "a", 5)).unwrap();
        clock.advance_hours(1);
        store.admit("fmt", "10.1.0", &payload(tmp.path(), "b", 5)).unwrap();
        clock.advance_hours(1);
        store.admit("zlib", "1.3", &payload(tmp.path(), "c", 5)).unwrap();

        assert_eq!(store.packages(), vec!["fmt", "zlib"]);
        assert_eq!(store.versions_of("fmt"), vec!["10.0.0", "10.1.0"]);
        assert_eq!(store.oldest_entries(1)[0].key, "fmt:10.0.0");
    }
}
