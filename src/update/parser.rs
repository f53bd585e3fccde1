//! Hash-keyed dependency parse cache
//!
//! Memoizes parsed dependency lists per `(package, version)`, keyed by the
//! SHA-256 of the package's own manifest file. Concurrent parses of the
//! same key collapse to a single in-flight parse; other keys proceed
//! independently.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::core::context::Context;
use crate::core::services::Clock;
use crate::core::MortarResult;
use crate::hash::Hasher;

const PARSE_CACHE_FILE_NAME: &str = "parse_cache.json";
/// Headroom removed beyond the cap so eviction does not run every insert.
const EVICTION_SLACK: usize = 10;
const IN_FLIGHT_WAIT: Duration = Duration::from_secs(30);

/// One memoized parse result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseCacheEntry {
    pub package_name: String,
    pub version: String,
    /// SHA-256 of the manifest file this result was parsed from.
    pub hash: String,
    pub dependencies: Vec<String>,
    /// Unix seconds.
    pub last_parsed: i64,
    /// Unix seconds.
    pub last_accessed: i64,
    pub access_count: u64,
    pub is_valid: bool,
}

struct InFlight {
    done: Mutex<bool>,
    cv: Condvar,
}

impl InFlight {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn finish(&self) {
        *self.done.lock() = true;
        self.cv.notify_all();
    }

    fn wait(&self, timeout: Duration) {
        let mut done = self.done.lock();
        if !*done {
            self.cv.wait_for(&mut done, timeout);
        }
    }
}

/// Thread-safe parse memo with TTL and capacity eviction.
pub struct ParseCache {
    path: PathBuf,
    entries: DashMap<String, ParseCacheEntry>,
    in_flight: Mutex<HashMap<String, Arc<InFlight>>>,
    hasher: Arc<dyn Hasher>,
    clock: Arc<dyn Clock>,
    ttl: ChronoDuration,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ParseCache {
    /// Open the cache rooted at `cache_dir`, loading persisted entries.
    pub fn new(cache_dir: &Path, ctx: &Context) -> MortarResult<Self> {
        std::fs::create_dir_all(cache_dir)?;
        let path = cache_dir.join(PARSE_CACHE_FILE_NAME);

        let cache = Self {
            entries: DashMap::new(),
            in_flight: Mutex::new(HashMap::new()),
            hasher: ctx.hasher.clone(),
            clock: ctx.clock.clone(),
            ttl: ChronoDuration::hours(ctx.config.updater.parse_ttl_hours as i64),
            max_entries: ctx.config.updater.parse_max_entries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            path,
        };
        cache.load();
        Ok(cache)
    }

    fn key(package: &str, version: &str) -> String {
        format!("{}@{}", package, version)
    }

    /// Return the memoized dependency list for `(package, version)` when
    /// the stored manifest hash still matches `manifest_path`; otherwise
    /// run `parse` (once across concurrent callers) and memoize it.
    pub fn get_or_parse<F>(
        &self,
        package: &str,
        version: &str,
        manifest_path: &Path,
        mut parse: F,
    ) -> MortarResult<Vec<String>>
    where
        F: FnMut() -> MortarResult<Vec<String>>,
    {
        let key = Self::key(package, version);
        let hash = self.hasher.sha256_file(manifest_path)?;

        loop {
            if let Some(deps) = self.lookup(&key, &hash) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(deps);
            }

            // One leader per key; followers wait and re-check.
            let (flight, is_leader) = {
                let mut in_flight = self.in_flight.lock();
                match in_flight.get(&key).cloned() {
                    Some(flight) => (flight, false),
                    None => {
                        let flight = Arc::new(InFlight::new());
                        in_flight.insert(key.clone(), flight.clone());
                        (flight, true)
                    }
                }
            };

            if !is_leader {
                flight.wait(IN_FLIGHT_WAIT);
                continue;
            }

            self.misses.fetch_add(1, Ordering::Relaxed);
            let result = parse();

            if let Ok(ref deps) = result {
                let now = self.clock.now().timestamp();
                self.entries.insert(
                    key.clone(),
                    ParseCacheEntry {
                        package_name: package.to_string(),
                        version: version.to_string(),
                        hash: hash.clone(),
                        dependencies: deps.clone(),
                        last_parsed: now,
                        last_accessed: now,
                        access_count: 1,
                        is_valid: true,
                    },
                );
                self.evict_if_needed();
                let _ = self.save();
            }

            self.in_flight.lock().remove(&key);
            flight.finish();
            return result;
        }
    }

    fn lookup(&self, key: &str, hash: &str) -> Option<Vec<String>> {
        let now = self.clock.now();
        let mut entry = self.entries.get_mut(key)?;
        let age = now.timestamp() - entry.last_parsed;
        if !entry.is_valid || entry.hash != hash || age >= self.ttl.num_seconds() {
            return None;
        }
        entry.last_accessed = now.timestamp();
        entry.access_count += 1;
        Some(entry.dependencies.clone())
    }

    /// Drop memoized results for one version, or every version of a
    /// package when `version` is omitted.
    pub fn invalidate(&self, package: &str, version: Option<&str>) {
        match version {
            Some(v) => {
                self.entries.remove(&Self::key(package, v));
            }
            None => {
                let prefix = format!("{}@", package);
                self.entries.retain(|key, _| !key.starts_with(&prefix));
            }
        }
        let _ = self.save();
    }

    /// Drop entries past the TTL. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let cutoff = self.clock.now().timestamp() - self.ttl.num_seconds();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.last_parsed > cutoff);
        let removed = before - self.entries.len();
        if removed > 0 {
            let _ = self.save();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Evict by oldest access, then fewest accesses, removing a little
    /// slack beyond the cap so the pass does not run on every insert.
    fn evict_if_needed(&self) {
        if self.entries.len() <= self.max_entries {
            return;
        }
        let mut ranked: Vec<(String, i64, u64)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.last_accessed, e.access_count))
            .collect();
        ranked.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));

        let to_remove = (self.entries.len() - self.max_entries + EVICTION_SLACK)
            .min(ranked.len());
        for (key, _, _) in ranked.into_iter().take(to_remove) {
            self.entries.remove(&key);
        }
        tracing::debug!(removed = to_remove, "parse cache eviction pass");
    }

    /// Persist all entries to `parse_cache.json`.
    pub fn save(&self) -> MortarResult<()> {
        let snapshot: HashMap<String, ParseCacheEntry> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let content = serde_json::to_string_pretty(&snapshot)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }

    fn load(&self) {
        if !self.path.exists() {
            return;
        }
        let loaded: Option<HashMap<String, ParseCacheEntry>> = std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok());
        match loaded {
            Some(map) => {
                for (key, entry) in map {
                    self.entries.insert(key, entry);
                }
            }
            None => {
                tracing::warn!(path = %self.path.display(), "parse cache unreadable, starting empty");
            }
        }
    }
}
