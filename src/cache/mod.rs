//! Tiered content-addressed package cache
//!
//! Lookups descend project -> user -> global. Admissions land in the user
//! tier unless directed at global; the project tier only ever holds links
//! into the higher tiers.

pub mod eviction;
pub mod index;
pub mod lru;
pub mod store;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::core::config::CacheConfig;
use crate::core::package::safe_name;
use crate::core::services::Clock;
use crate::core::{MortarError, MortarResult};

pub use eviction::{CleanupLevel, CleanupRecommendation, EvictionPolicy};
pub use store::{CacheEntry, EntryHandle, TierStore};

/// Snapshot of a tier's counters.
#[derive(Debug, Clone, Default)]
pub struct CacheStatistics {
    pub total_items: usize,
    pub total_size_bytes: u64,
    pub hit_count: u64,
    pub miss_count: u64,
    pub hit_rate: f64,
    pub last_cleanup: Option<DateTime<Utc>>,
}

/// Which tier an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Project,
    User,
    Global,
}

/// Facade over the user and global tier stores plus the project link view.
pub struct CacheManager {
    user: Arc<TierStore>,
    global: Arc<TierStore>,
    /// Directory holding the project's links into the higher tiers.
    project_links: Option<PathBuf>,
}

impl CacheManager {
    pub fn new(
        user_root: &Path,
        global_root: &Path,
        project_links: Option<PathBuf>,
        config: &CacheConfig,
        clock: Arc<dyn Clock>,
    ) -> MortarResult<Self> {
        let user = Arc::new(TierStore::open(user_root, config.clone(), clock.clone())?);
        let global = Arc::new(TierStore::open(global_root, config.clone(), clock)?);
        if let Some(ref dir) = project_links {
            std::fs::create_dir_all(dir)?;
        }
        Ok(Self {
            user,
            global,
            project_links,
        })
    }

    fn tier(&self, tier: CacheTier) -> &TierStore {
        match tier {
            CacheTier::User => &self.user,
            CacheTier::Global => &self.global,
            CacheTier::Project => unreachable!("project tier holds links, not entries"),
        }
    }

    /// Look up a cached version, consulting tiers in project -> user ->
    /// global order. The backing tier records the hit either way.
    pub fn get(&self, package: &str, version: &str) -> Option<EntryHandle> {
        if let Some(link) = self.project_link_path(package, version) {
            if link.exists() {
                // The link is only a view; recency belongs to the backing
                // entry.
                if let Some(handle) = self.user.get(package, version) {
                    return Some(handle);
                }
                if let Some(handle) = self.global.get(package, version) {
                    return Some(handle);
                }
                // Dangling link: its backing entry is gone.
                tracing::warn!(package, version, "removing dangling project link");
                let _ = std::fs::remove_dir_all(&link);
            }
        }
        self.user
            .get(package, version)
            .or_else(|| self.global.get(package, version))
    }

    /// Presence check without counter updates.
    pub fn contains(&self, package: &str, version: &str) -> bool {
        self.user.contains(package, version) || self.global.contains(package, version)
    }

    /// Admit into the user tier.
    pub fn admit(
        &self,
        package: &str,
        version: &str,
        populated_dir: &Path,
    ) -> MortarResult<EntryHandle> {
        self.admit_to(CacheTier::User, package, version, populated_dir)
    }

    /// Admit into a specific tier. Warmup sends essential packages to
    /// global; everything else belongs in user.
    pub fn admit_to(
        &self,
        tier: CacheTier,
        package: &str,
        version: &str,
        populated_dir: &Path,
    ) -> MortarResult<EntryHandle> {
        if tier == CacheTier::Project {
            return Err(MortarError::cache(
                "project tier holds links into user/global, not entries",
            ));
        }
        self.tier(tier).admit(package, version, populated_dir)
    }

    /// Toggle eviction exemption in whichever tier holds the entry.
    pub fn pin(&self, package: &str, version: &str, pinned: bool) -> bool {
        self.user.pin(package, version, pinned) || self.global.pin(package, version, pinned)
    }

    /// Remove from whichever tier holds the entry.
    pub fn remove(&self, package: &str, version: &str, force: bool) -> bool {
        self.user.remove(package, version, force) || self.global.remove(package, version, force)
    }

    /// Evict both tiers down to their soft thresholds.
    pub fn cleanup(&self) -> usize {
        self.user.cleanup() + self.global.cleanup()
    }

    /// One background-cleaner pass over both tiers.
    pub fn background_cleanup(&self) -> usize {
        let mut removed = 0;
        for store in [&self.user, &self.global] {
            let rec = store.recommendation();
            if rec.level != CleanupLevel::None {
                removed += store.apply_recommendation(&rec);
            }
        }
        removed
    }

    /// Combined statistics across user and global tiers.
    pub fn stats(&self) -> CacheStatistics {
        let u = self.user.stats();
        let g = self.global.stats();
        let hits = u.hit_count + g.hit_count;
        let lookups = hits + u.miss_count + g.miss_count;
        CacheStatistics {
            total_items: u.total_items + g.total_items,
            total_size_bytes: u.total_size_bytes + g.total_size_bytes,
            hit_count: hits,
            miss_count: u.miss_count + g.miss_count,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            last_cleanup: u.last_cleanup.max(g.last_cleanup),
        }
    }

    /// Statistics for one tier. The project tier is a link view with no
    /// entries of its own.
    pub fn tier_stats(&self, tier: CacheTier) -> CacheStatistics {
        match tier {
            CacheTier::Project => CacheStatistics::default(),
            other => self.tier(other).stats(),
        }
    }

    /// Direct access to a tier store.
    pub fn tier_store(&self, tier: CacheTier) -> Arc<TierStore> {
        match tier {
            CacheTier::User => self.user.clone(),
            CacheTier::Global => self.global.clone(),
            CacheTier::Project => unreachable!("project tier holds links, not entries"),
        }
    }

    /// Persist both tier indexes.
    pub fn save(&self) -> MortarResult<()> {
        self.user.save()?;
        self.global.save()
    }

    fn project_link_path(&self, package: &str, version: &str) -> Option<PathBuf> {
        self.project_links
            .as_ref()
            .map(|dir| dir.join(safe_name(package)).join(version))
    }

    /// Materialize `(package, version)` into the project link directory.
    ///
    /// The target must already be cached in a higher tier. Files are hard
    /// linked when the filesystem allows it, mirroring the directory
    /// structure; a symlinked directory is the fallback.
    pub fn link_into_project(&self, package: &str, version: &str) -> MortarResult<PathBuf> {
        let link = self.project_link_path(package, version).ok_or_else(|| {
            MortarError::cache("cache manager was opened without a project directory")
        })?;

        let handle = self
            .user
            .get(package, version)
            .or_else(|| self.global.get(package, version))
            .ok_or_else(|| {
                MortarError::cache(format!(
                    "cannot link {}:{}: not present in user or global tier",
                    package, version
                ))
            })?;

        if link.exists() {
            std::fs::remove_dir_all(&link)?;
        }
        if let Some(parent) = link.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if let Err(e) = hard_link_tree(handle.path(), &link) {
            tracing::debug!(error = %e, "hard link mirror failed, falling back to symlink");
            if link.exists() {
                std::fs::remove_dir_all(&link)?;
            }
            symlink_dir(handle.path(), &link)?;
        }
        Ok(link)
    }

    /// Drop the project's link for a version, leaving the cached entry.
    pub fn unlink_from_project(&self, package: &str, version: &str) -> MortarResult<bool> {
        let Some(link) = self.project_link_path(package, version) else {
            return Ok(false);
        };
        if link.exists() {
            std::fs::remove_dir_all(&link)?;
            return Ok(true);
        }
        Ok(false)
    }
}

/// Mirror `src` under `dst` using per-file hard links.
fn hard_link_tree(src: &Path, dst: &Path) -> MortarResult<()> {
    for entry in walkdir::WalkDir::new(src) {
        let entry =
            entry.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::hard_link(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn symlink_dir(src: &Path, dst: &Path) -> MortarResult<()> {
    std::os::unix::fs::symlink(src, dst)?;
    Ok(())
}

#[cfg(windows)]
fn symlink_dir(src: &Path, dst: &Path) -> MortarResult<()> {
    std::os::windows::fs::symlink_dir(src, dst)?;
    Ok(())
}
