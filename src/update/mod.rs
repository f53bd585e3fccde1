//! Incremental update engine
//!
//! Per-version file manifests, candidate diffing, and the incremental
//! apply path that copies only what changed when the delta is small
//! enough. Git checkouts take the commit-comparison shortcut in
//! [`git::GitIncrementalUpdater`].

pub mod git;
pub mod parser;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::context::Context;
use crate::core::services::Clock;
use crate::core::MortarResult;
use crate::hash::Hasher;

pub use git::{GitIncrementalUpdater, GitUpdateOutcome};
pub use parser::{ParseCache, ParseCacheEntry};

const MANIFEST_FILE_NAME: &str = "incremental_manifest.json";

/// How a file differs between the stored manifest and a fresh candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    Unchanged,
}

/// One file in a version's manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Relative path with forward slashes.
    pub path: String,
    /// SHA-256 of the file contents, lowercase hex.
    pub hash: String,
    pub size: u64,
    /// Unix seconds.
    pub last_modified: i64,
}

/// Diff between a cached version and a freshly fetched candidate.
#[derive(Debug, Clone, Default)]
pub struct PackageChanges {
    pub package: String,
    pub version: String,
    pub added: Vec<FileRecord>,
    pub modified: Vec<FileRecord>,
    pub deleted: Vec<FileRecord>,
    pub unchanged: Vec<FileRecord>,
    /// Total bytes in the candidate tree.
    pub total_bytes: u64,
    /// Bytes in added and modified candidate files plus deleted old files.
    pub changed_bytes: u64,
}

impl PackageChanges {
    pub fn change_ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            if self.deleted.is_empty() {
                0.0
            } else {
                1.0
            }
        } else {
            self.changed_bytes as f64 / self.total_bytes as f64
        }
    }

    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

/// What an update attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The delta was applied in place.
    Incremental { files_applied: usize },
    /// The delta was too large; the caller should re-admit the candidate
    /// wholesale.
    FullReplace,
}

/// Detects per-file changes and applies small deltas in place.
pub struct IncrementalUpdater {
    manifest_path: PathBuf,
    /// package -> version -> file records
    manifests: Mutex<HashMap<String, HashMap<String, Vec<FileRecord>>>>,
    hasher: Arc<dyn Hasher>,
    clock: Arc<dyn Clock>,
    threshold: f64,
}

impl IncrementalUpdater {
    /// Open the updater rooted at `cache_dir`, loading any persisted
    /// manifest store.
    pub fn new(cache_dir: &Path, ctx: &Context) -> MortarResult<Self> {
        std::fs::create_dir_all(cache_dir)?;
        let manifest_path = cache_dir.join(MANIFEST_FILE_NAME);
        let manifests = if manifest_path.exists() {
            match std::fs::read_to_string(&manifest_path)
                .map_err(crate::core::MortarError::from)
                .and_then(|s| Ok(serde_json::from_str(&s)?))
            {
                Ok(map) => map,
                Err(e) => {
                    tracing::warn!(error = %e, "manifest store unreadable, starting empty");
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };
        Ok(Self {
            manifest_path,
            manifests: Mutex::new(manifests),
            hasher: ctx.hasher.clone(),
            clock: ctx.clock.clone(),
            threshold: ctx.config.updater.incremental_threshold,
        })
    }

    /// Walk `dir` and hash every regular file into a sorted manifest.
    pub fn scan_directory(&self, dir: &Path) -> MortarResult<Vec<FileRecord>> {
        let mut records = Vec::new();
        for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
            let entry = entry
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(dir)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            let metadata = entry.metadata().map_err(|e| {
                std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
            })?;
            let mtime = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .map(|t| t.timestamp())
                .unwrap_or_else(|_| self.clock.now().timestamp());
            records.push(FileRecord {
                hash: self.hasher.sha256_file(entry.path())?,
                size: metadata.len(),
                last_modified: mtime,
                path: rel,
            });
        }
        records.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(records)
    }

    /// Diff a freshly fetched candidate against the stored manifest for
    /// `(package, version)`. With no stored manifest every file is Added.
    pub fn detect_changes(
        &self,
        package: &str,
        version: &str,
        candidate_dir: &Path,
    ) -> MortarResult<PackageChanges> {
        let candidate = self.scan_directory(candidate_dir)?;
        let stored = self
            .manifests
            .lock()
            .get(package)
            .and_then(|versions| versions.get(version))
            .cloned()
            .unwrap_or_default();

        let old_by_path: HashMap<&str, &FileRecord> =
            stored.iter().map(|r| (r.path.as_str(), r)).collect();
        let new_paths: std::collections::HashSet<&str> =
            candidate.iter().map(|r| r.path.as_str()).collect();

        let mut changes = PackageChanges {
            package: package.to_string(),
            version: version.to_string(),
            ..PackageChanges::default()
        };

        for record in &candidate {
            changes.total_bytes += record.size;
            match old_by_path.get(record.path.as_str()) {
                None => {
                    changes.changed_bytes += record.size;
                    changes.added.push(record.clone());
                }
                Some(old) if old.hash != record.hash => {
                    changes.changed_bytes += record.size;
                    changes.modified.push(record.clone());
                }
                Some(_) => changes.unchanged.push(record.clone()),
            }
        }
        for record in &stored {
            if !new_paths.contains(record.path.as_str()) {
                changes.changed_bytes += record.size;
                changes.deleted.push(record.clone());
            }
        }
        Ok(changes)
    }

    /// Apply a detected delta onto the cached tree.
    ///
    /// When `changed/total` is at or under the threshold, deleted files
    /// are removed and added/modified files copied over, and the stored
    /// manifest is refreshed. A larger delta signals full-replace and
    /// leaves the cached tree alone.
    pub fn apply_update(
        &self,
        cached_dir: &Path,
        candidate_dir: &Path,
        changes: &PackageChanges,
    ) -> MortarResult<UpdateOutcome> {
        if changes.change_ratio() > self.threshold {
            tracing::info!(
                package = %changes.package,
                ratio = changes.change_ratio(),
                "delta too large, full replace"
            );
            return Ok(UpdateOutcome::FullReplace);
        }

        for record in &changes.deleted {
            let target = cached_dir.join(&record.path);
            if target.exists() {
                std::fs::remove_file(&target)?;
            }
        }
        for record in changes.added.iter().chain(&changes.modified) {
            let source = candidate_dir.join(&record.path);
            let target = cached_dir.join(&record.path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&source, &target)?;
        }

        let files_applied =
            changes.added.len() + changes.modified.len() + changes.deleted.len();

        // The candidate's full scan is exactly the new manifest.
        let mut manifest: Vec<FileRecord> = changes
            .unchanged
            .iter()
            .chain(&changes.added)
            .chain(&changes.modified)
            .cloned()
            .collect();
        manifest.sort_by(|a, b| a.path.cmp(&b.path));
        self.store_manifest(&changes.package, &changes.version, manifest)?;

        tracing::debug!(
            package = %changes.package,
            files = files_applied,
            "incremental update applied"
        );
        Ok(UpdateOutcome::Incremental { files_applied })
    }

    /// Scan `dir` and record it as the manifest for `(package, version)`.
    pub fn update_manifest(
        &self,
        package: &str,
        version: &str,
        dir: &Path,
    ) -> MortarResult<Vec<FileRecord>> {
        let records = self.scan_directory(dir)?;
        self.store_manifest(package, version, records.clone())?;
        Ok(records)
    }

    /// Forget the manifest for one version, or all versions of a package.
    pub fn remove_manifest(&self, package: &str, version: Option<&str>) -> MortarResult<()> {
        {
            let mut manifests = self.manifests.lock();
            match version {
                Some(v) => {
                    if let Some(versions) = manifests.get_mut(package) {
                        versions.remove(v);
                        if versions.is_empty() {
                            manifests.remove(package);
                        }
                    }
                }
                None => {
                    manifests.remove(package);
                }
            }
        }
        self.save()
    }

    pub fn file_count(&self, package: &str, version: &str) -> usize {
        self.manifests
            .lock()
            .get(package)
            .and_then(|v| v.get(version))
            .map(|files| files.len())
            .unwrap_or(0)
    }

    pub fn package_size(&self, package: &str, version: &str) -> u64 {
        self.manifests
            .lock()
            .get(package)
            .and_then(|v| v.get(version))
            .map(|files| files.iter().map(|f| f.size).sum())
            .unwrap_or(0)
    }

    pub fn files(&self, package: &str, version: &str) -> Vec<String> {
        self.manifests
            .lock()
            .get(package)
            .and_then(|v| v.get(version))
            .map(|files| files.iter().map(|f| f.path.clone()).collect())
            .unwrap_or_default()
    }

    pub fn clear(&self) -> MortarResult<()> {
        self.manifests.lock().clear();
        self.save()
    }

    fn store_manifest(
        &self,
        package: &str,
        version: &str,
        records: Vec<FileRecord>,
    ) -> MortarResult<()> {
        self.manifests
            .lock()
            .entry(package.to_string())
            .or_default()
            .insert(version.to_string(), records);
        self.save()
    }

    fn save(&self) -> MortarResult<()> {
        let manifests = self.manifests.lock();
        let content = serde_json::to_string_pretty(&*manifests)?;
        std::fs::write(&self.manifest_path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::{test_context, write_tree};
    use tempfile::tempdir;

    fn updater(cache_dir: &Path) -> IncrementalUpdater {
        let (ctx, _, _, _) = test_context();
        IncrementalUpdater::new(cache_dir, &ctx).unwrap()
    }

    #[test]
    fn test_scan_produces_sorted_relative_paths() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("pkg");
        write_tree(
            &dir,
            &[
                ("src/z.cpp", b"z".as_slice()),
                ("include/a.hpp", b"a"),
                ("README.md", b"r"),
            ],
        );

        let u = updater(&tmp.path().join("cache"));
        let records = u.scan_directory(&dir).unwrap();
        let paths: Vec<&str> = records.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["README.md", "include/a.hpp", "src/z.cpp"]);
        assert!(records.iter().all(|r| r.size > 0 && !r.hash.is_empty()));
    }

    #[test]
    fn test_unknown_version_is_all_added() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("pkg");
        write_tree(&dir, &[("a", b"1234".as_slice())]);

        let u = updater(&tmp.path().join("cache"));
        let changes = u.detect_changes("pkg", "1.0", &dir).unwrap();
        assert_eq!(changes.added.len(), 1);
        assert!(changes.modified.is_empty());
        assert!((changes.change_ratio() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_small_delta_applies_incrementally() {
        // Ten files, one small modification: ratio well under 10%.
        let tmp = tempdir().unwrap();
        let cached = tmp.path().join("cached");
        let mut files: Vec<(String, Vec<u8>)> = (0..9)
            .map(|i| (format!("f{}", i), vec![b'x'; 100]))
            .collect();
        files.push(("small".to_string(), vec![b'y'; 50]));
        let refs: Vec<(&str, &[u8])> = files
            .iter()
            .map(|(p, c)| (p.as_str(), c.as_slice()))
            .collect();
        write_tree(&cached, &refs);

        let u = updater(&tmp.path().join("cache"));
        u.update_manifest("pkg", "1.0", &cached).unwrap();

        // Candidate: identical except "small" changed.
        let candidate = tmp.path().join("candidate");
        write_tree(&candidate, &refs);
        std::fs::write(candidate.join("small"), vec![b'z'; 50]).unwrap();

        let changes = u.detect_changes("pkg", "1.0", &candidate).unwrap();
        assert_eq!(changes.modified.len(), 1);
        assert_eq!(changes.unchanged.len(), 9);
        assert!((changes.change_ratio() - 50.0 / 950.0).abs() < 1e-9);

        let outcome = u.apply_update(&cached, &candidate, &changes).unwrap();
        assert_eq!(outcome, UpdateOutcome::Incremental { files_applied: 1 });
        assert_eq!(std::fs::read(cached.join("small")).unwrap(), vec![b'z'; 50]);

        // A rescan of the cached tree now matches the stored manifest.
        let verify = u.detect_changes("pkg", "1.0", &cached).unwrap();
        assert!(verify.is_unchanged());
    }

    #[test]
    fn test_large_delta_signals_full_replace() {
        let tmp = tempdir().unwrap();
        let cached = tmp.path().join("cached");
        write_tree(
            &cached,
            &[("a", vec![b'a'; 100].as_slice()), ("b", vec![b'b'; 100].as_slice())],
        );

        let u = updater(&tmp.path().join("cache"));
        u.update_manifest("pkg", "1.0", &cached).unwrap();

        let candidate = tmp.path().join("candidate");
        write_tree(
            &candidate,
            &[("a", vec![b'a'; 100].as_slice()), ("b", vec![b'Z'; 100].as_slice())],
        );

        let changes = u.detect_changes("pkg", "1.0", &candidate).unwrap();
        assert!((changes.change_ratio() - 0.5).abs() < f64::EPSILON);

        let outcome = u.apply_update(&cached, &candidate, &changes).unwrap();
        assert_eq!(outcome, UpdateOutcome::FullReplace);
        // Full replace leaves the cached tree for the caller to swap.
        assert_eq!(std::fs::read(cached.join("b")).unwrap(), vec![b'b'; 100]);
    }

    #[test]
    fn test_deleted_files_are_removed() {
        let tmp = tempdir().unwrap();
        let cached = tmp.path().join("cached");
        // Deletion must stay under the 10% changed-bytes threshold.
        write_tree(
            &cached,
            &[
                ("keep", vec![b'k'; 960].as_slice()),
                ("drop", vec![b'd'; 40].as_slice()),
            ],
        );

        let u = updater(&tmp.path().join("cache"));
        u.update_manifest("pkg", "1.0", &cached).unwrap();

        let candidate = tmp.path().join("candidate");
        write_tree(&candidate, &[("keep", vec![b'k'; 960].as_slice())]);

        let changes = u.detect_changes("pkg", "1.0", &candidate).unwrap();
        assert_eq!(changes.deleted.len(), 1);

        let outcome = u.apply_update(&cached, &candidate, &changes).unwrap();
        assert!(matches!(outcome, UpdateOutcome::Incremental { .. }));
        assert!(!cached.join("drop").exists());
        assert!(cached.join("keep").exists());
        assert_eq!(u.file_count("pkg", "1.0"), 1);
    }

    #[test]
    fn test_manifest_store_persists() {
        let tmp = tempdir().unwrap();
        let cache_dir = tmp.path().join("cache");
        let dir = tmp.path().join("pkg");
        write_tree(&dir, &[("lib.hpp", b"contents".as_slice())]);

        {
            let u = updater(&cache_dir);
            u.update_manifest("pkg", "1.0", &dir).unwrap();
        }

        let u = updater(&cache_dir);
        assert_eq!(u.file_count("pkg", "1.0"), 1);
        assert_eq!(u.package_size("pkg", "1.0"), 8);
        assert_eq!(u.files("pkg", "1.0"), vec!["lib.hpp"]);

        u.remove_manifest("pkg", Some("1.0")).unwrap();
        assert_eq!(u.file_count("pkg", "1.0"), 0);
    }
}
