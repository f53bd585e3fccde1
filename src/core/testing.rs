//! Test doubles shared across module tests

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::Mutex;

use crate::core::config::Config;
use crate::core::context::Context;
use crate::core::package::{DeclaredDependencies, Dependency};
use crate::core::services::{Clock, Fetcher, ManifestReader};
use crate::core::{FetchError, MortarError, MortarResult};

/// Clock pinned to a fixed instant, advanced explicitly by tests.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()),
        }
    }

    pub fn advance_hours(&self, hours: i64) {
        let mut now = self.now.lock();
        *now += ChronoDuration::hours(hours);
    }

    pub fn advance_secs(&self, secs: i64) {
        let mut now = self.now.lock();
        *now += ChronoDuration::seconds(secs);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Fetcher that writes a small deterministic file tree into the target.
pub struct MockFetcher {
    /// Files (relative path -> contents) written per fetch.
    pub files: Vec<(String, Vec<u8>)>,
    pub calls: AtomicUsize,
    /// URLs in the order they were fetched.
    pub log: Mutex<Vec<String>>,
    /// Fail the first N fetches with a transient error.
    pub fail_first: AtomicUsize,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self {
            files: vec![("include/lib.hpp".into(), b"#pragma once\n".to_vec())],
            calls: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
            fail_first: AtomicUsize::new(0),
        }
    }

    pub fn with_files(files: Vec<(String, Vec<u8>)>) -> Self {
        Self {
            files,
            ..Self::new()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fetched_urls(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

impl Fetcher for MockFetcher {
    fn fetch(&self, url: &str, version: &str, target_path: &Path) -> Result<(), FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push(url.to_string());
        if self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(FetchError::unreachable("mock outage"));
        }
        std::fs::create_dir_all(target_path)
            .map_err(|e| FetchError::corrupted(e.to_string()))?;
        for (rel, contents) in &self.files {
            let path = target_path.join(rel);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| FetchError::corrupted(e.to_string()))?;
            }
            std::fs::write(&path, contents).map_err(|e| FetchError::corrupted(e.to_string()))?;
        }
        std::fs::write(target_path.join("VERSION"), version)
            .map_err(|e| FetchError::corrupted(e.to_string()))?;
        Ok(())
    }
}

/// Manifest reader backed by in-memory tables.
pub struct MockManifestReader {
    pub versions: Mutex<HashMap<String, Vec<String>>>,
    pub dependencies: Mutex<HashMap<(String, String), Vec<(String, String)>>>,
    pub project: Mutex<Vec<(String, String)>>,
    pub transient_failures: AtomicUsize,
}

impl MockManifestReader {
    pub fn new() -> Self {
        Self {
            versions: Mutex::new(HashMap::new()),
            dependencies: Mutex::new(HashMap::new()),
            project: Mutex::new(Vec::new()),
            transient_failures: AtomicUsize::new(0),
        }
    }

    pub fn add_package(&self, name: &str, versions: &[&str]) {
        self.versions
            .lock()
            .insert(name.to_string(), versions.iter().map(|v| v.to_string()).collect());
    }

    pub fn add_dependency(&self, name: &str, version: &str, dep: &str, constraint: &str) {
        self.dependencies
            .lock()
            .entry((name.to_string(), version.to_string()))
            .or_default()
            .push((dep.to_string(), constraint.to_string()));
    }

    pub fn set_project(&self, deps: &[(&str, &str)]) {
        *self.project.lock() = deps
            .iter()
            .map(|(n, c)| (n.to_string(), c.to_string()))
            .collect();
    }

    fn maybe_fail(&self) -> MortarResult<()> {
        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(MortarError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "mock registry timeout",
            )));
        }
        Ok(())
    }
}

impl ManifestReader for MockManifestReader {
    fn read_manifest(&self, _package_dir: &Path) -> MortarResult<DeclaredDependencies> {
        self.maybe_fail()?;
        Ok(self
            .project
            .lock()
            .iter()
            .map(|(n, c)| Dependency::new(n.clone(), c.clone()))
            .collect())
    }

    fn list_versions(&self, package: &str) -> MortarResult<Vec<String>> {
        self.maybe_fail()?;
        self.versions
            .lock()
            .get(package)
            .cloned()
            .ok_or_else(|| MortarError::ManifestNotFound(package.to_string()))
    }

    fn read_dependencies(&self, package: &str, version: &str) -> MortarResult<DeclaredDependencies> {
        self.maybe_fail()?;
        Ok(self
            .dependencies
            .lock()
            .get(&(package.to_string(), version.to_string()))
            .map(|deps| {
                deps.iter()
                    .map(|(n, c)| Dependency::new(n.clone(), c.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Context wired with all mock services and a manual clock.
pub fn test_context() -> (Context, Arc<ManualClock>, Arc<MockFetcher>, Arc<MockManifestReader>) {
    test_context_with_config(Config::default())
}

pub fn test_context_with_config(
    config: Config,
) -> (Context, Arc<ManualClock>, Arc<MockFetcher>, Arc<MockManifestReader>) {
    let clock = Arc::new(ManualClock::new());
    let fetcher = Arc::new(MockFetcher::new());
    let manifests = Arc::new(MockManifestReader::new());
    let ctx = Context::builder()
        .clock(clock.clone())
        .fetcher(fetcher.clone())
        .manifests(manifests.clone())
        .config(config)
        .build();
    (ctx, clock, fetcher, manifests)
}

/// Recursively sum file sizes, mirroring the cache's size accounting.
pub fn dir_size(path: &Path) -> u64 {
    walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Write a file tree (relative path -> contents) under `root`.
pub fn write_tree(root: &Path, files: &[(&str, &[u8])]) {
    for (rel, contents) in files {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }
}
