//! Cache warmup engine
//!
//! Priority-driven speculative cache population: registered packages are
//! bucketed by priority, ordered by popularity within each bucket, and
//! preloaded by a strategy-dependent set of workers. Essential packages
//! land in the global tier.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::cache::{store, CacheManager, CacheTier};
use crate::core::config::WarmupConfig;
use crate::core::context::Context;
use crate::core::services::{Clock, Fetcher};
use crate::core::{MortarError, MortarResult};
use crate::executor::balancer::{FixedLoadProbe, LoadProbe};

/// Preload priority; lower values drain first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum WarmupPriority {
    Critical,
    High,
    Normal,
    Low,
    Background,
}

/// How `start` drives the preload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum WarmupStrategy {
    /// The calling thread drains the queue serially.
    Immediate,
    /// Worker threads drain the queue; `start` returns immediately.
    #[default]
    Async,
    /// Async, but packages are skipped while system load is high.
    Background,
    /// No threads; records are candidates for preload on cache misses.
    OnDemand,
}

/// One registered preload candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmupRecord {
    pub package: String,
    pub version: String,
    pub source_url: String,
    pub priority: WarmupPriority,
    pub estimated_size: u64,
    pub access_frequency: u64,
    pub popularity_score: f64,
    pub essential: bool,
    pub preloaded: bool,
}

impl WarmupRecord {
    fn key(&self) -> String {
        format!("{}@{}", self.package, self.version)
    }
}

/// Popularity score: access frequency, an essential bonus, and a small-
/// package bonus with `size_mb` clamped at 1 or more.
fn popularity_score(record: &WarmupRecord) -> f64 {
    let mut score = 0.4 * record.access_frequency as f64;
    if record.essential {
        score += 10.0;
    }
    let size_mb = (record.estimated_size / (1024 * 1024)).max(1);
    score += 1000.0 / size_mb as f64;
    score
}

/// Counters for one warmup engine.
#[derive(Debug, Clone, Default)]
pub struct WarmupStats {
    pub total: usize,
    pub preloaded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total_time: Duration,
    pub average_time_per_package: Duration,
    pub total_bytes_preloaded: u64,
    pub success_rate: f64,
}

#[derive(Debug, Default)]
struct StatsAccum {
    preloaded: usize,
    failed: usize,
    skipped: usize,
    total_time: Duration,
    total_bytes: u64,
}

struct WarmupShared {
    records: Mutex<HashMap<String, WarmupRecord>>,
    queue: Mutex<VecDeque<String>>,
    stop: AtomicBool,
    preloading: AtomicBool,
    live_workers: AtomicUsize,
    active: AtomicUsize,
    completed: AtomicUsize,
    total: AtomicUsize,
    strategy: Mutex<WarmupStrategy>,
    stats: Mutex<StatsAccum>,
    cache: Arc<CacheManager>,
    fetcher: Arc<dyn Fetcher>,
    clock: Arc<dyn Clock>,
    probe: Arc<dyn LoadProbe>,
    config: WarmupConfig,
    staging_root: PathBuf,
}

/// Prioritized cache preloader.
pub struct WarmupEngine {
    shared: Arc<WarmupShared>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl WarmupEngine {
    pub fn new(ctx: &Context, cache: Arc<CacheManager>) -> Self {
        Self::with_probe(ctx, cache, Arc::new(FixedLoadProbe::new(0.0)))
    }

    /// Construct with a specific load probe for the Background strategy.
    pub fn with_probe(
        ctx: &Context,
        cache: Arc<CacheManager>,
        probe: Arc<dyn LoadProbe>,
    ) -> Self {
        let config = ctx.config.warmup.clone();
        Self {
            shared: Arc::new(WarmupShared {
                records: Mutex::new(HashMap::new()),
                queue: Mutex::new(VecDeque::new()),
                stop: AtomicBool::new(false),
                preloading: AtomicBool::new(false),
                live_workers: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
                total: AtomicUsize::new(0),
                strategy: Mutex::new(config.strategy),
                stats: Mutex::new(StatsAccum::default()),
                cache,
                fetcher: ctx.fetcher.clone(),
                clock: ctx.clock.clone(),
                probe,
                config,
                staging_root: std::env::temp_dir().join("mortar-warmup"),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Register a preload candidate. Re-registering a key replaces it and
    /// recomputes its score.
    pub fn register(
        &self,
        package: &str,
        version: &str,
        source_url: &str,
        priority: WarmupPriority,
    ) {
        let mut record = WarmupRecord {
            package: package.to_string(),
            version: version.to_string(),
            source_url: source_url.to_string(),
            priority,
            estimated_size: 0,
            access_frequency: 0,
            popularity_score: 0.0,
            essential: self
                .shared
                .config
                .essential_packages
                .iter()
                .any(|p| p == package),
            preloaded: false,
        };
        record.popularity_score = popularity_score(&record);
        tracing::debug!(key = %record.key(), priority = ?priority, "registered for warmup");
        self.shared.records.lock().insert(record.key(), record);
    }

    /// Register with a size estimate and observed access frequency.
    pub fn register_with_profile(
        &self,
        package: &str,
        version: &str,
        source_url: &str,
        priority: WarmupPriority,
        estimated_size: u64,
        access_frequency: u64,
    ) {
        self.register(package, version, source_url, priority);
        let key = format!("{}@{}", package, version);
        let mut records = self.shared.records.lock();
        if let Some(record) = records.get_mut(&key) {
            record.estimated_size = estimated_size;
            record.access_frequency = access_frequency;
            record.popularity_score = popularity_score(record);
        }
    }

    /// Remove one version, or every version of a package when `version`
    /// is omitted. Returns whether anything was removed.
    pub fn unregister(&self, package: &str, version: Option<&str>) -> bool {
        let mut records = self.shared.records.lock();
        match version {
            Some(v) => records.remove(&format!("{}@{}", package, v)).is_some(),
            None => {
                let before = records.len();
                records.retain(|_, r| r.package != package);
                records.len() != before
            }
        }
    }

    pub fn update_priority(&self, package: &str, version: &str, priority: WarmupPriority) -> bool {
        let mut records = self.shared.records.lock();
        match records.get_mut(&format!("{}@{}", package, version)) {
            Some(record) => {
                record.priority = priority;
                true
            }
            None => false,
        }
    }

    /// Recompute every record's popularity score.
    pub fn update_popularity_scores(&self) {
        let mut records = self.shared.records.lock();
        for record in records.values_mut() {
            record.popularity_score = popularity_score(record);
        }
    }

    /// Bucket records by priority, order each bucket by descending
    /// popularity, and rebuild the drain queue.
    pub fn optimize_preload_order(&self) {
        self.update_popularity_scores();
        let records = self.shared.records.lock();
        let mut buckets: BTreeMap<WarmupPriority, Vec<&WarmupRecord>> = BTreeMap::new();
        for record in records.values().filter(|r| !r.preloaded) {
            buckets.entry(record.priority).or_default().push(record);
        }

        let mut queue = VecDeque::new();
        for (_, mut bucket) in buckets {
            bucket.sort_by(|a, b| {
                b.popularity_score
                    .partial_cmp(&a.popularity_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            queue.extend(bucket.into_iter().map(|r| r.key()));
        }
        *self.shared.queue.lock() = queue;
    }

    /// Ordered snapshot of what would be preloaded next.
    pub fn preload_queue(&self) -> Vec<WarmupRecord> {
        let records = self.shared.records.lock();
        self.shared
            .queue
            .lock()
            .iter()
            .filter_map(|key| records.get(key).cloned())
            .collect()
    }

    /// Begin preloading with the given strategy.
    pub fn start(&self, strategy: WarmupStrategy) -> MortarResult<()> {
        *self.shared.strategy.lock() = strategy;
        if strategy == WarmupStrategy::OnDemand {
            // Candidates wait for cache misses; nothing to drive.
            return Ok(());
        }
        if self.shared.preloading.swap(true, Ordering::SeqCst) {
            return Err(MortarError::other("warmup preload already running"));
        }

        self.optimize_preload_order();
        self.shared.stop.store(false, Ordering::SeqCst);
        self.shared.completed.store(0, Ordering::SeqCst);
        let total = self.shared.queue.lock().len();
        self.shared.total.store(total, Ordering::SeqCst);
        *self.shared.stats.lock() = StatsAccum::default();

        match strategy {
            WarmupStrategy::Immediate => {
                worker_loop(&self.shared, strategy);
                self.shared.preloading.store(false, Ordering::SeqCst);
            }
            WarmupStrategy::Async | WarmupStrategy::Background => {
                let workers = self
                    .shared
                    .config
                    .max_concurrent_preloads
                    .max(1)
                    .min(total.max(1));
                let mut handles = self.workers.lock();
                for _ in 0..workers {
                    let shared = self.shared.clone();
                    shared.live_workers.fetch_add(1, Ordering::SeqCst);
                    handles.push(std::thread::spawn(move || {
                        worker_loop(&shared, strategy);
                        if shared.live_workers.fetch_sub(1, Ordering::SeqCst) == 1 {
                            shared.preloading.store(false, Ordering::SeqCst);
                        }
                    }));
                }
            }
            WarmupStrategy::OnDemand => unreachable!("handled above"),
        }
        Ok(())
    }

    /// Signal workers to exit after their current package and join them.
    /// Idempotent.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        self.shared.preloading.store(false, Ordering::SeqCst);
    }

    pub fn is_preloading(&self) -> bool {
        self.shared.preloading.load(Ordering::SeqCst)
    }

    /// `(completed, total, percentage)` for the current run.
    pub fn progress(&self) -> (usize, usize, f64) {
        let completed = self.shared.completed.load(Ordering::SeqCst);
        let total = self.shared.total.load(Ordering::SeqCst);
        let pct = if total == 0 {
            0.0
        } else {
            completed as f64 / total as f64 * 100.0
        };
        (completed, total, pct)
    }

    pub fn statistics(&self) -> WarmupStats {
        let accum = self.shared.stats.lock();
        let attempts = accum.preloaded + accum.failed;
        WarmupStats {
            total: self.shared.records.lock().len(),
            preloaded: accum.preloaded,
            failed: accum.failed,
            skipped: accum.skipped,
            total_time: accum.total_time,
            average_time_per_package: if attempts == 0 {
                Duration::ZERO
            } else {
                accum.total_time / attempts as u32
            },
            total_bytes_preloaded: accum.total_bytes,
            success_rate: if attempts == 0 {
                0.0
            } else {
                accum.preloaded as f64 / attempts as f64
            },
        }
    }

    /// Opportunistic preload hook for cache misses under the OnDemand
    /// strategy.
    pub fn on_cache_miss(&self, package: &str, version: &str) {
        if *self.shared.strategy.lock() != WarmupStrategy::OnDemand {
            return;
        }
        let key = format!("{}@{}", package, version);
        let pending = {
            let records = self.shared.records.lock();
            records.get(&key).map(|r| !r.preloaded).unwrap_or(false)
        };
        if pending {
            preload_one(&self.shared, &key);
        }
    }

    /// Seed the registry from the project: direct dependencies at
    /// Critical, the curated popular list at High, configured essentials
    /// at Normal. Already-registered packages are left alone.
    pub fn smart_preload(&self, ctx: &Context, project_dir: &Path) -> MortarResult<usize> {
        let mut seeded = 0;

        let deps = ctx.manifests.read_manifest(project_dir)?;
        for dep in &deps {
            seeded += self.seed(&dep.name, WarmupPriority::Critical) as usize;
        }
        let popular = self.shared.config.popular_packages.clone();
        for package in &popular {
            seeded += self.seed(package, WarmupPriority::High) as usize;
        }
        let essential = self.shared.config.essential_packages.clone();
        for package in &essential {
            seeded += self.seed(package, WarmupPriority::Normal) as usize;
        }

        tracing::info!(seeded, "smart preload registered candidates");
        Ok(seeded)
    }

    fn seed(&self, package: &str, priority: WarmupPriority) -> bool {
        let already = self
            .shared
            .records
            .lock()
            .values()
            .any(|r| r.package == package);
        if already {
            return false;
        }
        self.register(package, "latest", &default_source_url(package), priority);
        true
    }

    /// Persist the registry as JSON.
    pub fn save_config(&self, path: &Path) -> MortarResult<()> {
        let records = self.shared.records.lock();
        let mut list: Vec<&WarmupRecord> = records.values().collect();
        list.sort_by(|a, b| a.key().cmp(&b.key()));
        let content = serde_json::to_string_pretty(&list)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load a registry persisted by [`WarmupEngine::save_config`],
    /// replacing current records.
    pub fn load_config(&self, path: &Path) -> MortarResult<usize> {
        let content = std::fs::read_to_string(path)?;
        let list: Vec<WarmupRecord> = serde_json::from_str(&content)?;
        let mut records = self.shared.records.lock();
        records.clear();
        let count = list.len();
        for record in list {
            records.insert(record.key(), record);
        }
        Ok(count)
    }
}

fn default_source_url(package: &str) -> String {
    format!("https://packages.mortar.dev/{}.git", package)
}

fn worker_loop(shared: &WarmupShared, strategy: WarmupStrategy) {
    loop {
        // The stop flag is honored between packages, never mid-package.
        if shared.stop.load(Ordering::SeqCst) {
            return;
        }

        if strategy == WarmupStrategy::Background
            && shared.probe.sample().combined() > shared.config.idle_load_threshold
        {
            std::thread::sleep(Duration::from_millis(50));
            continue;
        }

        let key = shared.queue.lock().pop_front();
        let Some(key) = key else {
            return;
        };

        preload_one(shared, &key);
        shared.completed.fetch_add(1, Ordering::SeqCst);
    }
}

fn preload_one(shared: &WarmupShared, key: &str) {
    let Some(record) = shared.records.lock().get(key).cloned() else {
        return;
    };

    // Resource guard: oversized estimates are skipped outright.
    if record.estimated_size > shared.config.max_preload_size {
        shared.stats.lock().skipped += 1;
        tracing::debug!(key, size = record.estimated_size, "preload skipped: over size budget");
        return;
    }

    if shared.cache.contains(&record.package, &record.version) {
        mark_preloaded(shared, key);
        shared.stats.lock().preloaded += 1;
        return;
    }

    shared.active.fetch_add(1, Ordering::SeqCst);
    let started = shared.clock.now();
    let staging = shared
        .staging_root
        .join(format!("warmup-{}", uuid::Uuid::new_v4()));

    let outcome = shared
        .fetcher
        .fetch(&record.source_url, &record.version, &staging)
        .map_err(MortarError::from)
        .and_then(|()| {
            let size = store::dir_size(&staging);
            let tier = if record.essential {
                CacheTier::Global
            } else {
                CacheTier::User
            };
            shared
                .cache
                .admit_to(tier, &record.package, &record.version, &staging)
                .map(|_| size)
        });

    let elapsed = (shared.clock.now() - started).to_std().unwrap_or_default();
    let mut stats = shared.stats.lock();
    stats.total_time += elapsed;
    match outcome {
        Ok(size) => {
            stats.preloaded += 1;
            stats.total_bytes += size;
            drop(stats);
            mark_preloaded(shared, key);
            tracing::debug!(key, size, "preloaded into cache");
        }
        Err(e) => {
            stats.failed += 1;
            drop(stats);
            tracing::warn!(key, error = %e, "preload failed");
            if staging.exists() {
                let _ = std::fs::remove_dir_all(&staging);
            }
        }
    }
    shared.active.fetch_sub(1, Ordering::SeqCst);
}

fn mark_preloaded(shared: &WarmupShared, key: &str) {
    if let Some(record) = shared.records.lock().get_mut(key) {
        record.preloaded = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{CacheConfig, Config};
    use crate::core::testing::{test_context_with_config, MockFetcher, MockManifestReader};
    use crate::core::Context;
    use tempfile::tempdir;

    struct Fixture {
        engine: WarmupEngine,
        cache: Arc<CacheManager>,
        fetcher: Arc<MockFetcher>,
        manifests: Arc<MockManifestReader>,
        ctx: Context,
        _tmp: tempfile::TempDir,
    }

    fn fixture(mut config: Config) -> Fixture {
        let tmp = tempdir().unwrap();
        config.warmup.max_concurrent_preloads = 1;
        let (ctx, clock, fetcher, manifests) = test_context_with_config(config);
        let cache = Arc::new(
            CacheManager::new(
                &tmp.path().join("user"),
                &tmp.path().join("global"),
                None,
                &CacheConfig::default(),
                clock,
            )
            .unwrap(),
        );
        let engine = WarmupEngine::new(&ctx, cache.clone());
        Fixture {
            engine,
            cache,
            fetcher,
            manifests,
            ctx,
            _tmp: tmp,
        }
    }

    fn wait_until_idle(engine: &WarmupEngine) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while engine.is_preloading() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!engine.is_preloading(), "warmup did not finish in time");
    }

    #[test]
    fn test_popularity_score_formula() {
        let mut record = WarmupRecord {
            package: "fmt".into(),
            version: "10.0".into(),
            source_url: String::new(),
            priority: WarmupPriority::Normal,
            estimated_size: 10 * 1024 * 1024,
            access_frequency: 5,
            popularity_score: 0.0,
            essential: false,
            preloaded: false,
        };
        assert!((popularity_score(&record) - (2.0 + 100.0)).abs() < 1e-9);

        record.essential = true;
        assert!((popularity_score(&record) - (2.0 + 10.0 + 100.0)).abs() < 1e-9);

        // Tiny and zero sizes clamp to 1 MiB instead of dividing by zero.
        record.estimated_size = 0;
        assert!((popularity_score(&record) - (2.0 + 10.0 + 1000.0)).abs() < 1e-9);
    }

    #[test]
    fn test_register_unregister_roundtrip() {
        let f = fixture(Config::default());
        f.engine
            .register("fmt", "10.0", "https://x/fmt.git", WarmupPriority::High);
        f.engine.optimize_preload_order();
        let single = f.engine.preload_queue();

        assert!(f.engine.unregister("fmt", Some("10.0")));
        f.engine.optimize_preload_order();
        assert!(f.engine.preload_queue().is_empty());

        f.engine
            .register("fmt", "10.0", "https://x/fmt.git", WarmupPriority::High);
        f.engine.optimize_preload_order();
        let again = f.engine.preload_queue();

        assert_eq!(single.len(), 1);
        assert_eq!(again.len(), 1);
        assert_eq!(single[0].key(), again[0].key());
        assert_eq!(single[0].priority, again[0].priority);
    }

    #[test]
    fn test_unregister_all_versions() {
        let f = fixture(Config::default());
        f.engine.register("fmt", "9.0", "u", WarmupPriority::Low);
        f.engine.register("fmt", "10.0", "u", WarmupPriority::Low);
        f.engine.register("zlib", "1.3", "u", WarmupPriority::Low);

        assert!(f.engine.unregister("fmt", None));
        f.engine.optimize_preload_order();
        let queue = f.engine.preload_queue();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].package, "zlib");
    }

    #[test]
    fn test_priority_order_drains_critical_first() {
        // One worker: completion order must follow priority buckets.
        let f = fixture(Config::default());
        f.engine
            .register("c-pkg", "1", "https://x/c.git", WarmupPriority::Normal);
        f.engine
            .register("a-pkg", "1", "https://x/a.git", WarmupPriority::Critical);
        f.engine
            .register("b-pkg", "1", "https://x/b.git", WarmupPriority::High);
        f.engine.optimize_preload_order();

        f.engine.start(WarmupStrategy::Async).unwrap();
        wait_until_idle(&f.engine);

        assert_eq!(
            f.fetcher.fetched_urls(),
            vec!["https://x/a.git", "https://x/b.git", "https://x/c.git"]
        );

        let stats = f.engine.statistics();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.preloaded, 3);
        assert_eq!(stats.failed, 0);
        assert!((stats.success_rate - 1.0).abs() < f64::EPSILON);

        let (current, total, pct) = f.engine.progress();
        assert_eq!((current, total), (3, 3));
        assert!((pct - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_popularity_orders_within_bucket() {
        let f = fixture(Config::default());
        f.engine.register_with_profile(
            "cold",
            "1",
            "https://x/cold.git",
            WarmupPriority::Normal,
            5 * 1024 * 1024,
            0,
        );
        f.engine.register_with_profile(
            "hot",
            "1",
            "https://x/hot.git",
            WarmupPriority::Normal,
            5 * 1024 * 1024,
            1000,
        );
        f.engine.optimize_preload_order();

        let queue = f.engine.preload_queue();
        assert_eq!(queue[0].package, "hot");
        assert_eq!(queue[1].package, "cold");
    }

    #[test]
    fn test_immediate_strategy_runs_inline() {
        let f = fixture(Config::default());
        f.engine
            .register("fmt", "10.0", "https://x/fmt.git", WarmupPriority::Normal);

        f.engine.start(WarmupStrategy::Immediate).unwrap();

        // Already drained when start returns.
        assert!(!f.engine.is_preloading());
        assert_eq!(f.engine.statistics().preloaded, 1);
        assert!(f.cache.contains("fmt", "10.0"));
    }

    #[test]
    fn test_essential_packages_admit_to_global_tier() {
        let mut config = Config::default();
        config.warmup.essential_packages = vec!["zlib".to_string()];
        let f = fixture(config);

        f.engine
            .register("zlib", "1.3", "https://x/zlib.git", WarmupPriority::Critical);
        f.engine
            .register("fmt", "10.0", "https://x/fmt.git", WarmupPriority::Normal);
        f.engine.start(WarmupStrategy::Immediate).unwrap();

        assert_eq!(f.cache.tier_stats(CacheTier::Global).total_items, 1);
        assert_eq!(f.cache.tier_stats(CacheTier::User).total_items, 1);
    }

    #[test]
    fn test_resource_guard_skips_oversized_records() {
        let mut config = Config::default();
        config.warmup.max_preload_size = 1024;
        let f = fixture(config);

        f.engine.register_with_profile(
            "huge",
            "1",
            "https://x/huge.git",
            WarmupPriority::Critical,
            10 * 1024 * 1024,
            0,
        );
        f.engine.start(WarmupStrategy::Immediate).unwrap();

        let stats = f.engine.statistics();
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.preloaded, 0);
        assert_eq!(f.fetcher.call_count(), 0);
    }

    #[test]
    fn test_on_demand_start_is_a_noop() {
        let f = fixture(Config::default());
        f.engine
            .register("fmt", "10.0", "https://x/fmt.git", WarmupPriority::Normal);

        f.engine.start(WarmupStrategy::OnDemand).unwrap();
        assert_eq!(f.fetcher.call_count(), 0);
        assert!(!f.engine.is_preloading());

        // A cache miss triggers the opportunistic preload.
        f.engine.on_cache_miss("fmt", "10.0");
        assert_eq!(f.fetcher.call_count(), 1);
        assert!(f.cache.contains("fmt", "10.0"));

        // Unknown packages are ignored.
        f.engine.on_cache_miss("ghost", "1.0");
        assert_eq!(f.fetcher.call_count(), 1);
    }

    #[test]
    fn test_background_strategy_waits_for_idle() {
        let f = fixture(Config::default());
        let probe = Arc::new(FixedLoadProbe::new(0.9));
        let engine = WarmupEngine::with_probe(&f.ctx, f.cache.clone(), probe.clone());
        engine
            .register("fmt", "10.0", "https://x/fmt.git", WarmupPriority::Normal);

        engine.start(WarmupStrategy::Background).unwrap();
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(f.fetcher.call_count(), 0, "busy system defers preloads");

        probe.set_load(0.1);
        wait_until_idle(&engine);
        assert_eq!(f.fetcher.call_count(), 1);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let f = fixture(Config::default());
        f.engine.start(WarmupStrategy::Async).unwrap();
        f.engine.stop();
        f.engine.stop();
        assert!(!f.engine.is_preloading());
    }

    #[test]
    fn test_smart_preload_seeds_and_dedupes() {
        let mut config = Config::default();
        config.warmup.popular_packages = vec!["boost".into(), "fmt".into()];
        config.warmup.essential_packages = vec!["zlib".into(), "fmt".into()];
        let f = fixture(config);

        // Project depends on fmt and catch2; fmt also appears in both
        // curated lists and must be registered exactly once.
        f.manifests.set_project(&[("fmt", "^10.0"), ("catch2", "*")]);

        let seeded = f
            .engine
            .smart_preload(&f.ctx, Path::new("/project"))
            .unwrap();
        assert_eq!(seeded, 4); // fmt, catch2, boost, zlib

        f.engine.optimize_preload_order();
        let queue = f.engine.preload_queue();
        let by_name = |name: &str| queue.iter().find(|r| r.package == name).unwrap();

        assert_eq!(queue.len(), 4);
        assert_eq!(by_name("fmt").priority, WarmupPriority::Critical);
        assert_eq!(by_name("catch2").priority, WarmupPriority::Critical);
        assert_eq!(by_name("boost").priority, WarmupPriority::High);
        assert_eq!(by_name("zlib").priority, WarmupPriority::Normal);
        // Critical entries drain before the rest.
        assert_eq!(queue[0].priority, WarmupPriority::Critical);
        assert_eq!(queue[1].priority, WarmupPriority::Critical);
    }

    #[test]
    fn test_save_load_config_roundtrip() {
        let tmp = tempdir().unwrap();
        let f = fixture(Config::default());
        f.engine.register_with_profile(
            "fmt",
            "10.0",
            "https://x/fmt.git",
            WarmupPriority::High,
            2 * 1024 * 1024,
            7,
        );
        f.engine
            .register("zlib", "1.3", "https://x/zlib.git", WarmupPriority::Low);

        let path = tmp.path().join("warmup.json");
        f.engine.save_config(&path).unwrap();

        let other = fixture(Config::default());
        assert_eq!(other.engine.load_config(&path).unwrap(), 2);
        other.engine.optimize_preload_order();
        let queue = other.engine.preload_queue();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].package, "fmt");
        assert_eq!(queue[0].access_frequency, 7);
    }
}
