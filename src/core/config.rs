//! Configuration handling for Mortar
//!
//! Supports mortar.toml, .mortarrc, and environment variable overrides.

use std::env;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::cache::EvictionPolicy;
use crate::core::{MortarError, MortarResult};
use crate::resolver::ResolutionMode;
use crate::warmup::WarmupStrategy;

const GIB: u64 = 1024 * 1024 * 1024;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Cache configuration
    pub cache: CacheConfig,

    /// Resolver configuration
    pub resolver: ResolverConfig,

    /// Executor configuration
    pub executor: ExecutorConfig,

    /// Incremental updater and parse cache configuration
    pub updater: UpdaterConfig,

    /// Warmup configuration
    pub warmup: WarmupConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// User-tier cache directory (defaults to the platform cache dir)
    pub user_dir: Option<PathBuf>,

    /// Global-tier cache directory (defaults to the platform data dir)
    pub global_dir: Option<PathBuf>,

    /// Maximum cache size in bytes per tier
    pub max_size: u64,

    /// Maximum number of entries per tier
    pub max_items: usize,

    /// Entries older than this are candidates for time-based eviction
    pub max_age_hours: u64,

    /// Eviction policy
    pub eviction_policy: EvictionPolicy,

    /// `cleanup()` stops once total size is under this fraction of max_size
    pub size_soft_threshold: f64,

    /// `cleanup()` stops once item count is under this fraction of max_items
    pub items_soft_threshold: f64,

    /// Eviction never shrinks a tier below this many entries
    pub min_keep_items: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Conflict handling mode
    pub mode: ResolutionMode,

    /// Base delay for the transient-error retry (doubles per attempt)
    pub retry_base_delay_ms: u64,

    /// Maximum attempts for manifest reads (1 = no retry)
    pub retry_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Worker thread count (0 = hardware concurrency)
    pub max_workers: usize,

    /// Concurrency cap, distinct from worker count
    pub max_concurrent_tasks: usize,

    /// Minimum interval between adaptive worker adjustments
    pub adjustment_interval_ms: u64,

    /// Whether the load-monitor thread runs
    pub adaptive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Incremental apply is used when changed/total bytes is at or under this
    pub incremental_threshold: f64,

    /// Parse cache entry time-to-live
    pub parse_ttl_hours: u64,

    /// Parse cache capacity in entries
    pub parse_max_entries: usize,

    /// Upper bound on concurrent parse operations (0 = hardware concurrency)
    pub max_parallel_tasks: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmupConfig {
    /// Default preload strategy
    pub strategy: WarmupStrategy,

    /// Worker threads for Async/Background preloading
    pub max_concurrent_preloads: usize,

    /// Records with a larger estimated size are skipped
    pub max_preload_size: u64,

    /// Background strategy skips preloads while system load exceeds this
    pub idle_load_threshold: f64,

    /// Packages seeded at Normal priority by smart preload
    #[serde(default)]
    pub essential_packages: Vec<String>,

    /// Curated list seeded at High priority by smart preload
    #[serde(default)]
    pub popular_packages: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            resolver: ResolverConfig::default(),
            executor: ExecutorConfig::default(),
            updater: UpdaterConfig::default(),
            warmup: WarmupConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            user_dir: None,
            global_dir: None,
            max_size: 10 * GIB,
            max_items: 1000,
            max_age_hours: 24 * 30,
            eviction_policy: EvictionPolicy::Hybrid,
            size_soft_threshold: 0.80,
            items_soft_threshold: 0.90,
            min_keep_items: 10,
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            mode: ResolutionMode::Automatic,
            retry_base_delay_ms: 1000,
            retry_attempts: 2,
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_workers: 0,
            max_concurrent_tasks: 4,
            adjustment_interval_ms: 1000,
            adaptive: false,
        }
    }
}

impl ExecutorConfig {
    /// Effective worker count after resolving the hardware-concurrency default.
    pub fn worker_count(&self) -> usize {
        if self.max_workers == 0 {
            num_cpus::get()
        } else {
            self.max_workers
        }
    }
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            incremental_threshold: 0.10,
            parse_ttl_hours: 24,
            parse_max_entries: 1000,
            max_parallel_tasks: 0,
        }
    }
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            strategy: WarmupStrategy::Async,
            max_concurrent_preloads: 4,
            max_preload_size: GIB,
            idle_load_threshold: 0.5,
            essential_packages: vec![],
            popular_packages: vec![],
        }
    }
}

impl Config {
    /// Load configuration from project directory and merge with defaults
    pub fn load(project_dir: &Path) -> MortarResult<Self> {
        let mut config = Config::default();

        // Try loading mortar.toml
        let toml_path = project_dir.join("mortar.toml");
        if toml_path.exists() {
            let content = std::fs::read_to_string(&toml_path)?;
            config = toml::from_str(&content)?;
        }

        // Try loading .mortarrc (JSON format)
        let rc_path = project_dir.join(".mortarrc");
        if rc_path.exists() {
            let content = std::fs::read_to_string(&rc_path)?;
            config = serde_json::from_str(&content)?;
        }

        // Apply environment variable overrides
        config = config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(mut self) -> Self {
        if let Ok(cache_dir) = env::var("MORTAR_CACHE_DIR") {
            self.cache.user_dir = Some(PathBuf::from(cache_dir));
        }

        if let Ok(max_size) = env::var("MORTAR_MAX_CACHE_SIZE") {
            if let Ok(n) = max_size.parse() {
                self.cache.max_size = n;
            }
        }

        if let Ok(workers) = env::var("MORTAR_CONCURRENCY") {
            if let Ok(n) = workers.parse() {
                self.executor.max_workers = n;
            }
        }

        self
    }

    fn validate(&self) -> MortarResult<()> {
        if !(0.0..=1.0).contains(&self.updater.incremental_threshold) {
            return Err(MortarError::config(format!(
                "updater.incremental_threshold must be within [0, 1], got {}",
                self.updater.incremental_threshold
            )));
        }
        if self.cache.size_soft_threshold <= 0.0 || self.cache.size_soft_threshold > 1.0 {
            return Err(MortarError::config(
                "cache.size_soft_threshold must be within (0, 1]",
            ));
        }
        Ok(())
    }

    /// User-tier cache directory, creating it if necessary
    pub fn user_cache_dir(&self) -> MortarResult<PathBuf> {
        if let Some(ref dir) = self.cache.user_dir {
            std::fs::create_dir_all(dir)?;
            return Ok(dir.clone());
        }

        let project_dirs = ProjectDirs::from("com", "mortar", "mortar")
            .ok_or_else(|| MortarError::config("Could not determine cache directory"))?;

        let cache_dir = project_dirs.cache_dir().to_path_buf();
        std::fs::create_dir_all(&cache_dir)?;
        Ok(cache_dir)
    }

    /// Global-tier cache directory, creating it if necessary
    pub fn global_cache_dir(&self) -> MortarResult<PathBuf> {
        if let Some(ref dir) = self.cache.global_dir {
            std::fs::create_dir_all(dir)?;
            return Ok(dir.clone());
        }

        let project_dirs = ProjectDirs::from("com", "mortar", "mortar")
            .ok_or_else(|| MortarError::config("Could not determine global cache directory"))?;

        let dir = project_dirs.data_dir().join("global-cache");
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Save configuration to mortar.toml
    pub fn save(&self, project_dir: &Path) -> MortarResult<()> {
        let toml_path = project_dir.join("mortar.toml");
        let content = toml::to_string_pretty(self)?;
        std::fs::write(toml_path, content)?;
        Ok(())
    }
}
