//! Embedding facade
//!
//! Wires default services into a [`Context`] and hands out the five core
//! handles. `sync` is the one-call entry point: resolve, fetch misses
//! through the executor, admit into the cache, and materialize the
//! project's link view.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::cache::CacheManager;
use crate::core::config::Config;
use crate::core::context::Context;
use crate::core::services::{Fetcher, ManifestReader};
use crate::core::{MortarError, MortarResult};
use crate::executor::{ParallelExecutor, ShutdownMode, TaskFactory, TaskStatus};
use crate::resolver::Resolver;
use crate::update::{IncrementalUpdater, ParseCache};
use crate::warmup::WarmupEngine;

const LOCKFILE_NAME: &str = "mortar.lock";
const PROJECT_LINKS_DIR: &str = "mortar_packages";
const SYNC_TASK_TIMEOUT: Duration = Duration::from_secs(300);

/// Outcome summary of a [`Engine::sync`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub resolved: usize,
    pub fetched: usize,
    pub from_cache: usize,
}

/// Top-level handle owning the wired subsystems for one project.
pub struct Engine {
    pub project_dir: PathBuf,
    ctx: Context,
    cache: Arc<CacheManager>,
    executor: Arc<ParallelExecutor>,
    updater: Arc<IncrementalUpdater>,
    parse_cache: Arc<ParseCache>,
    warmup: Arc<WarmupEngine>,
    repositories: Mutex<HashMap<String, String>>,
}

impl Engine {
    /// Build an engine for `project_dir`, loading configuration from it
    /// and wiring the default hasher and clock.
    pub fn new(
        project_dir: &Path,
        fetcher: Arc<dyn Fetcher>,
        manifests: Arc<dyn ManifestReader>,
    ) -> MortarResult<Self> {
        let project_dir = project_dir
            .canonicalize()
            .unwrap_or_else(|_| project_dir.to_path_buf());
        let config = Config::load(&project_dir)?;
        let ctx = Context::builder()
            .fetcher(fetcher)
            .manifests(manifests)
            .config(config)
            .build();
        Self::with_context(project_dir, ctx)
    }

    /// Build from an explicit context; the entry point tests use.
    pub fn with_context(project_dir: PathBuf, ctx: Context) -> MortarResult<Self> {
        let user_dir = ctx.config.user_cache_dir()?;
        let global_dir = ctx.config.global_cache_dir()?;

        let cache = Arc::new(CacheManager::new(
            &user_dir,
            &global_dir,
            Some(project_dir.join(PROJECT_LINKS_DIR)),
            &ctx.config.cache,
            ctx.clock.clone(),
        )?);
        let executor = Arc::new(ParallelExecutor::new(&ctx));
        executor.start();
        let updater = Arc::new(IncrementalUpdater::new(&user_dir, &ctx)?);
        let parse_cache = Arc::new(ParseCache::new(&user_dir, &ctx)?);
        let warmup = Arc::new(WarmupEngine::new(&ctx, cache.clone()));

        Ok(Self {
            project_dir,
            ctx,
            cache,
            executor,
            updater,
            parse_cache,
            warmup,
            repositories: Mutex::new(HashMap::new()),
        })
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn cache(&self) -> Arc<CacheManager> {
        self.cache.clone()
    }

    pub fn executor(&self) -> Arc<ParallelExecutor> {
        self.executor.clone()
    }

    pub fn updater(&self) -> Arc<IncrementalUpdater> {
        self.updater.clone()
    }

    pub fn parse_cache(&self) -> Arc<ParseCache> {
        self.parse_cache.clone()
    }

    pub fn warmup(&self) -> Arc<WarmupEngine> {
        self.warmup.clone()
    }

    /// Fresh resolver over this engine's context.
    pub fn resolver(&self) -> Resolver {
        Resolver::new(self.ctx.clone())
    }

    pub fn lockfile_path(&self) -> PathBuf {
        self.project_dir.join(LOCKFILE_NAME)
    }

    /// Map a package name to its source repository URL.
    pub fn add_repository(&self, package: &str, url: &str) {
        self.repositories
            .lock()
            .insert(package.to_string(), url.to_string());
    }

    /// Registered repository URL, or the default registry template.
    pub fn source_url(&self, package: &str) -> String {
        self.repositories
            .lock()
            .get(package)
            .cloned()
            .unwrap_or_else(|| format!("https://packages.mortar.dev/{}.git", package))
    }

    /// Resolve the project, fetch whatever the cache is missing through
    /// the executor, and link every resolved version into the project.
    pub fn sync(&self) -> MortarResult<SyncReport> {
        let resolution = self.resolver().resolve_project(&self.project_dir)?;
        let graph = &resolution.graph;

        let mut report = SyncReport {
            resolved: graph.len(),
            ..SyncReport::default()
        };

        // Dispatch one download task per cache miss.
        let factory = TaskFactory::new(&self.ctx);
        let mut downloads: Vec<(String, String, String, PathBuf)> = Vec::new();
        for name in graph.packages() {
            let version = graph.node(&name).map(|n| n.version.clone()).unwrap_or_default();
            if self.cache.get(&name, &version).is_some() {
                report.from_cache += 1;
                continue;
            }
            let target = std::env::temp_dir().join(format!("mortar-dl-{}", uuid::Uuid::new_v4()));
            let task =
                factory.download_task(&name, &version, &self.source_url(&name), target.clone());
            let id = self.executor.submit(task)?;
            downloads.push((id, name, version, target));
        }

        for (id, name, version, target) in downloads {
            match self.executor.wait(&id, SYNC_TASK_TIMEOUT)? {
                TaskStatus::Completed => {
                    let handle = self.cache.admit(&name, &version, &target)?;
                    self.updater.update_manifest(&name, &version, handle.path())?;
                    report.fetched += 1;
                }
                TaskStatus::Cancelled => return Err(MortarError::Cancelled(id)),
                status => {
                    let message = self
                        .executor
                        .record(&id)
                        .and_then(|r| r.error_message)
                        .unwrap_or_else(|| format!("{:?}", status));
                    return Err(MortarError::TaskFailed { task_id: id, message });
                }
            }
        }

        // Materialize the project view and persist the lock file.
        for name in graph.packages() {
            if let Some(node) = graph.node(&name) {
                self.cache.link_into_project(&name, &node.version)?;
            }
        }
        graph.to_lockfile().save(&self.lockfile_path())?;

        tracing::info!(
            resolved = report.resolved,
            fetched = report.fetched,
            from_cache = report.from_cache,
            "project synchronized"
        );
        Ok(report)
    }

    /// Flush indexes and stop worker pools.
    pub fn shutdown(&self) {
        self.warmup.stop();
        self.executor.shutdown(ShutdownMode::Graceful);
        if let Err(e) = self.cache.save() {
            tracing::warn!(error = %e, "failed to persist cache index at shutdown");
        }
        let _ = self.parse_cache.save();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
