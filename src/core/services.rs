//! External collaborator interfaces
//!
//! The core consumes fetching, manifest reading, and time through narrow
//! trait objects so embedders can swap implementations per context and
//! tests can substitute deterministic fakes.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::core::package::DeclaredDependencies;
use crate::core::{FetchError, MortarResult};

/// Produces a populated package directory from a source URL.
///
/// Implementations wrap git or archive retrieval; the core never learns
/// which. On success `target_path` must contain the package contents.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, url: &str, version: &str, target_path: &Path) -> Result<(), FetchError>;
}

/// Reads package manifests and version listings.
pub trait ManifestReader: Send + Sync {
    /// Declared dependencies of the package rooted at `package_dir`.
    fn read_manifest(&self, package_dir: &Path) -> MortarResult<DeclaredDependencies>;

    /// All published versions of `package`, in no particular order.
    fn list_versions(&self, package: &str) -> MortarResult<Vec<String>>;

    /// Declared dependencies of a specific `(package, version)` as the
    /// source of record sees it, without requiring the package on disk.
    fn read_dependencies(&self, package: &str, version: &str) -> MortarResult<DeclaredDependencies>;
}

/// Time source. All components read time through this so tests can pin it.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock implementation of [`Clock`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Run `op`, retrying transient failures with exponential backoff
/// (`base`, `2*base`, `4*base`, ...). Non-transient errors surface
/// immediately. `attempts` counts total tries, not retries.
pub fn retry_transient<T, F>(attempts: u32, base: Duration, mut op: F) -> MortarResult<T>
where
    F: FnMut() -> MortarResult<T>,
{
    let mut delay = base;
    let mut last_try = attempts.max(1);
    loop {
        last_try -= 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && last_try > 0 => {
                tracing::debug!(error = %e, delay_ms = delay.as_millis() as u64, "transient failure, retrying");
                std::thread::sleep(delay);
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}
