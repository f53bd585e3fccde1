//! Explicit service context
//!
//! Every component receives its collaborators through a [`Context`] value
//! instead of process-wide singletons. Tests construct distinct contexts
//! with fake services; embedders usually go through `Engine`.

use std::sync::Arc;

use crate::core::config::Config;
use crate::core::services::{Clock, Fetcher, ManifestReader, SystemClock};
use crate::hash::{Hasher, StreamingHasher};

/// Bundle of external collaborators plus configuration.
///
/// Cheap to clone: all services are behind `Arc`.
#[derive(Clone)]
pub struct Context {
    pub hasher: Arc<dyn Hasher>,
    pub clock: Arc<dyn Clock>,
    pub fetcher: Arc<dyn Fetcher>,
    pub manifests: Arc<dyn ManifestReader>,
    pub config: Arc<Config>,
}

impl Context {
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }
}

/// Builder for [`Context`]. Fetcher and manifest reader have no defaults;
/// hasher and clock fall back to the standard implementations.
#[derive(Default)]
pub struct ContextBuilder {
    hasher: Option<Arc<dyn Hasher>>,
    clock: Option<Arc<dyn Clock>>,
    fetcher: Option<Arc<dyn Fetcher>>,
    manifests: Option<Arc<dyn ManifestReader>>,
    config: Option<Config>,
}

impl ContextBuilder {
    pub fn hasher(mut self, hasher: Arc<dyn Hasher>) -> Self {
        self.hasher = Some(hasher);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn manifests(mut self, manifests: Arc<dyn ManifestReader>) -> Self {
        self.manifests = Some(manifests);
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Panics if fetcher or manifest reader is missing; both are required
    /// collaborators with no meaningful default.
    pub fn build(self) -> Context {
        Context {
            hasher: self.hasher.unwrap_or_else(|| Arc::new(StreamingHasher::new())),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            fetcher: self.fetcher.expect("ContextBuilder: fetcher is required"),
            manifests: self
                .manifests
                .expect("ContextBuilder: manifest reader is required"),
            config: Arc::new(self.config.unwrap_or_default()),
        }
    }
}
