//! Mortar - cache and resolution core for a C++ package manager
//!
//! Mortar turns a project's declared dependency list into a consistent
//! on-disk tree of package versions: a tiered content-addressed cache
//! with budget-enforcing eviction, a conflict-reporting dependency
//! resolver, an incremental updater that skips redundant work, a bounded
//! parallel executor, and a priority-driven cache warmup engine.
//!
//! Fetching, manifest reading, hashing, and time are consumed through
//! narrow trait objects carried in a [`core::Context`]; embedders wire
//! their own implementations or go through [`core::Engine`].

pub mod cache;
pub mod core;
pub mod executor;
pub mod hash;
pub mod resolver;
pub mod update;
pub mod warmup;

pub use crate::cache::{CacheManager, CacheStatistics, CacheTier, EntryHandle, EvictionPolicy};
pub use crate::core::{
    Config, Context, Dependency, Engine, FetchError, FetchErrorKind, MortarError, MortarResult,
    PackageId,
};
pub use crate::executor::{ParallelExecutor, ShutdownMode, Task, TaskKind, TaskStatus};
pub use crate::hash::{Hasher, StreamingHasher};
pub use crate::resolver::{DependencyGraph, Resolution, ResolutionMode, Resolver};
pub use crate::update::{GitIncrementalUpdater, IncrementalUpdater, ParseCache};
pub use crate::warmup::{WarmupEngine, WarmupPriority, WarmupStrategy};
