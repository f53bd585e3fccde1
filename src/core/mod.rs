//! Core module for the Mortar cache and resolution engine
//!
//! This module contains the service context, configuration, error types,
//! shared package value types, and the embedding facade.

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod package;
pub mod services;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use context::Context;
pub use engine::Engine;
pub use error::{FetchError, FetchErrorKind, MortarError, MortarResult};
pub use package::{Dependency, PackageId};
pub use services::{Clock, Fetcher, ManifestReader, SystemClock};
