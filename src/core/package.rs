//! Shared package value types

use serde::{Deserialize, Serialize};

/// Sentinel version meaning "whatever the newest available version is".
pub const LATEST: &str = "latest";

/// Identity of a concrete package version.
///
/// `version` is either a concrete tag/commit or the [`LATEST`] sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageId {
    pub name: String,
    pub version: String,
}

impl PackageId {
    pub fn new<N: Into<String>, V: Into<String>>(name: N, version: V) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Cache key in the `{package}:{version}` form used by the entry table
    /// and the on-disk index.
    pub fn key(&self) -> String {
        format!("{}:{}", self.name, self.version)
    }

    /// Parse-cache and warmup key in the `{package}@{version}` form.
    pub fn at_key(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

impl std::fmt::Display for PackageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// A single declared dependency: a package name and a version constraint
/// string (`*`, `1.2.0`, `^1.2`, `~1.2.0`, `>=1.0`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    pub constraint: String,
}

impl Dependency {
    pub fn new<N: Into<String>, C: Into<String>>(name: N, constraint: C) -> Self {
        Self {
            name: name.into(),
            constraint: constraint.into(),
        }
    }
}

/// Ordered list of declared dependencies, as produced by a `ManifestReader`.
pub type DeclaredDependencies = Vec<Dependency>;

/// Filesystem-safe directory name for a package.
pub fn safe_name(name: &str) -> String {
    name.replace('/', "+").replace('@', "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys() {
        let id = PackageId::new("fmt", "10.1.0");
        assert_eq!(id.key(), "fmt:10.1.0");
        assert_eq!(id.at_key(), "fmt@10.1.0");
        assert_eq!(id.to_string(), "fmt@10.1.0");
    }

    #[test]
    fn test_safe_name() {
        assert_eq!(safe_name("boost/asio"), "boost+asio");
        assert_eq!(safe_name("@scoped/pkg"), "scoped+pkg");
    }
}
