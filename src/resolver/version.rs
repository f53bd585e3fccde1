//! Version constraint parsing and matching
//!
//! Constraints are predicates over version *strings*. Comparison goes
//! through semver when both sides parse (leniently: partial versions are
//! padded, a leading `v` is stripped) and falls back to lexicographic
//! string order otherwise, so git tags and date stamps still order
//! sensibly.

use std::cmp::Ordering;

use crate::core::{MortarError, MortarResult};

/// A version constraint (`*`, `1.2.0`, `^1.2`, `~1.2.0`, `>=1.0`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionConstraint {
    /// Any version (`*`, empty, or the `latest` sentinel)
    Any,
    /// Exact version (`1.0.0` or `=1.0.0`)
    Exact(String),
    /// Caret range (`^1.2.0` - same major, at or above)
    Caret(String),
    /// Tilde range (`~1.2.0` - same major.minor, at or above)
    Tilde(String),
    /// `>=X`
    GreaterOrEqual(String),
    /// `>X`
    GreaterThan(String),
    /// `<=X`
    LessOrEqual(String),
    /// `<X`
    LessThan(String),
}

impl VersionConstraint {
    /// Parse a constraint string.
    pub fn parse(s: &str) -> MortarResult<Self> {
        let s = s.trim();

        if s.is_empty() || s == "*" || s == "latest" {
            return Ok(VersionConstraint::Any);
        }

        let tail = |rest: &str| -> MortarResult<String> {
            let rest = rest.trim();
            if rest.is_empty() {
                Err(MortarError::InvalidConstraint(s.to_string()))
            } else {
                Ok(rest.to_string())
            }
        };

        if let Some(rest) = s.strip_prefix(">=") {
            return Ok(VersionConstraint::GreaterOrEqual(tail(rest)?));
        }
        if let Some(rest) = s.strip_prefix("<=") {
            return Ok(VersionConstraint::LessOrEqual(tail(rest)?));
        }
        if let Some(rest) = s.strip_prefix('>') {
            return Ok(VersionConstraint::GreaterThan(tail(rest)?));
        }
        if let Some(rest) = s.strip_prefix('<') {
            return Ok(VersionConstraint::LessThan(tail(rest)?));
        }
        if let Some(rest) = s.strip_prefix('^') {
            return Ok(VersionConstraint::Caret(tail(rest)?));
        }
        if let Some(rest) = s.strip_prefix('~') {
            return Ok(VersionConstraint::Tilde(tail(rest)?));
        }
        if let Some(rest) = s.strip_prefix('=') {
            return Ok(VersionConstraint::Exact(tail(rest)?));
        }

        Ok(VersionConstraint::Exact(s.to_string()))
    }

    /// Check whether `version` satisfies this constraint.
    pub fn matches(&self, version: &str) -> bool {
        match self {
            VersionConstraint::Any => true,
            VersionConstraint::Exact(v) => compare_versions(version, v) == Ordering::Equal,
            VersionConstraint::GreaterOrEqual(v) => compare_versions(version, v) != Ordering::Less,
            VersionConstraint::GreaterThan(v) => compare_versions(version, v) == Ordering::Greater,
            VersionConstraint::LessOrEqual(v) => compare_versions(version, v) != Ordering::Greater,
            VersionConstraint::LessThan(v) => compare_versions(version, v) == Ordering::Less,
            VersionConstraint::Caret(v) => match (lenient_semver(version), lenient_semver(v)) {
                (Some(candidate), Some(base)) => {
                    if base.major == 0 {
                        // ^0.y.z pins the minor as well.
                        candidate.major == 0
                            && candidate.minor == base.minor
                            && candidate >= base
                    } else {
                        candidate.major == base.major && candidate >= base
                    }
                }
                // Caret needs component structure; degrade to exact.
                _ => compare_versions(version, v) == Ordering::Equal,
            },
            VersionConstraint::Tilde(v) => match (lenient_semver(version), lenient_semver(v)) {
                (Some(candidate), Some(base)) => {
                    candidate.major == base.major
                        && candidate.minor == base.minor
                        && candidate.patch >= base.patch
                }
                _ => compare_versions(version, v) == Ordering::Equal,
            },
        }
    }
}

impl std::fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VersionConstraint::Any => write!(f, "*"),
            VersionConstraint::Exact(v) => write!(f, "={}", v),
            VersionConstraint::Caret(v) => write!(f, "^{}", v),
            VersionConstraint::Tilde(v) => write!(f, "~{}", v),
            VersionConstraint::GreaterOrEqual(v) => write!(f, ">={}", v),
            VersionConstraint::GreaterThan(v) => write!(f, ">{}", v),
            VersionConstraint::LessOrEqual(v) => write!(f, "<={}", v),
            VersionConstraint::LessThan(v) => write!(f, "<{}", v),
        }
    }
}

/// Parse a version string leniently: strip a leading `v`, pad partial
/// versions (`1` -> `1.0.0`, `1.2` -> `1.2.0`).
pub fn lenient_semver(s: &str) -> Option<semver::Version> {
    let s = s.trim().trim_start_matches('v');
    let base = s.split(['-', '+']).next().unwrap_or(s);
    let parts: Vec<&str> = base.split('.').collect();
    let padded = match parts.len() {
        1 => format!("{}.0.0", parts[0]),
        2 => format!("{}.{}.0", parts[0], parts[1]),
        _ => base.to_string(),
    };
    semver::Version::parse(&padded)
        .ok()
        .or_else(|| semver::Version::parse(s).ok())
}

/// Total order over version strings: semver when both sides parse,
/// lexicographic otherwise.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (lenient_semver(a), lenient_semver(b)) {
        (Some(va), Some(vb)) => va.cmp(&vb),
        _ => a.cmp(b),
    }
}

/// True when `version` satisfies every constraint.
pub fn satisfies_all<'a, I>(version: &str, constraints: I) -> bool
where
    I: IntoIterator<Item = &'a VersionConstraint>,
{
    constraints.into_iter().all(|c| c.matches(version))
}

/// Greatest version satisfying every constraint, under
/// [`compare_versions`] order.
pub fn max_satisfying<'a, I>(versions: &[String], constraints: I) -> Option<String>
where
    I: IntoIterator<Item = &'a VersionConstraint> + Copy,
{
    let mut sorted: Vec<&String> = versions.iter().collect();
    sorted.sort_by(|a, b| compare_versions(b, a));
    sorted
        .into_iter()
        .find(|v| satisfies_all(v, constraints))
        .cloned()
}
