//! Dependency resolver
//!
//! Worklist-driven expansion from the project's declared dependencies,
//! greatest-satisfying version selection, and structured conflict
//! reporting with three handling modes.

pub mod graph;
pub mod version;

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::context::Context;
use crate::core::services::retry_transient;
use crate::core::{MortarError, MortarResult};

pub use graph::{DependencyGraph, DependencyNode, Lockfile, LockedPackage, ResolutionStatus};
pub use version::VersionConstraint;

/// How conflicts are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionMode {
    /// Re-pin each conflicted package to the greatest version satisfying
    /// the intersection of its constraints; fail when none exists.
    #[default]
    Automatic,
    /// Return the conflict report and halt; the caller supplies a
    /// [`ConflictResolution`] and resolves again.
    Interactive,
    /// The first conflict aborts resolution.
    Strict,
}

/// One version conflict: a package whose chosen version fails the
/// intersection of its incoming constraints.
#[derive(Debug, Clone)]
pub struct VersionConflict {
    pub package: String,
    pub chosen_version: String,
    /// `(parent, constraint)` pairs; the project itself appears as "root".
    pub required_by: Vec<(String, String)>,
}

/// All conflicts found in one resolution pass.
#[derive(Debug, Clone, Default)]
pub struct ConflictReport {
    pub conflicts: Vec<VersionConflict>,
}

impl ConflictReport {
    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }
}

impl std::fmt::Display for ConflictReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for c in &self.conflicts {
            writeln!(f, "{} (chose {}):", c.package, c.chosen_version)?;
            for (parent, constraint) in &c.required_by {
                writeln!(f, "  required by {} as '{}'", parent, constraint)?;
            }
        }
        Ok(())
    }
}

/// A caller-supplied answer to a conflict in interactive mode.
#[derive(Debug, Clone)]
pub enum ConflictResolution {
    /// Force a specific version of a package.
    Pin { package: String, version: String },
    /// Drop the `parent -> package` requirement edge.
    Exclude { parent: String, package: String },
    /// Replace every constraint on a package with a looser one.
    Relax { package: String, constraint: String },
}

/// Outcome of a resolution pass. `report` is non-empty only in
/// interactive mode.
#[derive(Debug)]
pub struct Resolution {
    pub graph: DependencyGraph,
    pub report: ConflictReport,
}

const MAX_AUTOMATIC_PASSES: usize = 5;

/// Resolves a project's declared dependencies into a validated graph.
pub struct Resolver {
    ctx: Context,
    mode: ResolutionMode,
    graph: DependencyGraph,
    /// Accumulated direct dependencies driving each pass.
    root_deps: Vec<(String, String)>,
    pins: HashMap<String, String>,
    exclusions: HashSet<(String, String)>,
    relaxed: HashMap<String, String>,
}

impl Resolver {
    pub fn new(ctx: Context) -> Self {
        let mode = ctx.config.resolver.mode;
        Self {
            ctx,
            mode,
            graph: DependencyGraph::new(),
            root_deps: Vec::new(),
            pins: HashMap::new(),
            exclusions: HashSet::new(),
            relaxed: HashMap::new(),
        }
    }

    pub fn with_mode(mut self, mode: ResolutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// The working graph from the most recent pass.
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Reset all working state, keeping the context.
    pub fn clear(&mut self) {
        self.graph = DependencyGraph::new();
        self.root_deps.clear();
        self.pins.clear();
        self.exclusions.clear();
        self.relaxed.clear();
    }

    /// Resolve the project's declared dependencies transitively.
    pub fn resolve_project(&mut self, project_dir: &Path) -> MortarResult<Resolution> {
        let deps = self.retry(|| self.ctx.manifests.read_manifest(project_dir))?;
        self.root_deps = deps
            .into_iter()
            .map(|d| (d.name, d.constraint))
            .collect();
        self.run()
    }

    /// Add one package to the working graph and re-resolve.
    pub fn resolve_package(&mut self, name: &str, constraint: &str) -> MortarResult<Resolution> {
        self.root_deps
            .retain(|(existing, _)| existing != name);
        self.root_deps.push((name.to_string(), constraint.to_string()));
        self.run()
    }

    /// Record a conflict answer for the next resolution pass.
    pub fn apply_resolution(&mut self, resolution: ConflictResolution) {
        match resolution {
            ConflictResolution::Pin { package, version } => {
                self.pins.insert(package, version);
            }
            ConflictResolution::Exclude { parent, package } => {
                self.exclusions.insert((parent, package));
            }
            ConflictResolution::Relax { package, constraint } => {
                self.relaxed.insert(package, constraint);
            }
        }
    }

    /// Confirm the working graph's invariants.
    pub fn validate(&self) -> MortarResult<()> {
        self.graph.validate()
    }

    fn run(&mut self) -> MortarResult<Resolution> {
        let mut pass = 0;
        loop {
            pass += 1;
            self.graph = DependencyGraph::new();
            let worklist: VecDeque<(Option<String>, String, String)> = self
                .root_deps
                .iter()
                .map(|(n, c)| (None, n.clone(), c.clone()))
                .collect();
            self.expand(worklist)?;

            if let Some(cycle) = self.graph.detect_cycle() {
                return Err(MortarError::CyclicDependency(cycle));
            }

            let report = self.detect_conflicts()?;
            if report.is_empty() {
                self.graph.validate()?;
                return Ok(Resolution {
                    graph: self.graph.clone(),
                    report,
                });
            }

            match self.mode {
                ResolutionMode::Strict => {
                    return Err(conflict_error(&report.conflicts[0]));
                }
                ResolutionMode::Interactive => {
                    for c in &report.conflicts {
                        self.graph.set_status(&c.package, ResolutionStatus::Failed);
                    }
                    tracing::info!(conflicts = report.conflicts.len(), "resolution halted for caller input");
                    return Ok(Resolution {
                        graph: self.graph.clone(),
                        report,
                    });
                }
                ResolutionMode::Automatic => {
                    if pass >= MAX_AUTOMATIC_PASSES {
                        return Err(conflict_error(&report.conflicts[0]));
                    }
                    self.auto_pin(&report)?;
                }
            }
        }
    }

    /// For each conflict, pin the greatest version satisfying the
    /// constraint intersection; fail when the intersection is empty.
    fn auto_pin(&mut self, report: &ConflictReport) -> MortarResult<()> {
        for c in &report.conflicts {
            let constraints: Vec<VersionConstraint> = c
                .required_by
                .iter()
                .map(|(_, s)| VersionConstraint::parse(s))
                .collect::<MortarResult<_>>()?;
            let versions = self.retry(|| self.ctx.manifests.list_versions(&c.package))?;
            match version::max_satisfying(&versions, &constraints) {
                Some(best) => {
                    tracing::debug!(package = %c.package, version = %best, "auto-resolving conflict");
                    self.pins.insert(c.package.clone(), best);
                }
                None => return Err(conflict_error(c)),
            }
        }
        Ok(())
    }

    fn expand(
        &mut self,
        mut worklist: VecDeque<(Option<String>, String, String)>,
    ) -> MortarResult<()> {
        while let Some((parent, name, constraint_str)) = worklist.pop_front() {
            let parent_name = parent.clone().unwrap_or_else(|| "root".to_string());
            if self.exclusions.contains(&(parent_name.clone(), name.clone())) {
                continue;
            }
            let constraint_str = self
                .relaxed
                .get(&name)
                .cloned()
                .unwrap_or(constraint_str);

            if self.graph.contains(&name) {
                // Already chosen; just record the requirement edge. The
                // conflict pass decides whether the choice still holds.
                match &parent {
                    Some(p) => self.graph.add_dependency(p, &name, &constraint_str),
                    None => self.graph.add_root(&name, &constraint_str),
                }
                continue;
            }

            let constraint = VersionConstraint::parse(&constraint_str)?;
            let chosen = match self.pins.get(&name) {
                Some(pin) => pin.clone(),
                None => {
                    let versions = self.retry(|| self.ctx.manifests.list_versions(&name))?;
                    let cs = [constraint];
                    version::max_satisfying(&versions, &cs).ok_or_else(|| {
                        MortarError::VersionNotFound {
                            package: name.clone(),
                            constraint: constraint_str.clone(),
                        }
                    })?
                }
            };

            self.graph.add_package(&name, &chosen);
            self.graph.set_status(&name, ResolutionStatus::Resolving);
            match &parent {
                Some(p) => self.graph.add_dependency(p, &name, &constraint_str),
                None => self.graph.add_root(&name, &constraint_str),
            }

            let deps = self.retry(|| self.ctx.manifests.read_dependencies(&name, &chosen))?;
            for d in deps {
                worklist.push_back((Some(name.clone()), d.name, d.constraint));
            }
            self.graph.set_status(&name, ResolutionStatus::Resolved);
        }
        Ok(())
    }

    /// Packages whose chosen version fails the intersection of their
    /// incoming constraints.
    fn detect_conflicts(&self) -> MortarResult<ConflictReport> {
        let mut conflicts = Vec::new();
        for name in self.graph.packages() {
            let incoming = self.graph.incoming_constraints(&name);
            if incoming.is_empty() {
                continue;
            }
            let parsed: Vec<VersionConstraint> = incoming
                .iter()
                .map(|(_, c)| VersionConstraint::parse(c))
                .collect::<MortarResult<_>>()?;
            let version = match self.graph.node(&name) {
                Some(node) => node.version.clone(),
                None => continue,
            };
            if !version::satisfies_all(&version, &parsed) {
                conflicts.push(VersionConflict {
                    package: name,
                    chosen_version: version,
                    required_by: incoming,
                });
            }
        }
        Ok(ConflictReport { conflicts })
    }

    fn retry<T, F>(&self, op: F) -> MortarResult<T>
    where
        F: FnMut() -> MortarResult<T>,
    {
        let cfg = &self.ctx.config.resolver;
        retry_transient(
            cfg.retry_attempts,
            Duration::from_millis(cfg.retry_base_delay_ms),
            op,
        )
    }
}

fn conflict_error(c: &VersionConflict) -> MortarError {
    MortarError::VersionConflict {
        package: c.package.clone(),
        chosen_version: c.chosen_version.clone(),
        required_by: c.required_by.clone(),
    }
}
