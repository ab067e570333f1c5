/*!
The versioned constraint resolver.

Resolution happens in two phases over a graph of package nodes keyed by spec.

Phase 1 collects constraints. A work stack of frames (a spec plus the
dependency list that spec contributes) is drained; every edge can add a node
(pinned by override or overlay, or at its baseline version), promote a node to
a higher version named by a `version-ge` constraint, or request features.
Each of those events is monotonic, and each pushes new frames, so the phase
terminates when no new information can be produced. Phase 1 is insensitive to
evaluation order, which lets dep-info variable loads be batched.

Phase 2 performs a postfix walk from the root dependencies, emitting every
spec after its dependencies so the plan comes out in topological order. Along
the way it re-validates each `version-ge` constraint against the selected
version (an incomparable pair is reported, not guessed), checks that every
requested feature exists in the selected version, and detects cycles with an
in-progress marker. Finally `supports` expressions are evaluated over the
whole plan in one batched variable load.

Errors never produce a partial plan: diagnostics accumulate, are sorted and
deduplicated, and come back as one bundle.
*/

use crate::manifest::{Dependency, LoadedPort};
use crate::registry::{BaselineProvider, OverlayProvider, PortProvider};
use crate::spec::{FeatureSpec, PackageSpec, Triplet, CORE_FEATURE, DEFAULT_FEATURES};
use crate::triplet::VarProvider;
use crate::version::{compare, SchemedVersion, Version, VersionComp};
use log::trace;
use snafu::Snafu;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display};
use std::sync::Arc;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub(crate) enum Error {
    #[snafu(display(
        "Dependency resolution failed:\n{}",
        diagnostics.iter().map(|d| d.to_string()).collect::<Vec<_>>().join("\n")
    ))]
    Resolution { diagnostics: Vec<Diagnostic> },
}

type Result<T> = std::result::Result<T, Error>;

/// One resolution failure. The bundle returned to the caller is the sorted,
/// deduplicated list of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Diagnostic {
    /// A registry could not produce a requested port or baseline entry.
    Registry { message: String },
    /// A `version-ge` constraint names a version the registry does not have.
    ConstraintUnsatisfiable {
        spec: PackageSpec,
        version: Version,
        origin: String,
        message: String,
    },
    /// A `version-ge` constraint and the selected version use different
    /// schemes, so neither satisfies the other.
    VersionIncomparable {
        spec: PackageSpec,
        origin: String,
        baseline: SchemedVersion,
        target: SchemedVersion,
    },
    /// A requested feature does not exist in the selected version.
    MissingFeature {
        spec: PackageSpec,
        version: Version,
        feature: String,
        origin: String,
    },
    /// A back-edge was found during the postfix walk.
    CycleDetected {
        spec: PackageSpec,
        stack: Vec<String>,
    },
    /// `supports` expressions that evaluated false, aggregated.
    UnsupportedFeatures { items: Vec<(FeatureSpec, String)> },
    /// Dep-info variables could not be loaded.
    Vars { message: String },
    Internal { message: String },
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::Registry { message } => write!(f, "error: {message}"),
            Diagnostic::ConstraintUnsatisfiable {
                spec,
                version,
                origin,
                message,
            } => write!(
                f,
                "error: {origin} requires {spec} at least at {version}, which is not available: {message}"
            ),
            Diagnostic::VersionIncomparable {
                spec,
                origin,
                baseline,
                target,
            } => write!(
                f,
                "error: version conflict on {spec}: {origin} required {target}, which cannot be \
                 compared with the baseline version {baseline}; versions of different schemes \
                 have no ordering, but an override can pin the version"
            ),
            Diagnostic::MissingFeature {
                spec,
                version,
                feature,
                origin,
            } => write!(
                f,
                "error: {origin} requires feature '{feature}', which is not present in {spec}@{version}"
            ),
            Diagnostic::CycleDetected { spec, stack } => write!(
                f,
                "error: cycle detected during {spec}:\n{}",
                stack.join("\n")
            ),
            Diagnostic::UnsupportedFeatures { items } => {
                let lines: Vec<String> = items
                    .iter()
                    .map(|(fspec, expr)| {
                        format!(
                            "{} is only supported on '{expr}', which does not match {}",
                            fspec, fspec.spec.triplet
                        )
                    })
                    .collect();
                write!(f, "error: {}", lines.join("\nerror: "))
            }
            Diagnostic::Vars { message } => write!(f, "error: {message}"),
            Diagnostic::Internal { message } => write!(f, "internal error: {message}"),
        }
    }
}

/// How the caller wants `supports` failures handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnsupportedPortAction {
    Error,
    Warn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestType {
    /// Named at top level by the user.
    User,
    /// Pulled in transitively.
    Auto,
}

/// One entry of the install plan, in topological position.
#[derive(Debug, Clone)]
pub(crate) struct InstallPlanAction {
    pub(crate) spec: PackageSpec,
    pub(crate) port: Arc<LoadedPort>,
    pub(crate) request_type: RequestType,
    /// For every selected feature (and `core`), the feature specs it depends
    /// on. The `core` entry carries one `[core]` edge per package dependency.
    pub(crate) feature_dependencies: BTreeMap<String, Vec<FeatureSpec>>,
    pub(crate) abi: Option<crate::abi::AbiInfo>,
}

impl InstallPlanAction {
    pub(crate) fn version(&self) -> Version {
        self.port.manifest.to_version()
    }

    /// The selected features, `core` first.
    pub(crate) fn feature_list(&self) -> Vec<String> {
        self.feature_dependencies.keys().cloned().collect()
    }

    /// The package specs this action depends on directly.
    pub(crate) fn dependency_specs(&self) -> BTreeSet<PackageSpec> {
        self.feature_dependencies
            .values()
            .flatten()
            .map(|fspec| fspec.spec.clone())
            .filter(|spec| spec != &self.spec)
            .collect()
    }
}

#[derive(Debug, Default)]
pub(crate) struct ActionPlan {
    pub(crate) install_actions: Vec<InstallPlanAction>,
    pub(crate) unsupported_features: Vec<(FeatureSpec, String)>,
}

/// A configuration directive pinning one port to one version.
#[derive(Debug, Clone)]
pub(crate) struct DependencyOverride {
    pub(crate) name: String,
    pub(crate) version: Version,
}

struct PackageNodeData {
    /// Every version of this port whose constraints have been applied.
    considered: Vec<Arc<LoadedPort>>,
    /// The baseline version; `None` when pinned by overlay or override.
    baseline: Option<SchemedVersion>,
    /// Pinned nodes ignore version constraints entirely.
    overlay_or_override: bool,
    /// The version currently selected for installation.
    best: Arc<LoadedPort>,
    /// Constraint sources, for debugging.
    origins: BTreeSet<String>,
    requested_features: BTreeSet<String>,
    default_features: bool,
}

struct ConstraintFrame {
    spec: PackageSpec,
    deps: Vec<Dependency>,
}

/// An unevaluated dependency edge pointing at a qualified spec.
#[derive(Debug, Clone)]
struct DepSpec {
    spec: PackageSpec,
    dep: Dependency,
}

struct PlanFrame {
    action: InstallPlanAction,
    deps: Vec<DepSpec>,
}

pub(crate) struct VersionedPackageGraph<'a> {
    ports: &'a dyn PortProvider,
    baselines: &'a dyn BaselineProvider,
    overlays: &'a dyn OverlayProvider,
    vars: &'a dyn VarProvider,
    host_triplet: Triplet,
    overrides: BTreeMap<String, Version>,
    roots: Vec<DepSpec>,
    user_requested: BTreeSet<PackageSpec>,
    graph: BTreeMap<PackageSpec, PackageNodeData>,
    /// Ports that failed to load; they are not retried.
    failed_nodes: BTreeSet<String>,
    resolve_stack: Vec<ConstraintFrame>,
    errors: Vec<Diagnostic>,
}

/// Resolve `deps` (the top-level dependency list of `toplevel`) into an
/// install plan.
#[allow(clippy::too_many_arguments)]
pub(crate) fn create_versioned_install_plan(
    ports: &dyn PortProvider,
    baselines: &dyn BaselineProvider,
    overlays: &dyn OverlayProvider,
    vars: &dyn VarProvider,
    deps: &[Dependency],
    overrides: &[DependencyOverride],
    toplevel: &PackageSpec,
    host_triplet: Triplet,
    unsupported_port_action: UnsupportedPortAction,
) -> Result<ActionPlan> {
    let mut graph = VersionedPackageGraph {
        ports,
        baselines,
        overlays,
        vars,
        host_triplet,
        overrides: overrides
            .iter()
            .map(|o| (o.name.clone(), o.version.clone()))
            .collect(),
        roots: Vec::new(),
        user_requested: BTreeSet::new(),
        graph: BTreeMap::new(),
        failed_nodes: BTreeSet::new(),
        resolve_stack: Vec::new(),
        errors: Vec::new(),
    };

    graph.solve_with_roots(deps, toplevel);
    graph
        .finalize_extract_plan(toplevel, unsupported_port_action)
        .map_err(|mut diagnostics| {
            diagnostics.sort_by_key(|d| d.to_string());
            diagnostics.dedup();
            Error::Resolution { diagnostics }
        })
}

impl VersionedPackageGraph<'_> {
    fn qualify(&self, dep: &Dependency, consumer: &Triplet) -> PackageSpec {
        let triplet = if dep.host {
            self.host_triplet.clone()
        } else {
            consumer.clone()
        };
        PackageSpec::new(dep.name.clone(), triplet)
    }

    /// Phase 1 entry point: seed the stack with the top-level dependencies
    /// and drain it.
    fn solve_with_roots(&mut self, deps: &[Dependency], toplevel: &PackageSpec) {
        for dep in deps {
            if let Some(platform) = &dep.platform {
                match self
                    .vars
                    .get_or_load_dep_info_vars(toplevel, &self.host_triplet)
                {
                    Ok(vars) => {
                        if !platform.evaluate(&vars) {
                            continue;
                        }
                    }
                    Err(e) => {
                        self.errors.push(Diagnostic::Vars {
                            message: e.to_string(),
                        });
                        continue;
                    }
                }
            }
            let spec = self.qualify(dep, &toplevel.triplet);
            self.user_requested.insert(spec.clone());
            self.roots.push(DepSpec {
                spec,
                dep: dep.clone(),
            });
        }

        self.resolve_stack.push(ConstraintFrame {
            spec: toplevel.clone(),
            deps: deps.to_vec(),
        });

        while let Some(frame) = self.resolve_stack.pop() {
            self.resolve_frame(frame);
        }
    }

    /// Apply one frame's dependency edges to the graph.
    fn resolve_frame(&mut self, frame: ConstraintFrame) {
        for dep in &frame.deps {
            if let Some(platform) = &dep.platform {
                match self.batch_load_vars(&frame.spec) {
                    Ok(vars) => {
                        if !platform.evaluate(&vars) {
                            continue;
                        }
                    }
                    Err(message) => {
                        self.errors.push(Diagnostic::Vars { message });
                        continue;
                    }
                }
            }

            let dep_spec = self.qualify(dep, &frame.spec.triplet);
            if !self.require_package(&dep_spec, &frame.spec.name) {
                continue;
            }

            // Pinned nodes ignore version constraints.
            let Some((pinned, best_version, baseline)) = self.graph.get(&dep_spec).map(|node| {
                (
                    node.overlay_or_override,
                    node.best.manifest.schemed_version(),
                    node.baseline.clone(),
                )
            }) else {
                continue;
            };
            if !pinned {
                if let Some(minimum) = &dep.minimum_version {
                    match self.ports.load_port(&dep_spec.name, minimum) {
                        Ok(constraint_port) => {
                            let constraint_version = constraint_port.manifest.schemed_version();
                            if compare(&best_version, &constraint_version) == VersionComp::Lt {
                                // Promote to the constraint's version and
                                // apply its constraints.
                                if let Some(node) = self.graph.get_mut(&dep_spec) {
                                    node.best = constraint_port.clone();
                                }
                                self.require_loaded_port(
                                    &dep_spec,
                                    constraint_port,
                                    &frame.spec.name,
                                );
                            } else if baseline
                                .map(|b| compare(&b, &constraint_version) == VersionComp::Lt)
                                .unwrap_or(false)
                            {
                                // The constraint postdates the baseline, so
                                // its constraints apply, but the selected
                                // version stays.
                                self.require_loaded_port(
                                    &dep_spec,
                                    constraint_port,
                                    &frame.spec.name,
                                );
                            }
                        }
                        Err(e) => {
                            self.errors.push(Diagnostic::ConstraintUnsatisfiable {
                                spec: dep_spec.clone(),
                                version: minimum.clone(),
                                origin: frame.spec.name.clone(),
                                message: e.to_string(),
                            });
                        }
                    }
                }
            }

            for feature in &dep.features {
                self.require_port_feature(&dep_spec, feature, &frame.spec.name);
            }
            if !dep.features.iter().any(|f| f == CORE_FEATURE) {
                self.require_port_defaults(&dep_spec, &frame.spec.name);
            }
        }
    }

    /// Look up or create the node for `spec`. Returns false if the port
    /// could not be loaded (the failure is recorded once).
    fn require_package(&mut self, spec: &PackageSpec, origin: &str) -> bool {
        if let Some(node) = self.graph.get_mut(spec) {
            node.origins.insert(origin.to_string());
            return true;
        }
        if self.failed_nodes.contains(&spec.name) {
            return false;
        }

        let (best, baseline, pinned) = match self.overlays.find_port(&spec.name) {
            Err(e) => {
                self.errors.push(Diagnostic::Registry {
                    message: e.to_string(),
                });
                self.failed_nodes.insert(spec.name.clone());
                return false;
            }
            Ok(Some(port)) => (port, None, true),
            Ok(None) => {
                let loaded = match self.overrides.get(&spec.name) {
                    Some(version) => self
                        .ports
                        .load_port(&spec.name, version)
                        .map(|port| (port, None, true)),
                    None => self
                        .baselines
                        .baseline_version(&spec.name)
                        .and_then(|version| self.ports.load_port(&spec.name, &version))
                        .map(|port| {
                            let baseline = port.manifest.schemed_version();
                            (port, Some(baseline), false)
                        }),
                };
                match loaded {
                    Ok(found) => found,
                    Err(e) => {
                        self.errors.push(Diagnostic::Registry {
                            message: e.to_string(),
                        });
                        self.failed_nodes.insert(spec.name.clone());
                        return false;
                    }
                }
            }
        };

        let mut requested_features = BTreeSet::new();
        requested_features.insert(CORE_FEATURE.to_string());
        self.graph.insert(
            spec.clone(),
            PackageNodeData {
                considered: Vec::new(),
                baseline,
                overlay_or_override: pinned,
                best: best.clone(),
                origins: BTreeSet::new(),
                requested_features,
                // Implicit defaults are disabled if the spec was mentioned at
                // top level; a top-level mention without `core` re-engages
                // them through require_port_defaults.
                default_features: !self.user_requested.contains(spec),
            },
        );
        self.require_loaded_port(spec, best, origin);
        true
    }

    /// Apply the constraints of one version of a port: its core dependency
    /// list plus the dependency lists of every feature requested so far.
    fn require_loaded_port(&mut self, spec: &PackageSpec, port: Arc<LoadedPort>, origin: &str) {
        let features = {
            let Some(node) = self.graph.get_mut(spec) else {
                return;
            };
            node.origins.insert(origin.to_string());
            if node.considered.iter().any(|p| Arc::ptr_eq(p, &port)) {
                return;
            }
            node.considered.push(port.clone());

            let mut features = node.requested_features.clone();
            if node.default_features {
                features.extend(port.manifest.default_features.iter().cloned());
            }
            features
        };

        self.resolve_stack.push(ConstraintFrame {
            spec: spec.clone(),
            deps: port.manifest.dependencies.clone(),
        });
        for feature in features {
            if feature == CORE_FEATURE {
                continue;
            }
            if let Some(deps) = port.manifest.find_dependencies_for_feature(&feature) {
                self.resolve_stack.push(ConstraintFrame {
                    spec: spec.clone(),
                    deps: deps.to_vec(),
                });
            }
        }
    }

    /// Engage a port's default features (idempotent).
    fn require_port_defaults(&mut self, spec: &PackageSpec, origin: &str) {
        let considered = {
            let Some(node) = self.graph.get_mut(spec) else {
                return;
            };
            node.origins.insert(origin.to_string());
            if node.default_features {
                return;
            }
            node.default_features = true;
            node.considered.clone()
        };
        for port in considered {
            for feature in port.manifest.default_features.clone() {
                if let Some(deps) = port.manifest.find_dependencies_for_feature(&feature) {
                    self.resolve_stack.push(ConstraintFrame {
                        spec: spec.clone(),
                        deps: deps.to_vec(),
                    });
                }
            }
        }
    }

    /// Request one feature of a port. `default` engages the defaults; `*`
    /// requests every feature any considered version declares.
    fn require_port_feature(&mut self, spec: &PackageSpec, feature: &str, origin: &str) {
        if feature == DEFAULT_FEATURES {
            return self.require_port_defaults(spec, origin);
        }
        if feature == "*" {
            let all: Vec<String> = match self.graph.get(spec) {
                Some(node) => node
                    .considered
                    .iter()
                    .flat_map(|port| port.manifest.features.iter().map(|f| f.name.clone()))
                    .collect(),
                None => return,
            };
            for name in all {
                self.require_port_feature(spec, &name, origin);
            }
            return;
        }

        let considered = {
            let Some(node) = self.graph.get_mut(spec) else {
                return;
            };
            node.origins.insert(origin.to_string());
            if !node.requested_features.insert(feature.to_string()) {
                return;
            }
            node.considered.clone()
        };
        for port in considered {
            if let Some(deps) = port.manifest.find_dependencies_for_feature(feature) {
                self.resolve_stack.push(ConstraintFrame {
                    spec: spec.clone(),
                    deps: deps.to_vec(),
                });
            }
        }
    }

    /// Variable lookup with look-ahead batching: on a miss, every spec
    /// reachable from the remaining stack frames is loaded in one call.
    fn batch_load_vars(
        &self,
        spec: &PackageSpec,
    ) -> std::result::Result<Arc<BTreeMap<String, String>>, String> {
        if let Some(vars) = self.vars.dep_info_vars(spec) {
            return Ok(vars);
        }

        let mut spec_set: BTreeSet<PackageSpec> = BTreeSet::new();
        spec_set.insert(spec.clone());
        for frame in &self.resolve_stack {
            spec_set.insert(frame.spec.clone());
            for dep in &frame.deps {
                spec_set.insert(self.qualify(dep, &frame.spec.triplet));
            }
        }
        let specs: Vec<PackageSpec> = spec_set.into_iter().collect();
        self.vars
            .load_dep_info_vars(&specs, &self.host_triplet)
            .map_err(|e| e.to_string())?;
        self.vars
            .get_or_load_dep_info_vars(spec, &self.host_triplet)
            .map_err(|e| e.to_string())
    }

    /// Phase 2: serialize the final execution graph and run the remaining
    /// validations.
    fn finalize_extract_plan(
        mut self,
        toplevel: &PackageSpec,
        unsupported_port_action: UnsupportedPortAction,
    ) -> std::result::Result<ActionPlan, Vec<Diagnostic>> {
        if !self.errors.is_empty() {
            return Err(std::mem::take(&mut self.errors));
        }

        let mut plan = ActionPlan::default();
        // false means "in progress".
        let mut emitted: BTreeMap<PackageSpec, bool> = BTreeMap::new();
        let mut stack: Vec<PlanFrame> = Vec::new();

        let roots = std::mem::take(&mut self.roots);
        for root in &roots {
            self.visit(&mut emitted, &mut stack, root, &toplevel.name)
                .map_err(|d| vec![d])?;

            loop {
                let popped = match stack.last_mut() {
                    None => break,
                    Some(frame) => frame.deps.pop(),
                };
                match popped {
                    Some(dep) => {
                        let origin = stack
                            .last()
                            .map(|frame| {
                                format!(
                                    "{}@{}",
                                    frame.action.spec,
                                    frame.action.port.manifest.to_version()
                                )
                            })
                            .unwrap_or_else(|| toplevel.name.clone());
                        self.visit(&mut emitted, &mut stack, &dep, &origin)
                            .map_err(|d| vec![d])?;
                    }
                    None => {
                        if let Some(frame) = stack.pop() {
                            emitted.insert(frame.action.spec.clone(), true);
                            plan.install_actions.push(frame.action);
                        }
                    }
                }
            }
        }

        // Supports expressions are commonplace, so load dep info for the
        // whole plan in one batch.
        let plan_specs: Vec<PackageSpec> = plan
            .install_actions
            .iter()
            .map(|action| action.spec.clone())
            .collect();
        self.vars
            .load_dep_info_vars(&plan_specs, &self.host_triplet)
            .map_err(|e| {
                vec![Diagnostic::Vars {
                    message: e.to_string(),
                }]
            })?;

        for action in &plan.install_actions {
            let vars = self
                .vars
                .get_or_load_dep_info_vars(&action.spec, &self.host_triplet)
                .map_err(|e| {
                    vec![Diagnostic::Vars {
                        message: e.to_string(),
                    }]
                })?;

            if let Some(supports) = &action.port.manifest.supports {
                if !supports.evaluate(&vars) {
                    plan.unsupported_features
                        .push((FeatureSpec::core(action.spec.clone()), supports.to_string()));
                }
            }
            for feature in action.feature_dependencies.keys() {
                if feature == CORE_FEATURE {
                    continue;
                }
                if let Some(found) = action.port.manifest.find_feature(feature) {
                    if let Some(supports) = &found.supports {
                        if !supports.evaluate(&vars) {
                            plan.unsupported_features.push((
                                FeatureSpec::new(action.spec.clone(), feature.clone()),
                                supports.to_string(),
                            ));
                        }
                    }
                }
            }
        }

        if unsupported_port_action == UnsupportedPortAction::Error
            && !plan.unsupported_features.is_empty()
        {
            return Err(vec![Diagnostic::UnsupportedFeatures {
                items: plan.unsupported_features.clone(),
            }]);
        }

        Ok(plan)
    }

    /// Validate one dependency edge and, if its target has not been emitted
    /// yet, open a plan frame for it.
    fn visit(
        &self,
        emitted: &mut BTreeMap<PackageSpec, bool>,
        stack: &mut Vec<PlanFrame>,
        dep: &DepSpec,
        origin: &str,
    ) -> std::result::Result<(), Diagnostic> {
        let node = self.graph.get(&dep.spec).ok_or_else(|| Diagnostic::Internal {
            message: format!("no resolution recorded for {}", dep.spec),
        })?;

        // Re-validate the version constraint against the selected version.
        if !node.overlay_or_override {
            if let Some(minimum) = &dep.dep.minimum_version {
                let constraint_port = self
                    .ports
                    .load_port(&dep.spec.name, minimum)
                    .map_err(|e| Diagnostic::ConstraintUnsatisfiable {
                        spec: dep.spec.clone(),
                        version: minimum.clone(),
                        origin: origin.to_string(),
                        message: e.to_string(),
                    })?;
                let constraint_version = constraint_port.manifest.schemed_version();
                let selected_version = node.best.manifest.schemed_version();
                match compare(&selected_version, &constraint_version) {
                    VersionComp::Unknown => {
                        // Report the baseline rather than the selected
                        // version; it is the simpler value to act on.
                        return Err(Diagnostic::VersionIncomparable {
                            spec: dep.spec.clone(),
                            origin: origin.to_string(),
                            baseline: node.baseline.clone().unwrap_or(selected_version),
                            target: constraint_version,
                        });
                    }
                    VersionComp::Lt => {
                        return Err(Diagnostic::Internal {
                            message: format!(
                                "constraint {}>={} was not considered during resolution",
                                dep.spec, minimum
                            ),
                        });
                    }
                    VersionComp::Eq | VersionComp::Gt => {}
                }
            }
        }

        // Every named feature must exist in the selected version.
        for feature in &dep.dep.features {
            if feature == CORE_FEATURE || feature == DEFAULT_FEATURES || feature == "*" {
                continue;
            }
            if node.best.manifest.find_feature(feature).is_none() {
                return Err(Diagnostic::MissingFeature {
                    spec: dep.spec.clone(),
                    version: node.best.manifest.to_version(),
                    feature: feature.clone(),
                    origin: origin.to_string(),
                });
            }
        }

        match emitted.entry(dep.spec.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(false);
                trace!(
                    "emitting {} (constrained by: {})",
                    dep.spec,
                    node.origins
                        .iter()
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                let (feature_dependencies, deps) =
                    self.compute_feature_dependencies(&dep.spec, node)?;
                let request_type = if self.user_requested.contains(&dep.spec) {
                    RequestType::User
                } else {
                    RequestType::Auto
                };
                stack.push(PlanFrame {
                    action: InstallPlanAction {
                        spec: dep.spec.clone(),
                        port: node.best.clone(),
                        request_type,
                        feature_dependencies,
                        abi: None,
                    },
                    deps,
                });
                Ok(())
            }
            Entry::Occupied(occupied) => {
                if *occupied.get() {
                    Ok(())
                } else {
                    Err(Diagnostic::CycleDetected {
                        spec: dep.spec.clone(),
                        stack: stack
                            .iter()
                            .map(|frame| {
                                format!(
                                    "{}@{}",
                                    frame.action.spec,
                                    frame.action.port.manifest.to_version()
                                )
                            })
                            .collect(),
                    })
                }
            }
        }
    }

    /// For each selected feature of `node` (and `core`), the feature specs
    /// it depends on, plus the outgoing edges for the postfix walk. Feature
    /// references back into the same port only contribute an edge when they
    /// are a bare self-dependency, which the walk then reports as a cycle.
    fn compute_feature_dependencies(
        &self,
        spec: &PackageSpec,
        node: &PackageNodeData,
    ) -> std::result::Result<(BTreeMap<String, Vec<FeatureSpec>>, Vec<DepSpec>), Diagnostic> {
        let mut all_features = node.requested_features.clone();
        if node.default_features {
            all_features.extend(node.best.manifest.default_features.iter().cloned());
        }

        let mut feature_deps = BTreeMap::new();
        let mut out_deps = Vec::new();
        for feature in &all_features {
            let Some(deps) = node.best.manifest.find_dependencies_for_feature(feature) else {
                continue;
            };
            let mut fspecs = Vec::new();
            for dep in deps {
                let fspec = self.qualify(dep, &spec.triplet);
                if &fspec == spec {
                    if dep.features.is_empty() {
                        // A bare self-dependency is a genuine 1-cycle.
                        out_deps.push(DepSpec {
                            spec: fspec,
                            dep: dep.clone(),
                        });
                    }
                    continue;
                }
                if let Some(platform) = &dep.platform {
                    let vars = self
                        .vars
                        .get_or_load_dep_info_vars(spec, &self.host_triplet)
                        .map_err(|e| Diagnostic::Vars {
                            message: e.to_string(),
                        })?;
                    if !platform.evaluate(&vars) {
                        continue;
                    }
                }
                fspecs.push(FeatureSpec::core(fspec.clone()));
                for named in &dep.features {
                    if named == DEFAULT_FEATURES || named == "*" {
                        continue;
                    }
                    fspecs.push(FeatureSpec::new(fspec.clone(), named.clone()));
                }
                out_deps.push(DepSpec {
                    spec: fspec,
                    dep: dep.clone(),
                });
            }
            fspecs.sort();
            fspecs.dedup();
            feature_deps.insert(feature.clone(), fspecs);
        }
        Ok((feature_deps, out_deps))
    }
}
