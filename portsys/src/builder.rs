/*!
Execution of a hashed install plan.

Each action is tried against the binary cache first; on a miss the external
builder command runs with an explicit working directory and a controlled
environment, and a successful build is pushed back to the write providers.
A build failure either stops the run or, with `keep_going`, poisons every
action downstream of the failure. The summary records what happened to each
action and how long it took.
*/

use crate::cache::engine::BinaryCache;
use crate::cache::provider::CacheRequest;
use crate::common::{self, exec_log};
use crate::resolver::{ActionPlan, InstallPlanAction};
use crate::sbom;
use crate::spec::{PackageSpec, Triplet};
use crate::version::Version;
use log::{debug, info, warn};
use snafu::{OptionExt, ResultExt, Snafu};
use std::collections::BTreeSet;
use std::fmt::{self, Display};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub(crate) enum Error {
    #[snafu(display("{spec} has no ABI; the plan was not hashed"))]
    MissingAbi { spec: PackageSpec },

    #[snafu(display("the builder command is empty"))]
    EmptyBuilderCommand,

    #[snafu(display("Unable to prepare install directory {}: {source}", path.display()))]
    InstallDirPrepare {
        path: PathBuf,
        source: std::io::Error,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// Requested between actions; the planner finishes the current action and
/// marks the rest of the plan excluded.
#[derive(Debug, Clone, Default)]
pub(crate) struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ActionStatus {
    /// Restored from the binary cache.
    CacheHit,
    /// Built by the external builder.
    Built,
    /// The builder returned non-zero.
    Failed,
    /// A dependency failed; this action was never attempted.
    Cascaded,
    /// Skipped: already installed with the same ABI, or cancelled.
    Excluded,
}

impl Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ActionStatus::CacheHit => "cache hit",
            ActionStatus::Built => "built",
            ActionStatus::Failed => "failed",
            ActionStatus::Cascaded => "cascaded",
            ActionStatus::Excluded => "excluded",
        })
    }
}

#[derive(Debug)]
pub(crate) struct ActionResult {
    pub(crate) spec: PackageSpec,
    pub(crate) version: Version,
    pub(crate) abi: String,
    pub(crate) status: ActionStatus,
    pub(crate) elapsed: Duration,
}

#[derive(Debug, Default)]
pub(crate) struct BuildSummary {
    pub(crate) results: Vec<ActionResult>,
}

impl BuildSummary {
    pub(crate) fn all_succeeded(&self) -> bool {
        self.results
            .iter()
            .all(|r| !matches!(r.status, ActionStatus::Failed | ActionStatus::Cascaded))
    }
}

impl Display for BuildSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for result in &self.results {
            writeln!(
                f,
                "  {}@{}: {} in {:.1}s ({})",
                result.spec,
                result.version,
                result.status,
                result.elapsed.as_secs_f64(),
                &result.abi[..16.min(result.abi.len())],
            )?;
        }
        Ok(())
    }
}

/// How to invoke the external builder and where artifacts land.
#[derive(Debug, Clone)]
pub(crate) struct BuilderConfig {
    /// The builder argv. `{port}`, `{version}`, `{triplet}`, `{features}`,
    /// `{abi}`, `{src}`, and `{dst}` are substituted into each element.
    pub(crate) command: Vec<String>,
    /// Environment variables forwarded from our own environment; everything
    /// else is scrubbed.
    pub(crate) env_whitelist: Vec<String>,
    /// Root of the installed trees: `{root}/{triplet}/{port}`.
    pub(crate) installed_root: PathBuf,
    pub(crate) host_triplet: Triplet,
}

const ABI_MARKER: &str = ".portsys-abi";

pub(crate) struct PlanExecutor<'a> {
    engine: &'a BinaryCache,
    config: BuilderConfig,
    keep_going: bool,
    cancel: CancellationToken,
}

impl<'a> PlanExecutor<'a> {
    pub(crate) fn new(
        engine: &'a BinaryCache,
        config: BuilderConfig,
        keep_going: bool,
        cancel: CancellationToken,
    ) -> Result<Self> {
        snafu::ensure!(!config.command.is_empty(), EmptyBuilderCommandSnafu);
        Ok(Self {
            engine,
            config,
            keep_going,
            cancel,
        })
    }

    /// Drive every action of a hashed plan in order.
    pub(crate) async fn execute(&self, plan: &ActionPlan) -> Result<BuildSummary> {
        let requests = plan
            .install_actions
            .iter()
            .map(|action| {
                let abi = action
                    .abi
                    .as_ref()
                    .context(MissingAbiSnafu {
                        spec: action.spec.clone(),
                    })?;
                Ok(CacheRequest::new(
                    &action.spec,
                    action.version().to_string(),
                    abi.package_abi.clone(),
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        let availability = self.engine.precheck(&requests).await;
        for (request, available) in requests.iter().zip(&availability) {
            debug!(
                "{}: {}",
                request.key,
                match available {
                    Some(_) => "available in cache",
                    None => "not present in cache",
                }
            );
        }

        let mut summary = BuildSummary::default();
        let mut poisoned: BTreeSet<PackageSpec> = BTreeSet::new();
        let mut stop = false;

        for ((action, request), available) in plan
            .install_actions
            .iter()
            .zip(&requests)
            .zip(&availability)
        {
            let start = Instant::now();
            let record = |status: ActionStatus| ActionResult {
                spec: action.spec.clone(),
                version: action.version(),
                abi: request.key.clone(),
                status,
                elapsed: start.elapsed(),
            };

            if stop || self.cancel.is_cancelled() {
                summary.results.push(record(ActionStatus::Excluded));
                continue;
            }

            if action
                .dependency_specs()
                .iter()
                .any(|dependency| poisoned.contains(dependency))
            {
                poisoned.insert(action.spec.clone());
                summary.results.push(record(ActionStatus::Cascaded));
                continue;
            }

            let install_dir = self
                .config
                .installed_root
                .join(action.spec.triplet.as_str())
                .join(&action.spec.name);

            // Already installed at this exact ABI: nothing to do. A stale
            // tree is removed before the action runs.
            match installed_abi(&install_dir) {
                Some(existing) if existing == request.key => {
                    info!("{} is already installed", action.spec);
                    summary.results.push(record(ActionStatus::Excluded));
                    continue;
                }
                Some(_) => {
                    tokio::fs::remove_dir_all(&install_dir)
                        .await
                        .context(InstallDirPrepareSnafu { path: &install_dir })?;
                }
                None => {}
            }

            if available.is_some()
                && self
                    .engine
                    .fetch(request, &install_dir, &self.config.installed_root)
                    .await
            {
                write_abi_marker(&install_dir, &request.key);
                info!("Restored {} from the binary cache", action.spec);
                summary.results.push(record(ActionStatus::CacheHit));
                continue;
            }

            if let Some(abi) = &action.abi {
                debug!("ABI inputs for {}:\n{}", action.spec, abi.summary);
            }
            match self.build_action(action, request, &install_dir).await {
                Ok(()) => {
                    if let Err(e) = write_control_file(action, request, &install_dir) {
                        warn!("unable to write control file for {}: {e}", action.spec);
                    }
                    if let Err(e) = sbom::write_sbom(action, &install_dir) {
                        warn!("unable to write SBOM for {}: {e}", action.spec);
                    }
                    self.engine
                        .store(request, &install_dir, &self.config.installed_root)
                        .await;
                    write_abi_marker(&install_dir, &request.key);
                    summary.results.push(record(ActionStatus::Built));
                }
                Err(e) => {
                    warn!("build of {} failed: {e}", action.spec);
                    poisoned.insert(action.spec.clone());
                    summary.results.push(record(ActionStatus::Failed));
                    if !self.keep_going {
                        stop = true;
                    }
                }
            }
        }

        Ok(summary)
    }

    /// Run the external builder for one action.
    async fn build_action(
        &self,
        action: &InstallPlanAction,
        request: &CacheRequest,
        install_dir: &std::path::Path,
    ) -> std::result::Result<(), BuildFailure> {
        tokio::fs::create_dir_all(install_dir)
            .await
            .map_err(|source| BuildFailure::Prepare {
                path: install_dir.to_path_buf(),
                source,
            })?;

        let substitute = |arg: &String| {
            arg.replace("{port}", &action.spec.name)
                .replace("{version}", &request.version)
                .replace("{triplet}", request.triplet.as_str())
                .replace("{features}", &action.feature_list().join(";"))
                .replace("{abi}", &request.key)
                .replace("{src}", &action.port.port_dir.display().to_string())
                .replace("{dst}", &install_dir.display().to_string())
        };
        let argv: Vec<String> = self.config.command.iter().map(substitute).collect();

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        // The builder never inherits our environment or working directory;
        // both are explicit.
        cmd.env_clear();
        for name in &self.config.env_whitelist {
            if let Some(value) = std::env::var_os(name) {
                cmd.env(name, value);
            }
        }
        cmd.env("PORT", &action.spec.name)
            .env("VERSION", &request.version)
            .env("TRIPLET", request.triplet.as_str())
            .env("HOST_TRIPLET", self.config.host_triplet.as_str())
            .env("FEATURES", action.feature_list().join(";"))
            .env("ABI", &request.key)
            .env("SRC_DIR", &action.port.port_dir)
            .env("INSTALL_DIR", install_dir);
        cmd.current_dir(&action.port.port_dir);

        exec_log(&mut cmd)
            .await
            .map_err(|source| BuildFailure::Builder { source })
    }
}

/// Why a single build did not produce an installed tree.
#[derive(Debug, Snafu)]
enum BuildFailure {
    #[snafu(display("unable to create {}: {source}", path.display()))]
    Prepare {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("{source}"))]
    Builder { source: common::Error },
}

/// The sidecar control file that travels inside every binary artifact. It
/// names what the archive contains, so a cache object is self-describing.
fn write_control_file(
    action: &InstallPlanAction,
    request: &CacheRequest,
    install_dir: &std::path::Path,
) -> std::io::Result<()> {
    let dir = install_dir.join("share").join(&action.spec.name);
    std::fs::create_dir_all(&dir)?;
    let mut control = String::new();
    control.push_str(&format!("name = {:?}\n", action.spec.name));
    control.push_str(&format!("version = {:?}\n", request.version));
    control.push_str(&format!("triplet = {:?}\n", request.triplet));
    let features: Vec<String> = action
        .feature_list()
        .iter()
        .map(|f| format!("{f:?}"))
        .collect();
    control.push_str(&format!("features = [{}]\n", features.join(", ")));
    control.push_str(&format!("abi = {:?}\n", request.key));
    std::fs::write(dir.join("control.toml"), control)
}

fn installed_abi(install_dir: &std::path::Path) -> Option<String> {
    std::fs::read_to_string(install_dir.join(ABI_MARKER))
        .ok()
        .map(|s| s.trim().to_string())
}

fn write_abi_marker(install_dir: &std::path::Path, abi: &str) {
    if let Err(e) = std::fs::write(install_dir.join(ABI_MARKER), abi) {
        warn!(
            "unable to record installed ABI in {}: {e}",
            install_dir.display()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::AbiInfo;
    use crate::cache::config::{CacheAccess, ConfiguredProvider, ProviderConfig};
    use crate::cache::LockBehavior;
    use crate::common::Redactor;
    use crate::manifest::{LoadedPort, PortManifest};
    use crate::resolver::RequestType;
    use crate::spec::FeatureSpec;
    use crate::test::fake_zip_tool;
    use std::collections::BTreeMap;
    use std::path::Path;

    fn abi(key: &str) -> AbiInfo {
        AbiInfo {
            entries: Vec::new(),
            summary: String::new(),
            package_abi: key.to_string(),
        }
    }

    fn action(name: &str, abi_key: &str, deps: &[&str], work: &Path) -> InstallPlanAction {
        let port_dir = work.join("ports").join(name);
        std::fs::create_dir_all(&port_dir).unwrap();
        let manifest =
            PortManifest::from_toml(&format!("name = \"{name}\"\nversion = \"1.0\"\n")).unwrap();
        let mut feature_dependencies = BTreeMap::new();
        feature_dependencies.insert(
            "core".to_string(),
            deps.iter()
                .map(|dep| FeatureSpec::core(PackageSpec::new(*dep, Triplet::from("x64-linux"))))
                .collect(),
        );
        InstallPlanAction {
            spec: PackageSpec::new(name, Triplet::from("x64-linux")),
            port: LoadedPort::new(manifest, port_dir),
            request_type: RequestType::User,
            feature_dependencies,
            abi: Some(abi(abi_key)),
        }
    }

    fn engine_with(providers: Vec<(ProviderConfig, CacheAccess)>, work: &Path) -> BinaryCache {
        BinaryCache::new(
            providers
                .into_iter()
                .map(|(config, access)| ConfiguredProvider { config, access })
                .collect(),
            fake_zip_tool(work),
            Redactor::new(),
            2,
            Duration::from_secs(5),
            LockBehavior::WarnAndContinue,
        )
        .unwrap()
    }

    fn executor<'a>(
        engine: &'a BinaryCache,
        command: &[&str],
        keep_going: bool,
        work: &Path,
    ) -> PlanExecutor<'a> {
        PlanExecutor::new(
            engine,
            BuilderConfig {
                command: command.iter().map(|s| s.to_string()).collect(),
                env_whitelist: vec!["PATH".to_string()],
                installed_root: work.join("installed"),
                host_triplet: Triplet::from("x64-linux"),
            },
            keep_going,
            CancellationToken::new(),
        )
        .unwrap()
    }

    fn statuses(summary: &BuildSummary) -> Vec<ActionStatus> {
        summary.results.iter().map(|r| r.status).collect()
    }

    #[tokio::test]
    async fn cache_hit_skips_build_and_store() {
        let work = tempfile::tempdir().unwrap();
        let read_root = work.path().join("read-cache");
        let write_root = work.path().join("write-cache");

        // Seed the read cache with an artifact under the action's ABI.
        let seed_engine = engine_with(
            vec![(
                ProviderConfig::Files {
                    root: read_root.clone(),
                },
                CacheAccess::ReadWrite,
            )],
            work.path(),
        );
        let built = work.path().join("prebuilt");
        std::fs::create_dir_all(&built).unwrap();
        std::fs::write(built.join("payload"), "cached bits").unwrap();
        let request = CacheRequest::new(
            &PackageSpec::new("zlib", Triplet::from("x64-linux")),
            "1.0",
            "feedc0de",
        );
        seed_engine.store(&request, &built, work.path()).await;

        let engine = engine_with(
            vec![
                (
                    ProviderConfig::Files {
                        root: read_root.clone(),
                    },
                    CacheAccess::Read,
                ),
                (
                    ProviderConfig::Files {
                        root: write_root.clone(),
                    },
                    CacheAccess::Write,
                ),
            ],
            work.path(),
        );
        // A builder command that would fail if it ever ran.
        let executor = executor(&engine, &["false"], false, work.path());

        let plan = ActionPlan {
            install_actions: vec![action("zlib", "feedc0de", &[], work.path())],
            unsupported_features: Vec::new(),
        };
        let summary = executor.execute(&plan).await.unwrap();
        assert_eq!(statuses(&summary), vec![ActionStatus::CacheHit]);
        assert!(summary.all_succeeded());

        let installed = work.path().join("installed/x64-linux/zlib");
        assert_eq!(
            std::fs::read_to_string(installed.join("payload")).unwrap(),
            "cached bits"
        );
        // Stores only follow successful builds, never cache hits.
        assert!(!write_root.join("fe/feedc0de.zip").exists());
    }

    #[tokio::test]
    async fn build_success_stores_and_writes_sbom() {
        let work = tempfile::tempdir().unwrap();
        let cache_root = work.path().join("cache");
        let engine = engine_with(
            vec![(
                ProviderConfig::Files {
                    root: cache_root.clone(),
                },
                CacheAccess::ReadWrite,
            )],
            work.path(),
        );
        let executor = executor(
            &engine,
            &["sh", "-c", "echo lib > \"$INSTALL_DIR/out.txt\""],
            false,
            work.path(),
        );

        let plan = ActionPlan {
            install_actions: vec![action("zlib", "0ddba11c", &[], work.path())],
            unsupported_features: Vec::new(),
        };
        let summary = executor.execute(&plan).await.unwrap();
        assert_eq!(statuses(&summary), vec![ActionStatus::Built]);

        let installed = work.path().join("installed/x64-linux/zlib");
        assert!(installed.join("out.txt").is_file());
        assert!(installed.join("share/zlib/sbom.spdx.json").is_file());
        let control = std::fs::read_to_string(installed.join("share/zlib/control.toml")).unwrap();
        assert!(control.contains("abi = \"0ddba11c\""));
        assert!(control.contains("triplet = \"x64-linux\""));
        assert!(cache_root.join("0d/0ddba11c.zip").is_file());

        // A second run sees the recorded ABI and does nothing.
        let summary = executor.execute(&plan).await.unwrap();
        assert_eq!(statuses(&summary), vec![ActionStatus::Excluded]);
    }

    #[tokio::test]
    async fn failure_cascades_with_keep_going() {
        let work = tempfile::tempdir().unwrap();
        let engine = engine_with(Vec::new(), work.path());
        let executor = executor(&engine, &["false"], true, work.path());

        let plan = ActionPlan {
            install_actions: vec![
                action("x", "aaaa1111", &[], work.path()),
                action("y", "bbbb2222", &["x"], work.path()),
                action("z", "cccc3333", &["y"], work.path()),
            ],
            unsupported_features: Vec::new(),
        };
        let summary = executor.execute(&plan).await.unwrap();
        assert_eq!(
            statuses(&summary),
            vec![
                ActionStatus::Failed,
                ActionStatus::Cascaded,
                ActionStatus::Cascaded,
            ]
        );
        assert!(!summary.all_succeeded());
    }

    #[tokio::test]
    async fn failure_stops_immediately_without_keep_going() {
        let work = tempfile::tempdir().unwrap();
        let engine = engine_with(Vec::new(), work.path());
        let executor = executor(&engine, &["false"], false, work.path());

        let plan = ActionPlan {
            install_actions: vec![
                action("x", "aaaa1111", &[], work.path()),
                action("standalone", "dddd4444", &[], work.path()),
            ],
            unsupported_features: Vec::new(),
        };
        let summary = executor.execute(&plan).await.unwrap();
        assert_eq!(
            statuses(&summary),
            vec![ActionStatus::Failed, ActionStatus::Excluded]
        );
    }

    #[tokio::test]
    async fn cancellation_excludes_remaining_actions() {
        let work = tempfile::tempdir().unwrap();
        let engine = engine_with(Vec::new(), work.path());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let executor = PlanExecutor::new(
            &engine,
            BuilderConfig {
                command: vec!["false".to_string()],
                env_whitelist: Vec::new(),
                installed_root: work.path().join("installed"),
                host_triplet: Triplet::from("x64-linux"),
            },
            true,
            cancel,
        )
        .unwrap();

        let plan = ActionPlan {
            install_actions: vec![action("x", "aaaa1111", &[], work.path())],
            unsupported_features: Vec::new(),
        };
        let summary = executor.execute(&plan).await.unwrap();
        assert_eq!(statuses(&summary), vec![ActionStatus::Excluded]);
    }

    #[tokio::test]
    async fn unhashed_plan_is_rejected() {
        let work = tempfile::tempdir().unwrap();
        let engine = engine_with(Vec::new(), work.path());
        let executor = executor(&engine, &["false"], false, work.path());

        let mut unhashed = action("x", "aaaa1111", &[], work.path());
        unhashed.abi = None;
        let plan = ActionPlan {
            install_actions: vec![unhashed],
            unsupported_features: Vec::new(),
        };
        assert!(matches!(
            executor.execute(&plan).await.unwrap_err(),
            Error::MissingAbi { .. }
        ));
    }
}
