use crate::abi::AbiHasher;
use crate::builder::{BuilderConfig, CancellationToken, PlanExecutor};
use crate::cache::config::parse_binary_sources;
use crate::cache::engine::BinaryCache;
use crate::cache::LockBehavior;
use crate::common::Redactor;
use crate::config::{Configuration, RegistryConfig, KIND_ARTIFACT, KIND_BUILTIN, KIND_FILESYSTEM, KIND_GIT};
use crate::manifest::PortManifest;
use crate::registry::git::{BuiltinRegistry, GitCli, GitRegistry};
use crate::registry::{filesystem::FilesystemRegistry, NamedRegistry, Registry, RegistrySet};
use crate::registry::overlay::OverlaySet;
use crate::resolver::{
    create_versioned_install_plan, DependencyOverride, RequestType, UnsupportedPortAction,
};
use crate::spec::{PackageSpec, Triplet};
use crate::tools::ToolRegistry;
use crate::triplet::{TripletDatabase, TripletVarProvider};
use anyhow::{bail, ensure, Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "portsys.json";
const MANIFEST_FILE: &str = "port.toml";

/// Resolve, restore or build, and install the project's dependencies.
#[derive(Debug, Parser)]
pub(crate) struct Install {
    /// The directory holding the project's port.toml (and portsys.json).
    /// Defaults to the current directory.
    #[arg(long, env = "PORTSYS_PROJECT_DIR")]
    pub(crate) project_dir: Option<PathBuf>,

    /// The target triplet to build for.
    #[arg(long, env = "PORTSYS_TRIPLET")]
    pub(crate) triplet: String,

    /// The triplet used for build-time (host) dependencies. Defaults to the
    /// target triplet.
    #[arg(long, env = "PORTSYS_HOST_TRIPLET")]
    pub(crate) host_triplet: Option<String>,

    /// Binary cache provider configuration, e.g.
    /// `clear;files,/mnt/cache,readwrite`.
    #[arg(long, env = "PORTSYS_BINARY_SOURCES", default_value = "default")]
    pub(crate) binary_sources: String,

    /// Root directory for caches (registries, archives). Defaults to
    /// `$HOME/.cache/portsys`.
    #[arg(long, env = "PORTSYS_CACHE_ROOT")]
    pub(crate) cache_root: Option<PathBuf>,

    /// Upper bound on parallel cache operations.
    #[arg(long, env = "PORTSYS_MAX_CONCURRENCY", default_value_t = 8)]
    pub(crate) concurrency: usize,

    /// Per-request timeout for HTTP cache providers, in seconds.
    #[arg(long, env = "PORTSYS_HTTP_TIMEOUT", default_value_t = 60)]
    pub(crate) http_timeout: u64,

    /// Keep building other ports after a failure; dependents of the failed
    /// port are skipped.
    #[arg(long)]
    pub(crate) keep_going: bool,

    /// Treat unsupported ports as warnings instead of errors.
    #[arg(long)]
    pub(crate) allow_unsupported: bool,

    /// Fail instead of continuing when the local cache lock is held
    /// elsewhere.
    #[arg(long)]
    pub(crate) strict_cache_lock: bool,

    /// Additional directories to search for triplet files, highest priority
    /// first.
    #[arg(long = "triplets-dir")]
    pub(crate) triplets_dirs: Vec<PathBuf>,

    /// Where installed trees land: `{root}/{triplet}/{port}`. Defaults to
    /// `<project-dir>/installed`.
    #[arg(long, env = "PORTSYS_INSTALLED_ROOT")]
    pub(crate) installed_root: Option<PathBuf>,

    /// Checkout backing `builtin` registries. Defaults to
    /// `<project-dir>/registry`.
    #[arg(long, env = "PORTSYS_BUILTIN_REGISTRY")]
    pub(crate) builtin_registry: Option<PathBuf>,

    /// The external tool that drives port builds; its version feeds the ABI.
    #[arg(long, env = "PORTSYS_BUILD_DRIVER", default_value = "cmake")]
    pub(crate) build_driver: String,

    /// Provider-supplied hash naming the host compiler, version, and target.
    #[arg(long, env = "PORTSYS_COMPILER_HASH")]
    pub(crate) compiler_hash: Option<String>,

    /// Helper script sourced by every port build, if the project has one.
    #[arg(long, env = "PORTSYS_PORTS_SCRIPT")]
    pub(crate) ports_script: Option<PathBuf>,

    /// Post-build validation script, if the project has one.
    #[arg(long, env = "PORTSYS_POST_BUILD_SCRIPT")]
    pub(crate) post_build_script: Option<PathBuf>,

    /// Console SDK header to fold into the ABI, on hosts that carry it.
    #[arg(long, env = "PORTSYS_CONSOLE_SDK_HEADER")]
    pub(crate) console_sdk_header: Option<PathBuf>,

    /// Environment variables forwarded to the builder.
    #[arg(long = "forward-env", default_values_t = [String::from("PATH"), String::from("HOME")])]
    pub(crate) forward_env: Vec<String>,

    /// The builder command; `{port}`, `{version}`, `{triplet}`,
    /// `{features}`, `{abi}`, `{src}`, and `{dst}` are substituted.
    #[arg(last = true, required = true)]
    pub(crate) builder: Vec<String>,
}

impl Install {
    pub(crate) async fn run(&self) -> Result<()> {
        let project_dir = self
            .project_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
            .canonicalize()
            .context("Unable to canonicalize the project directory")?;
        let manifest = PortManifest::load(project_dir.join(MANIFEST_FILE))?;
        manifest.validate_versions()?;

        let config_path = project_dir.join(CONFIG_FILE);
        let config = if config_path.is_file() {
            Configuration::load(&config_path)?
        } else {
            debug!("No {CONFIG_FILE} found; using an empty configuration");
            Configuration::default()
        };

        let cache_root = match &self.cache_root {
            Some(root) => root.clone(),
            None => home_cache_root()?,
        };

        let triplet = Triplet::new(self.triplet.clone());
        let host_triplet = self
            .host_triplet
            .clone()
            .map(Triplet::new)
            .unwrap_or_else(|| triplet.clone());
        let toplevel = PackageSpec::new(manifest.name.clone(), triplet.clone());

        // Triplet files: explicit dirs first, then configured overlays, then
        // the project's own triplets directory.
        let mut triplet_dirs = self.triplets_dirs.clone();
        triplet_dirs.extend(
            config
                .overlay_triplets
                .iter()
                .map(|dir| absolute_under(&project_dir, dir)),
        );
        triplet_dirs.push(project_dir.join("triplets"));
        let vars = TripletVarProvider::new(TripletDatabase::new(triplet_dirs));

        let registries = self.build_registries(&config, &project_dir, &cache_root)?;
        let overlays = OverlaySet::new(
            config
                .overlay_ports
                .iter()
                .map(|dir| absolute_under(&project_dir, dir))
                .collect(),
        );
        let overrides = config
            .overrides
            .iter()
            .enumerate()
            .map(|(index, o)| {
                Ok(DependencyOverride {
                    name: o.name.clone(),
                    version: o.parsed_version(&format!("/overrides/{index}/version"))?,
                })
            })
            .collect::<Result<Vec<_>, crate::config::Error>>()?;

        let policy = if self.allow_unsupported {
            UnsupportedPortAction::Warn
        } else {
            UnsupportedPortAction::Error
        };
        let mut plan = create_versioned_install_plan(
            &registries,
            &registries,
            &overlays,
            &vars,
            &manifest.dependencies,
            &overrides,
            &toplevel,
            host_triplet.clone(),
            policy,
        )?;
        for (feature_spec, expression) in &plan.unsupported_features {
            warn!("{feature_spec} is only supported on '{expression}'");
        }
        info!("Plan: {} actions", plan.install_actions.len());
        for action in &plan.install_actions {
            info!(
                "  {}@{} [{}]{}",
                action.spec,
                action.version(),
                action.feature_list().join(", "),
                match action.request_type {
                    RequestType::User => " (requested)",
                    RequestType::Auto => "",
                }
            );
        }

        // Probe the toolchain once and hash every action.
        let tools = ToolRegistry::new();
        let build_driver = tools.find(&self.build_driver)?;
        let script_runner_version = if cfg!(windows) {
            tools
                .find_optional("powershell")
                .map(|tool| tool.version.clone())
        } else {
            None
        };
        let hasher = AbiHasher::new(vars.database(), build_driver.version.clone())
            .script_runner_version(script_runner_version)
            .compiler_hash(self.compiler_hash.clone())
            .helper_scripts(self.ports_script.clone(), self.post_build_script.clone())
            .console_sdk_header(self.console_sdk_header.clone());
        hasher.annotate_plan(&mut plan)?;

        let redactor = Redactor::new();
        let providers = parse_binary_sources(&self.binary_sources, &cache_root.join("archives"))?;
        let engine = BinaryCache::new(
            providers,
            crate::archive::ZipTool::find()?,
            redactor,
            self.concurrency.min(plan.install_actions.len().max(1)),
            Duration::from_secs(self.http_timeout),
            if self.strict_cache_lock {
                LockBehavior::Fatal
            } else {
                LockBehavior::WarnAndContinue
            },
        )?;

        // Finish the action in flight, then stop; the tail of the plan is
        // reported as excluded.
        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; stopping after the current action");
                    cancel.cancel();
                }
            });
        }

        let executor = PlanExecutor::new(
            &engine,
            BuilderConfig {
                command: self.builder.clone(),
                env_whitelist: self.forward_env.clone(),
                installed_root: self
                    .installed_root
                    .clone()
                    .unwrap_or_else(|| project_dir.join("installed")),
                host_triplet,
            },
            self.keep_going,
            cancel,
        )?;
        let summary = executor.execute(&plan).await?;
        info!("Summary:\n{summary}");
        ensure!(summary.all_succeeded(), "one or more ports failed to build");
        Ok(())
    }

    fn build_registries(
        &self,
        config: &Configuration,
        project_dir: &Path,
        cache_root: &Path,
    ) -> Result<RegistrySet> {
        let mut git = None;
        let default_registry = match &config.default_registry {
            Some(declared) => Some(self.registry_from(declared, project_dir, cache_root, &mut git)?),
            None => None,
        };
        let mut named = Vec::new();
        for declared in &config.registries {
            if declared.kind == KIND_ARTIFACT {
                continue;
            }
            named.push(NamedRegistry {
                registry: self.registry_from(declared, project_dir, cache_root, &mut git)?,
                packages: declared.packages.clone(),
            });
        }
        Ok(RegistrySet::new(default_registry, named))
    }

    fn registry_from(
        &self,
        declared: &RegistryConfig,
        project_dir: &Path,
        cache_root: &Path,
        git: &mut Option<GitCli>,
    ) -> Result<Registry> {
        let mut git_cli = || -> Result<GitCli> {
            if let Some(cli) = git.as_ref() {
                return Ok(cli.clone());
            }
            let path = which::which("git").context("git is required by this registry")?;
            let cli = GitCli::new(path);
            *git = Some(cli.clone());
            Ok(cli)
        };
        Ok(match declared.kind.as_str() {
            KIND_FILESYSTEM => {
                let path = declared
                    .path
                    .as_ref()
                    .context("filesystem registry without a path")?;
                Registry::Filesystem(FilesystemRegistry::new(absolute_under(project_dir, path)))
            }
            KIND_GIT => {
                let repository = declared
                    .repository
                    .as_ref()
                    .context("git registry without a repository")?;
                let baseline = declared
                    .baseline
                    .as_ref()
                    .context("git registry without a baseline")?;
                Registry::Git(GitRegistry::new(git_cli()?, repository, baseline, cache_root)?)
            }
            KIND_BUILTIN => {
                let baseline = declared
                    .baseline
                    .as_ref()
                    .context("builtin registry without a baseline")?;
                let checkout = self
                    .builtin_registry
                    .clone()
                    .unwrap_or_else(|| project_dir.join("registry"));
                Registry::Builtin(BuiltinRegistry::new(
                    git_cli()?,
                    &checkout,
                    baseline,
                    cache_root,
                ))
            }
            other => bail!("registry kind '{other}' cannot provide ports"),
        })
    }
}

fn home_cache_root() -> Result<PathBuf> {
    let home = std::env::var_os("HOME").context(
        "no HOME in the environment; pass --cache-root or set PORTSYS_CACHE_ROOT",
    )?;
    Ok(PathBuf::from(home).join(".cache").join("portsys"))
}

fn absolute_under(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
