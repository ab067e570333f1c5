/*!
Registries backed by git history.

A `GitRegistry` mirrors a remote repository into a bare clone under the tool
cache; a `BuiltinRegistry` reads a local checkout. Both resolve manifests at a
pinned baseline commit with `git show`, and materialize full port trees on
demand by unpacking `git archive` output into a content-keyed cache directory.
A tree that is already materialized is reused without touching git.
*/

use super::error::{self, Result};
use super::{version_dir, Baseline};
use crate::manifest::{LoadedPort, PortManifest};
use crate::version::Version;
use log::debug;
use sha2::{Digest, Sha256};
use snafu::{ensure, ResultExt};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tar::Archive as TarArchive;

/// Thin wrapper around the git command line.
#[derive(Debug, Clone)]
pub(crate) struct GitCli {
    program: PathBuf,
}

impl GitCli {
    pub(crate) fn new(program: PathBuf) -> Self {
        Self { program }
    }

    fn run(&self, repo: Option<&Path>, args: &[&str], context: &str) -> Result<Vec<u8>> {
        let mut cmd = Command::new(&self.program);
        if let Some(repo) = repo {
            cmd.arg("-C").arg(repo);
        }
        cmd.args(args);
        debug!("Running: {:?}", cmd);
        let output = cmd.output().context(error::GitStartSnafu)?;
        ensure!(
            output.status.success(),
            error::GitCommandSnafu {
                operation: args.first().copied().unwrap_or("git"),
                context,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
        );
        Ok(output.stdout)
    }

    /// `git show <commit>:<path>`.
    fn show(&self, repo: &Path, commit: &str, path: &str) -> Result<String> {
        let spec = format!("{commit}:{path}");
        let bytes = self.run(Some(repo), &["show", &spec], &spec)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Unpack `git archive <commit> -- <path>` into `dest`.
    fn archive_into(&self, repo: &Path, commit: &str, path: &str, dest: &Path) -> Result<()> {
        let bytes = self.run(
            Some(repo),
            &["archive", "--format=tar", commit, "--", path],
            path,
        )?;
        std::fs::create_dir_all(dest).context(error::CacheDirCreateSnafu { path: dest })?;
        TarArchive::new(bytes.as_slice())
            .unpack(dest)
            .context(error::GitUnpackSnafu { path: dest })?;
        Ok(())
    }
}

/// Common plumbing for both git-backed registry kinds: baseline and manifest
/// reads at a pinned commit, plus the materialized-tree cache.
#[derive(Debug)]
struct GitTreeSource {
    git: GitCli,
    repo_dir: PathBuf,
    baseline_commit: String,
    trees_dir: PathBuf,
    label: String,
}

impl GitTreeSource {
    fn baseline(&self) -> Result<Baseline> {
        let text = self
            .git
            .show(&self.repo_dir, &self.baseline_commit, "baseline.toml")?;
        Baseline::from_toml(&text, &self.repo_dir.join("baseline.toml"))
    }

    fn port_path(&self, name: &str, version: &Version) -> String {
        format!("ports/{}/{}", name, version_dir(version))
    }

    /// Materialize the port tree for `(name, version)` and parse its
    /// manifest. The tree lands in a cache directory keyed by the commit and
    /// path, so repeated resolutions reuse it.
    fn load_port(&self, name: &str, version: &Version) -> Result<Arc<LoadedPort>> {
        let port_path = self.port_path(name, version);
        let manifest_path = format!("{port_path}/port.toml");
        let manifest_text = self
            .git
            .show(&self.repo_dir, &self.baseline_commit, &manifest_path)
            .map_err(|_| {
                error::VersionNotFoundSnafu {
                    name,
                    version: version.clone(),
                    registry: &self.label,
                }
                .build()
            })?;
        let manifest = PortManifest::from_toml(&manifest_text)
            .context(crate::manifest::ManifestFileLoadSnafu {
                path: PathBuf::from(&manifest_path),
            })
            .context(error::ManifestSnafu)?;

        let mut hasher = Sha256::new();
        hasher.update(self.baseline_commit.as_bytes());
        hasher.update(b"\0");
        hasher.update(port_path.as_bytes());
        let tree_key = hex::encode(hasher.finalize());
        let tree_dir = self.trees_dir.join(&tree_key[..16]);
        let port_dir = tree_dir.join(&port_path);
        if !port_dir.is_dir() {
            self.git
                .archive_into(&self.repo_dir, &self.baseline_commit, &port_path, &tree_dir)?;
        } else {
            debug!("Port tree for {port_path} already materialized");
        }

        Ok(LoadedPort::new(manifest, port_dir))
    }
}

/// A remote registry mirrored into a bare clone under the cache root.
#[derive(Debug)]
pub(crate) struct GitRegistry {
    source: GitTreeSource,
}

impl GitRegistry {
    /// Clone (or fetch) `url` into the cache and pin it at `baseline_commit`.
    pub(crate) fn new(
        git: GitCli,
        url: &str,
        baseline_commit: &str,
        cache_root: &Path,
    ) -> Result<Self> {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        let key = hex::encode(hasher.finalize());
        let repo_dir = cache_root.join("registries").join(&key[..16]);

        if repo_dir.join("HEAD").is_file() {
            // The baseline commit may postdate the mirror; fetch then.
            if git
                .run(Some(&repo_dir), &["cat-file", "-e", baseline_commit], url)
                .is_err()
            {
                git.run(Some(&repo_dir), &["fetch", "origin"], url)?;
            }
        } else {
            std::fs::create_dir_all(&repo_dir)
                .context(error::CacheDirCreateSnafu { path: &repo_dir })?;
            git.run(
                None,
                &[
                    "clone",
                    "--bare",
                    url,
                    &repo_dir.display().to_string(),
                ],
                url,
            )?;
        }

        Ok(Self {
            source: GitTreeSource {
                git,
                trees_dir: cache_root.join("registries").join("trees"),
                repo_dir,
                baseline_commit: baseline_commit.to_string(),
                label: format!("git ({url})"),
            },
        })
    }

    pub(crate) fn baseline(&self) -> Result<Baseline> {
        self.source.baseline()
    }

    pub(crate) fn load_port(&self, name: &str, version: &Version) -> Result<Arc<LoadedPort>> {
        self.source.load_port(name, version)
    }
}

/// The pinned snapshot shipped next to the tool: a local checkout read at a
/// fixed baseline commit.
#[derive(Debug)]
pub(crate) struct BuiltinRegistry {
    source: GitTreeSource,
}

impl BuiltinRegistry {
    pub(crate) fn new(
        git: GitCli,
        checkout: &Path,
        baseline_commit: &str,
        cache_root: &Path,
    ) -> Self {
        Self {
            source: GitTreeSource {
                git,
                repo_dir: checkout.to_path_buf(),
                baseline_commit: baseline_commit.to_string(),
                trees_dir: cache_root.join("registries").join("trees"),
                label: "builtin".to_string(),
            },
        }
    }

    pub(crate) fn baseline(&self) -> Result<Baseline> {
        self.source.baseline()
    }

    pub(crate) fn load_port(&self, name: &str, version: &Version) -> Result<Arc<LoadedPort>> {
        self.source.load_port(name, version)
    }
}
