/*!
The package ABI: one content hash per install action summarizing every input
that could affect its build output.

Each action gets an ordered list of `(tag, hex digest)` entries covering the
triplet file, the toolchain identity, the helper scripts, the selected
features, every file in the port tree, and the ABIs of its direct
dependencies. The entries are sorted by tag, rendered one per line, and the
digest of that buffer is the package ABI. The buffer itself is kept on the
action so a cache miss can be explained by diffing two of them.

Actions are hashed in plan order, which is topological, so a dependency's ABI
is always available before its dependents ask for it. Any input that cannot
be hashed aborts the whole plan; no partial ABIs are ever published.
*/

use crate::resolver::ActionPlan;
use crate::spec::PackageSpec;
use crate::triplet::TripletDatabase;
use sha2::{Digest, Sha256};
use snafu::{OptionExt, ResultExt, Snafu};
use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub(crate) enum Error {
    #[snafu(display("Unable to hash triplet for {spec}: {source}"))]
    TripletHash {
        spec: PackageSpec,
        source: crate::triplet::Error,
    },

    #[snafu(display("{spec} has no port tree to hash at {}", path.display()))]
    MissingPortTree { spec: PackageSpec, path: PathBuf },

    #[snafu(display("Unable to walk port tree of {spec}: {source}"))]
    PortTreeWalk {
        spec: PackageSpec,
        source: walkdir::Error,
    },

    #[snafu(display("Unable to hash {}: {source}", path.display()))]
    FileHash {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display(
        "ABI of dependency {dependency} of {spec} is not available; the plan is not in dependency order"
    ))]
    MissingDependencyAbi {
        spec: PackageSpec,
        dependency: PackageSpec,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// One hashed input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AbiEntry {
    pub(crate) tag: String,
    pub(crate) value: String,
}

/// The hashed inputs of one action plus their combined digest.
#[derive(Debug, Clone)]
pub(crate) struct AbiInfo {
    pub(crate) entries: Vec<AbiEntry>,
    /// The rendered entry buffer, kept for diagnostics.
    pub(crate) summary: String,
    pub(crate) package_abi: String,
}

impl AbiInfo {
    fn from_entries(mut entries: Vec<AbiEntry>) -> Self {
        entries.sort_by(|a, b| a.tag.cmp(&b.tag).then_with(|| a.value.cmp(&b.value)));
        let mut summary = String::new();
        for entry in &entries {
            summary.push_str(&entry.tag);
            summary.push(' ');
            summary.push_str(&entry.value);
            summary.push('\n');
        }
        let package_abi = sha256_hex(summary.as_bytes());
        Self {
            entries,
            summary,
            package_abi,
        }
    }
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let mut digest = Sha256::new();
    digest.update(bytes);
    hex::encode(digest.finalize())
}

/// Hash a file from disk without reading it into memory at once.
pub(crate) fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut digest = Sha256::new();
    io::copy(&mut file, &mut digest)?;
    Ok(hex::encode(digest.finalize()))
}

/// File names that never affect a build.
fn is_ignorable(name: &str) -> bool {
    name == ".DS_Store" || name == ".git" || name.ends_with('~')
}

/// Computes ABIs for a whole plan. The toolchain fields are probed once by
/// the caller; platform-conditional inputs are simply absent on platforms
/// that do not have them, so otherwise-identical inputs hash differently
/// across platforms on purpose.
#[derive(Debug)]
pub(crate) struct AbiHasher<'a> {
    triplets: &'a TripletDatabase,
    /// Version string of the external build driver.
    build_driver_version: String,
    /// Version string of the script runner; only supplied on hosts that
    /// have one.
    script_runner_version: Option<String>,
    /// Provider-supplied hash describing host compiler, version, and target.
    compiler_hash: Option<String>,
    /// Helper scripts driven by the builder.
    ports_script: Option<PathBuf>,
    post_build_script: Option<PathBuf>,
    /// Console SDK header; only present where that SDK exists.
    console_sdk_header: Option<PathBuf>,
}

impl<'a> AbiHasher<'a> {
    pub(crate) fn new(triplets: &'a TripletDatabase, build_driver_version: String) -> Self {
        Self {
            triplets,
            build_driver_version,
            script_runner_version: None,
            compiler_hash: None,
            ports_script: None,
            post_build_script: None,
            console_sdk_header: None,
        }
    }

    pub(crate) fn script_runner_version(mut self, version: Option<String>) -> Self {
        self.script_runner_version = version;
        self
    }

    pub(crate) fn compiler_hash(mut self, hash: Option<String>) -> Self {
        self.compiler_hash = hash;
        self
    }

    pub(crate) fn helper_scripts(
        mut self,
        ports_script: Option<PathBuf>,
        post_build_script: Option<PathBuf>,
    ) -> Self {
        self.ports_script = ports_script;
        self.post_build_script = post_build_script;
        self
    }

    pub(crate) fn console_sdk_header(mut self, header: Option<PathBuf>) -> Self {
        self.console_sdk_header = header;
        self
    }

    /// Attach an ABI to every action, in plan order.
    pub(crate) fn annotate_plan(&self, plan: &mut ActionPlan) -> Result<()> {
        let mut dep_abis: BTreeMap<PackageSpec, String> = BTreeMap::new();
        for action in &mut plan.install_actions {
            let mut entries = Vec::new();

            let triplet_file =
                self.triplets
                    .find(&action.spec.triplet)
                    .context(TripletHashSnafu {
                        spec: action.spec.clone(),
                    })?;
            entries.push(AbiEntry {
                tag: "triplet".to_string(),
                value: sha256_hex(triplet_file.contents.as_bytes()),
            });
            let mut triplet_abi = triplet_file.contents.clone();
            if let Some(compiler) = &self.compiler_hash {
                triplet_abi.push('\n');
                triplet_abi.push_str(compiler);
            }
            entries.push(AbiEntry {
                tag: "triplet_abi".to_string(),
                value: sha256_hex(triplet_abi.as_bytes()),
            });

            entries.push(AbiEntry {
                tag: "cmake".to_string(),
                value: sha256_hex(self.build_driver_version.as_bytes()),
            });
            if let Some(version) = &self.script_runner_version {
                entries.push(AbiEntry {
                    tag: "powershell".to_string(),
                    value: sha256_hex(version.as_bytes()),
                });
            }
            if let Some(script) = &self.ports_script {
                entries.push(AbiEntry {
                    tag: "ports.cmake".to_string(),
                    value: sha256_file(script).context(FileHashSnafu { path: script })?,
                });
            }
            if let Some(script) = &self.post_build_script {
                entries.push(AbiEntry {
                    tag: "post_build_checks".to_string(),
                    value: sha256_file(script).context(FileHashSnafu { path: script })?,
                });
            }
            if let Some(header) = &self.console_sdk_header {
                entries.push(AbiEntry {
                    tag: "grdk.h".to_string(),
                    value: sha256_file(header).context(FileHashSnafu { path: header })?,
                });
            }

            let features = action.feature_list().join(";");
            entries.push(AbiEntry {
                tag: "features".to_string(),
                value: sha256_hex(features.as_bytes()),
            });

            self.hash_port_tree(action.spec.clone(), &action.port.port_dir, &mut entries)?;

            for dependency in action.dependency_specs() {
                let abi = dep_abis
                    .get(&dependency)
                    .context(MissingDependencyAbiSnafu {
                        spec: action.spec.clone(),
                        dependency: dependency.clone(),
                    })?;
                entries.push(AbiEntry {
                    tag: dependency.name.clone(),
                    value: abi.clone(),
                });
            }

            if let Some(value) = &action.port.manifest.policies.public_abi_override {
                entries.push(AbiEntry {
                    tag: "public_abi_override".to_string(),
                    value: sha256_hex(value.as_bytes()),
                });
            }

            let info = AbiInfo::from_entries(entries);
            dep_abis.insert(action.spec.clone(), info.package_abi.clone());
            action.abi = Some(info);
        }
        Ok(())
    }

    /// One entry per file in the port tree, tagged with its relative path.
    fn hash_port_tree(
        &self,
        spec: PackageSpec,
        port_dir: &Path,
        entries: &mut Vec<AbiEntry>,
    ) -> Result<()> {
        if !port_dir.is_dir() {
            return MissingPortTreeSnafu {
                spec,
                path: port_dir.to_path_buf(),
            }
            .fail();
        }

        for entry in WalkDir::new(port_dir)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                e.file_name()
                    .to_str()
                    .map(|name| !is_ignorable(name))
                    .unwrap_or(false)
            })
        {
            let entry = entry.context(PortTreeWalkSnafu { spec: spec.clone() })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(port_dir)
                .unwrap_or(entry.path())
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            entries.push(AbiEntry {
                tag: relative,
                value: sha256_file(entry.path()).context(FileHashSnafu {
                    path: entry.path(),
                })?,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{LoadedPort, PortManifest};
    use crate::resolver::{InstallPlanAction, RequestType};
    use crate::spec::{FeatureSpec, Triplet};

    fn write_port_tree(dir: &Path, files: &[(&str, &str)]) {
        for (name, contents) in files {
            let path = dir.join(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(path, contents).unwrap();
        }
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        triplet_dir: PathBuf,
        port_dir: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let triplet_dir = tmp.path().join("triplets");
        std::fs::create_dir_all(&triplet_dir).unwrap();
        std::fs::write(triplet_dir.join("x64-linux.toml"), "static = true\n").unwrap();
        let port_dir = tmp.path().join("ports/zlib/1.0");
        std::fs::create_dir_all(&port_dir).unwrap();
        write_port_tree(
            &port_dir,
            &[
                ("port.toml", "name = \"zlib\"\nversion = \"1.0\"\n"),
                ("build.sh", "echo build\n"),
                ("patches/fix.patch", "--- a\n+++ b\n"),
                (".DS_Store", "junk"),
            ],
        );
        Fixture {
            triplet_dir,
            port_dir,
            _tmp: tmp,
        }
    }

    fn action(port_dir: &Path, features: &[&str]) -> InstallPlanAction {
        let manifest = PortManifest::from_toml("name = \"zlib\"\nversion = \"1.0\"\n").unwrap();
        let mut feature_dependencies = BTreeMap::new();
        for feature in features {
            feature_dependencies.insert(feature.to_string(), Vec::new());
        }
        InstallPlanAction {
            spec: PackageSpec::new("zlib", Triplet::from("x64-linux")),
            port: LoadedPort::new(manifest, port_dir.to_path_buf()),
            request_type: RequestType::User,
            feature_dependencies,
            abi: None,
        }
    }

    fn hash_with(fixture: &Fixture, features: &[&str]) -> AbiInfo {
        let db = TripletDatabase::new(vec![fixture.triplet_dir.clone()]);
        let hasher = AbiHasher::new(&db, "3.27.1".to_string());
        let mut plan = ActionPlan {
            install_actions: vec![action(&fixture.port_dir, features)],
            unsupported_features: Vec::new(),
        };
        hasher.annotate_plan(&mut plan).unwrap();
        plan.install_actions.remove(0).abi.unwrap()
    }

    #[test]
    fn abi_is_stable_across_runs() {
        let fixture = fixture();
        let first = hash_with(&fixture, &["core"]);
        let second = hash_with(&fixture, &["core"]);
        assert_eq!(first.package_abi, second.package_abi);
        assert_eq!(first.summary, second.summary);
        // Entries are sorted by tag.
        let tags: Vec<&str> = first.entries.iter().map(|e| e.tag.as_str()).collect();
        let mut sorted = tags.clone();
        sorted.sort();
        assert_eq!(tags, sorted);
        // Ignorable files do not contribute.
        assert!(!first.entries.iter().any(|e| e.tag.contains(".DS_Store")));
        assert!(first.entries.iter().any(|e| e.tag == "patches/fix.patch"));
    }

    #[test]
    fn inputs_change_the_abi() {
        let fixture = fixture();
        let base = hash_with(&fixture, &["core"]);

        let with_feature = hash_with(&fixture, &["core", "zstd"]);
        assert_ne!(base.package_abi, with_feature.package_abi);

        std::fs::write(fixture.port_dir.join("build.sh"), "echo changed\n").unwrap();
        let with_edit = hash_with(&fixture, &["core"]);
        assert_ne!(base.package_abi, with_edit.package_abi);
    }

    #[test]
    fn entry_set_is_platform_conditional() {
        let fixture = fixture();
        let db = TripletDatabase::new(vec![fixture.triplet_dir.clone()]);

        let bare = AbiHasher::new(&db, "3.27.1".to_string());
        let mut plan = ActionPlan {
            install_actions: vec![action(&fixture.port_dir, &["core"])],
            unsupported_features: Vec::new(),
        };
        bare.annotate_plan(&mut plan).unwrap();
        let bare_abi = plan.install_actions[0].abi.clone().unwrap();
        assert!(!bare_abi.entries.iter().any(|e| e.tag == "powershell"));
        assert!(!bare_abi.entries.iter().any(|e| e.tag == "grdk.h"));

        let windowsish = AbiHasher::new(&db, "3.27.1".to_string())
            .script_runner_version(Some("7.4.1".to_string()));
        let mut plan = ActionPlan {
            install_actions: vec![action(&fixture.port_dir, &["core"])],
            unsupported_features: Vec::new(),
        };
        windowsish.annotate_plan(&mut plan).unwrap();
        let windows_abi = plan.install_actions[0].abi.clone().unwrap();
        assert!(windows_abi.entries.iter().any(|e| e.tag == "powershell"));
        // The divergence is intentional: same port, different host inputs.
        assert_ne!(bare_abi.package_abi, windows_abi.package_abi);
    }

    #[test]
    fn dependency_abis_feed_dependents() {
        let fixture = fixture();
        let db = TripletDatabase::new(vec![fixture.triplet_dir.clone()]);
        let hasher = AbiHasher::new(&db, "3.27.1".to_string());

        let dep_spec = PackageSpec::new("zlib", Triplet::from("x64-linux"));
        let mut consumer = action(&fixture.port_dir, &["core"]);
        consumer.spec = PackageSpec::new("libpng", Triplet::from("x64-linux"));
        consumer
            .feature_dependencies
            .insert("core".to_string(), vec![FeatureSpec::core(dep_spec.clone())]);

        let mut plan = ActionPlan {
            install_actions: vec![action(&fixture.port_dir, &["core"]), consumer],
            unsupported_features: Vec::new(),
        };
        hasher.annotate_plan(&mut plan).unwrap();

        let dep_abi = plan.install_actions[0].abi.as_ref().unwrap();
        let consumer_abi = plan.install_actions[1].abi.as_ref().unwrap();
        let entry = consumer_abi
            .entries
            .iter()
            .find(|e| e.tag == "zlib")
            .expect("dependency entry");
        assert_eq!(entry.value, dep_abi.package_abi);
    }

    #[test]
    fn out_of_order_plan_is_rejected() {
        let fixture = fixture();
        let db = TripletDatabase::new(vec![fixture.triplet_dir.clone()]);
        let hasher = AbiHasher::new(&db, "3.27.1".to_string());

        let dep_spec = PackageSpec::new("zlib", Triplet::from("x64-linux"));
        let mut consumer = action(&fixture.port_dir, &["core"]);
        consumer.spec = PackageSpec::new("libpng", Triplet::from("x64-linux"));
        consumer
            .feature_dependencies
            .insert("core".to_string(), vec![FeatureSpec::core(dep_spec)]);

        let mut plan = ActionPlan {
            install_actions: vec![consumer],
            unsupported_features: Vec::new(),
        };
        let err = hasher.annotate_plan(&mut plan).unwrap_err();
        assert!(matches!(err, Error::MissingDependencyAbi { .. }));
    }
}
