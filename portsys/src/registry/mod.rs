/*!
Port registries: the sources that answer "what is the baseline version of
this port" and "give me the source tree for this port at this version".

Four kinds exist. The builtin and git registries read a pinned commit of a
git repository; the filesystem registry reads a directory tree; overlays
(handled by [`overlay::OverlaySet`]) shadow all of them. A `RegistrySet`
routes each port to the first named registry whose package pattern matches,
falling back to the default registry.
*/

pub(crate) mod error;
pub(crate) mod filesystem;
pub(crate) mod git;
pub(crate) mod overlay;

use crate::manifest::LoadedPort;
use crate::version::Version;
use error::Result;
use serde::Deserialize;
use snafu::ResultExt;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

/// The resolver's view of baseline lookups.
pub(crate) trait BaselineProvider {
    fn baseline_version(&self, name: &str) -> Result<Version>;
}

/// The resolver's view of versioned manifest lookups.
pub(crate) trait PortProvider {
    fn load_port(&self, name: &str, version: &Version) -> Result<Arc<LoadedPort>>;
}

/// The resolver's view of overlay lookups.
pub(crate) trait OverlayProvider {
    fn find_port(&self, name: &str) -> Result<Option<Arc<LoadedPort>>>;
}

impl OverlayProvider for overlay::OverlaySet {
    fn find_port(&self, name: &str) -> Result<Option<Arc<LoadedPort>>> {
        overlay::OverlaySet::find_port(self, name)
    }
}

/// The directory name a version occupies in a registry tree.
pub(crate) fn version_dir(version: &Version) -> String {
    if version.port_revision == 0 {
        version.text.clone()
    } else {
        format!("{}_{}", version.text, version.port_revision)
    }
}

/// A parsed `baseline.toml`: one pinned version per port.
#[derive(Debug, Clone)]
pub(crate) struct Baseline {
    versions: BTreeMap<String, Version>,
}

#[derive(Debug, Deserialize)]
struct BaselineFile {
    baseline: BTreeMap<String, String>,
}

impl Baseline {
    pub(crate) fn from_toml(text: &str, path: &Path) -> Result<Self> {
        let file: BaselineFile = toml::from_str(text).context(error::BaselineParseSnafu { path })?;
        let mut versions = BTreeMap::new();
        for (name, version) in file.baseline {
            let version = version
                .parse()
                .context(error::BaselineVersionSnafu { name: &name })?;
            versions.insert(name, version);
        }
        Ok(Self { versions })
    }

    pub(crate) fn version_of(&self, name: &str) -> Option<Version> {
        self.versions.get(name).cloned()
    }
}

/// One concrete registry. A tagged variant keeps dispatch simple; the
/// resolver only ever sees the provider traits.
#[derive(Debug)]
pub(crate) enum Registry {
    Filesystem(filesystem::FilesystemRegistry),
    Git(git::GitRegistry),
    Builtin(git::BuiltinRegistry),
}

impl Registry {
    fn baseline(&self) -> Result<Baseline> {
        match self {
            Registry::Filesystem(r) => r.baseline(),
            Registry::Git(r) => r.baseline(),
            Registry::Builtin(r) => r.baseline(),
        }
    }

    fn load_port(&self, name: &str, version: &Version) -> Result<Arc<LoadedPort>> {
        match self {
            Registry::Filesystem(r) => r.load_port(name, version),
            Registry::Git(r) => r.load_port(name, version),
            Registry::Builtin(r) => r.load_port(name, version),
        }
    }
}

/// A named registry claims the ports matching its package patterns. A
/// pattern is a port name, or a name prefix ending in `*`.
#[derive(Debug)]
pub(crate) struct NamedRegistry {
    pub(crate) registry: Registry,
    pub(crate) packages: Vec<String>,
}

pub(crate) fn pattern_matches(pattern: &str, name: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => pattern == name,
    }
}

/// Routes ports to registries and caches what they return for the duration
/// of a resolution. Manifests are immutable once loaded.
#[derive(Debug)]
pub(crate) struct RegistrySet {
    default_registry: Option<Registry>,
    named: Vec<NamedRegistry>,
    baselines: RefCell<HashMap<usize, Arc<Baseline>>>,
    ports: RefCell<HashMap<(String, Version), Arc<LoadedPort>>>,
}

impl RegistrySet {
    pub(crate) fn new(default_registry: Option<Registry>, named: Vec<NamedRegistry>) -> Self {
        Self {
            default_registry,
            named,
            baselines: RefCell::new(HashMap::new()),
            ports: RefCell::new(HashMap::new()),
        }
    }

    /// The registry responsible for `name`: first pattern match wins, then
    /// the default registry. The returned index keys the baseline cache.
    fn registry_for(&self, name: &str) -> Result<(usize, &Registry)> {
        for (index, named) in self.named.iter().enumerate() {
            if named.packages.iter().any(|p| pattern_matches(p, name)) {
                return Ok((index + 1, &named.registry));
            }
        }
        match &self.default_registry {
            Some(registry) => Ok((0, registry)),
            None => error::NoRegistryForPortSnafu { name }.fail(),
        }
    }

    fn baseline_of(&self, index: usize, registry: &Registry) -> Result<Arc<Baseline>> {
        if let Some(baseline) = self.baselines.borrow().get(&index) {
            return Ok(baseline.clone());
        }
        let baseline = Arc::new(registry.baseline()?);
        self.baselines.borrow_mut().insert(index, baseline.clone());
        Ok(baseline)
    }
}

impl BaselineProvider for RegistrySet {
    fn baseline_version(&self, name: &str) -> Result<Version> {
        let (index, registry) = self.registry_for(name)?;
        let baseline = self.baseline_of(index, registry)?;
        baseline.version_of(name).ok_or_else(|| {
            error::BaselineMissingSnafu {
                name,
                registry: match registry {
                    Registry::Filesystem(_) => "filesystem",
                    Registry::Git(_) => "git",
                    Registry::Builtin(_) => "builtin",
                },
            }
            .build()
        })
    }
}

impl PortProvider for RegistrySet {
    fn load_port(&self, name: &str, version: &Version) -> Result<Arc<LoadedPort>> {
        let key = (name.to_string(), version.clone());
        if let Some(port) = self.ports.borrow().get(&key) {
            return Ok(port.clone());
        }
        let (_, registry) = self.registry_for(name)?;
        let port = registry.load_port(name, version)?;
        self.ports.borrow_mut().insert(key, port.clone());
        Ok(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filesystem::FilesystemRegistry;

    #[test]
    fn patterns() {
        assert!(pattern_matches("*", "anything"));
        assert!(pattern_matches("boost*", "boost-asio"));
        assert!(pattern_matches("zlib", "zlib"));
        assert!(!pattern_matches("boost*", "zlib"));
        assert!(!pattern_matches("zlib", "zlib-ng"));
    }

    fn seed_registry(root: &std::path::Path, port: &str, version: &str) {
        std::fs::write(
            root.join("baseline.toml"),
            format!("[baseline]\n{port} = \"{version}\"\n"),
        )
        .unwrap();
        let dir = root.join("ports").join(port).join(version);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("port.toml"),
            format!("name = \"{port}\"\nversion = \"{version}\"\n"),
        )
        .unwrap();
    }

    #[test]
    fn named_registry_wins_over_default() {
        let default_dir = tempfile::tempdir().unwrap();
        let named_dir = tempfile::tempdir().unwrap();
        seed_registry(default_dir.path(), "zlib", "1.0");
        seed_registry(named_dir.path(), "zlib", "2.0");

        let set = RegistrySet::new(
            Some(Registry::Filesystem(FilesystemRegistry::new(
                default_dir.path().to_path_buf(),
            ))),
            vec![NamedRegistry {
                registry: Registry::Filesystem(FilesystemRegistry::new(
                    named_dir.path().to_path_buf(),
                )),
                packages: vec!["z*".to_string()],
            }],
        );

        assert_eq!(set.baseline_version("zlib").unwrap().to_string(), "2.0");
        let port = set
            .load_port("zlib", &Version::new("2.0", 0))
            .unwrap();
        assert_eq!(port.manifest.version, "2.0");
        // Second load comes from the cache and is the same Arc.
        let again = set.load_port("zlib", &Version::new("2.0", 0)).unwrap();
        assert!(Arc::ptr_eq(&port, &again));
    }

    #[test]
    fn no_registry_for_port() {
        let set = RegistrySet::new(None, Vec::new());
        assert!(set.baseline_version("zlib").is_err());
    }
}
