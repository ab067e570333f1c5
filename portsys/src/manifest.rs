/*!
# Port manifests

This module provides deserialization and convenience methods for the
`port.toml` manifest that describes one version of a port. We recognize the
following keys.

`name`, `version`, `version-scheme` (one of `string`, `relaxed`, `semver`,
`date`; default `relaxed`), and `port-revision` identify the port:

```ignore
name = "zlib"
version = "1.2.13"
version-scheme = "relaxed"
port-revision = 1
```

`dependencies` lists the core dependencies. An entry is either a bare port
name or a table. `host` requests the build-time (host triplet) flavor of the
dependency, `platform` drops the edge when the expression is false for the
consuming triplet, and `version-ge` is a minimum-version constraint:

```ignore
dependencies = [
    "alpha",
    { name = "beta", host = true, features = ["tls"], platform = "!windows",
      version-ge = "2.0#1" },
]
```

`default-features` names the features enabled when the port is pulled in
without an explicit feature list. `supports` is a platform expression that
must hold for the port to build at all. Each `[[features]]` table declares an
optional feature with its own dependencies and `supports` clause.

`[policies]` carries build-policy switches; `public-abi-override` injects an
extra value into the package ABI for ports that opt in.
*/

use crate::platform::PlatformExpression;
use crate::version::{self, SchemedVersion, Version, VersionScheme};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub(crate) enum Error {
    #[snafu(display("Unable to read manifest file {}: {source}", path.display()))]
    ManifestFileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Unable to load manifest file {}: {source}", path.display()))]
    ManifestFileLoad {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[snafu(display("Invalid version in manifest for '{name}': {source}"))]
    ManifestVersion {
        name: String,
        source: version::Error,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// One version of a port: its identity, dependencies, and features.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct PortManifest {
    pub(crate) name: String,
    pub(crate) version: String,
    #[serde(default)]
    pub(crate) version_scheme: VersionScheme,
    #[serde(default)]
    pub(crate) port_revision: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) supports: Option<PlatformExpression>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) default_features: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) dependencies: Vec<Dependency>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) features: Vec<Feature>,
    #[serde(default, skip_serializing_if = "Policies::is_empty")]
    pub(crate) policies: Policies,
}

/// An optional feature of a port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct Feature {
    pub(crate) name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) supports: Option<PlatformExpression>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) dependencies: Vec<Dependency>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct Policies {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) public_abi_override: Option<String>,
}

impl Policies {
    fn is_empty(&self) -> bool {
        self.public_abi_override.is_none()
    }
}

/// A dependency edge. Deserializes from either a bare name or a table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "DependencyDe", into = "DependencyDe")]
pub(crate) struct Dependency {
    pub(crate) name: String,
    pub(crate) host: bool,
    pub(crate) features: Vec<String>,
    pub(crate) platform: Option<PlatformExpression>,
    pub(crate) minimum_version: Option<Version>,
}

impl Dependency {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: false,
            features: Vec::new(),
            platform: None,
            minimum_version: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum DependencyDe {
    Simple(String),
    Detailed {
        name: String,
        #[serde(default)]
        host: bool,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        features: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        platform: Option<PlatformExpression>,
        #[serde(rename = "version-ge", skip_serializing_if = "Option::is_none")]
        version_ge: Option<String>,
    },
}

impl TryFrom<DependencyDe> for Dependency {
    type Error = version::Error;

    fn try_from(de: DependencyDe) -> std::result::Result<Self, version::Error> {
        match de {
            DependencyDe::Simple(name) => Ok(Dependency::new(name)),
            DependencyDe::Detailed {
                name,
                host,
                features,
                platform,
                version_ge,
            } => Ok(Dependency {
                name,
                host,
                features,
                platform,
                minimum_version: version_ge.map(|v| v.parse()).transpose()?,
            }),
        }
    }
}

impl From<Dependency> for DependencyDe {
    fn from(dep: Dependency) -> Self {
        DependencyDe::Detailed {
            name: dep.name,
            host: dep.host,
            features: dep.features,
            platform: dep.platform,
            version_ge: dep.minimum_version.map(|v| v.to_string()),
        }
    }
}

impl PortManifest {
    /// Extract the settings we understand from a `port.toml` file.
    pub(crate) fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let manifest_data =
            std::fs::read_to_string(path).context(ManifestFileReadSnafu { path })?;
        Self::from_toml(&manifest_data).context(ManifestFileLoadSnafu { path })
    }

    pub(crate) fn from_toml(manifest_data: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(manifest_data)
    }

    pub(crate) fn to_version(&self) -> Version {
        Version::new(self.version.clone(), self.port_revision)
    }

    pub(crate) fn schemed_version(&self) -> SchemedVersion {
        SchemedVersion::new(self.version_scheme, self.to_version())
    }

    /// Check that the version text and every `version-ge` constraint parse.
    pub(crate) fn validate_versions(&self) -> Result<()> {
        version::parse_version(&self.version, self.version_scheme)
            .context(ManifestVersionSnafu { name: &self.name })?;
        Ok(())
    }

    pub(crate) fn find_feature(&self, name: &str) -> Option<&Feature> {
        self.features.iter().find(|f| f.name == name)
    }

    /// The dependency list for `feature`, where `"core"` means the port's own
    /// dependencies. `None` if this version does not declare the feature.
    pub(crate) fn find_dependencies_for_feature(&self, feature: &str) -> Option<&[Dependency]> {
        if feature == crate::spec::CORE_FEATURE {
            return Some(&self.dependencies);
        }
        self.find_feature(feature).map(|f| f.dependencies.as_slice())
    }
}

/// A manifest together with the port tree it was loaded from. The port
/// directory feeds the ABI hasher and the builder; registries materialize it
/// on demand.
#[derive(Debug)]
pub(crate) struct LoadedPort {
    pub(crate) manifest: PortManifest,
    pub(crate) port_dir: PathBuf,
}

impl LoadedPort {
    pub(crate) fn new(manifest: PortManifest, port_dir: PathBuf) -> Arc<Self> {
        Arc::new(Self { manifest, port_dir })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
        name = "libfoo"
        version = "1.4.0"
        port-revision = 2
        description = "A library for foo"
        supports = "!uwp"
        default-features = ["zstd"]
        dependencies = [
            "libbar",
            { name = "tool-gen", host = true },
            { name = "libssl", platform = "!windows", version-ge = "3.0#1", features = ["tls13"] },
        ]

        [[features]]
        name = "zstd"
        dependencies = [ "libzstd" ]

        [[features]]
        name = "lzma"
        supports = "!arm"

        [policies]
        public-abi-override = "rebuild-2024-06"
    "#;

    #[test]
    fn parses_full_manifest() {
        let manifest = PortManifest::from_toml(MANIFEST).unwrap();
        assert_eq!(manifest.name, "libfoo");
        assert_eq!(manifest.to_version().to_string(), "1.4.0#2");
        assert_eq!(manifest.version_scheme, VersionScheme::Relaxed);
        assert_eq!(manifest.default_features, vec!["zstd"]);

        let deps = &manifest.dependencies;
        assert_eq!(deps.len(), 3);
        assert_eq!(deps[0].name, "libbar");
        assert!(deps[1].host);
        let ssl = &deps[2];
        assert_eq!(ssl.features, vec!["tls13"]);
        assert_eq!(ssl.minimum_version.as_ref().unwrap().to_string(), "3.0#1");
        assert!(ssl.platform.is_some());

        assert!(manifest.find_feature("zstd").is_some());
        assert!(manifest.find_feature("none").is_none());
        assert_eq!(
            manifest.find_dependencies_for_feature("zstd").unwrap()[0].name,
            "libzstd"
        );
        assert_eq!(manifest.find_dependencies_for_feature("core").unwrap().len(), 3);
        assert!(manifest.find_dependencies_for_feature("missing").is_none());
        assert_eq!(
            manifest.policies.public_abi_override.as_deref(),
            Some("rebuild-2024-06")
        );
    }

    #[test]
    fn round_trips_through_toml() {
        let manifest = PortManifest::from_toml(MANIFEST).unwrap();
        let serialized = toml::to_string(&manifest).unwrap();
        let reparsed = PortManifest::from_toml(&serialized).unwrap();
        assert_eq!(reparsed.name, manifest.name);
        assert_eq!(reparsed.dependencies.len(), manifest.dependencies.len());
        assert_eq!(
            reparsed.dependencies[2].minimum_version,
            manifest.dependencies[2].minimum_version
        );
    }

    #[test]
    fn defaults_are_minimal() {
        let manifest = PortManifest::from_toml("name = \"tiny\"\nversion = \"0.1\"").unwrap();
        assert_eq!(manifest.port_revision, 0);
        assert!(manifest.dependencies.is_empty());
        assert!(manifest.supports.is_none());
        manifest.validate_versions().unwrap();
    }
}
