/*!
The `portsys.json` configuration document.

Recognized fields: `default-registry` (nullable), `registries`,
`overlay-ports`, `overlay-triplets`, and `overrides`. Fields whose names
start with `$` are comments and survive a round trip untouched. Unknown
non-`$` keys inside a registry produce warnings rather than errors, so newer
configurations keep working on older tools; structural problems are reported
with a JSON-pointer path to the offending field.
*/

use crate::version::Version;
use log::warn;
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt, Snafu};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub(crate) enum Error {
    #[snafu(display("Unable to read configuration {}: {source}", path.display()))]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Unable to parse configuration: {source}"))]
    ConfigParse { source: serde_json::Error },

    #[snafu(display("Unable to serialize configuration: {source}"))]
    ConfigSerialize { source: serde_json::Error },

    #[snafu(display("{pointer}: {message}"))]
    ConfigField { pointer: String, message: String },

    #[snafu(display("{pointer}: invalid version '{version}': {source}"))]
    ConfigVersion {
        pointer: String,
        version: String,
        source: crate::version::Error,
    },
}

type Result<T> = std::result::Result<T, Error>;

pub(crate) const KIND_BUILTIN: &str = "builtin";
pub(crate) const KIND_GIT: &str = "git";
pub(crate) const KIND_FILESYSTEM: &str = "filesystem";
pub(crate) const KIND_ARTIFACT: &str = "artifact";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct Configuration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) default_registry: Option<RegistryConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) registries: Vec<RegistryConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) overlay_ports: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) overlay_triplets: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) overrides: Vec<OverrideConfig>,
    /// `$`-prefixed comment fields, preserved verbatim.
    #[serde(flatten)]
    pub(crate) extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct RegistryConfig {
    pub(crate) kind: String,
    /// Filesystem registries: the registry root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) path: Option<PathBuf>,
    /// Git registries: the remote URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) repository: Option<String>,
    /// Git and builtin registries: the pinned baseline commit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) baseline: Option<String>,
    /// Port name patterns this registry claims; unused on the default
    /// registry.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) packages: Vec<String>,
    #[serde(flatten)]
    pub(crate) extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct OverrideConfig {
    pub(crate) name: String,
    pub(crate) version: String,
}

impl OverrideConfig {
    pub(crate) fn parsed_version(&self, pointer: &str) -> Result<Version> {
        self.version.parse().context(ConfigVersionSnafu {
            pointer,
            version: &self.version,
        })
    }
}

impl Configuration {
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).context(ConfigReadSnafu { path })?;
        Self::from_json(&text)
    }

    pub(crate) fn from_json(text: &str) -> Result<Self> {
        let config: Configuration = serde_json::from_str(text).context(ConfigParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    pub(crate) fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context(ConfigSerializeSnafu)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if let Some(default_registry) = &self.default_registry {
            ensure!(
                default_registry.kind != KIND_ARTIFACT,
                ConfigFieldSnafu {
                    pointer: "/default-registry/kind",
                    message: "an artifact registry cannot be the default registry",
                }
            );
            if !default_registry.packages.is_empty() {
                warn!("/default-registry/packages: the default registry matches every port; the patterns are ignored");
            }
            default_registry.validate("/default-registry")?;
        }

        for (index, registry) in self.registries.iter().enumerate() {
            let pointer = format!("/registries/{index}");
            if registry.kind == KIND_ARTIFACT {
                warn!("{pointer}: artifact registries are not consulted for ports");
                continue;
            }
            registry.validate(&pointer)?;
            if registry.packages.is_empty() {
                warn!("{pointer}/packages: registry matches no ports");
            }
        }

        for (index, override_) in self.overrides.iter().enumerate() {
            let pointer = format!("/overrides/{index}/version");
            override_.parsed_version(&pointer)?;
        }

        warn_unexpected(&self.extra, "");
        Ok(())
    }
}

impl RegistryConfig {
    fn validate(&self, pointer: &str) -> Result<()> {
        let require = |present: bool, field: &str| {
            ensure!(
                present,
                ConfigFieldSnafu {
                    pointer: format!("{pointer}/{field}"),
                    message: format!("required for {} registries", self.kind),
                }
            );
            Ok(())
        };
        match self.kind.as_str() {
            KIND_BUILTIN => {
                require(self.baseline.is_some(), "baseline")?;
            }
            KIND_GIT => {
                require(self.repository.is_some(), "repository")?;
                require(self.baseline.is_some(), "baseline")?;
            }
            KIND_FILESYSTEM => {
                require(self.path.is_some(), "path")?;
            }
            other => {
                return ConfigFieldSnafu {
                    pointer: format!("{pointer}/kind"),
                    message: format!("unknown registry kind '{other}'"),
                }
                .fail();
            }
        }
        warn_unexpected(&self.extra, pointer);
        Ok(())
    }
}

/// `$`-prefixed fields are comments; anything else we do not recognize gets
/// a warning but stays in the document.
fn warn_unexpected(extra: &BTreeMap<String, serde_json::Value>, pointer: &str) {
    for key in extra.keys() {
        if !key.starts_with('$') {
            warn!("{pointer}/{key}: unexpected field");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "$schema-note": "mirrors the team cache layout",
        "default-registry": {
            "kind": "builtin",
            "baseline": "0f3a1bd6543c"
        },
        "registries": [
            {
                "kind": "git",
                "repository": "https://example.com/ports.git",
                "baseline": "aa11bb22",
                "packages": ["boost*"]
            },
            {
                "kind": "filesystem",
                "path": "/srv/registry",
                "packages": ["zlib"]
            }
        ],
        "overlay-ports": ["/work/overlays/ports"],
        "overlay-triplets": ["/work/overlays/triplets"],
        "overrides": [
            { "name": "openssl", "version": "3.0.8#2" }
        ]
    }"#;

    #[test]
    fn parses_and_validates() {
        let config = Configuration::from_json(CONFIG).unwrap();
        assert_eq!(config.registries.len(), 2);
        assert_eq!(config.overrides[0].name, "openssl");
        assert_eq!(
            config.overrides[0].parsed_version("/overrides/0").unwrap(),
            Version::new("3.0.8", 2)
        );
        assert!(config.extra.contains_key("$schema-note"));
    }

    #[test]
    fn round_trips_through_json() {
        let config = Configuration::from_json(CONFIG).unwrap();
        let serialized = config.to_json().unwrap();
        let reparsed = Configuration::from_json(&serialized).unwrap();
        assert_eq!(config, reparsed);
    }

    #[test]
    fn artifact_default_registry_is_rejected() {
        let err = Configuration::from_json(
            r#"{ "default-registry": { "kind": "artifact", "baseline": "x" } }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("/default-registry/kind"));
    }

    #[test]
    fn missing_kind_fields_point_at_the_field() {
        let err = Configuration::from_json(
            r#"{ "registries": [ { "kind": "git", "baseline": "abc" } ] }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("/registries/0/repository"));

        let err = Configuration::from_json(r#"{ "registries": [ { "kind": "warehouse" } ] }"#)
            .unwrap_err();
        assert!(err.to_string().contains("/registries/0/kind"));
    }

    #[test]
    fn bad_override_version_is_reported() {
        let err = Configuration::from_json(
            r#"{ "overrides": [ { "name": "zlib", "version": "1.0#x" } ] }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("/overrides/0/version"));
    }

    #[test]
    fn null_default_registry_is_allowed() {
        let config = Configuration::from_json(r#"{ "default-registry": null }"#).unwrap();
        assert!(config.default_registry.is_none());
    }
}
