/*!
A registry rooted in a plain directory tree: `baseline.toml` at the root and
one manifest per version under `ports/<name>/<version>/port.toml`.
*/

use super::error::{self, Result};
use super::{version_dir, Baseline};
use crate::manifest::{LoadedPort, PortManifest};
use crate::version::Version;
use snafu::ResultExt;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug)]
pub(crate) struct FilesystemRegistry {
    root: PathBuf,
}

impl FilesystemRegistry {
    pub(crate) fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub(crate) fn baseline(&self) -> Result<Baseline> {
        let path = self.root.join("baseline.toml");
        let text = std::fs::read_to_string(&path).context(error::BaselineReadSnafu { path: &path })?;
        Baseline::from_toml(&text, &path)
    }

    pub(crate) fn load_port(&self, name: &str, version: &Version) -> Result<Arc<LoadedPort>> {
        let port_dir = self
            .root
            .join("ports")
            .join(name)
            .join(version_dir(version));
        let manifest_path = port_dir.join("port.toml");
        if !manifest_path.is_file() {
            return error::VersionNotFoundSnafu {
                name,
                version: version.clone(),
                registry: format!("filesystem ({})", self.root.display()),
            }
            .fail();
        }
        let manifest = PortManifest::load(&manifest_path).context(error::ManifestSnafu)?;
        Ok(LoadedPort::new(manifest, port_dir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(root: &std::path::Path) {
        std::fs::write(
            root.join("baseline.toml"),
            "[baseline]\nzlib = \"1.2.13#1\"\n",
        )
        .unwrap();
        let port_dir = root.join("ports/zlib/1.2.13_1");
        std::fs::create_dir_all(&port_dir).unwrap();
        std::fs::write(
            port_dir.join("port.toml"),
            "name = \"zlib\"\nversion = \"1.2.13\"\nport-revision = 1\n",
        )
        .unwrap();
    }

    #[test]
    fn reads_baseline_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path());
        let registry = FilesystemRegistry::new(dir.path().to_path_buf());

        let baseline = registry.baseline().unwrap();
        let version = baseline.version_of("zlib").unwrap();
        assert_eq!(version.to_string(), "1.2.13#1");
        assert!(baseline.version_of("missing").is_none());

        let port = registry.load_port("zlib", &version).unwrap();
        assert_eq!(port.manifest.name, "zlib");
        assert!(port.port_dir.ends_with("ports/zlib/1.2.13_1"));
    }

    #[test]
    fn missing_version_is_structured() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path());
        let registry = FilesystemRegistry::new(dir.path().to_path_buf());
        let err = registry
            .load_port("zlib", &Version::new("9.9", 0))
            .unwrap_err();
        assert!(err.to_string().contains("9.9"));
    }
}
