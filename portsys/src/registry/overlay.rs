/*!
Overlay ports: a priority list of directories whose entries shadow every
registry. An overlay has no version axis; whatever is on disk is the version.
*/

use super::error::{self, Result};
use crate::manifest::{LoadedPort, PortManifest};
use snafu::{ensure, ResultExt};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Default)]
pub(crate) struct OverlaySet {
    dirs: Vec<PathBuf>,
    cache: RefCell<HashMap<String, Option<Arc<LoadedPort>>>>,
}

impl OverlaySet {
    pub(crate) fn new(dirs: Vec<PathBuf>) -> Self {
        Self {
            dirs,
            cache: RefCell::new(HashMap::new()),
        }
    }

    /// Find the overlay port named `name`, if any directory provides one.
    /// Lookups are cached for the life of the set.
    pub(crate) fn find_port(&self, name: &str) -> Result<Option<Arc<LoadedPort>>> {
        if let Some(found) = self.cache.borrow().get(name) {
            return Ok(found.clone());
        }

        let mut found = None;
        for dir in &self.dirs {
            let port_dir = dir.join(name);
            let manifest_path = port_dir.join("port.toml");
            if !manifest_path.is_file() {
                continue;
            }
            let manifest = PortManifest::load(&manifest_path).context(error::ManifestSnafu)?;
            ensure!(
                manifest.name == name,
                error::OverlayNameMismatchSnafu {
                    path: manifest_path,
                    found: manifest.name,
                    expected: name,
                }
            );
            found = Some(LoadedPort::new(manifest, port_dir));
            break;
        }

        self.cache
            .borrow_mut()
            .insert(name.to_string(), found.clone());
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_port(root: &std::path::Path, name: &str, version: &str) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("port.toml"),
            format!("name = \"{name}\"\nversion = \"{version}\"\n"),
        )
        .unwrap();
    }

    #[test]
    fn first_directory_wins() {
        let high = tempfile::tempdir().unwrap();
        let low = tempfile::tempdir().unwrap();
        write_port(high.path(), "zlib", "9.0");
        write_port(low.path(), "zlib", "1.0");
        write_port(low.path(), "bzip2", "1.0.8");

        let overlays = OverlaySet::new(vec![high.path().to_path_buf(), low.path().to_path_buf()]);
        let zlib = overlays.find_port("zlib").unwrap().unwrap();
        assert_eq!(zlib.manifest.version, "9.0");
        assert!(overlays.find_port("bzip2").unwrap().is_some());
        assert!(overlays.find_port("absent").unwrap().is_none());
    }

    #[test]
    fn name_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let port_dir = dir.path().join("zlib");
        std::fs::create_dir_all(&port_dir).unwrap();
        std::fs::write(port_dir.join("port.toml"), "name = \"notzlib\"\nversion = \"1\"\n").unwrap();

        let overlays = OverlaySet::new(vec![dir.path().to_path_buf()]);
        assert!(overlays.find_port("zlib").is_err());
    }
}
