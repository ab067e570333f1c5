/*!
Discovery of the external tools we shell out to.

Each tool is looked up on `PATH` once per process and probed for its version
string. The version strings for the build driver and the script runner are
inputs to the package ABI, so they are captured exactly as reported.
*/

use log::debug;
use regex::Regex;
use snafu::{OptionExt, ResultExt, Snafu};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub(crate) enum Error {
    #[snafu(display("Unable to find '{name}' in the current environment: {source}"))]
    NotFound { name: String, source: which::Error },

    #[snafu(display("Unable to run '{name} --version': {source}"))]
    VersionProbe {
        name: String,
        source: std::io::Error,
    },

    #[snafu(display("'{name} --version' did not report a version (output: {output})"))]
    VersionParse { name: String, output: String },
}

type Result<T> = std::result::Result<T, Error>;

/// A located external tool.
#[derive(Debug, Clone)]
pub(crate) struct Tool {
    pub(crate) path: PathBuf,
    pub(crate) version: String,
}

/// Per-process cache of located tools.
#[derive(Debug, Default)]
pub(crate) struct ToolRegistry {
    cache: RefCell<HashMap<String, Arc<Tool>>>,
}

impl ToolRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Locate `name` on `PATH` and capture its version string. The result is
    /// cached for the life of the process.
    pub(crate) fn find(&self, name: &str) -> Result<Arc<Tool>> {
        if let Some(tool) = self.cache.borrow().get(name) {
            return Ok(tool.clone());
        }

        let path = which::which(name).context(NotFoundSnafu { name })?;
        let output = Command::new(&path)
            .arg("--version")
            .output()
            .context(VersionProbeSnafu { name })?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let version = parse_version_line(&stdout).context(VersionParseSnafu {
            name,
            output: stdout.lines().next().unwrap_or_default(),
        })?;

        let tool = Arc::new(Tool { path, version });
        debug!(
            "Found {} {} at {}",
            name,
            tool.version,
            tool.path.display()
        );
        self.cache
            .borrow_mut()
            .insert(name.to_string(), tool.clone());
        Ok(tool)
    }

    /// Like [`find`], but a missing tool is `None` rather than an error, for
    /// tools that only exist on some platforms.
    pub(crate) fn find_optional(&self, name: &str) -> Option<Arc<Tool>> {
        self.find(name).ok()
    }
}

/// Pull the first dotted version number out of `--version` output, e.g.
/// `3.27.1` from `cmake version 3.27.1`.
fn parse_version_line(output: &str) -> Option<String> {
    let pattern = Regex::new(r"\d+\.\d+(\.\d+)*([\w.-]*)").ok()?;
    let first_line = output.lines().next()?;
    pattern
        .find(first_line)
        .map(|found| found.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_versions_from_common_formats() {
        assert_eq!(
            parse_version_line("cmake version 3.27.1\n").as_deref(),
            Some("3.27.1")
        );
        assert_eq!(
            parse_version_line("git version 2.44.0.windows.1").as_deref(),
            Some("2.44.0.windows.1")
        );
        assert_eq!(parse_version_line("no digits here"), None);
    }

    #[test]
    fn finds_a_ubiquitous_tool() {
        let registry = ToolRegistry::new();
        let tool = registry.find("sh");
        // `sh --version` output varies; only require discovery to resolve a
        // path or produce a structured error.
        match tool {
            Ok(tool) => assert!(tool.path.is_absolute()),
            Err(err) => assert!(!err.to_string().is_empty()),
        }
    }
}
