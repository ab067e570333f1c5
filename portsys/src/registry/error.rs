use crate::version::Version;
use snafu::Snafu;
use std::path::PathBuf;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub(crate) enum Error {
    #[snafu(display("No registry is configured for port '{name}'"))]
    NoRegistryForPort { name: String },

    #[snafu(display("The {registry} registry has no baseline entry for port '{name}'"))]
    BaselineMissing { name: String, registry: String },

    #[snafu(display("Unable to read baseline {}: {source}", path.display()))]
    BaselineRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Unable to parse baseline {}: {source}", path.display()))]
    BaselineParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[snafu(display("Invalid baseline entry for '{name}': {source}"))]
    BaselineVersion {
        name: String,
        source: crate::version::Error,
    },

    #[snafu(display("{registry} registry does not have port '{name}' at version {version}"))]
    VersionNotFound {
        name: String,
        version: Version,
        registry: String,
    },

    #[snafu(display("{source}"))]
    Manifest { source: crate::manifest::Error },

    #[snafu(display(
        "Overlay port at {} names itself '{found}', expected '{expected}'",
        path.display()
    ))]
    OverlayNameMismatch {
        path: PathBuf,
        found: String,
        expected: String,
    },

    #[snafu(display("Unable to start git: {source}"))]
    GitStart { source: std::io::Error },

    #[snafu(display("git {operation} failed for {context}: {message}"))]
    GitCommand {
        operation: String,
        context: String,
        message: String,
    },

    #[snafu(display("Unable to unpack git archive into {}: {source}", path.display()))]
    GitUnpack {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Unable to create registry cache directory {}: {source}", path.display()))]
    CacheDirCreate {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub(crate) type Result<T> = std::result::Result<T, Error>;
