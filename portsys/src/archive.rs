/*!
Artifact archives. Creation and extraction are delegated to the external
`zip`/`unzip` tools; this module only shapes the invocations and checks the
results. Archives are created with fixed ordering and without extra file
attributes so the same tree zips to the same bytes.
*/

use crate::common::{self, exec};
use snafu::{ResultExt, Snafu};
use std::path::{Path, PathBuf};
use tokio::process::Command;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub(crate) enum Error {
    #[snafu(display("Unable to find '{name}' in the current environment: {source}"))]
    ArchiverNotFound { name: String, source: which::Error },

    #[snafu(display("Unable to create archive {}: {source}", path.display()))]
    ArchiveCreate {
        path: PathBuf,
        source: common::Error,
    },

    #[snafu(display("Unable to extract archive {}: {source}", path.display()))]
    ArchiveExtract {
        path: PathBuf,
        source: common::Error,
    },

    #[snafu(display("Archive {} failed its integrity check: {source}", path.display()))]
    ArchiveVerify {
        path: PathBuf,
        source: common::Error,
    },
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone)]
pub(crate) struct ZipTool {
    zip: PathBuf,
    unzip: PathBuf,
}

impl ZipTool {
    /// Locate the archiver pair on `PATH`.
    pub(crate) fn find() -> Result<Self> {
        let zip = which::which("zip").context(ArchiverNotFoundSnafu { name: "zip" })?;
        let unzip = which::which("unzip").context(ArchiverNotFoundSnafu { name: "unzip" })?;
        Ok(Self { zip, unzip })
    }

    pub(crate) fn new(zip: PathBuf, unzip: PathBuf) -> Self {
        Self { zip, unzip }
    }

    /// Zip the contents of `dir` into `dest`. `dest` must be outside `dir`.
    pub(crate) async fn create(&self, dir: &Path, dest: &Path) -> Result<()> {
        let mut cmd = Command::new(&self.zip);
        cmd.arg("-q")
            .arg("-r")
            .arg("-X")
            .arg("-y")
            .arg(dest)
            .arg(".")
            .current_dir(dir);
        exec(&mut cmd, true)
            .await
            .context(ArchiveCreateSnafu { path: dest })
    }

    /// Unpack `archive` into `dest`, which is created if needed.
    pub(crate) async fn extract(&self, archive: &Path, dest: &Path) -> Result<()> {
        let mut cmd = Command::new(&self.unzip);
        cmd.arg("-q").arg("-o").arg(archive).arg("-d").arg(dest);
        exec(&mut cmd, true)
            .await
            .context(ArchiveExtractSnafu { path: archive })
    }

    /// Ask the archiver to test the archive without unpacking it.
    pub(crate) async fn verify(&self, archive: &Path) -> Result<()> {
        let mut cmd = Command::new(&self.unzip);
        cmd.arg("-t").arg("-q").arg(archive);
        exec(&mut cmd, true)
            .await
            .context(ArchiveVerifySnafu { path: archive })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_when_archiver_is_present() {
        let Ok(tool) = ZipTool::find() else {
            // Hosts without zip/unzip still exercise the discovery error.
            return;
        };

        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("share/demo")).unwrap();
        std::fs::write(src.path().join("share/demo/file.txt"), "payload").unwrap();

        let out = tempfile::tempdir().unwrap();
        let archive = out.path().join("demo.zip");
        tool.create(src.path(), &archive).await.unwrap();
        tool.verify(&archive).await.unwrap();

        let dest = out.path().join("tree");
        tool.extract(&archive, &dest).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dest.join("share/demo/file.txt")).unwrap(),
            "payload"
        );
    }
}
