/*!
The concrete binary cache providers.

Every provider maps an ABI key to one stored object and implements three
operations: a cheap existence probe, a fetch, and a store. The files and HTTP
flavors move whole `{sha}.zip` archives; the nuget flavor works in unpacked
trees. Read failures are never fatal to the caller; they surface as misses.
*/

use super::config::{expand_template, CacheAccess, ProviderConfig};
use crate::common::{self, output_unchecked, Redactor};
use crate::spec::PackageSpec;
use snafu::{ensure, ResultExt, Snafu};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub(crate) enum Error {
    #[snafu(display("unable to construct HTTP client: {source}"))]
    HttpClient { source: reqwest::Error },

    #[snafu(display("{operation} {url} failed: {source}"))]
    HttpRequest {
        operation: &'static str,
        url: String,
        source: reqwest::Error,
    },

    #[snafu(display("{operation} {url} returned HTTP {status}"))]
    HttpStatus {
        operation: &'static str,
        url: String,
        status: u16,
    },

    #[snafu(display("unable to read {}: {source}", path.display()))]
    ArchiveRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("unable to write {}: {source}", path.display()))]
    ArchiveWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("{source}"))]
    Subprocess { source: common::Error },

    #[snafu(display("'{tool}' is not available: {source}"))]
    ToolMissing { tool: String, source: which::Error },

    #[snafu(display("nuget install did not produce package {package}"))]
    NugetPackageMissing { package: String },

    #[snafu(display("script providers do not support store"))]
    ScriptStore,
}

type Result<T> = std::result::Result<T, Error>;

/// Identifies one artifact to the cache: its key plus the naming metadata
/// some providers fold into object names.
#[derive(Debug, Clone)]
pub(crate) struct CacheRequest {
    /// The package ABI, hex encoded. The cache key.
    pub(crate) key: String,
    pub(crate) name: String,
    pub(crate) version: String,
    pub(crate) triplet: String,
}

impl CacheRequest {
    pub(crate) fn new(spec: &PackageSpec, version: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: spec.name.clone(),
            version: version.into(),
            triplet: spec.triplet.to_string(),
        }
    }

    fn object_name(&self) -> String {
        format!("{}.zip", self.key)
    }

    /// NuGet package identity for this artifact.
    fn nuget_id(&self) -> String {
        format!("{}_{}", self.name, self.triplet)
    }

    /// The ABI translated into a NuGet-acceptable version string.
    fn nuget_version(&self) -> String {
        format!("1.0.0-{}", self.key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CacheAvailability {
    Available,
    Unavailable,
}

/// What a fetch produced in the staging directory.
#[derive(Debug)]
pub(crate) enum Fetched {
    /// A zip archive landed at this path; the caller verifies and extracts.
    Archive(PathBuf),
    /// The provider populated `<staging>/tree` directly.
    Tree,
    Miss,
}

#[derive(Debug)]
enum ProviderKind {
    Files {
        root: PathBuf,
    },
    Http {
        template: String,
        authorization: Option<String>,
        client: reqwest::Client,
    },
    AzBlob {
        base_url: String,
        sas: String,
        client: reqwest::Client,
    },
    Gcs {
        prefix: String,
    },
    Nuget {
        source: String,
    },
    Script {
        template: String,
    },
}

#[derive(Debug)]
pub(crate) struct Provider {
    kind: ProviderKind,
    pub(crate) access: CacheAccess,
}

impl Provider {
    /// Build a runtime provider from its configuration, registering any
    /// embedded secrets for redaction.
    pub(crate) fn new(
        config: ProviderConfig,
        access: CacheAccess,
        redactor: &Redactor,
        timeout: Duration,
    ) -> Result<Self> {
        let client = || {
            reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .context(HttpClientSnafu)
        };
        let kind = match config {
            ProviderConfig::Files { root } => ProviderKind::Files { root },
            ProviderConfig::Http {
                template,
                authorization,
            } => {
                if let Some(authorization) = &authorization {
                    redactor.add(authorization.clone());
                }
                ProviderKind::Http {
                    template,
                    authorization,
                    client: client()?,
                }
            }
            ProviderConfig::AzBlob { base_url, sas } => {
                redactor.add(sas.clone());
                ProviderKind::AzBlob {
                    base_url,
                    sas,
                    client: client()?,
                }
            }
            ProviderConfig::Gcs { prefix } => ProviderKind::Gcs { prefix },
            ProviderConfig::Nuget { source } => ProviderKind::Nuget { source },
            ProviderConfig::Script { template } => ProviderKind::Script { template },
        };
        Ok(Self { kind, access })
    }

    pub(crate) fn name(&self) -> &'static str {
        match &self.kind {
            ProviderKind::Files { .. } => "files",
            ProviderKind::Http { .. } => "http",
            ProviderKind::AzBlob { .. } => "azblob",
            ProviderKind::Gcs { .. } => "gcs",
            ProviderKind::Nuget { .. } => "nuget",
            ProviderKind::Script { .. } => "script",
        }
    }

    fn files_path(root: &Path, request: &CacheRequest) -> PathBuf {
        root.join(&request.key[..2.min(request.key.len())])
            .join(request.object_name())
    }

    fn http_url(&self, request: &CacheRequest) -> Option<String> {
        match &self.kind {
            ProviderKind::Http { template, .. } => Some(expand_template(
                template,
                &request.key,
                &request.name,
                &request.version,
                &request.triplet,
            )),
            ProviderKind::AzBlob { base_url, sas, .. } => Some(format!(
                "{}/{}?{}",
                base_url.trim_end_matches('/'),
                request.object_name(),
                sas
            )),
            _ => None,
        }
    }

    /// Probe whether the object for `request` exists. Errors count as
    /// unavailable; precheck exists to skip work, not to report problems.
    pub(crate) async fn precheck_one(&self, request: &CacheRequest) -> CacheAvailability {
        let available = match &self.kind {
            ProviderKind::Files { root } => Self::files_path(root, request).is_file(),
            ProviderKind::Http { client, authorization, .. } => {
                let Some(url) = self.http_url(request) else {
                    return CacheAvailability::Unavailable;
                };
                let mut head = client.head(&url);
                if let Some(authorization) = authorization {
                    head = head.header(reqwest::header::AUTHORIZATION, authorization);
                }
                matches!(head.send().await, Ok(resp) if resp.status().is_success())
            }
            ProviderKind::AzBlob { client, .. } => {
                let Some(url) = self.http_url(request) else {
                    return CacheAvailability::Unavailable;
                };
                matches!(client.head(&url).send().await, Ok(resp) if resp.status().is_success())
            }
            ProviderKind::Gcs { prefix } => {
                match self.gcs_stat(prefix, request).await {
                    Ok(found) => found,
                    Err(_) => false,
                }
            }
            // No cheap probe exists for these kinds.
            ProviderKind::Nuget { .. } | ProviderKind::Script { .. } => false,
        };
        if available {
            CacheAvailability::Available
        } else {
            CacheAvailability::Unavailable
        }
    }

    async fn gcs_stat(&self, prefix: &str, request: &CacheRequest) -> Result<bool> {
        let gsutil = which::which("gsutil").context(ToolMissingSnafu { tool: "gsutil" })?;
        let object = format!("{}/{}", prefix.trim_end_matches('/'), request.object_name());
        let mut cmd = Command::new(gsutil);
        cmd.args(["-q", "stat", &object]);
        let out = output_unchecked(&mut cmd).await.context(SubprocessSnafu)?;
        Ok(out.status.success())
    }

    /// Fetch the object for `request` into `staging`.
    pub(crate) async fn fetch(&self, request: &CacheRequest, staging: &Path) -> Result<Fetched> {
        match &self.kind {
            ProviderKind::Files { root } => {
                let object = Self::files_path(root, request);
                if !object.is_file() {
                    return Ok(Fetched::Miss);
                }
                let dest = staging.join(request.object_name());
                tokio::fs::copy(&object, &dest)
                    .await
                    .context(ArchiveReadSnafu { path: &object })?;
                Ok(Fetched::Archive(dest))
            }
            ProviderKind::Http { client, authorization, .. } => {
                let Some(url) = self.http_url(request) else {
                    return Ok(Fetched::Miss);
                };
                let mut get = client.get(&url);
                if let Some(authorization) = authorization {
                    get = get.header(reqwest::header::AUTHORIZATION, authorization);
                }
                self.download(get, &url, request, staging).await
            }
            ProviderKind::AzBlob { client, .. } => {
                let Some(url) = self.http_url(request) else {
                    return Ok(Fetched::Miss);
                };
                self.download(client.get(&url), &url, request, staging).await
            }
            ProviderKind::Gcs { prefix } => {
                let gsutil =
                    which::which("gsutil").context(ToolMissingSnafu { tool: "gsutil" })?;
                let object =
                    format!("{}/{}", prefix.trim_end_matches('/'), request.object_name());
                let dest = staging.join(request.object_name());
                let mut cmd = Command::new(gsutil);
                cmd.arg("-q")
                    .arg("cp")
                    .arg(&object)
                    .arg(&dest);
                let out = output_unchecked(&mut cmd).await.context(SubprocessSnafu)?;
                if out.status.success() && dest.is_file() {
                    Ok(Fetched::Archive(dest))
                } else {
                    Ok(Fetched::Miss)
                }
            }
            ProviderKind::Nuget { source } => self.nuget_fetch(source, request, staging).await,
            ProviderKind::Script { template } => {
                let dest = staging.join(request.object_name());
                let command = expand_template(
                    template,
                    &request.key,
                    &request.name,
                    &request.version,
                    &request.triplet,
                )
                .replace("{dst}", &dest.display().to_string());
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(&command);
                let out = output_unchecked(&mut cmd).await.context(SubprocessSnafu)?;
                if out.status.success() && dest.is_file() {
                    Ok(Fetched::Archive(dest))
                } else {
                    Ok(Fetched::Miss)
                }
            }
        }
    }

    async fn download(
        &self,
        request_builder: reqwest::RequestBuilder,
        url: &str,
        request: &CacheRequest,
        staging: &Path,
    ) -> Result<Fetched> {
        let response = request_builder.send().await.context(HttpRequestSnafu {
            operation: "GET",
            url,
        })?;
        if !response.status().is_success() {
            return Ok(Fetched::Miss);
        }
        let bytes = response.bytes().await.context(HttpRequestSnafu {
            operation: "GET",
            url,
        })?;
        let dest = staging.join(request.object_name());
        tokio::fs::write(&dest, &bytes)
            .await
            .context(ArchiveWriteSnafu { path: &dest })?;
        Ok(Fetched::Archive(dest))
    }

    /// Store the archive (and its unpacked tree, for providers that work in
    /// trees) under the key in `request`.
    pub(crate) async fn store(
        &self,
        request: &CacheRequest,
        archive: &Path,
        tree: &Path,
    ) -> Result<()> {
        match &self.kind {
            ProviderKind::Files { root } => {
                let dest = Self::files_path(root, request);
                if dest.is_file() {
                    // Already stored under this key; content-addressing makes
                    // this a no-op.
                    return Ok(());
                }
                let parent = dest.parent().unwrap_or(root);
                tokio::fs::create_dir_all(parent)
                    .await
                    .context(ArchiveWriteSnafu { path: parent })?;
                let partial = dest.with_extension("zip.part");
                tokio::fs::copy(archive, &partial)
                    .await
                    .context(ArchiveWriteSnafu { path: &partial })?;
                tokio::fs::rename(&partial, &dest)
                    .await
                    .context(ArchiveWriteSnafu { path: &dest })?;
                Ok(())
            }
            ProviderKind::Http { client, authorization, .. } => {
                let url = self.http_url(request).unwrap_or_default();
                let body = tokio::fs::read(archive)
                    .await
                    .context(ArchiveReadSnafu { path: archive })?;
                let mut put = client.put(&url).body(body);
                if let Some(authorization) = authorization {
                    put = put.header(reqwest::header::AUTHORIZATION, authorization);
                }
                let response = put.send().await.context(HttpRequestSnafu {
                    operation: "PUT",
                    url: &url,
                })?;
                ensure!(
                    response.status().is_success(),
                    HttpStatusSnafu {
                        operation: "PUT",
                        url,
                        status: response.status().as_u16(),
                    }
                );
                Ok(())
            }
            ProviderKind::AzBlob { client, .. } => {
                let url = self.http_url(request).unwrap_or_default();
                let body = tokio::fs::read(archive)
                    .await
                    .context(ArchiveReadSnafu { path: archive })?;
                let response = client
                    .put(&url)
                    .header("x-ms-version", "2020-04-08")
                    .header("x-ms-blob-type", "BlockBlob")
                    .body(body)
                    .send()
                    .await
                    .context(HttpRequestSnafu {
                        operation: "PUT",
                        url: &url,
                    })?;
                ensure!(
                    response.status().is_success(),
                    HttpStatusSnafu {
                        operation: "PUT",
                        url,
                        status: response.status().as_u16(),
                    }
                );
                Ok(())
            }
            ProviderKind::Gcs { prefix } => {
                let gsutil =
                    which::which("gsutil").context(ToolMissingSnafu { tool: "gsutil" })?;
                let object =
                    format!("{}/{}", prefix.trim_end_matches('/'), request.object_name());
                let mut cmd = Command::new(gsutil);
                cmd.arg("-q").arg("cp").arg(archive).arg(&object);
                common::output(&mut cmd).await.context(SubprocessSnafu)?;
                Ok(())
            }
            ProviderKind::Nuget { source } => self.nuget_store(source, request, tree).await,
            ProviderKind::Script { .. } => ScriptStoreSnafu.fail(),
        }
    }

    async fn nuget_fetch(
        &self,
        source: &str,
        request: &CacheRequest,
        staging: &Path,
    ) -> Result<Fetched> {
        let nuget = which::which("nuget").context(ToolMissingSnafu { tool: "nuget" })?;
        let id = request.nuget_id();
        let version = request.nuget_version();
        let output_dir = staging.join("nuget");
        let mut cmd = Command::new(nuget);
        cmd.args(["install", &id, "-Version", &version, "-Source", source])
            .args(["-OutputDirectory"])
            .arg(&output_dir)
            .args(["-NonInteractive", "-DirectDownload", "-DependencyVersion", "Ignore"]);
        let out = output_unchecked(&mut cmd).await.context(SubprocessSnafu)?;
        if !out.status.success() {
            return Ok(Fetched::Miss);
        }

        let package_dir = output_dir.join(format!("{id}.{version}"));
        if !package_dir.is_dir() {
            return Ok(Fetched::Miss);
        }
        let tree = staging.join("tree");
        tokio::fs::rename(&package_dir, &tree)
            .await
            .context(ArchiveWriteSnafu { path: &tree })?;
        // Drop NuGet's own bookkeeping so it never lands in the installed
        // tree.
        for name in [format!("{id}.{version}.nupkg"), format!("{id}.nuspec")] {
            let _ = tokio::fs::remove_file(tree.join(name)).await;
        }
        Ok(Fetched::Tree)
    }

    async fn nuget_store(&self, source: &str, request: &CacheRequest, tree: &Path) -> Result<()> {
        let nuget = which::which("nuget").context(ToolMissingSnafu { tool: "nuget" })?;
        let id = request.nuget_id();
        let version = request.nuget_version();

        let work = tempfile::tempdir().map_err(|source| Error::ArchiveWrite {
            path: PathBuf::from("tempdir"),
            source,
        })?;
        let nuspec_path = work.path().join(format!("{id}.nuspec"));
        let nuspec = format!(
            r#"<?xml version="1.0"?>
<package>
  <metadata>
    <id>{id}</id>
    <version>{version}</version>
    <authors>portsys</authors>
    <description>{name} {pkg_version} for {triplet}; ABI {key}</description>
  </metadata>
  <files>
    <file src="{src}/**" target="" />
  </files>
</package>
"#,
            name = request.name,
            pkg_version = request.version,
            triplet = request.triplet,
            key = request.key,
            src = tree.display(),
        );
        tokio::fs::write(&nuspec_path, nuspec)
            .await
            .context(ArchiveWriteSnafu { path: &nuspec_path })?;

        let mut pack = Command::new(&nuget);
        pack.arg("pack")
            .arg(&nuspec_path)
            .args(["-OutputDirectory"])
            .arg(work.path())
            .args(["-NoDefaultExcludes", "-NonInteractive"]);
        common::output(&mut pack).await.context(SubprocessSnafu)?;

        let package = work.path().join(format!("{id}.{version}.nupkg"));
        ensure!(
            package.is_file(),
            NugetPackageMissingSnafu {
                package: package.display().to_string(),
            }
        );

        let mut push = Command::new(&nuget);
        push.arg("push")
            .arg(&package)
            .args(["-Source", source, "-NonInteractive", "-ApiKey", "portsys"]);
        common::output(&mut push).await.context(SubprocessSnafu)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::Triplet;

    fn request() -> CacheRequest {
        CacheRequest::new(
            &PackageSpec::new("zlib", Triplet::from("x64-linux")),
            "1.2.13",
            "aabbccdd00112233",
        )
    }

    fn files_provider(root: &Path, access: CacheAccess) -> Provider {
        Provider::new(
            ProviderConfig::Files {
                root: root.to_path_buf(),
            },
            access,
            &Redactor::new(),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn files_store_is_idempotent_and_sharded() {
        let cache = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let archive = work.path().join("artifact.zip");
        std::fs::write(&archive, b"zip bytes").unwrap();

        let provider = files_provider(cache.path(), CacheAccess::ReadWrite);
        let req = request();
        provider.store(&req, &archive, work.path()).await.unwrap();
        provider.store(&req, &archive, work.path()).await.unwrap();

        let stored = cache.path().join("aa").join("aabbccdd00112233.zip");
        assert!(stored.is_file());
        assert_eq!(std::fs::read(&stored).unwrap(), b"zip bytes");
        // No stray partial files remain.
        assert_eq!(
            std::fs::read_dir(stored.parent().unwrap())
                .unwrap()
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn files_precheck_and_fetch() {
        let cache = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let provider = files_provider(cache.path(), CacheAccess::Read);
        let req = request();

        assert_eq!(
            provider.precheck_one(&req).await,
            CacheAvailability::Unavailable
        );
        assert!(matches!(
            provider.fetch(&req, staging.path()).await.unwrap(),
            Fetched::Miss
        ));

        let shard = cache.path().join("aa");
        std::fs::create_dir_all(&shard).unwrap();
        std::fs::write(shard.join("aabbccdd00112233.zip"), b"zip bytes").unwrap();

        assert_eq!(
            provider.precheck_one(&req).await,
            CacheAvailability::Available
        );
        match provider.fetch(&req, staging.path()).await.unwrap() {
            Fetched::Archive(path) => {
                assert_eq!(std::fs::read(path).unwrap(), b"zip bytes");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn script_provider_runs_the_template() {
        let staging = tempfile::tempdir().unwrap();
        let provider = Provider::new(
            ProviderConfig::Script {
                template: "printf %s {sha} > {dst}".to_string(),
            },
            CacheAccess::Read,
            &Redactor::new(),
            Duration::from_secs(5),
        )
        .unwrap();

        let req = request();
        match provider.fetch(&req, staging.path()).await.unwrap() {
            Fetched::Archive(path) => {
                assert_eq!(std::fs::read_to_string(path).unwrap(), "aabbccdd00112233");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn secrets_register_at_construction() {
        let redactor = Redactor::new();
        let _provider = Provider::new(
            ProviderConfig::AzBlob {
                base_url: "https://account.blob.example/container".to_string(),
                sas: "sv=2022&sig=verysecret".to_string(),
            },
            CacheAccess::ReadWrite,
            &redactor,
            Duration::from_secs(5),
        )
        .unwrap();
        let message = redactor
            .redact("PUT https://account.blob.example/container/k.zip?sv=2022&sig=verysecret");
        assert!(!message.contains("verysecret"));
    }
}
