/*!
Orchestration across the configured cache providers.

Contracts kept here: reads try providers in declaration order and the first
restore wins; writes go to every write provider in declaration order and
failures only warn; each key is fetched at most once per process, with
concurrent requests coalesced onto the first; restores are staged, verified,
and renamed into place atomically; and everything logged passes through the
secret redactor.
*/

use super::config::ConfiguredProvider;
use super::provider::{CacheAvailability, CacheRequest, Fetched, Provider};
use super::{staging_dir, CacheLock, LockBehavior};
use crate::archive::ZipTool;
use crate::common::Redactor;
use futures::stream::{self, StreamExt};
use log::{debug, warn};
use snafu::{ResultExt, Snafu};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub(crate) enum Error {
    #[snafu(display("{source}"))]
    Provider { source: super::provider::Error },

    #[snafu(display("{source}"))]
    Lock { source: super::Error },
}

type Result<T> = std::result::Result<T, Error>;

/// Failures on the restore path; all of them downgrade to a provider miss.
#[derive(Debug, Snafu)]
enum RestoreError {
    #[snafu(context(false), display("{source}"))]
    Fetch { source: super::provider::Error },

    #[snafu(context(false), display("{source}"))]
    Archive { source: crate::archive::Error },

    #[snafu(display("unable to stage restore: {source}"))]
    Staging { source: super::Error },

    #[snafu(display("unable to move restored tree into {}: {source}", path.display()))]
    Promote {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub(crate) struct BinaryCache {
    providers: Vec<Provider>,
    zip: ZipTool,
    redactor: Redactor,
    concurrency: usize,
    _lock: Option<CacheLock>,
    /// Per-key result cells; a second fetch of a key awaits the first and
    /// reuses its outcome.
    inflight: Mutex<HashMap<String, Arc<Mutex<Option<bool>>>>>,
}

impl BinaryCache {
    pub(crate) fn new(
        configured: Vec<ConfiguredProvider>,
        zip: ZipTool,
        redactor: Redactor,
        concurrency: usize,
        timeout: Duration,
        lock_behavior: LockBehavior,
    ) -> Result<Self> {
        let mut providers = Vec::with_capacity(configured.len());
        let mut lock = None;
        for declared in configured {
            let provider = Provider::new(declared.config.clone(), declared.access, &redactor, timeout)
                .context(ProviderSnafu)?;
            // Multiple processes may write the same local cache; take the
            // advisory lock on the first writable files root.
            if lock.is_none() && declared.access.write() {
                if let super::config::ProviderConfig::Files { root } = &declared.config {
                    lock = Some(CacheLock::acquire(root, lock_behavior).context(LockSnafu)?);
                }
            }
            providers.push(provider);
        }
        Ok(Self {
            providers,
            zip,
            redactor,
            concurrency: concurrency.max(1),
            _lock: lock,
            inflight: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn has_write_providers(&self) -> bool {
        self.providers.iter().any(|p| p.access.write())
    }

    /// Bulk precheck: for every request, the index of the first provider
    /// that reports the key available. Providers are polled in declaration
    /// order; within one provider the probes run in parallel, bounded by
    /// the configured concurrency and the plan size.
    pub(crate) async fn precheck(&self, requests: &[CacheRequest]) -> Vec<Option<usize>> {
        let mut availability: Vec<Option<usize>> = vec![None; requests.len()];
        for (provider_index, provider) in self.providers.iter().enumerate() {
            if !provider.access.read() {
                continue;
            }
            let pending: Vec<usize> = availability
                .iter()
                .enumerate()
                .filter(|(_, hit)| hit.is_none())
                .map(|(index, _)| index)
                .collect();
            if pending.is_empty() {
                break;
            }
            let limit = self.concurrency.min(pending.len()).max(1);
            let results: Vec<(usize, CacheAvailability)> = stream::iter(
                pending
                    .into_iter()
                    .map(|index| async move { (index, provider.precheck_one(&requests[index]).await) }),
            )
            .buffer_unordered(limit)
            .collect()
            .await;
            for (index, result) in results {
                if result == CacheAvailability::Available {
                    availability[index] = Some(provider_index);
                }
            }
        }
        availability
    }

    /// Try to restore `request` into `install_dir`. Returns whether anything
    /// was restored. At most one real fetch happens per key; later callers
    /// get the recorded outcome.
    pub(crate) async fn fetch(
        &self,
        request: &CacheRequest,
        install_dir: &Path,
        staging_base: &Path,
    ) -> bool {
        let cell = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(request.key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(None)))
                .clone()
        };
        let mut slot = cell.lock().await;
        if let Some(outcome) = *slot {
            return outcome;
        }

        let mut restored = false;
        for provider in &self.providers {
            if !provider.access.read() {
                continue;
            }
            match self
                .try_restore(provider, request, install_dir, staging_base)
                .await
            {
                Ok(true) => {
                    debug!("Restored {} from the {} provider", request.key, provider.name());
                    restored = true;
                    break;
                }
                Ok(false) => {}
                Err(e) => {
                    // Read errors are a provider miss, never a failure.
                    debug!(
                        "{} provider could not restore {}: {}",
                        provider.name(),
                        request.key,
                        self.redactor.redact(e.to_string())
                    );
                }
            }
        }
        *slot = Some(restored);
        restored
    }

    async fn try_restore(
        &self,
        provider: &Provider,
        request: &CacheRequest,
        install_dir: &Path,
        staging_base: &Path,
    ) -> std::result::Result<bool, RestoreError> {
        let staging = staging_dir(staging_base).context(StagingSnafu)?;
        let outcome = self
            .restore_in_staging(provider, request, install_dir, &staging)
            .await;
        let _ = tokio::fs::remove_dir_all(&staging).await;
        outcome
    }

    async fn restore_in_staging(
        &self,
        provider: &Provider,
        request: &CacheRequest,
        install_dir: &Path,
        staging: &Path,
    ) -> std::result::Result<bool, RestoreError> {
        let tree = staging.join("tree");
        match provider.fetch(request, staging).await? {
            Fetched::Miss => Ok(false),
            Fetched::Archive(archive) => {
                if let Err(e) = self.zip.verify(&archive).await {
                    debug!(
                        "discarding corrupt archive for {}: {}",
                        request.key,
                        self.redactor.redact(e.to_string())
                    );
                    return Ok(false);
                }
                self.zip.extract(&archive, &tree).await?;
                self.promote(&tree, install_dir).await?;
                Ok(true)
            }
            Fetched::Tree => {
                if !tree.is_dir() {
                    return Ok(false);
                }
                self.promote(&tree, install_dir).await?;
                Ok(true)
            }
        }
    }

    /// Atomically replace `install_dir` with the verified tree.
    async fn promote(&self, tree: &Path, install_dir: &Path) -> std::result::Result<(), RestoreError> {
        if install_dir.exists() {
            tokio::fs::remove_dir_all(install_dir)
                .await
                .context(PromoteSnafu { path: install_dir })?;
        }
        if let Some(parent) = install_dir.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context(PromoteSnafu { path: install_dir })?;
        }
        tokio::fs::rename(tree, install_dir)
            .await
            .context(PromoteSnafu { path: install_dir })?;
        Ok(())
    }

    /// Archive `installed_tree` and offer it to every write provider, in
    /// declaration order. Store failures are warnings; the build already
    /// succeeded.
    pub(crate) async fn store(
        &self,
        request: &CacheRequest,
        installed_tree: &Path,
        staging_base: &Path,
    ) {
        if !self.has_write_providers() {
            return;
        }
        let staging = match staging_dir(staging_base) {
            Ok(staging) => staging,
            Err(e) => {
                warn!("skipping cache upload of {}: {e}", request.key);
                return;
            }
        };
        let archive = staging.join(format!("{}.zip", request.key));
        if let Err(e) = self.zip.create(installed_tree, &archive).await {
            warn!(
                "skipping cache upload of {}: {}",
                request.key,
                self.redactor.redact(e.to_string())
            );
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return;
        }

        for provider in &self.providers {
            if !provider.access.write() {
                continue;
            }
            match provider.store(request, &archive, installed_tree).await {
                Ok(()) => debug!(
                    "Stored {} to the {} provider",
                    request.key,
                    provider.name()
                ),
                Err(e) => warn!(
                    "{} provider failed to store {}: {}",
                    provider.name(),
                    request.key,
                    self.redactor.redact(e.to_string())
                ),
            }
        }
        let _ = tokio::fs::remove_dir_all(&staging).await;
    }
}
