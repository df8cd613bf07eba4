//! The public entry point.
//!
//! A [`Session`] owns everything fetchers share: the HTTP client, the
//! in-memory packument LRU, the git ref TTL cache and the tables that
//! coalesce concurrent identical requests. Clones share one state.

use crate::error::FetchError;
use crate::fetcher::Fetcher;
use crate::finalize::finalize;
use crate::git::GitRefSet;
use crate::inflight::Inflight;
use crate::manifest::{Manifest, Packument};
use crate::memo::{Clock, PackumentCache, SystemClock, TtlCache, GIT_REFS_TTL, PACKUMENT_CAPACITY};
use crate::options::Options;
use crate::registry::RegistryClient;
use crate::retrieve::{Retrieved, TieredRetriever};
use crate::spec::{PackageSpec, SpecType};
use crate::stream::TarballStream;
use crate::tarball::{self, ExtractOptions};
use bytes::Bytes;
use futures::TryStreamExt;
use pakfetch_util::fs::{persist, temp_sibling};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Identity of a manifest request for coalescing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ManifestKey {
    name: Option<String>,
    raw: String,
    spec_type: SpecType,
    cache: Option<PathBuf>,
    registry: String,
    scope: Option<String>,
    integrity: Option<String>,
    full_metadata: bool,
    default_tag: String,
}

impl ManifestKey {
    fn new(spec: &PackageSpec, opts: &Options) -> Self {
        Self {
            name: spec.name.clone(),
            raw: spec.raw.clone(),
            spec_type: spec.spec_type(),
            cache: opts.cache.clone(),
            registry: opts.registry_for(spec).to_string(),
            scope: spec.scope.clone(),
            integrity: opts.integrity.clone(),
            full_metadata: opts.full_metadata,
            default_tag: opts.default_tag.clone(),
        }
    }
}

/// State shared by every fetcher of a session.
#[derive(Debug)]
pub(crate) struct SessionState {
    pub(crate) registry: RegistryClient,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) packuments: PackumentCache,
    pub(crate) packument_flights: Inflight<String, Result<(Arc<Packument>, bool), FetchError>>,
    pub(crate) git_refs: TtlCache<String, Arc<GitRefSet>>,
    pub(crate) ref_flights: Inflight<String, Result<Arc<GitRefSet>, FetchError>>,
    pub(crate) manifest_flights: Inflight<ManifestKey, Result<Manifest, FetchError>>,
}

/// Where a tarball came from and what it hashed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarballInfo {
    pub resolved: Option<String>,
    pub integrity: Option<String>,
}

impl<T> From<&Retrieved<T>> for TarballInfo {
    fn from(retrieved: &Retrieved<T>) -> Self {
        Self {
            resolved: retrieved.resolved.clone(),
            integrity: retrieved.integrity.as_ref().map(ToString::to_string),
        }
    }
}

/// A downloaded tarball held in memory.
#[derive(Debug, Clone)]
pub struct FetchedTarball {
    pub data: Bytes,
    pub info: TarballInfo,
}

#[derive(Debug, Clone)]
pub struct Session {
    state: Arc<SessionState>,
}

impl Session {
    /// # Errors
    /// Returns `Http` if the HTTP client cannot be created.
    pub fn new() -> Result<Self, FetchError> {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// A session whose TTL caches read time from `clock`.
    ///
    /// # Errors
    /// Returns `Http` if the HTTP client cannot be created.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Result<Self, FetchError> {
        Ok(Self {
            state: Arc::new(SessionState {
                registry: RegistryClient::new()?,
                git_refs: TtlCache::new(GIT_REFS_TTL, Arc::clone(&clock)),
                clock,
                packuments: PackumentCache::new(PACKUMENT_CAPACITY),
                packument_flights: Inflight::new(),
                ref_flights: Inflight::new(),
                manifest_flights: Inflight::new(),
            }),
        })
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.state.clock
    }

    /// Parse `spec` and pick its fetcher.
    ///
    /// # Errors
    /// Returns `SpecInvalid` for malformed specs.
    pub fn fetcher(&self, spec: &str, opts: &Options) -> Result<Fetcher, FetchError> {
        let parsed = PackageSpec::parse(spec, &opts.where_)?;
        Fetcher::for_spec(parsed, opts.clone(), Arc::clone(&self.state))
    }

    /// Resolved location of `spec`.
    ///
    /// # Errors
    /// See [`Fetcher::resolve`].
    pub async fn resolve(&self, spec: &str, opts: &Options) -> Result<String, FetchError> {
        self.fetcher(spec, opts)?.resolve().await
    }

    /// Finalized manifest of `spec`. Concurrent identical requests share
    /// one fetch.
    ///
    /// # Errors
    /// Spec, network, git and integrity errors.
    pub async fn manifest(&self, spec: &str, opts: &Options) -> Result<Manifest, FetchError> {
        let parsed = PackageSpec::parse(spec, &opts.where_)?;
        let key = ManifestKey::new(&parsed, opts);
        let fetcher = Fetcher::for_spec(parsed, opts.clone(), Arc::clone(&self.state))?;
        self.state
            .manifest_flights
            .run(key, move || async move { finalized_manifest(&fetcher).await })
            .await
    }

    /// Packument of `spec`. Non-registry specs get a one-version packument.
    ///
    /// # Errors
    /// See [`Fetcher::packument`].
    pub async fn packument(&self, spec: &str, opts: &Options) -> Result<Packument, FetchError> {
        self.fetcher(spec, opts)?.packument().await
    }

    /// Hand the tarball of `spec` to `handler` as a verified stream.
    ///
    /// # Errors
    /// The handler's error or the retrieval error.
    pub async fn tarball_stream<T, F, Fut>(
        &self,
        spec: &str,
        opts: &Options,
        handler: F,
    ) -> Result<Retrieved<T>, FetchError>
    where
        F: Fn(TarballStream) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let fetcher = self.fetcher(spec, opts)?;
        let manifest = raw_manifest_for_tarball(&fetcher).await?;
        TieredRetriever::new(&fetcher)
            .with_tarball_stream(manifest.as_ref(), None, handler)
            .await
    }

    /// Whole tarball in memory.
    ///
    /// # Errors
    /// See [`tarball_stream`](Self::tarball_stream).
    pub async fn tarball(&self, spec: &str, opts: &Options) -> Result<FetchedTarball, FetchError> {
        let retrieved = self
            .tarball_stream(spec, opts, |tarball| tarball.collect())
            .await?;
        Ok(FetchedTarball {
            info: TarballInfo::from(&retrieved),
            data: retrieved.value,
        })
    }

    /// Write the tarball to `dest`, atomically.
    ///
    /// # Errors
    /// See [`tarball_stream`](Self::tarball_stream); `Io` if `dest` cannot
    /// be written.
    pub async fn tarball_to_file(
        &self,
        spec: &str,
        dest: &Path,
        opts: &Options,
    ) -> Result<TarballInfo, FetchError> {
        let dest = opts.resolve_path(dest);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let fetcher = self.fetcher(spec, opts)?;
        let manifest = raw_manifest_for_tarball(&fetcher).await?;
        let retrieved = TieredRetriever::new(&fetcher)
            .with_tarball_stream(manifest.as_ref(), Some(&dest), |tarball| {
                write_to_file(tarball, dest.clone())
            })
            .await?;
        info!(spec, dest = %dest.display(), "saved tarball");
        Ok(TarballInfo::from(&retrieved))
    }

    /// Unpack the tarball into `dest`, marking declared bins executable.
    ///
    /// # Errors
    /// See [`tarball_stream`](Self::tarball_stream); `Tar` for malformed
    /// archives.
    pub async fn extract(
        &self,
        spec: &str,
        dest: &Path,
        opts: &Options,
    ) -> Result<TarballInfo, FetchError> {
        let dest = opts.resolve_path(dest);
        let fetcher = self.fetcher(spec, opts)?;
        let manifest = fetcher.manifest().await?;
        let bins = manifest
            .as_ref()
            .map(|m| m.bin.values().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        let extract_opts = ExtractOptions::from_options(opts).with_exec_paths(bins);

        let retrieved = TieredRetriever::new(&fetcher)
            .with_tarball_stream(manifest.as_ref(), Some(&dest), |tarball| {
                tarball::extract(tarball.stream, &dest, extract_opts.clone())
            })
            .await?;
        info!(spec, dest = %dest.display(), "extracted package");
        Ok(TarballInfo::from(&retrieved))
    }
}

/// Raw manifest, provenance filled in, then finalized.
async fn finalized_manifest(fetcher: &Fetcher) -> Result<Manifest, FetchError> {
    let mut raw = fetcher.manifest().await?.unwrap_or_default();
    if raw.resolved.is_none() {
        raw.resolved = Some(fetcher.resolve().await?);
    }
    if raw.integrity.is_none() {
        raw.integrity.clone_from(&fetcher.options().integrity);
    }
    debug!(spec = %fetcher.spec(), "finalizing manifest");
    finalize(fetcher, raw).await
}

/// The raw manifest, skipped when the caller already pinned both the
/// location and the digest.
async fn raw_manifest_for_tarball(fetcher: &Fetcher) -> Result<Option<Manifest>, FetchError> {
    let opts = fetcher.options();
    if opts.resolved.is_some() && opts.integrity.is_some() {
        return Ok(None);
    }
    fetcher.manifest().await
}

/// Stream into a temp sibling of `dest` and rename into place.
async fn write_to_file(tarball: TarballStream, dest: PathBuf) -> Result<(), FetchError> {
    let tmp = temp_sibling(&dest);
    let result = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        let mut stream = tarball.stream;
        while let Some(chunk) = stream.try_next().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        persist(&tmp, &dest)?;
        Ok::<(), FetchError>(())
    }
    .await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}
