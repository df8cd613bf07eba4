//! One fetcher per specifier type.
//!
//! Every fetcher answers the same questions: the raw manifest it can produce
//! without downloading, the resolved location, the packument, and a tarball
//! byte stream. Finalization and tiered retrieval sit on top, shared by all.

mod directory;
mod file;
mod git;
mod registry;
mod remote;

pub use directory::DirectoryFetcher;
pub use file::FileFetcher;
pub use git::GitFetcher;
pub use registry::RegistryFetcher;
pub use remote::RemoteFetcher;

use crate::cache::ContentCache;
use crate::error::FetchError;
use crate::integrity::Integrity;
use crate::manifest::{Manifest, Packument};
use crate::options::Options;
use crate::session::SessionState;
use crate::spec::{PackageSpec, SpecType};
use crate::stream::{self, TarballStream};
use futures::future::{BoxFuture, FutureExt};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// What every fetcher is built from.
#[derive(Debug, Clone)]
pub struct FetchContext {
    pub spec: PackageSpec,
    pub opts: Options,
    pub(crate) state: Arc<SessionState>,
}

impl FetchContext {
    pub(crate) fn new(spec: PackageSpec, opts: Options, state: Arc<SessionState>) -> Self {
        Self { spec, opts, state }
    }

    /// Integrity the caller asked for, if it parses.
    pub(crate) fn expected_integrity(&self) -> Option<Integrity> {
        let raw = self.opts.integrity.as_deref()?;
        match Integrity::parse(raw) {
            Ok(integrity) => Some(integrity),
            Err(e) => {
                warn!(spec = %self.spec, error = %e, "ignoring unparseable integrity option");
                None
            }
        }
    }
}

/// Fetcher for one specifier, chosen by its type.
#[derive(Debug, Clone)]
pub enum Fetcher {
    Registry(RegistryFetcher),
    Git(GitFetcher),
    File(FileFetcher),
    Directory(DirectoryFetcher),
    Remote(RemoteFetcher),
    /// `npm:` alias; everything is answered by the aliased spec's fetcher.
    Alias(Box<Fetcher>),
}

impl Fetcher {
    /// Pick the fetcher for `spec`.
    ///
    /// # Errors
    /// Returns `SpecInvalid` for an alias without a target.
    pub(crate) fn for_spec(
        spec: PackageSpec,
        opts: Options,
        state: Arc<SessionState>,
    ) -> Result<Self, FetchError> {
        Ok(match spec.spec_type() {
            SpecType::Alias => {
                let Some(sub) = spec.sub_spec else {
                    return Err(FetchError::spec_invalid(&spec.raw, "alias without a target"));
                };
                Self::Alias(Box::new(Self::for_spec(*sub, opts, state)?))
            }
            SpecType::Tag | SpecType::Version | SpecType::Range => {
                Self::Registry(RegistryFetcher::new(FetchContext::new(spec, opts, state))?)
            }
            SpecType::Git => Self::Git(GitFetcher::new(FetchContext::new(spec, opts, state))),
            SpecType::File => Self::File(FileFetcher::new(FetchContext::new(spec, opts, state))),
            SpecType::Directory => {
                Self::Directory(DirectoryFetcher::new(FetchContext::new(spec, opts, state)))
            }
            SpecType::Remote => Self::Remote(RemoteFetcher::new(FetchContext::new(spec, opts, state))),
        })
    }

    /// The spec this fetcher was built for. Aliases answer with the target.
    #[must_use]
    pub fn spec(&self) -> &PackageSpec {
        &self.context().spec
    }

    #[must_use]
    pub fn options(&self) -> &Options {
        &self.context().opts
    }

    fn context(&self) -> &FetchContext {
        match self {
            Self::Registry(f) => &f.ctx,
            Self::Git(f) => &f.ctx,
            Self::File(f) => &f.ctx,
            Self::Directory(f) => &f.ctx,
            Self::Remote(f) => &f.ctx,
            Self::Alias(inner) => inner.context(),
        }
    }

    /// The manifest knowable without downloading the tarball, if any.
    pub fn manifest(&self) -> BoxFuture<'_, Result<Option<Manifest>, FetchError>> {
        match self {
            Self::Registry(f) => async move { f.manifest().await.map(Some) }.boxed(),
            Self::Git(f) => async move { f.manifest().await.map(Some) }.boxed(),
            Self::Directory(f) => async move { f.manifest().await.map(Some) }.boxed(),
            Self::File(_) | Self::Remote(_) => async { Ok(None) }.boxed(),
            Self::Alias(inner) => inner.manifest(),
        }
    }

    /// Resolved location: tarball URL, `git+url#sha`, or absolute path.
    pub fn resolve(&self) -> BoxFuture<'_, Result<String, FetchError>> {
        match self {
            Self::Registry(f) => f.resolve().boxed(),
            Self::Git(f) => f.resolve().boxed(),
            Self::File(f) => async move { Ok(f.resolve()) }.boxed(),
            Self::Directory(f) => async move { Ok(f.resolve()) }.boxed(),
            Self::Remote(f) => async move { Ok(f.resolve()) }.boxed(),
            Self::Alias(inner) => inner.resolve(),
        }
    }

    /// Open a tarball stream from the fetcher's own source.
    pub fn tarball(&self) -> BoxFuture<'_, Result<TarballStream, FetchError>> {
        match self {
            Self::Registry(f) => f.tarball().boxed(),
            Self::Git(f) => f.tarball().boxed(),
            Self::File(f) => f.tarball().boxed(),
            Self::Directory(f) => f.tarball().boxed(),
            Self::Remote(f) => f.tarball().boxed(),
            Self::Alias(inner) => inner.tarball(),
        }
    }

    /// Open a tarball stream for an already resolved manifest.
    pub fn from_manifest<'a>(
        &'a self,
        manifest: &'a Manifest,
    ) -> BoxFuture<'a, Result<TarballStream, FetchError>> {
        match self {
            Self::Registry(f) => f.from_manifest(manifest).boxed(),
            Self::Git(f) => f.from_manifest(manifest).boxed(),
            Self::File(f) => f.tarball().boxed(),
            Self::Directory(f) => f.tarball().boxed(),
            Self::Remote(f) => f.tarball().boxed(),
            Self::Alias(inner) => inner.from_manifest(manifest),
        }
    }

    /// The packument. Non-registry sources synthesize a one-version
    /// packument from their manifest, reading package.json out of the
    /// tarball when the manifest alone lacks name or version.
    pub fn packument(&self) -> BoxFuture<'_, Result<Packument, FetchError>> {
        match self {
            Self::Registry(f) => f.packument().boxed(),
            Self::Alias(inner) => inner.packument(),
            _ => async move {
                let mut manifest = self.manifest().await?.unwrap_or_default();
                if manifest.name.is_empty() || manifest.version.is_empty() {
                    let tarball = self.tarball().await?;
                    let contents = crate::tarball::scan(tarball.stream, None).await?;
                    let Some(pkg) = contents.package_json else {
                        return Err(FetchError::no_package_json(&self.spec().raw));
                    };
                    manifest.fill_from(Manifest::from_package_json(&pkg));
                }
                Ok(synthesize_packument(&manifest, &self.options().default_tag))
            }
            .boxed(),
        }
    }

    /// Whether fetching from the source goes over the network.
    #[must_use]
    pub fn needs_network(&self) -> bool {
        match self {
            Self::Registry(_) | Self::Git(_) | Self::Remote(_) => true,
            Self::File(_) | Self::Directory(_) => false,
            Self::Alias(inner) => inner.needs_network(),
        }
    }

    /// Forget memoized packuments and git refs for this spec.
    pub fn clear_memoized(&self) {
        match self {
            Self::Registry(f) => f.clear_memoized(),
            Self::Git(f) => f.clear_memoized(),
            Self::Alias(inner) => inner.clear_memoized(),
            Self::File(_) | Self::Directory(_) | Self::Remote(_) => {}
        }
    }
}

/// One-version packument around `manifest`.
#[must_use]
pub fn synthesize_packument(manifest: &Manifest, default_tag: &str) -> Packument {
    let doc = serde_json::to_value(manifest).unwrap_or(Value::Null);
    Packument {
        name: manifest.name.clone(),
        dist_tags: BTreeMap::from([(default_tag.to_string(), manifest.version.clone())]),
        versions: BTreeMap::from([(manifest.version.clone(), doc)]),
        modified: None,
    }
}

/// Write `tarball` into the cache under `key` while passing it through.
///
/// The cache branch runs on its own task. Its outcome is awaited at the end
/// of the caller's branch: a digest mismatch fails the caller's stream, a
/// store failure is logged and the data already delivered stands. The
/// digest the cache computed is published on the signals.
pub(crate) fn tee_to_cache(
    tarball: TarballStream,
    cache: Option<ContentCache>,
    key: String,
    expected: Option<Integrity>,
    metadata: Value,
) -> TarballStream {
    let Some(cache) = cache else {
        return tarball;
    };
    let signals = tarball.signals.clone();
    let (to_cache, to_caller) = stream::tee_pair(tarball.stream);

    let writer = tokio::spawn(async move {
        cache.write_stream(&key, to_cache, expected, metadata).await
    });
    let published = signals.clone();
    let done = async move {
        match writer.await {
            Ok(Ok(integrity)) => {
                published.set_integrity(integrity);
                Ok(())
            }
            Ok(Err(e)) if matches!(e, FetchError::Cache { .. }) => {
                warn!(error = %e, "failed to write tarball to cache");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(e) => {
                warn!(error = %e, "cache writer task failed");
                Ok(())
            }
        }
    }
    .boxed();

    TarballStream {
        stream: stream::with_completion(to_caller, done),
        signals,
    }
}

/// Index metadata recorded next to cached tarballs.
pub(crate) fn cache_metadata(spec: &PackageSpec, resolved: &str) -> Value {
    json!({ "spec": spec.raw, "resolved": resolved })
}
