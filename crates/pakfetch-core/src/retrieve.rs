//! Tiered tarball retrieval.
//!
//! With a known integrity the cheapest source wins: a local file named by
//! `resolved`, then the content cache by digest, then the fetcher's own
//! source. Every byte handed to a consumer is verified on the way through.

use crate::error::FetchError;
use crate::fetcher::Fetcher;
use crate::integrity::Integrity;
use crate::manifest::Manifest;
use crate::stream::{self, TarballStream};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A consumer's result plus where the bytes came from.
#[derive(Debug, Clone)]
pub struct Retrieved<T> {
    pub value: T,
    pub resolved: Option<String>,
    pub integrity: Option<Integrity>,
}

/// Runs a tarball consumer against the cheapest available source.
#[derive(Debug, Clone, Copy)]
pub struct TieredRetriever<'a> {
    fetcher: &'a Fetcher,
}

impl<'a> TieredRetriever<'a> {
    #[must_use]
    pub fn new(fetcher: &'a Fetcher) -> Self {
        Self { fetcher }
    }

    /// Hand a verified tarball stream to `handler`.
    ///
    /// The handler may run more than once: a cached copy that fails
    /// verification is purged and the next tier tried, and a source
    /// download that fails verification is retried once after purging.
    /// Integrity failures are annotated with the spec and `dest`.
    ///
    /// # Errors
    /// The handler's error or the last source error.
    pub async fn with_tarball_stream<T, F, Fut>(
        &self,
        manifest: Option<&Manifest>,
        dest: Option<&Path>,
        handler: F,
    ) -> Result<Retrieved<T>, FetchError>
    where
        F: Fn(TarballStream) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let opts = self.fetcher.options();
        let raw = self.fetcher.spec().raw.as_str();
        let integrity = opts
            .integrity
            .as_deref()
            .or_else(|| manifest.and_then(|m| m.integrity.as_deref()))
            .and_then(|sri| Integrity::parse(sri).ok());
        let resolved = opts
            .resolved
            .clone()
            .or_else(|| manifest.and_then(|m| m.resolved.clone()));
        let cache = opts.content_cache();

        // Tier 1: a file on disk at the resolved location.
        if let (Some(expected), Some(path), false) = (
            &integrity,
            resolved.as_deref().and_then(|r| self.local_path(r)),
            opts.prefer_online,
        ) {
            match tokio::fs::File::open(&path).await {
                Ok(file) => {
                    debug!(path = %path.display(), "reading tarball from resolved path");
                    let verified = stream::verify(stream::file_stream(file), Some(expected.clone()), None, None);
                    let tarball = TarballStream::new(verified);
                    tarball.signals.set_integrity(expected.clone());
                    if let Some(r) = &resolved {
                        tarball.signals.set_resolved(r.clone());
                    }
                    match handler(tarball).await {
                        Ok(value) => {
                            return Ok(Retrieved {
                                value,
                                resolved,
                                integrity,
                            })
                        }
                        Err(e) if e.is_integrity() => {
                            return Err(e.annotate(raw, dest.or(Some(path.as_path()))));
                        }
                        Err(e) if e.is_retriable() || e.is_not_found() => {
                            debug!(path = %path.display(), error = %e, "resolved path unusable");
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "resolved path missing, trying cache");
                }
                Err(e) => return Err(e.into()),
            }
        }

        // Tier 2: the content cache, by digest.
        if let (Some(expected), Some(cache)) = (&integrity, &cache) {
            match cache.stream(expected).await {
                Ok(cached) => {
                    debug!(spec = raw, "tarball served from cache");
                    let tarball = TarballStream::new(cached);
                    tarball.signals.set_integrity(expected.clone());
                    if let Some(r) = &resolved {
                        tarball.signals.set_resolved(r.clone());
                    }
                    match handler(tarball).await {
                        Ok(value) => {
                            return Ok(Retrieved {
                                value,
                                resolved,
                                integrity,
                            })
                        }
                        Err(e) if e.is_retriable() => {
                            warn!(spec = raw, error = %e, "cached tarball is bad, purging");
                            if let Err(e) = cache.rm_content(expected).await {
                                warn!(spec = raw, error = %e, "failed to purge cached tarball");
                            }
                        }
                        Err(e) => return Err(e.annotate(raw, dest)),
                    }
                }
                Err(FetchError::NotCached { .. }) => {}
                Err(e) => warn!(spec = raw, error = %e, "cache lookup failed"),
            }
        }

        if opts.offline && self.fetcher.needs_network() {
            return Err(FetchError::NotCached {
                key: resolved.unwrap_or_else(|| raw.to_string()),
            });
        }

        // Tier 3: the fetcher's source, retried once after a purge.
        let mut purged = false;
        loop {
            let opened = match manifest.filter(|m| m.resolved.is_some()) {
                Some(m) => self.fetcher.from_manifest(m).await,
                None => self.fetcher.tarball().await,
            };
            let outcome = match opened {
                Ok(tarball) => {
                    let signals = tarball.signals.clone();
                    let expected = integrity.clone();
                    let verify_signals = signals.clone();
                    let tarball = tarball.map_stream(|s| stream::verify(s, expected, None, Some(verify_signals)));
                    handler(tarball).await.map(|value| (value, signals))
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok((value, signals)) => {
                    return Ok(Retrieved {
                        value,
                        resolved: signals.resolved().or(resolved),
                        integrity: integrity.or_else(|| signals.integrity()),
                    });
                }
                Err(e) if e.is_retriable() && !purged => {
                    purged = true;
                    warn!(spec = raw, error = %e, "tarball failed verification, retrying once");
                    if let (Some(expected), Some(cache)) = (&integrity, &cache) {
                        if let Err(e) = cache.rm_content(expected).await {
                            warn!(spec = raw, error = %e, "failed to purge cached tarball");
                        }
                    }
                }
                Err(e) => return Err(e.annotate(raw, dest)),
            }
        }
    }

    /// Local path named by a `resolved` value, if it names one.
    fn local_path(&self, resolved: &str) -> Option<PathBuf> {
        if matches!(self.fetcher, Fetcher::Directory(_)) {
            return None;
        }
        let path = match resolved.strip_prefix("file:") {
            Some(rest) => PathBuf::from(rest),
            None if Path::new(resolved).is_absolute() => PathBuf::from(resolved),
            None => return None,
        };
        Some(self.fetcher.options().resolve_path(&path))
    }
}
