use super::{cache_metadata, tee_to_cache, FetchContext};
use crate::error::FetchError;
use crate::git::{self, clone, is_full_sha, is_sha_like, GitRefSet, RefKind, ResolvedRef};
use crate::manifest::Manifest;
use crate::pack::pack_dir_async;
use crate::stream::TarballStream;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// A spec pinned to a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PinnedCommit {
    /// Transport URL that answered.
    repo: String,
    target: ResolvedRef,
    /// Whether the sha is a full commit id, and so safe to key caches on.
    cacheable: bool,
}

impl PinnedCommit {
    fn resolved(&self) -> String {
        format!("git+{}#{}", self.repo, self.target.sha)
    }

    fn pack_key(&self) -> String {
        format!("pakfetch:git-pack:{}", self.resolved())
    }

    /// The same pin at the full commit id a clone resolved it to. The
    /// result stays uncacheable: the spec itself still names a short id.
    fn with_sha(&self, sha: String) -> Self {
        Self {
            repo: self.repo.clone(),
            target: ResolvedRef {
                sha,
                ref_name: self.target.ref_name.clone(),
                kind: self.target.kind,
            },
            cacheable: self.cacheable,
        }
    }

    /// A committish no advertised ref matches, taken as a commit id.
    fn raw(repo: String, committish: String) -> Self {
        Self {
            repo,
            cacheable: is_full_sha(&committish),
            target: ResolvedRef {
                sha: committish,
                ref_name: None,
                kind: RefKind::Other,
            },
        }
    }
}

/// Fetcher for git repositories, hosted or not.
#[derive(Debug, Clone)]
pub struct GitFetcher {
    pub(crate) ctx: FetchContext,
    pinned: Arc<Mutex<Option<PinnedCommit>>>,
}

impl GitFetcher {
    pub(crate) fn new(ctx: FetchContext) -> Self {
        Self {
            ctx,
            pinned: Arc::new(Mutex::new(None)),
        }
    }

    fn candidates(&self) -> Vec<String> {
        match &self.ctx.spec.hosted {
            Some(hosted) => hosted.transport_urls().to_vec(),
            None => vec![self.ctx.spec.fetch_spec.clone()],
        }
    }

    /// Refs advertised by `repo`, from the session's TTL cache when fresh.
    async fn ref_set(&self, repo: &str) -> Result<Arc<GitRefSet>, FetchError> {
        let state = &self.ctx.state;
        if let Some(hit) = state.git_refs.get(&repo.to_string()) {
            return Ok(hit);
        }
        let url = repo.to_string();
        let retry = self.ctx.opts.retry.clone();
        let refs = state
            .ref_flights
            .run(repo.to_string(), move || async move {
                git::ls_remote(&url, &retry).await.map(Arc::new)
            })
            .await?;
        state.git_refs.insert(repo.to_string(), Arc::clone(&refs));
        Ok(refs)
    }

    /// Pin the spec's committish or semver range to a commit, trying each
    /// transport in turn.
    async fn pin(&self) -> Result<PinnedCommit, FetchError> {
        let memo = self.pinned.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(pinned) = memo {
            return Ok(pinned);
        }

        let spec = &self.ctx.spec;
        let mut last_error = None;
        for repo in self.candidates() {
            let refs = match self.ref_set(&repo).await {
                Ok(refs) => refs,
                Err(FetchError::NoGitBinary) => return Err(FetchError::NoGitBinary),
                Err(e) => {
                    debug!(repo = %repo, error = %e, "ls-remote failed, trying next transport");
                    last_error = Some(e);
                    continue;
                }
            };

            let found = refs.resolve(
                &repo,
                spec.git_committish.as_deref(),
                spec.git_range.as_deref(),
            )?;
            let pinned = match found {
                Some(target) => PinnedCommit {
                    repo,
                    target,
                    cacheable: true,
                },
                None => {
                    let committish = spec.git_committish.clone().unwrap_or_default();
                    if !is_sha_like(&committish) {
                        return Err(FetchError::spec_invalid(
                            &spec.raw,
                            format!("'{committish}' matches no ref in {repo} and is not a commit id"),
                        ));
                    }
                    PinnedCommit::raw(repo, committish)
                }
            };
            debug!(spec = %spec, resolved = %pinned.resolved(), "pinned git spec");
            *self.pinned.lock().unwrap_or_else(PoisonError::into_inner) = Some(pinned.clone());
            return Ok(pinned);
        }

        Err(last_error.unwrap_or_else(|| FetchError::GitFatal {
            command: "git ls-remote".to_string(),
            stderr: format!("no repository URL for '{}'", spec.raw),
        }))
    }

    /// A manifest carrying only provenance; name and version come from the
    /// tarball during finalization.
    pub(crate) async fn manifest(&self) -> Result<Manifest, FetchError> {
        let pinned = self.pin().await?;
        let resolved = pinned.resolved();
        Ok(Manifest {
            unique_resolved: pinned.cacheable.then(|| resolved.clone()),
            resolved: Some(resolved),
            ..Manifest::default()
        })
    }

    pub(crate) async fn resolve(&self) -> Result<String, FetchError> {
        Ok(self.pin().await?.resolved())
    }

    pub(crate) async fn tarball(&self) -> Result<TarballStream, FetchError> {
        let pinned = self.pin().await?;
        self.fetch_pinned(&pinned).await
    }

    pub(crate) async fn from_manifest(&self, _manifest: &Manifest) -> Result<TarballStream, FetchError> {
        self.tarball().await
    }

    /// Packed tarball for a pinned commit: previously packed copy, then the
    /// host's archive endpoint, then a clone.
    async fn fetch_pinned(&self, pinned: &PinnedCommit) -> Result<TarballStream, FetchError> {
        let cache = self.ctx.opts.content_cache();
        let resolved = pinned.resolved();
        let key = pinned.pack_key();

        if pinned.cacheable && !self.ctx.opts.prefer_online {
            if let Some(cache) = &cache {
                if let Some(stream) = cached_pack(cache, &key).await {
                    debug!(resolved = %resolved, "git pack served from cache");
                    return Ok(TarballStream::new(stream).with_resolved(resolved));
                }
            }
        }

        let store = if pinned.cacheable { cache } else { None };
        let metadata = cache_metadata(&self.ctx.spec, &resolved);

        if let (Some(hosted), true) = (&self.ctx.spec.hosted, pinned.cacheable) {
            let url = hosted.tarball_url(&pinned.target.sha);
            match self.ctx.state.registry.tarball(&url, &self.ctx.opts).await {
                Ok(tarball) => {
                    debug!(url = %url, "using hosted archive");
                    let tarball = tarball.with_resolved(resolved);
                    return Ok(tee_to_cache(tarball, store, key, None, metadata));
                }
                Err(e) => debug!(url = %url, error = %e, "hosted archive unavailable, cloning"),
            }
        }

        let tmp = tempfile::Builder::new()
            .prefix("pakfetch-git-")
            .tempdir()?;
        let checkout = tmp.path().join("checkout");
        let sha = clone::clone(&pinned.repo, &pinned.target, &checkout, &self.ctx.opts.retry).await?;
        let resolved = if pinned.cacheable {
            if sha != pinned.target.sha {
                warn!(expected = %pinned.target.sha, actual = %sha, "clone checked out an unexpected commit");
            }
            resolved
        } else {
            self.repin(pinned.with_sha(sha)).resolved()
        };
        let packed = pack_dir_async(&checkout).await?;
        drop(tmp);

        let tarball = TarballStream::from_bytes(packed).with_resolved(resolved);
        Ok(tee_to_cache(tarball, store, key, None, metadata))
    }

    /// Replace the memoized pin with what a clone actually checked out.
    fn repin(&self, pinned: PinnedCommit) -> PinnedCommit {
        debug!(spec = %self.ctx.spec, resolved = %pinned.resolved(), "abbreviated committish expanded");
        *self.pinned.lock().unwrap_or_else(PoisonError::into_inner) = Some(pinned.clone());
        pinned
    }

    pub(crate) fn clear_memoized(&self) {
        *self.pinned.lock().unwrap_or_else(PoisonError::into_inner) = None;
        for repo in self.candidates() {
            self.ctx.state.git_refs.remove(&repo);
        }
    }
}

async fn cached_pack(
    cache: &crate::cache::ContentCache,
    key: &str,
) -> Option<crate::stream::ByteStream> {
    let entry = cache.get_info(key).await.ok().flatten()?;
    let integrity = entry.integrity().ok()?;
    cache.stream(&integrity).await.ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA: &str = "0123456789abcdef0123456789abcdef01234567";

    #[test]
    fn test_full_sha_committish_is_cacheable() {
        let pinned = PinnedCommit::raw("https://git.example.com/r.git".to_string(), SHA.to_string());
        assert!(pinned.cacheable);
        assert_eq!(pinned.resolved(), format!("git+https://git.example.com/r.git#{SHA}"));
        assert_eq!(
            pinned.pack_key(),
            format!("pakfetch:git-pack:git+https://git.example.com/r.git#{SHA}")
        );
    }

    #[test]
    fn test_short_committish_is_not_cacheable() {
        let pinned = PinnedCommit::raw("https://git.example.com/r.git".to_string(), "0123abc".to_string());
        assert!(!pinned.cacheable);
        assert_eq!(pinned.target.kind, RefKind::Other);
        assert_eq!(pinned.target.ref_name, None);
    }

    #[test]
    fn test_short_committish_expands_to_full_sha() {
        let short = PinnedCommit::raw("https://git.example.com/r.git".to_string(), "0123456".to_string());
        let full = short.with_sha(SHA.to_string());
        assert_eq!(full.resolved(), format!("git+https://git.example.com/r.git#{SHA}"));
        assert!(!full.cacheable);
        assert_eq!(full.repo, short.repo);
    }
}
