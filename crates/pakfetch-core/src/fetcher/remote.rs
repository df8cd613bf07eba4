use super::{cache_metadata, tee_to_cache, FetchContext};
use crate::error::FetchError;
use crate::registry::tarball_cache_key;
use crate::stream::TarballStream;

/// Fetcher for tarballs at arbitrary URLs.
#[derive(Debug, Clone)]
pub struct RemoteFetcher {
    pub(crate) ctx: FetchContext,
}

impl RemoteFetcher {
    pub(crate) fn new(ctx: FetchContext) -> Self {
        Self { ctx }
    }

    pub(crate) fn resolve(&self) -> String {
        self.ctx.spec.fetch_spec.clone()
    }

    pub(crate) async fn tarball(&self) -> Result<TarballStream, FetchError> {
        let url = &self.ctx.spec.fetch_spec;
        let tarball = self.ctx.state.registry.tarball(url, &self.ctx.opts).await?;
        Ok(tee_to_cache(
            tarball,
            self.ctx.opts.content_cache(),
            tarball_cache_key(url),
            self.ctx.expected_integrity(),
            cache_metadata(&self.ctx.spec, url),
        ))
    }
}
