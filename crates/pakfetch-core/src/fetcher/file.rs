use super::{cache_metadata, tee_to_cache, FetchContext};
use crate::error::FetchError;
use crate::integrity::IntegrityHasher;
use crate::stream::{self, TarballStream};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Fetcher for local tarball files.
#[derive(Debug, Clone)]
pub struct FileFetcher {
    pub(crate) ctx: FetchContext,
    path: PathBuf,
}

impl FileFetcher {
    pub(crate) fn new(ctx: FetchContext) -> Self {
        let path = ctx
            .spec
            .path()
            .unwrap_or_else(|| PathBuf::from(&ctx.spec.fetch_spec));
        Self { ctx, path }
    }

    pub(crate) fn resolve(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    fn cache_key(&self) -> String {
        format!("pakfetch:file:{}", self.path.display())
    }

    /// Read the file, verifying it against the requested integrity.
    ///
    /// Small files are read whole; larger ones are streamed. Either way a
    /// digest mismatch names the spec and the file.
    pub(crate) async fn tarball(&self) -> Result<TarballStream, FetchError> {
        let expected = self.ctx.expected_integrity();
        let cache = self.ctx.opts.content_cache();
        let raw = self.ctx.spec.raw.clone();
        let path = self.path.clone();
        let size = tokio::fs::metadata(&self.path).await?.len();
        let metadata = cache_metadata(&self.ctx.spec, &self.resolve());

        if size <= self.ctx.opts.small_file_threshold {
            debug!(path = %self.path.display(), size, "reading small tarball whole");
            let data = Bytes::from(tokio::fs::read(&self.path).await?);
            let mut hasher = IntegrityHasher::for_expected(expected.as_ref());
            hasher.update(&data);
            let actual = hasher.finish();
            if let Some(expected) = &expected {
                expected
                    .check(&actual)
                    .map_err(|e| e.annotate(&raw, Some(path.as_path())))?;
            }

            let tarball = TarballStream::from_bytes(data.clone()).with_resolved(self.resolve());
            tarball.signals.set_integrity(actual);
            if let Some(cache) = cache {
                if let Err(e) = cache.put(&self.cache_key(), data, expected.as_ref(), metadata).await {
                    warn!(path = %self.path.display(), error = %e, "failed to cache tarball");
                }
            }
            return Ok(tarball);
        }

        let file = tokio::fs::File::open(&self.path).await?;
        let tarball = TarballStream::new(stream::file_stream(file)).with_resolved(self.resolve());
        let signals = tarball.signals.clone();
        let verified = tarball.map_stream(|s| {
            stream::verify(s, expected.clone(), Some(size), Some(signals))
                .map_err(move |e| e.annotate(&raw, Some(path.as_path())))
                .boxed()
        });
        Ok(tee_to_cache(verified, cache, self.cache_key(), expected, metadata))
    }
}
