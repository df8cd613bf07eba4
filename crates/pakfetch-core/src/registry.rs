//! npm registry HTTP client: packuments with HTTP caching, tarball streams.

use crate::error::FetchError;
use crate::integrity::Integrity;
use crate::manifest::Packument;
use crate::options::Options;
use crate::stream::{self, TarballStream};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH,
    LAST_MODIFIED, USER_AGENT,
};
use reqwest::{Client, StatusCode};
use serde_json::json;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};
use url::Url;

/// Abbreviated install document, falling back to the full packument.
pub const CORGI_ACCEPT: &str =
    "application/vnd.npm.install-v1+json; q=1.0, application/json; q=0.8, */*";

/// Full packument.
pub const FULL_ACCEPT: &str = "application/json";

/// Header a caching proxy uses to report the digest of the body it serves.
pub const LOCAL_CACHE_INTEGRITY_HEADER: &str = "x-local-cache-integrity";

/// Cached packuments younger than this are served without revalidation.
pub const PACKUMENT_MAX_AGE: Duration = Duration::from_secs(300);

/// A packument plus where it came from.
#[derive(Debug, Clone)]
pub struct FetchedPackument {
    pub packument: Packument,
    /// Served from the local cache (fresh, stale, or revalidated by 304).
    pub from_cache: bool,
}

/// Registry client for packuments and tarballs.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    http: Client,
}

impl RegistryClient {
    /// # Errors
    /// Returns `Http` if the HTTP client cannot be created.
    pub fn new() -> Result<Self, FetchError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| FetchError::Http {
                message: format!("Failed to create HTTP client: {e}"),
            })?;
        Ok(Self { http })
    }

    #[must_use]
    pub fn http(&self) -> &Client {
        &self.http
    }

    /// Packument URL for `name` under `registry`; scoped names keep `@` and
    /// encode the slash.
    ///
    /// # Errors
    /// Returns `SpecInvalid` if the registry URL is invalid.
    pub fn packument_url(registry: &str, name: &str) -> Result<Url, FetchError> {
        let base = Url::parse(registry)
            .map_err(|e| FetchError::spec_invalid(registry, format!("invalid registry URL: {e}")))?;
        base.join(&name.replace('/', "%2F"))
            .map_err(|e| FetchError::spec_invalid(name, format!("cannot build packument URL: {e}")))
    }

    /// Fetch a packument, honoring the cache modes in `opts`.
    ///
    /// - `offline`: cache only, `NotCached` on miss.
    /// - `prefer_offline`: any cached copy is used as is.
    /// - default: cached copies younger than [`PACKUMENT_MAX_AGE`] are used,
    ///   older ones are revalidated with a conditional request.
    /// - `prefer_online` or `revalidate`: always revalidate.
    ///
    /// # Errors
    /// Returns `NotFound` on 404, `Network` on other failing statuses.
    pub async fn fetch_packument(
        &self,
        url: &Url,
        name: &str,
        opts: &Options,
        revalidate: bool,
    ) -> Result<FetchedPackument, FetchError> {
        let cache = opts.content_cache();
        let key = packument_cache_key(url, opts.full_metadata);

        let cached = match &cache {
            Some(cache) => match cache.get_by_key(&key).await {
                Ok(hit) => hit,
                Err(e) => {
                    warn!(url = %url, error = %e, "ignoring unreadable cached packument");
                    None
                }
            },
            None => None,
        };

        if opts.offline {
            let Some((_, body)) = cached else {
                return Err(FetchError::NotCached { key: url.to_string() });
            };
            return Ok(FetchedPackument {
                packument: serde_json::from_slice(&body)?,
                from_cache: true,
            });
        }

        if let Some((entry, body)) = &cached {
            let fresh = entry.age_ms(SystemTime::now()) < duration_ms(PACKUMENT_MAX_AGE);
            if !revalidate && !opts.prefer_online && (opts.prefer_offline || fresh) {
                debug!(url = %url, "packument served from cache");
                return Ok(FetchedPackument {
                    packument: serde_json::from_slice(body)?,
                    from_cache: true,
                });
            }
        }

        let mut headers = request_headers(url, opts);
        let accept = if opts.full_metadata {
            FULL_ACCEPT
        } else {
            CORGI_ACCEPT
        };
        headers.insert(ACCEPT, HeaderValue::from_static(accept));
        if let Some((entry, _)) = &cached {
            if let Some(etag) = header_value(&entry.metadata, "etag") {
                headers.insert(IF_NONE_MATCH, etag);
            }
            if let Some(modified) = header_value(&entry.metadata, "lastModified") {
                headers.insert(IF_MODIFIED_SINCE, modified);
            }
        }

        debug!(url = %url, revalidate, "fetching packument");
        let response = match self.http.get(url.clone()).headers(headers).send().await {
            Ok(response) => response,
            Err(e) => {
                if let Some((_, body)) = cached {
                    warn!(url = %url, error = %e, "registry unreachable, using stale packument");
                    return Ok(FetchedPackument {
                        packument: serde_json::from_slice(&body)?,
                        from_cache: true,
                    });
                }
                return Err(e.into());
            }
        };

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            if let (Some(cache), Some((entry, body))) = (&cache, cached) {
                debug!(url = %url, "packument not modified");
                let metadata = entry.metadata.clone();
                if let Err(e) = cache.touch(entry, metadata).await {
                    warn!(url = %url, error = %e, "failed to refresh packument cache entry");
                }
                return Ok(FetchedPackument {
                    packument: serde_json::from_slice(&body)?,
                    from_cache: true,
                });
            }
        }
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound {
                name: name.to_string(),
            });
        }
        if !status.is_success() {
            return Err(FetchError::Network {
                status: status.as_u16(),
                uri: url.to_string(),
            });
        }

        let metadata = json!({
            "url": url.as_str(),
            "etag": text_header(response.headers(), ETAG.as_str()),
            "lastModified": text_header(response.headers(), LAST_MODIFIED.as_str()),
        });
        let body = response.bytes().await?;
        let packument: Packument = serde_json::from_slice(&body)?;

        if let Some(cache) = &cache {
            if let Err(e) = cache.put(&key, body, None, metadata).await {
                warn!(url = %url, error = %e, "failed to cache packument");
            }
        }

        Ok(FetchedPackument {
            packument,
            from_cache: false,
        })
    }

    /// Open a tarball download.
    ///
    /// The server-reported digest, if any, is published on the returned
    /// signals; a body shorter than `Content-Length` ends in `Truncated`.
    ///
    /// # Errors
    /// Returns `Network` for failing statuses.
    pub async fn tarball(&self, url: &str, opts: &Options) -> Result<TarballStream, FetchError> {
        let parsed = Url::parse(url)
            .map_err(|e| FetchError::spec_invalid(url, format!("invalid tarball URL: {e}")))?;
        debug!(url = %url, "downloading tarball");
        let response = self
            .http
            .get(parsed.clone())
            .headers(request_headers(&parsed, opts))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Network {
                status: status.as_u16(),
                uri: url.to_string(),
            });
        }

        let reported = text_header(response.headers(), LOCAL_CACHE_INTEGRITY_HEADER)
            .and_then(|v| Integrity::parse(&v).ok());
        let length = response.content_length();
        let body = response
            .bytes_stream()
            .map_err(FetchError::from)
            .boxed();

        let tarball = TarballStream::new(stream::verify(body, None, length, None)).with_resolved(url);
        if let Some(integrity) = reported {
            tarball.signals.set_integrity(integrity);
        }
        Ok(tarball)
    }

    /// Download a whole tarball into memory.
    ///
    /// # Errors
    /// See [`tarball`](Self::tarball).
    pub async fn tarball_bytes(&self, url: &str, opts: &Options) -> Result<Bytes, FetchError> {
        self.tarball(url, opts).await?.collect().await
    }
}

fn request_headers(url: &Url, opts: &Options) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(agent) = HeaderValue::from_str(&opts.user_agent) {
        headers.insert(USER_AGENT, agent);
    }
    if let Some(token) = opts.auth_token_for(url) {
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
            headers.insert(AUTHORIZATION, value);
        }
    }
    headers
}

/// Cache key for a packument request.
#[must_use]
pub fn packument_cache_key(url: &Url, full: bool) -> String {
    let kind = if full { "full" } else { "corgi" };
    format!("pakfetch:packument:{kind}:{url}")
}

/// Cache key for a tarball downloaded from `url`.
#[must_use]
pub fn tarball_cache_key(url: &str) -> String {
    format!("pakfetch:request-cache:{url}")
}

/// Point `tarball` at the registry's scheme when it names the same host.
///
/// Registries behind TLS-terminating proxies often publish `http://`
/// tarball URLs for an `https://` registry (or the reverse).
#[must_use]
pub fn match_registry_scheme(tarball: &str, registry: &str) -> String {
    let (Ok(mut t), Ok(r)) = (Url::parse(tarball), Url::parse(registry)) else {
        return tarball.to_string();
    };
    if t.host_str() == r.host_str() && t.scheme() != r.scheme() && t.set_scheme(r.scheme()).is_ok() {
        if t.port() != r.port() {
            let _ = t.set_port(r.port());
        }
        return t.to_string();
    }
    tarball.to_string()
}

fn text_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

fn header_value(metadata: &serde_json::Value, field: &str) -> Option<HeaderValue> {
    metadata
        .get(field)
        .and_then(serde_json::Value::as_str)
        .and_then(|v| HeaderValue::from_str(v).ok())
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
