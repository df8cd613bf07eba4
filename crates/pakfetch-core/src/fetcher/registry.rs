use super::{cache_metadata, tee_to_cache, FetchContext};
use crate::error::FetchError;
use crate::integrity::Integrity;
use crate::manifest::{Manifest, Packument};
use crate::registry::{match_registry_scheme, packument_cache_key, tarball_cache_key, RegistryClient};
use crate::spec::SpecType;
use crate::stream::TarballStream;
use crate::version::{pick_version, Wanted};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// Fetcher for tag, version and range specs.
#[derive(Debug, Clone)]
pub struct RegistryFetcher {
    pub(crate) ctx: FetchContext,
    registry: String,
    packument_url: Url,
}

impl RegistryFetcher {
    pub(crate) fn new(ctx: FetchContext) -> Result<Self, FetchError> {
        let name = ctx
            .spec
            .name
            .clone()
            .ok_or_else(|| FetchError::spec_invalid(&ctx.spec.raw, "registry spec without a name"))?;
        let registry = ctx.opts.registry_for(&ctx.spec).to_string();
        let packument_url = RegistryClient::packument_url(&registry, &name)?;
        Ok(Self {
            ctx,
            registry,
            packument_url,
        })
    }

    fn name(&self) -> &str {
        self.ctx.spec.name.as_deref().unwrap_or_default()
    }

    fn memo_key(&self) -> String {
        packument_cache_key(&self.packument_url, self.ctx.opts.full_metadata)
    }

    /// Packument plus whether it came from a cache (memo or disk).
    ///
    /// Concurrent requests for the same document share one fetch.
    async fn fetched_packument(&self, revalidate: bool) -> Result<(Arc<Packument>, bool), FetchError> {
        let state = &self.ctx.state;
        let key = self.memo_key();
        if !revalidate {
            if let Some(hit) = state.packuments.get(&key) {
                return Ok((hit, true));
            }
        }

        let flight = if revalidate {
            format!("{key}#revalidate")
        } else {
            key.clone()
        };
        let client = state.registry.clone();
        let url = self.packument_url.clone();
        let name = self.name().to_string();
        let opts = self.ctx.opts.clone();
        let (packument, from_cache) = state
            .packument_flights
            .run(flight, move || async move {
                let fetched = client.fetch_packument(&url, &name, &opts, revalidate).await?;
                Ok((Arc::new(fetched.packument), fetched.from_cache))
            })
            .await?;

        state.packuments.insert(key, Arc::clone(&packument));
        Ok((packument, from_cache))
    }

    pub(crate) async fn packument(&self) -> Result<Packument, FetchError> {
        let (packument, _) = self.fetched_packument(false).await?;
        Ok((*packument).clone())
    }

    /// Pick the wanted version and build its manifest.
    ///
    /// A cached packument that has no matching version is refetched once
    /// before giving up, since the version may have been published since.
    pub(crate) async fn manifest(&self) -> Result<Manifest, FetchError> {
        let spec = &self.ctx.spec;
        let opts = &self.ctx.opts;
        let wanted = match spec.spec_type() {
            SpecType::Version => Wanted::Version(&spec.fetch_spec),
            SpecType::Range => Wanted::Range(&spec.fetch_spec),
            _ if spec.fetch_spec.is_empty() => Wanted::Tag(&opts.default_tag),
            _ => Wanted::Tag(&spec.fetch_spec),
        };

        let (packument, from_cache) = self.fetched_packument(false).await?;
        let (packument, version) = match pick_version(&packument, wanted, &opts.default_tag) {
            Ok(version) => (packument, version),
            Err(FetchError::NoVersionMatch { .. }) if from_cache && !opts.offline => {
                debug!(spec = %spec, "no match in cached packument, revalidating");
                self.ctx.state.packuments.remove(&self.memo_key());
                let (fresh, _) = self.fetched_packument(true).await?;
                let version = pick_version(&fresh, wanted, &opts.default_tag)?;
                (fresh, version)
            }
            Err(e) => return Err(e),
        };

        self.manifest_for(&packument, &version)
    }

    fn manifest_for(&self, packument: &Packument, version: &str) -> Result<Manifest, FetchError> {
        let doc = packument.versions.get(version).ok_or_else(|| FetchError::NoVersionMatch {
            name: packument.name.clone(),
            range: version.to_string(),
            available: packument.versions.keys().cloned().collect(),
        })?;

        let mut manifest = Manifest::from_package_json(doc);
        if manifest.name.is_empty() {
            manifest.name.clone_from(&packument.name);
        }
        if manifest.version.is_empty() {
            manifest.version = version.to_string();
        }

        let dist = doc.get("dist");
        let dist_str = |field: &str| dist.and_then(|d| d.get(field)).and_then(Value::as_str);

        manifest.shasum = dist_str("shasum").map(String::from);
        manifest.integrity = dist_str("integrity")
            .and_then(|sri| Integrity::parse(sri).ok())
            .or_else(|| manifest.shasum.as_deref().and_then(|s| Integrity::from_legacy_sha1(s).ok()))
            .map(|i| i.to_string());
        if let Some(has) = doc.get("_hasShrinkwrap").and_then(Value::as_bool) {
            manifest.has_shrinkwrap = Some(has);
        }

        manifest.resolved = Some(match dist_str("tarball") {
            Some(url) => match_registry_scheme(url, &self.registry),
            None => {
                let warning = FetchError::NoTarballUrl {
                    name: manifest.name.clone(),
                    version: manifest.version.clone(),
                }
                .to_string();
                debug!(spec = %self.ctx.spec, "{warning}");
                manifest.warnings.push(warning);
                self.synthesized_tarball_url(&manifest.version)
            }
        });
        manifest.refresh_id();
        Ok(manifest)
    }

    /// `{registry}{name}/-/{unscoped}-{version}.tgz`
    fn synthesized_tarball_url(&self, version: &str) -> String {
        let unscoped = self.ctx.spec.unscoped_name().unwrap_or_default();
        format!("{}{}/-/{unscoped}-{version}.tgz", self.registry, self.name())
    }

    pub(crate) async fn resolve(&self) -> Result<String, FetchError> {
        let manifest = self.manifest().await?;
        manifest.resolved.ok_or_else(|| FetchError::NoTarballUrl {
            name: manifest.name,
            version: manifest.version,
        })
    }

    pub(crate) async fn tarball(&self) -> Result<TarballStream, FetchError> {
        let manifest = self.manifest().await?;
        self.from_manifest(&manifest).await
    }

    pub(crate) async fn from_manifest(&self, manifest: &Manifest) -> Result<TarballStream, FetchError> {
        let url = manifest.resolved.as_deref().ok_or_else(|| FetchError::NoTarballUrl {
            name: manifest.name.clone(),
            version: manifest.version.clone(),
        })?;
        let expected = manifest
            .integrity
            .as_deref()
            .and_then(|sri| Integrity::parse(sri).ok())
            .or_else(|| self.ctx.expected_integrity());

        let tarball = self.ctx.state.registry.tarball(url, &self.ctx.opts).await?;
        Ok(tee_to_cache(
            tarball,
            self.ctx.opts.content_cache(),
            tarball_cache_key(url),
            expected,
            cache_metadata(&self.ctx.spec, url),
        ))
    }

    pub(crate) fn clear_memoized(&self) {
        self.ctx.state.packuments.remove(&self.memo_key());
    }
}
