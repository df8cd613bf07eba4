//! Manifest finalization.
//!
//! A raw manifest may lack facts only the tarball knows: name and version
//! (git, file and remote specs), the shrinkwrap, bins declared through
//! `directories.bin`, and digests. Finalization reads them from the tarball
//! once and stores the result under the manifest's cache key so later
//! sessions skip the download.

use crate::error::FetchError;
use crate::fetcher::Fetcher;
use crate::integrity::{Algorithm, Integrity, IntegrityHasher};
use crate::manifest::Manifest;
use crate::retrieve::TieredRetriever;
use crate::stream::{self, ByteStream};
use crate::tarball::{self, TarballContents};
use bytes::Bytes;
use futures::TryStreamExt;
use serde_json::json;
use std::path::Path;
use tracing::{debug, warn};

/// What a raw manifest lacks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Missing {
    pub shrinkwrap: bool,
    pub bin: bool,
    pub integrity: bool,
    pub shasum: bool,
    pub name_version: bool,
}

impl Missing {
    #[must_use]
    pub fn of(manifest: &Manifest) -> Self {
        Self {
            shrinkwrap: manifest.has_shrinkwrap != Some(false) && manifest.shrinkwrap.is_none(),
            bin: manifest.directories_bin.is_some() && manifest.bin.is_empty(),
            integrity: manifest.integrity.is_none(),
            shasum: manifest.shasum.is_none() && manifest.integrity.is_none(),
            name_version: manifest.name.is_empty() || manifest.version.is_empty(),
        }
    }

    #[must_use]
    pub fn any(self) -> bool {
        self.shrinkwrap || self.bin || self.integrity || self.shasum || self.name_version
    }
}

/// Cache key of a finalized manifest: its unique resolved location, else
/// resolved location plus integrity. Manifests with neither are not cached.
#[must_use]
pub fn manifest_cache_key(manifest: &Manifest) -> Option<String> {
    let identity = match (&manifest.unique_resolved, &manifest.resolved, &manifest.integrity) {
        (Some(unique), _, _) => unique.clone(),
        (None, Some(resolved), Some(integrity)) => format!("{resolved}:{integrity}"),
        _ => return None,
    };
    Some(format!("pakfetch:manifest:{identity}"))
}

/// Complete `raw` from a stored finalized copy or from its tarball.
///
/// # Errors
/// `NoPackageJson` if name or version are needed and the tarball has no
/// package.json; otherwise whatever retrieval fails with.
pub async fn finalize(fetcher: &Fetcher, raw: Manifest) -> Result<Manifest, FetchError> {
    let missing = Missing::of(&raw);
    if !missing.any() {
        return Ok(raw);
    }

    let opts = fetcher.options();
    let key = manifest_cache_key(&raw);
    let cache = opts.content_cache();

    if let (Some(key), Some(cache), false) = (&key, &cache, opts.prefer_online) {
        match cache.get_by_key(key).await {
            Ok(Some((_, body))) => match serde_json::from_slice::<Manifest>(&body) {
                Ok(stored) => {
                    debug!(key = %key, "finalized manifest served from cache");
                    return Ok(stored);
                }
                Err(e) => warn!(key = %key, error = %e, "ignoring unreadable finalized manifest"),
            },
            Ok(None) => {}
            Err(e) => warn!(key = %key, error = %e, "finalized manifest lookup failed"),
        }
    }

    debug!(spec = %fetcher.spec(), ?missing, "reading manifest details from tarball");
    let bin_dir = raw.directories_bin.clone();
    let retrieved = TieredRetriever::new(fetcher)
        .with_tarball_stream(Some(&raw), None, |tarball| {
            let bin_dir = bin_dir.clone();
            async move {
                let (for_scan, for_digest) = stream::tee_pair(tarball.stream);
                futures::try_join!(tarball::scan(for_scan, bin_dir), digest(for_digest))
            }
        })
        .await?;

    let (contents, computed) = retrieved.value;
    let mut finalized = merge(raw, missing, contents, &computed, &fetcher.spec().raw)?;
    // Fetchers may learn a more exact location while fetching, such as
    // the full commit behind an abbreviated one.
    if let Some(resolved) = retrieved.resolved {
        finalized.resolved = Some(resolved);
    }

    if let (Some(key), Some(cache)) = (&key, &cache) {
        let body = Bytes::from(serde_json::to_vec(&finalized)?);
        let metadata = json!({ "spec": fetcher.spec().raw });
        if let Err(e) = cache.put(key, body, None, metadata).await {
            warn!(key = %key, error = %e, "failed to cache finalized manifest");
        }
    }
    Ok(finalized)
}

/// sha512 and sha1 of the whole stream.
async fn digest(mut stream: ByteStream) -> Result<Integrity, FetchError> {
    let mut hasher = IntegrityHasher::new(&[Algorithm::Sha512, Algorithm::Sha1]);
    while let Some(chunk) = stream.try_next().await? {
        hasher.update(&chunk);
    }
    Ok(hasher.finish())
}

fn merge(
    mut manifest: Manifest,
    missing: Missing,
    contents: TarballContents,
    computed: &Integrity,
    spec: &str,
) -> Result<Manifest, FetchError> {
    if missing.name_version {
        let Some(pkg) = &contents.package_json else {
            return Err(FetchError::no_package_json(spec));
        };
        manifest.fill_from(Manifest::from_package_json(pkg));
    }
    if missing.shrinkwrap {
        manifest.has_shrinkwrap = Some(contents.shrinkwrap.is_some());
        manifest.shrinkwrap = contents.shrinkwrap;
    }
    if missing.bin {
        for path in contents.bin_files {
            if let Some(name) = Path::new(&path).file_name().and_then(|n| n.to_str()) {
                manifest.bin.insert(name.to_string(), path.clone());
            }
        }
    }
    if missing.integrity {
        manifest.integrity = Some(computed.strongest_only().to_string());
    }
    if missing.shasum {
        manifest.shasum = computed.sha1_hex();
    }
    manifest.refresh_id();
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn complete() -> Manifest {
        Manifest {
            name: "pkg".to_string(),
            version: "1.0.0".to_string(),
            resolved: Some("https://r.example/pkg/-/pkg-1.0.0.tgz".to_string()),
            integrity: Some("sha512-abc".to_string()),
            has_shrinkwrap: Some(false),
            ..Manifest::default()
        }
    }

    #[test]
    fn test_complete_manifest_needs_nothing() {
        assert!(!Missing::of(&complete()).any());
    }

    #[test]
    fn test_missing_fields() {
        let mut m = complete();
        m.has_shrinkwrap = None;
        assert!(Missing::of(&m).shrinkwrap);

        let mut m = complete();
        m.directories_bin = Some("bin".to_string());
        assert!(Missing::of(&m).bin);

        let mut m = complete();
        m.integrity = None;
        let missing = Missing::of(&m);
        assert!(missing.integrity && missing.shasum);

        let mut m = complete();
        m.version.clear();
        assert!(Missing::of(&m).name_version);
    }

    #[test]
    fn test_cache_key_prefers_unique_resolved() {
        let mut m = complete();
        assert_eq!(
            manifest_cache_key(&m).as_deref(),
            Some("pakfetch:manifest:https://r.example/pkg/-/pkg-1.0.0.tgz:sha512-abc")
        );
        m.unique_resolved = Some("git+https://h/r.git#0123".to_string());
        assert_eq!(
            manifest_cache_key(&m).as_deref(),
            Some("pakfetch:manifest:git+https://h/r.git#0123")
        );
        m.unique_resolved = None;
        m.integrity = None;
        assert_eq!(manifest_cache_key(&m), None);
    }

    #[test]
    fn test_merge_fills_from_tarball() {
        let raw = Manifest {
            resolved: Some("git+https://h/r.git#0123".to_string()),
            directories_bin: Some("bin".to_string()),
            ..Manifest::default()
        };
        let missing = Missing::of(&raw);
        let contents = TarballContents {
            package_json: Some(json!({ "name": "r", "version": "2.0.0" })),
            shrinkwrap: Some(json!({ "lockfileVersion": 3 })),
            bin_files: vec!["bin/tool.js".to_string()],
        };
        let computed = {
            let mut h = IntegrityHasher::new(&[Algorithm::Sha512, Algorithm::Sha1]);
            h.update(b"tarball");
            h.finish()
        };

        let merged = merge(raw, missing, contents, &computed, "github:h/r").unwrap();
        assert_eq!(merged.name, "r");
        assert_eq!(merged.version, "2.0.0");
        assert_eq!(merged.id, "r@2.0.0");
        assert_eq!(merged.has_shrinkwrap, Some(true));
        assert_eq!(merged.bin["tool.js"], "bin/tool.js");
        assert!(merged.integrity.as_deref().unwrap().starts_with("sha512-"));
        assert_eq!(merged.shasum, computed.sha1_hex());
    }

    #[test]
    fn test_merge_requires_package_json_for_name() {
        let raw = Manifest::default();
        let missing = Missing::of(&raw);
        let computed = Integrity::compute(b"x");
        let err = merge(raw, missing, TarballContents::default(), &computed, "file:x.tgz").unwrap_err();
        assert!(matches!(err, FetchError::NoPackageJson { .. }));
    }
}
