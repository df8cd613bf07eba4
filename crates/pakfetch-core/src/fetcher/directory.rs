use super::FetchContext;
use crate::error::FetchError;
use crate::manifest::{normalize_bin_path, Manifest};
use crate::pack::pack_dir_async;
use crate::stream::TarballStream;
use serde_json::Value;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Fetcher for local package directories. Tarballs are packed on demand
/// and never cached.
#[derive(Debug, Clone)]
pub struct DirectoryFetcher {
    pub(crate) ctx: FetchContext,
    path: PathBuf,
}

impl DirectoryFetcher {
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

    /// Manifest read straight from the directory's package.json.
    pub(crate) async fn manifest(&self) -> Result<Manifest, FetchError> {
        let raw = match tokio::fs::read(self.path.join("package.json")).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(FetchError::no_package_json(&self.ctx.spec.raw));
            }
            Err(e) => return Err(e.into()),
        };
        let doc: Value = serde_json::from_slice(&raw)?;
        let mut manifest = Manifest::from_package_json(&doc);

        match tokio::fs::read(self.path.join("npm-shrinkwrap.json")).await {
            Ok(raw) => {
                manifest.shrinkwrap = Some(serde_json::from_slice(&raw)?);
                manifest.has_shrinkwrap = Some(true);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => manifest.has_shrinkwrap = Some(false),
            Err(e) => return Err(e.into()),
        }

        if manifest.bin.is_empty() {
            if let Some(bin_dir) = manifest.directories_bin.clone() {
                manifest.bin = discover_bins(&self.path, &bin_dir);
            }
        }

        manifest.resolved = Some(self.resolve());
        manifest.refresh_id();
        Ok(manifest)
    }

    pub(crate) async fn tarball(&self) -> Result<TarballStream, FetchError> {
        let packed = pack_dir_async(&self.path).await?;
        Ok(TarballStream::from_bytes(packed).with_resolved(self.resolve()))
    }
}

/// Map each file under `root/bin_dir` to a bin entry named by its file name.
fn discover_bins(root: &Path, bin_dir: &str) -> BTreeMap<String, String> {
    let bin_dir = normalize_bin_path(bin_dir);
    let base = root.join(&bin_dir);
    WalkDir::new(&base)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let rel = e.path().strip_prefix(root).ok()?;
            let name = e.file_name().to_str()?.to_string();
            Some((name, rel.to_string_lossy().replace('\\', "/")))
        })
        .collect()
}
