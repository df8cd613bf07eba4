//! Deterministic packing of a directory into an npm-style tarball.

use crate::error::FetchError;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::io;
use std::path::Path;
use tar::{Builder, EntryType, Header};
use walkdir::{DirEntry, WalkDir};

/// Fixed entry mtime (1985-10-26T08:15:00Z) so unchanged trees pack to
/// identical bytes.
pub const PACK_MTIME: u64 = 499_162_500;

/// Names never packed, at any depth.
const EXCLUDED: &[&str] = &[".git", ".svn", ".hg", "CVS", "node_modules", ".DS_Store"];

/// Pack `dir` into a gzipped tarball with `package/`-prefixed entries.
///
/// Entries are sorted by path and carry normalized modes, zero owners and a
/// fixed mtime.
///
/// # Errors
/// Returns `Io` if the tree cannot be read.
pub fn pack_dir(dir: &Path) -> Result<Bytes, FetchError> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = Builder::new(encoder);

    let walker = WalkDir::new(dir)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_excluded(e));

    for entry in walker {
        let entry = entry.map_err(|e| {
            FetchError::from(e.into_io_error().unwrap_or_else(|| io::Error::other("walk loop")))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(dir) else {
            continue;
        };
        let rel = rel.to_string_lossy().replace('\\', "/");
        let data = fs::read(entry.path())?;

        let mut header = Header::new_ustar();
        header.set_entry_type(EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(normalized_mode(&entry));
        header.set_mtime(PACK_MTIME);
        header.set_uid(0);
        header.set_gid(0);
        builder.append_data(&mut header, format!("package/{rel}"), data.as_slice())?;
    }

    let encoder = builder.into_inner()?;
    Ok(Bytes::from(encoder.finish()?))
}

/// Pack on a blocking thread.
///
/// # Errors
/// See [`pack_dir`].
pub async fn pack_dir_async(dir: &Path) -> Result<Bytes, FetchError> {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || pack_dir(&dir))
        .await
        .map_err(|e| FetchError::tar(format!("pack task failed: {e}")))?
}

fn is_excluded(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .is_some_and(|name| EXCLUDED.contains(&name))
}

#[cfg(unix)]
fn normalized_mode(entry: &DirEntry) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    let executable = entry
        .metadata()
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false);
    if executable {
        0o755
    } else {
        0o644
    }
}

#[cfg(not(unix))]
fn normalized_mode(_entry: &DirEntry) -> u32 {
    0o644
}
