use std::path::{Path, PathBuf};

/// Bumped when the on-disk cache layout changes incompatibly.
pub const CACHE_LAYOUT_VERSION: u32 = 1;

/// Environment variable overriding the cache directory.
pub const CACHE_DIR_ENV: &str = "PAKFETCH_CACHE";

/// Find the project root by walking up from `cwd` looking for `package.json` or `.git`.
///
/// Returns the first directory containing either marker, or `None` if neither is found.
#[must_use]
pub fn project_root(cwd: &Path) -> Option<PathBuf> {
    let mut current = cwd.to_path_buf();

    loop {
        if current.join("package.json").exists() || current.join(".git").exists() {
            return Some(current);
        }

        if !current.pop() {
            return None;
        }
    }
}

/// Get the default cache directory for pakfetch.
///
/// `PAKFETCH_CACHE` wins when set. Otherwise platform-appropriate locations:
/// - Linux: `$XDG_CACHE_HOME/pakfetch/v{N}` or `~/.cache/pakfetch/v{N}`
/// - macOS: `~/Library/Caches/pakfetch/v{N}`
/// - Windows: `%LOCALAPPDATA%\pakfetch\v{N}`
#[must_use]
pub fn default_cache_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(CACHE_DIR_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(dir);
    }
    let base = dirs_next::cache_dir().map_or_else(
        || {
            dirs_next::home_dir().map_or_else(
                || PathBuf::from(".pakfetch-cache"),
                |p| p.join(".cache").join("pakfetch"),
            )
        },
        |p| p.join("pakfetch"),
    );

    base.join(format!("v{CACHE_LAYOUT_VERSION}"))
}
