use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Build a unique sibling path for `path` suitable for a write-then-rename.
///
/// The name embeds the process id and a process-wide counter so concurrent
/// writers inside one process never collide.
#[must_use]
pub fn temp_sibling(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or(Path::new("."));
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    parent.join(format!(
        ".{}.tmp.{}.{n}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
        std::process::id()
    ))
}

/// Atomically write bytes to a file by writing to a temp file then renaming.
///
/// Parent directories are created as needed. The file will either have the
/// old contents or the new contents, never a partial write.
///
/// # Errors
/// Returns an error if the write or rename fails.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp_path = temp_sibling(path);

    {
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    persist(&temp_path, path)
}

/// Move a finished temp file into place.
///
/// If the rename fails because the destination already exists (Windows), the
/// temp file is copied over and removed. On any other failure the temp file
/// is removed and the error returned.
///
/// # Errors
/// Returns an error if the file cannot be moved into place.
pub fn persist(temp_path: &Path, path: &Path) -> io::Result<()> {
    match fs::rename(temp_path, path) {
        Ok(()) => Ok(()),
        Err(e) => {
            if cfg!(windows) {
                fs::copy(temp_path, path)?;
                let _ = fs::remove_file(temp_path);
                Ok(())
            } else {
                let _ = fs::remove_file(temp_path);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_atomic_write_creates_parents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("test.txt");

        atomic_write(&path, b"hello").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello");

        atomic_write(&path, b"world").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "world");
    }

    #[test]
    fn test_atomic_write_no_temp_left_on_success() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.txt");

        atomic_write(&path, b"content").unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].as_ref().unwrap().file_name().to_str().unwrap(),
            "test.txt"
        );
    }

    #[test]
    fn test_temp_sibling_is_unique() {
        let path = Path::new("/tmp/x/file.bin");
        let a = temp_sibling(path);
        let b = temp_sibling(path);
        assert_ne!(a, b);
        assert_eq!(a.parent(), path.parent());
    }
}
