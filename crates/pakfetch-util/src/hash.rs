use std::path::{Path, PathBuf};

/// Compute the BLAKE3 hash of a byte slice, returning the hex-encoded digest.
#[must_use]
pub fn blake3_hex(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Spread a hex digest over a two-level directory fan-out under `root`.
///
/// `abcdef…` becomes `root/ab/cd/ef…`, which keeps directory sizes small
/// when the store holds many entries.
#[must_use]
pub fn bucket_path(root: &Path, hex: &str) -> PathBuf {
    if hex.len() <= 4 || !hex.is_ascii() {
        return root.join(hex);
    }
    root.join(&hex[..2]).join(&hex[2..4]).join(&hex[4..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blake3_hex() {
        // Known BLAKE3 hash of "hello world"
        assert_eq!(
            blake3_hex(b"hello world"),
            "d74981efa70a0c880b8d8c1985d075dbcbf679b99a5f9914e5aaf96b831a9e24"
        );
    }

    #[test]
    fn test_bucket_path() {
        let path = bucket_path(Path::new("/cache"), "abcdef0123");
        assert_eq!(path, Path::new("/cache/ab/cd/ef0123"));
    }

    #[test]
    fn test_bucket_path_short_hex() {
        let path = bucket_path(Path::new("/cache"), "abc");
        assert_eq!(path, Path::new("/cache/abc"));
    }
}
