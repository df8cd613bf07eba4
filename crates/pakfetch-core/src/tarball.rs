//! Tarball extraction and introspection.
//!
//! Archives arrive as async byte streams and are decoded on a blocking
//! thread. Both gzipped and plain tar are accepted. The single top-level
//! directory (`package/` for npm, `<repo>-<sha>/` for git hosts) is
//! stripped from every entry.

use crate::error::FetchError;
use crate::options::Options;
use crate::stream::{self, ByteStream};
use flate2::read::GzDecoder;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Component, Path, PathBuf};
use tar::Archive;
use tracing::{debug, trace};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Kinds of entries that are materialized. Links and devices are skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Dir,
    File,
}

/// Receives each archive entry with its package-relative path.
trait EntrySink {
    fn entry(
        &mut self,
        rel: &Path,
        kind: EntryKind,
        mode: u32,
        body: &mut dyn Read,
    ) -> Result<(), FetchError>;
}

/// File ownership and permission settings for extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractOptions {
    pub fmode: u32,
    pub dmode: u32,
    pub umask: u32,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Package-relative paths that must be executable (declared bins).
    pub exec_paths: BTreeSet<String>,
}

impl ExtractOptions {
    #[must_use]
    pub fn from_options(opts: &Options) -> Self {
        Self {
            fmode: opts.fmode,
            dmode: opts.dmode,
            umask: opts.umask,
            uid: opts.uid,
            gid: opts.gid,
            exec_paths: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn with_exec_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.exec_paths = paths
            .into_iter()
            .map(|p| crate::manifest::normalize_bin_path(p.as_ref()))
            .collect();
        self
    }

    fn file_mode(&self, entry_mode: u32, rel: &str) -> u32 {
        let exe = if self.exec_paths.contains(rel) { 0o111 } else { 0 };
        (((entry_mode | self.fmode) & !self.umask) | exe | 0o600) & 0o7777
    }

    fn dir_mode(&self, entry_mode: u32) -> u32 {
        (((entry_mode | self.dmode) & !self.umask) | 0o700) & 0o7777
    }
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self::from_options(&Options::default())
    }
}

/// What [`scan`] found inside a tarball.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TarballContents {
    pub package_json: Option<Value>,
    pub shrinkwrap: Option<Value>,
    /// Files under the declared bin directory, package-relative.
    pub bin_files: Vec<String>,
}

/// Unpack `stream` into `dest`.
///
/// # Errors
/// Returns `Tar` for malformed archives or entries escaping `dest`, and
/// whatever error the stream itself ends with.
pub async fn extract(stream: ByteStream, dest: &Path, opts: ExtractOptions) -> Result<(), FetchError> {
    let reader = stream::blocking_reader(stream);
    let dest = dest.to_path_buf();
    debug!(dest = %dest.display(), "extracting tarball");
    tokio::task::spawn_blocking(move || {
        fs::create_dir_all(&dest)?;
        let mut sink = Extractor { dest, opts };
        walk(reader, &mut sink)
    })
    .await
    .map_err(|e| FetchError::tar(format!("extraction task failed: {e}")))?
}

/// Read `package.json`, `npm-shrinkwrap.json` and the bin directory listing
/// from a tarball in one pass. Each JSON document is parsed at most once.
///
/// # Errors
/// Returns `Json` for unparseable documents and `Tar` for malformed archives.
pub async fn scan(stream: ByteStream, bin_dir: Option<String>) -> Result<TarballContents, FetchError> {
    let reader = stream::blocking_reader(stream);
    tokio::task::spawn_blocking(move || {
        let mut sink = Scanner {
            bin_dir: bin_dir.map(|d| {
                let d = crate::manifest::normalize_bin_path(&d);
                format!("{}/", d.trim_end_matches('/'))
            }),
            contents: TarballContents::default(),
        };
        walk(reader, &mut sink)?;
        Ok(sink.contents)
    })
    .await
    .map_err(|e| FetchError::tar(format!("scan task failed: {e}")))?
}

fn walk(source: impl Read, sink: &mut dyn EntrySink) -> Result<(), FetchError> {
    let mut source = BufReader::new(source);
    let gzipped = source.fill_buf().map_err(codec_error)?.starts_with(&GZIP_MAGIC);
    if gzipped {
        let mut decoder = GzDecoder::new(&mut source);
        walk_archive(&mut decoder, sink)?;
        io::copy(&mut decoder, &mut io::sink()).map_err(codec_error)?;
    } else {
        walk_archive(&mut source, sink)?;
    }
    // Drain so end-of-stream checks (integrity, length) always run.
    io::copy(&mut source, &mut io::sink()).map_err(codec_error)?;
    Ok(())
}

fn walk_archive(reader: &mut dyn Read, sink: &mut dyn EntrySink) -> Result<(), FetchError> {
    let mut archive = Archive::new(reader);
    for entry in archive.entries().map_err(codec_error)? {
        let mut entry = entry.map_err(codec_error)?;
        let path = entry.path().map_err(codec_error)?.into_owned();
        let Some(rel) = package_relative(&path)? else {
            continue;
        };
        let entry_type = entry.header().entry_type();
        let kind = if entry_type.is_dir() {
            EntryKind::Dir
        } else if entry_type.is_file() {
            EntryKind::File
        } else {
            trace!(path = %path.display(), "skipping special entry");
            continue;
        };
        let mode = entry.header().mode().unwrap_or(0o644);
        sink.entry(&rel, kind, mode, &mut entry)?;
    }
    Ok(())
}

/// Strip the top-level directory and reject paths that could escape.
///
/// Returns `None` for the top-level directory itself.
fn package_relative(path: &Path) -> Result<Option<PathBuf>, FetchError> {
    let shown = path.to_string_lossy();
    let mut rel = PathBuf::new();
    let mut stripped = false;
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => {
                return Err(FetchError::tar(format!(
                    "Tarball contains absolute path: {shown}"
                )));
            }
            Component::ParentDir => {
                return Err(FetchError::tar(format!(
                    "Tarball contains path traversal: {shown}"
                )));
            }
            Component::CurDir => {}
            Component::Normal(part) => {
                if stripped {
                    rel.push(part);
                } else {
                    stripped = true;
                }
            }
        }
    }
    Ok((!rel.as_os_str().is_empty()).then_some(rel))
}

/// `tar` wraps stream errors; recover ours, otherwise report a codec error.
fn codec_error(e: io::Error) -> FetchError {
    match stream::from_io(e) {
        FetchError::Io { source } => FetchError::tar(source.to_string()),
        other => other,
    }
}

fn rel_string(rel: &Path) -> String {
    rel.to_string_lossy().replace('\\', "/")
}

struct Extractor {
    dest: PathBuf,
    opts: ExtractOptions,
}

impl EntrySink for Extractor {
    fn entry(
        &mut self,
        rel: &Path,
        kind: EntryKind,
        mode: u32,
        body: &mut dyn Read,
    ) -> Result<(), FetchError> {
        let target = self.dest.join(rel);
        match kind {
            EntryKind::Dir => {
                fs::create_dir_all(&target)?;
                set_mode(&target, self.opts.dir_mode(mode))?;
            }
            EntryKind::File => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut file = File::create(&target)?;
                io::copy(body, &mut file).map_err(stream::from_io)?;
                set_mode(&target, self.opts.file_mode(mode, &rel_string(rel)))?;
            }
        }
        chown(&target, self.opts.uid, self.opts.gid)
    }
}

struct Scanner {
    bin_dir: Option<String>,
    contents: TarballContents,
}

impl EntrySink for Scanner {
    fn entry(
        &mut self,
        rel: &Path,
        kind: EntryKind,
        _mode: u32,
        body: &mut dyn Read,
    ) -> Result<(), FetchError> {
        if kind != EntryKind::File {
            return Ok(());
        }
        let rel = rel_string(rel);
        match rel.as_str() {
            "package.json" if self.contents.package_json.is_none() => {
                self.contents.package_json = Some(read_json(body)?);
            }
            "npm-shrinkwrap.json" if self.contents.shrinkwrap.is_none() => {
                self.contents.shrinkwrap = Some(read_json(body)?);
            }
            _ => {
                if let Some(dir) = &self.bin_dir {
                    if rel.starts_with(dir.as_str()) {
                        self.contents.bin_files.push(rel);
                    }
                }
            }
        }
        Ok(())
    }
}

fn read_json(body: &mut dyn Read) -> Result<Value, FetchError> {
    let mut raw = Vec::new();
    body.read_to_end(&mut raw).map_err(codec_error)?;
    Ok(serde_json::from_slice(&raw)?)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), FetchError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), FetchError> {
    Ok(())
}

#[cfg(unix)]
fn chown(path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<(), FetchError> {
    if uid.is_some() || gid.is_some() {
        std::os::unix::fs::chown(path, uid, gid)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn chown(_path: &Path, _uid: Option<u32>, _gid: Option<u32>) -> Result<(), FetchError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tar::Builder;
    use tempfile::tempdir;

    fn tarball(entries: &[(&str, &str, u32)]) -> Vec<u8> {
        let mut tar_bytes = Vec::new();
        {
            let mut builder = Builder::new(&mut tar_bytes);
            for (path, data, mode) in entries {
                let mut header = tar::Header::new_gnu();
                header.set_path(path).unwrap();
                header.set_size(data.len() as u64);
                header.set_mode(*mode);
                header.set_cksum();
                builder.append(&header, data.as_bytes()).unwrap();
            }
            builder.finish().unwrap();
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar_bytes).unwrap();
        encoder.finish().unwrap()
    }

    fn as_stream(bytes: Vec<u8>) -> ByteStream {
        stream::from_bytes(Bytes::from(bytes))
    }

    #[tokio::test]
    async fn test_extract_strips_top_level() {
        let tgz = tarball(&[
            ("package/package.json", r#"{"name":"test","version":"1.0.0"}"#, 0o644),
            ("package/lib/index.js", "module.exports = 42;", 0o644),
        ]);
        let dir = tempdir().unwrap();
        extract(as_stream(tgz), dir.path(), ExtractOptions::default())
            .await
            .unwrap();
        assert!(dir.path().join("package.json").exists());
        assert_eq!(
            fs::read_to_string(dir.path().join("lib/index.js")).unwrap(),
            "module.exports = 42;"
        );
    }

    #[tokio::test]
    async fn test_extract_non_package_prefix() {
        // Git host archives use `<repo>-<sha>/` instead of `package/`.
        let tgz = tarball(&[("cli-abc123/index.d.ts", "test", 0o644)]);
        let dir = tempdir().unwrap();
        extract(as_stream(tgz), dir.path(), ExtractOptions::default())
            .await
            .unwrap();
        assert!(dir.path().join("index.d.ts").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_extract_modes() {
        use std::os::unix::fs::PermissionsExt;
        let tgz = tarball(&[
            ("package/a.js", "a", 0o600),
            ("package/bin/cli.js", "#!/usr/bin/env node", 0o644),
        ]);
        let dir = tempdir().unwrap();
        let opts = ExtractOptions::default().with_exec_paths(["./bin/cli.js"]);
        extract(as_stream(tgz), dir.path(), opts).await.unwrap();

        let mode = |p: &str| fs::metadata(dir.path().join(p)).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode("a.js"), 0o644);
        assert_eq!(mode("bin/cli.js"), 0o755);
    }

    #[test]
    fn test_package_relative_rejects_escapes() {
        assert!(package_relative(Path::new("/etc/passwd")).is_err());
        assert!(package_relative(Path::new("package/../../x")).is_err());
        assert_eq!(package_relative(Path::new("package/")).unwrap(), None);
        assert_eq!(
            package_relative(Path::new("./package/a/b.js")).unwrap(),
            Some(PathBuf::from("a/b.js"))
        );
    }

    #[tokio::test]
    async fn test_scan_reads_documents_and_bins() {
        let tgz = tarball(&[
            ("package/package.json", r#"{"name":"x","version":"1.0.0"}"#, 0o644),
            ("package/npm-shrinkwrap.json", r#"{"lockfileVersion":1}"#, 0o644),
            ("package/bin/one", "1", 0o755),
            ("package/bin/sub/two", "2", 0o755),
            ("package/lib/three", "3", 0o644),
        ]);
        let contents = scan(as_stream(tgz), Some("./bin".to_string())).await.unwrap();
        assert_eq!(contents.package_json.unwrap()["name"], "x");
        assert_eq!(contents.shrinkwrap.unwrap()["lockfileVersion"], 1);
        assert_eq!(contents.bin_files, vec!["bin/one", "bin/sub/two"]);
    }

    #[tokio::test]
    async fn test_scan_plain_tar() {
        let mut tar_bytes = Vec::new();
        {
            let mut builder = Builder::new(&mut tar_bytes);
            let data = br#"{"name":"plain"}"#;
            let mut header = tar::Header::new_gnu();
            header.set_path("package/package.json").unwrap();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, &data[..]).unwrap();
            builder.finish().unwrap();
        }
        let contents = scan(as_stream(tar_bytes), None).await.unwrap();
        assert_eq!(contents.package_json.unwrap()["name"], "plain");
    }

    #[tokio::test]
    async fn test_garbage_is_a_tar_error() {
        let err = scan(as_stream(vec![0x1f, 0x8b, 0, 1, 2, 3]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Tar { .. }));
    }
}
