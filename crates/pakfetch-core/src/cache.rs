//! Content-addressable cache.
//!
//! Content lives at `content-v2/<algo>/<hex fan-out>` and is addressed by
//! its digest. Logical keys (request URLs, git pack ids, finalized
//! manifests) map to content through JSON index entries stored at
//! `index-v5/<blake3(key) fan-out>`.
//!
//! Every read by digest re-verifies the bytes.

use crate::error::FetchError;
use crate::integrity::{Hash, Integrity, IntegrityHasher};
use crate::stream::{self, ByteStream};
use bytes::Bytes;
use futures::TryStreamExt;
use pakfetch_util::fs::{atomic_write, persist, temp_sibling};
use pakfetch_util::hash::{blake3_hex, bucket_path};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace, warn};

const CONTENT_DIR: &str = "content-v2";
const INDEX_DIR: &str = "index-v5";
const TMP_DIR: &str = "tmp";

/// Index record for a logical key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub key: String,
    pub integrity: String,
    pub size: u64,
    /// Milliseconds since the Unix epoch when the entry was written.
    pub time: u64,
    #[serde(default)]
    pub metadata: Value,
}

impl IndexEntry {
    /// # Errors
    /// Returns `Cache` if the stored integrity does not parse.
    pub fn integrity(&self) -> Result<Integrity, FetchError> {
        Integrity::parse(&self.integrity)
            .map_err(|_| FetchError::cache(format!("bad integrity in index entry '{}'", self.key)))
    }

    /// Age relative to `now`, saturating at zero.
    #[must_use]
    pub fn age_ms(&self, now: SystemTime) -> u64 {
        now_ms(now).saturating_sub(self.time)
    }
}

/// Filesystem content cache rooted at one directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentCache {
    root: PathBuf,
}

impl ContentCache {
    #[must_use]
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where content with digest `hash` is stored.
    #[must_use]
    pub fn content_path(&self, hash: &Hash) -> Option<PathBuf> {
        let hex = hash.hex_digest()?;
        Some(bucket_path(
            &self.root.join(CONTENT_DIR).join(hash.algorithm.as_str()),
            &hex,
        ))
    }

    fn index_path(&self, key: &str) -> PathBuf {
        let mut path = bucket_path(&self.root.join(INDEX_DIR), &blake3_hex(key.as_bytes()));
        path.set_extension("json");
        path
    }

    fn locate(&self, integrity: &Integrity) -> Option<PathBuf> {
        integrity
            .hashes()
            .iter()
            .filter_map(|h| self.content_path(h))
            .find(|p| p.is_file())
    }

    /// Whether content for `integrity` is present (unverified).
    #[must_use]
    pub fn has_content(&self, integrity: &Integrity) -> bool {
        self.locate(integrity).is_some()
    }

    /// Store `data` under `key`.
    ///
    /// # Errors
    /// Returns `IntegrityMismatch` if `expected` disagrees with the data and
    /// `Cache` if the store cannot be written.
    pub async fn put(
        &self,
        key: &str,
        data: Bytes,
        expected: Option<&Integrity>,
        metadata: Value,
    ) -> Result<Integrity, FetchError> {
        let mut writer = self.writer(key, expected.cloned(), metadata).await?;
        writer.write(&data).await?;
        writer.commit().await
    }

    /// Start a streaming write under `key`.
    ///
    /// # Errors
    /// Returns `Cache` if the temp file cannot be created.
    pub async fn writer(
        &self,
        key: &str,
        expected: Option<Integrity>,
        metadata: Value,
    ) -> Result<CacheWriter, FetchError> {
        let tmp_dir = self.root.join(TMP_DIR);
        tokio::fs::create_dir_all(&tmp_dir)
            .await
            .map_err(|e| cache_io("create tmp dir", &e))?;
        let path = temp_sibling(&tmp_dir.join("write"));
        let file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| cache_io("create temp file", &e))?;
        Ok(CacheWriter {
            cache: self.clone(),
            key: key.to_string(),
            metadata,
            hasher: IntegrityHasher::for_expected(expected.as_ref()),
            expected,
            file,
            temp: TempFile(Some(path)),
        })
    }

    /// Drain `stream` into the cache under `key`.
    ///
    /// # Errors
    /// Propagates stream errors; see [`CacheWriter::commit`].
    pub async fn write_stream(
        &self,
        key: &str,
        mut stream: ByteStream,
        expected: Option<Integrity>,
        metadata: Value,
    ) -> Result<Integrity, FetchError> {
        let mut writer = self.writer(key, expected, metadata).await?;
        while let Some(chunk) = stream.try_next().await? {
            writer.write(&chunk).await?;
        }
        writer.commit().await
    }

    /// Look up the index entry for `key`.
    ///
    /// # Errors
    /// Returns `Cache` if the entry exists but cannot be read.
    pub async fn get_info(&self, key: &str) -> Result<Option<IndexEntry>, FetchError> {
        let path = self.index_path(key);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(cache_io("read index", &e)),
        };
        let entry: IndexEntry = serde_json::from_slice(&raw)
            .map_err(|e| FetchError::cache(format!("corrupt index entry for '{key}': {e}")))?;
        // blake3 collisions are not a practical concern; key mismatch means a stale write
        Ok((entry.key == key).then_some(entry))
    }

    /// Read the content behind `key`, verified.
    ///
    /// Missing content yields `None`.
    ///
    /// # Errors
    /// Returns `IntegrityMismatch` for corrupt content.
    pub async fn get_by_key(&self, key: &str) -> Result<Option<(IndexEntry, Bytes)>, FetchError> {
        let Some(entry) = self.get_info(key).await? else {
            return Ok(None);
        };
        let integrity = entry.integrity()?;
        match self.read(&integrity).await {
            Ok(bytes) => Ok(Some((entry, bytes))),
            Err(FetchError::NotCached { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Read content by digest, verified.
    ///
    /// # Errors
    /// Returns `NotCached` if absent and `IntegrityMismatch` if corrupt.
    pub async fn read(&self, integrity: &Integrity) -> Result<Bytes, FetchError> {
        stream::collect(self.stream(integrity).await?).await
    }

    /// Stream content by digest, verifying as it goes.
    ///
    /// # Errors
    /// Returns `NotCached` if absent.
    pub async fn stream(&self, integrity: &Integrity) -> Result<ByteStream, FetchError> {
        let path = self.locate(integrity).ok_or_else(|| FetchError::NotCached {
            key: integrity.to_string(),
        })?;
        let file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(FetchError::NotCached {
                    key: integrity.to_string(),
                })
            }
            Err(e) => return Err(cache_io("open content", &e)),
        };
        trace!(path = %path.display(), "streaming cached content");
        Ok(stream::verify(
            stream::file_stream(file),
            Some(integrity.clone()),
            None,
            None,
        ))
    }

    /// Remove content for every hash in `integrity`.
    ///
    /// # Errors
    /// Returns `Cache` on I/O failure other than absence.
    pub async fn rm_content(&self, integrity: &Integrity) -> Result<(), FetchError> {
        for path in integrity.hashes().iter().filter_map(|h| self.content_path(h)) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "removed cached content"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(cache_io("remove content", &e)),
            }
        }
        Ok(())
    }

    /// Remove the index entry for `key`; content is left in place.
    ///
    /// # Errors
    /// Returns `Cache` on I/O failure other than absence.
    pub async fn rm_entry(&self, key: &str) -> Result<(), FetchError> {
        match tokio::fs::remove_file(self.index_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(cache_io("remove index", &e)),
        }
    }

    /// Rewrite `key`'s metadata and timestamp without touching content.
    ///
    /// # Errors
    /// Returns `Cache` on I/O failure.
    pub async fn touch(&self, mut entry: IndexEntry, metadata: Value) -> Result<(), FetchError> {
        entry.time = now_ms(SystemTime::now());
        entry.metadata = metadata;
        self.write_index(&entry).await
    }

    async fn write_index(&self, entry: &IndexEntry) -> Result<(), FetchError> {
        let path = self.index_path(&entry.key);
        let body = serde_json::to_vec(entry)?;
        tokio::task::spawn_blocking(move || atomic_write(&path, &body))
            .await
            .map_err(|e| FetchError::cache(format!("index writer panicked: {e}")))?
            .map_err(|e| cache_io("write index", &e))
    }
}

/// Removes an uncommitted temp file on drop.
struct TempFile(Option<PathBuf>);

impl TempFile {
    fn keep(&mut self) -> Option<PathBuf> {
        self.0.take()
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if let Some(path) = self.0.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// An in-progress streaming cache write.
///
/// Dropping it without [`commit`](Self::commit) discards the partial data.
pub struct CacheWriter {
    cache: ContentCache,
    key: String,
    metadata: Value,
    expected: Option<Integrity>,
    hasher: IntegrityHasher,
    file: tokio::fs::File,
    temp: TempFile,
}

impl CacheWriter {
    /// # Errors
    /// Returns `Cache` on write failure.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), FetchError> {
        self.hasher.update(chunk);
        self.file
            .write_all(chunk)
            .await
            .map_err(|e| cache_io("write content", &e))
    }

    /// Verify, move the content into place, and write the index entry.
    ///
    /// # Errors
    /// Returns `IntegrityMismatch` if the data disagrees with the expected
    /// integrity (nothing is stored), or `Cache` on I/O failure.
    pub async fn commit(mut self) -> Result<Integrity, FetchError> {
        self.file
            .flush()
            .await
            .map_err(|e| cache_io("flush content", &e))?;
        self.file
            .sync_all()
            .await
            .map_err(|e| cache_io("sync content", &e))?;

        let size = self.hasher.size();
        let actual = std::mem::replace(&mut self.hasher, IntegrityHasher::new(&[])).finish();
        if let Some(expected) = &self.expected {
            expected.check(&actual)?;
        }

        let targets: Vec<PathBuf> = actual
            .hashes()
            .iter()
            .filter_map(|h| self.cache.content_path(h))
            .collect();
        let Some(temp) = self.temp.keep() else {
            return Err(FetchError::cache("cache writer already committed"));
        };
        tokio::task::spawn_blocking(move || place_content(&temp, &targets))
            .await
            .map_err(|e| FetchError::cache(format!("content writer panicked: {e}")))?
            .map_err(|e| cache_io("store content", &e))?;

        let entry = IndexEntry {
            key: self.key.clone(),
            integrity: actual.to_string(),
            size,
            time: now_ms(SystemTime::now()),
            metadata: std::mem::take(&mut self.metadata),
        };
        self.cache.write_index(&entry).await?;
        debug!(key = %self.key, integrity = %actual.strongest(), size, "cached content");
        Ok(actual)
    }
}

/// Move `temp` to the first target and link or copy it to the rest.
fn place_content(temp: &Path, targets: &[PathBuf]) -> io::Result<()> {
    let Some((first, rest)) = targets.split_first() else {
        let _ = std::fs::remove_file(temp);
        return Ok(());
    };
    for target in targets {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
    }
    persist(temp, first)?;
    for target in rest {
        if target.exists() {
            continue;
        }
        if std::fs::hard_link(first, target).is_err() {
            if let Err(e) = std::fs::copy(first, target) {
                warn!(path = %target.display(), error = %e, "could not alias cached content");
            }
        }
    }
    Ok(())
}

fn cache_io(action: &str, e: &io::Error) -> FetchError {
    FetchError::cache(format!("{action}: {e}"))
}

fn now_ms(now: SystemTime) -> u64 {
    now.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
