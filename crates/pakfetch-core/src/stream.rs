//! Byte-stream plumbing: fan-out, verification, and sync bridging.

use crate::error::FetchError;
use crate::integrity::{Integrity, IntegrityHasher};
use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt, TryStreamExt};
use std::error::Error as StdError;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::io::{ReaderStream, StreamReader, SyncIoBridge};

/// A fallible stream of tarball bytes.
pub type ByteStream = BoxStream<'static, Result<Bytes, FetchError>>;

/// Per-branch buffer for [`tee`], in chunks.
pub const TEE_CAPACITY: usize = 16;

#[derive(Debug, Default)]
struct SignalState {
    resolved: Option<String>,
    integrity: Option<Integrity>,
}

/// Out-of-band facts learned while a tarball streams.
///
/// Producers set them as soon as they are known; consumers read them once
/// the stream has been drained.
#[derive(Debug, Clone, Default)]
pub struct Signals {
    state: Arc<Mutex<SignalState>>,
}

impl Signals {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_resolved(&self, resolved: impl Into<String>) {
        self.lock().resolved = Some(resolved.into());
    }

    pub fn set_integrity(&self, integrity: Integrity) {
        self.lock().integrity = Some(integrity);
    }

    #[must_use]
    pub fn resolved(&self) -> Option<String> {
        self.lock().resolved.clone()
    }

    #[must_use]
    pub fn integrity(&self) -> Option<Integrity> {
        self.lock().integrity.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SignalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A tarball byte stream plus its signals.
pub struct TarballStream {
    pub stream: ByteStream,
    pub signals: Signals,
}

impl TarballStream {
    #[must_use]
    pub fn new(stream: ByteStream) -> Self {
        Self {
            stream,
            signals: Signals::new(),
        }
    }

    #[must_use]
    pub fn from_bytes(bytes: Bytes) -> Self {
        Self::new(from_bytes(bytes))
    }

    #[must_use]
    pub fn with_resolved(self, resolved: impl Into<String>) -> Self {
        self.signals.set_resolved(resolved);
        self
    }

    /// Replace the byte stream, keeping the signals.
    #[must_use]
    pub fn map_stream(self, f: impl FnOnce(ByteStream) -> ByteStream) -> Self {
        Self {
            stream: f(self.stream),
            signals: self.signals,
        }
    }

    /// Buffer the whole tarball.
    ///
    /// # Errors
    /// Returns the first error the stream yields.
    pub async fn collect(self) -> Result<Bytes, FetchError> {
        collect(self.stream).await
    }
}

impl std::fmt::Debug for TarballStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TarballStream")
            .field("signals", &self.signals)
            .finish_non_exhaustive()
    }
}

#[must_use]
pub fn from_bytes(bytes: Bytes) -> ByteStream {
    stream::once(async move { Ok(bytes) }).boxed()
}

/// Drain a stream into one buffer.
///
/// # Errors
/// Returns the first error the stream yields.
pub async fn collect(mut stream: ByteStream) -> Result<Bytes, FetchError> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.try_next().await? {
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// Stream a file in chunks.
#[must_use]
pub fn file_stream(file: tokio::fs::File) -> ByteStream {
    ReaderStream::new(file).map_err(FetchError::from).boxed()
}

/// Split one stream into `n` streams that each see every chunk.
///
/// A single pump task pulls from upstream and delivers each item to every
/// live branch before pulling the next, so upstream runs at the pace of the
/// slowest branch. A branch whose receiver is dropped is detached and no
/// longer holds the others back. Errors are delivered to every branch.
#[must_use]
pub fn tee(upstream: ByteStream, n: usize) -> Vec<ByteStream> {
    let mut senders = Vec::with_capacity(n);
    let mut branches = Vec::with_capacity(n);
    for _ in 0..n {
        let (tx, rx) = mpsc::channel::<Result<Bytes, FetchError>>(TEE_CAPACITY);
        senders.push(tx);
        branches.push(receiver_stream(rx));
    }

    pump(upstream, senders);
    branches
}

/// Two-way [`tee`].
#[must_use]
pub fn tee_pair(upstream: ByteStream) -> (ByteStream, ByteStream) {
    let (tx_a, rx_a) = mpsc::channel(TEE_CAPACITY);
    let (tx_b, rx_b) = mpsc::channel(TEE_CAPACITY);
    pump(upstream, vec![tx_a, tx_b]);
    (receiver_stream(rx_a), receiver_stream(rx_b))
}

fn pump(upstream: ByteStream, senders: Vec<mpsc::Sender<Result<Bytes, FetchError>>>) {
    tokio::spawn(async move {
        let mut upstream = upstream;
        let mut senders = senders;
        while let Some(item) = upstream.next().await {
            let failed = item.is_err();
            let mut live = Vec::with_capacity(senders.len());
            for tx in senders {
                if tx.send(item.clone()).await.is_ok() {
                    live.push(tx);
                }
            }
            senders = live;
            if senders.is_empty() || failed {
                break;
            }
        }
    });
}

fn receiver_stream(rx: mpsc::Receiver<Result<Bytes, FetchError>>) -> ByteStream {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

/// Hash a stream as it passes through and check it at end of stream.
///
/// With `expected`, a mismatch replaces the end of stream with an
/// `IntegrityMismatch` error. With `size`, ending early yields `Truncated`.
/// On success the computed integrity is published to `signals`.
#[must_use]
pub fn verify(
    stream: ByteStream,
    expected: Option<Integrity>,
    size: Option<u64>,
    signals: Option<Signals>,
) -> ByteStream {
    Verify {
        inner: stream,
        hasher: Some(IntegrityHasher::for_expected(expected.as_ref())),
        expected,
        size,
        signals,
    }
    .boxed()
}

struct Verify {
    inner: ByteStream,
    hasher: Option<IntegrityHasher>,
    expected: Option<Integrity>,
    size: Option<u64>,
    signals: Option<Signals>,
}

impl Verify {
    fn finish(&mut self) -> Option<FetchError> {
        let hasher = self.hasher.take()?;
        let actual_size = hasher.size();
        if let Some(expected_size) = self.size {
            if actual_size != expected_size {
                return Some(FetchError::Truncated {
                    expected: expected_size,
                    actual: actual_size,
                });
            }
        }
        let actual = hasher.finish();
        if let Some(expected) = &self.expected {
            if let Err(e) = expected.check(&actual) {
                return Some(e);
            }
        }
        if let Some(signals) = &self.signals {
            signals.set_integrity(actual);
        }
        None
    }
}

impl Stream for Verify {
    type Item = Result<Bytes, FetchError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.hasher.is_none() {
            return Poll::Ready(None);
        }
        match self.inner.poll_next_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(hasher) = self.hasher.as_mut() {
                    hasher.update(&chunk);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.hasher = None;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => Poll::Ready(self.finish().map(Err)),
        }
    }
}

/// Hold back end of stream until `done` settles; its error becomes the
/// stream's last item.
#[must_use]
pub fn with_completion(
    stream: ByteStream,
    done: BoxFuture<'static, Result<(), FetchError>>,
) -> ByteStream {
    stream
        .chain(stream::once(done).filter_map(|r| async move { r.err().map(Err) }))
        .boxed()
}

/// Wrap a [`FetchError`] so it survives a trip through `std::io`.
#[must_use]
pub fn into_io(e: FetchError) -> io::Error {
    match e {
        FetchError::Io { source } if source.get_ref().is_none() => io::Error::from(source.kind()),
        other => io::Error::other(other),
    }
}

/// Recover a [`FetchError`] carried through `std::io`, looking through
/// wrappers added by codecs such as `tar`.
#[must_use]
pub fn from_io(e: io::Error) -> FetchError {
    if let Some(found) = find_fetch_error(&e) {
        return found;
    }
    FetchError::from(e)
}

fn find_fetch_error(e: &io::Error) -> Option<FetchError> {
    let mut current: Option<&(dyn StdError + 'static)> =
        e.get_ref().map(|inner| inner as &(dyn StdError + 'static));
    while let Some(err) = current {
        if let Some(found) = err.downcast_ref::<FetchError>() {
            return Some(found.clone());
        }
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            if let Some(found) = find_fetch_error(io_err) {
                return Some(found);
            }
        }
        current = err.source();
    }
    None
}

/// Blocking `Read` over an async stream, for codecs that only speak
/// `std::io`. Must be created inside a runtime and read on a blocking thread.
pub fn blocking_reader(stream: ByteStream) -> impl io::Read + Send + 'static {
    let io_stream: BoxStream<'static, Result<Bytes, io::Error>> = stream.map_err(into_io).boxed();
    SyncIoBridge::new(StreamReader::new(io_stream))
}
