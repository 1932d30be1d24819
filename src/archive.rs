//! The seams between the compressor pool and the archive it fills
//!
//! The pool only needs three capabilities: open a named entry in an archive
//! ([`ArchiveWriter`]), stream bytes into that entry and finalize it
//! ([`EntrySink`]), and read a request's bytes and release the source
//! ([`EntrySource`]). [`ZipArchive`](crate::ZipArchive) is the stock archive;
//! tests and callers can plug in their own.

use crate::error::Result;
use futures_util::future::{BoxFuture, FutureExt};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// What an entry looked like once it was closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryStats {
    /// Entry name in the archive
    pub name: String,
    /// Spool file the entry was compressed into, if the archive used one
    pub tmp_file: Option<PathBuf>,
    /// Bytes written into the entry
    pub uncompressed_size: u64,
    /// Bytes the entry occupies in the archive, headers excluded
    pub compressed_size: u64,
    /// CRC32 of the uncompressed bytes
    pub crc32: u32,
}

/// Something new entries can be opened in.
///
/// `begin_entry` may be called from many workers at once; implementations
/// serialize whatever shared state they keep.
pub trait ArchiveWriter: Send + Sync {
    fn begin_entry<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Box<dyn EntrySink>>>;
}

impl<T: ArchiveWriter + ?Sized> ArchiveWriter for Arc<T> {
    fn begin_entry<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Box<dyn EntrySink>>> {
        (**self).begin_entry(name)
    }
}

/// The writable side of one open entry.
pub trait EntrySink: AsyncWrite + Unpin + Send {
    /// Finalizes the entry, making it part of the archive
    fn close(self: Box<Self>) -> BoxFuture<'static, Result<EntryStats>>;
}

/// The readable side of a request, closed exactly once by the pool.
pub trait EntrySource: AsyncRead + Unpin + Send {
    fn close(&mut self) -> BoxFuture<'_, Result<()>>;
}

/// Adapts any [`AsyncRead`] into an [`EntrySource`] whose close just drops it.
#[derive(Debug)]
pub struct ReaderSource<R> {
    inner: Option<R>,
}

impl<R> ReaderSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: Some(reader),
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ReaderSource<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.inner.as_mut() {
            Some(reader) => Pin::new(reader).poll_read(cx, buf),
            // Closed: behave as an exhausted stream
            None => Poll::Ready(Ok(())),
        }
    }
}

impl<R: AsyncRead + Unpin + Send> EntrySource for ReaderSource<R> {
    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        self.inner = None;
        async { Ok(()) }.boxed()
    }
}
