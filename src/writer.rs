//! Spooling ZIP writer that accepts entries from many tasks at once
//!
//! Every entry is compressed into its own temp file while it is being written.
//! Only when the entry is closed does the writer take the archive lock and
//! append the finished entry (local header + compressed bytes) to the output.
//! Compression therefore runs fully in parallel, and the output only ever sees
//! whole entries, one after another.
//!
//! Sizes and CRC are known by the time an entry is appended, so local headers
//! carry them directly and no data descriptors are written. ZIP64 records are
//! emitted when sizes, offsets or the entry count outgrow the classic format.

use crate::archive::{ArchiveWriter, EntrySink, EntryStats};
use crate::error::{PzipError, Result};
use crate::tmpfile::{SystemTempFiles, TempFileProvider};
use async_compression::tokio::write::DeflateEncoder;
use crc32fast::Hasher as Crc32;
use futures_util::future::{BoxFuture, FutureExt};
use pin_project_lite::pin_project;
use std::io::SeekFrom;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tempfile::NamedTempFile;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

/// General purpose flag bit 11: file names are UTF-8
const FLAG_UTF8: u16 = 1 << 11;
/// 1980-01-01, the earliest date MS-DOS timestamps can hold
const DOS_DATE_EPOCH: u16 = (1 << 5) | 1;
const VERSION_DEFAULT: u16 = 20;
const VERSION_ZIP64: u16 = 45;

/// Compression method to use for ZIP entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    /// No compression (stored)
    Stored,
    /// DEFLATE compression (most common)
    Deflate,
}

impl CompressionMethod {
    pub(crate) fn to_zip_method(self) -> u16 {
        match self {
            CompressionMethod::Stored => 0,
            CompressionMethod::Deflate => 8,
        }
    }
}

fn deflate_level(compression_level: u32) -> async_compression::Level {
    match compression_level {
        0 => async_compression::Level::Fastest,
        1..=3 => async_compression::Level::Precise(compression_level as i32),
        4..=6 => async_compression::Level::Default,
        7..=9 => async_compression::Level::Best,
        _ => async_compression::Level::Default,
    }
}

/// Entry already appended to the output, kept for the central directory
struct ZipEntry {
    name: String,
    local_header_offset: u64,
    crc32: u32,
    compressed_size: u64,
    uncompressed_size: u64,
    compression_method: u16,
}

impl ZipEntry {
    fn needs_zip64(&self) -> bool {
        overflows_u32(self.compressed_size)
            || overflows_u32(self.uncompressed_size)
            || overflows_u32(self.local_header_offset)
    }
}

struct ArchiveState<W> {
    /// `None` once the archive has been finished
    output: Option<W>,
    /// Bytes written to `output` so far
    offset: u64,
    entries: Vec<ZipEntry>,
    /// Set when a write to `output` failed part way through an entry
    broken: bool,
}

/// A ZIP archive that many workers can add entries to concurrently.
///
/// `ZipArchive` is a handle: clones share the same output. Call
/// [`ZipArchive::finish`] once every entry has been closed to write the
/// central directory and get the output back.
pub struct ZipArchive<W> {
    shared: Arc<Mutex<ArchiveState<W>>>,
    tmpfiles: Arc<dyn TempFileProvider>,
    compression_level: u32,
    compression_method: CompressionMethod,
}

impl<W> Clone for ZipArchive<W> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            tmpfiles: Arc::clone(&self.tmpfiles),
            compression_level: self.compression_level,
            compression_method: self.compression_method,
        }
    }
}

impl ZipArchive<File> {
    /// Create an archive file at `path` with default compression level (6) using DEFLATE
    pub async fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let output = File::create(path).await?;
        Ok(Self::from_writer(output))
    }
}

impl<W: AsyncWrite + Unpin + Send + 'static> ZipArchive<W> {
    /// Create an archive over an arbitrary writer with default compression level (6) using DEFLATE
    pub fn from_writer(writer: W) -> Self {
        Self::from_writer_with_method(writer, CompressionMethod::Deflate, 6)
    }

    /// Create an archive over an arbitrary writer with specified compression method and level
    ///
    /// # Arguments
    /// * `writer` - Any writer implementing AsyncWrite + Unpin; no seeking is needed
    /// * `method` - Compression method to use (Deflate or Stored)
    /// * `compression_level` - Compression level (0-9 for DEFLATE)
    pub fn from_writer_with_method(
        writer: W,
        method: CompressionMethod,
        compression_level: u32,
    ) -> Self {
        Self {
            shared: Arc::new(Mutex::new(ArchiveState {
                output: Some(writer),
                offset: 0,
                entries: Vec::new(),
                broken: false,
            })),
            tmpfiles: Arc::new(SystemTempFiles),
            compression_level,
            compression_method: method,
        }
    }

    /// Use `provider` for spool files instead of the system temp directory
    pub fn with_tmpfiles(mut self, provider: impl TempFileProvider + 'static) -> Self {
        self.tmpfiles = Arc::new(provider);
        self
    }

    /// Number of entries appended so far
    pub async fn entry_count(&self) -> usize {
        self.shared.lock().await.entries.len()
    }

    /// Open a new entry. Bytes written to the returned writer are compressed
    /// into a spool file; closing it appends the entry to the archive.
    pub async fn start_entry(&self, name: &str) -> Result<ZipEntryWriter<W>> {
        if name.len() > u16::MAX as usize {
            return Err(PzipError::InvalidFormat(format!(
                "entry name is {} bytes, longer than {}",
                name.len(),
                u16::MAX
            )));
        }
        if self.shared.lock().await.output.is_none() {
            return Err(PzipError::ArchiveFinished);
        }

        let tmp = self.tmpfiles.allocate()?;
        let file = File::from_std(tmp.reopen()?);

        let spool: Box<dyn SpoolWrite> = match self.compression_method {
            CompressionMethod::Stored => Box::new(StoredSpool { file }),
            CompressionMethod::Deflate => Box::new(DeflateSpool {
                encoder: DeflateEncoder::with_quality(file, deflate_level(self.compression_level)),
            }),
        };

        debug!(entry = name, spool = %tmp.path().display(), "entry started");

        Ok(ZipEntryWriter {
            name: name.to_string(),
            writer: CrcWriter::new(spool),
            tmp,
            archive: self.clone(),
        })
    }

    /// Append a closed entry's spooled bytes to the output.
    ///
    /// The archive lock is held for the whole append so entries never interleave.
    async fn append_entry(
        &self,
        name: &str,
        crc32: u32,
        compressed_size: u64,
        uncompressed_size: u64,
        spool: &mut File,
    ) -> Result<()> {
        let compression_method = self.compression_method.to_zip_method();

        let mut guard = self.shared.lock().await;
        let state = &mut *guard;
        if state.broken {
            return Err(broken_output());
        }
        let output = state.output.as_mut().ok_or(PzipError::ArchiveFinished)?;

        let local_header_offset = state.offset;
        let header = local_header(
            name,
            compression_method,
            crc32,
            compressed_size,
            uncompressed_size,
        );

        // Any failure past this point leaves a partial entry in the output.
        state.broken = true;
        output.write_all(&header).await?;
        let copied = tokio::io::copy(spool, output).await?;
        if copied != compressed_size {
            return Err(PzipError::InvalidFormat(format!(
                "spool for {} held {} bytes, expected {}",
                name, copied, compressed_size
            )));
        }
        state.broken = false;

        state.offset += header.len() as u64 + copied;
        state.entries.push(ZipEntry {
            name: name.to_string(),
            local_header_offset,
            crc32,
            compressed_size,
            uncompressed_size,
            compression_method,
        });

        Ok(())
    }

    /// Finish the archive (write central directory and return the writer)
    ///
    /// Entries still open when this is called fail to close with
    /// [`PzipError::ArchiveFinished`].
    pub async fn finish(&self) -> Result<W> {
        let mut guard = self.shared.lock().await;
        let state = &mut *guard;
        if state.broken {
            return Err(broken_output());
        }
        let mut output = state.output.take().ok_or(PzipError::ArchiveFinished)?;

        let central_dir_offset = state.offset;
        let mut tail = Vec::new();
        for entry in &state.entries {
            write_central_record(&mut tail, entry);
        }
        let central_dir_size = tail.len() as u64;
        write_end_of_central_dir(
            &mut tail,
            state.entries.len(),
            central_dir_offset,
            central_dir_size,
        );

        output.write_all(&tail).await?;
        state.offset += tail.len() as u64;
        output.flush().await?;
        output.shutdown().await?;

        debug!(
            entries = state.entries.len(),
            bytes = state.offset,
            "archive finished"
        );
        Ok(output)
    }
}

impl<W: AsyncWrite + Unpin + Send + 'static> ArchiveWriter for ZipArchive<W> {
    fn begin_entry<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Box<dyn EntrySink>>> {
        async move {
            let entry = self.start_entry(name).await?;
            Ok(Box::new(entry) as Box<dyn EntrySink>)
        }
        .boxed()
    }
}

fn broken_output() -> PzipError {
    PzipError::InvalidFormat("archive output failed part way through an entry".to_string())
}

fn local_header(
    name: &str,
    compression_method: u16,
    crc32: u32,
    compressed_size: u64,
    uncompressed_size: u64,
) -> Vec<u8> {
    let zip64 = overflows_u32(compressed_size) || overflows_u32(uncompressed_size);
    let extra_len: u16 = if zip64 { 20 } else { 0 };

    let mut h = Vec::with_capacity(30 + name.len() + extra_len as usize);
    h.extend_from_slice(&[0x50, 0x4b, 0x03, 0x04]); // signature
    h.extend_from_slice(&(if zip64 { VERSION_ZIP64 } else { VERSION_DEFAULT }).to_le_bytes());
    h.extend_from_slice(&FLAG_UTF8.to_le_bytes());
    h.extend_from_slice(&compression_method.to_le_bytes());
    h.extend_from_slice(&0u16.to_le_bytes()); // mod time
    h.extend_from_slice(&DOS_DATE_EPOCH.to_le_bytes()); // mod date
    h.extend_from_slice(&crc32.to_le_bytes());
    if zip64 {
        h.extend_from_slice(&u32::MAX.to_le_bytes());
        h.extend_from_slice(&u32::MAX.to_le_bytes());
    } else {
        h.extend_from_slice(&(compressed_size as u32).to_le_bytes());
        h.extend_from_slice(&(uncompressed_size as u32).to_le_bytes());
    }
    h.extend_from_slice(&(name.len() as u16).to_le_bytes());
    h.extend_from_slice(&extra_len.to_le_bytes());
    h.extend_from_slice(name.as_bytes());
    if zip64 {
        // ZIP64 extra field: both sizes are mandatory in local headers
        h.extend_from_slice(&0x0001u16.to_le_bytes());
        h.extend_from_slice(&16u16.to_le_bytes());
        h.extend_from_slice(&uncompressed_size.to_le_bytes());
        h.extend_from_slice(&compressed_size.to_le_bytes());
    }
    h
}

fn write_central_record(out: &mut Vec<u8>, entry: &ZipEntry) {
    let version = if entry.needs_zip64() {
        VERSION_ZIP64
    } else {
        VERSION_DEFAULT
    };

    // ZIP64 extra field carries only the values that overflow, in this order
    let mut zip64_data: Vec<u8> = Vec::new();
    if overflows_u32(entry.uncompressed_size) {
        zip64_data.extend_from_slice(&entry.uncompressed_size.to_le_bytes());
    }
    if overflows_u32(entry.compressed_size) {
        zip64_data.extend_from_slice(&entry.compressed_size.to_le_bytes());
    }
    if overflows_u32(entry.local_header_offset) {
        zip64_data.extend_from_slice(&entry.local_header_offset.to_le_bytes());
    }
    let mut extra_field: Vec<u8> = Vec::new();
    if !zip64_data.is_empty() {
        extra_field.extend_from_slice(&0x0001u16.to_le_bytes());
        extra_field.extend_from_slice(&(zip64_data.len() as u16).to_le_bytes());
        extra_field.extend_from_slice(&zip64_data);
    }

    out.extend_from_slice(&[0x50, 0x4b, 0x01, 0x02]); // central dir sig
    out.extend_from_slice(&version.to_le_bytes()); // version made by
    out.extend_from_slice(&version.to_le_bytes()); // version needed
    out.extend_from_slice(&FLAG_UTF8.to_le_bytes());
    out.extend_from_slice(&entry.compression_method.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes()); // mod time
    out.extend_from_slice(&DOS_DATE_EPOCH.to_le_bytes()); // mod date
    out.extend_from_slice(&entry.crc32.to_le_bytes());
    out.extend_from_slice(&clamp_u32(entry.compressed_size).to_le_bytes());
    out.extend_from_slice(&clamp_u32(entry.uncompressed_size).to_le_bytes());
    out.extend_from_slice(&(entry.name.len() as u16).to_le_bytes());
    out.extend_from_slice(&(extra_field.len() as u16).to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes()); // file comment len
    out.extend_from_slice(&0u16.to_le_bytes()); // disk number start
    out.extend_from_slice(&0u16.to_le_bytes()); // internal attrs
    out.extend_from_slice(&0u32.to_le_bytes()); // external attrs
    out.extend_from_slice(&clamp_u32(entry.local_header_offset).to_le_bytes());
    out.extend_from_slice(entry.name.as_bytes());
    out.extend_from_slice(&extra_field);
}

fn write_end_of_central_dir(
    out: &mut Vec<u8>,
    entry_count: usize,
    central_dir_offset: u64,
    central_dir_size: u64,
) {
    let need_zip64 = entry_count >= u16::MAX as usize
        || overflows_u32(central_dir_size)
        || overflows_u32(central_dir_offset);

    if need_zip64 {
        let zip64_eocd_pos = central_dir_offset + central_dir_size;

        // ZIP64 end of central directory record
        out.extend_from_slice(&[0x50, 0x4b, 0x06, 0x06]);
        out.extend_from_slice(&44u64.to_le_bytes()); // size of remaining record
        out.extend_from_slice(&VERSION_ZIP64.to_le_bytes()); // version made by
        out.extend_from_slice(&VERSION_ZIP64.to_le_bytes()); // version needed
        out.extend_from_slice(&0u32.to_le_bytes()); // this disk
        out.extend_from_slice(&0u32.to_le_bytes()); // disk with central dir
        out.extend_from_slice(&(entry_count as u64).to_le_bytes());
        out.extend_from_slice(&(entry_count as u64).to_le_bytes());
        out.extend_from_slice(&central_dir_size.to_le_bytes());
        out.extend_from_slice(&central_dir_offset.to_le_bytes());

        // ZIP64 end of central directory locator
        out.extend_from_slice(&[0x50, 0x4b, 0x06, 0x07]);
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&zip64_eocd_pos.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes()); // total disks
    }

    let count = if entry_count >= u16::MAX as usize {
        u16::MAX
    } else {
        entry_count as u16
    };

    out.extend_from_slice(&[0x50, 0x4b, 0x05, 0x06]);
    out.extend_from_slice(&0u16.to_le_bytes()); // disk number
    out.extend_from_slice(&0u16.to_le_bytes()); // disk with central dir
    out.extend_from_slice(&count.to_le_bytes());
    out.extend_from_slice(&count.to_le_bytes());
    out.extend_from_slice(&clamp_u32(central_dir_size).to_le_bytes());
    out.extend_from_slice(&clamp_u32(central_dir_offset).to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes()); // comment len
}

/// Values equal to `u32::MAX` are reserved as the "see ZIP64 field" marker
fn overflows_u32(value: u64) -> bool {
    value >= u32::MAX as u64
}

fn clamp_u32(value: u64) -> u32 {
    if overflows_u32(value) {
        u32::MAX
    } else {
        value as u32
    }
}

/// Per-method encoder writing into an entry's spool file
trait SpoolWrite: AsyncWrite + Unpin + Send {
    /// Flush everything (including the compressor's trailer) and hand back the file
    fn finish_spool(self: Box<Self>) -> BoxFuture<'static, std::io::Result<File>>;
}

struct StoredSpool {
    file: File,
}

impl AsyncWrite for StoredSpool {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.file).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.file).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.file).poll_shutdown(cx)
    }
}

impl SpoolWrite for StoredSpool {
    fn finish_spool(mut self: Box<Self>) -> BoxFuture<'static, std::io::Result<File>> {
        async move {
            self.file.flush().await?;
            Ok(self.file)
        }
        .boxed()
    }
}

struct DeflateSpool {
    encoder: DeflateEncoder<File>,
}

impl AsyncWrite for DeflateSpool {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.encoder).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.encoder).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.encoder).poll_shutdown(cx)
    }
}

impl SpoolWrite for DeflateSpool {
    fn finish_spool(mut self: Box<Self>) -> BoxFuture<'static, std::io::Result<File>> {
        async move {
            self.encoder.shutdown().await?;
            Ok(self.encoder.into_inner())
        }
        .boxed()
    }
}

pin_project! {
    /// Tracks CRC32 and length of the uncompressed bytes passing through
    struct CrcWriter<T> {
        #[pin]
        inner: T,
        crc: Crc32,
        count: u64,
    }
}

impl<T> CrcWriter<T> {
    fn new(inner: T) -> Self {
        Self {
            inner,
            crc: Crc32::new(),
            count: 0,
        }
    }

    fn into_parts(self) -> (T, u32, u64) {
        (self.inner, self.crc.finalize(), self.count)
    }
}

impl<T: AsyncWrite> AsyncWrite for CrcWriter<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.project();
        let n = ready!(this.inner.poll_write(cx, buf))?;
        this.crc.update(&buf[..n]);
        *this.count += n as u64;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// An open entry of a [`ZipArchive`].
///
/// Dropping it without calling [`EntrySink::close`] discards the entry and
/// its spool file.
pub struct ZipEntryWriter<W> {
    name: String,
    writer: CrcWriter<Box<dyn SpoolWrite>>,
    tmp: NamedTempFile,
    archive: ZipArchive<W>,
}

impl<W> ZipEntryWriter<W> {
    /// Entry name in the archive
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<W> AsyncWrite for ZipEntryWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}

impl<W: AsyncWrite + Unpin + Send + 'static> EntrySink for ZipEntryWriter<W> {
    fn close(self: Box<Self>) -> BoxFuture<'static, Result<EntryStats>> {
        let ZipEntryWriter {
            name,
            writer,
            tmp,
            archive,
        } = *self;

        async move {
            let tmp_path = tmp.path().to_path_buf();
            let (spool, crc32, uncompressed_size) = writer.into_parts();

            let appended = async {
                let mut file = spool.finish_spool().await?;
                let compressed_size = file.seek(SeekFrom::End(0)).await?;
                file.seek(SeekFrom::Start(0)).await?;
                archive
                    .append_entry(&name, crc32, compressed_size, uncompressed_size, &mut file)
                    .await?;
                Ok::<_, PzipError>(compressed_size)
            }
            .await;
            let released = archive.tmpfiles.release(tmp);

            let compressed_size = appended?;
            released?;

            debug!(
                entry = %name,
                uncompressed_size,
                compressed_size,
                "entry appended"
            );
            Ok(EntryStats {
                name,
                tmp_file: Some(tmp_path),
                uncompressed_size,
                compressed_size,
                crc32,
            })
        }
        .boxed()
    }
}
