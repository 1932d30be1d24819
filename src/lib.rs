//! # pzip: Parallel Compression into a Single ZIP Archive
//!
//! `pzip` runs a bounded pool of workers that compress many independent byte
//! streams concurrently into entries of one shared ZIP archive.
//!
//! ## Features
//!
//! - **Bounded Pool**: fixed number of workers and a queue of the same size;
//!   submitting into a full queue waits (backpressure)
//! - **Cooperative Cancellation**: a [`CancellationToken`](tokio_util::sync::CancellationToken)
//!   checked before every read/write cycle
//! - **Failure Isolation**: one broken stream never stops the others; every
//!   failure is collected into a single [`MultiError`]
//! - **Parallel Compression**: entries are compressed into temp files in
//!   parallel and appended to the archive one whole entry at a time
//! - **Low Allocation**: copy buffers are borrowed from a shared [`BufferPool`]
//!
//! ## Quick Start
//!
//! ```no_run
//! use pzip::{CompressorPool, PoolConfig, Request, ZipArchive};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let archive = ZipArchive::from_writer(Vec::new());
//! let pool = CompressorPool::new(&CancellationToken::new(), archive.clone(), PoolConfig::default());
//!
//! for (name, body) in [("a.txt", &b"alpha"[..]), ("b.txt", &b"beta"[..])] {
//!     pool.submit(Request::new(name, body)).await?;
//! }
//!
//! // Wait for every queued request, then write the central directory
//! pool.finish().await?;
//! let zip_bytes = archive.finish().await?;
//! println!("Created ZIP with {} bytes", zip_bytes.len());
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod buffer;
pub mod config;
pub mod copy;
pub mod error;
pub mod pool;
pub mod tmpfile;
pub mod writer;

pub use archive::{ArchiveWriter, EntrySink, EntrySource, EntryStats, ReaderSource};
pub use buffer::{BufferPool, PooledBuffer, DEFAULT_BUFFER_SIZE};
pub use config::PoolConfig;
pub use copy::{copy, CopyOutcome};
pub use error::{EntryError, MultiError, PzipError, Result, Stage};
pub use pool::{CompressorPool, PoolReport, Request, ShutdownMode, SubmitError};
pub use tmpfile::{DirTempFiles, SystemTempFiles, TempFileProvider};
pub use writer::{CompressionMethod, ZipArchive, ZipEntryWriter};
