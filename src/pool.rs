//! Bounded pool of workers compressing requests into one archive
//!
//! Callers [`submit`](CompressorPool::submit) named byte streams; a fixed set of
//! tokio tasks pulls them off a bounded queue, opens an entry for each in the
//! shared archive, copies the bytes in, and closes both ends. A failing
//! request never stops its worker: every failure is recorded and the combined
//! [`MultiError`] is returned when the pool shuts down.
//!
//! Shutdown comes in two flavors, see [`ShutdownMode`]. Requests a cancelled
//! pool never got to are not leaked: shutdown closes their sources and lists
//! them in [`PoolReport::discarded`].

use crate::archive::{ArchiveWriter, EntrySource, EntryStats, ReaderSource};
use crate::buffer::BufferPool;
use crate::config::PoolConfig;
use crate::copy::{copy, CopyOutcome};
use crate::error::{EntryError, MultiError, PzipError, Result, Stage};
use futures_util::FutureExt;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A named byte stream to be written as one archive entry
pub struct Request {
    /// Entry name in the archive
    pub name: String,
    /// Where the entry's bytes come from; closed by the pool
    pub source: Box<dyn EntrySource>,
}

impl Request {
    /// Create a request from any async reader
    pub fn new(name: impl Into<String>, reader: impl AsyncRead + Unpin + Send + 'static) -> Self {
        Self::from_source(name, ReaderSource::new(reader))
    }

    /// Create a request from a source with its own close logic
    pub fn from_source(name: impl Into<String>, source: impl EntrySource + 'static) -> Self {
        Self {
            name: name.into(),
            source: Box::new(source),
        }
    }

    /// Create a request reading the file at `path`
    pub async fn open(name: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Self::new(name, file))
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A request the pool refused because it was already cancelled.
///
/// The request is handed back untouched; its source is still open.
#[derive(Debug)]
pub struct SubmitError {
    request: Request,
}

impl SubmitError {
    pub fn into_request(self) -> Request {
        self.request
    }
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "compressor pool is cancelled; request {:?} was not accepted",
            self.request.name
        )
    }
}

impl std::error::Error for SubmitError {}

/// How [`CompressorPool::shutdown`] stops the workers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Fire the cancellation token, then wait. In-flight copies stop at their
    /// next check; queued requests are discarded.
    Cancel,
    /// Stop accepting requests and wait until every queued request is done.
    Drain,
}

/// Everything a pool observed, available once it has shut down
#[derive(Debug, Default)]
pub struct PoolReport {
    /// Stats of every entry whose sink closed without error, in completion
    /// order. Entries whose copy failed or was cancelled are included.
    pub entries: Vec<EntryStats>,
    /// Entries whose copy was cut short by cancellation
    pub truncated: Vec<String>,
    /// Requests never copied because the pool was cancelled first; their
    /// sources were closed
    pub discarded: Vec<String>,
    /// Every failure, in the order it was recorded
    pub errors: MultiError,
}

impl PoolReport {
    /// `Ok(())` if no failure was recorded
    pub fn into_result(self) -> std::result::Result<(), MultiError> {
        self.errors.into_result()
    }
}

/// State shared by the pool handle and its workers
struct Shared {
    archive: Arc<dyn ArchiveWriter>,
    buffers: Arc<BufferPool>,
    cancel: CancellationToken,
    queue: tokio::sync::Mutex<mpsc::Receiver<Request>>,
    report: Mutex<PoolReport>,
}

impl Shared {
    fn report(&self) -> std::sync::MutexGuard<'_, PoolReport> {
        // A panicking worker must not hide what the others recorded
        self.report.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, error: EntryError) {
        warn!(
            entry = %error.entry,
            stage = %error.stage,
            error = %error.source,
            "entry failed"
        );
        self.report().errors.push(error);
    }

    async fn next_request(&self) -> Option<Request> {
        self.queue.lock().await.recv().await
    }

    /// Creates the entry, copies the source into it and closes it. The entry is
    /// closed even if the copy failed, and each failure is recorded on its own.
    /// Closing the source is left to the caller.
    async fn write_entry(&self, name: &str, source: &mut Box<dyn EntrySource>) {
        debug!(entry = %name, "processing entry");

        let mut sink = match self.archive.begin_entry(name).await {
            Ok(sink) => sink,
            Err(e) => return self.record(EntryError::new(name, Stage::CreateEntry, e)),
        };

        // Cancelled while the entry was being created: drop it unwritten
        if self.cancel.is_cancelled() {
            drop(sink);
            debug!(entry = %name, "entry dropped before copy");
            self.report().discarded.push(name.to_string());
            return;
        }

        match copy(&self.cancel, &self.buffers, &mut sink, source).await {
            CopyOutcome::Completed(n) => {
                debug!(entry = %name, bytes = n, "entry copied");
            }
            CopyOutcome::Cancelled(n) => {
                warn!(entry = %name, bytes = n, "entry truncated by cancellation");
                self.report().truncated.push(name.to_string());
            }
            CopyOutcome::Failed {
                copied,
                stage,
                error,
            } => {
                debug!(entry = %name, bytes = copied, "copy failed");
                self.record(EntryError::new(name, stage, error));
            }
        }

        match sink.close().await {
            Ok(stats) => {
                self.report().entries.push(stats);
            }
            Err(e) => self.record(EntryError::new(name, Stage::CloseEntry, e)),
        }
    }

    /// Runs one request. A panic while writing the entry is recorded against
    /// the entry and the source is still closed; the worker carries on.
    async fn process(&self, request: Request) {
        let Request { name, mut source } = request;

        let written = AssertUnwindSafe(self.write_entry(&name, &mut source))
            .catch_unwind()
            .await;
        if let Err(panic) = written {
            self.record(EntryError::new(
                name.as_str(),
                Stage::Worker,
                PzipError::Aborted(panic_message(panic.as_ref())),
            ));
        }

        self.close_source(&name, &mut source).await;
    }

    async fn close_source(&self, name: &str, source: &mut Box<dyn EntrySource>) {
        if let Err(e) = source.close().await {
            self.record(EntryError::new(name, Stage::CloseSource, e));
        }
    }

    /// Closes a request nobody processed
    async fn discard(&self, request: Request) {
        let Request { name, mut source } = request;
        self.close_source(&name, &mut source).await;
        self.report().discarded.push(name);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("panicked with message {:?}", msg)
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("panicked with message {:?}", msg)
    } else {
        "panicked".to_string()
    }
}

async fn run_worker(id: usize, shared: Arc<Shared>) {
    debug!(worker = id, "worker started");

    loop {
        let request = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            request = shared.next_request() => match request {
                Some(request) => request,
                // Queue closed and empty: drain finished
                None => break,
            },
        };

        // Cancellation may have fired while this worker was being handed the request.
        if shared.cancel.is_cancelled() {
            shared.discard(request).await;
            break;
        }

        shared.process(request).await;
    }

    debug!(worker = id, "worker stopped");
}

/// A fixed set of workers compressing requests into a shared archive.
///
/// Dropping the pool without shutting it down closes the queue; the workers
/// finish what is queued in the background.
///
/// # Example
///
/// ```no_run
/// use pzip::{CompressorPool, PoolConfig, Request, ZipArchive};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let archive = ZipArchive::create("out.zip").await?;
/// let pool = CompressorPool::new(
///     &CancellationToken::new(),
///     archive.clone(),
///     PoolConfig::default().with_workers(2),
/// );
///
/// pool.submit(Request::new("a.txt", &b"first"[..])).await?;
/// pool.submit(Request::open("b.bin", "input.bin").await?).await?;
///
/// pool.finish().await?;
/// archive.finish().await?;
/// # Ok(())
/// # }
/// ```
pub struct CompressorPool {
    shared: Arc<Shared>,
    sender: mpsc::Sender<Request>,
    workers: Vec<JoinHandle<()>>,
}

impl CompressorPool {
    /// Start `config.workers` workers writing into `archive`.
    ///
    /// The pool's cancellation token is a child of `parent`: cancelling the
    /// parent stops the pool, but stopping the pool leaves the parent alone.
    /// Must be called from within a tokio runtime.
    pub fn new<A: ArchiveWriter + 'static>(
        parent: &CancellationToken,
        archive: A,
        config: PoolConfig,
    ) -> Self {
        let size = config.workers.max(1);
        let buffers = config.buffer_pool();
        let (sender, receiver) = mpsc::channel(size);

        let shared = Arc::new(Shared {
            archive: Arc::new(archive),
            buffers,
            cancel: parent.child_token(),
            queue: tokio::sync::Mutex::new(receiver),
            report: Mutex::new(PoolReport::default()),
        });

        let workers = (0..size)
            .map(|id| tokio::spawn(run_worker(id, Arc::clone(&shared))))
            .collect();

        info!(
            workers = size,
            buffer_size = shared.buffers.buffer_size(),
            "compressor pool started"
        );

        Self {
            shared,
            sender,
            workers,
        }
    }

    /// Number of workers, which is also the queue capacity
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// A clone of the pool's cancellation token
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Queue a request, waiting while the queue is full.
    ///
    /// Fails, handing the request back, if the pool has been cancelled.
    pub async fn submit(&self, request: Request) -> std::result::Result<(), SubmitError> {
        let permit = tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => None,
            permit = self.sender.reserve() => permit.ok(),
        };

        match permit {
            Some(permit) => {
                debug!(entry = %request.name, "request queued");
                permit.send(request);
                Ok(())
            }
            None => Err(SubmitError { request }),
        }
    }

    /// Cancel the workers, wait for them, and return every recorded failure.
    pub async fn close(self) -> std::result::Result<(), MultiError> {
        self.shutdown(ShutdownMode::Cancel).await.into_result()
    }

    /// Process everything queued, wait for the workers, and return every
    /// recorded failure.
    pub async fn finish(self) -> std::result::Result<(), MultiError> {
        self.shutdown(ShutdownMode::Drain).await.into_result()
    }

    /// Stop the pool and report everything it observed.
    ///
    /// Once this returns no worker touches the archive or any request source.
    pub async fn shutdown(self, mode: ShutdownMode) -> PoolReport {
        let CompressorPool {
            shared,
            sender,
            workers,
        } = self;

        if mode == ShutdownMode::Cancel {
            shared.cancel.cancel();
        }
        drop(sender);

        for (id, handle) in workers.into_iter().enumerate() {
            if let Err(e) = handle.await {
                shared.record(EntryError::new(
                    format!("worker {}", id),
                    Stage::Worker,
                    PzipError::Aborted(e.to_string()),
                ));
            }
        }
        shared.cancel.cancel();

        let leftovers: Vec<Request> = {
            let mut queue = shared.queue.lock().await;
            queue.close();
            let mut leftovers = Vec::new();
            while let Ok(request) = queue.try_recv() {
                leftovers.push(request);
            }
            leftovers
        };
        for request in leftovers {
            shared.discard(request).await;
        }

        let report = std::mem::take(&mut *shared.report());
        if !report.discarded.is_empty() {
            warn!(
                count = report.discarded.len(),
                "discarded queued requests on shutdown"
            );
        }
        info!(
            ?mode,
            entries = report.entries.len(),
            errors = report.errors.len(),
            truncated = report.truncated.len(),
            "compressor pool stopped"
        );
        report
    }
}
