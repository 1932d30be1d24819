//! Cancellation-aware byte copy
//!
//! Like [`tokio::io::copy`], but checks a [`CancellationToken`] before every
//! read/write cycle and borrows its buffer from a shared [`BufferPool`].
//! Cancellation is reported as its own outcome rather than as success or an
//! error, so callers can tell a finished entry from a truncated one.

use crate::buffer::BufferPool;
use crate::error::Stage;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// How a [`copy`] ended
#[derive(Debug)]
pub enum CopyOutcome {
    /// The source reached end of stream; every byte was written
    Completed(u64),
    /// The token fired before the source was exhausted; the destination holds
    /// only the first `n` bytes
    Cancelled(u64),
    /// A read or write failed after `copied` bytes had been written
    Failed {
        copied: u64,
        stage: Stage,
        error: io::Error,
    },
}

impl CopyOutcome {
    /// Bytes written to the destination, whatever the outcome
    pub fn bytes_copied(&self) -> u64 {
        match self {
            CopyOutcome::Completed(n) | CopyOutcome::Cancelled(n) => *n,
            CopyOutcome::Failed { copied, .. } => *copied,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, CopyOutcome::Completed(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CopyOutcome::Cancelled(_))
    }

    /// Collapses the outcome into a byte count, treating cancellation as a
    /// clean stop.
    pub fn into_result(self) -> io::Result<u64> {
        match self {
            CopyOutcome::Completed(n) | CopyOutcome::Cancelled(n) => Ok(n),
            CopyOutcome::Failed { error, .. } => Err(error),
        }
    }
}

/// Copies `src` into `dst` until end of stream, failure, or cancellation.
///
/// The token is checked at the top of every cycle, so a cycle already under
/// way finishes its read and write before the copy stops. A zero-length read
/// is end of stream per the [`AsyncRead`] contract; `Interrupted` reads are
/// retried.
pub async fn copy<W, R>(
    cancel: &CancellationToken,
    buffers: &Arc<BufferPool>,
    dst: &mut W,
    src: &mut R,
) -> CopyOutcome
where
    W: AsyncWrite + Unpin + ?Sized,
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = buffers.get();
    let mut copied = 0u64;

    loop {
        if cancel.is_cancelled() {
            return CopyOutcome::Cancelled(copied);
        }

        let n = match src.read(&mut buf[..]).await {
            Ok(0) => return CopyOutcome::Completed(copied),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => {
                return CopyOutcome::Failed {
                    copied,
                    stage: Stage::Read,
                    error,
                }
            }
        };

        if let Err(error) = dst.write_all(&buf[..n]).await {
            return CopyOutcome::Failed {
                copied,
                stage: Stage::Write,
                error,
            };
        }
        copied += n as u64;
    }
}
