//! Error types for pzip

use std::fmt;
use std::io;

/// Result type for pzip operations
pub type Result<T> = std::result::Result<T, PzipError>;

/// Error types that can occur while building an archive
#[derive(Debug)]
pub enum PzipError {
    /// I/O error
    Io(io::Error),
    /// Invalid ZIP structure (e.g. an entry name too long for the format)
    InvalidFormat(String),
    /// The archive was already finished; no further entries can be added
    ArchiveFinished,
    /// A worker task ended abnormally (panicked or was aborted)
    Aborted(String),
    /// Invalid pool configuration
    InvalidConfig(String),
}

impl fmt::Display for PzipError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PzipError::Io(e) => write!(f, "I/O error: {}", e),
            PzipError::InvalidFormat(msg) => write!(f, "Invalid ZIP format: {}", msg),
            PzipError::ArchiveFinished => write!(f, "Archive already finished"),
            PzipError::Aborted(msg) => write!(f, "Worker aborted: {}", msg),
            PzipError::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for PzipError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PzipError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PzipError {
    fn from(err: io::Error) -> Self {
        PzipError::Io(err)
    }
}

/// The step of request processing at which a failure was observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Asking the archive writer for a new entry
    CreateEntry,
    /// Reading from the request's source
    Read,
    /// Writing into the entry sink
    Write,
    /// Closing (finalizing) the entry sink
    CloseEntry,
    /// Closing the request's source
    CloseSource,
    /// Writing the entry panicked. The source is still closed and the worker
    /// keeps going. If the worker task itself died, `entry` names the worker.
    Worker,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::CreateEntry => "create entry",
            Stage::Read => "read",
            Stage::Write => "write",
            Stage::CloseEntry => "close entry",
            Stage::CloseSource => "close source",
            Stage::Worker => "worker",
        };
        f.write_str(label)
    }
}

/// A single failure, attributed to the entry it happened on
#[derive(Debug)]
pub struct EntryError {
    /// Name of the entry being processed
    pub entry: String,
    /// Where in the processing the failure happened
    pub stage: Stage,
    /// The underlying cause
    pub source: PzipError,
}

impl EntryError {
    pub fn new(entry: impl Into<String>, stage: Stage, source: impl Into<PzipError>) -> Self {
        Self {
            entry: entry.into(),
            stage,
            source: source.into(),
        }
    }
}

impl fmt::Display for EntryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.entry, self.stage, self.source)
    }
}

impl std::error::Error for EntryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Every failure observed by a pool, in the order they were recorded
///
/// An empty `MultiError` means success; [`MultiError::into_result`] turns it
/// into a `Result` for callers that only care about that distinction.
#[derive(Debug, Default)]
pub struct MultiError {
    causes: Vec<EntryError>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a failure
    pub fn push(&mut self, error: EntryError) {
        self.causes.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.causes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.causes.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, EntryError> {
        self.causes.iter()
    }

    /// All recorded causes
    pub fn causes(&self) -> &[EntryError] {
        &self.causes
    }

    /// Causes recorded for one entry
    pub fn for_entry<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a EntryError> + 'a {
        self.causes.iter().filter(move |e| e.entry == name)
    }

    /// `Ok(())` when nothing failed, otherwise `Err(self)`
    pub fn into_result(self) -> std::result::Result<(), MultiError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.causes.len() {
            0 => return write!(f, "no errors"),
            1 => write!(f, "1 error occurred:")?,
            n => write!(f, "{} errors occurred:", n)?,
        };
        for cause in &self.causes {
            write!(f, "\n\t* {}", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.causes
            .first()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl IntoIterator for MultiError {
    type Item = EntryError;
    type IntoIter = std::vec::IntoIter<EntryError>;

    fn into_iter(self) -> Self::IntoIter {
        self.causes.into_iter()
    }
}
