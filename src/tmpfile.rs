//! Temp files that hold an entry's compressed bytes until it is appended
//!
//! Each entry is compressed into its own spool file so that workers never
//! contend on the archive output while compressing. The provider decides where
//! those files live; archives take it as an explicit dependency.

use std::fmt::Debug;
use std::io;
use std::path::PathBuf;
use tempfile::NamedTempFile;

/// Allocates and releases spool files.
pub trait TempFileProvider: Debug + Send + Sync {
    /// Creates a fresh, empty file open for reading and writing
    fn allocate(&self) -> io::Result<NamedTempFile>;

    /// Disposes of a file once its contents were copied into the archive
    fn release(&self, file: NamedTempFile) -> io::Result<()> {
        file.close()
    }
}

/// Spool files in the operating system's temp directory
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTempFiles;

impl TempFileProvider for SystemTempFiles {
    fn allocate(&self) -> io::Result<NamedTempFile> {
        tempfile::Builder::new().prefix("pzip-").tempfile()
    }
}

/// Spool files in a caller-chosen directory
#[derive(Debug, Clone)]
pub struct DirTempFiles {
    dir: PathBuf,
}

impl DirTempFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl TempFileProvider for DirTempFiles {
    fn allocate(&self) -> io::Result<NamedTempFile> {
        tempfile::Builder::new()
            .prefix("pzip-")
            .tempfile_in(&self.dir)
    }
}
