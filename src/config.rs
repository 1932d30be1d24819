//! Configuration for the compressor pool

use crate::buffer::{BufferPool, DEFAULT_BUFFER_SIZE};
use crate::error::{PzipError, Result};
use std::env;
use std::sync::Arc;

/// Environment variable overriding the number of workers in [`PoolConfig::from_env`]
pub const PZIP_WORKERS: &str = "PZIP_WORKERS";

/// Upper bound accepted by [`PoolConfig::with_workers`]
pub const MAX_WORKERS: usize = 256;

/// Configuration for a [`CompressorPool`](crate::CompressorPool)
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of workers, which is also the request queue capacity (default: 4)
    pub workers: usize,
    /// Size of each copy buffer in bytes (default: 32 KiB)
    pub buffer_size: usize,
    /// Shared buffer pool; one sized for `workers` is created when unset
    pub buffers: Option<Arc<BufferPool>>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            buffer_size: DEFAULT_BUFFER_SIZE,
            buffers: None,
        }
    }
}

impl PoolConfig {
    /// Create a conservative config for low-memory systems
    pub fn conservative() -> Self {
        Self {
            workers: 2,
            ..Self::default()
        }
    }

    /// Create a balanced config for normal systems
    pub fn balanced() -> Self {
        Self::default()
    }

    /// Create an aggressive config for high-memory systems
    pub fn aggressive() -> Self {
        Self {
            workers: 8,
            ..Self::default()
        }
    }

    /// One worker per available CPU, or the value of `PZIP_WORKERS` when set
    pub fn from_env() -> Result<Self> {
        let workers = match env::var(PZIP_WORKERS) {
            Ok(value) => parse_workers(&value)?,
            Err(_) => std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(1)
                .min(MAX_WORKERS),
        };
        Ok(Self {
            workers,
            ..Self::default()
        })
    }

    /// Set the number of workers
    pub fn with_workers(mut self, workers: usize) -> Self {
        assert!(workers > 0, "workers must be at least 1");
        assert!(workers <= MAX_WORKERS, "workers should not exceed 256");
        self.workers = workers;
        self
    }

    /// Set the copy buffer size
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        assert!(size > 0, "buffer_size must be at least 1");
        self.buffer_size = size;
        self
    }

    /// Share an existing buffer pool (its buffer size wins over `buffer_size`)
    pub fn with_buffer_pool(mut self, buffers: Arc<BufferPool>) -> Self {
        self.buffer_size = buffers.buffer_size();
        self.buffers = Some(buffers);
        self
    }

    /// The buffer pool workers will borrow from
    pub(crate) fn buffer_pool(&self) -> Arc<BufferPool> {
        match &self.buffers {
            Some(buffers) => Arc::clone(buffers),
            None => {
                // A zero size set directly on the field falls back to the default
                let buffer_size = match self.buffer_size {
                    0 => DEFAULT_BUFFER_SIZE,
                    n => n,
                };
                BufferPool::new(buffer_size, self.workers.max(1))
            }
        }
    }

    /// Estimate peak memory used by the workers in KiB
    pub fn estimated_peak_memory_kb(&self) -> usize {
        // Per worker: one copy buffer plus ~256 KiB of DEFLATE encoder state.
        // Queued requests hold only their (unread) sources.
        self.workers * (self.buffer_size / 1024 + 256)
    }
}

fn parse_workers(value: &str) -> Result<usize> {
    match value.trim().parse::<usize>() {
        Ok(n) if (1..=MAX_WORKERS).contains(&n) => Ok(n),
        _ => Err(PzipError::InvalidConfig(format!(
            "{} must be a number between 1 and {}, got {:?}",
            PZIP_WORKERS, MAX_WORKERS, value
        ))),
    }
}
