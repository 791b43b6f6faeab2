//! Pooled, shared-ownership CUDA stream handles.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use cudarc::driver::sys as cuda_sys;
use cudarc::driver::CudaStream;
use parking_lot::Mutex;
use tracing::debug;

use hetstream_core::error::{HetstreamError, Result};

use crate::config::CacheConfig;
use crate::device::{device_context, device_count};

/// Shared-ownership handle to an ordered GPU work queue.
///
/// Clones share the same underlying stream. When the last clone drops,
/// the stream returns to the process-wide pool instead of being
/// destroyed, ready for the next scope on the same device.
#[derive(Clone)]
pub struct SharedStream {
    inner: Arc<PooledStream>,
}

struct PooledStream {
    stream: Arc<CudaStream>,
    device: usize,
    cache: Weak<CacheShelves>,
}

impl SharedStream {
    /// Device ordinal this stream belongs to.
    #[must_use]
    pub fn device(&self) -> usize {
        self.inner.device
    }

    /// Raw driver handle, for issuing asynchronous operations.
    #[must_use]
    pub fn raw(&self) -> cuda_sys::CUstream {
        self.inner.stream.cu_stream()
    }

    /// The underlying cudarc stream.
    #[must_use]
    pub fn cudarc(&self) -> &Arc<CudaStream> {
        &self.inner.stream
    }

    /// Whether `other` names the same underlying work queue.
    #[must_use]
    pub fn same_stream(&self, other: &SharedStream) -> bool {
        self.raw() == other.raw()
    }

    /// Blocks the calling thread until all work queued so far has
    /// completed. Scopes themselves never call this; it exists for
    /// terminal host-side readers that need the value on the CPU.
    pub fn synchronize(&self) -> Result<()> {
        self.inner
            .stream
            .synchronize()
            .map_err(|e| HetstreamError::backend(format!("Stream synchronize failed: {}", e)))
    }
}

impl fmt::Debug for SharedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedStream")
            .field("device", &self.inner.device)
            .field("raw", &self.raw())
            .finish()
    }
}

impl Drop for PooledStream {
    fn drop(&mut self) {
        // Last reference gone: hand the stream back to its pool. If the
        // cache itself is gone (process teardown) the stream is simply
        // destroyed by cudarc.
        if let Some(shelves) = self.cache.upgrade() {
            debug!(device = self.device, "Returning stream to pool");
            shelves.put(self.device, Arc::clone(&self.stream));
        }
    }
}

/// Per-device free lists shared between the cache and its handles.
struct CacheShelves {
    free: Mutex<HashMap<usize, Vec<Arc<CudaStream>>>>,
}

impl CacheShelves {
    fn put(&self, device: usize, stream: Arc<CudaStream>) {
        self.free.lock().entry(device).or_default().push(stream);
    }
}

/// Process-wide pool of reusable CUDA streams, one free list per device.
///
/// Streams are acquired by scopes at construction and flow back here
/// when the last [`SharedStream`] clone (scope or product) drops.
pub struct StreamCache {
    shelves: Arc<CacheShelves>,
}

impl StreamCache {
    /// Creates an empty cache; streams are made on first demand.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shelves: Arc::new(CacheShelves {
                free: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Creates a cache and warms the per-device free lists per `config`.
    pub fn with_config(config: &CacheConfig) -> Result<Self> {
        let cache = Self::new();
        for device in 0..device_count() {
            let warm: Vec<SharedStream> = (0..config.preallocated_streams_per_device)
                .map(|_| cache.get(device))
                .collect::<Result<_>>()?;
            // Dropping the handles parks the fresh streams in the pool.
            drop(warm);
        }
        Ok(cache)
    }

    /// Acquires a stream on `device`, reusing a pooled one when present.
    pub fn get(&self, device: usize) -> Result<SharedStream> {
        let pooled = self
            .shelves
            .free
            .lock()
            .get_mut(&device)
            .and_then(|list| list.pop());

        let stream = match pooled {
            Some(stream) => {
                debug!(device, "Reusing pooled stream");
                stream
            }
            None => {
                let ctx = device_context(device)?;
                ctx.new_stream().map_err(|e| {
                    HetstreamError::allocation(format!(
                        "Failed to create stream on device {}: {}",
                        device, e
                    ))
                })?
            }
        };

        Ok(SharedStream {
            inner: Arc::new(PooledStream {
                stream,
                device,
                cache: Arc::downgrade(&self.shelves),
            }),
        })
    }

    /// Number of idle streams currently pooled for `device`.
    #[must_use]
    pub fn idle(&self, device: usize) -> usize {
        self.shelves
            .free
            .lock()
            .get(&device)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl Default for StreamCache {
    fn default() -> Self {
        Self::new()
    }
}

static STREAM_CACHE: OnceLock<StreamCache> = OnceLock::new();

/// Process-wide stream cache.
pub fn stream_cache() -> &'static StreamCache {
    STREAM_CACHE.get_or_init(StreamCache::new)
}

/// Installs a configured cache as the process-wide instance.
///
/// Must run before the first [`stream_cache`] use; later calls fail.
pub fn init_stream_cache(config: &CacheConfig) -> Result<()> {
    let cache = StreamCache::with_config(config)?;
    STREAM_CACHE
        .set(cache)
        .map_err(|_| HetstreamError::InvalidState {
            expected: "stream cache not yet initialized".to_string(),
            actual: "stream cache already in use".to_string(),
        })
}
