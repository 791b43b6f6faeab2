//! Pooled, shared-ownership CUDA events.
//!
//! Events are one-shot completion markers: a producer records one on its
//! stream at the "done enqueuing" boundary, and consuming streams wait
//! on it without blocking the host. Events are created with timing
//! disabled (they exist purely for ordering) and are reused through a
//! process-wide cache; re-recording resets them.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use cudarc::driver::result as cuda_result;
use cudarc::driver::sys as cuda_sys;
use parking_lot::Mutex;
use tracing::debug;

use hetstream_core::error::{HetstreamError, Result};

use crate::config::CacheConfig;
use crate::device::device_count;
use crate::metrics::sync_metrics;
use crate::stream::SharedStream;

/// Owned raw CUDA event, destroyed when dropped.
struct EventHandle {
    raw: cuda_sys::CUevent,
}

// CUDA events can be used from any thread once created, within the
// owning context.
unsafe impl Send for EventHandle {}
unsafe impl Sync for EventHandle {}

impl EventHandle {
    /// Creates an event in the current context.
    fn create(blocking_sync: bool) -> Result<Self> {
        let flags = if blocking_sync {
            cuda_sys::CUevent_flags::CU_EVENT_BLOCKING_SYNC
        } else {
            cuda_sys::CUevent_flags::CU_EVENT_DISABLE_TIMING
        };
        let raw = cuda_result::event::create(flags).map_err(|e| {
            HetstreamError::allocation(format!("Failed to create CUDA event: {:?}", e))
        })?;
        Ok(Self { raw })
    }
}

impl Drop for EventHandle {
    fn drop(&mut self) {
        // Cleanup path; a destroy failure here cannot be reported.
        unsafe {
            let _ = cuda_result::event::destroy(self.raw);
        }
    }
}

/// Shared-ownership handle to a pooled one-shot completion marker.
///
/// Clones share the same underlying event. When the last clone drops,
/// the event returns to the process-wide pool for reuse.
#[derive(Clone)]
pub struct SharedEvent {
    inner: Arc<PooledEvent>,
}

struct PooledEvent {
    event: Option<EventHandle>,
    device: usize,
    cache: Weak<EventShelves>,
}

impl SharedEvent {
    /// Device ordinal this event belongs to.
    #[must_use]
    pub fn device(&self) -> usize {
        self.inner.device
    }

    /// Raw driver handle.
    #[must_use]
    pub fn raw(&self) -> cuda_sys::CUevent {
        self.inner.event.as_ref().map(|e| e.raw).unwrap_or(std::ptr::null_mut())
    }

    /// Records this event on `stream`, capturing all work queued so far.
    pub fn record(&self, stream: &SharedStream) -> Result<()> {
        unsafe { cuda_result::event::record(self.raw(), stream.raw()) }.map_err(|e| {
            HetstreamError::backend(format!("Failed to record CUDA event: {:?}", e))
        })?;
        sync_metrics().incr_events_recorded();
        Ok(())
    }

    /// Whether all work captured by this event has completed
    /// (non-blocking).
    pub fn query(&self) -> Result<bool> {
        match unsafe { cuda_result::event::query(self.raw()) } {
            Ok(()) => Ok(true),
            Err(e) if e.0 == cuda_sys::CUresult::CUDA_ERROR_NOT_READY => Ok(false),
            Err(e) => Err(HetstreamError::backend(format!(
                "Failed to query CUDA event: {:?}",
                e
            ))),
        }
    }
}

impl fmt::Debug for SharedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedEvent")
            .field("device", &self.inner.device)
            .field("raw", &self.raw())
            .finish()
    }
}

impl Drop for PooledEvent {
    fn drop(&mut self) {
        let Some(event) = self.event.take() else { return };
        if let Some(shelves) = self.cache.upgrade() {
            debug!(device = self.device, "Returning event to pool");
            shelves.put(self.device, event);
        }
        // Otherwise the EventHandle drop destroys the raw event.
    }
}

/// Per-device free lists shared between the cache and its handles.
struct EventShelves {
    free: Mutex<HashMap<usize, Vec<EventHandle>>>,
    blocking_sync: bool,
}

impl EventShelves {
    fn put(&self, device: usize, event: EventHandle) {
        self.free.lock().entry(device).or_default().push(event);
    }
}

/// Process-wide pool of reusable CUDA events, one free list per device.
pub struct EventCache {
    shelves: Arc<EventShelves>,
}

impl EventCache {
    /// Creates an empty cache of timing-disabled events; events are made
    /// on first demand.
    #[must_use]
    pub fn new() -> Self {
        Self::with_blocking(false)
    }

    fn with_blocking(blocking_sync: bool) -> Self {
        Self {
            shelves: Arc::new(EventShelves {
                free: Mutex::new(HashMap::new()),
                blocking_sync,
            }),
        }
    }

    /// Creates a cache and warms the per-device free lists per `config`.
    ///
    /// Preallocation binds each device in turn; the caller's current
    /// device afterwards is the last one warmed.
    pub fn with_config(config: &CacheConfig) -> Result<Self> {
        let cache = Self::with_blocking(config.blocking_sync_events);
        for device in 0..device_count() {
            crate::device::bind_device(device)?;
            let warm: Vec<SharedEvent> = (0..config.preallocated_events_per_device)
                .map(|_| cache.get(device))
                .collect::<Result<_>>()?;
            drop(warm);
        }
        Ok(cache)
    }

    /// Acquires an event on `device`, reusing a pooled one when present.
    ///
    /// The caller must have made `device` current (scopes do this at
    /// construction); a freshly created event belongs to the current
    /// context.
    pub fn get(&self, device: usize) -> Result<SharedEvent> {
        let pooled = self
            .shelves
            .free
            .lock()
            .get_mut(&device)
            .and_then(|list| list.pop());

        let event = match pooled {
            Some(event) => {
                debug!(device, "Reusing pooled event");
                event
            }
            None => EventHandle::create(self.shelves.blocking_sync)?,
        };

        Ok(SharedEvent {
            inner: Arc::new(PooledEvent {
                event: Some(event),
                device,
                cache: Arc::downgrade(&self.shelves),
            }),
        })
    }

    /// Number of idle events currently pooled for `device`.
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

impl Default for EventCache {
    fn default() -> Self {
        Self::new()
    }
}

static EVENT_CACHE: OnceLock<EventCache> = OnceLock::new();

/// Process-wide event cache.
pub fn event_cache() -> &'static EventCache {
    EVENT_CACHE.get_or_init(EventCache::new)
}

/// Installs a configured cache as the process-wide instance.
///
/// Must run before the first [`event_cache`] use; later calls fail.
pub fn init_event_cache(config: &CacheConfig) -> Result<()> {
    let cache = EventCache::with_config(config)?;
    EVENT_CACHE
        .set(cache)
        .map_err(|_| HetstreamError::InvalidState {
            expected: "event cache not yet initialized".to_string(),
            actual: "event cache already in use".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::bind_device;

    #[test]
    #[ignore] // Requires CUDA hardware
    fn test_event_returns_to_pool_on_last_drop() {
        bind_device(0).unwrap();
        let cache = EventCache::new();
        let event = cache.get(0).expect("Failed to acquire event");
        assert_eq!(cache.idle(0), 0);

        let clone = event.clone();
        drop(event);
        assert_eq!(cache.idle(0), 0);

        drop(clone);
        assert_eq!(cache.idle(0), 1);
    }

    #[test]
    #[ignore] // Requires CUDA hardware
    fn test_unrecorded_event_reports_complete() {
        // The driver treats a never-recorded event as already occurred;
        // the availability flag and the publish ordering contract rely
        // on producers recording before consumers look.
        bind_device(0).unwrap();
        let cache = EventCache::new();
        let event = cache.get(0).unwrap();
        assert!(event.query().unwrap());
    }
}
