//! Result wrappers carrying the provenance consumers synchronize on.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use hetstream_core::error::Result;

use crate::event::SharedEvent;
use crate::stream::SharedStream;

/// Provenance shared by every product: the device and stream the value
/// was produced on, and the event marking the producer's "done
/// enqueuing" boundary.
pub struct ProductBase {
    device: usize,
    stream: SharedStream,
    event: Option<SharedEvent>,
    available: AtomicBool,
}

impl ProductBase {
    pub(crate) fn new(device: usize, stream: SharedStream, event: Option<SharedEvent>) -> Self {
        // Without an event there is nothing to wait for; such a product
        // is host-complete from birth.
        let available = event.is_none();
        Self {
            device,
            stream,
            event,
            available: AtomicBool::new(available),
        }
    }

    /// Device ordinal the value was produced on.
    #[must_use]
    pub fn device(&self) -> usize {
        self.device
    }

    /// Stream the producing work was queued on.
    #[must_use]
    pub fn stream(&self) -> &SharedStream {
        &self.stream
    }

    /// Event recorded at the producer's enqueue boundary, if any.
    #[must_use]
    pub fn event(&self) -> Option<&SharedEvent> {
        self.event.as_ref()
    }

    /// Whether the producing work has already completed.
    ///
    /// Completion is monotonic, so a positive answer is cached and
    /// subsequent calls skip the driver query. Readers on the producing
    /// stream do not need this to be true; queue order already covers
    /// them.
    pub fn is_available(&self) -> Result<bool> {
        if self.available.load(Ordering::Acquire) {
            return Ok(true);
        }
        let Some(event) = &self.event else {
            return Ok(true);
        };
        let done = event.query()?;
        if done {
            self.available.store(true, Ordering::Release);
        }
        Ok(done)
    }
}

impl fmt::Debug for ProductBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProductBase")
            .field("device", &self.device)
            .field("stream", &self.stream)
            .field("has_event", &self.event.is_some())
            .field("available", &self.available.load(Ordering::Relaxed))
            .finish()
    }
}

/// A stage result plus the provenance consumers need to synchronize.
///
/// Products are created by a produce-phase scope when the computed value
/// is published, never mutated afterwards, and dropped when the last
/// holder lets go (returning their stream and event to the pools).
/// Values are read through a scope's synchronizing getter, which decides
/// per read whether the consuming stream must first wait on the
/// producer's event.
pub struct Product<T> {
    base: ProductBase,
    value: T,
}

impl<T> Product<T> {
    pub(crate) fn new(base: ProductBase, value: T) -> Self {
        Self { base, value }
    }

    /// Provenance of this product.
    #[must_use]
    pub fn base(&self) -> &ProductBase {
        &self.base
    }

    /// Device ordinal the value was produced on.
    #[must_use]
    pub fn device(&self) -> usize {
        self.base.device()
    }

    /// Whether the producing work has already completed.
    pub fn is_available(&self) -> Result<bool> {
        self.base.is_available()
    }

    pub(crate) fn value(&self) -> &T {
        &self.value
    }
}

impl<T: fmt::Debug> fmt::Debug for Product<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Product")
            .field("base", &self.base)
            .field("value", &self.value)
            .finish()
    }
}
