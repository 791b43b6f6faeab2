//! CUDA device-context registry and current-device selection.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use cudarc::driver::CudaContext;
use parking_lot::RwLock;
use tracing::info;

use hetstream_core::error::{HetstreamError, Result};
use hetstream_core::lane::LaneId;

static CONTEXTS: OnceLock<RwLock<HashMap<usize, Arc<CudaContext>>>> = OnceLock::new();

fn contexts() -> &'static RwLock<HashMap<usize, Arc<CudaContext>>> {
    CONTEXTS.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Number of CUDA devices visible to the process.
#[must_use]
pub fn device_count() -> usize {
    CudaContext::device_count().map(|c| c as usize).unwrap_or(0)
}

/// Whether at least one CUDA device is usable.
#[must_use]
pub fn is_cuda_available() -> bool {
    device_count() > 0
}

/// Returns the shared context for `ordinal`, creating it on first use.
///
/// Contexts live for the rest of the process; the registry never
/// shrinks.
pub fn device_context(ordinal: usize) -> Result<Arc<CudaContext>> {
    if let Some(ctx) = contexts().read().get(&ordinal) {
        return Ok(Arc::clone(ctx));
    }

    let mut map = contexts().write();
    // Another thread may have created it between the read and the write.
    if let Some(ctx) = map.get(&ordinal) {
        return Ok(Arc::clone(ctx));
    }

    let ctx = CudaContext::new(ordinal).map_err(|e| {
        HetstreamError::backend(format!(
            "Failed to create context for device {}: {}",
            ordinal, e
        ))
    })?;
    info!(ordinal, "Created CUDA device context");
    map.insert(ordinal, Arc::clone(&ctx));
    Ok(ctx)
}

/// Makes `ordinal` the current device for driver calls on this thread.
///
/// The previous device is intentionally not restored when the calling
/// scope ends: every driver call that depends on the current device is
/// made from inside the scope that selected it, and the setting does not
/// matter between stages. Callers that interleave scopes for different
/// devices on a single host thread must account for this themselves.
pub fn bind_device(ordinal: usize) -> Result<Arc<CudaContext>> {
    let ctx = device_context(ordinal)?;
    ctx.bind_to_thread().map_err(|e| {
        HetstreamError::backend(format!("Failed to bind device {}: {}", ordinal, e))
    })?;
    Ok(ctx)
}

/// Chooses the device serving `lane`, round-robin over present devices.
pub fn choose_device(lane: LaneId) -> Result<usize> {
    let count = device_count();
    if count == 0 {
        return Err(HetstreamError::InvalidDevice {
            ordinal: lane.index(),
            count: 0,
        });
    }
    Ok(lane.index() % count)
}
