//! # hetstream
//!
//! Scoped GPU pipeline contexts for heterogeneous (CPU+GPU) pipelines.
//!
//! Independent processing stages, each possibly running asynchronous GPU
//! work, share GPU-produced results without blocking the host thread: a
//! stage enters an acquire scope, reads prior results through the
//! synchronizing getter (which orders streams GPU-side as needed),
//! optionally chains continuations, and on scope exit the host scheduler
//! is notified - exactly once - when everything the stage queued has
//! completed. Produce scopes publish results stamped with the
//! device/stream/event provenance later consumers synchronize against.
//!
//! The stage lifecycle per unit of work:
//!
//! ```text
//! Acquire -> [Produce] -> [Task]* -> (terminal / Analyze)
//! ```
//!
//! See [`hetstream_cuda`] for the scope types and [`hetstream_core`] for
//! the host-framework primitives (waiting tasks, the typed result
//! store).

#![warn(missing_docs)]

pub use hetstream_core::error::{HetstreamError, Result};
pub use hetstream_core::lane::LaneId;
pub use hetstream_core::store::{GetToken, PutToken, ResultStore, TokenRegistry};
pub use hetstream_core::task::{TaskStatus, WaitingTaskHolder};

pub use hetstream_cuda::{
    bind_device, choose_device, device_count, event_cache, init_event_cache, init_stream_cache,
    is_cuda_available, stream_cache, sync_metrics, AcquireContext, AnalyzeContext, CacheConfig,
    CacheConfigBuilder, ContextState, EventCache, Product, ProductBase, ProduceContext,
    SharedEvent, SharedStream, StreamCache, SyncMetrics, SyncMetricsSnapshot, TaskContext,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{
        AcquireContext, AnalyzeContext, ContextState, HetstreamError, LaneId, Product,
        ProduceContext, ResultStore, Result, TaskContext, TaskStatus, TokenRegistry,
        WaitingTaskHolder,
    };
}
