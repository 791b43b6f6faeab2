//! CUDA backend for hetstream pipeline scopes.
//!
//! This crate lets independent pipeline stages, each possibly running
//! asynchronous GPU work, share GPU-produced results safely without
//! blocking the host thread. The central pieces:
//!
//! - Pooled, reference-counted [`SharedStream`]/[`SharedEvent`] handles
//!   drawn from process-wide caches
//! - [`Product`] - a value plus the device/stream/event provenance
//!   consumers need to synchronize against the producer
//! - Scoped contexts ([`AcquireContext`], [`ProduceContext`],
//!   [`TaskContext`], [`AnalyzeContext`]) that bracket one stage's GPU
//!   work and enforce its lifecycle contract on drop
//!
//! # Example
//!
//! ```ignore
//! use hetstream_core::lane::LaneId;
//! use hetstream_cuda::{AnalyzeContext, ProduceContext};
//!
//! // Producer stage: queue async work, publish the result.
//! let scope = ProduceContext::new(LaneId::new(0))?;
//! // ... queue kernels on scope.stream() ...
//! let product = scope.wrap(output_buffer);
//! drop(scope); // records the producer-done event
//!
//! // Consumer stage: reads synchronize against the producer as needed.
//! let scope = AnalyzeContext::from_product(product.base())?;
//! let value = scope.get(&product)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod context;
pub mod device;
mod driver;
pub mod event;
pub mod metrics;
pub mod product;
pub mod stream;

pub use config::{CacheConfig, CacheConfigBuilder};
pub use context::{
    AcquireContext, AnalyzeContext, ContextState, ProduceContext, TaskContext,
};
pub use device::{bind_device, choose_device, device_count, is_cuda_available};
pub use event::{event_cache, init_event_cache, EventCache, SharedEvent};
pub use metrics::{sync_metrics, SyncMetrics, SyncMetricsSnapshot};
pub use product::{Product, ProductBase};
pub use stream::{init_stream_cache, stream_cache, SharedStream, StreamCache};
