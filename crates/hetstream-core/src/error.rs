//! Error types for the hetstream pipeline machinery.

use thiserror::Error;

/// Result type used throughout hetstream.
pub type Result<T> = std::result::Result<T, HetstreamError>;

/// Errors surfaced by the pipeline context machinery.
///
/// None of these are retryable: resource exhaustion and driver faults are
/// fatal for the current unit of work (partial GPU state cannot be rolled
/// back), and contract violations signal a defect in the calling stage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HetstreamError {
    /// GPU driver call failed.
    #[error("GPU driver error: {0}")]
    BackendError(String),

    /// Stream or event allocation failed.
    #[error("Resource allocation failed: {0}")]
    AllocationFailed(String),

    /// Device ordinal out of range for this process.
    #[error("Invalid device ordinal {ordinal} ({count} device(s) present)")]
    InvalidDevice {
        /// Requested ordinal.
        ordinal: usize,
        /// Devices visible to the process.
        count: usize,
    },

    /// A continuation was pushed on a scope constructed without
    /// continuation state.
    #[error("Continuation state required but none was supplied")]
    MissingContextState,

    /// Scope lifecycle violated.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// The state the operation requires.
        expected: String,
        /// The state actually observed.
        actual: String,
    },

    /// A product from one device was read in a scope bound to another.
    #[error("Product from device {data_device} read in a scope on device {context_device}")]
    MixedDevices {
        /// Device the product was made on.
        data_device: usize,
        /// Device the reading scope is bound to.
        context_device: usize,
    },

    /// Store slot already holds a value.
    #[error("Store slot {index} already holds a value")]
    SlotOccupied {
        /// Slot index from the offending token.
        index: usize,
    },

    /// Store slot read before being filled.
    #[error("Store slot {index} is empty")]
    SlotEmpty {
        /// Slot index from the offending token.
        index: usize,
    },

    /// Store slot holds a different type than the token promises.
    #[error("Store slot {index} holds a different type")]
    SlotTypeMismatch {
        /// Slot index from the offending token.
        index: usize,
    },
}

impl HetstreamError {
    /// Create a driver error.
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::BackendError(msg.into())
    }

    /// Create an allocation error.
    pub fn allocation(msg: impl Into<String>) -> Self {
        Self::AllocationFailed(msg.into())
    }
}
