//! Error types for the runtime.
//!
//! Each layer owns its error enum. The session converts them into a
//! [`Status`](crate::chat::Status) at the request boundary, or into `false`
//! at the initialization boundary.
//!
//! ```text
//! InitError
//! ├── Device(DeviceError)        -- bad device spec, unknown/exhausted device
//! ├── ModelLoad(ModelLoadError)  -- missing/corrupt weights, OOM during placement
//! ├── AlreadyInitialized
//! ├── Destroyed
//! └── Runtime(io::Error)         -- worker runtime could not start
//! ```

use std::path::PathBuf;

use thiserror::Error;

use crate::device::DeviceId;

/// Device Pool failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The device string could not be parsed
    #[error("invalid device spec '{spec}': {reason}")]
    InvalidSpec { spec: String, reason: String },

    /// A requested device is not present in the inventory
    #[error("device {0} does not exist")]
    UnknownDevice(DeviceId),

    /// A requested device has no free memory left
    #[error("device {0} has no free memory")]
    Exhausted(DeviceId),

    /// An allocation did not fit in the device arena
    #[error("out of memory on {device}: requested {requested} bytes, {available} available")]
    OutOfMemory {
        device: DeviceId,
        requested: u64,
        available: u64,
    },
}

/// Model Store load failures. Loading is all-or-nothing.
#[derive(Error, Debug)]
pub enum ModelLoadError {
    #[error("model path does not exist: {0}")]
    NotFound(PathBuf),

    #[error("model files are corrupted: {0}")]
    Corrupted(String),

    #[error("architecture mismatch: {0}")]
    ArchitectureMismatch(String),

    #[error("missing required weights: {0}")]
    MissingWeights(String),

    #[error("out of memory while placing weights: {0}")]
    OutOfMemory(#[from] DeviceError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Generation Cache failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Appending would exceed the model's context window
    #[error("cache overflow: {requested} positions exceed the context limit of {limit}")]
    Overflow { requested: usize, limit: usize },

    /// The device arena could not hold the new state
    #[error("cache allocation failed: {0}")]
    OutOfMemory(DeviceError),

    /// A state tensor does not match the entry's width
    #[error("state width {got} does not match cache width {expected}")]
    ShapeMismatch { expected: usize, got: usize },
}

/// Whole-batch forward failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InferenceError {
    /// Recoverable device or driver error; only the batch fails
    #[error("device error: {0}")]
    Device(String),

    /// The device is gone; the session can no longer serve requests
    #[error("device lost: {0}")]
    DeviceLost(String),

    /// The batch itself was malformed
    #[error("invalid batch: {0}")]
    InvalidBatch(String),
}

impl InferenceError {
    /// Whether the failure corrupts shared device state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, InferenceError::DeviceLost(_))
    }
}

/// Per-request scheduler outcomes other than success.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("no scheduler lane for model '{model_id}' on device #{device}")]
    NoLane { model_id: String, device: usize },

    #[error("scheduler lane stopped")]
    LaneClosed,

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Inference(#[from] InferenceError),
}

/// Session initialization failures.
#[derive(Error, Debug)]
pub enum InitError {
    #[error("session is already initialized")]
    AlreadyInitialized,

    #[error("session has been destroyed")]
    Destroyed,

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    ModelLoad(#[from] ModelLoadError),

    #[error("failed to start worker runtime: {0}")]
    Runtime(#[from] std::io::Error),
}
