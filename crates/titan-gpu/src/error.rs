//! Error types for the GPU resource layer.

use std::fmt;
use thiserror::Error;

/// Device ceiling that an allocation ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    /// `maxBufferSize`: the general per-buffer ceiling.
    MaxBufferSize,
    /// `maxStorageBufferBindingSize`: stricter ceiling for storage bindings.
    MaxStorageBindingSize,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxBufferSize => write!(f, "maxBufferSize"),
            Self::MaxStorageBindingSize => write!(f, "maxStorageBufferBindingSize"),
        }
    }
}

/// Errors produced by the GPU resource layer.
#[derive(Debug, Error)]
pub enum GpuError {
    #[error("no suitable GPU adapter found")]
    NoAdapter,

    #[error("failed to request device: {0}")]
    DeviceRequest(String),

    #[error("GPU device not initialized (never created or lost)")]
    NotInitialized,

    #[error("allocation of {requested} bytes exceeds {limit} ({max} bytes)")]
    LimitExceeded { limit: LimitKind, requested: u64, max: u64 },

    #[error("buffer creation failed: {0}")]
    BufferCreation(String),

    #[error("buffer mapping failed: {0}")]
    BufferMap(String),

    #[error("command batch already finalized")]
    BatchFinalized,

    #[error("command batch has not been submitted yet")]
    BatchNotSubmitted,

    #[error("profile timings already resolved for this batch")]
    ProfilingResolved,

    #[error("query set creation failed: {0}")]
    QuerySet(String),

    #[error("shader compilation failed: {0}")]
    ShaderCompilation(String),

    #[error("GPU command validation failed: {0}")]
    Validation(String),

    #[error("invalid dimensions: {0}")]
    InvalidDimensions(String),

    #[error("kernel tuning failed for '{kernel}': {reason}")]
    TuningFailed { kernel: String, reason: String },

    #[error("tune cache store error: {0}")]
    Store(String),

    #[error("wgpu error: {0}")]
    Wgpu(#[from] wgpu::RequestDeviceError),
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, GpuError>;
