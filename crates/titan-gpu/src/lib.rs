//! `titan-gpu`: GPU resource layer for Titan inference.
//!
//! Sits between model execution and the compute API:
//!
//! - **Device management**: adapter negotiation with fallbacks, capability
//!   snapshot, loss detection
//! - **Buffer pool**: size-bucketed reuse, leak detection, staging readback
//! - **Command recording**: many dispatches per queue submission, with
//!   temporary-buffer lifetimes and optional per-pass timestamps
//! - **Profiling**: label-based GPU timing with a wall-clock fallback
//! - **Kernel tuning**: per-device workgroup search with a persistent cache
//!
//! All device access goes through the [`GpuBackend`] trait. [`WgpuBackend`]
//! runs on real hardware; [`MockBackend`] is an in-process fake for tests.

pub mod backend;
pub mod buffer;
pub mod capabilities;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod pool;
pub mod profiler;
pub mod recorder;
pub mod timing;
pub mod tuner;

pub use backend::{BufferDesc, GpuBackend, MockBackend, PassTimestamps, WgpuBackend};
pub use buffer::{BufferHandle, BufferId, Dtype, DtypeTags, bucket_size};
pub use capabilities::{AdapterSignature, DeviceCapabilities, DeviceLimits};
pub use config::{ConfigError, PoolConfig, ProfilingConfig, RuntimeConfig, TunerConfig};
pub use device::DeviceManager;
pub use dispatch::{DispatchConfig, compute_dispatch_size};
pub use error::{GpuError, LimitKind, Result};
pub use pool::{BufferPool, LeakReport, PoolStats};
pub use profiler::{ProfileReport, ProfileResult, Profiler};
pub use recorder::{BatchState, CommandRecorder, RecorderStats};
pub use tuner::{
    FileTuneStore, KernelKind, KernelTuner, MemoryTuneStore, TuneMethod, TuneOptions, TuneRecord,
    TuneStore,
};
