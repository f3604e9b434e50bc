//! Host compute environment seam.
//!
//! Everything above this module talks to the device through [`GpuBackend`].
//! [`WgpuBackend`] drives a real adapter via wgpu; [`MockBackend`] is a
//! deterministic in-process fake that counts submissions, tracks buffer
//! lifetimes and synthesizes timestamps, so the pool, recorder, profiler and
//! tuner can be exercised without GPU hardware.

pub mod mock;
pub mod native;

pub use mock::{MockBackend, MockBuffer, MockCounters};
pub use native::WgpuBackend;

use crate::capabilities::DeviceCapabilities;
use crate::error::{GpuError, Result};
use std::ops::Range;

/// Parameters for a raw buffer allocation.
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    pub label: &'a str,
    pub size: u64,
    pub usage: wgpu::BufferUsages,
}

/// Start/end timestamp slots attached to a compute pass.
pub struct PassTimestamps<'a, Q> {
    pub query_set: &'a Q,
    pub begin_index: u32,
    pub end_index: u32,
}

/// Operations the resource layer needs from a compute device.
///
/// Methods that can suspend (`wait_idle`, `map_read`, `compile_pipeline`)
/// are `async`; everything else completes synchronously so that
/// check-then-mutate sequences in callers are never interleaved.
#[allow(async_fn_in_trait)]
pub trait GpuBackend {
    /// Device buffer. Clones alias the same allocation.
    type Buffer: Clone;
    type Encoder;
    type CommandBuffer;
    type ComputePass;
    type QuerySet;
    type Pipeline;

    /// Capability record of the negotiated device.
    fn capabilities(&self) -> &DeviceCapabilities;

    /// Whether the device-loss notification has fired.
    fn is_lost(&self) -> bool;

    /// Flag the device as lost. Later calls fail with `NotInitialized`.
    fn mark_lost(&self);

    /// Fail fast with [`GpuError::NotInitialized`] on a lost device.
    fn ensure_live(&self) -> Result<()> {
        if self.is_lost() { Err(GpuError::NotInitialized) } else { Ok(()) }
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<Self::Buffer>;

    /// Release the device memory behind `buffer`. Clones become invalid.
    fn destroy_buffer(&self, buffer: &Self::Buffer);

    fn write_buffer(&self, buffer: &Self::Buffer, offset: u64, data: &[u8]) -> Result<()>;

    fn create_encoder(&self, label: &str) -> Result<Self::Encoder>;

    fn begin_compute_pass(
        &self,
        encoder: &mut Self::Encoder,
        label: &str,
        timestamps: Option<PassTimestamps<'_, Self::QuerySet>>,
    ) -> Self::ComputePass;

    /// Bind `bindings` in order to group 0 and dispatch `workgroups`.
    fn dispatch(
        &self,
        pass: &mut Self::ComputePass,
        pipeline: &Self::Pipeline,
        bindings: &[&Self::Buffer],
        workgroups: [u32; 3],
    );

    fn end_compute_pass(&self, pass: Self::ComputePass) {
        drop(pass);
    }

    fn copy_buffer_to_buffer(
        &self,
        encoder: &mut Self::Encoder,
        src: &Self::Buffer,
        src_offset: u64,
        dst: &Self::Buffer,
        dst_offset: u64,
        size: u64,
    );

    /// Write a timestamp directly on the encoder. Only valid when
    /// `timestamp_query_inside_encoders` is supported.
    fn write_timestamp(&self, encoder: &mut Self::Encoder, query_set: &Self::QuerySet, index: u32);

    fn resolve_query_set(
        &self,
        encoder: &mut Self::Encoder,
        query_set: &Self::QuerySet,
        queries: Range<u32>,
        destination: &Self::Buffer,
        destination_offset: u64,
    );

    fn finish(&self, encoder: Self::Encoder) -> Self::CommandBuffer;

    /// One call is exactly one queue submission.
    fn submit(&self, command_buffer: Self::CommandBuffer) -> Result<()>;

    /// Capture validation errors raised by the calls that follow, until the
    /// matching [`pop_error_scope`](Self::pop_error_scope).
    fn push_error_scope(&self);

    /// Close the innermost scope, failing with [`GpuError::Validation`] if
    /// anything inside it was rejected.
    async fn pop_error_scope(&self) -> Result<()>;

    /// Wait until all submitted work has completed.
    async fn wait_idle(&self) -> Result<()>;

    /// Map `size` bytes at `offset` for reading, copy them out, and unmap.
    async fn map_read(&self, buffer: &Self::Buffer, offset: u64, size: u64) -> Result<Vec<u8>>;

    fn create_query_set(&self, label: &str, count: u32) -> Result<Self::QuerySet>;

    fn destroy_query_set(&self, query_set: &Self::QuerySet);

    /// Nanoseconds per timestamp tick.
    fn timestamp_period(&self) -> f32;

    /// Compile a WGSL compute pipeline with an auto-derived layout.
    async fn compile_pipeline(
        &self,
        label: &str,
        wgsl: &str,
        entry_point: &str,
    ) -> Result<Self::Pipeline>;
}
