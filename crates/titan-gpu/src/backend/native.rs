//! wgpu implementation of [`GpuBackend`].

use super::{BufferDesc, GpuBackend, PassTimestamps};
use crate::capabilities::DeviceCapabilities;
use crate::error::{GpuError, Result};
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Holds the wgpu instance, adapter, device and queue of one negotiation.
pub struct WgpuBackend {
    pub instance: wgpu::Instance,
    pub adapter: wgpu::Adapter,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    capabilities: DeviceCapabilities,
    lost: Arc<AtomicBool>,
}

impl WgpuBackend {
    pub fn new(
        instance: wgpu::Instance,
        adapter: wgpu::Adapter,
        device: wgpu::Device,
        queue: wgpu::Queue,
        capabilities: DeviceCapabilities,
    ) -> Self {
        Self { instance, adapter, device, queue, capabilities, lost: Arc::new(AtomicBool::new(false)) }
    }

    /// Shared loss flag, set from the device-lost callback.
    pub fn lost_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.lost)
    }

    /// Return the adapter name.
    pub fn adapter_name(&self) -> String {
        self.adapter.get_info().name
    }

    /// Return the wgpu backend in use (Vulkan, Metal, DX12, …).
    pub fn backend(&self) -> wgpu::Backend {
        self.adapter.get_info().backend
    }
}

impl GpuBackend for WgpuBackend {
    type Buffer = Arc<wgpu::Buffer>;
    type Encoder = wgpu::CommandEncoder;
    type CommandBuffer = wgpu::CommandBuffer;
    type ComputePass = wgpu::ComputePass<'static>;
    type QuerySet = wgpu::QuerySet;
    type Pipeline = wgpu::ComputePipeline;

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    fn mark_lost(&self) {
        self.lost.store(true, Ordering::Release);
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<Self::Buffer> {
        self.ensure_live()?;
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(desc.label),
            size: desc.size,
            usage: desc.usage,
            mapped_at_creation: false,
        });
        Ok(Arc::new(buffer))
    }

    fn destroy_buffer(&self, buffer: &Self::Buffer) {
        buffer.destroy();
    }

    fn write_buffer(&self, buffer: &Self::Buffer, offset: u64, data: &[u8]) -> Result<()> {
        self.ensure_live()?;
        self.queue.write_buffer(buffer, offset, data);
        Ok(())
    }

    fn create_encoder(&self, label: &str) -> Result<Self::Encoder> {
        self.ensure_live()?;
        Ok(self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) }))
    }

    fn begin_compute_pass(
        &self,
        encoder: &mut Self::Encoder,
        label: &str,
        timestamps: Option<PassTimestamps<'_, Self::QuerySet>>,
    ) -> Self::ComputePass {
        let timestamp_writes = timestamps.map(|t| wgpu::ComputePassTimestampWrites {
            query_set: t.query_set,
            beginning_of_pass_write_index: Some(t.begin_index),
            end_of_pass_write_index: Some(t.end_index),
        });
        encoder
            .begin_compute_pass(&wgpu::ComputePassDescriptor { label: Some(label), timestamp_writes })
            .forget_lifetime()
    }

    fn dispatch(
        &self,
        pass: &mut Self::ComputePass,
        pipeline: &Self::Pipeline,
        bindings: &[&Self::Buffer],
        workgroups: [u32; 3],
    ) {
        let layout = pipeline.get_bind_group_layout(0);
        let entries: Vec<wgpu::BindGroupEntry<'_>> = bindings
            .iter()
            .enumerate()
            .map(|(i, buf)| wgpu::BindGroupEntry {
                binding: i as u32,
                resource: buf.as_entire_binding(),
            })
            .collect();
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("dispatch-bind-group"),
            layout: &layout,
            entries: &entries,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, Some(&bind_group), &[]);
        pass.dispatch_workgroups(workgroups[0], workgroups[1], workgroups[2]);
    }

    fn copy_buffer_to_buffer(
        &self,
        encoder: &mut Self::Encoder,
        src: &Self::Buffer,
        src_offset: u64,
        dst: &Self::Buffer,
        dst_offset: u64,
        size: u64,
    ) {
        encoder.copy_buffer_to_buffer(src, src_offset, dst, dst_offset, size);
    }

    fn write_timestamp(&self, encoder: &mut Self::Encoder, query_set: &Self::QuerySet, index: u32) {
        encoder.write_timestamp(query_set, index);
    }

    fn resolve_query_set(
        &self,
        encoder: &mut Self::Encoder,
        query_set: &Self::QuerySet,
        queries: Range<u32>,
        destination: &Self::Buffer,
        destination_offset: u64,
    ) {
        encoder.resolve_query_set(query_set, queries, destination, destination_offset);
    }

    fn finish(&self, encoder: Self::Encoder) -> Self::CommandBuffer {
        encoder.finish()
    }

    fn submit(&self, command_buffer: Self::CommandBuffer) -> Result<()> {
        self.ensure_live()?;
        self.queue.submit(std::iter::once(command_buffer));
        Ok(())
    }

    fn push_error_scope(&self) {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
    }

    async fn pop_error_scope(&self) -> Result<()> {
        match self.device.pop_error_scope().await {
            Some(err) => Err(GpuError::Validation(err.to_string())),
            None => Ok(()),
        }
    }

    async fn wait_idle(&self) -> Result<()> {
        self.ensure_live()?;
        let (tx, rx) = std::sync::mpsc::channel();
        self.queue.on_submitted_work_done(move || {
            let _ = tx.send(());
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        rx.recv().map_err(|_| GpuError::NotInitialized)
    }

    async fn map_read(&self, buffer: &Self::Buffer, offset: u64, size: u64) -> Result<Vec<u8>> {
        self.ensure_live()?;
        if size == 0 {
            return Ok(Vec::new());
        }
        let slice = buffer.slice(offset..offset + size);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|e| GpuError::BufferMap(e.to_string()))?
            .map_err(|e: wgpu::BufferAsyncError| GpuError::BufferMap(e.to_string()))?;

        let bytes = slice.get_mapped_range().to_vec();
        buffer.unmap();
        Ok(bytes)
    }

    fn create_query_set(&self, label: &str, count: u32) -> Result<Self::QuerySet> {
        self.ensure_live()?;
        if !self.capabilities.timestamp_query {
            return Err(GpuError::QuerySet("timestamp queries not supported".into()));
        }
        Ok(self.device.create_query_set(&wgpu::QuerySetDescriptor {
            label: Some(label),
            ty: wgpu::QueryType::Timestamp,
            count,
        }))
    }

    fn destroy_query_set(&self, query_set: &Self::QuerySet) {
        // wgpu frees query sets on drop; nothing to release eagerly.
        let _ = query_set;
    }

    fn timestamp_period(&self) -> f32 {
        self.queue.get_timestamp_period()
    }

    async fn compile_pipeline(
        &self,
        label: &str,
        wgsl: &str,
        entry_point: &str,
    ) -> Result<Self::Pipeline> {
        self.ensure_live()?;
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(wgsl.into()),
        });
        let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(label),
            layout: None,
            module: &module,
            entry_point: Some(entry_point),
            compilation_options: Default::default(),
            cache: None,
        });

        if let Some(err) = self.device.pop_error_scope().await {
            return Err(GpuError::ShaderCompilation(format!("{label}: {err}")));
        }
        debug!(label, entry_point, "compiled compute pipeline");
        Ok(pipeline)
    }
}
