//! Deterministic in-process backend.
//!
//! Buffers are byte vectors, command buffers are replayed on submit, and
//! timestamp queries are fed from a monotonic tick clock (1 tick = 1 ns) or
//! from values queued with [`MockBackend::push_pass_timestamps`]. Every
//! device-visible event is counted in [`MockCounters`].

use super::{BufferDesc, GpuBackend, PassTimestamps};
use crate::capabilities::DeviceCapabilities;
use crate::error::{GpuError, Result};
use std::collections::{HashMap, VecDeque};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Handle to a mock allocation. Clones alias the same allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockBuffer {
    pub id: u64,
    pub size: u64,
    pub usage: wgpu::BufferUsages,
}

#[derive(Debug)]
pub struct MockQuerySet {
    id: u64,
    count: u32,
}

#[derive(Debug, Clone)]
pub struct MockPipeline {
    pub id: u64,
    pub label: String,
}

/// Compute pass handle; dispatches are counted on the backend.
#[derive(Debug)]
pub struct MockPass {
    pub label: String,
}

#[derive(Debug)]
enum Command {
    Pass { timestamps: Option<(u64, u32, u32)> },
    Copy { src: u64, src_offset: u64, dst: u64, dst_offset: u64, size: u64 },
    WriteTimestamp { query_set: u64, index: u32 },
    Resolve { query_set: u64, queries: Range<u32>, dst: u64, dst_offset: u64 },
}

#[derive(Debug)]
pub struct MockEncoder {
    commands: Vec<Command>,
}

#[derive(Debug)]
pub struct MockCommandBuffer {
    commands: Vec<Command>,
}

/// Snapshot of everything the mock device has observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockCounters {
    pub buffers_created: u64,
    pub buffers_destroyed: u64,
    /// `destroy_buffer` on an already-destroyed buffer.
    pub double_destroys: u64,
    /// Writes, copies or maps touching a destroyed buffer.
    pub use_after_destroy: u64,
    pub live_buffers: u64,
    pub live_bytes: u64,
    pub submissions: u64,
    pub compute_passes: u64,
    pub dispatches: u64,
    pub pipelines_compiled: u64,
    pub pipeline_failures: u64,
    pub query_sets_created: u64,
    pub query_sets_destroyed: u64,
    pub waits: u64,
    pub maps: u64,
    /// Injected dispatch failures raised outside any error scope.
    pub uncaptured_errors: u64,
}

struct Allocation {
    size: u64,
    data: Vec<u8>,
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    live: HashMap<u64, Allocation>,
    queries: HashMap<(u64, u32), u64>,
    live_query_sets: Vec<u64>,
    clock: u64,
    pass_ticks: u64,
    scripted: VecDeque<(u64, u64)>,
    failing_pipelines: Vec<String>,
    failing_dispatches: Vec<String>,
    error_scopes: Vec<Option<String>>,
    counters: MockCounters,
}

impl MockState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn touch(&mut self, id: u64) -> Option<&mut Allocation> {
        if !self.live.contains_key(&id) {
            self.counters.use_after_destroy += 1;
            return None;
        }
        self.live.get_mut(&id)
    }

    fn write(&mut self, id: u64, offset: u64, bytes: &[u8]) {
        if let Some(alloc) = self.touch(id) {
            let cap = alloc.size as usize;
            let off = offset as usize;
            if off >= cap {
                return;
            }
            let n = bytes.len().min(cap - off);
            if alloc.data.len() < off + n {
                alloc.data.resize(off + n, 0);
            }
            alloc.data[off..off + n].copy_from_slice(&bytes[..n]);
        }
    }

    fn read(&mut self, id: u64, offset: u64, size: u64) -> Vec<u8> {
        let mut out = vec![0u8; size as usize];
        if let Some(alloc) = self.touch(id) {
            let start = (offset as usize).min(alloc.data.len());
            let end = (offset as usize + size as usize).min(alloc.data.len());
            out[..end - start].copy_from_slice(&alloc.data[start..end]);
        }
        out
    }

    fn replay(&mut self, commands: Vec<Command>) {
        for command in commands {
            match command {
                Command::Pass { timestamps } => {
                    let scripted =
                        if timestamps.is_some() { self.scripted.pop_front() } else { None };
                    let (start, end) = match scripted {
                        Some(pair) => pair,
                        None => {
                            let start = self.clock;
                            self.clock += self.pass_ticks;
                            (start, self.clock)
                        }
                    };
                    if let Some((qs, b, e)) = timestamps {
                        self.queries.insert((qs, b), start);
                        self.queries.insert((qs, e), end);
                    }
                }
                Command::Copy { src, src_offset, dst, dst_offset, size } => {
                    let bytes = self.read(src, src_offset, size);
                    self.write(dst, dst_offset, &bytes);
                }
                Command::WriteTimestamp { query_set, index } => {
                    self.clock += 1;
                    let now = self.clock;
                    self.queries.insert((query_set, index), now);
                }
                Command::Resolve { query_set, queries, dst, dst_offset } => {
                    let mut bytes = Vec::with_capacity(queries.len() * 8);
                    for q in queries {
                        let v = self.queries.get(&(query_set, q)).copied().unwrap_or(0);
                        bytes.extend_from_slice(&v.to_le_bytes());
                    }
                    self.write(dst, dst_offset, &bytes);
                }
            }
        }
    }
}

/// In-process fake device.
pub struct MockBackend {
    capabilities: DeviceCapabilities,
    lost: AtomicBool,
    state: Mutex<MockState>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// Mock device with [`DeviceCapabilities::mock`].
    pub fn new() -> Self {
        Self::with_capabilities(DeviceCapabilities::mock())
    }

    pub fn with_capabilities(capabilities: DeviceCapabilities) -> Self {
        let state = MockState { pass_ticks: 1_000, ..MockState::default() };
        Self { capabilities, lost: AtomicBool::new(false), state: Mutex::new(state) }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the event counters.
    pub fn counters(&self) -> MockCounters {
        self.state().counters.clone()
    }

    /// Whether the allocation behind `id` is still alive.
    pub fn is_live(&self, id: u64) -> bool {
        self.state().live.contains_key(&id)
    }

    /// Ticks each timestamped pass advances the device clock by.
    pub fn set_pass_ticks(&self, ticks: u64) {
        self.state().pass_ticks = ticks;
    }

    /// Queue explicit raw (start, end) timestamps for the next timestamped
    /// pass, in submission order.
    pub fn push_pass_timestamps(&self, start: u64, end: u64) {
        self.state().scripted.push_back((start, end));
    }

    /// Make pipeline compilation fail for any label containing `pattern`.
    pub fn fail_pipelines_matching(&self, pattern: impl Into<String>) {
        self.state().failing_pipelines.push(pattern.into());
    }

    /// Raise a validation error whenever a pipeline whose label contains
    /// `pattern` is dispatched. Compilation still succeeds.
    pub fn fail_dispatches_matching(&self, pattern: impl Into<String>) {
        self.state().failing_dispatches.push(pattern.into());
    }
}

impl GpuBackend for MockBackend {
    type Buffer = MockBuffer;
    type Encoder = MockEncoder;
    type CommandBuffer = MockCommandBuffer;
    type ComputePass = MockPass;
    type QuerySet = MockQuerySet;
    type Pipeline = MockPipeline;

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
        if desc.size > self.capabilities.limits.max_buffer_size {
            return Err(GpuError::BufferCreation(format!(
                "'{}': {} bytes exceeds device maximum",
                desc.label, desc.size
            )));
        }
        let mut st = self.state();
        let id = st.next_id();
        st.live.insert(id, Allocation { size: desc.size, data: Vec::new() });
        st.counters.buffers_created += 1;
        st.counters.live_buffers += 1;
        st.counters.live_bytes += desc.size;
        Ok(MockBuffer { id, size: desc.size, usage: desc.usage })
    }

    fn destroy_buffer(&self, buffer: &Self::Buffer) {
        let mut st = self.state();
        match st.live.remove(&buffer.id) {
            Some(alloc) => {
                st.counters.buffers_destroyed += 1;
                st.counters.live_buffers -= 1;
                st.counters.live_bytes -= alloc.size;
            }
            None => st.counters.double_destroys += 1,
        }
    }

    fn write_buffer(&self, buffer: &Self::Buffer, offset: u64, data: &[u8]) -> Result<()> {
        self.ensure_live()?;
        self.state().write(buffer.id, offset, data);
        Ok(())
    }

    fn create_encoder(&self, _label: &str) -> Result<Self::Encoder> {
        self.ensure_live()?;
        Ok(MockEncoder { commands: Vec::new() })
    }

    fn begin_compute_pass(
        &self,
        encoder: &mut Self::Encoder,
        label: &str,
        timestamps: Option<PassTimestamps<'_, Self::QuerySet>>,
    ) -> Self::ComputePass {
        let timestamps = timestamps.map(|t| (t.query_set.id, t.begin_index, t.end_index));
        encoder.commands.push(Command::Pass { timestamps });
        self.state().counters.compute_passes += 1;
        MockPass { label: label.to_string() }
    }

    fn dispatch(
        &self,
        _pass: &mut Self::ComputePass,
        pipeline: &Self::Pipeline,
        _bindings: &[&Self::Buffer],
        _workgroups: [u32; 3],
    ) {
        let mut st = self.state();
        st.counters.dispatches += 1;
        if !st.failing_dispatches.iter().any(|p| pipeline.label.contains(p.as_str())) {
            return;
        }
        let message = format!("{}: injected dispatch failure", pipeline.label);
        match st.error_scopes.last_mut() {
            Some(scope) => {
                scope.get_or_insert(message);
            }
            None => st.counters.uncaptured_errors += 1,
        }
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
        encoder.commands.push(Command::Copy {
            src: src.id,
            src_offset,
            dst: dst.id,
            dst_offset,
            size,
        });
    }

    fn write_timestamp(&self, encoder: &mut Self::Encoder, query_set: &Self::QuerySet, index: u32) {
        encoder.commands.push(Command::WriteTimestamp { query_set: query_set.id, index });
    }

    fn resolve_query_set(
        &self,
        encoder: &mut Self::Encoder,
        query_set: &Self::QuerySet,
        queries: Range<u32>,
        destination: &Self::Buffer,
        destination_offset: u64,
    ) {
        let queries = queries.start.min(query_set.count)..queries.end.min(query_set.count);
        encoder.commands.push(Command::Resolve {
            query_set: query_set.id,
            queries,
            dst: destination.id,
            dst_offset: destination_offset,
        });
    }

    fn finish(&self, encoder: Self::Encoder) -> Self::CommandBuffer {
        MockCommandBuffer { commands: encoder.commands }
    }

    fn submit(&self, command_buffer: Self::CommandBuffer) -> Result<()> {
        self.ensure_live()?;
        let mut st = self.state();
        st.counters.submissions += 1;
        st.replay(command_buffer.commands);
        Ok(())
    }

    fn push_error_scope(&self) {
        self.state().error_scopes.push(None);
    }

    async fn pop_error_scope(&self) -> Result<()> {
        match self.state().error_scopes.pop().flatten() {
            Some(message) => Err(GpuError::Validation(message)),
            None => Ok(()),
        }
    }

    async fn wait_idle(&self) -> Result<()> {
        self.ensure_live()?;
        self.state().counters.waits += 1;
        Ok(())
    }

    async fn map_read(&self, buffer: &Self::Buffer, offset: u64, size: u64) -> Result<Vec<u8>> {
        self.ensure_live()?;
        if !buffer.usage.contains(wgpu::BufferUsages::MAP_READ) {
            return Err(GpuError::BufferMap(format!("buffer {} is not MAP_READ", buffer.id)));
        }
        let mut st = self.state();
        st.counters.maps += 1;
        Ok(st.read(buffer.id, offset, size))
    }

    fn create_query_set(&self, _label: &str, count: u32) -> Result<Self::QuerySet> {
        self.ensure_live()?;
        if !self.capabilities.timestamp_query {
            return Err(GpuError::QuerySet("timestamp queries not supported".into()));
        }
        let mut st = self.state();
        let id = st.next_id();
        st.live_query_sets.push(id);
        st.counters.query_sets_created += 1;
        Ok(MockQuerySet { id, count })
    }

    fn destroy_query_set(&self, query_set: &Self::QuerySet) {
        let mut st = self.state();
        if let Some(pos) = st.live_query_sets.iter().position(|id| *id == query_set.id) {
            st.live_query_sets.swap_remove(pos);
            st.counters.query_sets_destroyed += 1;
        }
        st.queries.retain(|(qs, _), _| *qs != query_set.id);
    }

    fn timestamp_period(&self) -> f32 {
        1.0
    }

    async fn compile_pipeline(
        &self,
        label: &str,
        _wgsl: &str,
        _entry_point: &str,
    ) -> Result<Self::Pipeline> {
        self.ensure_live()?;
        let mut st = self.state();
        if st.failing_pipelines.iter().any(|p| label.contains(p.as_str())) {
            st.counters.pipeline_failures += 1;
            return Err(GpuError::ShaderCompilation(format!("{label}: injected failure")));
        }
        st.counters.pipelines_compiled += 1;
        let id = st.next_id();
        Ok(MockPipeline { id, label: label.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(size: u64, usage: wgpu::BufferUsages) -> BufferDesc<'static> {
        BufferDesc { label: "t", size, usage }
    }

    #[test]
    fn create_and_destroy_tracks_live_bytes() {
        let gpu = MockBackend::new();
        let a = gpu.create_buffer(&desc(256, wgpu::BufferUsages::STORAGE)).unwrap();
        let b = gpu.create_buffer(&desc(512, wgpu::BufferUsages::STORAGE)).unwrap();
        assert_eq!(gpu.counters().live_bytes, 768);
        gpu.destroy_buffer(&a);
        assert_eq!(gpu.counters().live_bytes, 512);
        assert!(!gpu.is_live(a.id));
        assert!(gpu.is_live(b.id));
    }

    #[test]
    fn double_destroy_is_counted() {
        let gpu = MockBackend::new();
        let a = gpu.create_buffer(&desc(256, wgpu::BufferUsages::STORAGE)).unwrap();
        gpu.destroy_buffer(&a);
        gpu.destroy_buffer(&a);
        let c = gpu.counters();
        assert_eq!(c.buffers_destroyed, 1);
        assert_eq!(c.double_destroys, 1);
    }

    #[tokio::test]
    async fn copy_then_map_reads_back_bytes() {
        let gpu = MockBackend::new();
        let src = gpu
            .create_buffer(&desc(16, wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC))
            .unwrap();
        let dst = gpu
            .create_buffer(&desc(16, wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST))
            .unwrap();
        gpu.write_buffer(&src, 0, &[1, 2, 3, 4]).unwrap();
        let mut enc = gpu.create_encoder("copy").unwrap();
        gpu.copy_buffer_to_buffer(&mut enc, &src, 0, &dst, 0, 4);
        gpu.submit(gpu.finish(enc)).unwrap();
        let bytes = gpu.map_read(&dst, 0, 4).await.unwrap();
        assert_eq!(bytes, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn map_requires_map_read_usage() {
        let gpu = MockBackend::new();
        let buf = gpu.create_buffer(&desc(16, wgpu::BufferUsages::STORAGE)).unwrap();
        let err = gpu.map_read(&buf, 0, 16).await.unwrap_err();
        assert!(matches!(err, GpuError::BufferMap(_)));
    }

    #[test]
    fn lost_device_rejects_calls() {
        let gpu = MockBackend::new();
        gpu.mark_lost();
        let err = gpu.create_buffer(&desc(256, wgpu::BufferUsages::STORAGE)).unwrap_err();
        assert!(matches!(err, GpuError::NotInitialized));
        assert!(gpu.create_encoder("x").is_err());
    }

    #[tokio::test]
    async fn injected_pipeline_failure() {
        let gpu = MockBackend::new();
        gpu.fail_pipelines_matching("bad");
        assert!(gpu.compile_pipeline("good_kernel", "", "main").await.is_ok());
        assert!(gpu.compile_pipeline("bad_kernel", "", "main").await.is_err());
        let c = gpu.counters();
        assert_eq!(c.pipelines_compiled, 1);
        assert_eq!(c.pipeline_failures, 1);
    }

    #[tokio::test]
    async fn dispatch_failure_lands_in_innermost_scope() {
        let gpu = MockBackend::new();
        gpu.fail_dispatches_matching("bad");
        let pipeline = gpu.compile_pipeline("bad_kernel", "", "main").await.unwrap();
        let mut encoder = gpu.create_encoder("e").unwrap();

        let mut pass = gpu.begin_compute_pass(&mut encoder, "outside", None);
        gpu.dispatch(&mut pass, &pipeline, &[], [1, 1, 1]);
        assert_eq!(gpu.counters().uncaptured_errors, 1);

        gpu.push_error_scope();
        gpu.push_error_scope();
        gpu.dispatch(&mut pass, &pipeline, &[], [1, 1, 1]);
        let inner = gpu.pop_error_scope().await;
        assert!(matches!(inner, Err(GpuError::Validation(ref m)) if m.contains("bad_kernel")));
        assert!(gpu.pop_error_scope().await.is_ok());
        assert_eq!(gpu.counters().uncaptured_errors, 1);
    }
}
