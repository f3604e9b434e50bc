//! Batched command recording.
//!
//! A [`CommandRecorder`] collects any number of compute passes and the
//! temporary buffers they need into one encoder, then submits the lot as a
//! single queue submission. Temporary buffers live exactly as long as the
//! batch: they are destroyed once, when the batch is submitted or aborted.
//!
//! With profiling enabled each pass gets a begin/end timestamp pair from a
//! 512-slot query set; once the batch has completed,
//! [`resolve_profile_timings`](CommandRecorder::resolve_profile_timings)
//! turns those into per-label milliseconds.

use crate::backend::{BufferDesc, GpuBackend, PassTimestamps};
use crate::buffer::{BufferHandle, align_up};
use crate::config::ProfilingConfig;
use crate::error::{GpuError, Result};
use crate::timing::{QUERY_CAPACITY, QueryRing, TIMESTAMP_SIZE, decode_timestamps, ticks_to_ms};
use bytemuck::Pod;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Lifecycle of a command batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Recording,
    Submitted,
    Aborted,
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Recording => write!(f, "recording"),
            Self::Submitted => write!(f, "submitted"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Snapshot of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecorderStats {
    pub dispatches: u32,
    /// Temporary buffers still owned by the batch.
    pub temp_buffers: usize,
    pub temp_bytes: u64,
    pub state: BatchState,
    /// Passes that carry a timestamp pair.
    pub profiled_passes: usize,
}

struct ProfiledPass {
    label: String,
    begin: u32,
    end: u32,
}

struct Readback<B: GpuBackend> {
    resolve: B::Buffer,
    staging: B::Buffer,
    size: u64,
}

enum Profiling<B: GpuBackend> {
    Off,
    /// Enabled; the query set is created on the first pass.
    Armed,
    Active {
        query_set: B::QuerySet,
        ring: QueryRing,
        passes: Vec<ProfiledPass>,
        readback: Option<Readback<B>>,
    },
    /// Query set or readback allocation failed.
    Disabled,
}

/// One batch of GPU work, submitted at most once.
pub struct CommandRecorder<B: GpuBackend> {
    backend: Arc<B>,
    label: String,
    encoder: Option<B::Encoder>,
    temps: Vec<BufferHandle<B>>,
    dispatches: u32,
    state: BatchState,
    profiling: Profiling<B>,
    resolved: bool,
}

impl<B: GpuBackend> CommandRecorder<B> {
    /// Start a batch. Timestamp queries are attached to passes only if
    /// `profiling` is set and the device supports them.
    pub fn new(backend: Arc<B>, label: &str, profiling: bool) -> Result<Self> {
        let encoder = backend.create_encoder(label)?;
        let profiling = if profiling && backend.capabilities().timestamp_query {
            Profiling::Armed
        } else {
            Profiling::Off
        };
        Ok(Self {
            backend,
            label: label.to_string(),
            encoder: Some(encoder),
            temps: Vec::new(),
            dispatches: 0,
            state: BatchState::Recording,
            profiling,
            resolved: false,
        })
    }

    /// Start a batch with profiling taken from `config`.
    pub fn with_config(backend: Arc<B>, label: &str, config: &ProfilingConfig) -> Result<Self> {
        Self::new(backend, label, config.enabled)
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    fn ensure_recording(&self) -> Result<()> {
        if self.state == BatchState::Recording {
            self.backend.ensure_live()
        } else {
            Err(GpuError::BatchFinalized)
        }
    }

    /// Allocate a buffer owned by this batch and return a device reference
    /// to it. The buffer is destroyed when the batch ends.
    pub fn create_temp_buffer(
        &mut self,
        size: u64,
        usage: wgpu::BufferUsages,
        label: &str,
    ) -> Result<B::Buffer> {
        self.ensure_recording()?;
        let size = align_up(size, 4).max(4);
        let raw = self.backend.create_buffer(&BufferDesc { label, size, usage })?;
        let handle = BufferHandle::<B>::adopt(raw, size, usage);
        let out = handle.raw().clone();
        self.temps.push(handle);
        Ok(out)
    }

    /// Batch-owned uniform buffer initialised with `bytes`.
    pub fn create_uniform_buffer(&mut self, bytes: &[u8]) -> Result<B::Buffer> {
        let size = align_up(bytes.len() as u64, 16).max(16);
        let buffer = self.create_temp_buffer(
            size,
            wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            "uniform",
        )?;
        let mut padded = bytes.to_vec();
        padded.resize(size as usize, 0);
        self.backend.write_buffer(&buffer, 0, &padded)?;
        Ok(buffer)
    }

    /// Batch-owned uniform buffer holding a `Pod` value.
    pub fn create_uniform<T: Pod>(&mut self, value: &T) -> Result<B::Buffer> {
        self.create_uniform_buffer(bytemuck::bytes_of(value))
    }

    /// Hand an existing buffer to the batch for destruction at batch end.
    ///
    /// On a finished batch the buffer is destroyed immediately and
    /// [`GpuError::BatchFinalized`] is returned.
    pub fn track_temporary_buffer(&mut self, handle: BufferHandle<B>) -> Result<()> {
        if self.state != BatchState::Recording {
            self.backend.destroy_buffer(handle.raw());
            return Err(GpuError::BatchFinalized);
        }
        self.temps.push(handle);
        Ok(())
    }

    /// Open a compute pass on the batch encoder.
    ///
    /// The pass must be dropped (or passed to
    /// [`GpuBackend::end_compute_pass`]) before the batch is submitted.
    pub fn begin_compute_pass(&mut self, label: &str) -> Result<B::ComputePass> {
        self.ensure_recording()?;
        self.dispatches += 1;

        if matches!(self.profiling, Profiling::Armed) {
            self.profiling = match self.backend.create_query_set(&self.label, QUERY_CAPACITY) {
                Ok(query_set) => Profiling::Active {
                    query_set,
                    ring: QueryRing::new(QUERY_CAPACITY),
                    passes: Vec::new(),
                    readback: None,
                },
                Err(e) => {
                    warn!(batch = %self.label, error = %e, "disabling batch profiling");
                    Profiling::Disabled
                }
            };
        }

        let encoder = self.encoder.as_mut().ok_or(GpuError::BatchFinalized)?;
        let timestamps = match &mut self.profiling {
            Profiling::Active { query_set, ring, passes, .. } => match ring.reserve() {
                Some((begin, end)) => {
                    passes.push(ProfiledPass { label: label.to_string(), begin, end });
                    Some(PassTimestamps { query_set: &*query_set, begin_index: begin, end_index: end })
                }
                None => {
                    debug!(batch = %self.label, pass = label, "query slots exhausted, pass not timed");
                    None
                }
            },
            _ => None,
        };
        Ok(self.backend.begin_compute_pass(encoder, label, timestamps))
    }

    /// Raw encoder access for copies and other commands.
    pub fn get_encoder(&mut self) -> Result<&mut B::Encoder> {
        self.ensure_recording()?;
        self.encoder.as_mut().ok_or(GpuError::BatchFinalized)
    }

    /// Finish the encoder and submit it as one queue submission, then
    /// destroy every temporary buffer.
    ///
    /// If the timestamp readback cannot be allocated the batch is submitted
    /// without profiling. A rejected submission leaves the batch `Aborted`.
    pub fn submit(&mut self) -> Result<()> {
        if self.state != BatchState::Recording {
            return Err(GpuError::BatchFinalized);
        }
        let mut encoder = self.encoder.take().ok_or(GpuError::BatchFinalized)?;

        let profiling_failed = match self.encode_resolve(&mut encoder) {
            Ok(()) => false,
            Err(e) => {
                warn!(
                    batch = %self.label,
                    error = %e,
                    "timestamp readback unavailable, submitting unprofiled"
                );
                true
            }
        };
        let commands = self.backend.finish(encoder);
        let result = self.backend.submit(commands);
        self.state = if result.is_ok() { BatchState::Submitted } else { BatchState::Aborted };
        debug!(
            batch = %self.label,
            dispatches = self.dispatches,
            temps = self.temps.len(),
            state = %self.state,
            "submitted batch"
        );
        self.destroy_temps();
        if profiling_failed || result.is_err() {
            self.release_profiling();
            self.profiling = Profiling::Disabled;
        }
        result
    }

    /// [`submit`](Self::submit), then wait for the device to finish.
    pub async fn submit_and_wait(&mut self) -> Result<()> {
        self.submit()?;
        self.backend.wait_idle().await
    }

    /// Drop the recorded work without submitting it.
    pub fn abort(&mut self) -> Result<()> {
        if self.state != BatchState::Recording {
            return Err(GpuError::BatchFinalized);
        }
        self.state = BatchState::Aborted;
        self.encoder = None;
        debug!(batch = %self.label, temps = self.temps.len(), "aborted batch");
        self.destroy_temps();
        self.release_profiling();
        Ok(())
    }

    /// Read back pass timings in milliseconds, summed per label.
    ///
    /// Call after the batch has been submitted and has completed. Durations
    /// that are negative or above one minute are dropped.
    pub async fn resolve_profile_timings(&mut self) -> Result<BTreeMap<String, f64>> {
        if self.state != BatchState::Submitted {
            return Err(GpuError::BatchNotSubmitted);
        }
        if self.resolved {
            return Err(GpuError::ProfilingResolved);
        }
        self.resolved = true;

        let mut timings = BTreeMap::new();
        let Profiling::Active { passes, readback: Some(readback), .. } = &self.profiling else {
            self.release_profiling();
            return Ok(timings);
        };

        let read = self.backend.map_read(&readback.staging, 0, readback.size).await;
        let values = match read {
            Ok(bytes) => decode_timestamps(&bytes),
            Err(e) => {
                self.release_profiling();
                return Err(e);
            }
        };

        let period = self.backend.timestamp_period();
        for pass in passes {
            let (Some(&start), Some(&end)) =
                (values.get(pass.begin as usize), values.get(pass.end as usize))
            else {
                continue;
            };
            match ticks_to_ms(start, end, period) {
                Some(ms) => *timings.entry(pass.label.clone()).or_insert(0.0) += ms,
                None => warn!(pass = %pass.label, start, end, "discarding implausible pass duration"),
            }
        }
        self.release_profiling();
        Ok(timings)
    }

    pub fn stats(&self) -> RecorderStats {
        let profiled_passes = match &self.profiling {
            Profiling::Active { passes, .. } => passes.len(),
            _ => 0,
        };
        RecorderStats {
            dispatches: self.dispatches,
            temp_buffers: self.temps.len(),
            temp_bytes: self.temps.iter().map(BufferHandle::size).sum(),
            state: self.state,
            profiled_passes,
        }
    }

    fn encode_resolve(&mut self, encoder: &mut B::Encoder) -> Result<()> {
        let Profiling::Active { query_set, ring, readback, .. } = &mut self.profiling else {
            return Ok(());
        };
        let used = ring.used();
        if used == 0 {
            return Ok(());
        }
        let size = u64::from(used) * TIMESTAMP_SIZE;
        let resolve = self.backend.create_buffer(&BufferDesc {
            label: "timestamp-resolve",
            size,
            usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
        })?;
        let staging = match self.backend.create_buffer(&BufferDesc {
            label: "timestamp-readback",
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        }) {
            Ok(staging) => staging,
            Err(e) => {
                self.backend.destroy_buffer(&resolve);
                return Err(e);
            }
        };
        self.backend.resolve_query_set(encoder, query_set, 0..used, &resolve, 0);
        self.backend.copy_buffer_to_buffer(encoder, &resolve, 0, &staging, 0, size);
        *readback = Some(Readback { resolve, staging, size });
        Ok(())
    }

    fn destroy_temps(&mut self) {
        for handle in self.temps.drain(..) {
            self.backend.destroy_buffer(handle.raw());
        }
    }

    fn release_profiling(&mut self) {
        let previous = std::mem::replace(&mut self.profiling, Profiling::Off);
        if let Profiling::Active { query_set, readback, .. } = previous {
            self.backend.destroy_query_set(&query_set);
            if let Some(readback) = readback {
                self.backend.destroy_buffer(&readback.resolve);
                self.backend.destroy_buffer(&readback.staging);
            }
        }
    }
}

impl<B: GpuBackend> Drop for CommandRecorder<B> {
    fn drop(&mut self) {
        if self.state == BatchState::Recording {
            warn!(batch = %self.label, "command batch dropped without submit, aborting");
            self.state = BatchState::Aborted;
            self.encoder = None;
            self.destroy_temps();
        }
        self.release_profiling();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::capabilities::DeviceCapabilities;

    fn gpu() -> Arc<MockBackend> {
        Arc::new(MockBackend::new())
    }

    #[test]
    fn temp_buffers_destroyed_on_submit() {
        let gpu = gpu();
        let mut rec = CommandRecorder::new(Arc::clone(&gpu), "batch", false).unwrap();
        rec.create_temp_buffer(100, wgpu::BufferUsages::STORAGE, "t").unwrap();
        rec.create_uniform_buffer(&[1, 2, 3]).unwrap();
        assert_eq!(rec.stats().temp_buffers, 2);
        assert_eq!(rec.stats().temp_bytes, 100 + 16);
        rec.submit().unwrap();
        let c = gpu.counters();
        assert_eq!(c.submissions, 1);
        assert_eq!(c.live_buffers, 0);
        assert_eq!(c.buffers_destroyed, 2);
        assert_eq!(rec.stats().state, BatchState::Submitted);
    }

    #[test]
    fn profiling_follows_config() {
        let gpu = gpu();
        let mut rec =
            CommandRecorder::with_config(Arc::clone(&gpu), "cfg", &ProfilingConfig::default()).unwrap();
        drop(rec.begin_compute_pass("p").unwrap());
        assert_eq!(rec.stats().profiled_passes, 0);

        let on = ProfilingConfig { enabled: true };
        let mut rec = CommandRecorder::with_config(Arc::clone(&gpu), "cfg", &on).unwrap();
        drop(rec.begin_compute_pass("p").unwrap());
        assert_eq!(rec.stats().profiled_passes, 1);
    }

    #[test]
    fn second_submit_is_rejected() {
        let gpu = gpu();
        let mut rec = CommandRecorder::new(Arc::clone(&gpu), "batch", false).unwrap();
        rec.submit().unwrap();
        assert!(matches!(rec.submit(), Err(GpuError::BatchFinalized)));
        assert!(matches!(rec.abort(), Err(GpuError::BatchFinalized)));
        assert_eq!(gpu.counters().submissions, 1);
    }

    #[test]
    fn finalized_batch_rejects_new_work() {
        let mut rec = CommandRecorder::new(gpu(), "batch", false).unwrap();
        rec.abort().unwrap();
        assert!(matches!(
            rec.create_temp_buffer(16, wgpu::BufferUsages::STORAGE, "late"),
            Err(GpuError::BatchFinalized)
        ));
        assert!(matches!(rec.begin_compute_pass("late"), Err(GpuError::BatchFinalized)));
        assert!(matches!(rec.get_encoder(), Err(GpuError::BatchFinalized)));
    }

    #[test]
    fn track_after_finalize_destroys_buffer() {
        let gpu = gpu();
        let raw = gpu
            .create_buffer(&BufferDesc { label: "ext", size: 64, usage: wgpu::BufferUsages::STORAGE })
            .unwrap();
        let mut rec = CommandRecorder::new(Arc::clone(&gpu), "batch", false).unwrap();
        rec.submit().unwrap();
        let err = rec
            .track_temporary_buffer(BufferHandle::adopt(raw.clone(), 64, wgpu::BufferUsages::STORAGE))
            .unwrap_err();
        assert!(matches!(err, GpuError::BatchFinalized));
        assert!(!gpu.is_live(raw.id));
    }

    #[test]
    fn abort_destroys_without_submitting() {
        let gpu = gpu();
        let mut rec = CommandRecorder::new(Arc::clone(&gpu), "batch", true).unwrap();
        rec.create_temp_buffer(64, wgpu::BufferUsages::STORAGE, "t").unwrap();
        drop(rec.begin_compute_pass("p").unwrap());
        rec.abort().unwrap();
        let c = gpu.counters();
        assert_eq!(c.submissions, 0);
        assert_eq!(c.live_buffers, 0);
        assert_eq!(c.query_sets_created, c.query_sets_destroyed);
    }

    #[test]
    fn dropping_unsubmitted_batch_cleans_up() {
        let gpu = gpu();
        {
            let mut rec = CommandRecorder::new(Arc::clone(&gpu), "batch", false).unwrap();
            rec.create_temp_buffer(64, wgpu::BufferUsages::STORAGE, "t").unwrap();
        }
        assert_eq!(gpu.counters().live_buffers, 0);
        assert_eq!(gpu.counters().submissions, 0);
    }

    #[tokio::test]
    async fn resolve_before_submit_is_rejected() {
        let mut rec = CommandRecorder::new(gpu(), "batch", true).unwrap();
        assert!(matches!(rec.resolve_profile_timings().await, Err(GpuError::BatchNotSubmitted)));
    }

    #[tokio::test]
    async fn timings_sum_by_label() {
        let gpu = gpu();
        gpu.set_pass_ticks(2_000_000); // 2 ms per pass
        let mut rec = CommandRecorder::new(Arc::clone(&gpu), "batch", true).unwrap();
        for label in ["matmul", "softmax", "matmul"] {
            drop(rec.begin_compute_pass(label).unwrap());
        }
        assert_eq!(rec.stats().profiled_passes, 3);
        rec.submit_and_wait().await.unwrap();

        let timings = rec.resolve_profile_timings().await.unwrap();
        assert_eq!(timings.len(), 2);
        assert!((timings["matmul"] - 4.0).abs() < 1e-9);
        assert!((timings["softmax"] - 2.0).abs() < 1e-9);
        assert!(matches!(rec.resolve_profile_timings().await, Err(GpuError::ProfilingResolved)));
        assert_eq!(gpu.counters().live_buffers, 0);
    }

    #[tokio::test]
    async fn readback_allocation_failure_still_submits_work() {
        let mut caps = DeviceCapabilities::mock();
        caps.limits.max_buffer_size = 16;
        let gpu = Arc::new(MockBackend::with_capabilities(caps));
        let mut rec = CommandRecorder::new(Arc::clone(&gpu), "batch", true).unwrap();
        drop(rec.begin_compute_pass("a").unwrap());
        drop(rec.begin_compute_pass("b").unwrap());

        // four timestamps need 32 bytes of readback
        rec.submit().unwrap();
        assert_eq!(rec.state(), BatchState::Submitted);
        let c = gpu.counters();
        assert_eq!(c.submissions, 1);
        assert_eq!(c.compute_passes, 2);
        assert_eq!(c.query_sets_destroyed, c.query_sets_created);
        assert!(rec.resolve_profile_timings().await.unwrap().is_empty());
        assert_eq!(gpu.counters().live_buffers, 0);
    }

    #[test]
    fn rejected_submission_aborts_batch_once() {
        let gpu = gpu();
        let mut rec = CommandRecorder::new(Arc::clone(&gpu), "batch", true).unwrap();
        rec.create_temp_buffer(256, wgpu::BufferUsages::STORAGE, "act").unwrap();
        drop(rec.begin_compute_pass("p").unwrap());
        gpu.mark_lost();

        assert!(matches!(rec.submit(), Err(GpuError::NotInitialized)));
        assert_eq!(rec.state(), BatchState::Aborted);
        assert_eq!(rec.stats().temp_buffers, 0);
        assert!(matches!(rec.submit(), Err(GpuError::BatchFinalized)));
        drop(rec);

        let c = gpu.counters();
        assert_eq!(c.submissions, 0);
        assert_eq!(c.live_buffers, 0);
        assert_eq!(c.double_destroys, 0);
        assert_eq!(c.query_sets_destroyed, c.query_sets_created);
    }

    #[tokio::test]
    async fn profiling_skipped_without_timestamp_support() {
        let caps = DeviceCapabilities { timestamp_query: false, ..DeviceCapabilities::mock() };
        let gpu = Arc::new(MockBackend::with_capabilities(caps));
        let mut rec = CommandRecorder::new(Arc::clone(&gpu), "batch", true).unwrap();
        drop(rec.begin_compute_pass("p").unwrap());
        rec.submit().unwrap();
        assert_eq!(gpu.counters().query_sets_created, 0);
        assert!(rec.resolve_profile_timings().await.unwrap().is_empty());
    }

    #[test]
    fn passes_beyond_ring_are_untimed() {
        let mut rec = CommandRecorder::new(gpu(), "batch", true).unwrap();
        for _ in 0..300 {
            drop(rec.begin_compute_pass("p").unwrap());
        }
        let stats = rec.stats();
        assert_eq!(stats.dispatches, 300);
        assert_eq!(stats.profiled_passes, 256);
    }

    #[test]
    fn uniform_from_pod() {
        let gpu = gpu();
        let mut rec = CommandRecorder::new(Arc::clone(&gpu), "batch", false).unwrap();
        let buf = rec.create_uniform(&[1u32, 2, 3, 4, 5]).unwrap();
        assert_eq!(buf.size, 32);
        assert!(buf.usage.contains(wgpu::BufferUsages::UNIFORM));
    }
}
