//! Label-based GPU timing.
//!
//! [`Profiler`] times arbitrary labelled regions. When the device supports
//! timestamp queries each `begin`/`end` pair reserves two slots in a
//! 512-slot ring, the caller attaches them to a pass (or writes them on an
//! encoder), and [`Profiler::resolve`] reads every pending pair back in one
//! go. A wall-clock measurement is always taken too and stands in for any
//! GPU value that is missing or implausible.

use crate::backend::{BufferDesc, GpuBackend, PassTimestamps};
use crate::error::Result;
use crate::timing::{QUERY_CAPACITY, QueryRing, TIMESTAMP_SIZE, decode_timestamps, ticks_to_ms};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Samples kept per label.
pub const WINDOW_SIZE: usize = 100;

/// Evictions between exact min/max recomputations.
pub const RECOMPUTE_EVERY: u32 = 20;

/// Rolling statistics for one label.
///
/// `count`, `sum` and `avg` always describe the current window exactly.
/// `min` and `max` are updated incrementally and only recomputed from the
/// window every [`RECOMPUTE_EVERY`] evictions, so they may briefly include
/// samples that have already left the window.
#[derive(Debug, Clone)]
pub struct LabelStats {
    samples: VecDeque<f64>,
    sum: f64,
    min: f64,
    max: f64,
    evictions: u32,
}

impl Default for LabelStats {
    fn default() -> Self {
        Self {
            samples: VecDeque::with_capacity(WINDOW_SIZE),
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            evictions: 0,
        }
    }
}

impl LabelStats {
    pub fn record(&mut self, ms: f64) {
        if self.samples.len() == WINDOW_SIZE {
            if let Some(old) = self.samples.pop_front() {
                self.sum -= old;
            }
            self.evictions += 1;
        }
        self.samples.push_back(ms);
        self.sum += ms;
        self.min = self.min.min(ms);
        self.max = self.max.max(ms);

        if self.evictions >= RECOMPUTE_EVERY {
            self.evictions = 0;
            self.recompute();
        }
    }

    fn recompute(&mut self) {
        self.sum = self.samples.iter().sum();
        self.min = self.samples.iter().copied().fold(f64::INFINITY, f64::min);
        self.max = self.samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }

    pub fn total_ms(&self) -> f64 {
        self.sum
    }

    pub fn avg_ms(&self) -> f64 {
        if self.samples.is_empty() { 0.0 } else { self.sum / self.samples.len() as f64 }
    }

    pub fn min_ms(&self) -> f64 {
        if self.samples.is_empty() { 0.0 } else { self.min }
    }

    pub fn max_ms(&self) -> f64 {
        if self.samples.is_empty() { 0.0 } else { self.max }
    }
}

/// Summary row for one label.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileResult {
    pub label: String,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub count: usize,
    pub total_ms: f64,
}

/// All labels, sorted by total time (largest first).
#[derive(Debug, Clone, Default)]
pub struct ProfileReport {
    pub entries: Vec<ProfileResult>,
    pub gpu_timing: bool,
}

impl fmt::Display for ProfileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = if self.gpu_timing { "gpu timestamps" } else { "wall clock" };
        writeln!(f, "=== GPU Profile ({source}) ===")?;
        writeln!(
            f,
            "{:<28} {:>8} {:>12} {:>12} {:>12} {:>12}",
            "Label", "Count", "Avg ms", "Min ms", "Max ms", "Total ms"
        )?;
        writeln!(f, "{}", "-".repeat(88))?;
        for e in &self.entries {
            writeln!(
                f,
                "{:<28} {:>8} {:>12.3} {:>12.3} {:>12.3} {:>12.3}",
                e.label, e.count, e.avg_ms, e.min_ms, e.max_ms, e.total_ms
            )?;
        }
        writeln!(f, "{}", "-".repeat(88))?;
        let total: f64 = self.entries.iter().map(|e| e.total_ms).sum();
        write!(f, "Labels: {}  Total: {total:.3}ms", self.entries.len())
    }
}

struct OpenSpan {
    slots: Option<(u32, u32)>,
    begin_written: bool,
    end_written: bool,
    started: Instant,
}

struct PendingSpan {
    label: String,
    slots: (u32, u32),
    written: bool,
    wall_ms: f64,
}

/// Label-keyed begin/end timer.
pub struct Profiler<B: GpuBackend> {
    backend: Arc<B>,
    query_set: Option<B::QuerySet>,
    ring: QueryRing,
    open: HashMap<String, OpenSpan>,
    pending: Vec<PendingSpan>,
    stats: BTreeMap<String, LabelStats>,
}

impl<B: GpuBackend> Profiler<B> {
    /// Uses GPU timestamps when the device supports them; otherwise, or if
    /// the query set cannot be created, times with the wall clock.
    pub fn new(backend: Arc<B>) -> Self {
        let query_set = if backend.capabilities().timestamp_query {
            match backend.create_query_set("profiler", QUERY_CAPACITY) {
                Ok(qs) => Some(qs),
                Err(e) => {
                    warn!(error = %e, "GPU timing unavailable, falling back to wall clock");
                    None
                }
            }
        } else {
            None
        };
        Self {
            backend,
            query_set,
            ring: QueryRing::new(QUERY_CAPACITY),
            open: HashMap::new(),
            pending: Vec::new(),
            stats: BTreeMap::new(),
        }
    }

    pub fn is_gpu_timing(&self) -> bool {
        self.query_set.is_some()
    }

    /// Start timing `label`. Re-beginning an open label restarts it.
    pub fn begin(&mut self, label: &str) {
        let slots = self.query_set.as_ref().map(|_| {
            let (pair, wrapped) = self.ring.reserve_wrapping();
            if wrapped {
                warn!(label, "profiler query ring wrapped, unresolved slots will be reused");
            }
            pair
        });
        let span = OpenSpan { slots, begin_written: false, end_written: false, started: Instant::now() };
        if self.open.insert(label.to_string(), span).is_some() {
            debug!(label, "profiler span restarted");
        }
    }

    /// Timestamp attachment for a compute pass covering the open `label`.
    pub fn timestamp_writes(&mut self, label: &str) -> Option<PassTimestamps<'_, B::QuerySet>> {
        let query_set = self.query_set.as_ref()?;
        let span = self.open.get_mut(label)?;
        let (begin, end) = span.slots?;
        span.begin_written = true;
        span.end_written = true;
        Some(PassTimestamps { query_set, begin_index: begin, end_index: end })
    }

    /// Write the begin (or end) timestamp of `label` directly on `encoder`.
    ///
    /// Returns `false` when in-encoder timestamps are unsupported or the
    /// label is not open.
    pub fn write_timestamp(&mut self, encoder: &mut B::Encoder, label: &str, is_end: bool) -> bool {
        if !self.backend.capabilities().timestamp_query_inside_encoders {
            return false;
        }
        let Some(query_set) = self.query_set.as_ref() else {
            return false;
        };
        let Some(span) = self.open.get_mut(label) else {
            return false;
        };
        let Some((begin, end)) = span.slots else {
            return false;
        };
        if is_end {
            self.backend.write_timestamp(encoder, query_set, end);
            span.end_written = true;
        } else {
            self.backend.write_timestamp(encoder, query_set, begin);
            span.begin_written = true;
        }
        true
    }

    /// Stop timing `label`.
    pub fn end(&mut self, label: &str) {
        let Some(span) = self.open.remove(label) else {
            warn!(label, "profiler end without begin");
            return;
        };
        let wall_ms = span.started.elapsed().as_secs_f64() * 1e3;
        match span.slots {
            Some(slots) => self.pending.push(PendingSpan {
                label: label.to_string(),
                slots,
                written: span.begin_written && span.end_written,
                wall_ms,
            }),
            None => self.stats.entry(label.to_string()).or_default().record(wall_ms),
        }
    }

    /// Read back every pending GPU measurement in one submission and fold
    /// the results into the per-label statistics.
    pub async fn resolve(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending);
        let values = match self.read_queries().await {
            Ok(values) => values,
            Err(e) => {
                warn!(error = %e, "timestamp readback failed, using wall clock");
                Vec::new()
            }
        };

        let period = self.backend.timestamp_period();
        for span in pending {
            let gpu_ms = span
                .written
                .then(|| {
                    let start = *values.get(span.slots.0 as usize)?;
                    let end = *values.get(span.slots.1 as usize)?;
                    ticks_to_ms(start, end, period)
                })
                .flatten();
            let ms = match gpu_ms {
                Some(ms) => ms,
                None => {
                    if span.written {
                        warn!(label = %span.label, "implausible GPU duration, using wall clock");
                    }
                    span.wall_ms
                }
            };
            self.stats.entry(span.label).or_default().record(ms);
        }
        if self.open.is_empty() {
            self.ring.reset();
        }
        Ok(())
    }

    async fn read_queries(&self) -> Result<Vec<u64>> {
        let Some(query_set) = self.query_set.as_ref() else {
            return Ok(Vec::new());
        };
        let count = self.ring.capacity();
        let size = u64::from(count) * TIMESTAMP_SIZE;
        let resolve = self.backend.create_buffer(&BufferDesc {
            label: "profiler-resolve",
            size,
            usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
        })?;
        let staging = match self.backend.create_buffer(&BufferDesc {
            label: "profiler-readback",
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        }) {
            Ok(buf) => buf,
            Err(e) => {
                self.backend.destroy_buffer(&resolve);
                return Err(e);
            }
        };

        let result = self.resolve_into(query_set, count, &resolve, &staging).await;
        self.backend.destroy_buffer(&resolve);
        self.backend.destroy_buffer(&staging);
        Ok(decode_timestamps(&result?))
    }

    async fn resolve_into(
        &self,
        query_set: &B::QuerySet,
        count: u32,
        resolve: &B::Buffer,
        staging: &B::Buffer,
    ) -> Result<Vec<u8>> {
        let size = u64::from(count) * TIMESTAMP_SIZE;
        let mut encoder = self.backend.create_encoder("profiler-resolve")?;
        self.backend.resolve_query_set(&mut encoder, query_set, 0..count, resolve, 0);
        self.backend.copy_buffer_to_buffer(&mut encoder, resolve, 0, staging, 0, size);
        self.backend.submit(self.backend.finish(encoder))?;
        self.backend.map_read(staging, 0, size).await
    }

    /// Statistics for `label`, if any samples were recorded.
    pub fn label_stats(&self, label: &str) -> Option<&LabelStats> {
        self.stats.get(label)
    }

    pub fn get_results(&self) -> Vec<ProfileResult> {
        self.stats
            .iter()
            .map(|(label, s)| ProfileResult {
                label: label.clone(),
                avg_ms: s.avg_ms(),
                min_ms: s.min_ms(),
                max_ms: s.max_ms(),
                count: s.count(),
                total_ms: s.total_ms(),
            })
            .collect()
    }

    pub fn get_report(&self) -> ProfileReport {
        let mut entries = self.get_results();
        entries.sort_by(|a, b| b.total_ms.total_cmp(&a.total_ms));
        ProfileReport { entries, gpu_timing: self.is_gpu_timing() }
    }

    /// Forget all samples and open or pending spans.
    pub fn reset(&mut self) {
        self.open.clear();
        self.pending.clear();
        self.stats.clear();
        self.ring.reset();
    }
}

impl<B: GpuBackend> Drop for Profiler<B> {
    fn drop(&mut self) {
        if let Some(query_set) = self.query_set.take() {
            self.backend.destroy_query_set(&query_set);
        }
    }
}
