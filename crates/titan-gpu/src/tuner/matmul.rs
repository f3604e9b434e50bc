//! Empirical workgroup search for matrix multiplication.

use super::TuneOptions;
use crate::backend::{BufferDesc, GpuBackend};
use crate::capabilities::DeviceLimits;
use crate::dispatch::DispatchConfig;
use crate::error::{GpuError, LimitKind, Result};
use bytemuck::{Pod, Zeroable};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info, warn};

const MATMUL_TUNE_WGSL: &str = include_str!("shaders/matmul_tune.wgsl");

/// Per-axis workgroup sizes considered.
pub const CANDIDATE_SIDES: [u32; 7] = [4, 8, 16, 32, 64, 128, 256];

/// Smallest workgroup worth benchmarking.
pub const MIN_INVOCATIONS: u32 = 64;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct MatmulParams {
    m: u32,
    n: u32,
    k: u32,
    _pad: u32,
}

/// Problem size of one tuning run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatmulShape {
    pub m: u32,
    pub n: u32,
    pub k: u32,
}

impl MatmulShape {
    /// Read `m`, `n` and `k` from the input-size map.
    pub fn from_sizes(input_sizes: &BTreeMap<String, u32>) -> Result<Self> {
        let get = |key: &str| match input_sizes.get(key) {
            Some(&v) if v > 0 => Ok(v),
            Some(_) => Err(GpuError::InvalidDimensions(format!("matmul '{key}' must be > 0"))),
            None => Err(GpuError::InvalidDimensions(format!("matmul requires '{key}'"))),
        };
        Ok(Self { m: get("m")?, n: get("n")?, k: get("k")? })
    }

    pub fn flops(&self) -> f64 {
        2.0 * f64::from(self.m) * f64::from(self.n) * f64::from(self.k)
    }
}

/// GFLOP/s achieved by `shape` in `time_ms`.
pub fn gflops(shape: MatmulShape, time_ms: f64) -> f64 {
    if time_ms > 0.0 { shape.flops() / (time_ms * 1e6) } else { 0.0 }
}

/// 2-D workgroup shapes that fit `limits` and have at least
/// [`MIN_INVOCATIONS`] invocations.
pub fn candidates(limits: &DeviceLimits) -> Vec<[u32; 3]> {
    let mut out = Vec::new();
    for &x in CANDIDATE_SIDES.iter().filter(|&&x| x <= limits.max_workgroup_size_x) {
        for &y in CANDIDATE_SIDES.iter().filter(|&&y| y <= limits.max_workgroup_size_y) {
            let invocations = x * y;
            if (MIN_INVOCATIONS..=limits.max_invocations_per_workgroup).contains(&invocations) {
                out.push([x, y, 1]);
            }
        }
    }
    out
}

/// WGSL for one candidate shape.
pub fn shader_source(workgroup: [u32; 3]) -> String {
    MATMUL_TUNE_WGSL
        .replace("WG_X", &workgroup[0].to_string())
        .replace("WG_Y", &workgroup[1].to_string())
}

/// Best candidate found by [`search`].
#[derive(Debug, Clone, PartialEq)]
pub struct Measured {
    pub workgroup_size: [u32; 3],
    pub time_ms: f64,
    pub throughput_gflops: f64,
}

struct Operands<B: GpuBackend> {
    a: B::Buffer,
    b: B::Buffer,
    c: B::Buffer,
    params: B::Buffer,
}

impl<B: GpuBackend> Operands<B> {
    fn create(backend: &B, shape: MatmulShape) -> Result<Self> {
        let max = backend.capabilities().limits.max_storage_buffer_binding_size;
        let f32_bytes = |rows: u32, cols: u32| u64::from(rows) * u64::from(cols) * 4;
        let storage = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST;

        let sizes = [
            ("tune-a", f32_bytes(shape.m, shape.k)),
            ("tune-b", f32_bytes(shape.k, shape.n)),
            ("tune-c", f32_bytes(shape.m, shape.n)),
        ];
        if let Some(&(_, requested)) = sizes.iter().find(|(_, size)| *size > max) {
            return Err(GpuError::LimitExceeded {
                limit: LimitKind::MaxStorageBindingSize,
                requested,
                max,
            });
        }

        let mut created: Vec<B::Buffer> = Vec::with_capacity(4);
        let descs = sizes
            .iter()
            .map(|&(label, size)| BufferDesc { label, size, usage: storage })
            .chain(std::iter::once(BufferDesc {
                label: "tune-params",
                size: std::mem::size_of::<MatmulParams>() as u64,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            }));
        for desc in descs {
            match backend.create_buffer(&desc) {
                Ok(buf) => created.push(buf),
                Err(e) => {
                    for buf in &created {
                        backend.destroy_buffer(buf);
                    }
                    return Err(e);
                }
            }
        }

        let mut it = created.into_iter();
        let (Some(a), Some(b), Some(c), Some(params)) = (it.next(), it.next(), it.next(), it.next())
        else {
            return Err(GpuError::BufferCreation("tuning operands".into()));
        };
        let ops = Self { a, b, c, params };
        let uniform = MatmulParams { m: shape.m, n: shape.n, k: shape.k, _pad: 0 };
        if let Err(e) = backend.write_buffer(&ops.params, 0, bytemuck::bytes_of(&uniform)) {
            ops.destroy(backend);
            return Err(e);
        }
        Ok(ops)
    }

    fn destroy(&self, backend: &B) {
        for buf in [&self.a, &self.b, &self.c, &self.params] {
            backend.destroy_buffer(buf);
        }
    }
}

fn encode_runs<B: GpuBackend>(
    backend: &B,
    pipeline: &B::Pipeline,
    ops: &Operands<B>,
    dispatch: DispatchConfig,
    runs: u32,
) -> Result<()> {
    let mut encoder = backend.create_encoder("matmul-tune")?;
    for _ in 0..runs {
        let mut pass = backend.begin_compute_pass(&mut encoder, "matmul-tune", None);
        backend.dispatch(&mut pass, pipeline, &[&ops.a, &ops.b, &ops.c, &ops.params], dispatch.dispatch_size);
        backend.end_compute_pass(pass);
    }
    backend.submit(backend.finish(encoder))
}

/// [`encode_runs`] inside a validation scope, so a rejected dispatch or
/// submission comes back as an error instead of reaching the device's
/// uncaptured-error handler.
async fn run_scoped<B: GpuBackend>(
    backend: &B,
    pipeline: &B::Pipeline,
    ops: &Operands<B>,
    dispatch: DispatchConfig,
    runs: u32,
) -> Result<()> {
    backend.push_error_scope();
    let submitted = encode_runs(backend, pipeline, ops, dispatch, runs);
    let captured = backend.pop_error_scope().await;
    submitted.and(captured)
}

async fn bench_candidate<B: GpuBackend>(
    backend: &B,
    ops: &Operands<B>,
    shape: MatmulShape,
    workgroup: [u32; 3],
    options: &TuneOptions,
) -> Result<f64> {
    let dispatch = DispatchConfig::cover(workgroup, [shape.n, shape.m, 1]);
    if !dispatch.within_limits() {
        return Err(GpuError::InvalidDimensions(format!("{dispatch} exceeds grid limit")));
    }
    let label = format!("tune_matmul_{}x{}", workgroup[0], workgroup[1]);
    let pipeline = backend.compile_pipeline(&label, &shader_source(workgroup), "main").await?;

    if options.warmup_iterations > 0 {
        run_scoped(backend, &pipeline, ops, dispatch, options.warmup_iterations).await?;
        backend.wait_idle().await?;
    }

    let iterations = options.timed_iterations.max(1);
    let start = Instant::now();
    run_scoped(backend, &pipeline, ops, dispatch, iterations).await?;
    backend.wait_idle().await?;
    Ok(start.elapsed().as_secs_f64() * 1e3 / f64::from(iterations))
}

/// Benchmark every candidate and return the fastest. Candidates that fail
/// to compile or run are skipped.
pub async fn search<B: GpuBackend>(
    backend: &B,
    shape: MatmulShape,
    options: &TuneOptions,
) -> Result<Measured> {
    let shapes = candidates(&backend.capabilities().limits);
    info!(
        m = shape.m,
        n = shape.n,
        k = shape.k,
        candidates = shapes.len(),
        warmup = options.warmup_iterations,
        iterations = options.timed_iterations,
        "tuning matmul"
    );

    let ops = Operands::create(backend, shape)?;
    let mut best: Option<Measured> = None;
    let mut failures = 0usize;
    for workgroup in &shapes {
        match bench_candidate(backend, &ops, shape, *workgroup, options).await {
            Ok(time_ms) => {
                let throughput_gflops = gflops(shape, time_ms);
                debug!(?workgroup, time_ms, throughput_gflops, "matmul candidate");
                if best.as_ref().is_none_or(|b| time_ms < b.time_ms) {
                    best = Some(Measured { workgroup_size: *workgroup, time_ms, throughput_gflops });
                }
            }
            Err(e) => {
                failures += 1;
                warn!(?workgroup, error = %e, "skipping matmul candidate");
            }
        }
    }
    ops.destroy(backend);

    best.ok_or_else(|| GpuError::TuningFailed {
        kernel: "matmul".into(),
        reason: format!("{failures} of {} candidates failed", shapes.len()),
    })
}
