//! Per-device dispatch-shape tuning.
//!
//! [`KernelTuner`] picks a workgroup shape for each (kernel kind, input
//! shape) pair and remembers it. Matmul shapes are found by benchmarking
//! every viable candidate on the live device; the other kinds use
//! closed-form choices from the device limits. Results are namespaced by
//! the adapter signature and persisted through a [`TuneStore`], so a
//! second run on the same machine starts warm.

pub mod cache;
pub mod heuristics;
pub mod matmul;

pub use cache::{
    CACHE_FORMAT_VERSION, FileTuneStore, MemoryTuneStore, TuneCache, TuneMethod, TuneRecord,
    TuneStore, cache_key,
};

use crate::backend::GpuBackend;
use crate::config::TunerConfig;
use crate::error::Result;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Kernel families the tuner knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KernelKind {
    Matmul,
    Attention,
    Softmax,
    RmsNorm,
    Dequant,
}

impl KernelKind {
    pub const ALL: [KernelKind; 5] =
        [Self::Matmul, Self::Attention, Self::Softmax, Self::RmsNorm, Self::Dequant];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Matmul => "matmul",
            Self::Attention => "attention",
            Self::Softmax => "softmax",
            Self::RmsNorm => "rmsnorm",
            Self::Dequant => "dequant",
        }
    }

    /// Whether the tuner benchmarks this kind rather than using a heuristic.
    pub fn is_searched(self) -> bool {
        matches!(self, Self::Matmul)
    }
}

impl fmt::Display for KernelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kernel name that is not a [`KernelKind`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown kernel kind '{0}'")]
pub struct UnknownKernelKind(pub String);

impl FromStr for KernelKind {
    type Err = UnknownKernelKind;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "matmul" | "gemm" => Ok(Self::Matmul),
            "attention" | "attn" => Ok(Self::Attention),
            "softmax" => Ok(Self::Softmax),
            "rmsnorm" | "rms_norm" => Ok(Self::RmsNorm),
            "dequant" | "dequantize" => Ok(Self::Dequant),
            _ => Err(UnknownKernelKind(s.to_string())),
        }
    }
}

/// Per-call tuning options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TuneOptions {
    /// Ignore any cached record and tune again.
    pub force_retune: bool,
    pub warmup_iterations: u32,
    pub timed_iterations: u32,
}

impl Default for TuneOptions {
    fn default() -> Self {
        Self { force_retune: false, warmup_iterations: 3, timed_iterations: 10 }
    }
}

impl From<&TunerConfig> for TuneOptions {
    fn from(config: &TunerConfig) -> Self {
        Self {
            force_retune: false,
            warmup_iterations: config.warmup_iterations,
            timed_iterations: config.timed_iterations,
        }
    }
}

/// Tunes and caches dispatch shapes for one device.
pub struct KernelTuner<B: GpuBackend, S: TuneStore> {
    backend: Arc<B>,
    store: S,
    namespace: String,
    cache: TuneCache,
    defaults: TuneOptions,
}

impl<B: GpuBackend, S: TuneStore> KernelTuner<B, S> {
    /// Load any cached results for this device from `store`. A missing or
    /// unreadable store starts an empty cache.
    pub fn new(backend: Arc<B>, store: S, config: &TunerConfig) -> Self {
        let namespace = backend.capabilities().adapter.sanitized();
        let cache = match store.load(&namespace) {
            Ok(Some(json)) => TuneCache::from_json(&json, &namespace, config.max_cache_entries),
            Ok(None) => TuneCache::new(&namespace, config.max_cache_entries),
            Err(e) => {
                warn!(error = %e, "tune cache unreadable, starting fresh");
                TuneCache::new(&namespace, config.max_cache_entries)
            }
        };
        info!(device = %namespace, cached = cache.len(), "kernel tuner ready");
        Self { backend, store, namespace, cache, defaults: TuneOptions::from(config) }
    }

    /// Sanitized device signature used as the store namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Options built from the tuner configuration.
    pub fn default_options(&self) -> TuneOptions {
        self.defaults.clone()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Best dispatch shape for `kind` on inputs of `input_sizes`.
    ///
    /// Returns the cached record unless `options.force_retune` is set.
    pub async fn tune_kernel(
        &mut self,
        kind: KernelKind,
        input_sizes: &BTreeMap<String, u32>,
        options: &TuneOptions,
    ) -> Result<TuneRecord> {
        let key = cache_key(kind, input_sizes);
        if !options.force_retune {
            if let Some(record) = self.cache.get(&key) {
                debug!(%key, "tune cache hit");
                return Ok(record.clone());
            }
        }
        self.backend.ensure_live()?;

        let record = if kind.is_searched() {
            let shape = matmul::MatmulShape::from_sizes(input_sizes)?;
            let best = matmul::search(self.backend.as_ref(), shape, options).await?;
            TuneRecord {
                workgroup_size: best.workgroup_size,
                throughput_gflops: best.throughput_gflops,
                time_ms: best.time_ms,
                device_signature: self.namespace.clone(),
                method: TuneMethod::Benchmark,
                seq: 0,
            }
        } else {
            TuneRecord {
                workgroup_size: heuristics::workgroup_for(
                    kind,
                    input_sizes,
                    self.backend.capabilities(),
                ),
                throughput_gflops: 0.0,
                time_ms: 0.0,
                device_signature: self.namespace.clone(),
                method: TuneMethod::Heuristic,
                seq: 0,
            }
        };
        info!(%key, workgroup = ?record.workgroup_size, method = ?record.method, "tuned kernel");

        let record = self.cache.insert(key, record);
        self.persist();
        Ok(record)
    }

    pub fn get_cached_result(
        &self,
        kind: KernelKind,
        input_sizes: &BTreeMap<String, u32>,
    ) -> Option<&TuneRecord> {
        self.cache.get(&cache_key(kind, input_sizes))
    }

    /// Drop every cached record, in memory and in the store.
    pub fn clear_cache(&mut self) {
        self.cache.clear();
        self.persist();
    }

    pub fn get_all_cached_results(&self) -> &BTreeMap<String, TuneRecord> {
        self.cache.entries()
    }

    /// Store failures are logged; tuning results stay usable in memory.
    fn persist(&self) {
        let saved = self.cache.to_json().and_then(|json| self.store.save(&self.namespace, &json));
        if let Err(e) = saved {
            warn!(device = %self.namespace, error = %e, "failed to persist tune cache");
        }
    }
}

impl<B: GpuBackend> KernelTuner<B, Box<dyn TuneStore>> {
    /// Tuner persisting under `config.cache_dir`, or in memory when unset.
    pub fn from_config(backend: Arc<B>, config: &TunerConfig) -> Self {
        let store: Box<dyn TuneStore> = match &config.cache_dir {
            Some(dir) => Box::new(FileTuneStore::new(dir.clone())),
            None => Box::new(MemoryTuneStore::new()),
        };
        Self::new(backend, store, config)
    }
}
