//! Runtime configuration for the GPU resource layer.
//!
//! Loads [`RuntimeConfig`] from a TOML file (`titan-gpu.toml`) with
//! environment variable overrides via `TITAN_GPU_*` prefixed variables.
//! Every section and field has a default, so a partial file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Buffer pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Keep released buffers for reuse. When off, release destroys.
    /// Override: `TITAN_GPU_POOLING`
    pub enable_pooling: bool,

    /// Maximum free buffers retained per (usage, bucket).
    /// Override: `TITAN_GPU_MAX_PER_BUCKET`
    pub max_per_bucket: usize,

    /// Maximum free buffers retained across all buckets.
    /// Override: `TITAN_GPU_MAX_POOLED`
    pub max_pooled_buffers: usize,

    /// Record per-buffer acquisition metadata for leak detection.
    /// Override: `TITAN_GPU_DEBUG`
    pub debug: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { enable_pooling: true, max_per_bucket: 8, max_pooled_buffers: 64, debug: false }
    }
}

/// Timestamp profiling settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilingConfig {
    /// Attach timestamp queries to recorded compute passes.
    /// Override: `TITAN_GPU_PROFILING`
    pub enabled: bool,
}

impl Default for ProfilingConfig {
    fn default() -> Self {
        Self { enabled: false }
    }
}

/// Kernel auto-tuner settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerConfig {
    /// Untimed dispatches per candidate before measuring.
    /// Override: `TITAN_GPU_TUNE_WARMUP`
    pub warmup_iterations: u32,

    /// Timed dispatches per candidate.
    /// Override: `TITAN_GPU_TUNE_ITERATIONS`
    pub timed_iterations: u32,

    /// Directory for persisted tuning results (`None` = in-memory only).
    /// Override: `TITAN_GPU_TUNE_CACHE_DIR`
    pub cache_dir: Option<PathBuf>,

    /// Maximum cached tune records per device; oldest evicted first.
    /// Override: `TITAN_GPU_TUNE_MAX_ENTRIES`
    pub max_cache_entries: usize,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self { warmup_iterations: 3, timed_iterations: 10, cache_dir: None, max_cache_entries: 512 }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub pool: PoolConfig,
    pub profiling: ProfilingConfig,
    pub tuner: TunerConfig,
}

/// Errors that can occur when loading or validating a [`RuntimeConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid environment override {key}={value}: {reason}")]
    EnvOverride { key: String, value: String, reason: String },
}

impl RuntimeConfig {
    /// Render the default configuration as TOML.
    pub fn default_toml() -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&Self::default())?)
    }

    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load from a TOML string, then apply environment overrides.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut cfg: RuntimeConfig = toml::from_str(toml_str)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.max_per_bucket == 0 {
            return Err(ConfigError::Validation("pool.max_per_bucket must be > 0".into()));
        }
        if self.pool.max_pooled_buffers < self.pool.max_per_bucket {
            return Err(ConfigError::Validation(format!(
                "pool.max_pooled_buffers ({}) must be >= pool.max_per_bucket ({})",
                self.pool.max_pooled_buffers, self.pool.max_per_bucket
            )));
        }
        if self.tuner.timed_iterations == 0 {
            return Err(ConfigError::Validation("tuner.timed_iterations must be > 0".into()));
        }
        if self.tuner.max_cache_entries == 0 {
            return Err(ConfigError::Validation("tuner.max_cache_entries must be > 0".into()));
        }
        Ok(())
    }

    /// Apply `TITAN_GPU_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("TITAN_GPU_POOLING") {
            self.pool.enable_pooling = parse_bool("TITAN_GPU_POOLING", &val)?;
        }
        if let Ok(val) = std::env::var("TITAN_GPU_MAX_PER_BUCKET") {
            self.pool.max_per_bucket = parse_num("TITAN_GPU_MAX_PER_BUCKET", &val)?;
        }
        if let Ok(val) = std::env::var("TITAN_GPU_MAX_POOLED") {
            self.pool.max_pooled_buffers = parse_num("TITAN_GPU_MAX_POOLED", &val)?;
        }
        if let Ok(val) = std::env::var("TITAN_GPU_DEBUG") {
            self.pool.debug = parse_bool("TITAN_GPU_DEBUG", &val)?;
        }
        if let Ok(val) = std::env::var("TITAN_GPU_PROFILING") {
            self.profiling.enabled = parse_bool("TITAN_GPU_PROFILING", &val)?;
        }
        if let Ok(val) = std::env::var("TITAN_GPU_TUNE_WARMUP") {
            self.tuner.warmup_iterations = parse_num("TITAN_GPU_TUNE_WARMUP", &val)?;
        }
        if let Ok(val) = std::env::var("TITAN_GPU_TUNE_ITERATIONS") {
            self.tuner.timed_iterations = parse_num("TITAN_GPU_TUNE_ITERATIONS", &val)?;
        }
        if let Ok(val) = std::env::var("TITAN_GPU_TUNE_CACHE_DIR") {
            self.tuner.cache_dir = if val.is_empty() { None } else { Some(PathBuf::from(val)) };
        }
        if let Ok(val) = std::env::var("TITAN_GPU_TUNE_MAX_ENTRIES") {
            self.tuner.max_cache_entries = parse_num("TITAN_GPU_TUNE_MAX_ENTRIES", &val)?;
        }
        Ok(())
    }
}

fn parse_bool(key: &str, val: &str) -> Result<bool, ConfigError> {
    match val.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::EnvOverride {
            key: key.into(),
            value: val.into(),
            reason: "expected a boolean (1/0, true/false, yes/no, on/off)".into(),
        }),
    }
}

fn parse_num<T>(key: &str, val: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    val.parse::<T>().map_err(|e| ConfigError::EnvOverride {
        key: key.into(),
        value: val.into(),
        reason: e.to_string(),
    })
}
