//! Tune result cache and its persistence.

use super::KernelKind;
use crate::dispatch::DispatchConfig;
use crate::error::{GpuError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Schema version of the persisted envelope.
pub const CACHE_FORMAT_VERSION: u32 = 1;

/// How a record was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TuneMethod {
    /// Empirical search on the device.
    Benchmark,
    /// Closed-form choice from device limits.
    Heuristic,
}

/// Winning dispatch shape for one kernel and input shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuneRecord {
    pub workgroup_size: [u32; 3],
    /// Zero for heuristic records.
    pub throughput_gflops: f64,
    /// Average time per dispatch; zero for heuristic records.
    pub time_ms: f64,
    pub device_signature: String,
    pub method: TuneMethod,
    /// Insertion order, used for eviction.
    #[serde(default)]
    pub seq: u64,
}

impl TuneRecord {
    /// Grid for a problem of `extents` invocations with this record's shape.
    pub fn dispatch_for(&self, extents: [u32; 3]) -> DispatchConfig {
        DispatchConfig::cover(self.workgroup_size, extents)
    }
}

/// Cache key: kernel kind plus the JSON of the sorted input-size map.
pub fn cache_key(kind: KernelKind, input_sizes: &BTreeMap<String, u32>) -> String {
    // a BTreeMap<String, u32> always serializes
    let shape = serde_json::to_string(input_sizes).unwrap_or_default();
    format!("{kind}_{shape}")
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    device_signature: String,
    entries: BTreeMap<String, TuneRecord>,
}

/// In-memory records for one device, bounded to `max_entries`.
#[derive(Debug, Clone)]
pub struct TuneCache {
    device_signature: String,
    entries: BTreeMap<String, TuneRecord>,
    next_seq: u64,
    max_entries: usize,
}

impl TuneCache {
    pub fn new(device_signature: impl Into<String>, max_entries: usize) -> Self {
        Self {
            device_signature: device_signature.into(),
            entries: BTreeMap::new(),
            next_seq: 0,
            max_entries: max_entries.max(1),
        }
    }

    /// Parse a persisted envelope, returning an empty cache if it is
    /// corrupt, from another format version, or from another device.
    pub fn from_json(json: &str, device_signature: &str, max_entries: usize) -> Self {
        let mut cache = Self::new(device_signature, max_entries);
        let envelope: Envelope = match serde_json::from_str(json) {
            Ok(env) => env,
            Err(e) => {
                warn!(error = %e, "corrupt tune cache, starting fresh");
                return cache;
            }
        };
        if envelope.version != CACHE_FORMAT_VERSION {
            warn!(
                found = envelope.version,
                expected = CACHE_FORMAT_VERSION,
                "tune cache format mismatch, discarding"
            );
            return cache;
        }
        if envelope.device_signature != device_signature {
            warn!(found = %envelope.device_signature, "tune cache belongs to another device, discarding");
            return cache;
        }
        cache.next_seq = envelope.entries.values().map(|r| r.seq + 1).max().unwrap_or(0);
        cache.entries = envelope.entries;
        cache.evict();
        debug!(entries = cache.entries.len(), "loaded tune cache");
        cache
    }

    pub fn to_json(&self) -> Result<String> {
        let envelope = Envelope {
            version: CACHE_FORMAT_VERSION,
            device_signature: self.device_signature.clone(),
            entries: self.entries.clone(),
        };
        serde_json::to_string_pretty(&envelope).map_err(|e| GpuError::Store(e.to_string()))
    }

    pub fn get(&self, key: &str) -> Option<&TuneRecord> {
        self.entries.get(key)
    }

    /// Insert `record` under `key`, stamping its sequence number, and
    /// evict the oldest entries beyond the cap.
    pub fn insert(&mut self, key: String, mut record: TuneRecord) -> TuneRecord {
        record.seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(key, record.clone());
        self.evict();
        record
    }

    fn evict(&mut self) {
        while self.entries.len() > self.max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, r)| r.seq)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => {
                    debug!(%key, "evicting tune record");
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }

    pub fn entries(&self) -> &BTreeMap<String, TuneRecord> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Durable keyed storage for serialized tune caches.
pub trait TuneStore {
    /// Contents stored under `namespace`, or `None` if nothing is stored.
    fn load(&self, namespace: &str) -> Result<Option<String>>;

    fn save(&self, namespace: &str, contents: &str) -> Result<()>;
}

impl<S: TuneStore + ?Sized> TuneStore for Box<S> {
    fn load(&self, namespace: &str) -> Result<Option<String>> {
        (**self).load(namespace)
    }

    fn save(&self, namespace: &str, contents: &str) -> Result<()> {
        (**self).save(namespace, contents)
    }
}

/// One JSON file per namespace inside a directory.
#[derive(Debug, Clone)]
pub struct FileTuneStore {
    dir: PathBuf,
}

impl FileTuneStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, namespace: &str) -> PathBuf {
        self.dir.join(format!("{namespace}.json"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl TuneStore for FileTuneStore {
    fn load(&self, namespace: &str) -> Result<Option<String>> {
        let path = self.path_for(namespace);
        match std::fs::read_to_string(&path) {
            Ok(json) => Ok(Some(json)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no tune cache, starting fresh");
                Ok(None)
            }
            Err(e) => Err(GpuError::Store(format!("{}: {e}", path.display()))),
        }
    }

    fn save(&self, namespace: &str, contents: &str) -> Result<()> {
        let path = self.path_for(namespace);
        std::fs::create_dir_all(&self.dir)
            .and_then(|()| std::fs::write(&path, contents))
            .map_err(|e| GpuError::Store(format!("{}: {e}", path.display())))?;
        info!(path = %path.display(), "saved tune cache");
        Ok(())
    }
}

/// Process-local store. Clones share contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryTuneStore {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryTuneStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, namespace: &str) -> Option<String> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).get(namespace).cloned()
    }
}

impl TuneStore for MemoryTuneStore {
    fn load(&self, namespace: &str) -> Result<Option<String>> {
        Ok(self.get(namespace))
    }

    fn save(&self, namespace: &str, contents: &str) -> Result<()> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(namespace.to_string(), contents.to_string());
        Ok(())
    }
}
