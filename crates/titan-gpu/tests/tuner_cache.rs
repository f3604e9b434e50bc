//! Tune cache persistence across tuner instances.

use std::collections::BTreeMap;
use std::sync::Arc;
use titan_gpu::tuner::CACHE_FORMAT_VERSION;
use titan_gpu::{
    DeviceCapabilities, FileTuneStore, KernelKind, KernelTuner, MockBackend, TuneMethod,
    TuneOptions, TunerConfig,
};

fn sizes(pairs: &[(&str, u32)]) -> BTreeMap<String, u32> {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

fn fast() -> TuneOptions {
    TuneOptions { warmup_iterations: 1, timed_iterations: 1, ..TuneOptions::default() }
}

#[tokio::test]
async fn second_tuner_reads_first_tuners_results() {
    let dir = tempfile::tempdir().unwrap();
    let gpu = Arc::new(MockBackend::new());
    let input = sizes(&[("m", 64), ("n", 64), ("k", 64)]);

    let mut first =
        KernelTuner::new(Arc::clone(&gpu), FileTuneStore::new(dir.path()), &TunerConfig::default());
    let tuned = first.tune_kernel(KernelKind::Matmul, &input, &fast()).await.unwrap();
    assert_eq!(tuned.method, TuneMethod::Benchmark);
    let compiled = gpu.counters().pipelines_compiled;
    assert!(compiled > 0);

    let path = first.store().path_for(first.namespace());
    assert!(path.exists());
    let on_disk: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(on_disk["version"], CACHE_FORMAT_VERSION);

    let mut second =
        KernelTuner::new(Arc::clone(&gpu), FileTuneStore::new(dir.path()), &TunerConfig::default());
    let cached = second.tune_kernel(KernelKind::Matmul, &input, &fast()).await.unwrap();
    assert_eq!(cached.workgroup_size, tuned.workgroup_size);
    assert_eq!(gpu.counters().pipelines_compiled, compiled);
}

#[tokio::test]
async fn repeat_tune_on_one_tuner_returns_cached_record() {
    let dir = tempfile::tempdir().unwrap();
    let gpu = Arc::new(MockBackend::new());
    let input = sizes(&[("m", 32), ("n", 48), ("k", 16)]);
    let mut tuner =
        KernelTuner::new(Arc::clone(&gpu), FileTuneStore::new(dir.path()), &TunerConfig::default());

    let first = tuner.tune_kernel(KernelKind::Matmul, &input, &fast()).await.unwrap();
    let compiled = gpu.counters().pipelines_compiled;
    let submissions = gpu.counters().submissions;

    let second = tuner.tune_kernel(KernelKind::Matmul, &input, &fast()).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(gpu.counters().pipelines_compiled, compiled);
    assert_eq!(gpu.counters().submissions, submissions);
    assert_eq!(tuner.get_all_cached_results().len(), 1);
}

#[test]
fn corrupt_cache_file_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let gpu = Arc::new(MockBackend::new());
    let store = FileTuneStore::new(dir.path());
    let namespace = DeviceCapabilities::mock().adapter.sanitized();
    std::fs::write(store.path_for(&namespace), "{ truncated").unwrap();

    let tuner = KernelTuner::new(gpu, store, &TunerConfig::default());
    assert!(tuner.get_all_cached_results().is_empty());
}

#[tokio::test]
async fn corrupt_cache_is_overwritten_on_next_tune() {
    let dir = tempfile::tempdir().unwrap();
    let gpu = Arc::new(MockBackend::new());
    let store = FileTuneStore::new(dir.path());
    let namespace = DeviceCapabilities::mock().adapter.sanitized();
    std::fs::write(store.path_for(&namespace), "not json at all").unwrap();

    let mut tuner = KernelTuner::new(Arc::clone(&gpu), store, &TunerConfig::default());
    tuner
        .tune_kernel(KernelKind::RmsNorm, &sizes(&[("hidden", 2048)]), &TuneOptions::default())
        .await
        .unwrap();

    let reloaded = KernelTuner::new(gpu, FileTuneStore::new(dir.path()), &TunerConfig::default());
    let record = reloaded
        .get_cached_result(KernelKind::RmsNorm, &sizes(&[("hidden", 2048)]))
        .unwrap();
    assert_eq!(record.workgroup_size, [256, 1, 1]);
}

#[tokio::test]
async fn unwritable_store_keeps_results_in_memory() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("file");
    std::fs::write(&blocker, b"").unwrap();
    // a directory path that runs through a regular file cannot be created
    let store = FileTuneStore::new(blocker.join("cache"));

    let gpu = Arc::new(MockBackend::new());
    let mut tuner = KernelTuner::new(gpu, store, &TunerConfig::default());
    let input = sizes(&[("n", 1 << 20)]);
    tuner.tune_kernel(KernelKind::Dequant, &input, &TuneOptions::default()).await.unwrap();
    assert!(tuner.get_cached_result(KernelKind::Dequant, &input).is_some());
}

#[tokio::test]
async fn force_retune_rewrites_entry() {
    let dir = tempfile::tempdir().unwrap();
    let gpu = Arc::new(MockBackend::new());
    let input = sizes(&[("m", 16), ("n", 16), ("k", 16)]);
    let mut tuner =
        KernelTuner::new(Arc::clone(&gpu), FileTuneStore::new(dir.path()), &TunerConfig::default());

    let first = tuner.tune_kernel(KernelKind::Matmul, &input, &fast()).await.unwrap();
    let forced = TuneOptions { force_retune: true, ..fast() };
    let second = tuner.tune_kernel(KernelKind::Matmul, &input, &forced).await.unwrap();
    assert!(second.seq > first.seq);

    let reloaded = KernelTuner::new(gpu, FileTuneStore::new(dir.path()), &TunerConfig::default());
    let stored = reloaded.get_cached_result(KernelKind::Matmul, &input).unwrap();
    assert_eq!(stored.seq, second.seq);
}
