//! End-to-end buffer pool behaviour against the mock device.

use std::sync::Arc;
use std::time::Duration;
use titan_gpu::{BufferHandle, BufferPool, GpuBackend, GpuError, LimitKind, MockBackend, PoolConfig};
use wgpu::BufferUsages;

const STORAGE: BufferUsages = BufferUsages::STORAGE.union(BufferUsages::COPY_DST);

fn pool(config: PoolConfig) -> (Arc<MockBackend>, BufferPool<MockBackend>) {
    let gpu = Arc::new(MockBackend::new());
    let pool = BufferPool::new(Arc::clone(&gpu), config);
    (gpu, pool)
}

// ── Reuse ────────────────────────────────────────────────────────────────────

#[test]
fn released_buffer_serves_larger_request_in_same_bucket() {
    let (gpu, mut pool) = pool(PoolConfig::default());
    let a = pool.acquire(1000, STORAGE, "a").unwrap();
    assert_eq!(a.size(), 1024);
    let raw_id = a.raw().id;
    pool.release(a);

    let b = pool.acquire(1024, STORAGE, "b").unwrap();
    assert_eq!(b.raw().id, raw_id);
    let stats = pool.stats();
    assert_eq!(stats.allocations, 1);
    assert_eq!(stats.reuses, 1);
    assert!((stats.hit_rate() - 0.5).abs() < 1e-9);
    assert_eq!(gpu.counters().buffers_created, 1);
}

#[test]
fn usage_separates_buckets() {
    let (_gpu, mut pool) = pool(PoolConfig::default());
    let a = pool.acquire(512, STORAGE, "storage").unwrap();
    pool.release(a);
    let b = pool.acquire(512, BufferUsages::UNIFORM | BufferUsages::COPY_DST, "uniform").unwrap();
    assert_eq!(pool.stats().reuses, 0);
    pool.release(b);
    assert_eq!(pool.pooled_in_bucket(STORAGE, 512), 1);
}

#[test]
fn pooling_disabled_always_allocates() {
    let config = PoolConfig { enable_pooling: false, ..PoolConfig::default() };
    let (gpu, mut pool) = pool(config);
    for _ in 0..3 {
        let h = pool.acquire(256, STORAGE, "x").unwrap();
        pool.release(h);
    }
    assert_eq!(pool.stats().reuses, 0);
    assert_eq!(gpu.counters().buffers_created, 3);
    assert_eq!(gpu.counters().live_buffers, 0);
}

// ── Caps ─────────────────────────────────────────────────────────────────────

#[test]
fn bucket_cap_destroys_overflow() {
    let config = PoolConfig { max_per_bucket: 2, ..PoolConfig::default() };
    let (gpu, mut pool) = pool(config);
    let handles: Vec<_> = (0..5).map(|_| pool.acquire(300, STORAGE, "x").unwrap()).collect();
    for h in handles {
        pool.release(h);
    }
    assert_eq!(pool.pooled_in_bucket(STORAGE, 512), 2);
    assert_eq!(pool.stats().destroyed, 3);
    assert_eq!(gpu.counters().live_buffers, 2);
}

#[test]
fn global_cap_spans_buckets() {
    let config = PoolConfig { max_per_bucket: 4, max_pooled_buffers: 4, ..PoolConfig::default() };
    let (gpu, mut pool) = pool(config);
    let handles: Vec<_> = [256u64, 512, 1024, 2048, 4096, 8192]
        .iter()
        .map(|&size| pool.acquire(size, STORAGE, "x").unwrap())
        .collect();
    for h in handles {
        pool.release(h);
    }
    assert_eq!(pool.stats().pooled, 4);
    assert_eq!(gpu.counters().live_buffers, 4);
}

#[test]
fn oversized_storage_request_names_binding_limit() {
    let (_gpu, mut pool) = pool(PoolConfig::default());
    let max = pool.backend().capabilities().limits.max_storage_buffer_binding_size;
    let err = pool.acquire(max + 1, STORAGE, "huge").unwrap_err();
    match err {
        GpuError::LimitExceeded { limit, requested, .. } => {
            assert_eq!(limit, LimitKind::MaxStorageBindingSize);
            assert_eq!(requested, max + 1);
        }
        other => panic!("unexpected error: {other}"),
    }
}

// ── Ownership ────────────────────────────────────────────────────────────────

#[test]
fn unknown_release_is_ignored() {
    let (gpu, mut pool) = pool(PoolConfig::default());
    let raw = gpu
        .create_buffer(&titan_gpu::BufferDesc { label: "foreign", size: 256, usage: STORAGE })
        .unwrap();
    pool.release(BufferHandle::adopt(raw.clone(), 256, STORAGE));
    let stats = pool.stats();
    assert_eq!(stats.releases, 0);
    assert_eq!(stats.pooled, 0);
    assert!(gpu.is_live(raw.id));
}

#[test]
fn destroy_all_frees_active_and_pooled() {
    let (gpu, mut pool) = pool(PoolConfig::default());
    let kept = pool.acquire(256, STORAGE, "kept").unwrap();
    let freed = pool.acquire(256, STORAGE, "freed").unwrap();
    pool.release(freed);
    pool.destroy_all();
    let c = gpu.counters();
    assert_eq!(c.live_buffers, 0);
    assert_eq!(c.double_destroys, 0);
    assert!(!pool.is_active(kept.id()));
}

#[test]
fn leak_report_points_at_acquire_site() {
    let config = PoolConfig { debug: true, ..PoolConfig::default() };
    let (_gpu, mut pool) = pool(config);
    let _held = pool.acquire(256, STORAGE, "held").unwrap();
    let line = line!() - 1;
    let leaks = pool.detect_leaks(Duration::ZERO);
    assert_eq!(leaks.len(), 1);
    assert_eq!(leaks[0].label, "held");
    assert_eq!(leaks[0].location.line(), line);
    assert!(leaks[0].location.file().ends_with("pool_scenarios.rs"));
}

// ── Transfers ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn upload_then_read_back() {
    let (gpu, mut pool) = pool(PoolConfig::default());
    let buf = pool.acquire(64, STORAGE | BufferUsages::COPY_SRC, "data").unwrap();
    let data: Vec<u8> = (0..64).collect();
    pool.upload_data(&buf, &data, 0).unwrap();

    let back = pool.read_buffer(&buf, 64).await.unwrap();
    assert_eq!(back, data);
    pool.release(buf);
    // staging buffer went back to the pool, not leaked
    assert_eq!(pool.stats().active, 0);
    assert_eq!(gpu.counters().submissions, 1);
}

#[test]
fn misaligned_upload_rejected() {
    let (_gpu, mut pool) = pool(PoolConfig::default());
    let buf = pool.acquire(64, STORAGE, "data").unwrap();
    assert!(pool.upload_data(&buf, &[1, 2, 3, 4], 2).is_err());
    assert!(pool.upload_data(&buf, &[0; 16], 512).is_err());
    pool.release(buf);
}

#[test]
fn with_buffer_releases_on_panic() {
    let (_gpu, mut pool) = pool(PoolConfig::default());
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        pool.with_buffer(256, STORAGE, "scoped", |_| -> titan_gpu::Result<()> { panic!("boom") })
    }));
    assert!(outcome.is_err());
    assert_eq!(pool.stats().active, 0);
    assert_eq!(pool.stats().pooled, 1);
}
