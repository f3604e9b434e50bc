//! Buffer handles and size bucketing.

use crate::backend::GpuBackend;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Allocation granularity for pooled buffers, in bytes.
pub const BUFFER_ALIGNMENT: u64 = 256;

/// Round `value` up to the next multiple of `alignment`, saturating.
pub fn align_up(value: u64, alignment: u64) -> u64 {
    value.checked_next_multiple_of(alignment).unwrap_or(u64::MAX)
}

/// Pool bucket for a request of `size` bytes under a device `ceiling`.
///
/// The bucket is `size` rounded up to [`BUFFER_ALIGNMENT`] and then to the
/// next power of two (minimum 256). When that power of two would exceed
/// `ceiling`, the aligned size is used as-is. The result may still exceed
/// `ceiling`; callers reject that case.
pub fn bucket_size(size: u64, ceiling: u64) -> u64 {
    let aligned = align_up(size, BUFFER_ALIGNMENT);
    let bucket = aligned.checked_next_power_of_two().unwrap_or(u64::MAX).max(BUFFER_ALIGNMENT);
    if bucket > ceiling { aligned.max(BUFFER_ALIGNMENT) } else { bucket }
}

/// Process-unique buffer identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// Owned device buffer.
///
/// Not `Clone`: exactly one owner (caller, pool free-list or command batch)
/// holds a handle at a time, and giving it back consumes it.
pub struct BufferHandle<B: GpuBackend> {
    id: BufferId,
    raw: B::Buffer,
    size: u64,
    usage: wgpu::BufferUsages,
}

impl<B: GpuBackend> BufferHandle<B> {
    /// Wrap a buffer created directly on the backend.
    pub fn adopt(raw: B::Buffer, size: u64, usage: wgpu::BufferUsages) -> Self {
        Self { id: BufferId::next(), raw, size, usage }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Underlying device buffer, for binding and copies.
    pub fn raw(&self) -> &B::Buffer {
        &self.raw
    }

    /// Allocated size in bytes (the bucket, not the requested size).
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> wgpu::BufferUsages {
        self.usage
    }
}

impl<B: GpuBackend> fmt::Debug for BufferHandle<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHandle")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("usage", &self.usage)
            .finish()
    }
}

/// Element type carried by a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dtype {
    F32,
    F16,
    U32,
    I32,
    I8,
    U8,
}

impl Dtype {
    pub fn size_bytes(self) -> usize {
        match self {
            Self::F32 | Self::U32 | Self::I32 => 4,
            Self::F16 => 2,
            Self::I8 | Self::U8 => 1,
        }
    }
}

/// Out-of-band dtype annotations keyed by [`BufferId`].
///
/// The pool never reads or clears these; a tag outlives reuse of the
/// underlying buffer unless the owner removes it.
#[derive(Debug, Default)]
pub struct DtypeTags {
    tags: HashMap<BufferId, Dtype>,
}

impl DtypeTags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tag(&mut self, id: BufferId, dtype: Dtype) -> Option<Dtype> {
        self.tags.insert(id, dtype)
    }

    pub fn get(&self, id: BufferId) -> Option<Dtype> {
        self.tags.get(&id).copied()
    }

    pub fn untag(&mut self, id: BufferId) -> Option<Dtype> {
        self.tags.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}
