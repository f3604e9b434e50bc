//! Timestamp query slots and tick conversion shared by the recorder and
//! the profiler.

/// Slots in a timestamp query set (256 begin/end pairs).
pub const QUERY_CAPACITY: u32 = 512;

/// Durations above this are treated as counter garbage.
pub const MAX_PLAUSIBLE_MS: f64 = 60_000.0;

/// Bytes per resolved timestamp.
pub const TIMESTAMP_SIZE: u64 = std::mem::size_of::<u64>() as u64;

/// Convert a raw tick pair into milliseconds.
///
/// Returns `None` for negative, non-finite or implausibly long durations.
pub fn ticks_to_ms(start: u64, end: u64, period_ns: f32) -> Option<f64> {
    let ticks = end as f64 - start as f64;
    let ms = ticks * f64::from(period_ns) / 1e6;
    (ms.is_finite() && (0.0..=MAX_PLAUSIBLE_MS).contains(&ms)).then_some(ms)
}

/// Decode resolved little-endian u64 timestamps.
pub fn decode_timestamps(bytes: &[u8]) -> Vec<u64> {
    bytes
        .chunks_exact(TIMESTAMP_SIZE as usize)
        .map(|chunk| u64::from_le(bytemuck::pod_read_unaligned(chunk)))
        .collect()
}

/// Allocator for begin/end slot pairs within one query set.
#[derive(Debug, Clone)]
pub struct QueryRing {
    capacity: u32,
    next: u32,
}

impl Default for QueryRing {
    fn default() -> Self {
        Self::new(QUERY_CAPACITY)
    }
}

impl QueryRing {
    /// `capacity` is rounded down to an even number of slots.
    pub fn new(capacity: u32) -> Self {
        Self { capacity: capacity & !1, next: 0 }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Slots handed out since the last reset (or wrap).
    pub fn used(&self) -> u32 {
        self.next
    }

    /// Reserve the next pair, or `None` once the ring is full.
    pub fn reserve(&mut self) -> Option<(u32, u32)> {
        if self.next + 2 > self.capacity {
            return None;
        }
        let begin = self.next;
        self.next += 2;
        Some((begin, begin + 1))
    }

    /// Reserve the next pair, wrapping to slot zero when full. The flag is
    /// `true` when this reservation wrapped.
    pub fn reserve_wrapping(&mut self) -> ((u32, u32), bool) {
        match self.reserve() {
            Some(pair) => (pair, false),
            None => {
                self.next = 0;
                (self.reserve().unwrap_or((0, 1)), true)
            }
        }
    }

    pub fn reset(&mut self) {
        self.next = 0;
    }
}
