//! Closed-form workgroup choices for kernels that are not searched.
//!
//! All of these are 1-D workgroups. Reductions that cannot use subgroup
//! operations fall back to a workgroup-shared scratch array of one `f32`
//! per invocation, so their size is also bounded by workgroup storage.

use super::KernelKind;
use crate::capabilities::DeviceCapabilities;
use std::collections::BTreeMap;

const F32_BYTES: u32 = 4;

fn size_or(input_sizes: &BTreeMap<String, u32>, key: &str, default: u32) -> u32 {
    input_sizes.get(key).copied().filter(|&v| v > 0).unwrap_or(default)
}

/// Largest power of two not above `value` (at least 1).
fn floor_pow2(value: u32) -> u32 {
    if value == 0 { 1 } else { 1 << (31 - value.leading_zeros()) }
}

/// Smallest power of two not below `value`, saturating.
fn ceil_pow2(value: u32) -> u32 {
    value.checked_next_power_of_two().unwrap_or(1 << 31)
}

/// Clamp a 1-D workgroup to the device, keeping it a power of two.
fn fit_1d(wanted: u32, caps: &DeviceCapabilities) -> u32 {
    let limits = &caps.limits;
    floor_pow2(wanted.min(limits.max_workgroup_size_x).min(limits.max_invocations_per_workgroup))
}

/// Like [`fit_1d`], also bounding the shared reduction scratch when
/// subgroups are unavailable.
fn fit_reduction(wanted: u32, caps: &DeviceCapabilities) -> u32 {
    let wg = fit_1d(wanted, caps);
    if caps.subgroups {
        wg
    } else {
        floor_pow2(wg.min(caps.limits.max_workgroup_storage_size / F32_BYTES))
    }
}

/// Workgroup size for `kind`. Matmul gets a square 2-D default; the tuner
/// normally searches it instead.
pub fn workgroup_for(
    kind: KernelKind,
    input_sizes: &BTreeMap<String, u32>,
    caps: &DeviceCapabilities,
) -> [u32; 3] {
    let x = match kind {
        // one workgroup per query row, threads across the head dimension
        KernelKind::Attention => {
            let head_dim = size_or(input_sizes, "head_dim", 64);
            fit_reduction(ceil_pow2(head_dim).clamp(32, 256), caps)
        }
        KernelKind::Softmax => {
            let cols = size_or(input_sizes, "cols", 1024);
            fit_reduction(ceil_pow2(cols).clamp(64, 256), caps)
        }
        KernelKind::RmsNorm => {
            let hidden = size_or(input_sizes, "hidden", 4096);
            let wanted = if hidden >= 2048 { 256 } else { ceil_pow2(hidden / 4).clamp(64, 256) };
            fit_reduction(wanted, caps)
        }
        // elementwise; small tensors get smaller groups for occupancy
        KernelKind::Dequant => {
            let n = size_or(input_sizes, "n", 1 << 20);
            fit_1d(if n < 16 * 1024 { 64 } else { 256 }, caps)
        }
        KernelKind::Matmul => {
            let side = floor_pow2(caps.limits.max_invocations_per_workgroup.min(256)).isqrt();
            return [fit_1d(side, caps), side.min(caps.limits.max_workgroup_size_y), 1];
        }
    };
    [x, 1, 1]
}
