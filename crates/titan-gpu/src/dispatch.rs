//! Workgroup grid sizing.

use std::fmt;

/// WebGPU baseline for `maxComputeWorkgroupsPerDimension`.
pub const MAX_WORKGROUPS_PER_DIMENSION: u32 = 65_535;

/// Workgroup shape and the grid of workgroups covering a problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Workgroup size declared in the shader (x, y, z).
    pub workgroup_size: [u32; 3],
    /// Number of workgroups to dispatch (x, y, z).
    pub dispatch_size: [u32; 3],
}

impl DispatchConfig {
    /// Smallest grid of `workgroup_size` groups covering `extents` invocations.
    pub fn cover(workgroup_size: [u32; 3], extents: [u32; 3]) -> Self {
        let dispatch_size = [0, 1, 2].map(|i| compute_dispatch_size(extents[i], workgroup_size[i]));
        Self { workgroup_size, dispatch_size }
    }

    pub fn total_threads(&self) -> u64 {
        let wg: u64 = self.workgroup_size.iter().map(|&v| u64::from(v)).product();
        let ds: u64 = self.dispatch_size.iter().map(|&v| u64::from(v)).product();
        wg * ds
    }

    /// Whether every grid dimension is within the per-dimension limit.
    pub fn within_limits(&self) -> bool {
        self.dispatch_size.iter().all(|&d| d <= MAX_WORKGROUPS_PER_DIMENSION)
    }
}

impl fmt::Display for DispatchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [wx, wy, wz] = self.workgroup_size;
        let [dx, dy, dz] = self.dispatch_size;
        write!(f, "workgroup[{wx}×{wy}×{wz}] dispatch[{dx}×{dy}×{dz}]")
    }
}

/// Workgroups needed to cover `total_elements`, rounding up. A zero
/// workgroup size is treated as one.
pub fn compute_dispatch_size(total_elements: u32, workgroup_size: u32) -> u32 {
    total_elements.div_ceil(workgroup_size.max(1))
}
