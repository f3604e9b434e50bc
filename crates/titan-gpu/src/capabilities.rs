//! Capability record derived from a negotiated device.
//!
//! [`DeviceCapabilities`] is an immutable snapshot taken once per successful
//! device negotiation. It carries the optional-feature flags this layer knows
//! how to use, the numeric limits that bound buffer bucketing and dispatch
//! shapes, and an [`AdapterSignature`] used to namespace tuning results.

use std::fmt;

/// Identity of the physical adapter a device was negotiated from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterSignature {
    /// PCI vendor ID (0 when the platform does not report one).
    pub vendor: u32,
    /// PCI device ID (0 when the platform does not report one).
    pub device: u32,
    /// Human-readable adapter name.
    pub name: String,
    /// Backend API name (Vulkan, Metal, DX12, ...).
    pub backend: String,
}

impl AdapterSignature {
    /// Signature safe to use as a storage key: lowercase ASCII alphanumerics,
    /// everything else collapsed to `_`.
    pub fn sanitized(&self) -> String {
        let raw = format!("{:04x}_{:04x}_{}_{}", self.vendor, self.device, self.backend, self.name);
        sanitize_key(&raw)
    }
}

impl fmt::Display for AdapterSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {:04x}:{:04x})", self.name, self.backend, self.vendor, self.device)
    }
}

/// Lowercase and replace every non-alphanumeric run with a single `_`.
pub fn sanitize_key(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_underscore = false;
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_underscore = false;
        } else if !last_underscore {
            out.push('_');
            last_underscore = true;
        }
    }
    out.trim_matches('_').to_string()
}

/// Compute-relevant limits of a negotiated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Maximum size of a single buffer in bytes.
    pub max_buffer_size: u64,
    /// Maximum size of a storage buffer binding in bytes.
    pub max_storage_buffer_binding_size: u64,
    /// Maximum workgroup size in X.
    pub max_workgroup_size_x: u32,
    /// Maximum workgroup size in Y.
    pub max_workgroup_size_y: u32,
    /// Maximum workgroup size in Z.
    pub max_workgroup_size_z: u32,
    /// Maximum total invocations per workgroup.
    pub max_invocations_per_workgroup: u32,
    /// Maximum workgroup-local storage in bytes.
    pub max_workgroup_storage_size: u32,
}

impl Default for DeviceLimits {
    /// WebGPU baseline limits.
    fn default() -> Self {
        Self {
            max_buffer_size: 256 * 1024 * 1024,
            max_storage_buffer_binding_size: 128 * 1024 * 1024,
            max_workgroup_size_x: 256,
            max_workgroup_size_y: 256,
            max_workgroup_size_z: 64,
            max_invocations_per_workgroup: 256,
            max_workgroup_storage_size: 16 * 1024,
        }
    }
}

impl From<&wgpu::Limits> for DeviceLimits {
    fn from(limits: &wgpu::Limits) -> Self {
        Self {
            max_buffer_size: limits.max_buffer_size,
            max_storage_buffer_binding_size: u64::from(limits.max_storage_buffer_binding_size),
            max_workgroup_size_x: limits.max_compute_workgroup_size_x,
            max_workgroup_size_y: limits.max_compute_workgroup_size_y,
            max_workgroup_size_z: limits.max_compute_workgroup_size_z,
            max_invocations_per_workgroup: limits.max_compute_invocations_per_workgroup,
            max_workgroup_storage_size: limits.max_compute_workgroup_storage_size,
        }
    }
}

/// Immutable snapshot of optional features and limits.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct DeviceCapabilities {
    /// Reduced-precision (`f16`) shader arithmetic.
    pub shader_f16: bool,
    /// Subgroup (warp/wave) reduction operations.
    pub subgroups: bool,
    /// Subgroup operations on `f16` values (both features present).
    pub subgroups_f16: bool,
    /// Timestamp queries attached to compute passes.
    pub timestamp_query: bool,
    /// Timestamp writes directly on a command encoder.
    pub timestamp_query_inside_encoders: bool,
    /// Numeric limits.
    pub limits: DeviceLimits,
    /// Adapter identity.
    pub adapter: AdapterSignature,
}

impl DeviceCapabilities {
    /// Derive the record from the features and limits a device was granted.
    pub fn from_device(
        features: wgpu::Features,
        limits: &wgpu::Limits,
        adapter: AdapterSignature,
    ) -> Self {
        let shader_f16 = features.contains(wgpu::Features::SHADER_F16);
        let subgroups = features.contains(wgpu::Features::SUBGROUP);
        Self {
            shader_f16,
            subgroups,
            subgroups_f16: shader_f16 && subgroups,
            timestamp_query: features.contains(wgpu::Features::TIMESTAMP_QUERY),
            timestamp_query_inside_encoders: features
                .contains(wgpu::Features::TIMESTAMP_QUERY_INSIDE_ENCODERS),
            limits: DeviceLimits::from(limits),
            adapter,
        }
    }

    /// Mock capabilities for a mid-range discrete GPU.
    pub fn mock() -> Self {
        Self {
            shader_f16: true,
            subgroups: true,
            subgroups_f16: true,
            timestamp_query: true,
            timestamp_query_inside_encoders: true,
            limits: DeviceLimits {
                max_buffer_size: 2 * 1024 * 1024 * 1024,
                max_storage_buffer_binding_size: 1024 * 1024 * 1024,
                max_workgroup_size_x: 1024,
                max_workgroup_size_y: 1024,
                max_workgroup_size_z: 64,
                max_invocations_per_workgroup: 1024,
                max_workgroup_storage_size: 32 * 1024,
            },
            adapter: AdapterSignature {
                vendor: 0x10de,
                device: 0x2684,
                name: "Mock GPU Device".into(),
                backend: "Vulkan".into(),
            },
        }
    }
}

/// Optional features this layer knows how to use.
pub const KNOWN_FEATURES: [wgpu::Features; 4] = [
    wgpu::Features::SHADER_F16,
    wgpu::Features::SUBGROUP,
    wgpu::Features::TIMESTAMP_QUERY,
    wgpu::Features::TIMESTAMP_QUERY_INSIDE_ENCODERS,
];

/// Intersect the adapter's advertised features with [`KNOWN_FEATURES`].
///
/// Never returns a feature the adapter did not advertise.
pub fn select_features(advertised: wgpu::Features) -> wgpu::Features {
    KNOWN_FEATURES
        .iter()
        .filter(|f| advertised.contains(**f))
        .fold(wgpu::Features::empty(), |acc, f| acc | *f)
}
