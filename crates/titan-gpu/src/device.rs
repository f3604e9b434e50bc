//! Device negotiation and the process-lifetime device slot.

use crate::backend::{GpuBackend, WgpuBackend};
use crate::capabilities::{AdapterSignature, DeviceCapabilities, select_features};
use crate::error::{GpuError, Result};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

/// Adapter power preferences tried in order.
pub const POWER_PREFERENCE_CHAIN: [wgpu::PowerPreference; 3] = [
    wgpu::PowerPreference::HighPerformance,
    wgpu::PowerPreference::LowPower,
    wgpu::PowerPreference::None,
];

type Slot<B> = Arc<Mutex<Option<Arc<B>>>>;

/// Owns the negotiated device until it is lost or invalidated.
///
/// Clones share the same slot.
pub struct DeviceManager<B: GpuBackend = WgpuBackend> {
    slot: Slot<B>,
}

impl<B: GpuBackend> Clone for DeviceManager<B> {
    fn clone(&self) -> Self {
        Self { slot: Arc::clone(&self.slot) }
    }
}

impl<B: GpuBackend> Default for DeviceManager<B> {
    fn default() -> Self {
        Self { slot: Arc::new(Mutex::new(None)) }
    }
}

fn lock<B>(slot: &Mutex<Option<Arc<B>>>) -> MutexGuard<'_, Option<Arc<B>>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<B: GpuBackend> DeviceManager<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache an already-negotiated backend, replacing any previous one.
    pub fn install(&self, backend: B) -> Arc<B> {
        let backend = Arc::new(backend);
        let previous = lock(&self.slot).replace(Arc::clone(&backend));
        drop(previous);
        backend
    }

    /// The cached backend.
    ///
    /// Returns [`GpuError::NotInitialized`] when nothing was negotiated or
    /// the device has since been lost.
    pub fn device(&self) -> Result<Arc<B>> {
        let cached = lock(&self.slot).clone();
        match cached {
            Some(backend) if backend.is_lost() => {
                self.clear_if(&backend);
                Err(GpuError::NotInitialized)
            }
            Some(backend) => Ok(backend),
            None => Err(GpuError::NotInitialized),
        }
    }

    fn clear_if(&self, stale: &Arc<B>) {
        let mut slot = lock(&self.slot);
        let previous = if slot.as_ref().is_some_and(|b| Arc::ptr_eq(b, stale)) {
            slot.take()
        } else {
            None
        };
        drop(slot);
        drop(previous);
    }

    pub fn capabilities(&self) -> Result<DeviceCapabilities> {
        self.device().map(|backend| backend.capabilities().clone())
    }

    pub fn is_initialized(&self) -> bool {
        self.device().is_ok()
    }

    /// Mark the cached device lost and drop it, as the loss handler does.
    pub fn invalidate(&self) {
        let taken = lock(&self.slot).take();
        if let Some(backend) = taken {
            backend.mark_lost();
            warn!("GPU device invalidated");
        }
    }
}

impl DeviceManager<WgpuBackend> {
    /// Negotiate a device, or return the cached one.
    pub async fn init_device(&self) -> Result<Arc<WgpuBackend>> {
        if let Ok(backend) = self.device() {
            return Ok(backend);
        }

        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapter = request_adapter(&instance).await?;

        let info = adapter.get_info();
        let signature = AdapterSignature {
            vendor: info.vendor,
            device: info.device,
            name: info.name.clone(),
            backend: format!("{:?}", info.backend),
        };
        let features = select_features(adapter.features());
        info!(
            backend = ?info.backend,
            device = %info.name,
            ?features,
            "selected GPU adapter"
        );

        let preferred = wgpu::DeviceDescriptor {
            label: Some("titan-gpu"),
            required_features: features,
            required_limits: adapter.limits(),
            ..Default::default()
        };
        let (device, queue) = match adapter.request_device(&preferred, None).await {
            Ok(pair) => pair,
            Err(first) => {
                warn!(error = %first, "device request with adapter limits failed, retrying with defaults");
                let baseline = wgpu::DeviceDescriptor {
                    label: Some("titan-gpu"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    ..Default::default()
                };
                adapter
                    .request_device(&baseline, None)
                    .await
                    .map_err(|e| GpuError::DeviceRequest(format!("{first}; fallback: {e}")))?
            }
        };

        let capabilities =
            DeviceCapabilities::from_device(device.features(), &device.limits(), signature);
        info!(
            shader_f16 = capabilities.shader_f16,
            subgroups = capabilities.subgroups,
            timestamp_query = capabilities.timestamp_query,
            max_buffer_size = capabilities.limits.max_buffer_size,
            "GPU device ready"
        );

        let backend = WgpuBackend::new(instance, adapter, device, queue, capabilities);
        let lost = backend.lost_flag();
        let weak_slot = Arc::downgrade(&self.slot);
        backend.device.set_device_lost_callback(move |reason, message| {
            lost.store(true, std::sync::atomic::Ordering::Release);
            match reason {
                wgpu::DeviceLostReason::Destroyed => debug!(%message, "GPU device destroyed"),
                _ => error!(?reason, %message, "GPU device lost"),
            }
            if let Some(slot) = weak_slot.upgrade() {
                let mut guard = lock(&slot);
                let ours = guard.as_ref().is_some_and(|b| Arc::ptr_eq(&b.lost_flag(), &lost));
                let previous = if ours { guard.take() } else { None };
                drop(guard);
                drop(previous);
            }
        });

        let mut slot = lock(&self.slot);
        if let Some(existing) = slot.as_ref().filter(|b| !b.is_lost()) {
            return Ok(Arc::clone(existing));
        }
        let backend = Arc::new(backend);
        let previous = slot.replace(Arc::clone(&backend));
        drop(slot);
        drop(previous);
        Ok(backend)
    }

    /// Blocking wrapper around [`init_device`](Self::init_device).
    pub fn init_device_blocking(&self) -> Result<Arc<WgpuBackend>> {
        pollster::block_on(self.init_device())
    }
}

async fn request_adapter(instance: &wgpu::Instance) -> Result<wgpu::Adapter> {
    for power_preference in POWER_PREFERENCE_CHAIN {
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await;
        match adapter {
            Some(adapter) => return Ok(adapter),
            None => warn!(?power_preference, "no adapter for power preference"),
        }
    }
    Err(GpuError::NoAdapter)
}
