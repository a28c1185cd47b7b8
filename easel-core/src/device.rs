use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::Device;
use tracing::info;

use crate::engine::EngineOptions;

/// Caller preference for where inference runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DevicePreference {
    ForceCpu,
    Accelerator(usize),
}

impl Default for DevicePreference {
    fn default() -> Self {
        Self::Accelerator(0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    Gpu,
    Cpu,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Gpu => "gpu",
            DeviceKind::Cpu => "cpu",
        }
    }

    pub fn is_cpu(&self) -> bool {
        matches!(self, DeviceKind::Cpu)
    }
}

/// Resolved inference device plus the memory posture everything downstream
/// keys off: residency capacity and per-engine optimization options are both
/// fixed from this profile at construction time.
#[derive(Clone, Debug)]
pub struct DeviceProfile {
    pub device: Device,
    pub kind: DeviceKind,
    /// Treat the accelerator as memory-constrained (6GB-class cards).
    pub low_vram: bool,
    /// Accelerator memory in bytes, when the backend exposes it.
    pub available_memory_bytes: Option<usize>,
}

impl DeviceProfile {
    /// Pick the best available device for the preference, falling back to CPU
    /// when no accelerator backend is compiled in.
    pub fn detect(preference: DevicePreference, low_vram: bool) -> Result<Self> {
        let (device, kind) = match preference {
            DevicePreference::ForceCpu => (Device::Cpu, DeviceKind::Cpu),
            DevicePreference::Accelerator(ordinal) if cuda_is_available() => {
                (Device::new_cuda(ordinal)?, DeviceKind::Gpu)
            }
            DevicePreference::Accelerator(ordinal) if metal_is_available() => {
                (Device::new_metal(ordinal)?, DeviceKind::Gpu)
            }
            DevicePreference::Accelerator(_) => {
                info!("no accelerator backend available, running on CPU");
                (Device::Cpu, DeviceKind::Cpu)
            }
        };
        info!(device = kind.as_str(), low_vram, "selected inference device");
        Ok(Self {
            device,
            kind,
            low_vram,
            available_memory_bytes: None,
        })
    }

    pub fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            kind: DeviceKind::Cpu,
            low_vram: false,
            available_memory_bytes: None,
        }
    }

    /// How many engines may stay resident at once: one on CPU or constrained
    /// GPUs, two where memory allows.
    pub fn residency_capacity(&self) -> usize {
        if self.kind.is_cpu() || self.low_vram {
            1
        } else {
            2
        }
    }

    /// Optimization flags applied once per engine at construction; they are
    /// permanent for the engine's lifetime.
    pub fn engine_options(&self) -> EngineOptions {
        match self.kind {
            DeviceKind::Cpu => EngineOptions {
                sliced_attention: false,
                half_precision: false,
                offload_text_encoder: false,
            },
            DeviceKind::Gpu => EngineOptions {
                sliced_attention: self.low_vram,
                half_precision: true,
                offload_text_encoder: self.low_vram,
            },
        }
    }
}
