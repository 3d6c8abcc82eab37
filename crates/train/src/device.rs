//! Compute capability: device, transfer, precision.
//!
//! Resolved once at startup and threaded through constructors; nothing in
//! the loop reads device or precision from ambient state.

use candle_core::{DType, Device, Result, Tensor};

/// The accelerator/CPU capability handle.
///
/// Carries the active device and the reduced-precision dtype the forward
/// pass runs under: BF16 on GPU-class devices, F32 on CPU. The loss is
/// always computed in F32.
#[derive(Debug, Clone)]
pub struct Compute {
    device: Device,
    autocast: DType,
}

impl Compute {
    /// Resolve from detected hardware: CUDA if available, else CPU.
    pub fn detect() -> Result<Self> {
        Ok(Self::from_device(Device::cuda_if_available(0)?))
    }

    pub fn from_device(device: Device) -> Self {
        let autocast = if matches!(device, Device::Cpu) {
            DType::F32
        } else {
            DType::BF16
        };
        Self { device, autocast }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Dtype for the reduced-precision forward pass.
    pub fn autocast_dtype(&self) -> DType {
        self.autocast
    }

    pub fn is_accelerator(&self) -> bool {
        !matches!(self.device, Device::Cpu)
    }

    /// Name of the kernel-dispatch path the device resolves to.
    pub fn execution_path(&self) -> &'static str {
        match self.device {
            Device::Cpu => "cpu",
            Device::Cuda(_) => "cuda",
            Device::Metal(_) => "metal",
        }
    }

    /// Move a tensor onto the active device.
    pub fn transfer(&self, tensor: &Tensor) -> Result<Tensor> {
        tensor.to_device(&self.device)
    }

    /// Block until queued device work has finished. No-op on CPU; required
    /// on accelerators before reading a wall clock.
    pub fn synchronize(&self) -> Result<()> {
        if self.is_accelerator() {
            self.device.synchronize()?;
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
