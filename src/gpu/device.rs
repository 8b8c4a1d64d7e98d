// gpu/device.rs — wgpu adapter, device and queue bootstrap.
//
// Responsibilities:
//   - Enumerate adapters of the requested backends and pick one, preferring
//     real hardware over software rasterizers.
//   - Expose a `DeviceProfile` for simulating small-GPU limits on a
//     development machine.
//   - Provide `WorkgroupSize` — the default block shape used when a dispatch
//     leaves the choice to the backend, validated against the active profile.
//
// ADAPTER SELECTION:
// wgpu's `request_adapter` power-preference heuristic may pick llvmpipe on
// machines where the software renderer is enumerated next to a real GPU.
// We enumerate explicitly and take the first hardware adapter, falling back
// to whatever exists so headless CI can still run with a software device.
//
// DEVICE LIMITS:
// Under `Constrained` we request *lower* limits than the hardware supports.
// wgpu validates every dispatch against the requested limits, so a block
// shape that would be rejected by a small GPU is rejected here too.
//
// NEW RUST CONCEPTS:
// - `pollster::block_on` — runs an async fn to completion on the current
//   thread. wgpu's adapter/device API is async because on WebGPU it maps to
//   JS Promises; natively we just block.
// - `#[derive(thiserror::Error)]` — generates `Display` and `source()` from
//   the `#[error(...)]` attributes instead of hand-written impls.

use std::fmt;

use log::{debug, info};

/// Hardware profile controlling requested device limits and the default
/// workgroup size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceProfile {
    /// Request the adapter's own limits. No artificial caps.
    #[default]
    Native,
    /// Cap `max_compute_invocations_per_workgroup` at 256 and workgroup
    /// dimensions at 256×256×64, the envelope of small embedded GPUs.
    Constrained,
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceProfile::Native => write!(f, "Native"),
            DeviceProfile::Constrained => write!(f, "Constrained (simulated limits)"),
        }
    }
}

/// A 3-D workgroup shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkgroupSize {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl WorkgroupSize {
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        WorkgroupSize { x, y, z }
    }

    /// Total invocations per workgroup (x * y * z).
    pub fn total(&self) -> u32 {
        self.x * self.y * self.z
    }

    pub fn as_array(&self) -> [u32; 3] {
        [self.x, self.y, self.z]
    }

    /// Default workgroup size for a profile.
    ///
    /// - `Native`: 16×8×1 = 128 invocations, four 32-wide warps or two
    ///   64-wide wavefronts, with a 16-wide x for row-major cache lines.
    /// - `Constrained`: 8×8×1 = 64, well inside the 256 cap.
    pub fn for_profile(profile: DeviceProfile) -> Self {
        match profile {
            DeviceProfile::Native => WorkgroupSize::new(16, 8, 1),
            DeviceProfile::Constrained => WorkgroupSize::new(8, 8, 1),
        }
    }

    /// Workgroup shape for a per-axis block of rank 1 to 3. Missing axes
    /// are 1. `None` if the rank is wrong or an extent does not fit `u32`.
    pub fn from_block(block: &[usize]) -> Option<Self> {
        if block.is_empty() || block.len() > 3 {
            return None;
        }
        let mut dims = [1u32; 3];
        for (d, &b) in dims.iter_mut().zip(block) {
            *d = u32::try_from(b).ok()?;
        }
        Some(WorkgroupSize::new(dims[0], dims[1], dims[2]))
    }
}

impl fmt::Display for WorkgroupSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{}×{} ({} invocations)", self.x, self.y, self.z, self.total())
    }
}

/// Device bootstrap options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuOptions {
    /// Backends to enumerate adapters from.
    pub backends: wgpu::Backends,
    pub profile: DeviceProfile,
    /// Stamp completion times on events (see `backend::Event::duration`).
    pub profiling: bool,
}

impl Default for GpuOptions {
    fn default() -> Self {
        GpuOptions {
            backends: wgpu::Backends::PRIMARY,
            profile: DeviceProfile::Native,
            profiling: false,
        }
    }
}

/// Cached adapter information for logging.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor: u32,
    pub device: u32,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?})", self.name, self.backend, self.device_type)
    }
}

/// Adapter, device and queue, plus the active profile.
///
/// # Field drop order
/// Rust drops struct fields in declaration order (top → bottom).
/// `_instance` is declared last so the `wgpu::Instance` outlives `device`
/// and `queue`; some Vulkan layers crash when the instance is destroyed
/// while device-level objects still reference it.
pub struct GpuDevice {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub profile: DeviceProfile,
    pub adapter_info: AdapterInfo,
    pub workgroup_size: WorkgroupSize,
    pub limits: wgpu::Limits,
    _instance: wgpu::Instance,
}

impl GpuDevice {
    /// Open the first hardware adapter of the primary backends with
    /// `DeviceProfile::Native` limits.
    pub fn new() -> Result<Self, GpuError> {
        Self::with_options(GpuOptions::default())
    }

    pub fn with_options(options: GpuOptions) -> Result<Self, GpuError> {
        pollster::block_on(Self::init_async(options))
    }

    async fn init_async(options: GpuOptions) -> Result<Self, GpuError> {
        let flags = if cfg!(debug_assertions) {
            wgpu::InstanceFlags::VALIDATION
        } else {
            wgpu::InstanceFlags::empty()
        };
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: options.backends,
            flags,
            ..Default::default()
        });

        // Tiered selection:
        //   1. DiscreteGpu, IntegratedGpu, VirtualGpu, Other (real hardware,
        //      pass-through, translation layers).
        //   2. Anything else, i.e. a Cpu software rasterizer.
        let adapters = instance.enumerate_adapters(options.backends);
        for a in &adapters {
            let info = a.get_info();
            debug!("adapter: {} ({:?}, {:?})", info.name, info.backend, info.device_type);
        }
        let hardware = adapters.iter().position(|a| {
            !matches!(a.get_info().device_type, wgpu::DeviceType::Cpu)
        });
        let adapter = match hardware {
            Some(i) => adapters.into_iter().nth(i),
            None => adapters.into_iter().next(),
        }
        .ok_or(GpuError::NoSuitableAdapter)?;

        let raw_info = adapter.get_info();
        let adapter_info = AdapterInfo {
            name: raw_info.name.clone(),
            vendor: raw_info.vendor,
            device: raw_info.device,
            device_type: raw_info.device_type,
            backend: raw_info.backend,
        };

        let limits = limits_for_profile(options.profile, adapter.limits());

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("sepconv"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits.clone(),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await
            .map_err(GpuError::DeviceRequest)?;

        let workgroup_size = WorkgroupSize::for_profile(options.profile);
        info!("gpu: {adapter_info}, profile {}, workgroup {workgroup_size}", options.profile);

        Ok(GpuDevice {
            device,
            queue,
            profile: options.profile,
            adapter_info,
            workgroup_size,
            limits,
            _instance: instance,
        })
    }

    /// Check a workgroup shape against the requested device limits.
    pub fn validate_workgroup_size(&self, wg: WorkgroupSize) -> Result<(), GpuError> {
        check_workgroup(&self.limits, wg)
    }

    /// Replace the default workgroup size after validating it.
    pub fn set_workgroup_size(&mut self, wg: WorkgroupSize) -> Result<(), GpuError> {
        self.validate_workgroup_size(wg)?;
        self.workgroup_size = wg;
        Ok(())
    }
}

impl fmt::Display for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GpuDevice {{ adapter: {}, profile: {}, workgroup: {} }}",
            self.adapter_info, self.profile, self.workgroup_size
        )
    }
}

// ============================================================
// Limits helpers
// ============================================================

/// Limits to request for `profile` on an adapter reporting `adapter`.
pub fn limits_for_profile(profile: DeviceProfile, adapter: wgpu::Limits) -> wgpu::Limits {
    match profile {
        DeviceProfile::Native => adapter,
        DeviceProfile::Constrained => wgpu::Limits {
            max_compute_invocations_per_workgroup: 256,
            max_compute_workgroup_size_x: 256,
            max_compute_workgroup_size_y: 256,
            max_compute_workgroup_size_z: 64,
            // 128 MiB per storage binding: three volume buffers of 32 MiB
            // each still fit.
            max_storage_buffer_binding_size: 128 << 20,
            ..wgpu::Limits::default()
        },
    }
}

fn check_workgroup(limits: &wgpu::Limits, wg: WorkgroupSize) -> Result<(), GpuError> {
    let per_axis = [
        limits.max_compute_workgroup_size_x,
        limits.max_compute_workgroup_size_y,
        limits.max_compute_workgroup_size_z,
    ];
    let axis_ok = wg.as_array().iter().zip(per_axis).all(|(&d, max)| d >= 1 && d <= max);
    let total = wg.x.saturating_mul(wg.y).saturating_mul(wg.z);
    let max = limits.max_compute_invocations_per_workgroup;
    if !axis_ok || total > max {
        return Err(GpuError::WorkgroupTooLarge { size: wg, max });
    }
    Ok(())
}

// ============================================================
// Error type
// ============================================================

/// Errors from device bootstrap and configuration.
#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    #[error("no suitable GPU adapter found for the requested backends")]
    NoSuitableAdapter,

    #[error("device request failed: {0}")]
    DeviceRequest(#[source] wgpu::RequestDeviceError),

    #[error("workgroup {size} exceeds the device limit of {max} invocations or its per-axis limits")]
    WorkgroupTooLarge { size: WorkgroupSize, max: u32 },
}

// ============================================================
// Tests
// ============================================================
