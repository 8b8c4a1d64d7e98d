// gpu/mod.rs — wgpu compute backend.
//
// `device` opens an adapter and a queue; `backend` implements
// `ComputeBackend` on top of them. Everything above the trait (memory
// manager, dispatcher, pipeline) runs unchanged on `host::HostBackend`,
// which is the reference every GPU result is checked against.

pub mod backend;
pub mod device;

pub use backend::{WgpuBackend, WgpuProgram};
pub use device::{AdapterInfo, DeviceProfile, GpuDevice, GpuError, GpuOptions, WorkgroupSize};
