// sepconv: GPU compute-buffer management and separable N-D convolution
//
// Layers, leaves first:
//
//   array      host arrays → contiguous 32-bit device arrays
//   registry   buffer handle → declared shape and element type
//   grid       execution shape rounding to whole blocks
//   backend    the compute-device trait (host and wgpu implementations)
//   memory     allocate / transfer / fetch / release, kept in step with the registry
//   dispatch   kernel launches with 32-bit scalar narrowing
//   pipeline   multi-pass separable Gaussian filter over three reused buffers
//
// `convolution` holds the Gaussian kernel and the CPU reference filter,
// `host` a CPU backend, `gpu` the wgpu backend.

pub mod array;
pub mod backend;
pub mod convolution;
pub mod dispatch;
pub mod error;
pub mod gpu;
pub mod grid;
pub mod host;
pub mod memory;
pub mod pipeline;
pub mod registry;

pub use array::{normalize, DType, DeviceArray, ElementType, HostArray};
pub use backend::{AccessMode, ComputeBackend, DeviceArg, Event};
pub use dispatch::{Dispatcher, KernelArg};
pub use error::{Error, ErrorKind, Result};
pub use grid::{round_up, BlockShape};
pub use host::HostBackend;
pub use memory::MemoryManager;
pub use pipeline::{PipelineConfig, PipelineState, SeparableConvolution, CONVOLUTION_PROGRAM};
pub use registry::{BufferId, BufferInfo, BufferRegistry};
