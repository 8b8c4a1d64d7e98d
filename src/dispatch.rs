// dispatch.rs — kernel dispatcher.
//
// Launching a kernel takes three steps:
//
//   1. If a block shape is given, round the execution shape up to a whole
//      number of blocks (grid::round_up). Otherwise pass the shape through
//      and let the backend choose the workgroup size.
//   2. Narrow every integer scalar to 32 bits. Host code naturally carries
//      sizes as `usize` and counters as `i64`; GPU kernels take `i32`/`u32`.
//   3. Queue the invocation and hand back its event without waiting.
//
// Unknown entry points and argument lists that do not match the kernel
// signature are not checked here; the backend reports them.

use std::sync::Arc;

use log::trace;

use crate::backend::{ComputeBackend, DeviceArg, Event};
use crate::error::{Error, Result};
use crate::grid::{round_up, BlockShape};
use crate::registry::BufferId;

/// A kernel argument as written by the caller, before narrowing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelArg {
    Buffer(BufferId),
    /// 64-bit signed integer; narrowed to `i32`.
    I64(i64),
    /// Host-width unsigned integer; narrowed to `i32`.
    Usize(usize),
    I32(i32),
    U32(u32),
    F32(f32),
}

impl From<BufferId> for KernelArg {
    fn from(id: BufferId) -> Self {
        KernelArg::Buffer(id)
    }
}

impl From<i64> for KernelArg {
    fn from(v: i64) -> Self {
        KernelArg::I64(v)
    }
}

impl From<usize> for KernelArg {
    fn from(v: usize) -> Self {
        KernelArg::Usize(v)
    }
}

impl From<i32> for KernelArg {
    fn from(v: i32) -> Self {
        KernelArg::I32(v)
    }
}

impl From<u32> for KernelArg {
    fn from(v: u32) -> Self {
        KernelArg::U32(v)
    }
}

impl From<f32> for KernelArg {
    fn from(v: f32) -> Self {
        KernelArg::F32(v)
    }
}

/// Narrow wide integer scalars to `i32`. Buffers and 32-bit scalars pass
/// through unchanged. A value that does not fit is rejected rather than
/// silently wrapped.
pub fn narrow_args(args: &[KernelArg]) -> Result<Vec<DeviceArg>> {
    args.iter()
        .enumerate()
        .map(|(index, arg)| {
            Ok(match *arg {
                KernelArg::Buffer(id) => DeviceArg::Buffer(id),
                KernelArg::I64(v) => DeviceArg::I32(
                    i32::try_from(v)
                        .map_err(|_| Error::ScalarOverflow { index, value: v as i128 })?,
                ),
                KernelArg::Usize(v) => DeviceArg::I32(
                    i32::try_from(v)
                        .map_err(|_| Error::ScalarOverflow { index, value: v as i128 })?,
                ),
                KernelArg::I32(v) => DeviceArg::I32(v),
                KernelArg::U32(v) => DeviceArg::U32(v),
                KernelArg::F32(v) => DeviceArg::F32(v),
            })
        })
        .collect()
}

/// Invokes entry points of compiled programs on one backend.
pub struct Dispatcher<B: ComputeBackend> {
    backend: Arc<B>,
}

impl<B: ComputeBackend> Clone for Dispatcher<B> {
    fn clone(&self) -> Self {
        Dispatcher { backend: Arc::clone(&self.backend) }
    }
}

impl<B: ComputeBackend> Dispatcher<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Dispatcher { backend }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Queue `entry` over `shape` work-items.
    ///
    /// Returns as soon as the work is queued; call
    /// [`ComputeBackend::wait`] on the event to block for completion.
    pub fn dispatch(
        &self,
        program: &B::Program,
        entry: &str,
        shape: &[usize],
        block: Option<&BlockShape>,
        args: &[KernelArg],
    ) -> Result<Event> {
        let device_args = narrow_args(args)?;
        match block {
            Some(block) => {
                let dims = block.per_axis(shape.len())?;
                let grid = round_up(shape, block)?;
                trace!("dispatch {entry}: grid {grid:?}, block {dims:?}");
                self.backend.dispatch(program, entry, &grid, Some(&dims), &device_args)
            }
            None => {
                trace!("dispatch {entry}: grid {shape:?}, backend block");
                self.backend.dispatch(program, entry, shape, None, &device_args)
            }
        }
    }
}
