// pipeline.rs — separable N-D Gaussian filter on a compute backend.
//
// The pipeline is built once for a fixed 2-D or 3-D shape and then reused
// for any number of `filter` calls. It owns three device buffers of that
// shape and ping-pongs between two of them, so an N-D filter needs three
// buffers whatever N is:
//
//   pass         entry point               src      →  dst
//   ───────────────────────────────────────────────────────────
//   horizontal   horizontal_convolution    input    →  output
//   vertical     vertical_convolution      output   →  scratch
//   depth (3-D)  depth_convolution         scratch  →  output
//
// The last pass's destination holds the result: `scratch` for 2-D,
// `output` for 3-D.
//
// SHAPES
// ──────
// Shapes are given in natural row-major order, `[height, width]` or
// `[depth, height, width]`, matching ndarray. The kernels index the volume
// fastest axis first, so the execution shape is the reverse:
// `[width, height]` or `[width, height, depth]`. Work-item (x, y, z) is
// pixel (col, row, slice).
//
// STATE
// ─────
//   Ready      constructed, or the last filter call failed part-way
//   Fetchable  the last filter call succeeded; fetch_result() is legal
//
// A rejected filter call (wrong shape, bad sigma) leaves the state alone:
// nothing was submitted, so an earlier result is still fetchable.

use std::sync::Arc;

use log::{debug, info, warn};
use ndarray::{Array1, ArrayD};

use crate::array::{DType, DeviceArray, HostArray};
use crate::backend::{AccessMode, ComputeBackend, Event};
use crate::convolution::{extent_of, gaussian_kernel_1d, Axis, Extent, DEFAULT_TRUNCATE};
use crate::dispatch::{Dispatcher, KernelArg};
use crate::error::{Error, Result};
use crate::grid::{round_up, BlockShape};
use crate::memory::MemoryManager;
use crate::registry::BufferId;

/// The built-in WGSL program with the three convolution entry points.
pub const CONVOLUTION_PROGRAM: &str = include_str!("shaders/convolution.wgsl");

/// Tunables for [`SeparableConvolution`].
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Kernel truncation radius, in standard deviations.
    pub truncate: f64,
    /// Block shape in execution order (fastest axis first). `None` picks
    /// 4×4 for 2-D and 4×4×4 for 3-D, small enough for any device.
    pub block: Option<BlockShape>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig { truncate: DEFAULT_TRUNCATE, block: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Ready,
    Fetchable,
}

/// A separable Gaussian filter for one fixed image or volume shape.
pub struct SeparableConvolution<B: ComputeBackend> {
    memory: MemoryManager<B>,
    dispatcher: Dispatcher<B>,
    program: B::Program,
    shape: Vec<usize>,
    extent: Extent,
    block: BlockShape,
    grid: Vec<usize>,
    input: BufferId,
    output: BufferId,
    scratch: BufferId,
    truncate: f64,
    state: PipelineState,
}

impl<B: ComputeBackend> SeparableConvolution<B> {
    /// Build a pipeline for `shape` running [`CONVOLUTION_PROGRAM`].
    pub fn new(backend: Arc<B>, shape: &[usize]) -> Result<Self> {
        Self::with_program(backend, shape, CONVOLUTION_PROGRAM)
    }

    /// Build a pipeline running `source`, which must expose the three
    /// convolution entry points with the built-in program's arguments.
    pub fn with_program(backend: Arc<B>, shape: &[usize], source: &str) -> Result<Self> {
        Self::with_config(MemoryManager::new(backend), shape, source, PipelineConfig::default())
    }

    /// Build a pipeline that allocates through an existing memory manager.
    pub fn with_config(
        memory: MemoryManager<B>,
        shape: &[usize],
        source: &str,
        config: PipelineConfig,
    ) -> Result<Self> {
        let extent = extent_of(shape)?;
        let rank = shape.len();
        let exec_shape = extent[..rank].to_vec();
        let block = config
            .block
            .unwrap_or_else(|| BlockShape::PerAxis(vec![4; rank]));
        let grid = round_up(&exec_shape, &block)?;
        if !config.truncate.is_finite() || config.truncate < 0.0 {
            return Err(Error::InvalidSigma(config.truncate));
        }

        let backend = Arc::clone(memory.backend());
        let program = backend.compile(source)?;

        let input = memory.allocate(shape, DType::F32, AccessMode::ReadOnly)?;
        let output = match memory.allocate(shape, DType::F32, AccessMode::WriteOnly) {
            Ok(id) => id,
            Err(e) => {
                release_quietly(&memory, &[input]);
                return Err(e);
            }
        };
        let scratch = match memory.allocate(shape, DType::F32, AccessMode::ReadWrite) {
            Ok(id) => id,
            Err(e) => {
                release_quietly(&memory, &[input, output]);
                return Err(e);
            }
        };

        info!(
            "separable convolution on {}: shape {shape:?}, grid {grid:?}, block {block:?}",
            backend.name()
        );

        Ok(SeparableConvolution {
            dispatcher: Dispatcher::new(backend),
            memory,
            program,
            shape: shape.to_vec(),
            extent,
            block,
            grid,
            input,
            output,
            scratch,
            truncate: config.truncate,
            state: PipelineState::Ready,
        })
    }

    /// Filter `image` with a Gaussian of standard deviation `sigma`.
    ///
    /// `image` must have exactly the pipeline's shape; any element type is
    /// accepted and converted to `f32` by value. Returns one event per pass,
    /// in pass order. The passes are queued, not awaited: the result is
    /// ready once the last event completes, and [`fetch_result`] waits for
    /// it implicitly.
    ///
    /// [`fetch_result`]: Self::fetch_result
    pub fn filter(&mut self, image: &HostArray, sigma: f64) -> Result<Vec<Event>> {
        if image.shape() != self.shape.as_slice() {
            return Err(Error::ShapeMismatch {
                expected: self.shape.clone(),
                actual: image.shape().to_vec(),
            });
        }
        let weights = gaussian_kernel_1d(sigma, self.truncate)?;

        self.state = PipelineState::Ready;
        let pixels = HostArray::F32(image.to_f32());
        self.memory.to_device(&pixels, Some(self.input), AccessMode::ReadOnly)?;

        let ksize = weights.len();
        let kernel = self
            .memory
            .to_device(&HostArray::from(Array1::from(weights)), None, AccessMode::ReadOnly)?;
        let passes = self.run_passes(kernel, ksize);
        let released = self.memory.release(kernel);
        let events = passes?;
        released?;

        debug!("filter sigma={sigma}: {} passes, kernel of {ksize} taps", events.len());
        self.state = PipelineState::Fetchable;
        Ok(events)
    }

    fn run_passes(&self, kernel: BufferId, ksize: usize) -> Result<Vec<Event>> {
        let [w, h, d] = self.extent;
        self.pass_buffers()
            .into_iter()
            .map(|(axis, src, dst)| {
                let args = [
                    KernelArg::from(src),
                    KernelArg::from(dst),
                    KernelArg::from(kernel),
                    KernelArg::from(ksize),
                    KernelArg::from(w),
                    KernelArg::from(h),
                    KernelArg::from(d),
                ];
                self.dispatcher.dispatch(
                    &self.program,
                    axis.entry_point(),
                    &self.grid,
                    Some(&self.block),
                    &args,
                )
            })
            .collect()
    }

    /// `(axis, src, dst)` for every pass, in order.
    fn pass_buffers(&self) -> Vec<(Axis, BufferId, BufferId)> {
        let mut src = self.input;
        let mut dst = self.output;
        Axis::passes(self.shape.len())
            .iter()
            .map(|&axis| {
                let pass = (axis, src, dst);
                src = dst;
                dst = if dst == self.output { self.scratch } else { self.output };
                pass
            })
            .collect()
    }

    /// Copy the result of the last successful [`filter`](Self::filter) call
    /// to the host.
    pub fn fetch_result(&self) -> Result<ArrayD<f32>> {
        self.fetch_result_with_event().map(|(array, _)| array)
    }

    /// [`fetch_result`](Self::fetch_result), also returning the transfer event.
    pub fn fetch_result_with_event(&self) -> Result<(ArrayD<f32>, Event)> {
        if self.state != PipelineState::Fetchable {
            return Err(Error::NotFiltered);
        }
        let mut dest = DeviceArray::zeros(&self.shape, DType::F32);
        let event = self.memory.fetch_into(self.result_buffer(), &mut dest)?;
        let array = dest.into_f32_array().ok_or_else(|| {
            Error::Transfer(format!("result {} did not read back as f32", self.result_buffer()))
        })?;
        Ok((array, event))
    }

    /// The buffer the last pass writes.
    pub fn result_buffer(&self) -> BufferId {
        match self.pass_buffers().last() {
            Some(&(_, _, dst)) => dst,
            None => self.input,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Declared shape, natural row-major order.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// `[width, height, depth]`; depth is 1 for 2-D.
    pub fn extent(&self) -> Extent {
        self.extent
    }

    /// Rounded execution grid, fastest axis first.
    pub fn grid(&self) -> &[usize] {
        &self.grid
    }

    pub fn block(&self) -> &BlockShape {
        &self.block
    }

    pub fn truncate(&self) -> f64 {
        self.truncate
    }

    /// `(input, output, scratch)`.
    pub fn buffers(&self) -> (BufferId, BufferId, BufferId) {
        (self.input, self.output, self.scratch)
    }

    pub fn memory(&self) -> &MemoryManager<B> {
        &self.memory
    }
}

impl<B: ComputeBackend> Drop for SeparableConvolution<B> {
    fn drop(&mut self) {
        release_quietly(&self.memory, &[self.input, self.output, self.scratch]);
    }
}

fn release_quietly<B: ComputeBackend>(memory: &MemoryManager<B>, ids: &[BufferId]) {
    for &id in ids {
        if let Err(e) = memory.release(id) {
            warn!("{e}");
        }
    }
}
